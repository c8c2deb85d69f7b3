//! Per-channel request sequencing.

use core::sync::atomic::{AtomicU32, Ordering};

use amdvgpu_proto::SeqNo;

use crate::error::{ChannelError, Result};

/// Hands out strictly increasing sequence numbers starting at 1.
///
/// The counter never wraps: once `u32::MAX` has been issued every further call fails with
/// [`ChannelError::SequenceExhausted`].
#[derive(Debug)]
pub struct Sequencer {
    next: AtomicU32,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> Result<SeqNo> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                // 0 marks exhaustion: u32::MAX has already been handed out.
                (cur != 0).then(|| cur.wrapping_add(1))
            })
            .map(SeqNo)
            .map_err(|_| ChannelError::SequenceExhausted)
    }

    /// The most recently issued number, if any.
    pub fn last_issued(&self) -> Option<SeqNo> {
        match self.next.load(Ordering::Acquire) {
            1 => None,
            0 => Some(SeqNo(u32::MAX)),
            n => Some(SeqNo(n - 1)),
        }
    }

    #[cfg(test)]
    fn starting_at(next: u32) -> Self {
        Self {
            next: AtomicU32::new(next),
        }
    }
}

/// Whether a request stamped `seqno` has completed given the host's last processed sequence.
pub const fn is_processed(seqno: SeqNo, last_processed: SeqNo) -> bool {
    last_processed.0 >= seqno.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let seq = Sequencer::new();
        assert_eq!(seq.last_issued(), None);
        assert_eq!(seq.next().unwrap(), SeqNo(1));
        assert_eq!(seq.next().unwrap(), SeqNo(2));
        assert_eq!(seq.last_issued(), Some(SeqNo(2)));
    }

    #[test]
    fn refuses_after_u32_max() {
        let seq = Sequencer::starting_at(u32::MAX - 1);
        assert_eq!(seq.next().unwrap(), SeqNo(u32::MAX - 1));
        assert_eq!(seq.next().unwrap(), SeqNo(u32::MAX));
        assert!(matches!(seq.next(), Err(ChannelError::SequenceExhausted)));
        assert!(matches!(seq.next(), Err(ChannelError::SequenceExhausted)));
        assert_eq!(seq.last_issued(), Some(SeqNo(u32::MAX)));
    }

    #[test]
    fn completion_test() {
        assert!(!is_processed(SeqNo(5), SeqNo(4)));
        assert!(is_processed(SeqNo(5), SeqNo(5)));
        assert!(is_processed(SeqNo(5), SeqNo(9)));
    }
}
