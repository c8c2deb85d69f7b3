use amdvgpu_proto::amdgpu_ccmd::{CcmdDecodeError, CcmdOpcode};
use amdvgpu_proto::amdgpu_drm::GemDomain;
use amdvgpu_proto::amdvgpu_shmem::ShmemField;
use amdvgpu_proto::{BlobId, BoHandle, CcmdEncodeError, SeqNo};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Failure reported by a [`crate::transport::VirtGpuTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown buffer handle {0}")]
    UnknownHandle(BoHandle),

    #[error("no mapping registered at offset {0:#x}")]
    UnknownMapOffset(u64),

    #[error("transport rejected the request: {0}")]
    Rejected(String),
}

impl TransportError {
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        Self::Io {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    /// The transport could not produce a mapping offset for the handle.
    #[error("mapping offset unavailable: {0}")]
    OffsetUnavailable(#[source] TransportError),

    /// An offset was obtained but the mapping itself failed.
    #[error("mapping rejected: {0}")]
    MappingRejected(#[source] TransportError),

    #[error("{0} has been released")]
    Released(BlobId),

    #[error("{0} belongs to a lost channel")]
    ChannelLost(BlobId),
}

/// Out-of-range access through a [`crate::mapping::BlobMapping`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("offset {offset} is not aligned to {alignment}")]
    Misaligned { offset: usize, alignment: usize },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unknown operation {0}")]
    UnknownOperation(u32),

    #[error("control block field {0:?} not provided by host")]
    UnsupportedField(ShmemField),

    #[error("blob allocation failed: {0}")]
    AllocationError(#[source] TransportError),

    #[error("heap {0:?} cannot back a shared blob")]
    UnsupportedHeap(GemDomain),

    #[error("blob size {size:#x} is not a non-zero multiple of the page size {page_size:#x}")]
    AlignmentError { size: u64, page_size: u64 },

    #[error("could not resolve {blob_id}: {reason}")]
    ResolutionError { blob_id: BlobId, reason: String },

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("response truncated: needs {needed} bytes at offset {offset}, blob holds {size}")]
    TruncatedResponse {
        offset: usize,
        needed: usize,
        size: usize,
    },

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("host reported an asynchronous error, context lost")]
    AsyncContextLost,

    #[error("response slot at offset {rsp_off} overlaps a pending response")]
    ResponseSlotBusy { rsp_off: u32 },

    #[error("no free response slot of {needed} bytes")]
    ResponseRegionFull { needed: usize },

    #[error("sequence numbers exhausted")]
    SequenceExhausted,

    #[error("response for {0} already consumed")]
    ResponseConsumed(SeqNo),

    #[error("{opcode:?} failed on host: ret={ret}")]
    HostError { opcode: CcmdOpcode, ret: i32 },

    #[error("submit failed: {0}")]
    Transport(#[source] TransportError),
}

impl From<CcmdEncodeError> for ChannelError {
    fn from(err: CcmdEncodeError) -> Self {
        Self::MalformedRequest(err.to_string())
    }
}

impl From<CcmdDecodeError> for ChannelError {
    fn from(err: CcmdDecodeError) -> Self {
        match err {
            CcmdDecodeError::UnknownOpcode { found } => Self::UnknownOperation(found),
            other => Self::ProtocolMismatch(other.to_string()),
        }
    }
}
