//! Guest side of the AMDGPU virtio native-context command channel.
//!
//! A [`Channel`] owns the shared control blob, stamps requests with sequence numbers, hands them
//! to a [`VirtGpuTransport`] and reads responses back from the response region. Data buffers are
//! [`Blob`]s created through the same channel.
//!
//! On Linux, [`open_channel`] opens a virtio-gpu render node; elsewhere (and in tests) a
//! [`LoopbackTransport`] plays the host in-process.

pub mod blob;
pub mod channel;
pub mod config;
pub mod control_block;
pub mod decode;
#[cfg(target_os = "linux")]
pub mod drm;
pub mod error;
pub mod loopback;
pub mod mapping;
pub mod seqno;
pub mod transport;

pub use blob::{align_to_page, Blob, BlobAllocation, BlobManager};
pub use channel::{Channel, PendingResponse, DISCARD_SLOT_OFFSET};
pub use config::{ChannelConfig, ConfigError};
pub use control_block::{ControlBlock, HeapSnapshot};
pub use decode::{decode_response, CcmdResponse};
pub use error::{ChannelError, MapError, MappingError, Result, TransportError};
pub use loopback::{LoopbackFaults, LoopbackOptions, LoopbackTransport};
pub use mapping::BlobMapping;
pub use seqno::Sequencer;
pub use transport::{CreateBlob, VirtGpuTransport};

/// Opens the render node named by `config` and sets up a channel on it.
#[cfg(target_os = "linux")]
pub fn open_channel(config: &ChannelConfig) -> Result<Channel> {
    let transport = drm::DrmTransport::open(config).map_err(ChannelError::Transport)?;
    Channel::open(std::sync::Arc::new(transport), config)
}
