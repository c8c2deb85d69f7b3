//! The kernel-facing side of a channel.
//!
//! A transport moves blob-creation, mapping and execbuffer requests across the guest/host
//! boundary. [`crate::drm::DrmTransport`] talks to a virtio-gpu render node;
//! [`crate::loopback::LoopbackTransport`] plays the host in-process.

use amdvgpu_proto::virtgpu::{BlobFlags, BlobMem};
use amdvgpu_proto::{BlobId, BoHandle, ResourceId};

use crate::error::TransportError;
use crate::mapping::BlobMapping;

/// Arguments of `VIRTGPU_RESOURCE_CREATE_BLOB`.
#[derive(Clone, Copy, Debug)]
pub struct CreateBlob<'a> {
    pub blob_mem: BlobMem,
    pub blob_flags: BlobFlags,
    pub blob_id: BlobId,
    pub size: u64,
    /// Encoded ccmd request the host executes as part of blob creation. May be empty.
    pub cmd: &'a [u8],
}

pub trait VirtGpuTransport: Send + Sync {
    fn page_size(&self) -> u64;

    fn create_blob(&self, req: &CreateBlob<'_>) -> Result<BoHandle, TransportError>;

    /// Host resource id backing `handle` (`VIRTGPU_RESOURCE_INFO`).
    fn resource_info(&self, handle: BoHandle) -> Result<ResourceId, TransportError>;

    /// Offset to pass to [`VirtGpuTransport::mmap`] (`VIRTGPU_MAP`).
    fn map_offset(&self, handle: BoHandle) -> Result<u64, TransportError>;

    fn mmap(&self, offset: u64, size: u64) -> Result<BlobMapping, TransportError>;

    /// Hands encoded ccmd requests to the host (`VIRTGPU_EXECBUFFER`).
    fn submit(&self, cmd: &[u8], ring_idx: u32) -> Result<(), TransportError>;

    fn close(&self, handle: BoHandle) -> Result<(), TransportError>;
}
