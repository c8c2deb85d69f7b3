//! Host-allocated shared buffers.
//!
//! A [`Blob`] goes through `create -> resolve -> map` and is torn down by [`Blob::release`] (or
//! on drop): the CPU mapping goes first, then the transport handle. Blob id 0 is reserved for the
//! channel's control blob; data blobs get ids from a per-manager counter starting at 1.
//!
//! Once a manager is marked lost, its data blobs can no longer be resolved or mapped. Release
//! still works.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use amdvgpu_proto::amdgpu_drm::{GemCreateFlags, GemDomain, VmPageFlags};
use amdvgpu_proto::virtgpu::{BlobFlags, BlobMem};
use amdvgpu_proto::{BlobId, BoHandle, ResourceId};

use crate::error::{ChannelError, MapError, Result};
use crate::mapping::BlobMapping;
use crate::transport::{CreateBlob, VirtGpuTransport};

/// Rounds `size` up to a multiple of `page_size` (a power of two). `None` on overflow.
pub fn align_to_page(size: u64, page_size: u64) -> Option<u64> {
    debug_assert!(page_size.is_power_of_two());
    size.checked_add(page_size - 1).map(|v| v & !(page_size - 1))
}

/// Parameters of a blob allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobAllocation {
    /// Must be a non-zero multiple of the transport page size.
    pub size: u64,
    pub preferred_heap: GemDomain,
    pub flags: GemCreateFlags,
    /// GPU virtual address to map the buffer at, or 0 to leave it unmapped.
    pub va: u64,
    pub vm_flags: VmPageFlags,
    pub phys_alignment: u64,
}

impl BlobAllocation {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            preferred_heap: GemDomain::GTT,
            flags: GemCreateFlags::empty(),
            va: 0,
            vm_flags: VmPageFlags::empty(),
            phys_alignment: 0,
        }
    }
}

pub struct BlobManager {
    transport: Arc<dyn VirtGpuTransport>,
    next_blob_id: AtomicU64,
    lost: Arc<AtomicBool>,
}

impl BlobManager {
    pub fn new(transport: Arc<dyn VirtGpuTransport>) -> Self {
        Self {
            transport,
            next_blob_id: AtomicU64::new(1),
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn transport(&self) -> &Arc<dyn VirtGpuTransport> {
        &self.transport
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Makes every data blob of this manager unusable. Returns `false` if it already was.
    pub fn mark_lost(&self) -> bool {
        !self.lost.swap(true, Ordering::AcqRel)
    }

    fn validate(&self, alloc: &BlobAllocation) -> Result<()> {
        let page_size = self.transport.page_size();
        if page_size == 0 || alloc.size == 0 || alloc.size % page_size != 0 {
            return Err(ChannelError::AlignmentError {
                size: alloc.size,
                page_size,
            });
        }
        if alloc.preferred_heap != GemDomain::GTT && alloc.preferred_heap != GemDomain::SH_MEM {
            return Err(ChannelError::UnsupportedHeap(alloc.preferred_heap));
        }
        Ok(())
    }

    fn allocate_id(&self, is_control_channel: bool) -> BlobId {
        if is_control_channel {
            BlobId::CONTROL
        } else {
            BlobId(self.next_blob_id.fetch_add(1, Ordering::Relaxed))
        }
    }

    /// Creates a blob without a piggybacked protocol request.
    pub fn create(&self, alloc: &BlobAllocation, is_control_channel: bool) -> Result<Blob> {
        self.validate(alloc)?;
        let blob_id = self.allocate_id(is_control_channel);
        self.create_blob(alloc, blob_id, &[], !is_control_channel)
    }

    /// Creates a data blob whose creation carries the request produced by `encode`.
    ///
    /// `encode` receives the id the blob is about to be created with.
    pub fn create_with_command(
        &self,
        alloc: &BlobAllocation,
        encode: impl FnOnce(BlobId) -> Result<Vec<u8>>,
    ) -> Result<Blob> {
        self.validate(alloc)?;
        let blob_id = self.allocate_id(false);
        let cmd = encode(blob_id)?;
        self.create_blob(alloc, blob_id, &cmd, true)
    }

    fn create_blob(
        &self,
        alloc: &BlobAllocation,
        blob_id: BlobId,
        cmd: &[u8],
        follows_manager: bool,
    ) -> Result<Blob> {
        let handle = self
            .transport
            .create_blob(&CreateBlob {
                blob_mem: BlobMem::Host3d,
                blob_flags: BlobFlags::USE_MAPPABLE,
                blob_id,
                size: alloc.size,
                cmd,
            })
            .map_err(ChannelError::AllocationError)?;
        tracing::debug!("created {blob_id} ({:#x} bytes) as {handle}", alloc.size);
        Ok(Blob {
            transport: self.transport.clone(),
            alloc: *alloc,
            blob_id,
            handle: Some(handle),
            res_id: None,
            map_offset: None,
            mapping: None,
            lost: follows_manager.then(|| self.lost.clone()),
        })
    }
}

/// An exclusively owned host blob.
pub struct Blob {
    transport: Arc<dyn VirtGpuTransport>,
    alloc: BlobAllocation,
    blob_id: BlobId,
    /// `None` once released.
    handle: Option<BoHandle>,
    res_id: Option<ResourceId>,
    map_offset: Option<u64>,
    mapping: Option<BlobMapping>,
    /// The owning manager's lost flag; `None` for the control blob.
    lost: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("blob_id", &self.blob_id)
            .field("handle", &self.handle)
            .field("res_id", &self.res_id)
            .field("size", &self.alloc.size)
            .field("mapping", &self.mapping)
            .finish()
    }
}

impl Blob {
    pub fn blob_id(&self) -> BlobId {
        self.blob_id
    }

    pub fn handle(&self) -> Option<BoHandle> {
        self.handle
    }

    pub fn resource_id(&self) -> Option<ResourceId> {
        self.res_id
    }

    pub fn byte_size(&self) -> u64 {
        self.alloc.size
    }

    pub fn allocation(&self) -> &BlobAllocation {
        &self.alloc
    }

    /// Offset the transport handed out for mapping, once [`Blob::map`] has run.
    pub fn backing_offset(&self) -> Option<u64> {
        self.map_offset
    }

    pub fn mapping(&self) -> Option<&BlobMapping> {
        self.mapping.as_ref()
    }

    pub fn mapped_address(&self) -> Option<usize> {
        self.mapping.as_ref().map(BlobMapping::addr)
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    fn is_lost(&self) -> bool {
        self.lost
            .as_ref()
            .is_some_and(|lost| lost.load(Ordering::Acquire))
    }

    /// Looks up the host resource id. Cached after the first success.
    pub fn resolve(&mut self) -> Result<ResourceId> {
        let handle = self.handle.ok_or_else(|| ChannelError::ResolutionError {
            blob_id: self.blob_id,
            reason: "blob has been released".into(),
        })?;
        if self.is_lost() {
            return Err(ChannelError::AsyncContextLost);
        }
        if let Some(res_id) = self.res_id {
            return Ok(res_id);
        }
        let res_id = self
            .transport
            .resource_info(handle)
            .map_err(|err| ChannelError::ResolutionError {
                blob_id: self.blob_id,
                reason: err.to_string(),
            })?;
        tracing::debug!("{} resolved to {res_id}", self.blob_id);
        self.res_id = Some(res_id);
        Ok(res_id)
    }

    /// Maps the whole blob into the guest address space. Idempotent.
    pub fn map(&mut self) -> std::result::Result<&BlobMapping, MapError> {
        let handle = self.handle.ok_or(MapError::Released(self.blob_id))?;
        if self.is_lost() {
            return Err(MapError::ChannelLost(self.blob_id));
        }
        if self.mapping.is_none() {
            let offset = self
                .transport
                .map_offset(handle)
                .map_err(MapError::OffsetUnavailable)?;
            let mapping = self
                .transport
                .mmap(offset, self.alloc.size)
                .map_err(MapError::MappingRejected)?;
            tracing::debug!("mapped {} at {:#x}", self.blob_id, mapping.addr());
            self.map_offset = Some(offset);
            self.mapping = Some(mapping);
        }
        self.mapping.as_ref().ok_or(MapError::Released(self.blob_id))
    }

    /// Unmaps and releases the handle. Calling it again does nothing.
    pub fn release(&mut self) {
        self.mapping = None;
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(err) = self.transport.close(handle) {
            tracing::warn!("failed to close {handle} for {}: {err}", self.blob_id);
        } else {
            tracing::debug!("released {}", self.blob_id);
        }
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        self.release();
    }
}
