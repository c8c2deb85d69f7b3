//! virtio-gpu DRM uapi values used to set up a native-context channel.

use bitflags::bitflags;

/// `VIRTGPU_BLOB_MEM_*`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobMem {
    Guest = 0x0001,
    Host3d = 0x0002,
    Host3dGuest = 0x0003,
}

bitflags! {
    /// `VIRTGPU_BLOB_FLAG_*`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BlobFlags: u32 {
        const USE_MAPPABLE = 0x0001;
        const USE_SHAREABLE = 0x0002;
        const USE_CROSS_DEVICE = 0x0004;
    }
}

/// `VIRTGPU_CONTEXT_PARAM_*`.
pub const VIRTGPU_CONTEXT_PARAM_CAPSET_ID: u64 = 0x0001;
pub const VIRTGPU_CONTEXT_PARAM_NUM_RINGS: u64 = 0x0002;

/// `VIRTGPU_DRM_CAPSET_DRM`: native-context capability set.
pub const VIRTGPU_DRM_CAPSET_DRM: u64 = 6;

/// `VIRTGPU_EXECBUF_RING_IDX`.
pub const VIRTGPU_EXECBUF_RING_IDX: u32 = 0x04;
