//! Constants from the amdgpu DRM uapi that travel inside ccmd requests.

use bitflags::bitflags;

bitflags! {
    /// `AMDGPU_GEM_DOMAIN_*`. Used as `preferred_heap` in `GEM_NEW` and reported back by
    /// `BO_QUERY_INFO`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct GemDomain: u32 {
        const CPU = 0x1;
        const GTT = 0x2;
        const VRAM = 0x4;
        const GDS = 0x8;
        const GWS = 0x10;
        const OA = 0x20;
        /// Guest memory shared with the host through a virtio-gpu blob.
        const SH_MEM = 0x40;
    }
}

bitflags! {
    /// `AMDGPU_GEM_CREATE_*`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct GemCreateFlags: u64 {
        const CPU_ACCESS_REQUIRED = 1 << 0;
        const NO_CPU_ACCESS = 1 << 1;
        const CPU_GTT_USWC = 1 << 2;
        const VRAM_CLEARED = 1 << 3;
        const VM_ALWAYS_VALID = 1 << 6;
        const EXPLICIT_SYNC = 1 << 7;
    }
}

bitflags! {
    /// `AMDGPU_VM_PAGE_*`, carried in `GEM_NEW::vm_flags`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VmPageFlags: u32 {
        const READABLE = 1 << 1;
        const WRITEABLE = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const PRT = 1 << 4;
    }
}

/// `AMDGPU_VA_OP_*`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VaOp {
    Map = 1,
    Unmap = 2,
    Clear = 3,
    Replace = 4,
}

impl VaOp {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Map),
            2 => Some(Self::Unmap),
            3 => Some(Self::Clear),
            4 => Some(Self::Replace),
            _ => None,
        }
    }
}

pub const AMDGPU_CTX_PRIORITY_VERY_LOW: i32 = -1023;
pub const AMDGPU_CTX_PRIORITY_LOW: i32 = -512;
pub const AMDGPU_CTX_PRIORITY_NORMAL: i32 = 0;
pub const AMDGPU_CTX_PRIORITY_HIGH: i32 = 512;
pub const AMDGPU_CTX_PRIORITY_VERY_HIGH: i32 = 1023;

/// `AMDGPU_CHUNK_ID_*` used in `CS_SUBMIT` descriptors.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CsChunkId {
    Ib = 0x01,
    Fence = 0x02,
    Dependencies = 0x03,
    SyncobjIn = 0x04,
    SyncobjOut = 0x05,
    BoHandles = 0x06,
    ScheduledDependencies = 0x07,
    SyncobjTimelineWait = 0x08,
    SyncobjTimelineSignal = 0x09,
}

impl CsChunkId {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x01 => Some(Self::Ib),
            0x02 => Some(Self::Fence),
            0x03 => Some(Self::Dependencies),
            0x04 => Some(Self::SyncobjIn),
            0x05 => Some(Self::SyncobjOut),
            0x06 => Some(Self::BoHandles),
            0x07 => Some(Self::ScheduledDependencies),
            0x08 => Some(Self::SyncobjTimelineWait),
            0x09 => Some(Self::SyncobjTimelineSignal),
            _ => None,
        }
    }
}
