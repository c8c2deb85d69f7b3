//! Layout of the shared control block at the start of the channel blob.
//!
//! The host fills in `rsp_mem_offset` when the blob is created. Everything from that offset to
//! the end of the blob is the response region. Because the host sets the offset, it also marks
//! which header fields it knows about: a field is present only if its offset is below
//! `rsp_mem_offset`. A newer guest must check [`has_field`] before touching anything past the v1
//! header (`seqno` + `rsp_mem_offset`).

use core::mem::{offset_of, size_of};

/// `struct amdgpu_heap_info`.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapInfo {
    /// Theoretical maximum memory available in the heap.
    pub heap_size: u64,
    /// Memory currently in use.
    pub heap_usage: u64,
    /// Largest single allocation the heap can currently satisfy.
    pub max_allocation: u64,
}

impl HeapInfo {
    pub const SIZE_BYTES: usize = 24;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AmdvgpuShmem {
    /// Sequence number of the last request the host finished processing.
    pub seqno: u32,
    pub rsp_mem_offset: u32,
    /// Incremented by the host on asynchronous failures (`GEM_NEW`, `CS_SUBMIT`, ...).
    pub async_error: u32,
    pub pad: u32,
    pub gtt: HeapInfo,
    pub vram: HeapInfo,
    pub vis_vram: HeapInfo,
}

impl AmdvgpuShmem {
    pub const SIZE_BYTES: usize = 88;

    /// Size of the header every host provides.
    pub const V1_SIZE_BYTES: usize = 8;
}

const _: () = {
    assert!(size_of::<HeapInfo>() == HeapInfo::SIZE_BYTES);
    assert!(size_of::<AmdvgpuShmem>() == AmdvgpuShmem::SIZE_BYTES);
    assert!(offset_of!(AmdvgpuShmem, seqno) == 0);
    assert!(offset_of!(AmdvgpuShmem, rsp_mem_offset) == 4);
    assert!(offset_of!(AmdvgpuShmem, async_error) == 8);
    assert!(offset_of!(AmdvgpuShmem, gtt) == 16);
    assert!(offset_of!(AmdvgpuShmem, vram) == 40);
    assert!(offset_of!(AmdvgpuShmem, vis_vram) == 64);
};

/// Control-block fields a guest may query with [`has_field`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShmemField {
    Seqno,
    RspMemOffset,
    AsyncError,
    HeapInfoGtt,
    HeapInfoVram,
    HeapInfoVisVram,
}

impl ShmemField {
    pub const ALL: [ShmemField; 6] = [
        ShmemField::Seqno,
        ShmemField::RspMemOffset,
        ShmemField::AsyncError,
        ShmemField::HeapInfoGtt,
        ShmemField::HeapInfoVram,
        ShmemField::HeapInfoVisVram,
    ];

    pub const fn offset(self) -> usize {
        match self {
            Self::Seqno => offset_of!(AmdvgpuShmem, seqno),
            Self::RspMemOffset => offset_of!(AmdvgpuShmem, rsp_mem_offset),
            Self::AsyncError => offset_of!(AmdvgpuShmem, async_error),
            Self::HeapInfoGtt => offset_of!(AmdvgpuShmem, gtt),
            Self::HeapInfoVram => offset_of!(AmdvgpuShmem, vram),
            Self::HeapInfoVisVram => offset_of!(AmdvgpuShmem, vis_vram),
        }
    }

    pub const fn size(self) -> usize {
        match self {
            Self::Seqno | Self::RspMemOffset | Self::AsyncError => 4,
            Self::HeapInfoGtt | Self::HeapInfoVram | Self::HeapInfoVisVram => HeapInfo::SIZE_BYTES,
        }
    }
}

/// Heap selector for [`ShmemField`] heap records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShmemHeap {
    Gtt,
    Vram,
    VisVram,
}

impl ShmemHeap {
    pub const ALL: [ShmemHeap; 3] = [ShmemHeap::Gtt, ShmemHeap::Vram, ShmemHeap::VisVram];

    pub const fn field(self) -> ShmemField {
        match self {
            Self::Gtt => ShmemField::HeapInfoGtt,
            Self::Vram => ShmemField::HeapInfoVram,
            Self::VisVram => ShmemField::HeapInfoVisVram,
        }
    }
}

/// Whether a host that advertised `rsp_mem_offset` provides a field starting at `offset`.
pub const fn has_offset(rsp_mem_offset: u32, offset: usize) -> bool {
    rsp_mem_offset as usize > offset
}

pub const fn has_field(rsp_mem_offset: u32, field: ShmemField) -> bool {
    has_offset(rsp_mem_offset, field.offset())
}

/// Byte offsets of the three `u64` members inside a [`HeapInfo`] record.
pub const HEAP_INFO_HEAP_SIZE_OFFSET: usize = offset_of!(HeapInfo, heap_size);
pub const HEAP_INFO_HEAP_USAGE_OFFSET: usize = offset_of!(HeapInfo, heap_usage);
pub const HEAP_INFO_MAX_ALLOCATION_OFFSET: usize = offset_of!(HeapInfo, max_allocation);
