//! Guest view of the shared control block.
//!
//! The host is the only writer; every read here is a fresh volatile load of the mapped blob.
//! `rsp_mem_offset` is read once when the view is opened.

use amdvgpu_proto::amdgpu_ccmd::CcmdRsp;
use amdvgpu_proto::amdvgpu_shmem::{
    has_field, AmdvgpuShmem, HeapInfo, ShmemField, ShmemHeap, HEAP_INFO_HEAP_SIZE_OFFSET,
    HEAP_INFO_HEAP_USAGE_OFFSET, HEAP_INFO_MAX_ALLOCATION_OFFSET,
};
use amdvgpu_proto::SeqNo;

use crate::error::{ChannelError, Result};
use crate::mapping::BlobMapping;

/// Heap counters of all three heaps, read in one go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapSnapshot {
    pub gtt: HeapInfo,
    pub vram: HeapInfo,
    pub vis_vram: HeapInfo,
}

#[derive(Clone, Copy, Debug)]
pub struct ControlBlock<'a> {
    mapping: &'a BlobMapping,
    rsp_mem_offset: u32,
}

impl<'a> ControlBlock<'a> {
    /// Reads `rsp_mem_offset` and checks it leaves room for the v1 header and one response
    /// envelope.
    pub fn open(mapping: &'a BlobMapping) -> Result<Self> {
        let rsp_mem_offset = mapping.read_u32_le(ShmemField::RspMemOffset.offset())?;
        let start = rsp_mem_offset as usize;
        if start < AmdvgpuShmem::V1_SIZE_BYTES {
            return Err(ChannelError::ProtocolMismatch(format!(
                "rsp_mem_offset {start} overlaps the control block header"
            )));
        }
        if start.saturating_add(CcmdRsp::SIZE_BYTES) > mapping.len() {
            return Err(ChannelError::ProtocolMismatch(format!(
                "rsp_mem_offset {start} leaves no response region in a {} byte blob",
                mapping.len()
            )));
        }
        Ok(Self {
            mapping,
            rsp_mem_offset,
        })
    }

    /// Rebuilds a view from an offset validated earlier by [`ControlBlock::open`].
    pub(crate) fn with_rsp_mem_offset(mapping: &'a BlobMapping, rsp_mem_offset: u32) -> Self {
        Self {
            mapping,
            rsp_mem_offset,
        }
    }

    pub fn mapping(&self) -> &'a BlobMapping {
        self.mapping
    }

    pub fn rsp_mem_offset(&self) -> u32 {
        self.rsp_mem_offset
    }

    /// Bytes available to responses, from `rsp_mem_offset` to the end of the blob.
    pub fn response_region_len(&self) -> usize {
        self.mapping.len() - self.rsp_mem_offset as usize
    }

    pub fn has_field(&self, field: ShmemField) -> bool {
        has_field(self.rsp_mem_offset, field)
    }

    fn require(&self, field: ShmemField) -> Result<usize> {
        if !self.has_field(field) {
            return Err(ChannelError::UnsupportedField(field));
        }
        Ok(field.offset())
    }

    pub fn last_processed_sequence(&self) -> Result<SeqNo> {
        let off = self.require(ShmemField::Seqno)?;
        Ok(SeqNo(self.mapping.read_u32_le(off)?))
    }

    pub fn async_error_count(&self) -> Result<u32> {
        let off = self.require(ShmemField::AsyncError)?;
        Ok(self.mapping.read_u32_le(off)?)
    }

    pub fn heap_info(&self, heap: ShmemHeap) -> Result<HeapInfo> {
        let base = self.require(heap.field())?;
        Ok(HeapInfo {
            heap_size: self.mapping.read_u64_le(base + HEAP_INFO_HEAP_SIZE_OFFSET)?,
            heap_usage: self.mapping.read_u64_le(base + HEAP_INFO_HEAP_USAGE_OFFSET)?,
            max_allocation: self.mapping.read_u64_le(base + HEAP_INFO_MAX_ALLOCATION_OFFSET)?,
        })
    }

    pub fn heap_snapshot(&self) -> Result<HeapSnapshot> {
        Ok(HeapSnapshot {
            gtt: self.heap_info(ShmemHeap::Gtt)?,
            vram: self.heap_info(ShmemHeap::Vram)?,
            vis_vram: self.heap_info(ShmemHeap::VisVram)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{HeapBacking, HeapRegion};

    fn control(rsp_mem_offset: u32) -> BlobMapping {
        let backing = HeapBacking::new(4096, 4096).unwrap();
        let m = BlobMapping::new(Box::new(HeapRegion::new(backing, 4096).unwrap()));
        m.write_u32_le(ShmemField::RspMemOffset.offset(), rsp_mem_offset).unwrap();
        m
    }

    #[test]
    fn rejects_offset_inside_header() {
        let m = control(4);
        assert!(matches!(
            ControlBlock::open(&m),
            Err(ChannelError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn rejects_offset_without_response_room() {
        let m = control(4092);
        assert!(matches!(
            ControlBlock::open(&m),
            Err(ChannelError::ProtocolMismatch(_))
        ));
        assert!(ControlBlock::open(&control(4088)).is_ok());
    }

    #[test]
    fn heap_records_follow_rsp_mem_offset() {
        let m = control(40);
        m.write_u64_le(16, 100).unwrap();
        m.write_u64_le(24, 40).unwrap();
        m.write_u64_le(32, 60).unwrap();
        let cb = ControlBlock::open(&m).unwrap();
        assert_eq!(cb.response_region_len(), 4096 - 40);
        assert_eq!(
            cb.heap_info(ShmemHeap::Gtt).unwrap(),
            HeapInfo {
                heap_size: 100,
                heap_usage: 40,
                max_allocation: 60
            }
        );
        assert!(matches!(
            cb.heap_info(ShmemHeap::Vram),
            Err(ChannelError::UnsupportedField(ShmemField::HeapInfoVram))
        ));
        assert!(matches!(
            cb.heap_snapshot(),
            Err(ChannelError::UnsupportedField(ShmemField::HeapInfoVram))
        ));
    }
}
