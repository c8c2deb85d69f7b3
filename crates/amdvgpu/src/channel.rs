//! The ccmd channel: a control blob, a sequencer and a table of in-flight response slots.
//!
//! Requests are stamped and handed to the transport by [`Channel::issue`]; the host writes its
//! response into the slot named by `rsp_off` and then publishes the request's sequence number
//! in the control block. [`Channel::poll`] never waits: it returns `None` until that sequence
//! number has been published.
//!
//! Failures the host cannot report synchronously (`GEM_NEW` piggybacked on blob creation,
//! `CS_SUBMIT`) bump the control block's `async_error` counter instead. Once the counter moves
//! past the value seen at open, the channel is lost for good and every operation fails with
//! [`ChannelError::AsyncContextLost`]. Data blobs allocated through the channel go down with it.
//!
//! Dropping a [`PendingResponse`] abandons its slot. The host may still write the response
//! there, so the slot only returns to the free pool once the control block shows the request
//! as processed.

use std::collections::BTreeMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use amdvgpu_proto::amdgpu_ccmd::{CcmdOpcode, CcmdRsp};
use amdvgpu_proto::amdgpu_drm::{GemCreateFlags, GemDomain};
use amdvgpu_proto::{
    AssignVaRequest, BlobId, CcmdRequest, ContextId, CreateCtxRequest, CsSubmitRequest,
    GemNewRequest, QueryInfoRequest, ResourceId, SeqNo, SetMetadataRequest,
};

use crate::blob::{Blob, BlobAllocation, BlobManager};
use crate::config::ChannelConfig;
use crate::control_block::ControlBlock;
use crate::decode::{decode_response, CcmdResponse};
use crate::error::{ChannelError, MapError, Result};
use crate::seqno::{is_processed, Sequencer};
use crate::transport::VirtGpuTransport;

/// Start of the response region is never handed out: responses nobody reads
/// (piggybacked `GEM_NEW`) land there.
pub const DISCARD_SLOT_OFFSET: u32 = 0;
const DISCARD_SLOT_LEN: usize = CcmdRsp::SIZE_BYTES;
const SLOT_ALIGN: usize = 8;

const fn align_slot(v: usize) -> usize {
    (v + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// An issued request whose response has not been consumed yet.
///
/// Dropping it without polling abandons the response; see [`Channel::discard`].
#[derive(Debug)]
#[must_use]
pub struct PendingResponse {
    seqno: SeqNo,
    opcode: CcmdOpcode,
    rsp_off: u32,
    expected_len: usize,
    capacity: usize,
    slots: Weak<Mutex<SlotTable>>,
}

impl PendingResponse {
    pub fn seqno(&self) -> SeqNo {
        self.seqno
    }

    pub fn opcode(&self) -> CcmdOpcode {
        self.opcode
    }

    pub fn rsp_off(&self) -> u32 {
        self.rsp_off
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            if lock_table(&slots).abandon(self.rsp_off as usize, self.seqno) {
                tracing::trace!("abandoned response of {} at rsp_off {}", self.seqno, self.rsp_off);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    end: usize,
    owner: SeqNo,
    /// The token is gone; the slot is free once the host has processed `owner`.
    abandoned: bool,
}

#[derive(Debug, Default)]
struct SlotTable {
    /// Keyed by slot start.
    busy: BTreeMap<usize, Slot>,
}

impl SlotTable {
    fn insert(&mut self, start: usize, end: usize, owner: SeqNo) {
        self.busy.insert(
            start,
            Slot {
                end,
                owner,
                abandoned: false,
            },
        );
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        start < DISCARD_SLOT_LEN || self.busy.range(..end).any(|(_, slot)| slot.end > start)
    }

    fn first_fit(&self, len: usize, region_len: usize) -> Option<usize> {
        let mut cursor = DISCARD_SLOT_LEN;
        for (&start, slot) in &self.busy {
            if cursor.checked_add(len)? <= start {
                return Some(cursor);
            }
            cursor = cursor.max(align_slot(slot.end));
        }
        (cursor.checked_add(len)? <= region_len).then_some(cursor)
    }

    fn is_owned(&self, start: usize, seqno: SeqNo) -> bool {
        matches!(self.busy.get(&start), Some(slot) if slot.owner == seqno && !slot.abandoned)
    }

    fn free(&mut self, start: usize, seqno: SeqNo) -> bool {
        if self.is_owned(start, seqno) {
            self.busy.remove(&start);
            true
        } else {
            false
        }
    }

    fn abandon(&mut self, start: usize, seqno: SeqNo) -> bool {
        match self.busy.get_mut(&start) {
            Some(slot) if slot.owner == seqno && !slot.abandoned => {
                slot.abandoned = true;
                true
            }
            _ => false,
        }
    }

    fn has_abandoned(&self) -> bool {
        self.busy.values().any(|slot| slot.abandoned)
    }

    /// Frees abandoned slots whose request the host has processed. Returns how many were freed.
    fn reclaim(&mut self, last_processed: SeqNo) -> usize {
        let before = self.busy.len();
        self.busy
            .retain(|_, slot| !(slot.abandoned && is_processed(slot.owner, last_processed)));
        before - self.busy.len()
    }
}

fn lock_table(slots: &Mutex<SlotTable>) -> MutexGuard<'_, SlotTable> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Channel {
    blobs: BlobManager,
    control: Blob,
    rsp_mem_offset: u32,
    region_len: usize,
    sequencer: Sequencer,
    /// Also held across stamping and submission so the host receives sequence numbers in order.
    slots: Arc<Mutex<SlotTable>>,
    /// `None` when the host predates the `async_error` field.
    async_baseline: Option<u32>,
    /// OR-ed into every `GEM_NEW`.
    extra_gem_flags: GemCreateFlags,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("control", &self.control)
            .field("rsp_mem_offset", &self.rsp_mem_offset)
            .field("last_issued", &self.sequencer.last_issued())
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl Channel {
    /// Creates, resolves and maps the control blob and reads the host's control block.
    pub fn open(transport: Arc<dyn VirtGpuTransport>, config: &ChannelConfig) -> Result<Self> {
        let blobs = BlobManager::new(transport);
        let alloc = BlobAllocation {
            preferred_heap: GemDomain::SH_MEM,
            ..BlobAllocation::new(config.shmem_size)
        };
        let mut control = blobs.create(&alloc, true)?;
        control.resolve()?;
        let mapping = control.map()?;

        let cb = ControlBlock::open(mapping)?;
        let rsp_mem_offset = cb.rsp_mem_offset();
        let region_len = cb.response_region_len();
        let async_baseline = match cb.async_error_count() {
            Ok(count) => Some(count),
            Err(ChannelError::UnsupportedField(_)) => None,
            Err(err) => return Err(err),
        };
        tracing::debug!(
            "channel open: rsp_mem_offset={rsp_mem_offset} response region={region_len} bytes \
             async_error baseline={async_baseline:?}"
        );

        Ok(Self {
            blobs,
            control,
            rsp_mem_offset,
            region_len,
            sequencer: Sequencer::new(),
            slots: Arc::new(Mutex::new(SlotTable::default())),
            async_baseline,
            extra_gem_flags: config.extra_gem_flags,
        })
    }

    fn lock_slots(&self) -> MutexGuard<'_, SlotTable> {
        lock_table(&self.slots)
    }

    /// Returns abandoned slots the host is done with to the free pool.
    fn reclaim_abandoned(&self, slots: &mut SlotTable) -> Result<usize> {
        if !slots.has_abandoned() {
            return Ok(0);
        }
        let last_processed = self.control_block()?.last_processed_sequence()?;
        let freed = slots.reclaim(last_processed);
        if freed > 0 {
            tracing::trace!("reclaimed {freed} abandoned response slot(s) up to {last_processed}");
        }
        Ok(freed)
    }

    pub fn control_block(&self) -> Result<ControlBlock<'_>> {
        let mapping = self
            .control
            .mapping()
            .ok_or(MapError::Released(BlobId::CONTROL))?;
        Ok(ControlBlock::with_rsp_mem_offset(mapping, self.rsp_mem_offset))
    }

    pub fn control_blob(&self) -> &Blob {
        &self.control
    }

    pub fn is_lost(&self) -> bool {
        self.blobs.is_lost()
    }

    fn check_async(&self) -> Result<()> {
        if self.is_lost() {
            return Err(ChannelError::AsyncContextLost);
        }
        let Some(baseline) = self.async_baseline else {
            return Ok(());
        };
        let current = self.control_block()?.async_error_count()?;
        if current != baseline {
            if self.blobs.mark_lost() {
                tracing::error!(
                    "host reported {} asynchronous error(s); channel lost",
                    current.wrapping_sub(baseline)
                );
            }
            return Err(ChannelError::AsyncContextLost);
        }
        Ok(())
    }

    /// Issues `request` into the first free response slot large enough for it.
    pub fn issue(&self, request: &CcmdRequest) -> Result<PendingResponse> {
        self.check_async()?;
        let capacity = request.response_capacity();
        let mut slots = self.lock_slots();
        let start = match slots.first_fit(capacity, self.region_len) {
            Some(start) => start,
            None => {
                self.reclaim_abandoned(&mut slots)?;
                slots
                    .first_fit(capacity, self.region_len)
                    .ok_or(ChannelError::ResponseRegionFull { needed: capacity })?
            }
        };
        self.submit_locked(&mut slots, request, start)
    }

    /// Issues `request` with a caller-chosen response offset.
    pub fn issue_at(&self, request: &CcmdRequest, rsp_off: u32) -> Result<PendingResponse> {
        self.check_async()?;
        let capacity = request.response_capacity();
        let start = rsp_off as usize;
        let end = start
            .checked_add(capacity)
            .filter(|end| *end <= self.region_len)
            .ok_or_else(|| {
                ChannelError::MalformedRequest(format!(
                    "response of {capacity} bytes at offset {rsp_off} runs past the {} byte \
                     response region",
                    self.region_len
                ))
            })?;
        let mut slots = self.lock_slots();
        if slots.overlaps(start, end)
            && (self.reclaim_abandoned(&mut slots)? == 0 || slots.overlaps(start, end))
        {
            return Err(ChannelError::ResponseSlotBusy { rsp_off });
        }
        self.submit_locked(&mut slots, request, start)
    }

    fn submit_locked(
        &self,
        slots: &mut SlotTable,
        request: &CcmdRequest,
        start: usize,
    ) -> Result<PendingResponse> {
        let capacity = request.response_capacity();
        let rsp_off = u32::try_from(start).map_err(|_| ChannelError::ResponseRegionFull {
            needed: capacity,
        })?;
        let seqno = self.sequencer.next()?;
        let cmd = request.encode_le(seqno, rsp_off)?;
        let ring_idx = match request {
            CcmdRequest::CsSubmit(cs) => cs.ring_idx,
            _ => 0,
        };

        slots.insert(start, start + capacity, seqno);
        if let Err(err) = self.blobs.transport().submit(&cmd, ring_idx) {
            slots.busy.remove(&start);
            return Err(ChannelError::Transport(err));
        }
        tracing::trace!("issued {:?} as {seqno} at rsp_off {rsp_off}", request.opcode());

        Ok(PendingResponse {
            seqno,
            opcode: request.opcode(),
            rsp_off,
            expected_len: request.expected_response_len(),
            capacity,
            slots: Arc::downgrade(&self.slots),
        })
    }

    /// Returns the response once the host has processed `pending`, freeing its slot.
    pub fn poll(&self, pending: &PendingResponse) -> Result<Option<CcmdResponse>> {
        self.check_async()?;
        let start = pending.rsp_off as usize;
        let mut slots = self.lock_slots();
        if !slots.is_owned(start, pending.seqno) {
            return Err(ChannelError::ResponseConsumed(pending.seqno));
        }

        let cb = self.control_block()?;
        if !is_processed(pending.seqno, cb.last_processed_sequence()?) {
            return Ok(None);
        }
        // Response bytes were written before the sequence number was published.
        fence(Ordering::Acquire);

        let decoded = decode_response(
            cb.mapping(),
            self.rsp_mem_offset,
            pending.rsp_off,
            pending.expected_len,
        );
        slots.free(start, pending.seqno);
        let rsp = decoded?;
        if rsp.len() > pending.capacity {
            return Err(ChannelError::ProtocolMismatch(format!(
                "{:?} response of {} bytes overflows its {} byte slot",
                pending.opcode,
                rsp.len(),
                pending.capacity
            )));
        }
        Ok(Some(rsp))
    }

    /// Gives up on a response. Same as dropping `pending`: the host still writes the response,
    /// and the slot is reused once the host has processed the request.
    pub fn discard(&self, pending: PendingResponse) {
        drop(pending);
    }

    /// Creates a data blob, registering it with the host through a piggybacked `GEM_NEW`.
    pub fn allocate_blob(&self, alloc: &BlobAllocation) -> Result<Blob> {
        self.check_async()?;
        let _order = self.lock_slots();
        self.blobs.create_with_command(alloc, |blob_id| {
            let request = CcmdRequest::GemNew(GemNewRequest {
                blob_id,
                va: alloc.va,
                vm_flags: alloc.vm_flags,
                vm_map_size: alloc.size,
                alloc_size: alloc.size,
                phys_alignment: alloc.phys_alignment,
                preferred_heap: alloc.preferred_heap,
                flags: alloc.flags | self.extra_gem_flags,
            });
            let seqno = self.sequencer.next()?;
            Ok(request.encode_le(seqno, DISCARD_SLOT_OFFSET)?)
        })
    }

    pub fn nop(&self) -> Result<PendingResponse> {
        self.issue(&CcmdRequest::Nop)
    }

    pub fn query_info(&self, query: QueryInfoRequest) -> Result<PendingResponse> {
        self.issue(&CcmdRequest::QueryInfo(query))
    }

    /// The context id is read from the response with [`CcmdResponse::context_id`].
    pub fn create_context(&self, priority: i32) -> Result<PendingResponse> {
        self.issue(&CcmdRequest::CreateCtx(CreateCtxRequest::Create { priority }))
    }

    pub fn destroy_context(&self, ctx_id: ContextId) -> Result<PendingResponse> {
        self.issue(&CcmdRequest::CreateCtx(CreateCtxRequest::Destroy { ctx_id }))
    }

    pub fn assign_va(&self, request: AssignVaRequest) -> Result<PendingResponse> {
        self.issue(&CcmdRequest::AssignVa(request))
    }

    /// Failures surface through `async_error`, not the response.
    pub fn submit_command_stream(&self, request: CsSubmitRequest) -> Result<PendingResponse> {
        self.issue(&CcmdRequest::CsSubmit(request))
    }

    pub fn set_metadata(&self, request: SetMetadataRequest) -> Result<PendingResponse> {
        self.issue(&CcmdRequest::SetMetadata(request))
    }

    pub fn bo_query_info(&self, res_id: ResourceId) -> Result<PendingResponse> {
        self.issue(&CcmdRequest::BoQueryInfo { res_id })
    }
}
