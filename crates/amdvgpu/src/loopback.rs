//! In-process host for tests and host-less bring-up.
//!
//! [`LoopbackTransport`] stands in for the virtio-gpu device and the host amdgpu backend at once:
//! blobs are page-aligned heap allocations shared with the guest-side mapping, the control block
//! of blob 0 is initialised the way a host does it, and every ccmd request is decoded, executed
//! and answered in the response region. Requests can be held back (deferred mode) to observe
//! in-flight behaviour, and individual transport calls can be made to fail.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use amdvgpu_proto::amdgpu_ccmd::{
    decode_ccmd_req_le, encode_ccmd_bo_query_info_rsp_le, AmdgpuBoMetadata, CcmdBoInfo,
    CcmdBoQueryInfoRsp, CcmdCreateCtxRsp, CcmdOpcode, CcmdReq, CcmdRsp,
    AMDGPU_UMD_METADATA_DWORDS,
};
use amdvgpu_proto::amdgpu_drm::{CsChunkId, GemDomain, VaOp};
use amdvgpu_proto::amdvgpu_shmem::{
    has_field, AmdvgpuShmem, HeapInfo, ShmemField, ShmemHeap, HEAP_INFO_HEAP_SIZE_OFFSET,
    HEAP_INFO_HEAP_USAGE_OFFSET, HEAP_INFO_MAX_ALLOCATION_OFFSET,
};
use amdvgpu_proto::{
    decode_ccmd_request_le, AssignVaRequest, BlobId, BoHandle, CcmdRequest, CreateCtxRequest,
    CsSubmitRequest, GemNewRequest, QueryInfoRequest, ResourceId, SetMetadataRequest,
};
use bitflags::bitflags;

use crate::error::{MappingError, TransportError};
use crate::mapping::{BlobMapping, HeapBacking, HeapRegion};
use crate::transport::{CreateBlob, VirtGpuTransport};

const ENOENT: i32 = 2;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;

/// Largest generic info payload the loopback host will produce.
const MAX_INFO_RETURN_SIZE: u32 = 4096;

/// Name reported for `MarketingName` queries.
pub const LOOPBACK_MARKETING_NAME: &str = "AMD Radeon Loopback";

/// Leading dwords of the `GpuInfo` payload: asic id, chip revision, external revision, family.
pub const LOOPBACK_GPU_INFO: [u32; 4] = [0x73BF, 0x1, 0x29, 143];

/// Value reported for the `Address32Hi` probe.
pub const LOOPBACK_ADDRESS32_HI: u32 = 0xFFFF;

const MAP_OFFSET_BASE: u64 = 0x1_0000_0000;

bitflags! {
    /// Transport calls that fail on purpose.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct LoopbackFaults: u32 {
        const CREATE_BLOB = 1 << 0;
        const RESOURCE_INFO = 1 << 1;
        const MAP_OFFSET = 1 << 2;
        const MMAP = 1 << 3;
        const SUBMIT = 1 << 4;
        const CLOSE = 1 << 5;
    }
}

#[derive(Clone, Debug)]
pub struct LoopbackOptions {
    pub page_size: u64,
    /// Value written to `rsp_mem_offset` of the control block. Smaller values emulate older hosts.
    pub rsp_mem_offset: u32,
    /// Queue requests until [`LoopbackTransport::process_pending`] is called.
    pub deferred: bool,
    pub num_rings: u32,
    /// Initial GTT, VRAM and visible-VRAM counters.
    pub heaps: [HeapInfo; 3],
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        let heap = |size: u64| HeapInfo {
            heap_size: size,
            heap_usage: 0,
            max_allocation: size / 2,
        };
        Self {
            page_size: 4096,
            rsp_mem_offset: AmdvgpuShmem::SIZE_BYTES as u32,
            deferred: false,
            num_rings: 64,
            heaps: [heap(8 << 30), heap(4 << 30), heap(256 << 20)],
        }
    }
}

struct HostBlob {
    blob_id: BlobId,
    res_id: ResourceId,
    size: u64,
    map_offset: u64,
    backing: Arc<HeapBacking>,
}

/// What the host knows about a GEM object created through `GEM_NEW`.
#[derive(Clone, Debug)]
struct HostBo {
    alloc_size: u64,
    phys_alignment: u64,
    preferred_heap: GemDomain,
    alloc_flags: u64,
    metadata: AmdgpuBoMetadata,
}

struct HostState {
    next_handle: u32,
    next_res_id: u32,
    next_map_offset: u64,
    next_ctx_id: u32,
    blobs: HashMap<BoHandle, HostBlob>,
    by_map_offset: HashMap<u64, BoHandle>,
    control: Option<(BoHandle, BlobMapping)>,
    bos: HashMap<ResourceId, HostBo>,
    /// GPU VA -> (resource, size).
    vas: BTreeMap<u64, (ResourceId, u64)>,
    contexts: HashMap<u32, i32>,
    pending: VecDeque<Vec<u8>>,
    heaps: [HeapInfo; 3],
    executed: Vec<CcmdOpcode>,
}

pub struct LoopbackTransport {
    options: LoopbackOptions,
    deferred: AtomicBool,
    faults: AtomicU32,
    state: Mutex<HostState>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl LoopbackTransport {
    pub fn new(options: LoopbackOptions) -> Self {
        let state = HostState {
            next_handle: 1,
            next_res_id: 1,
            next_map_offset: MAP_OFFSET_BASE,
            next_ctx_id: 1,
            blobs: HashMap::new(),
            by_map_offset: HashMap::new(),
            control: None,
            bos: HashMap::new(),
            vas: BTreeMap::new(),
            contexts: HashMap::new(),
            pending: VecDeque::new(),
            heaps: options.heaps,
            executed: Vec::new(),
        };
        Self {
            deferred: AtomicBool::new(options.deferred),
            faults: AtomicU32::new(0),
            options,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fault(&self, which: LoopbackFaults) -> Result<(), TransportError> {
        let active = LoopbackFaults::from_bits_retain(self.faults.load(Ordering::Acquire));
        if active.contains(which) {
            return Err(TransportError::Rejected(format!("injected {which:?} failure")));
        }
        Ok(())
    }

    pub fn set_faults(&self, faults: LoopbackFaults) {
        self.faults.store(faults.bits(), Ordering::Release);
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::Release);
    }

    /// Executes every queued request in submission order. Returns how many ran.
    pub fn process_pending(&self) -> usize {
        let mut state = self.lock();
        let mut ran = 0;
        while let Some(cmd) = state.pending.pop_front() {
            self.execute(&mut state, &cmd);
            ran += 1;
        }
        ran
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Bumps `async_error` as if a previously accepted request had failed on the host.
    pub fn inject_async_error(&self) {
        let mut state = self.lock();
        raise_async_error(&mut state, "injected");
    }

    /// Opcodes executed so far, in order.
    pub fn executed(&self) -> Vec<CcmdOpcode> {
        self.lock().executed.clone()
    }

    pub fn live_blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Host view of a GPU virtual address mapping.
    pub fn va_mapping(&self, va: u64) -> Option<(ResourceId, u64)> {
        self.lock().vas.get(&va).copied()
    }

    fn init_control_block(&self, mapping: &BlobMapping, heaps: &[HeapInfo; 3]) {
        let rsp_mem_offset = self.options.rsp_mem_offset;
        let init = || -> Result<(), MappingError> {
            mapping.write_u32_le(ShmemField::Seqno.offset(), 0)?;
            mapping.write_u32_le(ShmemField::RspMemOffset.offset(), rsp_mem_offset)?;
            if has_field(rsp_mem_offset, ShmemField::AsyncError) {
                mapping.write_u32_le(ShmemField::AsyncError.offset(), 0)?;
            }
            for heap in ShmemHeap::ALL {
                if has_field(rsp_mem_offset, heap.field()) {
                    write_heap(mapping, heap, &heaps[heap as usize])?;
                }
            }
            Ok(())
        };
        if let Err(err) = init() {
            tracing::warn!("loopback: control block initialisation failed: {err}");
        }
    }

    fn execute(&self, state: &mut HostState, cmd: &[u8]) {
        let (hdr, req) = match decode_ccmd_request_le(cmd) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("loopback: rejecting request: {err}");
                // Answer if at least the envelope is readable so the guest is not left waiting.
                match decode_ccmd_req_le(cmd) {
                    Ok(hdr) => {
                        respond(state, &hdr, &envelope(-EINVAL, CcmdRsp::SIZE_BYTES));
                        complete(state, &hdr);
                    }
                    Err(_) => raise_async_error(state, "undecodable request"),
                }
                return;
            }
        };

        state.executed.push(req.opcode());
        let rsp = match &req {
            CcmdRequest::Nop => envelope(0, CcmdRsp::SIZE_BYTES),
            CcmdRequest::QueryInfo(q) => self.query_info(state, q),
            CcmdRequest::GemNew(g) => gem_new(state, g),
            CcmdRequest::AssignVa(va) => assign_va(state, va),
            CcmdRequest::CsSubmit(cs) => self.cs_submit(state, cs),
            CcmdRequest::SetMetadata(md) => set_metadata(state, md),
            CcmdRequest::BoQueryInfo { res_id } => bo_query_info(state, *res_id),
            CcmdRequest::CreateCtx(ctx) => create_ctx(state, ctx),
        };
        respond(state, &hdr, &rsp);
        complete(state, &hdr);
    }

    fn query_info(&self, state: &HostState, q: &QueryInfoRequest) -> Vec<u8> {
        let payload: Vec<u8> = match *q {
            QueryInfoRequest::Info(info) => {
                if info.return_size > MAX_INFO_RETURN_SIZE {
                    return envelope(-EINVAL, CcmdRsp::SIZE_BYTES);
                }
                (0..info.return_size)
                    .map(|i| (info.query as u8).wrapping_add(i as u8))
                    .collect()
            }
            QueryInfoRequest::Address32Hi => LOOPBACK_ADDRESS32_HI.to_le_bytes().to_vec(),
            QueryInfoRequest::GpuInfo => LOOPBACK_GPU_INFO.iter().flat_map(|w| w.to_le_bytes()).collect(),
            QueryInfoRequest::BufferSizeAlignment => {
                let page = self.options.page_size.to_le_bytes();
                page.iter().chain(page.iter()).copied().collect()
            }
            QueryInfoRequest::MarketingName => {
                let mut name = LOOPBACK_MARKETING_NAME.as_bytes().to_vec();
                name.push(0);
                name
            }
            QueryInfoRequest::ReserveVmid(v) => {
                let ret = if v == 0 || v == 1 { 0 } else { -EINVAL };
                return envelope(ret, CcmdRsp::SIZE_BYTES);
            }
            QueryInfoRequest::SetPstate { ctx_id, .. } => {
                if !state.contexts.contains_key(&ctx_id.get()) {
                    return envelope(-EINVAL, CcmdRsp::SIZE_BYTES);
                }
                0u32.to_le_bytes().to_vec()
            }
        };
        let mut rsp = envelope(0, CcmdRsp::SIZE_BYTES + payload.len());
        rsp.extend_from_slice(&payload);
        rsp
    }

    fn cs_submit(&self, state: &mut HostState, cs: &CsSubmitRequest) -> Vec<u8> {
        let reason = if !state.contexts.contains_key(&cs.ctx_id.get()) {
            Some("unknown context")
        } else if cs.chunks.is_empty() {
            Some("no chunks")
        } else if cs.chunks.iter().any(|c| CsChunkId::from_u32(c.chunk_id).is_none()) {
            Some("unknown chunk id")
        } else if cs.ring_idx >= self.options.num_rings {
            Some("ring index out of range")
        } else {
            None
        };
        match reason {
            Some(reason) => {
                raise_async_error(state, reason);
                envelope(-EINVAL, CcmdRsp::SIZE_BYTES)
            }
            None => envelope(0, CcmdRsp::SIZE_BYTES),
        }
    }
}

fn envelope(ret: i32, len: usize) -> Vec<u8> {
    let mut rsp = Vec::with_capacity(len);
    rsp.extend_from_slice(&ret.to_le_bytes());
    rsp.extend_from_slice(&(len as u32).to_le_bytes());
    rsp
}

fn write_heap(mapping: &BlobMapping, heap: ShmemHeap, info: &HeapInfo) -> Result<(), MappingError> {
    let base = heap.field().offset();
    mapping.write_u64_le(base + HEAP_INFO_HEAP_SIZE_OFFSET, info.heap_size)?;
    mapping.write_u64_le(base + HEAP_INFO_HEAP_USAGE_OFFSET, info.heap_usage)?;
    mapping.write_u64_le(base + HEAP_INFO_MAX_ALLOCATION_OFFSET, info.max_allocation)
}

fn control_rsp_mem_offset(mapping: &BlobMapping) -> Option<u32> {
    mapping.read_u32_le(ShmemField::RspMemOffset.offset()).ok()
}

fn raise_async_error(state: &mut HostState, reason: &str) {
    tracing::debug!("loopback: async error ({reason})");
    let Some((_, mapping)) = &state.control else {
        return;
    };
    let Some(rsp_mem_offset) = control_rsp_mem_offset(mapping) else {
        return;
    };
    if !has_field(rsp_mem_offset, ShmemField::AsyncError) {
        return;
    }
    let off = ShmemField::AsyncError.offset();
    if let Ok(count) = mapping.read_u32_le(off) {
        let _ = mapping.write_u32_le(off, count.wrapping_add(1));
    }
}

/// Writes `rsp` at `rsp_off` inside the response region, if it fits.
fn respond(state: &mut HostState, hdr: &CcmdReq, rsp: &[u8]) {
    let rsp_off = hdr.rsp_off;
    let Some((_, mapping)) = &state.control else {
        return;
    };
    let Some(rsp_mem_offset) = control_rsp_mem_offset(mapping) else {
        return;
    };
    let start = (rsp_mem_offset as usize).checked_add(rsp_off as usize);
    let written = start.map(|start| mapping.write_bytes(start, rsp));
    if !matches!(written, Some(Ok(()))) {
        raise_async_error(state, "response outside the response region");
    }
}

/// Publishes `hdr.seqno` as the last processed sequence number.
fn complete(state: &mut HostState, hdr: &CcmdReq) {
    let seqno = hdr.seqno;
    if let Some((_, mapping)) = &state.control {
        let _ = mapping.write_u32_le(ShmemField::Seqno.offset(), seqno);
    }
}

fn publish_heaps(state: &HostState) {
    let Some((_, mapping)) = &state.control else {
        return;
    };
    let Some(rsp_mem_offset) = control_rsp_mem_offset(mapping) else {
        return;
    };
    for heap in ShmemHeap::ALL {
        if has_field(rsp_mem_offset, heap.field()) {
            let _ = write_heap(mapping, heap, &state.heaps[heap as usize]);
        }
    }
}

fn gem_new(state: &mut HostState, g: &GemNewRequest) -> Vec<u8> {
    let res_id = state
        .blobs
        .values()
        .find(|b| b.blob_id == g.blob_id && !g.blob_id.is_control())
        .map(|b| (b.res_id, b.size));
    let Some((res_id, size)) = res_id else {
        raise_async_error(state, "GEM_NEW for unknown blob");
        return envelope(-ENOENT, CcmdRsp::SIZE_BYTES);
    };
    if g.alloc_size > size || g.vm_map_size > size {
        raise_async_error(state, "GEM_NEW larger than its blob");
        return envelope(-ENOMEM, CcmdRsp::SIZE_BYTES);
    }

    state.bos.insert(
        res_id,
        HostBo {
            alloc_size: g.alloc_size,
            phys_alignment: g.phys_alignment,
            preferred_heap: g.preferred_heap,
            alloc_flags: g.flags.bits(),
            metadata: AmdgpuBoMetadata::default(),
        },
    );
    if g.va != 0 {
        state.vas.insert(g.va, (res_id, g.vm_map_size));
    }
    let gtt = &mut state.heaps[ShmemHeap::Gtt as usize];
    gtt.heap_usage = gtt.heap_usage.saturating_add(g.alloc_size);
    publish_heaps(state);
    envelope(0, CcmdRsp::SIZE_BYTES)
}

fn assign_va(state: &mut HostState, va: &AssignVaRequest) -> Vec<u8> {
    if !state.bos.contains_key(&va.res_id) {
        return envelope(-ENOENT, CcmdRsp::SIZE_BYTES);
    }
    let end = match va.va.checked_add(va.vm_map_size) {
        Some(end) if va.vm_map_size != 0 => end,
        _ => return envelope(-EINVAL, CcmdRsp::SIZE_BYTES),
    };
    let overlapping: Vec<u64> = state
        .vas
        .range(..end)
        .filter(|(start, (_, size))| **start + *size > va.va)
        .map(|(start, _)| *start)
        .collect();

    let ret = match va.op {
        VaOp::Map => {
            if overlapping.is_empty() {
                state.vas.insert(va.va, (va.res_id, va.vm_map_size));
                0
            } else {
                -EINVAL
            }
        }
        VaOp::Unmap => match state.vas.get(&va.va) {
            Some((res, _)) if *res == va.res_id => {
                state.vas.remove(&va.va);
                0
            }
            _ => -ENOENT,
        },
        VaOp::Clear => {
            for start in overlapping {
                state.vas.remove(&start);
            }
            0
        }
        VaOp::Replace => {
            for start in overlapping {
                state.vas.remove(&start);
            }
            state.vas.insert(va.va, (va.res_id, va.vm_map_size));
            0
        }
    };
    envelope(ret, CcmdRsp::SIZE_BYTES)
}

fn set_metadata(state: &mut HostState, md: &SetMetadataRequest) -> Vec<u8> {
    let Some(bo) = state.bos.get_mut(&md.res_id) else {
        return envelope(-ENOENT, CcmdRsp::SIZE_BYTES);
    };
    let mut umd_metadata = [0u32; AMDGPU_UMD_METADATA_DWORDS];
    for (i, chunk) in md.umd_metadata.chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        umd_metadata[i] = u32::from_le_bytes(word);
    }
    bo.metadata = AmdgpuBoMetadata {
        flags: md.flags,
        tiling_info: md.tiling_info,
        size_metadata: md.umd_metadata.len() as u32,
        umd_metadata,
        pad: 0,
    };
    envelope(0, CcmdRsp::SIZE_BYTES)
}

fn bo_query_info(state: &HostState, res_id: ResourceId) -> Vec<u8> {
    let Some(bo) = state.bos.get(&res_id) else {
        return envelope(-ENOENT, CcmdRsp::SIZE_BYTES);
    };
    let rsp = CcmdBoQueryInfoRsp {
        hdr: CcmdRsp {
            ret: 0,
            len: CcmdBoQueryInfoRsp::SIZE_BYTES as u32,
        },
        pad: [0; 2],
        info: CcmdBoInfo {
            alloc_size: bo.alloc_size,
            phys_alignment: bo.phys_alignment,
            preferred_heap: bo.preferred_heap.bits(),
            pad: 0,
            alloc_flags: bo.alloc_flags,
            metadata: bo.metadata,
        },
    };
    encode_ccmd_bo_query_info_rsp_le(&rsp).to_vec()
}

fn create_ctx(state: &mut HostState, ctx: &CreateCtxRequest) -> Vec<u8> {
    match *ctx {
        CreateCtxRequest::Create { priority } => {
            let id = state.next_ctx_id;
            state.next_ctx_id += 1;
            state.contexts.insert(id, priority);
            let mut rsp = envelope(0, CcmdCreateCtxRsp::SIZE_BYTES);
            rsp.extend_from_slice(&id.to_le_bytes());
            rsp
        }
        CreateCtxRequest::Destroy { ctx_id } => {
            let ret = if state.contexts.remove(&ctx_id.get()).is_some() {
                0
            } else {
                -ENOENT
            };
            envelope(ret, CcmdRsp::SIZE_BYTES)
        }
    }
}

impl VirtGpuTransport for LoopbackTransport {
    fn page_size(&self) -> u64 {
        self.options.page_size
    }

    fn create_blob(&self, req: &CreateBlob<'_>) -> Result<BoHandle, TransportError> {
        self.fault(LoopbackFaults::CREATE_BLOB)?;
        let page_size = self.options.page_size;
        if req.size == 0 || req.size % page_size != 0 {
            return Err(TransportError::Rejected(format!(
                "blob size {:#x} is not page aligned",
                req.size
            )));
        }
        let len = usize::try_from(req.size)
            .map_err(|_| TransportError::Rejected(format!("blob size {:#x}", req.size)))?;
        let backing = HeapBacking::new(len, page_size as usize)
            .ok_or_else(|| TransportError::Rejected(format!("cannot allocate {len:#x} bytes")))?;

        let mut state = self.lock();
        if req.blob_id.is_control() && state.control.is_some() {
            return Err(TransportError::Rejected("control blob already exists".into()));
        }
        if !req.blob_id.is_control() && state.blobs.values().any(|b| b.blob_id == req.blob_id) {
            return Err(TransportError::Rejected(format!("{} already exists", req.blob_id)));
        }

        let handle = BoHandle(state.next_handle);
        state.next_handle += 1;
        let res_id = ResourceId(state.next_res_id);
        state.next_res_id += 1;
        let map_offset = state.next_map_offset;
        state.next_map_offset += req.size;

        if req.blob_id.is_control() {
            let region = HeapRegion::new(backing.clone(), len)
                .ok_or_else(|| TransportError::Rejected("control mapping".into()))?;
            let mapping = BlobMapping::new(Box::new(region));
            self.init_control_block(&mapping, &state.heaps);
            state.control = Some((handle, mapping));
        }

        state.blobs.insert(
            handle,
            HostBlob {
                blob_id: req.blob_id,
                res_id,
                size: req.size,
                map_offset,
                backing,
            },
        );
        state.by_map_offset.insert(map_offset, handle);
        tracing::debug!("loopback: created {} as {handle} ({res_id})", req.blob_id);

        if !req.cmd.is_empty() {
            if self.deferred.load(Ordering::Acquire) {
                state.pending.push_back(req.cmd.to_vec());
            } else {
                self.execute(&mut state, req.cmd);
            }
        }
        Ok(handle)
    }

    fn resource_info(&self, handle: BoHandle) -> Result<ResourceId, TransportError> {
        self.fault(LoopbackFaults::RESOURCE_INFO)?;
        self.lock()
            .blobs
            .get(&handle)
            .map(|b| b.res_id)
            .ok_or(TransportError::UnknownHandle(handle))
    }

    fn map_offset(&self, handle: BoHandle) -> Result<u64, TransportError> {
        self.fault(LoopbackFaults::MAP_OFFSET)?;
        self.lock()
            .blobs
            .get(&handle)
            .map(|b| b.map_offset)
            .ok_or(TransportError::UnknownHandle(handle))
    }

    fn mmap(&self, offset: u64, size: u64) -> Result<BlobMapping, TransportError> {
        self.fault(LoopbackFaults::MMAP)?;
        let state = self.lock();
        let blob = state
            .by_map_offset
            .get(&offset)
            .and_then(|h| state.blobs.get(h))
            .ok_or(TransportError::UnknownMapOffset(offset))?;
        let len = usize::try_from(size)
            .ok()
            .filter(|_| size <= blob.size)
            .ok_or_else(|| TransportError::Rejected(format!("mapping of {size:#x} bytes exceeds blob")))?;
        let region = HeapRegion::new(blob.backing.clone(), len)
            .ok_or_else(|| TransportError::Rejected(format!("mapping of {size:#x} bytes exceeds blob")))?;
        Ok(BlobMapping::new(Box::new(region)))
    }

    fn submit(&self, cmd: &[u8], _ring_idx: u32) -> Result<(), TransportError> {
        self.fault(LoopbackFaults::SUBMIT)?;
        let mut state = self.lock();
        if self.deferred.load(Ordering::Acquire) {
            state.pending.push_back(cmd.to_vec());
        } else {
            self.execute(&mut state, cmd);
        }
        Ok(())
    }

    fn close(&self, handle: BoHandle) -> Result<(), TransportError> {
        self.fault(LoopbackFaults::CLOSE)?;
        let mut state = self.lock();
        let blob = state
            .blobs
            .remove(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        state.by_map_offset.remove(&blob.map_offset);
        if let Some(bo) = state.bos.remove(&blob.res_id) {
            let gtt = &mut state.heaps[ShmemHeap::Gtt as usize];
            gtt.heap_usage = gtt.heap_usage.saturating_sub(bo.alloc_size);
            publish_heaps(&state);
        }
        state.vas.retain(|_, (res, _)| *res != blob.res_id);
        if matches!(&state.control, Some((h, _)) if *h == handle) {
            state.control = None;
        }
        tracing::debug!("loopback: closed {handle}");
        Ok(())
    }
}
