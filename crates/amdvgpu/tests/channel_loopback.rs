use std::sync::Arc;

use amdvgpu::{
    BlobAllocation, Channel, ChannelConfig, ChannelError, LoopbackFaults, LoopbackOptions,
    LoopbackTransport, MapError, VirtGpuTransport,
};
use amdvgpu_proto::amdgpu_ccmd::CcmdOpcode;
use amdvgpu_proto::amdgpu_drm::{
    CsChunkId, GemCreateFlags, GemDomain, VaOp, AMDGPU_CTX_PRIORITY_NORMAL,
};
use amdvgpu_proto::amdvgpu_shmem::{ShmemField, ShmemHeap};
use amdvgpu_proto::{
    AssignVaRequest, CcmdRequest, ContextId, CsChunk, CsSubmitRequest, DrmInfoQuery,
    QueryInfoRequest, SeqNo, SetMetadataRequest,
};
use pretty_assertions::assert_eq;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_with(options: LoopbackOptions) -> (Arc<LoopbackTransport>, Channel) {
    init_tracing();
    let host = Arc::new(LoopbackTransport::new(options));
    let transport: Arc<dyn VirtGpuTransport> = host.clone();
    let channel = Channel::open(transport, &ChannelConfig::default()).unwrap();
    (host, channel)
}

fn open() -> (Arc<LoopbackTransport>, Channel) {
    open_with(LoopbackOptions::default())
}

fn create_context(channel: &Channel) -> ContextId {
    let pending = channel.create_context(AMDGPU_CTX_PRIORITY_NORMAL).unwrap();
    let rsp = channel.poll(&pending).unwrap().unwrap();
    rsp.check(CcmdOpcode::CreateCtx).unwrap().context_id().unwrap()
}

fn ib_chunk() -> CsChunk {
    CsChunk {
        chunk_id: CsChunkId::Ib as u32,
        data: vec![0; 32],
    }
}

#[test]
fn nop_round_trip() {
    let (host, channel) = open();
    let pending = channel.nop().unwrap();
    assert_eq!(pending.seqno(), SeqNo(1));
    assert_eq!(pending.opcode(), CcmdOpcode::Nop);

    let rsp = channel.poll(&pending).unwrap().unwrap();
    assert_eq!(rsp.ret(), 0);
    assert_eq!(rsp.len(), 8);
    assert_eq!(host.executed(), vec![CcmdOpcode::Nop]);
    assert_eq!(
        channel.control_block().unwrap().last_processed_sequence().unwrap(),
        SeqNo(1)
    );

    assert!(matches!(
        channel.poll(&pending),
        Err(ChannelError::ResponseConsumed(SeqNo(1)))
    ));
}

#[test]
fn sequence_numbers_strictly_increase() {
    let (_host, channel) = open();
    let mut last = SeqNo(0);
    for i in 0..32 {
        let pending = if i % 5 == 4 {
            channel.query_info(QueryInfoRequest::Address32Hi).unwrap()
        } else {
            channel.nop().unwrap()
        };
        assert!(pending.seqno() > last, "{} after {}", pending.seqno(), last);
        last = pending.seqno();
        if i % 3 == 0 {
            // Blob creation consumes a sequence number too.
            let _blob = channel.allocate_blob(&BlobAllocation::new(0x1000)).unwrap();
        }
        channel.poll(&pending).unwrap().unwrap();
    }
}

#[test]
fn context_create_and_destroy() {
    let (host, channel) = open();
    let ctx = create_context(&channel);
    assert_eq!(ctx, ContextId(1));
    assert_eq!(host.context_count(), 1);

    let pending = channel.destroy_context(ctx).unwrap();
    let rsp = channel.poll(&pending).unwrap().unwrap();
    assert_eq!(rsp.len(), 8);
    rsp.check(CcmdOpcode::CreateCtx).unwrap();
    assert_eq!(host.context_count(), 0);

    let pending = channel.destroy_context(ctx).unwrap();
    let rsp = channel.poll(&pending).unwrap().unwrap();
    assert!(matches!(
        rsp.check(CcmdOpcode::CreateCtx),
        Err(ChannelError::HostError {
            opcode: CcmdOpcode::CreateCtx,
            ret
        }) if ret < 0
    ));
}

#[test]
fn query_info_payloads() {
    let (_host, channel) = open();
    let query = |q: QueryInfoRequest| {
        let pending = channel.query_info(q).unwrap();
        channel.poll(&pending).unwrap().unwrap()
    };

    let rsp = query(QueryInfoRequest::MarketingName);
    assert_eq!(rsp.payload(), &b"AMD Radeon Loopback\0"[..]);

    let rsp = query(QueryInfoRequest::Address32Hi);
    assert_eq!(rsp.payload(), &0xFFFFu32.to_le_bytes()[..]);

    let rsp = query(QueryInfoRequest::BufferSizeAlignment);
    assert_eq!(rsp.payload().len(), 16);
    assert_eq!(&rsp.payload()[..8], &4096u64.to_le_bytes()[..]);

    let rsp = query(QueryInfoRequest::GpuInfo);
    assert_eq!(&rsp.payload()[..4], &0x73BFu32.to_le_bytes()[..]);

    let rsp = query(QueryInfoRequest::Info(DrmInfoQuery {
        return_pointer: 0,
        return_size: 16,
        query: 0x19,
        args: [0; 16],
    }));
    let expected: Vec<u8> = (0..16u8).map(|i| 0x19 + i).collect();
    assert_eq!(rsp.payload(), &expected[..]);

    let rsp = query(QueryInfoRequest::ReserveVmid(5));
    assert_eq!(rsp.ret(), -22);
    assert!(rsp.payload().is_empty());
}

#[test]
fn set_pstate_needs_a_context() {
    let (_host, channel) = open();
    let ctx = create_context(&channel);

    let pending = channel
        .query_info(QueryInfoRequest::SetPstate {
            ctx_id: ctx,
            op: 1,
            flags: 0,
        })
        .unwrap();
    let rsp = channel.poll(&pending).unwrap().unwrap();
    assert_eq!(rsp.ret(), 0);
    assert_eq!(rsp.payload().len(), 4);

    let pending = channel
        .query_info(QueryInfoRequest::SetPstate {
            ctx_id: ContextId(77),
            op: 1,
            flags: 0,
        })
        .unwrap();
    assert_eq!(channel.poll(&pending).unwrap().unwrap().ret(), -22);
}

#[test]
fn allocated_blob_is_known_to_host() {
    let (_host, channel) = open();
    let mut blob = channel.allocate_blob(&BlobAllocation::new(0x4000)).unwrap();
    let res_id = blob.resolve().unwrap();
    blob.map().unwrap();

    let pending = channel.bo_query_info(res_id).unwrap();
    let rsp = channel.poll(&pending).unwrap().unwrap();
    assert_eq!(rsp.len(), 328);
    let info = rsp.bo_info().unwrap();
    let (alloc_size, preferred_heap) = (info.alloc_size, info.preferred_heap);
    assert_eq!(alloc_size, 0x4000);
    assert_eq!(preferred_heap, GemDomain::GTT.bits());

    let cb = channel.control_block().unwrap();
    let usage = cb.heap_info(ShmemHeap::Gtt).unwrap().heap_usage;
    assert_eq!(usage, 0x4000);

    drop(blob);
    let usage = cb.heap_info(ShmemHeap::Gtt).unwrap().heap_usage;
    assert_eq!(usage, 0);
}

#[test]
fn metadata_round_trips_through_host() {
    let (_host, channel) = open();
    let mut blob = channel.allocate_blob(&BlobAllocation::new(0x1000)).unwrap();
    let res_id = blob.resolve().unwrap();

    let pending = channel
        .set_metadata(SetMetadataRequest {
            res_id,
            flags: 1,
            tiling_info: 0x20,
            umd_metadata: vec![1, 2, 3, 4, 5, 6],
        })
        .unwrap();
    channel
        .poll(&pending)
        .unwrap()
        .unwrap()
        .check(CcmdOpcode::SetMetadata)
        .unwrap();

    let pending = channel.bo_query_info(res_id).unwrap();
    let info = channel.poll(&pending).unwrap().unwrap().bo_info().unwrap();
    let metadata = info.metadata;
    let (flags, tiling_info, size_metadata) =
        (metadata.flags, metadata.tiling_info, metadata.size_metadata);
    assert_eq!(flags, 1);
    assert_eq!(tiling_info, 0x20);
    assert_eq!(size_metadata, 6);
    assert_eq!(metadata.umd_metadata_bytes(), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn unknown_resource_reports_error() {
    let (_host, channel) = open();
    let pending = channel.bo_query_info(amdvgpu_proto::ResourceId(999)).unwrap();
    let rsp = channel.poll(&pending).unwrap().unwrap();
    assert_eq!(rsp.len(), 8);
    assert!(rsp.ret() < 0);
}

#[test]
fn assign_va_tracks_mappings() {
    let (host, channel) = open();
    let mut blob = channel.allocate_blob(&BlobAllocation::new(0x4000)).unwrap();
    let res_id = blob.resolve().unwrap();
    let va = |op: VaOp, va: u64| AssignVaRequest {
        va,
        vm_map_size: 0x4000,
        offset: 0,
        res_id,
        op,
        is_sparse_bo: false,
    };
    let ret = |req: AssignVaRequest| {
        let pending = channel.assign_va(req).unwrap();
        channel.poll(&pending).unwrap().unwrap().ret()
    };

    assert_eq!(ret(va(VaOp::Map, 0x10_0000)), 0);
    assert_eq!(host.va_mapping(0x10_0000), Some((res_id, 0x4000)));
    assert!(ret(va(VaOp::Map, 0x10_2000)) < 0);
    assert_eq!(ret(va(VaOp::Replace, 0x10_2000)), 0);
    assert_eq!(host.va_mapping(0x10_0000), None);
    assert_eq!(ret(va(VaOp::Unmap, 0x10_2000)), 0);
    assert_eq!(host.va_mapping(0x10_2000), None);
}

#[test]
fn command_stream_on_live_context() {
    let (_host, channel) = open();
    let ctx = create_context(&channel);
    let pending = channel
        .submit_command_stream(CsSubmitRequest {
            ctx_id: ctx,
            bo_number: 0,
            ring_idx: 1,
            chunks: vec![ib_chunk()],
        })
        .unwrap();
    let rsp = channel.poll(&pending).unwrap().unwrap();
    assert_eq!(rsp.ret(), 0);
    assert!(!channel.is_lost());
}

#[test]
fn async_error_after_cs_submit_loses_channel() {
    let (host, channel) = open();
    let earlier = channel.nop().unwrap();

    let bad = channel
        .submit_command_stream(CsSubmitRequest {
            ctx_id: ContextId(42),
            chunks: vec![ib_chunk()],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(
        channel.control_block().unwrap().async_error_count().unwrap(),
        1
    );

    assert!(matches!(
        channel.poll(&earlier),
        Err(ChannelError::AsyncContextLost)
    ));
    assert!(matches!(
        channel.poll(&bad),
        Err(ChannelError::AsyncContextLost)
    ));
    assert!(matches!(channel.nop(), Err(ChannelError::AsyncContextLost)));
    assert!(matches!(
        channel.allocate_blob(&BlobAllocation::new(0x1000)),
        Err(ChannelError::AsyncContextLost)
    ));
    assert!(channel.is_lost());
    assert_eq!(host.live_blob_count(), 1);
}

#[test]
fn injected_async_error_is_permanent() {
    let (host, channel) = open();
    host.inject_async_error();
    assert!(matches!(channel.nop(), Err(ChannelError::AsyncContextLost)));
    assert!(matches!(channel.nop(), Err(ChannelError::AsyncContextLost)));
}

#[test]
fn overlapping_response_offsets_are_rejected() {
    let (host, channel) = open();
    host.set_deferred(true);

    let first = channel.issue_at(&CcmdRequest::Nop, 64).unwrap();
    assert_eq!(first.rsp_off(), 64);
    assert!(matches!(
        channel.issue_at(&CcmdRequest::Nop, 68),
        Err(ChannelError::ResponseSlotBusy { rsp_off: 68 })
    ));
    assert!(matches!(
        channel.issue_at(&CcmdRequest::Nop, 60),
        Err(ChannelError::ResponseSlotBusy { rsp_off: 60 })
    ));
    // The first bytes of the region belong to piggybacked responses.
    assert!(matches!(
        channel.issue_at(&CcmdRequest::Nop, 0),
        Err(ChannelError::ResponseSlotBusy { rsp_off: 0 })
    ));
    let second = channel.issue_at(&CcmdRequest::Nop, 72).unwrap();

    let region_len = channel.control_block().unwrap().response_region_len() as u32;
    assert!(matches!(
        channel.issue_at(&CcmdRequest::Nop, region_len - 4),
        Err(ChannelError::MalformedRequest(_))
    ));

    assert_eq!(host.process_pending(), 2);
    channel.poll(&first).unwrap().unwrap();
    channel.poll(&second).unwrap().unwrap();
    let _third = channel.issue_at(&CcmdRequest::Nop, 68).unwrap();
}

#[test]
fn deferred_host_keeps_requests_in_flight() {
    let (host, channel) = open();
    host.set_deferred(true);

    let pending = channel.nop().unwrap();
    assert_eq!(host.pending_count(), 1);
    assert_eq!(channel.poll(&pending).unwrap(), None);
    assert_eq!(channel.poll(&pending).unwrap(), None);

    assert_eq!(host.process_pending(), 1);
    assert_eq!(channel.poll(&pending).unwrap().unwrap().ret(), 0);
}

#[test]
fn response_region_fills_up_and_slots_are_reused() {
    let (host, channel) = open();
    host.set_deferred(true);

    let mut pending = Vec::new();
    let err = loop {
        match channel.nop() {
            Ok(p) => pending.push(p),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, ChannelError::ResponseRegionFull { needed: 8 }));
    assert_eq!(pending.len(), (0x4000 - 88 - 8) / 8);

    let freed = pending.remove(10);
    let rsp_off = freed.rsp_off();
    channel.discard(freed);
    // The host has not processed the discarded request yet, so its slot stays taken.
    assert!(matches!(
        channel.nop(),
        Err(ChannelError::ResponseRegionFull { needed: 8 })
    ));

    host.process_pending();
    let reused = channel.nop().unwrap();
    assert_eq!(reused.rsp_off(), rsp_off);
}

#[test]
fn dropped_responses_do_not_exhaust_the_region() {
    let (_host, channel) = open();
    let capacity = (0x4000 - 88 - 8) / 8;
    for _ in 0..3 * capacity {
        drop(channel.nop().unwrap());
    }

    let pending = channel.nop().unwrap();
    assert_eq!(pending.seqno(), SeqNo(3 * capacity as u32 + 1));
    assert_eq!(channel.poll(&pending).unwrap().unwrap().ret(), 0);
}

#[test]
fn dropped_response_slot_is_reused_by_issue_at() {
    let (host, channel) = open();
    host.set_deferred(true);
    let first = channel.issue_at(&CcmdRequest::Nop, 64).unwrap();
    drop(first);
    assert!(matches!(
        channel.issue_at(&CcmdRequest::Nop, 64),
        Err(ChannelError::ResponseSlotBusy { rsp_off: 64 })
    ));

    host.process_pending();
    let second = channel.issue_at(&CcmdRequest::Nop, 64).unwrap();
    host.process_pending();
    assert_eq!(channel.poll(&second).unwrap().unwrap().ret(), 0);
}

#[test]
fn lost_channel_takes_its_blobs_down() {
    let (host, channel) = open();
    let mut mapped = channel.allocate_blob(&BlobAllocation::new(0x1000)).unwrap();
    mapped.map().unwrap();
    let mut fresh = channel.allocate_blob(&BlobAllocation::new(0x1000)).unwrap();
    let fresh_id = fresh.blob_id();
    assert_eq!(host.live_blob_count(), 3);

    host.inject_async_error();
    assert!(matches!(channel.nop(), Err(ChannelError::AsyncContextLost)));

    assert!(matches!(
        fresh.resolve(),
        Err(ChannelError::AsyncContextLost)
    ));
    assert!(matches!(
        fresh.map(),
        Err(MapError::ChannelLost(id)) if id == fresh_id
    ));
    assert!(matches!(
        mapped.map(),
        Err(MapError::ChannelLost(_))
    ));

    fresh.release();
    mapped.release();
    assert_eq!(host.live_blob_count(), 1);
    assert!(channel.control_block().is_ok());
}

#[test]
fn extra_gem_flags_reach_the_host() {
    init_tracing();
    let host = Arc::new(LoopbackTransport::default());
    let transport: Arc<dyn VirtGpuTransport> = host.clone();
    let config = ChannelConfig {
        extra_gem_flags: GemCreateFlags::from_bits_retain(1 << 12),
        ..Default::default()
    };
    let channel = Channel::open(transport, &config).unwrap();

    let alloc = BlobAllocation {
        flags: GemCreateFlags::CPU_ACCESS_REQUIRED,
        ..BlobAllocation::new(0x1000)
    };
    let mut blob = channel.allocate_blob(&alloc).unwrap();
    let res_id = blob.resolve().unwrap();
    let pending = channel.bo_query_info(res_id).unwrap();
    let info = channel.poll(&pending).unwrap().unwrap().bo_info().unwrap();
    let alloc_flags = info.alloc_flags;
    assert_eq!(alloc_flags, (1 << 12) | 1);
}

#[test]
fn cs_submit_with_unknown_chunk_loses_channel() {
    let (_host, channel) = open();
    let ctx = create_context(&channel);
    let _pending = channel
        .submit_command_stream(CsSubmitRequest {
            ctx_id: ctx,
            chunks: vec![CsChunk {
                chunk_id: 0x7f,
                data: vec![0; 8],
            }],
            ..Default::default()
        })
        .unwrap();
    assert!(matches!(channel.nop(), Err(ChannelError::AsyncContextLost)));
}

#[test]
fn failed_submit_frees_the_slot() {
    let (host, channel) = open();
    host.set_faults(LoopbackFaults::SUBMIT);
    assert!(matches!(channel.nop(), Err(ChannelError::Transport(_))));
    host.set_faults(LoopbackFaults::empty());

    let pending = channel.nop().unwrap();
    assert_eq!(pending.rsp_off(), 8);
    // The failed attempt still consumed a sequence number.
    assert_eq!(pending.seqno(), SeqNo(2));
}

#[test]
fn old_host_without_async_error_or_heaps() {
    let (host, channel) = open_with(LoopbackOptions {
        rsp_mem_offset: 8,
        ..Default::default()
    });
    let cb = channel.control_block().unwrap();
    assert!(!cb.has_field(ShmemField::AsyncError));
    assert!(matches!(
        cb.async_error_count(),
        Err(ChannelError::UnsupportedField(ShmemField::AsyncError))
    ));
    assert!(matches!(
        cb.heap_snapshot(),
        Err(ChannelError::UnsupportedField(ShmemField::HeapInfoGtt))
    ));

    // Without the counter, failures are only visible in `ret`.
    let pending = channel
        .submit_command_stream(CsSubmitRequest {
            ctx_id: ContextId(42),
            chunks: vec![ib_chunk()],
            ..Default::default()
        })
        .unwrap();
    assert!(channel.poll(&pending).unwrap().unwrap().ret() < 0);
    host.inject_async_error();
    channel.poll(&channel.nop().unwrap()).unwrap().unwrap();
}

#[test]
fn partial_heap_table() {
    let (_host, channel) = open_with(LoopbackOptions {
        rsp_mem_offset: 40,
        ..Default::default()
    });
    let cb = channel.control_block().unwrap();
    let gtt = cb.heap_info(ShmemHeap::Gtt).unwrap();
    assert_eq!(gtt, LoopbackOptions::default().heaps[0]);
    assert!(matches!(
        cb.heap_info(ShmemHeap::Vram),
        Err(ChannelError::UnsupportedField(ShmemField::HeapInfoVram))
    ));
}

#[test]
fn full_heap_snapshot() {
    let (_host, channel) = open();
    let snapshot = channel.control_block().unwrap().heap_snapshot().unwrap();
    let heaps = LoopbackOptions::default().heaps;
    assert_eq!(snapshot.gtt, heaps[0]);
    assert_eq!(snapshot.vram, heaps[1]);
    assert_eq!(snapshot.vis_vram, heaps[2]);
}

#[test]
fn open_rejects_bad_control_block() {
    let host = Arc::new(LoopbackTransport::new(LoopbackOptions {
        rsp_mem_offset: 4,
        ..Default::default()
    }));
    let err = Channel::open(host, &ChannelConfig::default()).unwrap_err();
    assert!(matches!(err, ChannelError::ProtocolMismatch(_)));
}

#[test]
fn open_surfaces_allocation_failure() {
    let host = Arc::new(LoopbackTransport::default());
    host.set_faults(LoopbackFaults::CREATE_BLOB);
    let transport: Arc<dyn VirtGpuTransport> = host.clone();
    let err = Channel::open(transport, &ChannelConfig::default()).unwrap_err();
    assert!(matches!(err, ChannelError::AllocationError(_)));
}

#[test]
fn channel_is_shareable_across_threads() {
    let (_host, channel) = open();
    let mut seqnos: Vec<SeqNo> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    (0..16)
                        .map(|_| {
                            let pending = channel.nop().unwrap();
                            assert!(channel.poll(&pending).unwrap().is_some());
                            pending.seqno()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    seqnos.sort();
    seqnos.dedup();
    assert_eq!(seqnos.len(), 64);
}
