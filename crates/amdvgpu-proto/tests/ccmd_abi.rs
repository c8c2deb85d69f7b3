use core::mem::{offset_of, size_of};

use amdvgpu_proto::amdgpu_ccmd::{
    decode_ccmd_bo_query_info_rsp_le, decode_ccmd_create_ctx_rsp_le, decode_ccmd_cs_chunks,
    decode_ccmd_cs_submit_req_le, decode_ccmd_gem_new_req_le, decode_ccmd_query_info_rsp_le,
    decode_ccmd_req_le, decode_ccmd_rsp_le, decode_ccmd_set_metadata_req_le,
    encode_ccmd_bo_query_info_rsp_le, AmdgpuBoMetadata, CcmdAssignVaReq, CcmdBoInfo,
    CcmdBoQueryInfoReq, CcmdBoQueryInfoRsp, CcmdCreateCtxReq, CcmdCreateCtxRsp, CcmdCsSubmitReq,
    CcmdDecodeError, CcmdGemNewReq, CcmdOpcode, CcmdQueryInfoReq, CcmdReq, CcmdRsp,
    CcmdSetMetadataReq, AMDGPU_UMD_METADATA_DWORDS,
};
use amdvgpu_proto::amdgpu_drm::{GemCreateFlags, GemDomain, VmPageFlags};
use amdvgpu_proto::{
    BlobId, CcmdRequest, ContextId, CsChunk, CsSubmitRequest, GemNewRequest, ResourceId, SeqNo,
    SetMetadataRequest,
};
use pretty_assertions::assert_eq;

#[test]
fn record_sizes_match_the_c_layout() {
    let sizes = [
        ("req", size_of::<CcmdReq>(), 16),
        ("rsp", size_of::<CcmdRsp>(), 8),
        ("query_info_req", size_of::<CcmdQueryInfoReq>(), 56),
        ("gem_new_req", size_of::<CcmdGemNewReq>(), 80),
        ("assign_va_req", size_of::<CcmdAssignVaReq>(), 56),
        ("cs_submit_req", size_of::<CcmdCsSubmitReq>(), 32),
        ("set_metadata_req", size_of::<CcmdSetMetadataReq>(), 40),
        ("bo_query_info_req", size_of::<CcmdBoQueryInfoReq>(), 20),
        ("bo_query_info_rsp", size_of::<CcmdBoQueryInfoRsp>(), 328),
        ("create_ctx_req", size_of::<CcmdCreateCtxReq>(), 24),
        ("create_ctx_rsp", size_of::<CcmdCreateCtxRsp>(), 12),
    ];
    for (name, got, want) in sizes {
        assert_eq!((name, got), (name, want));
    }
}

#[test]
fn field_offsets_match_the_c_layout() {
    assert_eq!(offset_of!(CcmdReq, seqno), 8);
    assert_eq!(offset_of!(CcmdReq, rsp_off), 12);
    assert_eq!(offset_of!(CcmdQueryInfoReq, type_), 48);
    assert_eq!(offset_of!(CcmdGemNewReq, pad), 32);
    assert_eq!(offset_of!(CcmdGemNewReq, vm_map_size), 40);
    assert_eq!(offset_of!(CcmdGemNewReq, r), 48);
    assert_eq!(offset_of!(CcmdAssignVaReq, offset), 32);
    assert_eq!(offset_of!(CcmdAssignVaReq, is_sparse_bo), 48);
    assert_eq!(offset_of!(CcmdCsSubmitReq, ring_idx), 28);
    assert_eq!(offset_of!(CcmdSetMetadataReq, size_metadata), 36);
    assert_eq!(offset_of!(CcmdBoQueryInfoRsp, info), 16);
    assert_eq!(offset_of!(CcmdBoInfo, preferred_heap), 16);
    assert_eq!(offset_of!(CcmdBoInfo, alloc_flags), 24);
    assert_eq!(offset_of!(CcmdBoInfo, metadata), 32);
    assert_eq!(offset_of!(AmdgpuBoMetadata, umd_metadata), 20);
    assert_eq!(offset_of!(CcmdCreateCtxReq, create), 20);
    assert_eq!(offset_of!(CcmdCreateCtxRsp, ctx_id), 8);
}

#[test]
fn gem_new_encodes_every_field_at_its_offset() {
    let req = CcmdRequest::GemNew(GemNewRequest {
        blob_id: BlobId(5),
        va: 0x1_0000_0000,
        vm_flags: VmPageFlags::READABLE | VmPageFlags::WRITEABLE,
        vm_map_size: 0x4000,
        alloc_size: 0x4000,
        phys_alignment: 0x1000,
        preferred_heap: GemDomain::GTT,
        flags: GemCreateFlags::CPU_ACCESS_REQUIRED,
    });
    let bytes = req.encode_le(SeqNo(9), 0x40).unwrap();
    assert_eq!(bytes.len(), 80);

    let raw = decode_ccmd_gem_new_req_le(&bytes).unwrap();
    let hdr = raw.hdr;
    let r = raw.r;
    assert_eq!(
        (hdr.cmd, hdr.len, hdr.seqno, hdr.rsp_off),
        (CcmdOpcode::GemNew as u32, 80, 9, 0x40)
    );
    assert_eq!((raw.blob_id, raw.va, raw.vm_flags), (5, 0x1_0000_0000, 0b110));
    assert_eq!(
        (r.alloc_size, r.phys_alignment, r.preferred_heap, r.flags),
        (0x4000, 0x1000, 2, 1)
    );
}

#[test]
fn cs_submit_chunks_are_split_by_offsets() {
    let req = CcmdRequest::CsSubmit(CsSubmitRequest {
        ctx_id: ContextId(3),
        bo_number: 0,
        ring_idx: 1,
        chunks: vec![
            CsChunk {
                chunk_id: 1,
                data: vec![0xAA; 12],
            },
            CsChunk {
                chunk_id: 2,
                data: vec![],
            },
            CsChunk {
                chunk_id: 6,
                data: vec![0xBB; 5],
            },
        ],
    });
    let bytes = req.encode_le(SeqNo(1), 0).unwrap();
    assert_eq!(bytes.len(), 32 + 3 * 8 + 17);

    let (hdr, trailer) = decode_ccmd_cs_submit_req_le(&bytes).unwrap();
    let chunks = decode_ccmd_cs_chunks(&hdr, trailer).unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0], (1, &[0xAA; 12][..]));
    assert_eq!(chunks[1], (2, &[][..]));
    assert_eq!(chunks[2], (6, &[0xBB; 5][..]));
}

#[test]
fn cs_submit_rejects_decreasing_offsets() {
    let mut bytes = CcmdRequest::CsSubmit(CsSubmitRequest {
        ctx_id: ContextId(1),
        chunks: vec![
            CsChunk {
                chunk_id: 1,
                data: vec![1; 8],
            },
            CsChunk {
                chunk_id: 2,
                data: vec![2; 8],
            },
        ],
        ..Default::default()
    })
    .encode_le(SeqNo(1), 0)
    .unwrap();

    // First descriptor offset now points past the second one.
    bytes[32 + 4..32 + 8].copy_from_slice(&12u32.to_le_bytes());
    let (hdr, trailer) = decode_ccmd_cs_submit_req_le(&bytes).unwrap();
    assert!(matches!(
        decode_ccmd_cs_chunks(&hdr, trailer),
        Err(CcmdDecodeError::BadChunkOffset { .. })
    ));
}

#[test]
fn cs_submit_rejects_descriptor_array_past_len() {
    let mut bytes = CcmdRequest::CsSubmit(CsSubmitRequest::default())
        .encode_le(SeqNo(1), 0)
        .unwrap();
    bytes[20..24].copy_from_slice(&4u32.to_le_bytes());
    assert_eq!(
        decode_ccmd_cs_submit_req_le(&bytes).unwrap_err(),
        CcmdDecodeError::PayloadSizeMismatch {
            expected: 32 + 4 * 8,
            found: 32
        }
    );
}

#[test]
fn set_metadata_trailer_must_match_size_metadata() {
    let mut bytes = CcmdRequest::SetMetadata(SetMetadataRequest {
        res_id: ResourceId(4),
        flags: 1,
        tiling_info: 2,
        umd_metadata: vec![7; 8],
    })
    .encode_le(SeqNo(2), 0)
    .unwrap();

    let (hdr, md) = decode_ccmd_set_metadata_req_le(&bytes).unwrap();
    let size_metadata = hdr.size_metadata;
    assert_eq!(size_metadata, 8);
    assert_eq!(md, &[7; 8][..]);

    bytes[36..40].copy_from_slice(&12u32.to_le_bytes());
    assert_eq!(
        decode_ccmd_set_metadata_req_le(&bytes).unwrap_err(),
        CcmdDecodeError::PayloadSizeMismatch {
            expected: 52,
            found: 48
        }
    );

    bytes[36..40].copy_from_slice(&300u32.to_le_bytes());
    assert_eq!(
        decode_ccmd_set_metadata_req_le(&bytes).unwrap_err(),
        CcmdDecodeError::MetadataTooLarge { found: 300 }
    );
}

#[test]
fn envelope_rejects_short_buffers_and_bad_len() {
    let bytes = CcmdRequest::BoQueryInfo {
        res_id: ResourceId(1),
    }
    .encode_le(SeqNo(1), 0)
    .unwrap();

    assert_eq!(
        decode_ccmd_req_le(&bytes[..12]).unwrap_err(),
        CcmdDecodeError::BufferTooSmall
    );
    assert_eq!(
        decode_ccmd_req_le(&bytes[..19]).unwrap_err(),
        CcmdDecodeError::BufferTooSmall
    );

    let mut bad = bytes.clone();
    bad[4..8].copy_from_slice(&4u32.to_le_bytes());
    assert_eq!(
        decode_ccmd_req_le(&bad).unwrap_err(),
        CcmdDecodeError::BadLen { found: 4 }
    );
}

#[test]
fn response_envelope_decodes_negative_ret() {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&(-22i32).to_le_bytes());
    buf[4..8].copy_from_slice(&8u32.to_le_bytes());
    let rsp = decode_ccmd_rsp_le(&buf).unwrap();
    let (ret, len) = (rsp.ret, rsp.len);
    assert_eq!((ret, len), (-22, 8));

    buf[4..8].copy_from_slice(&4u32.to_le_bytes());
    assert_eq!(
        decode_ccmd_rsp_le(&buf).unwrap_err(),
        CcmdDecodeError::BadLen { found: 4 }
    );
}

#[test]
fn create_ctx_response_carries_context_id() {
    let mut buf = [0u8; 12];
    buf[4..8].copy_from_slice(&12u32.to_le_bytes());
    buf[8..12].copy_from_slice(&77u32.to_le_bytes());
    let rsp = decode_ccmd_create_ctx_rsp_le(&buf).unwrap();
    let ctx_id = rsp.ctx_id;
    assert_eq!(ctx_id, 77);

    assert!(matches!(
        decode_ccmd_create_ctx_rsp_le(&buf[..8]),
        Err(CcmdDecodeError::PayloadSizeMismatch { expected: 12, .. })
    ));
}

#[test]
fn bo_query_info_response_round_trips_through_the_encoder() {
    let mut umd_metadata = [0u32; AMDGPU_UMD_METADATA_DWORDS];
    umd_metadata[0] = 0x1122_3344;
    umd_metadata[63] = 0xFFEE_DDCC;
    let rsp = CcmdBoQueryInfoRsp {
        hdr: CcmdRsp {
            ret: 0,
            len: CcmdBoQueryInfoRsp::SIZE_BYTES as u32,
        },
        pad: [0; 2],
        info: CcmdBoInfo {
            alloc_size: 0x8000,
            phys_alignment: 0x1000,
            preferred_heap: GemDomain::GTT.bits(),
            pad: 0,
            alloc_flags: 3,
            metadata: AmdgpuBoMetadata {
                flags: 9,
                tiling_info: 10,
                size_metadata: 256,
                umd_metadata,
                pad: 0,
            },
        },
    };

    let bytes = encode_ccmd_bo_query_info_rsp_le(&rsp);
    assert_eq!(&bytes[16..24], &0x8000u64.to_le_bytes());
    assert_eq!(&bytes[16 + 52..16 + 56], &0x1122_3344u32.to_le_bytes());
    assert_eq!(decode_ccmd_bo_query_info_rsp_le(&bytes).unwrap(), rsp);
}

#[test]
fn query_info_response_payload_is_bounded_by_len() {
    let mut buf = vec![0u8; 32];
    buf[4..8].copy_from_slice(&12u32.to_le_bytes());
    buf[8..12].copy_from_slice(&[1, 2, 3, 4]);
    let (_, payload) = decode_ccmd_query_info_rsp_le(&buf).unwrap();
    assert_eq!(payload, &[1, 2, 3, 4][..]);

    buf[4..8].copy_from_slice(&64u32.to_le_bytes());
    assert_eq!(
        decode_ccmd_query_info_rsp_le(&buf).unwrap_err(),
        CcmdDecodeError::BufferTooSmall
    );
}
