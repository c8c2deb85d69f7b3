//! Typed ccmd requests.
//!
//! [`CcmdRequest`] is the owned, validated form of one request record. It encodes to the exact
//! wire layout of [`crate::amdgpu_ccmd`] and decodes back; reserved and padding bytes are always
//! zero on encode and must be zero on decode, so `encode(decode(bytes)) == bytes` for every record
//! that decodes.

use core::mem::offset_of;

use crate::amdgpu_ccmd::{
    decode_ccmd_assign_va_req_le, decode_ccmd_bo_query_info_req_le, decode_ccmd_create_ctx_req_le,
    decode_ccmd_cs_chunks, decode_ccmd_cs_submit_req_le, decode_ccmd_gem_new_req_le,
    decode_ccmd_nop_req_le, decode_ccmd_query_info_req_le, decode_ccmd_req_le,
    decode_ccmd_set_metadata_req_le, le_i32, le_u32, le_u64, write_u32_at, write_u64_at,
    CcmdAssignVaReq, CcmdBoAllocRequest, CcmdBoQueryInfoReq, CcmdBoQueryInfoRsp,
    CcmdCreateCtxReq, CcmdCreateCtxRsp, CcmdCsChunkDesc, CcmdCsSubmitReq, CcmdDecodeError,
    CcmdGemNewReq, CcmdOpcode, CcmdQueryInfoReq, CcmdQueryInfoType, CcmdReq, CcmdRsp,
    CcmdSetMetadataReq, DrmAmdgpuInfo, AMDGPU_UMD_METADATA_MAX_BYTES,
};
use crate::amdgpu_drm::{GemCreateFlags, GemDomain, VaOp, VmPageFlags};
use crate::ids::{BlobId, ContextId, ResourceId, SeqNo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CcmdEncodeError {
    #[error("request of {len} bytes does not fit the u32 length field")]
    TooLarge { len: usize },
    #[error("metadata of {found} bytes exceeds {max} bytes", max = AMDGPU_UMD_METADATA_MAX_BYTES)]
    MetadataTooLarge { found: usize },
}

/// Response payload capacity reserved for a `GpuInfo` query.
pub const QUERY_GPU_INFO_MAX_PAYLOAD: usize = 1024;
/// Response payload capacity reserved for a `MarketingName` query, NUL terminator included.
pub const QUERY_MARKETING_NAME_MAX_PAYLOAD: usize = 256;

/// Arguments of a generic `DRM_AMDGPU_INFO` query, forwarded opaquely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrmInfoQuery {
    /// Guest pointer in the original ioctl; the host writes the result to the response payload.
    pub return_pointer: u64,
    pub return_size: u32,
    /// `AMDGPU_INFO_*` query id.
    pub query: u32,
    pub args: [u8; 16],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryInfoRequest {
    Info(DrmInfoQuery),
    Address32Hi,
    GpuInfo,
    BufferSizeAlignment,
    MarketingName,
    /// 1 reserves a VMID, 0 releases it.
    ReserveVmid(i32),
    SetPstate {
        ctx_id: ContextId,
        op: u32,
        flags: u32,
    },
}

impl QueryInfoRequest {
    pub const fn query_type(&self) -> CcmdQueryInfoType {
        match self {
            Self::Info(_) => CcmdQueryInfoType::Info,
            Self::Address32Hi => CcmdQueryInfoType::Address32Hi,
            Self::GpuInfo => CcmdQueryInfoType::GpuInfo,
            Self::BufferSizeAlignment => CcmdQueryInfoType::BufferSizeAlignment,
            Self::MarketingName => CcmdQueryInfoType::MarketingName,
            Self::ReserveVmid(_) => CcmdQueryInfoType::ReserveVmid,
            Self::SetPstate { .. } => CcmdQueryInfoType::SetPstate,
        }
    }

    /// Minimum payload the host must return after the response envelope.
    ///
    /// GPU info and the marketing name are variable-length host structures, so only the
    /// envelope is required for them.
    pub const fn expected_payload_len(&self) -> usize {
        match self {
            Self::Info(q) => q.return_size as usize,
            Self::Address32Hi => 4,
            Self::BufferSizeAlignment => 16,
            Self::SetPstate { .. } => 4,
            Self::ReserveVmid(_) | Self::GpuInfo | Self::MarketingName => 0,
        }
    }

    /// Largest payload the host may write for this query. Callers size response slots with it.
    pub const fn max_payload_len(&self) -> usize {
        match self {
            Self::GpuInfo => QUERY_GPU_INFO_MAX_PAYLOAD,
            Self::MarketingName => QUERY_MARKETING_NAME_MAX_PAYLOAD,
            _ => self.expected_payload_len(),
        }
    }

    fn encode_args(&self, args: &mut [u8]) {
        match *self {
            Self::Info(q) => {
                write_u64_at(args, offset_of!(DrmAmdgpuInfo, return_pointer), q.return_pointer);
                write_u32_at(args, offset_of!(DrmAmdgpuInfo, return_size), q.return_size);
                write_u32_at(args, offset_of!(DrmAmdgpuInfo, query), q.query);
                let a = offset_of!(DrmAmdgpuInfo, args);
                args[a..a + 16].copy_from_slice(&q.args);
            }
            Self::ReserveVmid(v) => write_u32_at(args, 0, v as u32),
            Self::SetPstate { ctx_id, op, flags } => {
                write_u32_at(args, 0, ctx_id.get());
                write_u32_at(args, 4, op);
                write_u32_at(args, 8, flags);
            }
            Self::Address32Hi | Self::GpuInfo | Self::BufferSizeAlignment | Self::MarketingName => {}
        }
    }

    fn decode(raw: &CcmdQueryInfoReq) -> Result<Self, CcmdDecodeError> {
        let type_ = raw.type_;
        let query_type =
            CcmdQueryInfoType::from_u32(type_).ok_or(CcmdDecodeError::UnknownQueryInfoType { found: type_ })?;
        let args = raw.args;
        let used = match query_type {
            CcmdQueryInfoType::Info => DrmAmdgpuInfo::SIZE_BYTES,
            CcmdQueryInfoType::ReserveVmid => 4,
            CcmdQueryInfoType::SetPstate => 12,
            _ => 0,
        };
        check_reserved_zero(&args[used..], offset_of!(CcmdQueryInfoReq, args) + used)?;

        Ok(match query_type {
            CcmdQueryInfoType::Info => {
                let mut extra = [0u8; 16];
                extra.copy_from_slice(&args[16..32]);
                Self::Info(DrmInfoQuery {
                    return_pointer: le_u64(&args, 0),
                    return_size: le_u32(&args, 8),
                    query: le_u32(&args, 12),
                    args: extra,
                })
            }
            CcmdQueryInfoType::Address32Hi => Self::Address32Hi,
            CcmdQueryInfoType::GpuInfo => Self::GpuInfo,
            CcmdQueryInfoType::BufferSizeAlignment => Self::BufferSizeAlignment,
            CcmdQueryInfoType::MarketingName => Self::MarketingName,
            CcmdQueryInfoType::ReserveVmid => Self::ReserveVmid(le_i32(&args, 0)),
            CcmdQueryInfoType::SetPstate => Self::SetPstate {
                ctx_id: ContextId(le_u32(&args, 0)),
                op: le_u32(&args, 4),
                flags: le_u32(&args, 8),
            },
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GemNewRequest {
    pub blob_id: BlobId,
    /// GPU virtual address to map at, or 0 to leave the buffer unmapped.
    pub va: u64,
    pub vm_flags: VmPageFlags,
    pub vm_map_size: u64,
    pub alloc_size: u64,
    pub phys_alignment: u64,
    pub preferred_heap: GemDomain,
    pub flags: GemCreateFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssignVaRequest {
    pub va: u64,
    pub vm_map_size: u64,
    pub offset: u64,
    pub res_id: ResourceId,
    pub op: VaOp,
    pub is_sparse_bo: bool,
}

/// One command-stream chunk: an `AMDGPU_CHUNK_ID_*` and its opaque payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsChunk {
    pub chunk_id: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsSubmitRequest {
    pub ctx_id: ContextId,
    pub bo_number: u32,
    pub ring_idx: u32,
    pub chunks: Vec<CsChunk>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetMetadataRequest {
    pub res_id: ResourceId,
    pub flags: u64,
    pub tiling_info: u64,
    pub umd_metadata: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateCtxRequest {
    Create { priority: i32 },
    Destroy { ctx_id: ContextId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CcmdRequest {
    Nop,
    QueryInfo(QueryInfoRequest),
    GemNew(GemNewRequest),
    AssignVa(AssignVaRequest),
    CsSubmit(CsSubmitRequest),
    SetMetadata(SetMetadataRequest),
    BoQueryInfo { res_id: ResourceId },
    CreateCtx(CreateCtxRequest),
}

impl CcmdRequest {
    pub const fn opcode(&self) -> CcmdOpcode {
        match self {
            Self::Nop => CcmdOpcode::Nop,
            Self::QueryInfo(_) => CcmdOpcode::QueryInfo,
            Self::GemNew(_) => CcmdOpcode::GemNew,
            Self::AssignVa(_) => CcmdOpcode::AssignVa,
            Self::CsSubmit(_) => CcmdOpcode::CsSubmit,
            Self::SetMetadata(_) => CcmdOpcode::SetMetadata,
            Self::BoQueryInfo { .. } => CcmdOpcode::BoQueryInfo,
            Self::CreateCtx(_) => CcmdOpcode::CreateCtx,
        }
    }

    /// Total encoded size, envelope and trailer included.
    pub fn encoded_len(&self) -> usize {
        let fixed = self.opcode().fixed_request_size();
        match self {
            Self::CsSubmit(cs) => {
                let data: usize = cs.chunks.iter().map(|c| c.data.len()).sum();
                fixed + cs.chunks.len() * CcmdCsChunkDesc::SIZE_BYTES + data
            }
            Self::SetMetadata(md) => fixed + md.umd_metadata.len(),
            _ => fixed,
        }
    }

    /// Minimum response length the host must produce for this request.
    pub const fn expected_response_len(&self) -> usize {
        match self {
            Self::QueryInfo(q) => CcmdRsp::SIZE_BYTES + q.expected_payload_len(),
            Self::BoQueryInfo { .. } => CcmdBoQueryInfoRsp::SIZE_BYTES,
            Self::CreateCtx(CreateCtxRequest::Create { .. }) => CcmdCreateCtxRsp::SIZE_BYTES,
            _ => CcmdRsp::SIZE_BYTES,
        }
    }

    /// Bytes the host may write in response; at least [`Self::expected_response_len`].
    pub const fn response_capacity(&self) -> usize {
        match self {
            Self::QueryInfo(q) => CcmdRsp::SIZE_BYTES + q.max_payload_len(),
            _ => self.expected_response_len(),
        }
    }

    pub fn encode_le(&self, seqno: SeqNo, rsp_off: u32) -> Result<Vec<u8>, CcmdEncodeError> {
        if let Self::SetMetadata(md) = self {
            if md.umd_metadata.len() > AMDGPU_UMD_METADATA_MAX_BYTES {
                return Err(CcmdEncodeError::MetadataTooLarge {
                    found: md.umd_metadata.len(),
                });
            }
        }

        let len = self.encoded_len();
        let len_u32 = u32::try_from(len).map_err(|_| CcmdEncodeError::TooLarge { len })?;

        let mut buf = vec![0u8; len];
        write_u32_at(&mut buf, offset_of!(CcmdReq, cmd), self.opcode() as u32);
        write_u32_at(&mut buf, offset_of!(CcmdReq, len), len_u32);
        write_u32_at(&mut buf, offset_of!(CcmdReq, seqno), seqno.get());
        write_u32_at(&mut buf, offset_of!(CcmdReq, rsp_off), rsp_off);

        match self {
            Self::Nop => {}
            Self::QueryInfo(q) => {
                let a = offset_of!(CcmdQueryInfoReq, args);
                q.encode_args(&mut buf[a..a + DrmAmdgpuInfo::SIZE_BYTES]);
                write_u32_at(&mut buf, offset_of!(CcmdQueryInfoReq, type_), q.query_type() as u32);
            }
            Self::GemNew(g) => {
                write_u64_at(&mut buf, offset_of!(CcmdGemNewReq, blob_id), g.blob_id.get());
                write_u64_at(&mut buf, offset_of!(CcmdGemNewReq, va), g.va);
                write_u32_at(&mut buf, offset_of!(CcmdGemNewReq, vm_flags), g.vm_flags.bits());
                write_u64_at(&mut buf, offset_of!(CcmdGemNewReq, vm_map_size), g.vm_map_size);
                let r = offset_of!(CcmdGemNewReq, r);
                write_u64_at(&mut buf, r + offset_of!(CcmdBoAllocRequest, alloc_size), g.alloc_size);
                write_u64_at(
                    &mut buf,
                    r + offset_of!(CcmdBoAllocRequest, phys_alignment),
                    g.phys_alignment,
                );
                write_u32_at(
                    &mut buf,
                    r + offset_of!(CcmdBoAllocRequest, preferred_heap),
                    g.preferred_heap.bits(),
                );
                write_u64_at(&mut buf, r + offset_of!(CcmdBoAllocRequest, flags), g.flags.bits());
            }
            Self::AssignVa(va) => {
                write_u64_at(&mut buf, offset_of!(CcmdAssignVaReq, va), va.va);
                write_u64_at(&mut buf, offset_of!(CcmdAssignVaReq, vm_map_size), va.vm_map_size);
                write_u64_at(&mut buf, offset_of!(CcmdAssignVaReq, offset), va.offset);
                write_u32_at(&mut buf, offset_of!(CcmdAssignVaReq, res_id), va.res_id.get());
                write_u32_at(&mut buf, offset_of!(CcmdAssignVaReq, op), va.op as u32);
                buf[offset_of!(CcmdAssignVaReq, is_sparse_bo)] = va.is_sparse_bo as u8;
            }
            Self::CsSubmit(cs) => {
                write_u32_at(&mut buf, offset_of!(CcmdCsSubmitReq, ctx_id), cs.ctx_id.get());
                write_u32_at(&mut buf, offset_of!(CcmdCsSubmitReq, num_chunks), cs.chunks.len() as u32);
                write_u32_at(&mut buf, offset_of!(CcmdCsSubmitReq, bo_number), cs.bo_number);
                write_u32_at(&mut buf, offset_of!(CcmdCsSubmitReq, ring_idx), cs.ring_idx);

                let desc_base = CcmdCsSubmitReq::SIZE_BYTES;
                let data_base = desc_base + cs.chunks.len() * CcmdCsChunkDesc::SIZE_BYTES;
                let mut data_off = 0usize;
                for (i, chunk) in cs.chunks.iter().enumerate() {
                    let desc = desc_base + i * CcmdCsChunkDesc::SIZE_BYTES;
                    write_u32_at(&mut buf, desc + offset_of!(CcmdCsChunkDesc, chunk_id), chunk.chunk_id);
                    // Fits: the whole record length was checked against u32 above.
                    write_u32_at(&mut buf, desc + offset_of!(CcmdCsChunkDesc, offset), data_off as u32);
                    let start = data_base + data_off;
                    buf[start..start + chunk.data.len()].copy_from_slice(&chunk.data);
                    data_off += chunk.data.len();
                }
            }
            Self::SetMetadata(md) => {
                write_u64_at(&mut buf, offset_of!(CcmdSetMetadataReq, flags), md.flags);
                write_u64_at(&mut buf, offset_of!(CcmdSetMetadataReq, tiling_info), md.tiling_info);
                write_u32_at(&mut buf, offset_of!(CcmdSetMetadataReq, res_id), md.res_id.get());
                write_u32_at(
                    &mut buf,
                    offset_of!(CcmdSetMetadataReq, size_metadata),
                    md.umd_metadata.len() as u32,
                );
                buf[CcmdSetMetadataReq::SIZE_BYTES..].copy_from_slice(&md.umd_metadata);
            }
            Self::BoQueryInfo { res_id } => {
                write_u32_at(&mut buf, offset_of!(CcmdBoQueryInfoReq, res_id), res_id.get());
            }
            Self::CreateCtx(ctx) => {
                let (value, create) = match *ctx {
                    CreateCtxRequest::Create { priority } => (priority as u32, 1u8),
                    CreateCtxRequest::Destroy { ctx_id } => (ctx_id.get(), 0u8),
                };
                write_u32_at(&mut buf, offset_of!(CcmdCreateCtxReq, priority_or_id), value);
                buf[offset_of!(CcmdCreateCtxReq, create)] = create;
            }
        }

        Ok(buf)
    }
}

fn check_reserved_zero(bytes: &[u8], base_offset: usize) -> Result<(), CcmdDecodeError> {
    match bytes.iter().position(|&b| b != 0) {
        Some(i) => Err(CcmdDecodeError::ReservedNonZero {
            offset: base_offset + i,
        }),
        None => Ok(()),
    }
}

fn decode_bool(v: u8, offset: usize) -> Result<bool, CcmdDecodeError> {
    match v {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(CcmdDecodeError::InvalidField {
            offset,
            found: v as u32,
        }),
    }
}

/// Decodes one request record at the start of `buf`.
///
/// Returns the envelope (for `seqno` and `rsp_off`) together with the typed request. Bytes past
/// the envelope's `len` are ignored.
pub fn decode_ccmd_request_le(buf: &[u8]) -> Result<(CcmdReq, CcmdRequest), CcmdDecodeError> {
    let hdr = decode_ccmd_req_le(buf)?;
    let cmd = hdr.cmd;
    let opcode = CcmdOpcode::from_u32(cmd).ok_or(CcmdDecodeError::UnknownOpcode { found: cmd })?;

    let req = match opcode {
        CcmdOpcode::Nop => {
            decode_ccmd_nop_req_le(buf)?;
            CcmdRequest::Nop
        }
        CcmdOpcode::QueryInfo => {
            let raw = decode_ccmd_query_info_req_le(buf)?;
            let pad = raw.pad;
            check_reserved_zero(&pad.to_le_bytes(), offset_of!(CcmdQueryInfoReq, pad))?;
            CcmdRequest::QueryInfo(QueryInfoRequest::decode(&raw)?)
        }
        CcmdOpcode::GemNew => {
            let raw = decode_ccmd_gem_new_req_le(buf)?;
            let pad = raw.pad;
            check_reserved_zero(&pad.to_le_bytes(), offset_of!(CcmdGemNewReq, pad))?;
            let r = raw.r;
            let r_pad = r.pad;
            check_reserved_zero(
                &r_pad.to_le_bytes(),
                offset_of!(CcmdGemNewReq, r) + offset_of!(CcmdBoAllocRequest, pad),
            )?;
            CcmdRequest::GemNew(GemNewRequest {
                blob_id: BlobId(raw.blob_id),
                va: raw.va,
                vm_flags: VmPageFlags::from_bits_retain(raw.vm_flags),
                vm_map_size: raw.vm_map_size,
                alloc_size: r.alloc_size,
                phys_alignment: r.phys_alignment,
                preferred_heap: GemDomain::from_bits_retain(r.preferred_heap),
                flags: GemCreateFlags::from_bits_retain(r.flags),
            })
        }
        CcmdOpcode::AssignVa => {
            let raw = decode_ccmd_assign_va_req_le(buf)?;
            let pad = raw.pad;
            check_reserved_zero(&pad, offset_of!(CcmdAssignVaReq, pad))?;
            let op_raw = raw.op;
            let op = VaOp::from_u32(op_raw).ok_or(CcmdDecodeError::InvalidField {
                offset: offset_of!(CcmdAssignVaReq, op),
                found: op_raw,
            })?;
            CcmdRequest::AssignVa(AssignVaRequest {
                va: raw.va,
                vm_map_size: raw.vm_map_size,
                offset: raw.offset,
                res_id: ResourceId(raw.res_id),
                op,
                is_sparse_bo: decode_bool(raw.is_sparse_bo, offset_of!(CcmdAssignVaReq, is_sparse_bo))?,
            })
        }
        CcmdOpcode::CsSubmit => {
            let (raw, trailer) = decode_ccmd_cs_submit_req_le(buf)?;
            let chunks = decode_ccmd_cs_chunks(&raw, trailer)?;
            let num_chunks = raw.num_chunks;
            let data_len = trailer.len() - num_chunks as usize * CcmdCsChunkDesc::SIZE_BYTES;

            // Only a layout without gaps re-encodes to the same bytes.
            if chunks.is_empty() && data_len != 0 {
                return Err(CcmdDecodeError::PayloadSizeMismatch {
                    expected: CcmdCsSubmitReq::SIZE_BYTES,
                    found: trailer.len() + CcmdCsSubmitReq::SIZE_BYTES,
                });
            }
            if !chunks.is_empty() {
                let first_off = le_u32(trailer, offset_of!(CcmdCsChunkDesc, offset));
                if first_off != 0 {
                    return Err(CcmdDecodeError::BadChunkOffset {
                        index: 0,
                        offset: first_off,
                    });
                }
            }

            CcmdRequest::CsSubmit(CsSubmitRequest {
                ctx_id: ContextId(raw.ctx_id),
                bo_number: raw.bo_number,
                ring_idx: raw.ring_idx,
                chunks: chunks
                    .into_iter()
                    .map(|(chunk_id, data)| CsChunk {
                        chunk_id,
                        data: data.to_vec(),
                    })
                    .collect(),
            })
        }
        CcmdOpcode::SetMetadata => {
            let (raw, metadata) = decode_ccmd_set_metadata_req_le(buf)?;
            CcmdRequest::SetMetadata(SetMetadataRequest {
                res_id: ResourceId(raw.res_id),
                flags: raw.flags,
                tiling_info: raw.tiling_info,
                umd_metadata: metadata.to_vec(),
            })
        }
        CcmdOpcode::BoQueryInfo => {
            let raw = decode_ccmd_bo_query_info_req_le(buf)?;
            CcmdRequest::BoQueryInfo {
                res_id: ResourceId(raw.res_id),
            }
        }
        CcmdOpcode::CreateCtx => {
            let raw = decode_ccmd_create_ctx_req_le(buf)?;
            let pad = raw.pad;
            check_reserved_zero(&pad, offset_of!(CcmdCreateCtxReq, pad))?;
            let create = decode_bool(raw.create, offset_of!(CcmdCreateCtxReq, create))?;
            let value = raw.priority_or_id;
            CcmdRequest::CreateCtx(if create {
                CreateCtxRequest::Create {
                    priority: value as i32,
                }
            } else {
                CreateCtxRequest::Destroy {
                    ctx_id: ContextId(value),
                }
            })
        }
    };

    Ok((hdr, req))
}
