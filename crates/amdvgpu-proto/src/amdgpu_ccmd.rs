//! amdgpu virtio native-context command ("ccmd") layouts.
//!
//! Every request starts with [`CcmdReq`] and every response with [`CcmdRsp`]. All fields are
//! little-endian. Requests with a trailer (`CS_SUBMIT`, `SET_METADATA`) carry a fixed prefix whose
//! fields determine the trailer length; `len` in the envelope always covers the whole record.

use core::mem::{offset_of, size_of};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CcmdOpcode {
    /// No payload. Used to sync with the host.
    Nop = 1,
    QueryInfo = 2,
    GemNew = 3,
    AssignVa = 4,
    CsSubmit = 5,
    SetMetadata = 6,
    BoQueryInfo = 7,
    CreateCtx = 8,
}

impl CcmdOpcode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Nop),
            2 => Some(Self::QueryInfo),
            3 => Some(Self::GemNew),
            4 => Some(Self::AssignVa),
            5 => Some(Self::CsSubmit),
            6 => Some(Self::SetMetadata),
            7 => Some(Self::BoQueryInfo),
            8 => Some(Self::CreateCtx),
            _ => None,
        }
    }

    /// Size of the fixed part of the request, envelope included.
    pub const fn fixed_request_size(self) -> usize {
        match self {
            Self::Nop => CcmdNopReq::SIZE_BYTES,
            Self::QueryInfo => CcmdQueryInfoReq::SIZE_BYTES,
            Self::GemNew => CcmdGemNewReq::SIZE_BYTES,
            Self::AssignVa => CcmdAssignVaReq::SIZE_BYTES,
            Self::CsSubmit => CcmdCsSubmitReq::SIZE_BYTES,
            Self::SetMetadata => CcmdSetMetadataReq::SIZE_BYTES,
            Self::BoQueryInfo => CcmdBoQueryInfoReq::SIZE_BYTES,
            Self::CreateCtx => CcmdCreateCtxReq::SIZE_BYTES,
        }
    }
}

/* ------------------------------- Envelopes -------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdReq {
    pub cmd: u32,
    /// Total request length including this envelope and any trailer.
    pub len: u32,
    pub seqno: u32,
    /// Offset of the response inside the response region of the shared control blob.
    pub rsp_off: u32,
}

impl CcmdReq {
    pub const SIZE_BYTES: usize = 16;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdRsp {
    pub ret: i32,
    /// Total response length including this envelope and any trailer.
    pub len: u32,
}

impl CcmdRsp {
    pub const SIZE_BYTES: usize = 8;
}

/* --------------------------------- NOP ------------------------------------ */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdNopReq {
    pub hdr: CcmdReq,
}

impl CcmdNopReq {
    pub const SIZE_BYTES: usize = 16;
}

/* ------------------------------ QUERY_INFO -------------------------------- */

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CcmdQueryInfoType {
    /// Generic `DRM_AMDGPU_INFO` query.
    Info = 0,
    Address32Hi = 1,
    GpuInfo = 2,
    BufferSizeAlignment = 3,
    MarketingName = 4,
    ReserveVmid = 5,
    SetPstate = 6,
}

impl CcmdQueryInfoType {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Info),
            1 => Some(Self::Address32Hi),
            2 => Some(Self::GpuInfo),
            3 => Some(Self::BufferSizeAlignment),
            4 => Some(Self::MarketingName),
            5 => Some(Self::ReserveVmid),
            6 => Some(Self::SetPstate),
            _ => None,
        }
    }
}

/// `struct drm_amdgpu_info` as forwarded to the host. `args` holds the query-specific union
/// (`mode_crtc`, `query_hw_ip`, `read_mmr_reg`, ...) untouched.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrmAmdgpuInfo {
    pub return_pointer: u64,
    pub return_size: u32,
    pub query: u32,
    pub args: [u8; 16],
}

impl DrmAmdgpuInfo {
    pub const SIZE_BYTES: usize = 32;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdPstateArgs {
    pub ctx_id: u32,
    pub op: u32,
    pub flags: u32,
}

/// Size of the argument union in `QUERY_INFO` (the largest member is [`DrmAmdgpuInfo`]).
pub const CCMD_QUERY_INFO_UNION_SIZE: usize = 32;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdQueryInfoReq {
    pub hdr: CcmdReq,
    /// Raw union bytes; interpretation depends on `type_`.
    pub args: [u8; CCMD_QUERY_INFO_UNION_SIZE],
    pub type_: u32,
    pub pad: u32,
}

impl CcmdQueryInfoReq {
    pub const SIZE_BYTES: usize = 56;
}

/* -------------------------------- GEM_NEW --------------------------------- */

/// `amdgpu_bo_alloc_request`, padded so the layout is identical on 32 and 64 bit guests.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdBoAllocRequest {
    pub alloc_size: u64,
    pub phys_alignment: u64,
    pub preferred_heap: u32,
    pub pad: u32,
    pub flags: u64,
}

impl CcmdBoAllocRequest {
    pub const SIZE_BYTES: usize = 32;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdGemNewReq {
    pub hdr: CcmdReq,
    pub blob_id: u64,
    pub va: u64,
    pub pad: u32,
    pub vm_flags: u32,
    /// May be smaller than `r.alloc_size`.
    pub vm_map_size: u64,
    pub r: CcmdBoAllocRequest,
}

impl CcmdGemNewReq {
    pub const SIZE_BYTES: usize = 80;
}

/* ------------------------------- ASSIGN_VA -------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdAssignVaReq {
    pub hdr: CcmdReq,
    pub va: u64,
    pub vm_map_size: u64,
    pub offset: u64,
    pub res_id: u32,
    pub op: u32,
    pub is_sparse_bo: u8,
    pub pad: [u8; 7],
}

impl CcmdAssignVaReq {
    pub const SIZE_BYTES: usize = 56;
}

/* ------------------------------- CS_SUBMIT -------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdCsSubmitReq {
    pub hdr: CcmdReq,
    pub ctx_id: u32,
    pub num_chunks: u32,
    pub bo_number: u32,
    pub ring_idx: u32,
    // Followed by `num_chunks` x CcmdCsChunkDesc, then the chunk data area.
}

impl CcmdCsSubmitReq {
    pub const SIZE_BYTES: usize = 32;
}

/// One entry of the `CS_SUBMIT` descriptor array. `offset` is relative to the start of the chunk
/// data area that follows the descriptor array.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdCsChunkDesc {
    pub chunk_id: u32,
    pub offset: u32,
}

impl CcmdCsChunkDesc {
    pub const SIZE_BYTES: usize = 8;
}

/* ------------------------------ SET_METADATA ------------------------------ */

/// Capacity of `amdgpu_bo_metadata::umd_metadata`, in dwords.
pub const AMDGPU_UMD_METADATA_DWORDS: usize = 64;
pub const AMDGPU_UMD_METADATA_MAX_BYTES: usize = AMDGPU_UMD_METADATA_DWORDS * 4;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdSetMetadataReq {
    pub hdr: CcmdReq,
    pub flags: u64,
    pub tiling_info: u64,
    pub res_id: u32,
    pub size_metadata: u32,
    // Followed by exactly `size_metadata` bytes of UMD metadata.
}

impl CcmdSetMetadataReq {
    pub const SIZE_BYTES: usize = 40;
}

/* ----------------------------- BO_QUERY_INFO ------------------------------ */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdBoQueryInfoReq {
    pub hdr: CcmdReq,
    pub res_id: u32,
}

impl CcmdBoQueryInfoReq {
    pub const SIZE_BYTES: usize = 20;
}

/// `struct amdgpu_bo_metadata`.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmdgpuBoMetadata {
    pub flags: u64,
    pub tiling_info: u64,
    pub size_metadata: u32,
    pub umd_metadata: [u32; AMDGPU_UMD_METADATA_DWORDS],
    pub pad: u32,
}

impl AmdgpuBoMetadata {
    pub const SIZE_BYTES: usize = 280;

    /// The first `size_metadata` bytes of `umd_metadata`, clamped to its capacity.
    pub fn umd_metadata_bytes(&self) -> Vec<u8> {
        let words = self.umd_metadata;
        let len = (self.size_metadata as usize).min(AMDGPU_UMD_METADATA_MAX_BYTES);
        words.iter().flat_map(|w| w.to_le_bytes()).take(len).collect()
    }
}

impl Default for AmdgpuBoMetadata {
    fn default() -> Self {
        Self {
            flags: 0,
            tiling_info: 0,
            size_metadata: 0,
            umd_metadata: [0; AMDGPU_UMD_METADATA_DWORDS],
            pad: 0,
        }
    }
}

/// `amdgpu_bo_info`, padded so the layout is identical on 32 and 64 bit guests.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdBoInfo {
    pub alloc_size: u64,
    pub phys_alignment: u64,
    pub preferred_heap: u32,
    pub pad: u32,
    pub alloc_flags: u64,
    pub metadata: AmdgpuBoMetadata,
}

impl CcmdBoInfo {
    pub const SIZE_BYTES: usize = 312;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdBoQueryInfoRsp {
    pub hdr: CcmdRsp,
    pub pad: [u32; 2],
    pub info: CcmdBoInfo,
}

impl CcmdBoQueryInfoRsp {
    pub const SIZE_BYTES: usize = 328;
}

/* ------------------------------- CREATE_CTX ------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdCreateCtxReq {
    pub hdr: CcmdReq,
    /// `priority` (i32) when `create != 0`, the context id to destroy otherwise.
    pub priority_or_id: u32,
    pub create: u8,
    pub pad: [u8; 3],
}

impl CcmdCreateCtxReq {
    pub const SIZE_BYTES: usize = 24;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CcmdCreateCtxRsp {
    pub hdr: CcmdRsp,
    pub ctx_id: u32,
}

impl CcmdCreateCtxRsp {
    pub const SIZE_BYTES: usize = 12;
}

const _: () = {
    assert!(size_of::<CcmdReq>() == CcmdReq::SIZE_BYTES);
    assert!(size_of::<CcmdRsp>() == CcmdRsp::SIZE_BYTES);
    assert!(size_of::<CcmdNopReq>() == CcmdNopReq::SIZE_BYTES);
    assert!(size_of::<DrmAmdgpuInfo>() == DrmAmdgpuInfo::SIZE_BYTES);
    assert!(size_of::<CcmdPstateArgs>() <= CCMD_QUERY_INFO_UNION_SIZE);
    assert!(size_of::<CcmdQueryInfoReq>() == CcmdQueryInfoReq::SIZE_BYTES);
    assert!(offset_of!(CcmdQueryInfoReq, args) == 16);
    assert!(offset_of!(CcmdQueryInfoReq, type_) == 48);
    assert!(size_of::<CcmdBoAllocRequest>() == CcmdBoAllocRequest::SIZE_BYTES);
    assert!(size_of::<CcmdGemNewReq>() == CcmdGemNewReq::SIZE_BYTES);
    assert!(offset_of!(CcmdGemNewReq, blob_id) == 16);
    assert!(offset_of!(CcmdGemNewReq, va) == 24);
    assert!(offset_of!(CcmdGemNewReq, vm_flags) == 36);
    assert!(offset_of!(CcmdGemNewReq, vm_map_size) == 40);
    assert!(offset_of!(CcmdGemNewReq, r) == 48);
    assert!(size_of::<CcmdAssignVaReq>() == CcmdAssignVaReq::SIZE_BYTES);
    assert!(offset_of!(CcmdAssignVaReq, res_id) == 40);
    assert!(offset_of!(CcmdAssignVaReq, op) == 44);
    assert!(offset_of!(CcmdAssignVaReq, is_sparse_bo) == 48);
    assert!(size_of::<CcmdCsSubmitReq>() == CcmdCsSubmitReq::SIZE_BYTES);
    assert!(size_of::<CcmdCsChunkDesc>() == CcmdCsChunkDesc::SIZE_BYTES);
    assert!(size_of::<CcmdSetMetadataReq>() == CcmdSetMetadataReq::SIZE_BYTES);
    assert!(offset_of!(CcmdSetMetadataReq, res_id) == 32);
    assert!(offset_of!(CcmdSetMetadataReq, size_metadata) == 36);
    assert!(size_of::<CcmdBoQueryInfoReq>() == CcmdBoQueryInfoReq::SIZE_BYTES);
    assert!(size_of::<AmdgpuBoMetadata>() == AmdgpuBoMetadata::SIZE_BYTES);
    assert!(size_of::<CcmdBoInfo>() == CcmdBoInfo::SIZE_BYTES);
    assert!(offset_of!(CcmdBoInfo, alloc_flags) == 24);
    assert!(offset_of!(CcmdBoInfo, metadata) == 32);
    assert!(size_of::<CcmdBoQueryInfoRsp>() == CcmdBoQueryInfoRsp::SIZE_BYTES);
    assert!(offset_of!(CcmdBoQueryInfoRsp, info) == 16);
    assert!(size_of::<CcmdCreateCtxReq>() == CcmdCreateCtxReq::SIZE_BYTES);
    assert!(offset_of!(CcmdCreateCtxReq, create) == 20);
    assert!(size_of::<CcmdCreateCtxRsp>() == CcmdCreateCtxRsp::SIZE_BYTES);
};

/* -------------------------------- Decoding -------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CcmdDecodeError {
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("invalid length {found}")]
    BadLen { found: u32 },
    #[error("unknown ccmd opcode {found}")]
    UnknownOpcode { found: u32 },
    #[error("unexpected opcode {found} (expected {expected:?})")]
    UnexpectedOpcode { found: u32, expected: CcmdOpcode },
    #[error("unknown query-info type {found}")]
    UnknownQueryInfoType { found: u32 },
    #[error("payload size mismatch: expected {expected} bytes, found {found}")]
    PayloadSizeMismatch { expected: usize, found: usize },
    #[error("chunk {index} has out-of-order or out-of-range offset {offset}")]
    BadChunkOffset { index: u32, offset: u32 },
    #[error("metadata size {found} exceeds {max} bytes", max = AMDGPU_UMD_METADATA_MAX_BYTES)]
    MetadataTooLarge { found: u32 },
    #[error("reserved byte at offset {offset} is not zero")]
    ReservedNonZero { offset: usize },
    #[error("invalid value {found} at offset {offset}")]
    InvalidField { offset: usize, found: u32 },
    #[error("count overflow")]
    CountOverflow,
}

pub(crate) fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn le_i32(buf: &[u8], off: usize) -> i32 {
    le_u32(buf, off) as i32
}

pub(crate) fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Decodes the request envelope and checks that `buf` holds at least `len` bytes.
pub fn decode_ccmd_req_le(buf: &[u8]) -> Result<CcmdReq, CcmdDecodeError> {
    if buf.len() < CcmdReq::SIZE_BYTES {
        return Err(CcmdDecodeError::BufferTooSmall);
    }

    let hdr = CcmdReq {
        cmd: le_u32(buf, 0),
        len: le_u32(buf, 4),
        seqno: le_u32(buf, 8),
        rsp_off: le_u32(buf, 12),
    };

    let len = hdr.len;
    if (len as usize) < CcmdReq::SIZE_BYTES {
        return Err(CcmdDecodeError::BadLen { found: len });
    }
    if buf.len() < len as usize {
        return Err(CcmdDecodeError::BufferTooSmall);
    }
    Ok(hdr)
}

/// Decodes the response envelope. `len` is checked against the envelope size only; callers
/// compare it with what the operation needs.
pub fn decode_ccmd_rsp_le(buf: &[u8]) -> Result<CcmdRsp, CcmdDecodeError> {
    if buf.len() < CcmdRsp::SIZE_BYTES {
        return Err(CcmdDecodeError::BufferTooSmall);
    }

    let hdr = CcmdRsp {
        ret: le_i32(buf, 0),
        len: le_u32(buf, 4),
    };
    let len = hdr.len;
    if (len as usize) < CcmdRsp::SIZE_BYTES {
        return Err(CcmdDecodeError::BadLen { found: len });
    }
    Ok(hdr)
}

/// Decodes the envelope of `buf` and checks both the opcode and the exact fixed length.
fn decode_fixed_req_le(buf: &[u8], expected: CcmdOpcode) -> Result<CcmdReq, CcmdDecodeError> {
    let hdr = decode_trailer_req_le(buf, expected)?;
    let len = hdr.len;
    if len as usize != expected.fixed_request_size() {
        return Err(CcmdDecodeError::BadLen { found: len });
    }
    Ok(hdr)
}

/// Like [`decode_fixed_req_le`] but only requires `len` to cover the fixed prefix.
fn decode_trailer_req_le(buf: &[u8], expected: CcmdOpcode) -> Result<CcmdReq, CcmdDecodeError> {
    let hdr = decode_ccmd_req_le(buf)?;
    let cmd = hdr.cmd;
    if cmd != expected as u32 {
        return Err(CcmdDecodeError::UnexpectedOpcode {
            found: cmd,
            expected,
        });
    }
    let len = hdr.len;
    if (len as usize) < expected.fixed_request_size() {
        return Err(CcmdDecodeError::BadLen { found: len });
    }
    Ok(hdr)
}

pub fn decode_ccmd_nop_req_le(buf: &[u8]) -> Result<CcmdNopReq, CcmdDecodeError> {
    let hdr = decode_fixed_req_le(buf, CcmdOpcode::Nop)?;
    Ok(CcmdNopReq { hdr })
}

pub fn decode_ccmd_query_info_req_le(buf: &[u8]) -> Result<CcmdQueryInfoReq, CcmdDecodeError> {
    let hdr = decode_fixed_req_le(buf, CcmdOpcode::QueryInfo)?;
    let mut args = [0u8; CCMD_QUERY_INFO_UNION_SIZE];
    args.copy_from_slice(&buf[16..48]);
    let type_ = le_u32(buf, 48);
    if CcmdQueryInfoType::from_u32(type_).is_none() {
        return Err(CcmdDecodeError::UnknownQueryInfoType { found: type_ });
    }
    Ok(CcmdQueryInfoReq {
        hdr,
        args,
        type_,
        pad: le_u32(buf, 52),
    })
}

pub fn decode_ccmd_gem_new_req_le(buf: &[u8]) -> Result<CcmdGemNewReq, CcmdDecodeError> {
    let hdr = decode_fixed_req_le(buf, CcmdOpcode::GemNew)?;
    Ok(CcmdGemNewReq {
        hdr,
        blob_id: le_u64(buf, 16),
        va: le_u64(buf, 24),
        pad: le_u32(buf, 32),
        vm_flags: le_u32(buf, 36),
        vm_map_size: le_u64(buf, 40),
        r: CcmdBoAllocRequest {
            alloc_size: le_u64(buf, 48),
            phys_alignment: le_u64(buf, 56),
            preferred_heap: le_u32(buf, 64),
            pad: le_u32(buf, 68),
            flags: le_u64(buf, 72),
        },
    })
}

pub fn decode_ccmd_assign_va_req_le(buf: &[u8]) -> Result<CcmdAssignVaReq, CcmdDecodeError> {
    let hdr = decode_fixed_req_le(buf, CcmdOpcode::AssignVa)?;
    let mut pad = [0u8; 7];
    pad.copy_from_slice(&buf[49..56]);
    Ok(CcmdAssignVaReq {
        hdr,
        va: le_u64(buf, 16),
        vm_map_size: le_u64(buf, 24),
        offset: le_u64(buf, 32),
        res_id: le_u32(buf, 40),
        op: le_u32(buf, 44),
        is_sparse_bo: buf[48],
        pad,
    })
}

/// Decodes `CS_SUBMIT` and returns the trailer (descriptor array followed by the chunk data
/// area). The descriptor array is checked to fit; use [`decode_ccmd_cs_chunks`] to split chunks.
pub fn decode_ccmd_cs_submit_req_le(
    buf: &[u8],
) -> Result<(CcmdCsSubmitReq, &[u8]), CcmdDecodeError> {
    let hdr = decode_trailer_req_le(buf, CcmdOpcode::CsSubmit)?;
    let len = hdr.len as usize;

    let req = CcmdCsSubmitReq {
        hdr,
        ctx_id: le_u32(buf, 16),
        num_chunks: le_u32(buf, 20),
        bo_number: le_u32(buf, 24),
        ring_idx: le_u32(buf, 28),
    };

    let desc_bytes = (req.num_chunks as usize)
        .checked_mul(CcmdCsChunkDesc::SIZE_BYTES)
        .ok_or(CcmdDecodeError::CountOverflow)?;
    let min_len = CcmdCsSubmitReq::SIZE_BYTES
        .checked_add(desc_bytes)
        .ok_or(CcmdDecodeError::CountOverflow)?;
    if len < min_len {
        return Err(CcmdDecodeError::PayloadSizeMismatch {
            expected: min_len,
            found: len,
        });
    }

    Ok((req, &buf[CcmdCsSubmitReq::SIZE_BYTES..len]))
}

/// Splits a `CS_SUBMIT` trailer into `(chunk_id, data)` pairs.
///
/// Chunk `i` spans `[offset_i, offset_{i+1})` of the data area; the last chunk runs to the end.
/// Offsets must be non-decreasing and inside the data area.
pub fn decode_ccmd_cs_chunks<'a>(
    req: &CcmdCsSubmitReq,
    trailer: &'a [u8],
) -> Result<Vec<(u32, &'a [u8])>, CcmdDecodeError> {
    let num_chunks = req.num_chunks as usize;
    let desc_bytes = num_chunks
        .checked_mul(CcmdCsChunkDesc::SIZE_BYTES)
        .ok_or(CcmdDecodeError::CountOverflow)?;
    if trailer.len() < desc_bytes {
        return Err(CcmdDecodeError::BufferTooSmall);
    }
    let (descs, data) = trailer.split_at(desc_bytes);

    let mut out = Vec::with_capacity(num_chunks);
    let mut prev_off = 0usize;
    for i in 0..num_chunks {
        let chunk_id = le_u32(descs, i * CcmdCsChunkDesc::SIZE_BYTES);
        let offset = le_u32(descs, i * CcmdCsChunkDesc::SIZE_BYTES + 4);
        let start = offset as usize;
        if start < prev_off || start > data.len() {
            return Err(CcmdDecodeError::BadChunkOffset {
                index: i as u32,
                offset,
            });
        }
        let end = if i + 1 < num_chunks {
            le_u32(descs, (i + 1) * CcmdCsChunkDesc::SIZE_BYTES + 4) as usize
        } else {
            data.len()
        };
        if end < start || end > data.len() {
            return Err(CcmdDecodeError::BadChunkOffset {
                index: (i + 1) as u32,
                offset: end as u32,
            });
        }
        out.push((chunk_id, &data[start..end]));
        prev_off = start;
    }
    Ok(out)
}

/// Decodes `SET_METADATA` and returns exactly `size_metadata` bytes of UMD metadata.
pub fn decode_ccmd_set_metadata_req_le(
    buf: &[u8],
) -> Result<(CcmdSetMetadataReq, &[u8]), CcmdDecodeError> {
    let hdr = decode_trailer_req_le(buf, CcmdOpcode::SetMetadata)?;
    let len = hdr.len as usize;

    let req = CcmdSetMetadataReq {
        hdr,
        flags: le_u64(buf, 16),
        tiling_info: le_u64(buf, 24),
        res_id: le_u32(buf, 32),
        size_metadata: le_u32(buf, 36),
    };

    let size_metadata = req.size_metadata;
    if size_metadata as usize > AMDGPU_UMD_METADATA_MAX_BYTES {
        return Err(CcmdDecodeError::MetadataTooLarge {
            found: size_metadata,
        });
    }
    let expected = CcmdSetMetadataReq::SIZE_BYTES + size_metadata as usize;
    if len != expected {
        return Err(CcmdDecodeError::PayloadSizeMismatch {
            expected,
            found: len,
        });
    }

    Ok((req, &buf[CcmdSetMetadataReq::SIZE_BYTES..len]))
}

pub fn decode_ccmd_bo_query_info_req_le(buf: &[u8]) -> Result<CcmdBoQueryInfoReq, CcmdDecodeError> {
    let hdr = decode_fixed_req_le(buf, CcmdOpcode::BoQueryInfo)?;
    Ok(CcmdBoQueryInfoReq {
        hdr,
        res_id: le_u32(buf, 16),
    })
}

pub fn decode_ccmd_create_ctx_req_le(buf: &[u8]) -> Result<CcmdCreateCtxReq, CcmdDecodeError> {
    let hdr = decode_fixed_req_le(buf, CcmdOpcode::CreateCtx)?;
    let mut pad = [0u8; 3];
    pad.copy_from_slice(&buf[21..24]);
    Ok(CcmdCreateCtxReq {
        hdr,
        priority_or_id: le_u32(buf, 16),
        create: buf[20],
        pad,
    })
}

/// Decodes a `CREATE_CTX` response to a create request.
pub fn decode_ccmd_create_ctx_rsp_le(buf: &[u8]) -> Result<CcmdCreateCtxRsp, CcmdDecodeError> {
    let hdr = decode_ccmd_rsp_le(buf)?;
    let len = hdr.len;
    if (len as usize) < CcmdCreateCtxRsp::SIZE_BYTES || buf.len() < CcmdCreateCtxRsp::SIZE_BYTES {
        return Err(CcmdDecodeError::PayloadSizeMismatch {
            expected: CcmdCreateCtxRsp::SIZE_BYTES,
            found: (len as usize).min(buf.len()),
        });
    }
    Ok(CcmdCreateCtxRsp {
        hdr,
        ctx_id: le_u32(buf, 8),
    })
}

pub fn decode_ccmd_bo_query_info_rsp_le(buf: &[u8]) -> Result<CcmdBoQueryInfoRsp, CcmdDecodeError> {
    let hdr = decode_ccmd_rsp_le(buf)?;
    let len = hdr.len;
    if (len as usize) < CcmdBoQueryInfoRsp::SIZE_BYTES || buf.len() < CcmdBoQueryInfoRsp::SIZE_BYTES
    {
        return Err(CcmdDecodeError::PayloadSizeMismatch {
            expected: CcmdBoQueryInfoRsp::SIZE_BYTES,
            found: (len as usize).min(buf.len()),
        });
    }

    let info = &buf[16..CcmdBoQueryInfoRsp::SIZE_BYTES];
    let mut umd_metadata = [0u32; AMDGPU_UMD_METADATA_DWORDS];
    for (i, w) in umd_metadata.iter_mut().enumerate() {
        *w = le_u32(info, 52 + i * 4);
    }

    Ok(CcmdBoQueryInfoRsp {
        hdr,
        pad: [le_u32(buf, 8), le_u32(buf, 12)],
        info: CcmdBoInfo {
            alloc_size: le_u64(info, 0),
            phys_alignment: le_u64(info, 8),
            preferred_heap: le_u32(info, 16),
            pad: le_u32(info, 20),
            alloc_flags: le_u64(info, 24),
            metadata: AmdgpuBoMetadata {
                flags: le_u64(info, 32),
                tiling_info: le_u64(info, 40),
                size_metadata: le_u32(info, 48),
                umd_metadata,
                pad: le_u32(info, 308),
            },
        },
    })
}

/// Decodes a `QUERY_INFO` response and returns the opaque payload that follows the envelope.
pub fn decode_ccmd_query_info_rsp_le(buf: &[u8]) -> Result<(CcmdRsp, &[u8]), CcmdDecodeError> {
    let hdr = decode_ccmd_rsp_le(buf)?;
    let len = hdr.len as usize;
    if buf.len() < len {
        return Err(CcmdDecodeError::BufferTooSmall);
    }
    Ok((hdr, &buf[CcmdRsp::SIZE_BYTES..len]))
}

/* -------------------------------- Encoding -------------------------------- */

pub(crate) fn write_u32_at(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u64_at(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

/// Encodes a `BO_QUERY_INFO` response. Used by hosts and test fixtures.
pub fn encode_ccmd_bo_query_info_rsp_le(rsp: &CcmdBoQueryInfoRsp) -> [u8; CcmdBoQueryInfoRsp::SIZE_BYTES] {
    let mut buf = [0u8; CcmdBoQueryInfoRsp::SIZE_BYTES];
    let hdr = rsp.hdr;
    let info = rsp.info;
    let metadata = info.metadata;
    let umd_metadata = metadata.umd_metadata;

    write_u32_at(&mut buf, 0, hdr.ret as u32);
    write_u32_at(&mut buf, 4, hdr.len);
    let base = offset_of!(CcmdBoQueryInfoRsp, info);
    write_u64_at(&mut buf, base + offset_of!(CcmdBoInfo, alloc_size), info.alloc_size);
    write_u64_at(&mut buf, base + offset_of!(CcmdBoInfo, phys_alignment), info.phys_alignment);
    write_u32_at(&mut buf, base + offset_of!(CcmdBoInfo, preferred_heap), info.preferred_heap);
    write_u64_at(&mut buf, base + offset_of!(CcmdBoInfo, alloc_flags), info.alloc_flags);
    let md = base + offset_of!(CcmdBoInfo, metadata);
    write_u64_at(&mut buf, md + offset_of!(AmdgpuBoMetadata, flags), metadata.flags);
    write_u64_at(&mut buf, md + offset_of!(AmdgpuBoMetadata, tiling_info), metadata.tiling_info);
    write_u32_at(&mut buf, md + offset_of!(AmdgpuBoMetadata, size_metadata), metadata.size_metadata);
    let umd = md + offset_of!(AmdgpuBoMetadata, umd_metadata);
    for (i, w) in umd_metadata.iter().enumerate() {
        write_u32_at(&mut buf, umd + i * 4, *w);
    }
    buf
}
