//! Response extraction from the response region.

use amdvgpu_proto::amdgpu_ccmd::{
    decode_ccmd_bo_query_info_rsp_le, decode_ccmd_create_ctx_rsp_le, decode_ccmd_rsp_le, CcmdBoInfo,
    CcmdOpcode, CcmdRsp,
};
use amdvgpu_proto::ContextId;

use crate::error::{ChannelError, Result};
use crate::mapping::BlobMapping;

/// A validated response, copied out of the shared region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CcmdResponse {
    bytes: Vec<u8>,
}

impl CcmdResponse {
    pub fn ret(&self) -> i32 {
        i32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The whole response, envelope included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes following the envelope.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[CcmdRsp::SIZE_BYTES..]
    }

    /// Turns a negative `ret` into [`ChannelError::HostError`].
    pub fn check(self, opcode: CcmdOpcode) -> Result<Self> {
        let ret = self.ret();
        if ret < 0 {
            return Err(ChannelError::HostError { opcode, ret });
        }
        Ok(self)
    }

    /// Context id of a successful `CREATE_CTX` response.
    pub fn context_id(&self) -> Result<ContextId> {
        let rsp = decode_ccmd_create_ctx_rsp_le(&self.bytes)?;
        Ok(ContextId(rsp.ctx_id))
    }

    /// Buffer info of a successful `BO_QUERY_INFO` response.
    pub fn bo_info(&self) -> Result<CcmdBoInfo> {
        Ok(decode_ccmd_bo_query_info_rsp_le(&self.bytes)?.info)
    }
}

/// Reads the response the host wrote at `rsp_mem_offset + response_offset`.
///
/// The declared length is validated against the envelope size, `expected_min_size` (for
/// successful responses) and the blob bounds before anything is copied. Error responses only
/// need to carry the envelope.
pub fn decode_response(
    mapping: &BlobMapping,
    rsp_mem_offset: u32,
    response_offset: u32,
    expected_min_size: usize,
) -> Result<CcmdResponse> {
    let size = mapping.len();
    let offset = (rsp_mem_offset as usize)
        .checked_add(response_offset as usize)
        .ok_or(ChannelError::TruncatedResponse {
            offset: usize::MAX,
            needed: CcmdRsp::SIZE_BYTES,
            size,
        })?;
    let truncated = |needed: usize| ChannelError::TruncatedResponse {
        offset,
        needed,
        size,
    };
    if offset.checked_add(CcmdRsp::SIZE_BYTES).map_or(true, |end| end > size) {
        return Err(truncated(CcmdRsp::SIZE_BYTES));
    }

    let mut envelope = [0u8; CcmdRsp::SIZE_BYTES];
    mapping.read_bytes(offset, &mut envelope)?;
    let hdr = decode_ccmd_rsp_le(&envelope)?;
    let (ret, len) = (hdr.ret, hdr.len as usize);

    let min = if ret < 0 {
        CcmdRsp::SIZE_BYTES
    } else {
        expected_min_size.max(CcmdRsp::SIZE_BYTES)
    };
    if len < min {
        return Err(ChannelError::ProtocolMismatch(format!(
            "response declares {len} bytes, expected at least {min}"
        )));
    }
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(truncated(len));
    }

    let mut bytes = vec![0u8; len];
    mapping.read_bytes(offset, &mut bytes)?;
    // The host may not rewrite the envelope between the two reads.
    if bytes[..CcmdRsp::SIZE_BYTES] != envelope {
        return Err(ChannelError::ProtocolMismatch(
            "response envelope changed while reading".into(),
        ));
    }
    Ok(CcmdResponse { bytes })
}
