#![forbid(unsafe_code)]

//! Guest/host ABI of the amdgpu virtio native context.
//!
//! This crate provides:
//! - Request/response record layouts and decoders for every ccmd opcode (see [`amdgpu_ccmd`]).
//! - A typed, owned request model that encodes back to the exact wire bytes (see
//!   [`ccmd_request::CcmdRequest`]).
//! - The shared control-block layout and field-presence rules (see [`amdvgpu_shmem`]).
//! - The amdgpu and virtio-gpu uapi constants that travel inside requests.
//!
//! Nothing here performs I/O.

pub mod amdgpu_ccmd;
pub mod amdgpu_drm;
pub mod amdvgpu_shmem;
pub mod ccmd_request;
pub mod ids;
pub mod virtgpu;

pub use ccmd_request::{
    decode_ccmd_request_le, AssignVaRequest, CcmdEncodeError, CcmdRequest, CreateCtxRequest,
    CsChunk, CsSubmitRequest, DrmInfoQuery, GemNewRequest, QueryInfoRequest, SetMetadataRequest,
};
pub use ids::{BlobId, BoHandle, ContextId, ResourceId, SeqNo};
