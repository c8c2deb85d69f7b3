use std::path::PathBuf;

use amdvgpu_proto::amdgpu_drm::GemCreateFlags;
use amdvgpu_proto::virtgpu::{VIRTGPU_CONTEXT_PARAM_CAPSET_ID, VIRTGPU_CONTEXT_PARAM_NUM_RINGS};
use thiserror::Error;

pub const DEFAULT_DRM_DEVICE: &str = "/dev/dri/renderD128";
pub const DEFAULT_SHMEM_SIZE: u64 = 0x4000;
pub const DEFAULT_NUM_RINGS: u32 = 64;
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    /// virtio-gpu render node.
    pub drm_device: PathBuf,
    /// Size of the shared control blob, control block and response region included.
    pub shmem_size: u64,
    /// Number of rings requested at context init.
    pub num_rings: u32,
    /// Fallback page size when the platform cannot report one.
    pub page_size: u64,
    /// Extra context parameter set to 1 at context init, for hosts that want the guest to
    /// wait on host fences.
    pub host_fence_wait_param: Option<u64>,
    /// Bits OR-ed into the flags of every `GEM_NEW`, e.g. a host's pin-on-mmap flag.
    pub extra_gem_flags: GemCreateFlags,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            drm_device: PathBuf::from(DEFAULT_DRM_DEVICE),
            shmem_size: DEFAULT_SHMEM_SIZE,
            num_rings: DEFAULT_NUM_RINGS,
            page_size: DEFAULT_PAGE_SIZE,
            host_fence_wait_param: None,
            extra_gem_flags: GemCreateFlags::empty(),
        }
    }
}

impl ChannelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let drm_device = lookup("AMDVGPU_DRM_DEVICE").unwrap_or_else(|| DEFAULT_DRM_DEVICE.into());
        let page_size = parse_var(&lookup, "AMDVGPU_PAGE_SIZE")?.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(ConfigError::InvalidEnv("AMDVGPU_PAGE_SIZE"));
        }

        let shmem_size = parse_var(&lookup, "AMDVGPU_SHMEM_SIZE")?.unwrap_or(DEFAULT_SHMEM_SIZE);
        if shmem_size == 0 || shmem_size % page_size != 0 || shmem_size > u32::MAX as u64 {
            return Err(ConfigError::InvalidEnv("AMDVGPU_SHMEM_SIZE"));
        }

        let num_rings = parse_var(&lookup, "AMDVGPU_NUM_RINGS")?.unwrap_or(DEFAULT_NUM_RINGS as u64);
        let num_rings =
            u32::try_from(num_rings).map_err(|_| ConfigError::InvalidEnv("AMDVGPU_NUM_RINGS"))?;
        if num_rings == 0 {
            return Err(ConfigError::InvalidEnv("AMDVGPU_NUM_RINGS"));
        }

        let host_fence_wait_param = parse_var(&lookup, "AMDVGPU_HOST_FENCE_WAIT_PARAM")?;
        if matches!(
            host_fence_wait_param,
            Some(0 | VIRTGPU_CONTEXT_PARAM_CAPSET_ID | VIRTGPU_CONTEXT_PARAM_NUM_RINGS)
        ) {
            return Err(ConfigError::InvalidEnv("AMDVGPU_HOST_FENCE_WAIT_PARAM"));
        }
        let extra_gem_flags = parse_var(&lookup, "AMDVGPU_EXTRA_GEM_FLAGS")?
            .map_or(GemCreateFlags::empty(), GemCreateFlags::from_bits_retain);

        Ok(Self {
            drm_device: PathBuf::from(drm_device),
            shmem_size,
            num_rings,
            page_size,
            host_fence_wait_param,
            extra_gem_flags,
        })
    }
}

fn parse_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    parse_u64(raw.trim())
        .map(Some)
        .ok_or(ConfigError::InvalidEnv(var))
}

/// Parses decimal or `0x`-prefixed hex.
fn parse_u64(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
