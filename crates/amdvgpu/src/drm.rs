//! virtio-gpu render-node transport (Linux).

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::ptr;

use amdvgpu_proto::virtgpu::{
    VIRTGPU_CONTEXT_PARAM_CAPSET_ID, VIRTGPU_CONTEXT_PARAM_NUM_RINGS, VIRTGPU_DRM_CAPSET_DRM,
    VIRTGPU_EXECBUF_RING_IDX,
};
use amdvgpu_proto::{BoHandle, ResourceId};

use crate::config::ChannelConfig;
use crate::error::TransportError;
use crate::mapping::{BlobMapping, MappedRegion};
use crate::transport::{CreateBlob, VirtGpuTransport};

const DRM_IOCTL_BASE: u32 = b'd' as u32;
const DRM_COMMAND_BASE: u32 = 0x40;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

const fn iowr<T>(nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, core::mem::size_of::<T>())
}

const fn iow<T>(nr: u32) -> u32 {
    ioc(IOC_WRITE, nr, core::mem::size_of::<T>())
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct DrmVirtgpuMap {
    offset: u64,
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct DrmVirtgpuExecbuffer {
    flags: u32,
    size: u32,
    command: u64,
    bo_handles: u64,
    num_bo_handles: u32,
    fence_fd: i32,
    ring_idx: u32,
    syncobj_stride: u32,
    num_in_syncobjs: u32,
    num_out_syncobjs: u32,
    in_syncobjs: u64,
    out_syncobjs: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct DrmVirtgpuResourceInfo {
    bo_handle: u32,
    res_handle: u32,
    size: u32,
    blob_mem: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct DrmVirtgpuResourceCreateBlob {
    blob_mem: u32,
    blob_flags: u32,
    bo_handle: u32,
    res_handle: u32,
    size: u64,
    pad: u32,
    cmd_size: u32,
    cmd: u64,
    blob_id: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct DrmVirtgpuContextSetParam {
    param: u64,
    value: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct DrmVirtgpuContextInit {
    num_params: u32,
    pad: u32,
    ctx_set_params: u64,
}

const _: () = {
    assert!(core::mem::size_of::<DrmVirtgpuMap>() == 16);
    assert!(core::mem::size_of::<DrmVirtgpuExecbuffer>() == 64);
    assert!(core::mem::size_of::<DrmVirtgpuResourceInfo>() == 16);
    assert!(core::mem::size_of::<DrmVirtgpuResourceCreateBlob>() == 48);
    assert!(core::mem::size_of::<DrmVirtgpuContextInit>() == 16);
};

const DRM_IOCTL_GEM_CLOSE: u32 = iow::<DrmGemClose>(0x09);
const DRM_IOCTL_VIRTGPU_MAP: u32 = iowr::<DrmVirtgpuMap>(DRM_COMMAND_BASE + 0x01);
const DRM_IOCTL_VIRTGPU_EXECBUFFER: u32 = iowr::<DrmVirtgpuExecbuffer>(DRM_COMMAND_BASE + 0x02);
const DRM_IOCTL_VIRTGPU_RESOURCE_INFO: u32 = iowr::<DrmVirtgpuResourceInfo>(DRM_COMMAND_BASE + 0x05);
const DRM_IOCTL_VIRTGPU_RESOURCE_CREATE_BLOB: u32 =
    iowr::<DrmVirtgpuResourceCreateBlob>(DRM_COMMAND_BASE + 0x0a);
const DRM_IOCTL_VIRTGPU_CONTEXT_INIT: u32 = iowr::<DrmVirtgpuContextInit>(DRM_COMMAND_BASE + 0x0b);

/// Issues `request`, retrying while the kernel reports `EINTR` or `EAGAIN`.
fn drm_ioctl<T>(file: &File, request: u32, arg: &mut T, op: &'static str) -> Result<(), TransportError> {
    loop {
        // SAFETY: `arg` is a live `#[repr(C)]` struct whose size is encoded in `request`.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg as *mut T) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(TransportError::Io { op, source: err }),
        }
    }
}

/// A `mmap(MAP_SHARED)` window onto a blob; unmapped on drop.
struct MmapRegion {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MappedRegion for MmapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful `mmap` and are unmapped exactly once.
        if unsafe { libc::munmap(self.ptr.cast(), self.len) } != 0 {
            tracing::warn!(
                "munmap of {:#x}+{:#x} failed: {}",
                self.ptr as usize,
                self.len,
                std::io::Error::last_os_error()
            );
        }
    }
}

pub struct DrmTransport {
    file: File,
    page_size: u64,
}

impl DrmTransport {
    /// Opens the render node and initialises a native-context (DRM capset) on it.
    pub fn open(config: &ChannelConfig) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.drm_device)
            .map_err(|source| TransportError::Io {
                op: "open render node",
                source,
            })?;

        let mut params = vec![
            DrmVirtgpuContextSetParam {
                param: VIRTGPU_CONTEXT_PARAM_CAPSET_ID,
                value: VIRTGPU_DRM_CAPSET_DRM,
            },
            DrmVirtgpuContextSetParam {
                param: VIRTGPU_CONTEXT_PARAM_NUM_RINGS,
                value: config.num_rings as u64,
            },
        ];
        if let Some(param) = config.host_fence_wait_param {
            params.push(DrmVirtgpuContextSetParam { param, value: 1 });
        }
        let mut init = DrmVirtgpuContextInit {
            num_params: params.len() as u32,
            pad: 0,
            ctx_set_params: params.as_mut_ptr() as u64,
        };
        drm_ioctl(&file, DRM_IOCTL_VIRTGPU_CONTEXT_INIT, &mut init, "VIRTGPU_CONTEXT_INIT")?;

        // SAFETY: sysconf has no memory-safety preconditions.
        let sys_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if sys_page > 0 {
            sys_page as u64
        } else {
            config.page_size
        };

        tracing::debug!(
            "opened {} (rings={}, page_size={page_size:#x})",
            config.drm_device.display(),
            config.num_rings
        );
        Ok(Self { file, page_size })
    }
}

impl VirtGpuTransport for DrmTransport {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn create_blob(&self, req: &CreateBlob<'_>) -> Result<BoHandle, TransportError> {
        let cmd_size = u32::try_from(req.cmd.len())
            .map_err(|_| TransportError::Rejected(format!("command of {} bytes", req.cmd.len())))?;
        let mut args = DrmVirtgpuResourceCreateBlob {
            blob_mem: req.blob_mem as u32,
            blob_flags: req.blob_flags.bits(),
            size: req.size,
            cmd_size,
            cmd: if req.cmd.is_empty() {
                0
            } else {
                req.cmd.as_ptr() as u64
            },
            blob_id: req.blob_id.get(),
            ..Default::default()
        };
        drm_ioctl(
            &self.file,
            DRM_IOCTL_VIRTGPU_RESOURCE_CREATE_BLOB,
            &mut args,
            "VIRTGPU_RESOURCE_CREATE_BLOB",
        )?;
        Ok(BoHandle(args.bo_handle))
    }

    fn resource_info(&self, handle: BoHandle) -> Result<ResourceId, TransportError> {
        let mut args = DrmVirtgpuResourceInfo {
            bo_handle: handle.get(),
            ..Default::default()
        };
        drm_ioctl(
            &self.file,
            DRM_IOCTL_VIRTGPU_RESOURCE_INFO,
            &mut args,
            "VIRTGPU_RESOURCE_INFO",
        )?;
        Ok(ResourceId(args.res_handle))
    }

    fn map_offset(&self, handle: BoHandle) -> Result<u64, TransportError> {
        let mut args = DrmVirtgpuMap {
            handle: handle.get(),
            ..Default::default()
        };
        drm_ioctl(&self.file, DRM_IOCTL_VIRTGPU_MAP, &mut args, "VIRTGPU_MAP")?;
        Ok(args.offset)
    }

    fn mmap(&self, offset: u64, size: u64) -> Result<BlobMapping, TransportError> {
        let len = usize::try_from(size)
            .map_err(|_| TransportError::Rejected(format!("mapping of {size:#x} bytes")))?;
        let off = libc::off_t::try_from(offset)
            .map_err(|_| TransportError::Rejected(format!("mapping offset {offset:#x}")))?;

        // SAFETY: a fresh shared mapping of our own fd; the kernel validates offset and size.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                off,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TransportError::last_os_error("mmap"));
        }
        Ok(BlobMapping::new(Box::new(MmapRegion {
            ptr: ptr.cast(),
            len,
        })))
    }

    fn submit(&self, cmd: &[u8], ring_idx: u32) -> Result<(), TransportError> {
        let size = u32::try_from(cmd.len())
            .map_err(|_| TransportError::Rejected(format!("command of {} bytes", cmd.len())))?;
        let mut args = DrmVirtgpuExecbuffer {
            flags: if ring_idx != 0 { VIRTGPU_EXECBUF_RING_IDX } else { 0 },
            size,
            command: cmd.as_ptr() as u64,
            fence_fd: -1,
            ring_idx,
            ..Default::default()
        };
        drm_ioctl(
            &self.file,
            DRM_IOCTL_VIRTGPU_EXECBUFFER,
            &mut args,
            "VIRTGPU_EXECBUFFER",
        )
    }

    fn close(&self, handle: BoHandle) -> Result<(), TransportError> {
        let mut args = DrmGemClose {
            handle: handle.get(),
            pad: 0,
        };
        drm_ioctl(&self.file, DRM_IOCTL_GEM_CLOSE, &mut args, "GEM_CLOSE")
    }
}
