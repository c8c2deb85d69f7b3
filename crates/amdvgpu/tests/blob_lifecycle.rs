use std::sync::Arc;

use amdvgpu::{
    BlobAllocation, BlobManager, ChannelError, LoopbackFaults, LoopbackTransport, MapError,
    VirtGpuTransport,
};
use amdvgpu_proto::amdgpu_drm::GemDomain;
use amdvgpu_proto::BlobId;

fn manager() -> (Arc<LoopbackTransport>, BlobManager) {
    let host = Arc::new(LoopbackTransport::default());
    let transport: Arc<dyn VirtGpuTransport> = host.clone();
    (host, BlobManager::new(transport))
}

#[test]
fn create_resolve_map_data_blob() {
    let (host, blobs) = manager();
    let shmem = BlobAllocation {
        preferred_heap: GemDomain::SH_MEM,
        ..BlobAllocation::new(0x4000)
    };
    let mut control = blobs.create(&shmem, true).unwrap();
    let control_res = control.resolve().unwrap();
    assert_eq!(control.blob_id(), BlobId::CONTROL);

    let mut blob = blobs.create(&BlobAllocation::new(0x4000), false).unwrap();
    let res_id = blob.resolve().unwrap();
    let mapping = blob.map().unwrap();
    assert_eq!(mapping.len(), 0x4000);
    assert_ne!(mapping.addr(), 0);

    assert_eq!(blob.byte_size(), 0x4000);
    assert_ne!(blob.blob_id().get(), 0);
    assert_ne!(blob.blob_id(), control.blob_id());
    assert_ne!(res_id.get(), 0);
    assert_ne!(res_id, control_res);
    assert_eq!(blob.resource_id(), Some(res_id));
    assert!(blob.backing_offset().is_some());
    assert!(blob.mapped_address().is_some());
    assert_eq!(host.live_blob_count(), 2);
}

#[test]
fn data_blob_ids_are_distinct() {
    let (_host, blobs) = manager();
    let a = blobs.create(&BlobAllocation::new(0x1000), false).unwrap();
    let b = blobs.create(&BlobAllocation::new(0x1000), false).unwrap();
    assert_eq!(a.blob_id(), BlobId(1));
    assert_eq!(b.blob_id(), BlobId(2));
}

#[test]
fn pattern_survives_the_mapping() {
    let (_host, blobs) = manager();
    let mut blob = blobs.create(&BlobAllocation::new(0x4000), false).unwrap();
    let mapping = blob.map().unwrap();

    let pattern: Vec<u8> = (0..0x4000u32).map(|i| (i * 7 + 3) as u8).collect();
    mapping.write_bytes(0, &pattern).unwrap();
    let mut back = vec![0u8; pattern.len()];
    mapping.read_bytes(0, &mut back).unwrap();
    assert_eq!(back, pattern);

    mapping.fill(0x100, 0x10, 0xAA).unwrap();
    let mut window = [0u8; 0x10];
    mapping.read_bytes(0x100, &mut window).unwrap();
    assert_eq!(window, [0xAA; 0x10]);
}

#[test]
fn map_is_idempotent() {
    let (_host, blobs) = manager();
    let mut blob = blobs.create(&BlobAllocation::new(0x2000), false).unwrap();
    let first = blob.map().unwrap().addr();
    let second = blob.map().unwrap().addr();
    assert_eq!(first, second);
}

#[test]
fn double_release_is_a_no_op() {
    let (host, blobs) = manager();
    let mut blob = blobs.create(&BlobAllocation::new(0x1000), false).unwrap();
    blob.map().unwrap();
    assert_eq!(host.live_blob_count(), 1);

    blob.release();
    assert!(blob.is_released());
    assert!(blob.mapping().is_none());
    assert_eq!(host.live_blob_count(), 0);

    blob.release();
    assert_eq!(host.live_blob_count(), 0);
    drop(blob);
    assert_eq!(host.live_blob_count(), 0);
}

#[test]
fn released_blob_cannot_be_resolved_or_mapped() {
    let (_host, blobs) = manager();
    let mut blob = blobs.create(&BlobAllocation::new(0x1000), false).unwrap();
    blob.resolve().unwrap();
    blob.release();

    assert!(matches!(
        blob.resolve(),
        Err(ChannelError::ResolutionError { .. })
    ));
    assert!(matches!(blob.map(), Err(MapError::Released(id)) if id == BlobId(1)));
}

#[test]
fn drop_releases_the_handle() {
    let (host, blobs) = manager();
    {
        let _blob = blobs.create(&BlobAllocation::new(0x1000), false).unwrap();
        assert_eq!(host.live_blob_count(), 1);
    }
    assert_eq!(host.live_blob_count(), 0);
}

#[test]
fn size_must_be_page_multiple() {
    let (host, blobs) = manager();
    for size in [0, 1, 0x1001, 0x4000 + 0x800] {
        let err = blobs.create(&BlobAllocation::new(size), false).unwrap_err();
        assert!(
            matches!(err, ChannelError::AlignmentError { size: s, page_size: 4096 } if s == size),
            "{size:#x}: {err}"
        );
    }
    assert_eq!(host.live_blob_count(), 0);
    assert_eq!(amdvgpu::align_to_page(0x4800, 4096), Some(0x5000));
}

#[test]
fn only_gtt_and_shared_memory_heaps() {
    let (_host, blobs) = manager();
    for heap in [GemDomain::VRAM, GemDomain::CPU, GemDomain::GTT | GemDomain::VRAM] {
        let alloc = BlobAllocation {
            preferred_heap: heap,
            ..BlobAllocation::new(0x1000)
        };
        assert!(matches!(
            blobs.create(&alloc, false),
            Err(ChannelError::UnsupportedHeap(h)) if h == heap
        ));
    }
}

#[test]
fn transport_failures_map_to_distinct_errors() {
    let (host, blobs) = manager();

    host.set_faults(LoopbackFaults::CREATE_BLOB);
    assert!(matches!(
        blobs.create(&BlobAllocation::new(0x1000), false),
        Err(ChannelError::AllocationError(_))
    ));

    host.set_faults(LoopbackFaults::RESOURCE_INFO);
    let mut blob = blobs.create(&BlobAllocation::new(0x1000), false).unwrap();
    assert!(matches!(
        blob.resolve(),
        Err(ChannelError::ResolutionError { blob_id, .. }) if blob_id == blob.blob_id()
    ));

    host.set_faults(LoopbackFaults::MAP_OFFSET);
    assert!(matches!(blob.map(), Err(MapError::OffsetUnavailable(_))));

    host.set_faults(LoopbackFaults::MMAP);
    assert!(matches!(blob.map(), Err(MapError::MappingRejected(_))));
    assert!(blob.mapping().is_none());

    host.set_faults(LoopbackFaults::empty());
    blob.map().unwrap();
}

#[test]
fn failed_close_still_marks_released() {
    let (host, blobs) = manager();
    let mut blob = blobs.create(&BlobAllocation::new(0x1000), false).unwrap();
    host.set_faults(LoopbackFaults::CLOSE);
    blob.release();
    assert!(blob.is_released());
    host.set_faults(LoopbackFaults::empty());
    blob.release();
    // The host never saw the close.
    assert_eq!(host.live_blob_count(), 1);
}

#[test]
fn lost_manager_spares_the_control_blob() {
    let (host, blobs) = manager();
    let shmem = BlobAllocation {
        preferred_heap: GemDomain::SH_MEM,
        ..BlobAllocation::new(0x4000)
    };
    let mut control = blobs.create(&shmem, true).unwrap();
    let mut data = blobs.create(&BlobAllocation::new(0x1000), false).unwrap();

    assert!(blobs.mark_lost());
    assert!(!blobs.mark_lost());
    assert!(blobs.is_lost());

    control.resolve().unwrap();
    control.map().unwrap();
    assert!(matches!(data.resolve(), Err(ChannelError::AsyncContextLost)));
    assert!(matches!(data.map(), Err(MapError::ChannelLost(id)) if id == BlobId(1)));

    drop(data);
    assert_eq!(host.live_blob_count(), 1);
}
