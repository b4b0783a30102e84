use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::device::{CopyDirection, DeviceContext, MemoryLocation, MemoryOps, SimulatedDevice};
use crate::frame::{FrameDesc, FrameRecord, FrameSource, PixelFormat, SourceRelease};
use crate::syncmem::SyncedHead;

fn device() -> Arc<SimulatedDevice> {
    Arc::new(SimulatedDevice::new(2))
}

fn ops(dev: &Arc<SimulatedDevice>) -> Arc<dyn MemoryOps> {
    Arc::clone(dev) as Arc<dyn MemoryOps>
}

fn ptr(data: &mut [u8]) -> NonNull<u8> {
    NonNull::new(data.as_mut_ptr()).unwrap()
}

fn release_flag() -> (Arc<AtomicBool>, SourceRelease) {
    let flag = Arc::new(AtomicBool::new(false));
    let hook = {
        let flag = Arc::clone(&flag);
        SourceRelease::new(move || flag.store(true, Ordering::SeqCst))
    };
    (flag, hook)
}

#[test]
fn test_plane_sizes() {
    let dev = device();
    let nv12 = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Nv12, 5, 3), ops(&dev));
    assert_eq!(nv12.plane_count(), 2);
    assert_eq!(nv12.plane_bytes(0), 15);
    assert_eq!(nv12.plane_bytes(1), 8);
    assert_eq!(nv12.plane_bytes(2), 0);
    assert_eq!(nv12.total_bytes(), 23);

    let mut desc = FrameDesc::packed(1, PixelFormat::Bgr24, 4, 2);
    desc.strides = vec![8];
    let bgr = FrameRecord::new(desc, ops(&dev));
    assert_eq!(bgr.plane_count(), 1);
    assert_eq!(bgr.plane_bytes(0), 48);
}

#[test]
fn test_ingest_host_to_host_releases_source_immediately() {
    let dev = device();
    let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Nv12, 4, 2), ops(&dev));
    let mut y = vec![10u8; 8];
    let mut uv = vec![20u8; 4];
    let (released, hook) = release_flag();

    frame.ingest(FrameSource::host(vec![ptr(&mut y), ptr(&mut uv)]).with_release(hook), false);

    assert!(released.load(Ordering::SeqCst));
    assert_eq!(dev.stats().copies(CopyDirection::HostToHost), 2);
    assert_eq!(frame.plane(0).read_host(), vec![10u8; 8]);
    assert_eq!(frame.plane(1).read_host(), vec![20u8; 4]);
    assert_eq!(frame.dst_device_id(), None);
    assert_eq!(frame.source().location, MemoryLocation::Host);
}

#[test]
fn test_ingest_host_to_device_uses_destination() {
    let dev = device();
    let desc = FrameDesc::packed(0, PixelFormat::Bgr24, 2, 2).with_dst_device(1);
    let frame = FrameRecord::new(desc, ops(&dev));
    let mut pixels: Vec<u8> = (0..12).collect();

    frame.ingest(FrameSource::host(vec![ptr(&mut pixels)]), true);

    let plane = frame.plane(0);
    assert_eq!(plane.head(), SyncedHead::HeadAtDevice);
    assert_eq!(plane.device_id(), 1);
    assert_eq!(frame.dst_device_id(), Some(1));
    assert_eq!(dev.stats().copies(CopyDirection::HostToDevice), 1);
    assert_eq!(plane.read_host(), (0..12).collect::<Vec<u8>>());
}

#[test]
fn test_host_upload_without_destination_is_rejected() {
    let dev = device();
    let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Bgr24, 2, 2), ops(&dev));
    let mut pixels = vec![0u8; 12];
    let source = FrameSource::host(vec![ptr(&mut pixels)]);

    let err = frame.ingest_destination(&source, true).unwrap_err();
    assert!(err.to_string().contains("needs a destination device"));
    assert_eq!(frame.ingest_destination(&source, false).unwrap(), 0);

    let source = FrameSource::device(DeviceContext::new(1, 0), vec![ptr(&mut pixels)]);
    assert_eq!(frame.ingest_destination(&source, true).unwrap(), 1);
    assert_eq!(dev.stats().total_copies(), 0);
}

#[test]
fn test_ingest_device_zero_copy_keeps_release_until_drop() {
    let dev = device();
    let mut y = vec![1u8; 8];
    let mut uv = vec![2u8; 4];
    let (released, hook) = release_flag();
    {
        let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Nv21, 4, 2), ops(&dev));
        let source = FrameSource::device(DeviceContext::new(1, 0), vec![ptr(&mut y), ptr(&mut uv)])
            .with_release(hook);
        frame.ingest(source, true);

        assert!(!released.load(Ordering::SeqCst));
        assert_eq!(frame.plane(0).head(), SyncedHead::HeadAtDevice);
        assert_eq!(frame.dst_device_id(), Some(1));
        assert_eq!(frame.ctx(), DeviceContext::new(1, 0));
        assert_eq!(dev.stats().device_allocs, 0);
        assert_eq!(dev.stats().total_copies(), 0);
    }
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(dev.stats().device_frees, 0);
}

#[test]
fn test_ingest_device_to_host() {
    let dev = device();
    let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Rgb24, 1, 1), ops(&dev));
    let mut pixel = vec![1u8, 2, 3];
    frame.ingest(FrameSource::device(DeviceContext::new(0, -1), vec![ptr(&mut pixel)]), false);

    assert_eq!(dev.stats().copies(CopyDirection::DeviceToHost), 1);
    assert_eq!(frame.plane(0).head(), SyncedHead::HeadAtHost);
    assert_eq!(frame.plane(0).read_host(), vec![1, 2, 3]);
}

#[test]
fn test_derived_image_is_cached_until_invalidated() {
    let dev = device();
    let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Rgb24, 2, 1), ops(&dev));
    let mut pixels = vec![1u8, 2, 3, 4, 5, 6];
    frame.ingest(FrameSource::host(vec![ptr(&mut pixels)]), false);

    let first = frame.derived_image();
    assert_eq!(first.data, vec![3, 2, 1, 6, 5, 4]);
    assert!(Arc::ptr_eq(&first, &frame.derived_image()));

    frame.plane(0).write_host(&[9, 9, 9, 0, 0, 0]);
    frame.invalidate_derived();
    let second = frame.derived_image();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.pixel(0, 0), [9, 9, 9]);
}

#[test]
fn test_derived_image_from_nv12_and_nv21() {
    let dev = device();
    let mut y = vec![100u8; 4];
    let mut uv = vec![128u8, 200];

    let nv12 = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Nv12, 2, 2), ops(&dev));
    nv12.ingest(FrameSource::host(vec![ptr(&mut y), ptr(&mut uv)]), false);
    assert_eq!(nv12.derived_image().pixel(1, 1), [100, 48, 200]);

    let nv21 = FrameRecord::new(FrameDesc::packed(1, PixelFormat::Nv21, 2, 2), ops(&dev));
    nv21.ingest(FrameSource::host(vec![ptr(&mut y), ptr(&mut uv)]), false);
    assert_eq!(nv21.derived_image().pixel(0, 0), [227, 75, 100]);
}

#[test]
fn test_derived_image_odd_height_clamps_chroma_row() {
    let dev = device();
    let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Nv12, 2, 3), ops(&dev));
    frame.allocate_planes();
    frame.plane(0).write_host(&[50; 6]);
    frame.plane(1).write_host(&[128; 3]);

    let image = frame.derived_image();
    assert_eq!(image.data.len(), 18);
    assert_eq!(image.pixel(1, 2), [50, 50, 50]);
}

#[test]
fn test_retarget_device_moves_planes() {
    let dev = device();
    let desc = FrameDesc::packed(0, PixelFormat::Nv12, 4, 2).with_dst_device(0);
    let frame = FrameRecord::new(desc, ops(&dev));
    let mut y = vec![7u8; 8];
    let mut uv = vec![8u8; 4];
    frame.ingest(FrameSource::host(vec![ptr(&mut y), ptr(&mut uv)]), true);

    frame.retarget_device(1);

    assert_eq!(frame.dst_device_id(), Some(1));
    assert_eq!(frame.plane(0).device_id(), 1);
    assert_eq!(frame.plane(1).head(), SyncedHead::HeadAtDevice);
    assert_eq!(dev.stats().copies(CopyDirection::PeerToPeer), 2);
    assert_eq!(frame.plane(0).read_host(), vec![7u8; 8]);
}

#[test]
fn test_set_device_context_all_pins_without_copy() {
    let dev = device();
    let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Bgr24, 2, 2), ops(&dev));
    frame.allocate_planes();
    frame.set_device_context_all(1);
    assert_eq!(frame.plane(0).device_id(), 1);
    assert_eq!(frame.dst_device_id(), Some(1));
    assert_eq!(dev.stats().total_copies(), 0);
}

#[test]
fn test_invalid_format_is_rejected() {
    let dev = device();
    let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Invalid, 2, 2), ops(&dev));
    let err = frame.validate_format("derived_image").unwrap_err();
    assert!(err.to_string().contains("invalid pixel format"));
    assert_eq!(frame.plane_count(), 0);

    let frame = FrameRecord::new(FrameDesc::packed(0, PixelFormat::Nv12, 2, 2), ops(&dev));
    assert!(frame.validate_format("derived_image").is_ok());
}
