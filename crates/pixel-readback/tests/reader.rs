use std::time::{Duration, Instant};

use gpu_interop::software::{SoftwareBackend, SoftwareDevice};
use pixel_readback::{
    NativeTexture, PixelFormat, PixelReader, ReadbackError, ReaderConfig, RowOrder,
    UnsupportedFormat,
};

fn reader(device: &SoftwareDevice, config: ReaderConfig) -> PixelReader {
    PixelReader::new(Box::new(SoftwareBackend::new(device.clone())), config)
}

/// An opaque, fully saturated red pixel in `format`.
fn red(format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgba8 => vec![255, 0, 0, 255],
        PixelFormat::Bgra8 => vec![0, 0, 255, 255],
        // 1.0 as binary16 is 0x3C00.
        PixelFormat::Rgba16Float => [0x3C00u16, 0, 0, 0x3C00]
            .iter()
            .flat_map(|c| c.to_le_bytes())
            .collect(),
        PixelFormat::Rgba32Float => [1.0f32, 0.0, 0.0, 1.0]
            .iter()
            .flat_map(|c| c.to_le_bytes())
            .collect(),
    }
}

fn filled(device: &SoftwareDevice, width: u32, height: u32, format: PixelFormat) -> NativeTexture {
    let target = device.create_surface(width, height, format);
    device.fill(target, &red(format)).unwrap();
    target
}

/// Surface whose row `y` is filled with the byte `y`.
fn striped(device: &SoftwareDevice, width: u32, height: u32) -> NativeTexture {
    let target = device.create_surface(width, height, PixelFormat::Rgba8);
    let row = width as usize * 4;
    let pixels: Vec<u8> = (0..height)
        .flat_map(|y| std::iter::repeat(y as u8).take(row))
        .collect();
    device.write_pixels(target, &pixels).unwrap();
    target
}

#[test]
fn red_64x64_rgba8() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 64, 64, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default());

    let result = reader.read(target).unwrap();
    assert_eq!(result.bytes().len(), 16_384);
    assert_eq!(&result.bytes()[0..4], &[255, 0, 0, 255]);
    assert_eq!(result.bytes().chunks_exact(4).count(), 4096);
    assert!(result.bytes().chunks_exact(4).all(|px| px == [255, 0, 0, 255]));
    assert_eq!(result.row_stride(), 256);
    assert_eq!(result.pixel(63, 63), Some(&[255u8, 0, 0, 255][..]));
}

#[test]
fn every_supported_format_and_size_reads_back_the_fill() {
    let device = SoftwareDevice::new();
    let config = ReaderConfig::default().with_formats(PixelFormat::ALL);
    let mut reader = reader(&device, config);

    for format in PixelFormat::ALL {
        for (w, h) in [(1, 1), (3, 5), (64, 64), (257, 3)] {
            let target = filled(&device, w, h, format);
            let result = reader.read(target).unwrap();
            let bpp = format.bytes_per_pixel();
            assert_eq!(result.bytes().len(), w as usize * h as usize * bpp, "{format} {w}x{h}");
            let expected = red(format);
            assert!(
                result.bytes().chunks_exact(bpp).all(|px| px == expected),
                "{format} {w}x{h}"
            );
            reader.recycle(result);
        }
    }
}

#[test]
fn repeated_reads_are_identical_and_reuse_staging() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 32, 16, PixelFormat::Bgra8);
    let mut reader = reader(&device, ReaderConfig::default());

    let first = reader.read(target).unwrap();
    for _ in 0..5 {
        let again = reader.read(target).unwrap();
        assert_eq!(again, first);
        reader.recycle(again);
    }

    assert_eq!(reader.stats().staging_allocations, 1);
    assert_eq!(device.stats().staging_created, 1);
    assert_eq!(device.stats().copies, 6);
}

#[test]
fn resize_releases_previous_staging() {
    let device = SoftwareDevice::new();
    let small = filled(&device, 8, 8, PixelFormat::Rgba8);
    let large = filled(&device, 16, 16, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default());

    reader.read(small).unwrap();
    let result = reader.read(large).unwrap();
    assert_eq!(result.bytes().len(), 16 * 16 * 4);

    let stats = reader.stats();
    assert_eq!(stats.staging_allocations, 2);
    assert_eq!(stats.staging_releases, 1);
    assert_eq!(stats.live_entries, 1);
    assert_eq!(device.stats().live_staging, 1);
}

#[test]
fn larger_pool_keeps_several_sizes() {
    let device = SoftwareDevice::new();
    let small = filled(&device, 8, 8, PixelFormat::Rgba8);
    let large = filled(&device, 16, 16, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default().with_max_staging_entries(2));

    for _ in 0..3 {
        reader.read(small).unwrap();
        reader.read(large).unwrap();
    }
    assert_eq!(reader.stats().staging_allocations, 2);
    assert_eq!(reader.stats().staging_releases, 0);
}

#[test]
fn invalid_target_leaves_pool_unchanged() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 4, 4, PixelFormat::Rgba8);
    let doomed = filled(&device, 4, 4, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default());
    reader.read(target).unwrap();

    let before = reader.stats();
    let copies = device.stats().copies;

    assert_eq!(reader.read(NativeTexture::NULL), Err(ReadbackError::InvalidTarget));
    assert!(device.dispose(doomed));
    assert_eq!(reader.read(doomed), Err(ReadbackError::InvalidTarget));
    assert_eq!(
        reader.read(NativeTexture::from_raw(0xdead_beef)),
        Err(ReadbackError::InvalidTarget)
    );

    assert_eq!(reader.stats(), before);
    assert_eq!(device.stats().copies, copies);
}

#[test]
fn unconfigured_format_is_rejected_before_allocating() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 4, 4, PixelFormat::Rgba32Float);
    let mut reader = reader(&device, ReaderConfig::default());

    assert_eq!(
        reader.read(target),
        Err(ReadbackError::UnsupportedFormat(UnsupportedFormat::Known(
            PixelFormat::Rgba32Float
        )))
    );
    assert_eq!(reader.stats().staging_allocations, 0);
    assert_eq!(device.stats().staging_created, 0);
}

#[test]
fn format_the_backend_cannot_copy_is_rejected() {
    let device = SoftwareDevice::new();
    device.set_copyable_formats([PixelFormat::Rgba8]);
    let target = filled(&device, 4, 4, PixelFormat::Bgra8);
    let mut reader = reader(&device, ReaderConfig::default());

    let err = reader.read(target).unwrap_err();
    assert!(matches!(err, ReadbackError::UnsupportedFormat(_)), "{err}");
    assert_eq!(reader.stats().staging_allocations, 0);
}

#[test]
fn stalled_fence_times_out_within_bound() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 16, 16, PixelFormat::Rgba8);
    let timeout = Duration::from_millis(50);
    let mut reader = reader(&device, ReaderConfig::default().with_timeout(timeout));

    device.stall_fences(true);
    let start = Instant::now();
    let err = reader.read(target).unwrap_err();
    let elapsed = start.elapsed();

    let ReadbackError::Timeout { waited } = err else {
        panic!("expected a timeout, got {err}");
    };
    assert!(waited >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(1), "took {elapsed:?}");

    // Once the fence fires the in-flight entry is reclaimed, not reallocated.
    device.stall_fences(false);
    let result = reader.read(target).unwrap();
    assert!(result.bytes().chunks_exact(4).all(|px| px == [255, 0, 0, 255]));
    assert_eq!(reader.stats().staging_allocations, 1);
}

#[test]
fn entry_still_in_flight_is_waited_on_not_reallocated() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);
    let mut reader = reader(
        &device,
        ReaderConfig::default().with_timeout(Duration::from_millis(10)),
    );

    device.stall_fences(true);
    assert!(matches!(reader.read(target), Err(ReadbackError::Timeout { .. })));
    assert!(matches!(reader.read(target), Err(ReadbackError::Timeout { .. })));
    assert_eq!(reader.stats().retired_entries, 0);
    assert_eq!(reader.stats().staging_allocations, 1);

    device.stall_fences(false);
    reader.read(target).unwrap();
    let stats = reader.stats();
    assert_eq!(stats.staging_allocations, 1);
    assert_eq!(stats.staging_releases, 0);
    assert_eq!(stats.live_entries, 1);
    assert_eq!(device.stats().live_staging, 1);
}

#[test]
fn persistent_stall_keeps_one_staging_resource() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);
    let timeout = Duration::from_millis(1);
    let mut reader = reader(&device, ReaderConfig::default().with_timeout(timeout));

    device.stall_fences(true);
    for _ in 0..10 {
        let err = reader.read(target).unwrap_err();
        let ReadbackError::Timeout { waited } = err else {
            panic!("expected a timeout, got {err}");
        };
        assert!(waited >= timeout);
    }

    let stats = reader.stats();
    assert_eq!(stats.staging_allocations, 1);
    assert_eq!(stats.retired_entries, 0);
    assert_eq!(stats.live_entries, 1);
    assert_eq!(device.stats().live_staging, 1);
    // Only the first read submitted a copy; later ones waited on it.
    assert_eq!(device.stats().copies, 1);
}

#[test]
fn unpooled_stall_keeps_one_staging_resource() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);
    let mut reader = reader(
        &device,
        ReaderConfig::default()
            .with_timeout(Duration::from_millis(1))
            .with_max_staging_entries(0),
    );

    device.stall_fences(true);
    for _ in 0..5 {
        assert!(matches!(reader.read(target), Err(ReadbackError::Timeout { .. })));
    }
    assert_eq!(device.stats().live_staging, 1);

    device.stall_fences(false);
    reader.read(target).unwrap();
    assert_eq!(reader.stats().staging_allocations, 1);
    assert_eq!(device.stats().live_staging, 0);
}

#[test]
fn slow_copy_completes_before_timeout() {
    let device = SoftwareDevice::new();
    device.set_copy_latency(5);
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default());

    let result = reader.read(target).unwrap();
    assert_eq!(result.bytes().len(), 256);
}

#[test]
fn copy_failure_is_reported_and_not_retried() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default());

    device.fail_next_copy("out of memory");
    let err = reader.read(target).unwrap_err();
    assert_eq!(
        err,
        ReadbackError::CopyFailed {
            reason: "out of memory".into(),
            device_lost: false
        }
    );
    assert_eq!(device.stats().copies, 0);

    // The staging entry survives an ordinary failure.
    reader.read(target).unwrap();
    assert_eq!(reader.stats().staging_allocations, 1);
}

#[test]
fn device_loss_discards_pool_and_reallocates() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default());
    reader.read(target).unwrap();

    device.lose_device();
    let err = reader.read(target).unwrap_err();
    assert!(err.is_device_lost(), "{err}");
    assert_eq!(reader.stats().live_entries, 0);

    device.restore();
    let result = reader.read(target).unwrap();
    assert!(result.bytes().chunks_exact(4).all(|px| px == [255, 0, 0, 255]));
    assert_eq!(reader.stats().staging_allocations, 2);
}

#[test]
fn bottom_up_staging_is_returned_top_down() {
    let device = SoftwareDevice::new();
    device.set_row_order(RowOrder::BottomUp);
    let target = striped(&device, 3, 4);
    let mut reader = reader(&device, ReaderConfig::default());

    let result = reader.read(target).unwrap();
    assert_eq!(result.row_order(), RowOrder::TopDown);
    for y in 0..4 {
        assert!(result.row(y).unwrap().iter().all(|&b| b == y as u8), "row {y}");
    }
}

#[test]
fn bottom_up_output_when_requested() {
    let device = SoftwareDevice::new();
    let target = striped(&device, 3, 4);
    let config = ReaderConfig::default().with_output_order(RowOrder::BottomUp);
    let mut reader = reader(&device, config);

    let result = reader.read(target).unwrap();
    assert_eq!(result.row_order(), RowOrder::BottomUp);
    assert!(result.row(0).unwrap().iter().all(|&b| b == 3));
    assert!(result.row(3).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn unpooled_strategy_allocates_per_read() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default().with_max_staging_entries(0));

    for _ in 0..3 {
        let result = reader.read(target).unwrap();
        assert_eq!(result.bytes().len(), 256);
        reader.recycle(result);
    }

    let stats = reader.stats();
    assert_eq!(stats.staging_allocations, 3);
    assert_eq!(stats.staging_releases, 3);
    assert_eq!(stats.live_entries, 0);
    assert_eq!(stats.host_allocations, 3);
    assert_eq!(device.stats().live_staging, 0);
}

#[test]
fn recycled_buffers_are_reused() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);
    let mut reader = reader(&device, ReaderConfig::default());

    let result = reader.read(target).unwrap();
    reader.recycle(result);
    let result = reader.read(target).unwrap();
    assert_eq!(reader.stats().host_allocations, 1);

    // Kept by the caller: the next read needs a fresh buffer, staging is
    // still shared.
    let second = reader.read(target).unwrap();
    assert_eq!(reader.stats().host_allocations, 2);
    assert_eq!(reader.stats().staging_allocations, 1);
    assert_eq!(result, second);
}

#[test]
fn read_into_sizes_the_caller_buffer() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 5, 7, PixelFormat::Bgra8);
    let mut reader = reader(&device, ReaderConfig::default());

    let mut buf = vec![9; 3];
    let desc = reader.read_into(target, &mut buf).unwrap();
    assert_eq!(desc.byte_len(), 5 * 7 * 4);
    assert_eq!(buf.len(), desc.byte_len());
    assert!(buf.chunks_exact(4).all(|px| px == [0, 0, 255, 255]));
    assert_eq!(reader.stats().host_allocations, 0);
}

#[test]
fn reads_do_not_modify_the_source() {
    let device = SoftwareDevice::new();
    let target = striped(&device, 6, 6);
    let before = device.pixels(target).unwrap();
    let mut reader = reader(&device, ReaderConfig::default());
    reader.read(target).unwrap();
    assert_eq!(device.pixels(target).unwrap(), before);
}

#[test]
fn teardown_and_drop_release_staging() {
    let device = SoftwareDevice::new();
    let target = filled(&device, 8, 8, PixelFormat::Rgba8);

    let mut reader = reader(&device, ReaderConfig::default());
    reader.read(target).unwrap();
    reader.teardown();
    assert_eq!(device.stats().live_staging, 0);

    reader.read(target).unwrap();
    assert_eq!(device.stats().live_staging, 1);
    drop(reader);
    assert_eq!(device.stats().live_staging, 0);
}
