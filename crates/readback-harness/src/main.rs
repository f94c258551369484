mod cli;
mod surface;

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use pixel_readback::{PixelReader, ReaderConfig};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Args, Strategy};
use surface::SurfaceFactory;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    run(&args)
}

#[derive(Debug, Default)]
struct Report {
    reads: u32,
    failures: u32,
    mismatches: u32,
    total: Duration,
    slowest: Duration,
}

impl Report {
    fn record(&mut self, elapsed: Duration) {
        self.reads += 1;
        self.total += elapsed;
        self.slowest = self.slowest.max(elapsed);
    }

    fn mean(&self) -> Duration {
        if self.reads == 0 {
            Duration::ZERO
        } else {
            self.total / self.reads
        }
    }
}

fn config_for(args: &Args) -> Result<ReaderConfig> {
    let mut config = ReaderConfig::from_env()?;
    if let Some(ms) = args.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    if !config.supports(args.format) {
        config.supported_formats.push(args.format);
    }
    config.max_staging_entries = match args.strategy {
        Strategy::Pooled => config.max_staging_entries.max(1),
        Strategy::Unpooled => 0,
    };
    Ok(config)
}

/// Size for the `period`-th resize: alternates between the requested size and
/// one half again as large.
fn size_for(args: &Args, period: u32) -> (u32, u32) {
    if period % 2 == 1 {
        (args.width + args.width / 2, args.height + args.height / 2)
    } else {
        (args.width, args.height)
    }
}

/// Index of the first pixel in `bytes` that differs from `expected`.
fn first_mismatch(bytes: &[u8], expected: &[u8]) -> Option<usize> {
    bytes
        .chunks_exact(expected.len())
        .position(|px| px != expected)
}

fn run(args: &Args) -> Result<()> {
    if args.width == 0 || args.height == 0 {
        bail!("surface size must be non-zero, got {}x{}", args.width, args.height);
    }

    let config = config_for(args)?;
    let factory = SurfaceFactory::new(args.backend.api())?;
    let mut reader = PixelReader::for_host(factory.host_device(), config)?;
    let pixel = args.color.encode(args.format);

    info!(
        backend = %reader.backend_kind(),
        strategy = ?args.strategy,
        width = args.width,
        height = args.height,
        format = %args.format,
        color = %args.color,
        frames = args.frames,
        "starting readback harness"
    );

    let (mut width, mut height) = (args.width, args.height);
    let mut surface = factory.create(width, height, args.format, &pixel)?;
    let mut report = Report::default();

    for frame in 0..args.frames {
        if args.resize_every > 0 && frame > 0 && frame % args.resize_every == 0 {
            (width, height) = size_for(args, frame / args.resize_every);
            factory.dispose(surface);
            surface = factory.create(width, height, args.format, &pixel)?;
            info!(frame, width, height, "surface resized");
        }

        let start = Instant::now();
        match reader.read(surface.handle()) {
            Ok(result) => {
                let elapsed = start.elapsed();
                report.record(elapsed);
                if let Some(index) = first_mismatch(result.bytes(), &pixel) {
                    let bpp = pixel.len();
                    error!(
                        frame,
                        x = index as u32 % width,
                        y = index as u32 / width,
                        expected = ?pixel,
                        actual = ?&result.bytes()[index * bpp..(index + 1) * bpp],
                        "pixel mismatch"
                    );
                    report.mismatches += 1;
                }
                debug!(
                    frame,
                    elapsed_us = elapsed.as_micros() as u64,
                    bytes = result.bytes().len(),
                    "frame read"
                );
                reader.recycle(result);
            }
            Err(e) => {
                warn!(frame, "read failed: {e}");
                report.failures += 1;
            }
        }
    }

    let stats = reader.stats();
    info!(
        reads = report.reads,
        failures = report.failures,
        mismatches = report.mismatches,
        mean_us = report.mean().as_micros() as u64,
        slowest_us = report.slowest.as_micros() as u64,
        staging_allocations = stats.staging_allocations,
        staging_releases = stats.staging_releases,
        live_entries = stats.live_entries,
        retired_entries = stats.retired_entries,
        host_allocations = stats.host_allocations,
        "harness finished"
    );

    drop(reader);
    factory.dispose(surface);

    if report.mismatches > 0 {
        bail!("{} of {} frames returned wrong pixels", report.mismatches, args.frames);
    }
    if report.failures > 0 {
        bail!("{} of {} reads failed", report.failures, args.frames);
    }
    Ok(())
}
