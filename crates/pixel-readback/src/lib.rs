//! Synchronous pixel readback from GPU render targets.
//!
//! A [`PixelReader`] copies a host render target into a pooled CPU-readable
//! staging resource, blocks until the GPU signals the copy complete (bounded
//! by [`ReaderConfig::timeout`]), and returns the pixels tightly packed.
//!
//! ```no_run
//! use gpu_interop::software::SoftwareDevice;
//! use pixel_readback::{HostDevice, PixelReader, PixelFormat, ReaderConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = SoftwareDevice::new();
//! let target = device.create_surface(64, 64, PixelFormat::Rgba8);
//! device.fill(target, &[255, 0, 0, 255])?;
//!
//! let mut reader = PixelReader::for_host(HostDevice::Software(device), ReaderConfig::default())?;
//! let pixels = reader.read(target)?;
//! assert_eq!(pixels.bytes().len(), 64 * 64 * 4);
//! reader.recycle(pixels);
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod reader;
pub mod select;

pub use pool::{EntryState, PoolStats, StagingPool};
pub use reader::{PixelReader, ReadbackResult};
pub use select::HostDevice;

pub use gpu_interop::{GraphicsApi, ReadbackBackend};
pub use readback_core::{
    NativeTexture, PixelFormat, ReadbackError, ReaderConfig, RowOrder, TargetDesc,
    UnsupportedFormat,
};
