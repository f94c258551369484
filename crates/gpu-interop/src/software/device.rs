//! In-process software device.
//!
//! Holds CPU-side render targets and staging resources and simulates the
//! asynchronous completion of copies between them. Cloning a
//! [`SoftwareDevice`] yields another handle to the same device, so a test can
//! keep one handle to drive and inspect the device while a reader owns a
//! [`SoftwareBackend`](super::SoftwareBackend) built from another.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use readback_core::{NativeTexture, PixelFormat, RowOrder, StagingKey, TargetDesc};
use tracing::debug;

/// Counters and gauges for resources the device has created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub staging_created: u64,
    pub staging_released: u64,
    pub live_staging: usize,
    pub copies: u64,
    pub maps: u64,
}

pub(crate) struct Surface {
    pub(crate) desc: TargetDesc,
    /// Top-down, tightly packed.
    pub(crate) pixels: Vec<u8>,
}

pub(crate) struct Staging {
    pub(crate) key: StagingKey,
    /// Rows in the device's row order, `pitch` bytes apart.
    pub(crate) data: Vec<u8>,
    pub(crate) pitch: usize,
    /// Polls remaining until the last copy completes; `None` when idle.
    pub(crate) pending: Option<u32>,
}

pub(crate) struct DeviceState {
    next_id: u64,
    pub(crate) surfaces: HashMap<u64, Surface>,
    pub(crate) staging: HashMap<u64, Staging>,
    pub(crate) row_order: RowOrder,
    pub(crate) pitch_alignment: usize,
    pub(crate) copy_latency: u32,
    pub(crate) stalled: bool,
    pub(crate) fail_next_copy: Option<String>,
    pub(crate) lost: bool,
    pub(crate) copyable: HashSet<PixelFormat>,
    pub(crate) stats: SoftwareStats,
}

impl DeviceState {
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            next_id: 0,
            surfaces: HashMap::new(),
            staging: HashMap::new(),
            row_order: RowOrder::TopDown,
            pitch_alignment: 256,
            copy_latency: 0,
            stalled: false,
            fail_next_copy: None,
            lost: false,
            copyable: PixelFormat::ALL.into_iter().collect(),
            stats: SoftwareStats::default(),
        }
    }
}

/// A software graphics device with CPU-resident render targets.
#[derive(Clone, Default)]
pub struct SoftwareDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl std::fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SoftwareDevice")
            .field("surfaces", &state.surfaces.len())
            .field("stats", &state.stats)
            .field("lost", &state.lost)
            .finish()
    }
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a zero-filled render target.
    pub fn create_surface(&self, width: u32, height: u32, format: PixelFormat) -> NativeTexture {
        let desc = TargetDesc::new(width, height, format);
        let mut state = self.lock();
        let id = state.next_id();
        state.surfaces.insert(
            id,
            Surface {
                desc,
                pixels: vec![0; desc.byte_len()],
            },
        );
        debug!(id, width, height, %format, "software surface created");
        NativeTexture::from_raw(id)
    }

    /// Dispose a render target. Later reads of it fail with `InvalidTarget`.
    pub fn dispose(&self, target: NativeTexture) -> bool {
        self.lock().surfaces.remove(&target.raw()).is_some()
    }

    /// Fill every pixel of `target` with `pixel` (one pixel's raw bytes).
    pub fn fill(&self, target: NativeTexture, pixel: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let Some(surface) = state.surfaces.get_mut(&target.raw()) else {
            bail!("no software surface {}", target.raw());
        };
        let bpp = surface.desc.bytes_per_pixel();
        if pixel.len() != bpp {
            bail!(
                "fill pixel is {} bytes, {} needs {bpp}",
                pixel.len(),
                surface.desc.format
            );
        }
        for chunk in surface.pixels.chunks_exact_mut(bpp) {
            chunk.copy_from_slice(pixel);
        }
        Ok(())
    }

    /// Replace the contents of `target` (top-down, tightly packed).
    pub fn write_pixels(&self, target: NativeTexture, pixels: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let Some(surface) = state.surfaces.get_mut(&target.raw()) else {
            bail!("no software surface {}", target.raw());
        };
        if pixels.len() != surface.pixels.len() {
            bail!(
                "wrote {} bytes to a {} byte surface",
                pixels.len(),
                surface.pixels.len()
            );
        }
        surface.pixels.copy_from_slice(pixels);
        Ok(())
    }

    /// Current contents of `target` (top-down, tightly packed).
    pub fn pixels(&self, target: NativeTexture) -> Option<Vec<u8>> {
        self.lock()
            .surfaces
            .get(&target.raw())
            .map(|s| s.pixels.clone())
    }

    /// Row order of staging memory (default top-down).
    pub fn set_row_order(&self, order: RowOrder) {
        self.lock().row_order = order;
    }

    /// Staging row pitch alignment in bytes (default 256).
    pub fn set_pitch_alignment(&self, alignment: usize) {
        self.lock().pitch_alignment = alignment.max(1);
    }

    /// Number of polls a copy stays pending before completing (default 0).
    pub fn set_copy_latency(&self, polls: u32) {
        self.lock().copy_latency = polls;
    }

    /// While stalled, no copy ever completes.
    pub fn stall_fences(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// Make the next copy fail with `reason`.
    pub fn fail_next_copy(&self, reason: impl Into<String>) {
        self.lock().fail_next_copy = Some(reason.into());
    }

    /// Restrict the formats copies accept.
    pub fn set_copyable_formats(&self, formats: impl IntoIterator<Item = PixelFormat>) {
        self.lock().copyable = formats.into_iter().collect();
    }

    /// Simulate device removal. Every call on a backend fails until
    /// [`restore`](Self::restore).
    pub fn lose_device(&self) {
        self.lock().lost = true;
    }

    /// Recover from a simulated device removal. Staging resources created
    /// before the loss are gone; render targets survive.
    pub fn restore(&self) {
        let mut state = self.lock();
        state.lost = false;
        let dropped = state.staging.len();
        state.staging.clear();
        state.stats.live_staging = 0;
        debug!(dropped, "software device restored");
    }

    pub fn is_lost(&self) -> bool {
        self.lock().lost
    }

    pub fn stats(&self) -> SoftwareStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_read_back_surface() {
        let device = SoftwareDevice::new();
        let target = device.create_surface(2, 2, PixelFormat::Bgra8);
        device.fill(target, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            device.pixels(target).unwrap(),
            [1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]
        );
    }

    #[test]
    fn fill_rejects_wrong_pixel_size() {
        let device = SoftwareDevice::new();
        let target = device.create_surface(2, 2, PixelFormat::Rgba16Float);
        assert!(device.fill(target, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn dispose_removes_surface() {
        let device = SoftwareDevice::new();
        let target = device.create_surface(1, 1, PixelFormat::Rgba8);
        assert!(device.dispose(target));
        assert!(!device.dispose(target));
        assert!(device.pixels(target).is_none());
        assert!(device.fill(target, &[0; 4]).is_err());
    }

    #[test]
    fn clones_share_state() {
        let device = SoftwareDevice::new();
        let other = device.clone();
        let target = device.create_surface(1, 1, PixelFormat::Rgba8);
        other.fill(target, &[9, 9, 9, 9]).unwrap();
        assert_eq!(device.pixels(target).unwrap(), [9, 9, 9, 9]);
        other.lose_device();
        assert!(device.is_lost());
    }
}
