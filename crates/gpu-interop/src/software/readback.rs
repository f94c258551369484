//! [`ReadbackBackend`] over a [`SoftwareDevice`].

use readback_core::{
    copy_rows, NativeTexture, PixelFormat, ReadLayout, ReadbackError, RowOrder, StagingKey,
    TargetDesc,
};
use tracing::{debug, trace};

use super::device::{Staging, SoftwareDevice};
use crate::backend::{CopyStatus, GraphicsApi, ReadbackBackend, StagingId};

/// Software readback backend.
///
/// Copies land in staging memory immediately but only become visible after
/// the device's configured latency, mirroring how a GPU fence completes some
/// time after submission.
pub struct SoftwareBackend {
    device: SoftwareDevice,
}

impl SoftwareBackend {
    pub fn new(device: SoftwareDevice) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &SoftwareDevice {
        &self.device
    }
}

fn lost() -> ReadbackError {
    ReadbackError::device_lost("software device removed")
}

impl ReadbackBackend for SoftwareBackend {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn kind(&self) -> GraphicsApi {
        GraphicsApi::Software
    }

    fn row_order(&self) -> RowOrder {
        self.device.lock().row_order
    }

    fn supports_format(&self, format: PixelFormat) -> bool {
        self.device.lock().copyable.contains(&format)
    }

    fn describe(&self, target: NativeTexture) -> Result<TargetDesc, ReadbackError> {
        if target.is_null() {
            return Err(ReadbackError::InvalidTarget);
        }
        self.device
            .lock()
            .surfaces
            .get(&target.raw())
            .map(|s| s.desc)
            .ok_or(ReadbackError::InvalidTarget)
    }

    fn create_staging(&mut self, key: StagingKey) -> Result<StagingId, ReadbackError> {
        let mut state = self.device.lock();
        if state.lost {
            return Err(lost());
        }
        let row_bytes = key.desc().row_bytes();
        let align = state.pitch_alignment;
        let pitch = row_bytes.div_ceil(align) * align;
        let id = state.next_id();
        state.staging.insert(
            id,
            Staging {
                key,
                data: vec![0; pitch * key.height as usize],
                pitch,
                pending: None,
            },
        );
        state.stats.staging_created += 1;
        state.stats.live_staging = state.staging.len();
        debug!(id, ?key, pitch, "software staging created");
        Ok(StagingId(id))
    }

    fn release_staging(&mut self, id: StagingId) {
        let mut state = self.device.lock();
        if state.staging.remove(&id.0).is_some() {
            state.stats.staging_released += 1;
            state.stats.live_staging = state.staging.len();
            debug!(%id, "software staging released");
        }
    }

    fn copy_to_staging(
        &mut self,
        target: NativeTexture,
        id: StagingId,
    ) -> Result<(), ReadbackError> {
        let mut state = self.device.lock();
        if state.lost {
            return Err(lost());
        }
        if let Some(reason) = state.fail_next_copy.take() {
            return Err(ReadbackError::copy_failed(reason));
        }

        let state = &mut *state;
        let surface = state
            .surfaces
            .get(&target.raw())
            .ok_or(ReadbackError::InvalidTarget)?;
        let staging = state
            .staging
            .get_mut(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        if surface.desc.staging_key() != staging.key {
            return Err(ReadbackError::copy_failed(format!(
                "{id} is {:?}, source is {:?}",
                staging.key, surface.desc
            )));
        }

        let row_bytes = surface.desc.row_bytes();
        let height = surface.desc.height as usize;
        for (row, src) in surface.pixels.chunks_exact(row_bytes.max(1)).enumerate() {
            let dst_row = match state.row_order {
                RowOrder::TopDown => row,
                RowOrder::BottomUp => height - 1 - row,
            };
            let start = dst_row * staging.pitch;
            staging.data[start..start + row_bytes].copy_from_slice(src);
        }
        staging.pending = Some(state.copy_latency);
        state.stats.copies += 1;
        trace!(%id, latency = state.copy_latency, "software copy submitted");
        Ok(())
    }

    fn poll_copy(&mut self, id: StagingId) -> Result<CopyStatus, ReadbackError> {
        let mut state = self.device.lock();
        if state.lost {
            return Err(lost());
        }
        let stalled = state.stalled;
        let staging = state
            .staging
            .get_mut(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        Ok(match staging.pending {
            None => CopyStatus::Complete,
            Some(_) if stalled => CopyStatus::Pending,
            Some(0) => {
                staging.pending = None;
                CopyStatus::Complete
            }
            Some(n) => {
                staging.pending = Some(n - 1);
                CopyStatus::Pending
            }
        })
    }

    fn read_staging(
        &mut self,
        id: StagingId,
        layout: &ReadLayout,
        out: &mut [u8],
    ) -> Result<(), ReadbackError> {
        let mut state = self.device.lock();
        if state.lost {
            return Err(lost());
        }
        let staging = state
            .staging
            .get(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        if staging.pending.is_some() {
            return Err(ReadbackError::copy_failed(format!(
                "{id} mapped before its copy completed"
            )));
        }
        copy_rows(&staging.data, staging.pitch, out, layout)?;
        state.stats.maps += 1;
        Ok(())
    }

    fn device_lost(&self) -> bool {
        self.device.is_lost()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn layout(desc: TargetDesc, backend: &SoftwareBackend) -> ReadLayout {
        ReadLayout::new(desc, backend.row_order(), RowOrder::TopDown)
    }

    #[test]
    fn copy_poll_read() {
        let device = SoftwareDevice::new();
        device.set_copy_latency(2);
        let target = device.create_surface(3, 2, PixelFormat::Rgba8);
        device.fill(target, &[10, 20, 30, 40]).unwrap();

        let mut backend = SoftwareBackend::new(device.clone());
        let desc = backend.describe(target).unwrap();
        let id = backend.create_staging(desc.staging_key()).unwrap();
        backend.copy_to_staging(target, id).unwrap();

        assert_eq!(backend.poll_copy(id).unwrap(), CopyStatus::Pending);
        assert_eq!(backend.poll_copy(id).unwrap(), CopyStatus::Pending);
        assert_eq!(backend.poll_copy(id).unwrap(), CopyStatus::Complete);

        let mut out = vec![0; desc.byte_len()];
        backend
            .read_staging(id, &layout(desc, &backend), &mut out)
            .unwrap();
        assert!(out.chunks_exact(4).all(|p| p == [10, 20, 30, 40]));
        assert_eq!(device.stats().maps, 1);
    }

    #[test]
    fn map_before_completion_is_refused() {
        let device = SoftwareDevice::new();
        device.stall_fences(true);
        let target = device.create_surface(1, 1, PixelFormat::Rgba8);
        let mut backend = SoftwareBackend::new(device);
        let desc = backend.describe(target).unwrap();
        let id = backend.create_staging(desc.staging_key()).unwrap();
        backend.copy_to_staging(target, id).unwrap();

        let mut out = vec![0; 4];
        let err = backend.read_staging(id, &layout(desc, &backend), &mut out);
        assert!(matches!(err, Err(ReadbackError::CopyFailed { .. })));
    }

    #[test]
    fn default_wait_times_out_on_stalled_fence() {
        let device = SoftwareDevice::new();
        device.stall_fences(true);
        let target = device.create_surface(1, 1, PixelFormat::Rgba8);
        let mut backend = SoftwareBackend::new(device);
        let id = backend
            .create_staging(backend.describe(target).unwrap().staging_key())
            .unwrap();
        backend.copy_to_staging(target, id).unwrap();
        let status = backend.wait_copy(id, Duration::from_millis(5)).unwrap();
        assert_eq!(status, CopyStatus::Pending);
    }

    #[test]
    fn bottom_up_staging_is_stored_reversed() {
        let device = SoftwareDevice::new();
        device.set_row_order(RowOrder::BottomUp);
        device.set_pitch_alignment(1);
        let target = device.create_surface(1, 2, PixelFormat::Rgba8);
        device
            .write_pixels(target, &[1, 1, 1, 1, 2, 2, 2, 2])
            .unwrap();

        let mut backend = SoftwareBackend::new(device);
        let desc = backend.describe(target).unwrap();
        let id = backend.create_staging(desc.staging_key()).unwrap();
        backend.copy_to_staging(target, id).unwrap();
        backend.poll_copy(id).unwrap();

        let mut native = vec![0; 8];
        let as_stored = ReadLayout { desc, flip: false };
        backend.read_staging(id, &as_stored, &mut native).unwrap();
        assert_eq!(native, [2, 2, 2, 2, 1, 1, 1, 1]);
    }

    #[test]
    fn lost_device_fails_every_call() {
        let device = SoftwareDevice::new();
        let target = device.create_surface(1, 1, PixelFormat::Rgba8);
        let mut backend = SoftwareBackend::new(device.clone());
        let key = backend.describe(target).unwrap().staging_key();
        device.lose_device();
        assert!(backend.device_lost());
        assert!(backend.create_staging(key).unwrap_err().is_device_lost());
    }

    #[test]
    fn null_and_disposed_targets_are_invalid() {
        let device = SoftwareDevice::new();
        let target = device.create_surface(1, 1, PixelFormat::Rgba8);
        let backend = SoftwareBackend::new(device.clone());
        assert_eq!(
            backend.describe(NativeTexture::NULL),
            Err(ReadbackError::InvalidTarget)
        );
        device.dispose(target);
        assert_eq!(backend.describe(target), Err(ReadbackError::InvalidTarget));
    }
}
