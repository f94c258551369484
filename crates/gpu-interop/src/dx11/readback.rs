//! D3D11 readback through CPU-readable staging textures.
//!
//! Each staging entry is a `D3D11_USAGE_STAGING` texture plus its own
//! `D3D11_QUERY_EVENT`. A read copies mip 0 of the source into the staging
//! texture on the immediate context, ends the query, polls it until the GPU
//! reports the copy done, then maps the staging texture and strips the
//! driver's row padding (`RowPitch`).
//!
//! The immediate context is single-threaded; call every method from the
//! thread that owns it (the host's render thread).

use std::collections::HashMap;
use std::ffi::c_void;

use windows::core::{IUnknown, Interface};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use readback_core::{
    copy_rows, required_source_len, NativeTexture, PixelFormat, ReadLayout, ReadbackError,
    StagingKey, TargetDesc,
};
use tracing::{debug, error, trace};

use super::device::create_event_query;
use crate::backend::{CopyStatus, GraphicsApi, ReadbackBackend, StagingId};
use crate::dxgi;

/// A staging texture and the query fenced behind the last copy into it.
struct StagingTexture {
    key: StagingKey,
    texture: ID3D11Texture2D,
    query: ID3D11Query,
    pending: bool,
}

/// Readback backend for a host-owned D3D11 device.
pub struct Dx11Backend {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    staging: HashMap<u64, StagingTexture>,
    next_id: u64,
    lost: bool,
}

impl Dx11Backend {
    /// Build a backend on the host's device and immediate context (cloned COM
    /// references; the host keeps ownership).
    pub fn new(device: &ID3D11Device, context: &ID3D11DeviceContext) -> Self {
        Self {
            device: device.clone(),
            context: context.clone(),
            staging: HashMap::new(),
            next_id: 0,
            lost: false,
        }
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }

    fn device_removed(&self) -> bool {
        unsafe { self.device.GetDeviceRemovedReason() }.is_err()
    }

    /// Turn a failed call into a `ReadbackError`, latching device loss.
    fn fail(&mut self, what: &str, e: &windows::core::Error) -> ReadbackError {
        let err = dxgi::copy_error(what, e, self.device_removed());
        if err.is_device_lost() {
            error!("D3D11 device lost during {what}: {e}");
            self.lost = true;
        } else {
            error!("D3D11 {what} failed: {e}");
        }
        err
    }

    fn check_device(&mut self) -> Result<(), ReadbackError> {
        if self.lost {
            return Err(ReadbackError::device_lost("D3D11 device removed"));
        }
        if let Err(e) = unsafe { self.device.GetDeviceRemovedReason() } {
            error!("D3D11 device removed: {e}");
            self.lost = true;
            return Err(ReadbackError::device_lost(format!("D3D11 device removed: {e}")));
        }
        Ok(())
    }
}

/// Resolve a native handle to the texture it points at.
///
/// The host guarantees the pointer refers to a live D3D11 resource for the
/// duration of the call; only null is detectable here.
fn source_texture(target: NativeTexture) -> Result<ID3D11Texture2D, ReadbackError> {
    if target.is_null() {
        return Err(ReadbackError::InvalidTarget);
    }
    let raw: *mut c_void = target.as_ptr();
    let unknown =
        unsafe { IUnknown::from_raw_borrowed(&raw) }.ok_or(ReadbackError::InvalidTarget)?;
    unknown
        .cast::<ID3D11Texture2D>()
        .map_err(|_| ReadbackError::InvalidTarget)
}

impl ReadbackBackend for Dx11Backend {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn kind(&self) -> GraphicsApi {
        GraphicsApi::Direct3D11
    }

    fn supports_format(&self, _format: PixelFormat) -> bool {
        true
    }

    fn describe(&self, target: NativeTexture) -> Result<TargetDesc, ReadbackError> {
        let texture = source_texture(target)?;
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };

        if desc.SampleDesc.Count > 1 {
            return Err(ReadbackError::unsupported_native(format!(
                "multisampled ({}x) texture",
                desc.SampleDesc.Count
            )));
        }
        let format =
            dxgi::pixel_format(desc.Format).ok_or_else(|| dxgi::unsupported(desc.Format))?;
        Ok(TargetDesc::new(desc.Width, desc.Height, format))
    }

    fn create_staging(&mut self, key: StagingKey) -> Result<StagingId, ReadbackError> {
        self.check_device()?;

        let desc = D3D11_TEXTURE2D_DESC {
            Width: key.width,
            Height: key.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: dxgi::dxgi_format(key.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };

        let mut texture = None;
        if let Err(e) =
            unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture as *mut _)) }
        {
            return Err(self.fail("CreateTexture2D (staging)", &e));
        }
        let texture = texture
            .ok_or_else(|| ReadbackError::copy_failed("CreateTexture2D returned no texture"))?;
        let query = create_event_query(&self.device)
            .ok_or_else(|| ReadbackError::copy_failed("CreateQuery(D3D11_QUERY_EVENT) failed"))?;

        self.next_id += 1;
        let id = self.next_id;
        self.staging.insert(
            id,
            StagingTexture {
                key,
                texture,
                query,
                pending: false,
            },
        );
        debug!(id, ?key, "D3D11 staging texture created");
        Ok(StagingId(id))
    }

    fn release_staging(&mut self, id: StagingId) {
        // Dropping the COM references releases them; D3D11 defers destruction
        // of resources still referenced by queued commands.
        if self.staging.remove(&id.0).is_some() {
            debug!(%id, "D3D11 staging texture released");
        }
    }

    fn copy_to_staging(
        &mut self,
        target: NativeTexture,
        id: StagingId,
    ) -> Result<(), ReadbackError> {
        self.check_device()?;
        let desc = self.describe(target)?;
        let source = source_texture(target)?;
        let staging = self
            .staging
            .get_mut(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        if staging.key != desc.staging_key() {
            return Err(ReadbackError::copy_failed(format!(
                "{id} is {:?}, source is {desc:?}",
                staging.key
            )));
        }

        unsafe {
            self.context.CopySubresourceRegion(
                &staging.texture,
                0,
                0,
                0,
                0,
                &source,
                0,
                None,
            );
            // Signal the event query behind the copy so poll_copy can detect
            // completion.
            self.context.End(&staging.query);
        }
        staging.pending = true;
        trace!(%id, key = ?staging.key, "D3D11 copy submitted");
        self.check_device()
    }

    fn poll_copy(&mut self, id: StagingId) -> Result<CopyStatus, ReadbackError> {
        self.check_device()?;
        let staging = self
            .staging
            .get_mut(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        if !staging.pending {
            return Ok(CopyStatus::Complete);
        }

        // For D3D11_QUERY_EVENT, GetData writes a BOOL: TRUE when the GPU is done.
        // S_FALSE (not ready) is a success HRESULT, so the windows crate maps it
        // to Ok(()) and leaves the zero-initialised BOOL untouched.
        let mut done: u32 = 0;
        let hr = unsafe {
            self.context.GetData(
                &staging.query,
                Some(&mut done as *mut u32 as *mut c_void),
                std::mem::size_of::<u32>() as u32,
                0,
            )
        };
        if let Err(e) = hr {
            return Err(self.fail("GetData", &e));
        }
        if done != 0 {
            staging.pending = false;
            Ok(CopyStatus::Complete)
        } else {
            Ok(CopyStatus::Pending)
        }
    }

    fn read_staging(
        &mut self,
        id: StagingId,
        layout: &ReadLayout,
        out: &mut [u8],
    ) -> Result<(), ReadbackError> {
        self.check_device()?;
        let texture = match self.staging.get(&id.0) {
            Some(s) if s.pending => {
                return Err(ReadbackError::copy_failed(format!(
                    "{id} mapped before its copy completed"
                )))
            }
            Some(s) => s.texture.clone(),
            None => return Err(ReadbackError::copy_failed(format!("unknown {id}"))),
        };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        let map = unsafe {
            self.context
                .Map(&texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped as *mut _))
        };
        if let Err(e) = map {
            return Err(self.fail("Map", &e));
        }

        let result = if mapped.pData.is_null() {
            Err(ReadbackError::copy_failed("Map returned a null pointer"))
        } else {
            let pitch = mapped.RowPitch as usize;
            let len = required_source_len(
                pitch,
                layout.desc.row_bytes(),
                layout.desc.height as usize,
            );
            // SAFETY: a mapped staging texture spans RowPitch * (height - 1)
            // bytes plus at least one full row.
            let src = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };
            copy_rows(src, pitch, out, layout)
        };

        unsafe { self.context.Unmap(&texture, 0) };
        result
    }

    fn device_lost(&self) -> bool {
        self.lost || self.device_removed()
    }
}
