//! Test render targets standing in for a host's frame.

use anyhow::{Context, Result};
use gpu_interop::software::SoftwareDevice;
use pixel_readback::{GraphicsApi, HostDevice, NativeTexture, PixelFormat};

#[cfg(target_os = "windows")]
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;

/// Creates solid-colour render targets on the harness's device.
pub enum SurfaceFactory {
    Software(SoftwareDevice),
    #[cfg(target_os = "windows")]
    Direct3D11(gpu_interop::dx11::Dx11Device),
}

/// A render target the harness owns for the duration of a resize period.
pub struct Surface {
    handle: NativeTexture,
    #[cfg(target_os = "windows")]
    _texture: Option<ID3D11Texture2D>,
}

impl Surface {
    pub fn handle(&self) -> NativeTexture {
        self.handle
    }
}

impl SurfaceFactory {
    pub fn new(api: GraphicsApi) -> Result<Self> {
        match api {
            #[cfg(target_os = "windows")]
            GraphicsApi::Direct3D11 => Ok(SurfaceFactory::Direct3D11(
                gpu_interop::dx11::Dx11Device::new().context("failed to create a D3D11 device")?,
            )),
            GraphicsApi::Software => Ok(SurfaceFactory::Software(SoftwareDevice::new())),
            other => anyhow::bail!("the harness cannot create {other} surfaces on this platform"),
        }
    }

    /// The device a reader should be built on.
    pub fn host_device(&self) -> HostDevice {
        match self {
            SurfaceFactory::Software(device) => HostDevice::Software(device.clone()),
            #[cfg(target_os = "windows")]
            SurfaceFactory::Direct3D11(device) => HostDevice::Direct3D11 {
                device: device.device().clone(),
                context: device.context().clone(),
            },
        }
    }

    pub fn create(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixel: &[u8],
    ) -> Result<Surface> {
        match self {
            SurfaceFactory::Software(device) => {
                let handle = device.create_surface(width, height, format);
                device.fill(handle, pixel)?;
                Ok(Surface {
                    handle,
                    #[cfg(target_os = "windows")]
                    _texture: None,
                })
            }
            #[cfg(target_os = "windows")]
            SurfaceFactory::Direct3D11(device) => {
                let texture = device
                    .create_filled_texture(width, height, format, pixel)
                    .with_context(|| {
                        format!("failed to create a {width}x{height} {format} texture")
                    })?;
                Ok(Surface {
                    handle: gpu_interop::dx11::native_handle(&texture),
                    _texture: Some(texture),
                })
            }
        }
    }

    /// Destroy a surface created by [`create`](Self::create).
    pub fn dispose(&self, surface: Surface) {
        match self {
            SurfaceFactory::Software(device) => {
                device.dispose(surface.handle);
            }
            // Dropping the surface releases the texture.
            #[cfg(target_os = "windows")]
            SurfaceFactory::Direct3D11(_) => drop(surface),
        }
    }
}
