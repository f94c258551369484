//! Standalone D3D11 device for tools and tests.
//!
//! Holds the D3D11 device and immediate context. A host that already has
//! a device (a game engine, a media server) hands its own device and context
//! to [`Dx11Backend`](super::Dx11Backend) directly; [`Dx11Device::new`] is
//! for standalone tools and tests.

use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use readback_core::{NativeTexture, PixelFormat};
use tracing::{debug, error};

use crate::dxgi::dxgi_format;

/// Feature levels a readback device accepts, best first. Staging copies and
/// event queries exist on all of them.
const FEATURE_LEVELS: [D3D_FEATURE_LEVEL; 3] = [
    D3D_FEATURE_LEVEL_11_1,
    D3D_FEATURE_LEVEL_11_0,
    D3D_FEATURE_LEVEL_10_0,
];

/// A D3D11 device with its immediate context.
pub struct Dx11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    driver_type: D3D_DRIVER_TYPE,
    feature_level: D3D_FEATURE_LEVEL,
}

impl Dx11Device {
    /// Hardware device, or WARP when no hardware adapter works (CI, headless).
    ///
    /// Returns `None` if D3D11 is unavailable with either driver type.
    pub fn new() -> Option<Self> {
        Self::with_driver(D3D_DRIVER_TYPE_HARDWARE).or_else(|| {
            debug!("no hardware D3D11 device; falling back to WARP");
            Self::with_driver(D3D_DRIVER_TYPE_WARP)
        })
    }

    /// Device of one driver type. BGRA support is requested so B8G8R8A8
    /// targets can be created on feature level 10.
    pub fn with_driver(driver_type: D3D_DRIVER_TYPE) -> Option<Self> {
        let mut device = None;
        let mut context = None;
        let mut feature_level = D3D_FEATURE_LEVEL::default();

        let hr = unsafe {
            D3D11CreateDevice(
                None,
                driver_type,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_SINGLETHREADED | D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&FEATURE_LEVELS),
                D3D11_SDK_VERSION,
                Some(&mut device as *mut _),
                Some(&mut feature_level as *mut _),
                Some(&mut context as *mut _),
            )
        };
        if let Err(e) = hr {
            error!("D3D11CreateDevice({driver_type:?}) failed: {e}");
            return None;
        }
        debug!(?driver_type, ?feature_level, "D3D11 readback device created");

        Some(Self {
            device: device?,
            context: context?,
            driver_type,
            feature_level,
        })
    }

    pub fn driver_type(&self) -> D3D_DRIVER_TYPE {
        self.driver_type
    }

    pub fn feature_level(&self) -> D3D_FEATURE_LEVEL {
        self.feature_level
    }

    /// Borrow the underlying `ID3D11Device`.
    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    /// Borrow the immediate device context.
    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }

    /// Create a render-target texture filled with `pixel` (one pixel's raw
    /// bytes). Used by the harness to stand in for a host render target.
    pub fn create_filled_texture(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixel: &[u8],
    ) -> Option<ID3D11Texture2D> {
        if pixel.len() != format.bytes_per_pixel() {
            error!(
                "fill pixel is {} bytes, {format} needs {}",
                pixel.len(),
                format.bytes_per_pixel()
            );
            return None;
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: dxgi_format(format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_SHADER_RESOURCE.0 | D3D11_BIND_RENDER_TARGET.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };

        let pixels: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * pixel.len())
            .collect();
        let initial = D3D11_SUBRESOURCE_DATA {
            pSysMem: pixels.as_ptr() as *const _,
            SysMemPitch: width * pixel.len() as u32,
            SysMemSlicePitch: 0,
        };

        let mut texture = None;
        let hr = unsafe {
            self.device.CreateTexture2D(
                &desc,
                Some(&initial as *const _),
                Some(&mut texture as *mut _),
            )
        };
        if let Err(e) = hr {
            error!("CreateTexture2D {width}x{height} {format} failed: {e}");
            return None;
        }
        texture
    }
}

/// The native handle for a D3D11 texture, as a host would pass it.
pub fn native_handle(texture: &ID3D11Texture2D) -> NativeTexture {
    NativeTexture::from_ptr(windows::core::Interface::as_raw(texture))
}

/// Create a `D3D11_QUERY_EVENT` for GPU synchronization.
pub fn create_event_query(device: &ID3D11Device) -> Option<ID3D11Query> {
    let desc = D3D11_QUERY_DESC {
        Query: D3D11_QUERY_EVENT,
        ..Default::default()
    };
    let mut query = None;
    unsafe { device.CreateQuery(&desc, Some(&mut query as *mut _)) }.ok()?;
    query
}
