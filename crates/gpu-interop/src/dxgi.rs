//! DXGI format mapping and device-removal detection shared by the D3D11 and
//! D3D12 backends.

use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_DEVICE_HUNG, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET,
    DXGI_ERROR_DRIVER_INTERNAL_ERROR,
};

use readback_core::{PixelFormat, ReadbackError};

/// Canonical DXGI format used for staging copies of `format`.
pub fn dxgi_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::Rgba8 => DXGI_FORMAT_R8G8B8A8_UNORM,
        PixelFormat::Bgra8 => DXGI_FORMAT_B8G8R8A8_UNORM,
        PixelFormat::Rgba16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        PixelFormat::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
    }
}

/// Map a native DXGI format onto a [`PixelFormat`].
///
/// Typeless and sRGB variants share the byte layout of their UNORM sibling,
/// and copies between members of one typeless group are legal, so they map
/// to the same format.
pub fn pixel_format(format: DXGI_FORMAT) -> Option<PixelFormat> {
    match format {
        DXGI_FORMAT_R8G8B8A8_UNORM
        | DXGI_FORMAT_R8G8B8A8_UNORM_SRGB
        | DXGI_FORMAT_R8G8B8A8_TYPELESS
        | DXGI_FORMAT_R8G8B8A8_UINT => Some(PixelFormat::Rgba8),
        DXGI_FORMAT_B8G8R8A8_UNORM
        | DXGI_FORMAT_B8G8R8A8_UNORM_SRGB
        | DXGI_FORMAT_B8G8R8A8_TYPELESS => Some(PixelFormat::Bgra8),
        DXGI_FORMAT_R16G16B16A16_FLOAT | DXGI_FORMAT_R16G16B16A16_TYPELESS => {
            Some(PixelFormat::Rgba16Float)
        }
        DXGI_FORMAT_R32G32B32A32_FLOAT | DXGI_FORMAT_R32G32B32A32_TYPELESS => {
            Some(PixelFormat::Rgba32Float)
        }
        _ => None,
    }
}

/// `UnsupportedFormat` for a DXGI format with no [`PixelFormat`].
pub fn unsupported(format: DXGI_FORMAT) -> ReadbackError {
    ReadbackError::unsupported_native(format!("DXGI_FORMAT({})", format.0))
}

/// Whether `error` means the device is gone rather than one call failing.
pub fn is_device_removed(error: &windows::core::Error) -> bool {
    let code = error.code();
    code == DXGI_ERROR_DEVICE_REMOVED
        || code == DXGI_ERROR_DEVICE_RESET
        || code == DXGI_ERROR_DEVICE_HUNG
        || code == DXGI_ERROR_DRIVER_INTERNAL_ERROR
}

/// Classify a failed D3D call.
pub fn copy_error(what: &str, error: &windows::core::Error, removed: bool) -> ReadbackError {
    if removed || is_device_removed(error) {
        ReadbackError::device_lost(format!("{what}: {error}"))
    } else {
        ReadbackError::copy_failed(format!("{what}: {error}"))
    }
}
