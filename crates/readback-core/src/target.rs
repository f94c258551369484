//! Render target handles and the descriptors backends report for them.

use std::ffi::c_void;

use crate::format::PixelFormat;

/// Opaque native handle to a GPU-resident 2D render target.
///
/// This is what a host hands over for a texture it owns: an
/// `ID3D11Texture2D*` / `ID3D12Resource*` on Direct3D, or a texture name on
/// OpenGL. The reader only borrows the surface for the duration of a read and
/// never releases it. The zero value is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NativeTexture(u64);

impl NativeTexture {
    pub const NULL: NativeTexture = NativeTexture(0);

    /// Wrap a raw value as produced by the host.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Wrap a native texture pointer (Direct3D interface pointer).
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as usize as u64)
    }

    /// Wrap an OpenGL texture name.
    pub const fn from_gl_name(name: u32) -> Self {
        Self(name as u64)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The handle as a native pointer.
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Size and format of a render target, as queried from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl TargetDesc {
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub const fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    /// Tightly packed size of one row.
    pub const fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Tightly packed size of the whole surface.
    pub const fn byte_len(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    pub const fn staging_key(&self) -> StagingKey {
        StagingKey {
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }
}

/// Pool key: staging resources are interchangeable only when all three match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagingKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl StagingKey {
    pub const fn desc(&self) -> TargetDesc {
        TargetDesc::new(self.width, self.height, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle() {
        assert!(NativeTexture::NULL.is_null());
        assert!(NativeTexture::from_ptr(std::ptr::null_mut()).is_null());
        assert!(!NativeTexture::from_gl_name(7).is_null());
        assert_eq!(NativeTexture::default(), NativeTexture::NULL);
    }

    #[test]
    fn desc_sizes() {
        let desc = TargetDesc::new(64, 64, PixelFormat::Rgba8);
        assert_eq!(desc.row_bytes(), 256);
        assert_eq!(desc.byte_len(), 16_384);
        assert_eq!(desc.staging_key().desc(), desc);

        let wide = TargetDesc::new(3, 2, PixelFormat::Rgba32Float);
        assert_eq!(wide.row_bytes(), 48);
        assert_eq!(wide.byte_len(), 96);
    }
}
