//! Pixel formats a reader can copy back.

use std::fmt;
use std::str::FromStr;

/// Uncompressed color formats with a fixed per-pixel size.
///
/// Only formats whose CPU layout matches the GPU layout byte-for-byte are
/// listed here. Anything else is rejected with
/// [`ReadbackError::UnsupportedFormat`](crate::ReadbackError::UnsupportedFormat)
/// rather than converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bits per channel, R G B A byte order.
    Rgba8,
    /// 8 bits per channel, B G R A byte order.
    Bgra8,
    /// 16-bit float per channel.
    Rgba16Float,
    /// 32-bit float per channel.
    Rgba32Float,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 4] = [
        PixelFormat::Rgba8,
        PixelFormat::Bgra8,
        PixelFormat::Rgba16Float,
        PixelFormat::Rgba32Float,
    ];

    /// Size of one pixel in bytes.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgba16Float => 8,
            PixelFormat::Rgba32Float => 16,
        }
    }

    /// Short lowercase name, also accepted by [`FromStr`].
    pub const fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Bgra8 => "bgra8",
            PixelFormat::Rgba16Float => "rgba16f",
            PixelFormat::Rgba32Float => "rgba32f",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a format name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pixel format '{0}'")]
pub struct UnknownFormat(pub String);

impl FromStr for PixelFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rgba8" | "rgba32" | "r8g8b8a8" => Ok(PixelFormat::Rgba8),
            "bgra8" | "bgra32" | "b8g8r8a8" => Ok(PixelFormat::Bgra8),
            "rgba16f" | "rgbahalf" => Ok(PixelFormat::Rgba16Float),
            "rgba32f" | "rgbafloat" => Ok(PixelFormat::Rgba32Float),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_pixel_matches_layout() {
        assert_eq!(PixelFormat::Rgba8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Bgra8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgba16Float.bytes_per_pixel(), 8);
        assert_eq!(PixelFormat::Rgba32Float.bytes_per_pixel(), 16);
    }

    #[test]
    fn names_parse_back() {
        for format in PixelFormat::ALL {
            assert_eq!(format.name().parse::<PixelFormat>(), Ok(format));
        }
        assert_eq!(" RGBA32 ".parse::<PixelFormat>(), Ok(PixelFormat::Rgba8));
        assert_eq!(
            "r5g6b5".parse::<PixelFormat>(),
            Err(UnknownFormat("r5g6b5".to_string()))
        );
    }
}
