//! Errors surfaced by a readback.

use std::time::Duration;

use crate::format::PixelFormat;

/// Why a read did not produce pixels.
///
/// None of these are fatal to the process. The reader never retries; skipping
/// this frame and reading again next frame is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadbackError {
    /// Null, disposed, or otherwise unusable render target handle.
    #[error("invalid render target handle")]
    InvalidTarget,

    /// The target's format is outside the configured set, unknown to the
    /// backend, or not copyable by it.
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(UnsupportedFormat),

    /// The graphics API reported a failure while creating, copying into, or
    /// mapping a staging resource. When `device_lost` is set every staging
    /// resource the reader holds is considered invalid.
    #[error("copy failed: {reason}{}", lost_suffix(.device_lost))]
    CopyFailed { reason: String, device_lost: bool },

    /// The copy did not complete within the configured bound.
    #[error("copy did not complete within {waited:?}")]
    Timeout { waited: Duration },
}

fn lost_suffix(device_lost: &bool) -> &'static str {
    if *device_lost {
        " (device lost)"
    } else {
        ""
    }
}

/// Detail for [`ReadbackError::UnsupportedFormat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedFormat {
    /// A known format the reader was not configured for, or the backend
    /// cannot copy.
    Known(PixelFormat),
    /// A native format with no [`PixelFormat`] equivalent.
    Native(String),
}

impl std::fmt::Display for UnsupportedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnsupportedFormat::Known(format) => write!(f, "{format}"),
            UnsupportedFormat::Native(name) => write!(f, "{name} (native)"),
        }
    }
}

impl ReadbackError {
    pub fn copy_failed(reason: impl Into<String>) -> Self {
        ReadbackError::CopyFailed {
            reason: reason.into(),
            device_lost: false,
        }
    }

    pub fn device_lost(reason: impl Into<String>) -> Self {
        ReadbackError::CopyFailed {
            reason: reason.into(),
            device_lost: true,
        }
    }

    pub fn unsupported(format: PixelFormat) -> Self {
        ReadbackError::UnsupportedFormat(UnsupportedFormat::Known(format))
    }

    pub fn unsupported_native(name: impl Into<String>) -> Self {
        ReadbackError::UnsupportedFormat(UnsupportedFormat::Native(name.into()))
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            ReadbackError::CopyFailed {
                device_lost: true,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            ReadbackError::InvalidTarget.to_string(),
            "invalid render target handle"
        );
        assert_eq!(
            ReadbackError::unsupported(PixelFormat::Rgba16Float).to_string(),
            "unsupported pixel format rgba16f"
        );
        assert_eq!(
            ReadbackError::unsupported_native("DXGI_FORMAT_BC1_UNORM").to_string(),
            "unsupported pixel format DXGI_FORMAT_BC1_UNORM (native)"
        );
        assert_eq!(
            ReadbackError::device_lost("Map").to_string(),
            "copy failed: Map (device lost)"
        );
        assert_eq!(
            ReadbackError::copy_failed("Map").to_string(),
            "copy failed: Map"
        );
    }

    #[test]
    fn device_lost_flag() {
        assert!(ReadbackError::device_lost("x").is_device_lost());
        assert!(!ReadbackError::copy_failed("x").is_device_lost());
        assert!(!ReadbackError::Timeout {
            waited: Duration::from_millis(5)
        }
        .is_device_lost());
    }
}
