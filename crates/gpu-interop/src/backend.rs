//! Common interface for graphics-API-specific readback.

use std::fmt;
use std::time::{Duration, Instant};

use readback_core::{
    NativeTexture, PixelFormat, ReadLayout, ReadbackError, RowOrder, StagingKey, TargetDesc,
};

/// Graphics APIs a backend can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphicsApi {
    Direct3D11,
    Direct3D12,
    OpenGl,
    Software,
}

impl GraphicsApi {
    /// Backends compiled into this build, in order of preference.
    pub fn available() -> &'static [GraphicsApi] {
        #[cfg(target_os = "windows")]
        {
            &[
                GraphicsApi::Direct3D11,
                GraphicsApi::Direct3D12,
                GraphicsApi::OpenGl,
                GraphicsApi::Software,
            ]
        }
        #[cfg(not(target_os = "windows"))]
        {
            &[GraphicsApi::OpenGl, GraphicsApi::Software]
        }
    }

    pub fn is_available(self) -> bool {
        Self::available().contains(&self)
    }
}

impl fmt::Display for GraphicsApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GraphicsApi::Direct3D11 => "Direct3D11",
            GraphicsApi::Direct3D12 => "Direct3D12",
            GraphicsApi::OpenGl => "OpenGL",
            GraphicsApi::Software => "Software",
        })
    }
}

/// Backend-assigned id of one staging resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StagingId(pub u64);

impl fmt::Display for StagingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "staging#{}", self.0)
    }
}

/// State of the copy most recently issued into a staging resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    /// The GPU has not signalled completion yet.
    Pending,
    /// The copy is visible to CPU reads (or no copy was ever issued).
    Complete,
}

/// Graphics-API-specific half of a synchronous readback.
///
/// Implementations exist for Direct3D 11 and 12 (Windows), OpenGL (host
/// context), and an in-process software device.
///
/// A backend owns every staging resource it creates, addressed by
/// [`StagingId`]. It never owns the render targets passed in as
/// [`NativeTexture`]. All methods must be called from the thread that owns the
/// graphics context; implementations do not lock.
pub trait ReadbackBackend {
    /// Downcast to a concrete type (e.g. to reach the D3D11 device).
    fn as_any(&self) -> &dyn std::any::Any;

    /// Mutable downcast to a concrete type.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    fn kind(&self) -> GraphicsApi;

    /// Row order of mapped staging memory.
    fn row_order(&self) -> RowOrder {
        RowOrder::TopDown
    }

    /// Whether this backend can copy targets of `format`.
    fn supports_format(&self, format: PixelFormat) -> bool;

    /// Query size and format of `target`.
    ///
    /// Fails with `InvalidTarget` for null or disposed handles and with
    /// `UnsupportedFormat` for native formats with no [`PixelFormat`].
    fn describe(&self, target: NativeTexture) -> Result<TargetDesc, ReadbackError>;

    /// Allocate a CPU-readable staging resource for `key`.
    fn create_staging(&mut self, key: StagingKey) -> Result<StagingId, ReadbackError>;

    /// Destroy a staging resource. Unknown ids are ignored.
    fn release_staging(&mut self, id: StagingId);

    /// Record and submit a copy of `target` into `id`, followed by a fence or
    /// query that [`poll_copy`](Self::poll_copy) checks.
    fn copy_to_staging(&mut self, target: NativeTexture, id: StagingId)
        -> Result<(), ReadbackError>;

    /// Non-blocking completion check for the last copy into `id`.
    fn poll_copy(&mut self, id: StagingId) -> Result<CopyStatus, ReadbackError>;

    /// Block until the last copy into `id` completes or `timeout` elapses.
    ///
    /// Returns `Pending` on timeout. The default implementation polls and
    /// yields the thread between polls.
    fn wait_copy(&mut self, id: StagingId, timeout: Duration) -> Result<CopyStatus, ReadbackError> {
        let start = Instant::now();
        loop {
            if self.poll_copy(id)? == CopyStatus::Complete {
                return Ok(CopyStatus::Complete);
            }
            if start.elapsed() >= timeout {
                return Ok(CopyStatus::Pending);
            }
            std::thread::yield_now();
        }
    }

    /// Map `id`, copy its rows into `out` as described by `layout`, unmap.
    ///
    /// Only valid once the last copy into `id` is complete. `out` must be
    /// exactly `layout.desc.byte_len()` bytes.
    fn read_staging(
        &mut self,
        id: StagingId,
        layout: &ReadLayout,
        out: &mut [u8],
    ) -> Result<(), ReadbackError>;

    /// Whether the device has been lost or removed.
    fn device_lost(&self) -> bool;
}
