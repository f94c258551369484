//! [`PixelReader`]: blocking readback of a host render target.

use std::time::Instant;

use gpu_interop::{CopyStatus, GraphicsApi, ReadbackBackend, StagingId};
use readback_core::{
    NativeTexture, PixelFormat, ReadLayout, ReadbackError, ReaderConfig, RowOrder, StagingKey,
    TargetDesc,
};
use tracing::{debug, error, trace, warn};

use crate::pool::{PoolStats, StagingPool};

/// Pixels of one read.
///
/// Tightly packed, `width * height * bytes_per_pixel` bytes, rows in the
/// reader's configured output order. Hand it back with
/// [`PixelReader::recycle`] so the next read of the same size reuses the
/// buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadbackResult {
    bytes: Vec<u8>,
    desc: TargetDesc,
    row_order: RowOrder,
}

impl ReadbackResult {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn desc(&self) -> TargetDesc {
        self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> PixelFormat {
        self.desc.format
    }

    /// Bytes between the starts of consecutive rows.
    pub fn row_stride(&self) -> usize {
        self.desc.row_bytes()
    }

    pub fn row_order(&self) -> RowOrder {
        self.row_order
    }

    /// Bytes of row `y` as stored (in [`row_order`](Self::row_order)).
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let stride = self.row_stride();
        let start = (y as usize).checked_mul(stride)?;
        self.bytes.get(start..start + stride)
    }

    /// Bytes of the pixel at `(x, y)`, `y` counted in storage order.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.desc.width {
            return None;
        }
        let bpp = self.desc.bytes_per_pixel();
        let start = x as usize * bpp;
        self.row(y)?.get(start..start + bpp)
    }

    /// Take the bytes, giving up recycling.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for ReadbackResult {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Synchronous pixel reader over one graphics backend.
///
/// Call from the thread that owns the graphics context. Each read blocks
/// until the copy has completed and been mapped, or fails; nothing is
/// retried.
pub struct PixelReader {
    backend: Box<dyn ReadbackBackend>,
    pool: StagingPool,
    config: ReaderConfig,
}

impl PixelReader {
    pub fn new(backend: Box<dyn ReadbackBackend>, config: ReaderConfig) -> Self {
        debug!(
            backend = %backend.kind(),
            timeout = ?config.timeout,
            max_staging = config.max_staging_entries,
            "pixel reader created"
        );
        Self {
            backend,
            pool: StagingPool::new(config.max_staging_entries),
            config,
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> GraphicsApi {
        self.backend.kind()
    }

    pub fn backend(&self) -> &dyn ReadbackBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn ReadbackBackend {
        self.backend.as_mut()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn pool(&self) -> &StagingPool {
        &self.pool
    }

    /// Read the current contents of `target`.
    pub fn read(&mut self, target: NativeTexture) -> Result<ReadbackResult, ReadbackError> {
        let desc = self.validate(target)?;
        let key = desc.staging_key();
        let start = Instant::now();
        let id = self.begin(key)?;

        let mut bytes = self.pool.take_host_buffer(&key, desc.byte_len());
        let result = self.transfer(target, key, id, start, &mut bytes);
        match result {
            Ok(()) => {
                self.pool.release_unretained(&key, self.backend.as_mut());
                Ok(ReadbackResult {
                    bytes,
                    desc,
                    row_order: self.config.output_order,
                })
            }
            Err(e) => {
                self.pool.recycle(&key, bytes);
                Err(self.fail(key, e))
            }
        }
    }

    /// Read `target` into `out`, resized to exactly the target's byte length.
    pub fn read_into(
        &mut self,
        target: NativeTexture,
        out: &mut Vec<u8>,
    ) -> Result<TargetDesc, ReadbackError> {
        let desc = self.validate(target)?;
        let key = desc.staging_key();
        let start = Instant::now();
        let id = self.begin(key)?;

        out.resize(desc.byte_len(), 0);
        match self.transfer(target, key, id, start, out) {
            Ok(()) => {
                self.pool.release_unretained(&key, self.backend.as_mut());
                Ok(desc)
            }
            Err(e) => Err(self.fail(key, e)),
        }
    }

    /// Return a result's buffer to the pool entry of its size and format.
    pub fn recycle(&mut self, result: ReadbackResult) {
        self.pool.recycle(&result.desc.staging_key(), result.bytes);
    }

    /// Wait (bounded by the configured timeout) for outstanding copies and
    /// release every staging resource. The reader stays usable; the next read
    /// allocates again.
    pub fn teardown(&mut self) {
        self.pool.teardown(self.backend.as_mut(), self.config.timeout);
        debug!(stats = ?self.pool.stats(), "pixel reader torn down");
    }

    /// Describe `target` and check its format, leaving the pool untouched on
    /// failure.
    fn validate(&self, target: NativeTexture) -> Result<TargetDesc, ReadbackError> {
        if target.is_null() {
            return Err(ReadbackError::InvalidTarget);
        }
        let desc = self.backend.describe(target)?;
        if desc.width == 0 || desc.height == 0 {
            return Err(ReadbackError::InvalidTarget);
        }
        if !self.config.supports(desc.format) || !self.backend.supports_format(desc.format) {
            return Err(ReadbackError::unsupported(desc.format));
        }
        Ok(desc)
    }

    /// Release finished retirees and acquire staging for `key`.
    ///
    /// Waiting on an earlier copy still in flight counts against this read's
    /// timeout.
    fn begin(&mut self, key: StagingKey) -> Result<StagingId, ReadbackError> {
        self.pool.collect_retired(self.backend.as_mut());
        self.pool
            .acquire(key, self.backend.as_mut(), self.config.timeout)
            .map_err(|e| self.fail(key, e))
    }

    /// Copy, wait out the rest of the timeout, and map into `out`.
    fn transfer(
        &mut self,
        target: NativeTexture,
        key: StagingKey,
        id: StagingId,
        start: Instant,
        out: &mut [u8],
    ) -> Result<(), ReadbackError> {
        self.backend.copy_to_staging(target, id)?;
        self.pool.mark_in_flight(&key);

        let remaining = self.config.timeout.saturating_sub(start.elapsed());
        match self.backend.wait_copy(id, remaining)? {
            CopyStatus::Complete => self.pool.mark_ready(&key),
            CopyStatus::Pending => {
                let waited = start.elapsed();
                warn!(%id, ?key, ?waited, "readback timed out");
                return Err(ReadbackError::Timeout { waited });
            }
        }

        let layout = ReadLayout::new(
            key.desc(),
            self.backend.row_order(),
            self.config.output_order,
        );
        self.backend.read_staging(id, &layout, out)?;
        self.pool.mark_idle(&key);
        trace!(%id, ?key, elapsed = ?start.elapsed(), flip = layout.flip, "readback complete");
        Ok(())
    }

    /// Bookkeeping after a failed read.
    fn fail(&mut self, key: StagingKey, err: ReadbackError) -> ReadbackError {
        if err.is_device_lost() {
            error!("{err}; discarding staging pool");
            self.pool.invalidate(self.backend.as_mut());
        } else {
            self.pool.release_unretained(&key, self.backend.as_mut());
        }
        err
    }
}

impl Drop for PixelReader {
    fn drop(&mut self) {
        self.teardown();
    }
}
