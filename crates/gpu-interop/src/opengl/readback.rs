//! [`GlBackend`]: readback into pixel-pack buffers in the host's GL context.
//!
//! A read attaches the host texture to a private read framebuffer, issues
//! `glReadPixels` into a pixel-pack buffer (the copy runs asynchronously on
//! the GPU), and inserts a fence. Mapping waits for the fence. GL returns
//! rows bottom-up; the reader flips them.
//!
//! The host's context must be current on the calling thread and its function
//! pointers loaded (`gl::load_with`) before the backend is created.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use gl::types::{GLenum, GLint, GLsizeiptr, GLsync, GLuint};
use readback_core::{
    copy_rows, NativeTexture, PixelFormat, ReadLayout, ReadbackError, RowOrder, StagingKey,
    TargetDesc,
};
use tracing::{debug, error, trace};

use crate::backend::{CopyStatus, GraphicsApi, ReadbackBackend, StagingId};

/// A pixel-pack buffer and the fence behind the last copy into it.
struct PackBuffer {
    key: StagingKey,
    pbo: GLuint,
    size: usize,
    fence: Option<GLsync>,
}

/// Readback backend for the host's current OpenGL context.
pub struct GlBackend {
    /// Reusable FBO the source texture is attached to for `glReadPixels`.
    read_fbo: GLuint,
    staging: HashMap<u64, PackBuffer>,
    next_id: u64,
    lost: bool,
}

/// `glReadPixels` format/type pair for `format`, if GL can read it without
/// conversion.
fn transfer_format(format: PixelFormat) -> Option<(GLenum, GLenum)> {
    match format {
        PixelFormat::Rgba8 => Some((gl::RGBA, gl::UNSIGNED_BYTE)),
        PixelFormat::Rgba16Float => Some((gl::RGBA, gl::HALF_FLOAT)),
        PixelFormat::Rgba32Float => Some((gl::RGBA, gl::FLOAT)),
        // GL has no BGRA internal format.
        PixelFormat::Bgra8 => None,
    }
}

fn pixel_format(internal_format: GLenum) -> Option<PixelFormat> {
    match internal_format {
        gl::RGBA8 | gl::SRGB8_ALPHA8 => Some(PixelFormat::Rgba8),
        gl::RGBA16F => Some(PixelFormat::Rgba16Float),
        gl::RGBA32F => Some(PixelFormat::Rgba32Float),
        _ => None,
    }
}

/// Restores a binding point when dropped.
struct BindingGuard {
    target: GLenum,
    previous: GLuint,
    bind: unsafe fn(GLenum, GLuint),
}

impl BindingGuard {
    unsafe fn save(target: GLenum, query: GLenum, bind: unsafe fn(GLenum, GLuint)) -> Self {
        let mut previous: GLint = 0;
        gl::GetIntegerv(query, &mut previous);
        Self {
            target,
            previous: previous as GLuint,
            bind,
        }
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        unsafe { (self.bind)(self.target, self.previous) };
    }
}

unsafe fn bind_texture(target: GLenum, name: GLuint) {
    gl::BindTexture(target, name);
}

unsafe fn bind_framebuffer(target: GLenum, name: GLuint) {
    gl::BindFramebuffer(target, name);
}

unsafe fn bind_buffer(target: GLenum, name: GLuint) {
    gl::BindBuffer(target, name);
}

/// Pop errors off a GL error queue until it is empty or reports a lost
/// context. Returns the first error (`NO_ERROR` if none) and whether the
/// context was lost.
fn drain_errors(mut next: impl FnMut() -> GLenum) -> (GLenum, bool) {
    let mut first = gl::NO_ERROR;
    loop {
        let err = next();
        if err == gl::NO_ERROR {
            return (first, false);
        }
        if first == gl::NO_ERROR {
            first = err;
        }
        if err == gl::CONTEXT_LOST {
            return (first, true);
        }
    }
}

impl GlBackend {
    /// Create a backend in the current context.
    ///
    /// Fails if the loaded GL lacks fences, buffer mapping, or framebuffer
    /// objects (GL 3.2 / ES 3.0 are sufficient).
    pub fn new() -> Result<Self> {
        if !gl::FenceSync::is_loaded()
            || !gl::ClientWaitSync::is_loaded()
            || !gl::MapBufferRange::is_loaded()
            || !gl::GenFramebuffers::is_loaded()
        {
            bail!("current GL context lacks fence sync, MapBufferRange, or framebuffer objects");
        }

        let mut read_fbo: GLuint = 0;
        unsafe { gl::GenFramebuffers(1, &mut read_fbo) };
        if read_fbo == 0 {
            bail!("glGenFramebuffers returned no name");
        }
        debug!(read_fbo, "GL readback backend initialised");

        Ok(Self {
            read_fbo,
            staging: HashMap::new(),
            next_id: 0,
            lost: false,
        })
    }

    fn reset_status() -> GLenum {
        if gl::GetGraphicsResetStatus::is_loaded() {
            unsafe { gl::GetGraphicsResetStatus() }
        } else {
            gl::NO_ERROR
        }
    }

    fn check_device(&mut self) -> Result<(), ReadbackError> {
        if self.lost {
            return Err(ReadbackError::device_lost("GL context lost"));
        }
        let status = Self::reset_status();
        if status != gl::NO_ERROR {
            error!("GL context reset (status 0x{status:X})");
            self.lost = true;
            return Err(ReadbackError::device_lost(format!(
                "GL context reset (status 0x{status:X})"
            )));
        }
        Ok(())
    }

    /// Drain the GL error queue, turning the first error into a failure.
    fn check_error(&mut self, what: &str) -> Result<(), ReadbackError> {
        let (first, lost) = drain_errors(|| unsafe { gl::GetError() });
        if lost {
            self.lost = true;
        }
        if self.lost {
            return Err(ReadbackError::device_lost(format!("{what}: GL context lost")));
        }
        if first != gl::NO_ERROR {
            error!("{what} raised GL error 0x{first:X}");
            return Err(ReadbackError::copy_failed(format!(
                "{what}: GL error 0x{first:X}"
            )));
        }
        Ok(())
    }

    fn delete_fence(fence: &mut Option<GLsync>) {
        if let Some(f) = fence.take() {
            unsafe {
                gl::DeleteSync(f);
            }
        }
    }

    fn client_wait(&mut self, id: StagingId, timeout_ns: u64) -> Result<CopyStatus, ReadbackError> {
        self.check_device()?;
        let staging = self
            .staging
            .get_mut(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        let Some(fence) = staging.fence else {
            return Ok(CopyStatus::Complete);
        };

        let result = unsafe { gl::ClientWaitSync(fence, gl::SYNC_FLUSH_COMMANDS_BIT, timeout_ns) };
        match result {
            gl::ALREADY_SIGNALED | gl::CONDITION_SATISFIED => {
                Self::delete_fence(&mut staging.fence);
                Ok(CopyStatus::Complete)
            }
            gl::TIMEOUT_EXPIRED => Ok(CopyStatus::Pending),
            _ => {
                self.check_device()?;
                Err(ReadbackError::copy_failed("glClientWaitSync failed"))
            }
        }
    }
}

impl ReadbackBackend for GlBackend {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn kind(&self) -> GraphicsApi {
        GraphicsApi::OpenGl
    }

    fn row_order(&self) -> RowOrder {
        RowOrder::BottomUp
    }

    fn supports_format(&self, format: PixelFormat) -> bool {
        transfer_format(format).is_some()
    }

    fn describe(&self, target: NativeTexture) -> Result<TargetDesc, ReadbackError> {
        let Ok(name) = GLuint::try_from(target.raw()) else {
            return Err(ReadbackError::InvalidTarget);
        };
        if name == 0 || unsafe { gl::IsTexture(name) } == gl::FALSE {
            return Err(ReadbackError::InvalidTarget);
        }

        let (mut width, mut height, mut internal): (GLint, GLint, GLint) = (0, 0, 0);
        unsafe {
            let _restore =
                BindingGuard::save(gl::TEXTURE_2D, gl::TEXTURE_BINDING_2D, bind_texture);
            gl::BindTexture(gl::TEXTURE_2D, name);
            gl::GetTexLevelParameteriv(gl::TEXTURE_2D, 0, gl::TEXTURE_WIDTH, &mut width);
            gl::GetTexLevelParameteriv(gl::TEXTURE_2D, 0, gl::TEXTURE_HEIGHT, &mut height);
            gl::GetTexLevelParameteriv(
                gl::TEXTURE_2D,
                0,
                gl::TEXTURE_INTERNAL_FORMAT,
                &mut internal,
            );
        }
        // Binding a texture created for another target raises
        // GL_INVALID_OPERATION; it must not stay queued for the next copy.
        let (err, lost) = drain_errors(|| unsafe { gl::GetError() });
        if lost {
            return Err(ReadbackError::device_lost("GL context lost"));
        }
        if err != gl::NO_ERROR {
            debug!(name, "GL error 0x{err:X} describing texture; not a 2D texture");
            return Err(ReadbackError::InvalidTarget);
        }
        if width <= 0 || height <= 0 {
            return Err(ReadbackError::InvalidTarget);
        }

        let format = pixel_format(internal as GLenum).ok_or_else(|| {
            ReadbackError::unsupported_native(format!("GL internal format 0x{internal:X}"))
        })?;
        Ok(TargetDesc::new(width as u32, height as u32, format))
    }

    fn create_staging(&mut self, key: StagingKey) -> Result<StagingId, ReadbackError> {
        self.check_device()?;
        if transfer_format(key.format).is_none() {
            return Err(ReadbackError::unsupported(key.format));
        }
        // Rows are tightly packed: every supported format is a multiple of
        // the default GL_PACK_ALIGNMENT of 4.
        let size = key.desc().byte_len();

        let mut pbo: GLuint = 0;
        unsafe {
            let _restore = BindingGuard::save(
                gl::PIXEL_PACK_BUFFER,
                gl::PIXEL_PACK_BUFFER_BINDING,
                bind_buffer,
            );
            gl::GenBuffers(1, &mut pbo);
            gl::BindBuffer(gl::PIXEL_PACK_BUFFER, pbo);
            gl::BufferData(
                gl::PIXEL_PACK_BUFFER,
                size as GLsizeiptr,
                std::ptr::null(),
                gl::STREAM_READ,
            );
        }
        if let Err(e) = self.check_error("glBufferData (pack buffer)") {
            unsafe { gl::DeleteBuffers(1, &pbo) };
            return Err(e);
        }

        self.next_id += 1;
        let id = self.next_id;
        self.staging.insert(
            id,
            PackBuffer {
                key,
                pbo,
                size,
                fence: None,
            },
        );
        debug!(id, pbo, ?key, "GL pack buffer created");
        Ok(StagingId(id))
    }

    fn release_staging(&mut self, id: StagingId) {
        if let Some(mut staging) = self.staging.remove(&id.0) {
            Self::delete_fence(&mut staging.fence);
            unsafe { gl::DeleteBuffers(1, &staging.pbo) };
            debug!(%id, pbo = staging.pbo, "GL pack buffer released");
        }
    }

    fn copy_to_staging(
        &mut self,
        target: NativeTexture,
        id: StagingId,
    ) -> Result<(), ReadbackError> {
        self.check_device()?;
        let desc = self.describe(target)?;
        let name = target.raw() as GLuint;
        let (format, ty) =
            transfer_format(desc.format).ok_or_else(|| ReadbackError::unsupported(desc.format))?;
        let read_fbo = self.read_fbo;

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
        let pbo = staging.pbo;

        let complete = unsafe {
            let _fbo = BindingGuard::save(
                gl::READ_FRAMEBUFFER,
                gl::READ_FRAMEBUFFER_BINDING,
                bind_framebuffer,
            );
            let _pack = BindingGuard::save(
                gl::PIXEL_PACK_BUFFER,
                gl::PIXEL_PACK_BUFFER_BINDING,
                bind_buffer,
            );

            gl::BindFramebuffer(gl::READ_FRAMEBUFFER, read_fbo);
            gl::FramebufferTexture2D(
                gl::READ_FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                name,
                0,
            );
            gl::ReadBuffer(gl::COLOR_ATTACHMENT0);
            let status = gl::CheckFramebufferStatus(gl::READ_FRAMEBUFFER);
            if status == gl::FRAMEBUFFER_COMPLETE {
                gl::BindBuffer(gl::PIXEL_PACK_BUFFER, pbo);
                // With a pack buffer bound the pointer is an offset into it.
                gl::ReadPixels(
                    0,
                    0,
                    desc.width as GLint,
                    desc.height as GLint,
                    format,
                    ty,
                    std::ptr::null_mut(),
                );
            }
            // Detach so the host can delete the texture freely.
            gl::FramebufferTexture2D(
                gl::READ_FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                0,
                0,
            );
            status == gl::FRAMEBUFFER_COMPLETE
        };
        if !complete {
            return Err(ReadbackError::copy_failed(format!(
                "texture {name} is not readable through a framebuffer"
            )));
        }

        let fence = unsafe { gl::FenceSync(gl::SYNC_GPU_COMMANDS_COMPLETE, 0) };
        let staging = self
            .staging
            .get_mut(&id.0)
            .ok_or_else(|| ReadbackError::copy_failed(format!("unknown {id}")))?;
        Self::delete_fence(&mut staging.fence);
        staging.fence = Some(fence);
        trace!(%id, texture = name, "GL copy submitted");
        self.check_error("glReadPixels")
    }

    fn poll_copy(&mut self, id: StagingId) -> Result<CopyStatus, ReadbackError> {
        self.client_wait(id, 0)
    }

    fn wait_copy(&mut self, id: StagingId, timeout: Duration) -> Result<CopyStatus, ReadbackError> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.client_wait(id, timeout_ns)
    }

    fn read_staging(
        &mut self,
        id: StagingId,
        layout: &ReadLayout,
        out: &mut [u8],
    ) -> Result<(), ReadbackError> {
        self.check_device()?;
        let (pbo, size) = match self.staging.get(&id.0) {
            Some(s) if s.fence.is_some() => {
                return Err(ReadbackError::copy_failed(format!(
                    "{id} mapped before its copy completed"
                )))
            }
            Some(s) => (s.pbo, s.size),
            None => return Err(ReadbackError::copy_failed(format!("unknown {id}"))),
        };

        let result = unsafe {
            let _pack = BindingGuard::save(
                gl::PIXEL_PACK_BUFFER,
                gl::PIXEL_PACK_BUFFER_BINDING,
                bind_buffer,
            );
            gl::BindBuffer(gl::PIXEL_PACK_BUFFER, pbo);
            let ptr = gl::MapBufferRange(
                gl::PIXEL_PACK_BUFFER,
                0,
                size as GLsizeiptr,
                gl::MAP_READ_BIT,
            );
            if ptr.is_null() {
                Err(ReadbackError::copy_failed("glMapBufferRange returned null"))
            } else {
                // SAFETY: the mapping covers `size` bytes until glUnmapBuffer.
                let src = std::slice::from_raw_parts(ptr as *const u8, size);
                let copied = copy_rows(src, layout.desc.row_bytes(), out, layout);
                if gl::UnmapBuffer(gl::PIXEL_PACK_BUFFER) == gl::FALSE {
                    // The store was corrupted while mapped (e.g. display mode change).
                    Err(ReadbackError::copy_failed("pack buffer contents lost while mapped"))
                } else {
                    copied
                }
            }
        };
        if result.is_err() {
            self.check_device()?;
        }
        result
    }

    fn device_lost(&self) -> bool {
        self.lost || Self::reset_status() != gl::NO_ERROR
    }
}

impl Drop for GlBackend {
    fn drop(&mut self) {
        let ids: Vec<u64> = self.staging.keys().copied().collect();
        for id in ids {
            self.release_staging(StagingId(id));
        }
        unsafe {
            if self.read_fbo != 0 {
                gl::DeleteFramebuffers(1, &self.read_fbo);
                self.read_fbo = 0;
            }
        }
    }
}
