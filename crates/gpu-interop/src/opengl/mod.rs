//! OpenGL readback via pixel-pack buffers and fence sync objects.

pub mod readback;

pub use readback::GlBackend;
