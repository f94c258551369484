//! Graphics-API backends for synchronous pixel readback.
//!
//! This crate defines the [`ReadbackBackend`] trait, the per-API half of a
//! readback: describing a host render target, allocating CPU-readable staging
//! resources, issuing a fenced copy into one, and mapping it. D3D11 and D3D12
//! are available on Windows; OpenGL runs in the host's current context on any
//! platform; the software device backs tests and the harness.

pub mod backend;
pub use backend::{CopyStatus, GraphicsApi, ReadbackBackend, StagingId};

pub mod software;

// Platform-specific implementations.

pub mod opengl;

#[cfg(target_os = "windows")]
pub mod dxgi;

#[cfg(target_os = "windows")]
pub mod dx11;

#[cfg(target_os = "windows")]
pub mod dx12;
