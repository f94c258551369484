//! Core types for synchronous GPU pixel readback.
//!
//! This crate has no GPU dependencies. It defines the handle and descriptor
//! types shared by the backends in `gpu-interop` and the reader in
//! `pixel-readback`, the error taxonomy, the reader configuration, and the
//! row copy used when staging memory is mapped.

pub mod config;
pub mod error;
pub mod format;
pub mod rows;
pub mod target;

pub use config::ReaderConfig;
pub use error::{ReadbackError, UnsupportedFormat};
pub use format::{PixelFormat, UnknownFormat};
pub use rows::{copy_rows, required_source_len, ReadLayout, RowOrder};
pub use target::{NativeTexture, StagingKey, TargetDesc};
