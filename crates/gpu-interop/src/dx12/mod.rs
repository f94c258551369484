//! D3D12 readback (Windows).

pub mod readback;

pub use readback::Dx12Backend;
