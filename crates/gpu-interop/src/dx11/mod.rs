//! D3D11 readback (Windows).

pub mod device;
pub mod readback;

pub use device::{create_event_query, native_handle, Dx11Device};
pub use readback::Dx11Backend;
