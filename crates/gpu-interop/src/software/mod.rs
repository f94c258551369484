//! Software backend: CPU-resident render targets with simulated fences.

pub mod device;
pub mod readback;

pub use device::{SoftwareDevice, SoftwareStats};
pub use readback::SoftwareBackend;
