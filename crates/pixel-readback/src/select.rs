//! Backend selection at startup.
//!
//! The host hands over whatever its renderer runs on once, and the reader
//! builds the matching backend. Nothing is selected per call.

use anyhow::{bail, Context, Result};
use gpu_interop::opengl::GlBackend;
use gpu_interop::software::{SoftwareBackend, SoftwareDevice};
use gpu_interop::{GraphicsApi, ReadbackBackend};
use readback_core::ReaderConfig;
use tracing::info;

#[cfg(target_os = "windows")]
use windows::Win32::Graphics::{Direct3D11::*, Direct3D12::*};

use crate::reader::PixelReader;

/// The host's graphics device, as handed to the reader at startup.
pub enum HostDevice {
    /// In-process software device.
    Software(SoftwareDevice),
    /// The host's GL context is current on this thread and `gl::load_with`
    /// has been called.
    OpenGlCurrentContext,
    #[cfg(target_os = "windows")]
    Direct3D11 {
        device: ID3D11Device,
        context: ID3D11DeviceContext,
    },
    /// Device plus the direct queue the host renders on.
    #[cfg(target_os = "windows")]
    Direct3D12 {
        device: ID3D12Device,
        queue: ID3D12CommandQueue,
    },
}

impl HostDevice {
    pub fn api(&self) -> GraphicsApi {
        match self {
            HostDevice::Software(_) => GraphicsApi::Software,
            HostDevice::OpenGlCurrentContext => GraphicsApi::OpenGl,
            #[cfg(target_os = "windows")]
            HostDevice::Direct3D11 { .. } => GraphicsApi::Direct3D11,
            #[cfg(target_os = "windows")]
            HostDevice::Direct3D12 { .. } => GraphicsApi::Direct3D12,
        }
    }

    /// A device of kind `api` created by the reader itself, for tools with no
    /// host renderer.
    ///
    /// Only the software device and (on Windows) D3D11 can be created
    /// standalone; OpenGL and D3D12 need the host's context or queue.
    pub fn standalone(api: GraphicsApi) -> Result<Self> {
        if !api.is_available() {
            bail!("{api} is not available on this platform");
        }
        match api {
            GraphicsApi::Software => Ok(HostDevice::Software(SoftwareDevice::new())),
            #[cfg(target_os = "windows")]
            GraphicsApi::Direct3D11 => {
                let device = gpu_interop::dx11::Dx11Device::new()
                    .context("failed to create a D3D11 device")?;
                Ok(HostDevice::Direct3D11 {
                    device: device.device().clone(),
                    context: device.context().clone(),
                })
            }
            other => bail!("{other} readback needs the host's device; it cannot run standalone"),
        }
    }

    /// Build the backend for this device.
    pub fn into_backend(self) -> Result<Box<dyn ReadbackBackend>> {
        let api = self.api();
        let backend: Box<dyn ReadbackBackend> = match self {
            HostDevice::Software(device) => Box::new(SoftwareBackend::new(device)),
            HostDevice::OpenGlCurrentContext => {
                Box::new(GlBackend::new().context("failed to create the OpenGL backend")?)
            }
            #[cfg(target_os = "windows")]
            HostDevice::Direct3D11 { device, context } => {
                Box::new(gpu_interop::dx11::Dx11Backend::new(&device, &context))
            }
            #[cfg(target_os = "windows")]
            HostDevice::Direct3D12 { device, queue } => Box::new(
                gpu_interop::dx12::Dx12Backend::new(&device, &queue)
                    .context("failed to create the D3D12 backend")?,
            ),
        };
        info!(backend = %api, "readback backend selected");
        Ok(backend)
    }
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HostDevice").field(&self.api()).finish()
    }
}

impl PixelReader {
    /// Reader on the host's device.
    ///
    /// Fails here, not on first read, when the backend cannot be built.
    pub fn for_host(host: HostDevice, config: ReaderConfig) -> Result<Self> {
        let backend = host.into_backend()?;
        for format in &config.supported_formats {
            if !backend.supports_format(*format) {
                tracing::warn!(
                    backend = %backend.kind(),
                    %format,
                    "configured format cannot be read by this backend"
                );
            }
        }
        Ok(PixelReader::new(backend, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_runs_standalone() {
        let host = HostDevice::standalone(GraphicsApi::Software).unwrap();
        assert_eq!(host.api(), GraphicsApi::Software);
        let reader = PixelReader::for_host(host, ReaderConfig::default()).unwrap();
        assert_eq!(reader.backend_kind(), GraphicsApi::Software);
    }

    #[test]
    fn host_bound_apis_do_not_run_standalone() {
        let err = HostDevice::standalone(GraphicsApi::OpenGl).unwrap_err();
        assert!(err.to_string().contains("OpenGL"));
        assert!(HostDevice::standalone(GraphicsApi::Direct3D12).is_err());
    }

    #[test]
    fn gl_backend_without_context_fails_at_startup() {
        let err = PixelReader::for_host(HostDevice::OpenGlCurrentContext, ReaderConfig::default())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("OpenGL backend"));
    }
}
