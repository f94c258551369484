//! Command-line arguments.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use pixel_readback::{GraphicsApi, PixelFormat};

/// Drive a pixel reader once per frame against a generated test surface and
/// verify every pixel it returns.
#[derive(Parser, Debug)]
#[command(
    name = "readback-harness",
    about = "Synchronous GPU pixel readback harness",
    long_about = "Creates a render target filled with a solid colour, reads it back once\n\
                  per frame, checks every returned pixel against the fill colour, and\n\
                  logs per-frame timing and staging pool statistics.\n\n\
                  Example:\n  \
                  readback-harness --width 1920 --height 1080 --frames 300\n  \
                  readback-harness --strategy unpooled --resize-every 10 --color 0,255,0,255"
)]
pub struct Args {
    /// Graphics backend to read through.
    #[arg(long, value_enum, default_value_t = BackendArg::Software)]
    pub backend: BackendArg,

    /// Keep staging resources between frames (pooled) or allocate one per
    /// read (unpooled).
    #[arg(long, value_enum, default_value_t = Strategy::Pooled)]
    pub strategy: Strategy,

    #[arg(long, default_value_t = 64)]
    pub width: u32,

    #[arg(long, default_value_t = 64)]
    pub height: u32,

    /// Surface format: rgba8, bgra8, rgba16f, rgba32f.
    #[arg(long, default_value = "rgba8", value_name = "FORMAT")]
    pub format: PixelFormat,

    #[arg(long, default_value_t = 60)]
    pub frames: u32,

    /// Fill colour as 8-bit components.
    #[arg(long, default_value = "255,0,0,255", value_name = "R,G,B,A")]
    pub color: Color,

    /// Recreate the surface at a new size every N frames (0 = never).
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub resize_every: u32,

    /// Completion wait bound; overrides PIXEL_READBACK_TIMEOUT_MS.
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Software,
    D3d11,
}

impl BackendArg {
    pub fn api(self) -> GraphicsApi {
        match self {
            BackendArg::Software => GraphicsApi::Software,
            BackendArg::D3d11 => GraphicsApi::Direct3D11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    Pooled,
    Unpooled,
}

/// An RGBA colour with 8-bit components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub [u8; 4]);

impl FromStr for Color {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            bail!("expected four comma-separated components, got {s:?}");
        }
        let mut rgba = [0u8; 4];
        for (c, part) in rgba.iter_mut().zip(&parts) {
            *c = part
                .parse()
                .with_context(|| format!("colour component {part:?} is not 0-255"))?;
        }
        Ok(Color(rgba))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.0;
        write!(f, "{r},{g},{b},{a}")
    }
}

impl Color {
    /// Raw bytes of one pixel of this colour in `format`.
    pub fn encode(self, format: PixelFormat) -> Vec<u8> {
        let [r, g, b, a] = self.0;
        let unit = |c: u8| f32::from(c) / 255.0;
        match format {
            PixelFormat::Rgba8 => vec![r, g, b, a],
            PixelFormat::Bgra8 => vec![b, g, r, a],
            PixelFormat::Rgba16Float => [r, g, b, a]
                .into_iter()
                .flat_map(|c| f16_bits(unit(c)).to_le_bytes())
                .collect(),
            PixelFormat::Rgba32Float => [r, g, b, a]
                .into_iter()
                .flat_map(|c| unit(c).to_le_bytes())
                .collect(),
        }
    }
}

/// IEEE binary16 bits of `v`, truncating the mantissa. Values too small for a
/// normal half flush to zero.
fn f16_bits(v: f32) -> u16 {
    let bits = v.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32 - 127 + 15;
    let mantissa = ((bits & 0x7f_ffff) >> 13) as u16;
    if exp <= 0 {
        sign
    } else if exp >= 0x1f {
        sign | 0x7c00
    } else {
        sign | ((exp as u16) << 10) | mantissa
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let args = Args::parse_from(["readback-harness"]);
        assert_eq!(args.backend, BackendArg::Software);
        assert_eq!(args.strategy, Strategy::Pooled);
        assert_eq!(args.format, PixelFormat::Rgba8);
        assert_eq!(args.color, Color([255, 0, 0, 255]));
        assert_eq!(args.timeout_ms, None);
    }

    #[test]
    fn parses_flags() {
        let args = Args::parse_from([
            "readback-harness",
            "--strategy",
            "unpooled",
            "--format",
            "bgra8",
            "--color",
            "1, 2, 3, 4",
            "--resize-every",
            "5",
            "--timeout-ms",
            "100",
        ]);
        assert_eq!(args.strategy, Strategy::Unpooled);
        assert_eq!(args.format, PixelFormat::Bgra8);
        assert_eq!(args.color, Color([1, 2, 3, 4]));
        assert_eq!(args.resize_every, 5);
        assert_eq!(args.timeout_ms, Some(100));
    }

    #[test]
    fn rejects_bad_colour() {
        assert!("1,2,3".parse::<Color>().is_err());
        assert!("1,2,3,256".parse::<Color>().is_err());
    }

    #[test]
    fn encodes_per_format() {
        let c = Color([255, 0, 128, 255]);
        assert_eq!(c.encode(PixelFormat::Bgra8), [128, 0, 255, 255]);
        assert_eq!(&c.encode(PixelFormat::Rgba16Float)[0..2], &0x3C00u16.to_le_bytes());
        assert_eq!(c.encode(PixelFormat::Rgba32Float).len(), 16);
    }
}
