//! Reader configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::format::PixelFormat;
use crate::rows::RowOrder;

pub const ENV_TIMEOUT_MS: &str = "PIXEL_READBACK_TIMEOUT_MS";
pub const ENV_FORMATS: &str = "PIXEL_READBACK_FORMATS";
pub const ENV_MAX_STAGING: &str = "PIXEL_READBACK_MAX_STAGING";

/// Tunables for a pixel reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Upper bound on the wait for a copy to complete.
    pub timeout: Duration,
    /// Formats the reader accepts. Targets in any other format fail with
    /// `UnsupportedFormat` before anything is allocated.
    pub supported_formats: Vec<PixelFormat>,
    /// Number of distinct `(width, height, format)` staging entries kept
    /// alive. Zero releases the staging resource after every read.
    pub max_staging_entries: usize,
    /// Row order the caller expects in results.
    pub output_order: RowOrder,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(250),
            supported_formats: vec![PixelFormat::Rgba8, PixelFormat::Bgra8],
            max_staging_entries: 1,
            output_order: RowOrder::TopDown,
        }
    }
}

impl ReaderConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_formats(mut self, formats: impl IntoIterator<Item = PixelFormat>) -> Self {
        self.supported_formats = formats.into_iter().collect();
        self
    }

    pub fn with_max_staging_entries(mut self, max: usize) -> Self {
        self.max_staging_entries = max;
        self
    }

    pub fn with_output_order(mut self, order: RowOrder) -> Self {
        self.output_order = order;
        self
    }

    pub fn supports(&self, format: PixelFormat) -> bool {
        self.supported_formats.contains(&format)
    }

    /// Defaults overlaid with `PIXEL_READBACK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|name| std::env::var(name).ok())
    }

    /// Overlay values from `lookup` (variable name -> value) onto `self`.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(ms) = lookup(ENV_TIMEOUT_MS) {
            let ms: u64 = ms.trim().parse().with_context(|| {
                format!("{ENV_TIMEOUT_MS}={ms:?} is not a number of milliseconds")
            })?;
            self.timeout = Duration::from_millis(ms);
        }

        if let Some(list) = lookup(ENV_FORMATS) {
            let formats = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<PixelFormat>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid {ENV_FORMATS}={list:?}"))?;
            if formats.is_empty() {
                anyhow::bail!("{ENV_FORMATS} must name at least one format");
            }
            self.supported_formats = formats;
        }

        if let Some(max) = lookup(ENV_MAX_STAGING) {
            self.max_staging_entries = max
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_STAGING}={max:?} is not a count"))?;
        }

        debug!(config = ?self, "reader config");
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = ReaderConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!(config.supports(PixelFormat::Rgba8));
        assert!(config.supports(PixelFormat::Bgra8));
        assert!(!config.supports(PixelFormat::Rgba32Float));
        assert_eq!(config.max_staging_entries, 1);
        assert_eq!(config.output_order, RowOrder::TopDown);
    }

    #[test]
    fn overlay_reads_all_variables() {
        let config = ReaderConfig::default()
            .overlay(lookup(&[
                (ENV_TIMEOUT_MS, "40"),
                (ENV_FORMATS, "rgba16f, rgba8"),
                (ENV_MAX_STAGING, "0"),
            ]))
            .unwrap();
        assert_eq!(config.timeout, Duration::from_millis(40));
        assert_eq!(
            config.supported_formats,
            vec![PixelFormat::Rgba16Float, PixelFormat::Rgba8]
        );
        assert_eq!(config.max_staging_entries, 0);
    }

    #[test]
    fn overlay_without_variables_keeps_values() {
        let base = ReaderConfig::default().with_timeout(Duration::from_secs(2));
        let config = base.clone().overlay(lookup(&[])).unwrap();
        assert_eq!(config, base);
    }

    #[test]
    fn overlay_rejects_bad_values() {
        assert!(ReaderConfig::default()
            .overlay(lookup(&[(ENV_TIMEOUT_MS, "soon")]))
            .is_err());
        assert!(ReaderConfig::default()
            .overlay(lookup(&[(ENV_FORMATS, "rgba8,yuv420")]))
            .is_err());
        assert!(ReaderConfig::default()
            .overlay(lookup(&[(ENV_FORMATS, " , ")]))
            .is_err());
        assert!(ReaderConfig::default()
            .overlay(lookup(&[(ENV_MAX_STAGING, "-1")]))
            .is_err());
    }
}
