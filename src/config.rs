use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::core::address::MAX_COLUMNS_BITS;

/// Default bit width of the column part of a source-position address.
pub const DEFAULT_COLUMNS_BITS: u32 = 13;

/// A configuration bundle for the preprocessor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target directory for the per-image `.map` files. Created if absent.
    pub map_directory: PathBuf,
    /// Target directory for preprocessed binary traces. Required when
    /// `store_traces` is set.
    pub output_directory: Option<PathBuf>,
    /// Whether to persist preprocessed traces instead of handing them back
    /// in memory. Default: `false`.
    pub store_traces: bool,
    /// Bit width of the column part of a 32-bit source-position address.
    /// Default: 13. Must be at most 30.
    pub columns_bits: u32,
}

impl Config {
    pub fn new(map_directory: impl Into<PathBuf>) -> Config {
        Config {
            map_directory: map_directory.into(),
            output_directory: None,
            store_traces: false,
            columns_bits: DEFAULT_COLUMNS_BITS,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.columns_bits > MAX_COLUMNS_BITS {
            bail!(
                "columns-bits must be at most {}, got {}",
                MAX_COLUMNS_BITS,
                self.columns_bits
            );
        }
        if self.store_traces && self.output_directory.is_none() {
            bail!("store-traces requires an output directory");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::new("maps").validate().is_ok());
    }

    #[test]
    fn rejects_oversized_column_width() {
        let mut config = Config::new("maps");
        config.columns_bits = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn storing_traces_needs_an_output_directory() {
        let mut config = Config::new("maps");
        config.store_traces = true;
        assert!(config.validate().is_err());
        config.output_directory = Some("out".into());
        assert!(config.validate().is_ok());
    }
}
