//! Host-side accelerator configuration, loaded from a YAML file.
//!
//! A plain `serde`/`serde_yaml` `Deserialize` derive, since the host here
//! is a CLI binary rather than an embedded extension with its own
//! host-language config object to bridge from.

use serde::Deserialize;

use crate::error::ConfigError;

/// The shape and behavior of one simulated accelerator instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AcceleratorConfig {
    pub name: String,
    pub num_tile_rows: usize,
    pub num_tile_cols: usize,
    /// Total addressable memory cells. Defaults to 65536 if omitted.
    #[serde(default)]
    pub memory_words: Option<usize>,
    /// Number of latency stages in the pipelined memory, before the final
    /// stage that actually touches the backing store. Defaults to 2.
    #[serde(default)]
    pub memory_pipeline_depth: Option<usize>,
    #[serde(default)]
    pub log_memory_trace: bool,
}

impl AcceleratorConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        if config.num_tile_rows == 0 || config.num_tile_cols == 0 {
            return Err(ConfigError::EmptyGrid);
        }
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }
}
