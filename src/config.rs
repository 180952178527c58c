//! Runtime configuration discovery.
//!
//! Mirrors `EngineConfig`/`EngineConfig::validate` in the teacher crate:
//! a plain struct with a `validate()` that logs on success and returns a
//! descriptive error on failure, loadable from a TOML file and overridable
//! from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_OCLDIR: &str = "/opt/bohrium/lib/ocl_source";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime-wide configuration, sourced (in priority order) from an explicit
/// TOML file, environment variables, then built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding kernel source snippets the GPU resource layer
    /// reads from, per spec.md's "Environment" interface.
    pub ocldir: PathBuf,

    /// Process grid world size for the cluster backend's in-process
    /// `ChannelProcessGrid`. Ignored by the GPU backend.
    pub world_size: usize,

    /// Upper bound on array rank, enforced by `ArrayDescriptor`.
    pub max_rank: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ocldir: PathBuf::from(DEFAULT_OCLDIR),
            world_size: 1,
            max_rank: crate::registry::MAX_RANK,
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML file, falling back to defaults for absent fields.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Build from defaults, then apply environment overrides
    /// (`LATTICE_OCLDIR`, `LATTICE_WORLD_SIZE`), matching the `ocldir`
    /// config-key lookup spec.md §6 describes plus the cluster world size
    /// knob a real bootstrap would supply.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("LATTICE_OCLDIR") {
            config.ocldir = PathBuf::from(dir);
        }
        if let Ok(size) = std::env::var("LATTICE_WORLD_SIZE") {
            if let Ok(parsed) = size.parse() {
                config.world_size = parsed;
            } else {
                log::warn!(
                    "[RuntimeConfig] ignoring non-numeric LATTICE_WORLD_SIZE={:?}",
                    size
                );
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world_size == 0 {
            return Err(ConfigError::Invalid(
                "world_size must be at least 1".to_string(),
            ));
        }
        if self.max_rank == 0 || self.max_rank > 32 {
            return Err(ConfigError::Invalid(format!(
                "max_rank {} is outside the supported range 1..=32",
                self.max_rank
            )));
        }

        log::info!(
            "[RuntimeConfig] validated: ocldir={:?}, world_size={}, max_rank={}",
            self.ocldir,
            self.world_size,
            self.max_rank
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ocldir, PathBuf::from(DEFAULT_OCLDIR));
    }

    #[test]
    fn rejects_zero_world_size() {
        let mut config = RuntimeConfig::default();
        config.world_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "ocldir = \"/tmp/ocl\"\nworld_size = 4").expect("write");
        let config = RuntimeConfig::from_file(file.path()).expect("load");
        assert_eq!(config.ocldir, PathBuf::from("/tmp/ocl"));
        assert_eq!(config.world_size, 4);
        // max_rank absent from the file, falls back to the default.
        assert_eq!(config.max_rank, crate::registry::MAX_RANK);
    }
}
