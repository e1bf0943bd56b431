use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DirectorySettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

pub fn default_capacity() -> usize {
    4
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DebugLoopSettings {
    /// First wait for the loop thread after requesting a stop.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Second wait, after forcing a break. Also bounds the wait for the initial attach.
    #[serde(default = "default_break_timeout_ms")]
    pub break_timeout_ms: u64,
}

fn default_stop_timeout_ms() -> u64 {
    100
}

fn default_break_timeout_ms() -> u64 {
    500
}

impl DebugLoopSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn break_timeout(&self) -> Duration {
        Duration::from_millis(self.break_timeout_ms)
    }
}

impl Default for DebugLoopSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            break_timeout_ms: default_break_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Size of the last-resort pool allocated anywhere. Holds a thousand far trampolines.
    #[serde(default = "default_far_pool_size")]
    pub far_pool_size: u64,
    /// Smallest free region accepted when probing near the target address.
    #[serde(default = "default_min_region_size")]
    pub min_region_size: u64,
}

pub fn default_far_pool_size() -> u64 {
    64 * 1000
}

fn default_min_region_size() -> u64 {
    64
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            far_pool_size: default_far_pool_size(),
            min_region_size: default_min_region_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TracepinConfig {
    #[serde(default)]
    pub directory: DirectorySettings,
    #[serde(default)]
    pub debug_loop: DebugLoopSettings,
    #[serde(default)]
    pub pool: PoolSettings,
}

impl TracepinConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = TracepinConfig::from_toml_str("").unwrap();
        assert_eq!(config, TracepinConfig::default());
        assert_eq!(config.directory.capacity, 4);
        assert_eq!(config.debug_loop.stop_timeout(), Duration::from_millis(100));
        assert_eq!(config.debug_loop.break_timeout(), Duration::from_millis(500));
        assert_eq!(config.pool.far_pool_size, 64_000);
        assert_eq!(config.pool.min_region_size, 64);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = TracepinConfig::from_toml_str(
            r#"
            [debug-loop]
            stop-timeout-ms = 20

            [pool]
            far-pool-size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.debug_loop.stop_timeout_ms, 20);
        assert_eq!(config.debug_loop.break_timeout_ms, 500);
        assert_eq!(config.pool.far_pool_size, 4096);
        assert_eq!(config.pool.min_region_size, 64);
        assert_eq!(config.directory.capacity, 4);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = TracepinConfig::from_toml_str("[pool]\nfar-size = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[directory]\ncapacity = 2").unwrap();
        let config = TracepinConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.directory.capacity, 2);
    }

    #[test]
    fn load_from_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        match TracepinConfig::load_from_file(&path) {
            Err(ConfigError::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected Io error, got {other:?}"),
        }
    }
}
