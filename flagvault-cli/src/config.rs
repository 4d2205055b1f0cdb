use std::env;

use flagvault_lib::TransitionPolicy;
use serde::Deserialize;

/// Top-level flagvault.toml configuration
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct FvConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub policy: TransitionPolicy,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// ── Default value functions ──────────────────────────

fn default_backend() -> StorageBackend {
    StorageBackend::Sled
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_filter() -> String {
    "warn".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

pub fn parse_backend(value: &str) -> Option<StorageBackend> {
    match value.to_lowercase().as_str() {
        "sled" => Some(StorageBackend::Sled),
        "memory" => Some(StorageBackend::Memory),
        _ => None,
    }
}

pub fn parse_policy(value: &str) -> Option<TransitionPolicy> {
    match value.to_lowercase().as_str() {
        "strict" => Some(TransitionPolicy::Strict),
        "lenient" => Some(TransitionPolicy::Lenient),
        _ => None,
    }
}

impl FvConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: failed to parse {}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // FV_STORAGE
        if let Some(val) = lookup("FV_STORAGE") {
            match parse_backend(&val) {
                Some(backend) => self.storage.backend = backend,
                None => eprintln!("Warning: unknown FV_STORAGE value: {}", val),
            }
        }

        // FV_DATA_DIR
        if let Some(val) = lookup("FV_DATA_DIR") {
            if !val.trim().is_empty() {
                self.storage.data_dir = val;
            }
        }

        // FV_POLICY
        if let Some(val) = lookup("FV_POLICY") {
            match parse_policy(&val) {
                Some(policy) => self.engine.policy = policy,
                None => eprintln!("Warning: unknown FV_POLICY value: {}", val),
            }
        }

        // FV_LOG
        if let Some(val) = lookup("FV_LOG") {
            self.log.filter = val;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let config = FvConfig::load("/nonexistent/flagvault.toml");
        assert_eq!(config, FvConfig::default());
        assert_eq!(config.storage.backend, StorageBackend::Sled);
        assert_eq!(config.storage.data_dir, "./data");
        assert_eq!(config.engine.policy, TransitionPolicy::Strict);
        assert_eq!(config.log.filter, "warn");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\nbackend = \"memory\"\n\n[engine]\npolicy = \"lenient\"").unwrap();

        let config = FvConfig::load(file.path().to_str().unwrap());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.data_dir, "./data");
        assert_eq!(config.engine.policy, TransitionPolicy::Lenient);
        assert_eq!(config.log.filter, "warn");
    }

    #[test]
    fn unparsable_file_gives_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage\nbackend = ").unwrap();
        assert_eq!(FvConfig::load(file.path().to_str().unwrap()), FvConfig::default());
    }

    #[test]
    fn env_overrides_win_over_file() {
        let vars = HashMap::from([
            ("FV_STORAGE", "MEMORY"),
            ("FV_DATA_DIR", "/var/lib/fv"),
            ("FV_POLICY", "lenient"),
            ("FV_LOG", "flagvault_lib=debug"),
        ]);
        let mut config = FvConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.data_dir, "/var/lib/fv");
        assert_eq!(config.engine.policy, TransitionPolicy::Lenient);
        assert_eq!(config.log.filter, "flagvault_lib=debug");
    }

    #[test]
    fn unknown_env_values_are_ignored() {
        let vars = HashMap::from([("FV_STORAGE", "postgres"), ("FV_POLICY", "yolo")]);
        let mut config = FvConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config, FvConfig::default());
    }
}
