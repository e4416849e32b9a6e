//! Engine runtime configuration: JSON loading, defaults, validation.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// How to launch a code agent provider process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Engine configuration loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub budget_cap_usd: f64,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub check_interval_sec: u64,
    #[serde(default)]
    pub heartbeat_max_age: i64,
    #[serde(default)]
    pub max_concurrent_workers: usize,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub max_rounds: i64,
    #[serde(default)]
    pub rate_limit_per_minute: u32,
}

impl Config {
    /// Read a JSON config file, apply defaults, and validate.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON: {}", path.display()))?;

        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.check_interval_sec == 0 {
            self.check_interval_sec = 10;
        }
        if self.heartbeat_max_age == 0 {
            self.heartbeat_max_age = 30;
        }
        if self.max_concurrent_workers == 0 {
            self.max_concurrent_workers = 5;
        }
        if self.listen_addr.is_empty() {
            self.listen_addr = "127.0.0.1:9800".into();
        }
        if self.max_rounds == 0 {
            self.max_rounds = 3;
        }
        if self.rate_limit_per_minute == 0 {
            self.rate_limit_per_minute = 60;
        }
    }

    fn validate(&self) -> std::result::Result<(), EngineError> {
        let mut problems = Vec::new();

        if self.db_path.is_empty() {
            problems.push("db_path is required".to_string());
        }
        if self.workspace.is_empty() {
            problems.push("workspace is required".to_string());
        }
        if self.budget_cap_usd <= 0.0 {
            problems.push("budget_cap_usd must be positive".to_string());
        }
        if self.providers.is_empty() {
            problems.push("at least one provider is required".to_string());
        }

        if !problems.is_empty() {
            return Err(EngineError::ConfigInvalid { problems });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn valid_config_json() -> &'static str {
        r#"{
            "db_path": "/tmp/engine.db",
            "workspace": "/tmp/workspace",
            "budget_cap_usd": 50.0,
            "providers": {
                "claude": {"command": "claude", "args": ["--output-format", "stream-json"]}
            }
        }"#
    }

    #[test]
    fn test_load_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, valid_config_json()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.check_interval_sec, 10);
        assert_eq!(config.heartbeat_max_age, 30);
        assert_eq!(config.max_concurrent_workers, 5);
        assert_eq!(config.listen_addr, "127.0.0.1:9800");
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.providers["claude"].command, "claude");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/config.json"));
        assert!(result.unwrap_err().to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        let result = Config::load(&path);
        assert!(result.unwrap_err().to_string().contains("Failed to parse config JSON"));
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{}").unwrap();

        let err = Config::load(&path).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        match engine_err {
            EngineError::ConfigInvalid { problems } => {
                assert_eq!(problems.len(), 4);
                assert!(problems.iter().any(|p| p.contains("db_path")));
                assert!(problems.iter().any(|p| p.contains("workspace")));
                assert!(problems.iter().any(|p| p.contains("budget_cap_usd")));
                assert!(problems.iter().any(|p| p.contains("provider")));
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "db_path": "/tmp/engine.db",
                "workspace": "/tmp/ws",
                "budget_cap_usd": 10.0,
                "check_interval_sec": 2,
                "max_rounds": 7,
                "providers": {"codex": {"command": "codex"}}
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.check_interval_sec, 2);
        assert_eq!(config.max_rounds, 7);
    }
}
