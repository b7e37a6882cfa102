// ABOUTME: Configuration management for the trellis CLI
// ABOUTME: Loads YAML config files, applies environment overrides and builds the engine config

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::graph::DEFAULT_MAX_ITERATIONS;
use crate::engine::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrent_tasks: usize,

    pub default_pool_size: usize,

    /// Capacity per resource tag
    pub resource_pools: HashMap<String, usize>,

    /// Loop cap for loops that do not declare one
    pub max_iterations: u32,

    #[serde(with = "humantime_serde")]
    pub run_timeout: Option<Duration>,

    /// Initial bindings for every run, overridden by `--var`
    pub variables: Map<String, Value>,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            default_pool_size: 1,
            resource_pools: HashMap::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            run_timeout: None,
            variables: Map::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        config.merge_env()?;
        Ok(config)
    }

    fn load_file(path: Option<PathBuf>) -> Result<Self> {
        let explicit = path.is_some();
        let config_path = match path {
            Some(p) => p,
            None => Self::find_config_file(),
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            let config = serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?;
            Ok(config)
        } else if explicit {
            Err(anyhow::anyhow!(
                "Config file not found: {}",
                config_path.display()
            ))
        } else {
            Ok(Config::default())
        }
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> PathBuf {
        let local = [
            PathBuf::from("trellis.yaml"),
            PathBuf::from("trellis.yml"),
            PathBuf::from(".trellis.yaml"),
            PathBuf::from(".trellis.yml"),
        ];
        if let Some(path) = local.into_iter().find(|p| p.exists()) {
            return path;
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".trellis").join("config.yaml");
            if home_config.exists() {
                return home_config;
            }
        }

        // Default path, may not exist
        PathBuf::from("trellis.yaml")
    }

    /// Merge environment variables into configuration
    fn merge_env(&mut self) -> Result<()> {
        self.merge_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `TRELLIS_*` overrides from `lookup`.
    pub fn merge_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(max) = lookup("TRELLIS_MAX_CONCURRENT") {
            self.max_concurrent_tasks = max
                .parse()
                .with_context(|| format!("Invalid TRELLIS_MAX_CONCURRENT '{}'", max))?;
        }
        if let Some(level) = lookup("TRELLIS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("TRELLIS_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(timeout) = lookup("TRELLIS_RUN_TIMEOUT") {
            let parsed = humantime_serde::re::humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TRELLIS_RUN_TIMEOUT '{}'", timeout))?;
            self.run_timeout = Some(parsed);
        }
        Ok(())
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_concurrent: self.max_concurrent_tasks,
            default_pool_size: self.default_pool_size,
            resource_pools: self.resource_pools.clone(),
            default_max_iterations: self.max_iterations,
            run_timeout: self.run_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_config_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("trellis.yaml");
        fs::write(
            &config_path,
            r#"
max_concurrent_tasks: 8
resource_pools:
  db: 2
run_timeout: 90s
variables:
  region: eu
logging:
  level: debug
  format: compact
"#,
        )
        .unwrap();

        let config = Config::load_file(Some(config_path)).unwrap();
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.default_pool_size, 1);
        assert_eq!(config.resource_pools.get("db"), Some(&2));
        assert_eq!(config.run_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.variables.get("region"), Some(&json!("eu")));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "compact");

        let engine = config.to_engine_config();
        assert_eq!(engine.max_concurrent, 8);
        assert_eq!(engine.resource_pools.get("db"), Some(&2));
        assert_eq!(engine.default_max_iterations, DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let temp_dir = tempdir().unwrap();
        assert!(Config::load_file(Some(temp_dir.path().join("nope.yaml"))).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = Config::default();
        config
            .merge_overrides(|key| match key {
                "TRELLIS_MAX_CONCURRENT" => Some("16".to_string()),
                "TRELLIS_LOG_FORMAT" => Some("compact".to_string()),
                "TRELLIS_RUN_TIMEOUT" => Some("2m".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.max_concurrent_tasks, 16);
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.run_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = Config::default();
        let result = config.merge_overrides(|key| {
            (key == "TRELLIS_MAX_CONCURRENT").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }
}
