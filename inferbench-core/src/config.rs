use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment types for the inferbench application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Testing,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Default number of timed iterations, including the warm-up run
    pub iterations: usize,
    /// Pause between iterations in milliseconds
    pub cooldown_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            cooldown_ms: 1000,
        }
    }
}

impl RunnerConfig {
    /// Cooldown as a duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Configuration for a single benchmark variant
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VariantConfig {
    /// Display name, unique across the registry
    pub name: String,
    /// Engine kind: `descriptor`, `sequential` or `resnet`
    pub engine: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Engine specific settings, decoded by the engine factory
    #[serde(flatten)]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

/// Main configuration structure for inferbench
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub version: String,
    pub environment: Option<Environment>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Root directory that engine artifact paths are resolved against
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            environment: Some(Environment::Development),
            logging: LoggingConfig::default(),
            runner: RunnerConfig::default(),
            artifacts_dir: default_artifacts_dir(),
            variants: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))
            .map_err(Error::ConfigError)?;

        Self::from_yaml(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
            .map_err(Error::ConfigError)
    }

    fn from_yaml(source: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(source)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let mut config = Config::default();
        config.environment = None;

        if let Ok(env) = std::env::var("INFERBENCH_ENV") {
            config.environment = match env.to_lowercase().as_str() {
                "development" => Some(Environment::Development),
                "testing" => Some(Environment::Testing),
                "production" => Some(Environment::Production),
                _ => None,
            };
        }

        if let Ok(level) = std::env::var("INFERBENCH_LOG") {
            config.logging.level = level;
        }

        if let Ok(iterations) = std::env::var("INFERBENCH_ITERATIONS") {
            config.runner.iterations = iterations
                .parse()
                .with_context(|| format!("INFERBENCH_ITERATIONS is not a number: {}", iterations))
                .map_err(Error::ConfigError)?;
        }

        if let Ok(cooldown) = std::env::var("INFERBENCH_COOLDOWN_MS") {
            config.runner.cooldown_ms = cooldown
                .parse()
                .with_context(|| format!("INFERBENCH_COOLDOWN_MS is not a number: {}", cooldown))
                .map_err(Error::ConfigError)?;
        }

        if let Ok(dir) = std::env::var("INFERBENCH_ARTIFACTS_DIR") {
            config.artifacts_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Merge configurations, with the other config taking precedence
    /// wherever it differs from the defaults
    pub fn merge(&mut self, other: &Config) {
        let defaults = Config::default();

        if let Some(env) = other.environment {
            self.environment = Some(env);
        }
        if other.logging != defaults.logging {
            self.logging = other.logging.clone();
        }
        if other.runner.iterations != defaults.runner.iterations {
            self.runner.iterations = other.runner.iterations;
        }
        if other.runner.cooldown_ms != defaults.runner.cooldown_ms {
            self.runner.cooldown_ms = other.runner.cooldown_ms;
        }
        if other.artifacts_dir != defaults.artifacts_dir {
            self.artifacts_dir = other.artifacts_dir.clone();
        }
        for variant in &other.variants {
            match self.variants.iter_mut().find(|v| v.name == variant.name) {
                Some(existing) => *existing = variant.clone(),
                None => self.variants.push(variant.clone()),
            }
        }
    }

    /// Enabled variants in declaration order
    pub fn enabled_variants(&self) -> impl Iterator<Item = &VariantConfig> {
        self.variants.iter().filter(|v| v.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
environment: testing
runner:
  iterations: 5
  cooldown_ms: 0
variants:
  - name: descriptor-native
    engine: descriptor
    model: mlp
    backend: native
    optimized: true
  - name: resnet-cpu
    engine: resnet
    enabled: false
    backend: cpu
"#;

    #[test]
    fn test_parse_yaml() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.environment, Some(Environment::Testing));
        assert_eq!(config.runner.iterations, 5);
        assert_eq!(config.runner.cooldown(), Duration::ZERO);
        assert_eq!(config.artifacts_dir, PathBuf::from("artifacts"));
        assert_eq!(config.variants.len(), 2);

        let descriptor = &config.variants[0];
        assert_eq!(descriptor.engine, "descriptor");
        assert_eq!(descriptor.settings["model"], serde_json::json!("mlp"));
        assert_eq!(descriptor.settings["optimized"], serde_json::json!(true));
        assert!(!descriptor.settings.contains_key("name"));

        let names: Vec<_> = config.enabled_variants().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["descriptor-native"]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inferbench.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.variants[1].name, "resnet-cpu");

        let missing = Config::from_file(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_merge_overrides_non_defaults() {
        let mut base = Config::from_yaml(SAMPLE).unwrap();
        let mut overlay = Config::default();
        overlay.environment = None;
        overlay.runner.cooldown_ms = 250;
        overlay.variants.push(VariantConfig {
            name: "resnet-cpu".to_string(),
            engine: "resnet".to_string(),
            description: None,
            enabled: true,
            settings: HashMap::new(),
        });

        base.merge(&overlay);

        assert_eq!(base.environment, Some(Environment::Testing));
        assert_eq!(base.runner.iterations, 5);
        assert_eq!(base.runner.cooldown_ms, 250);
        assert_eq!(base.variants.len(), 2);
        assert!(base.variants[1].enabled);
    }
}
