//! Layered configuration: defaults, TOML file, environment.

use anyhow::{Context, Result};
use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runner::RunnerConfig;

/// Environment variable prefix, e.g. `LODESTAR__RUNNER__CACHE_DIR`.
const ENV_PREFIX: &str = "LODESTAR";

/// Top-level settings for both roles.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub control: ControlSettings,
    pub runner: RunnerSettings,
}

/// Control-plane settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlSettings {
    /// Address the HTTP listener binds.
    pub bind_addr: String,
    /// SQLite database file for the session store.
    pub database_path: PathBuf,
}

/// Runner host settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSettings {
    /// Control-plane base URL.
    pub control_url: String,
    /// Models to host, one instance each.
    pub models: Vec<String>,
    /// Inference server binary.
    pub binary: String,
    /// Model cache directory.
    pub cache_dir: PathBuf,
    /// Idle seconds before an instance reports stale.
    pub instance_ttl_secs: u64,
    /// Bound on each instance's job-history ring.
    pub job_history_buffer_size: usize,
    /// Models to pre-pull at instance start.
    pub warmup_models: Vec<String>,
}

impl RunnerSettings {
    /// Convert into the runner host configuration.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            control_url: self.control_url.clone(),
            models: self.models.clone(),
            binary: self.binary.clone(),
            cache_dir: self.cache_dir.clone(),
            instance_ttl: Duration::from_secs(self.instance_ttl_secs),
            job_history_buffer_size: self.job_history_buffer_size,
            warmup_models: self.warmup_models.clone(),
        }
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>> {
    let builder = Config::builder()
        .set_default("control.bind_addr", "127.0.0.1:8844")?
        .set_default("control.database_path", "/var/lib/lodestar/lodestar.db")?
        .set_default("runner.control_url", "http://127.0.0.1:8844")?
        .set_default("runner.models", Vec::<String>::new())?
        .set_default("runner.binary", "ollama")?
        .set_default("runner.cache_dir", "/var/lib/lodestar/models")?
        .set_default("runner.instance_ttl_secs", 300_i64)?
        .set_default("runner.job_history_buffer_size", 8_i64)?
        .set_default("runner.warmup_models", Vec::<String>::new())?;
    Ok(builder)
}

impl Settings {
    /// Load settings: defaults, then the optional TOML file, then
    /// `LODESTAR__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = defaults()?;

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings: Settings = defaults()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.control.bind_addr, "127.0.0.1:8844");
        assert_eq!(settings.runner.binary, "ollama");
        assert_eq!(settings.runner.instance_ttl_secs, 300);
        assert!(settings.runner.models.is_empty());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let toml = r#"
            [runner]
            models = ["llama3:instruct"]
            instance_ttl_secs = 60
            warmup_models = ["phi3:instruct"]
        "#;

        let settings: Settings = defaults()
            .unwrap()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.runner.models, vec!["llama3:instruct"]);
        assert_eq!(settings.runner.instance_ttl_secs, 60);
        assert_eq!(settings.runner.warmup_models, vec!["phi3:instruct"]);
        // Untouched sections keep their defaults.
        assert_eq!(settings.control.bind_addr, "127.0.0.1:8844");
    }

    #[test]
    fn test_runner_config_conversion() {
        let settings: Settings = defaults()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        let config = settings.runner.runner_config();
        assert_eq!(config.instance_ttl, Duration::from_secs(300));
        assert_eq!(config.job_history_buffer_size, 8);
    }
}
