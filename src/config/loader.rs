//! Configuration loading: defaults, then an optional YAML file, then environment.

use super::merge::deep_merge;
use super::types::{AppEnv, Config, ConfigError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of a configuration value, lowest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Defaults,
    File,
    Environment,
    CommandLine,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::File => write!(f, "file"),
            ConfigTier::Environment => write!(f, "environment"),
            ConfigTier::CommandLine => write!(f, "command line"),
        }
    }
}

/// Loads and layers configuration.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: Config,
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load using the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(explicit, |key| std::env::var(key).ok())
    }

    /// Load with a custom environment lookup.
    ///
    /// The file named by `explicit`, or else by `TASK_GRAPH_CONFIG`, is merged
    /// over the defaults; environment variables are applied on top.
    pub fn load_with_env<F>(explicit: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env("TASK_GRAPH_CONFIG").map(PathBuf::from));

        let mut layered = serde_json::to_value(Config::default())?;
        if let Some(path) = &config_path {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let file_value: Value =
                serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            layered = deep_merge(layered, file_value);
            debug!(path = %path.display(), tier = %ConfigTier::File, "config file merged");
        }

        let mut config: Config = serde_json::from_value(layered)?;
        apply_env_overrides(&mut config, &env)?;

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Path of the config file that was merged, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Apply environment variable overrides to `config`.
pub fn apply_env_overrides<F>(config: &mut Config, env: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = env("PORT") {
        config.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: "PORT",
            value: port.clone(),
        })?;
    }
    if let Some(db_path) = env("DB_PATH") {
        config.server.db_path = PathBuf::from(db_path);
    }
    if let Some(app_env) = env("APP_ENV") {
        config.server.app_env =
            AppEnv::from_str(app_env.trim()).ok_or_else(|| ConfigError::InvalidValue {
                key: "APP_ENV",
                value: app_env.clone(),
            })?;
    }
    if let Some(seed) = env("SEED_DATABASE") {
        config.server.seed = Some(parse_bool("SEED_DATABASE", &seed)?);
    }
    if let Some(secret) = env("JWT_SECRET") {
        config.auth.jwt_secret = secret;
    }
    if let Some(origins) = env("CORS_ALLOWED_ORIGINS") {
        config.cors.allowed_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(credentials) = env("CORS_ALLOW_CREDENTIALS") {
        config.cors.allow_credentials = parse_bool("CORS_ALLOW_CREDENTIALS", &credentials)?;
    }
    Ok(())
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
