use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::quiplash::{DEFAULT_PROMPTS, QuiplashConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {name}")]
    InvalidVar { name: &'static str, value: String },
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Process settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Allowed browser origin; `None` means permissive CORS.
    pub cors_origin: Option<String>,
    pub config_dir: PathBuf,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub sweep_buffer: Duration,
    pub join_timeout: Duration,
    pub archive_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            cors_origin: None,
            config_dir: PathBuf::from("config"),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_buffer: Duration::from_secs(60),
            join_timeout: Duration::from_secs(10),
            archive_path: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let port = match get("PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidVar { name: "PORT", value: raw })?,
            None => defaults.port,
        };

        let secs = |name: &'static str, fallback: Duration| -> Result<Duration, ConfigError> {
            match get(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
                None => Ok(fallback),
            }
        };

        Ok(Self {
            port,
            cors_origin: get("CORS_ORIGIN"),
            config_dir: get("CONFIG_PATH").map(PathBuf::from).unwrap_or(defaults.config_dir),
            idle_timeout: secs("ROOM_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            sweep_interval: secs("ROOM_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            sweep_buffer: secs("ROOM_SWEEP_BUFFER_SECS", defaults.sweep_buffer)?,
            join_timeout: secs("JOIN_TIMEOUT_SECS", defaults.join_timeout)?,
            archive_path: get("ARCHIVE_PATH").map(PathBuf::from),
        })
    }
}

/// Initialize the config directory with defaults if missing.
pub fn init(dir: &Path) -> Result<(), ConfigError> {
    fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    write_if_missing(&dir.join("game.json"), &QuiplashConfig::default())?;
    write_if_missing(&dir.join("prompts.json"), &DEFAULT_PROMPTS)?;
    Ok(())
}

fn write_if_missing(path: &Path, value: &impl serde::Serialize) -> Result<(), ConfigError> {
    if path.exists() {
        return Ok(());
    }
    let data = serde_json::to_string_pretty(value).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, data).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load round tuning from `game.json`; a missing file means defaults.
pub fn load_game_config(dir: &Path) -> Result<QuiplashConfig, ConfigError> {
    let path = dir.join("game.json");
    let config: QuiplashConfig = match fs::read_to_string(&path) {
        Ok(data) => serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?,
        Err(err) if err.kind() == ErrorKind::NotFound => QuiplashConfig::default(),
        Err(source) => return Err(ConfigError::Io { path, source }),
    };

    if config.rounds_per_game == 0 {
        return Err(ConfigError::Invalid("roundsPerGame must be at least 1".into()));
    }
    Ok(config)
}

/// Load the prompt pool from `prompts.json`, falling back to the built-in pool.
pub fn load_prompts(dir: &Path) -> Vec<String> {
    let path = dir.join("prompts.json");
    let builtin = || DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect();

    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return builtin(),
        Err(e) => {
            tracing::error!("Failed to read prompts {}: {}", path.display(), e);
            return builtin();
        }
    };

    match serde_json::from_str::<Vec<String>>(&data) {
        Ok(prompts) => {
            let prompts: Vec<String> = prompts
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if prompts.is_empty() {
                tracing::warn!("Prompt file {} is empty; using built-in prompts", path.display());
                builtin()
            } else {
                prompts
            }
        }
        Err(e) => {
            tracing::error!("Failed to parse prompts {}: {}", path.display(), e);
            builtin()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("quipclash-config-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn env_defaults_and_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PORT", "8080"),
            ("ROOM_IDLE_TIMEOUT_SECS", "120"),
            ("ARCHIVE_PATH", "/tmp/a.jsonl"),
            ("CORS_ORIGIN", "  "),
        ]);
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.sweep_buffer, Duration::from_secs(60));
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(config.archive_path, Some(PathBuf::from("/tmp/a.jsonl")));
        assert_eq!(config.cors_origin, None);
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = ServerConfig::from_lookup(|k| (k == "JOIN_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "JOIN_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn init_writes_defaults_that_load_back() {
        let dir = scratch_dir();
        init(&dir).unwrap();

        assert_eq!(load_game_config(&dir).unwrap(), QuiplashConfig::default());
        assert_eq!(load_prompts(&dir).len(), DEFAULT_PROMPTS.len());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn custom_files_are_honoured() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("game.json"), r#"{"roundsPerGame": 5}"#).unwrap();
        fs::write(dir.join("prompts.json"), r#"["  Worst song ever ", ""]"#).unwrap();

        let config = load_game_config(&dir).unwrap();
        assert_eq!(config.rounds_per_game, 5);
        assert_eq!(config.points_per_vote, 100);
        assert_eq!(load_prompts(&dir), vec!["Worst song ever".to_string()]);

        fs::write(dir.join("game.json"), r#"{"roundsPerGame": 0}"#).unwrap();
        assert!(load_game_config(&dir).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_files_fall_back() {
        let dir = scratch_dir();
        assert_eq!(load_game_config(&dir).unwrap(), QuiplashConfig::default());
        assert_eq!(load_prompts(&dir).len(), DEFAULT_PROMPTS.len());
    }
}
