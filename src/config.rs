//! Runtime configuration for the vault binaries.
//!
//! Values resolve in priority order: explicit override (CLI flag), process
//! environment, then the `.env` file next to the working directory. Only the
//! download root is mandatory; everything else has a sensible default.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_QUALITY: i64 = 1080;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
const DATABASE_FILE: &str = "tubevault.db";

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub download_root: PathBuf,
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub concurrency: usize,
    pub max_quality: i64,
    pub ytdlp_bin: PathBuf,
}

/// Values a caller (usually CLI parsing) wants to pin before resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub download_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub concurrency: Option<usize>,
    pub max_quality: Option<i64>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn load_config() -> Result<RuntimeConfig> {
    resolve_config(ConfigOverrides::default())
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config(&file_vars, env_var_string, overrides)
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<RuntimeConfig> {
    let download_root = overrides
        .download_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DOWNLOAD_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("DOWNLOAD_ROOT not set"))?;
    let download_root = PathBuf::from(download_root);

    let database_path = overrides
        .database_path
        .or_else(|| lookup_value("DATABASE_PATH", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| download_root.join(DATABASE_FILE));

    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEVAULT_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);

    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TUBEVAULT_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let concurrency = overrides
        .concurrency
        .or_else(|| {
            lookup_value("TUBEVAULT_CONCURRENCY", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_CONCURRENCY);

    let max_quality = overrides
        .max_quality
        .or_else(|| {
            lookup_value("TUBEVAULT_MAX_QUALITY", file_vars, &env_lookup)
                .and_then(|value| value.parse::<i64>().ok())
        })
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_QUALITY);

    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup_value("YTDLP_BIN", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

    Ok(RuntimeConfig {
        download_root,
        database_path,
        host,
        port,
        concurrency,
        max_quality,
        ytdlp_bin,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|value| value.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
