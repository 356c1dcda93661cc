//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.zenava/config.json`) and environment.
//! API keys may be supplied through the environment so they never have to live in the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Which backend answers chat turns and how to reach it.
    #[serde(default)]
    pub backend: BackendConfig,

    /// How session titles are derived from the first message.
    #[serde(default)]
    pub title: TitleConfig,

    /// Directory holding the persisted sessions, agents and user id (default ~/.zenava/data).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Backend selection: a Dify-hosted agent (blocking) or the Gemini API (streaming).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Dify,
    Gemini,
}

/// Backend endpoints, credentials and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Dify API root; the chat endpoint is `{difyBaseUrl}/chat-messages`.
    #[serde(default = "default_dify_base_url")]
    pub dify_base_url: String,

    /// Dify app key (bearer token). Overridden by DIFY_API_KEY env.
    pub dify_api_key: Option<String>,

    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,

    /// Overridden by GEMINI_API_KEY env.
    pub gemini_api_key: Option<String>,

    /// Model used for new sessions and for title summaries.
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// System instruction sent with every Gemini turn. Empty or absent means none.
    #[serde(default)]
    pub system_instruction: Option<String>,

    /// Upper bound for one backend round trip; for streams, the longest allowed gap between chunks.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_dify_base_url() -> String {
    "https://ai-agent.tinetcloud.com/v1".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            dify_base_url: default_dify_base_url(),
            dify_api_key: None,
            gemini_base_url: default_gemini_base_url(),
            gemini_api_key: None,
            gemini_model: default_gemini_model(),
            system_instruction: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// "truncate" cuts the first message locally; "summarize" asks the model for a short phrase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleMode {
    #[default]
    Truncate,
    Summarize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleConfig {
    #[serde(default)]
    pub mode: TitleMode,
    #[serde(default = "default_title_max_chars")]
    pub max_chars: usize,
    /// Label used when a summary cannot be produced.
    #[serde(default = "default_title_fallback")]
    pub fallback: String,
}

fn default_title_max_chars() -> usize {
    15
}

fn default_title_fallback() -> String {
    crate::session::DEFAULT_TITLE.to_string()
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            mode: TitleMode::default(),
            max_chars: default_title_max_chars(),
            fallback: default_title_fallback(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the Dify app key: env DIFY_API_KEY overrides config.
pub fn resolve_dify_api_key(config: &Config) -> Option<String> {
    non_empty_env("DIFY_API_KEY").or_else(|| non_empty(&config.backend.dify_api_key))
}

/// Resolve the Gemini API key: env GEMINI_API_KEY overrides config.
pub fn resolve_gemini_api_key(config: &Config) -> Option<String> {
    non_empty_env("GEMINI_API_KEY").or_else(|| non_empty(&config.backend.gemini_api_key))
}

/// System instruction if one is configured and not blank.
pub fn resolve_system_instruction(config: &Config) -> Option<String> {
    non_empty(&config.backend.system_instruction)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("ZENAVA_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".zenava").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Data directory: `config.data_dir` if set (relative paths resolved against the config file's parent),
/// otherwise the `data` subdirectory next to the config file.
pub fn resolve_data_dir(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.data_dir {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => config_parent.join("data"),
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Create the config directory, a default config file and the data directory if missing.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = load_config(Some(config_path.to_path_buf()))?;
    let data_dir = resolve_data_dir(&config, config_path);
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        log::info!("created data directory at {}", data_dir.display());
    }
    Ok(config_dir.to_path_buf())
}
