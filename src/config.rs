//! Configuration loading and validation.
//!
//! Layered per the precedence env vars > `config.toml` > defaults: a
//! human-owned TOML file holds models/runtime/logging knobs, and a `.env`
//! file loaded via `dotenvy` plus the live process environment carry
//! secrets (credentials, the database URL) and override any file value.

use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Default conversation log cap.
const DEFAULT_CONVERSATION_MESSAGES: u32 = 20;
/// Minimum allowed conversation log cap.
const MIN_CONVERSATION_MESSAGES: u32 = 2;
/// Maximum allowed conversation log cap.
const MAX_CONVERSATION_MESSAGES: u32 = 100;
/// Default IANA timezone used for date-relative reasoning.
const DEFAULT_TZ: &str = "America/New_York";
/// Default standard-tier model.
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
/// Default simple-tier model.
const DEFAULT_SIMPLE_MODEL: &str = "claude-3-5-haiku-20241022";
/// Default complex-tier model.
const DEFAULT_COMPLEX_MODEL: &str = "claude-opus-4-1-20250805";

/// Model identifiers for the three task-type tiers used by the LLM gateway.
#[derive(Debug, Clone)]
pub struct ModelsConfig {
    /// Standard tier: conversation, routing, composition.
    pub standard: String,
    /// Simple tier: fact extraction, trivial classification.
    pub simple: String,
    /// Complex tier: personality, safety, crisis handling.
    pub complex: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            standard: DEFAULT_MODEL.to_owned(),
            simple: DEFAULT_SIMPLE_MODEL.to_owned(),
            complex: DEFAULT_COMPLEX_MODEL.to_owned(),
        }
    }
}

/// Top-level runtime configuration, assembled from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection string (a file path, or `:memory:`).
    pub database_url: String,
    /// Telegram bot API token.
    pub telegram_bot_token: Option<String>,
    /// Anthropic API key.
    pub anthropic_api_key: Option<String>,
    /// Model routing configuration.
    pub models: ModelsConfig,
    /// Conversation log cap, clamped to `[2, 100]`.
    pub conversation_messages: u32,
    /// Default IANA timezone for date-relative reasoning.
    pub default_tz: String,
    /// Default ZIP code for weather-style skills with no explicit location.
    pub default_zip: Option<String>,
    /// Path to a deterministic LLM mock response file (test mode).
    pub llm_mock_path: Option<PathBuf>,
    /// Canonical phone numbers allowed to trigger the agent outside self-chat.
    pub agent_numbers: Vec<String>,
    /// Human-readable LLM request/response log path.
    pub request_log: Option<PathBuf>,
    /// Human-readable router decision log path.
    pub router_log: Option<PathBuf>,
    /// Directory holding rotated JSON log files.
    pub logs_dir: PathBuf,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Human-owned TOML layer: models, runtime knobs, and log paths. Secrets
/// (`DATABASE_URL`, bot token, API key) are never read from this file —
/// those come only from the environment, per `apply_env_overrides`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    models: FileModelsConfig,
    runtime: FileRuntimeConfig,
    logs: FileLogsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FileModelsConfig {
    standard: String,
    simple: String,
    complex: String,
}

impl Default for FileModelsConfig {
    fn default() -> Self {
        Self {
            standard: DEFAULT_MODEL.to_owned(),
            simple: DEFAULT_SIMPLE_MODEL.to_owned(),
            complex: DEFAULT_COMPLEX_MODEL.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FileRuntimeConfig {
    conversation_messages: u32,
    default_tz: String,
    default_zip: Option<String>,
    agent_numbers: Vec<String>,
}

impl Default for FileRuntimeConfig {
    fn default() -> Self {
        Self {
            conversation_messages: DEFAULT_CONVERSATION_MESSAGES,
            default_tz: DEFAULT_TZ.to_owned(),
            default_zip: None,
            agent_numbers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileLogsConfig {
    request_log: Option<PathBuf>,
    router_log: Option<PathBuf>,
    dir: Option<PathBuf>,
}

impl FileConfig {
    /// Read and parse `path`. A missing file yields defaults (first run,
    /// no `config.toml` written yet); any other I/O error, or a file that
    /// fails to parse, is surfaced.
    fn load_from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                toml::from_str(&contents).with_context(|| {
                    format!("failed to parse config file {}", path.display())
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read config file {}", path.display()))
            }
        }
    }
}

/// Resolve the default `config.toml` path (`~/.bo/config.toml`).
pub fn default_config_path() -> PathBuf {
    runtime_root().join("config.toml")
}

/// Load configuration, layering env vars over `config.toml` over defaults.
///
/// Loads `env_path` (if it exists) into the process environment first via
/// `dotenvy`, then parses `config_path` (if it exists) as the human-owned
/// TOML layer, then applies environment-variable overrides — including the
/// secrets that never live in the TOML file — clamping bounded values.
///
/// # Errors
///
/// Returns an error if `config_path` exists but fails to parse, or if
/// `DATABASE_URL` is missing — every other variable has a usable default.
pub fn load_config(
    env_path: &std::path::Path,
    config_path: &std::path::Path,
) -> anyhow::Result<Config> {
    if env_path.exists() {
        dotenvy::from_path(env_path)
            .with_context(|| format!("failed to load env file {}", env_path.display()))?;
    }

    let file = FileConfig::load_from_file(config_path)?;

    let database_url = env_var("DATABASE_URL")
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set (e.g. sqlite://bo.db)"))?;

    let conversation_messages = env_var("BO_CONVERSATION_MESSAGES")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(file.runtime.conversation_messages)
        .clamp(MIN_CONVERSATION_MESSAGES, MAX_CONVERSATION_MESSAGES);

    let agent_numbers = env_var("BO_AGENT_NUMBERS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(crate::identity::canonicalize)
                .collect()
        })
        .unwrap_or_else(|| {
            file.runtime
                .agent_numbers
                .iter()
                .map(|s| crate::identity::canonicalize(s))
                .collect()
        });

    let models = ModelsConfig {
        standard: env_var("BO_LLM_MODEL").unwrap_or(file.models.standard),
        simple: env_var("BO_SIMPLE_MODEL").unwrap_or(file.models.simple),
        complex: env_var("BO_COMPLEX_MODEL").unwrap_or(file.models.complex),
    };

    Ok(Config {
        database_url,
        telegram_bot_token: env_var("BO_TELEGRAM_BOT_TOKEN"),
        anthropic_api_key: env_var("ANTHROPIC_API_KEY"),
        models,
        conversation_messages,
        default_tz: env_var("BO_DEFAULT_TZ").unwrap_or(file.runtime.default_tz),
        default_zip: env_var("BO_DEFAULT_ZIP").or(file.runtime.default_zip),
        llm_mock_path: env_var("BO_LLM_MOCK_PATH").map(PathBuf::from),
        agent_numbers,
        request_log: env_var("BO_REQUEST_LOG")
            .map(PathBuf::from)
            .or(file.logs.request_log),
        router_log: env_var("BO_ROUTER_LOG")
            .map(PathBuf::from)
            .or(file.logs.router_log),
        logs_dir: env_var("BO_LOGS_DIR")
            .map(PathBuf::from)
            .or(file.logs.dir)
            .unwrap_or_else(|| runtime_root().join("logs")),
    })
}

/// Resolve the default runtime root directory (`~/.bo`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_root() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".bo"))
        .unwrap_or_else(|| PathBuf::from(".bo"))
}

/// Resolve the default `.env` path (`~/.bo/.env`).
pub fn default_env_path() -> PathBuf {
    runtime_root().join(".env")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(unsafe_code)]
    fn conversation_messages_clamped_to_bounds() {
        // SAFETY: single-threaded test process, no concurrent env mutation.
        unsafe {
            std::env::set_var("DATABASE_URL", "sqlite::memory:");
            std::env::set_var("BO_CONVERSATION_MESSAGES", "1");
        }
        let nonexistent = std::path::Path::new("/nonexistent");
        let cfg = load_config(nonexistent, nonexistent).expect("config loads");
        assert_eq!(cfg.conversation_messages, MIN_CONVERSATION_MESSAGES);
        unsafe {
            std::env::set_var("BO_CONVERSATION_MESSAGES", "5000");
        }
        let cfg = load_config(nonexistent, nonexistent).expect("config loads");
        assert_eq!(cfg.conversation_messages, MAX_CONVERSATION_MESSAGES);
        unsafe {
            std::env::remove_var("DATABASE_URL");
            std::env::remove_var("BO_CONVERSATION_MESSAGES");
        }
    }

    #[test]
    #[allow(unsafe_code)]
    fn missing_database_url_errors() {
        // SAFETY: single-threaded test process, no concurrent env mutation.
        unsafe {
            std::env::remove_var("DATABASE_URL");
        }
        let nonexistent = std::path::Path::new("/nonexistent");
        let result = load_config(nonexistent, nonexistent);
        assert!(result.is_err());
    }

    #[test]
    #[allow(unsafe_code)]
    fn toml_file_supplies_values_env_does_not_override() {
        let dir = std::env::temp_dir().join(format!("bo-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.toml");
        std::fs::write(
            &config_path,
            r#"
            [models]
            standard = "file-model"

            [runtime]
            default_tz = "Europe/Berlin"
            agent_numbers = ["5551234567"]
            "#,
        )
        .unwrap();

        // SAFETY: single-threaded test process, no concurrent env mutation.
        unsafe {
            std::env::set_var("DATABASE_URL", "sqlite::memory:");
            std::env::remove_var("BO_LLM_MODEL");
            std::env::remove_var("BO_DEFAULT_TZ");
            std::env::remove_var("BO_AGENT_NUMBERS");
        }
        let cfg =
            load_config(std::path::Path::new("/nonexistent"), &config_path).expect("config loads");
        assert_eq!(cfg.models.standard, "file-model");
        assert_eq!(cfg.default_tz, "Europe/Berlin");
        assert_eq!(cfg.agent_numbers, vec!["5551234567".to_owned()]);

        unsafe {
            std::env::set_var("BO_DEFAULT_TZ", "America/Chicago");
        }
        let cfg =
            load_config(std::path::Path::new("/nonexistent"), &config_path).expect("config loads");
        assert_eq!(cfg.default_tz, "America/Chicago", "env var must win over file");

        unsafe {
            std::env::remove_var("DATABASE_URL");
            std::env::remove_var("BO_DEFAULT_TZ");
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
