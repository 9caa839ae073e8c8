//! Environment-backed configuration.
//!
//! All options come from environment variables so deployment is a matter of
//! exporting the right names. `Config::from_lookup` takes any string lookup,
//! which keeps the parsing testable without touching the process environment.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::user::{Language, UserRole};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required variable is not set.
    Missing(&'static str),
    /// A variable is set but its value cannot be used.
    Invalid { key: &'static str, value: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "required environment variable {} is not set", key),
            Self::Invalid { key, value, reason } => {
                write!(f, "invalid value '{}' for {}: {}", value, key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// AI-completion collaborator settings.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub enabled: bool,
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Per-minute request quotas per privilege tier.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub user: u32,
    pub moderator: u32,
    pub admin: u32,
}

impl RateLimits {
    pub fn for_role(&self, role: UserRole) -> u32 {
        match role {
            UserRole::User => self.user,
            UserRole::Moderator => self.moderator,
            UserRole::Admin => self.admin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub admin_ids: HashSet<i64>,
    pub moderator_ids: HashSet<i64>,
    pub ai: AiConfig,
    pub rate_limits: RateLimits,
    pub default_language: Language,
    pub data_dir: PathBuf,
}

const DEFAULT_AI_URL: &str = "https://api.openai.com/v1/chat/completions";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = get("BOT_TOKEN").ok_or(ConfigError::Missing("BOT_TOKEN"))?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric.
        let token_parts: Vec<&str> = bot_token.split(':').collect();
        if token_parts.len() != 2
            || token_parts[0].parse::<u64>().is_err()
            || token_parts[1].is_empty()
        {
            return Err(ConfigError::Invalid {
                key: "BOT_TOKEN",
                value: bot_token,
                reason: "expected format 123456789:ABCdefGHI...".to_string(),
            });
        }

        let admin_ids = parse_id_list("ADMIN_IDS", get("ADMIN_IDS"))?;
        let moderator_ids = parse_id_list("MODERATOR_IDS", get("MODERATOR_IDS"))?;

        let ai_enabled = match get("AI_ENABLED") {
            None => true,
            Some(v) => parse_bool("AI_ENABLED", &v)?,
        };

        let temperature = parse_or_default("AI_TEMPERATURE", get("AI_TEMPERATURE"), 0.7f32)?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid {
                key: "AI_TEMPERATURE",
                value: temperature.to_string(),
                reason: "must be between 0.0 and 2.0".to_string(),
            });
        }

        let ai = AiConfig {
            enabled: ai_enabled,
            api_key: get("AI_API_KEY").unwrap_or_default(),
            api_url: get("AI_API_URL").unwrap_or_else(|| DEFAULT_AI_URL.to_string()),
            model: get("AI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            temperature,
            max_tokens: parse_or_default("AI_MAX_TOKENS", get("AI_MAX_TOKENS"), 1000u32)?,
            timeout: Duration::from_secs(parse_or_default(
                "AI_TIMEOUT_SECS",
                get("AI_TIMEOUT_SECS"),
                30u64,
            )?),
        };

        let rate_limits = RateLimits {
            user: parse_or_default("RATE_LIMIT_USER", get("RATE_LIMIT_USER"), 10u32)?,
            moderator: parse_or_default(
                "RATE_LIMIT_MODERATOR",
                get("RATE_LIMIT_MODERATOR"),
                20u32,
            )?,
            admin: parse_or_default("RATE_LIMIT_ADMIN", get("RATE_LIMIT_ADMIN"), 30u32)?,
        };

        let default_language = match get("DEFAULT_LANGUAGE") {
            None => Language::default(),
            Some(code) => Language::from_code(&code).ok_or_else(|| ConfigError::Invalid {
                key: "DEFAULT_LANGUAGE",
                value: code,
                reason: format!(
                    "supported languages: {}",
                    Language::ALL.map(|l| l.code()).join(", ")
                ),
            })?,
        };

        let data_dir = PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "data".to_string()));

        Ok(Self {
            bot_token,
            admin_ids,
            moderator_ids,
            ai,
            rate_limits,
            default_language,
            data_dir,
        })
    }

    /// Role a newly created record starts with, seeded from the configured
    /// identity lists. Role changes after creation go through the store.
    pub fn initial_role(&self, user_id: i64) -> UserRole {
        if self.admin_ids.contains(&user_id) {
            UserRole::Admin
        } else if self.moderator_ids.contains(&user_id) {
            UserRole::Moderator
        } else {
            UserRole::User
        }
    }
}

fn parse_id_list(key: &'static str, raw: Option<String>) -> Result<HashSet<i64>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(HashSet::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: format!("'{}' is not a numeric user id", s),
            })
        })
        .collect()
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_or_default<T: std::str::FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value: v,
            reason: format!("expected a {}", std::any::type_name::<T>()),
        }),
    }
}
