use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// How the backend delivers its answer.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// One request, one complete answer.
    #[default]
    Blocking,
    /// Answer arrives as ordered server-sent chunks.
    Streaming,
}

impl std::fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseMode::Blocking => write!(f, "blocking"),
            ResponseMode::Streaming => write!(f, "streaming"),
        }
    }
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" => Ok(ResponseMode::Blocking),
            "streaming" => Ok(ResponseMode::Streaming),
            other => Err(format!(
                "RESPONSE_MODE must be 'blocking' or 'streaming' (got '{}')",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    pub signing_secret: String,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub api_key: String,
    pub base_url: String,
    pub response_mode: ResponseMode,
    pub request_timeout: Duration,
    pub suggested_questions: bool,
}

#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Largest attachment forwarded to the backend, in bytes.
    pub max_file_size: u64,
    /// Lowercased mimetypes the backend accepts.
    pub supported_types: Vec<String>,
}

impl FileConfig {
    pub fn is_supported(&self, mimetype: &str) -> bool {
        let mimetype = mimetype.to_ascii_lowercase();
        self.supported_types.iter().any(|t| *t == mimetype)
    }
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub ttl: Duration,
    /// When set, thread mappings survive restarts in this SQLite file.
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub slack: SlackConfig,
    pub backend: BackendConfig,
    pub files: FileConfig,
    pub conversations: ConversationConfig,
    pub port: u16,
    pub log_level: String,
}

const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";

const DEFAULT_SUPPORTED_FILE_TYPES: &str = "image/jpeg,image/jpg,image/png,image/gif,image/webp,\
     text/plain,text/markdown,application/pdf,text/html,text/csv,application/xml,\
     application/vnd.ms-excel,application/vnd.openxmlformats-officedocument.spreadsheetml.sheet,\
     application/msword,application/vnd.openxmlformats-officedocument.wordprocessingml.document,\
     application/epub+zip,audio/mpeg,audio/wav,audio/ogg,audio/mp3,\
     video/mp4,video/avi,video/mov,video/wmv";

fn default_port() -> u16 {
    3000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_file_size_mb() -> u64 {
    15
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

impl Config {
    /// Read the process environment (plus `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Every problem is collected
    /// so a misconfigured deployment reports all of them at once.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();

        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut required = |key: &str| match get(key) {
            Some(v) => v,
            None => {
                errors.push(format!("{} is required", key));
                String::new()
            }
        };
        let bot_token = required("SLACK_BOT_TOKEN");
        let signing_secret = required("SLACK_SIGNING_SECRET");
        let api_key = required("DIFY_API_KEY");

        let mut number = |key: &str, default: u64| -> u64 {
            match get(key) {
                None => default,
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    errors.push(format!("{} must be a non-negative integer (got '{}')", key, raw));
                    default
                }),
            }
        };
        let port = number("PORT", default_port() as u64);
        let request_timeout = number("REQUEST_TIMEOUT", default_request_timeout_secs());
        let max_file_size_mb = number("MAX_FILE_SIZE", default_max_file_size_mb());
        let cache_ttl = number("CONVERSATION_CACHE_TTL", default_cache_ttl_secs());

        let port = match u16::try_from(port) {
            Ok(p) => p,
            Err(_) => {
                errors.push(format!("PORT must fit in 0..=65535 (got {})", port));
                default_port()
            }
        };

        if request_timeout == 0 {
            errors.push("REQUEST_TIMEOUT must be at least 1 second".to_string());
        }

        let max_file_size = match max_file_size_mb.checked_mul(1024 * 1024) {
            Some(bytes) => bytes,
            None => {
                errors.push(format!(
                    "MAX_FILE_SIZE is too large (got {} MB)",
                    max_file_size_mb
                ));
                0
            }
        };

        let response_mode = match get("RESPONSE_MODE") {
            None => ResponseMode::default(),
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                errors.push(e);
                ResponseMode::default()
            }),
        };

        let base_url = get("DIFY_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let supported_types = get("SUPPORTED_FILE_TYPES")
            .unwrap_or_else(|| DEFAULT_SUPPORTED_FILE_TYPES.to_string())
            .split(',')
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let suggested_questions = get("SUGGESTED_QUESTIONS")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let log_level = get("LOG_LEVEL")
            .unwrap_or_else(|| "info".to_string())
            .to_ascii_lowercase();

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(Config {
            slack: SlackConfig {
                bot_token,
                signing_secret,
            },
            backend: BackendConfig {
                api_key,
                base_url,
                response_mode,
                request_timeout: Duration::from_secs(request_timeout),
                suggested_questions,
            },
            files: FileConfig {
                max_file_size,
                supported_types,
            },
            conversations: ConversationConfig {
                ttl: Duration::from_secs(cache_ttl),
                database_path: get("CONVERSATION_DB_PATH").map(PathBuf::from),
            },
            port,
            log_level,
        })
    }
}
