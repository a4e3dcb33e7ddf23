use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the Bot API.
///
/// Nothing in here ever carries a request URL: the bot token lives in the
/// path, so transport errors are stored with the URL stripped.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram {method} request failed: {detail}")]
    Http { method: String, detail: String },
    #[error("telegram {method} timed out")]
    Timeout { method: String },
    #[error("telegram {method} rate limited (retry after {retry_after:?}s)")]
    RateLimited {
        method: String,
        retry_after: Option<u64>,
    },
    #[error("telegram {method} failed ({status}): {description}")]
    Api {
        method: String,
        status: u16,
        description: String,
    },
    #[error("telegram {method} returned an unexpected payload: {detail}")]
    Decode { method: String, detail: String },
    #[error("failed to build telegram client: {0}")]
    Client(String),
}

impl TelegramError {
    pub fn from_reqwest(method: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                method: method.to_string(),
            };
        }
        let err = err.without_url();
        Self::Http {
            method: method.to_string(),
            detail: bridge_observability::redact_bot_token(&err.to_string()),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Telegram answers 400 when an edit would not change anything.
    pub fn is_not_modified(&self) -> bool {
        matches!(
            self,
            Self::Api { status: 400, description, .. } if description.contains("message is not modified")
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (looked in {searched})")]
    NotFound { searched: String },
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid `{key}` in {}: {reason}", .path.display())]
    Invalid {
        path: PathBuf,
        key: &'static str,
        reason: String,
    },
}
