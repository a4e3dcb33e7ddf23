//! Thin Telegram Bot API client.
//!
//! Long-polls `getUpdates` and covers the three message calls the bridge
//! makes. A 429 is reported as [`TelegramError::RateLimited`] and never
//! retried here: a skipped progress edit is cheaper than a stalled run.

use std::time::Duration;

use async_trait::async_trait;
use bridge_types::MessageEntity;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::TelegramError;
use crate::traits::{ChatTransport, IncomingMessage, SendMessage};

const TELEGRAM_API: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const BODY_PREVIEW_CHARS: usize = 320;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

impl Message {
    fn body(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }

    /// `None` for messages without text (stickers, photos without caption…).
    pub fn into_incoming(self) -> Option<IncomingMessage> {
        let text = self.text.clone()?;
        // prefer @username, then first name, then the numeric id
        let sender = self.from.as_ref().map(|user| {
            user.username
                .as_ref()
                .map(|name| format!("@{name}"))
                .or_else(|| user.first_name.clone())
                .unwrap_or_else(|| user.id.to_string())
        });
        let reply_to_text = self
            .reply_to_message
            .as_deref()
            .and_then(Message::body)
            .map(str::to_string);
        Some(IncomingMessage {
            chat_id: self.chat.id,
            message_id: self.message_id,
            text,
            reply_to_text,
            sender,
        })
    }
}

#[derive(Clone)]
pub struct TelegramClient {
    bot_token: String,
    base_url: String,
    client: Client,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(bot_token: impl Into<String>) -> Result<Self, TelegramError> {
        Self::with_base_url(bot_token, TELEGRAM_API)
    }

    /// Point the client at another API root (a local Bot API server, a test mock).
    pub fn with_base_url(
        bot_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, TelegramError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TelegramError::Client(e.without_url().to_string()))?;
        Ok(Self {
            bot_token: bot_token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.bot_token, method)
    }

    /// POST one API method and unwrap the `{ok, result}` envelope.
    pub async fn call<T, P>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<T, TelegramError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let resp = self
            .client
            .post(self.api_url(method))
            .timeout(timeout)
            .json(params)
            .send()
            .await
            .map_err(|e| TelegramError::from_reqwest(method, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TelegramError::from_reqwest(method, e))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = serde_json::from_str::<ApiResponse<Value>>(&body)
                .ok()
                .and_then(|envelope| envelope.parameters)
                .and_then(|params| params.retry_after);
            warn!(method, ?retry_after, "telegram rate limited; not retrying");
            return Err(TelegramError::RateLimited {
                method: method.to_string(),
                retry_after,
            });
        }

        let envelope = match serde_json::from_str::<ApiResponse<T>>(&body) {
            Ok(envelope) => envelope,
            Err(err) if status.is_success() => {
                return Err(TelegramError::Decode {
                    method: method.to_string(),
                    detail: err.to_string(),
                });
            }
            Err(_) => {
                let description = preview(&body);
                warn!(method, status = status.as_u16(), "telegram {method} failed: {description}");
                return Err(TelegramError::Api {
                    method: method.to_string(),
                    status: status.as_u16(),
                    description,
                });
            }
        };

        if !status.is_success() || !envelope.ok {
            let description = envelope
                .description
                .unwrap_or_else(|| "no description".to_string());
            debug!(method, status = status.as_u16(), "telegram {method} rejected: {description}");
            return Err(TelegramError::Api {
                method: method.to_string(),
                status: status.as_u16(),
                description,
            });
        }

        envelope.result.ok_or_else(|| TelegramError::Decode {
            method: method.to_string(),
            detail: "missing result".to_string(),
        })
    }

    /// Long poll. `timeout_secs` is the server-side wait; the HTTP timeout
    /// leaves room on top of it.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let params = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        self.call(
            "getUpdates",
            &params,
            Duration::from_secs(timeout_secs) + REQUEST_TIMEOUT,
        )
        .await
    }

    /// Skip everything queued before startup. Returns the next offset.
    pub async fn drain_backlog(&self) -> Result<i64, TelegramError> {
        let pending = self.get_updates(-1, 0).await?;
        Ok(pending
            .iter()
            .map(|update| update.update_id + 1)
            .max()
            .unwrap_or(0))
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_message(&self, message: &SendMessage) -> Result<i64, TelegramError> {
        let sent: Message = self.call("sendMessage", message, REQUEST_TIMEOUT).await?;
        Ok(sent.message_id)
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        entities: Option<&[MessageEntity]>,
    ) -> Result<(), TelegramError> {
        let mut params = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(entities) = entities {
            params["entities"] = json!(entities);
        }
        match self
            .call::<Value, _>("editMessageText", &params, REQUEST_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_modified() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TelegramError> {
        let params = json!({ "chat_id": chat_id, "message_id": message_id });
        self.call::<bool, _>("deleteMessage", &params, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }
}

fn preview(body: &str) -> String {
    if body.chars().count() > BODY_PREVIEW_CHARS {
        let truncated: String = body.chars().take(BODY_PREVIEW_CHARS).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    }
}
