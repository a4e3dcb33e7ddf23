use async_trait::async_trait;
use bridge_types::MessageEntity;
use serde::Serialize;

use crate::error::TelegramError;

/// Body of a `sendMessage` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendMessage {
    pub chat_id: i64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
    pub disable_notification: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<MessageEntity>>,
}

impl SendMessage {
    pub fn new(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            reply_to_message_id: None,
            disable_notification: false,
            entities: None,
        }
    }

    pub fn reply_to(mut self, message_id: i64) -> Self {
        self.reply_to_message_id = Some(message_id);
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.disable_notification = silent;
        self
    }

    pub fn with_entities(mut self, entities: Option<Vec<MessageEntity>>) -> Self {
        self.entities = entities;
        self
    }
}

/// A text message received from the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    pub reply_to_text: Option<String>,
    pub sender: Option<String>,
}

/// The three Bot API calls the bridge needs.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Returns the id of the new message.
    async fn send_message(&self, message: &SendMessage) -> Result<i64, TelegramError>;

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        entities: Option<&[MessageEntity]>,
    ) -> Result<(), TelegramError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TelegramError>;
}
