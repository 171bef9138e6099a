use crate::error::Result;
use crate::model::{ChatId, MessageId};
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn callback(label: impl Into<String>, data: impl ToString) -> Self {
        Self {
            label: label.into(),
            data: data.to_string(),
        }
    }
}

/// Rows of inline buttons.
pub type Keyboard = Vec<Vec<Button>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Outbound side of the chat transport.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: ChatId, text: &str, keyboard: Option<Keyboard>)
        -> Result<MessageId>;

    async fn reply(&self, chat_id: ChatId, to: MessageId, text: &str) -> Result<MessageId>;

    async fn edit(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    /// Uploads a finished artifact. Failures map to `AppError::Send`.
    async fn send_media(&self, chat_id: ChatId, path: &Path, kind: MediaKind) -> Result<()>;
}
