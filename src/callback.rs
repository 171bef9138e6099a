//! Button payloads.
//!
//! Selection buttons carry `<kind>|<chat_id>|<origin_message_id>|<bucket>`
//! with `kind` being `v` (video) or `a` (audio, bucket `0`). Menu buttons
//! carry `menu_<action>`. Parsing only validates shape; whether the session
//! still exists is checked separately so the two failures stay distinct.

use crate::error::{AppError, Result};
use crate::model::{ChatId, MessageId, SessionKey, LADDER};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Video { key: SessionKey, bucket: u32 },
    Audio { key: SessionKey },
}

impl Selection {
    pub fn key(&self) -> SessionKey {
        match self {
            Selection::Video { key, .. } | Selection::Audio { key } => *key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Help,
    Settings,
    Video,
    Audio,
    Cleanup,
}

impl MenuAction {
    fn as_str(self) -> &'static str {
        match self {
            MenuAction::Help => "help",
            MenuAction::Settings => "settings",
            MenuAction::Video => "video",
            MenuAction::Audio => "mp3",
            MenuAction::Cleanup => "cleanup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackData {
    Select(Selection),
    Menu(MenuAction),
}

impl CallbackData {
    pub fn video(chat_id: ChatId, message_id: MessageId, bucket: u32) -> Self {
        CallbackData::Select(Selection::Video {
            key: SessionKey::new(chat_id, message_id),
            bucket,
        })
    }

    pub fn audio(chat_id: ChatId, message_id: MessageId) -> Self {
        CallbackData::Select(Selection::Audio {
            key: SessionKey::new(chat_id, message_id),
        })
    }
}

impl fmt::Display for CallbackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackData::Select(Selection::Video { key, bucket }) => {
                write!(f, "v|{}|{}|{}", key.chat_id, key.message_id, bucket)
            }
            CallbackData::Select(Selection::Audio { key }) => {
                write!(f, "a|{}|{}|0", key.chat_id, key.message_id)
            }
            CallbackData::Menu(action) => write!(f, "menu_{}", action.as_str()),
        }
    }
}

fn malformed(data: &str, why: &str) -> AppError {
    AppError::MalformedCallback(format!("{why}: {data:?}"))
}

impl FromStr for CallbackData {
    type Err = AppError;

    fn from_str(data: &str) -> Result<Self> {
        if let Some(action) = data.strip_prefix("menu_") {
            let action = match action {
                "help" => MenuAction::Help,
                "settings" => MenuAction::Settings,
                "video" => MenuAction::Video,
                "mp3" => MenuAction::Audio,
                "cleanup" => MenuAction::Cleanup,
                _ => return Err(malformed(data, "unknown menu action")),
            };
            return Ok(CallbackData::Menu(action));
        }

        let parts: Vec<&str> = data.split('|').collect();
        let [kind, chat_id, message_id, bucket] = parts.as_slice() else {
            return Err(malformed(data, "expected four fields"));
        };
        let chat_id: ChatId = chat_id
            .parse()
            .map_err(|_| malformed(data, "bad chat id"))?;
        let message_id: MessageId = message_id
            .parse()
            .map_err(|_| malformed(data, "bad message id"))?;
        let bucket: u32 = bucket.parse().map_err(|_| malformed(data, "bad bucket"))?;

        match *kind {
            "v" if LADDER.contains(&bucket) => Ok(CallbackData::video(chat_id, message_id, bucket)),
            "v" => Err(malformed(data, "bucket outside ladder")),
            "a" if bucket == 0 => Ok(CallbackData::audio(chat_id, message_id)),
            "a" => Err(malformed(data, "audio selection carries a bucket")),
            _ => Err(malformed(data, "unknown kind")),
        }
    }
}
