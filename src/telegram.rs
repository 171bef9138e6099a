use crate::config::TelegramConfig;
use crate::error::{AppError, Result};
use crate::handlers::Handlers;
use crate::messenger::{Keyboard, MediaKind, Messenger};
use crate::model;
use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{
    AllowedUpdate, BotCommand, CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup,
    InputFile, MessageId, ReplyParameters, UpdateKind,
};
use teloxide::{ApiError, RequestError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const POLL_TIMEOUT_SECS: u32 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Uploads of large files take far longer than a long poll.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Builds the bot client, pointed at a self-hosted Bot API server when one
/// is configured.
///
/// # Errors
/// Returns `AppError::Request` if the HTTP client cannot be built.
pub fn build_bot(config: &TelegramConfig) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(CLIENT_TIMEOUT)
        .build()
        .map_err(AppError::Request)?;
    let bot = Bot::with_client(config.token.expose_secret(), client);
    Ok(match &config.api_url {
        Some(url) => bot.set_api_url(url.clone()),
        None => bot,
    })
}

/// [`Messenger`] backed by the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn markup(keyboard: Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.into_iter().map(|row| {
        row.into_iter()
            .map(|button| InlineKeyboardButton::callback(button.label, button.data))
            .collect::<Vec<_>>()
    }))
}

fn is_message_not_modified(error: &RequestError) -> bool {
    matches!(error, RequestError::Api(ApiError::MessageNotModified))
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(
        &self,
        chat_id: model::ChatId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<model::MessageId> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(markup(keyboard));
        }
        Ok(request.await?.id.0)
    }

    async fn reply(
        &self,
        chat_id: model::ChatId,
        to: model::MessageId,
        text: &str,
    ) -> Result<model::MessageId> {
        let message = self
            .bot
            .send_message(ChatId(chat_id), text)
            .reply_parameters(ReplyParameters::new(MessageId(to)).allow_sending_without_reply())
            .await?;
        Ok(message.id.0)
    }

    async fn edit(
        &self,
        chat_id: model::ChatId,
        message_id: model::MessageId,
        text: &str,
    ) -> Result<()> {
        match self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), text)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_message_not_modified(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut request = self.bot.answer_callback_query(callback_id.to_string());
        if let Some(text) = text {
            request = request.text(text);
        }
        request.await?;
        Ok(())
    }

    async fn send_media(&self, chat_id: model::ChatId, path: &Path, kind: MediaKind) -> Result<()> {
        let input = InputFile::file(path.to_path_buf());
        let sent = match kind {
            MediaKind::Video => self
                .bot
                .send_video(ChatId(chat_id), input)
                .supports_streaming(true)
                .await
                .map(|_| ()),
            MediaKind::Audio => self
                .bot
                .send_audio(ChatId(chat_id), input)
                .await
                .map(|_| ()),
        };
        sent.map_err(|e| AppError::Send(e.to_string()))
    }
}

/// Long-polls for updates until `cancel` fires.
///
/// Each update is handled on its own task so a slow scan never holds up
/// button presses. A conflicting poller on the same token stops the loop.
pub async fn run_polling(
    bot: Bot,
    handlers: Arc<Handlers>,
    cancel: CancellationToken,
) -> Result<()> {
    let me = bot.get_me().await?;
    bot.delete_webhook().send().await?;

    let commands = vec![
        BotCommand::new("start", "Show the main menu"),
        BotCommand::new("help", "How to use the bot"),
        BotCommand::new("cleanup", "Delete downloaded files"),
        BotCommand::new("setminq", "Set the minimum offered quality"),
    ];
    if let Err(e) = bot.set_my_commands(commands).await {
        warn!(error = %e, "failed to register bot commands");
    }
    info!(username = ?me.username, "telegram bot connected (webhook cleared)");

    let mut offset: i32 = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = bot
                .get_updates()
                .offset(offset)
                .timeout(POLL_TIMEOUT_SECS)
                .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery])
                .send() => result,
        };

        match result {
            Ok(updates) => {
                debug!(count = updates.len(), "got telegram updates");
                for update in updates {
                    offset = update.id.as_offset();
                    dispatch(Arc::clone(&handlers), update.kind);
                }
            }
            Err(RequestError::Api(ApiError::TerminatedByOtherGetUpdates)) => {
                error!("another instance is already polling with this token");
                return Err(AppError::Config(
                    "bot token is in use by another instance".into(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "telegram getUpdates failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }

    info!("telegram polling stopped");
    Ok(())
}

fn dispatch(handlers: Arc<Handlers>, kind: UpdateKind) {
    match kind {
        UpdateKind::Message(message) => {
            let Some(text) = message.text().or(message.caption()).map(str::to_string) else {
                return;
            };
            let (chat_id, message_id) = (message.chat.id.0, message.id.0);
            tokio::spawn(async move {
                if let Err(e) = handlers.handle_message(chat_id, message_id, &text).await {
                    error!(chat_id, error = %e, "error handling telegram message");
                }
            });
        }
        UpdateKind::CallbackQuery(query) => {
            tokio::spawn(async move {
                if let Err(e) = handle_query(&handlers, query).await {
                    error!(error = %e, "error handling telegram callback query");
                }
            });
        }
        other => debug!("ignoring update: {other:?}"),
    }
}

async fn handle_query(handlers: &Handlers, query: CallbackQuery) -> Result<()> {
    let origin_chat = query.message.as_ref().map(|m| m.chat().id.0);
    let data = query.data.as_deref().unwrap_or_default();
    handlers
        .handle_callback(&query.id, origin_chat, data)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::Button;
    use secrecy::Secret;
    use url::Url;

    fn telegram_config(api_url: Option<&str>) -> TelegramConfig {
        TelegramConfig {
            token: Secret::new("123456:test-token".into()),
            api_url: api_url.map(|u| Url::parse(u).unwrap()),
        }
    }

    #[test]
    fn bot_targets_the_configured_api_server() {
        let bot = build_bot(&telegram_config(Some("http://127.0.0.1:8081"))).unwrap();
        assert_eq!(bot.api_url().as_str(), "http://127.0.0.1:8081/");
    }

    #[test]
    fn bot_defaults_to_the_public_api() {
        let bot = build_bot(&telegram_config(None)).unwrap();
        assert_eq!(bot.api_url().host_str(), Some("api.telegram.org"));
    }

    #[test]
    fn keyboard_rows_are_preserved() {
        let keyboard = vec![
            vec![Button::callback("a", "v|1|2|480"), Button::callback("b", "v|1|2|720")],
            vec![Button::callback("c", "a|1|2|0")],
        ];
        let markup = markup(keyboard);
        assert_eq!(markup.inline_keyboard.len(), 2);
        assert_eq!(markup.inline_keyboard[0].len(), 2);
        assert_eq!(markup.inline_keyboard[1][0].text, "c");
    }

    #[test]
    fn not_modified_is_recognised() {
        assert!(is_message_not_modified(&RequestError::Api(
            ApiError::MessageNotModified
        )));
        assert!(!is_message_not_modified(&RequestError::Api(
            ApiError::MessageToEditNotFound
        )));
    }
}
