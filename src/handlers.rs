use crate::callback::{CallbackData, MenuAction, Selection};
use crate::config::Settings;
use crate::downloader::Downloader;
use crate::error::{AppError, Result};
use crate::extractor::{Extractor, Transcoder};
use crate::ladder::{Resolver, Scan};
use crate::messenger::{Button, Keyboard, Messenger};
use crate::model::{ChatId, Job, JobMode, MessageId, SessionKey, MAX_BUCKET, MIN_BUCKET};
use crate::progress::{format_duration, format_size};
use crate::queue::JobQueue;
use crate::session::SessionStore;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{info, instrument, warn};
use url::Url;

fn url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)https?://\S+").ok())
        .as_ref()
}

/// First http(s) URL in `text`, if it parses.
pub fn find_url(text: &str) -> Option<String> {
    let candidate = url_pattern()?.find(text)?.as_str().trim();
    Url::parse(candidate).ok().map(|_| candidate.to_string())
}

/// Inbound event handling, independent of the chat transport.
///
/// Owns the session store, the resolver and the job queue, and hands
/// accepted selections to the downloader through the queue.
pub struct Handlers {
    messenger: Arc<dyn Messenger>,
    resolver: Resolver,
    sessions: Arc<SessionStore>,
    downloader: Arc<Downloader>,
    queue: JobQueue,
    settings: Arc<Settings>,
}

impl Handlers {
    /// Wires the components together and starts the job queue.
    pub fn new(
        messenger: Arc<dyn Messenger>,
        extractor: Arc<dyn Extractor>,
        transcoder: Option<Arc<dyn Transcoder>>,
        settings: Arc<Settings>,
    ) -> Self {
        let config = settings.config();
        let sessions = Arc::new(SessionStore::new(
            config.session_ttl(),
            config.session_capacity,
        ));
        let downloader = Arc::new(Downloader::new(
            Arc::clone(&extractor),
            transcoder,
            Arc::clone(&messenger),
            Arc::clone(&sessions),
            Arc::clone(&settings),
        ));
        let queue = JobQueue::start(downloader.clone(), &settings);
        let resolver = Resolver::new(extractor, Arc::clone(&settings));

        Self {
            messenger,
            resolver,
            sessions,
            downloader,
            queue,
            settings,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Closes the queue and waits for running jobs.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Free text: a command or a message possibly carrying a link.
    pub async fn handle_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
    ) -> Result<()> {
        let text = text.trim();
        if text.starts_with('/') {
            return self.handle_command(chat_id, message_id, text).await;
        }
        match find_url(text) {
            Some(url) => self.scan(chat_id, message_id, &url).await,
            None => Ok(()),
        }
    }

    async fn handle_command(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<()> {
        let mut parts = text.split_whitespace();
        let command = parts
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match command {
            "/start" => {
                self.messenger
                    .send(chat_id, &self.start_text(), Some(start_keyboard()))
                    .await?;
            }
            "/help" => {
                self.messenger.reply(chat_id, message_id, HELP_TEXT).await?;
            }
            "/cleanup" => {
                let text = self.cleanup().await;
                self.messenger.reply(chat_id, message_id, &text).await?;
            }
            "/setminq" => {
                let text = self.set_min_quality(&args);
                self.messenger.reply(chat_id, message_id, &text).await?;
            }
            _ => {
                if let Some(url) = find_url(text) {
                    return self.scan(chat_id, message_id, &url).await;
                }
            }
        }
        Ok(())
    }

    /// Resolves `url` and offers the quality menu.
    ///
    /// The session is keyed by the inbound message and stored before the menu
    /// goes out, so a fast click always finds it.
    #[instrument(skip(self))]
    pub async fn scan(&self, chat_id: ChatId, message_id: MessageId, url: &str) -> Result<()> {
        if let Err(e) = self.messenger.reply(chat_id, message_id, "🔎 SCANNING...").await {
            warn!(chat_id, error = %e, "could not acknowledge link");
        }

        let scan = match self.resolver.scan(url).await {
            Ok(scan) => scan,
            Err(e) => {
                warn!(chat_id, url, error = %e, "scan failed");
                let text = scan_failure_text(&e);
                self.messenger.reply(chat_id, message_id, &text).await?;
                return Ok(());
            }
        };

        let text = menu_text(&scan);
        let keyboard = self.menu_keyboard(chat_id, message_id, &scan);
        let key = SessionKey::new(chat_id, message_id);
        info!(key = %key, offered = ?scan.offered, "session created");
        self.sessions.put(key, scan.session);

        self.messenger.send(chat_id, &text, Some(keyboard)).await?;
        Ok(())
    }

    /// Button press. `origin_chat` is the chat the button lives in, when known.
    pub async fn handle_callback(
        &self,
        callback_id: &str,
        origin_chat: Option<ChatId>,
        data: &str,
    ) -> Result<()> {
        let parsed = data.parse::<CallbackData>().and_then(|parsed| match parsed {
            CallbackData::Select(selection)
                if origin_chat.is_some_and(|c| c != selection.key().chat_id) =>
            {
                Err(AppError::MalformedCallback(format!("chat mismatch: {data:?}")))
            }
            other => Ok(other),
        });

        match parsed {
            Ok(CallbackData::Menu(action)) => {
                self.answer(callback_id, None).await;
                if let Some(chat_id) = origin_chat {
                    self.handle_menu(chat_id, action).await?;
                }
            }
            Ok(CallbackData::Select(selection)) => {
                let answer = match self.select(selection) {
                    Ok(waiting) => format!("⏳ QUEUED (#{waiting})"),
                    Err(e) => {
                        info!(key = %selection.key(), reason = %e, "selection rejected");
                        selection_failure_text(&e)
                    }
                };
                self.answer(callback_id, Some(&answer)).await;
            }
            Err(e) => {
                warn!(error = %e, "rejected callback");
                self.answer(callback_id, Some("INVALID BUTTON.")).await;
            }
        }
        Ok(())
    }

    /// Validates a selection against its session and enqueues the job.
    pub fn select(&self, selection: Selection) -> Result<usize> {
        let key = selection.key();
        let session = self.sessions.get(&key).ok_or(AppError::SessionExpired)?;

        let mode = match selection {
            Selection::Video { bucket, .. } => {
                let format_id = session
                    .ladder
                    .format_for(bucket)
                    .ok_or(AppError::QualityUnavailable(bucket))?;
                JobMode::Video {
                    format_id: format_id.to_string(),
                }
            }
            Selection::Audio { .. } => JobMode::Audio,
        };

        self.queue.enqueue(Job {
            chat_id: key.chat_id,
            origin_message_id: key.message_id,
            mode,
        })
    }

    async fn handle_menu(&self, chat_id: ChatId, action: MenuAction) -> Result<()> {
        let text = match action {
            MenuAction::Help => String::from(
                "🕶️ Send link → choose quality button → download.\nUse /setminq to save space.",
            ),
            MenuAction::Settings => format!(
                "⚙ SETTINGS (now {}p):\n/setminq 360  (save data)\n/setminq 480  (default)\n/setminq 720  (higher)",
                self.settings.min_quality()
            ),
            MenuAction::Video => {
                String::from("🎬 Send a video link now. I will show quality buttons.")
            }
            MenuAction::Audio => String::from("🎧 Send a link, then choose the MP3 button."),
            MenuAction::Cleanup => self.cleanup().await,
        };
        self.messenger.send(chat_id, &text, None).await?;
        Ok(())
    }

    async fn cleanup(&self) -> String {
        match self.downloader.clear_output_dir().await {
            Ok(()) => format!(
                "🧹 CLEANED. {}/ is empty.",
                self.settings.config().output_dir.display()
            ),
            Err(AppError::Busy(active)) => {
                format!("⏳ {active} job(s) still running. Try /cleanup later.")
            }
            Err(e) => {
                warn!(error = %e, "cleanup failed");
                format!("❌ CLEANUP FAILED: {}", e.label())
            }
        }
    }

    fn set_min_quality(&self, args: &[&str]) -> String {
        let [value] = args else {
            return String::from("Usage: /setminq 360  (or 480 / 720)");
        };
        let Ok(value) = value.parse::<u32>() else {
            return String::from("Usage: /setminq 360  (or 480 / 720)");
        };
        match self.settings.set_min_quality(value) {
            Ok(()) => {
                info!(min_quality = value, "minimum quality changed");
                format!("✅ MIN QUALITY SET TO {value}p")
            }
            Err(_) => format!("Pick a value between {MIN_BUCKET} and {MAX_BUCKET} (e.g. 360, 480, 720)."),
        }
    }

    async fn answer(&self, callback_id: &str, text: Option<&str>) {
        if let Err(e) = self.messenger.answer_callback(callback_id, text).await {
            warn!(callback_id, error = %e, "could not answer callback");
        }
    }

    fn start_text(&self) -> String {
        format!(
            "🟢  GRABBOT  //  ONLINE\n\
             ━━━━━━━━━━━━━━━━━━\n\
             📌 Send a PUBLIC link:\n\
             YouTube | TikTok | Instagram | Facebook | X\n\n\
             🧩 Rules:\n\
             - Max Duration: {}\n\
             - Choose Quality (>= {}p)\n\
             - Private links may fail\n\
             ━━━━━━━━━━━━━━━━━━\n\
             Select an option ↓",
            format_limit(self.settings.config().max_duration_secs),
            self.settings.min_quality()
        )
    }

    fn menu_keyboard(&self, chat_id: ChatId, message_id: MessageId, scan: &Scan) -> Keyboard {
        let mut rows: Keyboard = scan
            .offered
            .iter()
            .map(|&bucket| {
                vec![Button::callback(
                    bucket_label(bucket, scan.session.ladder.size_for(bucket)),
                    CallbackData::video(chat_id, message_id, bucket),
                )]
            })
            .collect();

        let audio_label = if self.settings.config().audio.transcode {
            "🎧 MP3 ONLY"
        } else {
            "🎧 AUDIO ONLY"
        };
        rows.push(vec![Button::callback(
            audio_label,
            CallbackData::audio(chat_id, message_id),
        )]);
        rows
    }
}

const HELP_TEXT: &str = "🕶️ HOW TO USE:\n\
    1) Send a link\n\
    2) Bot shows title/duration + quality buttons\n\
    3) Pick quality OR MP3\n\n\
    Commands:\n\
    /start - menu\n\
    /help - guide\n\
    /cleanup - delete downloaded files\n\
    /setminq 360|480|720 - set minimum quality buttons";

fn start_keyboard() -> Keyboard {
    vec![
        vec![
            Button::callback("🕶️ HOW TO", CallbackData::Menu(MenuAction::Help)),
            Button::callback("⚙ SETTINGS", CallbackData::Menu(MenuAction::Settings)),
        ],
        vec![
            Button::callback("🎬 VIDEO", CallbackData::Menu(MenuAction::Video)),
            Button::callback("🎧 MP3", CallbackData::Menu(MenuAction::Audio)),
        ],
        vec![Button::callback(
            "🧹 CLEANUP",
            CallbackData::Menu(MenuAction::Cleanup),
        )],
    ]
}

pub fn bucket_label(bucket: u32, size: Option<u64>) -> String {
    format!("🎥 {bucket}p [{}]", format_size(size))
}

pub fn menu_text(scan: &Scan) -> String {
    let mut lines = vec![
        String::from("🧾 TARGET LOCKED:"),
        format!("• TITLE: {}", scan.session.title),
        format!("• SRC: {}", scan.uploader),
        format!("• DUR: {}", format_duration(scan.session.duration)),
        String::new(),
        format!("🎬 PICK QUALITY (>= {}p):", scan.min_quality),
    ];
    if scan.offered.is_empty() {
        lines.push(String::from("⚠️ NO QUALITIES FOUND FOR THIS LINK."));
        lines.push(String::from("Try another link or use MP3."));
    }
    lines.join("\n")
}

/// Whole hours as `3h`, anything else as a clock.
fn format_limit(seconds: u64) -> String {
    if seconds > 0 && seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else {
        format_duration(Some(seconds))
    }
}

pub fn scan_failure_text(error: &AppError) -> String {
    match error {
        AppError::TooLong {
            duration_secs,
            limit_secs,
        } => format!(
            "❌ TOO LONG: {} (MAX {})",
            format_duration(Some(*duration_secs)),
            format_limit(*limit_secs)
        ),
        other => format!("❌ SCAN FAILED: {}", other.label()),
    }
}

fn selection_failure_text(error: &AppError) -> String {
    match error {
        AppError::SessionExpired => String::from("SESSION EXPIRED. SEND LINK AGAIN."),
        AppError::QualityUnavailable(_) => String::from("QUALITY NOT AVAILABLE. SEND LINK AGAIN."),
        other => other.label().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("check https://youtu.be/abc now", Some("https://youtu.be/abc"))]
    #[case("HTTP://Example.com/x?y=1", Some("HTTP://Example.com/x?y=1"))]
    #[case("no link here", None)]
    #[case("ftp://example.com/file", None)]
    #[case("https://", None)]
    fn finds_urls(#[case] text: &str, #[case] expected: Option<&str>) {
        assert_eq!(find_url(text).as_deref(), expected);
    }

    #[test]
    fn too_long_message_uses_clock_format() {
        let text = scan_failure_text(&AppError::TooLong {
            duration_secs: 14_400,
            limit_secs: 10_800,
        });
        assert_eq!(text, "❌ TOO LONG: 4:00:00 (MAX 3h)");
    }

    #[test]
    fn scan_failures_hide_details() {
        let text = scan_failure_text(&AppError::Resolution("ERROR: Private video id=xyz".into()));
        assert_eq!(text, "❌ SCAN FAILED: RESOLUTION FAILED");
    }

    #[test]
    fn bucket_labels() {
        assert_eq!(bucket_label(480, Some(10 * 1024 * 1024)), "🎥 480p [10.0MB]");
        assert_eq!(bucket_label(1080, None), "🎥 1080p [unknown]");
    }

    #[test]
    fn limits() {
        assert_eq!(format_limit(10_800), "3h");
        assert_eq!(format_limit(5_400), "1:30:00");
    }
}
