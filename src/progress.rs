use crate::messenger::Messenger;
use crate::model::{ChatId, MessageId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const BAR_SEGMENTS: usize = 10;
const MIB: f64 = 1024.0 * 1024.0;

/// One progress report from an in-flight transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSample {
    pub downloaded: u64,
    /// Total bytes, reported or estimated; `None` when unknown.
    pub total: Option<u64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Seconds remaining.
    pub eta: Option<u64>,
}

/// Receives samples while the extractor fetches.
#[async_trait]
pub trait ProgressSink {
    async fn on_progress(&mut self, sample: ProgressSample);
}

/// Throttled status line bound to one job's status message.
///
/// A render goes out only when the interval since the last successful render
/// has elapsed and the text differs from the last one shown. Edit failures
/// are counted and logged, never returned, and do not restart the interval.
pub struct ProgressTracker {
    messenger: Arc<dyn Messenger>,
    chat_id: ChatId,
    message_id: MessageId,
    interval: Duration,
    last_success: Option<Instant>,
    last_text: String,
    renders: usize,
    failures: usize,
}

impl ProgressTracker {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        chat_id: ChatId,
        message_id: MessageId,
        interval: Duration,
    ) -> Self {
        Self {
            messenger,
            chat_id,
            message_id,
            interval,
            last_success: None,
            last_text: String::new(),
            renders: 0,
            failures: 0,
        }
    }

    /// Successful renders so far.
    pub fn renders(&self) -> usize {
        self.renders
    }

    /// Renders the transport rejected.
    pub fn failures(&self) -> usize {
        self.failures
    }
}

#[async_trait]
impl ProgressSink for ProgressTracker {
    async fn on_progress(&mut self, sample: ProgressSample) {
        let Some(total) = sample.total.filter(|t| *t > 0) else {
            return;
        };
        let now = Instant::now();
        if let Some(last) = self.last_success {
            if now.duration_since(last) < self.interval {
                return;
            }
        }

        let percent = sample.downloaded as f64 / total as f64 * 100.0;
        let text = render_progress(percent, sample.speed, sample.eta);
        if text == self.last_text {
            return;
        }

        match self.messenger.edit(self.chat_id, self.message_id, &text).await {
            Ok(()) => {
                self.last_success = Some(now);
                debug!(chat_id = self.chat_id, percent, "progress rendered");
                self.last_text = text;
                self.renders += 1;
            }
            Err(e) => {
                self.failures += 1;
                warn!(
                    chat_id = self.chat_id,
                    message_id = self.message_id,
                    failures = self.failures,
                    error = %e,
                    "progress render failed"
                );
            }
        }
    }
}

pub fn progress_bar(percent: f64) -> String {
    let filled = ((percent / 10.0).round().max(0.0) as usize).min(BAR_SEGMENTS);
    "▰".repeat(filled) + &"▱".repeat(BAR_SEGMENTS - filled)
}

pub fn render_progress(percent: f64, speed: Option<f64>, eta: Option<u64>) -> String {
    let percent = percent.clamp(0.0, 100.0);
    let speed = speed
        .filter(|s| *s > 0.0)
        .map(|s| format!("{:.2}MB/s", s / MIB))
        .unwrap_or_else(|| "?".into());
    let eta = eta.map(|e| format!("{e}s")).unwrap_or_else(|| "?".into());
    format!(
        "⛓️ DOWNLOADING...\n{}  {percent:.1}%\n⚡ SPD: {speed}\n⏱️ ETA: {eta}",
        progress_bar(percent)
    )
}

/// `H:MM:SS` from one hour up, `M:SS` below, `??` when unknown.
pub fn format_duration(seconds: Option<u64>) -> String {
    let Some(seconds) = seconds.filter(|s| *s > 0) else {
        return "??".into();
    };
    let (h, m, s) = (seconds / 3600, seconds / 60 % 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

pub fn format_size(bytes: Option<u64>) -> String {
    match bytes.filter(|b| *b > 0) {
        Some(b) => format!("{:.1}MB", b as f64 / MIB),
        None => "unknown".into(),
    }
}
