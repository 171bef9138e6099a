use crate::ladder::QualityLadder;
use chrono::{DateTime, Utc};
use std::fmt;

/// Fixed quality ladder, in increasing order.
pub const LADDER: [u32; 8] = [144, 240, 360, 480, 720, 1080, 1440, 2160];
pub const MIN_BUCKET: u32 = LADDER[0];
pub const MAX_BUCKET: u32 = LADDER[LADDER.len() - 1];

pub type ChatId = i64;
pub type MessageId = i32;

/// What the extractor reports about a link before anything is downloaded.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub title: String,
    pub uploader: String,
    /// Seconds; `None` when the source does not report it (e.g. live streams).
    pub duration: Option<u64>,
    pub candidates: Vec<RenditionCandidate>,
}

/// One raw rendition as listed by the extractor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenditionCandidate {
    /// Opaque token understood only by the extractor that produced it.
    pub format_id: String,
    pub height: Option<u32>,
    /// File extension, e.g. `mp4`, `webm`, `m4a`.
    pub container: String,
    pub has_video: bool,
    pub has_audio: bool,
    pub filesize: Option<u64>,
    /// Total bitrate in kbps.
    pub bitrate_kbps: Option<f64>,
}

impl RenditionCandidate {
    pub fn is_muxed(&self) -> bool {
        self.has_video && self.has_audio
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }
}

/// How audio-only downloads pick their stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFormat {
    /// A specific audio-only rendition in a preferred container.
    Token(String),
    /// Let the extractor choose with its own `bestaudio` selection.
    BestAvailable,
}

/// Correlation key: the inbound message that carried the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl SessionKey {
    pub fn new(chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_id, self.message_id)
    }
}

/// Result of one successful scan. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct Session {
    pub url: String,
    pub title: String,
    pub duration: Option<u64>,
    pub ladder: QualityLadder,
    pub audio_format: AudioFormat,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMode {
    Video { format_id: String },
    Audio,
}

impl JobMode {
    pub fn name(&self) -> &'static str {
        match self {
            JobMode::Video { .. } => "video",
            JobMode::Audio => "audio",
        }
    }
}

/// One accepted selection, consumed exactly once by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub chat_id: ChatId,
    pub origin_message_id: MessageId,
    pub mode: JobMode,
}

impl Job {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.chat_id, self.origin_message_id)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key(), self.mode.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_strictly_increasing() {
        assert!(LADDER.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(MIN_BUCKET, 144);
        assert_eq!(MAX_BUCKET, 2160);
    }

    #[test]
    fn candidate_flags() {
        let muxed = RenditionCandidate {
            has_video: true,
            has_audio: true,
            ..Default::default()
        };
        assert!(muxed.is_muxed());
        assert!(!muxed.is_video_only());

        let audio = RenditionCandidate {
            has_audio: true,
            ..Default::default()
        };
        assert!(audio.is_audio_only());
    }
}
