#![allow(dead_code)]

use async_trait::async_trait;
use grabbot::config::{AudioConfig, Config};
use grabbot::error::{AppError, Result};
use grabbot::extractor::{Extractor, FetchRequest, ProgressSample, ProgressSink, Transcoder};
use grabbot::messenger::{Keyboard, MediaKind, Messenger};
use grabbot::model::{ChatId, MediaInfo, MessageId, RenditionCandidate};
use grabbot::{Handlers, Settings};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Sent {
        id: MessageId,
        text: String,
        keyboard: Option<Keyboard>,
    },
    Replied {
        to: MessageId,
        text: String,
    },
    Edited {
        id: MessageId,
        text: String,
    },
    Answered {
        callback_id: String,
        text: Option<String>,
    },
    Media {
        path: PathBuf,
        kind: MediaKind,
        size: u64,
    },
}

/// Records everything the bot would have sent.
#[derive(Default)]
pub struct RecordingMessenger {
    events: Mutex<Vec<Event>>,
    next_id: AtomicI32,
    /// Number of upcoming `send_media` calls that fail.
    pub media_failures: AtomicU32,
}

impl RecordingMessenger {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn menus(&self) -> Vec<(String, Keyboard)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sent {
                    text,
                    keyboard: Some(keyboard),
                    ..
                } => Some((text, keyboard)),
                _ => None,
            })
            .collect()
    }

    pub fn replies(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Replied { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Edited { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn answers(&self) -> Vec<Option<String>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Answered { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn media(&self) -> Vec<(PathBuf, MediaKind, u64)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Media { path, kind, size } => Some((path, kind, size)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn allocate(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 100
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, _: ChatId, text: &str, keyboard: Option<Keyboard>) -> Result<MessageId> {
        let id = self.allocate();
        self.record(Event::Sent {
            id,
            text: text.to_string(),
            keyboard,
        });
        Ok(id)
    }

    async fn reply(&self, _: ChatId, to: MessageId, text: &str) -> Result<MessageId> {
        self.record(Event::Replied {
            to,
            text: text.to_string(),
        });
        Ok(self.allocate())
    }

    async fn edit(&self, _: ChatId, id: MessageId, text: &str) -> Result<()> {
        self.record(Event::Edited {
            id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.record(Event::Answered {
            callback_id: callback_id.to_string(),
            text: text.map(str::to_string),
        });
        Ok(())
    }

    async fn send_media(&self, _: ChatId, path: &Path, kind: MediaKind) -> Result<()> {
        let pending = self.media_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.media_failures.store(pending - 1, Ordering::SeqCst);
            return Err(AppError::Send("Request Entity Too Large".into()));
        }
        let size = std::fs::metadata(path)?.len();
        self.record(Event::Media {
            path: path.to_path_buf(),
            kind,
            size,
        });
        Ok(())
    }
}

/// Serves fixed metadata and writes a sparse file of `artifact_size` bytes
/// on fetch.
pub struct FakeExtractor {
    pub info: MediaInfo,
    pub artifact_size: u64,
    pub fetches: Mutex<Vec<FetchRequest>>,
    /// Produce a non-empty directory where the artifact should be, which
    /// `remove_file` cannot delete.
    pub artifact_as_dir: AtomicBool,
    /// When set, each fetch signals `started` and waits for `resume`.
    pub pause: AtomicBool,
    pub started: Notify,
    pub resume: Notify,
}

impl FakeExtractor {
    pub fn new(info: MediaInfo, artifact_size: u64) -> Self {
        Self {
            info,
            artifact_size,
            fetches: Mutex::new(Vec::new()),
            artifact_as_dir: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            started: Notify::new(),
            resume: Notify::new(),
        }
    }

    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn resolve(&self, _url: &str) -> Result<MediaInfo> {
        Ok(self.info.clone())
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &mut (dyn ProgressSink + Send),
    ) -> Result<PathBuf> {
        self.fetches.lock().unwrap().push(request.clone());
        if self.pause.load(Ordering::SeqCst) {
            self.started.notify_one();
            self.resume.notified().await;
        }

        let template = request.output_template.to_string_lossy().into_owned();
        let name_start = template.rfind('/').map(|i| i + 1).unwrap_or(0);
        let suffix = template[name_start..]
            .find('_')
            .map(|i| &template[name_start + i..])
            .ok_or_else(|| AppError::Download("template without token".into()))?;
        let ext = request.merge_container.as_deref().unwrap_or("m4a");
        let path = PathBuf::from(format!(
            "{}clip{}",
            &template[..name_start],
            suffix.replace("%(ext)s", ext)
        ));

        // A leftover fragment that cleanup must also find.
        let fragment = PathBuf::from(format!("{}.part", path.display()));
        File::create(&fragment)?;

        for step in 1..=4u64 {
            progress
                .on_progress(ProgressSample {
                    downloaded: self.artifact_size / 4 * step,
                    total: Some(self.artifact_size),
                    speed: Some(2.0 * MIB as f64),
                    eta: Some(4 - step),
                })
                .await;
        }

        if self.artifact_as_dir.load(Ordering::SeqCst) {
            std::fs::create_dir(&path)?;
            std::fs::write(path.join("stream.bin"), b"x")?;
        } else {
            File::create(&path)?.set_len(self.artifact_size)?;
        }
        Ok(path)
    }
}

/// Renames the input to the codec extension, or fails after leaving a
/// partial output behind.
pub struct FakeTranscoder {
    pub fail: bool,
    pub calls: AtomicU32,
}

impl FakeTranscoder {
    pub fn working() -> Self {
        Self {
            fail: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode_audio(&self, input: &Path, audio: &AudioConfig) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = input.with_extension(&audio.codec);
        if self.fail {
            std::fs::write(&output, b"partial")?;
            return Err(AppError::Transcode("Invalid data found when processing input".into()));
        }
        std::fs::rename(input, &output)?;
        Ok(output)
    }
}

pub fn muxed(id: &str, height: u32, size: u64) -> RenditionCandidate {
    RenditionCandidate {
        format_id: id.into(),
        height: Some(height),
        container: "mp4".into(),
        has_video: true,
        has_audio: true,
        filesize: Some(size),
        bitrate_kbps: None,
    }
}

pub fn audio_only(id: &str, container: &str) -> RenditionCandidate {
    RenditionCandidate {
        format_id: id.into(),
        height: None,
        container: container.into(),
        has_video: false,
        has_audio: true,
        filesize: Some(3 * MIB),
        bitrate_kbps: None,
    }
}

pub fn media(duration: u64, candidates: Vec<RenditionCandidate>) -> MediaInfo {
    MediaInfo {
        title: "Night Drive".into(),
        uploader: "someone".into(),
        duration: Some(duration),
        candidates,
    }
}

/// A bot wired to fakes, with its own output directory.
pub struct Harness {
    pub handlers: Handlers,
    pub messenger: Arc<RecordingMessenger>,
    pub extractor: Arc<FakeExtractor>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(info: MediaInfo, artifact_size: u64) -> Self {
        Self::with_config(info, artifact_size, |_| {})
    }

    pub fn with_config(info: MediaInfo, artifact_size: u64, adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(info, artifact_size, None, adjust)
    }

    pub fn with_transcoder(info: MediaInfo, artifact_size: u64, transcoder: Arc<FakeTranscoder>) -> Self {
        Self::build(info, artifact_size, Some(transcoder as Arc<dyn Transcoder>), |_| {})
    }

    fn build(
        info: MediaInfo,
        artifact_size: u64,
        transcoder: Option<Arc<dyn Transcoder>>,
        adjust: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            output_dir: dir.path().to_path_buf(),
            progress_interval_ms: 0,
            ..Default::default()
        };
        adjust(&mut config);

        let messenger = Arc::new(RecordingMessenger::default());
        let extractor = Arc::new(FakeExtractor::new(info, artifact_size));
        let handlers = Handlers::new(
            messenger.clone(),
            extractor.clone(),
            transcoder,
            Arc::new(Settings::new(config)),
        );
        Self {
            handlers,
            messenger,
            extractor,
            dir,
        }
    }

    /// Files left in the output directory.
    pub fn leftovers(&self) -> Vec<String> {
        std::fs::read_dir(self.dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}

pub fn labels(keyboard: &Keyboard) -> Vec<String> {
    keyboard
        .iter()
        .flatten()
        .map(|b| b.label.clone())
        .collect()
}
