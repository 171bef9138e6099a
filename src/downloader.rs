use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::extractor::{audio_expression, video_expression, Extractor, FetchRequest, Transcoder};
use crate::messenger::{MediaKind, Messenger};
use crate::model::{Job, JobMode, MessageId, Session};
use crate::progress::ProgressTracker;
use crate::queue::JobRunner;
use crate::session::SessionStore;
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

const MERGE_CONTAINER: &str = "mp4";

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Downloading,
    Transcoding,
    Sending,
    Done,
    Failed,
}

/// Mutable state of one job while it runs.
///
/// On failure `stage` still names the stage that failed, so a retry can
/// resume there without redoing earlier work.
struct JobRun {
    job: Job,
    status: MessageId,
    stage: Stage,
    session: Option<Arc<Session>>,
    /// Uniqueness token embedded in every file this job writes.
    token: String,
    artifact: Option<PathBuf>,
    send_attempts: u32,
}

/// Executes jobs taken off the queue: fetch, optional transcode, size check,
/// send, cleanup.
///
/// # Fields
/// * `extractor` - Fetches the selected rendition
/// * `transcoder` - Re-encodes audio jobs, `None` ships the native container
/// * `messenger` - Status updates and delivery
/// * `sessions` - Scan results looked up by the job's key
/// * `active_downloads` - Counter for jobs currently executing
pub struct Downloader {
    extractor: Arc<dyn Extractor>,
    transcoder: Option<Arc<dyn Transcoder>>,
    messenger: Arc<dyn Messenger>,
    sessions: Arc<SessionStore>,
    settings: Arc<Settings>,
    active_downloads: Arc<AtomicUsize>,
    sequence: AtomicU64,
    cleanup_failures: AtomicUsize,
    /// Held shared by every running job and exclusively by `clear_output_dir`.
    output_gate: RwLock<()>,
}

impl Downloader {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        transcoder: Option<Arc<dyn Transcoder>>,
        messenger: Arc<dyn Messenger>,
        sessions: Arc<SessionStore>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            extractor,
            transcoder,
            messenger,
            sessions,
            settings,
            active_downloads: Arc::new(AtomicUsize::new(0)),
            sequence: AtomicU64::new(0),
            cleanup_failures: AtomicUsize::new(0),
            output_gate: RwLock::new(()),
        }
    }

    pub fn active_downloads(&self) -> usize {
        self.active_downloads.load(Ordering::SeqCst)
    }

    /// Files this downloader failed to delete.
    pub fn cleanup_failures(&self) -> usize {
        self.cleanup_failures.load(Ordering::SeqCst)
    }

    /// Empties the shared output directory.
    ///
    /// # Errors
    /// Returns `AppError::Busy` with the running job count while any job
    /// holds the output gate, or `AppError::Io` if the directory cannot be
    /// recreated. Jobs dispatched meanwhile wait until the clear is done.
    pub async fn clear_output_dir(&self) -> Result<()> {
        let Ok(_exclusive) = self.output_gate.try_write() else {
            return Err(AppError::Busy(self.active_downloads().max(1)));
        };
        let dir = &self.settings.config().output_dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(dir).await?;
        info!(dir = %dir.display(), "output directory cleared");
        Ok(())
    }

    /// Runs one job to a terminal stage. Artifacts are removed on every path.
    ///
    /// # Arguments
    /// * `job` - The accepted selection, looked up again in the session store
    ///
    /// # Returns
    /// * `Result<()>` - The job's own outcome; cleanup faults are only counted
    ///
    /// # Details
    /// Walks `Init`, `Downloading`, `Transcoding` (audio with a transcoder)
    /// and `Sending`, editing the status message at each step. A failed send
    /// is retried in place up to `send_attempts` times.
    #[instrument(skip(self), fields(job = %job))]
    pub async fn execute(&self, job: Job) -> Result<()> {
        let _active = DownloadGuard::new(&self.active_downloads);
        let _shared = self.output_gate.read().await;
        let chat_id = job.chat_id;
        let status = self.messenger.send(chat_id, "⛓️ INIT...", None).await?;

        let mut run = JobRun {
            job,
            status,
            stage: Stage::Init,
            session: None,
            token: self.unique_token(),
            artifact: None,
            send_attempts: 0,
        };

        let outcome = self.drive(&mut run).await;
        self.cleanup(&mut run).await;

        match outcome {
            Ok(()) => {
                run.stage = Stage::Done;
                info!(job = %run.job, "job done");
                self.set_status(&run, "✅ DONE.").await;
                Ok(())
            }
            Err(e) => {
                error!(job = %run.job, stage = ?run.stage, error = %e, "job failed");
                let text = failure_text(&e);
                run.stage = Stage::Failed;
                self.set_status(&run, &text).await;
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut JobRun) -> Result<()> {
        let max_send_attempts = self.settings.config().send_attempts;
        loop {
            let step = match run.stage {
                Stage::Init => self.init(run),
                Stage::Downloading => self.download(run).await,
                Stage::Transcoding => self.transcode(run).await,
                Stage::Sending => self.send(run).await,
                Stage::Done | Stage::Failed => return Ok(()),
            };
            match step {
                Ok(next) => {
                    debug!(from = ?run.stage, to = ?next, "stage transition");
                    run.stage = next;
                }
                Err(AppError::Send(reason))
                    if run.stage == Stage::Sending && run.send_attempts < max_send_attempts =>
                {
                    warn!(attempt = run.send_attempts, reason = %reason, "send failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn init(&self, run: &mut JobRun) -> Result<Stage> {
        let session = self
            .sessions
            .get(&run.job.key())
            .ok_or(AppError::SessionExpired)?;
        run.session = Some(session);
        Ok(Stage::Downloading)
    }

    async fn download(&self, run: &mut JobRun) -> Result<Stage> {
        let config = self.settings.config();
        let session = run.session.clone().ok_or(AppError::SessionExpired)?;

        let output_template = config.output_dir.join(format!(
            "%(title).{}s_{}.%(ext)s",
            config.title_max_chars, run.token
        ));
        let request = match &run.job.mode {
            JobMode::Video { format_id } => FetchRequest {
                url: session.url.clone(),
                format: video_expression(format_id),
                output_template,
                merge_container: Some(MERGE_CONTAINER.to_string()),
            },
            JobMode::Audio => FetchRequest {
                url: session.url.clone(),
                format: audio_expression(&session.audio_format),
                output_template,
                merge_container: None,
            },
        };

        let mut tracker = ProgressTracker::new(
            Arc::clone(&self.messenger),
            run.job.chat_id,
            run.status,
            config.progress_interval(),
        );
        let fetched = self.extractor.fetch(&request, &mut tracker).await;
        if tracker.failures() > 0 {
            warn!(failures = tracker.failures(), "some progress renders failed");
        }
        let path = fetched.map_err(|e| match e {
            AppError::Download(_) => e,
            other => AppError::Download(other.to_string()),
        })?;
        info!(path = %path.display(), renders = tracker.renders(), "download finished");
        run.artifact = Some(path);

        match (&run.job.mode, &self.transcoder) {
            (JobMode::Audio, Some(_)) => Ok(Stage::Transcoding),
            _ => Ok(Stage::Sending),
        }
    }

    async fn transcode(&self, run: &mut JobRun) -> Result<Stage> {
        let Some(transcoder) = &self.transcoder else {
            return Ok(Stage::Sending);
        };
        let input = run
            .artifact
            .clone()
            .ok_or_else(|| AppError::Transcode("nothing to convert".into()))?;
        self.set_status(run, "🎛 CONVERTING...").await;

        let output = transcoder
            .transcode_audio(&input, &self.settings.config().audio)
            .await?;
        run.artifact = Some(output);
        Ok(Stage::Sending)
    }

    async fn send(&self, run: &mut JobRun) -> Result<Stage> {
        let path = run
            .artifact
            .clone()
            .ok_or_else(|| AppError::Send("no artifact to send".into()))?;

        let size_bytes = tokio::fs::metadata(&path).await?.len();
        let limit_bytes = self.settings.config().max_file_bytes();
        if size_bytes > limit_bytes {
            return Err(AppError::SizeExceeded {
                size_bytes,
                limit_bytes,
            });
        }

        run.send_attempts += 1;
        self.set_status(run, "📤 SENDING...").await;
        let kind = match run.job.mode {
            JobMode::Video { .. } => MediaKind::Video,
            JobMode::Audio => MediaKind::Audio,
        };
        self.messenger
            .send_media(run.job.chat_id, &path, kind)
            .await?;
        Ok(Stage::Done)
    }

    /// Removes the artifact and anything else carrying this job's token,
    /// such as partial downloads or unmerged streams.
    async fn cleanup(&self, run: &mut JobRun) {
        if let Some(path) = run.artifact.take() {
            self.remove(&path).await;
        }

        let dir = &self.settings.config().output_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "could not scan output directory");
                return;
            }
        };
        let marker = format!("_{}.", run.token);
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if entry.file_name().to_string_lossy().contains(&marker) {
                        self.remove(&entry.path()).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "output directory scan interrupted");
                    break;
                }
            }
        }
    }

    async fn remove(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed artifact"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                let failures = self.cleanup_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(path = %path.display(), error = %e, failures, "could not delete artifact");
            }
        }
    }

    /// Best-effort status edit.
    async fn set_status(&self, run: &JobRun, text: &str) {
        if let Err(e) = self.messenger.edit(run.job.chat_id, run.status, text).await {
            warn!(job = %run.job, error = %e, "status update failed");
        }
    }

    fn unique_token(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("{}{seq:04}", Utc::now().format("%Y%m%d%H%M%S%3f"))
    }
}

#[async_trait]
impl JobRunner for Downloader {
    async fn run(&self, job: Job) -> Result<()> {
        self.execute(job).await
    }
}

/// Terminal status text; only the error category reaches the user.
pub fn failure_text(error: &AppError) -> String {
    match error {
        AppError::SizeExceeded {
            size_bytes,
            limit_bytes,
        } => format!(
            "❌ FILE TOO BIG: {:.1}MB (MAX {}MB)\nPick a lower quality or MP3.",
            *size_bytes as f64 / (1024.0 * 1024.0),
            limit_bytes / (1024 * 1024)
        ),
        AppError::SessionExpired => String::from("❌ SESSION EXPIRED. SEND LINK AGAIN."),
        other => format!("❌ {}", other.label()),
    }
}

/// RAII guard for tracking active downloads
///
/// Automatically increments counter on creation and
/// decrements it when dropped
struct DownloadGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> DownloadGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl<'a> Drop for DownloadGuard<'a> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
