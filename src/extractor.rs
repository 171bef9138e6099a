use crate::config::{AudioConfig, Config};
use crate::error::{AppError, Result};
use crate::model::{AudioFormat, MediaInfo, RenditionCandidate};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use yt_dlp::fetcher::deps::Libraries;
use yt_dlp::Youtube;

pub use crate::progress::{ProgressSample, ProgressSink};

/// Progress lines are printed in this shape so they can be told apart from
/// everything else on stdout and stderr.
const PROGRESS_PREFIX: &str = "PROGRESS|";
const PROGRESS_TEMPLATE: &str = "download:PROGRESS|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s";
const STDERR_TAIL: usize = 5;

/// Everything the extractor needs to download one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// Format selection expression, see [`video_expression`].
    pub format: String,
    /// Output path template; `%(title)` and `%(ext)` are filled in by the extractor.
    pub output_template: PathBuf,
    /// Container to merge separate video and audio streams into.
    pub merge_container: Option<String>,
}

/// "Use `id` as-is if it carries audio, else pair it with the best audio,
/// else let the extractor decide."
pub fn video_expression(format_id: &str) -> String {
    format!("{format_id}/{format_id}+bestaudio/best")
}

pub fn audio_expression(audio: &AudioFormat) -> String {
    match audio {
        AudioFormat::Token(id) => format!("{id}/bestaudio/best"),
        AudioFormat::BestAvailable => String::from("bestaudio/best"),
    }
}

/// Network side: metadata lookup and the actual transfer.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<MediaInfo>;

    /// Downloads and returns the final artifact path.
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &mut (dyn ProgressSink + Send),
    ) -> Result<PathBuf>;
}

/// Audio re-encoding after download.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Re-encodes `input` and returns the new file; the input is removed.
    async fn transcode_audio(&self, input: &Path, audio: &AudioConfig) -> Result<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
    /// Single-format sources describe themselves at the top level.
    #[serde(flatten)]
    top: RawFormat,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    tbr: Option<f64>,
}

impl RawFormat {
    fn into_candidate(self) -> RenditionCandidate {
        RenditionCandidate {
            format_id: self.format_id.unwrap_or_default(),
            height: self.height.filter(|h| *h > 0.0).map(|h| h as u32),
            container: self.ext.unwrap_or_default(),
            has_video: self.vcodec.as_deref() != Some("none"),
            has_audio: self.acodec.as_deref() != Some("none"),
            filesize: self
                .filesize
                .or(self.filesize_approx)
                .filter(|s| *s > 0.0)
                .map(|s| s as u64),
            bitrate_kbps: self.tbr,
        }
    }
}

fn parse_info(json: &[u8]) -> Result<MediaInfo> {
    let raw: RawInfo = serde_json::from_slice(json)?;
    let formats = if raw.formats.is_empty() && raw.top.format_id.is_some() {
        vec![raw.top]
    } else {
        raw.formats
    };

    Ok(MediaInfo {
        title: raw.title.unwrap_or_else(|| String::from("NO_TITLE")),
        uploader: raw
            .uploader
            .or(raw.channel)
            .unwrap_or_else(|| String::from("UNKNOWN")),
        duration: raw.duration.filter(|d| *d > 0.0).map(|d| d.round() as u64),
        candidates: formats.into_iter().map(RawFormat::into_candidate).collect(),
    })
}

fn parse_number(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Parses one line printed through [`PROGRESS_TEMPLATE`]; `NA` fields are unknown.
fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let fields: Vec<&str> = rest.split('|').collect();
    let [downloaded, total, estimate, speed, eta] = fields.as_slice() else {
        return None;
    };
    Some(ProgressSample {
        downloaded: parse_number(downloaded).map_or(0, |d| d as u64),
        total: parse_number(total)
            .or_else(|| parse_number(estimate))
            .map(|t| t as u64),
        speed: parse_number(speed),
        eta: parse_number(eta).map(|e| e as u64),
    })
}

fn last_line(tail: &VecDeque<String>) -> String {
    tail.back()
        .cloned()
        .unwrap_or_else(|| String::from("no diagnostic output"))
}

/// Extractor backed by the yt-dlp executable.
pub struct YtDlp {
    executable: PathBuf,
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(executable: PathBuf, ffmpeg: PathBuf, timeout: Duration) -> Self {
        Self {
            executable,
            ffmpeg,
            timeout,
        }
    }

    /// Makes sure yt-dlp and ffmpeg are available in `libraries_dir`.
    ///
    /// Missing binaries are downloaded; an existing yt-dlp is updated, and a
    /// failed update only logs a warning.
    #[instrument(skip(config))]
    pub async fn provision(config: &Config) -> Result<Self> {
        let executable = config.libraries_dir.join("yt-dlp");
        let ffmpeg = config.libraries_dir.join("ffmpeg");

        if !executable.exists() || !ffmpeg.exists() {
            info!(dir = %config.libraries_dir.display(), "installing yt-dlp and ffmpeg");
            Youtube::with_new_binaries(config.libraries_dir.clone(), config.output_dir.clone())
                .await?;
        } else {
            let libraries = Libraries::new(executable.clone(), ffmpeg.clone());
            let youtube = Youtube::new(libraries, config.output_dir.clone())?;
            if let Err(e) = youtube.update_downloader().await {
                warn!(error = %e, "yt-dlp self-update failed, using installed version");
            }
        }

        Ok(Self::new(executable, ffmpeg, config.extractor_timeout()))
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }
}

#[async_trait]
impl Extractor for YtDlp {
    #[instrument(skip(self))]
    async fn resolve(&self, url: &str) -> Result<MediaInfo> {
        let mut command = Command::new(&self.executable);
        command
            .args(["--dump-single-json", "--no-playlist", "--no-warnings"])
            .arg(url)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                AppError::Resolution(format!("timed out after {}s", self.timeout.as_secs()))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output");
            return Err(AppError::Resolution(reason.to_string()));
        }

        parse_info(&output.stdout).map_err(|e| AppError::Resolution(e.to_string()))
    }

    #[instrument(skip(self, progress), fields(url = %request.url, format = %request.format))]
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &mut (dyn ProgressSink + Send),
    ) -> Result<PathBuf> {
        let mut command = Command::new(&self.executable);
        command
            .args(["--no-playlist", "--no-warnings", "--newline", "--progress"])
            .args(["--progress-template", PROGRESS_TEMPLATE])
            .args(["--print", "after_move:filepath", "--no-simulate"])
            .arg("--ffmpeg-location")
            .arg(&self.ffmpeg)
            .arg("-f")
            .arg(&request.format)
            .arg("-o")
            .arg(&request.output_template);
        if let Some(container) = &request.merge_container {
            command.arg("--merge-output-format").arg(container);
        }
        command
            .arg(&request.url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Download("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Download("stderr not captured".into()))?;

        // Progress may land on either stream depending on quiet mode.
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let (mut out_open, mut err_open) = (true, true);
        let mut final_path = None;
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);

        while out_open || err_open {
            tokio::select! {
                line = out_lines.next_line(), if out_open => match line? {
                    Some(line) => match parse_progress_line(&line) {
                        Some(sample) => progress.on_progress(sample).await,
                        None if !line.trim().is_empty() => {
                            final_path = Some(PathBuf::from(line.trim()));
                        }
                        None => {}
                    },
                    None => out_open = false,
                },
                line = err_lines.next_line(), if err_open => match line? {
                    Some(line) => match parse_progress_line(&line) {
                        Some(sample) => progress.on_progress(sample).await,
                        None => {
                            debug!(line = %line, "yt-dlp");
                            if tail.len() == STDERR_TAIL {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                    },
                    None => err_open = false,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(AppError::Download(last_line(&tail)));
        }
        final_path.ok_or_else(|| AppError::Download("extractor reported no output file".into()))
    }
}

/// Audio re-encoding with the ffmpeg executable.
pub struct Ffmpeg {
    executable: PathBuf,
}

impl Ffmpeg {
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl Transcoder for Ffmpeg {
    #[instrument(skip(self, audio))]
    async fn transcode_audio(&self, input: &Path, audio: &AudioConfig) -> Result<PathBuf> {
        let output = input.with_extension(&audio.codec);
        if output == input {
            return Ok(output);
        }

        let result = Command::new(&self.executable)
            .args(["-y", "-loglevel", "error", "-i"])
            .arg(input)
            .arg("-vn")
            .arg("-b:a")
            .arg(format!("{}k", audio.bitrate_kbps))
            .arg(&output)
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let reason = stderr.lines().last().unwrap_or("ffmpeg failed").to_string();
            if let Err(e) = tokio::fs::remove_file(&output).await {
                debug!(error = %e, "no partial transcode output to remove");
            }
            return Err(AppError::Transcode(reason));
        }

        if let Err(e) = tokio::fs::remove_file(input).await {
            warn!(path = %input.display(), error = %e, "could not delete pre-transcode file");
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expressions() {
        assert_eq!(video_expression("137"), "137/137+bestaudio/best");
        assert_eq!(audio_expression(&AudioFormat::Token("140".into())), "140/bestaudio/best");
        assert_eq!(audio_expression(&AudioFormat::BestAvailable), "bestaudio/best");
    }

    #[test]
    fn parses_progress_lines() {
        let sample = parse_progress_line("PROGRESS|1048576|4194304|NA|524288.5|6").unwrap();
        assert_eq!(sample.downloaded, 1_048_576);
        assert_eq!(sample.total, Some(4_194_304));
        assert_eq!(sample.speed, Some(524_288.5));
        assert_eq!(sample.eta, Some(6));
    }

    #[test]
    fn progress_falls_back_to_estimate() {
        let sample = parse_progress_line("PROGRESS|10|NA|2000.0|NA|NA").unwrap();
        assert_eq!(sample.total, Some(2000));
        assert_eq!(sample.speed, None);
        assert_eq!(sample.eta, None);

        let unknown = parse_progress_line("PROGRESS|10|NA|NA|NA|NA").unwrap();
        assert_eq!(unknown.total, None);
    }

    #[test]
    fn other_lines_are_not_progress() {
        assert!(parse_progress_line("[download] Destination: x.mp4").is_none());
        assert!(parse_progress_line("/tmp/downloads/x_1.mp4").is_none());
        assert!(parse_progress_line("PROGRESS|1|2").is_none());
    }

    #[test]
    fn parses_format_list() {
        let json = br#"{
            "title": "Clip",
            "channel": "Chan",
            "duration": 119.6,
            "formats": [
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "filesize": 1000},
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "height": 1080, "tbr": 4400.5},
                {"format_id": "18", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "height": 360, "filesize_approx": 5000}
            ]
        }"#;
        let info = parse_info(json).unwrap();
        assert_eq!(info.title, "Clip");
        assert_eq!(info.uploader, "Chan");
        assert_eq!(info.duration, Some(120));
        assert_eq!(info.candidates.len(), 3);

        let audio = &info.candidates[0];
        assert!(audio.is_audio_only());
        assert_eq!(audio.height, None);

        let video = &info.candidates[1];
        assert!(video.is_video_only());
        assert_eq!(video.height, Some(1080));
        assert_eq!(video.bitrate_kbps, Some(4400.5));

        let muxed = &info.candidates[2];
        assert!(muxed.is_muxed());
        assert_eq!(muxed.filesize, Some(5000));
    }

    #[test]
    fn single_format_source_uses_top_level() {
        let json = br#"{"title": "Direct", "format_id": "0", "ext": "mp4", "height": 720}"#;
        let info = parse_info(json).unwrap();
        assert_eq!(info.uploader, "UNKNOWN");
        assert_eq!(info.duration, None);
        assert_eq!(info.candidates.len(), 1);
        assert!(info.candidates[0].is_muxed());
        assert_eq!(info.candidates[0].height, Some(720));
    }
}
