use crate::error::{AppError, Result};
use crate::model::{LADDER, MAX_BUCKET, MIN_BUCKET};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use url::Url;

/// Configuration for the bot.
///
/// Every field has a default, so an empty TOML file (or no file at all) is a
/// valid configuration apart from the bot token.
///
/// # Examples
///
/// ```
/// use grabbot::Config;
///
/// let config = Config::default();
/// assert_eq!(config.concurrent_downloads, 2);
/// assert_eq!(config.min_quality, 480);
/// ```
#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    pub telegram: TelegramConfig,
    /// Admission limit: jobs executing at the same time.
    pub concurrent_downloads: usize,
    /// Shared by every job; artifacts are deleted after sending.
    pub output_dir: PathBuf,
    /// Where the yt-dlp and ffmpeg binaries live.
    pub libraries_dir: PathBuf,
    pub max_duration_secs: u64,
    pub max_file_mb: u64,
    /// Initial minimum bucket offered in menus, see [`Settings::set_min_quality`].
    pub min_quality: u32,
    pub progress_interval_ms: u64,
    pub title_max_chars: usize,
    pub session_ttl_secs: u64,
    pub session_capacity: usize,
    pub send_attempts: u32,
    pub extractor_timeout_secs: u64,
    pub audio: AudioConfig,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: Secret<String>,
    /// Custom Bot API server, needed for uploads above the public 50MB cap.
    pub api_url: Option<Url>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Re-encode audio downloads; when off the native container is sent as-is.
    pub transcode: bool,
    pub codec: String,
    pub bitrate_kbps: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            concurrent_downloads: 2,
            output_dir: PathBuf::from("downloads"),
            libraries_dir: PathBuf::from("libs"),
            max_duration_secs: 3 * 60 * 60,
            max_file_mb: 1800,
            min_quality: 480,
            progress_interval_ms: 2000,
            title_max_chars: 80,
            session_ttl_secs: 6 * 60 * 60,
            session_capacity: 1024,
            send_attempts: 2,
            extractor_timeout_secs: 60,
            audio: AudioConfig::default(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            api_url: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            transcode: true,
            codec: String::from("mp3"),
            bitrate_kbps: 192,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("token", &"[REDACTED]")
            .field("api_url", &self.telegram.api_url)
            .field("concurrent_downloads", &self.concurrent_downloads)
            .field("output_dir", &self.output_dir)
            .field("min_quality", &self.min_quality)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Parses a TOML document and validates it.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration the way the binary does.
    ///
    /// The file named by `GRABBOT_CONFIG` (or `grabbot.toml` when present) is
    /// read first, then `BOT_TOKEN` / `TELOXIDE_TOKEN` override the token.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("GRABBOT_CONFIG")
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("grabbot.toml")).filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Ok(token) = std::env::var("BOT_TOKEN").or_else(|_| std::env::var("TELOXIDE_TOKEN")) {
            config.telegram.token = Secret::new(token);
        }
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrent_downloads == 0 {
            return Err(AppError::Config("concurrent_downloads must be at least 1".into()));
        }
        if !(MIN_BUCKET..=MAX_BUCKET).contains(&self.min_quality) {
            return Err(AppError::Config(format!(
                "min_quality must be within {MIN_BUCKET}..={MAX_BUCKET}"
            )));
        }
        if self.send_attempts == 0 {
            return Err(AppError::Config("send_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn has_token(&self) -> bool {
        !self.telegram.token.expose_secret().trim().is_empty()
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb * 1024 * 1024
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_secs(self.extractor_timeout_secs)
    }
}

/// Process-wide settings shared by the resolver, queue and handlers.
///
/// Wraps the immutable [`Config`] together with the one value that can change
/// at runtime, the minimum displayed bucket.
#[derive(Debug)]
pub struct Settings {
    config: Config,
    min_quality: AtomicU32,
}

impl Settings {
    pub fn new(config: Config) -> Self {
        let min_quality = AtomicU32::new(config.min_quality);
        Self {
            config,
            min_quality,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn min_quality(&self) -> u32 {
        self.min_quality.load(Ordering::Relaxed)
    }

    /// Changes the minimum bucket shown for every later scan.
    ///
    /// Any height within the ladder range is accepted; it does not have to be
    /// one of the ladder values.
    pub fn set_min_quality(&self, value: u32) -> Result<()> {
        if !(MIN_BUCKET..=MAX_BUCKET).contains(&value) {
            return Err(AppError::InvalidSetting(format!(
                "min quality must be within {MIN_BUCKET}..={MAX_BUCKET}, pick one of {LADDER:?}"
            )));
        }
        self.min_quality.store(value, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_limits() {
        let config = Config::default();
        assert_eq!(config.max_duration_secs, 10_800);
        assert_eq!(config.max_file_bytes(), 1800 * 1024 * 1024);
        assert_eq!(config.progress_interval(), Duration::from_secs(2));
        assert!(config.audio.transcode);
        assert!(!config.has_token());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            concurrent_downloads = 4
            min_quality = 720

            [telegram]
            token = "123:ABC"

            [audio]
            transcode = false
            "#,
        )
        .unwrap();
        assert_eq!(config.concurrent_downloads, 4);
        assert_eq!(config.min_quality, 720);
        assert_eq!(config.telegram.token.expose_secret(), "123:ABC");
        assert!(!config.audio.transcode);
        assert_eq!(config.audio.codec, "mp3");
        assert_eq!(config.output_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn rejects_zero_admission_slots() {
        let err = Config::from_toml("concurrent_downloads = 0").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn debug_redacts_token() {
        let config = Config::from_toml("[telegram]\ntoken = \"secret-token\"").unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn set_min_quality_validates_range() {
        let settings = Settings::new(Config::default());
        assert_eq!(settings.min_quality(), 480);

        settings.set_min_quality(360).unwrap();
        assert_eq!(settings.min_quality(), 360);

        assert!(settings.set_min_quality(100).is_err());
        assert!(settings.set_min_quality(4320).is_err());
        assert_eq!(settings.min_quality(), 360);
    }
}
