use std::io;
use thiserror::Error;
use url;

/// Error types for the bot.
///
/// The domain variants follow the lifecycle of a request: scanning a link
/// (`Resolution`, `NoRenditions`, `TooLong`), pressing a button
/// (`SessionExpired`, `MalformedCallback`, `QualityUnavailable`) and running
/// a job (`Download`, `Transcode`, `SizeExceeded`, `Send`). The rest wrap
/// infrastructure failures.
///
/// Users only ever see [`AppError::label`]; the `Display` text is for logs.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("resolution failed: {0}")]
    Resolution(String),

    #[error("no usable renditions after all tiers")]
    NoRenditions,

    #[error("duration {duration_secs}s exceeds limit of {limit_secs}s")]
    TooLong { duration_secs: u64, limit_secs: u64 },

    #[error("session expired or unknown")]
    SessionExpired,

    #[error("malformed callback token: {0}")]
    MalformedCallback(String),

    #[error("quality {0}p not offered by this session")]
    QualityUnavailable(u32),

    #[error("download error: {0}")]
    Download(String),

    #[error("transcode error: {0}")]
    Transcode(String),

    #[error("artifact is {size_bytes} bytes, ceiling is {limit_bytes} bytes")]
    SizeExceeded { size_bytes: u64, limit_bytes: u64 },

    #[error("send error: {0}")]
    Send(String),

    #[error("{0} job(s) still running")]
    Busy(usize),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Youtube error: {0}")]
    Youtube(#[from] yt_dlp::error::Error),

    #[error("Telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("{0}")]
    Custom(String),
}

impl AppError {
    /// Short category shown to the user in place of the full error.
    pub fn label(&self) -> &'static str {
        match self {
            AppError::Resolution(_) => "RESOLUTION FAILED",
            AppError::NoRenditions => "NO RENDITIONS",
            AppError::TooLong { .. } => "TOO LONG",
            AppError::SessionExpired => "SESSION EXPIRED",
            AppError::MalformedCallback(_) => "INVALID BUTTON",
            AppError::QualityUnavailable(_) => "QUALITY NOT AVAILABLE",
            AppError::Download(_) => "DOWNLOAD FAILED",
            AppError::Transcode(_) => "CONVERSION FAILED",
            AppError::SizeExceeded { .. } => "FILE TOO BIG",
            AppError::Send(_) | AppError::Telegram(_) => "SEND FAILED",
            AppError::Busy(_) => "BUSY",
            AppError::InvalidSetting(_) => "INVALID SETTING",
            _ => "INTERNAL ERROR",
        }
    }
}

impl From<&str> for AppError {
    fn from(error: &str) -> Self {
        AppError::Custom(error.to_string())
    }
}

impl From<String> for AppError {
    fn from(error: String) -> Self {
        AppError::Custom(error)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_hide_diagnostic_detail() {
        let err = AppError::Download("HTTP Error 403: Forbidden at https://x".into());
        assert_eq!(err.label(), "DOWNLOAD FAILED");
        assert!(!err.label().contains("403"));
    }

    #[test]
    fn infrastructure_errors_collapse_to_internal() {
        let err: AppError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert_eq!(err.label(), "INTERNAL ERROR");
        let err: AppError = "boom".into();
        assert_eq!(err.label(), "INTERNAL ERROR");
    }
}
