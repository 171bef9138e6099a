use grabbot::error::Result;
use grabbot::extractor::{Extractor, Ffmpeg, Transcoder, YtDlp};
use grabbot::telegram::{self, TelegramMessenger};
use grabbot::{AppError, Config, Handlers, Settings};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entry point for the bot.
///
/// # Steps
/// 1. Initializes logging with file, line numbers and thread IDs
/// 2. Loads configuration from `grabbot.toml` and the environment
/// 3. Provisions the yt-dlp and ffmpeg binaries
/// 4. Polls Telegram until interrupted, then drains running jobs
///
/// # Errors
/// Returns error if:
/// - Configuration is invalid or no bot token is set
/// - Binary provisioning fails
/// - The bot cannot connect
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .init();

    info!("Starting grabbot...");

    let config = Config::load()?;
    if !config.has_token() {
        error!("no bot token: set BOT_TOKEN or telegram.token in grabbot.toml");
        return Err(AppError::Config("missing bot token".into()));
    }
    tokio::fs::create_dir_all(&config.output_dir).await?;
    tokio::fs::create_dir_all(&config.libraries_dir).await?;

    let ytdlp = YtDlp::provision(&config).await?;
    let transcoder: Option<Arc<dyn Transcoder>> = if config.audio.transcode {
        Some(Arc::new(Ffmpeg::new(ytdlp.ffmpeg().to_path_buf())))
    } else {
        None
    };
    let extractor: Arc<dyn Extractor> = Arc::new(ytdlp);

    let bot = telegram::build_bot(&config.telegram)?;
    let messenger = Arc::new(TelegramMessenger::new(bot.clone()));
    let settings = Arc::new(Settings::new(config));
    let handlers = Arc::new(Handlers::new(messenger, extractor, transcoder, settings));

    let cancel = CancellationToken::new();
    let polling = tokio::spawn(telegram::run_polling(
        bot,
        Arc::clone(&handlers),
        cancel.clone(),
    ));
    tokio::pin!(polling);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested, waiting for running jobs");
            cancel.cancel();
            match (&mut polling).await {
                Ok(Err(e)) => warn!(error = %e, "polling ended with error"),
                Err(e) => error!(error = %e, "polling task panicked"),
                Ok(Ok(())) => {}
            }
        }
        joined = &mut polling => {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "polling stopped"),
                Err(e) => error!(error = %e, "polling task panicked"),
            }
        }
    }

    handlers.shutdown().await;
    info!(
        cleanup_failures = handlers.downloader().cleanup_failures(),
        "grabbot stopped"
    );
    Ok(())
}
