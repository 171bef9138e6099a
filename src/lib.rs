//! A Telegram bot that downloads media from public links.
//!
//! A link is resolved into a quality ladder and offered as inline buttons.
//! Selections are queued and executed under a fixed concurrency limit, with
//! throttled progress reporting and guaranteed cleanup of local files.
//!
//! # Architecture
//!
//! - `Config` / `Settings`: Configuration and runtime-adjustable values
//! - `Resolver`: Scans a link into a `Session` with its `QualityLadder`
//! - `SessionStore`: Scan results kept for later button presses
//! - `JobQueue`: FIFO admission of accepted selections
//! - `Downloader`: Fetch, transcode, size check, send, cleanup
//! - `ProgressTracker`: Throttled status edits while fetching
//! - `Handlers`: Inbound messages and button presses
//! - `telegram`: Bot API transport and polling loop
//!
//! # Example
//! ```no_run
//! use grabbot::{Config, Settings};
//!
//! let config = Config::load().unwrap();
//! let settings = Settings::new(config);
//! assert!(settings.min_quality() >= 144);
//! ```
pub mod callback;
pub mod config;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod handlers;
pub mod ladder;
pub mod messenger;
pub mod model;
pub mod progress;
pub mod queue;
pub mod session;
pub mod telegram;

// Re-export commonly used items
pub use config::{Config, Settings};
pub use downloader::Downloader;
pub use error::AppError;
pub use handlers::Handlers;
pub use ladder::{QualityLadder, Resolver};
pub use progress::ProgressTracker;
pub use queue::JobQueue;
pub use session::SessionStore;
