use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::extractor::Extractor;
use crate::model::{AudioFormat, MediaInfo, RenditionCandidate, Session, LADDER, MAX_BUCKET};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Container whose renditions are tried first.
pub const PRIMARY_CONTAINER: &str = "mp4";
/// Containers for the last-resort video-only tier.
pub const FALLBACK_CONTAINERS: [&str; 2] = ["webm", "mkv"];
/// Containers an audio-only rendition must use to be picked directly.
pub const PREFERRED_AUDIO_CONTAINERS: [&str; 2] = ["m4a", "mp3"];

/// One step of the ladder cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Video and audio already in one primary-container file.
    Muxed,
    /// Primary-container video, paired with the best audio at fetch time.
    VideoOnly,
    /// Video-only in a fallback container.
    Fallback,
}

impl Tier {
    pub const CASCADE: [Tier; 3] = [Tier::Muxed, Tier::VideoOnly, Tier::Fallback];

    fn admits(self, candidate: &RenditionCandidate) -> bool {
        let container = candidate.container.as_str();
        match self {
            Tier::Muxed => container == PRIMARY_CONTAINER && candidate.is_muxed(),
            Tier::VideoOnly => container == PRIMARY_CONTAINER && candidate.is_video_only(),
            Tier::Fallback => {
                FALLBACK_CONTAINERS.contains(&container) && candidate.is_video_only()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rung {
    pub format_id: String,
    /// Largest estimate seen for this bucket, `None` when nothing was known.
    pub size: Option<u64>,
}

/// Bucket → rendition mapping produced by one resolution.
///
/// Buckets are kept in a `BTreeMap`, so iteration is strictly increasing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityLadder {
    rungs: BTreeMap<u32, Rung>,
    tier: Option<Tier>,
}

impl QualityLadder {
    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    pub fn buckets(&self) -> Vec<u32> {
        self.rungs.keys().copied().collect()
    }

    /// Buckets at or above `min_quality`, the ones offered to the user.
    pub fn buckets_from(&self, min_quality: u32) -> Vec<u32> {
        self.rungs.range(min_quality..).map(|(q, _)| *q).collect()
    }

    pub fn format_for(&self, bucket: u32) -> Option<&str> {
        self.rungs.get(&bucket).map(|r| r.format_id.as_str())
    }

    pub fn size_for(&self, bucket: u32) -> Option<u64> {
        self.rungs.get(&bucket).and_then(|r| r.size)
    }

    /// Tier that populated the ladder.
    pub fn tier(&self) -> Option<Tier> {
        self.tier
    }

    fn consider(&mut self, candidate: &RenditionCandidate, duration: Option<u64>) {
        let Some(bucket) = bucket_for(candidate.height) else {
            return;
        };
        if candidate.format_id.is_empty() {
            return;
        }

        let rung = self.rungs.entry(bucket).or_insert_with(|| Rung {
            format_id: candidate.format_id.clone(),
            size: None,
        });
        if let Some(estimate) = estimate_size(candidate, duration) {
            rung.size = Some(rung.size.map_or(estimate, |s| s.max(estimate)));
        }
    }
}

/// Smallest ladder value at or above `height`; heights beyond the ladder land
/// in the top bucket.
pub fn bucket_for(height: Option<u32>) -> Option<u32> {
    let height = height.filter(|h| *h > 0)?;
    Some(
        LADDER
            .iter()
            .copied()
            .find(|q| height <= *q)
            .unwrap_or(MAX_BUCKET),
    )
}

/// Reported size when present, else total bitrate times duration.
pub fn estimate_size(candidate: &RenditionCandidate, duration: Option<u64>) -> Option<u64> {
    if let Some(size) = candidate.filesize.filter(|s| *s > 0) {
        return Some(size);
    }
    let kbps = candidate.bitrate_kbps.filter(|b| b.is_finite() && *b > 0.0)?;
    let secs = duration.filter(|d| *d > 0)?;
    Some((kbps * 1000.0 * secs as f64 / 8.0) as u64)
}

/// Builds the ladder with the three-tier cascade.
///
/// Each tier scans the candidates in the order given; the first tier that
/// populates any bucket ends the cascade.
pub fn build_ladder(candidates: &[RenditionCandidate], duration: Option<u64>) -> QualityLadder {
    for tier in Tier::CASCADE {
        let mut ladder = QualityLadder::default();
        for candidate in candidates.iter().filter(|c| tier.admits(c)) {
            ladder.consider(candidate, duration);
        }
        if !ladder.is_empty() {
            ladder.tier = Some(tier);
            return ladder;
        }
    }
    QualityLadder::default()
}

pub fn select_audio_only(candidates: &[RenditionCandidate]) -> AudioFormat {
    candidates
        .iter()
        .find(|c| {
            c.is_audio_only()
                && !c.format_id.is_empty()
                && PREFERRED_AUDIO_CONTAINERS.contains(&c.container.as_str())
        })
        .map(|c| AudioFormat::Token(c.format_id.clone()))
        .unwrap_or(AudioFormat::BestAvailable)
}

/// A successful scan: the session to store and what to show the user.
#[derive(Debug, Clone)]
pub struct Scan {
    pub session: Session,
    pub uploader: String,
    /// Buckets at or above the minimum quality in effect at scan time.
    pub offered: Vec<u32>,
    pub min_quality: u32,
}

/// Turns a link into a [`Scan`].
pub struct Resolver {
    extractor: Arc<dyn Extractor>,
    settings: Arc<Settings>,
}

impl Resolver {
    pub fn new(extractor: Arc<dyn Extractor>, settings: Arc<Settings>) -> Self {
        Self {
            extractor,
            settings,
        }
    }

    /// Asks the extractor for metadata; an empty rendition list is a failure.
    ///
    /// # Errors
    /// * `AppError::Resolution` - The extractor failed or found no renditions
    pub async fn resolve(&self, url: &str) -> Result<MediaInfo> {
        let info = self.extractor.resolve(url).await.map_err(|e| match e {
            AppError::Resolution(_) => e,
            other => AppError::Resolution(other.to_string()),
        })?;
        if info.candidates.is_empty() {
            return Err(AppError::Resolution("extractor returned no renditions".into()));
        }
        Ok(info)
    }

    /// Resolves, applies the duration gate and builds the ladder.
    ///
    /// The duration gate runs here and only here; jobs are never re-checked.
    ///
    /// # Arguments
    /// * `url` - Link taken from the user's message
    ///
    /// # Returns
    /// * `Result<Scan>` - The session to store and the buckets to offer
    ///
    /// # Errors
    /// * `AppError::Resolution` - See [`Resolver::resolve`]
    /// * `AppError::TooLong` - Duration above `max_duration_secs`
    /// * `AppError::NoRenditions` - No video bucket and nothing with audio
    #[instrument(skip(self))]
    pub async fn scan(&self, url: &str) -> Result<Scan> {
        let info = self.resolve(url).await?;
        let config = self.settings.config();

        if let Some(duration) = info.duration {
            if duration > config.max_duration_secs {
                return Err(AppError::TooLong {
                    duration_secs: duration,
                    limit_secs: config.max_duration_secs,
                });
            }
        }

        let ladder = build_ladder(&info.candidates, info.duration);
        if ladder.is_empty() && !info.candidates.iter().any(|c| c.has_audio) {
            return Err(AppError::NoRenditions);
        }
        let audio_format = select_audio_only(&info.candidates);
        let min_quality = self.settings.min_quality();
        let offered = ladder.buckets_from(min_quality);

        info!(
            title = %info.title,
            tier = ?ladder.tier(),
            buckets = ?ladder.buckets(),
            "resolved quality ladder"
        );

        Ok(Scan {
            session: Session {
                url: url.to_string(),
                title: info.title,
                duration: info.duration,
                ladder,
                audio_format,
                created_at: Utc::now(),
            },
            uploader: info.uploader,
            offered,
            min_quality,
        })
    }
}
