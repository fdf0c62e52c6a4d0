// libs/teleconsultation-cell/src/services/quality.rs
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::models::{QualitySample, QualityTier};

const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_secs(5);

/// Periodic link-quality classifier for one peer link incarnation.
///
/// Owns its ticker, so dropping the monitor cancels sampling. The first tick
/// fires one full period after creation.
#[derive(Debug)]
pub struct QualityMonitor {
    ticker: Interval,
    last_sampled: Option<QualityTier>,
}

impl QualityMonitor {
    /// A zero period falls back to the default five seconds.
    pub fn new(period: Duration) -> Self {
        let period = if period.is_zero() {
            warn!(
                "Quality sample period must be non-zero, using {:?}",
                DEFAULT_SAMPLE_PERIOD
            );
            DEFAULT_SAMPLE_PERIOD
        } else {
            period
        };
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            ticker,
            last_sampled: None,
        }
    }

    pub async fn tick(&mut self) {
        self.ticker.tick().await;
    }

    /// Classifies one tick. A tick without a sample keeps the last sampled
    /// tier and only reads as `Excellent` before any real sample arrived.
    pub fn observe(&mut self, sample: Option<QualitySample>) -> QualityTier {
        match sample {
            Some(sample) => {
                let tier = sample.tier();
                debug!(
                    "Outgoing bitrate {} bps classified as {:?}",
                    sample.outgoing_bitrate, tier
                );
                self.last_sampled = Some(tier);
                tier
            }
            None => {
                let tier = self.last_sampled.unwrap_or(QualityTier::Excellent);
                debug!("No bitrate sample this tick, keeping {:?}", tier);
                tier
            }
        }
    }

    pub fn last_sampled(&self) -> Option<QualityTier> {
        self.last_sampled
    }
}

/// What a tier change requires of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityAction {
    None,
    DisableLocalVideo,
}

/// Entering `AudioOnly` with video on turns video off. Nothing else has a
/// side effect; upgrades never turn video back on.
pub fn action_for_transition(
    previous: QualityTier,
    current: QualityTier,
    local_video_enabled: bool,
) -> QualityAction {
    if current == QualityTier::AudioOnly && previous != QualityTier::AudioOnly && local_video_enabled
    {
        QualityAction::DisableLocalVideo
    } else {
        QualityAction::None
    }
}
