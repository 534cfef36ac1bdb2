//! Samples the CI provider's rate-limit counters and exposes them as a gauge
//! the other loops consult for backpressure. Hard enforcement stays with the
//! CI client's conditional-GET cache.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::model::RateLimit;
use crate::providers::Ci;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct RateGauge {
    sample: RwLock<Option<RateLimit>>,
}

impl RateGauge {
    pub fn set(&self, sample: RateLimit) {
        *self.sample.write().unwrap() = Some(sample);
    }

    pub fn get(&self) -> Option<RateLimit> {
        *self.sample.read().unwrap()
    }

    /// True when the last sample showed no remaining budget and its reset
    /// time is still in the future.
    pub fn exhausted(&self) -> bool {
        match self.get() {
            Some(sample) => sample.remaining == 0 && sample.reset > Utc::now(),
            None => false,
        }
    }
}

pub async fn run(ci: Arc<dyn Ci>, gauge: Arc<RateGauge>, mut shutdown: watch::Receiver<bool>) {
    info!(interval = ?SAMPLE_INTERVAL, "api watch loop starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match ci.rate_limit().await {
            Ok(sample) => {
                debug!(
                    limit = sample.limit,
                    consumed = sample.used,
                    remaining = sample.remaining,
                    reset_in = sample.reset_in(Utc::now()),
                    "sampled api rate limit"
                );
                if sample.remaining == 0 {
                    warn!(
                        reset_in = sample.reset_in(Utc::now()),
                        "api rate limit exhausted"
                    );
                }
                gauge.set(sample);
            }
            Err(e) => warn!(error = %e, "failed to sample api rate limit"),
        }

        tokio::select! {
            _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!("api watch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn gauge_reports_exhaustion_until_reset() {
        let gauge = RateGauge::default();
        assert!(!gauge.exhausted());

        gauge.set(RateLimit {
            limit: 5000,
            used: 5000,
            remaining: 0,
            reset: Utc::now() + ChronoDuration::minutes(10),
        });
        assert!(gauge.exhausted());

        gauge.set(RateLimit {
            limit: 5000,
            used: 5000,
            remaining: 0,
            reset: Utc::now() - ChronoDuration::seconds(1),
        });
        assert!(!gauge.exhausted());

        gauge.set(RateLimit {
            limit: 5000,
            used: 10,
            remaining: 4990,
            reset: Utc::now() + ChronoDuration::minutes(10),
        });
        assert!(!gauge.exhausted());
    }
}
