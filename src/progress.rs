//! Percent and ETA computation for an active stage.
//!
//! Fed by `(current, total)` counts from the stage's progress events. Until
//! the run has produced enough samples of its own, the estimate falls back
//! to the stage's historical per-item mean from the metrics store.

use std::time::{Duration, Instant};

use crate::events::StageId;
use crate::metrics::MetricsStore;

/// Exponential moving average weight for fresh per-item samples.
const EMA_ALPHA: f64 = 0.3;

/// Live samples needed before the run's own timing is trusted.
const MIN_SAMPLES: u32 = 2;

/// Remaining-time estimate for an active stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Eta {
    /// Not enough information yet.
    Calculating,
    /// Projected from historical runs, not this one.
    Estimated(Duration),
    /// Projected from this run's own pace.
    Remaining(Duration),
}

impl std::fmt::Display for Eta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eta::Calculating => f.write_str("calculating"),
            Eta::Estimated(d) => write!(f, "~{} (estimated)", format_duration(*d)),
            Eta::Remaining(d) => f.write_str(&format_duration(*d)),
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Tracks progress of one stage run.
pub struct ProgressCalculator {
    stage: StageId,
    total: Option<u64>,
    current: u64,
    started: Instant,
    last_sample: Option<(Instant, u64)>,
    ema_per_item_ms: Option<f64>,
    samples: u32,
    historical_per_item_ms: Option<f64>,
}

impl ProgressCalculator {
    /// Create a calculator seeded with the stage's historical mean.
    pub fn new(stage: StageId, store: &MetricsStore) -> Self {
        Self::with_historical(stage, store.mean_per_item_ms(stage))
    }

    pub fn with_historical(stage: StageId, historical_per_item_ms: Option<f64>) -> Self {
        Self {
            stage,
            total: None,
            current: 0,
            started: Instant::now(),
            last_sample: None,
            ema_per_item_ms: None,
            samples: 0,
            historical_per_item_ms,
        }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn set_total(&mut self, total: u64) {
        if total > 0 {
            self.total = Some(total);
        }
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Record a new item count with a wall-clock sample.
    ///
    /// Counts never move backwards; a stale or duplicate report is ignored.
    pub fn update(&mut self, current: u64) {
        if current <= self.current {
            return;
        }
        let now = Instant::now();
        if let Some((then, count)) = self.last_sample {
            let items = current - count;
            if items > 0 {
                let per_item_ms = now.duration_since(then).as_secs_f64() * 1000.0 / items as f64;
                self.ema_per_item_ms = Some(match self.ema_per_item_ms {
                    Some(ema) => EMA_ALPHA * per_item_ms + (1.0 - EMA_ALPHA) * ema,
                    None => per_item_ms,
                });
                self.samples += 1;
            }
        }
        self.last_sample = Some((now, current));
        self.current = current;
    }

    /// Percent complete in [0, 100]; 0 while the total is unknown.
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => {
                (self.current as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }

    /// Remaining-time estimate for the stage.
    pub fn eta(&self) -> Eta {
        let total = match self.total {
            Some(t) if t > 0 => t,
            _ => return Eta::Calculating,
        };
        let remaining_items = total.saturating_sub(self.current);

        if self.samples >= MIN_SAMPLES {
            if let Some(ema) = self.ema_per_item_ms {
                return Eta::Remaining(Duration::from_millis(
                    (remaining_items as f64 * ema) as u64,
                ));
            }
        }

        if let Some(hist) = self.historical_per_item_ms {
            let projected_ms = total as f64 * hist;
            let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
            let remaining_ms = (projected_ms - elapsed_ms).max(0.0);
            return Eta::Estimated(Duration::from_millis(remaining_ms as u64));
        }

        Eta::Calculating
    }

    /// Persist this run's timing to the metrics store.
    pub fn complete(&self, store: &MetricsStore) {
        if self.current == 0 {
            return;
        }
        if let Err(e) = store.record(self.stage, self.current, self.started.elapsed()) {
            tracing::warn!("failed to record {} metrics: {}", self.stage, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_percent_unknown_total_is_zero() {
        let mut calc = ProgressCalculator::with_historical(StageId::Scraping, None);
        calc.update(7);
        assert_eq!(calc.percent(), 0.0);
        assert_eq!(calc.eta(), Eta::Calculating);
    }

    #[test]
    fn test_percent_clamped_at_100() {
        let mut calc = ProgressCalculator::with_historical(StageId::Scraping, None);
        calc.set_total(10);
        calc.update(25);
        assert_eq!(calc.percent(), 100.0);
    }

    #[test]
    fn test_current_never_decreases() {
        let mut calc = ProgressCalculator::with_historical(StageId::Scraping, None);
        calc.set_total(10);
        calc.update(5);
        calc.update(3);
        assert_eq!(calc.current(), 5);
        assert_eq!(calc.percent(), 50.0);
    }

    #[test]
    fn test_eta_calculating_before_two_samples() {
        let mut calc = ProgressCalculator::with_historical(StageId::Processing, None);
        calc.set_total(100);
        calc.update(1);
        assert_eq!(calc.eta(), Eta::Calculating);
    }

    #[test]
    fn test_eta_live_after_samples() {
        let mut calc = ProgressCalculator::with_historical(StageId::Processing, None);
        calc.set_total(100);
        calc.update(1);
        std::thread::sleep(Duration::from_millis(20));
        calc.update(2);
        std::thread::sleep(Duration::from_millis(20));
        calc.update(3);
        match calc.eta() {
            Eta::Remaining(d) => assert!(d > Duration::ZERO),
            other => panic!("expected live eta, got {:?}", other),
        }
    }

    #[test]
    fn test_eta_estimated_from_history() {
        let calc = {
            let mut c = ProgressCalculator::with_historical(StageId::Indices, Some(100.0));
            c.set_total(50);
            c.update(1);
            c
        };
        match calc.eta() {
            // 50 items at 100ms each, minus negligible elapsed
            Eta::Estimated(d) => assert!(d <= Duration::from_millis(5000)),
            other => panic!("expected estimated eta, got {:?}", other),
        }
    }

    #[test]
    fn test_complete_persists_sample() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());
        let mut calc = ProgressCalculator::new(StageId::Analysis, &store);
        calc.set_total(5);
        calc.update(5);
        calc.complete(&store);

        let samples = store.load(StageId::Analysis);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].total, 5);
    }

    #[test]
    fn test_complete_with_no_items_records_nothing() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());
        let calc = ProgressCalculator::new(StageId::Analysis, &store);
        calc.complete(&store);
        assert!(store.load(StageId::Analysis).is_empty());
    }

    #[test]
    fn test_eta_display() {
        assert_eq!(Eta::Calculating.to_string(), "calculating");
        assert_eq!(
            Eta::Remaining(Duration::from_secs(95)).to_string(),
            "1m35s"
        );
        assert_eq!(
            Eta::Estimated(Duration::from_secs(3700)).to_string(),
            "~1h01m (estimated)"
        );
    }
}
