use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::macros::log_loss_based_bitrate_estimate;
use crate::units::Bitrate;

/// Loss ratio below which the rate is increased.
const LOW_LOSS_THRESHOLD: f64 = 0.02;
/// Loss ratio above which the rate is decreased.
const HIGH_LOSS_THRESHOLD: f64 = 0.10;
/// Increase applied to the windowed minimum bitrate on low loss.
const INCREASE_FACTOR: f64 = 1.08;
/// Window for the trailing minimum used when ramping up.
const INCREASE_WINDOW: Duration = Duration::from_secs(1);
/// The minimum interval between two loss-triggered decreases, RTT is added on top.
const DECREASE_INTERVAL: Duration = Duration::from_millis(300);
/// Loss samples over fewer packets than this carry too little confidence.
const MIN_PACKETS_PER_SAMPLE: usize = 10;

/// The regime the loss controller is currently operating in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LossRegime {
    Increase,
    Hold,
    Decrease,
}

/// Loss based rate controller.
///
/// Buckets the observed loss ratio: low loss ramps the rate up, moderate loss
/// holds, high loss backs off multiplicatively. Complementary to the delay
/// controller, which reacts faster but cannot see tail drop on short-buffered
/// paths.
pub(crate) struct LossController {
    estimate: Option<Bitrate>,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,

    regime: LossRegime,

    /// Trailing minimum of the estimate, used as the base for ramp-up so one
    /// low-loss sample cannot compound on top of another within the window.
    min_history: VecDeque<(Instant, Bitrate)>,

    /// The last time a loss-triggered decrease was applied.
    time_last_decrease: Option<Instant>,
}

impl LossController {
    pub(crate) fn new(min_bitrate: Bitrate, max_bitrate: Bitrate) -> Self {
        Self {
            estimate: None,
            min_bitrate,
            max_bitrate,
            regime: LossRegime::Increase,
            min_history: VecDeque::new(),
            time_last_decrease: None,
        }
    }

    /// Seed or override the estimate, e.g. from the delay controller during
    /// startup or after a validated probe.
    pub(crate) fn set_estimate(&mut self, bitrate: Bitrate) {
        self.estimate = Some(bitrate.clamp(self.min_bitrate, self.max_bitrate));
    }

    pub(crate) fn estimate(&self) -> Option<Bitrate> {
        self.estimate
    }

    pub(crate) fn regime(&self) -> LossRegime {
        self.regime
    }

    /// Change the allowed estimate range, re-clamping the current estimate.
    pub(crate) fn set_bounds(&mut self, min_bitrate: Bitrate, max_bitrate: Bitrate) {
        self.min_bitrate = min_bitrate;
        self.max_bitrate = max_bitrate;
        if let Some(estimate) = self.estimate {
            self.estimate = Some(estimate.clamp(min_bitrate, max_bitrate));
        }
    }

    /// Reset estimator internals (hard route reset).
    pub(crate) fn reset(&mut self) {
        self.estimate = None;
        self.regime = LossRegime::Increase;
        self.min_history.clear();
        self.time_last_decrease = None;
    }

    /// Apply one loss sample.
    pub(crate) fn update(
        &mut self,
        loss_ratio: f64,
        packet_count: usize,
        rtt: Option<Duration>,
        now: Instant,
    ) {
        let Some(estimate) = self.estimate else {
            // Nothing to adapt until we have been seeded.
            return;
        };

        if packet_count < MIN_PACKETS_PER_SAMPLE {
            trace!(packet_count, "Ignoring loss sample over too few packets");
            return;
        }

        self.update_min_history(estimate, now);

        if loss_ratio <= LOW_LOSS_THRESHOLD {
            self.regime = LossRegime::Increase;

            // Ramp from the windowed minimum rather than the current value.
            // Remembering the bitrate over the last second means we can ramp
            // up a full step the moment loss clears instead of compounding
            // 8% per sample.
            let base = self
                .min_history
                .front()
                .map(|(_, v)| *v)
                .unwrap_or(estimate);
            let increased = base * INCREASE_FACTOR + Bitrate::kbps(1);

            // Never move down in the increase regime. The windowed minimum can
            // sit below a rate that a probe just confirmed.
            let new_estimate = increased.max(estimate);
            self.apply(new_estimate);
        } else if loss_ratio <= HIGH_LOSS_THRESHOLD {
            self.regime = LossRegime::Hold;
        } else {
            self.regime = LossRegime::Decrease;

            // Limit decreases to once per interval + RTT, the loss ratio needs
            // time to react to the previous cut.
            let backoff_after = DECREASE_INTERVAL + rtt.unwrap_or(Duration::ZERO);
            let can_decrease = self
                .time_last_decrease
                .map(|t| now.saturating_duration_since(t) >= backoff_after)
                .unwrap_or(true);

            if can_decrease {
                self.time_last_decrease = Some(now);
                let new_estimate = estimate * (1.0 - loss_ratio / 2.0);
                debug!(
                    %new_estimate,
                    loss = %format!("{:.3}", loss_ratio),
                    "LossController: Decreasing estimate"
                );
                self.apply(new_estimate);
            }
        }
    }

    fn apply(&mut self, bitrate: Bitrate) {
        let clamped = bitrate.clamp(self.min_bitrate, self.max_bitrate);
        log_loss_based_bitrate_estimate!(clamped.as_f64());
        self.estimate = Some(clamped);
    }

    /// Maintain the monotonic trailing-minimum window of estimates.
    fn update_min_history(&mut self, estimate: Bitrate, now: Instant) {
        while let Some((t, _)) = self.min_history.front() {
            if now.saturating_duration_since(*t) > INCREASE_WINDOW {
                self.min_history.pop_front();
            } else {
                break;
            }
        }

        while let Some((_, v)) = self.min_history.back() {
            if *v >= estimate {
                self.min_history.pop_back();
            } else {
                break;
            }
        }

        self.min_history.push_back((now, estimate));
    }
}

impl fmt::Display for LossRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossRegime::Increase => write!(f, "increase"),
            LossRegime::Hold => write!(f, "hold"),
            LossRegime::Decrease => write!(f, "decrease"),
        }
    }
}
