use std::time::{Duration, Instant};

use crate::arrival_group::ArrivalGroupAccumulator;
use crate::feedback::AckedPacket;
use crate::macros::{log_bitrate_estimate, log_delay_variation};
use crate::rate_control::RateControl;
use crate::time::already_happened;
use crate::trendline::{BandwidthUsage, TrendlineEstimator};
use crate::units::Bitrate;

const MAX_RTT_HISTORY_WINDOW: usize = 32;
const UPDATE_INTERVAL: Duration = Duration::from_millis(25);
/// The maximum time we keep updating our estimate without receiving feedback.
const MAX_FEEDBACK_GAP: Duration = Duration::from_millis(500);
/// RFC 6298: Exponentially Weighted Moving Average smoothing factor for RTT (alpha = 1/8)
const RTT_SMOOTHING_FACTOR: f64 = 0.125;

/// Delay based rate controller.
///
/// Attempts to estimate the available send bandwidth by looking at the variations in packet
/// arrival times for groups of packets sent together. Broadly, if the delay variation is
/// increasing this indicates overuse.
pub(crate) struct DelayController {
    arrival_group_accumulator: ArrivalGroupAccumulator,
    trendline_estimator: TrendlineEstimator,
    rate_control: RateControl,
    /// Last estimate produced. Always has a value after the first estimate.
    last_estimate: Option<Bitrate>,
    /// Smoothed RTT using EWMA (RFC 6298, alpha = 1/8).
    smoothed_rtt: Option<f64>,
    /// History of the max RTT derived for each feedback batch (kept for fallback).
    max_rtt_history: Vec<Duration>,

    /// The next time we should poll.
    next_timeout: Instant,
    /// The last time we ingested a feedback batch.
    last_feedback: Instant,
}

impl DelayController {
    pub(crate) fn new(start_bitrate: Bitrate, min_bitrate: Bitrate, max_bitrate: Bitrate) -> Self {
        Self {
            arrival_group_accumulator: ArrivalGroupAccumulator::default(),
            trendline_estimator: TrendlineEstimator::new(20),
            rate_control: RateControl::new(start_bitrate, min_bitrate, max_bitrate),
            last_estimate: Some(start_bitrate.clamp(min_bitrate, max_bitrate)),
            smoothed_rtt: None,
            max_rtt_history: Vec::with_capacity(MAX_RTT_HISTORY_WINDOW),
            next_timeout: already_happened(),
            last_feedback: already_happened(),
        }
    }

    /// Record the acked packets of one feedback batch.
    pub(crate) fn update(
        &mut self,
        acked: &[AckedPacket],
        acked_bitrate: Option<Bitrate>,
        probe_bitrate: Option<Bitrate>,
        now: Instant,
    ) -> Option<Bitrate> {
        let mut max_rtt = None;

        for acked_packet in acked {
            max_rtt = max_rtt.max(Some(acked_packet.rtt()));
            if let Some(delay_variation) = self
                .arrival_group_accumulator
                .accumulate_packet(acked_packet)
            {
                log_delay_variation!(delay_variation.delay_ms());

                // Got a new delay variation, add it to the trendline.
                //
                // The remote receive time is the time base here, not the local
                // "time we processed this feedback". Using the remote receive
                // time avoids threshold adaptation artifacts when many deltas
                // are processed in one feedback batch. The remote timestamps
                // are used for relative timing only, so clock skew between the
                // peers doesn't matter.
                self.trendline_estimator
                    .add_delay_observation(delay_variation, delay_variation.last_remote_recv_time);
            }
        }

        if let Some(rtt) = max_rtt {
            self.update_rtt(rtt);
        }

        let new_hypothesis = self.trendline_estimator.hypothesis();

        self.update_estimate(new_hypothesis, acked_bitrate, probe_bitrate, self.rtt(), now);
        self.last_feedback = now;

        self.last_estimate
    }

    pub(crate) fn poll_timeout(&self) -> Instant {
        self.next_timeout
    }

    pub(crate) fn handle_timeout(&mut self, acked_bitrate: Option<Bitrate>, now: Instant) {
        if !self.trendline_hypothesis_valid(now) {
            // We haven't received feedback in a while. The trendline hypothesis can
            // no longer be considered valid. We need another feedback batch before
            // we can update estimates.
            let next_timeout_in = self.rtt().unwrap_or(MAX_FEEDBACK_GAP).min(UPDATE_INTERVAL);

            // Set this even if we didn't update, otherwise we get stuck in a poll -> handle loop
            // that starves the run loop.
            self.next_timeout = now + next_timeout_in;
            return;
        }

        self.update_estimate(
            self.trendline_estimator.hypothesis(),
            acked_bitrate,
            None,
            self.rtt(),
            now,
        );
    }

    /// Get the latest estimate.
    pub(crate) fn last_estimate(&self) -> Option<Bitrate> {
        self.last_estimate
    }

    /// The current smoothed RTT, with fallback to mean of history if not yet available.
    pub(crate) fn rtt(&self) -> Option<Duration> {
        if let Some(secs) = self.smoothed_rtt {
            return Some(Duration::from_secs_f64(secs));
        }

        // Fallback to mean of history during initialization
        if self.max_rtt_history.is_empty() {
            return None;
        }

        let sum = self
            .max_rtt_history
            .iter()
            .fold(Duration::ZERO, |acc, rtt| acc + *rtt);
        Some(sum / self.max_rtt_history.len() as u32)
    }

    /// Whether the delay trend detector currently signals overuse.
    pub(crate) fn is_overusing(&self) -> bool {
        self.trendline_estimator.hypothesis() == BandwidthUsage::Overuse
    }

    /// Force the estimate, e.g. on a route change reset.
    ///
    /// Retains trendline and threshold internals, only the operating point moves.
    pub(crate) fn set_estimate(&mut self, bitrate: Bitrate, now: Instant) {
        self.rate_control.set_estimate(bitrate, now);
        self.last_estimate = Some(self.rate_control.estimated_bitrate());
    }

    /// Change the allowed estimate range.
    pub(crate) fn set_bounds(&mut self, min_bitrate: Bitrate, max_bitrate: Bitrate) {
        self.rate_control.set_bounds(min_bitrate, max_bitrate);
        if self.last_estimate.is_some() {
            self.last_estimate = Some(self.rate_control.estimated_bitrate());
        }
    }

    /// Update smoothed RTT using EWMA (RFC 6298, alpha = 1/8).
    fn update_rtt(&mut self, rtt: Duration) {
        // Keep history as fallback in case smoothed RTT is not yet available
        if self.max_rtt_history.len() >= MAX_RTT_HISTORY_WINDOW {
            self.max_rtt_history.remove(0);
        }
        self.max_rtt_history.push(rtt);

        let sample = rtt.as_secs_f64();
        self.smoothed_rtt = Some(match self.smoothed_rtt {
            Some(s) => s * (1.0 - RTT_SMOOTHING_FACTOR) + sample * RTT_SMOOTHING_FACTOR,
            None => sample,
        });
    }

    fn update_estimate(
        &mut self,
        hypothesis: BandwidthUsage,
        observed_bitrate: Option<Bitrate>,
        probe_bitrate: Option<Bitrate>,
        rtt: Option<Duration>,
        now: Instant,
    ) {
        // If we have a validated probe result, apply it directly and skip the
        // delay-based update. This prevents probe results from being
        // immediately overridden by delay-based decreases caused by the probe
        // itself (probes cause temporary queuing delay).
        if let Some(probe_rate) = probe_bitrate {
            self.rate_control.set_estimate(probe_rate, now);
            let estimated_rate = self.rate_control.estimated_bitrate();
            log_bitrate_estimate!(estimated_rate.as_f64());
            self.last_estimate = Some(estimated_rate);
        } else if let Some(observed_bitrate) = observed_bitrate {
            self.rate_control
                .update(hypothesis.into(), observed_bitrate, rtt, now);
            let estimated_rate = self.rate_control.estimated_bitrate();

            log_bitrate_estimate!(estimated_rate.as_f64());
            self.last_estimate = Some(estimated_rate);
        }

        // Set this even if we didn't update, otherwise we get stuck in a poll -> handle loop
        // that starves the run loop.
        self.next_timeout = now + UPDATE_INTERVAL;
    }

    /// Whether the current trendline hypothesis is valid i.e. not too old.
    fn trendline_hypothesis_valid(&self, now: Instant) -> bool {
        now.duration_since(self.last_feedback)
            <= self
                .rtt()
                .map(|rtt| rtt * 2)
                .unwrap_or(MAX_FEEDBACK_GAP)
                .min(UPDATE_INTERVAL * 2)
    }
}
