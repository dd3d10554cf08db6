use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::acked_bitrate::AckedBitrateEstimator;
use crate::config::{Config, ConfigError};
use crate::delay::DelayController;
use crate::feedback::{FeedbackProcessor, PacketFeedback, SeqNo};
use crate::loss::LossController;
use crate::macros::log_loss;
use crate::probe::{ProbeClusterConfig, ProbeClusterId, ProbeControl, ProbeEstimator, ProbeKind};
use crate::pushback::CongestionWindow;
use crate::route::{NetworkRoute, ResetPolicy, RouteChangeHandler};
use crate::units::{Bitrate, DataSize};

const INITIAL_BITRATE_WINDOW: Duration = Duration::from_millis(500);
const BITRATE_WINDOW: Duration = Duration::from_millis(150);
const STARTUP_PHASE: Duration = Duration::from_secs(2);

/// Feedback silence after which the controller assumes total loss.
const STARVATION_TIMEOUT: Duration = Duration::from_secs(1);
/// Per-tick decay applied to the estimates while starved.
const STARVATION_DECAY: f64 = 0.95;
/// Minimum spacing between two starvation decays.
const STARVATION_DECAY_INTERVAL: Duration = Duration::from_millis(25);

/// A new target rate decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetRateUpdate {
    /// The recommended sending bitrate, after any congestion window pushback.
    pub send_bitrate: Bitrate,
    /// The rate the pacer should pace at. Includes headroom above the send
    /// bitrate for draining bursts and realizing probes.
    pub pacing_bitrate: Bitrate,
    /// Cap on bytes in flight before sending must pause.
    pub congestion_window: DataSize,
    /// When this decision was made.
    pub at: Instant,
}

/// Output events produced by the controller.
///
/// Drained with [`NetworkController::poll_output`].
#[derive(Debug, Clone, Copy)]
pub enum Output {
    /// The target rate decision changed.
    TargetUpdate(TargetRateUpdate),
    /// A probe cluster for the pacing collaborator to realize on the wire.
    ProbeCluster(ProbeClusterConfig),
}

/// Sans-IO bandwidth controller for a single call/session.
///
/// Consumes transport feedback, route changes and periodic ticks, and emits
/// target rate decisions and probe schedules. All state lives in this value;
/// the embedding event loop drives it:
///
/// - feed inputs via the `handle_*` and `set_*` methods
/// - call [`handle_timeout`][Self::handle_timeout] when
///   [`poll_timeout`][Self::poll_timeout] expires
/// - drain [`poll_output`][Self::poll_output] after every input
///
/// Time is always injected via `Instant` arguments. The controller never
/// reads a clock, which makes runs over recorded input fully deterministic.
pub struct NetworkController {
    config: Config,
    pending_config: Option<Config>,

    feedback: FeedbackProcessor,
    acked_bitrate: AckedBitrateEstimator,
    delay: DelayController,
    loss: LossController,
    probes: ProbeControl,
    probe_estimator: ProbeEstimator,
    window: CongestionWindow,
    routes: RouteChangeHandler,

    available: bool,
    started_at: Option<Instant>,
    /// Last input that proves the feedback path is alive.
    last_activity: Option<Instant>,
    last_starvation_decay: Option<Instant>,

    last_emitted: Option<(u64, u64, u64)>,
    outputs: VecDeque<Output>,
}

impl NetworkController {
    /// Create a controller from a validated configuration.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            feedback: FeedbackProcessor::new(),
            acked_bitrate: AckedBitrateEstimator::new(INITIAL_BITRATE_WINDOW, BITRATE_WINDOW),
            delay: DelayController::new(
                config.start_bitrate,
                config.min_bitrate,
                config.max_bitrate,
            ),
            loss: LossController::new(config.min_bitrate, config.max_bitrate),
            probes: ProbeControl::new(config.probe_scaling, config.max_bitrate),
            probe_estimator: ProbeEstimator::new(),
            window: CongestionWindow::new(config.pushback, config.pushback_margin),
            routes: RouteChangeHandler::new(reset_policy(&config)),
            available: true,
            started_at: None,
            last_activity: None,
            last_starvation_decay: None,
            last_emitted: None,
            outputs: VecDeque::new(),
            pending_config: None,
            config,
        })
    }

    /// Apply a new configuration.
    ///
    /// Validated immediately; an invalid configuration is rejected and the
    /// previous one stays active. A valid configuration takes effect on the
    /// next tick.
    pub fn set_config(&mut self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.pending_config = Some(config);
        Ok(())
    }

    /// Feed one batch of transport feedback.
    pub fn handle_feedback(&mut self, records: &[PacketFeedback], now: Instant) {
        if !self.available {
            return;
        }
        if records.is_empty() {
            // Nothing observed, nothing to adapt.
            return;
        }

        self.ensure_started(now);
        self.last_activity = Some(now);

        // Reported packets are no longer in flight, acked or not.
        self.window.on_feedback(records);

        // Probe results are computed before the general estimators so a
        // validated burst can raise the estimate in the same batch.
        let probe_results = self.probe_estimator.update(records);
        let latest_probe = probe_results.last().map(|(_, bitrate)| *bitrate);

        let summary = self.feedback.process(records, now);

        for acked in &summary.acked {
            self.acked_bitrate.update(acked.remote_recv_time, acked.size);
        }
        let acked_rate = self.acked_bitrate.current_estimate();

        let delay_estimate = self
            .delay
            .update(&summary.acked, acked_rate, latest_probe, now);

        let loss = summary.loss_ratio();
        log_loss!(loss);

        if let Some(delay_estimate) = delay_estimate {
            if self.in_startup_phase(now) && loss <= 0.001 {
                // During startup with no loss, the delay controller is in charge.
                self.loss.set_estimate(delay_estimate);
            } else {
                if latest_probe.is_some() {
                    // A validated probe re-seeds the loss controller too,
                    // otherwise it would cap out the discovered headroom.
                    self.loss.set_estimate(delay_estimate);
                }

                self.loss
                    .update(loss, summary.packet_count, self.delay.rtt(), now);
                trace!(
                    regime = %self.loss.regime(),
                    loss = %format!("{:.3}", loss),
                    "Applied loss sample"
                );

                // The delay-based estimate is the upper limit for the loss
                // controller.
                if let Some(loss_estimate) = self.loss.estimate() {
                    if loss_estimate > delay_estimate {
                        self.loss.set_estimate(delay_estimate);
                    }
                }
            }
        }

        self.emit_update(now);
    }

    /// Report a sent packet, for bytes-in-flight tracking.
    pub fn handle_packet_sent(&mut self, seq: SeqNo, size: DataSize, now: Instant) {
        self.window.on_packet_sent(seq, size, now);
    }

    /// Report the current depth of the pacer's send queue.
    pub fn set_pacer_queue(&mut self, bytes: DataSize) {
        self.window.set_pacer_queue(bytes);
    }

    /// The pacer started realizing a probe cluster on the wire.
    pub fn start_probe(&mut self, config: ProbeClusterConfig, now: Instant) {
        self.probe_estimator.probe_start(config, now);
    }

    /// The pacer finished sending a probe cluster.
    ///
    /// Feedback keeps refining the result for a short history period after.
    pub fn end_probe(&mut self, cluster: ProbeClusterId, now: Instant) {
        self.probe_estimator.end_probe(cluster, now);
    }

    /// The network path changed.
    ///
    /// Applies the configured reset policy and schedules a fresh probe
    /// sequence. In-flight probe clusters from the previous path are
    /// invalidated; their results will be dropped on arrival.
    pub fn handle_route_change(&mut self, route: NetworkRoute, now: Instant) {
        self.ensure_started(now);

        let prev_estimate = Some(self.current_estimate());
        let Some(reset) = self.routes.apply(
            &route,
            prev_estimate,
            self.config.start_bitrate,
            self.config.min_bitrate,
        ) else {
            return;
        };

        // Anything probing on the previous path is meaningless now.
        self.probe_estimator.clear();
        self.probes.reset();

        if reset.hard {
            self.delay = DelayController::new(
                reset.target,
                self.config.min_bitrate,
                self.config.max_bitrate,
            );
            self.loss.reset();
            self.acked_bitrate = AckedBitrateEstimator::new(INITIAL_BITRATE_WINDOW, BITRATE_WINDOW);
            self.started_at = Some(now);
        } else {
            self.delay.set_estimate(reset.target, now);
            if self.loss.estimate().is_some() {
                self.loss.set_estimate(reset.target);
            }
        }

        // A probe sequence runs regardless of reset policy. It is what raises
        // the rate again when the new path turns out to have more capacity.
        self.probes
            .start_sequence(reset.target, ProbeKind::RouteChange, now);

        self.last_activity = Some(now);
        self.emit_update(now);
    }

    /// Signal whether the network is usable at all.
    ///
    /// While unavailable the controller freezes: no estimate updates, no
    /// probing. Becoming available again schedules a fresh probe sequence.
    pub fn set_network_available(&mut self, available: bool, now: Instant) {
        if self.available == available {
            return;
        }
        self.available = available;
        debug!(available, "Network availability changed");

        if available {
            self.probes.enable(true);
            self.last_activity = Some(now);
            if self.started_at.is_some() {
                self.probes
                    .start_sequence(self.current_estimate(), ProbeKind::Initial, now);
            }
        } else {
            self.probes.enable(false);
            self.probe_estimator.clear();
        }
    }

    /// Periodic tick. Call when [`poll_timeout`][Self::poll_timeout] expires.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.ensure_started(now);
        self.apply_pending_config();

        self.window.expire(now);

        if self.available {
            self.delay
                .handle_timeout(self.acked_bitrate.current_estimate(), now);

            if self.is_starved(now) {
                self.starvation_decay(now);
            }

            self.probe_estimator.handle_timeout(now);

            if let Some(config) = self.probes.handle_timeout(now) {
                self.outputs.push_back(Output::ProbeCluster(config));
            }
        } else {
            // Keep the delay controller's timer moving so poll_timeout does
            // not go stale while we are frozen.
            self.delay
                .handle_timeout(self.acked_bitrate.current_estimate(), now);
        }

        self.emit_update(now);
    }

    /// When [`handle_timeout`][Self::handle_timeout] should next be called.
    pub fn poll_timeout(&self) -> Instant {
        self.delay
            .poll_timeout()
            .min(self.probes.poll_timeout())
            .min(self.probe_estimator.poll_timeout())
    }

    /// Drain the next output event.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// The current combined target estimate, clamped to the configured range.
    ///
    /// Before any feedback has arrived this reports the configured start rate.
    pub fn last_estimate(&self) -> Bitrate {
        self.current_estimate()
    }

    /// Number of feedback records dropped as malformed or duplicate.
    pub fn dropped_feedback(&self) -> u64 {
        self.feedback.dropped()
    }

    /// The route change generation. Incremented on every route change.
    pub fn generation(&self) -> u64 {
        self.routes.generation()
    }

    /// Current bytes in flight (sent, not yet acked, lost or expired).
    pub fn in_flight(&self) -> DataSize {
        self.window.in_flight()
    }

    fn ensure_started(&mut self, now: Instant) {
        if self.started_at.is_some() {
            return;
        }
        self.started_at = Some(now);
        self.last_activity = Some(now);

        // Discover headroom beyond the conservative start value quickly.
        self.probes
            .start_sequence(self.config.start_bitrate, ProbeKind::Initial, now);
    }

    fn in_startup_phase(&self, now: Instant) -> bool {
        self.started_at
            .map(|s| now.duration_since(s) <= STARTUP_PHASE)
            .unwrap_or(false)
    }

    fn is_starved(&self, now: Instant) -> bool {
        self.last_activity
            .map(|t| now.saturating_duration_since(t) > STARVATION_TIMEOUT)
            .unwrap_or(false)
    }

    /// Treat prolonged feedback silence as total loss: decay toward the
    /// minimum, never raise speculatively.
    fn starvation_decay(&mut self, now: Instant) {
        let due = self
            .last_starvation_decay
            .map(|t| now.saturating_duration_since(t) >= STARVATION_DECAY_INTERVAL)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_starvation_decay = Some(now);

        if let Some(estimate) = self.delay.last_estimate() {
            let decayed = (estimate * STARVATION_DECAY).max(self.config.min_bitrate);
            self.delay.set_estimate(decayed, now);
        }
        if let Some(estimate) = self.loss.estimate() {
            let decayed = (estimate * STARVATION_DECAY).max(self.config.min_bitrate);
            self.loss.set_estimate(decayed);
        }

        trace!(estimate = %self.current_estimate(), "Starved of feedback, decaying estimate");
    }

    fn apply_pending_config(&mut self) {
        let Some(config) = self.pending_config.take() else {
            return;
        };

        self.delay
            .set_bounds(config.min_bitrate, config.max_bitrate);
        self.loss.set_bounds(config.min_bitrate, config.max_bitrate);
        self.probes.set_max_bitrate(config.max_bitrate);
        self.window
            .set_enabled(config.pushback, config.pushback_margin);
        self.routes.set_policy(reset_policy(&config));

        debug!("Applied new configuration");
        self.config = config;
    }

    /// The combined estimate: min(delay, loss), clamped to bounds.
    fn current_estimate(&self) -> Bitrate {
        let delay_estimate = self.delay.last_estimate();
        let loss_estimate = self.loss.estimate();

        let estimate = match (delay_estimate, loss_estimate) {
            (Some(de), Some(le)) => de.min(le),
            (Some(de), None) => de,
            (None, Some(le)) => le,
            (None, None) => self.config.start_bitrate,
        };

        estimate.clamp(self.config.min_bitrate, self.config.max_bitrate)
    }

    fn emit_update(&mut self, now: Instant) {
        let target = self.current_estimate();

        // Let the probe controller chase the estimate.
        self.probes.set_estimated_bitrate(target);

        let rtt = self.delay.rtt();
        let send_bitrate = self.window.apply(target, rtt, self.config.min_bitrate);
        let congestion_window = self.window.window(target, rtt);
        let pacing_bitrate = target * self.config.pacing_factor;

        let key = (
            send_bitrate.as_u64(),
            pacing_bitrate.as_u64(),
            congestion_window.as_bytes_u64(),
        );
        if self.last_emitted == Some(key) {
            return;
        }
        self.last_emitted = Some(key);

        self.outputs.push_back(Output::TargetUpdate(TargetRateUpdate {
            send_bitrate,
            pacing_bitrate,
            congestion_window,
            at: now,
        }));
    }
}

fn reset_policy(config: &Config) -> ResetPolicy {
    if config.safe_reset {
        ResetPolicy::Safe
    } else {
        ResetPolicy::Hard
    }
}
