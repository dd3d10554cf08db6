//! Bandwidth probing controller - decides when and how to probe network capacity.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{ProbeClusterConfig, ProbeClusterId, ProbeKind};
use crate::time::{already_happened, not_happening};
use crate::units::Bitrate;

/// How long we wait for a probe result before re-probing at the same estimate.
const MAX_WAITING_TIME_FOR_PROBING_RESULT: Duration = Duration::from_secs(1);

/// Smallest bitrate worth probing at.
const MIN_PROBE_BITRATE: Bitrate = Bitrate::kbps(5);

/// Threshold for considering an estimate change significant (5%).
const ESTIMATE_CHANGE_THRESHOLD: f64 = 0.05;

/// Scaling factors for the probe schedule.
///
/// The first two factors size the startup/route-change sequence relative to
/// the base rate, the further factor sizes follow-up probes relative to the
/// confirmed estimate, and the threshold decides how close a result must come
/// to its probe's target for follow-up probing to continue.
#[derive(Debug, Clone, Copy)]
pub struct ProbeScaling {
    /// First probe of a sequence, multiple of the base rate.
    pub first_scale: f64,
    /// Second probe of a sequence, multiple of the base rate.
    pub second_scale: f64,
    /// Follow-up probes, multiple of the confirmed estimate.
    pub further_scale: f64,
    /// Fraction of the probe target the estimate must reach to probe further.
    pub further_threshold: f64,
}

impl Default for ProbeScaling {
    fn default() -> Self {
        Self {
            first_scale: 3.0,
            second_scale: 6.0,
            further_scale: 2.0,
            further_threshold: 0.7,
        }
    }
}

/// Schedules deliberate bitrate bursts to discover path capacity.
///
/// Emits one [`ProbeClusterConfig`] per `handle_timeout()` call. Configs are
/// queued internally and `poll_timeout()` returns `already_happened()` until
/// the queue is drained.
pub(crate) struct ProbeControl {
    scaling: ProbeScaling,
    enabled: bool,
    next_timeout: Instant,

    /// Ceiling for probe targets. Probing beyond what the configuration
    /// allows as a target rate is wasted bursts.
    max_bitrate: Bitrate,

    last_estimate: Option<Bitrate>,

    last_probe: Option<LastProbe>,

    next_cluster_id: u64,
    pending: VecDeque<ProbeClusterConfig>,

    scheduled_further: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LastProbe {
    when: Instant,
    /// Threshold for further probing (probe target * further_threshold).
    further: Bitrate,
    was_estimate: Option<Bitrate>,
}

impl ProbeControl {
    pub(crate) fn new(scaling: ProbeScaling, max_bitrate: Bitrate) -> Self {
        Self {
            scaling,
            enabled: true,
            next_timeout: not_happening(),
            max_bitrate,
            last_estimate: None,
            last_probe: None,
            next_cluster_id: 0,
            pending: VecDeque::new(),
            scheduled_further: None,
        }
    }

    pub(crate) fn enable(&mut self, v: bool) {
        if self.enabled == v {
            return;
        }
        self.enabled = v;
        if !v {
            self.pending.clear();
            self.scheduled_further = None;
            self.next_timeout = not_happening();
        }
    }

    pub(crate) fn set_max_bitrate(&mut self, v: Bitrate) {
        self.max_bitrate = v;
    }

    pub(crate) fn set_estimated_bitrate(&mut self, v: Bitrate) {
        // Check if estimate changed significantly (>5%).
        let dominated_by_last = self.last_estimate.is_some_and(|last| {
            let upper = last * (1.0 + ESTIMATE_CHANGE_THRESHOLD);
            let lower = last * (1.0 - ESTIMATE_CHANGE_THRESHOLD);
            v <= upper && v >= lower
        });

        if dominated_by_last {
            return;
        }

        self.last_estimate = Some(v);
        self.request_immediate();
    }

    /// Queue a full probe sequence scaled from the given base rate.
    ///
    /// Used at session start, after route changes, and when the network
    /// becomes available again.
    pub(crate) fn start_sequence(&mut self, base: Bitrate, kind: ProbeKind, now: Instant) {
        // A new sequence supersedes whatever was queued.
        self.pending.clear();

        let p1 = base * self.scaling.first_scale;
        let p2 = base * self.scaling.second_scale;

        self.queue_probe(p1, kind, now);
        self.queue_probe(p2, kind, now);

        self.request_immediate();
    }

    /// Drop queued probes and forget probing history.
    ///
    /// Called on route changes, queued probes belong to a superseded path.
    /// Cluster ids keep counting up so stale results can never alias new ones.
    pub(crate) fn reset(&mut self) {
        self.pending.clear();
        self.last_probe = None;
        self.last_estimate = None;
        self.scheduled_further = None;
        self.next_timeout = not_happening();
    }

    pub(crate) fn poll_timeout(&self) -> Instant {
        self.next_timeout
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) -> Option<ProbeClusterConfig> {
        // Spurious call before timeout is due - ignore.
        if now < self.next_timeout {
            return None;
        }

        // Timeout fired - reset to not_happening until we compute the next one.
        self.next_timeout = not_happening();

        if !self.enabled {
            return None;
        }

        // Return pending probes first.
        if let Some(config) = self.pending.pop_front() {
            if !self.pending.is_empty() {
                // Schedule another.
                self.request_immediate();
            } else {
                self.next_timeout = self.compute_next_timeout(now);
            }
            return Some(config);
        }

        self.maybe_further(now);

        self.next_timeout = self.compute_next_timeout(now);

        if !self.pending.is_empty() {
            self.request_immediate();
        }

        self.pending.pop_front()
    }

    /// Follow-up probing: when a probe result confirmed most of its target,
    /// there may be more headroom above it.
    fn maybe_further(&mut self, now: Instant) -> bool {
        // Need a previous probe to continue from.
        let Some(last) = self.last_probe else {
            return false;
        };

        let Some(estimate) = self.last_estimate else {
            return false;
        };

        // Estimate must come close enough to the last probe target.
        if estimate < last.further {
            return false;
        }

        let is_same = Some(estimate) == last.was_estimate;
        let time_since = self.time_since_last_probe(now);

        // Don't re-probe at the same estimate; wait for new result or timeout.
        if is_same && time_since < MAX_WAITING_TIME_FOR_PROBING_RESULT {
            return false;
        }

        let target = estimate * self.scaling.further_scale;

        // Already probing at the ceiling; no point probing again.
        if target >= self.max_bitrate && last.further >= self.max_bitrate * self.scaling.further_threshold
        {
            return false;
        }

        self.queue_probe(target, ProbeKind::Further, now);

        true
    }

    fn queue_probe(&mut self, bitrate: Bitrate, kind: ProbeKind, now: Instant) {
        let bitrate = bitrate.min(self.max_bitrate);

        // No probe at too small values.
        if bitrate < MIN_PROBE_BITRATE {
            return;
        }

        self.next_cluster_id += 1;
        let cluster_id = ProbeClusterId::from(self.next_cluster_id);

        let config = ProbeClusterConfig::new(cluster_id, bitrate, kind);

        debug!(cluster = %cluster_id, target = %bitrate, ?kind, "Queueing probe");

        // Threshold for further probing.
        let probe_further = bitrate * self.scaling.further_threshold;

        self.pending.push_back(config);
        self.last_probe = Some(LastProbe {
            when: now,
            further: probe_further,
            was_estimate: self.last_estimate,
        });
    }

    fn request_immediate(&mut self) {
        self.next_timeout = already_happened();
        self.scheduled_further = None;
    }

    fn compute_next_timeout(&mut self, now: Instant) -> Instant {
        if self.last_probe.is_some() {
            // Wait out the probing result before considering further probes.
            if self.scheduled_further.is_none() {
                self.scheduled_further = Some(now + MAX_WAITING_TIME_FOR_PROBING_RESULT);
            }
            return self.scheduled_further.unwrap();
        }

        not_happening()
    }

    fn time_since_last_probe(&self, now: Instant) -> Duration {
        self.last_probe
            .map(|p| now.saturating_duration_since(p.when))
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn probe_control() -> ProbeControl {
        ProbeControl::new(ProbeScaling::default(), Bitrate::gbps(1))
    }

    #[test]
    fn sequence_probes_are_queued_and_emitted_one_per_tick() {
        let mut pc = probe_control();
        let now = Instant::now();

        pc.start_sequence(Bitrate::kbps(300), ProbeKind::Initial, now);

        // First handle_timeout returns the first probe.
        let p1 = pc.handle_timeout(now).unwrap();

        // poll_timeout returns already_happened while there are pending probes.
        assert_eq!(pc.poll_timeout(), already_happened());

        // Second handle_timeout returns the second queued probe.
        let p2 = pc.handle_timeout(now).unwrap();

        assert_eq!(p1.target_bitrate(), Bitrate::kbps(900));
        assert_eq!(p2.target_bitrate(), Bitrate::kbps(1800));
        assert_eq!(p1.min_packet_count(), 5);
        assert!(p1.cluster() < p2.cluster());

        // Queue drained - no more probes.
        assert!(pc.handle_timeout(now).is_none());
    }

    #[test]
    fn further_probe_is_triggered_when_probe_result_is_high_enough() {
        let mut pc = probe_control();
        let now = Instant::now();

        pc.set_estimated_bitrate(Bitrate::mbps(1));
        pc.start_sequence(Bitrate::mbps(1), ProbeKind::Initial, now);

        // Drain initial two probes.
        let _ = pc.handle_timeout(now).unwrap();
        let _ = pc.handle_timeout(now).unwrap();

        // If the confirmed estimate exceeds further_threshold (0.7) of the last
        // probe target (6 Mbps -> 4.2 Mbps), probe at 2x the estimate.
        pc.set_estimated_bitrate(Bitrate::mbps(5));

        let p = pc.handle_timeout(now + Duration::from_millis(10)).unwrap();
        assert_eq!(p.target_bitrate(), Bitrate::mbps(10));
    }

    #[test]
    fn no_further_probe_below_threshold() {
        let mut pc = probe_control();
        let now = Instant::now();

        pc.set_estimated_bitrate(Bitrate::kbps(300));
        pc.start_sequence(Bitrate::kbps(300), ProbeKind::Initial, now);

        let _ = pc.handle_timeout(now).unwrap();
        let _ = pc.handle_timeout(now).unwrap();

        // Saturated link: estimate well below 0.7 * 1800 kbps.
        pc.set_estimated_bitrate(Bitrate::kbps(200));

        assert!(pc.handle_timeout(now + Duration::from_millis(10)).is_none());
    }

    #[test]
    fn reset_drops_queued_probes() {
        let mut pc = probe_control();
        let now = Instant::now();

        pc.start_sequence(Bitrate::kbps(300), ProbeKind::Initial, now);
        let first = pc.handle_timeout(now).unwrap();

        pc.reset();
        assert!(pc.handle_timeout(now).is_none());

        // A new sequence continues the id series.
        pc.start_sequence(Bitrate::kbps(300), ProbeKind::RouteChange, now);
        let next = pc.handle_timeout(now).unwrap();
        assert!(next.cluster() > first.cluster());
    }

    #[test]
    fn disabled_emits_nothing() {
        let mut pc = probe_control();
        let now = Instant::now();

        pc.enable(false);
        pc.start_sequence(Bitrate::kbps(300), ProbeKind::Initial, now);

        assert!(pc.handle_timeout(now).is_none());
    }

    #[test]
    fn probe_targets_capped_at_max_bitrate() {
        let mut pc = ProbeControl::new(ProbeScaling::default(), Bitrate::kbps(1000));
        let now = Instant::now();

        pc.start_sequence(Bitrate::kbps(300), ProbeKind::Initial, now);

        let p1 = pc.handle_timeout(now).unwrap();
        let p2 = pc.handle_timeout(now).unwrap();

        assert_eq!(p1.target_bitrate(), Bitrate::kbps(900));
        assert_eq!(p2.target_bitrate(), Bitrate::kbps(1000));
    }
}
