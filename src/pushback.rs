use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::feedback::{PacketFeedback, SeqNo};
use crate::macros::log_congestion_window_fill;
use crate::units::{Bitrate, DataSize};

/// Floor for the congestion window, roughly two full video frames.
const MIN_WINDOW: DataSize = DataSize::bytes(6000);

/// The lowest rate pushback will cap to. Below this the media would rather
/// pause than crawl, and that call belongs to the application.
const MIN_PUSHBACK_BITRATE: Bitrate = Bitrate::kbps(30);

/// RTT assumed for the window until feedback has produced a measurement.
const DEFAULT_RTT: Duration = Duration::from_millis(100);

/// Sent packets never reported back are considered gone after this long.
const IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(2);

/// Caps instantaneous sending when too many bytes are outstanding.
///
/// The allowed window is `target_rate * (rtt + margin)`. When the bytes in
/// flight (plus the pacer queue) overshoot the window, the emitted target is
/// scaled down multiplicatively until the queues drain, independently of what
/// the delay/loss estimators currently believe. This is what keeps the
/// sending queue from building unbounded latency when the path stalls.
pub(crate) struct CongestionWindow {
    enabled: bool,
    margin: Duration,

    /// Sent but not yet acked/lost/expired packets.
    in_flight: BTreeMap<SeqNo, InFlight>,
    in_flight_total: DataSize,

    /// Depth of the pacer's send queue, reported by the pacer.
    pacer_queue: DataSize,

    /// Multiplier applied to the target rate while pushing back.
    ratio: f64,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    size: DataSize,
    sent_at: Instant,
}

impl CongestionWindow {
    pub(crate) fn new(enabled: bool, margin: Duration) -> Self {
        Self {
            enabled,
            margin,
            in_flight: BTreeMap::new(),
            in_flight_total: DataSize::ZERO,
            pacer_queue: DataSize::ZERO,
            ratio: 1.0,
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool, margin: Duration) {
        self.enabled = enabled;
        self.margin = margin;
        if !enabled {
            self.ratio = 1.0;
        }
    }

    pub(crate) fn on_packet_sent(&mut self, seq: SeqNo, size: DataSize, now: Instant) {
        let previous = self.in_flight.insert(seq, InFlight { size, sent_at: now });
        self.in_flight_total += size;
        if let Some(previous) = previous {
            // Re-sent seq, don't double count.
            self.in_flight_total = self.in_flight_total.saturating_sub(previous.size);
        }
    }

    /// Remove every reported packet from the in-flight set.
    ///
    /// Both acked and lost packets have left the network.
    pub(crate) fn on_feedback(&mut self, records: &[PacketFeedback]) {
        for record in records {
            if let Some(in_flight) = self.in_flight.remove(&record.seq) {
                self.in_flight_total = self.in_flight_total.saturating_sub(in_flight.size);
            }
        }
    }

    /// Expire in-flight packets that were never reported back.
    pub(crate) fn expire(&mut self, now: Instant) {
        let mut expired_total = DataSize::ZERO;
        self.in_flight.retain(|_, f| {
            let expired = now.saturating_duration_since(f.sent_at) > IN_FLIGHT_TIMEOUT;
            if expired {
                expired_total += f.size;
            }
            !expired
        });
        self.in_flight_total = self.in_flight_total.saturating_sub(expired_total);
    }

    pub(crate) fn set_pacer_queue(&mut self, bytes: DataSize) {
        self.pacer_queue = bytes;
    }

    pub(crate) fn in_flight(&self) -> DataSize {
        self.in_flight_total
    }

    /// The current allowed-in-flight window.
    pub(crate) fn window(&self, target: Bitrate, rtt: Option<Duration>) -> DataSize {
        let rtt = rtt.unwrap_or(DEFAULT_RTT);
        let window = target * (rtt + self.margin);

        window.max(MIN_WINDOW)
    }

    /// Update the pushback state for this tick and cap the target rate.
    ///
    /// Call once per tick/feedback batch: the multiplicative ratchet assumes a
    /// steady cadence.
    pub(crate) fn apply(
        &mut self,
        target: Bitrate,
        rtt: Option<Duration>,
        min_bitrate: Bitrate,
    ) -> Bitrate {
        if !self.enabled {
            return target;
        }

        let window = self.window(target, rtt);
        let total = self.in_flight_total + self.pacer_queue;
        let fill_ratio = total.as_bytes_f64() / window.as_bytes_f64();
        log_congestion_window_fill!(fill_ratio);

        if fill_ratio > 1.5 {
            self.ratio *= 0.9;
        } else if fill_ratio > 1.0 {
            self.ratio *= 0.95;
        } else if fill_ratio < 0.1 {
            self.ratio = 1.0;
        } else {
            self.ratio = (self.ratio * 1.05).min(1.0);
        }

        if self.ratio < 1.0 {
            trace!(
                ratio = self.ratio,
                fill = fill_ratio,
                "Congestion window pushback active"
            );
        }

        let adjusted = target * self.ratio;

        // Don't push the rate below the floor where media would stall
        // entirely, and never below the configured minimum.
        adjusted.max(MIN_PUSHBACK_BITRATE).max(min_bitrate).min(target)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sent(window: &mut CongestionWindow, seq: u64, bytes: u64, now: Instant) {
        window.on_packet_sent(seq.into(), DataSize::bytes(bytes), now);
    }

    fn feedback(seq: u64, base: Instant) -> PacketFeedback {
        PacketFeedback {
            seq: seq.into(),
            size: DataSize::bytes(1200),
            local_send_time: base,
            remote_recv_time: Some(base + Duration::from_millis(20)),
            cluster: None,
        }
    }

    #[test]
    fn window_follows_rate_and_rtt() {
        let window = CongestionWindow::new(true, Duration::from_millis(100));

        // 1 Mbps * 150ms = 18750 bytes
        let w = window.window(Bitrate::mbps(1), Some(Duration::from_millis(50)));
        assert_eq!(w, DataSize::bytes(18750));
    }

    #[test]
    fn window_has_floor() {
        let window = CongestionWindow::new(true, Duration::from_millis(100));

        let w = window.window(Bitrate::kbps(10), Some(Duration::from_millis(10)));
        assert_eq!(w, MIN_WINDOW);
    }

    #[test]
    fn in_flight_accounting() {
        let now = Instant::now();
        let mut window = CongestionWindow::new(true, Duration::from_millis(100));

        sent(&mut window, 1, 1200, now);
        sent(&mut window, 2, 1200, now);
        assert_eq!(window.in_flight(), DataSize::bytes(2400));

        window.on_feedback(&[feedback(1, now)]);
        assert_eq!(window.in_flight(), DataSize::bytes(1200));

        // Unreported packets expire eventually.
        window.expire(now + Duration::from_secs(3));
        assert_eq!(window.in_flight(), DataSize::ZERO);
    }

    #[test]
    fn overshoot_caps_rate() {
        let now = Instant::now();
        let mut window = CongestionWindow::new(true, Duration::from_millis(100));

        // Window for 1 Mbps at default RTT is 25000 bytes. Put 2x that in flight.
        for seq in 0..42 {
            sent(&mut window, seq, 1200, now);
        }

        let capped = window.apply(Bitrate::mbps(1), None, Bitrate::kbps(30));
        assert!(capped < Bitrate::mbps(1));

        // Repeated overshoot keeps ratcheting down.
        let capped2 = window.apply(Bitrate::mbps(1), None, Bitrate::kbps(30));
        assert!(capped2 < capped);
    }

    #[test]
    fn drained_queue_recovers_rate() {
        let now = Instant::now();
        let mut window = CongestionWindow::new(true, Duration::from_millis(100));

        for seq in 0..42 {
            sent(&mut window, seq, 1200, now);
        }
        let capped = window.apply(Bitrate::mbps(1), None, Bitrate::kbps(30));
        assert!(capped < Bitrate::mbps(1));

        // Everything acked, nothing outstanding.
        let acks: Vec<_> = (0..42).map(|seq| feedback(seq, now)).collect();
        window.on_feedback(&acks);

        let recovered = window.apply(Bitrate::mbps(1), None, Bitrate::kbps(30));
        assert_eq!(recovered, Bitrate::mbps(1));
    }

    #[test]
    fn pacer_queue_counts_toward_fill() {
        let mut window = CongestionWindow::new(true, Duration::from_millis(100));

        window.set_pacer_queue(DataSize::bytes(50_000));

        let capped = window.apply(Bitrate::mbps(1), None, Bitrate::kbps(30));
        assert!(capped < Bitrate::mbps(1));
    }

    #[test]
    fn disabled_never_caps() {
        let now = Instant::now();
        let mut window = CongestionWindow::new(false, Duration::from_millis(100));

        for seq in 0..100 {
            sent(&mut window, seq, 1200, now);
        }

        let capped = window.apply(Bitrate::kbps(500), None, Bitrate::kbps(30));
        assert_eq!(capped, Bitrate::kbps(500));
    }

    #[test]
    fn capped_rate_never_below_min_bitrate() {
        let now = Instant::now();
        let mut window = CongestionWindow::new(true, Duration::from_millis(100));

        for seq in 0..200 {
            sent(&mut window, seq, 1200, now);
        }

        let mut capped = Bitrate::kbps(100);
        for _ in 0..100 {
            capped = window.apply(Bitrate::kbps(100), None, Bitrate::kbps(50));
        }

        assert_eq!(capped, Bitrate::kbps(50));
    }
}
