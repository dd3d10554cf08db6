use std::mem;
use std::time::{Duration, Instant};

use crate::feedback::{AckedPacket, SeqNo};
use crate::time::{TimeDelta, Timestamp};

const BURST_TIME_INTERVAL: Duration = Duration::from_millis(5);
const SEND_TIME_GROUP_LENGTH: Duration = Duration::from_millis(5);
const MAX_BURST_DURATION: Duration = Duration::from_millis(100);

/// A group of packets sent closely together.
///
/// Delay variation is measured between groups rather than individual packets
/// to filter out the sender's own burstiness.
#[derive(Debug, Default)]
pub(crate) struct ArrivalGroup {
    first: Option<(SeqNo, Instant, Instant)>,
    last_seq_no: Option<SeqNo>,
    last_local_send_time: Option<Instant>,
    last_remote_recv_time: Option<Instant>,
    size: usize,
}

impl ArrivalGroup {
    /// Maybe add a packet to the group.
    ///
    /// Returns [`true`] if a new group needs to be created and [`false`] otherwise.
    fn add_packet(&mut self, packet: &AckedPacket) -> bool {
        match self.belongs_to_group(packet) {
            Belongs::NewGroup => return true,
            Belongs::Skipped => return false,
            Belongs::Yes => {}
        }

        if self.first.is_none() {
            self.first = Some((packet.seq, packet.local_send_time, packet.remote_recv_time));
        }

        self.last_remote_recv_time = self
            .last_remote_recv_time
            .max(Some(packet.remote_recv_time));
        self.last_local_send_time = self.last_local_send_time.max(Some(packet.local_send_time));
        self.size += 1;
        self.last_seq_no = self.last_seq_no.max(Some(packet.seq));

        false
    }

    fn belongs_to_group(&self, packet: &AckedPacket) -> Belongs {
        let Some((_, first_local_send_time, first_remote_recv_time)) = self.first else {
            // Start of the group
            return Belongs::Yes;
        };

        let Some(first_send_delta) = packet
            .local_send_time
            .checked_duration_since(first_local_send_time)
        else {
            // Out of order
            return Belongs::Skipped;
        };

        let send_time_delta = Timestamp::from(packet.local_send_time) - self.local_send_time();
        if send_time_delta == TimeDelta::ZERO {
            return Belongs::Yes;
        }
        let arrival_time_delta = Timestamp::from(packet.remote_recv_time) - self.remote_recv_time();

        let propagation_delta = arrival_time_delta - send_time_delta;
        if propagation_delta < TimeDelta::ZERO
            && arrival_time_delta <= BURST_TIME_INTERVAL
            && packet.remote_recv_time - first_remote_recv_time < MAX_BURST_DURATION
        {
            Belongs::Yes
        } else if first_send_delta > SEND_TIME_GROUP_LENGTH {
            Belongs::NewGroup
        } else {
            Belongs::Yes
        }
    }

    /// Calculate the send time delta between self and a subsequent group.
    fn departure_delta(&self, other: &Self) -> TimeDelta {
        Timestamp::from(other.local_send_time()) - self.local_send_time()
    }

    /// Calculate the remote receive time delta between self and a subsequent group.
    fn arrival_delta(&self, other: &Self) -> TimeDelta {
        Timestamp::from(other.remote_recv_time()) - self.remote_recv_time()
    }

    /// The local send time i.e. departure time, for the group.
    ///
    /// Panics if the group doesn't have at least one packet.
    fn local_send_time(&self) -> Instant {
        self.last_local_send_time
            .expect("local_send_time to only be called on non-empty groups")
    }

    /// The remote receive time i.e. arrival time, for the group.
    ///
    /// Panics if the group doesn't have at least one packet.
    fn remote_recv_time(&self) -> Instant {
        self.last_remote_recv_time
            .expect("remote_recv_time to only be called on non-empty groups")
    }
}

/// Whether a given packet belongs to a group or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Belongs {
    /// The packet belongs to the group.
    Yes,
    /// The packet does not belong to the group, a new group should be created.
    NewGroup,
    /// The packet was skipped and a decision wasn't made.
    Skipped,
}

#[derive(Debug, Default)]
pub(crate) struct ArrivalGroupAccumulator {
    previous_group: Option<ArrivalGroup>,
    current_group: ArrivalGroup,
}

impl ArrivalGroupAccumulator {
    /// Accumulate a packet.
    ///
    /// If adding this packet produced a new delay delta it is returned.
    pub(crate) fn accumulate_packet(
        &mut self,
        packet: &AckedPacket,
    ) -> Option<InterGroupDelayDelta> {
        let need_new_group = self.current_group.add_packet(packet);

        if !need_new_group {
            return None;
        }

        // Variation between previous group and current.
        let arrival_delta = self.arrival_delta();
        let send_delta = self.send_delta();
        let last_remote_recv_time = self.current_group.remote_recv_time();

        let current_group = mem::take(&mut self.current_group);
        self.previous_group = Some(current_group);

        self.current_group.add_packet(packet);

        Some(InterGroupDelayDelta {
            send_delta: send_delta?,
            arrival_delta: arrival_delta?,
            last_remote_recv_time,
        })
    }

    fn arrival_delta(&self) -> Option<TimeDelta> {
        self.previous_group
            .as_ref()
            .map(|prev| prev.arrival_delta(&self.current_group))
    }

    fn send_delta(&self) -> Option<TimeDelta> {
        self.previous_group
            .as_ref()
            .map(|prev| prev.departure_delta(&self.current_group))
    }
}

/// The calculated delay delta between two groups of packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InterGroupDelayDelta {
    /// The delta between the send times of the two groups i.e. delta between the last packet sent
    /// in each group.
    pub(crate) send_delta: TimeDelta,
    /// The delta between the remote arrival times of the two groups.
    pub(crate) arrival_delta: TimeDelta,
    /// The reported receive time for the last packet in the first arrival group.
    pub(crate) last_remote_recv_time: Instant,
}

impl InterGroupDelayDelta {
    /// The delay gradient, in milliseconds.
    pub(crate) fn delay_ms(&self) -> f64 {
        (self.arrival_delta - self.send_delta).as_millis_f64()
    }
}

#[cfg(test)]
mod test {
    use crate::units::DataSize;

    use super::*;

    fn acked(seq: u64, send_ms: u64, recv_ms: u64, base: Instant) -> AckedPacket {
        AckedPacket {
            seq: seq.into(),
            size: DataSize::bytes(1200),
            local_send_time: base + Duration::from_millis(send_ms),
            remote_recv_time: base + Duration::from_millis(recv_ms),
            local_recv_time: base + Duration::from_millis(recv_ms + 10),
        }
    }

    #[test]
    fn no_delta_within_first_group() {
        let base = Instant::now();
        let mut accumulator = ArrivalGroupAccumulator::default();

        // All within the 5ms send window, one group.
        assert!(accumulator.accumulate_packet(&acked(1, 0, 20, base)).is_none());
        assert!(accumulator.accumulate_packet(&acked(2, 2, 22, base)).is_none());
        assert!(accumulator.accumulate_packet(&acked(3, 4, 24, base)).is_none());
    }

    #[test]
    fn delta_between_second_and_third_group() {
        let base = Instant::now();
        let mut accumulator = ArrivalGroupAccumulator::default();

        // First group.
        assert!(accumulator.accumulate_packet(&acked(1, 0, 20, base)).is_none());
        assert!(accumulator.accumulate_packet(&acked(2, 3, 23, base)).is_none());

        // Starts the second group, no previous pair yet.
        assert!(accumulator.accumulate_packet(&acked(3, 10, 30, base)).is_none());
        assert!(accumulator.accumulate_packet(&acked(4, 13, 34, base)).is_none());

        // Starts the third group, producing a delta between groups one and two.
        let delta = accumulator
            .accumulate_packet(&acked(5, 20, 45, base))
            .expect("delta between first two groups");

        assert_eq!(delta.send_delta, TimeDelta::from_millis(10));
        assert_eq!(delta.arrival_delta, TimeDelta::from_millis(11));
        assert_eq!(delta.delay_ms(), 1.0);
    }

    #[test]
    fn out_of_order_packet_is_skipped() {
        let base = Instant::now();
        let mut accumulator = ArrivalGroupAccumulator::default();

        assert!(accumulator.accumulate_packet(&acked(2, 10, 30, base)).is_none());
        // Sent before the first packet of the current group.
        assert!(accumulator.accumulate_packet(&acked(1, 2, 31, base)).is_none());

        // The skipped packet must not have extended the group.
        assert_eq!(accumulator.current_group.size, 1);
    }

    #[test]
    fn negative_delay_delta() {
        let base = Instant::now();
        let mut accumulator = ArrivalGroupAccumulator::default();

        assert!(accumulator.accumulate_packet(&acked(1, 0, 40, base)).is_none());
        // Second group arrives compressed, i.e. queues draining.
        assert!(accumulator.accumulate_packet(&acked(2, 10, 47, base)).is_none());

        let delta = accumulator
            .accumulate_packet(&acked(3, 20, 54, base))
            .expect("delta between first two groups");

        assert_eq!(delta.send_delta, TimeDelta::from_millis(10));
        assert_eq!(delta.arrival_delta, TimeDelta::from_millis(7));
        assert_eq!(delta.delay_ms(), -3.0);
    }
}
