use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::probe::ProbeClusterId;
use crate::units::DataSize;

/// Transport-wide sequence number for a sent packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNo(u64);

impl SeqNo {
    /// This sequence number as a u64.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn as_u16(&self) -> u16 {
        self.0 as u16
    }
}

impl From<u64> for SeqNo {
    fn from(value: u64) -> Self {
        SeqNo(value)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One transport feedback record for a sent packet.
///
/// This is the logical form of the receiver's per-packet report. The wire
/// encoding is the transport's concern, records are handed to the controller
/// already parsed, in batches.
#[derive(Debug, Clone, Copy)]
pub struct PacketFeedback {
    /// The transport-wide sequence number.
    pub seq: SeqNo,
    /// The size of the packet in bytes.
    pub size: DataSize,
    /// When we sent the packet.
    pub local_send_time: Instant,
    /// When the packet was received at the remote, or `None` if it was
    /// reported lost.
    ///
    /// Note this Instant is only usable with other instants of the same type,
    /// i.e. those that represent a reported receive time for this session.
    pub remote_recv_time: Option<Instant>,
    /// The probe cluster the packet was sent in, if any.
    pub cluster: Option<ProbeClusterId>,
}

/// A packet that has been sent and acknowledged by the receiver.
#[derive(Debug, Copy, Clone)]
pub(crate) struct AckedPacket {
    /// The transport-wide sequence number.
    pub seq: SeqNo,
    /// The size of the packet in bytes.
    pub size: DataSize,
    /// When we sent the packet.
    pub local_send_time: Instant,
    /// When the packet was received at the remote.
    pub remote_recv_time: Instant,
    /// The local time when we received confirmation that the other side
    /// received the packet i.e. when the feedback batch arrived.
    pub local_recv_time: Instant,
}

impl AckedPacket {
    pub(crate) fn rtt(&self) -> Duration {
        self.local_recv_time - self.local_send_time
    }

    pub(crate) fn order_by_receive_time(lhs: &Self, rhs: &Self) -> Ordering {
        if lhs.remote_recv_time != rhs.remote_recv_time {
            lhs.remote_recv_time.cmp(&rhs.remote_recv_time)
        } else if lhs.local_send_time != rhs.local_send_time {
            lhs.local_send_time.cmp(&rhs.local_send_time)
        } else {
            lhs.seq.cmp(&rhs.seq)
        }
    }
}

/// Derived observations for one feedback batch.
#[derive(Debug, Default)]
pub(crate) struct FeedbackSummary {
    /// Acked packets, ordered by remote receive time.
    pub acked: Vec<AckedPacket>,
    /// Number of records that participated in the loss calculation.
    pub packet_count: usize,
    /// Number of records reported lost.
    pub lost_count: usize,
}

impl FeedbackSummary {
    pub(crate) fn loss_ratio(&self) -> f64 {
        if self.packet_count == 0 {
            0.0
        } else {
            self.lost_count as f64 / self.packet_count as f64
        }
    }
}

/// Turns raw feedback batches into ordered delay samples and a loss sample.
///
/// Malformed records (receive time before send time) and packets we have
/// already processed in an earlier batch are dropped without mutating any
/// estimator state. Drops are counted for observability.
#[derive(Debug)]
pub(crate) struct FeedbackProcessor {
    handled: HandledPacketsTracker<256>,
    dropped: u64,
}

impl FeedbackProcessor {
    pub(crate) fn new() -> Self {
        Self {
            handled: HandledPacketsTracker::default(),
            dropped: 0,
        }
    }

    /// Number of records dropped as malformed or duplicate.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn process(&mut self, records: &[PacketFeedback], now: Instant) -> FeedbackSummary {
        let mut summary = FeedbackSummary::default();
        summary.acked.reserve(records.len());

        for record in records {
            let Some(remote_recv_time) = record.remote_recv_time else {
                summary.packet_count += 1;
                summary.lost_count += 1;
                continue;
            };

            if remote_recv_time < record.local_send_time {
                trace!(seq = %record.seq, "Dropping feedback record with receive time before send time");
                self.dropped += 1;
                continue;
            }

            if self.handled.contains(record.seq) {
                trace!(seq = %record.seq, "Dropping feedback record already processed");
                self.dropped += 1;
                continue;
            }
            self.handled.add(record.seq);

            let acked = AckedPacket {
                seq: record.seq,
                size: record.size,
                local_send_time: record.local_send_time,
                remote_recv_time,
                local_recv_time: now,
            };

            summary.packet_count += 1;
            summary.acked.push(acked);
        }

        summary.acked.sort_by(AckedPacket::order_by_receive_time);

        summary
    }
}

/// Sliding window [`SeqNo`] storage.
///
/// Only remembers the last [`SIZE`] packets added.
#[derive(Debug)]
struct HandledPacketsTracker<const SIZE: usize> {
    /// Recently added packets.
    history: [Option<u16>; SIZE],

    /// Queue that tracks added packets order so older packets are removed.
    queue: VecDeque<u16>,
}

impl<const SIZE: usize> HandledPacketsTracker<SIZE> {
    /// Remembers the given [`SeqNo`].
    ///
    /// Expects somewhat sequential data with reordering no more than the
    /// configured [`SIZE`].
    fn add(&mut self, seq: SeqNo) {
        let seq = seq.as_u16();
        let history_idx = seq as usize % SIZE;

        self.queue.push_back(seq);
        if self.queue.len() == SIZE {
            let to_remove = self.queue.pop_front().unwrap();
            let remove_idx = to_remove as usize % SIZE;
            if self.history[remove_idx] == Some(to_remove) {
                self.history[remove_idx] = None;
            }
        }
        self.history[history_idx] = Some(seq);
    }

    /// Checks if the provided [`SeqNo`] has been seen in the window.
    fn contains(&self, seq: SeqNo) -> bool {
        let seq = seq.as_u16();
        let history_idx = seq as usize % SIZE;

        self.history[history_idx] == Some(seq)
    }
}

impl<const SIZE: usize> Default for HandledPacketsTracker<SIZE> {
    fn default() -> Self {
        Self {
            history: [None; SIZE],
            queue: VecDeque::with_capacity(SIZE),
        }
    }
}
