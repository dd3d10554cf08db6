use std::fmt;
use std::time::Duration;

use crate::units::{Bitrate, DataSize};

/// Identifies a probe cluster.
///
/// Ids are unique and monotonically increasing over the lifetime of a
/// controller, also across route changes. Feedback referencing an id whose
/// cluster state has been invalidated is silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeClusterId(u64);

impl ProbeClusterId {
    /// This id as a u64.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ProbeClusterId {
    fn from(value: u64) -> Self {
        ProbeClusterId(value)
    }
}

impl fmt::Display for ProbeClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a probe cluster was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProbeKind {
    /// Part of the initial sequence at session start.
    Initial,
    /// Scheduled because the path changed.
    RouteChange,
    /// Follow-up after a previous probe confirmed headroom.
    Further,
}

/// Configuration for a probe cluster (the plan).
///
/// The immutable blueprint for a bandwidth probe: what bitrate to burst at,
/// for how long, and what the receiver must report back for the measurement
/// to count. Realizing the burst on the wire is the pacer's job.
#[derive(Debug, Clone, Copy)]
pub struct ProbeClusterConfig {
    /// Unique identifier for this probe cluster.
    cluster: ProbeClusterId,

    /// Target bitrate to probe at.
    target_bitrate: Bitrate,

    /// How long to sustain the target bitrate.
    target_duration: Duration,

    /// Minimum number of packets to send.
    /// This ensures statistical validity even for short bursts.
    min_packet_count: usize,

    /// Deadline for the measurement. A cluster whose feedback has not
    /// validated by this long after the probe started is failed.
    timeout: Duration,

    /// The kind of probe this is.
    kind: ProbeKind,
}

impl ProbeClusterConfig {
    /// Create a new probe cluster configuration with standard defaults:
    /// - 15ms duration (enough to get meaningful feedback without excessive delay)
    /// - 5 minimum packets (statistical significance for analysis)
    /// - 3s result deadline
    pub(crate) fn new(cluster: ProbeClusterId, target_bitrate: Bitrate, kind: ProbeKind) -> Self {
        Self {
            cluster,
            target_bitrate,
            target_duration: Duration::from_millis(15),
            min_packet_count: 5,
            timeout: Duration::from_secs(3),
            kind,
        }
    }

    /// Get the probe cluster ID.
    pub fn cluster(&self) -> ProbeClusterId {
        self.cluster
    }

    /// Get the target bitrate.
    pub fn target_bitrate(&self) -> Bitrate {
        self.target_bitrate
    }

    /// Get the minimum packet count required for a valid probe.
    pub fn min_packet_count(&self) -> usize {
        self.min_packet_count
    }

    /// How long the pacer should sustain the target bitrate.
    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    /// Deadline for the measurement, relative to probe start.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The kind of probe this is.
    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    /// Calculate the target bytes for this probe.
    /// This is how much data we expect to send at target_bitrate for target_duration.
    pub fn target_bytes(&self) -> DataSize {
        self.target_bitrate * self.target_duration
    }
}
