use std::time::Duration;

use thiserror::Error;

use crate::probe::ProbeScaling;
use crate::units::Bitrate;

/// Errors from validating a [`Config`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The minimum bitrate is above the maximum.
    #[error("min bitrate {min} above max bitrate {max}")]
    InvalidBounds {
        /// The configured minimum.
        min: Bitrate,
        /// The configured maximum.
        max: Bitrate,
    },

    /// The start bitrate falls outside [min, max].
    #[error("start bitrate {start} outside [{min}, {max}]")]
    StartOutOfBounds {
        /// The configured start rate.
        start: Bitrate,
        /// The configured minimum.
        min: Bitrate,
        /// The configured maximum.
        max: Bitrate,
    },

    /// The pacing factor must be at least 1.0.
    #[error("pacing factor {0} below 1.0")]
    InvalidPacingFactor(f64),

    /// The probe scaling parameters are not usable.
    #[error("invalid probe scaling: {0}")]
    InvalidProbeScaling(&'static str),
}

/// Configuration for a [`NetworkController`][crate::NetworkController].
///
/// Use the builder pattern to configure the controller:
///
/// ```
/// use netbwe::{Bitrate, Config};
///
/// let config = Config::new()
///     .start_bitrate(Bitrate::kbps(300))
///     .max_bitrate(Bitrate::mbps(5))
///     .safe_reset(true)
///     .pushback(true);
/// ```
///
/// Validation happens when the config is handed to the controller. Invalid
/// combinations are rejected there and the previous configuration stays
/// active.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub(crate) min_bitrate: Bitrate,
    pub(crate) max_bitrate: Bitrate,
    pub(crate) start_bitrate: Bitrate,
    pub(crate) safe_reset: bool,
    pub(crate) pushback: bool,
    pub(crate) pushback_margin: Duration,
    pub(crate) pacing_factor: f64,
    pub(crate) probe_scaling: ProbeScaling,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self {
            min_bitrate: Bitrate::kbps(30),
            max_bitrate: Bitrate::gbps(10),
            start_bitrate: Bitrate::kbps(300),
            safe_reset: false,
            pushback: false,
            pushback_margin: Duration::from_millis(100),
            pacing_factor: 2.5,
            probe_scaling: ProbeScaling::default(),
        }
    }

    /// The lowest target rate the controller will ever emit.
    pub fn min_bitrate(mut self, v: Bitrate) -> Self {
        self.min_bitrate = v;
        self
    }

    /// The highest target rate the controller will ever emit.
    pub fn max_bitrate(mut self, v: Bitrate) -> Self {
        self.max_bitrate = v;
        self
    }

    /// The rate to start from before any feedback has arrived, and to fall
    /// back toward on route changes.
    pub fn start_bitrate(mut self, v: Bitrate) -> Self {
        self.start_bitrate = v;
        self
    }

    /// Retain estimator state over route changes instead of restarting from
    /// scratch. See the reset policy on route changes.
    pub fn safe_reset(mut self, v: bool) -> Self {
        self.safe_reset = v;
        self
    }

    /// Cap instantaneous sending when bytes in flight overshoot the
    /// congestion window.
    pub fn pushback(mut self, v: bool) -> Self {
        self.pushback = v;
        self
    }

    /// Margin added to the RTT when sizing the congestion window.
    pub fn pushback_margin(mut self, v: Duration) -> Self {
        self.pushback_margin = v;
        self
    }

    /// Multiple of the target rate the pacer is asked to pace at. Values
    /// above 1.0 leave headroom to drain bursts and realize probes.
    pub fn pacing_factor(mut self, v: f64) -> Self {
        self.pacing_factor = v;
        self
    }

    /// Scaling factors for the probing schedule.
    pub fn probe_scaling(mut self, v: ProbeScaling) -> Self {
        self.probe_scaling = v;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.min_bitrate > self.max_bitrate {
            return Err(ConfigError::InvalidBounds {
                min: self.min_bitrate,
                max: self.max_bitrate,
            });
        }

        if self.start_bitrate < self.min_bitrate || self.start_bitrate > self.max_bitrate {
            return Err(ConfigError::StartOutOfBounds {
                start: self.start_bitrate,
                min: self.min_bitrate,
                max: self.max_bitrate,
            });
        }

        if self.pacing_factor < 1.0 {
            return Err(ConfigError::InvalidPacingFactor(self.pacing_factor));
        }

        let scaling = &self.probe_scaling;
        if scaling.first_scale <= 0.0 || scaling.second_scale < scaling.first_scale {
            return Err(ConfigError::InvalidProbeScaling(
                "sequence scales must be positive and non-decreasing",
            ));
        }
        if scaling.further_scale <= 1.0 {
            return Err(ConfigError::InvalidProbeScaling(
                "further scale must be above 1.0",
            ));
        }
        if scaling.further_threshold <= 0.0 || scaling.further_threshold > 1.0 {
            return Err(ConfigError::InvalidProbeScaling(
                "further threshold must be in (0, 1]",
            ));
        }

        Ok(())
    }
}
