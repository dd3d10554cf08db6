//! Sans-IO bandwidth estimation and congestion control for real-time media.
//!
//! This crate estimates a safe sending bitrate for an interactive media
//! transport over an unpredictable network path, adapting within milliseconds
//! to capacity changes, delay growth, packet loss and route changes, while
//! avoiding self-induced queue buildup. The approach follows GoogCC-style
//! send side bandwidth estimation as described in
//! <https://datatracker.ietf.org/doc/html/draft-ietf-rmcat-gcc-02>:
//!
//! - Delay-based control (trendline estimator with AIMD rate control)
//! - Loss-based control (bucketed loss ratio thresholds)
//! - Active bandwidth probing with validated probe clusters
//! - Congestion window pushback against queue buildup
//! - Safe or hard reset policies over network route changes
//!
//! # Sans I/O
//!
//! The [`NetworkController`] does no network talking and has no internal
//! threads or async tasks. All operations happen from calls of the public
//! API, and all time is injected as [`std::time::Instant`] arguments. This
//! keeps every run over recorded input deterministic, which is how the crate
//! is tested against simulated links.
//!
//! # Run loop
//!
//! ```no_run
//! use std::time::Instant;
//! use netbwe::{Config, NetworkController, Output};
//!
//! let mut controller = NetworkController::new(Config::new()).unwrap();
//!
//! loop {
//!     let now = Instant::now();
//!
//!     // Feed inputs as they arrive from the transport:
//!     // controller.handle_feedback(&records, now);
//!     // controller.handle_packet_sent(seq, size, now);
//!     // controller.handle_route_change(route, now);
//!
//!     // Drive the timers.
//!     if now >= controller.poll_timeout() {
//!         controller.handle_timeout(now);
//!     }
//!
//!     // Act on the decisions.
//!     while let Some(output) = controller.poll_output() {
//!         match output {
//!             Output::TargetUpdate(update) => {
//!                 // Reconfigure the pacer/encoder with update.send_bitrate,
//!                 // update.pacing_bitrate and update.congestion_window.
//!             }
//!             Output::ProbeCluster(config) => {
//!                 // Hand to the pacer to realize on the wire, confirming
//!                 // with start_probe()/end_probe().
//!             }
//!         }
//!     }
//! #   break;
//! }
//! ```
//!
//! The embedding event loop owns the controller; feedback produced
//! concurrently by network I/O must be marshalled into that single context
//! before being applied.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![allow(clippy::new_without_default)]

#[macro_use]
extern crate tracing;

mod acked_bitrate;
mod arrival_group;
mod config;
mod controller;
mod delay;
mod feedback;
mod loss;
mod macros;
mod probe;
mod pushback;
mod rate_control;
mod route;
mod time;
mod trendline;
mod units;

pub use config::{Config, ConfigError};
pub use controller::{NetworkController, Output, TargetRateUpdate};
pub use feedback::{PacketFeedback, SeqNo};
pub use probe::{ProbeClusterConfig, ProbeClusterId, ProbeKind, ProbeScaling};
pub use route::NetworkRoute;
pub use units::{Bitrate, DataSize};

/// Log a CSV like stat to stdout.
///
/// ```ignore
/// log_stat!("MY_STAT", 1, "hello", 3);
/// ```
///
/// will result in the following being printed
///
/// ```text
/// MY_STAT 1, hello, 3, {unix_timestamp_ms}
/// ````
///
/// These logs can be easily grepped for, parsed and graphed, or otherwise analyzed.
///
/// This macro turns into a NO-OP if the `_internal_dont_use_log_stats` feature is not enabled
macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        #[cfg(feature = "_internal_dont_use_log_stats")]
        {
            use std::time::SystemTime;
            use std::io::{self, Write};

            let now = SystemTime::now();
            let since_epoch = now.duration_since(SystemTime::UNIX_EPOCH).unwrap();
            let unix_time_ms = since_epoch.as_millis();
            let mut lock = io::stdout().lock();
            write!(lock, "{} ", $name).expect("Failed to write to stdout");

            $(
                write!(lock, "{},", $arg).expect("Failed to write to stdout");
            )+
            writeln!(lock, "{}", unix_time_ms).expect("Failed to write to stdout");
        }
    };
}
pub(crate) use log_stat;
