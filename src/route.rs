use crate::units::Bitrate;

/// An opaque network path identifier with optional known bounds.
///
/// The session layer enumerates routes; the controller only needs to know
/// when the path changed and what, if anything, is known about the new one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkRoute {
    /// Identifies the path. A differing id is a route change.
    pub id: u64,
    /// A known lower bound for the new path's bitrate, if any.
    pub min_bitrate: Option<Bitrate>,
    /// A start bitrate for the new path, overriding the configured one.
    pub start_bitrate: Option<Bitrate>,
}

impl NetworkRoute {
    /// A route known only by its id.
    pub fn new(id: u64) -> Self {
        NetworkRoute {
            id,
            min_bitrate: None,
            start_bitrate: None,
        }
    }
}

/// What to do with estimator state when the path changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetPolicy {
    /// Discard estimator state and restart from the configured start rate.
    Hard,
    /// Retain estimator internals. The rate may only move toward the start
    /// value, never be raised without a subsequent confirmed probe.
    Safe,
}

/// The outcome of applying the reset policy to a route change.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RouteReset {
    /// The target rate to continue from on the new path.
    pub target: Bitrate,
    /// Whether estimator internals should be discarded.
    pub hard: bool,
}

/// Applies the configured reset policy when the network path changes.
///
/// Every applied change bumps the generation counter, which invalidates
/// probe clusters belonging to the superseded path.
#[derive(Debug)]
pub(crate) struct RouteChangeHandler {
    policy: ResetPolicy,
    current: Option<u64>,
    generation: u64,
}

impl RouteChangeHandler {
    pub(crate) fn new(policy: ResetPolicy) -> Self {
        Self {
            policy,
            current: None,
            generation: 0,
        }
    }

    pub(crate) fn set_policy(&mut self, policy: ResetPolicy) {
        self.policy = policy;
    }

    /// The number of route changes seen so far.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply a route change.
    ///
    /// Returns `None` if the route is the one we are already on.
    pub(crate) fn apply(
        &mut self,
        route: &NetworkRoute,
        prev_estimate: Option<Bitrate>,
        configured_start: Bitrate,
        configured_min: Bitrate,
    ) -> Option<RouteReset> {
        if self.current == Some(route.id) {
            return None;
        }

        let first_route = self.current.is_none();
        self.current = Some(route.id);
        self.generation += 1;

        let start = route.start_bitrate.unwrap_or(configured_start);

        if first_route {
            // Nothing learned yet that could be kept or discarded.
            return Some(RouteReset {
                target: start,
                hard: false,
            });
        }

        let reset = match self.policy {
            ResetPolicy::Hard => RouteReset {
                target: start,
                hard: true,
            },
            ResetPolicy::Safe => {
                // The new path's capacity is unknown: a previously low rate is
                // kept, a previously high rate is cut toward the start value.
                // Only a confirmed probe may raise it again.
                let floor = start.max(route.min_bitrate.unwrap_or(configured_min));
                let target = prev_estimate.unwrap_or(start).min(floor);

                RouteReset {
                    target,
                    hard: false,
                }
            }
        };

        debug!(
            route = route.id,
            generation = self.generation,
            target = %reset.target,
            hard = reset.hard,
            "Route change"
        );

        Some(reset)
    }
}
