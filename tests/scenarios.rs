//! Scenario tests for the bandwidth controller under simulated network conditions.
//!
//! The simulator is a small sans-IO bottleneck link: packets go in with
//! timestamps, rate limiting and propagation delay decide when they come out,
//! and feedback batches are generated on a fixed cadence like a transport
//! feedback channel would. Everything is driven from a virtual clock, so runs
//! are fully deterministic.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use netbwe::{
    Bitrate, Config, DataSize, NetworkController, NetworkRoute, Output, PacketFeedback,
    ProbeClusterConfig, SeqNo,
};

pub fn init_log() {
    use std::sync::Once;
    static START: Once = Once::new();

    START.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// How often the receiver reports back, like a TWCC channel.
const FEEDBACK_INTERVAL: Duration = Duration::from_millis(100);

/// A sent packet not arrived after this long is reported lost.
const LOST_AFTER: Duration = Duration::from_millis(500);

/// Media frame cadence of the simulated sender.
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

const MAX_PACKET: u64 = 1200;

#[derive(Debug, Clone, Copy)]
struct LinkConfig {
    capacity: Bitrate,
    delay: Duration,
}

struct SentRecord {
    send_time: Instant,
    size: DataSize,
    cluster: Option<netbwe::ProbeClusterId>,
    arrival: Option<Instant>,
    reported: bool,
}

struct ActiveProbe {
    config: ProbeClusterConfig,
    bytes_left: u64,
    packet_size: u64,
    packets_sent: usize,
    next_send: Instant,
}

/// Drives a [`NetworkController`] against a simulated bottleneck link.
struct Simulator {
    controller: NetworkController,
    base: Instant,
    now: Instant,

    link: LinkConfig,
    route_id: u64,
    /// Virtual time when the link is done transmitting queued packets.
    busy_until: Instant,
    /// Seeded jitter applied to the propagation delay.
    jitter: Option<(fastrand::Rng, Duration)>,

    next_seq: u64,
    sent: BTreeMap<u64, SentRecord>,

    media_rate: Bitrate,
    pacing_rate: Bitrate,
    producer_on: bool,
    next_frame: Instant,
    frame_count: u64,
    keyframe_every: Option<u64>,
    keyframe_scale: u64,

    pacer_queue: VecDeque<(Instant, DataSize)>,
    pacer_queue_bytes: u64,
    pacer_budget: f64,

    probe_queue: VecDeque<ProbeClusterConfig>,
    active_probe: Option<ActiveProbe>,

    next_feedback: Instant,
    pending_feedback: VecDeque<(Instant, Vec<PacketFeedback>)>,

    min_bitrate: Bitrate,
    max_bitrate: Bitrate,

    /// (millis since base, send, pacing, congestion window) per emitted update.
    updates: Vec<(u64, u64, u64, u64)>,
    pacer_delay_samples: VecDeque<(Instant, Duration)>,
}

impl Simulator {
    fn new(config: Config, link: LinkConfig, base: Instant) -> Self {
        let min_bitrate = Bitrate::kbps(30);
        let max_bitrate = Bitrate::gbps(10);
        let config = config.min_bitrate(min_bitrate).max_bitrate(max_bitrate);
        let controller = NetworkController::new(config).expect("valid config");

        Simulator {
            controller,
            base,
            now: base,
            link,
            route_id: 1,
            busy_until: base,
            jitter: None,
            next_seq: 0,
            sent: BTreeMap::new(),
            media_rate: Bitrate::ZERO,
            pacing_rate: Bitrate::ZERO,
            producer_on: true,
            next_frame: base,
            frame_count: 0,
            keyframe_every: None,
            keyframe_scale: 4,
            pacer_queue: VecDeque::new(),
            pacer_queue_bytes: 0,
            pacer_budget: 0.0,
            probe_queue: VecDeque::new(),
            active_probe: None,
            next_feedback: base + FEEDBACK_INTERVAL,
            pending_feedback: VecDeque::new(),
            min_bitrate,
            max_bitrate,
            updates: Vec::new(),
            pacer_delay_samples: VecDeque::new(),
        }
    }

    fn with_jitter(mut self, seed: u64, amount: Duration) -> Self {
        self.jitter = Some((fastrand::Rng::with_seed(seed), amount));
        self
    }

    fn with_keyframes(mut self, every_frames: u64, scale: u64) -> Self {
        self.keyframe_every = Some(every_frames);
        self.keyframe_scale = scale;
        self
    }

    fn estimate(&self) -> Bitrate {
        self.controller.last_estimate()
    }

    fn change_route(&mut self, link: LinkConfig) {
        self.route_id += 1;
        self.link = link;
        self.busy_until = self.now;
        self.controller
            .handle_route_change(NetworkRoute::new(self.route_id), self.now);
        self.drain_outputs();
    }

    /// Advance the simulation in 1ms steps.
    fn run_for(&mut self, duration: Duration) {
        let steps = duration.as_millis() as u64;
        for _ in 0..steps {
            self.now += Duration::from_millis(1);
            self.step();
        }
    }

    fn step(&mut self) {
        let now = self.now;

        // Drive the controller's timers. Pending probe configs are emitted
        // one per timeout, hence the loop.
        for _ in 0..8 {
            if self.controller.poll_timeout() > now {
                break;
            }
            self.controller.handle_timeout(now);
        }
        self.drain_outputs();

        self.produce_media();
        self.send_probe_packets();
        self.pace_out();
        self.deliver_feedback();
    }

    fn drain_outputs(&mut self) {
        while let Some(output) = self.controller.poll_output() {
            match output {
                Output::TargetUpdate(update) => {
                    assert!(
                        update.send_bitrate >= self.min_bitrate
                            && update.send_bitrate <= self.max_bitrate,
                        "target rate {} outside [{}, {}]",
                        update.send_bitrate,
                        self.min_bitrate,
                        self.max_bitrate,
                    );

                    self.media_rate = update.send_bitrate;
                    self.pacing_rate = update.pacing_bitrate;

                    let offset = update.at.duration_since(self.base).as_millis() as u64;
                    self.updates.push((
                        offset,
                        update.send_bitrate.as_u64(),
                        update.pacing_bitrate.as_u64(),
                        update.congestion_window.as_bytes_u64(),
                    ));
                }
                Output::ProbeCluster(config) => {
                    self.probe_queue.push_back(config);
                }
            }
        }
    }

    /// Produce media frames at the controller's current send rate.
    fn produce_media(&mut self) {
        if !self.producer_on || self.media_rate.is_zero() {
            return;
        }

        while self.now >= self.next_frame {
            self.frame_count += 1;

            let mut frame_bytes = (self.media_rate * FRAME_INTERVAL).as_bytes_u64();
            if let Some(every) = self.keyframe_every {
                if self.frame_count % every == 0 {
                    frame_bytes *= self.keyframe_scale;
                }
            }

            let enqueued_at = self.next_frame.max(self.base);
            while frame_bytes > 0 {
                let size = frame_bytes.min(MAX_PACKET);
                self.pacer_queue
                    .push_back((enqueued_at, DataSize::bytes(size)));
                self.pacer_queue_bytes += size;
                frame_bytes -= size;
            }

            self.next_frame += FRAME_INTERVAL;
        }
    }

    /// Realize probe clusters as paced padding bursts, bypassing the media queue.
    fn send_probe_packets(&mut self) {
        if self.active_probe.is_none() {
            let Some(config) = self.probe_queue.pop_front() else {
                return;
            };

            let target_bytes = config.target_bytes().as_bytes_u64();
            // Spread evenly so the first/last boundary exclusions in the
            // estimator stay symmetric.
            let min_packets = config.min_packet_count() as u64;
            let packet_size = ((target_bytes + min_packets - 1) / min_packets).clamp(200, MAX_PACKET);

            self.controller.start_probe(config, self.now);
            self.active_probe = Some(ActiveProbe {
                config,
                bytes_left: target_bytes,
                packet_size,
                packets_sent: 0,
                next_send: self.now,
            });
        }

        let Some(mut probe) = self.active_probe.take() else {
            return;
        };

        while probe.next_send <= self.now && probe.bytes_left > 0 {
            let size = probe.packet_size.min(probe.bytes_left).max(1);
            let cluster = Some(probe.config.cluster());
            self.send_packet(DataSize::bytes(size), cluster);

            probe.bytes_left -= size;
            probe.packets_sent += 1;
            probe.next_send += DataSize::bytes(size) / probe.config.target_bitrate();
        }

        if probe.bytes_left == 0 && probe.packets_sent >= probe.config.min_packet_count() {
            self.controller.end_probe(probe.config.cluster(), self.now);
        } else {
            self.active_probe = Some(probe);
        }
    }

    /// Drain the media queue at the pacing rate.
    fn pace_out(&mut self) {
        if self.pacer_queue.is_empty() {
            self.pacer_budget = 0.0;
        } else {
            self.pacer_budget += self.pacing_rate.as_f64() / 8.0 / 1000.0;

            while let Some((_, size)) = self.pacer_queue.front().copied() {
                if self.pacer_budget < size.as_bytes_f64() {
                    break;
                }
                self.pacer_budget -= size.as_bytes_f64();
                self.pacer_queue.pop_front();
                self.pacer_queue_bytes -= size.as_bytes_u64();

                self.send_packet(size, None);
            }
        }

        self.controller
            .set_pacer_queue(DataSize::bytes(self.pacer_queue_bytes));

        // Sample the queueing delay the next packet would experience.
        let delay = if self.pacing_rate.is_zero() {
            Duration::ZERO
        } else {
            DataSize::bytes(self.pacer_queue_bytes) / self.pacing_rate
        };
        self.pacer_delay_samples.push_back((self.now, delay));
    }

    fn send_packet(&mut self, size: DataSize, cluster: Option<netbwe::ProbeClusterId>) {
        self.next_seq += 1;
        let seq: SeqNo = self.next_seq.into();

        self.controller.handle_packet_sent(seq, size, self.now);

        // Bottleneck rate limiting, then propagation.
        let start = self.busy_until.max(self.now);
        let finish = start + size / self.link.capacity;
        self.busy_until = finish;

        let jitter = match &mut self.jitter {
            Some((rng, amount)) => Duration::from_micros(rng.u64(0..=amount.as_micros() as u64)),
            None => Duration::ZERO,
        };
        let arrival = finish + self.link.delay + jitter;

        self.sent.insert(
            self.next_seq,
            SentRecord {
                send_time: self.now,
                size,
                cluster,
                arrival: Some(arrival),
                reported: false,
            },
        );
    }

    /// Build feedback batches on a fixed cadence and deliver them after the
    /// return path delay.
    fn deliver_feedback(&mut self) {
        if self.now >= self.next_feedback {
            self.next_feedback += FEEDBACK_INTERVAL;

            let now = self.now;
            let mut records = Vec::new();
            for (seq, record) in self.sent.iter_mut() {
                if record.reported {
                    continue;
                }

                let arrived = record.arrival.filter(|a| *a <= now);
                let timed_out = now.duration_since(record.send_time) > LOST_AFTER;

                if arrived.is_none() && !timed_out {
                    // Still in flight, report in a later batch.
                    continue;
                }

                record.reported = true;
                records.push(PacketFeedback {
                    seq: (*seq).into(),
                    size: record.size,
                    local_send_time: record.send_time,
                    remote_recv_time: arrived,
                    cluster: record.cluster,
                });
            }

            if !records.is_empty() {
                let deliver_at = now + self.link.delay;
                self.pending_feedback.push_back((deliver_at, records));
            }

            // Old reported entries are done for good.
            self.sent.retain(|_, r| !r.reported);
        }

        while let Some((deliver_at, _)) = self.pending_feedback.front() {
            if *deliver_at > self.now {
                break;
            }
            let (_, records) = self.pending_feedback.pop_front().unwrap();
            self.controller.handle_feedback(&records, self.now);
            self.drain_outputs();
        }
    }

    /// Mean pacer queueing delay over the trailing window.
    fn mean_pacer_delay(&self, window: Duration) -> Duration {
        let cutoff = self.now - window;
        let (sum, count) = self
            .pacer_delay_samples
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .fold((Duration::ZERO, 0u32), |(sum, count), (_, d)| {
                (sum + *d, count + 1)
            });

        if count == 0 {
            Duration::ZERO
        } else {
            sum / count
        }
    }
}

fn kbps(v: u64) -> Bitrate {
    Bitrate::kbps(v)
}

fn assert_near(actual: Bitrate, expected: Bitrate, tolerance: Bitrate) {
    let diff = (actual.as_f64() - expected.as_f64()).abs();
    assert!(
        diff <= tolerance.as_f64(),
        "expected {} within {} of {}",
        actual,
        tolerance,
        expected,
    );
}

#[test]
fn stable_path_converges_to_capacity() {
    init_log();

    // 200 kbps link, overly optimistic 300 kbps start rate.
    let link = LinkConfig {
        capacity: kbps(200),
        delay: Duration::from_millis(10),
    };
    let config = Config::new().start_bitrate(kbps(300));

    let mut sim = Simulator::new(config, link, Instant::now());
    sim.run_for(Duration::from_millis(500));

    assert_near(sim.estimate(), kbps(200), kbps(50));
}

#[test]
fn safe_reset_maintains_low_rate() {
    init_log();

    // Stabilize well below the start rate, then change route. The low rate
    // is within bounds for the new path, so it is kept.
    let link = LinkConfig {
        capacity: kbps(200),
        delay: Duration::from_millis(10),
    };
    let config = Config::new().start_bitrate(kbps(300)).safe_reset(true);

    let mut sim = Simulator::new(config, link, Instant::now());
    sim.run_for(Duration::from_millis(500));
    let before = sim.estimate();
    assert_near(before, kbps(200), kbps(50));

    sim.change_route(link);
    sim.run_for(Duration::from_millis(100));

    assert_near(sim.estimate(), before, kbps(50));
}

#[test]
fn safe_reset_cuts_high_rate() {
    init_log();

    // Stabilize near 1 Mbps, then change route. The new path's capacity is
    // unknown, so the rate is cut toward the start rate rather than carried
    // over.
    let link = LinkConfig {
        capacity: kbps(1000),
        delay: Duration::from_millis(50),
    };
    let config = Config::new().start_bitrate(kbps(300)).safe_reset(true);

    let mut sim = Simulator::new(config, link, Instant::now());
    sim.run_for(Duration::from_millis(500));
    assert_near(sim.estimate(), kbps(1000), kbps(300));

    sim.change_route(link);
    sim.run_for(Duration::from_millis(100));

    assert_near(sim.estimate(), kbps(300), kbps(30));
}

#[test]
fn safe_reset_detects_high_capacity_route() {
    init_log();

    // A low-capacity path, then a route change to a much better one. The
    // target stays conservative right after the change, then probing
    // discovers the new headroom within a couple of seconds.
    let initial = LinkConfig {
        capacity: kbps(200),
        delay: Duration::from_millis(50),
    };
    let improved = LinkConfig {
        capacity: kbps(800),
        delay: Duration::from_millis(50),
    };
    let config = Config::new().start_bitrate(kbps(300)).safe_reset(true);

    let mut sim = Simulator::new(config, initial, Instant::now());
    sim.run_for(Duration::from_millis(1000));
    let before = sim.estimate();
    assert_near(before, kbps(200), kbps(50));

    sim.change_route(improved);
    sim.run_for(Duration::from_millis(50));

    // Not raised before a probe confirms.
    assert_near(sim.estimate(), before, kbps(50));

    sim.run_for(Duration::from_millis(1950));

    assert!(
        sim.estimate() > kbps(500),
        "probing should discover the better path, got {}",
        sim.estimate()
    );
}

#[test]
fn pushback_limits_pacer_queue_buildup() {
    init_log();

    // Strict pacing (factor 1.0) with periodic oversized keyframes. Without
    // pushback the pacer queue ratchets up with every keyframe and never
    // drains. With pushback the producer is throttled below the pacing rate
    // until the queue empties.
    let link = LinkConfig {
        capacity: kbps(1000),
        delay: Duration::from_millis(50),
    };

    let with_pushback = Config::new()
        .start_bitrate(kbps(1000))
        .pacing_factor(1.0)
        .pushback(true)
        .pushback_margin(Duration::ZERO);
    let mut sim = Simulator::new(with_pushback, link, Instant::now()).with_keyframes(25, 4);
    sim.run_for(Duration::from_secs(5));
    let delay_with = sim.mean_pacer_delay(Duration::from_secs(1));

    let without_pushback = Config::new()
        .start_bitrate(kbps(1000))
        .pacing_factor(1.0)
        .pushback(false);
    let mut sim = Simulator::new(without_pushback, link, Instant::now()).with_keyframes(25, 4);
    sim.run_for(Duration::from_secs(5));
    let delay_without = sim.mean_pacer_delay(Duration::from_secs(1));

    assert!(
        delay_with < Duration::from_millis(150),
        "pushback should keep the pacer queue short, got {:?}",
        delay_with
    );
    assert!(
        delay_without > Duration::from_millis(250),
        "without pushback the queue should build up, got {:?}",
        delay_without
    );
}

#[test]
fn identical_input_yields_identical_output() {
    init_log();

    // Two runs from the same virtual clock with the same seeded jitter must
    // produce byte-identical decision sequences.
    let base = Instant::now();
    let link = LinkConfig {
        capacity: kbps(500),
        delay: Duration::from_millis(30),
    };

    let run = |base: Instant| {
        let config = Config::new().start_bitrate(kbps(300)).safe_reset(true);
        let mut sim =
            Simulator::new(config, link, base).with_jitter(42, Duration::from_millis(2));
        sim.run_for(Duration::from_millis(1500));
        sim.change_route(LinkConfig {
            capacity: kbps(800),
            delay: Duration::from_millis(30),
        });
        sim.run_for(Duration::from_millis(1500));
        sim.updates
    };

    let first = run(base);
    let second = run(base);

    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn target_rate_stays_within_bounds_under_starvation() {
    init_log();

    // Cut all media and feedback by pausing the producer. The controller
    // decays toward the minimum, never below it.
    let link = LinkConfig {
        capacity: kbps(1000),
        delay: Duration::from_millis(30),
    };
    let config = Config::new().start_bitrate(kbps(300));

    let mut sim = Simulator::new(config, link, Instant::now());
    sim.run_for(Duration::from_millis(500));
    assert!(sim.estimate() > kbps(300));

    sim.producer_on = false;
    sim.run_for(Duration::from_secs(4));

    // Decayed, but the bounds invariant held throughout (asserted per update
    // in drain_outputs).
    assert_eq!(sim.estimate(), kbps(30));
}
