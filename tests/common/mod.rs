//! Mock-time simulation harness: a capacity-limited server and open-loop
//! clients driving a throttle through virtual time.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use fair_throttle::aimd::SharedAimd;
use fair_throttle::bucket::AimdTokenBucket;
use fair_throttle::{
    BloomFilterFairThrottle, Config, FairThrottle, MockTimeSource, StochasticFairThrottle,
    TimeSource,
};

/// A step in a piecewise-constant rate schedule.
pub struct TimeStep {
    pub at_ns: i64,
    pub value: f64,
}

/// Shorthand for a schedule step at `at_ns` nanoseconds of virtual time.
pub fn ts(at_ns: f64, value: f64) -> TimeStep {
    TimeStep {
        at_ns: at_ns as i64,
        value,
    }
}

/// A downstream service with piecewise-constant goodput.
///
/// The server is itself a token bucket refilled at the scheduled goodput
/// rate, so short bursts above the rate succeed until its burst capacity is
/// spent. It can also fail a constant fraction of calls outright.
pub struct SimulatedServer {
    time: Arc<MockTimeSource>,
    aimd: Arc<SharedAimd>,
    bucket: AimdTokenBucket,
    goodput: VecDeque<TimeStep>,
    failure_rate: f64,
    rng: ChaCha8Rng,
    pub successes: u64,
    pub offered: u64,
    pub throttled: u64,
}

impl SimulatedServer {
    pub fn new(goodput_tps: f64, time: Arc<MockTimeSource>) -> Self {
        Self::with_schedule(vec![ts(0.0, goodput_tps)], time, 0.0)
    }

    pub fn with_schedule(
        schedule: Vec<TimeStep>,
        time: Arc<MockTimeSource>,
        failure_rate: f64,
    ) -> Self {
        let mut goodput: VecDeque<TimeStep> = schedule.into();
        let initial = goodput.pop_front().expect("schedule must not be empty").value;
        let aimd = Arc::new(SharedAimd::new(initial));
        let bucket = AimdTokenBucket::new(
            initial,
            Arc::clone(&time) as Arc<dyn TimeSource>,
            Arc::clone(&aimd),
        );
        Self {
            time,
            aimd,
            bucket,
            goodput,
            failure_rate,
            rng: ChaCha8Rng::seed_from_u64(0x5eed),
            successes: 0,
            offered: 0,
            throttled: 0,
        }
    }

    /// One call against the server. Returns whether it succeeded.
    pub fn call(&mut self) -> bool {
        self.offered += 1;
        if let Some(step) = self.goodput.front() {
            if step.at_ns < self.time.now_ns() {
                let step = self.goodput.pop_front().expect("peeked");
                self.aimd.set_target_tps(step.value);
            }
        }
        if self.bucket.would_allow() && self.rng.gen::<f64>() > self.failure_rate {
            self.bucket.claim_token();
            self.successes += 1;
            return true;
        }
        self.throttled += 1;
        false
    }

    pub fn take_counts(&mut self) -> (u64, u64, u64) {
        let counts = (self.successes, self.throttled, self.offered);
        self.successes = 0;
        self.throttled = 0;
        self.offered = 0;
        counts
    }
}

/// An open-loop client offering load at a (possibly scheduled) rate.
///
/// `offered` counts attempts the throttle admitted and the client therefore
/// sent to the server; `throttled` counts attempts the throttle shed.
pub struct SimulatedClient {
    time: Arc<MockTimeSource>,
    key: String,
    schedule: VecDeque<TimeStep>,
    attempt_every_ns: i64,
    pub next_attempt_ns: i64,
    pub offered: u64,
    pub successes: u64,
    pub throttled: u64,
}

impl SimulatedClient {
    pub fn new(tps: f64, time: Arc<MockTimeSource>, key: &str, rng: &mut impl Rng) -> Self {
        Self::with_schedule(vec![ts(0.0, tps)], time, key, rng)
    }

    pub fn with_schedule(
        schedule: Vec<TimeStep>,
        time: Arc<MockTimeSource>,
        key: &str,
        rng: &mut impl Rng,
    ) -> Self {
        let mut schedule: VecDeque<TimeStep> = schedule.into();
        let initial = schedule.pop_front().expect("schedule must not be empty").value;
        let attempt_every_ns = (1e9 / initial) as i64;
        // Jitter the first attempt so clients do not fire in lockstep.
        let next_attempt_ns = time.now_ns() + (2.0 * rng.gen::<f64>() * attempt_every_ns as f64) as i64;
        Self {
            time,
            key: key.to_string(),
            schedule,
            attempt_every_ns,
            next_attempt_ns,
            offered: 0,
            successes: 0,
            throttled: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attempt a call if this client's next attempt time has come.
    pub fn call(&mut self, throttle: &dyn FairThrottle, server: &mut SimulatedServer) {
        if self.time.now_ns() < self.next_attempt_ns {
            return;
        }
        if let Some(step) = self.schedule.front() {
            if step.at_ns < self.time.now_ns() {
                let step = self.schedule.pop_front().expect("peeked");
                self.attempt_every_ns = (1e9 / step.value) as i64;
            }
        }
        self.next_attempt_ns = self.time.now_ns() + self.attempt_every_ns;

        let decision = throttle.should_accept(&self.key);
        if decision.is_allowed() {
            self.offered += 1;
            if server.call() {
                self.successes += 1;
                decision.on_success();
            } else {
                decision.on_failure();
            }
        } else {
            self.throttled += 1;
        }
    }

    pub fn take_counts(&mut self) -> (u64, u64, u64) {
        let counts = (self.successes, self.throttled, self.offered);
        self.successes = 0;
        self.throttled = 0;
        self.offered = 0;
        counts
    }
}

/// The earliest next-attempt time across all clients.
pub fn next_attempt_ns(clients: &[SimulatedClient]) -> i64 {
    clients
        .iter()
        .map(|c| c.next_attempt_ns)
        .min()
        .expect("at least one client")
}

/// Drive the simulation for `seconds` of virtual time.
pub fn run_for(
    time: &MockTimeSource,
    throttle: &dyn FairThrottle,
    server: &mut SimulatedServer,
    clients: &mut [SimulatedClient],
    seconds: f64,
) {
    let deadline = time.now_ns() + (seconds * 1e9) as i64;
    while time.now_ns() < deadline {
        time.set_ns(next_attempt_ns(clients));
        for client in clients.iter_mut() {
            client.call(throttle, server);
        }
    }
}

/// Which throttle a scripted simulation runs against.
pub enum ThrottleKind {
    Stochastic,
    BloomFilter,
}

/// A scripted CSV-emitting simulation run.
pub struct SimulationConfig {
    pub client_tps: Vec<f64>,
    pub server_goodput: Vec<TimeStep>,
    pub output_file: String,
    pub run_until_secs: f64,
    pub buckets: usize,
    pub throttle_kind: ThrottleKind,
    pub time_step_secs: f64,
    pub server_failure_rate: f64,
}

/// Run a scripted simulation, writing one metrics row per server and client
/// every `time_step_secs` of virtual time.
pub fn run_simulation(config: SimulationConfig) -> csv::Result<()> {
    let time = Arc::new(MockTimeSource::new());
    let initial_tps = config.server_goodput[0].value;
    let mut server =
        SimulatedServer::with_schedule(config.server_goodput, Arc::clone(&time), config.server_failure_rate);
    let throttle: Box<dyn FairThrottle> = match config.throttle_kind {
        ThrottleKind::Stochastic => Box::new(StochasticFairThrottle::new(
            Config::default()
                .with_time_source(Arc::clone(&time) as Arc<dyn TimeSource>)
                .with_initial_tps(initial_tps)
                .with_buckets(config.buckets),
        )),
        ThrottleKind::BloomFilter => Box::new(BloomFilterFairThrottle::new(
            initial_tps,
            config.buckets,
            Arc::clone(&time) as Arc<dyn TimeSource>,
        )),
    };
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut clients: Vec<SimulatedClient> = config
        .client_tps
        .iter()
        .enumerate()
        .map(|(i, &tps)| {
            let key = format!("client_{i}_{tps:.2}");
            SimulatedClient::new(tps, Arc::clone(&time), &key, &mut rng)
        })
        .collect();

    let mut writer = csv::Writer::from_path(&config.output_file)?;
    writer.write_record(["t", "goodput", "throttled", "offered", "type", "name"])?;

    let run_until_ns = (config.run_until_secs * 1e9) as i64;
    let time_step_ns = (config.time_step_secs * 1e9) as i64;
    let mut last_metrics_ns = 0i64;
    while time.now_ns() < run_until_ns {
        time.set_ns(next_attempt_ns(&clients));
        for client in clients.iter_mut() {
            client.call(&*throttle, &mut server);
        }
        if time.now_ns() - last_metrics_ns > time_step_ns {
            last_metrics_ns = time.now_ns();
            let t = time.now_ns() as f64 / 1e9;
            let (successes, throttled, offered) = server.take_counts();
            writer.write_record([
                format!("{t}"),
                format!("{successes}"),
                format!("{throttled}"),
                format!("{offered}"),
                "server".to_string(),
                "server".to_string(),
            ])?;
            for client in clients.iter_mut() {
                let name = client.key().to_string();
                let (successes, throttled, offered) = client.take_counts();
                writer.write_record([
                    format!("{t}"),
                    format!("{successes}"),
                    format!("{throttled}"),
                    format!("{offered}"),
                    "client".to_string(),
                    name,
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}
