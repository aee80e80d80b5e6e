use crate::checker::CompletionChecker;
use crate::client::MessagingClient;
use crate::clock::{Clock, SystemClock};
use crate::command::{Command, HELP};
use crate::config::{
    BenchConfig, ConsumerSpec, DestinationLayout, LatencyCategory, MessageKind, ProducerSpec,
    RateControlMode, RateMode, Termination,
};
use crate::error::{BenchError, Result};
use crate::histogram::SparseHistogram;
use crate::ramp::RampPlanner;
use crate::rate_controller::{Pacing, TokenFeeder, TokenGate, TokenTap};
use crate::stats::{Aggregator, LatencyReport, Snapshot};
use crate::topology::{build_destinations, DestinationDescriptor, DestinationMap, Role, TopologyOptions, WorkerSlot};
use crate::worker::{self, pin_to_cpu, RunContext, WorkerShared};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub label: String,
    pub role: Role,
    pub count: u64,
    /// Messages the worker had to move in count mode
    pub expected: Option<u64>,
    pub errors: u64,
    pub timeouts: u64,
    pub finished: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub client: String,
    pub termination: Termination,
    pub duration_ms: u64,
    pub destinations: usize,
    pub sent: u64,
    pub received: u64,
    pub send_rate: f64,
    pub receive_rate: f64,
    pub errors: u64,
    pub timeouts: u64,
    pub workers: Vec<WorkerOutcome>,
    pub shortfalls: Vec<String>,
    pub latency: Vec<LatencyReport>,
    pub rtt_histogram: Option<SparseHistogram>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.shortfalls.is_empty() && self.workers.iter().all(|w| w.error.is_none())
    }
}

struct WorkerPlan<S> {
    spec: S,
    descriptors: Vec<DestinationDescriptor>,
}

/// Owns every thread of a run: workers, the shared rate controller and the
/// completion checker.
pub struct Supervisor {
    ctx: Arc<RunContext>,
    map: Arc<DestinationMap>,
    aggregator: Aggregator,
    producers: Vec<Arc<WorkerShared>>,
    consumers: Vec<Arc<WorkerShared>>,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
    checker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    feeder_stop: Arc<AtomicBool>,
    stop_requested: AtomicBool,
}

fn expand<S: Clone>(
    specs: &[S],
    layout_of: impl Fn(&S) -> &DestinationLayout,
    role: Role,
    config: &BenchConfig,
    map: &mut DestinationMap,
) -> Result<Vec<WorkerPlan<S>>> {
    let options = TopologyOptions {
        round_robin: config.topology.round_robin,
        partitions: config.topology.partitions,
    };
    let rtt = config
        .latency
        .enabled(LatencyCategory::RoundTrip)
        .then_some(config.latency.histogram_size);
    let mut plans = Vec::new();
    for spec in specs {
        let layout = layout_of(spec);
        for thread_index in 0..layout.threads.unsigned_abs() as usize {
            let slot = WorkerSlot {
                worker_id: plans.len(),
                thread_index,
                role,
            };
            let descriptors =
                build_destinations(layout, slot, options, &config.server.endpoints, rtt)?;
            for descriptor in &descriptors {
                map.insert(descriptor);
            }
            plans.push(WorkerPlan {
                spec: spec.clone(),
                descriptors,
            });
        }
    }
    Ok(plans)
}

impl Supervisor {
    pub fn start(config: BenchConfig, client: Arc<dyn MessagingClient>) -> Result<Arc<Self>> {
        Self::start_with_clock(config, client, Arc::new(SystemClock::new()))
    }

    /// Validates the configuration, builds the topology and starts every
    /// thread. Configuration errors surface before any connection is made.
    pub fn start_with_clock(
        mut config: BenchConfig,
        client: Arc<dyn MessagingClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let mut map = DestinationMap::new();
        let producer_plans = expand(&config.producers, |p| &p.layout, Role::Producer, &config, &mut map)?;
        let consumer_plans = expand(&config.consumers, |c| &c.layout, Role::Consumer, &config, &mut map)?;

        let count_mode = config.run.termination == Termination::Count;
        let queues = config.messages.kind == MessageKind::Queue;
        if count_mode && queues && !consumer_plans.is_empty() {
            map.check_subscription()?;
        }
        info!(
            run = %config.run.id,
            client = client.name(),
            producers = producer_plans.len(),
            consumers = consumer_plans.len(),
            destinations = map.len(),
            "topology built"
        );

        let per_destination = config.run.messages_per_destination;
        let producers: Vec<_> = producer_plans
            .iter()
            .enumerate()
            .map(|(id, plan)| {
                let expected = vec![if count_mode { per_destination } else { 0 }; plan.descriptors.len()];
                Arc::new(WorkerShared::new(
                    id,
                    Role::Producer,
                    plan.spec.cpu,
                    plan.descriptors.clone(),
                    expected,
                    plan.spec.commit_interval,
                    &config,
                ))
            })
            .collect();
        let consumers: Vec<_> = consumer_plans
            .iter()
            .enumerate()
            .map(|(id, plan)| {
                let expected = plan
                    .descriptors
                    .iter()
                    .map(|d| {
                        if !count_mode || queues {
                            return 0;
                        }
                        let senders = map.get(&d.name).map_or(0, |e| e.producers.len()) as u64;
                        per_destination * senders.max(1)
                    })
                    .collect();
                Arc::new(WorkerShared::new(
                    id,
                    Role::Consumer,
                    plan.spec.cpu,
                    plan.descriptors.clone(),
                    expected,
                    plan.spec.commit_interval,
                    &config,
                ))
            })
            .collect();

        let map = Arc::new(map);
        let all: Vec<_> = producers.iter().chain(consumers.iter()).cloned().collect();
        let aggregator = Aggregator::new(clock.clone(), config.latency.clone(), all.clone());
        let ctx = Arc::new(RunContext::new(config, clock, client));
        let supervisor = Arc::new(Self {
            ctx,
            map,
            aggregator,
            producers,
            consumers,
            threads: Mutex::new(Vec::new()),
            checker: Mutex::new(None),
            feeder_stop: Arc::new(AtomicBool::new(false)),
            stop_requested: AtomicBool::new(false),
        });

        if let Err(e) = supervisor.launch(producer_plans, consumer_plans, all) {
            error!(error = %e, "startup failed, stopping workers");
            supervisor.shutdown();
            return Err(e);
        }
        Ok(supervisor)
    }

    fn launch(
        &self,
        producer_plans: Vec<WorkerPlan<ProducerSpec>>,
        consumer_plans: Vec<WorkerPlan<ConsumerSpec>>,
        all: Vec<Arc<WorkerShared>>,
    ) -> Result<()> {
        let config = &self.ctx.config;
        for (worker, plan) in self.consumers.iter().zip(consumer_plans) {
            let handle = worker::spawn_consumer(self.ctx.clone(), worker.clone(), plan.spec)?;
            self.threads.lock().push((worker.label.clone(), handle));
        }
        self.wait_consumers_ready()?;
        if config.run.consumer_start_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(config.run.consumer_start_delay_ms));
        }

        let mut gates = Vec::new();
        let pacings: Vec<Pacing> = self
            .producers
            .iter()
            .map(|_| match config.rate.mode {
                RateControlMode::Disabled => Pacing::Unpaced,
                RateControlMode::PerThread => Pacing::per_thread(
                    self.ctx.clock.clone(),
                    self.ctx.rate.clone(),
                    self.ctx.num_producers,
                ),
                RateControlMode::Shared => {
                    let gate = Arc::new(TokenGate::new());
                    gates.push(gate.clone());
                    Pacing::Shared(TokenTap::new(gate, self.ctx.clock.clone()))
                }
            })
            .collect();
        if !gates.is_empty() {
            self.spawn_feeder(gates)?;
        }
        for ((worker, plan), pacing) in self.producers.iter().zip(producer_plans).zip(pacings) {
            let handle = worker::spawn_producer(self.ctx.clone(), worker.clone(), plan.spec, pacing)?;
            self.threads.lock().push((worker.label.clone(), handle));
        }

        if self.ctx.count_mode() {
            let checker = CompletionChecker::new(
                self.map.clone(),
                all,
                config.run.messages_per_destination,
                config.messages.kind == MessageKind::Queue,
            );
            let spawned = checker.spawn(
                Duration::from_millis(config.run.check_initial_delay_ms),
                Duration::from_millis(config.run.check_interval_ms.max(1)),
            )?;
            *self.checker.lock() = Some(spawned);
        }
        Ok(())
    }

    fn wait_consumers_ready(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.ctx.config.run.consumer_ready_timeout_ms);
        loop {
            if let Some(failed) = self.consumers.iter().find(|c| c.is_finished() && c.error().is_some()) {
                return Err(BenchError::Startup {
                    worker: failed.label.clone(),
                    reason: failed.error().unwrap_or_default(),
                });
            }
            if self.consumers.iter().all(|c| c.is_ready() || c.is_finished()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("not every consumer is ready, starting producers anyway");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Starts the shared rate controller thread feeding `gates`.
    fn spawn_feeder(&self, gates: Vec<Arc<TokenGate>>) -> Result<()> {
        let clock = self.ctx.clock.clone();
        let target = self.ctx.rate.clone();
        let batch_rate = self.ctx.config.rate.batch_rate as f64;
        let cpu = self.ctx.config.rate.controller_cpu;
        let stop = self.feeder_stop.clone();
        let handle = std::thread::Builder::new()
            .name("rate-controller".into())
            .spawn(move || {
                if let Some(cpu) = cpu {
                    pin_to_cpu("rate-controller", cpu);
                }
                let feeder = TokenFeeder::new(clock, target, gates, batch_rate);
                info!(batch_factor = feeder.batch_factor(), "shared rate controller running");
                feeder.run(&stop);
            })
            .map_err(|source| BenchError::Spawn {
                name: "rate-controller".into(),
                source,
            })?;
        self.threads.lock().push(("rate-controller".into(), handle));
        Ok(())
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn destinations(&self) -> &DestinationMap {
        &self.map
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn all_finished(&self) -> bool {
        self.producers
            .iter()
            .chain(self.consumers.iter())
            .all(|w| w.is_finished())
    }

    /// Blocks until the run should end, calling `on_snapshot` every
    /// snapshot interval. Applies warm-up resets, ramp steps and periodic
    /// round-trip histogram resets along the way.
    pub fn wait(&self, mut on_snapshot: impl FnMut(&Snapshot)) {
        let config = &self.ctx.config;
        let run = &config.run;
        let clock = &self.ctx.clock;
        let start = clock.now();
        let duration = Duration::from_secs(run.duration_secs);
        let max_duration = run.max_duration_secs.map(Duration::from_secs);
        let snapshot_every = Duration::from_secs(run.snapshot_interval_secs);
        let mut next_snapshot = snapshot_every;
        let rtt_reset_every = Duration::from_secs(config.latency.rtt_reset_secs);
        let mut next_rtt_reset = rtt_reset_every;
        let begin_stats = Duration::from_secs(run.begin_stats_secs);
        let mut begin_stats_pending = run.begin_stats_secs > 0;
        let mut reset_after_pending = run.reset_after_received > 0;
        let mut ramp = (!config.rate.ramp.is_empty() && config.rate.mode != RateControlMode::Disabled)
            .then(|| RampPlanner::new(config.rate.ramp.clone()).cursor());

        loop {
            if self.stop_requested() {
                info!("stop requested");
                break;
            }
            let elapsed = clock.now().saturating_sub(start);
            if let Some(max) = max_duration {
                if elapsed >= max {
                    warn!(max_secs = max.as_secs(), "maximum run duration reached, stopping");
                    break;
                }
            }
            if self.all_finished() {
                info!("every worker finished");
                break;
            }
            if run.termination == Termination::Duration && elapsed >= duration {
                break;
            }

            if begin_stats_pending && elapsed >= begin_stats {
                begin_stats_pending = false;
                self.aggregator.reset_baseline();
                self.aggregator.reset_latency();
                info!(after_secs = run.begin_stats_secs, "warm-up over, statistics reset");
            }
            if reset_after_pending && self.aggregator.totals().1 >= run.reset_after_received {
                reset_after_pending = false;
                self.aggregator.reset_baseline();
                self.aggregator.reset_latency();
                info!(received = run.reset_after_received, "statistics reset after first messages");
            }
            if let Some(cursor) = ramp.as_mut() {
                let elapsed_ms = elapsed.as_millis() as u64;
                if let Some(tps) = cursor.poll(elapsed_ms) {
                    info!(tps, "ramp step");
                    self.ctx.rate.set(tps);
                }
                if cursor.finished(elapsed_ms) {
                    info!(rate = self.ctx.rate.rate(), "ramp finished, holding the last rate");
                    ramp = None;
                }
            }
            if !rtt_reset_every.is_zero() && elapsed >= next_rtt_reset {
                next_rtt_reset += rtt_reset_every;
                self.aggregator.reset_rtt();
                info!("round-trip histograms reset");
            }
            if !snapshot_every.is_zero() && elapsed >= next_snapshot {
                next_snapshot += snapshot_every;
                on_snapshot(&self.aggregator.snapshot(run.stats_mode));
            }
            std::thread::sleep(POLL);
        }
    }

    /// Runs one console command and returns its output.
    pub fn apply(&self, command: &Command) -> String {
        match command {
            Command::Help => HELP.to_string(),
            Command::Quit => {
                self.request_stop();
                "stopping".to_string()
            }
            Command::Stat => self.aggregator.snapshot(RateMode::SinceStart).to_string(),
            Command::Rate(rate) => {
                if self.ctx.config.rate.mode == RateControlMode::Disabled {
                    return "rate control is disabled for this run".to_string();
                }
                self.ctx.rate.set(*rate);
                info!(rate, "global rate changed");
                format!("global rate set to {rate} msgs/sec")
            }
            Command::ConsumerCommit(n) => {
                self.consumers.iter().for_each(|c| c.set_commit_interval(*n));
                format!("consumer commit interval set to {n}")
            }
            Command::ProducerCommit(n) => {
                self.producers.iter().for_each(|p| p.set_commit_interval(*n));
                format!("producer commit interval set to {n}")
            }
            Command::Latency | Command::AggregateLatency => {
                let reports = self
                    .aggregator
                    .latency_reports(matches!(command, Command::Latency));
                if reports.is_empty() {
                    return "no latency category is measured".to_string();
                }
                reports.iter().map(ToString::to_string).collect()
            }
            Command::Names => {
                let mut out = String::new();
                for (name, entry) in self.map.iter() {
                    let _ = writeln!(
                        out,
                        "{name} producers={} consumers={}",
                        entry.producers.len(),
                        entry.consumers.len()
                    );
                }
                let _ = write!(out, "{} destinations", self.map.len());
                out
            }
            Command::Remaining(filter) => self.remaining(filter.as_deref()),
            Command::Session(id) => {
                let mut out = String::new();
                for descriptor in self
                    .consumers
                    .iter()
                    .flat_map(|c| c.destinations.iter())
                    .filter(|d| &d.session_id == id)
                {
                    let _ = writeln!(
                        out,
                        "{} {} received={} acks={} last_ack={}",
                        id,
                        descriptor.name,
                        descriptor.stats.count(),
                        descriptor.stats.acks(),
                        descriptor.stats.last_ack()
                    );
                }
                if out.is_empty() {
                    format!("no consumer session {id}")
                } else {
                    out.trim_end().to_string()
                }
            }
        }
    }

    fn remaining(&self, filter: Option<&str>) -> String {
        let per_destination = self.ctx.per_destination();
        let queues = self.ctx.config.messages.kind == MessageKind::Queue;
        let mut out = String::new();
        for (name, entry) in self.map.iter() {
            if filter.map_or(false, |f| f != name.as_str()) || entry.is_complete() {
                continue;
            }
            let sent = entry.sent();
            let received = entry.received();
            if self.ctx.count_mode() {
                let to_send = per_destination * entry.producers.len() as u64;
                let to_receive = if queues {
                    to_send
                } else {
                    to_send * entry.consumers.len() as u64
                };
                let _ = writeln!(
                    out,
                    "{name} put={} get={}",
                    to_send.saturating_sub(sent),
                    to_receive.saturating_sub(received)
                );
            } else {
                let _ = writeln!(out, "{name} sent={sent} received={received}");
            }
        }
        if out.is_empty() {
            "nothing remaining".to_string()
        } else {
            out.trim_end().to_string()
        }
    }

    fn stop_all(&self) {
        self.ctx.stop.store(true, Ordering::Release);
        for worker in self.producers.iter().chain(self.consumers.iter()) {
            worker.mark_done();
        }
        self.feeder_stop.store(true, Ordering::Release);
    }

    fn join_all(&self) {
        if let Some((stop, handle)) = self.checker.lock().take() {
            drop(stop);
            if handle.join().is_err() {
                error!("completion checker panicked");
            }
        }
        let deadline = Instant::now() + Duration::from_millis(self.ctx.config.run.shutdown_grace_ms);
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for (name, handle) in threads {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if !handle.is_finished() {
                warn!(thread = %name, "thread did not stop within the grace period, abandoning it");
                continue;
            }
            if handle.join().is_err() {
                error!(thread = %name, "thread panicked");
            }
        }
    }

    /// Stops every thread and builds the final report.
    pub fn shutdown(&self) -> RunReport {
        self.stop_all();
        self.join_all();

        let config = &self.ctx.config;
        let count_mode = self.ctx.count_mode();
        let per_destination = self.ctx.per_destination();
        let snapshot = self.aggregator.snapshot(RateMode::SinceStart);
        let mut shortfalls = Vec::new();

        let workers: Vec<WorkerOutcome> = self
            .producers
            .iter()
            .chain(self.consumers.iter())
            .map(|w| {
                let expected = match (count_mode, w.role) {
                    (false, _) => None,
                    (true, Role::Producer) => Some(w.expected_total(per_destination)),
                    (true, Role::Consumer) => w
                        .expected
                        .iter()
                        .any(|&e| e > 0)
                        .then(|| w.expected_total(per_destination)),
                };
                if let Some(expected) = expected {
                    if w.count() < expected {
                        let verb = match w.role {
                            Role::Producer => "sent",
                            Role::Consumer => "received",
                        };
                        shortfalls.push(format!(
                            "not all messages were {verb} by {}: {} of {}",
                            w.label,
                            w.count(),
                            expected
                        ));
                    }
                }
                WorkerOutcome {
                    label: w.label.clone(),
                    role: w.role,
                    count: w.count(),
                    expected,
                    errors: w.errors(),
                    timeouts: w.timeouts(),
                    finished: w.is_finished(),
                    error: w.error(),
                }
            })
            .collect();

        if count_mode && config.messages.kind == MessageKind::Queue && !self.consumers.is_empty() {
            for (name, entry) in self.map.iter() {
                if entry.producers.is_empty() || entry.consumers.is_empty() {
                    continue;
                }
                let expected = per_destination * entry.producers.len() as u64;
                if entry.received() < expected {
                    shortfalls.push(format!(
                        "not all messages were received on {name}: {} of {}",
                        entry.received(),
                        expected
                    ));
                }
            }
        }
        for line in &shortfalls {
            warn!("{line}");
        }

        let latency = self.aggregator.latency_reports(true);
        let rtt_histogram = latency
            .iter()
            .find(|r| r.category == LatencyCategory::RoundTrip.label())
            .map(|r| r.histogram.clone());

        RunReport {
            run_id: config.run.id.clone(),
            client: self.ctx.client.name().to_string(),
            termination: config.run.termination,
            duration_ms: snapshot.elapsed_ms,
            destinations: self.map.len(),
            sent: snapshot.sent,
            received: snapshot.received,
            send_rate: snapshot.send_rate,
            receive_rate: snapshot.receive_rate,
            errors: snapshot.errors,
            timeouts: snapshot.timeouts,
            workers,
            shortfalls,
            latency,
            rtt_histogram,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::memory::InMemoryBroker;

    fn layout(name: &str, per_session: i32) -> DestinationLayout {
        DestinationLayout {
            name: name.into(),
            per_session,
            ..DestinationLayout::default()
        }
    }

    fn config() -> BenchConfig {
        let mut config = BenchConfig::default();
        config.server.endpoints = vec!["local".into()];
        config.run.termination = Termination::Count;
        config.run.messages_per_destination = 20;
        config.run.check_initial_delay_ms = 10;
        config.run.check_interval_ms = 10;
        config.rate.mode = RateControlMode::Disabled;
        config
    }

    #[test]
    fn test_under_subscription_fails_before_connecting() {
        let mut config = config();
        config.producers = vec![ProducerSpec {
            layout: layout("q", 3),
            ..ProducerSpec::default()
        }];
        config.consumers = vec![ConsumerSpec {
            layout: layout("q", 2),
            ..ConsumerSpec::default()
        }];
        let broker = InMemoryBroker::new();
        let result = Supervisor::start(config, Arc::new(broker.clone()));
        assert!(matches!(
            result,
            Err(BenchError::Config(ConfigError::UnderSubscribedCount { consumed: 2, produced: 3 }))
        ));
        assert_eq!(broker.stats().connections, 0);
    }

    #[test]
    fn test_commands_against_running_supervisor() {
        let mut config = config();
        config.run.termination = Termination::Forever;
        config.rate.mode = RateControlMode::PerThread;
        config.rate.global_rate = Some(200);
        config.producers = vec![ProducerSpec {
            commit_interval: 5,
            layout: layout("orders", 2),
            ..ProducerSpec::default()
        }];
        config.consumers = vec![ConsumerSpec {
            layout: layout("orders", 2),
            ..ConsumerSpec::default()
        }];
        let supervisor = Supervisor::start(config, Arc::new(InMemoryBroker::new())).unwrap();

        assert!(supervisor.apply(&Command::Help).contains("rate=<n>"));
        let names = supervisor.apply(&Command::Names);
        assert!(names.contains("orders.00000000 producers=1 consumers=1"));
        assert!(names.ends_with("2 destinations"));
        assert_eq!(supervisor.apply(&Command::Rate(400)), "global rate set to 400 msgs/sec");
        assert_eq!(supervisor.context().rate.rate(), 400);
        supervisor.apply(&Command::ProducerCommit(1));
        assert_eq!(supervisor.producers[0].commit_interval(), 1);
        assert!(supervisor
            .apply(&Command::Session("cons0.conn0.sess0".into()))
            .starts_with("cons0.conn0.sess0 orders.00000000"));
        assert_eq!(
            supervisor.apply(&Command::Session("nope".into())),
            "no consumer session nope"
        );
        assert_eq!(
            supervisor.apply(&Command::Latency),
            "no latency category is measured"
        );

        assert_eq!(supervisor.apply(&Command::Quit), "stopping");
        supervisor.wait(|_| {});
        let report = supervisor.shutdown();
        assert!(report.is_success(), "{:?}", report.shortfalls);
        assert!(report.workers.iter().all(|w| w.finished));
    }

    #[test]
    fn test_ramp_holds_last_step_after_finishing() {
        let mut config = config();
        config.run.termination = Termination::Forever;
        config.rate.mode = RateControlMode::PerThread;
        config.rate.global_rate = Some(50);
        config.rate.ramp = vec![
            crate::config::RampStep { tps: 100, hold_ms: 100 },
            crate::config::RampStep { tps: 300, hold_ms: 100 },
        ];
        config.producers = vec![ProducerSpec {
            layout: layout("ramped", 1),
            ..ProducerSpec::default()
        }];
        let supervisor = Supervisor::start(config, Arc::new(InMemoryBroker::new())).unwrap();

        let stopper = supervisor.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(600));
            stopper.request_stop();
        });
        supervisor.wait(|_| {});
        handle.join().unwrap();
        assert_eq!(supervisor.context().rate.rate(), 300);
        supervisor.shutdown();
    }
}
