use crate::client::{AckMode, DestinationKind};
use crate::error::ConfigError;
use crate::frame::HEADER_LEN;
use crate::histogram::MAX_LATENCY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Global rate used when none is configured, in messages/second.
pub const DEFAULT_GLOBAL_RATE: u64 = 1000;
/// Rate assumed for sampling estimates when pacing is disabled.
pub const MAX_GLOBAL_RATE: u64 = 10_000_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub messages: MessageConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub producers: Vec<ProducerSpec>,
    #[serde(default)]
    pub consumers: Vec<ConsumerSpec>,
}

impl BenchConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Normalises message sizes and rejects conflicting settings.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.producers.is_empty() && self.consumers.is_empty() {
            return Err(ConfigError::NoWorkers);
        }
        if self.server.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        if self.messages.min_size < HEADER_LEN {
            warn!(
                requested = self.messages.min_size,
                "message length must be at least {} bytes, raising it", HEADER_LEN
            );
            self.messages.min_size = HEADER_LEN;
        }
        if self.messages.max_size < self.messages.min_size {
            warn!(
                requested = self.messages.max_size,
                min = self.messages.min_size,
                "max message length below min, raising it"
            );
            self.messages.max_size = self.messages.min_size;
        }

        if self.rate.mode == RateControlMode::Disabled {
            if let Some(rate) = self.rate.global_rate {
                return Err(ConfigError::ConflictingRate(rate));
            }
            if self.latency.enabled(LatencyCategory::RoundTrip) {
                warn!("round-trip sampling without rate control will not hit the expected sample count");
            }
        }
        if self.rate.batch_rate == 0 {
            return Err(ConfigError::Invalid(
                "rate.batch_rate must be greater than zero".into(),
            ));
        }

        if self.run.termination == Termination::Count && self.run.messages_per_destination == 0 {
            return Err(ConfigError::Invalid(
                "count termination needs run.messages_per_destination > 0".into(),
            ));
        }

        if self.run.wait_ready && self.producer_threads() < 2 {
            warn!("wait_ready is not useful with a single producer thread, disabling it");
            self.run.wait_ready = false;
        }

        if self.messages.kind == MessageKind::Shared {
            if let Some(spec) = self.producers.first() {
                return Err(ConfigError::SharedProducer(spec.layout.name.clone()));
            }
        }
        if self.messages.kind == MessageKind::Queue {
            if let Some(spec) = self.consumers.iter().find(|c| c.durable) {
                return Err(ConfigError::DurableOnQueue(spec.layout.name.clone()));
            }
        }

        for layout in self
            .producers
            .iter()
            .map(|p| &p.layout)
            .chain(self.consumers.iter().map(|c| &c.layout))
        {
            layout.validate(self.topology.partitions)?;
        }
        Ok(())
    }

    pub fn producer_threads(&self) -> usize {
        self.producers
            .iter()
            .map(|p| p.layout.threads.unsigned_abs() as usize)
            .sum()
    }

    pub fn consumer_threads(&self) -> usize {
        self.consumers
            .iter()
            .map(|c| c.layout.threads.unsigned_abs() as usize)
            .sum()
    }

    /// Destination kind on the wire; shared subscriptions consume topics.
    pub fn destination_kind(&self) -> DestinationKind {
        match self.messages.kind {
            MessageKind::Queue => DestinationKind::Queue,
            MessageKind::Topic | MessageKind::Shared => DestinationKind::Topic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Run for `duration_secs`.
    #[default]
    Duration,
    /// Send `messages_per_destination` to every producer destination.
    Count,
    /// Run until stopped.
    Forever,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMode {
    /// Rate over the last snapshot interval.
    #[default]
    Interval,
    /// Average rate since the (possibly reset) start.
    SinceStart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run identifier used in result file names
    pub id: String,
    pub termination: Termination,
    pub duration_secs: u64,
    pub messages_per_destination: u64,
    /// Snapshot interval in seconds, 0 disables periodic snapshots
    pub snapshot_interval_secs: u64,
    pub stats_mode: RateMode,
    /// Reset the statistics baseline after this many seconds of warm-up
    pub begin_stats_secs: u64,
    /// Reset the statistics baseline once consumers received this many messages
    pub reset_after_received: u64,
    pub consumer_ready_timeout_ms: u64,
    pub consumer_start_delay_ms: u64,
    /// Producers wait until every producer is connected before sending
    pub wait_ready: bool,
    /// Per producer delay between connecting and the first send
    pub delay_send_ms: u64,
    /// Hard wall-clock limit regardless of termination mode
    pub max_duration_secs: Option<u64>,
    pub check_initial_delay_ms: u64,
    pub check_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            termination: Termination::Duration,
            duration_secs: 60,
            messages_per_destination: 0,
            snapshot_interval_secs: 1,
            stats_mode: RateMode::Interval,
            begin_stats_secs: 0,
            reset_after_received: 0,
            consumer_ready_timeout_ms: 30_000,
            consumer_start_delay_ms: 0,
            wait_ready: false,
            delay_send_ms: 0,
            max_duration_secs: None,
            check_initial_delay_ms: 1000,
            check_interval_ms: 2000,
            shutdown_grace_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Queue,
    Topic,
    /// Shared topic subscriptions, consumers only
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub kind: MessageKind,
    /// Producers are created without a destination and name it per send
    pub anonymous_producers: bool,
    pub priority: u8,
    pub time_to_live_ms: u64,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            min_size: 128,
            max_size: 128,
            kind: MessageKind::Queue,
            anonymous_producers: false,
            priority: 4,
            time_to_live_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlMode {
    Disabled,
    /// Every producer thread paces itself at global/producers
    #[default]
    PerThread,
    /// One controller thread drips tokens to every producer
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampStep {
    /// Target global messages per second
    pub tps: u64,
    /// Duration to hold this rate in milliseconds
    pub hold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Global messages/second across all producer threads
    pub global_rate: Option<u64>,
    pub mode: RateControlMode,
    /// Ticks per second of the shared controller thread
    pub batch_rate: u64,
    pub controller_cpu: Option<usize>,
    pub ramp: Vec<RampStep>,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            global_rate: None,
            mode: RateControlMode::PerThread,
            batch_rate: 1000,
            controller_cpu: None,
            ramp: Vec::new(),
        }
    }
}

impl RateConfig {
    pub fn effective_rate(&self) -> u64 {
        match self.mode {
            RateControlMode::Disabled => MAX_GLOBAL_RATE,
            _ => self.global_rate.unwrap_or(DEFAULT_GLOBAL_RATE),
        }
    }
}

/// Latency measurement categories and their mask bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyCategory {
    RoundTrip,
    Commit,
    Receive,
    Send,
    Connect,
    Session,
}

/// Mask bit asking for the min/max average round-trip destinations.
pub const RTT_EXTREMES_BIT: u32 = 0x2;

impl LatencyCategory {
    pub const ALL: [LatencyCategory; 6] = [
        LatencyCategory::RoundTrip,
        LatencyCategory::Commit,
        LatencyCategory::Receive,
        LatencyCategory::Send,
        LatencyCategory::Connect,
        LatencyCategory::Session,
    ];

    pub fn bit(self) -> u32 {
        match self {
            LatencyCategory::RoundTrip => 0x1,
            LatencyCategory::Commit => 0x4,
            LatencyCategory::Receive => 0x8,
            LatencyCategory::Send => 0x10,
            LatencyCategory::Connect => 0x20,
            LatencyCategory::Session => 0x40,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LatencyCategory::RoundTrip => "RTT",
            LatencyCategory::Commit => "Commit",
            LatencyCategory::Receive => "Recv",
            LatencyCategory::Send => "Send",
            LatencyCategory::Connect => "Connect",
            LatencyCategory::Session => "Session",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Bitmask of enabled categories (see [`LatencyCategory::bit`])
    pub mask: u32,
    /// Seconds per latency unit, 1e-6 stores microseconds
    pub units_secs: f64,
    /// Round-trip samples per second across all producers
    pub sample_rate: u64,
    pub histogram_size: usize,
    /// Reset round-trip histograms every N seconds, 0 never
    pub rtt_reset_secs: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            mask: 0,
            units_secs: 1e-6,
            sample_rate: 1000,
            histogram_size: MAX_LATENCY,
            rtt_reset_secs: 0,
        }
    }
}

impl LatencyConfig {
    pub fn enabled(&self, category: LatencyCategory) -> bool {
        self.mask & category.bit() == category.bit()
    }

    pub fn report_extremes(&self) -> bool {
        self.mask & RTT_EXTREMES_BIT == RTT_EXTREMES_BIT
    }

    pub fn units_per_sec(&self) -> f64 {
        if self.units_secs > 0.0 {
            1.0 / self.units_secs
        } else {
            1e6
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Spread destinations cyclically over the thread/connection/session grid
    pub round_robin: bool,
    /// Partition count for multi-level names, 0 disables partitioning
    pub partitions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Client acknowledgements every N messages per session
    pub ack_interval: u32,
    pub disable_ack: bool,
    pub receive_timeout_ms: u64,
    /// Poll period of "blocking" receives, bounds cancellation latency
    pub poll_interval_ms: u64,
    /// Receive timeouts tolerated in count mode before giving up
    pub max_receive_timeouts: u32,
    /// >0: SHA-1 digests of each body, <0: sleep |n| microseconds
    pub app_sim_loop: i64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_interval: 100,
            disable_ack: false,
            receive_timeout_ms: 1000,
            poll_interval_ms: 100,
            max_receive_timeouts: 60,
            app_sim_loop: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server endpoints, connections are spread over them round-robin
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:16102".to_string()],
            username: None,
            password: None,
        }
    }
}

/// Naming and fan-out shared by producer and consumer specs.
///
/// A negative count still creates |n| of that dimension but leaves it out of
/// the numeric name suffix, so e.g. `threads = -4` makes four threads that
/// all use the same destination names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationLayout {
    pub name: String,
    pub per_session: i32,
    pub sessions: i32,
    pub connections: i32,
    pub threads: i32,
    pub start_index: u32,
}

impl Default for DestinationLayout {
    fn default() -> Self {
        Self {
            name: String::new(),
            per_session: 1,
            sessions: 1,
            connections: 1,
            threads: 1,
            start_index: 0,
        }
    }
}

impl DestinationLayout {
    pub fn is_wildcard(&self) -> bool {
        is_wildcard(&self.name)
    }

    fn validate(&self, partitions: u32) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("destination name must not be empty".into()));
        }
        for (field, value) in [
            ("per_session", self.per_session),
            ("sessions", self.sessions),
            ("connections", self.connections),
            ("threads", self.threads),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{field} of '{}' must not be zero",
                    self.name
                )));
            }
        }
        if partitions > 0 && !self.name.contains('/') {
            return Err(ConfigError::MissingPartitionSeparator(self.name.clone()));
        }
        Ok(())
    }
}

pub fn is_wildcard(name: &str) -> bool {
    name.contains('#') || name.contains('+')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSpec {
    pub cpu: Option<usize>,
    /// Sends per commit, 0 means a non-transacted session
    pub commit_interval: u32,
    pub persistent: bool,
    #[serde(flatten)]
    pub layout: DestinationLayout,
}

impl Default for ProducerSpec {
    fn default() -> Self {
        Self {
            cpu: None,
            commit_interval: 0,
            persistent: true,
            layout: DestinationLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    #[default]
    Blocking,
    BlockingTimeout,
    NonBlocking,
    Listener,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSpec {
    pub cpu: Option<usize>,
    /// Receives per commit, 0 means a non-transacted session
    pub commit_interval: u32,
    pub receive_mode: ReceiveMode,
    pub ack_mode: AckMode,
    pub durable: bool,
    #[serde(flatten)]
    pub layout: DestinationLayout,
}

impl Default for ConsumerSpec {
    fn default() -> Self {
        Self {
            cpu: None,
            commit_interval: 0,
            receive_mode: ReceiveMode::Blocking,
            ack_mode: AckMode::DupsOk,
            durable: false,
            layout: DestinationLayout::default(),
        }
    }
}

struct Tokens<'a> {
    kind: &'static str,
    token: &'a str,
    parts: std::str::Split<'a, char>,
}

impl<'a> Tokens<'a> {
    fn new(kind: &'static str, token: &'a str) -> Self {
        Self {
            kind,
            token,
            parts: token.split(':'),
        }
    }

    fn error(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidSpec {
            kind: self.kind,
            token: self.token.to_string(),
            reason: reason.into(),
        }
    }

    fn text(&mut self, field: &str) -> Result<&'a str, ConfigError> {
        match self.parts.next() {
            Some(part) if !part.is_empty() => Ok(part),
            _ => Err(self.error(format!("missing {field}"))),
        }
    }

    fn number<T: FromStr>(&mut self, field: &str) -> Result<T, ConfigError> {
        let raw = self.text(field)?;
        raw.trim()
            .parse()
            .map_err(|_| self.error(format!("{field} '{raw}' is not a number")))
    }

    fn optional<T: FromStr>(&mut self, field: &str) -> Result<Option<T>, ConfigError> {
        match self.parts.next() {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.error(format!("{field} '{raw}' is not a number"))),
        }
    }

    fn cpu(&mut self) -> Result<Option<usize>, ConfigError> {
        let cpu: i64 = self.number("cpu")?;
        Ok(usize::try_from(cpu).ok())
    }

    fn flag(&mut self, field: &str) -> Result<bool, ConfigError> {
        match self.number::<u8>(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.error(format!("{field} must be 0 or 1, got {other}"))),
        }
    }

    fn layout(&mut self) -> Result<DestinationLayout, ConfigError> {
        let mut layout = DestinationLayout {
            name: self.text("name")?.to_string(),
            per_session: self.number("qtps")?,
            sessions: self.number("spc")?,
            connections: self.number("cpt")?,
            ..DestinationLayout::default()
        };
        if let Some(threads) = self.optional("nthrd")? {
            layout.threads = threads;
        }
        if let Some(start) = self.optional("snum")? {
            layout.start_index = start;
        }
        if self.parts.next().is_some() {
            return Err(self.error("too many fields"));
        }
        Ok(layout)
    }
}

/// `cpu:commit:persistent:name:qtps:spc:cpt[:nthrd[:snum]]`
impl FromStr for ProducerSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = Tokens::new("producer", s.trim());
        Ok(Self {
            cpu: tokens.cpu()?,
            commit_interval: tokens.number("msgs/commit")?,
            persistent: tokens.flag("persistent")?,
            layout: tokens.layout()?,
        })
    }
}

/// `cpu:commit:receiveMode:ackMode:durable:name:qtps:spc:cpt[:nthrd[:snum]]`
impl FromStr for ConsumerSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = Tokens::new("consumer", s.trim());
        let cpu = tokens.cpu()?;
        let commit_interval = tokens.number("msgs/commit")?;
        let receive_mode = match tokens.number::<u8>("receiveMode")? {
            0 => ReceiveMode::Blocking,
            1 => ReceiveMode::BlockingTimeout,
            2 => ReceiveMode::NonBlocking,
            3 => ReceiveMode::Listener,
            other => return Err(tokens.error(format!("unknown receive mode {other}"))),
        };
        let ack_mode = match tokens.number::<u8>("ackMode")? {
            0 => AckMode::Transacted,
            1 => AckMode::Auto,
            2 => AckMode::Client,
            3 => AckMode::DupsOk,
            other => return Err(tokens.error(format!("unknown ack mode {other}"))),
        };
        Ok(Self {
            cpu,
            commit_interval,
            receive_mode,
            ack_mode,
            durable: tokens.flag("durable")?,
            layout: tokens.layout()?,
        })
    }
}

/// Parses a comma separated list of compact specs.
pub fn parse_spec_list<T>(list: &str) -> Result<Vec<T>, ConfigError>
where
    T: FromStr<Err = ConfigError>,
{
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[run]
id = "nightly"
termination = "count"
messages_per_destination = 500

[messages]
min_size = 64
max_size = 1024
kind = "topic"

[rate]
global_rate = 20000
mode = "shared"
controller_cpu = 3

[[rate.ramp]]
tps = 1000
hold_ms = 5000

[latency]
mask = 0x1d
sample_rate = 500

[server]
endpoints = ["10.0.0.1:16102", "10.0.0.2:16102"]

[[producers]]
name = "orders"
per_session = 4
commit_interval = 10

[[consumers]]
name = "orders"
per_session = 4
receive_mode = "listener"
ack_mode = "client"
durable = true
        "#;

        let mut config = BenchConfig::from_toml(config_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.run.id, "nightly");
        assert_eq!(config.run.termination, Termination::Count);
        assert_eq!(config.run.snapshot_interval_secs, 1);
        assert_eq!(config.messages.kind, MessageKind::Topic);
        assert_eq!(config.rate.effective_rate(), 20000);
        assert_eq!(config.rate.mode, RateControlMode::Shared);
        assert_eq!(config.rate.ramp.len(), 1);
        assert!(config.latency.enabled(LatencyCategory::RoundTrip));
        assert!(config.latency.enabled(LatencyCategory::Send));
        assert!(!config.latency.enabled(LatencyCategory::Connect));
        assert!(!config.latency.report_extremes());
        assert_eq!(config.server.endpoints.len(), 2);
        assert_eq!(config.producers[0].layout.per_session, 4);
        assert_eq!(config.producers[0].layout.sessions, 1);
        assert!(config.producers[0].persistent);
        assert_eq!(config.consumers[0].receive_mode, ReceiveMode::Listener);
        assert_eq!(config.consumers[0].ack_mode, AckMode::Client);
        assert_eq!(config.destination_kind(), DestinationKind::Topic);
    }

    #[test]
    fn test_defaults() {
        let config = BenchConfig::default();
        assert_eq!(config.messages.min_size, 128);
        assert_eq!(config.rate.effective_rate(), DEFAULT_GLOBAL_RATE);
        assert_eq!(config.latency.histogram_size, MAX_LATENCY);
        assert_eq!(config.latency.units_per_sec(), 1e6);
        assert_eq!(config.consumer.ack_interval, 100);
        assert_eq!(config.run.check_interval_ms, 2000);
    }

    #[test]
    fn test_parse_producer_token() {
        let spec: ProducerSpec = "1:10:0:orders:4:2:3".parse().unwrap();
        assert_eq!(spec.cpu, Some(1));
        assert_eq!(spec.commit_interval, 10);
        assert!(!spec.persistent);
        assert_eq!(spec.layout.name, "orders");
        assert_eq!(spec.layout.per_session, 4);
        assert_eq!(spec.layout.sessions, 2);
        assert_eq!(spec.layout.connections, 3);
        assert_eq!(spec.layout.threads, 1);

        let spec: ProducerSpec = "-1:0:1:q:-1:1:1:-8:100".parse().unwrap();
        assert_eq!(spec.cpu, None);
        assert_eq!(spec.layout.per_session, -1);
        assert_eq!(spec.layout.threads, -8);
        assert_eq!(spec.layout.start_index, 100);
    }

    #[test]
    fn test_parse_consumer_token() {
        let spec: ConsumerSpec = "2:0:1:2:1:t/#:1:1:1:4".parse().unwrap();
        assert_eq!(spec.cpu, Some(2));
        assert_eq!(spec.receive_mode, ReceiveMode::BlockingTimeout);
        assert_eq!(spec.ack_mode, AckMode::Client);
        assert!(spec.durable);
        assert!(spec.layout.is_wildcard());
        assert_eq!(spec.layout.threads, 4);
    }

    #[test]
    fn test_parse_rejects_bad_tokens() {
        assert!("1:1:1:q:1:1".parse::<ProducerSpec>().is_err());
        assert!("1:x:1:q:1:1:1".parse::<ProducerSpec>().is_err());
        assert!("1:1:1:q:1:1:1:1:1:9".parse::<ProducerSpec>().is_err());
        assert!("1:0:7:0:0:q:1:1:1".parse::<ConsumerSpec>().is_err());
        assert!("1:0:0:0:2:q:1:1:1".parse::<ConsumerSpec>().is_err());
    }

    #[test]
    fn test_parse_spec_list() {
        let specs: Vec<ProducerSpec> = parse_spec_list("0:0:1:a:1:1:1,1:0:1:b:1:1:1").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].layout.name, "b");
    }

    fn base() -> BenchConfig {
        BenchConfig {
            producers: vec!["-1:0:1:q:1:1:1".parse().unwrap()],
            consumers: vec!["-1:0:0:3:0:q:1:1:1".parse().unwrap()],
            ..BenchConfig::default()
        }
    }

    #[test]
    fn test_validate_normalises_sizes() {
        let mut config = base();
        config.messages.min_size = 4;
        config.messages.max_size = 10;
        config.validate().unwrap();
        assert_eq!(config.messages.min_size, HEADER_LEN);
        assert_eq!(config.messages.max_size, HEADER_LEN);
    }

    #[test]
    fn test_validate_rejects_conflicts() {
        let mut config = base();
        config.rate.mode = RateControlMode::Disabled;
        config.rate.global_rate = Some(100);
        assert!(matches!(config.validate(), Err(ConfigError::ConflictingRate(100))));

        let mut config = base();
        config.consumers[0].durable = true;
        assert!(matches!(config.validate(), Err(ConfigError::DurableOnQueue(_))));

        let mut config = base();
        config.messages.kind = MessageKind::Shared;
        assert!(matches!(config.validate(), Err(ConfigError::SharedProducer(_))));

        let mut config = base();
        config.topology.partitions = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPartitionSeparator(_))
        ));

        let mut config = base();
        config.producers.clear();
        config.consumers.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoWorkers)));

        let mut config = base();
        config.run.termination = Termination::Count;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_wait_ready_needs_two_producers() {
        let mut config = base();
        config.run.wait_ready = true;
        config.validate().unwrap();
        assert!(!config.run.wait_ready);
    }
}
