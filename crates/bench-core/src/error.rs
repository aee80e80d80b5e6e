use thiserror::Error;

/// Problems found while loading or validating a run configuration.
/// All of these are fatal before any worker thread starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {kind} spec '{token}': {reason}")]
    InvalidSpec {
        kind: &'static str,
        token: String,
        reason: String,
    },

    #[error("rate control is disabled but a global rate of {0} msgs/sec was requested")]
    ConflictingRate(u64),

    #[error("durable subscription on '{0}' requires topic destinations")]
    DurableOnQueue(String),

    #[error("shared subscriptions are consumer only, producer '{0}' asked for one")]
    SharedProducer(String),

    #[error("partitioned destination name '{0}' must look like <partition>/<name>")]
    MissingPartitionSeparator(String),

    #[error(
        "destination '{name}' has producers but no consumers; fixed count queue runs need every destination drained"
    )]
    UnderSubscribed { name: String },

    #[error("fewer destinations are consumed ({consumed}) than produced ({produced})")]
    UnderSubscribedCount { consumed: usize, produced: usize },

    #[error("at least one producer or one consumer must be configured")]
    NoWorkers,

    #[error("no server endpoints configured")]
    NoEndpoints,

    #[error("{0}")]
    Invalid(String),
}

/// Payload framing violations. Always fatal for the worker that sees one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes is shorter than the {min} byte header")]
    TooShort { len: usize, min: usize },

    #[error("frame length field says {declared} bytes but {actual} arrived")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("invalid sampling flag byte {0:#04x}")]
    InvalidFlag(u8),
}

/// Failures reported by a messaging client implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("bad frame on destination {destination}: {source}")]
    Frame {
        destination: String,
        #[source]
        source: FrameError,
    },

    #[error("{worker}: only {received} of {expected} messages were received before the receive timeout budget ran out")]
    ReceiveIncomplete {
        worker: String,
        received: u64,
        expected: u64,
    },

    #[error("listener failure: {0}")]
    Listener(String),
}

/// Unparseable console command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command '{0}', type 'help' for the list")]
    Unknown(String),

    #[error("command '{command}' needs a number, got '{value}'")]
    InvalidNumber { command: String, value: String },

    #[error("command '{0}' needs a value")]
    MissingValue(String),
}

/// Top level error returned by the run supervisor.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("{worker} failed during startup: {reason}")]
    Startup { worker: String, reason: String },

    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = BenchError> = std::result::Result<T, E>;
