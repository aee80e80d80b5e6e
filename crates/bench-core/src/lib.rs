pub mod checker;
pub mod client;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod histogram;
pub mod memory;
pub mod ramp;
pub mod rate_controller;
pub mod sampler;
pub mod stats;
pub mod supervisor;
pub mod topology;
pub mod worker;

pub use checker::*;
pub use client::*;
pub use clock::*;
pub use command::*;
pub use config::*;
pub use error::{BenchError, ClientError, CommandError, ConfigError, FrameError, WorkerError};
pub use frame::*;
pub use histogram::*;
pub use memory::*;
pub use ramp::*;
pub use rate_controller::*;
pub use sampler::*;
pub use stats::*;
pub use supervisor::*;
pub use topology::*;
pub use worker::{RunContext, WorkerShared};
