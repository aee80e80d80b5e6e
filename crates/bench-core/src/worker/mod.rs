//! Producer and consumer worker threads.
//!
//! Each worker owns its connections, sessions and destinations for the
//! whole run; the supervisor only sees the [`WorkerShared`] counters.

pub mod consumer;
pub mod producer;
mod state;

pub use state::{RunContext, WorkerShared};

use crate::client::Credentials;
use crate::config::{ConsumerSpec, ProducerSpec};
use crate::error::{BenchError, WorkerError};
use crate::rate_controller::Pacing;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) fn credentials(ctx: &RunContext) -> Option<Credentials> {
    let server = &ctx.config.server;
    server.username.as_ref().map(|username| Credentials {
        username: username.clone(),
        password: server.password.clone().unwrap_or_default(),
    })
}

/// Pins the calling thread to `cpu`. Unknown CPUs are logged and ignored.
pub fn pin_to_cpu(label: &str, cpu: usize) {
    let Some(cores) = core_affinity::get_core_ids() else {
        warn!(thread = label, cpu, "cannot list cpus, affinity hint ignored");
        return;
    };
    match cores.into_iter().find(|core| core.id == cpu) {
        Some(core) if core_affinity::set_for_current(core) => {
            debug!(thread = label, cpu, "pinned");
        }
        Some(_) => warn!(thread = label, cpu, "failed to set cpu affinity"),
        None => warn!(thread = label, cpu, "unknown cpu, affinity hint ignored"),
    }
}

fn complete(worker: &WorkerShared, result: Result<(), WorkerError>) {
    if let Err(e) = result {
        error!(worker = %worker.label, error = %e, "worker failed");
        worker.fail(e.to_string());
    }
    worker.finish();
}

pub fn spawn_producer(
    ctx: Arc<RunContext>,
    worker: Arc<WorkerShared>,
    spec: ProducerSpec,
    pacing: Pacing,
) -> Result<JoinHandle<()>, BenchError> {
    let name = worker.label.clone();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let result = producer::run(&ctx, &worker, &spec, pacing);
            complete(&worker, result);
        })
        .map_err(|source| BenchError::Spawn { name, source })
}

pub fn spawn_consumer(
    ctx: Arc<RunContext>,
    worker: Arc<WorkerShared>,
    spec: ConsumerSpec,
) -> Result<JoinHandle<()>, BenchError> {
    let name = worker.label.clone();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let result = consumer::run(&ctx, &worker, &spec);
            complete(&worker, result);
        })
        .map_err(|source| BenchError::Spawn { name, source })
}
