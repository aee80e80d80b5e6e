use super::state::{RunContext, WorkerShared};
use super::pin_to_cpu;
use crate::client::{AckMode, Connection, Destination, DestinationKind, Producer, SendOptions, Session};
use crate::clock::epoch_nanos;
use crate::config::{LatencyCategory, ProducerSpec};
use crate::error::{ClientError, WorkerError};
use crate::frame::{size_progression, FrameHeader};
use crate::rate_controller::Pacing;
use crate::sampler::MessageSampler;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

struct SessionState {
    session: Box<dyn Session>,
    transacted: bool,
    uncommitted: u32,
}

struct Link {
    descriptor: usize,
    destination: Destination,
    producer: usize,
    session: usize,
    /// Send the destination in every call (anonymous producers)
    explicit: bool,
    size_cursor: usize,
    sent: u64,
}

/// Open connections, sessions and producers of one producer thread.
struct Wiring {
    connections: Vec<Box<dyn Connection>>,
    sessions: Vec<SessionState>,
    producers: Vec<Box<dyn Producer>>,
    links: Vec<Link>,
}

fn connect(ctx: &RunContext, worker: &WorkerShared, spec: &ProducerSpec) -> Result<Wiring, WorkerError> {
    let kind = ctx.config.destination_kind();
    let anonymous = ctx.config.messages.anonymous_producers;
    let credentials = super::credentials(ctx);
    let mut wiring = Wiring {
        connections: Vec::new(),
        sessions: Vec::new(),
        producers: Vec::new(),
        links: Vec::new(),
    };
    let mut current: Option<(usize, usize)> = None;
    let mut session_producer: Option<usize> = None;

    for (index, descriptor) in worker.destinations.iter().enumerate() {
        if wiring.connections.len() <= descriptor.connection {
            let client_id = format!("{}_p{}_conn{}", ctx.config.run.id, worker.id, descriptor.connection);
            let connection = ctx.timed(worker.call_histogram(LatencyCategory::Connect), || {
                ctx.client
                    .connect(&descriptor.endpoint, Some(&client_id), credentials.as_ref())
            })?;
            debug!(worker = %worker.label, endpoint = %descriptor.endpoint, client_id, "connected");
            wiring.connections.push(connection);
        }
        if current != Some((descriptor.connection, descriptor.session)) {
            current = Some((descriptor.connection, descriptor.session));
            let transacted = spec.commit_interval > 0;
            let connection = &mut wiring.connections[descriptor.connection];
            let session = ctx.timed(worker.call_histogram(LatencyCategory::Session), || {
                connection.create_session(transacted, AckMode::Auto)
            })?;
            wiring.sessions.push(SessionState {
                session,
                transacted,
                uncommitted: 0,
            });
            session_producer = None;
        }
        let session_index = wiring.sessions.len() - 1;
        let destination = match kind {
            DestinationKind::Queue => Destination::queue(&descriptor.name),
            DestinationKind::Topic => Destination::topic(&descriptor.name),
        };

        let producer = match (anonymous, session_producer) {
            (true, Some(existing)) => existing,
            (true, None) => {
                let producer = wiring.sessions[session_index].session.create_producer(None)?;
                wiring.producers.push(producer);
                session_producer = Some(wiring.producers.len() - 1);
                wiring.producers.len() - 1
            }
            (false, _) => {
                let producer = wiring.sessions[session_index]
                    .session
                    .create_producer(Some(&destination))?;
                wiring.producers.push(producer);
                wiring.producers.len() - 1
            }
        };
        wiring.links.push(Link {
            descriptor: index,
            destination,
            producer,
            session: session_index,
            explicit: anonymous,
            size_cursor: 0,
            sent: 0,
        });
    }
    Ok(wiring)
}

fn commit(ctx: &RunContext, worker: &WorkerShared, state: &mut SessionState) -> Result<(), WorkerError> {
    state.uncommitted = 0;
    let result = ctx.timed(worker.call_histogram(LatencyCategory::Commit), || {
        state.session.commit()
    });
    match result {
        Ok(()) => Ok(()),
        Err(e @ ClientError::Closed(_)) => Err(e.into()),
        Err(e) => {
            warn!(worker = %worker.label, error = %e, "commit failed");
            worker.add_error();
            Ok(())
        }
    }
}

/// Connects, then sends round-robin over the worker's destinations until
/// stopped or, in count mode, until every destination got its messages.
pub fn run(
    ctx: &RunContext,
    worker: &WorkerShared,
    spec: &ProducerSpec,
    mut pacing: Pacing,
) -> Result<(), WorkerError> {
    if let Some(cpu) = worker.cpu {
        pin_to_cpu(&worker.label, cpu);
    }
    let mut wiring = connect(ctx, worker, spec)?;
    worker.mark_ready();
    ctx.connected_producers.fetch_add(1, Ordering::AcqRel);
    info!(
        worker = %worker.label,
        destinations = wiring.links.len(),
        sessions = wiring.sessions.len(),
        "producer ready"
    );

    let done = worker.done_flag();
    if ctx.config.run.wait_ready {
        while ctx.connected_producers.load(Ordering::Acquire) < ctx.num_producers {
            if done.load(Ordering::Relaxed) {
                break;
            }
            ctx.clock.yield_now();
        }
    }
    if ctx.config.run.delay_send_ms > 0 {
        ctx.sleep_unless(Duration::from_millis(ctx.config.run.delay_send_ms), done);
    }

    let rtt = ctx.config.latency.enabled(LatencyCategory::RoundTrip);
    let producers = ctx.num_producers.max(1) as f64;
    let mut sampler = rtt.then(|| {
        MessageSampler::new(
            ctx.clock.clone(),
            ctx.config.latency.sample_rate as f64 / producers,
            ctx.config.rate.effective_rate() as f64 / producers,
        )
    });
    let sizes = size_progression(ctx.config.messages.min_size, ctx.config.messages.max_size);
    let options = SendOptions {
        persistent: spec.persistent,
        priority: ctx.config.messages.priority,
        time_to_live: Duration::from_millis(ctx.config.messages.time_to_live_ms),
    };
    let count_mode = ctx.count_mode();
    let per_destination = ctx.per_destination();

    'outer: while !done.load(Ordering::Relaxed) {
        let mut active = false;
        for link in wiring.links.iter_mut() {
            if count_mode && link.sent >= per_destination {
                continue;
            }
            active = true;
            if !pacing.wait(done) {
                break 'outer;
            }
            let stats = &worker.destinations[link.descriptor].stats;
            let sampled = sampler.as_mut().map_or(false, MessageSampler::should_sample);
            let timestamp = if sampled { epoch_nanos() } else { 0 };
            let size = sizes[link.size_cursor];
            link.size_cursor = (link.size_cursor + 1) % sizes.len();
            let frame = FrameHeader::new(sampled, timestamp, stats.count() + 1, size).encode();

            let producer = &mut wiring.producers[link.producer];
            let target = link.explicit.then_some(&link.destination);
            let result = ctx.timed(worker.call_histogram(LatencyCategory::Send), || {
                producer.send(target, frame, &options)
            });
            match result {
                Ok(()) => {
                    link.sent = stats.increment();
                    worker.add_count();
                }
                Err(e @ ClientError::Closed(_)) => return Err(e.into()),
                Err(e) => {
                    warn!(worker = %worker.label, destination = %link.destination.name, error = %e, "send failed");
                    worker.add_error();
                    continue;
                }
            }
            if count_mode && link.sent >= per_destination {
                stats.mark_done();
            }

            let session = &mut wiring.sessions[link.session];
            if session.transacted {
                session.uncommitted += 1;
                if session.uncommitted >= worker.commit_interval().max(1) {
                    commit(ctx, worker, session)?;
                }
            }
        }
        if !active {
            break;
        }
    }

    for state in wiring.sessions.iter_mut() {
        if state.transacted && state.uncommitted > 0 {
            commit(ctx, worker, state)?;
        }
    }
    drop(wiring.producers);
    drop(wiring.sessions);
    for mut connection in wiring.connections {
        if let Err(e) = connection.close() {
            warn!(worker = %worker.label, error = %e, "close failed");
        }
    }
    info!(worker = %worker.label, sent = worker.count(), "producer finished");
    Ok(())
}
