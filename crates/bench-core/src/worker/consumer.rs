use super::state::{RunContext, WorkerShared};
use super::pin_to_cpu;
use crate::client::{
    AckMode, Connection, Consumer, Destination, DestinationKind, Message, Session, Subscription,
};
use crate::clock::{epoch_nanos, to_units};
use crate::config::{ConsumerSpec, LatencyCategory, MessageKind, ReceiveMode};
use crate::error::{ClientError, WorkerError};
use crate::frame::FrameHeader;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A session plus its commit/ack bookkeeping. Shared with the client's
/// delivery threads in listener mode.
pub struct SessionSlot {
    session: Mutex<Box<dyn Session>>,
    transacted: bool,
    client_ack: bool,
    pending: AtomicU32,
}

impl SessionSlot {
    fn new(session: Box<dyn Session>, transacted: bool, client_ack: bool) -> Self {
        Self {
            session: Mutex::new(session),
            transacted,
            client_ack,
            pending: AtomicU32::new(0),
        }
    }

    /// Counts one message; true when `interval` messages are pending.
    fn tick(&self, interval: u32) -> bool {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= interval.max(1) {
            self.pending.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }
}

struct Subscriber {
    descriptor: usize,
    slot: Arc<SessionSlot>,
    consumer: Box<dyn Consumer>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pull {
    Blocking,
    Timeout,
    NoWait,
}

fn commit(ctx: &RunContext, worker: &WorkerShared, slot: &SessionSlot) -> Result<(), WorkerError> {
    let result = ctx.timed(worker.call_histogram(LatencyCategory::Commit), || {
        slot.session.lock().commit()
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

/// Burns consumer CPU per message: `n > 0` SHA-1 digests of the body,
/// `n < 0` a sleep of |n| microseconds.
fn simulate_work(loops: i64, body: &[u8]) {
    if loops > 0 {
        let mut digest = sha1_smol::Sha1::new();
        for _ in 0..loops {
            digest.reset();
            digest.update(body);
            std::hint::black_box(digest.digest());
        }
    } else if loops < 0 {
        std::thread::sleep(Duration::from_micros(loops.unsigned_abs()));
    }
}

/// Validation, measurement and ack handling for one received message,
/// whichever way it was delivered.
fn process_message(
    ctx: &RunContext,
    worker: &WorkerShared,
    slot: &SessionSlot,
    index: usize,
    message: &Message,
) -> Result<(), WorkerError> {
    let descriptor = &worker.destinations[index];
    let header = FrameHeader::decode(message.body()).map_err(|source| WorkerError::Frame {
        destination: descriptor.name.clone(),
        source,
    })?;
    if header.sampled {
        if let Some(rtt) = descriptor.stats.rtt() {
            let latency = to_units(
                epoch_nanos().saturating_sub(header.timestamp),
                ctx.units_per_sec,
            );
            rtt.record(latency, header.sequence);
        }
    }
    simulate_work(ctx.config.consumer.app_sim_loop, message.body());

    let received = descriptor.stats.increment();
    worker.add_count();

    if slot.transacted {
        if slot.tick(worker.commit_interval()) {
            commit(ctx, worker, slot)?;
        }
    } else if slot.client_ack && slot.tick(ctx.config.consumer.ack_interval) {
        message.acknowledge()?;
        descriptor.stats.record_ack(header.sequence);
    }

    let expected = worker.expected[index];
    if ctx.count_mode() && expected > 0 && received >= expected {
        descriptor.stats.mark_done();
    }
    Ok(())
}

fn subscribe(
    ctx: &Arc<RunContext>,
    worker: &Arc<WorkerShared>,
    spec: &ConsumerSpec,
) -> Result<(Vec<Box<dyn Connection>>, Vec<Subscriber>), WorkerError> {
    let kind = ctx.config.destination_kind();
    let shared = ctx.config.messages.kind == MessageKind::Shared;
    let credentials = super::credentials(ctx);
    let transacted = spec.commit_interval > 0 || spec.ack_mode == AckMode::Transacted;
    let client_ack = spec.ack_mode == AckMode::Client && !ctx.config.consumer.disable_ack;

    let mut connections: Vec<Box<dyn Connection>> = Vec::new();
    let mut client_ids: Vec<Option<String>> = Vec::new();
    let mut subscribers = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut slot: Option<Arc<SessionSlot>> = None;

    for (index, descriptor) in worker.destinations.iter().enumerate() {
        if connections.len() <= descriptor.connection {
            let client_id = (!shared).then(|| {
                format!("{}_c{}_conn{}", ctx.config.run.id, worker.id, descriptor.connection)
            });
            let connection = ctx.timed(worker.call_histogram(LatencyCategory::Connect), || {
                ctx.client
                    .connect(&descriptor.endpoint, client_id.as_deref(), credentials.as_ref())
            })?;
            debug!(worker = %worker.label, endpoint = %descriptor.endpoint, "connected");
            connections.push(connection);
            client_ids.push(client_id);
        }
        let key = (descriptor.connection, descriptor.session);
        let session_slot = match slot.clone() {
            Some(existing) if current == Some(key) => existing,
            _ => {
                let connection = &mut connections[descriptor.connection];
                let session = ctx.timed(worker.call_histogram(LatencyCategory::Session), || {
                    connection.create_session(transacted, spec.ack_mode)
                })?;
                let created = Arc::new(SessionSlot::new(session, transacted, client_ack));
                current = Some(key);
                slot = Some(created.clone());
                created
            }
        };

        let destination = match kind {
            DestinationKind::Queue => Destination::queue(&descriptor.name),
            DestinationKind::Topic => Destination::topic(&descriptor.name),
        };
        let subscription = if shared {
            Subscription::Shared {
                name: format!("{}_ss", descriptor.name),
                durable: spec.durable,
            }
        } else if spec.durable {
            let owner = client_ids[descriptor.connection]
                .as_deref()
                .unwrap_or(&worker.label);
            Subscription::Durable {
                name: format!("{}_{}", owner, descriptor.name),
            }
        } else {
            Subscription::Plain
        };
        let mut consumer = session_slot
            .session
            .lock()
            .create_consumer(&destination, &subscription, None)?;

        if spec.receive_mode == ReceiveMode::Listener {
            let (ctx, worker, callback_slot) = (ctx.clone(), worker.clone(), session_slot.clone());
            consumer.set_delivery_callback(Box::new(move |message| {
                if worker.is_done() {
                    return;
                }
                if let Err(e) = process_message(&ctx, &worker, &callback_slot, index, &message) {
                    error!(worker = %worker.label, error = %e, "listener failed");
                    worker.fail(e.to_string());
                }
            }))?;
        }
        subscribers.push(Subscriber {
            descriptor: index,
            slot: session_slot,
            consumer,
        });
    }
    Ok((connections, subscribers))
}

fn pull_loop(
    ctx: &RunContext,
    worker: &WorkerShared,
    subscribers: &mut [Subscriber],
    mode: Pull,
) -> Result<(), WorkerError> {
    let count_mode = ctx.count_mode();
    let budget = u64::from(ctx.config.consumer.max_receive_timeouts);
    let poll = Duration::from_millis(ctx.config.consumer.poll_interval_ms.max(1));
    let timeout = Duration::from_millis(ctx.config.consumer.receive_timeout_ms.max(1));
    let receive_hist = worker.call_histogram(LatencyCategory::Receive);

    while !worker.is_done() {
        if count_mode && worker.all_destinations_done() {
            break;
        }
        let mut received_any = false;
        for sub in subscribers.iter_mut() {
            if worker.is_done() {
                break;
            }
            let stats = &worker.destinations[sub.descriptor].stats;
            if count_mode && stats.is_done() {
                continue;
            }
            let message = match mode {
                Pull::Blocking => loop {
                    match ctx.timed(receive_hist, || sub.consumer.receive(Some(poll)))? {
                        Some(message) => break Some(message),
                        None if worker.is_done() || (count_mode && stats.is_done()) => break None,
                        None => continue,
                    }
                },
                Pull::Timeout => {
                    let message = ctx.timed(receive_hist, || sub.consumer.receive(Some(timeout)))?;
                    if message.is_none() && !worker.is_done() && !stats.is_done() {
                        let timeouts = worker.add_timeout();
                        warn!(
                            worker = %worker.label,
                            destination = %worker.destinations[sub.descriptor].name,
                            timeouts,
                            "receive timed out"
                        );
                        if count_mode && timeouts > budget {
                            return Err(WorkerError::ReceiveIncomplete {
                                worker: worker.label.clone(),
                                received: worker.count(),
                                expected: worker.expected_total(ctx.per_destination()),
                            });
                        }
                    }
                    message
                }
                Pull::NoWait => ctx.timed(receive_hist, || sub.consumer.receive_no_wait())?,
            };
            if let Some(message) = message {
                received_any = true;
                process_message(ctx, worker, &sub.slot, sub.descriptor, &message)?;
            }
        }
        if mode == Pull::NoWait && !received_any {
            ctx.clock.yield_now();
        }
    }
    Ok(())
}

fn wait_listener(ctx: &RunContext, worker: &WorkerShared) -> Result<(), WorkerError> {
    let poll = Duration::from_millis(ctx.config.consumer.poll_interval_ms.max(1));
    while !worker.is_done() {
        if ctx.count_mode() && worker.all_destinations_done() {
            break;
        }
        std::thread::sleep(poll);
    }
    match worker.error() {
        Some(error) => Err(WorkerError::Listener(error)),
        None => Ok(()),
    }
}

/// Subscribes to every destination of the worker, then receives until
/// stopped or, in count mode, until all its destinations are complete.
pub fn run(
    ctx: &Arc<RunContext>,
    worker: &Arc<WorkerShared>,
    spec: &ConsumerSpec,
) -> Result<(), WorkerError> {
    if let Some(cpu) = worker.cpu {
        pin_to_cpu(&worker.label, cpu);
    }
    let (mut connections, mut subscribers) = subscribe(ctx, worker, spec)?;
    for connection in connections.iter_mut() {
        connection.start()?;
    }
    worker.mark_ready();
    info!(
        worker = %worker.label,
        destinations = subscribers.len(),
        mode = ?spec.receive_mode,
        "consumer ready"
    );

    let result = match spec.receive_mode {
        ReceiveMode::Blocking => pull_loop(ctx, worker, &mut subscribers, Pull::Blocking),
        ReceiveMode::BlockingTimeout => pull_loop(ctx, worker, &mut subscribers, Pull::Timeout),
        ReceiveMode::NonBlocking => pull_loop(ctx, worker, &mut subscribers, Pull::NoWait),
        ReceiveMode::Listener => wait_listener(ctx, worker),
    };
    worker.mark_done();

    for sub in &subscribers {
        if sub.slot.transacted && sub.slot.pending.swap(0, Ordering::AcqRel) > 0 {
            if let Err(e) = commit(ctx, worker, &sub.slot) {
                warn!(worker = %worker.label, error = %e, "final commit failed");
            }
        }
    }
    for connection in connections.iter_mut() {
        if let Err(e) = connection.close() {
            warn!(worker = %worker.label, error = %e, "close failed");
        }
    }
    drop(subscribers);
    info!(worker = %worker.label, received = worker.count(), "consumer finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::memory::InMemoryBroker;
    use crate::client::MessagingClient;

    #[test]
    fn test_session_slot_tick() {
        let broker = InMemoryBroker::new();
        let mut conn = broker.connect("local", None, None).unwrap();
        let session = conn.create_session(false, AckMode::Client).unwrap();
        let slot = SessionSlot::new(session, false, true);
        assert!(!slot.tick(3));
        assert!(!slot.tick(3));
        assert!(slot.tick(3));
        assert!(!slot.tick(3));
        assert!(slot.tick(0));
    }

    #[test]
    fn test_simulate_work_sleeps_for_negative_loops() {
        let start = std::time::Instant::now();
        simulate_work(-2000, b"abc");
        assert!(start.elapsed() >= Duration::from_millis(2));
        simulate_work(10, b"abc");
    }

    #[test]
    fn test_frame_error_names_destination() {
        let err = WorkerError::Frame {
            destination: "q.00000001".into(),
            source: FrameError::TooShort { len: 3, min: 21 },
        };
        assert!(err.to_string().contains("q.00000001"));
    }
}
