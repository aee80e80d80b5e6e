//! In-process broker implementing the client traits over `crossbeam-channel`.
//!
//! Queues are one MPMC channel with competing consumers. Topics fan out to a
//! channel per subscriber; subscribers filter with MQTT style wildcards
//! (`+` one level, `#` the remaining levels). Durable and shared
//! subscriptions are named channels that outlive a single consumer.

use crate::client::{
    AckMode, Acknowledge, Connection, Consumer, Credentials, DeliveryCallback, Destination,
    DestinationKind, Message, MessagingClient, Producer, SendOptions, Session, Subscription,
};
use crate::config::is_wildcard;
use crate::error::ClientError;
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const DELIVERY_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub acknowledged: u64,
    pub commits: u64,
    pub connections: u64,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Channel>>,
    topics: RwLock<Topics>,
    refused: RwLock<HashSet<String>>,
    client_ids: Mutex<HashSet<String>>,
    published: AtomicU64,
    acknowledged: AtomicU64,
    commits: AtomicU64,
    connections: AtomicU64,
}

#[derive(Clone)]
struct Channel {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

impl Channel {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

#[derive(Default)]
struct Topics {
    next_id: u64,
    subscribers: Vec<TopicSubscriber>,
    named: HashMap<String, NamedSubscription>,
}

struct TopicSubscriber {
    id: u64,
    filter: String,
    tx: Sender<Bytes>,
}

struct NamedSubscription {
    subscriber: u64,
    rx: Receiver<Bytes>,
    consumers: usize,
    durable: bool,
}

enum Registration {
    Queue,
    Plain(u64),
    Named(String),
}

impl Topics {
    fn add_subscriber(&mut self, filter: &str) -> (u64, Receiver<Bytes>) {
        let (tx, rx) = unbounded();
        self.next_id += 1;
        let id = self.next_id;
        self.subscribers.push(TopicSubscriber {
            id,
            filter: filter.to_string(),
            tx,
        });
        (id, rx)
    }

    fn remove_subscriber(&mut self, id: u64) {
        self.subscribers.retain(|s| s.id != id);
    }

    fn attach_named(&mut self, name: &str, filter: &str, durable: bool) -> Receiver<Bytes> {
        if let Some(existing) = self.named.get_mut(name) {
            existing.consumers += 1;
            return existing.rx.clone();
        }
        let (subscriber, rx) = self.add_subscriber(filter);
        self.named.insert(
            name.to_string(),
            NamedSubscription {
                subscriber,
                rx: rx.clone(),
                consumers: 1,
                durable,
            },
        );
        rx
    }

    fn detach_named(&mut self, name: &str) {
        let remove = match self.named.get_mut(name) {
            Some(entry) => {
                entry.consumers = entry.consumers.saturating_sub(1);
                entry.consumers == 0 && !entry.durable
            }
            None => false,
        };
        if remove {
            if let Some(entry) = self.named.remove(name) {
                self.remove_subscriber(entry.subscriber);
            }
        }
    }
}

/// True when `topic` is selected by `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if !is_wildcard(filter) {
        return filter == topic;
    }
    let mut levels = filter.split('/');
    let mut names = topic.split('/');
    loop {
        match (levels.next(), names.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(level), Some(name)) if level == name => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl BrokerState {
    fn queue_sender(&self, name: &str) -> Sender<Bytes> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(Channel::new)
            .tx
            .clone()
    }

    fn queue_receiver(&self, name: &str) -> Receiver<Bytes> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(Channel::new)
            .rx
            .clone()
    }

    fn publish(&self, destination: &Destination, body: Bytes) -> Result<(), ClientError> {
        self.published.fetch_add(1, Ordering::Relaxed);
        match destination.kind {
            DestinationKind::Queue => self
                .queue_sender(&destination.name)
                .send(body)
                .map_err(|_| ClientError::Transport(format!("queue {} is gone", destination.name))),
            DestinationKind::Topic => {
                let topics = self.topics.read();
                for subscriber in &topics.subscribers {
                    if topic_matches(&subscriber.filter, &destination.name) {
                        // A subscriber whose consumer vanished is simply skipped.
                        let _ = subscriber.tx.send(body.clone());
                    }
                }
                Ok(())
            }
        }
    }

    fn release(&self, registration: &Registration) {
        match registration {
            Registration::Queue => {}
            Registration::Plain(id) => self.topics.write().remove_subscriber(*id),
            Registration::Named(name) => self.topics.write().detach_named(name),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes future connects to `endpoint` fail as unreachable.
    pub fn refuse(&self, endpoint: &str) {
        self.state.refused.write().insert(endpoint.to_string());
    }

    /// Messages waiting on a queue.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(name)
            .map(|c| c.rx.len())
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.topics.read().subscribers.len()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.state.published.load(Ordering::Relaxed),
            acknowledged: self.state.acknowledged.load(Ordering::Relaxed),
            commits: self.state.commits.load(Ordering::Relaxed),
            connections: self.state.connections.load(Ordering::Relaxed),
        }
    }
}

impl MessagingClient for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn connect(
        &self,
        endpoint: &str,
        client_id: Option<&str>,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Connection>, ClientError> {
        if self.state.refused.read().contains(endpoint) {
            return Err(ClientError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(id) = client_id {
            if !self.state.client_ids.lock().insert(id.to_string()) {
                return Err(ClientError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: format!("client id {id} is already in use"),
                });
            }
        }
        self.state.connections.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint, client_id, "memory connection opened");
        Ok(Box::new(MemoryConnection {
            broker: self.state.clone(),
            state: Arc::new(ConnectionState {
                client_id: client_id.map(str::to_string),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                deliveries: Mutex::new(Vec::new()),
            }),
        }))
    }
}

struct ConnectionState {
    client_id: Option<String>,
    started: AtomicBool,
    closed: AtomicBool,
    deliveries: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionState {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ClientError::Closed("connection"))
        } else {
            Ok(())
        }
    }
}

struct MemoryConnection {
    broker: Arc<BrokerState>,
    state: Arc<ConnectionState>,
}

impl Connection for MemoryConnection {
    fn create_session(
        &mut self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Box<dyn Session>, ClientError> {
        self.state.ensure_open()?;
        let transacted = transacted || ack_mode == AckMode::Transacted;
        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            connection: self.state.clone(),
            pending: transacted.then(|| Arc::new(Mutex::new(Vec::new()))),
            acker: Arc::new(MemoryAcker {
                broker: self.broker.clone(),
            }),
        }))
    }

    fn start(&mut self) -> Result<(), ClientError> {
        self.state.ensure_open()?;
        self.state.started.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ClientError> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let handles: Vec<_> = self.state.deliveries.lock().drain(..).collect();
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("memory delivery thread panicked");
            }
        }
        if let Some(id) = &self.state.client_id {
            self.broker.client_ids.lock().remove(id);
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

type Pending = Arc<Mutex<Vec<(Destination, Bytes)>>>;

struct MemorySession {
    broker: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
    pending: Option<Pending>,
    acker: Arc<MemoryAcker>,
}

impl Session for MemorySession {
    fn create_producer(
        &mut self,
        destination: Option<&Destination>,
    ) -> Result<Box<dyn Producer>, ClientError> {
        self.connection.ensure_open()?;
        let queue_tx = match destination {
            Some(d) if d.kind == DestinationKind::Queue => Some(self.broker.queue_sender(&d.name)),
            _ => None,
        };
        Ok(Box::new(MemoryProducer {
            broker: self.broker.clone(),
            connection: self.connection.clone(),
            destination: destination.cloned(),
            queue_tx,
            pending: self.pending.clone(),
        }))
    }

    fn create_consumer(
        &mut self,
        destination: &Destination,
        subscription: &Subscription,
        _selector: Option<&str>,
    ) -> Result<Box<dyn Consumer>, ClientError> {
        self.connection.ensure_open()?;
        let (rx, registration) = match (destination.kind, subscription) {
            (DestinationKind::Queue, Subscription::Plain) => {
                (self.broker.queue_receiver(&destination.name), Registration::Queue)
            }
            (DestinationKind::Queue, _) => {
                return Err(ClientError::Unsupported(format!(
                    "durable or shared subscription on queue {}",
                    destination.name
                )))
            }
            (DestinationKind::Topic, Subscription::Plain) => {
                let (id, rx) = self.broker.topics.write().add_subscriber(&destination.name);
                (rx, Registration::Plain(id))
            }
            (DestinationKind::Topic, Subscription::Durable { name }) => {
                let rx = self
                    .broker
                    .topics
                    .write()
                    .attach_named(name, &destination.name, true);
                (rx, Registration::Named(name.clone()))
            }
            (DestinationKind::Topic, Subscription::Shared { name, durable }) => {
                let rx = self
                    .broker
                    .topics
                    .write()
                    .attach_named(name, &destination.name, *durable);
                (rx, Registration::Named(name.clone()))
            }
        };
        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            connection: self.connection.clone(),
            rx,
            registration,
            acker: self.acker.clone(),
            listening: false,
        }))
    }

    fn commit(&mut self) -> Result<(), ClientError> {
        self.connection.ensure_open()?;
        if let Some(pending) = &self.pending {
            let batch: Vec<_> = pending.lock().drain(..).collect();
            for (destination, body) in batch {
                self.broker.publish(&destination, body)?;
            }
        }
        self.broker.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct MemoryProducer {
    broker: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
    destination: Option<Destination>,
    queue_tx: Option<Sender<Bytes>>,
    pending: Option<Pending>,
}

impl Producer for MemoryProducer {
    fn send(
        &mut self,
        destination: Option<&Destination>,
        payload: Bytes,
        _options: &SendOptions,
    ) -> Result<(), ClientError> {
        self.connection.ensure_open()?;
        let target = match (destination, &self.destination) {
            (Some(d), _) => d,
            (None, Some(d)) => d,
            (None, None) => {
                return Err(ClientError::Unsupported(
                    "anonymous producer needs a destination per send".into(),
                ))
            }
        };
        if let Some(pending) = &self.pending {
            pending.lock().push((target.clone(), payload));
            return Ok(());
        }
        match (&self.queue_tx, destination) {
            (Some(tx), None) => {
                self.broker.published.fetch_add(1, Ordering::Relaxed);
                tx.send(payload)
                    .map_err(|_| ClientError::Transport(format!("queue {} is gone", target.name)))
            }
            _ => self.broker.publish(target, payload),
        }
    }
}

struct MemoryAcker {
    broker: Arc<BrokerState>,
}

impl Acknowledge for MemoryAcker {
    fn acknowledge(&self) -> Result<(), ClientError> {
        self.broker.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct MemoryConsumer {
    broker: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
    rx: Receiver<Bytes>,
    registration: Registration,
    acker: Arc<MemoryAcker>,
    listening: bool,
}

impl MemoryConsumer {
    fn wrap(&self, body: Bytes) -> Message {
        Message::with_acker(body, self.acker.clone())
    }

    fn ensure_pull(&self) -> Result<(), ClientError> {
        self.connection.ensure_open()?;
        if self.listening {
            return Err(ClientError::Unsupported(
                "receive on a consumer with a delivery callback".into(),
            ));
        }
        Ok(())
    }
}

impl Consumer for MemoryConsumer {
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Message>, ClientError> {
        self.ensure_pull()?;
        let body = match timeout {
            None => self.rx.recv().map_err(|_| ClientError::Closed("subscription"))?,
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(body) => body,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ClientError::Closed("subscription"))
                }
            },
        };
        Ok(Some(self.wrap(body)))
    }

    fn receive_no_wait(&mut self) -> Result<Option<Message>, ClientError> {
        self.ensure_pull()?;
        match self.rx.try_recv() {
            Ok(body) => Ok(Some(self.wrap(body))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ClientError::Closed("subscription")),
        }
    }

    fn set_delivery_callback(&mut self, callback: DeliveryCallback) -> Result<(), ClientError> {
        self.connection.ensure_open()?;
        if self.listening {
            return Err(ClientError::Unsupported("delivery callback already set".into()));
        }
        let rx = self.rx.clone();
        let connection = self.connection.clone();
        let acker = self.acker.clone();
        let handle = std::thread::Builder::new()
            .name("memory-delivery".into())
            .spawn(move || loop {
                if connection.closed.load(Ordering::Acquire) {
                    break;
                }
                if !connection.started.load(Ordering::Acquire) {
                    std::thread::sleep(DELIVERY_POLL);
                    continue;
                }
                match rx.recv_timeout(DELIVERY_POLL) {
                    Ok(body) => callback(Message::with_acker(body, acker.clone())),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| ClientError::Transport(format!("cannot start delivery thread: {e}")))?;
        self.connection.deliveries.lock().push(handle);
        self.listening = true;
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.broker.release(&self.registration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn session(broker: &InMemoryBroker, transacted: bool) -> (Box<dyn Connection>, Box<dyn Session>) {
        let mut conn = broker.connect("local", None, None).unwrap();
        let sess = conn.create_session(transacted, AckMode::Auto).unwrap();
        (conn, sess)
    }

    fn body(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("b/#", "a/b"));
    }

    #[test]
    fn test_queue_competing_consumers() {
        let broker = InMemoryBroker::new();
        let (_conn, mut sess) = session(&broker, false);
        let q = Destination::queue("q");
        let mut c1 = sess.create_consumer(&q, &Subscription::Plain, None).unwrap();
        let mut c2 = sess.create_consumer(&q, &Subscription::Plain, None).unwrap();
        let mut p = sess.create_producer(Some(&q)).unwrap();

        for i in 0..10 {
            p.send(None, body(i), &SendOptions::default()).unwrap();
        }
        let mut got = 0;
        while c1.receive_no_wait().unwrap().is_some() {
            got += 1;
        }
        while c2.receive_no_wait().unwrap().is_some() {
            got += 1;
        }
        assert_eq!(got, 10);
        assert_eq!(broker.stats().published, 10);
    }

    #[test]
    fn test_topic_fan_out_and_unsubscribe() {
        let broker = InMemoryBroker::new();
        let (_conn, mut sess) = session(&broker, false);
        let exact = sess
            .create_consumer(&Destination::topic("s/1"), &Subscription::Plain, None)
            .unwrap();
        let mut wild = sess
            .create_consumer(&Destination::topic("s/+"), &Subscription::Plain, None)
            .unwrap();
        let mut p = sess.create_producer(None).unwrap();

        p.send(Some(&Destination::topic("s/1")), body(1), &SendOptions::default())
            .unwrap();
        p.send(Some(&Destination::topic("s/2")), body(2), &SendOptions::default())
            .unwrap();

        drop(exact);
        assert_eq!(broker.subscriber_count(), 1);
        assert!(wild.receive_no_wait().unwrap().is_some());
        assert!(wild.receive_no_wait().unwrap().is_some());
        assert!(wild.receive_no_wait().unwrap().is_none());
    }

    #[test]
    fn test_transacted_sends_wait_for_commit() {
        let broker = InMemoryBroker::new();
        let (_conn, mut sess) = session(&broker, true);
        let q = Destination::queue("tx");
        let mut p = sess.create_producer(Some(&q)).unwrap();
        p.send(None, body(1), &SendOptions::default()).unwrap();
        p.send(None, body(2), &SendOptions::default()).unwrap();
        assert_eq!(broker.queue_depth("tx"), 0);

        sess.commit().unwrap();
        assert_eq!(broker.queue_depth("tx"), 2);
        assert_eq!(broker.stats().commits, 1);
    }

    #[test]
    fn test_durable_subscription_survives_consumer() {
        let broker = InMemoryBroker::new();
        let (_conn, mut sess) = session(&broker, false);
        let t = Destination::topic("d");
        let durable = Subscription::Durable {
            name: "sub".into(),
        };
        let consumer = sess.create_consumer(&t, &durable, None).unwrap();
        drop(consumer);

        let mut p = sess.create_producer(Some(&t)).unwrap();
        p.send(None, body(9), &SendOptions::default()).unwrap();

        let mut again = sess.create_consumer(&t, &durable, None).unwrap();
        let msg = again.receive(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(msg.map(|m| m.body().len()), Some(4));
    }

    #[test]
    fn test_shared_subscription_splits_messages() {
        let broker = InMemoryBroker::new();
        let (_conn, mut sess) = session(&broker, false);
        let t = Destination::topic("shared");
        let shared = Subscription::Shared {
            name: "shared_ss".into(),
            durable: false,
        };
        let mut a = sess.create_consumer(&t, &shared, None).unwrap();
        let mut b = sess.create_consumer(&t, &shared, None).unwrap();
        let mut p = sess.create_producer(Some(&t)).unwrap();
        for i in 0..6 {
            p.send(None, body(i), &SendOptions::default()).unwrap();
        }
        let mut got = 0;
        while a.receive_no_wait().unwrap().is_some() {
            got += 1;
        }
        while b.receive_no_wait().unwrap().is_some() {
            got += 1;
        }
        assert_eq!(got, 6);
        drop(a);
        drop(b);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn test_delivery_callback_runs_until_close() {
        let broker = InMemoryBroker::new();
        let (mut conn, mut sess) = session(&broker, false);
        let q = Destination::queue("listen");
        let mut consumer = sess.create_consumer(&q, &Subscription::Plain, None).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        consumer
            .set_delivery_callback(Box::new(move |msg| {
                msg.acknowledge().unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(consumer.receive_no_wait().is_err());

        let mut p = sess.create_producer(Some(&q)).unwrap();
        for i in 0..5 {
            p.send(None, body(i), &SendOptions::default()).unwrap();
        }
        conn.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        conn.close().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(broker.stats().acknowledged, 5);
        assert!(p.send(None, body(0), &SendOptions::default()).is_err());
    }

    #[test]
    fn test_refused_endpoint_and_duplicate_client_id() {
        let broker = InMemoryBroker::new();
        broker.refuse("down:1");
        assert!(matches!(
            broker.connect("down:1", None, None),
            Err(ClientError::Connect { .. })
        ));

        let mut first = broker.connect("up:1", Some("id-1"), None).unwrap();
        assert!(broker.connect("up:1", Some("id-1"), None).is_err());
        first.close().unwrap();
        assert!(broker.connect("up:1", Some("id-1"), None).is_ok());
    }
}
