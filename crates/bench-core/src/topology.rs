//! Expands producer/consumer layouts into concrete destination descriptors.
//!
//! A layout describes `threads x connections x sessions x per_session`
//! destinations. Each descriptor gets a numeric name suffix built from its
//! position in that grid; dimensions configured negative are left out of
//! the suffix. Round-robin mode instead deals destination names cyclically
//! over the thread/connection/session slots.

use crate::config::{is_wildcard, DestinationLayout};
use crate::error::ConfigError;
use crate::histogram::{Histogram, LiveHistogram};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn prefix(self) -> &'static str {
        match self {
            Role::Producer => "prod",
            Role::Consumer => "cons",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TopologyOptions {
    pub round_robin: bool,
    pub partitions: u32,
}

/// Counters of one destination, written by its owning worker (or the
/// client's delivery thread) and read by the aggregator and checker.
#[derive(Debug)]
pub struct DestinationStats {
    count: AtomicU64,
    acks: AtomicU64,
    last_ack: AtomicU64,
    done: AtomicBool,
    rtt: Option<LiveHistogram>,
}

impl DestinationStats {
    pub fn new(rtt_buckets: Option<usize>) -> Self {
        Self {
            count: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            last_ack: AtomicU64::new(0),
            done: AtomicBool::new(false),
            rtt: rtt_buckets.map(LiveHistogram::new),
        }
    }

    /// Bumps the message count and returns the new value.
    pub fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn record_ack(&self, sequence: u64) {
        self.acks.fetch_add(1, Ordering::Relaxed);
        self.last_ack.store(sequence, Ordering::Relaxed);
    }

    pub fn acks(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }

    pub fn last_ack(&self) -> u64 {
        self.last_ack.load(Ordering::Relaxed)
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn rtt(&self) -> Option<&LiveHistogram> {
        self.rtt.as_ref()
    }

    pub fn rtt_snapshot(&self) -> Option<Histogram> {
        self.rtt.as_ref().map(LiveHistogram::snapshot)
    }
}

#[derive(Debug, Clone)]
pub struct DestinationDescriptor {
    /// Process wide id of the owning worker thread
    pub worker_id: usize,
    pub connection: usize,
    /// Session index within its connection
    pub session: usize,
    /// Session index within the owning thread
    pub thread_session: usize,
    pub session_id: String,
    pub endpoint: String,
    pub name: String,
    /// Numeric name suffix, `None` for wildcard names
    pub suffix: Option<u64>,
    pub role: Role,
    pub stats: Arc<DestinationStats>,
}

/// Identity of the worker a layout is being expanded for.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSlot {
    pub worker_id: usize,
    /// Clone index of this thread within its spec
    pub thread_index: usize,
    pub role: Role,
}

fn abs(n: i32) -> u64 {
    n.unsigned_abs() as u64
}

fn factor(n: i32) -> u64 {
    if n < 0 {
        1
    } else {
        n as u64
    }
}

struct NameTemplate {
    base: String,
    partition: Option<(String, String)>,
}

impl NameTemplate {
    fn parse(name: &str, partitions: u32) -> Result<Self, ConfigError> {
        if partitions == 0 {
            return Ok(Self {
                base: name.to_string(),
                partition: None,
            });
        }
        let mut parts = name.split('/').filter(|p| !p.is_empty());
        match (parts.next(), parts.next()) {
            (Some(p), Some(t)) => Ok(Self {
                base: name.to_string(),
                partition: Some((p.to_string(), t.to_string())),
            }),
            _ => Err(ConfigError::MissingPartitionSeparator(name.to_string())),
        }
    }

    /// Renders a name; returns the suffix used, if any.
    fn render(&self, partition: Option<u64>, suffix: u64) -> (String, Option<u64>) {
        let base = match (&self.partition, partition) {
            (Some((p, t)), Some(index)) => format!("/{p}{index}/{t}"),
            _ => self.base.clone(),
        };
        if is_wildcard(&base) {
            (base, None)
        } else {
            (format!("{base}.{suffix:08}"), Some(suffix))
        }
    }
}

/// Builds the ordered destination list of one worker thread.
///
/// Connection `i` of worker `id` is assigned endpoint `(i + id) % endpoints`.
pub fn build_destinations(
    layout: &DestinationLayout,
    slot: WorkerSlot,
    options: TopologyOptions,
    endpoints: &[String],
    rtt_buckets: Option<usize>,
) -> Result<Vec<DestinationDescriptor>, ConfigError> {
    if endpoints.is_empty() {
        return Err(ConfigError::NoEndpoints);
    }
    let template = NameTemplate::parse(&layout.name, options.partitions)?;
    let partitions = options.partitions as u64;
    let wildcard = layout.is_wildcard();

    let threads = abs(layout.threads);
    let connections = abs(layout.connections);
    let sessions = abs(layout.sessions);
    let total_slots = sessions * connections * threads;
    let ti = slot.thread_index as u64;
    let start = layout.start_index as u64;

    // Destinations per session before any round-robin redistribution.
    let mut per_session = layout.per_session;
    let mut total_names = 0u64;
    if options.round_robin {
        total_names = if partitions == 0 {
            abs(layout.per_session)
        } else {
            abs(layout.per_session) * partitions
        };
        if total_names <= total_slots {
            per_session = 1;
        }
        if wildcard && (partitions == 0 || partitions <= total_slots) {
            per_session = 1;
        }
    } else if partitions == 0 {
        if wildcard {
            per_session = 1;
        }
    } else {
        total_names = abs(layout.per_session) * sessions * connections * threads;
    }

    let mut out = Vec::new();
    let mut thread_session = 0usize;
    for i in 0..connections {
        let endpoint = &endpoints[(i as usize + slot.worker_id) % endpoints.len()];
        for j in 0..sessions {
            let grid_slot = (ti * connections + i) * sessions + j;
            let count = if options.round_robin && total_names > total_slots {
                total_names / total_slots + u64::from(grid_slot < total_names % total_slots)
            } else {
                abs(per_session)
            };

            for k in 0..count {
                let (name, suffix) = if options.round_robin {
                    let cyclic = (grid_slot + k * total_slots) % total_names.max(1);
                    if partitions == 0 {
                        template.render(None, start + cyclic)
                    } else {
                        template.render(Some(cyclic % partitions), start + cyclic / partitions)
                    }
                } else {
                    let position = start
                        + if layout.threads < 0 {
                            0
                        } else {
                            ti * factor(layout.connections)
                                * factor(layout.sessions)
                                * factor(per_session)
                        }
                        + if layout.connections < 0 {
                            0
                        } else {
                            i * factor(layout.sessions) * factor(per_session)
                        }
                        + if layout.sessions < 0 {
                            0
                        } else {
                            j * factor(per_session)
                        }
                        + if per_session < 0 { 0 } else { k };
                    if partitions == 0 {
                        template.render(None, position)
                    } else {
                        let width = if total_names < partitions {
                            1
                        } else {
                            total_names / partitions
                        };
                        let index = (position / width).min(partitions - 1);
                        template.render(
                            Some(index),
                            position.saturating_sub(index * (total_names / partitions)),
                        )
                    }
                };

                out.push(DestinationDescriptor {
                    worker_id: slot.worker_id,
                    connection: i as usize,
                    session: j as usize,
                    thread_session,
                    session_id: format!(
                        "{}{}.conn{}.sess{}",
                        slot.role.prefix(),
                        slot.worker_id,
                        i,
                        thread_session
                    ),
                    endpoint: endpoint.clone(),
                    name,
                    suffix,
                    role: slot.role,
                    stats: Arc::new(DestinationStats::new(match slot.role {
                        Role::Consumer => rtt_buckets,
                        Role::Producer => None,
                    })),
                });
            }
            thread_session += 1;
        }
    }
    Ok(out)
}

#[derive(Debug, Default)]
pub struct DestinationEntry {
    pub producers: Vec<(usize, Arc<DestinationStats>)>,
    pub consumers: Vec<(usize, Arc<DestinationStats>)>,
    complete: AtomicBool,
}

impl DestinationEntry {
    pub fn sent(&self) -> u64 {
        self.producers.iter().map(|(_, s)| s.count()).sum()
    }

    pub fn received(&self) -> u64 {
        self.consumers.iter().map(|(_, s)| s.count()).sum()
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// Destination name to every producer and consumer descriptor using it,
/// across all workers of the process. Built before any worker starts; only
/// the atomic flags change afterwards.
#[derive(Debug, Default)]
pub struct DestinationMap {
    entries: BTreeMap<String, DestinationEntry>,
}

impl DestinationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: &DestinationDescriptor) {
        let entry = self.entries.entry(descriptor.name.clone()).or_default();
        let item = (descriptor.worker_id, descriptor.stats.clone());
        match descriptor.role {
            Role::Producer => entry.producers.push(item),
            Role::Consumer => entry.consumers.push(item),
        }
    }

    /// Distinct destination names in the process.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&DestinationEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DestinationEntry)> {
        self.entries.iter()
    }

    pub fn produced_names(&self) -> usize {
        self.entries.values().filter(|e| !e.producers.is_empty()).count()
    }

    pub fn consumed_names(&self) -> usize {
        self.entries.values().filter(|e| !e.consumers.is_empty()).count()
    }

    /// Fails if some destination is produced to but never consumed.
    pub fn check_subscription(&self) -> Result<(), ConfigError> {
        let (consumed, produced) = (self.consumed_names(), self.produced_names());
        if let Some((name, _)) = self
            .entries
            .iter()
            .find(|(_, e)| !e.producers.is_empty() && e.consumers.is_empty())
        {
            if consumed < produced {
                return Err(ConfigError::UnderSubscribedCount { consumed, produced });
            }
            return Err(ConfigError::UnderSubscribed { name: name.clone() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn layout(name: &str, per_session: i32, sessions: i32, connections: i32, threads: i32) -> DestinationLayout {
        DestinationLayout {
            name: name.to_string(),
            per_session,
            sessions,
            connections,
            threads,
            start_index: 0,
        }
    }

    fn slot(worker_id: usize, thread_index: usize) -> WorkerSlot {
        WorkerSlot {
            worker_id,
            thread_index,
            role: Role::Producer,
        }
    }

    fn endpoints() -> Vec<String> {
        vec!["a:1".to_string(), "b:1".to_string()]
    }

    fn names(descriptors: &[DestinationDescriptor]) -> Vec<String> {
        descriptors.iter().map(|d| d.name.clone()).collect()
    }

    #[test]
    fn test_block_naming() {
        let l = layout("q", 2, 2, 2, 1);
        let d = build_destinations(&l, slot(0, 0), TopologyOptions::default(), &endpoints(), None)
            .unwrap();
        assert_eq!(
            names(&d),
            (0..8).map(|n| format!("q.{n:08}")).collect::<Vec<_>>()
        );
        assert_eq!(d[2].connection, 0);
        assert_eq!(d[2].session, 1);
        assert_eq!(d[4].connection, 1);
        assert_eq!(d[4].thread_session, 2);
        assert_eq!(d[4].session_id, "prod0.conn1.sess2");
        assert_eq!(d[0].endpoint, "a:1");
        assert_eq!(d[4].endpoint, "b:1");
    }

    #[test]
    fn test_descriptor_count_and_uniqueness() {
        for (n, m, k) in [(1, 1, 1), (3, 2, 4), (2, 5, 3)] {
            let l = layout("q", k, m, n, 1);
            let d = build_destinations(&l, slot(0, 0), TopologyOptions::default(), &endpoints(), None)
                .unwrap();
            assert_eq!(d.len(), (n * m * k) as usize);
            let triples: HashSet<_> = d.iter().map(|x| (x.connection, x.session, x.suffix)).collect();
            assert_eq!(triples.len(), d.len());
            let distinct: HashSet<_> = names(&d).into_iter().collect();
            assert_eq!(distinct.len(), d.len());
        }
    }

    #[test]
    fn test_second_thread_continues_numbering() {
        let l = layout("q", 2, 1, 1, 2);
        let d = build_destinations(&l, slot(1, 1), TopologyOptions::default(), &endpoints(), None)
            .unwrap();
        assert_eq!(names(&d), vec!["q.00000002", "q.00000003"]);
        assert_eq!(d[0].endpoint, "b:1");
    }

    #[test]
    fn test_negative_dimension_is_left_out() {
        let l = layout("q", 2, 1, 1, -3);
        for t in 0..3 {
            let d = build_destinations(&l, slot(t, t), TopologyOptions::default(), &endpoints(), None)
                .unwrap();
            assert_eq!(names(&d), vec!["q.00000000", "q.00000001"], "thread {}", t);
        }

        let l = layout("q", -2, 2, 1, 1);
        let d = build_destinations(&l, slot(0, 0), TopologyOptions::default(), &endpoints(), None)
            .unwrap();
        assert_eq!(names(&d), vec!["q.00000000", "q.00000000", "q.00000001", "q.00000001"]);
    }

    #[test]
    fn test_start_index() {
        let mut l = layout("q", 3, 1, 1, 1);
        l.start_index = 100;
        let d = build_destinations(&l, slot(0, 0), TopologyOptions::default(), &endpoints(), None)
            .unwrap();
        assert_eq!(names(&d), vec!["q.00000100", "q.00000101", "q.00000102"]);
    }

    #[test]
    fn test_wildcard_collapses() {
        let l = layout("t/#", 5, 2, 1, 1);
        let d = build_destinations(&l, slot(0, 0), TopologyOptions::default(), &endpoints(), None)
            .unwrap();
        assert_eq!(names(&d), vec!["t/#", "t/#"]);
        assert_eq!(d[0].suffix, None);
    }

    #[test]
    fn test_round_robin_fair_split() {
        let options = TopologyOptions {
            round_robin: true,
            partitions: 0,
        };
        // 3 threads x 2 connections x 2 sessions = 12 slots, 29 names.
        let l = layout("q", 29, 2, 2, 3);
        let mut all = Vec::new();
        for t in 0..3 {
            let d = build_destinations(&l, slot(t, t), options, &endpoints(), None).unwrap();
            let mut per_session = std::collections::HashMap::new();
            for x in &d {
                *per_session.entry((x.connection, x.session)).or_insert(0) += 1;
            }
            for (&key, &n) in &per_session {
                assert!(n == 2 || n == 3, "thread {} slot {:?} got {}", t, key, n);
            }
            all.extend(names(&d));
        }
        assert_eq!(all.len(), 29);
        let distinct: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(distinct.len(), 29);
    }

    #[test]
    fn test_round_robin_fewer_names_than_slots() {
        let options = TopologyOptions {
            round_robin: true,
            partitions: 0,
        };
        let mut l = layout("q", 2, 2, 1, 2);
        l.start_index = 10;
        let mut all = Vec::new();
        for t in 0..2 {
            let d = build_destinations(&l, slot(t, t), options, &endpoints(), None).unwrap();
            assert_eq!(d.len(), 2);
            all.extend(names(&d));
        }
        assert_eq!(all, vec!["q.00000010", "q.00000011", "q.00000010", "q.00000011"]);
    }

    #[test]
    fn test_partitioned_names() {
        let options = TopologyOptions {
            round_robin: false,
            partitions: 2,
        };
        let l = layout("part/topic", 4, 1, 1, 1);
        let d = build_destinations(&l, slot(0, 0), options, &endpoints(), None).unwrap();
        assert_eq!(
            names(&d),
            vec![
                "/part0/topic.00000000",
                "/part0/topic.00000001",
                "/part1/topic.00000000",
                "/part1/topic.00000001",
            ]
        );
    }

    #[test]
    fn test_partitioned_round_robin() {
        let options = TopologyOptions {
            round_robin: true,
            partitions: 2,
        };
        let l = layout("part/topic", 2, 1, 1, 1);
        let d = build_destinations(&l, slot(0, 0), options, &endpoints(), None).unwrap();
        assert_eq!(
            names(&d),
            vec![
                "/part0/topic.00000000",
                "/part1/topic.00000000",
                "/part0/topic.00000001",
                "/part1/topic.00000001",
            ]
        );
    }

    #[test]
    fn test_partitions_need_separator() {
        let options = TopologyOptions {
            round_robin: false,
            partitions: 2,
        };
        let l = layout("flat", 1, 1, 1, 1);
        assert!(matches!(
            build_destinations(&l, slot(0, 0), options, &endpoints(), None),
            Err(ConfigError::MissingPartitionSeparator(_))
        ));
    }

    #[test]
    fn test_consumers_get_rtt_histograms() {
        let l = layout("q", 1, 1, 1, 1);
        let consumer = WorkerSlot {
            worker_id: 0,
            thread_index: 0,
            role: Role::Consumer,
        };
        let d = build_destinations(&l, consumer, TopologyOptions::default(), &endpoints(), Some(10))
            .unwrap();
        assert!(d[0].stats.rtt().is_some());
        assert_eq!(d[0].session_id, "cons0.conn0.sess0");
        let p = build_destinations(&l, slot(0, 0), TopologyOptions::default(), &endpoints(), Some(10))
            .unwrap();
        assert!(p[0].stats.rtt().is_none());
    }

    #[test]
    fn test_map_detects_under_subscription() {
        let mut map = DestinationMap::new();
        let producer = build_destinations(&layout("q", 3, 1, 1, 1), slot(0, 0), TopologyOptions::default(), &endpoints(), None)
            .unwrap();
        let consumer_slot = WorkerSlot {
            worker_id: 0,
            thread_index: 0,
            role: Role::Consumer,
        };
        let consumer = build_destinations(&layout("q", 2, 1, 1, 1), consumer_slot, TopologyOptions::default(), &endpoints(), None)
            .unwrap();
        for d in producer.iter().chain(consumer.iter()) {
            map.insert(d);
        }
        assert_eq!(map.len(), 3);
        assert_eq!(map.produced_names(), 3);
        assert_eq!(map.consumed_names(), 2);
        assert!(matches!(
            map.check_subscription(),
            Err(ConfigError::UnderSubscribedCount { consumed: 2, produced: 3 })
        ));

        let extra = build_destinations(&layout("q", 1, 1, 1, 1), WorkerSlot { worker_id: 1, thread_index: 0, role: Role::Consumer }, TopologyOptions { round_robin: false, partitions: 0 }, &endpoints(), None)
            .unwrap();
        let mut map = DestinationMap::new();
        for d in producer.iter().chain(consumer.iter()).chain(extra.iter()) {
            map.insert(d);
        }
        assert!(map.check_subscription().is_err());
        assert_eq!(map.get("q.00000000").map(|e| e.consumers.len()), Some(2));
    }
}
