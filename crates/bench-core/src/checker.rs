use crate::error::BenchError;
use crate::topology::{DestinationMap, Role};
use crate::worker::WorkerShared;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// Periodic completion check for fixed-count runs.
///
/// Producers stop on their own, but competing queue consumers cannot know
/// when a destination is drained. The checker compares receive totals with
/// the expected send totals and flags destinations and consumers done.
pub struct CompletionChecker {
    map: Arc<DestinationMap>,
    workers: Vec<Arc<WorkerShared>>,
    per_destination: u64,
    queues: bool,
}

impl CompletionChecker {
    pub fn new(
        map: Arc<DestinationMap>,
        workers: Vec<Arc<WorkerShared>>,
        per_destination: u64,
        queues: bool,
    ) -> Self {
        Self {
            map,
            workers,
            per_destination,
            queues,
        }
    }

    /// One pass. Returns true once every consumer worker is done.
    pub fn check(&self) -> bool {
        for worker in self.workers.iter().filter(|w| w.role == Role::Producer) {
            for descriptor in &worker.destinations {
                if descriptor.stats.count() >= self.per_destination {
                    descriptor.stats.mark_done();
                }
            }
        }

        for (name, entry) in self.map.iter() {
            if entry.is_complete() || entry.consumers.is_empty() {
                continue;
            }
            // A queue nobody sends to expects nothing and completes at once.
            let complete = if self.queues {
                let expected = self.per_destination * entry.producers.len() as u64;
                entry.received() >= expected
            } else {
                entry.consumers.iter().all(|(_, stats)| stats.is_done())
            };
            if complete {
                debug!(destination = %name, received = entry.received(), "destination complete");
                entry.mark_complete();
                for (_, stats) in &entry.consumers {
                    stats.mark_done();
                }
            }
        }

        let mut all_done = true;
        for worker in self.workers.iter().filter(|w| w.role == Role::Consumer) {
            if !worker.is_done() && worker.all_destinations_done() {
                info!(worker = %worker.label, received = worker.count(), "all destinations received");
                worker.mark_done();
            }
            all_done &= worker.is_done();
        }
        all_done
    }

    /// Runs [`CompletionChecker::check`] after `initial_delay` and then every
    /// `interval` until the returned sender is dropped.
    pub fn spawn(
        self,
        initial_delay: Duration,
        interval: Duration,
    ) -> Result<(Sender<()>, JoinHandle<()>), BenchError> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("checker".into())
            .spawn(move || {
                let mut delay = initial_delay;
                loop {
                    match stop_rx.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if self.check() {
                        debug!("every consumer is done, checker exiting");
                        break;
                    }
                    delay = interval;
                }
            })
            .map_err(|source| BenchError::Spawn {
                name: "checker".into(),
                source,
            })?;
        Ok((stop_tx, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BenchConfig, DestinationLayout};
    use crate::topology::{build_destinations, TopologyOptions, WorkerSlot};

    fn worker(id: usize, role: Role, name: &str, config: &BenchConfig) -> Arc<WorkerShared> {
        spread_worker(id, role, name, 1, config)
    }

    fn spread_worker(
        id: usize,
        role: Role,
        name: &str,
        per_session: i32,
        config: &BenchConfig,
    ) -> Arc<WorkerShared> {
        let layout = DestinationLayout {
            name: name.into(),
            per_session,
            ..DestinationLayout::default()
        };
        let slot = WorkerSlot {
            worker_id: id,
            thread_index: 0,
            role,
        };
        let descriptors =
            build_destinations(&layout, slot, TopologyOptions::default(), &["local".to_string()], None)
                .unwrap();
        let expected = vec![0; descriptors.len()];
        Arc::new(WorkerShared::new(id, role, None, descriptors, expected, 0, config))
    }

    fn map(workers: &[Arc<WorkerShared>]) -> Arc<DestinationMap> {
        let mut map = DestinationMap::new();
        for w in workers {
            for d in &w.destinations {
                map.insert(d);
            }
        }
        Arc::new(map)
    }

    #[test]
    fn test_queue_completion_marks_competing_consumers() {
        let config = BenchConfig::default();
        let producer = worker(0, Role::Producer, "q", &config);
        let c1 = worker(0, Role::Consumer, "q", &config);
        let c2 = worker(1, Role::Consumer, "q", &config);
        let workers = vec![producer.clone(), c1.clone(), c2.clone()];
        let checker = CompletionChecker::new(map(&workers), workers, 10, true);

        for _ in 0..10 {
            producer.destinations[0].stats.increment();
        }
        for _ in 0..6 {
            c1.destinations[0].stats.increment();
        }
        for _ in 0..3 {
            c2.destinations[0].stats.increment();
        }
        assert!(!checker.check());
        assert!(producer.destinations[0].stats.is_done());
        assert!(!c1.is_done());

        c2.destinations[0].stats.increment();
        assert!(checker.check());
        assert!(c1.is_done() && c2.is_done());
        assert!(checker.map.get("q.00000000").unwrap().is_complete());
    }

    #[test]
    fn test_queue_without_producers_completes() {
        let config = BenchConfig::default();
        let producer = spread_worker(0, Role::Producer, "q", 1, &config);
        let consumer = spread_worker(0, Role::Consumer, "q", 2, &config);
        let workers = vec![producer.clone(), consumer.clone()];
        let checker = CompletionChecker::new(map(&workers), workers, 4, true);

        assert!(!checker.check());
        assert!(checker.map.get("q.00000001").unwrap().is_complete());
        assert!(consumer.destinations[1].stats.is_done());
        assert!(!consumer.is_done());

        for _ in 0..4 {
            producer.destinations[0].stats.increment();
            consumer.destinations[0].stats.increment();
        }
        assert!(checker.check());
        assert!(consumer.is_done());
    }

    #[test]
    fn test_topic_entries_wait_for_consumers() {
        let config = BenchConfig::default();
        let producer = worker(0, Role::Producer, "t", &config);
        let consumer = worker(0, Role::Consumer, "t", &config);
        let workers = vec![producer, consumer.clone()];
        let checker = CompletionChecker::new(map(&workers), workers, 5, false);
        for _ in 0..5 {
            consumer.destinations[0].stats.increment();
        }
        assert!(!checker.check());
        consumer.destinations[0].stats.mark_done();
        assert!(checker.check());
    }

    #[test]
    fn test_spawned_checker_stops_when_sender_dropped() {
        let config = BenchConfig::default();
        let consumer = worker(0, Role::Consumer, "q", &config);
        let workers = vec![consumer];
        let checker = CompletionChecker::new(map(&workers), workers, 5, true);
        let (stop, handle) = checker
            .spawn(Duration::from_millis(5), Duration::from_millis(5))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        drop(stop);
        handle.join().unwrap();
    }
}
