use bench_core::{
    BenchConfig, ConsumerSpec, DestinationLayout, InMemoryBroker, LatencyCategory,
    ProducerSpec, RateControlMode, Supervisor, Termination,
};
use std::sync::Arc;

fn config(mode: RateControlMode) -> BenchConfig {
    let mut config = BenchConfig::default();
    config.server.endpoints = vec!["local".into()];
    config.run.termination = Termination::Duration;
    config.run.duration_secs = 10;
    config.rate.mode = mode;
    config.rate.global_rate = Some(500);
    config.latency.mask = LatencyCategory::RoundTrip.bit();
    config.latency.sample_rate = 100;
    config.latency.histogram_size = 1_000_000;
    let layout = DestinationLayout {
        name: "paced".into(),
        ..DestinationLayout::default()
    };
    config.producers = vec![ProducerSpec {
        layout: layout.clone(),
        ..ProducerSpec::default()
    }];
    config.consumers = vec![ConsumerSpec {
        layout,
        ..ConsumerSpec::default()
    }];
    config
}

fn assert_paced(mode: RateControlMode) {
    let supervisor = Supervisor::start(config(mode), Arc::new(InMemoryBroker::new())).unwrap();
    let mut snapshots = 0;
    supervisor.wait(|_| snapshots += 1);
    let report = supervisor.shutdown();

    assert!(report.is_success(), "{:?}", report.shortfalls);
    assert!(
        (4500..=5500).contains(&report.sent),
        "sent {} messages in {:?} mode",
        report.sent,
        mode
    );
    assert!(snapshots >= 1);

    let rtt = report
        .latency
        .iter()
        .find(|r| r.category == LatencyCategory::RoundTrip.label())
        .unwrap();
    assert!(rtt.aggregate.samples > 0);
    assert_eq!(rtt.aggregate.overflow, 0);
    assert!(report.rtt_histogram.is_some());
}

#[test]
fn test_per_thread_pacing_holds_rate() {
    assert_paced(RateControlMode::PerThread);
}

#[test]
fn test_shared_pacing_holds_rate() {
    assert_paced(RateControlMode::Shared);
}
