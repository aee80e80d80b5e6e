use anyhow::{Context, Result};
use bench_core::{
    parse_spec_list, BenchConfig, Command, ConsumerSpec, InMemoryBroker, MessagingClient,
    ProducerSpec, RateControlMode, RunReport, Supervisor, Termination,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Messaging benchmark worker - runs producers and consumers from a run file")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Messaging client: memory
    #[arg(long, default_value = "memory")]
    client: String,

    /// Worker ID used in the result file name
    #[arg(long, default_value = "worker")]
    worker_id: String,

    /// Run ID (overrides config)
    #[arg(long)]
    run_id: Option<String>,

    /// Producer specs, comma separated cpu:commit:persistent:name:qtps:spc:cpt[:nthrd[:snum]]
    #[arg(long)]
    tx: Option<String>,

    /// Consumer specs, comma separated cpu:commit:recvMode:ackMode:durable:name:qtps:spc:cpt[:nthrd[:snum]]
    #[arg(long)]
    rx: Option<String>,

    /// Run for N seconds
    #[arg(long, conflicts_with = "count")]
    duration: Option<u64>,

    /// Send N messages to every producer destination, then stop
    #[arg(long)]
    count: Option<u64>,

    /// Global send rate in msgs/sec
    #[arg(long)]
    rate: Option<u64>,

    /// Read console commands from stdin
    #[arg(long)]
    commands: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    worker_id: String,
    timestamp: String,
    #[serde(flatten)]
    report: RunReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = BenchConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    apply_overrides(&mut config, &args)?;

    let client: Arc<dyn MessagingClient> = match args.client.as_str() {
        "memory" => Arc::new(InMemoryBroker::new()),
        other => anyhow::bail!("Invalid client: {}, must be 'memory'", other),
    };

    info!(
        "Starting worker '{}' run '{}' with {} client: {} producer specs, {} consumer specs",
        args.worker_id,
        config.run.id,
        client.name(),
        config.producers.len(),
        config.consumers.len()
    );

    let supervisor = Supervisor::start(config, client).context("Failed to start benchmark")?;

    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, stopping");
                supervisor.request_stop();
            }
        });
    }

    if args.commands {
        let supervisor = supervisor.clone();
        std::thread::Builder::new()
            .name("console".into())
            .spawn(move || read_commands(&supervisor))
            .context("Failed to start console thread")?;
    }

    let waiting = supervisor.clone();
    tokio::task::spawn_blocking(move || waiting.wait(|snapshot| info!("{}", snapshot))).await?;
    let report = tokio::task::spawn_blocking(move || supervisor.shutdown()).await?;

    let result = WorkerResult {
        worker_id: args.worker_id.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        report,
    };
    let output_path = format!("results/run_{}_{}.json", result.report.run_id, result.worker_id);
    std::fs::create_dir_all("results").ok();
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)
        .with_context(|| format!("Failed to write {}", output_path))?;

    info!("Results written to {}", output_path);
    print_summary(&result);

    let failed = result
        .report
        .workers
        .iter()
        .filter(|w| w.error.is_some())
        .count();
    if failed > 0 {
        anyhow::bail!("{} benchmark thread(s) failed", failed);
    }
    Ok(())
}

/// Console loop on stdin. The thread is left detached so a pending read
/// does not hold up exit.
fn read_commands(supervisor: &Supervisor) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => println!("{}", supervisor.apply(&command)),
            Err(e) => println!("{}", e),
        }
        if supervisor.stop_requested() {
            break;
        }
    }
}

fn apply_overrides(config: &mut BenchConfig, args: &Args) -> Result<()> {
    if let Some(run_id) = &args.run_id {
        config.run.id = run_id.clone();
    }
    if let Some(tx) = &args.tx {
        config.producers = parse_spec_list::<ProducerSpec>(tx).context("Invalid --tx")?;
    }
    if let Some(rx) = &args.rx {
        config.consumers = parse_spec_list::<ConsumerSpec>(rx).context("Invalid --rx")?;
    }
    if let Some(duration) = args.duration {
        config.run.termination = Termination::Duration;
        config.run.duration_secs = duration;
    }
    if let Some(count) = args.count {
        config.run.termination = Termination::Count;
        config.run.messages_per_destination = count;
    }
    if let Some(rate) = args.rate {
        if config.rate.mode == RateControlMode::Disabled {
            config.rate.mode = RateControlMode::PerThread;
        }
        config.rate.global_rate = Some(rate);
    }
    Ok(())
}

fn print_summary(result: &WorkerResult) {
    let report = &result.report;
    println!("\n=== Worker {} Summary (run {}) ===", result.worker_id, report.run_id);
    println!("Client: {}", report.client);
    println!("Duration: {}ms", report.duration_ms);
    println!("Destinations: {}", report.destinations);
    println!("Sent: {} ({:.0} msgs/sec)", report.sent, report.send_rate);
    println!("Received: {} ({:.0} msgs/sec)", report.received, report.receive_rate);
    println!("Errors: {}", report.errors);
    println!("Timeouts: {}", report.timeouts);
    for latency in &report.latency {
        println!("{} latency: {}", latency.category, latency.aggregate);
        if let Some(d) = &latency.min_destination {
            println!("  min avg destination {} avg={:.1}", d.name, d.mean);
        }
        if let Some(d) = &latency.max_destination {
            println!("  max avg destination {} avg={:.1}", d.name, d.mean);
        }
    }
    for worker in report.workers.iter().filter(|w| w.error.is_some()) {
        println!(
            "{} failed: {}",
            worker.label,
            worker.error.as_deref().unwrap_or_default()
        );
    }
    for line in &report.shortfalls {
        println!("{}", line);
    }
    println!();
}
