use anyhow::{Context, Result};
use bench_core::{BenchConfig, Histogram, LatencySummary, RampPlanner, RunReport, SparseHistogram};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "Messaging benchmark controller - spawns workers locally and merges results")]
struct Args {
    /// Base run file, every worker gets a copy with its share of the rate
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Print the worker command lines and rate split, then exit
    #[arg(long)]
    dry_run: bool,

    /// Number of worker processes to start on this host
    #[arg(long = "local-workers", alias = "local", default_value_t = 0)]
    local_workers: u32,

    /// Print the rate schedule and exit
    #[arg(long)]
    ramp_only: bool,

    /// Merge the result files of a finished run instead of starting one
    #[arg(long)]
    merge_run_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    worker_id: String,
    timestamp: String,
    #[serde(flatten)]
    report: RunReport,
}

#[derive(Debug, Serialize, Deserialize)]
struct MergedResult {
    timestamp: String,
    run_id: String,
    worker_count: usize,
    total_duration_ms: u64,
    total_sent: u64,
    total_received: u64,
    total_errors: u64,
    total_timeouts: u64,
    total_send_rate: f64,
    total_receive_rate: f64,
    rtt: Option<LatencySummary>,
    rtt_histogram: Option<SparseHistogram>,
    failed_workers: Vec<String>,
    shortfalls: Vec<String>,
    workers: Vec<WorkerResult>,
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
    let config = BenchConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let planner = RampPlanner::new(config.rate.ramp.clone());
    print_ramp_schedule(&planner, &config);

    if args.ramp_only {
        return Ok(());
    }

    if args.local_workers == 0 {
        match args.merge_run_id.as_deref() {
            Some(run_id) => return merge_and_report(run_id),
            None => {
                info!("nothing to do: pass --local-workers N to run or --merge-run-id to merge");
                return Ok(());
            }
        }
    }

    let run_id = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let worker_bin = infer_worker_binary()?;
    if args.dry_run {
        print_dry_run(&worker_bin, &config, args.local_workers, &run_id);
        return Ok(());
    }

    info!(
        workers = args.local_workers,
        run_id = %run_id,
        bin = %worker_bin.display(),
        "starting local workers"
    );
    std::fs::create_dir_all("runs").context("creating runs directory")?;

    let mut children = Vec::new();
    for i in 0..args.local_workers {
        let run_file = write_worker_config(&config, args.local_workers, i, &run_id)
            .with_context(|| format!("writing run file of worker {i}"))?;
        children.push(spawn_worker(&worker_bin, &run_file, format!("worker-{i}"), &run_id)?);
    }
    for child in children {
        child.await??;
    }

    merge_and_report(&run_id)
}

fn spawn_worker(
    bin: &Path,
    run_file: &Path,
    worker_id: String,
    run_id: &str,
) -> Result<tokio::task::JoinHandle<Result<()>>> {
    let mut child = Command::new(bin)
        .arg("--config")
        .arg(run_file)
        .args(["--worker-id", &worker_id, "--run-id", run_id])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawning {worker_id}"))?;

    Ok(tokio::spawn(async move {
        let status = child.wait().await?;
        if !status.success() {
            warn!(worker = %worker_id, %status, "worker exited unsuccessfully");
        }
        Ok::<(), anyhow::Error>(())
    }))
}

/// Merges the result files of `run_id`, writes the merged file and fails
/// when any worker thread failed.
fn merge_and_report(run_id: &str) -> Result<()> {
    let workers = collect_worker_results(run_id)?;
    if workers.is_empty() {
        anyhow::bail!("no worker results found for run_id={run_id}");
    }

    let merged = merge_results(run_id.to_string(), workers);
    save_merged_results(&merged)?;
    print_merged_summary(&merged);

    if !merged.failed_workers.is_empty() {
        anyhow::bail!("{} worker thread(s) failed", merged.failed_workers.len());
    }
    Ok(())
}

fn print_ramp_schedule(planner: &RampPlanner, config: &BenchConfig) {
    println!("\n=== Rate Schedule ===");
    println!("Control mode: {:?}", config.rate.mode);
    println!("Global rate: {} msgs/sec", config.rate.effective_rate());
    if planner.is_empty() {
        println!();
        return;
    }
    println!("Ramp duration: {}ms", planner.total_duration_ms());
    for (idx, step) in planner.steps().iter().enumerate() {
        println!("Step {}: {} msgs/sec for {}ms", idx, step.tps, step.hold_ms);
    }
    println!();
}

fn print_dry_run(worker_bin: &Path, config: &BenchConfig, local_n: u32, run_id: &str) {
    println!("\n=== Dry Run (run_id={run_id}) ===");
    for i in 0..local_n {
        let rate = config
            .rate
            .global_rate
            .map(|r| split_rate(r, local_n, i).to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  [{i}] rate={rate} {} --config runs/run_{run_id}_worker_{i}.toml --worker-id worker-{i} --run-id {run_id}",
            worker_bin.display()
        );
    }
    println!();
}

fn split_rate(total: u64, workers: u32, worker_idx: u32) -> u64 {
    if workers == 0 {
        return 0;
    }
    let base = total / workers as u64;
    let rem = total % workers as u64;
    if (worker_idx as u64) < rem {
        base.saturating_add(1)
    } else {
        base
    }
}

/// Writes the run file of one local worker: the base config with every
/// global rate divided between the workers.
fn write_worker_config(
    base: &BenchConfig,
    workers: u32,
    worker_idx: u32,
    run_id: &str,
) -> Result<PathBuf> {
    let mut cfg = base.clone();
    cfg.run.id = run_id.to_string();
    if let Some(rate) = cfg.rate.global_rate {
        cfg.rate.global_rate = Some(split_rate(rate, workers, worker_idx));
    }
    for step in &mut cfg.rate.ramp {
        step.tps = split_rate(step.tps, workers, worker_idx);
    }
    if cfg.latency.sample_rate > 0 {
        cfg.latency.sample_rate = split_rate(cfg.latency.sample_rate, workers, worker_idx).max(1);
    }

    let out = PathBuf::from(format!("runs/run_{run_id}_worker_{worker_idx}.toml"));
    let s = toml::to_string_pretty(&cfg)?;
    std::fs::write(&out, s)?;
    Ok(out)
}

/// `WORKER_BIN` wins, then a `worker` next to this executable, then the
/// cargo target directories.
fn infer_worker_binary() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("WORKER_BIN") {
        return Ok(PathBuf::from(path));
    }

    let mut candidates = Vec::new();
    if let Some(dir) = std::env::current_exe()?.parent() {
        candidates.push(dir.join("worker"));
    }
    candidates.push(PathBuf::from("target/release/worker"));
    candidates.push(PathBuf::from("target/debug/worker"));

    candidates
        .into_iter()
        .find(|c| c.is_file())
        .context("no worker binary found, build it with `cargo build --bin worker` or set WORKER_BIN")
}

/// Worker result files of `run_id`, sorted by worker id. The merged file of
/// an earlier merge is skipped.
fn collect_worker_results(run_id: &str) -> Result<Vec<WorkerResult>> {
    let dir = Path::new("results");
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let prefix = format!("run_{run_id}_");
    let mut results = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let wanted = name.starts_with(&prefix)
            && name.ends_with(".json")
            && !name.ends_with("_merged.json");
        if !wanted {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let result: WorkerResult = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        results.push(result);
    }

    results.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Ok(results)
}

/// Sums counters and rates, and merges the round-trip histograms so the
/// percentiles are computed over every sample rather than averaged.
fn merge_results(run_id: String, workers: Vec<WorkerResult>) -> MergedResult {
    let worker_count = workers.len();
    let reports = || workers.iter().map(|w| &w.report);

    let mut rtt: Option<Histogram> = None;
    for sparse in reports().filter_map(|r| r.rtt_histogram.as_ref()) {
        let hist = Histogram::from_sparse(sparse);
        match rtt.as_mut() {
            Some(merged) => {
                merged.merge(&hist);
                merged.merge_extremes(&hist);
            }
            None => rtt = Some(hist),
        }
    }

    let failed_workers = workers
        .iter()
        .flat_map(|w| {
            w.report
                .workers
                .iter()
                .filter(|t| t.error.is_some())
                .map(move |t| format!("{}/{}", w.worker_id, t.label))
        })
        .collect();
    let shortfalls = workers
        .iter()
        .flat_map(|w| {
            w.report
                .shortfalls
                .iter()
                .map(move |s| format!("{}: {}", w.worker_id, s))
        })
        .collect();

    MergedResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        run_id,
        worker_count,
        total_duration_ms: reports().map(|r| r.duration_ms).max().unwrap_or(0),
        total_sent: reports().map(|r| r.sent).sum(),
        total_received: reports().map(|r| r.received).sum(),
        total_errors: reports().map(|r| r.errors).sum(),
        total_timeouts: reports().map(|r| r.timeouts).sum(),
        total_send_rate: reports().map(|r| r.send_rate).sum(),
        total_receive_rate: reports().map(|r| r.receive_rate).sum(),
        rtt: rtt.as_ref().map(LatencySummary::from_histogram),
        rtt_histogram: rtt.as_ref().map(Histogram::to_sparse),
        failed_workers,
        shortfalls,
        workers,
    }
}

fn save_merged_results(merged: &MergedResult) -> Result<PathBuf> {
    std::fs::create_dir_all("results").context("creating results directory")?;
    let path = PathBuf::from(format!("results/run_{}_merged.json", merged.run_id));
    std::fs::write(&path, serde_json::to_string_pretty(merged)?)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "merged results written");
    Ok(path)
}

fn print_merged_summary(merged: &MergedResult) {
    println!(
        "\n=== Merged Results ({} workers, run_id={}) ===",
        merged.worker_count, merged.run_id
    );
    println!("Total duration: {}ms", merged.total_duration_ms);
    println!("Total sent: {} ({:.0} msgs/sec)", merged.total_sent, merged.total_send_rate);
    println!(
        "Total received: {} ({:.0} msgs/sec)",
        merged.total_received, merged.total_receive_rate
    );
    println!("Total errors: {}", merged.total_errors);
    println!("Total timeouts: {}", merged.total_timeouts);
    if let Some(rtt) = &merged.rtt {
        println!("RTT latency: {}", rtt);
    }
    for failed in &merged.failed_workers {
        println!("Failed: {}", failed);
    }
    for line in &merged.shortfalls {
        println!("{}", line);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_rate_covers_total() {
        let parts: Vec<u64> = (0..3).map(|i| split_rate(1000, 3, i)).collect();
        assert_eq!(parts, vec![334, 333, 333]);
        assert_eq!(parts.iter().sum::<u64>(), 1000);
        assert_eq!(split_rate(10, 0, 0), 0);
    }

    fn report(sent: u64, samples: &[u64]) -> RunReport {
        let mut hist = Histogram::new(100);
        for &s in samples {
            hist.record(s);
        }
        RunReport {
            run_id: "r1".into(),
            client: "memory".into(),
            termination: bench_core::Termination::Duration,
            duration_ms: 1000 + sent,
            destinations: 1,
            sent,
            received: sent,
            send_rate: sent as f64,
            receive_rate: sent as f64,
            errors: 0,
            timeouts: 0,
            workers: Vec::new(),
            shortfalls: Vec::new(),
            latency: Vec::new(),
            rtt_histogram: (!samples.is_empty()).then(|| hist.to_sparse()),
        }
    }

    #[test]
    fn test_merge_recomputes_percentiles() {
        let workers = vec![
            WorkerResult {
                worker_id: "worker-0".into(),
                timestamp: String::new(),
                report: report(100, &[1, 1, 1, 1]),
            },
            WorkerResult {
                worker_id: "worker-1".into(),
                timestamp: String::new(),
                report: report(50, &[90, 90, 90, 90]),
            },
        ];
        let merged = merge_results("r1".into(), workers);
        assert_eq!(merged.total_sent, 150);
        assert_eq!(merged.total_duration_ms, 1100);
        let rtt = merged.rtt.unwrap();
        assert_eq!(rtt.samples, 8);
        assert_eq!(rtt.min, 1);
        assert_eq!(rtt.max, 90);
        assert_eq!(rtt.p50, 1);
        assert_eq!(rtt.p95, 90);
        assert!(merged.failed_workers.is_empty());
    }

    #[test]
    fn test_worker_result_round_trips_through_json() {
        let result = WorkerResult {
            worker_id: "worker-0".into(),
            timestamp: "now".into(),
            report: report(7, &[3]),
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: WorkerResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.report.sent, 7);
        assert_eq!(back.worker_id, "worker-0");
    }
}
