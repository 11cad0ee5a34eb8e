use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use sim_core::{
    ChannelSink, Config, CsvSink, Driver, DriverBuilder, DriverSummary, Limiter, RampPlanner,
    Reporter, RunMetrics, ServerHandle, SimulatedServer, Snapshot, reported_limit,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "runner")]
#[command(about = "Drives a simulated server through a rate ramp and reports what the limiter did")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Transport: inproc or tcp
    #[arg(long, default_value = "inproc")]
    mode: String,

    /// Total runtime in milliseconds (overrides config)
    #[arg(long)]
    runtime_ms: Option<u64>,

    /// Report every N milliseconds (overrides config)
    #[arg(long)]
    report_every_ms: Option<u64>,

    /// Print the ramp schedule and exit
    #[arg(long)]
    ramp_only: bool,

    /// RNG seed (overrides config)
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RunResult {
    timestamp: String,
    mode: String,
    config: Config,
    summary: DriverSummary,
    peak_in_flight: usize,
    final_limit: Option<u64>,
    snapshots: Vec<Snapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(runtime_ms) = args.runtime_ms {
        config.scenario.runtime_ms = Some(runtime_ms);
    }
    if let Some(interval_ms) = args.report_every_ms {
        config.report.interval_ms = interval_ms;
    }
    if let Some(seed) = args.seed {
        config.scenario.seed = Some(seed);
    }
    config.validate().context("Invalid configuration")?;

    let planner = RampPlanner::from_config(&config.ramp);
    if args.ramp_only {
        print_ramp_schedule(&planner, config.runtime());
        return Ok(());
    }

    info!(
        mode = %args.mode,
        seed = ?config.scenario.seed,
        arrival = ?config.scenario.arrival,
        runtime_ms = config.runtime().as_millis() as u64,
        "starting run"
    );

    let result = run(config, &args.mode).await?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = format!("results/run_{}.json", timestamp);
    std::fs::create_dir_all("results").context("Failed to create results directory")?;
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)
        .with_context(|| format!("Failed to write {}", output_path))?;

    info!("Results written to {}", output_path);
    print_summary(&result);

    Ok(())
}

async fn run(config: Config, mode: &str) -> Result<RunResult> {
    let limiter: Arc<dyn Limiter> = Arc::new(config.limiter.build());
    let metrics = Arc::new(RunMetrics::new());

    let mut server = SimulatedServer::builder()
        .concurrency(config.server.concurrency)
        .latency(config.server.latency.clone())
        .limiter(limiter.clone());
    if let Some(seed) = config.scenario.seed {
        // Keep the latency stream independent of the arrival stream.
        server = server.seed(seed.wrapping_add(1));
    }
    let server = Arc::new(server.build().context("Failed to build simulated server")?);

    let on_success = metrics.clone();
    let on_drop = metrics.clone();
    let builder = DriverBuilder::from_config(&config)
        .success_action(move || {
            on_success.success.incr();
        })
        .drop_action(move || {
            on_drop.drop.incr();
        })
        .latency_accumulator(metrics.clone());

    // Held until the run finishes so the listener stays up.
    let mut listener = None;
    let builder = match mode {
        "inproc" => builder.target(server.clone()),
        "tcp" => {
            let handle = ServerHandle::bind(server.clone(), config.server.port)
                .await
                .context("Failed to start TCP server")?;
            info!(addr = %handle.addr(), "serving over tcp");
            let builder = builder.port(handle.port());
            listener = Some(handle);
            builder
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'inproc' or 'tcp'", mode),
    };
    let driver: Driver = builder.build().context("Failed to build driver")?;

    let (channel, mut ticks) = ChannelSink::new();
    let reporter = Reporter::new(
        Duration::from_millis(config.report.interval_ms),
        limiter.clone(),
        metrics.clone(),
    )
    .sink(CsvSink::new(std::io::stdout()))
    .sink(channel)
    .spawn();

    let summary = driver.run().await;
    let emitted = reporter.stop().await?;
    if let Some(handle) = listener {
        handle.shutdown();
    }
    let summary = summary.context("Driver failed")?;
    info!(ticks = emitted, "reporter stopped");

    let mut snapshots = Vec::new();
    while let Ok(snapshot) = ticks.try_recv() {
        snapshots.push(snapshot);
    }

    Ok(RunResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: mode.to_string(),
        peak_in_flight: server.peak_in_flight(),
        final_limit: reported_limit(limiter.limit()),
        config,
        summary,
        snapshots,
    })
}

fn print_ramp_schedule(planner: &RampPlanner, runtime: Duration) {
    println!("\n=== Ramp Schedule ===");
    println!("Schedule length: {}ms", planner.total_duration().as_millis());
    println!("Runtime: {}ms", runtime.as_millis());
    println!();

    for (idx, phase) in planner.phases().iter().enumerate() {
        println!(
            "Phase {}: {} -> {} RPS over {}ms",
            idx,
            phase.start_rps,
            phase.end_rps,
            phase.duration.as_millis()
        );
    }
    println!();
}

fn print_summary(result: &RunResult) {
    let summary = &result.summary;
    println!("\n=== Run Summary ({}) ===", result.mode);
    println!("Elapsed: {}ms", summary.elapsed_ms);
    println!("Cycles: {}", summary.cycles);
    println!("Issued: {}", summary.issued);
    println!("Admitted: {}", summary.admitted);
    println!("Rejected: {}", summary.rejected);
    println!("Failed: {}", summary.failed);
    println!("Aborted: {}", summary.aborted);
    println!("Peak in flight: {}", result.peak_in_flight);
    match result.final_limit {
        Some(limit) => println!("Final limit: {}", limit),
        None => println!("Final limit: unbounded"),
    }
    println!();
}
