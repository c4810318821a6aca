use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::overload::OverloadDetector;
use tollgate::simulate::{self, Summary, Trace};

/// Admission control diagnostics: replay traces through the rate limiter
/// and watch the overload detector.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a request trace through the token bucket limiter
    Simulate(SimulateArgs),
    /// Run the overload detector and report flag changes until interrupted
    Watch(WatchArgs),
    /// Print the effective configuration
    Config {
        /// Configuration file (YAML, TOML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Trace file (YAML or JSON)
    #[arg(required_unless_present = "generate")]
    trace: Option<PathBuf>,

    /// Generate a random trace instead of reading one
    #[arg(long, conflicts_with = "trace")]
    generate: bool,

    /// Number of distinct clients in a generated trace
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Number of requests in a generated trace
    #[arg(long, default_value_t = 1000)]
    requests: usize,

    /// Time span of a generated trace in milliseconds
    #[arg(long, default_value_t = 10_000)]
    span_ms: u64,

    /// Seed for a reproducible generated trace
    #[arg(long)]
    seed: Option<u64>,

    /// Configuration file supplying limiter settings for a generated trace
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print one JSON object per decision followed by the summary
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Block the runtime for this many milliseconds at a time to provoke overload
    #[arg(long)]
    burn_ms: Option<u64>,

    /// Pause between blocking bursts in milliseconds
    #[arg(long, default_value_t = 1000)]
    burn_every_ms: u64,
}

// Single-threaded so that a busy worker delays the sampler the same way a
// saturated service would.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Simulate(args) => run_simulate(args),
        Command::Watch(args) => run_watch(args).await,
        Command::Config { config } => {
            let config = TollgateConfig::load(config.as_deref())?;
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let trace = if args.generate {
        let config = TollgateConfig::load(args.config.as_deref())?;
        let mut rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Trace::generate(
            args.clients,
            args.requests,
            args.span_ms,
            config.limiter.capacity,
            config.limiter.refill_interval_ms,
            &mut rng,
        )?
    } else {
        let path = args
            .trace
            .context("a trace file is required unless --generate is set")?;
        Trace::from_file(&path)?
    };

    info!(
        capacity = trace.capacity,
        refill_interval_ms = trace.refill_interval_ms,
        requests = trace.requests.len(),
        "Replaying trace"
    );

    let outcomes = simulate::replay(&trace)?;
    let summary = Summary::from_outcomes(&outcomes);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if args.json {
        for outcome in &outcomes {
            writeln!(out, "{}", serde_json::to_string(outcome)?)?;
        }
        writeln!(out, "{}", serde_json::to_string(&summary)?)?;
        return Ok(());
    }

    for outcome in &outcomes {
        let verdict = if outcome.allowed { "allow" } else { "reject" };
        writeln!(out, "{:>10}ms  {:<24} {}", outcome.at_ms, outcome.client, verdict)?;
    }
    writeln!(out)?;
    for (client, counts) in &summary.per_client {
        writeln!(
            out,
            "{:<24} allowed={:<8} rejected={}",
            client, counts.allowed, counts.rejected
        )?;
    }
    writeln!(
        out,
        "{:<24} allowed={:<8} rejected={}",
        "total", summary.total.allowed, summary.total.rejected
    )?;

    Ok(())
}

async fn run_watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = TollgateConfig::load(args.config.as_deref())?;
    info!(
        check_interval_ms = config.overload.check_interval_ms,
        overload_threshold_ms = config.overload.overload_threshold_ms,
        "Configuration loaded"
    );

    let detector = OverloadDetector::from_config(&config.overload, shutdown_signal())?;
    let signal = detector.signal();

    let every_ms = args.burn_every_ms;
    let burner = args.burn_ms.map(|burn_ms| {
        info!(burn_ms, every_ms, "Blocking the runtime periodically");
        tokio::spawn(async move {
            let mut every = tokio::time::interval(Duration::from_millis(every_ms));
            loop {
                every.tick().await;
                std::thread::sleep(Duration::from_millis(burn_ms));
            }
        })
    });

    let mut poll = tokio::time::interval(config.overload.check_interval());
    let mut last = false;
    println!("{}  overloaded={}", chrono::Utc::now().to_rfc3339(), last);

    // The detector consumes the shutdown signal; it stops running on Ctrl+C.
    while detector.is_running() {
        poll.tick().await;
        let overloaded = signal.is_overloaded();
        if overloaded != last {
            println!("{}  overloaded={}", chrono::Utc::now().to_rfc3339(), overloaded);
            last = overloaded;
        }
    }

    if let Some(burner) = burner {
        burner.abort();
    }
    detector.stop().await;

    info!("Tollgate watch stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM; ends the detector's sampling in `watch`.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping overload watch");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping overload watch");
        }
    }
}
