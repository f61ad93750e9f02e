use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};

use flowguard::config::{FlowguardConfig, LoggingConfig};
use flowguard::guard::{GuardedCall, RateGuard, Target};
use flowguard::ratelimit::{CallSignature, FallbackCall, RateSpec, TimeUnit};
use flowguard::store::{MemoryBackend, MemoryStore};
use flowguard::telemetry;

/// Flowguard - per-resource admission control
#[derive(Parser, Debug)]
#[command(name = "flowguard")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration file and list its limiters
    Check {
        /// Path to configuration file
        config: PathBuf,
    },

    /// Run guarded calls against an in-memory store and print each outcome
    Probe {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Limiter to probe; must be declared when a config is given
        #[arg(long, default_value = "probe")]
        limiter: String,

        /// Permits per second when no config is given
        #[arg(long, default_value = "1")]
        rate: u64,

        /// Number of calls to make
        #[arg(long, default_value = "5")]
        calls: usize,

        /// JSON argument values passed to every call, in order
        #[arg(long = "arg")]
        args: Vec<String>,
    },
}

/// Type name probe calls are made on.
const PROBE_TYPE: &str = "flowguard::Probe";

struct Probe;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => {
            telemetry::init(&LoggingConfig::default());
            check(config)
        }
        Command::Probe {
            config,
            limiter,
            rate,
            calls,
            args,
        } => {
            let config = match config {
                Some(path) => Some(FlowguardConfig::from_file(&path)?),
                None => None,
            };
            let logging = config.as_ref().map(|c| c.logging.clone()).unwrap_or_default();
            telemetry::init(&logging);

            tokio::select! {
                result = probe(config, &limiter, rate, calls, &args) => result,
                _ = shutdown_signal() => Ok(()),
            }
        }
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = FlowguardConfig::from_file(&path)?;
    info!(path = %path.display(), limiters = config.limiters.len(), "Configuration is valid");

    let mut names: Vec<&String> = config.limiters.keys().collect();
    names.sort();
    for name in names {
        if let Some(spec) = config.limiter(name) {
            println!(
                "{}: {} per {} {} ({} permits/call, {}, {})",
                spec.name,
                spec.rate,
                spec.interval,
                spec.interval_unit,
                spec.permits,
                if spec.blocking { "blocking" } else { "non-blocking" },
                if spec.has_fallback() { spec.fallback.as_str() } else { "no fallback" },
            );
        }
    }
    Ok(())
}

async fn probe(
    config: Option<FlowguardConfig>,
    limiter: &str,
    rate: u64,
    calls: usize,
    raw_args: &[String],
) -> anyhow::Result<()> {
    let (mut spec, guard_config, store_config) = match &config {
        Some(config) => {
            let spec = config
                .limiter(limiter)
                .with_context(|| format!("limiter {} is not declared", limiter))?;
            (spec, config.guard.clone(), config.store.memory_store_config())
        }
        None => {
            let spec = RateSpec::new(rate)
                .named(limiter)
                .timeout(0, TimeUnit::Milliseconds);
            spec.validate()?;
            (spec, Default::default(), Default::default())
        }
    };
    // Fallbacks are registered on the probe type itself.
    spec.fallback_owner = None;

    let args = raw_args
        .iter()
        .map(|raw| serde_json::from_str::<Value>(raw).with_context(|| format!("invalid JSON argument {}", raw)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let params: Vec<&str> = args.iter().map(|_| "Value").collect();
    let signature = CallSignature::new::<String>(PROBE_TYPE, "call", &params);

    let store = Arc::new(MemoryStore::connect(Arc::new(MemoryBackend::new()), store_config));
    let guard = RateGuard::from_config(store, &guard_config);
    if spec.has_fallback() {
        let name = spec.fallback.clone();
        guard
            .fallbacks()
            .register(PROBE_TYPE, &spec.fallback, &params, move |_call: FallbackCall| {
                let name = name.clone();
                async move { anyhow::Ok(format!("fallback {}", name)) }
            });
    }

    let target = Target::new(PROBE_TYPE, Arc::new(Probe));
    info!(resource = %spec.name, rate = spec.rate, calls = calls, "Probing limiter");

    for i in 1..=calls {
        let call = GuardedCall::new(&spec, &signature, &args, &target);
        let outcome = guard
            .call(call, || async { anyhow::Ok("granted".to_string()) })
            .await?;
        let outcome = if outcome.is_empty() { "rejected" } else { outcome.as_str() };
        println!("call {}: {}", i, outcome);
    }

    guard.shutdown().await?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
