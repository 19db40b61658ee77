//! Cordon launcher.
//!
//! Wires the store (remote HTTP when `CORDON_STORE_URL` is set, in-memory
//! otherwise), the local cache, enforcement and executor bindings, the
//! orchestrator loops and the API server, then runs until the duration
//! elapses or a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cordon_api::{ApiConfig, ApiServer, ApiState};
use cordon_core::config::CordonConfig;
use cordon_healing::enforcement::NoopEnforcement;
use cordon_orchestrator::orchestrator::Orchestrator;
use cordon_orchestrator::sim::{ChaosInjector, SimulatedAgent, SimulatedExecutor};
use cordon_store::http::{HttpStore, HttpStoreConfig};
use cordon_store::memory::MemoryStore;
use cordon_store::prelude::CacheManager;
use cordon_store::Store;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const AGENT_TYPES: [&str; 5] = ["researcher", "coder", "support", "analyst", "ops"];
const MODELS: [&str; 4] = ["gpt-4o", "gpt-5", "claude-sonnet-4", "claude-opus-4"];

/// Cordon CLI arguments.
#[derive(Debug, Parser)]
#[clap(name = "cordon", version, about = "Self-healing control plane for AI agents")]
struct Cli {
    /// Run duration in seconds; 0 runs until interrupted.
    #[clap(long, default_value_t = 0)]
    duration: u64,

    /// Number of simulated agents to run (0 = external ingest only).
    #[clap(long, default_value_t = 0)]
    agents: usize,

    /// Periodically inject faults into the simulated fleet.
    #[clap(long)]
    chaos: bool,

    /// API bind address.
    #[clap(long, default_value = "0.0.0.0:8800")]
    bind: String,

    /// Log level (trace, debug, info, warn, error).
    #[clap(long, env = "CORDON_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON logs.
    #[clap(long, env = "CORDON_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting cordon");
    let config = CordonConfig::from_env();

    // Local cache: restart resilience for run id, baselines, quarantine
    // and the ingest key. An unwritable directory degrades to in-memory.
    let cache = Arc::new(CacheManager::new(config.cache.dir.clone()));
    cache.load();
    let run_id = cache.run_id();
    let api_key = cache.api_key(config.ingest_api_key.as_deref());
    info!(run_id = %run_id, cache_dir = %config.cache.dir.display(), "run identity established");

    if let Some(endpoint) = &config.otel_endpoint {
        info!(endpoint = %endpoint, "OTLP endpoint recognized; export wiring is external");
    }

    let store: Arc<dyn Store> = match &config.store_url {
        Some(url) => {
            info!(url = %url, "using remote store");
            let mut store_config = HttpStoreConfig::new(url.clone());
            store_config.token = config.store_token.clone();
            Arc::new(HttpStore::new(store_config, run_id.clone()).context("remote store")?)
        }
        None => {
            warn!("CORDON_STORE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new(run_id.clone()))
        }
    };

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok();
    if prometheus.is_none() {
        warn!("prometheus recorder unavailable; /metrics disabled");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // The simulated fleet shares one executor and no-op enforcement; real
    // deployments swap in gateway/process/container bindings.
    let fleet = cordon_orchestrator::sim::empty_fleet();
    let orchestrator = Orchestrator::new(
        config.clone(),
        store,
        cache.clone(),
        Arc::new(NoopEnforcement::new()),
        Arc::new(SimulatedExecutor::new(fleet.clone())),
        fleet,
    );
    for i in 0..cli.agents {
        orchestrator.register_sim_agent(SimulatedAgent::new(
            format!("agent-{i:03}"),
            AGENT_TYPES[i % AGENT_TYPES.len()],
            MODELS[i % MODELS.len()],
        ));
    }
    if cli.agents > 0 {
        info!(agents = cli.agents, chaos = cli.chaos, "simulated fleet registered");
    }

    if cli.chaos {
        let sim_fleet = orchestrator.sim_fleet();
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let injector = ChaosInjector::new();
            // Let baselines warm up before the first wave.
            tokio::time::sleep(std::time::Duration::from_secs(20)).await;
            loop {
                injector.inject_random(&sim_fleet, 3);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(25)) => {}
                    _ = stop.changed() => return,
                }
            }
        });
    }

    let api_config = ApiConfig {
        bind_addr: cli.bind.parse().context("invalid --bind address")?,
        ..ApiConfig::default()
    };
    let api_state = ApiState {
        orchestrator: orchestrator.clone(),
        api_key: Some(api_key),
        prometheus,
    };
    let api = ApiServer::new(api_config, api_state);
    let api_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = api.serve(shutdown).await {
                warn!(error = %e, "API server exited");
            }
        })
    };

    // Signal handling: first signal triggers the graceful path.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    let duration = (cli.duration > 0).then(|| std::time::Duration::from_secs(cli.duration));
    orchestrator.clone().run(duration, shutdown_rx).await;
    let _ = shutdown_tx.send(true);

    // Final cache flush within the shutdown deadline.
    let flush_deadline = config.cache.flush_deadline;
    let flush = tokio::time::timeout(flush_deadline, async {
        cache.save_if_dirty();
    });
    if flush.await.is_err() {
        warn!("final cache flush exceeded deadline");
    }
    let _ = api_handle.await;

    info!("cordon stopped");
    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level: tracing::Level = cli.log_level.parse().context("invalid log level")?;
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
    Ok(())
}

/// Wait for SIGTERM or CTRL+C.
async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
