//! Reserved-resources agent
//!
//! Runs as a privileged DaemonSet pod in the host PID namespace, measures
//! what non-pod processes actually consume, and drives the kube-reserved
//! recommendation (and, optionally, the pod cgroup memory limit) from it.

use anyhow::{Context, Result};
use kube_reserved_lib::{
    cpu::{self, CpuPaths},
    disk::DiskScanner,
    health::HealthRegistry,
    memory::MemoryPaths,
    observability::NodeMetrics,
    proc,
    reconciler::{Reconciler, ReconcilerConfig, DEFAULT_MEMORY_PERIOD},
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const METRICS_PORT: u16 = 16911;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = AGENT_VERSION, "Starting kube-reserved-agent");

    let config = config::AgentConfig::load()?;

    // Fail now rather than on the first tick: a kernel without MemAvailable
    // cannot be reconciled at all.
    proc::read_meminfo(proc::PROC_MEMINFO)
        .await
        .context("startup check of /proc/meminfo failed")?;

    if !cpu::hierarchy_available(&config.cgroups_hierarchy_root).await {
        warn!(
            root = %config.cgroups_hierarchy_root.display(),
            "cgroup v1 cpu/memory controllers not found under the hierarchy root; every tick will fail until they appear"
        );
    }

    let num_cores = num_cpus::get() as i64;
    info!(
        num_cores,
        period_secs = config.period.get().as_secs(),
        enforce = config.enforce_recommendation,
        "Agent configured"
    );

    let metrics = NodeMetrics::new();
    let health_registry = HealthRegistry::new(DEFAULT_MEMORY_PERIOD, config.period.get());

    let applier = config.applier();
    if let Some(applier) = &applier {
        health_registry.enable_apply(applier.name()).await;
        info!(sink = applier.name(), "Reservation sink configured");
    }

    let reconciler = Arc::new(Reconciler::new(
        ReconcilerConfig {
            memory_period: DEFAULT_MEMORY_PERIOD,
            reconciliation_period: config.period.get(),
            memory_paths: MemoryPaths::new(
                &config.cgroups_hierarchy_root,
                config.cgroups_containerd_root.clone(),
                config.cgroups_kubelet_root.clone(),
            ),
            cpu_paths: CpuPaths::new(&config.cgroups_hierarchy_root),
            disk_scanner: DiskScanner::new(
                &config.containerd_root_directory,
                &config.containerd_state_directory,
                &config.kubelet_directory,
            ),
            memory_safety_margin: config.memory_safety_margin_absolute,
            minimum_reserved_memory: config.minimum_reserved_memory,
            enforce_recommendation: config.enforce_recommendation,
            num_cores,
        },
        metrics,
        health_registry.clone(),
        applier,
    ));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        config.enforce_recommendation,
    ));
    let listener = api::bind(METRICS_PORT).await?;
    let api_handle = tokio::spawn(api::serve(listener, app_state));

    let (shutdown_tx, _) = broadcast::channel(1);
    let memory_handle = tokio::spawn(
        reconciler
            .clone()
            .run_memory_loop(shutdown_tx.subscribe()),
    );
    let slow_handle = tokio::spawn(reconciler.clone().run_slow_loop(shutdown_tx.subscribe()));

    health_registry.set_ready(true).await;

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(());

    // Either loop dying early is already logged; the process keeps the other
    // alive, so only the final join is interesting here.
    if let Err(e) = memory_handle.await {
        error!(error = %e, "memory loop ended abnormally");
    }
    if let Err(e) = slow_handle.await {
        error!(error = %e, "slow loop ended abnormally");
    }
    api_handle.abort();

    Ok(())
}
