//! The two reconciliation loops
//!
//! Memory runs on its own fast cadence because memory pressure is the lethal
//! failure mode: the pod cgroup limit has to move before the global OOM
//! killer does. CPU and disk share the slow loop; the CPU measurement itself
//! occupies half the reconciliation period, the disk scan and the sleep fill
//! the rest, so one slow iteration takes roughly one period.
//!
//! A failing iteration is logged and abandoned; nothing is mutated and the
//! next tick starts from a fresh snapshot. Losing a tick costs one period at
//! most, so there is no retry and no backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

use crate::apply::{ApplyReservation, ReservationUpdate};
use crate::cpu::{self, CpuPaths};
use crate::disk::{self, DiskScanner};
use crate::health::{HealthRegistry, Task};
use crate::heuristics;
use crate::memory::{self, MemoryPaths};
use crate::observability::NodeMetrics;
use crate::quantity::Quantity;
use crate::report;

pub const DEFAULT_MEMORY_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONCILIATION_PERIOD: Duration = Duration::from_secs(20);

/// Everything both loops need, assembled once at startup.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub memory_period: Duration,
    pub reconciliation_period: Duration,
    pub memory_paths: MemoryPaths,
    pub cpu_paths: CpuPaths,
    pub disk_scanner: DiskScanner,
    pub memory_safety_margin: Quantity,
    pub minimum_reserved_memory: Quantity,
    /// When set, the memory loop writes the computed limit to the pod cgroup.
    pub enforce_recommendation: bool,
    pub num_cores: i64,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    metrics: NodeMetrics,
    health: HealthRegistry,
    applier: Option<Arc<dyn ApplyReservation>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        metrics: NodeMetrics,
        health: HealthRegistry,
        applier: Option<Arc<dyn ApplyReservation>>,
    ) -> Self {
        Self {
            config,
            metrics,
            health,
            applier,
        }
    }

    /// Fast loop: snapshot, recommend, export, optionally enforce.
    pub async fn run_memory_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            period_secs = self.config.memory_period.as_secs(),
            enforce = self.config.enforce_recommendation,
            "starting memory reconciliation loop"
        );

        let mut ticker = interval(self.config.memory_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_memory().await {
                        Ok(()) => self.health.tick_succeeded(Task::MemoryLoop).await,
                        Err(e) => {
                            warn!(error = %e, "memory reconciliation failed, retrying next tick");
                            self.health.tick_failed(Task::MemoryLoop, e.to_string()).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("shutting down memory reconciliation loop");
                    break;
                }
            }
        }
    }

    /// Slow loop: CPU sampling window, disk scan, reservation push, sleep.
    pub async fn run_slow_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            period_secs = self.config.reconciliation_period.as_secs(),
            "starting CPU and disk reconciliation loop"
        );

        let half_period = self.config.reconciliation_period / 2;
        loop {
            // The sampling window blocks and is deliberately not interrupted;
            // worst-case shutdown latency is one window plus a syscall.
            if let Err(e) = self.reconcile_cpu(half_period).await {
                warn!(error = %e, "CPU reconciliation failed, retrying next tick");
                self.health.tick_failed(Task::SlowLoop, e.to_string()).await;
            } else {
                self.health.tick_succeeded(Task::SlowLoop).await;
            }

            if let Err(e) = self.reconcile_disk().await {
                warn!(error = %e, "disk reconciliation failed, retrying next tick");
                self.health.tick_failed(Task::SlowLoop, e.to_string()).await;
            }

            if self.applier.is_some() {
                if let Err(e) = self.apply_reservation().await {
                    warn!(error = %e, "reservation push failed, retrying next tick");
                    self.health.tick_failed(Task::Apply, e.to_string()).await;
                } else {
                    self.health.tick_succeeded(Task::Apply).await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(half_period) => {}
                _ = shutdown.recv() => {
                    info!("shutting down CPU and disk reconciliation loop");
                    break;
                }
            }
        }
    }

    async fn reconcile_memory(&self) -> Result<()> {
        let snapshot = memory::collect(&self.config.memory_paths).await?;
        let recommendation = memory::recommend(
            &snapshot,
            self.config.memory_safety_margin,
            self.config.minimum_reserved_memory,
        );
        let reference = heuristics::reserved_memory_for_capacity(snapshot.mem_total);

        self.metrics
            .record_memory(&snapshot, &recommendation, reference);
        println!("{}", report::render_memory(&snapshot, &recommendation));

        let Some(pod_limit_target) = recommendation.pod_limit_target(&snapshot) else {
            warn!(
                pod_working_set = %snapshot.pod_working_set,
                used = %recommendation.used,
                "{}",
                recommendation.reservation.rationale
            );
            return Ok(());
        };

        if self.config.enforce_recommendation {
            memory::enforce(
                &self.config.memory_paths.hierarchy_root,
                &self.config.memory_paths.pod_slice,
                pod_limit_target,
            )
            .await?;
        }

        Ok(())
    }

    async fn reconcile_cpu(&self, window: Duration) -> Result<()> {
        let snapshot =
            cpu::sample(&self.config.cpu_paths, window, self.config.num_cores).await?;
        let recommendation = cpu::recommend(&snapshot)?;

        self.metrics.record_cpu(snapshot.num_cores, &recommendation);
        println!(
            "{}",
            report::render_cpu(&recommendation, snapshot.system_shares, snapshot.pod_shares)
        );

        // Intentionally no cpu.shares write here: the kubelet pins
        // system.slice at 1024 shares, so enforcing the target would only
        // shrink schedulable capacity (see the recommender docs).
        Ok(())
    }

    async fn reconcile_disk(&self) -> Result<()> {
        let snapshot = self.config.disk_scanner.scan().await?;
        let (reservation, _) = disk::recommend(&snapshot);

        self.metrics.record_disk(&snapshot, reservation);
        println!("{}", report::render_disk(&snapshot, reservation));
        Ok(())
    }

    /// Hands the current memory reservation target to the configured sink.
    /// Recomputes from a fresh snapshot so the slow loop never shares state
    /// with the memory loop; the memory gauges stay single-writer.
    async fn apply_reservation(&self) -> Result<()> {
        let Some(applier) = &self.applier else {
            return Ok(());
        };

        let snapshot = memory::collect(&self.config.memory_paths).await?;
        let recommendation = memory::recommend(
            &snapshot,
            self.config.memory_safety_margin,
            self.config.minimum_reserved_memory,
        );
        if recommendation.is_anomalous() {
            warn!("skipping reservation push: {}", recommendation.reservation.rationale);
            return Ok(());
        }

        applier
            .apply(&ReservationUpdate {
                reserved_memory: recommendation.reservation_target,
                reserved_cpu_millicores: 0,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::fs;

    async fn mock_node(dir: &Path) -> ReconcilerConfig {
        let meminfo = dir.join("meminfo");
        fs::write(
            &meminfo,
            "MemTotal:       10485760 kB\nMemAvailable:    4194304 kB\n",
        )
        .await
        .unwrap();

        for slice in [
            "kubepods",
            "system.slice",
            "system.slice/containerd.service",
            "system.slice/kubelet.service",
        ] {
            let cg = dir.join("memory").join(slice);
            fs::create_dir_all(&cg).await.unwrap();
            fs::write(cg.join("memory.usage_in_bytes"), "3221225472\n")
                .await
                .unwrap();
            fs::write(cg.join("memory.limit_in_bytes"), "9223372036854771712\n")
                .await
                .unwrap();
            fs::write(cg.join("memory.stat"), "total_inactive_file 1073741824\n")
                .await
                .unwrap();
        }

        let mut memory_paths = MemoryPaths::new(
            dir,
            "system.slice/containerd.service",
            "system.slice/kubelet.service",
        );
        memory_paths.proc_meminfo = meminfo;

        ReconcilerConfig {
            memory_period: Duration::from_millis(10),
            reconciliation_period: Duration::from_millis(40),
            memory_paths,
            cpu_paths: CpuPaths::new(dir),
            disk_scanner: DiskScanner::new(
                dir.join("containerd"),
                dir.join("containerd-state"),
                dir.join("kubelet"),
            ),
            memory_safety_margin: Quantity::from_mib(100),
            minimum_reserved_memory: Quantity::ZERO,
            enforce_recommendation: true,
            num_cores: 4,
        }
    }

    #[tokio::test]
    async fn test_memory_loop_enforces_and_stops_on_shutdown() {
        let _guard = crate::observability::test_gauge_lock();
        let dir = TempDir::new().unwrap();
        let config = mock_node(dir.path()).await;
        let hierarchy_root = config.memory_paths.hierarchy_root.clone();

        let reconciler = Arc::new(Reconciler::new(
            config,
            NodeMetrics::new(),
            HealthRegistry::new(Duration::from_secs(5), Duration::from_secs(20)),
            None,
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(reconciler.run_memory_loop(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop on shutdown")
            .unwrap();

        // used = 6 Gi, pod working set = 2 Gi, margin = 100 Mi
        // limit = 10 Gi - (6 Gi - 2 Gi + 100 Mi)
        let limit = fs::read_to_string(
            hierarchy_root
                .join("memory")
                .join("kubepods")
                .join("memory.limit_in_bytes"),
        )
        .await
        .unwrap();
        let expected = Quantity::from_gib(10)
            - (Quantity::from_gib(4) + Quantity::from_mib(100));
        assert_eq!(limit.trim(), expected.value().to_string());
    }

    #[tokio::test]
    async fn test_slow_loop_survives_failures_and_stops_on_shutdown() {
        let _guard = crate::observability::test_gauge_lock();
        let dir = TempDir::new().unwrap();
        let config = mock_node(dir.path()).await;

        // No cpu hierarchy and no scannable disk directories: every
        // iteration fails, and the loop must keep running regardless. Long
        // registry cadences keep the failures inside the stall grace window.
        let health = HealthRegistry::new(Duration::from_secs(60), Duration::from_secs(60));
        let reconciler = Arc::new(Reconciler::new(
            config,
            NodeMetrics::new(),
            health.clone(),
            None,
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(reconciler.run_slow_loop(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop on shutdown")
            .unwrap();

        let report = health.health().await;
        assert_eq!(
            report.slow_loop.condition,
            crate::health::AgentCondition::Degraded
        );
        assert!(report.slow_loop.consecutive_failures > 0);
    }
}
