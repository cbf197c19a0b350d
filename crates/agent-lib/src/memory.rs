//! Memory recommender
//!
//! Produces a byte target for the pod cgroup's memory limit. The quantity
//! `MemTotal - MemAvailable` is the memory the kernel considers genuinely in
//! use, including kernel slab and processes outside any named cgroup;
//! subtracting the pod working set isolates the non-pod footprint. The safety
//! margin makes the cgroup-level OOM fire before the global OOM killer, which
//! ranks victims by oom_score and may pick the container runtime or the
//! kubelet itself.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::warn;

use crate::cgroup;
use crate::models::{MemorySnapshot, Recommendation, POD_SLICE, SYSTEM_SLICE};
use crate::proc;
use crate::quantity::Quantity;

/// Cgroup and procfs locations the memory snapshot is assembled from.
#[derive(Debug, Clone)]
pub struct MemoryPaths {
    pub hierarchy_root: PathBuf,
    pub pod_slice: String,
    pub system_slice: String,
    /// Container runtime slice, e.g. `system.slice/containerd.service`.
    pub container_runtime_slice: String,
    /// Node agent slice, e.g. `system.slice/kubelet.service`.
    pub node_agent_slice: String,
    pub proc_meminfo: PathBuf,
}

impl MemoryPaths {
    pub fn new(
        hierarchy_root: impl Into<PathBuf>,
        container_runtime_slice: impl Into<String>,
        node_agent_slice: impl Into<String>,
    ) -> Self {
        Self {
            hierarchy_root: hierarchy_root.into(),
            pod_slice: POD_SLICE.to_string(),
            system_slice: SYSTEM_SLICE.to_string(),
            container_runtime_slice: container_runtime_slice.into(),
            node_agent_slice: node_agent_slice.into(),
            proc_meminfo: proc::PROC_MEMINFO.into(),
        }
    }
}

/// Assembles a fresh memory snapshot from /proc/meminfo and the cgroup
/// hierarchy. The container runtime and node agent working sets are reported
/// for observability only; a node without those slices still reconciles, so
/// a failed read degrades to zero with a warning.
pub async fn collect(paths: &MemoryPaths) -> Result<MemorySnapshot> {
    let (mem_total, mem_available) = proc::read_meminfo(&paths.proc_meminfo).await?;

    let pod_working_set =
        cgroup::memory_working_set(&paths.hierarchy_root, &paths.pod_slice).await?;
    let system_working_set =
        cgroup::memory_working_set(&paths.hierarchy_root, &paths.system_slice).await?;

    let container_runtime_working_set =
        cgroup::memory_working_set(&paths.hierarchy_root, &paths.container_runtime_slice)
            .await
            .unwrap_or_else(|e| {
                warn!(slice = %paths.container_runtime_slice, error = %e,
                    "failed to read container runtime working set");
                Quantity::ZERO
            });
    let node_agent_working_set =
        cgroup::memory_working_set(&paths.hierarchy_root, &paths.node_agent_slice)
            .await
            .unwrap_or_else(|e| {
                warn!(slice = %paths.node_agent_slice, error = %e,
                    "failed to read node agent working set");
                Quantity::ZERO
            });

    let pod_limit = cgroup::memory_limit(&paths.hierarchy_root, &paths.pod_slice).await?;

    Ok(MemorySnapshot {
        mem_total,
        mem_available,
        pod_working_set,
        system_working_set,
        container_runtime_working_set,
        node_agent_working_set,
        pod_limit,
    })
}

/// Outcome of one memory reconciliation.
#[derive(Debug, Clone)]
pub struct MemoryRecommendation {
    /// MemTotal - MemAvailable: memory in genuine use.
    pub used: Quantity,
    /// T - A - W + M before the floor clamp. Negative means the pod working
    /// set exceeded OS-reported usage: cgroup v1 accounting drift.
    pub reservation_computed: Quantity,
    /// The reservation after the floor clamp, meaningless when anomalous.
    pub reservation_target: Quantity,
    /// MemTotal - current pod cgroup limit.
    pub current_reservation: Quantity,
    pub reservation: Recommendation,
}

impl MemoryRecommendation {
    /// True when cgroup accounting contradicts /proc/meminfo. The sentinel
    /// metric value -1 is emitted, enforcement is suppressed, and no target
    /// limit exists for this tick.
    pub fn is_anomalous(&self) -> bool {
        self.reservation_computed.is_negative()
    }

    /// The byte limit to place on the pod cgroup, if this tick produced one.
    pub fn pod_limit_target(&self, snapshot: &MemorySnapshot) -> Option<Quantity> {
        if self.is_anomalous() {
            return None;
        }
        Some(snapshot.mem_total - self.reservation_target)
    }
}

/// Computes the reservation target from a snapshot. Pure and idempotent; the
/// target is fresh every tick, the loop cadence itself is the noise filter.
pub fn recommend(
    snapshot: &MemorySnapshot,
    safety_margin: Quantity,
    minimum_reserved: Quantity,
) -> MemoryRecommendation {
    let used = snapshot.mem_total - snapshot.mem_available;
    let reservation_computed = used - snapshot.pod_working_set + safety_margin;
    let current_reservation = snapshot.mem_total - snapshot.pod_limit;

    let reservation_target = if reservation_computed < minimum_reserved {
        minimum_reserved
    } else {
        reservation_computed
    };

    let rationale = if reservation_computed.is_negative() {
        format!(
            "no recommendation: pod working set {} exceeds OS-reported used memory {}, cgroup accounting is off",
            snapshot.pod_working_set.humanize(),
            used.humanize(),
        )
    } else {
        format!(
            "used {} minus pod working set {} plus safety margin {}",
            used.humanize(),
            snapshot.pod_working_set.humanize(),
            safety_margin.humanize(),
        )
    };

    MemoryRecommendation {
        used,
        reservation_computed,
        reservation_target,
        current_reservation,
        reservation: Recommendation {
            target: reservation_target,
            current: current_reservation,
            rationale,
        },
    }
}

/// Applies the computed limit to the pod cgroup.
pub async fn enforce(
    hierarchy_root: &Path,
    pod_slice: &str,
    pod_limit_target: Quantity,
) -> Result<()> {
    cgroup::write_memory_limit(hierarchy_root, pod_slice, pod_limit_target).await
}
