//! Core data models for the reserved-resources agent

use serde::{Deserialize, Serialize};

use crate::quantity::Quantity;

/// Default cgroup name holding all pod containers.
pub const POD_SLICE: &str = "kubepods";
/// Cgroup holding host system services (container runtime, kubelet, OS daemons).
pub const SYSTEM_SLICE: &str = "system.slice";

/// One point-in-time view of node and cgroup memory accounting.
///
/// Working sets are `memory.usage_in_bytes - memory.stat:total_inactive_file`,
/// the resident portion that cannot be reclaimed under pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// MemTotal from /proc/meminfo, in bytes.
    pub mem_total: Quantity,
    /// MemAvailable from /proc/meminfo, in bytes.
    pub mem_available: Quantity,
    /// Working set of the pod cgroup (kubepods).
    pub pod_working_set: Quantity,
    /// Working set of the system slice.
    pub system_working_set: Quantity,
    /// Working set of the container runtime slice.
    pub container_runtime_working_set: Quantity,
    /// Working set of the node agent (kubelet) slice.
    pub node_agent_working_set: Quantity,
    /// Current memory.limit_in_bytes on the pod cgroup.
    pub pod_limit: Quantity,
}

/// One reading of the CPU accounting counters.
///
/// All fields are cumulative; only deltas between two readings carry meaning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CpuReading {
    /// Monotonic timestamp of the reading, in nanoseconds.
    pub timestamp_ns: u64,
    /// cpuacct.usage of the pod cgroup, in nanoseconds.
    pub pod_usage_ns: u64,
    /// cpuacct.usage of the system slice, in nanoseconds.
    pub system_usage_ns: u64,
    /// Aggregate non-idle plus idle jiffies from /proc/stat.
    pub total_jiffies: u64,
    /// Aggregate idle (idle + iowait) jiffies from /proc/stat.
    pub idle_jiffies: u64,
}

/// Two CPU readings taken a sampling window apart, plus the share layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub num_cores: i64,
    /// cpu.shares of the pod cgroup.
    pub pod_shares: i64,
    /// cpu.shares of the system slice (pinned by the kubelet, typically 1024).
    pub system_shares: i64,
    pub t0: CpuReading,
    pub t1: CpuReading,
}

/// Root-disk usage broken down by non-pod consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSnapshot {
    /// The device backing `/` as seen by pid 1, e.g. `/dev/nvme0n1p3`.
    pub root_partition: String,
    pub capacity: Quantity,
    pub available: Quantity,
    pub used: Quantity,
    /// capacity - available - used; space the filesystem holds back.
    pub fs_reserved: Quantity,
    /// Container runtime content store (immutable image layers).
    pub content_store: Quantity,
    /// Container runtime snapshotter (unpacked layers + container scratch).
    pub snapshotter: Quantity,
    /// Container runtime state directory, without container rootfs subtrees.
    pub state: Quantity,
    /// Pod log directory.
    pub pod_logs: Quantity,
    /// Pod volumes on the root disk (CSI subtrees and non-root mounts excluded).
    pub pod_volumes: Quantity,
    /// Node agent plugin directory, without the CSI plugin subtree.
    pub plugins: Quantity,
}

/// A single per-resource recommendation, consumed by the metrics exporter
/// and optionally by the enforcer. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub target: Quantity,
    pub current: Quantity,
    pub rationale: String,
}
