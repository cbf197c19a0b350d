//! Prometheus gauges for the reserved-resources agent
//!
//! One gauge per computed quantity: byte values in bytes, percent values in
//! whole percent, shares raw, millicores plain. The gauge set is registered
//! once and process-global; each gauge is written by exactly one loop, so no
//! synchronization beyond the metrics library's own is needed.
//!
//! The memory target gauge carries a sentinel of -1 when cgroup accounting
//! contradicts /proc/meminfo. Operators must be able to tell "no reservation
//! needed" (0) apart from "accounting broken" (-1), so the sentinel is never
//! collapsed to zero.

use prometheus::{register_int_gauge, IntGauge};
use std::sync::OnceLock;

use crate::cpu::CpuRecommendation;
use crate::memory::MemoryRecommendation;
use crate::models::{DiskSnapshot, MemorySnapshot};
use crate::quantity::Quantity;

/// Sentinel for an underivable memory target.
pub const TARGET_MEMORY_SENTINEL: i64 = -1;

static GLOBAL_METRICS: OnceLock<NodeMetricsInner> = OnceLock::new();

struct NodeMetricsInner {
    // memory
    mem_total: IntGauge,
    mem_available: IntGauge,
    mem_available_percent: IntGauge,
    mem_used: IntGauge,
    mem_used_percent: IntGauge,
    kubepods_working_set: IntGauge,
    kubepods_working_set_percent: IntGauge,
    system_slice_working_set: IntGauge,
    system_slice_working_set_percent: IntGauge,
    containerd_working_set: IntGauge,
    containerd_working_set_percent: IntGauge,
    kubelet_working_set: IntGauge,
    kubelet_working_set_percent: IntGauge,
    reserved_memory: IntGauge,
    reserved_memory_percent: IntGauge,
    target_reserved_memory: IntGauge,
    target_reserved_memory_percent: IntGauge,
    target_reserved_memory_machine_type: IntGauge,
    // cpu
    num_cpu_cores: IntGauge,
    cpu_usage_percent: IntGauge,
    kubepods_cpu_percent: IntGauge,
    system_slice_cpu_percent: IntGauge,
    system_slice_min_guaranteed_cpu: IntGauge,
    kubepods_min_guaranteed_cpu: IntGauge,
    current_reserved_cpu: IntGauge,
    target_reserved_cpu: IntGauge,
    target_reserved_cpu_machine_type: IntGauge,
    // disk
    disk_available: IntGauge,
    disk_available_percent: IntGauge,
    disk_used: IntGauge,
    disk_used_percent: IntGauge,
    disk_reserved: IntGauge,
    disk_reserved_percent: IntGauge,
    snapshotter_size: IntGauge,
    snapshotter_size_percent: IntGauge,
    containerd_state_size: IntGauge,
    containerd_state_size_percent: IntGauge,
    content_store_size: IntGauge,
    content_store_size_percent: IntGauge,
    pod_logs_size: IntGauge,
    pod_logs_size_percent: IntGauge,
    pod_volumes_size: IntGauge,
    pod_volumes_size_percent: IntGauge,
    plugin_size: IntGauge,
    plugin_size_percent: IntGauge,
    target_reserved_disk: IntGauge,
    target_reserved_disk_percent: IntGauge,
}

impl NodeMetricsInner {
    fn new() -> Self {
        Self {
            mem_total: register_int_gauge!(
                "node_memory_MemTotal",
                "MemTotal from /proc/meminfo"
            )
            .expect("Failed to register node_memory_MemTotal"),
            mem_available: register_int_gauge!(
                "node_memory_MemAvailable",
                "MemAvailable from /proc/meminfo"
            )
            .expect("Failed to register node_memory_MemAvailable"),
            mem_available_percent: register_int_gauge!(
                "node_memory_MemAvailable_percent",
                "MemAvailable in percent of total memory"
            )
            .expect("Failed to register node_memory_MemAvailable_percent"),
            mem_used: register_int_gauge!(
                "node_memory_used",
                "Not-reclaimable memory calculated as MemTotal - MemAvailable"
            )
            .expect("Failed to register node_memory_used"),
            mem_used_percent: register_int_gauge!(
                "node_memory_used_percent",
                "Not-reclaimable memory in percent of total memory"
            )
            .expect("Failed to register node_memory_used_percent"),
            kubepods_working_set: register_int_gauge!(
                "node_cgroup_kubepods_memory_working_set_bytes",
                "Working set memory of the kubepods cgroup in bytes"
            )
            .expect("Failed to register kubepods working set gauge"),
            kubepods_working_set_percent: register_int_gauge!(
                "node_cgroup_kubepods_memory_working_set_percent",
                "Working set memory of the kubepods cgroup in percent of total memory"
            )
            .expect("Failed to register kubepods working set percent gauge"),
            system_slice_working_set: register_int_gauge!(
                "node_cgroup_system_slice_memory_working_set_bytes",
                "Working set memory of the system.slice cgroup in bytes"
            )
            .expect("Failed to register system.slice working set gauge"),
            system_slice_working_set_percent: register_int_gauge!(
                "node_cgroup_system_slice_memory_working_set_percent",
                "Working set memory of the system.slice cgroup in percent of total memory"
            )
            .expect("Failed to register system.slice working set percent gauge"),
            containerd_working_set: register_int_gauge!(
                "node_cgroup_containerd_service_memory_working_set_bytes",
                "Working set memory of the container runtime cgroup in bytes"
            )
            .expect("Failed to register containerd working set gauge"),
            containerd_working_set_percent: register_int_gauge!(
                "node_cgroup_containerd_service_memory_working_set_percent",
                "Working set memory of the container runtime cgroup in percent of total memory"
            )
            .expect("Failed to register containerd working set percent gauge"),
            kubelet_working_set: register_int_gauge!(
                "node_cgroup_kubelet_service_memory_working_set_bytes",
                "Working set memory of the kubelet cgroup in bytes"
            )
            .expect("Failed to register kubelet working set gauge"),
            kubelet_working_set_percent: register_int_gauge!(
                "node_cgroup_kubelet_service_memory_working_set_percent",
                "Working set memory of the kubelet cgroup in percent of total memory"
            )
            .expect("Failed to register kubelet working set percent gauge"),
            reserved_memory: register_int_gauge!(
                "kubelet_reserved_memory_bytes",
                "Currently reserved memory derived from the kubepods cgroup limit"
            )
            .expect("Failed to register kubelet_reserved_memory_bytes"),
            reserved_memory_percent: register_int_gauge!(
                "kubelet_reserved_memory_percent",
                "Currently reserved memory in percent of total memory"
            )
            .expect("Failed to register kubelet_reserved_memory_percent"),
            target_reserved_memory: register_int_gauge!(
                "kubelet_target_reserved_memory_bytes",
                "Target reserved memory: MemTotal - MemAvailable - kubepods working set + margin; -1 when accounting is off"
            )
            .expect("Failed to register kubelet_target_reserved_memory_bytes"),
            target_reserved_memory_percent: register_int_gauge!(
                "kubelet_target_reserved_memory_percent",
                "Target reserved memory in percent of total memory"
            )
            .expect("Failed to register kubelet_target_reserved_memory_percent"),
            target_reserved_memory_machine_type: register_int_gauge!(
                "kubelet_target_reserved_memory_bytes_machine_type",
                "Reference reserved memory from the capacity-tiered formula"
            )
            .expect("Failed to register machine-type memory gauge"),
            num_cpu_cores: register_int_gauge!(
                "node_num_cpu_cores",
                "Number of CPU cores of this node"
            )
            .expect("Failed to register node_num_cpu_cores"),
            cpu_usage_percent: register_int_gauge!(
                "node_cpu_usage_percent",
                "Overall CPU usage measured via /proc/stat"
            )
            .expect("Failed to register node_cpu_usage_percent"),
            kubepods_cpu_percent: register_int_gauge!(
                "node_cgroup_kubepods_cpu_percent",
                "CPU consumption of the kubepods cgroup in percent"
            )
            .expect("Failed to register node_cgroup_kubepods_cpu_percent"),
            system_slice_cpu_percent: register_int_gauge!(
                "node_cgroup_system_slice_cpu_percent",
                "CPU consumption of the system.slice cgroup in percent"
            )
            .expect("Failed to register node_cgroup_system_slice_cpu_percent"),
            system_slice_min_guaranteed_cpu: register_int_gauge!(
                "node_cgroup_system_slice_min_guaranteed_cpu",
                "Minimum guaranteed CPU time of system.slice from its cpu.shares"
            )
            .expect("Failed to register system.slice guaranteed CPU gauge"),
            kubepods_min_guaranteed_cpu: register_int_gauge!(
                "node_cgroup_kubepods_min_guaranteed_cpu",
                "Minimum guaranteed CPU time of kubepods from its cpu.shares"
            )
            .expect("Failed to register kubepods guaranteed CPU gauge"),
            current_reserved_cpu: register_int_gauge!(
                "kubelet_current_reserved_cpu",
                "Currently reserved CPU in millicores, derived from kubepods cpu.shares"
            )
            .expect("Failed to register kubelet_current_reserved_cpu"),
            target_reserved_cpu: register_int_gauge!(
                "kubelet_target_reserved_cpu",
                "Target reserved CPU in millicores"
            )
            .expect("Failed to register kubelet_target_reserved_cpu"),
            target_reserved_cpu_machine_type: register_int_gauge!(
                "kubelet_target_reserved_cpu_machine_type",
                "Reference reserved CPU from the capacity-tiered formula, in millicores"
            )
            .expect("Failed to register machine-type CPU gauge"),
            disk_available: register_int_gauge!(
                "node_disk_available_bytes",
                "Available bytes in the filesystem mounted on the root disk"
            )
            .expect("Failed to register node_disk_available_bytes"),
            disk_available_percent: register_int_gauge!(
                "node_disk_available_percent",
                "Available bytes in percent of root disk capacity"
            )
            .expect("Failed to register node_disk_available_percent"),
            disk_used: register_int_gauge!(
                "node_disk_used_bytes",
                "Used bytes in the filesystem mounted on the root disk"
            )
            .expect("Failed to register node_disk_used_bytes"),
            disk_used_percent: register_int_gauge!(
                "node_disk_used_percent",
                "Used bytes in percent of root disk capacity"
            )
            .expect("Failed to register node_disk_used_percent"),
            disk_reserved: register_int_gauge!(
                "node_disk_reserved_bytes",
                "Bytes held back by the filesystem on the root disk"
            )
            .expect("Failed to register node_disk_reserved_bytes"),
            disk_reserved_percent: register_int_gauge!(
                "node_disk_reserved_percent",
                "Filesystem-reserved bytes in percent of root disk capacity"
            )
            .expect("Failed to register node_disk_reserved_percent"),
            snapshotter_size: register_int_gauge!(
                "node_containerd_overlayfs_snapshotter_size_bytes",
                "Size of the overlayfs snapshotter"
            )
            .expect("Failed to register snapshotter size gauge"),
            snapshotter_size_percent: register_int_gauge!(
                "node_containerd_overlayfs_snapshotter_size_percent",
                "Size of the overlayfs snapshotter in percent of root disk capacity"
            )
            .expect("Failed to register snapshotter size percent gauge"),
            containerd_state_size: register_int_gauge!(
                "node_containerd_state_size_bytes",
                "Size of the container runtime state directory"
            )
            .expect("Failed to register containerd state size gauge"),
            containerd_state_size_percent: register_int_gauge!(
                "node_containerd_state_size_percent",
                "Size of the container runtime state directory in percent of root disk capacity"
            )
            .expect("Failed to register containerd state size percent gauge"),
            content_store_size: register_int_gauge!(
                "node_containerd_content_store_size_bytes",
                "Size of the container runtime content store"
            )
            .expect("Failed to register content store size gauge"),
            content_store_size_percent: register_int_gauge!(
                "node_containerd_content_store_size_percent",
                "Size of the container runtime content store in percent of root disk capacity"
            )
            .expect("Failed to register content store size percent gauge"),
            pod_logs_size: register_int_gauge!(
                "node_pod_logs_size",
                "Size of the pod logs"
            )
            .expect("Failed to register node_pod_logs_size"),
            pod_logs_size_percent: register_int_gauge!(
                "node_pod_logs_size_percent",
                "Size of the pod logs in percent of root disk capacity"
            )
            .expect("Failed to register node_pod_logs_size_percent"),
            pod_volumes_size: register_int_gauge!(
                "node_pod_volumes_size_bytes",
                "Size of pod volumes on the root disk, excluding CSI volumes and non-root mounts"
            )
            .expect("Failed to register node_pod_volumes_size_bytes"),
            pod_volumes_size_percent: register_int_gauge!(
                "node_pod_volumes_size_percent",
                "Size of pod volumes in percent of root disk capacity"
            )
            .expect("Failed to register node_pod_volumes_size_percent"),
            plugin_size: register_int_gauge!(
                "kubelet_plugin_size_bytes",
                "Size of kubelet plugins"
            )
            .expect("Failed to register kubelet_plugin_size_bytes"),
            plugin_size_percent: register_int_gauge!(
                "kubelet_plugin_size_percent",
                "Size of kubelet plugins in percent of root disk capacity"
            )
            .expect("Failed to register kubelet_plugin_size_percent"),
            target_reserved_disk: register_int_gauge!(
                "kubelet_target_reserved_disk_bytes",
                "Recommended reserved bytes for the kubelet disk reservation"
            )
            .expect("Failed to register kubelet_target_reserved_disk_bytes"),
            target_reserved_disk_percent: register_int_gauge!(
                "kubelet_target_reserved_disk_percent",
                "Recommended disk reservation in percent of root disk capacity"
            )
            .expect("Failed to register kubelet_target_reserved_disk_percent"),
        }
    }
}

/// Lightweight handle to the process-global gauge set. Clones share the
/// underlying gauges.
#[derive(Clone)]
pub struct NodeMetrics {
    _private: (),
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(NodeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &NodeMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Records one memory reconciliation. The observed values are always
    /// written; the target gauges get the sentinel when the recommendation
    /// is anomalous.
    pub fn record_memory(
        &self,
        snapshot: &MemorySnapshot,
        recommendation: &MemoryRecommendation,
        machine_type_reference: Quantity,
    ) {
        let inner = self.inner();
        let total = snapshot.mem_total;

        inner.mem_total.set(total.value());
        inner.mem_available.set(snapshot.mem_available.value());
        inner
            .mem_available_percent
            .set(snapshot.mem_available.percent_of(total));
        inner.mem_used.set(recommendation.used.value());
        inner
            .mem_used_percent
            .set(recommendation.used.percent_of(total));
        inner
            .kubepods_working_set
            .set(snapshot.pod_working_set.value());
        inner
            .kubepods_working_set_percent
            .set(snapshot.pod_working_set.percent_of(total));
        inner
            .system_slice_working_set
            .set(snapshot.system_working_set.value());
        inner
            .system_slice_working_set_percent
            .set(snapshot.system_working_set.percent_of(total));
        inner
            .containerd_working_set
            .set(snapshot.container_runtime_working_set.value());
        inner
            .containerd_working_set_percent
            .set(snapshot.container_runtime_working_set.percent_of(total));
        inner
            .kubelet_working_set
            .set(snapshot.node_agent_working_set.value());
        inner
            .kubelet_working_set_percent
            .set(snapshot.node_agent_working_set.percent_of(total));
        inner
            .reserved_memory
            .set(recommendation.current_reservation.value());
        inner
            .reserved_memory_percent
            .set(recommendation.current_reservation.percent_of(total));
        inner
            .target_reserved_memory_machine_type
            .set(machine_type_reference.value());

        if recommendation.is_anomalous() {
            inner.target_reserved_memory.set(TARGET_MEMORY_SENTINEL);
            inner.target_reserved_memory_percent.set(0);
        } else {
            inner
                .target_reserved_memory
                .set(recommendation.reservation_target.value());
            inner
                .target_reserved_memory_percent
                .set(recommendation.reservation_target.percent_of(total));
        }
    }

    /// Records one CPU reconciliation.
    pub fn record_cpu(&self, num_cores: i64, recommendation: &CpuRecommendation) {
        let inner = self.inner();

        inner.num_cpu_cores.set(num_cores);
        inner
            .cpu_usage_percent
            .set((recommendation.total_fraction * 100.0).round() as i64);
        inner
            .kubepods_cpu_percent
            .set((recommendation.pod_fraction * 100.0).round() as i64);
        inner
            .system_slice_cpu_percent
            .set((recommendation.system_fraction * 100.0).round() as i64);
        inner
            .system_slice_min_guaranteed_cpu
            .set(recommendation.system_guaranteed_percent.round() as i64);
        inner
            .kubepods_min_guaranteed_cpu
            .set(recommendation.pod_guaranteed_percent.round() as i64);
        inner
            .current_reserved_cpu
            .set(recommendation.current_reserved_millicores);
        inner
            .target_reserved_cpu
            .set(recommendation.reserved_millicores);
        inner
            .target_reserved_cpu_machine_type
            .set(recommendation.reference_millicores);
    }

    /// Records one disk reconciliation.
    pub fn record_disk(&self, snapshot: &DiskSnapshot, reservation: Quantity) {
        let inner = self.inner();
        let capacity = snapshot.capacity;

        inner.disk_available.set(snapshot.available.value());
        inner
            .disk_available_percent
            .set(snapshot.available.percent_of(capacity));
        inner.disk_used.set(snapshot.used.value());
        inner
            .disk_used_percent
            .set(snapshot.used.percent_of(capacity));
        inner.disk_reserved.set(snapshot.fs_reserved.value());
        inner
            .disk_reserved_percent
            .set(snapshot.fs_reserved.percent_of(capacity));
        inner.snapshotter_size.set(snapshot.snapshotter.value());
        inner
            .snapshotter_size_percent
            .set(snapshot.snapshotter.percent_of(capacity));
        inner.containerd_state_size.set(snapshot.state.value());
        inner
            .containerd_state_size_percent
            .set(snapshot.state.percent_of(capacity));
        inner.content_store_size.set(snapshot.content_store.value());
        inner
            .content_store_size_percent
            .set(snapshot.content_store.percent_of(capacity));
        inner.pod_logs_size.set(snapshot.pod_logs.value());
        inner
            .pod_logs_size_percent
            .set(snapshot.pod_logs.percent_of(capacity));
        inner.pod_volumes_size.set(snapshot.pod_volumes.value());
        inner
            .pod_volumes_size_percent
            .set(snapshot.pod_volumes.percent_of(capacity));
        inner.plugin_size.set(snapshot.plugins.value());
        inner
            .plugin_size_percent
            .set(snapshot.plugins.percent_of(capacity));
        inner.target_reserved_disk.set(reservation.value());
        inner
            .target_reserved_disk_percent
            .set(reservation.percent_of(capacity));
    }
}

/// Serializes tests that read or write the process-global gauge set.
#[cfg(test)]
pub(crate) fn test_gauge_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
