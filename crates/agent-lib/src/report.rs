//! Console tables summarizing each reconciliation
//!
//! One table per resource per loop iteration, mirroring the metrics but
//! readable straight from the pod logs.

use tabled::{settings::Style, Table, Tabled};

use crate::cpu::CpuRecommendation;
use crate::memory::MemoryRecommendation;
use crate::models::{DiskSnapshot, MemorySnapshot};
use crate::quantity::Quantity;

#[derive(Tabled)]
struct MemoryRow {
    #[tabled(rename = "Memory Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct CpuRow {
    #[tabled(rename = "CPU Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct DiskRow {
    #[tabled(rename = "Disk Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

fn with_percent(value: Quantity, total: Quantity) -> String {
    format!("{} ({}%)", value.humanize(), value.percent_of(total))
}

pub fn render_memory(snapshot: &MemorySnapshot, recommendation: &MemoryRecommendation) -> String {
    let total = snapshot.mem_total;
    let target = if recommendation.is_anomalous() {
        "n/a (cgroup accounting is off)".to_string()
    } else {
        format!(
            "{} ({}, {}%)",
            recommendation.reservation_target.humanize(),
            recommendation.reservation_target,
            recommendation.reservation_target.percent_of(total)
        )
    };

    let rows = vec![
        MemoryRow {
            metric: "Available (/proc/meminfo)".to_string(),
            value: with_percent(snapshot.mem_available, total),
        },
        MemoryRow {
            metric: "Used (Capacity - Available)".to_string(),
            value: with_percent(recommendation.used, total),
        },
        MemoryRow {
            metric: "Kubepods working set".to_string(),
            value: with_percent(snapshot.pod_working_set, total),
        },
        MemoryRow {
            metric: "System.slice working set".to_string(),
            value: with_percent(snapshot.system_working_set, total),
        },
        MemoryRow {
            metric: " - Containerd.service working set".to_string(),
            value: with_percent(snapshot.container_runtime_working_set, total),
        },
        MemoryRow {
            metric: " - Kubelet.service working set".to_string(),
            value: with_percent(snapshot.node_agent_working_set, total),
        },
        MemoryRow {
            metric: "Current reservation (kube+system reserved)".to_string(),
            value: with_percent(recommendation.current_reservation, total),
        },
        MemoryRow {
            metric: "RECOMMENDATION".to_string(),
            value: target,
        },
    ];

    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn render_cpu(recommendation: &CpuRecommendation, system_shares: i64, pod_shares: i64) -> String {
    let rows = vec![
        CpuRow {
            metric: "Total CPU usage via /proc/stat".to_string(),
            value: format!("{:.2}%", recommendation.total_fraction * 100.0),
        },
        CpuRow {
            metric: "Current guaranteed CPU time".to_string(),
            value: format!(
                "system.slice: {:.2}% | kubepods: {:.2}%",
                recommendation.system_guaranteed_percent, recommendation.pod_guaranteed_percent
            ),
        },
        CpuRow {
            metric: "Current CPU shares".to_string(),
            value: format!("system.slice: {} | kubepods: {}", system_shares, pod_shares),
        },
        CpuRow {
            metric: "CPU usage non-pod processes".to_string(),
            value: format!("{:.2}%", recommendation.non_pod_fraction * 100.0),
        },
        CpuRow {
            metric: "CPU usage system.slice (cgroupfs)".to_string(),
            value: format!("{:.2}%", recommendation.system_fraction * 100.0),
        },
        CpuRow {
            metric: "CPU usage kubepods (cgroupfs)".to_string(),
            value: format!("{:.2}%", recommendation.pod_fraction * 100.0),
        },
        CpuRow {
            metric: "Current reservation".to_string(),
            value: format!("{}m", recommendation.current_reserved_millicores),
        },
        CpuRow {
            metric: "RECOMMENDATION".to_string(),
            value: format!(
                "{}m (kubepods CPU shares: {})",
                recommendation.reserved_millicores, recommendation.pod_shares_target
            ),
        },
    ];

    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn render_disk(snapshot: &DiskSnapshot, reservation: Quantity) -> String {
    let capacity = snapshot.capacity;
    let rows = vec![
        DiskRow {
            metric: "Root disk".to_string(),
            value: snapshot.root_partition.clone(),
        },
        DiskRow {
            metric: "Capacity".to_string(),
            value: capacity.humanize(),
        },
        DiskRow {
            metric: "Available".to_string(),
            value: with_percent(snapshot.available, capacity),
        },
        DiskRow {
            metric: "Used".to_string(),
            value: with_percent(snapshot.used, capacity),
        },
        DiskRow {
            metric: "Filesystem reserved".to_string(),
            value: with_percent(snapshot.fs_reserved, capacity),
        },
        DiskRow {
            metric: "Containerd snapshotter".to_string(),
            value: with_percent(snapshot.snapshotter, capacity),
        },
        DiskRow {
            metric: "Containerd state (without rootfs)".to_string(),
            value: with_percent(snapshot.state, capacity),
        },
        DiskRow {
            metric: "Containerd content store".to_string(),
            value: with_percent(snapshot.content_store, capacity),
        },
        DiskRow {
            metric: "Pod logs".to_string(),
            value: with_percent(snapshot.pod_logs, capacity),
        },
        DiskRow {
            metric: "Pod volumes (root disk only)".to_string(),
            value: with_percent(snapshot.pod_volumes, capacity),
        },
        DiskRow {
            metric: "Kubelet plugins".to_string(),
            value: with_percent(snapshot.plugins, capacity),
        },
        DiskRow {
            metric: "RECOMMENDATION".to_string(),
            value: format!(
                "{} ({} bytes, {}%)",
                reservation.humanize(),
                reservation.value(),
                reservation.percent_of(capacity)
            ),
        },
    ];

    Table::new(rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;

    #[test]
    fn test_render_memory_contains_recommendation() {
        let snapshot = MemorySnapshot {
            mem_total: Quantity::from_gib(10),
            mem_available: Quantity::from_gib(1),
            pod_working_set: Quantity::from_gib(7),
            system_working_set: Quantity::from_mib(600),
            container_runtime_working_set: Quantity::from_mib(200),
            node_agent_working_set: Quantity::from_mib(100),
            pod_limit: Quantity::from_gib(8),
        };
        let recommendation =
            memory::recommend(&snapshot, Quantity::from_mib(100), Quantity::ZERO);

        let table = render_memory(&snapshot, &recommendation);
        assert!(table.contains("RECOMMENDATION"));
        assert!(table.contains("Kubepods working set"));
        assert!(table.contains("7.00Gi"));
    }

    #[test]
    fn test_render_disk_contains_identity_terms() {
        let snapshot = DiskSnapshot {
            root_partition: "/dev/sda1".to_string(),
            capacity: Quantity::from_gib(100),
            available: Quantity::from_gib(40),
            used: Quantity::from_gib(58),
            fs_reserved: Quantity::from_gib(2),
            content_store: Quantity::from_gib(3),
            snapshotter: Quantity::from_gib(5),
            state: Quantity::from_gib(1),
            pod_logs: Quantity::from_mib(512),
            pod_volumes: Quantity::from_gib(40),
            plugins: Quantity::from_mib(512),
        };

        let table = render_disk(&snapshot, Quantity::from_gib(11));
        assert!(table.contains("/dev/sda1"));
        assert!(table.contains("11.00Gi"));
        assert!(table.contains("Pod volumes"));
    }
}
