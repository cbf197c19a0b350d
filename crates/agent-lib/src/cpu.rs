//! CPU recommender
//!
//! Produces a target cpu.shares count for the pod cgroup such that the
//! non-pod side of the machine is granted a CPU time fraction matching its
//! measured consumption.
//!
//! The measurement is deliberately dual. Per-cgroup `cpuacct.usage` tells us
//! what the pod cgroup consumed, but cgroup v1 accounting for a single slice
//! misses processes outside that slice (a shell under user.slice, for
//! instance) and its precision is documented as approximate. The machine-wide
//! number therefore comes from /proc/stat jiffy counters, and the non-pod
//! share is whatever the pod cgroup did not use.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::Instant;

use crate::cgroup;
use crate::heuristics;
use crate::models::{CpuReading, CpuSnapshot};
use crate::proc;

/// The kubelet grants the pod cgroup at most 1024 shares per core.
pub const SHARES_PER_CORE: i64 = 1024;

/// Cgroup and procfs locations the sampler reads.
#[derive(Debug, Clone)]
pub struct CpuPaths {
    pub hierarchy_root: std::path::PathBuf,
    pub pod_slice: String,
    pub system_slice: String,
    pub proc_stat: std::path::PathBuf,
}

impl CpuPaths {
    pub fn new(hierarchy_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            hierarchy_root: hierarchy_root.into(),
            pod_slice: crate::models::POD_SLICE.to_string(),
            system_slice: crate::models::SYSTEM_SLICE.to_string(),
            proc_stat: proc::PROC_STAT.into(),
        }
    }
}

/// Outcome of one CPU reconciliation.
#[derive(Debug, Clone)]
pub struct CpuRecommendation {
    /// Pod cgroup usage in core-equivalents over the window.
    pub pod_fraction: f64,
    /// System slice usage in core-equivalents over the window.
    pub system_fraction: f64,
    /// Machine-wide usage in core-equivalents, from /proc/stat.
    pub total_fraction: f64,
    /// Non-pod usage: max(total - pod, system slice measurement).
    pub non_pod_fraction: f64,
    /// Guaranteed CPU time split implied by the current shares, in percent.
    pub system_guaranteed_percent: f64,
    pub pod_guaranteed_percent: f64,
    /// Unclamped share target from the measurement.
    pub pod_shares_target_raw: i64,
    /// Share target after clamping into [0, 1024 * num_cores].
    pub pod_shares_target: i64,
    /// Reservation the clamped target corresponds to, in millicores.
    pub reserved_millicores: i64,
    /// Reservation implied by the current pod shares, in millicores.
    pub current_reserved_millicores: i64,
    /// Capacity-tiered reference reservation, in millicores.
    pub reference_millicores: i64,
    pub rationale: String,
}

async fn read_once(paths: &CpuPaths, started: Instant) -> Result<CpuReading> {
    let pod_usage_ns = cgroup::cpuacct_usage(&paths.hierarchy_root, &paths.pod_slice).await?;
    let system_usage_ns =
        cgroup::cpuacct_usage(&paths.hierarchy_root, &paths.system_slice).await?;
    let times = proc::read_stat(&paths.proc_stat).await?;

    Ok(CpuReading {
        timestamp_ns: started.elapsed().as_nanos() as u64,
        pod_usage_ns,
        system_usage_ns,
        total_jiffies: times.total_jiffies,
        idle_jiffies: times.idle_jiffies,
    })
}

/// Samples CPU usage over `window`. Blocks (asynchronously) for the whole
/// window; the monotonic clock anchors both readings so wall-clock jumps
/// cannot distort the rates.
pub async fn sample(paths: &CpuPaths, window: Duration, num_cores: i64) -> Result<CpuSnapshot> {
    let pod_shares = cgroup::cpu_shares(&paths.hierarchy_root, &paths.pod_slice).await?;
    let system_shares = cgroup::cpu_shares(&paths.hierarchy_root, &paths.system_slice).await?;

    let started = Instant::now();
    let t0 = read_once(paths, started).await?;
    tokio::time::sleep(window).await;
    let t1 = read_once(paths, started).await?;

    Ok(CpuSnapshot {
        num_cores,
        pod_shares,
        system_shares,
        t0,
        t1,
    })
}

/// Computes the share target from a snapshot. Pure; the same snapshot always
/// yields the same recommendation.
pub fn recommend(snapshot: &CpuSnapshot) -> Result<CpuRecommendation> {
    if snapshot.t1.timestamp_ns <= snapshot.t0.timestamp_ns
        || snapshot.t1.total_jiffies <= snapshot.t0.total_jiffies
    {
        bail!("CPU snapshot readings are not ordered; refusing to derive rates");
    }

    let elapsed_ns = (snapshot.t1.timestamp_ns - snapshot.t0.timestamp_ns) as f64;
    let num_cores = snapshot.num_cores as f64;

    let pod_fraction =
        snapshot.t1.pod_usage_ns.saturating_sub(snapshot.t0.pod_usage_ns) as f64 / elapsed_ns;
    let system_fraction = snapshot
        .t1
        .system_usage_ns
        .saturating_sub(snapshot.t0.system_usage_ns) as f64
        / elapsed_ns;

    let diff_total = (snapshot.t1.total_jiffies - snapshot.t0.total_jiffies) as f64;
    let diff_idle = snapshot
        .t1
        .idle_jiffies
        .saturating_sub(snapshot.t0.idle_jiffies) as f64;
    let total_fraction = (1.0 - diff_idle / diff_total) * num_cores;

    // The jiffy-based total is authoritative for everything outside the pod
    // cgroup; where the system slice's own accounting reports more, take the
    // larger value. Mild over-reservation is acceptable, starving system
    // daemons is not.
    let non_pod_fraction = (total_fraction - pod_fraction).max(system_fraction);

    let sibling_shares = snapshot.system_shares + snapshot.pod_shares;
    let system_guaranteed_percent =
        snapshot.system_shares as f64 / sibling_shares as f64 * num_cores * 100.0;
    let pod_guaranteed_percent =
        snapshot.pod_shares as f64 / sibling_shares as f64 * num_cores * 100.0;

    let max_pod_shares = SHARES_PER_CORE * snapshot.num_cores;
    let pod_shares_target_raw = target_pod_shares(
        snapshot.system_shares,
        snapshot.num_cores,
        non_pod_fraction,
    );

    // The kubelet caps pod shares at 1024 per core; pushing past the cap
    // only shrinks schedulable capacity without changing the CPU time the
    // kernel actually dispenses.
    let pod_shares_target = pod_shares_target_raw.min(max_pod_shares);
    let reserved_millicores = if pod_shares_target_raw < max_pod_shares {
        heuristics::decimal_milli_of_binary_shares(max_pod_shares - pod_shares_target_raw)
    } else {
        0
    };

    let current_reserved_millicores =
        heuristics::decimal_milli_of_binary_shares(max_pod_shares - snapshot.pod_shares);
    let reference_millicores = heuristics::reserved_cpu_for_capacity(snapshot.num_cores);

    let rationale = format!(
        "reserving {:.2} percent CPU for non-pod processes requires {} shares for {} with {} holding {} shares",
        non_pod_fraction * 100.0,
        pod_shares_target,
        crate::models::POD_SLICE,
        crate::models::SYSTEM_SLICE,
        snapshot.system_shares,
    );

    Ok(CpuRecommendation {
        pod_fraction,
        system_fraction,
        total_fraction,
        non_pod_fraction,
        system_guaranteed_percent,
        pod_guaranteed_percent,
        pod_shares_target_raw,
        pod_shares_target,
        reserved_millicores,
        current_reserved_millicores,
        reference_millicores,
        rationale,
    })
}

/// Solves the sibling-ratio equation for the pod share count that grants the
/// system side a fraction equal to `non_pod_fraction` core-equivalents:
/// `S_pod = (S_sys * cores) / fraction - S_sys`.
fn target_pod_shares(system_shares: i64, num_cores: i64, non_pod_fraction: f64) -> i64 {
    if non_pod_fraction <= 0.0 {
        // Nothing measured outside the pod cgroup; the pod side can have
        // everything the kubelet will grant it.
        return i64::MAX;
    }
    let target =
        (system_shares * num_cores) as f64 / non_pod_fraction - system_shares as f64;
    (target as i64).max(0)
}

/// Checks whether `path` looks like a usable cgroup v1 CPU hierarchy.
pub async fn hierarchy_available(hierarchy_root: &Path) -> bool {
    let cpu = hierarchy_root.join("cpu");
    let memory = hierarchy_root.join("memory");
    tokio::fs::metadata(&cpu).await.is_ok() && tokio::fs::metadata(&memory).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        num_cores: i64,
        pod_shares: i64,
        pod_usage_delta_ns: u64,
        system_usage_delta_ns: u64,
        total_jiffies_delta: u64,
        idle_jiffies_delta: u64,
    ) -> CpuSnapshot {
        let window_ns = 1_000_000_000;
        CpuSnapshot {
            num_cores,
            pod_shares,
            system_shares: 1024,
            t0: CpuReading {
                timestamp_ns: 0,
                pod_usage_ns: 7_000_000_000,
                system_usage_ns: 3_000_000_000,
                total_jiffies: 100_000,
                idle_jiffies: 60_000,
            },
            t1: CpuReading {
                timestamp_ns: window_ns,
                pod_usage_ns: 7_000_000_000 + pod_usage_delta_ns,
                system_usage_ns: 3_000_000_000 + system_usage_delta_ns,
                total_jiffies: 100_000 + total_jiffies_delta,
                idle_jiffies: 60_000 + idle_jiffies_delta,
            },
        }
    }

    #[test]
    fn test_target_pod_shares_formula() {
        // 16 cores, system.slice pinned at 1024, non-pod usage 0.3769 cores:
        // (1024 * 16) / 0.3769 - 1024
        assert_eq!(target_pod_shares(1024, 16, 0.3769), 42_446);
        // 4 cores, non-pod usage 0.04 cores
        assert_eq!(target_pod_shares(1024, 4, 0.04), 101_376);
        assert_eq!(target_pod_shares(1024, 4, 0.0), i64::MAX);
    }

    #[test]
    fn test_recommend_clamps_to_kubelet_cap() {
        // Balanced 16-core machine: pod uses 2.07 cores, machine-wide usage
        // leaves ~0.3769 cores to non-pod processes.
        // total fraction = (1 - idle/total) * 16 = 0.1529375 * 16 = 2.447
        let snap = snapshot(16, 16_384, 2_070_100_000, 200_000_000, 160_000, 135_530);
        let rec = recommend(&snap).unwrap();

        assert!((rec.non_pod_fraction - 0.3769).abs() < 0.0001);
        assert_eq!(rec.pod_shares_target_raw, 42_446);
        assert_eq!(rec.pod_shares_target, 16_384);
        assert_eq!(rec.reserved_millicores, 0);
    }

    #[test]
    fn test_recommend_underloaded_machine() {
        // 4 cores, nearly idle: total = (1 - 63/64) * 4 = 0.0625 cores, all
        // of it outside the pod cgroup. Target far exceeds the cap.
        let snap = snapshot(4, 4_096, 0, 10_000_000, 64_000, 63_000);
        let rec = recommend(&snap).unwrap();

        assert!((rec.non_pod_fraction - 0.0625).abs() < 1e-12);
        // (1024 * 4) / 0.0625 - 1024
        assert_eq!(rec.pod_shares_target_raw, 64_512);
        assert_eq!(rec.pod_shares_target, 4_096);
        assert_eq!(rec.reserved_millicores, 0);
    }

    #[test]
    fn test_recommend_below_cap_reports_millicores() {
        // 4 cores with heavy non-pod load: total 1.2 cores, pod 0.3 cores,
        // non-pod 0.9 cores. Target (4096 / 0.9) - 1024 = 3527 shares.
        let snap = snapshot(4, 4_096, 300_000_000, 200_000_000, 100_000, 70_000);
        let rec = recommend(&snap).unwrap();

        assert!((rec.non_pod_fraction - 0.9).abs() < 1e-9);
        assert_eq!(rec.pod_shares_target_raw, 3_527);
        assert_eq!(rec.pod_shares_target, 3_527);
        // 4096 - 3527 = 569 shares -> 555 millicores
        assert_eq!(rec.reserved_millicores, 555);
    }

    #[test]
    fn test_recommend_prefers_larger_system_slice_measurement() {
        // Machine-wide accounting says non-pod is 0.1 cores, but the system
        // slice itself measured 0.5. Take the larger.
        let snap = snapshot(4, 4_096, 300_000_000, 500_000_000, 100_000, 90_000);
        let rec = recommend(&snap).unwrap();
        assert!((rec.non_pod_fraction - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_recommend_fraction_bounds() {
        let snap = snapshot(4, 4_096, 300_000_000, 200_000_000, 100_000, 70_000);
        let rec = recommend(&snap).unwrap();

        assert!(rec.pod_fraction >= 0.0 && rec.pod_fraction <= snap.num_cores as f64);
        assert!(rec.total_fraction >= 0.0 && rec.total_fraction <= snap.num_cores as f64);
        assert!(rec.pod_shares_target >= 0);
        assert!(rec.pod_shares_target <= SHARES_PER_CORE * snap.num_cores);
    }

    #[test]
    fn test_recommend_rejects_unordered_readings() {
        let mut snap = snapshot(4, 4_096, 0, 0, 0, 0);
        snap.t1.timestamp_ns = snap.t0.timestamp_ns;
        assert!(recommend(&snap).is_err());
    }

    #[test]
    fn test_current_reservation_from_shares() {
        // kubepods at 15360 of 16384 shares: 1024 shares reserved = 1000m.
        let snap = snapshot(16, 15_360, 2_000_000_000, 200_000_000, 160_000, 135_530);
        let rec = recommend(&snap).unwrap();
        assert_eq!(rec.current_reserved_millicores, 1_000);
    }
}
