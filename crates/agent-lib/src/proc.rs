//! Readers for /proc/meminfo and /proc/stat
//!
//! Pure accounting readers: they parse kernel text surfaces into typed
//! quantities and have no side effects.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::fs;

use crate::quantity::Quantity;

pub const PROC_MEMINFO: &str = "/proc/meminfo";
pub const PROC_STAT: &str = "/proc/stat";

/// Reads MemTotal and MemAvailable from /proc/meminfo, in bytes.
///
/// MemAvailable is required: it is the kernel's estimate of memory available
/// without swapping and the basis of the whole memory calculation. Kernels
/// predating commit 34e431b0a do not report it and are not supported.
pub async fn read_meminfo(path: impl AsRef<Path>) -> Result<(Quantity, Quantity)> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    // meminfo values are kibibytes even though the unit reads "kB".
    let mem_total = meminfo_field(&content, "MemTotal:");
    let mem_available = meminfo_field(&content, "MemAvailable:");

    let mem_total = match mem_total {
        Some(kib) => Quantity::from_kib(kib),
        None => bail!("MemTotal field missing in {}", path.display()),
    };

    match mem_available {
        Some(kib) if kib > 0 => Ok((mem_total, Quantity::from_kib(kib))),
        _ => bail!(
            "MemAvailable field in {} is not set. Make sure the kernel includes commit 34e431b0a",
            path.display()
        ),
    }
}

fn meminfo_field(content: &str, key: &str) -> Option<i64> {
    content
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

/// Cumulative CPU time since boot, in jiffies, from the aggregate `cpu ` line
/// of /proc/stat. Only differences between two readings are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    /// Total processing plus idle time.
    pub total_jiffies: u64,
    /// Idle plus iowait time.
    pub idle_jiffies: u64,
}

/// Reads the aggregate CPU counters from /proc/stat.
pub async fn read_stat(path: impl AsRef<Path>) -> Result<CpuTimes> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .with_context(|| format!("no aggregate cpu line in {}", path.display()))?;

    // Positional fields after "cpu":
    // user nice system idle iowait irq softirq steal guest guest_nice
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().unwrap_or(0))
        .collect();
    if fields.len() < 8 {
        bail!("malformed cpu line in {}: {:?}", path.display(), line);
    }

    let user = fields[0];
    let nice = fields[1];
    let system = fields[2];
    let idle = fields[3];
    let iowait = fields[4];
    let irq = fields[5];
    let softirq = fields[6];
    let steal = fields[7];
    let guest_nice = fields.get(9).copied().unwrap_or(0);

    let idle_jiffies = idle + iowait;
    let total_jiffies =
        user + nice + system + irq + softirq + steal + guest_nice + idle_jiffies;

    Ok(CpuTimes {
        total_jiffies,
        idle_jiffies,
    })
}
