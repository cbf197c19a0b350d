//! Readers and the limit writer for the legacy (v1) cgroup hierarchy
//!
//! Only the per-controller hierarchy is supported: memory stats live under
//! `<root>/memory/<slice>/` and CPU stats under `<root>/cpu/<slice>/`. The
//! unified hierarchy renames these files and is out of scope.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::fs;
use tracing::warn;

use crate::quantity::Quantity;

const MEMORY_USAGE: &str = "memory.usage_in_bytes";
const MEMORY_LIMIT: &str = "memory.limit_in_bytes";
const MEMORY_STAT: &str = "memory.stat";
const TOTAL_INACTIVE_FILE: &str = "total_inactive_file";
const CPU_SHARES: &str = "cpu.shares";
const CPUACCT_USAGE: &str = "cpuacct.usage";

/// Parses one decimal counter from a cgroup file.
///
/// The kernel occasionally writes a negative value into counters that are
/// nominally unsigned; those read as zero so a single odd counter cannot
/// abort a reconciliation.
pub async fn read_uint(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_uint(content.trim()).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_uint(s: &str) -> Result<u64> {
    match s.parse::<u64>() {
        Ok(v) => Ok(v),
        Err(_) => match s.parse::<i64>() {
            Ok(v) if v < 0 => Ok(0),
            // Below i64::MIN: still a negative value, still zero.
            Err(_) if s.starts_with('-') && s[1..].chars().all(|c| c.is_ascii_digit()) => Ok(0),
            _ => bail!("not an unsigned integer: {:?}", s),
        },
    }
}

fn memory_path(hierarchy_root: &Path, slice: &str) -> PathBuf {
    hierarchy_root.join("memory").join(slice)
}

fn cpu_path(hierarchy_root: &Path, slice: &str) -> PathBuf {
    hierarchy_root.join("cpu").join(slice)
}

/// Working set of a memory cgroup: usage minus the inactive page-cache pages,
/// i.e. the portion that cannot be reclaimed under pressure.
pub async fn memory_working_set(hierarchy_root: &Path, slice: &str) -> Result<Quantity> {
    let dir = memory_path(hierarchy_root, slice);
    let usage = read_uint(dir.join(MEMORY_USAGE)).await?;

    let stat = fs::read_to_string(dir.join(MEMORY_STAT))
        .await
        .with_context(|| format!("failed to read {}", dir.join(MEMORY_STAT).display()))?;
    let inactive_file = stat_field(&stat, TOTAL_INACTIVE_FILE)
        .with_context(|| format!("no {} in {}", TOTAL_INACTIVE_FILE, dir.display()))?;

    Ok(Quantity::new(
        usage.saturating_sub(inactive_file).min(i64::MAX as u64) as i64,
    ))
}

fn stat_field(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

/// memory.limit_in_bytes of a cgroup. The kernel reports "unlimited" as a
/// value near u64::MAX; it is clamped into the signed range.
pub async fn memory_limit(hierarchy_root: &Path, slice: &str) -> Result<Quantity> {
    let limit = read_uint(memory_path(hierarchy_root, slice).join(MEMORY_LIMIT)).await?;
    Ok(Quantity::new(limit.min(i64::MAX as u64) as i64))
}

/// cpu.shares of a cgroup.
pub async fn cpu_shares(hierarchy_root: &Path, slice: &str) -> Result<i64> {
    let shares = read_uint(cpu_path(hierarchy_root, slice).join(CPU_SHARES)).await?;
    Ok(shares.min(i64::MAX as u64) as i64)
}

/// cpuacct.usage of a cgroup: cumulative CPU time in nanoseconds.
pub async fn cpuacct_usage(hierarchy_root: &Path, slice: &str) -> Result<u64> {
    read_uint(cpu_path(hierarchy_root, slice).join(CPUACCT_USAGE)).await
}

/// Writes the memory limit on a cgroup. The write is idempotent; the kernel
/// rejects values below current usage with EBUSY, which is reported to the
/// caller as a warning, not a failure.
pub async fn write_memory_limit(
    hierarchy_root: &Path,
    slice: &str,
    limit: Quantity,
) -> Result<()> {
    let path = memory_path(hierarchy_root, slice).join(MEMORY_LIMIT);
    match fs::write(&path, limit.value().to_string()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::ResourceBusy => {
            warn!(
                limit = %limit,
                path = %path.display(),
                "kernel rejected memory limit below current usage"
            );
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to write {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn mock_memory_cgroup(root: &Path, slice: &str, usage: &str, limit: &str, stat: &str) {
        let dir = root.join("memory").join(slice);
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(MEMORY_USAGE), usage).await.unwrap();
        fs::write(dir.join(MEMORY_LIMIT), limit).await.unwrap();
        fs::write(dir.join(MEMORY_STAT), stat).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_uint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter");

        fs::write(&path, "12345\n").await.unwrap();
        assert_eq!(read_uint(&path).await.unwrap(), 12345);

        // Negative counters read as zero.
        fs::write(&path, "-1\n").await.unwrap();
        assert_eq!(read_uint(&path).await.unwrap(), 0);

        // Below i64::MIN: still zero.
        fs::write(&path, "-92233720368547758080\n").await.unwrap();
        assert_eq!(read_uint(&path).await.unwrap(), 0);

        fs::write(&path, "garbage\n").await.unwrap();
        assert!(read_uint(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_read_uint_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(read_uint(dir.path().join("absent")).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_working_set() {
        let dir = TempDir::new().unwrap();
        mock_memory_cgroup(
            dir.path(),
            "kubepods",
            "104857600\n",
            "9223372036854771712\n",
            "cache 26214400\nrss 52428800\ntotal_cache 26214400\ntotal_inactive_file 13107200\n",
        )
        .await;

        let ws = memory_working_set(dir.path(), "kubepods").await.unwrap();
        assert_eq!(ws, Quantity::new(104_857_600 - 13_107_200));
    }

    #[tokio::test]
    async fn test_memory_working_set_never_negative() {
        let dir = TempDir::new().unwrap();
        mock_memory_cgroup(
            dir.path(),
            "kubepods",
            "1000\n",
            "0\n",
            "total_inactive_file 2000\n",
        )
        .await;

        let ws = memory_working_set(dir.path(), "kubepods").await.unwrap();
        assert_eq!(ws, Quantity::ZERO);
    }

    #[tokio::test]
    async fn test_memory_limit_clamps_unlimited() {
        let dir = TempDir::new().unwrap();
        mock_memory_cgroup(
            dir.path(),
            "kubepods",
            "0\n",
            "18446744073709551615\n",
            "total_inactive_file 0\n",
        )
        .await;

        let limit = memory_limit(dir.path(), "kubepods").await.unwrap();
        assert_eq!(limit, Quantity::new(i64::MAX));
    }

    #[tokio::test]
    async fn test_cpu_readers() {
        let dir = TempDir::new().unwrap();
        let cpu_dir = dir.path().join("cpu").join("system.slice");
        fs::create_dir_all(&cpu_dir).await.unwrap();
        fs::write(cpu_dir.join(CPU_SHARES), "1024\n").await.unwrap();
        fs::write(cpu_dir.join(CPUACCT_USAGE), "5000000000\n")
            .await
            .unwrap();

        assert_eq!(cpu_shares(dir.path(), "system.slice").await.unwrap(), 1024);
        assert_eq!(
            cpuacct_usage(dir.path(), "system.slice").await.unwrap(),
            5_000_000_000
        );
    }

    #[tokio::test]
    async fn test_write_memory_limit() {
        let dir = TempDir::new().unwrap();
        mock_memory_cgroup(dir.path(), "kubepods", "0\n", "0\n", "total_inactive_file 0\n")
            .await;

        write_memory_limit(dir.path(), "kubepods", Quantity::from_gib(8))
            .await
            .unwrap();

        let limit = memory_limit(dir.path(), "kubepods").await.unwrap();
        assert_eq!(limit, Quantity::from_gib(8));
    }
}
