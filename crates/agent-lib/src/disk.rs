//! Disk recommender
//!
//! Reconstructs per-component root-disk usage from shell primitives and
//! derives the byte reservation for non-pod artifacts. The agent runs in its
//! own mount namespace, so every discovery step goes through the mount view
//! of pid 1 (host PID namespace required): `/proc/1/mounts` names the device
//! backing `/`, `/proc/1/mountinfo` lists where block devices are mounted.
//!
//! The identity being solved:
//! reservation = capacity - fs_reserved - available
//!             - runtime_state - snapshotter - pod_logs - pod_volumes - plugins
//! The content store (immutable image layers) is measured but not subtracted;
//! it is charged to node-level overhead, not to pods.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::debug;

use crate::models::{DiskSnapshot, Recommendation};
use crate::quantity::Quantity;

const CMD_ROOT_PARTITION: &str = "cat /proc/1/mounts | grep ' / ' | cut -d ' ' -f 1";
const CMD_BLOCK_DEVICES: &str = "ls -l /dev | grep '^b' | awk '{ print $10 }'";
const CMD_PARTITION_SIZE: &str = "blockdev --getsize64";
/// Subtree of the runtime root holding immutable image layers.
const CONTENT_STORE_DIR: &str = "io.containerd.content.v1.content";
/// Subtree of the runtime root holding unpacked snapshots.
const SNAPSHOTTER_DIR: &str = "io.containerd.snapshotter.v1.overlayfs";
/// CSI volume path component under <kubelet>/pods; never on the root disk.
const CSI_VOLUME_COMPONENT: &str = "kubernetes.io~csi";
/// CSI plugin subtree under <kubelet>/plugins.
const CSI_PLUGIN_COMPONENT: &str = "csi";

/// Directories the scanner measures.
#[derive(Debug, Clone)]
pub struct DiskScanner {
    /// Container runtime root, holds content store and snapshotter.
    pub containerd_root_directory: PathBuf,
    /// Container runtime state, holds pod sandbox state and OCI bundles.
    pub containerd_state_directory: PathBuf,
    /// Node agent directory, holds pod volumes and plugins.
    pub kubelet_directory: PathBuf,
    /// Pod log directory.
    pub pod_log_directory: PathBuf,
}

impl DiskScanner {
    pub fn new(
        containerd_root_directory: impl Into<PathBuf>,
        containerd_state_directory: impl Into<PathBuf>,
        kubelet_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            containerd_root_directory: containerd_root_directory.into(),
            containerd_state_directory: containerd_state_directory.into(),
            kubelet_directory: kubelet_directory.into(),
            pod_log_directory: PathBuf::from("/var/log/pods"),
        }
    }

    /// Runs the full discovery sequence and returns one disk snapshot.
    pub async fn scan(&self) -> Result<DiskSnapshot> {
        let root_partition = shell(CMD_ROOT_PARTITION).await?;
        if root_partition.is_empty() {
            bail!("could not determine the root partition from /proc/1/mounts");
        }
        debug!(root_partition = %root_partition, "resolved root partition");

        let excluded_mounts = non_root_mountpoints(&root_partition).await?;
        debug!(excluded = excluded_mounts.len(), "mount points on non-root block devices");

        let capacity = Quantity::new(
            parse_i64(&shell(&format!("{} {}", CMD_PARTITION_SIZE, root_partition)).await?)?,
        );

        // df reports kibibytes.
        let available = Quantity::from_kib(parse_i64(
            &shell(&format!(
                "df {} | tr -s ' ' | cut -d\" \" -f 4 | tail -1",
                root_partition
            ))
            .await?,
        )?);
        let used = Quantity::from_kib(parse_i64(
            &shell(&format!(
                "df {} | tr -s ' ' | cut -d\" \" -f 3 | tail -1",
                root_partition
            ))
            .await?,
        )?);
        let fs_reserved = capacity - available - used;

        let content_store = self
            .directory_size(
                &format!(
                    "{}/{}/",
                    self.containerd_root_directory.display(),
                    CONTENT_STORE_DIR
                ),
                &[],
            )
            .await?;

        let snapshotter = self
            .directory_size(
                &format!(
                    "{}/{}",
                    self.containerd_root_directory.display(),
                    SNAPSHOTTER_DIR
                ),
                &[],
            )
            .await?;

        // Each container's unpacked root filesystem is already accounted to
        // the snapshotter; only the remaining state counts here.
        let state = self
            .directory_size(
                &self.containerd_state_directory.display().to_string(),
                &["rootfs".to_string()],
            )
            .await?;

        let pod_logs = self
            .directory_size(&self.pod_log_directory.display().to_string(), &[])
            .await?;

        let mut volume_excludes: Vec<String> = vec![CSI_VOLUME_COMPONENT.to_string()];
        volume_excludes.extend(excluded_mounts.iter().cloned());
        let pod_volumes = self
            .directory_size(
                &format!("{}/pods", self.kubelet_directory.display()),
                &volume_excludes,
            )
            .await?;

        let plugins = self
            .directory_size(
                &format!("{}/plugins", self.kubelet_directory.display()),
                &[CSI_PLUGIN_COMPONENT.to_string()],
            )
            .await?;

        Ok(DiskSnapshot {
            root_partition,
            capacity,
            available,
            used,
            fs_reserved,
            content_store,
            snapshotter,
            state,
            pod_logs,
            pod_volumes,
            plugins,
        })
    }

    async fn directory_size(&self, directory: &str, excludes: &[String]) -> Result<Quantity> {
        let command = format!(
            "du -sb {}{} | awk '{{ print $1 }}'",
            build_du_excludes(excludes),
            directory
        );
        debug!(command = %command, "measuring directory");
        let output = shell(&command).await?;
        Ok(Quantity::new(parse_i64(&output)?))
    }
}

/// The reservation the snapshot implies, with the identity spelled out.
pub fn recommend(snapshot: &DiskSnapshot) -> (Quantity, Recommendation) {
    let reservation = snapshot.capacity
        - snapshot.fs_reserved
        - snapshot.available
        - snapshot.state
        - snapshot.snapshotter
        - snapshot.pod_logs
        - snapshot.pod_volumes
        - snapshot.plugins;

    let rationale = format!(
        "capacity {} minus fs-reserved {}, available {}, runtime state {}, snapshotter {}, pod logs {}, pod volumes {}, plugins {}",
        snapshot.capacity.humanize(),
        snapshot.fs_reserved.humanize(),
        snapshot.available.humanize(),
        snapshot.state.humanize(),
        snapshot.snapshotter.humanize(),
        snapshot.pod_logs.humanize(),
        snapshot.pod_volumes.humanize(),
        snapshot.plugins.humanize(),
    );

    (
        reservation,
        Recommendation {
            target: reservation,
            // No current disk reservation is readable from the node; the
            // kubelet does not materialize it in any kernel surface.
            current: Quantity::ZERO,
            rationale,
        },
    )
}

/// Mount points that belong to block devices other than the root partition.
/// Network-attached volumes land on those devices; without excluding their
/// mount points the pod-volume walk would count them against the root disk.
async fn non_root_mountpoints(root_partition: &str) -> Result<BTreeSet<String>> {
    let devices = shell(CMD_BLOCK_DEVICES).await?;

    let mut device_patterns = String::new();
    for device in devices.lines().filter(|d| !d.is_empty()) {
        write!(device_patterns, "-e '{}' ", device).expect("write to string");
    }
    if device_patterns.is_empty() {
        return Ok(BTreeSet::new());
    }

    // Field 5 of mountinfo is the mount point.
    let all_mounts = shell(&format!(
        "cat /proc/1/mountinfo | grep {} | awk '{{ print $5 }}'",
        device_patterns
    ))
    .await?;
    let mut mounts: BTreeSet<String> = all_mounts
        .lines()
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();

    let root_mounts = shell(&format!(
        "cat /proc/1/mountinfo | grep {} | awk '{{ print $5 }}'",
        root_partition
    ))
    .await?;
    for mount in root_mounts.lines() {
        mounts.remove(mount);
    }

    Ok(mounts)
}

fn build_du_excludes(excludes: &[String]) -> String {
    let mut args = String::new();
    for exclude in excludes {
        write!(args, "--exclude=\"{}\" ", exclude).expect("write to string");
    }
    args
}

async fn shell(command: &str) -> Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("failed to spawn: {}", command))?;

    if !output.status.success() {
        bail!(
            "command {:?} exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn parse_i64(s: &str) -> Result<i64> {
    s.trim()
        .parse()
        .with_context(|| format!("expected an integer, got {:?}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> DiskSnapshot {
        DiskSnapshot {
            root_partition: "/dev/nvme0n1p3".to_string(),
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
        }
    }

    #[test]
    fn test_reservation_identity() {
        // 100 - 2 - 40 - 1 - 5 - 0.5 - 40 - 0.5 = 11 GiB
        let (reservation, _) = recommend(&snapshot());
        assert_eq!(reservation, Quantity::from_gib(11));
    }

    #[test]
    fn test_reservation_identity_balances_capacity() {
        let snap = snapshot();
        let (reservation, _) = recommend(&snap);
        let accounted = reservation
            + snap.fs_reserved
            + snap.available
            + snap.state
            + snap.snapshotter
            + snap.pod_logs
            + snap.pod_volumes
            + snap.plugins;
        assert_eq!(accounted, snap.capacity);
    }

    #[test]
    fn test_content_store_not_subtracted() {
        let mut snap = snapshot();
        let (before, _) = recommend(&snap);
        snap.content_store = Quantity::from_gib(30);
        let (after, _) = recommend(&snap);
        assert_eq!(before, after);
    }

    #[test]
    fn test_used_matches_fs_reserved_identity() {
        let snap = snapshot();
        assert_eq!(
            snap.used,
            snap.capacity - snap.fs_reserved - snap.available
        );
    }

    #[test]
    fn test_build_du_excludes() {
        assert_eq!(build_du_excludes(&[]), "");
        assert_eq!(
            build_du_excludes(&[
                "kubernetes.io~csi".to_string(),
                "/mnt/data".to_string()
            ]),
            "--exclude=\"kubernetes.io~csi\" --exclude=\"/mnt/data\" "
        );
    }

    #[test]
    fn test_parse_i64() {
        assert_eq!(parse_i64("42\n").unwrap(), 42);
        assert_eq!(parse_i64("  107374182400 ").unwrap(), 107_374_182_400);
        assert!(parse_i64("").is_err());
        assert!(parse_i64("4,2").is_err());
    }

    #[tokio::test]
    async fn test_shell_captures_stdout() {
        assert_eq!(shell("echo 42").await.unwrap(), "42");
    }

    #[tokio::test]
    async fn test_shell_surfaces_failures() {
        assert!(shell("exit 3").await.is_err());
    }

    #[tokio::test]
    async fn test_directory_size_on_fixture() {
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("payload"), vec![0u8; 4096])
            .await
            .unwrap();

        let scanner = DiskScanner::new("/var/lib/containerd", "/run/containerd", "/var/lib/kubelet");
        let size = scanner
            .directory_size(&dir.path().display().to_string(), &[])
            .await
            .unwrap();
        assert!(size >= Quantity::new(4096));
    }
}
