//! Reservation push via the kubelet configuration file
//!
//! Rewrites `kubeReserved.memory` in the kubelet's YAML configuration and
//! asks systemd to restart the unit so the new reservation takes effect. A
//! unit that restarted less than a minute ago is left alone; restart churn
//! from a noisy measurement is worse than a slightly stale reservation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use super::{ApplyReservation, ReservationUpdate};
use crate::quantity::Quantity;

const MEMORY_RESOURCE: &str = "memory";
/// The kubelet defaults kube-reserved memory to 100Mi when unset.
const DEFAULT_KUBE_RESERVED_MEMORY: Quantity = Quantity::from_mib(100);

/// The subset of the kubelet configuration this agent reads and writes.
/// Every other field round-trips untouched through the flattened mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeletConfiguration {
    #[serde(
        rename = "kubeReserved",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub kube_reserved: BTreeMap<String, String>,
    #[serde(
        rename = "systemReserved",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub system_reserved: BTreeMap<String, String>,
    #[serde(flatten)]
    pub rest: serde_yaml::Mapping,
}

impl KubeletConfiguration {
    pub fn kube_reserved_memory(&self) -> Result<Quantity> {
        match self.kube_reserved.get(MEMORY_RESOURCE) {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid kubeReserved.memory {:?}", value)),
            None => Ok(DEFAULT_KUBE_RESERVED_MEMORY),
        }
    }

    pub fn system_reserved_memory(&self) -> Result<Quantity> {
        match self.system_reserved.get(MEMORY_RESOURCE) {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid systemReserved.memory {:?}", value)),
            None => Ok(Quantity::ZERO),
        }
    }
}

/// Applies reservations by rewriting the config file and restarting the unit.
#[derive(Debug, Clone)]
pub struct KubeletConfigFile {
    config_path: PathBuf,
    service: String,
    /// Do not restart a unit that has been active for less than this.
    min_active: Duration,
}

impl KubeletConfigFile {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            service: "kubelet.service".to_string(),
            min_active: Duration::from_secs(60),
        }
    }

    pub async fn load(&self) -> Result<KubeletConfiguration> {
        let bytes = fs::read(&self.config_path)
            .await
            .with_context(|| format!("failed to read {}", self.config_path.display()))?;
        if bytes.is_empty() {
            bail!("kubelet config not found at {}", self.config_path.display());
        }
        serde_yaml::from_slice(&bytes)
            .with_context(|| format!("error decoding {}", self.config_path.display()))
    }

    async fn store(&self, config: &KubeletConfiguration) -> Result<()> {
        let out = serde_yaml::to_string(config).context("failed to encode kubelet config")?;
        fs::write(&self.config_path, out)
            .await
            .with_context(|| format!("failed to write {}", self.config_path.display()))
    }

    /// How long the unit has been active, via its monotonic enter timestamp
    /// and /proc/uptime.
    async fn service_active_duration(&self) -> Result<Duration> {
        let output = Command::new("systemctl")
            .args([
                "show",
                &self.service,
                "--property=ActiveEnterTimestampMonotonic",
                "--value",
            ])
            .output()
            .await
            .context("failed to run systemctl show")?;
        if !output.status.success() {
            bail!(
                "systemctl show {} exited with {}",
                self.service,
                output.status
            );
        }

        let entered_us: u64 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .context("unparseable ActiveEnterTimestampMonotonic")?;

        let uptime = fs::read_to_string("/proc/uptime")
            .await
            .context("failed to read /proc/uptime")?;
        let uptime_secs: f64 = uptime
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .context("unparseable /proc/uptime")?;

        let active_secs = uptime_secs - entered_us as f64 / 1_000_000.0;
        Ok(Duration::from_secs_f64(active_secs.max(0.0)))
    }

    async fn restart_service(&self) -> Result<()> {
        let status = Command::new("systemctl")
            .args(["try-restart", &self.service])
            .status()
            .await
            .context("failed to run systemctl try-restart")?;
        if !status.success() {
            bail!("systemctl try-restart {} exited with {}", self.service, status);
        }
        info!(service = %self.service, "restarted after reservation update");
        Ok(())
    }
}

#[async_trait]
impl ApplyReservation for KubeletConfigFile {
    fn name(&self) -> &'static str {
        "kubelet-config-file"
    }

    async fn apply(&self, update: &ReservationUpdate) -> Result<()> {
        let active = self.service_active_duration().await?;
        if active < self.min_active {
            warn!(
                service = %self.service,
                active_secs = active.as_secs(),
                "service restarted too recently, skipping reservation update"
            );
            return Ok(());
        }

        let mut config = self.load().await?;

        // The total reservation splits into system-reserved plus
        // kube-reserved; only the kube-reserved share is rewritten.
        let system_reserved = config.system_reserved_memory()?;
        let previous = config.kube_reserved_memory()?;
        let target_kube_reserved = update.reserved_memory - system_reserved;

        config.kube_reserved.insert(
            MEMORY_RESOURCE.to_string(),
            target_kube_reserved.to_string(),
        );
        self.store(&config).await?;

        info!(
            from = %previous,
            to = %target_kube_reserved,
            "updated kube-reserved memory in {}",
            self.config_path.display()
        );

        self.restart_service().await
    }
}
