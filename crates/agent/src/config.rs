//! Agent configuration
//!
//! Everything comes from environment variables; an unparseable value is a
//! startup failure, not something to limp past.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kube_reserved_lib::apply::{ApplyReservation, KubeletConfigFile, KubeletGrpc};
use kube_reserved_lib::quantity::Quantity;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};

/// A duration configured as `20s`, `500ms`, `5m` or a plain number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl DurationValue {
    pub fn get(&self) -> Duration {
        self.0
    }
}

fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {:?}", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => bail!("invalid duration unit {:?} in {:?}", unit, s),
    }
}

struct DurationVisitor;

impl Visitor<'_> for DurationVisitor {
    type Value = DurationValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration like \"20s\" or a number of seconds")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<DurationValue, E> {
        parse_duration(v)
            .map(DurationValue)
            .map_err(de::Error::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<DurationValue, E> {
        if v < 0 {
            return Err(de::Error::custom("duration cannot be negative"));
        }
        Ok(DurationValue(Duration::from_secs(v as u64)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<DurationValue, E> {
        Ok(DurationValue(Duration::from_secs(v)))
    }
}

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<DurationValue, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Agent configuration, loaded from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// PERIOD: slow-task reconciliation period.
    #[serde(default = "default_period")]
    pub period: DurationValue,

    /// MEMORY_SAFETY_MARGIN_ABSOLUTE: buffer added to the memory reservation
    /// so the cgroup OOM fires before the global one.
    #[serde(default = "default_memory_safety_margin")]
    pub memory_safety_margin_absolute: Quantity,

    /// MINIMUM_RESERVED_MEMORY: floor on the memory reservation.
    #[serde(default)]
    pub minimum_reserved_memory: Quantity,

    /// CGROUPS_HIERARCHY_ROOT: root of the legacy cgroup hierarchy.
    #[serde(default = "default_hierarchy_root")]
    pub cgroups_hierarchy_root: PathBuf,

    /// CGROUPS_CONTAINERD_ROOT: container runtime slice under the hierarchy.
    #[serde(default = "default_containerd_slice")]
    pub cgroups_containerd_root: String,

    /// CGROUPS_KUBELET_ROOT: node agent slice under the hierarchy.
    #[serde(default = "default_kubelet_slice")]
    pub cgroups_kubelet_root: String,

    /// KUBELET_DIRECTORY: holds pod volumes and plugins.
    #[serde(default = "default_kubelet_directory")]
    pub kubelet_directory: PathBuf,

    /// CONTAINERD_STATE_DIRECTORY: pod sandbox state and OCI bundles.
    #[serde(default = "default_containerd_state_directory")]
    pub containerd_state_directory: PathBuf,

    /// CONTAINERD_ROOT_DIRECTORY: content store and snapshotter.
    #[serde(default = "default_containerd_root_directory")]
    pub containerd_root_directory: PathBuf,

    /// ENFORCE_RECOMMENDATION: write the computed limit to the pod cgroup.
    #[serde(default)]
    pub enforce_recommendation: bool,

    /// KUBELET_CONFIG_PATH: push reservations by rewriting this file.
    #[serde(default)]
    pub kubelet_config_path: Option<PathBuf>,

    /// KUBELET_GRPC_ENDPOINT: push reservations over gRPC instead.
    #[serde(default)]
    pub kubelet_grpc_endpoint: Option<String>,

    /// APPLY_TIMEOUT: deadline on every reservation push.
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout: DurationValue,
}

fn default_period() -> DurationValue {
    DurationValue(Duration::from_secs(20))
}

fn default_memory_safety_margin() -> Quantity {
    Quantity::from_mib(100)
}

fn default_hierarchy_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_containerd_slice() -> String {
    "system.slice/containerd.service".to_string()
}

fn default_kubelet_slice() -> String {
    "system.slice/kubelet.service".to_string()
}

fn default_kubelet_directory() -> PathBuf {
    PathBuf::from("/var/lib/kubelet")
}

fn default_containerd_state_directory() -> PathBuf {
    PathBuf::from("/run/containerd")
}

fn default_containerd_root_directory() -> PathBuf {
    PathBuf::from("/var/lib/containerd")
}

fn default_apply_timeout() -> DurationValue {
    DurationValue(Duration::from_secs(1))
}

impl AgentConfig {
    /// Loads configuration from the process environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .context("failed to read configuration from environment")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.kubelet_config_path.is_some() && self.kubelet_grpc_endpoint.is_some() {
            bail!(
                "KUBELET_CONFIG_PATH and KUBELET_GRPC_ENDPOINT are mutually exclusive; configure one reservation sink"
            );
        }
        if self.period.get() < Duration::from_secs(2) {
            bail!("PERIOD must be at least 2s to leave room for the CPU sampling window");
        }
        Ok(())
    }

    /// The reservation sink the operator picked, if any.
    pub fn applier(&self) -> Option<Arc<dyn ApplyReservation>> {
        if let Some(path) = &self.kubelet_config_path {
            return Some(Arc::new(KubeletConfigFile::new(path)));
        }
        if let Some(endpoint) = &self.kubelet_grpc_endpoint {
            return Some(Arc::new(KubeletGrpc::new(
                endpoint.clone(),
                self.apply_timeout.get(),
            )));
        }
        None
    }
}
