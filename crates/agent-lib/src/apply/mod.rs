//! Pushing reservations to the kubelet
//!
//! Two mechanisms exist with overlapping responsibility: rewriting the
//! kubelet configuration file and restarting the unit, or a gRPC call into a
//! kubelet that serves a resource-reservations endpoint. Both sit behind one
//! trait; the operator wires exactly one of them (or neither, for a
//! recommend-only deployment).

mod kubelet_config;
mod rpc;

pub use kubelet_config::{KubeletConfigFile, KubeletConfiguration};
pub use rpc::KubeletGrpc;

use anyhow::Result;
use async_trait::async_trait;

use crate::quantity::Quantity;

/// The reservation a reconciliation produced, ready to hand to the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationUpdate {
    pub reserved_memory: Quantity,
    /// Carried for completeness; no implementation pushes it. The kubelet
    /// pins system.slice at 1024 shares, so enforcing a CPU reservation only
    /// shrinks schedulable capacity without changing dispensed CPU time.
    pub reserved_cpu_millicores: i64,
}

/// A sink the slow loop hands the reservation to.
#[async_trait]
pub trait ApplyReservation: Send + Sync {
    /// Name for logs and health reporting.
    fn name(&self) -> &'static str;

    async fn apply(&self, update: &ReservationUpdate) -> Result<()>;
}
