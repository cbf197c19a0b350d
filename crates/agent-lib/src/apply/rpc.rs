//! Reservation push over gRPC
//!
//! Talks to a kubelet that serves the resource-reservations endpoint, which
//! re-applies the reservation in-process without a unit restart. Memory only:
//! the CPU reservation is never pushed (see `ReservationUpdate`).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tonic::transport::Endpoint;
use tracing::info;

use super::{ApplyReservation, ReservationUpdate};
use crate::proto::{ResourceReservationsClient, UpdateResourceReservationsRequest};

/// Applies reservations through the kubelet's gRPC endpoint.
#[derive(Debug, Clone)]
pub struct KubeletGrpc {
    endpoint: String,
    /// Deadline covering connect plus the unary call. A timeout costs one
    /// reconciliation tick, nothing more.
    timeout: Duration,
}

impl KubeletGrpc {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ApplyReservation for KubeletGrpc {
    fn name(&self) -> &'static str {
        "kubelet-grpc"
    }

    async fn apply(&self, update: &ReservationUpdate) -> Result<()> {
        let channel = Endpoint::from_shared(self.endpoint.clone())
            .with_context(|| format!("invalid endpoint {:?}", self.endpoint))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect()
            .await
            .with_context(|| format!("failed to connect to {}", self.endpoint))?;

        let mut client = ResourceReservationsClient::new(channel);

        let request = UpdateResourceReservationsRequest {
            kube_reserved: [(
                "memory".to_string(),
                update.reserved_memory.to_string(),
            )]
            .into_iter()
            .collect(),
            system_reserved: Default::default(),
        };

        tokio::time::timeout(
            self.timeout,
            client.update_resource_reservations(request),
        )
        .await
        .context("reservation push timed out")?
        .context("reservation push rejected")?;

        info!(
            endpoint = %self.endpoint,
            memory = %update.reserved_memory,
            "pushed reservation to kubelet"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_fails_fast_when_endpoint_unreachable() {
        let applier = KubeletGrpc::new(
            "http://127.0.0.1:1".to_string(),
            Duration::from_millis(200),
        );
        let result = applier
            .apply(&ReservationUpdate {
                reserved_memory: crate::quantity::Quantity::from_gib(2),
                reserved_cpu_millicores: 0,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_an_error_not_a_panic() {
        let applier = KubeletGrpc::new("not a uri", Duration::from_secs(1));
        let result = applier
            .apply(&ReservationUpdate {
                reserved_memory: crate::quantity::Quantity::ZERO,
                reserved_cpu_millicores: 0,
            })
            .await;
        assert!(result.is_err());
    }
}
