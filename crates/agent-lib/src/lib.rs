//! Core library for the reserved-resources agent
//!
//! This crate provides:
//! - Typed quantities and accounting readers for /proc and the cgroup v1
//!   hierarchy
//! - The memory, CPU and disk recommenders
//! - The two reconciliation loops and the pod-cgroup memory enforcer
//! - Prometheus gauge exposition and console reporting
//! - The reservation-push collaborators (kubelet config file, gRPC)

pub mod apply;
pub mod cgroup;
pub mod cpu;
pub mod disk;
pub mod health;
pub mod heuristics;
pub mod memory;
pub mod models;
pub mod observability;
pub mod proc;
pub mod proto;
pub mod quantity;
pub mod reconciler;
pub mod report;

pub use health::{AgentCondition, HealthRegistry, HealthReport, ReadinessReport, Task};
pub use models::*;
pub use observability::NodeMetrics;
pub use quantity::Quantity;
pub use reconciler::{Reconciler, ReconcilerConfig};
