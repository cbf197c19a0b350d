//! Probe surface for the reconciliation loops and the reservation sink
//!
//! Health is not a flag the loops set; it is derived from their tick history
//! measured against the cadence each loop is supposed to hold. A failed tick
//! costs one period and reads as degraded. A loop that has not landed a
//! successful tick for several periods is failing: the pod cgroup limit has
//! stopped tracking consumption, which is the one condition the liveness
//! probe exists to catch. Reservation-push failures never take the agent
//! past degraded; the recommendation path keeps its value without a sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

/// A loop may miss this many periods in a row before it counts as stalled.
const STALL_GRACE_PERIODS: u32 = 5;

/// Overall condition reported by the probes. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCondition {
    Ok,
    /// Ticks are being skipped; the next period gets a fresh chance.
    Degraded,
    /// No successful tick within the stall window.
    Failing,
}

/// The reporting paths of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    MemoryLoop,
    SlowLoop,
    Apply,
}

#[derive(Debug)]
struct TaskRecord {
    period: Duration,
    started: Instant,
    last_success: Option<Instant>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

impl TaskRecord {
    fn new(period: Duration) -> Self {
        Self {
            period,
            started: Instant::now(),
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    fn succeed(&mut self) {
        self.last_success = Some(Instant::now());
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    fn fail(&mut self, error: String) {
        self.last_error = Some(error);
        self.consecutive_failures += 1;
    }

    fn condition(&self, now: Instant) -> AgentCondition {
        // A loop that has not succeeded yet is anchored to its start time, so
        // startup gets the same grace window as a transient outage.
        let anchor = self.last_success.unwrap_or(self.started);
        if now.duration_since(anchor) > self.period * STALL_GRACE_PERIODS {
            return AgentCondition::Failing;
        }
        if self.last_error.is_some() {
            AgentCondition::Degraded
        } else {
            AgentCondition::Ok
        }
    }

    fn report(&self, now: Instant) -> TaskReport {
        TaskReport {
            condition: self.condition(now),
            consecutive_failures: self.consecutive_failures,
            seconds_since_last_success: self
                .last_success
                .map(|t| now.duration_since(t).as_secs()),
            last_error: self.last_error.clone(),
        }
    }
}

/// One loop's slice of the health payload.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub condition: AgentCondition,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_success: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Which sink the operator wired (config file or gRPC).
    pub sink: String,
    #[serde(flatten)]
    pub report: TaskReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub condition: AgentCondition,
    pub memory_loop: TaskReport,
    pub slow_loop: TaskReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct Inner {
    ready: bool,
    memory: TaskRecord,
    slow: TaskRecord,
    apply: Option<(&'static str, TaskRecord)>,
}

/// Registry the loops report ticks into and the probe endpoints read from.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl HealthRegistry {
    /// The periods are the cadences the loops promise to hold; stall
    /// detection is measured against them.
    pub fn new(memory_period: Duration, reconciliation_period: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                ready: false,
                memory: TaskRecord::new(memory_period),
                slow: TaskRecord::new(reconciliation_period),
                apply: None,
            })),
        }
    }

    /// Called when the operator wires a reservation sink. The apply path
    /// runs on the slow cadence.
    pub async fn enable_apply(&self, sink: &'static str) {
        let mut inner = self.inner.write().await;
        let period = inner.slow.period;
        inner.apply = Some((sink, TaskRecord::new(period)));
    }

    pub async fn tick_succeeded(&self, task: Task) {
        let mut inner = self.inner.write().await;
        match task {
            Task::MemoryLoop => inner.memory.succeed(),
            Task::SlowLoop => inner.slow.succeed(),
            Task::Apply => {
                if let Some((_, record)) = inner.apply.as_mut() {
                    record.succeed();
                }
            }
        }
    }

    pub async fn tick_failed(&self, task: Task, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        let error = error.into();
        match task {
            Task::MemoryLoop => inner.memory.fail(error),
            Task::SlowLoop => inner.slow.fail(error),
            Task::Apply => {
                if let Some((_, record)) = inner.apply.as_mut() {
                    record.fail(error);
                }
            }
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        let mut inner = self.inner.write().await;
        inner.ready = ready;
    }

    pub async fn health(&self) -> HealthReport {
        let inner = self.inner.read().await;
        let now = Instant::now();

        let memory_loop = inner.memory.report(now);
        let slow_loop = inner.slow.report(now);
        let apply = inner.apply.as_ref().map(|(sink, record)| ApplyReport {
            sink: sink.to_string(),
            report: record.report(now),
        });

        // The loops decide the condition. A broken reservation push is worth
        // surfacing but the agent still measures and recommends, so the apply
        // path caps out at degraded.
        let mut condition = memory_loop.condition.max(slow_loop.condition);
        if let Some(apply) = &apply {
            if apply.report.condition > AgentCondition::Ok {
                condition = condition.max(AgentCondition::Degraded);
            }
        }

        HealthReport {
            condition,
            memory_loop,
            slow_loop,
            apply,
        }
    }

    pub async fn readiness(&self) -> ReadinessReport {
        let report = self.health().await;
        let ready = self.inner.read().await.ready;

        if !ready {
            return ReadinessReport {
                ready: false,
                reason: Some("agent still starting".to_string()),
            };
        }
        if report.memory_loop.condition == AgentCondition::Failing {
            return ReadinessReport {
                ready: false,
                reason: Some("memory loop stalled".to_string()),
            };
        }
        if report.slow_loop.condition == AgentCondition::Failing {
            return ReadinessReport {
                ready: false,
                reason: Some("cpu/disk loop stalled".to_string()),
            };
        }
        ReadinessReport {
            ready: true,
            reason: None,
        }
    }
}
