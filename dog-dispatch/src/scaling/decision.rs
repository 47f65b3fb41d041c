use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

impl ScalingAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::NoAction => "no_action",
        }
    }
}

/// Inputs sampled for one scaling cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetrics {
    /// Ready jobs across the sampled queues
    pub queue_depth: usize,
    pub avg_response_time_ms: f64,
    pub error_rate: f64,
    pub worker_count: usize,

    /// Projected spend at the current worker count
    pub hourly_cost: f64,
}

/// One audited scaling decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub reason: String,
    pub worker_count_before: usize,
    pub worker_count_after: usize,
    pub metrics: ScalingMetrics,
    pub timestamp: DateTime<Utc>,
}

impl ScalingDecision {
    pub(crate) fn new(action: ScalingAction, reason: impl Into<String>, metrics: ScalingMetrics, target: usize) -> Self {
        Self {
            action,
            reason: reason.into(),
            worker_count_before: metrics.worker_count,
            worker_count_after: target,
            metrics,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn no_action(reason: impl Into<String>, metrics: ScalingMetrics) -> Self {
        let count = metrics.worker_count;
        Self::new(ScalingAction::NoAction, reason, metrics, count)
    }

    /// Workers added (positive) or removed (negative)
    pub fn delta(&self) -> i64 {
        self.worker_count_after as i64 - self.worker_count_before as i64
    }
}
