//! Calculation jobs: the unit of work shipped to an invoker.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::graph::NodeId;
use crate::id::{CycleId, JobId, ViewProcessId};
use crate::value::{ComputedValue, FunctionId, MissingValue, TargetSpecification, ValueSpecification};

/// Where a job belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJobSpecification {
    /// The job.
    pub job_id: JobId,
    /// Process running the cycle.
    pub process_id: ViewProcessId,
    /// Cycle the job is part of.
    pub cycle_id: CycleId,
    /// Calculation configuration of the graph.
    pub calculation_configuration: Arc<str>,
    /// Valuation time of the cycle.
    pub valuation_time: SystemTime,
}

/// One node to execute, with its inputs already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationJobItem {
    /// Node being executed.
    pub node: NodeId,
    /// Function to run.
    pub function: FunctionId,
    /// Target to run it for.
    pub target: TargetSpecification,
    /// Input values.
    pub inputs: Vec<ComputedValue>,
    /// Outputs the node must produce.
    pub outputs: Vec<ValueSpecification>,
}

/// A batch of independent nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationJob {
    /// Job identity.
    pub specification: CalculationJobSpecification,
    /// Nodes to execute. No item depends on another item of the same job.
    pub items: Vec<CalculationJobItem>,
}

/// Why a node produced no values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureKind {
    /// The function returned an error or panicked.
    FunctionFailed,
    /// No function is registered under the node's function id.
    FunctionNotFound,
    /// An input node failed, so this node was never executed.
    UpstreamFailed,
    /// The job did not complete in time.
    TimedOut,
    /// No invoker could run the job.
    InvokerUnavailable,
}

/// Failure of one node in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeFailure {
    /// Classification.
    pub kind: FailureKind,
    /// Human readable detail.
    pub message: Arc<str>,
}

impl NodeFailure {
    /// Create a failure.
    pub fn new(kind: FailureKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Marker stored in place of the node's outputs.
    pub fn to_missing_value(&self) -> MissingValue {
        match self.kind {
            FailureKind::FunctionFailed | FailureKind::FunctionNotFound => {
                MissingValue::EvaluationError(self.message.clone())
            }
            FailureKind::UpstreamFailed => MissingValue::UpstreamFailure,
            FailureKind::TimedOut | FailureKind::InvokerUnavailable => MissingValue::Suppressed,
        }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Result of one job item.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationJobResultItem {
    /// Node the item executed.
    pub node: NodeId,
    /// Produced values, or why there are none.
    pub outcome: Result<Vec<ComputedValue>, NodeFailure>,
}

/// Result of a whole job.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationJobResult {
    /// The job.
    pub specification: CalculationJobSpecification,
    /// One result per job item, in item order.
    pub items: Vec<CalculationJobResultItem>,
    /// Wall time spent executing.
    pub duration: Duration,
    /// Invoker that ran the job.
    pub invoker: Arc<str>,
}

/// What an invoker reports back for a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The job ran; individual items may still have failed.
    Completed(CalculationJobResult),
    /// The invoker was lost before finishing; the job may be retried elsewhere.
    InvokerFailed {
        /// The affected job.
        job_id: JobId,
        /// Invoker that failed.
        invoker: Arc<str>,
        /// Detail.
        message: Arc<str>,
    },
}

impl JobOutcome {
    /// The job this outcome belongs to.
    pub fn job_id(&self) -> JobId {
        match self {
            JobOutcome::Completed(result) => result.specification.job_id,
            JobOutcome::InvokerFailed { job_id, .. } => *job_id,
        }
    }
}

/// Channel on which invokers report [`JobOutcome`]s.
pub type JobResultSender = crossbeam_channel::Sender<JobOutcome>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_markers() {
        let failed = NodeFailure::new(FailureKind::FunctionFailed, "boom");
        assert_eq!(
            failed.to_missing_value(),
            MissingValue::EvaluationError("boom".into())
        );
        assert_eq!(
            NodeFailure::new(FailureKind::UpstreamFailed, "").to_missing_value(),
            MissingValue::UpstreamFailure
        );
        assert_eq!(
            NodeFailure::new(FailureKind::InvokerUnavailable, "").to_missing_value(),
            MissingValue::Suppressed
        );
        assert!(failed.to_string().contains("boom"));
    }
}
