//! Error types for every layer of the engine.
//!
//! Failures of individual calculation functions never surface here: they become
//! [`MissingValue`](crate::MissingValue) markers and [`NodeFailure`](crate::NodeFailure)s on
//! the affected nodes. These types describe engine-level failures and lifecycle misuse.

use std::sync::Arc;

use crate::graph::NodeId;
use crate::id::{CycleId, ViewProcessId};
use crate::value::ValueSpecification;

/// Errors raised while building or projecting a [`DependencyGraph`](crate::DependencyGraph).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A node consumes a value that no node in the graph produces.
    #[error("input {input} is not produced by any node in the graph")]
    MissingInput {
        /// The unresolved input.
        input: ValueSpecification,
    },

    /// A node declares an output another node already produces.
    #[error("output {output} is already produced by node {existing}")]
    DuplicateOutput {
        /// The contested output.
        output: ValueSpecification,
        /// The node that already produces it.
        existing: NodeId,
    },

    /// The node id does not belong to the graph.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// A terminal output was declared for a value nothing produces.
    #[error("terminal output {0} is not produced by any node")]
    UnknownTerminalOutput(ValueSpecification),
}

/// Errors raised by a [`ComputationCache`](crate::ComputationCache).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The cycle owning the cache has completed; its cache is read-only.
    #[error("cache for {cycle}/{configuration} is sealed")]
    Sealed {
        /// The owning cycle.
        cycle: CycleId,
        /// The calculation configuration.
        configuration: Arc<str>,
    },
}

/// A view definition could not be compiled.
#[derive(Debug, Clone, thiserror::Error)]
#[error("compilation failed: {message}")]
pub struct CompilationError {
    message: Arc<str>,
    cause: Option<Arc<anyhow::Error>>,
}

impl CompilationError {
    /// Create a compilation error with a message.
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying cause, if the compiler reported one.
    pub fn cause(&self) -> Option<&Arc<anyhow::Error>> {
        self.cause.as_ref()
    }
}

impl From<anyhow::Error> for CompilationError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string().into(),
            cause: Some(Arc::new(err)),
        }
    }
}

/// Errors raised by a [`JobInvoker`](crate::JobInvoker) when handed a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokerError {
    /// The invoker cannot take work right now; the job should go elsewhere.
    #[error("invoker {invoker} unavailable: {reason}")]
    Unavailable {
        /// The invoker id.
        invoker: Arc<str>,
        /// Why it is unavailable.
        reason: Arc<str>,
    },

    /// The invoker has been shut down permanently.
    #[error("invoker {invoker} has shut down")]
    Shutdown {
        /// The invoker id.
        invoker: Arc<str>,
    },
}

/// Errors raised while dispatching a graph's jobs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Dispatch was cancelled; outstanding results were discarded.
    #[error("dispatch cancelled")]
    Cancelled,

    /// No invoker is registered with the dispatcher.
    #[error("no job invokers registered")]
    NoInvokers,

    /// Writing results failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The graph changed shape underneath the dispatcher.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors raised while executing a single computation cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    /// The cycle was interrupted before completing.
    #[error("cycle {0} was interrupted")]
    Interrupted(CycleId),

    /// A cycle can only be executed once.
    #[error("cycle {0} has already been executed")]
    AlreadyExecuted(CycleId),

    /// Job dispatch failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Cache access failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Top-level errors returned by processors, processes and clients.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ViewError {
    /// The operation is not valid in the current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// No process with this id exists.
    #[error("unknown view process {0}")]
    UnknownProcess(ViewProcessId),

    /// Compilation failed.
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    /// A cycle failed.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// The process thread could not be started.
    #[error("failed to spawn view process worker: {0}")]
    WorkerSpawn(Arc<std::io::Error>),
}

impl ViewError {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        ViewError::IllegalState(message.into())
    }

    /// Returns true if this is an illegal-state error.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, ViewError::IllegalState(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_error_from_anyhow() {
        let err: CompilationError = anyhow::anyhow!("portfolio not found").into();
        assert!(err.to_string().contains("portfolio not found"));
        assert!(err.cause().is_some());
        assert!(CompilationError::new("bad").cause().is_none());
    }

    #[test]
    fn test_view_error_conversions() {
        let err: ViewError = CycleError::Dispatch(DispatchError::Cancelled).into();
        assert!(matches!(err, ViewError::Cycle(_)));
        assert!(!err.is_illegal_state());
        assert!(ViewError::illegal_state("client stopped").is_illegal_state());
    }
}
