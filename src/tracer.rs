//! Tracer trait for observing engine execution.
//!
//! This module defines the [`ViewTracer`] trait and the engine events it observes. The
//! default [`NoopTracer`] costs nothing when tracing is not needed, [`LoggingTracer`]
//! forwards events to the `tracing` crate and [`RecordingTracer`] collects them for tests.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use view_flow::{RecordingTracer, ViewEvent, ViewProcessor};
//!
//! let tracer = Arc::new(RecordingTracer::new());
//! let processor = ViewProcessor::builder(compiler, market_data)
//!     .tracer(tracer.clone())
//!     .build()?;
//! // ... run cycles ...
//! assert!(tracer
//!     .events()
//!     .iter()
//!     .any(|event| matches!(event, ViewEvent::ViewCompiled { .. })));
//! ```

use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::cycle::CycleType;
use crate::graph::NodeId;
use crate::id::{CycleId, FunctionInitId, JobId, ViewProcessId};
use crate::job::NodeFailure;
use crate::process::ViewProcessState;

/// Tracer trait for observing engine execution.
///
/// All methods have default empty implementations, so you only need to override the events
/// you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: process threads and the dispatcher call the tracer
/// concurrently.
pub trait ViewTracer: Send + Sync + 'static {
    /// A process changed lifecycle state.
    #[inline]
    fn on_process_state_changed(&self, _process: ViewProcessId, _state: ViewProcessState) {}

    /// A process compiled (or recompiled) its view.
    #[inline]
    fn on_view_compiled(
        &self,
        _process: ViewProcessId,
        _function_init_id: FunctionInitId,
        _node_count: usize,
    ) {
    }

    /// Compilation failed.
    #[inline]
    fn on_compilation_failed(&self, _process: ViewProcessId, _message: &str) {}

    /// A cycle started.
    #[inline]
    fn on_cycle_started(
        &self,
        _process: ViewProcessId,
        _cycle: CycleId,
        _valuation_time: SystemTime,
        _cycle_type: CycleType,
    ) {
    }

    /// The delta of one calculation configuration was computed.
    #[inline]
    fn on_delta_computed(
        &self,
        _cycle: CycleId,
        _configuration: &str,
        _changed: usize,
        _unchanged: usize,
    ) {
    }

    /// A job was handed to an invoker.
    #[inline]
    fn on_job_dispatched(&self, _job: JobId, _invoker: &str, _items: usize) {}

    /// A job is being retried after its invoker refused or lost it.
    #[inline]
    fn on_job_retried(&self, _job: JobId, _failed_invoker: &str) {}

    /// A job's results arrived.
    #[inline]
    fn on_job_completed(&self, _job: JobId, _invoker: &str, _duration: Duration) {}

    /// A node failed in a cycle.
    #[inline]
    fn on_node_failed(
        &self,
        _cycle: CycleId,
        _configuration: &str,
        _node: NodeId,
        _failure: &NodeFailure,
    ) {
    }

    /// A cycle completed and its results were delivered.
    #[inline]
    fn on_cycle_completed(&self, _process: ViewProcessId, _cycle: CycleId, _duration: Duration) {}

    /// A cycle's results were thrown away, e.g. because the process was stopped mid-cycle.
    #[inline]
    fn on_cycle_discarded(&self, _process: ViewProcessId, _cycle: CycleId) {}
}

/// A no-op tracer that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl ViewTracer for NoopTracer {}

/// Forwards engine events to the `tracing` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTracer;

impl ViewTracer for LoggingTracer {
    fn on_process_state_changed(&self, process: ViewProcessId, state: ViewProcessState) {
        tracing::info!(%process, ?state, "view process state changed");
    }

    fn on_view_compiled(
        &self,
        process: ViewProcessId,
        function_init_id: FunctionInitId,
        node_count: usize,
    ) {
        tracing::info!(%process, %function_init_id, node_count, "view compiled");
    }

    fn on_compilation_failed(&self, process: ViewProcessId, message: &str) {
        tracing::warn!(%process, error = message, "view compilation failed");
    }

    fn on_cycle_started(
        &self,
        process: ViewProcessId,
        cycle: CycleId,
        valuation_time: SystemTime,
        cycle_type: CycleType,
    ) {
        tracing::debug!(%process, %cycle, ?valuation_time, ?cycle_type, "cycle started");
    }

    fn on_delta_computed(&self, cycle: CycleId, configuration: &str, changed: usize, unchanged: usize) {
        tracing::debug!(%cycle, configuration, changed, unchanged, "delta computed");
    }

    fn on_job_dispatched(&self, job: JobId, invoker: &str, items: usize) {
        tracing::trace!(%job, invoker, items, "job dispatched");
    }

    fn on_job_retried(&self, job: JobId, failed_invoker: &str) {
        tracing::warn!(%job, failed_invoker, "retrying job on another invoker");
    }

    fn on_job_completed(&self, job: JobId, invoker: &str, duration: Duration) {
        tracing::trace!(%job, invoker, ?duration, "job completed");
    }

    fn on_node_failed(&self, cycle: CycleId, configuration: &str, node: NodeId, failure: &NodeFailure) {
        tracing::debug!(%cycle, configuration, %node, %failure, "node failed");
    }

    fn on_cycle_completed(&self, process: ViewProcessId, cycle: CycleId, duration: Duration) {
        tracing::info!(%process, %cycle, ?duration, "cycle completed");
    }

    fn on_cycle_discarded(&self, process: ViewProcessId, cycle: CycleId) {
        tracing::info!(%process, %cycle, "cycle results discarded");
    }
}

/// An engine event, as recorded by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    /// See [`ViewTracer::on_process_state_changed`].
    ProcessStateChanged {
        /// Process.
        process: ViewProcessId,
        /// New state.
        state: ViewProcessState,
    },
    /// See [`ViewTracer::on_view_compiled`].
    ViewCompiled {
        /// Process.
        process: ViewProcessId,
        /// Function implementations compiled against.
        function_init_id: FunctionInitId,
        /// Node count over all graphs.
        node_count: usize,
    },
    /// See [`ViewTracer::on_compilation_failed`].
    CompilationFailed {
        /// Process.
        process: ViewProcessId,
        /// Failure message.
        message: String,
    },
    /// See [`ViewTracer::on_cycle_started`].
    CycleStarted {
        /// Process.
        process: ViewProcessId,
        /// Cycle.
        cycle: CycleId,
        /// Valuation time.
        valuation_time: SystemTime,
        /// Full or delta.
        cycle_type: CycleType,
    },
    /// See [`ViewTracer::on_delta_computed`].
    DeltaComputed {
        /// Cycle.
        cycle: CycleId,
        /// Calculation configuration.
        configuration: String,
        /// Nodes to recompute.
        changed: usize,
        /// Nodes carried forward.
        unchanged: usize,
    },
    /// See [`ViewTracer::on_job_dispatched`].
    JobDispatched {
        /// Job.
        job: JobId,
        /// Invoker.
        invoker: String,
        /// Item count.
        items: usize,
    },
    /// See [`ViewTracer::on_job_retried`].
    JobRetried {
        /// Job.
        job: JobId,
        /// Invoker that refused or lost it.
        failed_invoker: String,
    },
    /// See [`ViewTracer::on_job_completed`].
    JobCompleted {
        /// Job.
        job: JobId,
        /// Invoker.
        invoker: String,
    },
    /// See [`ViewTracer::on_node_failed`].
    NodeFailed {
        /// Cycle.
        cycle: CycleId,
        /// Calculation configuration.
        configuration: String,
        /// Node.
        node: NodeId,
        /// Failure.
        failure: NodeFailure,
    },
    /// See [`ViewTracer::on_cycle_completed`].
    CycleCompleted {
        /// Process.
        process: ViewProcessId,
        /// Cycle.
        cycle: CycleId,
    },
    /// See [`ViewTracer::on_cycle_discarded`].
    CycleDiscarded {
        /// Process.
        process: ViewProcessId,
        /// Cycle.
        cycle: CycleId,
    },
}

/// Tracer that records every event, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<ViewEvent>>,
}

impl RecordingTracer {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events.
    pub fn events(&self) -> Vec<ViewEvent> {
        self.events.lock().clone()
    }

    /// Take recorded events, clearing the recorder.
    pub fn take(&self) -> Vec<ViewEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Clear recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Number of recorded events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&ViewEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    fn record(&self, event: ViewEvent) {
        self.events.lock().push(event);
    }
}

impl ViewTracer for RecordingTracer {
    fn on_process_state_changed(&self, process: ViewProcessId, state: ViewProcessState) {
        self.record(ViewEvent::ProcessStateChanged { process, state });
    }

    fn on_view_compiled(
        &self,
        process: ViewProcessId,
        function_init_id: FunctionInitId,
        node_count: usize,
    ) {
        self.record(ViewEvent::ViewCompiled {
            process,
            function_init_id,
            node_count,
        });
    }

    fn on_compilation_failed(&self, process: ViewProcessId, message: &str) {
        self.record(ViewEvent::CompilationFailed {
            process,
            message: message.to_string(),
        });
    }

    fn on_cycle_started(
        &self,
        process: ViewProcessId,
        cycle: CycleId,
        valuation_time: SystemTime,
        cycle_type: CycleType,
    ) {
        self.record(ViewEvent::CycleStarted {
            process,
            cycle,
            valuation_time,
            cycle_type,
        });
    }

    fn on_delta_computed(&self, cycle: CycleId, configuration: &str, changed: usize, unchanged: usize) {
        self.record(ViewEvent::DeltaComputed {
            cycle,
            configuration: configuration.to_string(),
            changed,
            unchanged,
        });
    }

    fn on_job_dispatched(&self, job: JobId, invoker: &str, items: usize) {
        self.record(ViewEvent::JobDispatched {
            job,
            invoker: invoker.to_string(),
            items,
        });
    }

    fn on_job_retried(&self, job: JobId, failed_invoker: &str) {
        self.record(ViewEvent::JobRetried {
            job,
            failed_invoker: failed_invoker.to_string(),
        });
    }

    fn on_job_completed(&self, job: JobId, invoker: &str, _duration: Duration) {
        self.record(ViewEvent::JobCompleted {
            job,
            invoker: invoker.to_string(),
        });
    }

    fn on_node_failed(&self, cycle: CycleId, configuration: &str, node: NodeId, failure: &NodeFailure) {
        self.record(ViewEvent::NodeFailed {
            cycle,
            configuration: configuration.to_string(),
            node,
            failure: failure.clone(),
        });
    }

    fn on_cycle_completed(&self, process: ViewProcessId, cycle: CycleId, _duration: Duration) {
        self.record(ViewEvent::CycleCompleted { process, cycle });
    }

    fn on_cycle_discarded(&self, process: ViewProcessId, cycle: CycleId) {
        self.record(ViewEvent::CycleDiscarded { process, cycle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_tracer() {
        let tracer = RecordingTracer::new();
        assert!(tracer.is_empty());

        tracer.on_job_dispatched(JobId(1), "local", 3);
        tracer.on_job_retried(JobId(1), "remote");
        assert_eq!(tracer.len(), 2);
        assert_eq!(
            tracer.count(|event| matches!(event, ViewEvent::JobRetried { .. })),
            1
        );

        let taken = tracer.take();
        assert_eq!(taken.len(), 2);
        assert!(tracer.is_empty());
    }

    #[test]
    fn test_noop_tracer_accepts_events() {
        let tracer = NoopTracer;
        tracer.on_job_dispatched(JobId(1), "local", 1);
        tracer.on_cycle_discarded(ViewProcessId(1), CycleId(1));
    }
}
