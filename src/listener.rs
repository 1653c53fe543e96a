//! Listener interface through which processes and clients publish results.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::compile::CompiledView;
use crate::cycle::CycleType;
use crate::error::{CompilationError, ViewError};
use crate::id::{CycleId, ViewProcessId};
use crate::result::{ViewComputationResultModel, ViewDeltaResultModel};

/// Describes a cycle about to run or that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleMetadata {
    /// Process running the cycle.
    pub process_id: ViewProcessId,
    /// The cycle.
    pub cycle_id: CycleId,
    /// Valuation time.
    pub valuation_time: SystemTime,
    /// Full or delta.
    pub cycle_type: CycleType,
}

/// Receives notifications from a view process.
///
/// All methods default to doing nothing. Notifications for one process arrive in order on
/// the process's own thread; a compilation notification always precedes the first result
/// computed from that compilation.
pub trait ViewResultListener: Send + Sync + 'static {
    /// A view was compiled and will be used for the coming cycles.
    fn view_definition_compiled(&self, _compiled: &Arc<CompiledView>) {}

    /// Compilation for `valuation_time` failed.
    fn view_definition_compilation_failed(
        &self,
        _valuation_time: SystemTime,
        _error: &CompilationError,
    ) {
    }

    /// A cycle is starting.
    fn cycle_started(&self, _cycle: &CycleMetadata) {}

    /// A cycle completed. Which of the two results are present depends on the result mode.
    fn cycle_completed(
        &self,
        _full: Option<&Arc<ViewComputationResultModel>>,
        _delta: Option<&Arc<ViewDeltaResultModel>>,
    ) {
    }

    /// A cycle failed as a whole.
    fn cycle_execution_failed(&self, _cycle: &CycleMetadata, _error: &ViewError) {}

    /// The process ran out of cycles.
    fn process_completed(&self) {}

    /// The process was terminated.
    fn process_terminated(&self, _execution_interrupted: bool) {}

    /// The client delivering these notifications was shut down.
    fn client_shutdown(&self) {}
}

/// A notification recorded by [`ResultCollector`].
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// See [`ViewResultListener::view_definition_compiled`].
    Compiled(Arc<CompiledView>),
    /// See [`ViewResultListener::view_definition_compilation_failed`].
    CompilationFailed(String),
    /// See [`ViewResultListener::cycle_started`].
    CycleStarted(CycleMetadata),
    /// See [`ViewResultListener::cycle_completed`].
    CycleCompleted {
        /// Full result, if delivered.
        full: Option<Arc<ViewComputationResultModel>>,
        /// Delta result, if delivered.
        delta: Option<Arc<ViewDeltaResultModel>>,
    },
    /// See [`ViewResultListener::cycle_execution_failed`].
    CycleExecutionFailed(String),
    /// See [`ViewResultListener::process_completed`].
    ProcessCompleted,
    /// See [`ViewResultListener::process_terminated`].
    ProcessTerminated {
        /// Whether a cycle was interrupted.
        execution_interrupted: bool,
    },
    /// See [`ViewResultListener::client_shutdown`].
    ClientShutdown,
}

/// Listener that records every notification, for assertions in tests.
#[derive(Debug, Default)]
pub struct ResultCollector {
    events: Mutex<Vec<ListenerEvent>>,
    recorded: Condvar,
}

impl ResultCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded notifications.
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    /// Take recorded notifications, clearing the collector.
    pub fn take(&self) -> Vec<ListenerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Clear recorded notifications.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Number of recorded notifications.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Number of notifications matching a predicate.
    pub fn count(&self, predicate: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Full results received, in order.
    pub fn full_results(&self) -> Vec<Arc<ViewComputationResultModel>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ListenerEvent::CycleCompleted { full, .. } => full.clone(),
                _ => None,
            })
            .collect()
    }

    /// Delta results received, in order.
    pub fn delta_results(&self) -> Vec<Arc<ViewDeltaResultModel>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ListenerEvent::CycleCompleted { delta, .. } => delta.clone(),
                _ => None,
            })
            .collect()
    }

    /// Block until the recorded notifications satisfy `condition` or the timeout elapses.
    ///
    /// Returns whether the condition holds.
    pub fn wait_until(
        &self,
        timeout: Duration,
        condition: impl Fn(&[ListenerEvent]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while !condition(&events) {
            if self.recorded.wait_until(&mut events, deadline).timed_out() {
                return condition(&events);
            }
        }
        true
    }

    /// Block until `count` notifications match `predicate`.
    pub fn wait_for_count(
        &self,
        timeout: Duration,
        count: usize,
        predicate: impl Fn(&ListenerEvent) -> bool,
    ) -> bool {
        self.wait_until(timeout, |events| {
            events.iter().filter(|event| predicate(event)).count() >= count
        })
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().push(event);
        self.recorded.notify_all();
    }
}

impl ViewResultListener for ResultCollector {
    fn view_definition_compiled(&self, compiled: &Arc<CompiledView>) {
        self.record(ListenerEvent::Compiled(compiled.clone()));
    }

    fn view_definition_compilation_failed(&self, _valuation_time: SystemTime, error: &CompilationError) {
        self.record(ListenerEvent::CompilationFailed(error.to_string()));
    }

    fn cycle_started(&self, cycle: &CycleMetadata) {
        self.record(ListenerEvent::CycleStarted(cycle.clone()));
    }

    fn cycle_completed(
        &self,
        full: Option<&Arc<ViewComputationResultModel>>,
        delta: Option<&Arc<ViewDeltaResultModel>>,
    ) {
        self.record(ListenerEvent::CycleCompleted {
            full: full.cloned(),
            delta: delta.cloned(),
        });
    }

    fn cycle_execution_failed(&self, _cycle: &CycleMetadata, error: &ViewError) {
        self.record(ListenerEvent::CycleExecutionFailed(error.to_string()));
    }

    fn process_completed(&self) {
        self.record(ListenerEvent::ProcessCompleted);
    }

    fn process_terminated(&self, execution_interrupted: bool) {
        self.record(ListenerEvent::ProcessTerminated {
            execution_interrupted,
        });
    }

    fn client_shutdown(&self) {
        self.record(ListenerEvent::ClientShutdown);
    }
}
