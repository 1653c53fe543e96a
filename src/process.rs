//! View processes.
//!
//! A process owns one view definition executing under one set of [`ExecutionOptions`]. It
//! runs its cycles on a dedicated thread (see `worker`) and publishes compilations and
//! results to the listeners attached to it, normally view clients.
//!
//! # Example
//!
//! ```ignore
//! let process = processor.create_persistent_process("Risk".into(), ExecutionOptions::infinite())?;
//! process.trigger_cycle()?;
//! let latest = process.latest_result();
//! process.stop();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use slab::Slab;

use crate::cache::ComputationCacheSource;
use crate::compile::{CompiledView, ViewCompiler};
use crate::config::ViewProcessorConfig;
use crate::delta::DeltaDefinition;
use crate::dispatch::{CancellationToken, JobDispatcher};
use crate::error::ViewError;
use crate::execution::ExecutionOptions;
use crate::id::{IdGenerator, ViewDefinitionId, ViewProcessId};
use crate::listener::ViewResultListener;
use crate::market_data::{MarketDataListener, MarketDataProvider};
use crate::result::{ViewComputationResultModel, ViewDeltaResultModel};
use crate::tracer::ViewTracer;
use crate::value::ValueRequirement;
use crate::worker::{self, SuspensionGate};

/// Lifecycle of a view process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViewProcessState {
    /// Created; the view has not compiled yet.
    Starting,
    /// Compiled and executing cycles.
    Running,
    /// The execution sequence ran out.
    Finished,
    /// Stopped, or the first compilation failed.
    Terminated,
}

impl ViewProcessState {
    /// Returns true for `Finished` and `Terminated`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ViewProcessState::Finished | ViewProcessState::Terminated)
    }
}

/// Services shared by every process of a processor.
pub(crate) struct ViewProcessContext {
    pub compiler: Arc<dyn ViewCompiler>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub dispatcher: JobDispatcher,
    pub cache_source: ComputationCacheSource,
    pub delta_definition: DeltaDefinition,
    pub tracer: Arc<dyn ViewTracer>,
    pub config: ViewProcessorConfig,
    pub cycle_ids: IdGenerator,
    pub gate: SuspensionGate,
}

/// Wake-up reasons for the process thread.
#[derive(Debug, Default)]
pub(crate) struct WorkerSignals {
    pub cycle_triggered: bool,
    pub market_data_changed: bool,
    pub graph_rebuild: bool,
    pub terminated: bool,
}

pub(crate) struct ProcessInner {
    pub id: ViewProcessId,
    pub definition_id: ViewDefinitionId,
    pub options: ExecutionOptions,
    pub persistent: bool,
    pub context: Arc<ViewProcessContext>,
    state: Mutex<ViewProcessState>,
    state_changed: Condvar,
    listeners: Mutex<Slab<Arc<dyn ViewResultListener>>>,
    latest_compiled: RwLock<Option<Arc<CompiledView>>>,
    latest_result: RwLock<Option<Arc<ViewComputationResultModel>>>,
    delivery: ReentrantMutex<()>,
    pub signals: Mutex<WorkerSignals>,
    pub wake: Condvar,
    pub cancel: CancellationToken,
    pub executing: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    market_data_listener: Mutex<Option<usize>>,
}

/// Handle to a running view process.
///
/// Cloning the handle is cheap; every clone refers to the same process.
#[derive(Clone)]
pub struct ViewProcess {
    inner: Arc<ProcessInner>,
}

impl std::fmt::Debug for ViewProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewProcess")
            .field("id", &self.inner.id)
            .field("definition_id", &self.inner.definition_id)
            .field("state", &self.state())
            .field("persistent", &self.inner.persistent)
            .finish()
    }
}

/// Forwards market-data changes that concern a process to its thread.
struct MarketDataWake(Weak<ProcessInner>);

impl MarketDataListener for MarketDataWake {
    fn values_changed(&self, requirements: &[ValueRequirement]) {
        let Some(process) = self.0.upgrade() else {
            return;
        };
        let relevant = match process.latest_compiled.read().as_ref() {
            Some(compiled) => {
                let needed = compiled.market_data_requirements();
                requirements.iter().any(|requirement| needed.contains(requirement))
            }
            None => true,
        };
        if relevant {
            process.signal(|signals| signals.market_data_changed = true);
        }
    }
}

impl ViewProcess {
    /// Create a process. Its thread starts with [`spawn`](Self::spawn), so listeners
    /// attached in between see every notification.
    pub(crate) fn new(
        id: ViewProcessId,
        definition_id: ViewDefinitionId,
        options: ExecutionOptions,
        persistent: bool,
        context: Arc<ViewProcessContext>,
    ) -> Self {
        let inner = Arc::new(ProcessInner {
            id,
            definition_id,
            options,
            persistent,
            context,
            state: Mutex::new(ViewProcessState::Starting),
            state_changed: Condvar::new(),
            listeners: Mutex::new(Slab::new()),
            latest_compiled: RwLock::new(None),
            latest_result: RwLock::new(None),
            delivery: ReentrantMutex::new(()),
            signals: Mutex::new(WorkerSignals::default()),
            wake: Condvar::new(),
            cancel: CancellationToken::new(),
            executing: AtomicBool::new(false),
            worker: Mutex::new(None),
            market_data_listener: Mutex::new(None),
        });

        if inner.options.sequence.is_live() {
            let key = inner
                .context
                .market_data
                .add_listener(Arc::new(MarketDataWake(Arc::downgrade(&inner))));
            *inner.market_data_listener.lock() = Some(key);
        }
        Self { inner }
    }

    /// Start the process thread. A process that cannot start is terminated.
    pub(crate) fn spawn(&self) -> Result<(), ViewError> {
        let mut slot = self.inner.worker.lock();
        if slot.is_some() {
            return Ok(());
        }
        let inner = self.inner.clone();
        match std::thread::Builder::new()
            .name(format!("view-{}", self.inner.id))
            .spawn(move || worker::run(inner))
        {
            Ok(handle) => {
                *slot = Some(handle);
                tracing::info!(
                    process = %self.inner.id,
                    definition = %self.inner.definition_id,
                    "view process started"
                );
                Ok(())
            }
            Err(err) => {
                drop(slot);
                tracing::error!(process = %self.inner.id, error = %err, "failed to start view process");
                self.inner.terminate();
                Err(ViewError::WorkerSpawn(Arc::new(err)))
            }
        }
    }

    /// The process id.
    pub fn id(&self) -> ViewProcessId {
        self.inner.id
    }

    /// Definition the process executes.
    pub fn definition_id(&self) -> &ViewDefinitionId {
        &self.inner.definition_id
    }

    /// Options the process was started with.
    pub fn execution_options(&self) -> &ExecutionOptions {
        &self.inner.options
    }

    /// Returns true if the process keeps running with no listeners attached.
    pub fn is_persistent(&self) -> bool {
        self.inner.persistent
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ViewProcessState {
        self.inner.state()
    }

    /// The compiled view used by the latest cycles.
    pub fn latest_compiled_view(&self) -> Option<Arc<CompiledView>> {
        self.inner.latest_compiled.read().clone()
    }

    /// Result of the latest completed cycle.
    pub fn latest_result(&self) -> Option<Arc<ViewComputationResultModel>> {
        self.inner.latest_result.read().clone()
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Request a cycle now, regardless of market-data changes.
    pub fn trigger_cycle(&self) -> Result<(), ViewError> {
        self.inner.ensure_alive("trigger a cycle")?;
        self.inner.signal(|signals| signals.cycle_triggered = true);
        Ok(())
    }

    /// Signal that market data this process depends on has changed.
    pub fn market_data_changed(&self) {
        self.inner
            .signal(|signals| signals.market_data_changed = true);
    }

    /// Recompile the view before the next cycle, and run that cycle.
    pub fn force_graph_rebuild(&self) -> Result<(), ViewError> {
        self.inner.ensure_alive("rebuild the graph")?;
        self.inner.signal(|signals| {
            signals.graph_rebuild = true;
            signals.cycle_triggered = true;
        });
        Ok(())
    }

    /// Stop the process.
    ///
    /// In-flight jobs are cancelled and their results discarded. Listeners receive
    /// `process_terminated` and nothing after it. Stopping a stopped or finished process does
    /// nothing.
    pub fn stop(&self) {
        self.inner.terminate();
    }

    /// Block until the process finishes or terminates.
    ///
    /// Returns false if the timeout elapsed first.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.is_terminal() {
            if self
                .inner
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.is_terminal();
            }
        }
        true
    }

    /// Attach a listener, catching it up with the latest compiled view and result.
    pub(crate) fn attach_listener(
        &self,
        listener: Arc<dyn ViewResultListener>,
    ) -> Result<usize, ViewError> {
        let _delivery = self.inner.delivery.lock();
        self.inner.ensure_alive("attach to it")?;
        let key = self.inner.listeners.lock().insert(listener.clone());
        if let Some(compiled) = self.latest_compiled_view() {
            listener.view_definition_compiled(&compiled);
        }
        if let Some(result) = self.latest_result() {
            let delta = Arc::new(ViewDeltaResultModel::between(
                None,
                &result,
                &self.inner.context.delta_definition,
            ));
            listener.cycle_completed(Some(&result), Some(&delta));
        }
        Ok(key)
    }

    /// Detach a listener. The last listener leaving a non-persistent process stops it.
    pub(crate) fn detach_listener(&self, key: usize) {
        let remaining = {
            let mut listeners = self.inner.listeners.lock();
            if listeners.try_remove(key).is_none() {
                return;
            }
            listeners.len()
        };
        if remaining == 0 && !self.inner.persistent && !self.state().is_terminal() {
            tracing::debug!(process = %self.inner.id, "last listener detached");
            self.stop();
        }
    }

    /// Run `f` while holding the delivery lock, so no notification interleaves with it.
    pub(crate) fn with_delivery_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _delivery = self.inner.delivery.lock();
        f()
    }

    /// Join the process thread unless called from it.
    pub(crate) fn join_worker(&self) {
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(process = %self.inner.id, "view process thread panicked");
            }
        }
    }
}

impl ProcessInner {
    pub(crate) fn state(&self) -> ViewProcessState {
        *self.state.lock()
    }

    fn ensure_alive(&self, action: &str) -> Result<(), ViewError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ViewError::illegal_state(format!(
                "cannot {action}: view process {} is {state:?}",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn signal(&self, update: impl FnOnce(&mut WorkerSignals)) {
        update(&mut self.signals.lock());
        self.wake.notify_all();
    }

    /// Move to `next` unless already terminal. Returns whether the state changed.
    fn transition(&self, next: ViewProcessState) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
        }
        self.state_changed.notify_all();
        self.context.tracer.on_process_state_changed(self.id, next);
        tracing::info!(process = %self.id, state = ?next, "view process state changed");
        true
    }

    fn listeners(&self) -> Vec<Arc<dyn ViewResultListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    /// Notify every listener, in order, unless the process has finished or terminated.
    pub(crate) fn deliver(&self, notify: impl Fn(&dyn ViewResultListener)) {
        let _delivery = self.delivery.lock();
        if self.state().is_terminal() {
            return;
        }
        for listener in self.listeners() {
            notify(listener.as_ref());
        }
    }

    pub(crate) fn mark_running(&self) {
        let _ = self.transition(ViewProcessState::Running);
    }

    /// Publish a newly compiled view. Listeners see it before any result computed from it.
    pub(crate) fn publish_compiled(&self, compiled: &Arc<CompiledView>) {
        let _delivery = self.delivery.lock();
        *self.latest_compiled.write() = Some(compiled.clone());
        self.deliver(|listener| listener.view_definition_compiled(compiled));
    }

    /// Publish a cycle result along with its delta against the previous result.
    pub(crate) fn publish_result(&self, result: Arc<ViewComputationResultModel>) {
        let _delivery = self.delivery.lock();
        if self.state().is_terminal() {
            return;
        }
        let previous = self.latest_result.write().replace(result.clone());
        let delta = Arc::new(ViewDeltaResultModel::between(
            previous.as_deref(),
            &result,
            &self.context.delta_definition,
        ));
        self.deliver(|listener| listener.cycle_completed(Some(&result), Some(&delta)));
    }

    /// The sequence ran out.
    pub(crate) fn complete(&self) {
        let _delivery = self.delivery.lock();
        let listeners = self.listeners();
        if !self.transition(ViewProcessState::Finished) {
            return;
        }
        for listener in listeners {
            listener.process_completed();
        }
        self.listeners.lock().clear();
        self.release_market_data_listener();
    }

    pub(crate) fn terminate(&self) {
        let interrupted = self.executing.load(Ordering::Acquire);
        self.cancel.cancel();
        self.signal(|signals| signals.terminated = true);
        self.context.gate.wake_all();

        let _delivery = self.delivery.lock();
        let listeners = self.listeners();
        if !self.transition(ViewProcessState::Terminated) {
            return;
        }
        for listener in listeners {
            listener.process_terminated(interrupted);
        }
        self.listeners.lock().clear();
        self.release_market_data_listener();
    }

    fn release_market_data_listener(&self) {
        if let Some(key) = self.market_data_listener.lock().take() {
            self.context.market_data.remove_listener(key);
        }
    }
}
