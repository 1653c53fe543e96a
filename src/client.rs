//! View clients.
//!
//! A client is a consumer's handle on a view process. It attaches to a process (shared with
//! other clients asking for the same definition and options), filters the process's
//! notifications through its result mode, and holds them back while paused.
//!
//! # Example
//!
//! ```ignore
//! let client = processor.create_view_client();
//! client.set_result_listener(Some(collector.clone()))?;
//! client.set_result_mode(ViewResultMode::DeltaOnly)?;
//! client.attach_to_view_process("Risk".into(), ExecutionOptions::infinite())?;
//! ```

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::compile::CompiledView;
use crate::error::{CompilationError, ViewError};
use crate::execution::ExecutionOptions;
use crate::id::{ViewClientId, ViewDefinitionId, ViewProcessId};
use crate::listener::{CycleMetadata, ViewResultListener};
use crate::process::ViewProcess;
use crate::processor::ProcessorInner;
use crate::result::{ViewComputationResultModel, ViewDeltaResultModel};

/// Lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViewClientState {
    /// Delivering notifications.
    Started,
    /// Holding notifications back until resumed.
    Paused,
    /// Shut down; only `detach` and `shutdown` remain valid.
    Stopped,
}

/// Which results a client delivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViewResultMode {
    /// Full results only.
    #[default]
    FullOnly,
    /// Delta results only.
    DeltaOnly,
    /// Both.
    Both,
    /// The first result in full, deltas afterwards.
    FullThenDelta,
    /// No results; compilation and lifecycle notifications still arrive.
    None,
}

impl ViewResultMode {
    fn select(
        self,
        full: Option<&Arc<ViewComputationResultModel>>,
        delta: Option<&Arc<ViewDeltaResultModel>>,
        full_delivered: bool,
    ) -> (
        Option<Arc<ViewComputationResultModel>>,
        Option<Arc<ViewDeltaResultModel>>,
    ) {
        match self {
            ViewResultMode::FullOnly => (full.cloned(), None),
            ViewResultMode::DeltaOnly => (None, delta.cloned()),
            ViewResultMode::Both => (full.cloned(), delta.cloned()),
            ViewResultMode::FullThenDelta if !full_delivered => (full.cloned(), None),
            ViewResultMode::FullThenDelta => (None, delta.cloned()),
            ViewResultMode::None => (None, None),
        }
    }
}

struct Attachment {
    process: ViewProcess,
    key: usize,
}

/// Notifications held back while paused, merged so only the latest state is released.
#[derive(Default)]
struct PendingNotifications {
    compiled: Option<Arc<CompiledView>>,
    full: Option<Arc<ViewComputationResultModel>>,
    delta: Option<ViewDeltaResultModel>,
}

impl PendingNotifications {
    fn is_empty(&self) -> bool {
        self.compiled.is_none() && self.full.is_none() && self.delta.is_none()
    }
}

struct ClientState {
    lifecycle: ViewClientState,
    mode: ViewResultMode,
    listener: Option<Arc<dyn ViewResultListener>>,
    attachment: Option<Attachment>,
    generation: u64,
    latest_compiled: Option<Arc<CompiledView>>,
    latest_result: Option<Arc<ViewComputationResultModel>>,
    full_delivered: bool,
    pending: PendingNotifications,
}

pub(crate) struct ClientInner {
    id: ViewClientId,
    processor: Weak<ProcessorInner>,
    state: Mutex<ClientState>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(attachment) = self.state.get_mut().attachment.take() {
            attachment.process.detach_listener(attachment.key);
        }
    }
}

/// Receives a process's notifications on behalf of one attachment of a client.
struct ClientListener {
    client: Weak<ClientInner>,
    generation: u64,
}

impl ClientListener {
    /// Run `f` on the client's state if this attachment is still current.
    ///
    /// Callers invoke the user listener only after this returns, outside the state lock.
    fn with_state<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> Option<R> {
        let client = self.client.upgrade()?;
        let mut state = client.state.lock();
        if state.generation != self.generation {
            return None;
        }
        Some(f(&mut state))
    }

    fn started_listener(&self) -> Option<Arc<dyn ViewResultListener>> {
        self.with_state(|state| match state.lifecycle {
            ViewClientState::Started => state.listener.clone(),
            _ => None,
        })
        .flatten()
    }
}

impl ViewResultListener for ClientListener {
    fn view_definition_compiled(&self, compiled: &Arc<CompiledView>) {
        let listener = self
            .with_state(|state| {
                state.latest_compiled = Some(compiled.clone());
                match state.lifecycle {
                    ViewClientState::Started => state.listener.clone(),
                    ViewClientState::Paused => {
                        state.pending.compiled = Some(compiled.clone());
                        None
                    }
                    ViewClientState::Stopped => None,
                }
            })
            .flatten();
        if let Some(listener) = listener {
            listener.view_definition_compiled(compiled);
        }
    }

    fn view_definition_compilation_failed(
        &self,
        valuation_time: SystemTime,
        error: &CompilationError,
    ) {
        if let Some(listener) = self.started_listener() {
            listener.view_definition_compilation_failed(valuation_time, error);
        }
    }

    fn cycle_started(&self, cycle: &CycleMetadata) {
        if let Some(listener) = self.started_listener() {
            listener.cycle_started(cycle);
        }
    }

    fn cycle_completed(
        &self,
        full: Option<&Arc<ViewComputationResultModel>>,
        delta: Option<&Arc<ViewDeltaResultModel>>,
    ) {
        let delivery = self
            .with_state(|state| {
                if let Some(full) = full {
                    state.latest_result = Some(full.clone());
                }
                match state.lifecycle {
                    ViewClientState::Started => {
                        let listener = state.listener.clone()?;
                        let (full, delta) = state.mode.select(full, delta, state.full_delivered);
                        if full.is_none() && delta.is_none() {
                            return None;
                        }
                        state.full_delivered |= full.is_some();
                        Some((listener, full, delta))
                    }
                    ViewClientState::Paused => {
                        if let Some(full) = full {
                            state.pending.full = Some(full.clone());
                        }
                        if let Some(delta) = delta {
                            let delta = delta.as_ref().clone();
                            state.pending.delta = Some(match state.pending.delta.take() {
                                Some(mut pending) => {
                                    pending.merge(delta);
                                    pending
                                }
                                None => delta,
                            });
                        }
                        None
                    }
                    ViewClientState::Stopped => None,
                }
            })
            .flatten();
        if let Some((listener, full, delta)) = delivery {
            listener.cycle_completed(full.as_ref(), delta.as_ref());
        }
    }

    fn cycle_execution_failed(&self, cycle: &CycleMetadata, error: &ViewError) {
        if let Some(listener) = self.started_listener() {
            listener.cycle_execution_failed(cycle, error);
        }
    }

    fn process_completed(&self) {
        let listener = self
            .with_state(|state| {
                state.attachment = None;
                state.generation += 1;
                state.listener.clone()
            })
            .flatten();
        if let Some(listener) = listener {
            listener.process_completed();
        }
    }

    fn process_terminated(&self, execution_interrupted: bool) {
        let listener = self
            .with_state(|state| {
                state.attachment = None;
                state.generation += 1;
                state.listener.clone()
            })
            .flatten();
        if let Some(listener) = listener {
            listener.process_terminated(execution_interrupted);
        }
    }
}

/// A consumer's handle on view processes.
///
/// Created by [`ViewProcessor::create_view_client`](crate::ViewProcessor::create_view_client).
/// Dropping every handle of an attached client detaches it.
#[derive(Clone)]
pub struct ViewClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ViewClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ViewClient")
            .field("id", &self.inner.id)
            .field("state", &state.lifecycle)
            .field("mode", &state.mode)
            .field(
                "process",
                &state.attachment.as_ref().map(|attachment| attachment.process.id()),
            )
            .finish()
    }
}

impl ViewClient {
    pub(crate) fn new(id: ViewClientId, processor: Weak<ProcessorInner>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id,
                processor,
                state: Mutex::new(ClientState {
                    lifecycle: ViewClientState::Started,
                    mode: ViewResultMode::default(),
                    listener: None,
                    attachment: None,
                    generation: 0,
                    latest_compiled: None,
                    latest_result: None,
                    full_delivered: false,
                    pending: PendingNotifications::default(),
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    /// The client id.
    pub fn id(&self) -> ViewClientId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ViewClientState {
        self.inner.state.lock().lifecycle
    }

    fn ensure_not_stopped(&self, action: &str) -> Result<(), ViewError> {
        if self.state() == ViewClientState::Stopped {
            return Err(ViewError::illegal_state(format!(
                "cannot {action}: view client {} is stopped",
                self.inner.id
            )));
        }
        Ok(())
    }

    fn processor(&self) -> Result<Arc<ProcessorInner>, ViewError> {
        self.inner
            .processor
            .upgrade()
            .filter(|processor| processor.is_running())
            .ok_or_else(|| ViewError::illegal_state("the view processor has been stopped"))
    }

    /// Attach to the process executing `definition_id` under `options`, starting one if none
    /// is running. An attached client is detached first.
    pub fn attach_to_view_process(
        &self,
        definition_id: ViewDefinitionId,
        options: ExecutionOptions,
    ) -> Result<(), ViewError> {
        self.ensure_not_stopped("attach")?;
        let processor = self.processor()?;
        self.detach();
        self.attach_with(|listener| {
            // A shared process may end between lookup and attachment; the next attempt
            // starts a fresh one.
            let mut attempts = 0;
            loop {
                match processor.attach_to_shared_process(&definition_id, &options, listener.clone())
                {
                    Err(error) if error.is_illegal_state() && attempts < 2 => attempts += 1,
                    other => return other,
                }
            }
        })
    }

    /// Attach to an existing process. An attached client is detached first.
    pub fn attach_to_process(&self, process_id: ViewProcessId) -> Result<(), ViewError> {
        self.ensure_not_stopped("attach")?;
        let processor = self.processor()?;
        let process = processor
            .process(process_id)
            .ok_or(ViewError::UnknownProcess(process_id))?;
        self.detach();
        self.attach_with(|listener| {
            let key = process.attach_listener(listener)?;
            Ok((process, key))
        })
    }

    fn attach_with(
        &self,
        attach: impl FnOnce(Arc<dyn ViewResultListener>) -> Result<(ViewProcess, usize), ViewError>,
    ) -> Result<(), ViewError> {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.full_delivered = false;
            state.pending = PendingNotifications::default();
            state.generation
        };
        let adapter: Arc<dyn ViewResultListener> = Arc::new(ClientListener {
            client: Arc::downgrade(&self.inner),
            generation,
        });
        let (process, key) = attach(adapter)?;
        {
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.attachment = Some(Attachment {
                    process: process.clone(),
                    key,
                });
                tracing::debug!(client = %self.inner.id, process = %process.id(), "view client attached");
                return Ok(());
            }
        }
        // The process ended while attaching.
        process.detach_listener(key);
        Ok(())
    }

    /// Run `f` on the client state under the attached process's delivery lock, so it cannot
    /// interleave with a notification already on its way to the listener.
    fn with_delivery_quiesced<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        let mut f = Some(f);
        loop {
            let Some(process) = self.process() else {
                let mut state = self.inner.state.lock();
                if state.attachment.is_none() {
                    if let Some(f) = f.take() {
                        return f(&mut *state);
                    }
                }
                continue;
            };
            // The attachment may change before the lock is taken; retry against the new one.
            let done = process.with_delivery_lock(|| {
                let mut state = self.inner.state.lock();
                let current = state
                    .attachment
                    .as_ref()
                    .is_some_and(|attachment| attachment.process.id() == process.id());
                if current {
                    f.take().map(|f| f(&mut *state))
                } else {
                    None
                }
            });
            if let Some(result) = done {
                return result;
            }
        }
    }

    /// Detach from the current process. Detaching a detached client does nothing.
    ///
    /// Once this returns the listener hears nothing more from the process.
    pub fn detach(&self) {
        let attachment = self.with_delivery_quiesced(|state| {
            state.generation += 1;
            state.pending = PendingNotifications::default();
            state.attachment.take()
        });
        if let Some(attachment) = attachment {
            tracing::debug!(client = %self.inner.id, process = %attachment.process.id(), "view client detached");
            attachment.process.detach_listener(attachment.key);
        }
    }

    /// Returns true while attached to a process.
    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().attachment.is_some()
    }

    /// The attached process.
    pub fn process(&self) -> Option<ViewProcess> {
        self.inner
            .state
            .lock()
            .attachment
            .as_ref()
            .map(|attachment| attachment.process.clone())
    }

    /// Hold notifications back. The process keeps running.
    pub fn pause(&self) -> Result<(), ViewError> {
        let id = self.inner.id;
        self.with_delivery_quiesced(|state| match state.lifecycle {
            ViewClientState::Stopped => Err(ViewError::illegal_state(format!(
                "cannot pause: view client {id} is stopped"
            ))),
            _ => {
                state.lifecycle = ViewClientState::Paused;
                Ok(())
            }
        })
    }

    /// Resume delivery, releasing whatever arrived while paused as one merged notification.
    pub fn resume(&self) -> Result<(), ViewError> {
        self.ensure_not_stopped("resume")?;
        match self.process() {
            Some(process) => process.with_delivery_lock(|| self.release_pending()),
            None => self.release_pending(),
        }
    }

    fn release_pending(&self) -> Result<(), ViewError> {
        let (listener, compiled, full, delta) = {
            let mut state = self.inner.state.lock();
            match state.lifecycle {
                ViewClientState::Stopped => {
                    return Err(ViewError::illegal_state(format!(
                        "cannot resume: view client {} is stopped",
                        self.inner.id
                    )))
                }
                ViewClientState::Started => return Ok(()),
                ViewClientState::Paused => {}
            }
            state.lifecycle = ViewClientState::Started;
            let pending = std::mem::take(&mut state.pending);
            if pending.is_empty() {
                return Ok(());
            }
            let delta = pending.delta.map(Arc::new);
            let (full, delta) =
                state
                    .mode
                    .select(pending.full.as_ref(), delta.as_ref(), state.full_delivered);
            state.full_delivered |= full.is_some();
            (state.listener.clone(), pending.compiled, full, delta)
        };
        let Some(listener) = listener else {
            return Ok(());
        };
        if let Some(compiled) = &compiled {
            listener.view_definition_compiled(compiled);
        }
        if full.is_some() || delta.is_some() {
            listener.cycle_completed(full.as_ref(), delta.as_ref());
        }
        Ok(())
    }

    /// Choose which results are delivered.
    pub fn set_result_mode(&self, mode: ViewResultMode) -> Result<(), ViewError> {
        self.ensure_not_stopped("set the result mode")?;
        self.inner.state.lock().mode = mode;
        Ok(())
    }

    /// The result mode.
    pub fn result_mode(&self) -> ViewResultMode {
        self.inner.state.lock().mode
    }

    /// Set (or clear) the listener notifications are delivered to.
    pub fn set_result_listener(
        &self,
        listener: Option<Arc<dyn ViewResultListener>>,
    ) -> Result<(), ViewError> {
        self.ensure_not_stopped("set the result listener")?;
        self.inner.state.lock().listener = listener;
        Ok(())
    }

    /// Latest full result received, whether or not it was delivered.
    pub fn latest_result(&self) -> Option<Arc<ViewComputationResultModel>> {
        self.inner.state.lock().latest_result.clone()
    }

    /// Latest compiled view received.
    pub fn latest_compiled_view(&self) -> Option<Arc<CompiledView>> {
        self.inner.state.lock().latest_compiled.clone()
    }

    /// Returns true once a result has been received.
    pub fn is_result_available(&self) -> bool {
        self.inner.state.lock().latest_result.is_some()
    }

    /// Ask the attached process to run a cycle.
    pub fn trigger_cycle(&self) -> Result<(), ViewError> {
        self.ensure_not_stopped("trigger a cycle")?;
        let process = self.process().ok_or_else(|| {
            ViewError::illegal_state(format!(
                "cannot trigger a cycle: view client {} is not attached",
                self.inner.id
            ))
        })?;
        process.trigger_cycle()
    }

    /// Detach and stop the client for good. Shutting down twice does nothing.
    pub fn shutdown(&self) {
        self.detach();
        let listener = {
            let mut state = self.inner.state.lock();
            if state.lifecycle == ViewClientState::Stopped {
                return;
            }
            state.lifecycle = ViewClientState::Stopped;
            state.listener.take()
        };
        if let Some(processor) = self.inner.processor.upgrade() {
            processor.remove_client(self.inner.id);
        }
        tracing::debug!(client = %self.inner.id, "view client shut down");
        if let Some(listener) = listener {
            listener.client_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ViewClient>();
    }

    #[test]
    fn test_full_then_delta_switches_after_first_full() {
        let mode = ViewResultMode::FullThenDelta;
        assert_eq!(mode.select(None, None, false), (None, None));
        assert_eq!(ViewResultMode::None.select(None, None, true), (None, None));
        assert_eq!(ViewResultMode::default(), ViewResultMode::FullOnly);
    }
}
