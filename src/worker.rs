//! The per-process cycle loop.
//!
//! Each process runs [`run`] on its own thread. The loop waits for the next cycle to become
//! due, obtains a compiled view valid for the cycle's valuation time, executes the cycle and
//! publishes its result, until the sequence runs out or the process is stopped.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::compile::CompiledView;
use crate::cycle::{CycleServices, CycleType, SingleComputationCycle};
use crate::dispatch::CancellationToken;
use crate::error::{CycleError, ViewError};
use crate::execution::ExecutionSequence;
use crate::id::{CycleId, FunctionInitId};
use crate::listener::CycleMetadata;
use crate::process::{ProcessInner, ViewProcessState};
use crate::value::ValueRequirement;

#[derive(Debug, Default)]
struct GateState {
    suspended: bool,
    active: usize,
}

/// Holds off new cycles across every process while the processor is suspended.
#[derive(Debug, Default)]
pub(crate) struct SuspensionGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// A cycle admitted through the gate. Dropping it lets a pending suspension proceed.
pub(crate) struct GatePermit<'a> {
    gate: &'a SuspensionGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.active -= 1;
        drop(state);
        self.gate.changed.notify_all();
    }
}

impl SuspensionGate {
    /// Wait until not suspended. Returns None if `cancel` fires first.
    pub fn enter(&self, cancel: &CancellationToken) -> Option<GatePermit<'_>> {
        let mut state = self.state.lock();
        while state.suspended {
            if cancel.is_cancelled() {
                return None;
            }
            self.changed.wait(&mut state);
        }
        if cancel.is_cancelled() {
            return None;
        }
        state.active += 1;
        Some(GatePermit { gate: self })
    }

    /// Stop admitting cycles and wait for admitted ones to drain.
    ///
    /// Returns false if already suspended.
    pub fn suspend(&self) -> bool {
        let mut state = self.state.lock();
        if state.suspended {
            return false;
        }
        state.suspended = true;
        while state.active > 0 {
            self.changed.wait(&mut state);
        }
        true
    }

    /// Admit cycles again. Returns false if not suspended.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        if !state.suspended {
            return false;
        }
        state.suspended = false;
        drop(state);
        self.changed.notify_all();
        true
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    /// Wake waiters so they can observe cancellation.
    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }
}

struct ProcessWorker {
    process: Arc<ProcessInner>,
    sequence: ExecutionSequence,
    compiled: Option<(Arc<CompiledView>, FunctionInitId)>,
    previous: Option<SingleComputationCycle>,
    successive_delta_cycles: u32,
    last_cycle_started: Option<Instant>,
}

/// Body of a process thread.
pub(crate) fn run(process: Arc<ProcessInner>) {
    let sequence = process.options.sequence.clone();
    let mut worker = ProcessWorker {
        process,
        sequence,
        compiled: None,
        previous: None,
        successive_delta_cycles: 0,
        last_cycle_started: None,
    };
    worker.run();
    worker.release();
}

impl ProcessWorker {
    fn run(&mut self) {
        let context = self.process.context.clone();
        loop {
            if !self.wait_for_next_cycle() {
                return;
            }
            let Some(instant) = self.sequence.next() else {
                self.process.complete();
                return;
            };
            let valuation_time = instant.unwrap_or_else(SystemTime::now);

            let Some(permit) = context.gate.enter(&self.process.cancel) else {
                return;
            };
            self.last_cycle_started = Some(Instant::now());
            if let Some(compiled) = self.obtain_compiled(valuation_time) {
                if !self.process.options.flags.compile_only {
                    self.execute_cycle(compiled, valuation_time);
                }
            }
            drop(permit);

            if self.process.state().is_terminal() || self.process.cancel.is_cancelled() {
                return;
            }
            if self.sequence.is_empty() {
                self.process.complete();
                return;
            }
        }
    }

    /// Block until the next cycle is due. Returns false once the process is stopped.
    fn wait_for_next_cycle(&self) -> bool {
        let options = &self.process.options;
        let mut signals = self.process.signals.lock();
        if !self.sequence.is_live() {
            return !signals.terminated;
        }
        let periodic = matches!(self.sequence, ExecutionSequence::Infinite);
        loop {
            if signals.terminated {
                return false;
            }
            let now = Instant::now();
            let triggered = signals.cycle_triggered || signals.market_data_changed;
            let due = match self.last_cycle_started {
                None => !options.flags.wait_for_initial_trigger,
                Some(last) => periodic && now >= last + options.max_cycle_period,
            };
            if triggered || due {
                if let Some(last) = self.last_cycle_started {
                    let earliest = last + options.min_cycle_period;
                    if now < earliest {
                        self.process.wake.wait_until(&mut signals, earliest);
                        continue;
                    }
                }
                signals.cycle_triggered = false;
                signals.market_data_changed = false;
                return true;
            }
            match self.last_cycle_started {
                Some(last) if periodic => {
                    self.process
                        .wake
                        .wait_until(&mut signals, last + options.max_cycle_period);
                }
                _ => self.process.wake.wait(&mut signals),
            }
        }
    }

    /// Reuse the held compiled view if it is still usable, otherwise recompile.
    ///
    /// Returns None when the cycle must be skipped.
    fn obtain_compiled(&mut self, valuation_time: SystemTime) -> Option<Arc<CompiledView>> {
        let process = self.process.clone();
        let context = &process.context;
        let rebuild = std::mem::take(&mut process.signals.lock().graph_rebuild);
        let function_init_id = context.compiler.function_init_id();

        if let Some((compiled, compiled_against)) = &self.compiled {
            if !rebuild
                && *compiled_against == function_init_id
                && compiled.is_valid_for(valuation_time)
            {
                return Some(compiled.clone());
            }
        }

        match context
            .compiler
            .compile(&process.definition_id, valuation_time)
        {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                context.tracer.on_view_compiled(
                    process.id,
                    compiled.function_init_id(),
                    compiled.node_count(),
                );
                tracing::info!(
                    process = %process.id,
                    nodes = compiled.node_count(),
                    function_init_id = %compiled.function_init_id(),
                    "view compiled"
                );
                self.compiled = Some((compiled.clone(), function_init_id));
                process.mark_running();
                process.publish_compiled(&compiled);
                Some(compiled)
            }
            Err(error) => {
                context
                    .tracer
                    .on_compilation_failed(process.id, error.message());
                tracing::warn!(process = %process.id, error = %error, "view compilation failed");
                if rebuild {
                    process.signals.lock().graph_rebuild = true;
                }
                process.deliver(|listener| {
                    listener.view_definition_compilation_failed(valuation_time, &error)
                });
                if self.compiled.is_none() {
                    process.terminate();
                }
                None
            }
        }
    }

    fn cycle_type(&self, compiled: &Arc<CompiledView>) -> CycleType {
        let Some(previous) = &self.previous else {
            return CycleType::Full;
        };
        if !Arc::ptr_eq(previous.compiled_view(), compiled) {
            return CycleType::Full;
        }
        match self.process.options.max_successive_delta_cycles {
            Some(max) if self.successive_delta_cycles >= max => CycleType::Full,
            _ => CycleType::Delta,
        }
    }

    fn execute_cycle(&mut self, compiled: Arc<CompiledView>, valuation_time: SystemTime) {
        let process = self.process.clone();
        let context = &process.context;
        let cycle_id = CycleId(context.cycle_ids.next_raw());
        let cycle_type = self.cycle_type(&compiled);

        let requirements = compiled.market_data_requirements();
        if process.options.flags.await_market_data && !self.await_market_data(&requirements) {
            if process.cancel.is_cancelled() {
                return;
            }
            tracing::warn!(
                process = %process.id,
                cycle = %cycle_id,
                "market data incomplete after waiting; running with what is available"
            );
        }
        let snapshot = context.market_data.snapshot(&requirements);

        let metadata = CycleMetadata {
            process_id: process.id,
            cycle_id,
            valuation_time,
            cycle_type,
        };
        context
            .tracer
            .on_cycle_started(process.id, cycle_id, valuation_time, cycle_type);
        tracing::debug!(process = %process.id, cycle = %cycle_id, ?cycle_type, "cycle started");
        process.executing.store(true, Ordering::Release);
        process.deliver(|listener| listener.cycle_started(&metadata));

        let mut cycle = SingleComputationCycle::new(
            cycle_id,
            process.id,
            compiled,
            valuation_time,
            cycle_type,
        );
        let services = CycleServices {
            cache_source: &context.cache_source,
            dispatcher: &context.dispatcher,
            delta_definition: &context.delta_definition,
            tracer: context.tracer.as_ref(),
        };
        let outcome = cycle.execute(self.previous.as_ref(), &snapshot, &services, &process.cancel);
        process.executing.store(false, Ordering::Release);

        match outcome {
            Ok(()) => {
                let duration = cycle.duration().unwrap_or_default();
                context
                    .tracer
                    .on_cycle_completed(process.id, cycle_id, duration);
                tracing::debug!(process = %process.id, cycle = %cycle_id, ?duration, "cycle completed");
                if let Some(result) = cycle.result_model() {
                    process.publish_result(result.clone());
                }
                self.successive_delta_cycles = match cycle_type {
                    CycleType::Delta => self.successive_delta_cycles + 1,
                    CycleType::Full => 0,
                };
                if let Some(older) = self.previous.replace(cycle) {
                    context.cache_source.release_caches(older.id());
                }
            }
            Err(CycleError::Interrupted(_)) => {
                context.tracer.on_cycle_discarded(process.id, cycle_id);
                tracing::debug!(process = %process.id, cycle = %cycle_id, "cycle interrupted");
                context.cache_source.release_caches(cycle_id);
            }
            Err(error) => {
                tracing::error!(process = %process.id, cycle = %cycle_id, error = %error, "cycle failed");
                context.cache_source.release_caches(cycle_id);
                let error = ViewError::Cycle(error);
                process.deliver(|listener| listener.cycle_execution_failed(&metadata, &error));
            }
        }
    }

    /// Wait for every requirement up to the configured timeout, in slices so a stop is
    /// noticed promptly.
    fn await_market_data(&self, requirements: &BTreeSet<ValueRequirement>) -> bool {
        let context = &self.process.context;
        let deadline = Instant::now() + context.config.market_data_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(context.config.result_poll_interval);
            if context.market_data.await_values(requirements, slice) {
                return true;
            }
            if self.process.cancel.is_cancelled() || Instant::now() >= deadline {
                return false;
            }
        }
    }

    fn release(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.process
                .context
                .cache_source
                .release_caches(previous.id());
        }
        tracing::debug!(
            process = %self.process.id,
            finished = self.process.state() == ViewProcessState::Finished,
            "view process thread exiting"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_suspend_waits_for_active_cycles() {
        let gate = Arc::new(SuspensionGate::default());
        let cancel = CancellationToken::new();
        let permit = gate.enter(&cancel).unwrap();

        let suspended = Arc::new(AtomicBool::new(false));
        let handle = {
            let gate = gate.clone();
            let suspended = suspended.clone();
            std::thread::spawn(move || {
                assert!(gate.suspend());
                suspended.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!suspended.load(Ordering::SeqCst));
        drop(permit);
        handle.join().unwrap();
        assert!(suspended.load(Ordering::SeqCst));
        assert!(gate.is_suspended());
        assert!(!gate.suspend());
        assert!(gate.resume());
        assert!(!gate.resume());
    }

    #[test]
    fn test_cancelled_waiter_leaves_gate() {
        let gate = Arc::new(SuspensionGate::default());
        assert!(gate.suspend());
        let cancel = CancellationToken::new();
        let handle = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || gate.enter(&cancel).is_none())
        };
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        gate.wake_all();
        assert!(handle.join().unwrap());
    }
}
