//! Job dispatch: turns the changed part of a graph into jobs and collects their results.
//!
//! Nodes become ready once every input they need from this run is resolved. Ready nodes are
//! batched into jobs of independent items and handed to the least-loaded available
//! [`JobInvoker`]. Results are written into the cycle's cache as they arrive; failures are
//! written as [`MissingValue`](crate::MissingValue) markers and their dependents are failed
//! without being executed.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::cache::ComputationCache;
use crate::error::DispatchError;
use crate::graph::{DependencyGraph, NodeId};
use crate::id::{CycleId, IdGenerator, JobId, ViewProcessId};
use crate::invoker::JobInvoker;
use crate::job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobSpecification,
    FailureKind, JobOutcome, NodeFailure,
};
use crate::tracer::{NoopTracer, ViewTracer};
use crate::value::{ComputedValue, MissingValue, Value};

/// Shared flag telling in-flight work to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Request to execute part of one graph within one cycle.
pub struct GraphExecution<'a> {
    /// Process running the cycle.
    pub process_id: ViewProcessId,
    /// Cycle being executed.
    pub cycle_id: CycleId,
    /// Valuation time of the cycle.
    pub valuation_time: SystemTime,
    /// The graph.
    pub graph: &'a DependencyGraph,
    /// Nodes to execute. Inputs outside this set are read from the caches.
    pub nodes: &'a BTreeSet<NodeId>,
    /// Cache of the current cycle; results are written here.
    pub cache: &'a ComputationCache,
    /// Cache of the previous cycle, consulted for inputs the current cache lacks.
    pub previous_cache: Option<&'a ComputationCache>,
    /// Cancellation of the owning cycle.
    pub cancel: &'a CancellationToken,
}

/// What happened to the requested nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphExecutionOutcome {
    /// Nodes whose function ran successfully.
    pub executed: BTreeSet<NodeId>,
    /// Nodes that failed, including those failed because an input failed.
    pub failures: BTreeMap<NodeId, NodeFailure>,
    /// Number of jobs dispatched, retries included.
    pub jobs: usize,
}

struct InvokerSlot {
    invoker: Arc<dyn JobInvoker>,
    outstanding: AtomicUsize,
}

struct OutstandingJob {
    job: CalculationJob,
    slot: usize,
    tried: Vec<usize>,
    deadline: Option<Instant>,
}

/// Dispatches graph execution to a set of invokers.
///
/// One dispatcher is shared by every process of a processor.
pub struct JobDispatcher {
    invokers: Vec<InvokerSlot>,
    max_job_items: usize,
    job_timeout: Option<Duration>,
    poll_interval: Duration,
    job_ids: IdGenerator,
    tracer: Arc<dyn ViewTracer>,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field(
                "invokers",
                &self
                    .invokers
                    .iter()
                    .map(|slot| slot.invoker.id())
                    .collect::<Vec<_>>(),
            )
            .field("max_job_items", &self.max_job_items)
            .field("job_timeout", &self.job_timeout)
            .finish()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<JobDispatcher>();
    assert_sync::<JobDispatcher>();
}

impl Default for JobDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl JobDispatcher {
    /// Create a dispatcher with no invokers.
    pub fn new() -> Self {
        Self {
            invokers: Vec::new(),
            max_job_items: 64,
            job_timeout: None,
            poll_interval: Duration::from_millis(50),
            job_ids: IdGenerator::new(),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Add an invoker.
    pub fn with_invoker(mut self, invoker: Arc<dyn JobInvoker>) -> Self {
        self.invokers.push(InvokerSlot {
            invoker,
            outstanding: AtomicUsize::new(0),
        });
        self
    }

    /// Maximum number of nodes per job.
    pub fn with_max_job_items(mut self, max_job_items: usize) -> Self {
        self.max_job_items = max_job_items.max(1);
        self
    }

    /// Fail jobs whose results do not arrive within `timeout`.
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// How often waiting for results checks for cancellation.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the tracer.
    pub fn with_tracer(mut self, tracer: Arc<dyn ViewTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Number of registered invokers.
    pub fn invoker_count(&self) -> usize {
        self.invokers.len()
    }

    /// Execute the requested nodes, blocking until every one of them is resolved.
    pub fn execute(
        &self,
        execution: GraphExecution<'_>,
    ) -> Result<GraphExecutionOutcome, DispatchError> {
        if execution.nodes.is_empty() {
            return Ok(GraphExecutionOutcome::default());
        }
        if self.invokers.is_empty() {
            return Err(DispatchError::NoInvokers);
        }

        let (sender, receiver) = unbounded();
        let mut run = DispatchRun::new(self, &execution, sender);
        let result = run.run(&receiver);
        // Whatever is still outstanding is abandoned; its results land on a dropped channel.
        for job in run.outstanding.values() {
            self.invokers[job.slot]
                .outstanding
                .fetch_sub(1, Ordering::AcqRel);
        }
        result.map(|()| run.outcome)
    }

    fn next_job_id(&self) -> JobId {
        JobId(self.job_ids.next_raw())
    }

    fn pick_invoker(&self, tried: &[usize]) -> Option<usize> {
        self.invokers
            .iter()
            .enumerate()
            .filter(|(index, slot)| !tried.contains(index) && slot.invoker.is_available())
            .min_by_key(|(_, slot)| slot.outstanding.load(Ordering::Acquire))
            .map(|(index, _)| index)
    }
}

struct DispatchRun<'d, 'a> {
    dispatcher: &'d JobDispatcher,
    execution: &'d GraphExecution<'a>,
    sender: Sender<JobOutcome>,
    unresolved_inputs: HashMap<NodeId, usize>,
    ready: VecDeque<NodeId>,
    remaining: usize,
    outstanding: HashMap<JobId, OutstandingJob>,
    outcome: GraphExecutionOutcome,
}

impl<'d, 'a> DispatchRun<'d, 'a> {
    fn new(
        dispatcher: &'d JobDispatcher,
        execution: &'d GraphExecution<'a>,
        sender: Sender<JobOutcome>,
    ) -> Self {
        let mut unresolved_inputs = HashMap::new();
        let mut ready = VecDeque::new();
        for &node in execution.nodes {
            let pending = execution
                .graph
                .inputs(node)
                .filter(|input| execution.nodes.contains(input))
                .count();
            if pending == 0 {
                ready.push_back(node);
            } else {
                unresolved_inputs.insert(node, pending);
            }
        }
        Self {
            dispatcher,
            execution,
            sender,
            unresolved_inputs,
            ready,
            remaining: execution.nodes.len(),
            outstanding: HashMap::new(),
            outcome: GraphExecutionOutcome::default(),
        }
    }

    fn run(&mut self, receiver: &Receiver<JobOutcome>) -> Result<(), DispatchError> {
        while self.remaining > 0 {
            if self.execution.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let items = self.collect_ready_items()?;
            for chunk in items.chunks(self.dispatcher.max_job_items) {
                self.submit_new(chunk.to_vec())?;
            }

            if self.remaining == 0 {
                break;
            }
            if self.outstanding.is_empty() && self.ready.is_empty() {
                // Only reachable if the requested set is not closed under the graph's edges.
                let stuck: Vec<NodeId> = self.unresolved_inputs.keys().copied().collect();
                if stuck.is_empty() {
                    break;
                }
                for node in stuck {
                    self.fail_node(
                        node,
                        NodeFailure::new(FailureKind::UpstreamFailed, "inputs never resolved"),
                    )?;
                }
                continue;
            }
            if !self.ready.is_empty() {
                continue;
            }

            let wait = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .map_or(self.dispatcher.poll_interval, |until| {
                    until.min(self.dispatcher.poll_interval)
                });
            match receiver.recv_timeout(wait) {
                Ok(outcome) => self.handle_outcome(outcome)?,
                Err(RecvTimeoutError::Timeout) => self.expire_jobs()?,
                Err(RecvTimeoutError::Disconnected) => return Err(DispatchError::Cancelled),
            }
        }
        Ok(())
    }

    /// Drain the ready queue, failing nodes whose inputs failed and returning the rest as
    /// job items.
    fn collect_ready_items(&mut self) -> Result<Vec<CalculationJobItem>, DispatchError> {
        let mut items = Vec::new();
        while let Some(node_id) = self.ready.pop_front() {
            let graph = self.execution.graph;
            let Some(node) = graph.node(node_id) else {
                self.fail_node(
                    node_id,
                    NodeFailure::new(FailureKind::UpstreamFailed, "node not in graph"),
                )?;
                continue;
            };

            let mut inputs = Vec::with_capacity(node.input_values().len());
            let mut failed_input = None;
            for spec in node.input_values() {
                let value = self.execution.cache.get_value(spec).or_else(|| {
                    self.execution
                        .previous_cache
                        .and_then(|previous| previous.get_value(spec))
                });
                match value {
                    Some(Value::Missing(missing)) => {
                        failed_input = Some(format!("input {} is missing: {}", spec, missing));
                        break;
                    }
                    Some(value) => inputs.push(ComputedValue::new(spec.clone(), value)),
                    None => {
                        failed_input = Some(format!("input {} is unavailable", spec));
                        break;
                    }
                }
            }

            if let Some(reason) = failed_input {
                self.fail_node(node_id, NodeFailure::new(FailureKind::UpstreamFailed, reason))?;
                continue;
            }
            items.push(CalculationJobItem {
                node: node_id,
                function: node.function().clone(),
                target: node.target().clone(),
                inputs,
                outputs: node.outputs().iter().cloned().collect(),
            });
        }
        Ok(items)
    }

    fn submit_new(&mut self, items: Vec<CalculationJobItem>) -> Result<(), DispatchError> {
        let job = CalculationJob {
            specification: CalculationJobSpecification {
                job_id: self.dispatcher.next_job_id(),
                process_id: self.execution.process_id,
                cycle_id: self.execution.cycle_id,
                calculation_configuration: self.execution.graph.calculation_configuration().clone(),
                valuation_time: self.execution.valuation_time,
            },
            items,
        };
        self.submit(job, Vec::new())
    }

    fn submit(&mut self, job: CalculationJob, mut tried: Vec<usize>) -> Result<(), DispatchError> {
        let job_id = job.specification.job_id;
        while let Some(index) = self.dispatcher.pick_invoker(&tried) {
            tried.push(index);
            let slot = &self.dispatcher.invokers[index];
            slot.outstanding.fetch_add(1, Ordering::AcqRel);
            match slot.invoker.invoke(job.clone(), self.sender.clone()) {
                Ok(()) => {
                    self.outcome.jobs += 1;
                    self.dispatcher
                        .tracer
                        .on_job_dispatched(job_id, slot.invoker.id(), job.items.len());
                    let deadline = self
                        .dispatcher
                        .job_timeout
                        .map(|timeout| Instant::now() + timeout);
                    self.outstanding.insert(
                        job_id,
                        OutstandingJob {
                            job,
                            slot: index,
                            tried,
                            deadline,
                        },
                    );
                    return Ok(());
                }
                Err(err) => {
                    slot.outstanding.fetch_sub(1, Ordering::AcqRel);
                    tracing::warn!(job = %job_id, error = %err, "invoker refused job");
                    self.dispatcher.tracer.on_job_retried(job_id, slot.invoker.id());
                }
            }
        }

        tracing::warn!(job = %job_id, "no invoker available for job");
        let failure = NodeFailure::new(
            FailureKind::InvokerUnavailable,
            "no calculation invoker available",
        );
        for item in job.items {
            self.fail_node(item.node, failure.clone())?;
        }
        Ok(())
    }

    fn handle_outcome(&mut self, outcome: JobOutcome) -> Result<(), DispatchError> {
        let Some(outstanding) = self.outstanding.remove(&outcome.job_id()) else {
            tracing::debug!(job = %outcome.job_id(), "ignoring result of abandoned job");
            return Ok(());
        };
        let slot = &self.dispatcher.invokers[outstanding.slot];
        slot.outstanding.fetch_sub(1, Ordering::AcqRel);

        match outcome {
            JobOutcome::Completed(result) => {
                self.dispatcher.tracer.on_job_completed(
                    result.specification.job_id,
                    &result.invoker,
                    result.duration,
                );
                self.apply_result(&outstanding.job, result)
            }
            JobOutcome::InvokerFailed {
                job_id,
                invoker,
                message,
            } => {
                tracing::warn!(job = %job_id, %invoker, %message, "invoker failed mid-job");
                self.dispatcher.tracer.on_job_retried(job_id, &invoker);
                self.submit(outstanding.job, outstanding.tried)
            }
        }
    }

    fn apply_result(
        &mut self,
        job: &CalculationJob,
        result: CalculationJobResult,
    ) -> Result<(), DispatchError> {
        let mut results: HashMap<NodeId, _> = result
            .items
            .into_iter()
            .map(|item| (item.node, item.outcome))
            .collect();
        for item in &job.items {
            match results.remove(&item.node) {
                Some(Ok(values)) => {
                    let mut produced: HashMap<_, _> = values
                        .into_iter()
                        .map(|value| (value.specification, value.value))
                        .collect();
                    let values = item.outputs.iter().map(|spec| {
                        let value = produced
                            .remove(spec)
                            .unwrap_or(Value::Missing(MissingValue::NotProduced));
                        ComputedValue::new(spec.clone(), value)
                    });
                    self.execution.cache.put_shared_values(values)?;
                    self.outcome.executed.insert(item.node);
                    self.resolve(item.node);
                }
                Some(Err(failure)) => self.fail_node(item.node, failure)?,
                None => self.fail_node(
                    item.node,
                    NodeFailure::new(FailureKind::FunctionFailed, "invoker returned no result"),
                )?,
            }
        }
        Ok(())
    }

    fn expire_jobs(&mut self) -> Result<(), DispatchError> {
        let now = Instant::now();
        let expired: Vec<JobId> = self
            .outstanding
            .iter()
            .filter(|(_, job)| job.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        for job_id in expired {
            let Some(outstanding) = self.outstanding.remove(&job_id) else {
                continue;
            };
            let slot = &self.dispatcher.invokers[outstanding.slot];
            slot.outstanding.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(job = %job_id, invoker = slot.invoker.id(), "job timed out");
            let failure = NodeFailure::new(FailureKind::TimedOut, "job timed out");
            for item in outstanding.job.items {
                self.fail_node(item.node, failure.clone())?;
            }
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.values().filter_map(|job| job.deadline).min()
    }

    fn fail_node(&mut self, node: NodeId, failure: NodeFailure) -> Result<(), DispatchError> {
        if self.outcome.failures.contains_key(&node) || self.outcome.executed.contains(&node) {
            return Ok(());
        }
        if let Some(spec) = self.execution.graph.node(node) {
            let marker = Value::Missing(failure.to_missing_value());
            self.execution.cache.put_shared_values(
                spec.outputs()
                    .iter()
                    .map(|output| ComputedValue::new(output.clone(), marker.clone())),
            )?;
        }
        self.dispatcher.tracer.on_node_failed(
            self.execution.cycle_id,
            self.execution.graph.calculation_configuration(),
            node,
            &failure,
        );
        self.outcome.failures.insert(node, failure);
        self.unresolved_inputs.remove(&node);
        self.resolve(node);
        Ok(())
    }

    fn resolve(&mut self, node: NodeId) {
        self.remaining = self.remaining.saturating_sub(1);
        for dependent in self.execution.graph.dependents(node) {
            if let Some(pending) = self.unresolved_inputs.get_mut(&dependent) {
                *pending -= 1;
                if *pending == 0 {
                    self.unresolved_inputs.remove(&dependent);
                    self.ready.push_back(dependent);
                }
            }
        }
    }
}
