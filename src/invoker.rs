//! Job invokers: where calculation jobs actually run.
//!
//! [`JobInvoker`] is the seam between the dispatcher and calculation workers. The
//! [`LocalJobInvoker`] runs jobs on an in-process thread pool; remote invokers implement the
//! same trait over whatever transport they use and report back through the same channel.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::Context;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::error::InvokerError;
use crate::function::{FunctionInvocation, FunctionRegistry};
use crate::job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    FailureKind, JobOutcome, JobResultSender, NodeFailure,
};
use crate::value::ComputedValue;

/// Accepts calculation jobs and reports their outcomes asynchronously.
pub trait JobInvoker: Send + Sync + 'static {
    /// Stable identifier, used for logging and retry bookkeeping.
    fn id(&self) -> &str;

    /// Returns false when the invoker should not be offered new work.
    fn is_available(&self) -> bool {
        true
    }

    /// Accept a job.
    ///
    /// On success the invoker must eventually send exactly one [`JobOutcome`] for the job on
    /// `results`. Returning an error means the job was not accepted and may go elsewhere.
    fn invoke(&self, job: CalculationJob, results: JobResultSender) -> Result<(), InvokerError>;
}

/// Run every item of a job against a function registry.
///
/// Function errors and panics become per-item failures.
pub fn execute_job(
    job: &CalculationJob,
    registry: &FunctionRegistry,
    invoker: &Arc<str>,
) -> CalculationJobResult {
    let started = Instant::now();
    let items = job
        .items
        .iter()
        .map(|item| CalculationJobResultItem {
            node: item.node,
            outcome: execute_item(item, registry, job),
        })
        .collect();
    CalculationJobResult {
        specification: job.specification.clone(),
        items,
        duration: started.elapsed(),
        invoker: invoker.clone(),
    }
}

fn execute_item(
    item: &CalculationJobItem,
    registry: &FunctionRegistry,
    job: &CalculationJob,
) -> Result<Vec<ComputedValue>, NodeFailure> {
    let function = registry.get(&item.function).ok_or_else(|| {
        NodeFailure::new(
            FailureKind::FunctionNotFound,
            format!("no function registered as {}", item.function),
        )
    })?;
    let invocation = FunctionInvocation {
        target: &item.target,
        inputs: &item.inputs,
        desired_outputs: &item.outputs,
        valuation_time: job.specification.valuation_time,
    };
    match panic::catch_unwind(AssertUnwindSafe(|| function.execute(&invocation))) {
        Ok(Ok(values)) => Ok(values),
        Ok(Err(err)) => Err(NodeFailure::new(
            FailureKind::FunctionFailed,
            format!("{:#}", err),
        )),
        Err(payload) => Err(NodeFailure::new(
            FailureKind::FunctionFailed,
            format!("function panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

struct QueuedJob {
    job: CalculationJob,
    results: JobResultSender,
}

/// Runs jobs on a pool of in-process worker threads.
pub struct LocalJobInvoker {
    id: Arc<str>,
    queue: Mutex<Option<Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalJobInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalJobInvoker")
            .field("id", &self.id)
            .field("threads", &self.workers.lock().len())
            .finish()
    }
}

impl LocalJobInvoker {
    /// Start `threads` worker threads executing against `registry`.
    pub fn new(
        id: impl Into<Arc<str>>,
        threads: usize,
        registry: Arc<FunctionRegistry>,
    ) -> anyhow::Result<Self> {
        let id: Arc<str> = id.into();
        let (sender, receiver) = unbounded::<QueuedJob>();
        let mut workers = Vec::with_capacity(threads.max(1));

        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let registry = registry.clone();
            let invoker = id.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", id, i))
                .spawn(move || {
                    for QueuedJob { job, results } in receiver.iter() {
                        let result = execute_job(&job, &registry, &invoker);
                        tracing::trace!(
                            job = %result.specification.job_id,
                            items = result.items.len(),
                            duration = ?result.duration,
                            "local job finished"
                        );
                        // The dispatcher drops its receiver once a cycle is cancelled.
                        let _ignored = results.send(JobOutcome::Completed(result));
                    }
                })
                .with_context(|| format!("failed to spawn calculation worker {}-{}", id, i))?;
            workers.push(handle);
        }

        Ok(Self {
            id,
            queue: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Number of jobs waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().as_ref().map_or(0, |queue| queue.len())
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub fn shutdown(&self) {
        self.queue.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!(invoker = %self.id, "calculation worker panicked");
            }
        }
    }
}

impl Drop for LocalJobInvoker {
    fn drop(&mut self) {
        self.queue.lock().take();
    }
}

impl JobInvoker for LocalJobInvoker {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_available(&self) -> bool {
        self.queue.lock().is_some()
    }

    fn invoke(&self, job: CalculationJob, results: JobResultSender) -> Result<(), InvokerError> {
        let queue = self.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return Err(InvokerError::Shutdown {
                invoker: self.id.clone(),
            });
        };
        queue
            .send(QueuedJob { job, results })
            .map_err(|_| InvokerError::Shutdown {
                invoker: self.id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;
    use crate::id::{CycleId, JobId, ViewProcessId};
    use crate::job::CalculationJobSpecification;
    use crate::value::{TargetSpecification, ValueSpecification};
    use std::time::{Duration, SystemTime};

    fn job(functions: &[&str]) -> CalculationJob {
        let target = TargetSpecification::primitive("T");
        CalculationJob {
            specification: CalculationJobSpecification {
                job_id: JobId(1),
                process_id: ViewProcessId(1),
                cycle_id: CycleId(1),
                calculation_configuration: "Default".into(),
                valuation_time: SystemTime::UNIX_EPOCH,
            },
            items: functions
                .iter()
                .enumerate()
                .map(|(i, function)| CalculationJobItem {
                    node: NodeId(i),
                    function: (*function).into(),
                    target: target.clone(),
                    inputs: vec![],
                    outputs: vec![ValueSpecification::new(
                        format!("V{}", i),
                        target.clone(),
                        (*function).into(),
                    )],
                })
                .collect(),
        }
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry
            .register_fn("One", |invocation: &FunctionInvocation<'_>| {
                Ok(invocation.each_output(1.0))
            })
            .register_fn("Fails", |_: &FunctionInvocation<'_>| {
                Err(anyhow::anyhow!("bad curve"))
            })
            .register_fn("Panics", |_: &FunctionInvocation<'_>| -> anyhow::Result<Vec<ComputedValue>> {
                panic!("division by zero")
            });
        registry
    }

    #[test]
    fn test_execute_job_isolates_failures() {
        let result = execute_job(
            &job(&["One", "Fails", "Panics", "Unknown"]),
            &registry(),
            &"local".into(),
        );
        assert!(result.items[0].outcome.is_ok());
        let kinds: Vec<_> = result.items[1..]
            .iter()
            .map(|item| item.outcome.as_ref().unwrap_err().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                FailureKind::FunctionFailed,
                FailureKind::FunctionFailed,
                FailureKind::FunctionNotFound
            ]
        );
        let panicked = result.items[2].outcome.as_ref().unwrap_err();
        assert!(panicked.message.contains("division by zero"));
    }

    #[test]
    fn test_local_invoker_reports_on_channel() {
        let invoker = LocalJobInvoker::new("local", 2, Arc::new(registry())).unwrap();
        let (sender, receiver) = unbounded();
        invoker.invoke(job(&["One"]), sender).unwrap();
        let outcome = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.job_id(), JobId(1));

        invoker.shutdown();
        assert!(!invoker.is_available());
        let (sender, _receiver) = unbounded();
        assert!(matches!(
            invoker.invoke(job(&["One"]), sender),
            Err(InvokerError::Shutdown { .. })
        ));
    }
}
