//! View-Flow: a live, incrementally recomputing view evaluation engine.
//!
//! A *view* is a set of dependency graphs, one per calculation configuration, compiled from a
//! view definition. A [`ViewProcess`] evaluates the view in *cycles*: each cycle snapshots
//! market data, works out which nodes are affected by what changed since the previous cycle,
//! recomputes only those (dispatching calculation jobs to local or remote invokers), and
//! publishes full and delta results to attached [`ViewClient`]s.
//!
//! # Key Features
//!
//! - **Incremental cycles**: unchanged nodes carry their previous values forward
//! - **Fault isolation**: a failing function marks its outputs missing; siblings still compute
//! - **Invoker failover**: jobs refused by one invoker are retried on another
//! - **Automatic recompilation**: a view is recompiled when it is no longer valid for the
//!   valuation time or the deployed functions changed, and clients hear about it first
//! - **Result modes**: full, delta, both, or nothing, with merging while a client is paused
//! - **Observability**: the [`ViewTracer`] API, with `tracing` and recording implementations
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use view_flow::{ExecutionOptions, InMemoryMarketDataProvider, ResultCollector, ViewProcessor};
//!
//! let market_data = Arc::new(InMemoryMarketDataProvider::new());
//! let processor = ViewProcessor::builder(Arc::new(compiler), market_data.clone())
//!     .functions(functions)
//!     .build()?;
//!
//! let results = Arc::new(ResultCollector::new());
//! let client = processor.create_view_client();
//! client.set_result_listener(Some(results.clone()))?;
//! client.attach_to_view_process("Risk".into(), ExecutionOptions::infinite())?;
//!
//! market_data.set_value(spot_requirement, 101.5);
//! ```

#![warn(missing_docs)]

mod cache;
mod client;
mod compile;
mod config;
mod cycle;
mod delta;
mod dispatch;
mod error;
mod execution;
mod function;
mod graph;
mod id;
mod invoker;
mod job;
mod listener;
mod market_data;
mod process;
mod processor;
mod result;
pub mod tracer;
mod value;
mod worker;

pub use cache::{ComputationCache, ComputationCacheSource};
pub use client::{ViewClient, ViewClientState, ViewResultMode};
pub use compile::{CompiledView, CompiledViewBuilder, ViewCompiler};
pub use config::ViewProcessorConfig;
pub use cycle::{CycleType, NodeExecutionState, SingleComputationCycle, ViewCycleState};
pub use delta::{
    DeltaComparer, DeltaDefinition, DeltaPartition, LiveDataDeltaCalculator, NumberDeltaComparer,
};
pub use dispatch::{CancellationToken, GraphExecution, GraphExecutionOutcome, JobDispatcher};
pub use error::{
    CacheError, CompilationError, CycleError, DispatchError, GraphError, InvokerError, ViewError,
};
pub use execution::{ExecutionFlags, ExecutionOptions, ExecutionSequence};
pub use function::{CalculationFunction, FunctionInvocation, FunctionRegistry};
pub use graph::{DependencyGraph, DependencyNode, DependencyNodeBuilder, NodeId};
pub use id::{CycleId, FunctionInitId, JobId, ViewClientId, ViewDefinitionId, ViewProcessId};
pub use invoker::{execute_job, JobInvoker, LocalJobInvoker};
pub use job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpecification, FailureKind, JobOutcome, JobResultSender, NodeFailure,
};
pub use listener::{CycleMetadata, ListenerEvent, ResultCollector, ViewResultListener};
pub use market_data::{
    InMemoryMarketDataProvider, MarketDataListener, MarketDataProvider, MarketDataSnapshot,
};
pub use process::{ViewProcess, ViewProcessState};
pub use processor::{ViewProcessor, ViewProcessorBuilder};
pub use result::{
    ComputedValueResult, ResultHeader, ViewCalculationResultModel, ViewComputationResultModel,
    ViewDeltaResultModel, ViewResultModel,
};
pub use tracer::{LoggingTracer, NoopTracer, RecordingTracer, ViewEvent, ViewTracer};
pub use value::{
    ComputedValue, FunctionId, MissingValue, TargetSpecification, TargetType, Value,
    ValueProperties, ValueRequirement, ValueSpecification,
};
