//! A single computation cycle.
//!
//! One cycle evaluates every graph of a compiled view at one valuation time:
//!
//! 1. create the cycle's caches, one per calculation configuration;
//! 2. write this cycle's market data into them, marking missing inputs explicitly;
//! 3. compute the delta against the previous cycle and carry unchanged values forward;
//! 4. dispatch the changed nodes;
//! 5. assemble the full result model and seal the caches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::cache::{ComputationCache, ComputationCacheSource};
use crate::compile::CompiledView;
use crate::delta::{DeltaDefinition, DeltaPartition, LiveDataDeltaCalculator};
use crate::dispatch::{CancellationToken, GraphExecution, JobDispatcher};
use crate::error::{CycleError, DispatchError};
use crate::graph::NodeId;
use crate::id::{CycleId, ViewProcessId};
use crate::job::NodeFailure;
use crate::market_data::MarketDataSnapshot;
use crate::result::{ResultHeader, ViewComputationResultModel};
use crate::tracer::ViewTracer;
use crate::value::{ComputedValue, MissingValue, Value};

/// Whether a cycle may reuse the previous cycle's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CycleType {
    /// Every node is recomputed.
    Full,
    /// Only changed nodes are recomputed.
    Delta,
}

/// Lifecycle of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewCycleState {
    /// Created, not yet started.
    AwaitingExecution,
    /// Running.
    Executing,
    /// Completed; caches are sealed and the result model is available.
    Executed,
    /// Stopped before completing; its values must not be used.
    ExecutionInterrupted,
}

/// What happened to a node in a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeExecutionState {
    /// Populated from market data.
    MarketData,
    /// Previous outputs were reused.
    CarriedForward,
    /// The function ran.
    Executed,
    /// The node failed.
    Failed(NodeFailure),
}

/// Services a cycle runs against.
pub(crate) struct CycleServices<'a> {
    pub cache_source: &'a ComputationCacheSource,
    pub dispatcher: &'a JobDispatcher,
    pub delta_definition: &'a DeltaDefinition,
    pub tracer: &'a dyn ViewTracer,
}

/// One evaluation of a compiled view at one valuation time.
pub struct SingleComputationCycle {
    id: CycleId,
    process_id: ViewProcessId,
    compiled: Arc<CompiledView>,
    valuation_time: SystemTime,
    cycle_type: CycleType,
    state: ViewCycleState,
    caches: BTreeMap<Arc<str>, Arc<ComputationCache>>,
    node_states: BTreeMap<Arc<str>, BTreeMap<NodeId, NodeExecutionState>>,
    duration: Option<Duration>,
    result: Option<Arc<ViewComputationResultModel>>,
}

impl std::fmt::Debug for SingleComputationCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleComputationCycle")
            .field("id", &self.id)
            .field("process_id", &self.process_id)
            .field("valuation_time", &self.valuation_time)
            .field("cycle_type", &self.cycle_type)
            .field("state", &self.state)
            .finish()
    }
}

impl SingleComputationCycle {
    pub(crate) fn new(
        id: CycleId,
        process_id: ViewProcessId,
        compiled: Arc<CompiledView>,
        valuation_time: SystemTime,
        cycle_type: CycleType,
    ) -> Self {
        Self {
            id,
            process_id,
            compiled,
            valuation_time,
            cycle_type,
            state: ViewCycleState::AwaitingExecution,
            caches: BTreeMap::new(),
            node_states: BTreeMap::new(),
            duration: None,
            result: None,
        }
    }

    /// The cycle id.
    pub fn id(&self) -> CycleId {
        self.id
    }

    /// Process running the cycle.
    pub fn process_id(&self) -> ViewProcessId {
        self.process_id
    }

    /// Compiled view the cycle evaluates.
    pub fn compiled_view(&self) -> &Arc<CompiledView> {
        &self.compiled
    }

    /// Valuation time.
    pub fn valuation_time(&self) -> SystemTime {
        self.valuation_time
    }

    /// Full or delta.
    pub fn cycle_type(&self) -> CycleType {
        self.cycle_type
    }

    /// Lifecycle state.
    pub fn state(&self) -> ViewCycleState {
        self.state
    }

    /// Execution time, once executed.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Cache of a calculation configuration.
    pub fn cache(&self, configuration: &str) -> Option<&Arc<ComputationCache>> {
        self.caches.get(configuration)
    }

    /// What happened to a node.
    pub fn node_state(&self, configuration: &str, node: NodeId) -> Option<&NodeExecutionState> {
        self.node_states.get(configuration)?.get(&node)
    }

    /// Failed nodes of a calculation configuration.
    pub fn failures(&self, configuration: &str) -> BTreeMap<NodeId, &NodeFailure> {
        self.node_states
            .get(configuration)
            .into_iter()
            .flatten()
            .filter_map(|(node, state)| match state {
                NodeExecutionState::Failed(failure) => Some((*node, failure)),
                _ => None,
            })
            .collect()
    }

    /// The full result, once executed.
    pub fn result_model(&self) -> Option<&Arc<ViewComputationResultModel>> {
        self.result.as_ref()
    }

    pub(crate) fn execute(
        &mut self,
        previous: Option<&SingleComputationCycle>,
        snapshot: &MarketDataSnapshot,
        services: &CycleServices<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), CycleError> {
        if self.state != ViewCycleState::AwaitingExecution {
            return Err(CycleError::AlreadyExecuted(self.id));
        }
        self.state = ViewCycleState::Executing;
        let started = Instant::now();

        let result = self.execute_graphs(previous, snapshot, services, cancel);
        if let Err(err) = result {
            self.state = ViewCycleState::ExecutionInterrupted;
            return Err(err);
        }
        if cancel.is_cancelled() {
            self.state = ViewCycleState::ExecutionInterrupted;
            return Err(CycleError::Interrupted(self.id));
        }

        let duration = started.elapsed();
        let market_data = self.market_data_values();
        let header = ResultHeader {
            view_process_id: self.process_id,
            cycle_id: self.id,
            valuation_time: self.valuation_time,
            result_time: SystemTime::now(),
            calculation_duration: duration,
        };
        self.result = Some(Arc::new(ViewComputationResultModel::from_caches(
            header,
            &self.compiled,
            &self.caches,
            market_data,
        )));
        for cache in self.caches.values() {
            cache.seal();
        }
        self.duration = Some(duration);
        self.state = ViewCycleState::Executed;
        Ok(())
    }

    fn execute_graphs(
        &mut self,
        previous: Option<&SingleComputationCycle>,
        snapshot: &MarketDataSnapshot,
        services: &CycleServices<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), CycleError> {
        let previous = previous.filter(|previous| {
            self.cycle_type == CycleType::Delta && previous.state == ViewCycleState::Executed
        });
        let compiled = self.compiled.clone();

        for (configuration, graph) in compiled.graphs() {
            if cancel.is_cancelled() {
                return Err(CycleError::Interrupted(self.id));
            }
            let cache = services
                .cache_source
                .get_or_create_cache(self.id, configuration);
            self.caches.insert(configuration.clone(), cache.clone());
            let states = self.node_states.entry(configuration.clone()).or_default();

            // Market data goes in first so the delta sees this cycle's inputs.
            for (id, node) in graph.nodes().filter(|(_, node)| node.is_market_data()) {
                for output in node.outputs() {
                    let value = snapshot
                        .value(&output.to_requirement())
                        .cloned()
                        .unwrap_or(Value::Missing(MissingValue::MarketDataMissing));
                    cache.put_shared_value(ComputedValue::new(output.clone(), value))?;
                }
                states.insert(id, NodeExecutionState::MarketData);
            }

            let previous_cache = previous.and_then(|previous| {
                previous
                    .cache(configuration)
                    .map(|cache| (previous.compiled.function_init_id(), cache.clone()))
            });
            let partition = match &previous_cache {
                Some((previous_init_id, previous_cache)) => LiveDataDeltaCalculator::new(
                    graph,
                    &cache,
                    previous_cache,
                    services.delta_definition,
                )
                .with_function_init_ids(*previous_init_id, compiled.function_init_id())
                .compute_delta(),
                None => DeltaPartition::all_changed(graph),
            };
            services.tracer.on_delta_computed(
                self.id,
                configuration,
                partition.changed().len(),
                partition.unchanged().len(),
            );

            if let Some((_, previous_cache)) = &previous_cache {
                for &id in partition.unchanged() {
                    let Some(node) = graph.node(id) else {
                        continue;
                    };
                    if node.is_market_data() {
                        continue;
                    }
                    let carried = node.outputs().iter().filter_map(|output| {
                        previous_cache
                            .get_value(output)
                            .map(|value| ComputedValue::new(output.clone(), value))
                    });
                    cache.put_shared_values(carried)?;
                    states.insert(id, NodeExecutionState::CarriedForward);
                }
            }

            let to_execute: BTreeSet<NodeId> = partition
                .changed()
                .iter()
                .copied()
                .filter(|id| graph.node(*id).is_some_and(|node| !node.is_market_data()))
                .collect();
            let outcome = services
                .dispatcher
                .execute(GraphExecution {
                    process_id: self.process_id,
                    cycle_id: self.id,
                    valuation_time: self.valuation_time,
                    graph,
                    nodes: &to_execute,
                    cache: &cache,
                    previous_cache: previous_cache.as_ref().map(|(_, cache)| cache.as_ref()),
                    cancel,
                })
                .map_err(|err| match err {
                    DispatchError::Cancelled => CycleError::Interrupted(self.id),
                    other => CycleError::Dispatch(other),
                })?;

            for id in outcome.executed {
                states.insert(id, NodeExecutionState::Executed);
            }
            for (id, failure) in outcome.failures {
                states.insert(id, NodeExecutionState::Failed(failure));
            }
        }
        Ok(())
    }

    fn market_data_values(&self) -> Vec<ComputedValue> {
        let mut values = BTreeMap::new();
        for (configuration, graph) in self.compiled.graphs() {
            let Some(cache) = self.caches.get(configuration) else {
                continue;
            };
            for spec in graph.market_data_specifications() {
                if let Some(value) = cache.get_value(spec) {
                    values.entry(spec.clone()).or_insert(value);
                }
            }
        }
        values
            .into_iter()
            .map(|(spec, value)| ComputedValue::new(spec, value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionInvocation, FunctionRegistry};
    use crate::graph::{DependencyGraph, DependencyNode};
    use crate::id::FunctionInitId;
    use crate::invoker::LocalJobInvoker;
    use crate::result::ViewResultModel;
    use crate::tracer::NoopTracer;
    use crate::value::{FunctionId, TargetSpecification, ValueRequirement, ValueSpecification};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spot() -> ValueSpecification {
        ValueSpecification::new("Spot", TargetSpecification::security("S"), FunctionId::market_data())
    }

    fn pv() -> ValueSpecification {
        ValueSpecification::new("PV", TargetSpecification::security("S"), "Pricer".into())
    }

    fn compiled(init: u64) -> Arc<CompiledView> {
        let target = TargetSpecification::security("S");
        let mut graph = DependencyGraph::new("Default");
        graph
            .add_node(
                DependencyNode::builder(FunctionId::market_data(), target.clone())
                    .output(spot())
                    .build(),
            )
            .unwrap();
        graph
            .add_node(
                DependencyNode::builder("Pricer".into(), target)
                    .input(spot())
                    .output(pv())
                    .build(),
            )
            .unwrap();
        graph.add_terminal_output(pv().to_requirement(), pv()).unwrap();
        Arc::new(
            CompiledView::builder("v".into(), FunctionInitId(init))
                .graph(graph)
                .build(),
        )
    }

    fn snapshot(spot_value: Option<f64>) -> MarketDataSnapshot {
        let mut values: HashMap<ValueRequirement, Value> = HashMap::new();
        if let Some(spot_value) = spot_value {
            values.insert(spot().to_requirement(), Value::Double(spot_value));
        }
        MarketDataSnapshot::new(SystemTime::now(), values)
    }

    struct Fixture {
        source: ComputationCacheSource,
        dispatcher: JobDispatcher,
        definition: DeltaDefinition,
        calls: Arc<AtomicU32>,
    }

    impl Fixture {
        fn new() -> Self {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let mut registry = FunctionRegistry::new();
            registry.register_fn("Pricer", move |invocation: &FunctionInvocation<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(invocation.each_output(invocation.input_f64("Spot")? * 2.0))
            });
            let invoker = LocalJobInvoker::new("local", 1, Arc::new(registry)).unwrap();
            Self {
                source: ComputationCacheSource::new(),
                dispatcher: JobDispatcher::new().with_invoker(Arc::new(invoker)),
                definition: DeltaDefinition::new(),
                calls,
            }
        }

        fn services(&self) -> CycleServices<'_> {
            CycleServices {
                cache_source: &self.source,
                dispatcher: &self.dispatcher,
                delta_definition: &self.definition,
                tracer: &NoopTracer,
            }
        }

        fn run(
            &self,
            id: u64,
            view: Arc<CompiledView>,
            cycle_type: CycleType,
            previous: Option<&SingleComputationCycle>,
            spot_value: Option<f64>,
        ) -> SingleComputationCycle {
            let mut cycle = SingleComputationCycle::new(
                CycleId(id),
                ViewProcessId(1),
                view,
                SystemTime::now(),
                cycle_type,
            );
            cycle
                .execute(
                    previous,
                    &snapshot(spot_value),
                    &self.services(),
                    &CancellationToken::new(),
                )
                .unwrap();
            cycle
        }
    }

    #[test]
    fn test_unchanged_inputs_reuse_previous_values() {
        let fixture = Fixture::new();
        let view = compiled(1);
        let first = fixture.run(1, view.clone(), CycleType::Full, None, Some(10.0));
        assert_eq!(first.state(), ViewCycleState::Executed);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);

        let second = fixture.run(2, view.clone(), CycleType::Delta, Some(&first), Some(10.0));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            second.node_state("Default", NodeId(1)),
            Some(&NodeExecutionState::CarriedForward)
        );
        let result = second.result_model().unwrap();
        assert_eq!(
            result
                .value("Default", &TargetSpecification::security("S"), "PV")
                .map(|r| r.value.clone()),
            Some(Value::Double(20.0))
        );

        let third = fixture.run(3, view, CycleType::Delta, Some(&second), Some(11.0));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            third.cache("Default").unwrap().get_value(&pv()),
            Some(Value::Double(22.0))
        );
        assert!(third.cache("Default").unwrap().is_sealed());
    }

    #[test]
    fn test_function_redeploy_forces_recomputation() {
        let fixture = Fixture::new();
        let first = fixture.run(1, compiled(1), CycleType::Full, None, Some(10.0));
        fixture.run(2, compiled(2), CycleType::Delta, Some(&first), Some(10.0));
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_market_data_fails_dependents() {
        let fixture = Fixture::new();
        let cycle = fixture.run(1, compiled(1), CycleType::Full, None, None);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            cycle.cache("Default").unwrap().get_value(&spot()),
            Some(Value::Missing(MissingValue::MarketDataMissing))
        );
        assert_eq!(cycle.failures("Default").len(), 1);
        assert!(cycle.result_model().unwrap().market_data().len() == 1);
    }

    #[test]
    fn test_cycle_executes_once() {
        let fixture = Fixture::new();
        let mut cycle = fixture.run(1, compiled(1), CycleType::Full, None, Some(1.0));
        let err = cycle
            .execute(None, &snapshot(Some(1.0)), &fixture.services(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err, CycleError::AlreadyExecuted(CycleId(1)));
    }

    #[test]
    fn test_cancelled_cycle_is_interrupted() {
        let fixture = Fixture::new();
        let mut cycle = SingleComputationCycle::new(
            CycleId(1),
            ViewProcessId(1),
            compiled(1),
            SystemTime::now(),
            CycleType::Full,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cycle
            .execute(None, &snapshot(Some(1.0)), &fixture.services(), &cancel)
            .unwrap_err();
        assert_eq!(err, CycleError::Interrupted(CycleId(1)));
        assert_eq!(cycle.state(), ViewCycleState::ExecutionInterrupted);
        assert!(cycle.result_model().is_none());
    }
}
