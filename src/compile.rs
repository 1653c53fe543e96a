//! The compiled form of a view and the compiler boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::CompilationError;
use crate::graph::DependencyGraph;
use crate::id::{FunctionInitId, ViewDefinitionId};
use crate::value::ValueRequirement;

/// Immutable result of compiling a view definition: one dependency graph per calculation
/// configuration, plus the window of valuation times it is valid for.
///
/// A process replaces its compiled view wholesale; it is never mutated in place.
#[derive(Debug, Clone)]
pub struct CompiledView {
    definition_id: ViewDefinitionId,
    graphs: BTreeMap<Arc<str>, Arc<DependencyGraph>>,
    portfolio: Option<Arc<str>>,
    function_init_id: FunctionInitId,
    valid_from: Option<SystemTime>,
    valid_to: Option<SystemTime>,
    compiled_at: SystemTime,
}

impl CompiledView {
    /// Start building a compiled view.
    pub fn builder(
        definition_id: ViewDefinitionId,
        function_init_id: FunctionInitId,
    ) -> CompiledViewBuilder {
        CompiledViewBuilder {
            view: CompiledView {
                definition_id,
                graphs: BTreeMap::new(),
                portfolio: None,
                function_init_id,
                valid_from: None,
                valid_to: None,
                compiled_at: SystemTime::now(),
            },
        }
    }

    /// The definition this view was compiled from.
    pub fn definition_id(&self) -> &ViewDefinitionId {
        &self.definition_id
    }

    /// Graph of a calculation configuration.
    pub fn graph(&self, configuration: &str) -> Option<&Arc<DependencyGraph>> {
        self.graphs.get(configuration)
    }

    /// All graphs, keyed by calculation configuration.
    pub fn graphs(&self) -> &BTreeMap<Arc<str>, Arc<DependencyGraph>> {
        &self.graphs
    }

    /// Names of the calculation configurations.
    pub fn configuration_names(&self) -> impl Iterator<Item = &Arc<str>> {
        self.graphs.keys()
    }

    /// Identifier of the resolved portfolio snapshot, if the view has a portfolio.
    pub fn portfolio(&self) -> Option<&Arc<str>> {
        self.portfolio.as_ref()
    }

    /// Function implementations the graphs were compiled against.
    pub fn function_init_id(&self) -> FunctionInitId {
        self.function_init_id
    }

    /// Earliest valuation time this view is valid for, if bounded.
    pub fn valid_from(&self) -> Option<SystemTime> {
        self.valid_from
    }

    /// Latest valuation time this view is valid for, if bounded.
    pub fn valid_to(&self) -> Option<SystemTime> {
        self.valid_to
    }

    /// When compilation happened.
    pub fn compiled_at(&self) -> SystemTime {
        self.compiled_at
    }

    /// Returns true if the view may be used for a cycle valued at `valuation_time`.
    ///
    /// Both bounds are inclusive.
    pub fn is_valid_for(&self, valuation_time: SystemTime) -> bool {
        self.valid_from.map_or(true, |from| valuation_time >= from)
            && self.valid_to.map_or(true, |to| valuation_time <= to)
    }

    /// Market data needed by every graph of the view.
    pub fn market_data_requirements(&self) -> BTreeSet<ValueRequirement> {
        self.graphs
            .values()
            .flat_map(|graph| graph.market_data_specifications())
            .map(|spec| spec.to_requirement())
            .collect()
    }

    /// Total number of nodes over all graphs.
    pub fn node_count(&self) -> usize {
        self.graphs.values().map(|graph| graph.len()).sum()
    }
}

/// Builder for [`CompiledView`].
#[derive(Debug, Clone)]
pub struct CompiledViewBuilder {
    view: CompiledView,
}

impl CompiledViewBuilder {
    /// Add the graph of a calculation configuration, replacing any previous one.
    pub fn graph(mut self, graph: DependencyGraph) -> Self {
        self.view
            .graphs
            .insert(graph.calculation_configuration().clone(), Arc::new(graph));
        self
    }

    /// Set the portfolio snapshot identifier.
    pub fn portfolio(mut self, portfolio: impl Into<Arc<str>>) -> Self {
        self.view.portfolio = Some(portfolio.into());
        self
    }

    /// Set the earliest valid valuation time.
    pub fn valid_from(mut self, instant: SystemTime) -> Self {
        self.view.valid_from = Some(instant);
        self
    }

    /// Set the latest valid valuation time.
    pub fn valid_to(mut self, instant: SystemTime) -> Self {
        self.view.valid_to = Some(instant);
        self
    }

    /// Override the compilation time.
    pub fn compiled_at(mut self, instant: SystemTime) -> Self {
        self.view.compiled_at = instant;
        self
    }

    /// Finish the compiled view.
    pub fn build(self) -> CompiledView {
        self.view
    }
}

/// Compiles view definitions into [`CompiledView`]s.
///
/// Portfolio resolution, function resolution and graph building happen behind this trait.
pub trait ViewCompiler: Send + Sync + 'static {
    /// Compile a definition for a valuation time.
    fn compile(
        &self,
        definition: &ViewDefinitionId,
        valuation_time: SystemTime,
    ) -> Result<CompiledView, CompilationError>;

    /// Identifier of the currently deployed function implementations.
    ///
    /// A compiled view built against a different id is recompiled before its next cycle.
    fn function_init_id(&self) -> FunctionInitId {
        FunctionInitId::default()
    }
}

impl<F> ViewCompiler for F
where
    F: Fn(&ViewDefinitionId, SystemTime) -> Result<CompiledView, CompilationError>
        + Send
        + Sync
        + 'static,
{
    fn compile(
        &self,
        definition: &ViewDefinitionId,
        valuation_time: SystemTime,
    ) -> Result<CompiledView, CompilationError> {
        self(definition, valuation_time)
    }
}
