//! Result models delivered to clients.
//!
//! A [`ViewComputationResultModel`] carries every terminal output of a cycle. A
//! [`ViewDeltaResultModel`] carries only the terminal outputs that changed since the previous
//! result, together with the previous valuation time. Both expose the same shape through the
//! [`ViewResultModel`] trait: per calculation configuration, a map of target to the values
//! computed for it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::cache::ComputationCache;
use crate::compile::CompiledView;
use crate::delta::DeltaComparer;
use crate::id::{CycleId, ViewProcessId};
use crate::value::{
    ComputedValue, MissingValue, TargetSpecification, Value, ValueRequirement, ValueSpecification,
};

/// One terminal output in a result.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComputedValueResult {
    /// Exact identity of the value.
    pub specification: ValueSpecification,
    /// The value, or a missing marker.
    pub value: Value,
    /// Requirements of the view this value satisfies.
    pub requirements: BTreeSet<ValueRequirement>,
}

impl ComputedValueResult {
    /// Returns true if the value is a missing marker.
    pub fn is_failure(&self) -> bool {
        self.value.is_missing()
    }
}

/// Results of one calculation configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewCalculationResultModel {
    values: BTreeMap<TargetSpecification, BTreeMap<ValueSpecification, ComputedValueResult>>,
}

impl ViewCalculationResultModel {
    /// Add or replace a value.
    pub fn add_value(&mut self, result: ComputedValueResult) {
        self.values
            .entry(result.specification.target.clone())
            .or_default()
            .insert(result.specification.clone(), result);
    }

    /// Targets with values.
    pub fn targets(&self) -> impl Iterator<Item = &TargetSpecification> {
        self.values.keys()
    }

    /// Values computed for a target.
    pub fn values_for(
        &self,
        target: &TargetSpecification,
    ) -> Option<&BTreeMap<ValueSpecification, ComputedValueResult>> {
        self.values.get(target)
    }

    /// First value with the given name on a target.
    pub fn value(&self, target: &TargetSpecification, value_name: &str) -> Option<&ComputedValueResult> {
        self.values
            .get(target)?
            .values()
            .find(|result| &*result.specification.value_name == value_name)
    }

    /// Every value.
    pub fn iter(&self) -> impl Iterator<Item = &ComputedValueResult> {
        self.values.values().flat_map(|values| values.values())
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.values().map(|values| values.len()).sum()
    }

    /// Returns true if there are no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Metadata shared by full and delta results.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResultHeader {
    /// Process that produced the result.
    pub view_process_id: ViewProcessId,
    /// Cycle that produced the result.
    pub cycle_id: CycleId,
    /// Valuation time of the cycle.
    pub valuation_time: SystemTime,
    /// When the result was assembled.
    pub result_time: SystemTime,
    /// Time spent executing the cycle.
    pub calculation_duration: Duration,
}

/// Common view of full and delta results.
pub trait ViewResultModel {
    /// Result metadata.
    fn header(&self) -> &ResultHeader;

    /// Results keyed by calculation configuration.
    fn configurations(&self) -> &BTreeMap<Arc<str>, ViewCalculationResultModel>;

    /// Process that produced the result.
    fn view_process_id(&self) -> ViewProcessId {
        self.header().view_process_id
    }

    /// Cycle that produced the result.
    fn cycle_id(&self) -> CycleId {
        self.header().cycle_id
    }

    /// Valuation time of the cycle.
    fn valuation_time(&self) -> SystemTime {
        self.header().valuation_time
    }

    /// When the result was assembled.
    fn result_time(&self) -> SystemTime {
        self.header().result_time
    }

    /// Names of the calculation configurations with results.
    fn configuration_names(&self) -> Vec<Arc<str>> {
        self.configurations().keys().cloned().collect()
    }

    /// Results of one calculation configuration.
    fn calculation_result(&self, configuration: &str) -> Option<&ViewCalculationResultModel> {
        self.configurations().get(configuration)
    }

    /// First value named `value_name` on `target` in `configuration`.
    fn value(
        &self,
        configuration: &str,
        target: &TargetSpecification,
        value_name: &str,
    ) -> Option<&ComputedValueResult> {
        self.calculation_result(configuration)?.value(target, value_name)
    }

    /// Every value of every configuration.
    fn all_results(&self) -> Vec<(&Arc<str>, &ComputedValueResult)> {
        self.configurations()
            .iter()
            .flat_map(|(name, results)| results.iter().map(move |result| (name, result)))
            .collect()
    }
}

/// Full result of a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewComputationResultModel {
    header: ResultHeader,
    configurations: BTreeMap<Arc<str>, ViewCalculationResultModel>,
    market_data: Vec<ComputedValue>,
}

impl ViewComputationResultModel {
    /// Create an empty result.
    pub fn new(header: ResultHeader) -> Self {
        Self {
            header,
            configurations: BTreeMap::new(),
            market_data: Vec::new(),
        }
    }

    /// Assemble a result from each configuration's terminal outputs in the cycle's caches.
    ///
    /// Terminal outputs absent from the cache are reported as
    /// [`MissingValue::NotCalculated`].
    pub fn from_caches(
        header: ResultHeader,
        compiled: &CompiledView,
        caches: &BTreeMap<Arc<str>, Arc<ComputationCache>>,
        market_data: Vec<ComputedValue>,
    ) -> Self {
        let mut model = Self::new(header);
        model.market_data = market_data;
        for (configuration, graph) in compiled.graphs() {
            let cache = caches.get(configuration);
            let results = model.configurations.entry(configuration.clone()).or_default();
            for (specification, requirements) in graph.terminal_outputs() {
                let value = cache
                    .and_then(|cache| cache.get_value(specification))
                    .unwrap_or(Value::Missing(MissingValue::NotCalculated));
                results.add_value(ComputedValueResult {
                    specification: specification.clone(),
                    value,
                    requirements: requirements.clone(),
                });
            }
        }
        model
    }

    /// Add a value to a configuration.
    pub fn add_value(&mut self, configuration: impl Into<Arc<str>>, result: ComputedValueResult) {
        self.configurations
            .entry(configuration.into())
            .or_default()
            .add_value(result);
    }

    /// Market data the cycle ran with.
    pub fn market_data(&self) -> &[ComputedValue] {
        &self.market_data
    }
}

impl ViewResultModel for ViewComputationResultModel {
    fn header(&self) -> &ResultHeader {
        &self.header
    }

    fn configurations(&self) -> &BTreeMap<Arc<str>, ViewCalculationResultModel> {
        &self.configurations
    }
}

/// Changes between two consecutive results.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDeltaResultModel {
    header: ResultHeader,
    previous_valuation_time: Option<SystemTime>,
    configurations: BTreeMap<Arc<str>, ViewCalculationResultModel>,
}

impl ViewDeltaResultModel {
    /// Values of `current` that differ from `previous` under `comparer`.
    ///
    /// With no previous result every value is part of the delta.
    pub fn between(
        previous: Option<&ViewComputationResultModel>,
        current: &ViewComputationResultModel,
        comparer: &dyn DeltaComparer,
    ) -> Self {
        let mut configurations = BTreeMap::new();
        for (name, results) in &current.configurations {
            let previous_results = previous.and_then(|previous| previous.calculation_result(name));
            let mut delta = ViewCalculationResultModel::default();
            for result in results.iter() {
                let before = previous_results
                    .and_then(|previous| previous.values_for(&result.specification.target))
                    .and_then(|values| values.get(&result.specification))
                    .map(|previous| &previous.value);
                if before.is_none() || comparer.is_delta(before, Some(&result.value)) {
                    delta.add_value(result.clone());
                }
            }
            configurations.insert(name.clone(), delta);
        }
        Self {
            header: current.header.clone(),
            previous_valuation_time: previous.map(|previous| previous.valuation_time()),
            configurations,
        }
    }

    /// Valuation time of the result this delta is relative to.
    pub fn previous_valuation_time(&self) -> Option<SystemTime> {
        self.previous_valuation_time
    }

    /// Fold a later delta into this one; later values win.
    ///
    /// The merged delta keeps this delta's previous valuation time and takes the later
    /// header.
    pub fn merge(&mut self, later: ViewDeltaResultModel) {
        self.header = later.header;
        for (name, results) in later.configurations {
            let merged = self.configurations.entry(name).or_default();
            for result in results.iter() {
                merged.add_value(result.clone());
            }
        }
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.configurations.values().all(|results| results.is_empty())
    }
}

impl ViewResultModel for ViewDeltaResultModel {
    fn header(&self) -> &ResultHeader {
        &self.header
    }

    fn configurations(&self) -> &BTreeMap<Arc<str>, ViewCalculationResultModel> {
        &self.configurations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaDefinition;
    use crate::graph::{DependencyGraph, DependencyNode};
    use crate::id::FunctionInitId;

    fn header(cycle: u64, seconds: u64) -> ResultHeader {
        ResultHeader {
            view_process_id: ViewProcessId(1),
            cycle_id: CycleId(cycle),
            valuation_time: SystemTime::UNIX_EPOCH + Duration::from_secs(seconds),
            result_time: SystemTime::UNIX_EPOCH + Duration::from_secs(seconds),
            calculation_duration: Duration::ZERO,
        }
    }

    fn result(target: &str, value: f64) -> ComputedValueResult {
        let target = TargetSpecification::position(target);
        let specification = ValueSpecification::new("PV", target, "Pricer".into());
        ComputedValueResult {
            requirements: BTreeSet::from([specification.to_requirement()]),
            specification,
            value: Value::Double(value),
        }
    }

    #[test]
    fn test_from_caches_reads_terminal_outputs() {
        let target = TargetSpecification::position("P1");
        let pv = ValueSpecification::new("PV", target.clone(), "Pricer".into());
        let unset = ValueSpecification::new("Delta", target.clone(), "Pricer".into());
        let mut graph = DependencyGraph::new("Default");
        graph
            .add_node(
                DependencyNode::builder("Pricer".into(), target.clone())
                    .output(pv.clone())
                    .output(unset.clone())
                    .build(),
            )
            .unwrap();
        graph.add_terminal_output(pv.to_requirement(), pv.clone()).unwrap();
        graph
            .add_terminal_output(unset.to_requirement(), unset.clone())
            .unwrap();
        let compiled = CompiledView::builder("v".into(), FunctionInitId(1))
            .graph(graph)
            .build();

        let cache = Arc::new(ComputationCache::new(CycleId(1), "Default"));
        cache.put_shared_value(ComputedValue::new(pv, 12.5)).unwrap();
        let caches = BTreeMap::from([(Arc::<str>::from("Default"), cache)]);

        let model = ViewComputationResultModel::from_caches(header(1, 1), &compiled, &caches, vec![]);
        assert_eq!(
            model.value("Default", &target, "PV").map(|r| &r.value),
            Some(&Value::Double(12.5))
        );
        let missing = model.value("Default", &target, "Delta").unwrap();
        assert!(missing.is_failure());
        assert_eq!(model.all_results().len(), 2);
    }

    #[test]
    fn test_delta_contains_only_changes() {
        let mut previous = ViewComputationResultModel::new(header(1, 1));
        previous.add_value("Default", result("P1", 1.0));
        previous.add_value("Default", result("P2", 2.0));
        let mut current = ViewComputationResultModel::new(header(2, 2));
        current.add_value("Default", result("P1", 1.0));
        current.add_value("Default", result("P2", 3.0));
        current.add_value("Default", result("P3", 4.0));

        let delta = ViewDeltaResultModel::between(Some(&previous), &current, &DeltaDefinition::new());
        let changed: Vec<_> = delta
            .all_results()
            .into_iter()
            .map(|(_, r)| r.specification.target.identifier.to_string())
            .collect();
        assert_eq!(changed, vec!["P2", "P3"]);
        assert_eq!(delta.previous_valuation_time(), Some(previous.valuation_time()));
        assert_eq!(delta.cycle_id(), CycleId(2));

        let first = ViewDeltaResultModel::between(None, &current, &DeltaDefinition::new());
        assert_eq!(first.all_results().len(), 3);
        assert_eq!(first.previous_valuation_time(), None);
    }

    #[test]
    fn test_merge_keeps_latest_values() {
        let mut first = ViewComputationResultModel::new(header(1, 1));
        first.add_value("Default", result("P1", 1.0));
        let mut second = ViewComputationResultModel::new(header(2, 2));
        second.add_value("Default", result("P1", 2.0));
        second.add_value("Default", result("P2", 5.0));

        let mut merged = ViewDeltaResultModel::between(None, &first, &DeltaDefinition::new());
        merged.merge(ViewDeltaResultModel::between(
            Some(&first),
            &second,
            &DeltaDefinition::new(),
        ));
        assert_eq!(merged.cycle_id(), CycleId(2));
        assert_eq!(merged.previous_valuation_time(), None);
        let p1 = merged
            .value("Default", &TargetSpecification::position("P1"), "PV")
            .unwrap();
        assert_eq!(p1.value, Value::Double(2.0));
        assert!(!merged.is_empty());
    }
}
