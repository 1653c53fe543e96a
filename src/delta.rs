//! Live-data delta calculation.
//!
//! Given the previous cycle's cache and the current cycle's cache (already holding this
//! cycle's market data), the [`LiveDataDeltaCalculator`] partitions a graph's nodes into
//! those that must be recomputed and those whose previous outputs can be carried forward.
//!
//! Nodes are visited in topological order:
//!
//! - if the graph was compiled against different function implementations than the previous
//!   cycle, every node is changed;
//! - a source node is changed if any output is absent from either cache or differs between
//!   them;
//! - any other node is changed if one of its inputs changed, if an output is absent from the
//!   previous cache or was suppressed there (timed out, no invoker), or if the current cache
//!   already holds a different value for an output.

use std::collections::BTreeSet;

use crate::cache::ComputationCache;
use crate::graph::{DependencyGraph, NodeId};
use crate::id::FunctionInitId;
use crate::value::Value;

/// Decides whether two observations of a value differ enough to count as a change.
pub trait DeltaComparer: Send + Sync + std::fmt::Debug {
    /// Returns true if `current` is a change from `previous`.
    ///
    /// Two absent values are never a delta; an absent value against a present one always is.
    fn is_delta(&self, previous: Option<&Value>, current: Option<&Value>) -> bool;
}

/// Compares numbers rounded to a number of significant decimal places.
///
/// A negative number of decimal places rounds to the left of the decimal point, so `-2`
/// treats 1234 and 1249 as equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NumberDeltaComparer {
    decimal_places: i32,
}

impl NumberDeltaComparer {
    /// Create a comparer for `decimal_places` significant decimal places.
    pub fn new(decimal_places: i32) -> Self {
        Self { decimal_places }
    }

    /// The configured precision.
    pub fn decimal_places(&self) -> i32 {
        self.decimal_places
    }

    /// Compare two optional numbers.
    pub fn is_number_delta(&self, previous: Option<f64>, current: Option<f64>) -> bool {
        match (previous, current) {
            (None, None) => false,
            (Some(_), None) | (None, Some(_)) => true,
            (Some(previous), Some(current)) => self.round(previous) != self.round(current),
        }
    }

    fn round(&self, value: f64) -> RoundedNumber {
        if value.is_nan() {
            return RoundedNumber::NaN;
        }
        let scaled = value * 10f64.powi(self.decimal_places);
        if scaled.is_finite() {
            RoundedNumber::Rounded(scaled.round())
        } else {
            // Beyond the range of f64 at this precision; compare the raw value.
            RoundedNumber::Exact(value)
        }
    }
}

#[derive(Debug, PartialEq)]
enum RoundedNumber {
    NaN,
    Rounded(f64),
    Exact(f64),
}

impl DeltaComparer for NumberDeltaComparer {
    fn is_delta(&self, previous: Option<&Value>, current: Option<&Value>) -> bool {
        match (previous, current) {
            (None, None) => false,
            (Some(_), None) | (None, Some(_)) => true,
            (Some(previous), Some(current)) => match (previous.as_f64(), current.as_f64()) {
                (Some(a), Some(b)) => self.is_number_delta(Some(a), Some(b)),
                _ => previous != current,
            },
        }
    }
}

/// Rules for comparing values between cycles.
///
/// Numbers (and vectors of numbers) use the numeric comparer when one is configured and
/// exact equality otherwise; every other value compares by equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeltaDefinition {
    number_comparer: Option<NumberDeltaComparer>,
}

impl DeltaDefinition {
    /// Exact comparison for every value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare numbers to `decimal_places` significant decimal places.
    pub fn with_decimal_places(decimal_places: i32) -> Self {
        Self {
            number_comparer: Some(NumberDeltaComparer::new(decimal_places)),
        }
    }

    /// The numeric comparer, if any.
    pub fn number_comparer(&self) -> Option<&NumberDeltaComparer> {
        self.number_comparer.as_ref()
    }

    fn numbers_differ(&self, previous: f64, current: f64) -> bool {
        match &self.number_comparer {
            Some(comparer) => comparer.is_number_delta(Some(previous), Some(current)),
            None => !(previous == current || (previous.is_nan() && current.is_nan())),
        }
    }
}

impl DeltaComparer for DeltaDefinition {
    fn is_delta(&self, previous: Option<&Value>, current: Option<&Value>) -> bool {
        let (previous, current) = match (previous, current) {
            (None, None) => return false,
            (Some(_), None) | (None, Some(_)) => return true,
            (Some(previous), Some(current)) => (previous, current),
        };
        match (previous, current) {
            (Value::Vector(a), Value::Vector(b)) => {
                a.len() != b.len()
                    || a.iter()
                        .zip(b.iter())
                        .any(|(a, b)| self.numbers_differ(*a, *b))
            }
            _ => match (previous.as_f64(), current.as_f64()) {
                (Some(a), Some(b)) => self.numbers_differ(a, b),
                _ => previous != current,
            },
        }
    }
}

/// Nodes that must be recomputed and nodes whose previous outputs can be reused.
///
/// The two sets are disjoint and together cover every node of the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaPartition {
    changed: BTreeSet<NodeId>,
    unchanged: BTreeSet<NodeId>,
}

impl DeltaPartition {
    /// Partition in which every node of the graph is changed.
    pub fn all_changed(graph: &DependencyGraph) -> Self {
        Self {
            changed: graph.node_ids().collect(),
            unchanged: BTreeSet::new(),
        }
    }

    /// Nodes to recompute.
    pub fn changed(&self) -> &BTreeSet<NodeId> {
        &self.changed
    }

    /// Nodes whose previous outputs are carried forward.
    pub fn unchanged(&self) -> &BTreeSet<NodeId> {
        &self.unchanged
    }

    /// Returns true if the node must be recomputed.
    pub fn is_changed(&self, id: NodeId) -> bool {
        self.changed.contains(&id)
    }

    /// Total number of nodes covered.
    pub fn len(&self) -> usize {
        self.changed.len() + self.unchanged.len()
    }

    /// Returns true if the partition covers no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Computes the [`DeltaPartition`] of a graph between two cycles.
pub struct LiveDataDeltaCalculator<'a> {
    graph: &'a DependencyGraph,
    cache: &'a ComputationCache,
    previous_cache: &'a ComputationCache,
    comparer: &'a dyn DeltaComparer,
    function_init_ids: Option<(FunctionInitId, FunctionInitId)>,
}

impl<'a> LiveDataDeltaCalculator<'a> {
    /// Create a calculator over `graph`, comparing `cache` against `previous_cache`.
    pub fn new(
        graph: &'a DependencyGraph,
        cache: &'a ComputationCache,
        previous_cache: &'a ComputationCache,
        comparer: &'a dyn DeltaComparer,
    ) -> Self {
        Self {
            graph,
            cache,
            previous_cache,
            comparer,
            function_init_ids: None,
        }
    }

    /// Record the function-init ids both cycles were compiled against.
    ///
    /// When they differ, nothing computed previously is reusable.
    pub fn with_function_init_ids(
        mut self,
        previous: FunctionInitId,
        current: FunctionInitId,
    ) -> Self {
        self.function_init_ids = Some((previous, current));
        self
    }

    /// Partition the graph.
    pub fn compute_delta(self) -> DeltaPartition {
        if let Some((previous, current)) = self.function_init_ids {
            if previous != current {
                return DeltaPartition::all_changed(self.graph);
            }
        }

        let mut partition = DeltaPartition::default();
        for (id, node) in self.graph.nodes() {
            let changed = if self.graph.is_source(id) {
                node.outputs().iter().any(|output| {
                    let current = self.cache.get_value(output);
                    let previous = self.previous_cache.get_value(output);
                    current.is_none()
                        || previous.is_none()
                        || self.comparer.is_delta(previous.as_ref(), current.as_ref())
                })
            } else {
                self.graph.inputs(id).any(|input| partition.is_changed(input))
                    || node.outputs().iter().any(|output| {
                        let Some(previous) = self.previous_cache.get_value(output) else {
                            return true;
                        };
                        if matches!(&previous, Value::Missing(missing) if missing.is_transient()) {
                            return true;
                        }
                        self.cache
                            .get_value(output)
                            .is_some_and(|current| {
                                self.comparer.is_delta(Some(&previous), Some(&current))
                            })
                    })
            };
            if changed {
                partition.changed.insert(id);
            } else {
                partition.unchanged.insert(id);
            }
        }
        partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_rules() {
        let comparer = NumberDeltaComparer::new(2);
        assert!(!comparer.is_number_delta(None, None));
        assert!(comparer.is_number_delta(None, Some(1.0)));
        assert!(comparer.is_number_delta(Some(1.0), None));
    }

    #[test]
    fn test_decimal_places() {
        let comparer = NumberDeltaComparer::new(2);
        assert!(!comparer.is_number_delta(Some(1.001), Some(1.004)));
        assert!(comparer.is_number_delta(Some(1.01), Some(1.02)));
    }

    #[test]
    fn test_negative_decimal_places_round_left_of_point() {
        let comparer = NumberDeltaComparer::new(-2);
        assert!(!comparer.is_number_delta(Some(1234.0), Some(1249.0)));
        assert!(comparer.is_number_delta(Some(1234.0), Some(1251.0)));
    }

    #[test]
    fn test_reflexive_and_symmetric() {
        let comparer = NumberDeltaComparer::new(3);
        for x in [0.0, -1.5, 1e12, f64::NAN, f64::INFINITY, 0.12345] {
            assert!(!comparer.is_number_delta(Some(x), Some(x)));
            for y in [0.0, 2.5, -7.125, f64::NAN] {
                assert_eq!(
                    comparer.is_number_delta(Some(x), Some(y)),
                    comparer.is_number_delta(Some(y), Some(x))
                );
            }
        }
    }

    #[test]
    fn test_precision_beyond_f64_range() {
        let fine = NumberDeltaComparer::new(400);
        assert!(!fine.is_number_delta(Some(0.0), Some(0.0)));
        assert!(!fine.is_number_delta(Some(1.5), Some(1.5)));
        assert!(fine.is_number_delta(Some(1.5), Some(1.6)));

        let comparer = NumberDeltaComparer::new(20);
        assert!(comparer.is_number_delta(Some(1e300), Some(2e300)));
        assert!(!comparer.is_number_delta(Some(1e300), Some(1e300)));
        assert!(comparer.is_number_delta(Some(1e300), Some(1.0)));

        let coarse = NumberDeltaComparer::new(-400);
        assert!(!coarse.is_number_delta(Some(1e300), Some(2e300)));
        assert!(!coarse.is_number_delta(Some(f64::INFINITY), Some(f64::INFINITY)));
    }

    #[test]
    fn test_definition_compares_non_numbers_by_equality() {
        let definition = DeltaDefinition::with_decimal_places(1);
        let text = Value::from("a");
        assert!(!definition.is_delta(Some(&text), Some(&Value::from("a"))));
        assert!(definition.is_delta(Some(&text), Some(&Value::from("b"))));
        assert!(!definition.is_delta(
            Some(&Value::from(vec![1.01, 2.0])),
            Some(&Value::from(vec![1.02, 2.0]))
        ));
        assert!(definition.is_delta(
            Some(&Value::from(vec![1.0])),
            Some(&Value::from(vec![1.0, 2.0]))
        ));
        assert!(!DeltaDefinition::new().is_delta(None, None));
    }
}
