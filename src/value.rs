//! Value identity: what a value is, what a node needs, and the payloads flowing between nodes.
//!
//! A [`ValueSpecification`] names exactly one produced value: the value name, the target it
//! was computed for, the function that produced it and the properties it was produced with.
//! It is the key of every [`ComputationCache`](crate::ComputationCache) entry and the identity
//! of a node output. A [`ValueRequirement`] is the looser form a consumer asks for.
//!
//! # Example
//!
//! ```ignore
//! use view_flow::{FunctionId, TargetSpecification, ValueProperties, ValueSpecification};
//!
//! let target = TargetSpecification::security("AAPL");
//! let spec = ValueSpecification::new("Market_Value", target, FunctionId::market_data())
//!     .with_properties(ValueProperties::new().with("Currency", "USD"));
//! assert!(spec.to_requirement().is_satisfied_by(&spec));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Kind of object a value is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TargetType {
    /// A whole portfolio node.
    Portfolio,
    /// A position in a portfolio.
    Position,
    /// A security.
    Security,
    /// Anything else identified only by its identifier.
    Primitive,
}

/// The object a value is computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetSpecification {
    /// Kind of the target.
    pub target_type: TargetType,
    /// Identifier of the target, unique within its type.
    pub identifier: Arc<str>,
}

impl TargetSpecification {
    /// Create a target of the given type.
    pub fn new(target_type: TargetType, identifier: impl Into<Arc<str>>) -> Self {
        Self {
            target_type,
            identifier: identifier.into(),
        }
    }

    /// A portfolio target.
    pub fn portfolio(identifier: impl Into<Arc<str>>) -> Self {
        Self::new(TargetType::Portfolio, identifier)
    }

    /// A position target.
    pub fn position(identifier: impl Into<Arc<str>>) -> Self {
        Self::new(TargetType::Position, identifier)
    }

    /// A security target.
    pub fn security(identifier: impl Into<Arc<str>>) -> Self {
        Self::new(TargetType::Security, identifier)
    }

    /// A primitive target.
    pub fn primitive(identifier: impl Into<Arc<str>>) -> Self {
        Self::new(TargetType::Primitive, identifier)
    }
}

impl fmt::Display for TargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}~{}", self.target_type, self.identifier)
    }
}

/// Identity of a calculation function.
///
/// Functions are looked up by this id in the [`FunctionRegistry`](crate::FunctionRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionId(Arc<str>);

impl FunctionId {
    const MARKET_DATA: &'static str = "MarketDataSourcing";

    /// Create a function id.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The function id of market-data sourcing nodes.
    ///
    /// Nodes with this function are never executed; their outputs are populated from the
    /// market-data snapshot at the start of each cycle.
    pub fn market_data() -> Self {
        Self::new(Self::MARKET_DATA)
    }

    /// Returns true if this is the market-data sourcing function.
    pub fn is_market_data(&self) -> bool {
        &*self.0 == Self::MARKET_DATA
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unordered bag of named properties, each with a set of values.
///
/// Equality is structural and independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueProperties(BTreeMap<Arc<str>, BTreeSet<Arc<str>>>);

impl ValueProperties {
    /// Empty property bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property value.
    pub fn with(mut self, name: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        self.0.entry(name.into()).or_default().insert(value.into());
        self
    }

    /// Values of a property, if present.
    pub fn values(&self, name: &str) -> Option<&BTreeSet<Arc<str>>> {
        self.0.get(name)
    }

    /// Returns true if every property value in `self` is also present in `other`.
    pub fn is_satisfied_by(&self, other: &ValueProperties) -> bool {
        self.0.iter().all(|(name, values)| {
            other
                .0
                .get(name)
                .is_some_and(|available| values.is_subset(available))
        })
    }

    /// Iterate over properties.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &BTreeSet<Arc<str>>)> {
        self.0.iter()
    }

    /// Returns true if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Exact identity of one produced value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueSpecification {
    /// Name of the value, e.g. `"Present_Value"`.
    pub value_name: Arc<str>,
    /// Target the value is computed for.
    pub target: TargetSpecification,
    /// Function that produces the value.
    pub function: FunctionId,
    /// Properties the value was produced with.
    pub properties: ValueProperties,
}

impl ValueSpecification {
    /// Create a specification with no properties.
    pub fn new(
        value_name: impl Into<Arc<str>>,
        target: TargetSpecification,
        function: FunctionId,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            function,
            properties: ValueProperties::new(),
        }
    }

    /// Replace the properties.
    pub fn with_properties(mut self, properties: ValueProperties) -> Self {
        self.properties = properties;
        self
    }

    /// The unconstrained requirement this specification satisfies.
    pub fn to_requirement(&self) -> ValueRequirement {
        ValueRequirement::new(self.value_name.clone(), self.target.clone())
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] by {}", self.value_name, self.target, self.function)
    }
}

/// What a consumer needs: a value name on a target, optionally constrained by properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueRequirement {
    /// Name of the required value.
    pub value_name: Arc<str>,
    /// Target the value is required for.
    pub target: TargetSpecification,
    /// Properties the producing specification must carry.
    pub constraints: ValueProperties,
}

impl ValueRequirement {
    /// Create an unconstrained requirement.
    pub fn new(value_name: impl Into<Arc<str>>, target: TargetSpecification) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints: ValueProperties::new(),
        }
    }

    /// Replace the constraints.
    pub fn with_constraints(mut self, constraints: ValueProperties) -> Self {
        self.constraints = constraints;
        self
    }

    /// Returns true if the specification provides what this requirement asks for.
    pub fn is_satisfied_by(&self, specification: &ValueSpecification) -> bool {
        self.value_name == specification.value_name
            && self.target == specification.target
            && self.constraints.is_satisfied_by(&specification.properties)
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)
    }
}

/// Why a value is absent.
///
/// Stored in caches and result models in place of a real value, so consumers always see an
/// explicit marker instead of a silently missing entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MissingValue {
    /// The market-data provider had no value for this input.
    MarketDataMissing,
    /// The producing function failed.
    EvaluationError(Arc<str>),
    /// The producing node was not executed because one of its inputs failed.
    UpstreamFailure,
    /// The function completed but did not produce this output.
    NotProduced,
    /// The value was never calculated in this cycle.
    NotCalculated,
    /// Execution was suppressed, e.g. the job timed out or no invoker was available.
    Suppressed,
}

impl MissingValue {
    /// Returns true if the cause can clear on its own, so the producing node must be retried
    /// next cycle even when none of its inputs moved.
    pub fn is_transient(&self) -> bool {
        matches!(self, MissingValue::Suppressed)
    }
}

impl fmt::Display for MissingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingValue::MarketDataMissing => write!(f, "market data missing"),
            MissingValue::EvaluationError(message) => write!(f, "evaluation error: {}", message),
            MissingValue::UpstreamFailure => write!(f, "upstream failure"),
            MissingValue::NotProduced => write!(f, "not produced"),
            MissingValue::NotCalculated => write!(f, "not calculated"),
            MissingValue::Suppressed => write!(f, "suppressed"),
        }
    }
}

/// A value payload.
///
/// Cheap to clone; larger payloads are reference counted.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// Floating point number.
    Double(f64),
    /// Integer.
    Integer(i64),
    /// Text.
    Text(Arc<str>),
    /// Boolean.
    Boolean(bool),
    /// Vector of numbers, e.g. a curve or a sensitivity strip.
    Vector(Arc<[f64]>),
    /// Explicit marker for an absent value.
    Missing(MissingValue),
}

impl Value {
    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns true if this is a missing marker.
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing(_))
    }

    /// The missing marker, if this is one.
    pub fn missing(&self) -> Option<&MissingValue> {
        match self {
            Value::Missing(missing) => Some(missing),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.into())
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v.into())
    }
}

impl From<MissingValue> for Value {
    fn from(v: MissingValue) -> Self {
        Value::Missing(v)
    }
}

/// A value together with its specification.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComputedValue {
    /// What the value is.
    pub specification: ValueSpecification,
    /// The payload.
    pub value: Value,
}

impl ComputedValue {
    /// Pair a specification with a value.
    pub fn new(specification: ValueSpecification, value: impl Into<Value>) -> Self {
        Self {
            specification,
            value: value.into(),
        }
    }
}
