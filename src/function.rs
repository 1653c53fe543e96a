//! Calculation functions and the registry jobs resolve them from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::value::{ComputedValue, FunctionId, TargetSpecification, Value, ValueSpecification};

/// Everything a function sees when it executes for one node.
#[derive(Debug, Clone, Copy)]
pub struct FunctionInvocation<'a> {
    /// The target being computed.
    pub target: &'a TargetSpecification,
    /// Resolved input values.
    pub inputs: &'a [ComputedValue],
    /// Outputs the node is expected to produce.
    pub desired_outputs: &'a [ValueSpecification],
    /// Valuation time of the cycle.
    pub valuation_time: SystemTime,
}

impl<'a> FunctionInvocation<'a> {
    /// First input value with the given value name.
    pub fn input(&self, value_name: &str) -> Option<&'a Value> {
        self.inputs
            .iter()
            .find(|input| &*input.specification.value_name == value_name)
            .map(|input| &input.value)
    }

    /// Numeric input with the given value name.
    pub fn input_f64(&self, value_name: &str) -> anyhow::Result<f64> {
        let value = self
            .input(value_name)
            .ok_or_else(|| anyhow::anyhow!("missing input {}", value_name))?;
        value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("input {} is not numeric: {:?}", value_name, value))
    }

    /// Produce `value` for every desired output.
    pub fn each_output(&self, value: impl Into<Value>) -> Vec<ComputedValue> {
        let value = value.into();
        self.desired_outputs
            .iter()
            .map(|spec| ComputedValue::new(spec.clone(), value.clone()))
            .collect()
    }
}

/// A calculation function.
///
/// Errors are recorded as per-node failures; they never abort the cycle.
pub trait CalculationFunction: Send + Sync + 'static {
    /// Compute the node's outputs.
    fn execute(&self, invocation: &FunctionInvocation<'_>) -> anyhow::Result<Vec<ComputedValue>>;
}

struct FnFunction<F>(F);

impl<F> CalculationFunction for FnFunction<F>
where
    F: Fn(&FunctionInvocation<'_>) -> anyhow::Result<Vec<ComputedValue>> + Send + Sync + 'static,
{
    fn execute(&self, invocation: &FunctionInvocation<'_>) -> anyhow::Result<Vec<ComputedValue>> {
        (self.0)(invocation)
    }
}

/// Maps [`FunctionId`]s to implementations.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<FunctionId, Arc<dyn CalculationFunction>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function implementation, replacing any previous one.
    pub fn register(&mut self, id: FunctionId, function: Arc<dyn CalculationFunction>) -> &mut Self {
        self.functions.insert(id, function);
        self
    }

    /// Register a closure.
    pub fn register_fn<F>(&mut self, id: impl Into<FunctionId>, function: F) -> &mut Self
    where
        F: Fn(&FunctionInvocation<'_>) -> anyhow::Result<Vec<ComputedValue>>
            + Send
            + Sync
            + 'static,
    {
        self.register(id.into(), Arc::new(FnFunction(function)))
    }

    /// Look up a function.
    pub fn get(&self, id: &FunctionId) -> Option<&Arc<dyn CalculationFunction>> {
        self.functions.get(id)
    }

    /// Returns true if a function is registered.
    pub fn contains(&self, id: &FunctionId) -> bool {
        self.functions.contains_key(id)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_execute() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("Double", |invocation: &FunctionInvocation<'_>| {
            let x = invocation.input_f64("X")?;
            Ok(invocation.each_output(x * 2.0))
        });
        assert!(registry.contains(&"Double".into()));

        let target = TargetSpecification::primitive("T");
        let x = ValueSpecification::new("X", target.clone(), "Src".into());
        let out = ValueSpecification::new("Y", target.clone(), "Double".into());
        let inputs = [ComputedValue::new(x, 21.0)];
        let outputs = [out.clone()];
        let invocation = FunctionInvocation {
            target: &target,
            inputs: &inputs,
            desired_outputs: &outputs,
            valuation_time: SystemTime::UNIX_EPOCH,
        };
        let function = registry.get(&"Double".into()).unwrap();
        let produced = function.execute(&invocation).unwrap();
        assert_eq!(produced, vec![ComputedValue::new(out, 42.0)]);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let target = TargetSpecification::primitive("T");
        let invocation = FunctionInvocation {
            target: &target,
            inputs: &[],
            desired_outputs: &[],
            valuation_time: SystemTime::UNIX_EPOCH,
        };
        assert!(invocation.input_f64("X").is_err());
    }
}
