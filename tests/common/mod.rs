//! A small pricing view shared by the process and client tests.
//!
//! The view prices one security: the `Spot` market-data value feeds a `Pricer` function
//! producing `PV` and a `Risk` function producing `Delta`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use view_flow::{
    CompilationError, CompiledView, DependencyGraph, DependencyNode, FunctionId, FunctionInitId,
    FunctionInvocation, FunctionRegistry, InMemoryMarketDataProvider, ListenerEvent,
    TargetSpecification, Value, ValueRequirement, ValueSpecification, ViewCompiler,
    ViewDefinitionId, ViewProcessor, ViewProcessorBuilder, ViewProcessorConfig,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn security() -> TargetSpecification {
    TargetSpecification::security("AAPL")
}

pub fn spot_requirement() -> ValueRequirement {
    ValueRequirement::new("Spot", security())
}

fn spot_spec() -> ValueSpecification {
    ValueSpecification::new("Spot", security(), FunctionId::market_data())
}

/// `hours` hours after a fixed base instant.
pub fn instant(hours: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + hours * 3600)
}

/// Compiles the pricing view, counting compilations.
#[derive(Default)]
pub struct PricingCompiler {
    pub compilations: AtomicUsize,
    pub fail: AtomicBool,
    pub function_init_id: AtomicU64,
    /// How long a compilation stays valid after its valuation time; forever when unset.
    pub validity: Option<Duration>,
    /// Fail only this compilation, counting from one.
    pub fail_compilation: Option<usize>,
}

impl PricingCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid_for(validity: Duration) -> Self {
        Self {
            validity: Some(validity),
            ..Self::default()
        }
    }

    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }
}

impl ViewCompiler for PricingCompiler {
    fn compile(
        &self,
        definition: &ViewDefinitionId,
        valuation_time: SystemTime,
    ) -> Result<CompiledView, CompilationError> {
        let compilation = self.compilations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) || self.fail_compilation == Some(compilation) {
            return Err(CompilationError::new("portfolio AAPL-BOOK not found"));
        }

        let s = security();
        let pv = ValueSpecification::new("PV", s.clone(), "Pricer".into());
        let delta = ValueSpecification::new("Delta", s.clone(), "Risk".into());
        let mut graph = DependencyGraph::new("Default");
        let build = |graph: &mut DependencyGraph| -> Result<(), view_flow::GraphError> {
            graph.add_node(
                DependencyNode::builder(FunctionId::market_data(), s.clone())
                    .output(spot_spec())
                    .build(),
            )?;
            graph.add_node(
                DependencyNode::builder("Pricer".into(), s.clone())
                    .input(spot_spec())
                    .output(pv.clone())
                    .build(),
            )?;
            graph.add_node(
                DependencyNode::builder("Risk".into(), s.clone())
                    .input(spot_spec())
                    .output(delta.clone())
                    .build(),
            )?;
            graph.add_terminal_output(pv.to_requirement(), pv.clone())?;
            graph.add_terminal_output(delta.to_requirement(), delta.clone())?;
            Ok(())
        };
        build(&mut graph).map_err(|err| CompilationError::new(err.to_string()))?;

        let mut builder = CompiledView::builder(
            definition.clone(),
            FunctionInitId(self.function_init_id.load(Ordering::SeqCst)),
        )
        .graph(graph)
        .valid_from(valuation_time);
        if let Some(validity) = self.validity {
            builder = builder.valid_to(valuation_time + validity);
        }
        Ok(builder.build())
    }

    fn function_init_id(&self) -> FunctionInitId {
        FunctionInitId(self.function_init_id.load(Ordering::SeqCst))
    }
}

/// Pricing functions. `Pricer` panics while `pricer_fails` is set and sleeps `pricer_delay`
/// before pricing.
#[derive(Clone, Default)]
pub struct Pricing {
    pub pricer_fails: Arc<AtomicBool>,
    pub pricer_delay: Arc<AtomicU64>,
    pub pricer_calls: Arc<AtomicUsize>,
}

impl Pricing {
    pub fn registry(&self) -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        let pricing = self.clone();
        registry
            .register_fn("Pricer", move |invocation: &FunctionInvocation<'_>| {
                pricing.pricer_calls.fetch_add(1, Ordering::SeqCst);
                let delay = pricing.pricer_delay.load(Ordering::SeqCst);
                if delay > 0 {
                    std::thread::sleep(Duration::from_millis(delay));
                }
                if pricing.pricer_fails.load(Ordering::SeqCst) {
                    panic!("pricing library crashed");
                }
                Ok(invocation.each_output(invocation.input_f64("Spot")? * 2.0))
            })
            .register_fn("Risk", |invocation: &FunctionInvocation<'_>| {
                Ok(invocation.each_output(invocation.input_f64("Spot")? / 100.0))
            });
        registry
    }
}

pub struct Fixture {
    pub compiler: Arc<PricingCompiler>,
    pub market_data: Arc<InMemoryMarketDataProvider>,
    pub pricing: Pricing,
    pub processor: ViewProcessor,
}

pub fn fixture(compiler: PricingCompiler) -> Fixture {
    fixture_with(compiler, |builder, _| builder)
}

/// Like [`fixture`], letting the test adjust the processor before it is built.
pub fn fixture_with(
    compiler: PricingCompiler,
    configure: impl FnOnce(ViewProcessorBuilder, &Pricing) -> ViewProcessorBuilder,
) -> Fixture {
    let compiler = Arc::new(compiler);
    let market_data = Arc::new(InMemoryMarketDataProvider::new());
    market_data.set_value(spot_requirement(), 100.0);
    let pricing = Pricing::default();
    let builder = ViewProcessor::builder(compiler.clone(), market_data.clone())
        .functions(pricing.registry())
        .config(ViewProcessorConfig::minimal());
    let processor = configure(builder, &pricing).build().unwrap();
    Fixture {
        compiler,
        market_data,
        pricing,
        processor,
    }
}

pub fn is_compiled(event: &ListenerEvent) -> bool {
    matches!(event, ListenerEvent::Compiled(_))
}

pub fn is_result(event: &ListenerEvent) -> bool {
    matches!(event, ListenerEvent::CycleCompleted { .. })
}

pub fn is_cycle_started(event: &ListenerEvent) -> bool {
    matches!(event, ListenerEvent::CycleStarted(_))
}

pub fn is_completed(event: &ListenerEvent) -> bool {
    matches!(event, ListenerEvent::ProcessCompleted)
}

pub fn is_terminated(event: &ListenerEvent) -> bool {
    matches!(event, ListenerEvent::ProcessTerminated { .. })
}

/// `PV` in a full result.
pub fn pv(result: &view_flow::ViewComputationResultModel) -> Option<Value> {
    use view_flow::ViewResultModel;
    result
        .value("Default", &security(), "PV")
        .map(|computed| computed.value.clone())
}

/// Poll `condition` until it holds or [`TIMEOUT`] elapses.
pub fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TIMEOUT;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
