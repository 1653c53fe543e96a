//! View process lifecycle: sequences, recompilation, failures, suspension and stopping.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use view_flow::{
    CalculationJob, CycleType, ExecutionOptions, InvokerError, JobInvoker, JobResultSender,
    ListenerEvent, LocalJobInvoker, MissingValue, ResultCollector, Value, ViewClient,
    ViewProcessState, ViewProcessorConfig, ViewResultModel,
};

/// Attach a new client. Dropping the returned client detaches it.
fn attach(fixture: &Fixture, options: ExecutionOptions) -> (ViewClient, Arc<ResultCollector>) {
    let collector = Arc::new(ResultCollector::new());
    let client = fixture.processor.create_view_client();
    client.set_result_listener(Some(collector.clone())).unwrap();
    client
        .attach_to_view_process("Pricing".into(), options)
        .unwrap();
    (client, collector)
}

// ============================================================================
// Arbitrary sequences
// ============================================================================

#[test]
fn test_arbitrary_sequence_recompiles_when_view_expires() {
    // Each compilation is valid for two hours after its valuation time.
    let fixture = fixture(PricingCompiler::valid_for(Duration::from_secs(2 * 3600)));
    let instants = [instant(1), instant(2), instant(3), instant(4)];
    let (_client, collector) = attach(&fixture, ExecutionOptions::arbitrary(instants));

    assert!(collector.wait_for_count(TIMEOUT, 1, is_completed));
    assert_eq!(fixture.compiler.compilations(), 2);

    let kinds: Vec<&str> = collector
        .events()
        .iter()
        .map(|event| match event {
            ListenerEvent::Compiled(_) => "compiled",
            ListenerEvent::CycleStarted(_) => "started",
            ListenerEvent::CycleCompleted { .. } => "result",
            ListenerEvent::ProcessCompleted => "completed",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "compiled", "started", "result", "started", "result", "started", "result",
            "compiled", "started", "result", "completed",
        ]
    );

    let valuation_times: Vec<_> = collector
        .full_results()
        .iter()
        .map(|result| result.valuation_time())
        .collect();
    assert_eq!(valuation_times, instants.to_vec());
    for result in collector.full_results() {
        assert_eq!(pv(&result), Some(Value::Double(200.0)));
    }
    assert!(fixture.processor.view_processes().is_empty());
}

#[test]
fn test_compile_only_never_executes() {
    let fixture = fixture(PricingCompiler::new());
    let (_client, collector) = attach(
        &fixture,
        ExecutionOptions::arbitrary([instant(1), instant(2)]).compile_only(),
    );

    assert!(collector.wait_for_count(TIMEOUT, 1, is_completed));
    assert_eq!(collector.count(is_compiled), 1);
    assert_eq!(collector.count(is_cycle_started), 0);
    assert_eq!(collector.count(is_result), 0);
    assert_eq!(fixture.pricing.pricer_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_await_market_data_waits_for_late_values() {
    let fixture = fixture(PricingCompiler::new());
    fixture.market_data.remove_value(&spot_requirement());

    let market_data = fixture.market_data.clone();
    let publisher = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        market_data.set_value(spot_requirement(), 120.0);
    });
    let (_client, collector) = attach(
        &fixture,
        ExecutionOptions::arbitrary([instant(1)]).await_market_data(),
    );
    publisher.join().unwrap();

    assert!(collector.wait_for_count(TIMEOUT, 1, is_completed));
    let results = collector.full_results();
    assert_eq!(results.len(), 1);
    assert_eq!(pv(&results[0]), Some(Value::Double(240.0)));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_first_compilation_failure_terminates() {
    let compiler = PricingCompiler::new();
    compiler.fail.store(true, Ordering::SeqCst);
    let fixture = fixture(compiler);
    let (_client, collector) = attach(&fixture, ExecutionOptions::infinite());

    assert!(collector.wait_for_count(TIMEOUT, 1, is_terminated));
    let events = collector.events();
    assert!(matches!(
        &events[0],
        ListenerEvent::CompilationFailed(message) if message.contains("AAPL-BOOK")
    ));
    assert!(matches!(
        events.last(),
        Some(ListenerEvent::ProcessTerminated {
            execution_interrupted: false
        })
    ));
    assert_eq!(collector.count(is_result), 0);
    assert!(fixture.processor.view_processes().is_empty());
}

#[test]
fn test_throwing_function_yields_marker_and_process_continues() {
    let fixture = fixture(PricingCompiler::new());
    fixture.pricing.pricer_fails.store(true, Ordering::SeqCst);
    let (_client, collector) = attach(&fixture, ExecutionOptions::arbitrary([instant(1), instant(2)]));

    assert!(collector.wait_for_count(TIMEOUT, 1, is_completed));
    let results = collector.full_results();
    assert_eq!(results.len(), 2);
    for result in &results {
        let pv = result.value("Default", &security(), "PV").unwrap();
        assert!(pv.is_failure());
        let delta = result.value("Default", &security(), "Delta").unwrap();
        assert_eq!(delta.value, Value::Double(1.0));
    }
}

#[test]
fn test_recompilation_failure_skips_cycle_until_view_compiles() {
    // The view expires two hours after compiling; the recompilation at instant 4 fails.
    let compiler = PricingCompiler {
        fail_compilation: Some(2),
        ..PricingCompiler::valid_for(Duration::from_secs(2 * 3600))
    };
    let fixture = fixture(compiler);
    let (_client, collector) = attach(
        &fixture,
        ExecutionOptions::arbitrary([instant(1), instant(4), instant(5)]),
    );

    assert!(collector.wait_for_count(TIMEOUT, 1, is_completed));
    assert_eq!(fixture.compiler.compilations(), 3);
    let kinds: Vec<&str> = collector
        .events()
        .iter()
        .map(|event| match event {
            ListenerEvent::Compiled(_) => "compiled",
            ListenerEvent::CompilationFailed(_) => "failed",
            ListenerEvent::CycleStarted(_) => "started",
            ListenerEvent::CycleCompleted { .. } => "result",
            ListenerEvent::ProcessCompleted => "completed",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "compiled", "started", "result", "failed", "compiled", "started", "result",
            "completed",
        ]
    );

    // Nothing was computed from the expired view.
    let valuation_times: Vec<_> = collector
        .full_results()
        .iter()
        .map(|result| result.valuation_time())
        .collect();
    assert_eq!(valuation_times, vec![instant(1), instant(5)]);
    assert_eq!(collector.count(is_terminated), 0);
}

#[test]
fn test_failed_forced_rebuild_is_retried() {
    let fixture = fixture(PricingCompiler::new());
    let (_client, collector) = attach(&fixture, ExecutionOptions::on_input_change());
    assert!(collector.wait_for_count(TIMEOUT, 1, is_result));
    let process = fixture.processor.view_processes().pop().unwrap();

    fixture.compiler.fail.store(true, Ordering::SeqCst);
    process.force_graph_rebuild().unwrap();
    assert!(collector.wait_for_count(TIMEOUT, 1, |event| matches!(
        event,
        ListenerEvent::CompilationFailed(_)
    )));
    assert!(!process.state().is_terminal());
    assert_eq!(collector.count(is_result), 1);

    // The rebuild is still owed: the next cycle compiles again instead of reusing the view.
    fixture.compiler.fail.store(false, Ordering::SeqCst);
    process.trigger_cycle().unwrap();
    assert!(collector.wait_for_count(TIMEOUT, 2, is_result));
    assert_eq!(fixture.compiler.compilations(), 3);
    assert_eq!(collector.count(is_compiled), 2);
}

/// Local invoker over the pricing functions that can be taken offline.
struct SwitchableInvoker {
    inner: LocalJobInvoker,
    offline: Arc<AtomicBool>,
}

impl JobInvoker for SwitchableInvoker {
    fn id(&self) -> &str {
        "switchable"
    }

    fn invoke(&self, job: CalculationJob, results: JobResultSender) -> Result<(), InvokerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(InvokerError::Unavailable {
                invoker: "switchable".into(),
                reason: "offline".into(),
            });
        }
        self.inner.invoke(job, results)
    }
}

#[test]
fn test_nodes_without_invoker_are_retried_next_cycle() {
    let offline = Arc::new(AtomicBool::new(true));
    let fixture = fixture_with(PricingCompiler::new(), |builder, pricing| {
        let inner = LocalJobInvoker::new("pool", 1, Arc::new(pricing.registry())).unwrap();
        builder
            .config(ViewProcessorConfig::minimal().with_local_worker_threads(0))
            .invoker(Arc::new(SwitchableInvoker {
                inner,
                offline: offline.clone(),
            }))
    });
    let (_client, collector) = attach(&fixture, ExecutionOptions::on_input_change());
    assert!(collector.wait_for_count(TIMEOUT, 1, is_result));
    assert_eq!(
        pv(&collector.full_results()[0]),
        Some(Value::Missing(MissingValue::Suppressed))
    );
    assert_eq!(fixture.pricing.pricer_calls.load(Ordering::SeqCst), 0);

    // Same market data, invoker back: the suppressed nodes run instead of carrying markers.
    offline.store(false, Ordering::SeqCst);
    let process = fixture.processor.view_processes().pop().unwrap();
    process.trigger_cycle().unwrap();
    assert!(collector.wait_for_count(TIMEOUT, 2, is_result));

    let second = &collector.full_results()[1];
    assert_eq!(pv(second), Some(Value::Double(200.0)));
    let delta = second.value("Default", &security(), "Delta").unwrap();
    assert_eq!(delta.value, Value::Double(1.0));
    assert_eq!(fixture.pricing.pricer_calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Live sequences
// ============================================================================

#[test]
fn test_market_data_change_runs_delta_cycle() {
    let fixture = fixture(PricingCompiler::new());
    let (_client, collector) = attach(&fixture, ExecutionOptions::on_input_change());
    assert!(collector.wait_for_count(TIMEOUT, 1, is_result));

    fixture.market_data.set_value(spot_requirement(), 110.0);
    assert!(collector.wait_for_count(TIMEOUT, 2, is_result));

    let cycle_types: Vec<CycleType> = collector
        .events()
        .iter()
        .filter_map(|event| match event {
            ListenerEvent::CycleStarted(metadata) => Some(metadata.cycle_type),
            _ => None,
        })
        .collect();
    assert_eq!(cycle_types, vec![CycleType::Full, CycleType::Delta]);
    assert_eq!(
        pv(&collector.full_results()[1]),
        Some(Value::Double(220.0))
    );
    assert_eq!(fixture.compiler.compilations(), 1);
}

#[test]
fn test_unrelated_market_data_does_not_cycle() {
    let fixture = fixture(PricingCompiler::new());
    let (_client, collector) = attach(&fixture, ExecutionOptions::on_input_change());
    assert!(collector.wait_for_count(TIMEOUT, 1, is_result));

    fixture.market_data.set_value(
        view_flow::ValueRequirement::new("Spot", view_flow::TargetSpecification::security("MSFT")),
        50.0,
    );
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(collector.count(is_result), 1);
}

#[test]
fn test_function_init_id_change_recompiles_and_runs_full_cycle() {
    let fixture = fixture(PricingCompiler::new());
    let (_client, collector) = attach(&fixture, ExecutionOptions::on_input_change());
    assert!(collector.wait_for_count(TIMEOUT, 1, is_result));
    let calls = fixture.pricing.pricer_calls.load(Ordering::SeqCst);

    fixture.compiler.function_init_id.store(7, Ordering::SeqCst);
    let process = fixture.processor.view_processes().pop().unwrap();
    process.trigger_cycle().unwrap();
    assert!(collector.wait_for_count(TIMEOUT, 2, is_result));

    assert_eq!(fixture.compiler.compilations(), 2);
    assert_eq!(collector.count(is_compiled), 2);
    assert!(fixture.pricing.pricer_calls.load(Ordering::SeqCst) > calls);
    let last_started = collector
        .events()
        .iter()
        .rev()
        .find_map(|event| match event {
            ListenerEvent::CycleStarted(metadata) => Some(metadata.cycle_type),
            _ => None,
        });
    assert_eq!(last_started, Some(CycleType::Full));
}

#[test]
fn test_unchanged_inputs_carry_values_forward() {
    let fixture = fixture(PricingCompiler::new());
    let (_client, collector) = attach(&fixture, ExecutionOptions::on_input_change());
    assert!(collector.wait_for_count(TIMEOUT, 1, is_result));
    let calls = fixture.pricing.pricer_calls.load(Ordering::SeqCst);

    let process = fixture.processor.view_processes().pop().unwrap();
    process.trigger_cycle().unwrap();
    assert!(collector.wait_for_count(TIMEOUT, 2, is_result));

    assert_eq!(fixture.pricing.pricer_calls.load(Ordering::SeqCst), calls);
    assert_eq!(pv(&collector.full_results()[1]), Some(Value::Double(200.0)));
}

// ============================================================================
// Suspension and stopping
// ============================================================================

#[test]
fn test_suspended_processor_holds_cycles_until_resumed() {
    let fixture = fixture(PricingCompiler::new());
    fixture.processor.suspend().unwrap();
    let (_client, collector) = attach(&fixture, ExecutionOptions::arbitrary([instant(1)]));

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(collector.count(is_cycle_started), 0);
    assert_eq!(fixture.compiler.compilations(), 0);

    fixture.processor.resume().unwrap();
    assert!(collector.wait_for_count(TIMEOUT, 1, is_completed));
    assert_eq!(collector.count(is_result), 1);
}

#[test]
fn test_stop_mid_cycle_discards_the_cycle() {
    let fixture = fixture(PricingCompiler::new());
    fixture.pricing.pricer_delay.store(300, Ordering::SeqCst);
    let (_client, collector) = attach(&fixture, ExecutionOptions::infinite());
    assert!(collector.wait_for_count(TIMEOUT, 1, is_cycle_started));

    let process = fixture.processor.view_processes().pop().unwrap();
    process.stop();
    assert!(process.join(TIMEOUT));
    assert_eq!(process.state(), ViewProcessState::Terminated);
    assert!(process.latest_result().is_none());

    // Let the in-flight job finish; its result must not surface.
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(collector.count(is_result), 0);
    assert!(matches!(
        collector.events().last(),
        Some(ListenerEvent::ProcessTerminated {
            execution_interrupted: true
        })
    ));
    assert!(process.trigger_cycle().unwrap_err().is_illegal_state());
}

#[test]
fn test_persistent_process_outlives_clients() {
    let fixture = fixture(PricingCompiler::new());
    let process = fixture
        .processor
        .create_persistent_process("Pricing".into(), ExecutionOptions::on_input_change())
        .unwrap();
    assert!(process.is_persistent());

    let client = fixture.processor.create_view_client();
    client
        .attach_to_view_process("Pricing".into(), ExecutionOptions::on_input_change())
        .unwrap();
    assert_eq!(client.process().map(|p| p.id()), Some(process.id()));
    client.detach();

    assert!(!process.join(Duration::from_millis(50)));
    assert!(!process.state().is_terminal());
    fixture.processor.stop();
    assert_eq!(process.state(), ViewProcessState::Terminated);
}

#[test]
fn test_stop_while_awaiting_market_data_returns_promptly() {
    let fixture = fixture_with(PricingCompiler::new(), |builder, _| {
        builder.config(
            ViewProcessorConfig::minimal().with_market_data_timeout(Duration::from_secs(30)),
        )
    });
    fixture.market_data.remove_value(&spot_requirement());
    let (_client, collector) = attach(
        &fixture,
        ExecutionOptions::arbitrary([instant(1)]).await_market_data(),
    );
    assert!(collector.wait_for_count(TIMEOUT, 1, is_compiled));

    let stopping = Instant::now();
    fixture.processor.stop();
    assert!(stopping.elapsed() < Duration::from_secs(2));
    assert_eq!(collector.count(is_cycle_started), 0);
    assert_eq!(collector.count(is_terminated), 1);
}
