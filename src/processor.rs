//! The view processor: registry and owner of processes and clients.
//!
//! A processor holds the services every process shares (compiler, market data, job
//! dispatch, caches, tracer) and keeps track of the processes and clients it created. It is
//! an explicit value; create as many as needed.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use view_flow::{ExecutionOptions, FunctionRegistry, InMemoryMarketDataProvider, ViewProcessor};
//!
//! let market_data = Arc::new(InMemoryMarketDataProvider::new());
//! let mut functions = FunctionRegistry::new();
//! functions.register_fn("Pricer", |invocation| Ok(invocation.each_output(1.0)));
//!
//! let processor = ViewProcessor::builder(Arc::new(compiler), market_data)
//!     .functions(functions)
//!     .build()?;
//! let client = processor.create_view_client();
//! client.attach_to_view_process("Risk".into(), ExecutionOptions::infinite())?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use parking_lot::Mutex;

use crate::cache::ComputationCacheSource;
use crate::client::{ClientInner, ViewClient};
use crate::compile::ViewCompiler;
use crate::config::ViewProcessorConfig;
use crate::delta::DeltaDefinition;
use crate::dispatch::JobDispatcher;
use crate::error::ViewError;
use crate::execution::ExecutionOptions;
use crate::function::FunctionRegistry;
use crate::id::{IdGenerator, ViewClientId, ViewDefinitionId, ViewProcessId};
use crate::invoker::{JobInvoker, LocalJobInvoker};
use crate::listener::ViewResultListener;
use crate::market_data::MarketDataProvider;
use crate::process::{ViewProcess, ViewProcessContext};
use crate::tracer::{NoopTracer, ViewTracer};
use crate::worker::SuspensionGate;

type ProcessKey = (ViewDefinitionId, ExecutionOptions);

#[derive(Default)]
struct ProcessRegistry {
    processes: BTreeMap<ViewProcessId, ViewProcess>,
    shared: HashMap<ProcessKey, ViewProcessId, ahash::RandomState>,
}

impl ProcessRegistry {
    /// Forget processes that finished or terminated.
    fn prune(&mut self) {
        self.processes
            .retain(|_, process| !process.state().is_terminal());
        let processes = &self.processes;
        self.shared.retain(|_, id| processes.contains_key(id));
    }
}

pub(crate) struct ProcessorInner {
    context: Arc<ViewProcessContext>,
    processes: Mutex<ProcessRegistry>,
    clients: Mutex<HashMap<ViewClientId, Weak<ClientInner>, ahash::RandomState>>,
    process_ids: IdGenerator,
    client_ids: IdGenerator,
    running: AtomicBool,
    local_invoker: Option<Arc<LocalJobInvoker>>,
}

impl ProcessorInner {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a process. It runs once [`ViewProcess::spawn`] is called.
    fn create_process(
        &self,
        registry: &mut ProcessRegistry,
        definition_id: ViewDefinitionId,
        options: ExecutionOptions,
        persistent: bool,
    ) -> ViewProcess {
        let id = ViewProcessId(self.process_ids.next_raw());
        let process = ViewProcess::new(
            id,
            definition_id.clone(),
            options.clone(),
            persistent,
            self.context.clone(),
        );
        registry.processes.insert(id, process.clone());
        registry.shared.insert((definition_id, options), id);
        process
    }

    /// Attach `listener` to the live process for a definition and options, starting one if
    /// there is none. A started process hears nothing before `listener` is attached.
    pub(crate) fn attach_to_shared_process(
        &self,
        definition_id: &ViewDefinitionId,
        options: &ExecutionOptions,
        listener: Arc<dyn ViewResultListener>,
    ) -> Result<(ViewProcess, usize), ViewError> {
        if !self.is_running() {
            return Err(ViewError::illegal_state("the view processor has been stopped"));
        }
        let (process, created) = {
            let mut registry = self.processes.lock();
            registry.prune();
            let key = (definition_id.clone(), options.clone());
            match registry
                .shared
                .get(&key)
                .and_then(|id| registry.processes.get(id))
                .cloned()
            {
                Some(process) => (process, false),
                None => (self.create_process(&mut registry, key.0, key.1, false), true),
            }
        };
        let key = process.attach_listener(listener)?;
        if created {
            process.spawn()?;
        }
        Ok((process, key))
    }

    pub(crate) fn process(&self, id: ViewProcessId) -> Option<ViewProcess> {
        let mut registry = self.processes.lock();
        registry.prune();
        registry.processes.get(&id).cloned()
    }

    pub(crate) fn remove_client(&self, id: ViewClientId) {
        self.clients.lock().remove(&id);
    }
}

/// Owns view processes and view clients and the services they share.
pub struct ViewProcessor {
    inner: Arc<ProcessorInner>,
}

impl std::fmt::Debug for ViewProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewProcessor")
            .field("running", &self.is_running())
            .field("suspended", &self.is_suspended())
            .field("processes", &self.inner.processes.lock().processes.len())
            .field("clients", &self.inner.clients.lock().len())
            .finish()
    }
}

/// Builder for [`ViewProcessor`].
pub struct ViewProcessorBuilder {
    compiler: Arc<dyn ViewCompiler>,
    market_data: Arc<dyn MarketDataProvider>,
    functions: FunctionRegistry,
    invokers: Vec<Arc<dyn JobInvoker>>,
    config: ViewProcessorConfig,
    tracer: Arc<dyn ViewTracer>,
}

impl ViewProcessorBuilder {
    /// Functions run by the local job invoker.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Add an invoker next to the local one, such as a remote node.
    pub fn invoker(mut self, invoker: Arc<dyn JobInvoker>) -> Self {
        self.invokers.push(invoker);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: ViewProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the tracer.
    pub fn tracer(mut self, tracer: Arc<dyn ViewTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Start the local worker pool and build the processor.
    pub fn build(self) -> anyhow::Result<ViewProcessor> {
        let config = self.config;
        let local_invoker = match config.local_worker_threads {
            0 => None,
            threads => Some(Arc::new(
                LocalJobInvoker::new("local", threads, Arc::new(self.functions))
                    .context("failed to start the local job invoker")?,
            )),
        };

        let mut dispatcher = JobDispatcher::new()
            .with_max_job_items(config.max_job_items)
            .with_job_timeout(config.job_timeout)
            .with_poll_interval(config.result_poll_interval)
            .with_tracer(self.tracer.clone());
        if let Some(local) = &local_invoker {
            dispatcher = dispatcher.with_invoker(local.clone());
        }
        for invoker in self.invokers {
            dispatcher = dispatcher.with_invoker(invoker);
        }
        if dispatcher.invoker_count() == 0 {
            anyhow::bail!("no job invokers: enable local worker threads or add an invoker");
        }

        let delta_definition = match config.delta_decimal_places {
            Some(decimal_places) => DeltaDefinition::with_decimal_places(decimal_places),
            None => DeltaDefinition::new(),
        };
        tracing::info!(
            invokers = dispatcher.invoker_count(),
            local_threads = config.local_worker_threads,
            "view processor started"
        );

        Ok(ViewProcessor {
            inner: Arc::new(ProcessorInner {
                context: Arc::new(ViewProcessContext {
                    compiler: self.compiler,
                    market_data: self.market_data,
                    dispatcher,
                    cache_source: ComputationCacheSource::new(),
                    delta_definition,
                    tracer: self.tracer,
                    config,
                    cycle_ids: IdGenerator::new(),
                    gate: SuspensionGate::default(),
                }),
                processes: Mutex::new(ProcessRegistry::default()),
                clients: Mutex::new(HashMap::default()),
                process_ids: IdGenerator::new(),
                client_ids: IdGenerator::new(),
                running: AtomicBool::new(true),
                local_invoker,
            }),
        })
    }
}

impl ViewProcessor {
    /// Start building a processor around a compiler and a market-data provider.
    pub fn builder(
        compiler: Arc<dyn ViewCompiler>,
        market_data: Arc<dyn MarketDataProvider>,
    ) -> ViewProcessorBuilder {
        ViewProcessorBuilder {
            compiler,
            market_data,
            functions: FunctionRegistry::new(),
            invokers: Vec::new(),
            config: ViewProcessorConfig::default(),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &ViewProcessorConfig {
        &self.inner.context.config
    }

    /// Create a detached client.
    pub fn create_view_client(&self) -> ViewClient {
        let id = ViewClientId(self.inner.client_ids.next_raw());
        let client = ViewClient::new(id, Arc::downgrade(&self.inner));
        let mut clients = self.inner.clients.lock();
        clients.retain(|_, client| client.strong_count() > 0);
        clients.insert(id, client.downgrade());
        client
    }

    /// Look up a client.
    pub fn view_client(&self, id: ViewClientId) -> Option<ViewClient> {
        self.inner
            .clients
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(ViewClient::from_inner)
    }

    /// Look up a live process.
    pub fn view_process(&self, id: ViewProcessId) -> Option<ViewProcess> {
        self.inner.process(id)
    }

    /// Live processes, in creation order.
    pub fn view_processes(&self) -> Vec<ViewProcess> {
        let mut registry = self.inner.processes.lock();
        registry.prune();
        registry.processes.values().cloned().collect()
    }

    /// Start a process that keeps running with no clients attached, until stopped.
    ///
    /// Clients attaching with the same definition and options share it.
    pub fn create_persistent_process(
        &self,
        definition_id: ViewDefinitionId,
        options: ExecutionOptions,
    ) -> Result<ViewProcess, ViewError> {
        self.ensure_running()?;
        let process = {
            let mut registry = self.inner.processes.lock();
            registry.prune();
            self.inner
                .create_process(&mut registry, definition_id, options, true)
        };
        process.spawn()?;
        Ok(process)
    }

    fn ensure_running(&self) -> Result<(), ViewError> {
        if !self.is_running() {
            return Err(ViewError::illegal_state("the view processor has been stopped"));
        }
        Ok(())
    }

    /// Hold off new cycles on every process, returning once in-flight cycles have drained.
    ///
    /// Must not be called from a result listener: the calling cycle would never drain.
    pub fn suspend(&self) -> Result<(), ViewError> {
        self.ensure_running()?;
        if !self.inner.context.gate.suspend() {
            return Err(ViewError::illegal_state("the view processor is already suspended"));
        }
        tracing::info!("view processor suspended");
        Ok(())
    }

    /// Let every process run cycles again.
    pub fn resume(&self) -> Result<(), ViewError> {
        self.ensure_running()?;
        if !self.inner.context.gate.resume() {
            return Err(ViewError::illegal_state("the view processor is not suspended"));
        }
        tracing::info!("view processor resumed");
        Ok(())
    }

    /// Returns true until [`stop`](Self::stop) is called.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Returns true while suspended.
    pub fn is_suspended(&self) -> bool {
        self.inner.context.gate.is_suspended()
    }

    /// Terminate every process, detaching their clients, and stop the worker pool.
    ///
    /// Stopping twice does nothing.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let processes: Vec<ViewProcess> = {
            let mut registry = self.inner.processes.lock();
            registry.shared.clear();
            std::mem::take(&mut registry.processes).into_values().collect()
        };
        for process in &processes {
            process.stop();
        }
        for process in &processes {
            process.join_worker();
        }
        self.inner.context.gate.resume();
        if let Some(local) = &self.inner.local_invoker {
            local.shutdown();
        }
        tracing::info!(processes = processes.len(), "view processor stopped");
    }
}

impl Drop for ViewProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
