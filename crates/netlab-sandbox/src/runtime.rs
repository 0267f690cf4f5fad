//! Orchestrator: instantiate, invoke, report, clean up
//!
//! Compiling a module is the only asynchronous step. Once the guest's
//! entrypoint starts, every host call it makes runs synchronously on the same
//! stack until it returns or traps. Nothing bounds how long that takes: a
//! guest that never returns blocks its caller.

use crate::bridge::AllocatorExports;
use crate::host::{self, HostState};
use crate::ledger::Handle;
use crate::memory::{AddressSpace, Space};
use crate::network::{self, VirtualNet};
use crate::variant::{Payload, ResultShape, Variant};
use crate::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wasmtime::{Engine, Instance, Linker, Module, Store, StoreLimitsBuilder, Trap};

/// Configuration for the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum size of any one linear memory in the store, in bytes
    pub max_memory: usize,
    /// Zero-argument guest export returning a pointer
    pub entrypoint: String,
    /// Name of the memory export on both modules
    pub memory_export: String,
    /// Allocator exports on the network module
    pub allocator: AllocatorExports,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024, // 64MB
            entrypoint: "main".to_string(),
            memory_export: "memory".to_string(),
            allocator: AllocatorExports::default(),
        }
    }
}

impl SandboxConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Where an orchestrator is in its current invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninstantiated,
    Instantiated,
    Invoking,
    Succeeded,
    Failed,
    CleanedUp,
}

/// Result of one invocation, as delivered to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded(Payload),
    Failed(String),
}

/// Runs guest modules against an (optional) virtual network module.
///
/// Both modules live in one store so host calls can reach the network
/// instance directly; their memories stay separate. Each invocation gets a
/// fresh store with a fresh network instance, so nothing from one guest
/// (instances, memories, sockets) outlives its run. The last run's store is
/// kept until the next one starts, for inspection.
pub struct Orchestrator {
    engine: Engine,
    config: SandboxConfig,
    network: Option<Module>,
    store: Store<HostState>,
    phase: Phase,
}

impl Orchestrator {
    /// Create an orchestrator with no network attached
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let engine = Engine::default();
        let store = new_store(&engine, &config);

        debug!(max_memory = config.max_memory, "sandbox created; guest execution is not time-bounded");
        Ok(Self {
            engine,
            config,
            network: None,
            store,
            phase: Phase::Uninstantiated,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Sockets currently open on behalf of a guest
    pub fn open_sockets(&self) -> usize {
        self.store.data().ledger.len()
    }

    /// Compile off the async executor; this is the suspension point.
    async fn compile(&self, wasm: Vec<u8>) -> Result<Module> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || Module::new(&engine, &wasm))
            .await
            .map_err(|e| SandboxError::CompilationFailed(e.to_string()))?
            .map_err(|e| SandboxError::CompilationFailed(format!("{e:#}")))
    }

    /// Load the virtual network module. Every later invocation runs against a
    /// fresh instance of it; its simulated state does not carry over.
    pub async fn attach_network(&mut self, wasm: impl Into<Vec<u8>>) -> Result<()> {
        let module = self.compile(wasm.into()).await?;
        let mut store = new_store(&self.engine, &self.config);
        self.instantiate_network(&mut store, &module)?;

        self.store = store;
        self.network = Some(module);
        info!("virtual network attached");
        Ok(())
    }

    fn instantiate_network(&self, store: &mut Store<HostState>, module: &Module) -> Result<()> {
        let instance = Linker::new(&self.engine)
            .instantiate(&mut *store, module)
            .map_err(|e| SandboxError::InstantiationFailed {
                module: Space::Network,
                reason: format!("{e:#}"),
            })?;
        let network = VirtualNet::from_instance(
            &mut *store,
            instance,
            &self.config.memory_export,
            &self.config.allocator,
        )?;
        store.data_mut().attach_network(network);
        Ok(())
    }

    /// Drop the previous invocation's store and start a new one
    fn reset(&mut self) -> Result<()> {
        let mut store = new_store(&self.engine, &self.config);
        let attached = match &self.network {
            Some(module) => self.instantiate_network(&mut store, module),
            None => Ok(()),
        };
        self.store = store;
        attached
    }

    /// Call a zero-argument `i32` export on the network module
    pub fn probe_network(&mut self, export: &str) -> Result<i32> {
        let instance = *self
            .store
            .data()
            .network()
            .ok_or(SandboxError::NetworkUnavailable)?
            .instance();
        let func = instance
            .get_typed_func::<(), i32>(&mut self.store, export)
            .map_err(|_| SandboxError::MissingExport {
                module: Space::Network,
                name: export.to_string(),
            })?;
        func.call(&mut self.store, ())
            .map_err(|e| crate::bridge::trapped("probe", e))
    }

    /// Run one guest to completion. Open sockets are released before this returns.
    pub async fn run(&mut self, variant: &Variant, wasm: impl Into<Vec<u8>>) -> Outcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("invocation", %run_id, variant = variant.name());
        self.phase = Phase::Uninstantiated;

        let compiled = self.compile(wasm.into()).instrument(span.clone()).await;

        span.in_scope(|| {
            let result = compiled.and_then(|module| self.run_compiled(variant, &module));
            self.phase = match result {
                Ok(_) => Phase::Succeeded,
                Err(_) => Phase::Failed,
            };

            let released = self.cleanup();
            if !released.is_empty() {
                info!(count = released.len(), "released sockets left open by guest");
            }

            match result {
                Ok(payload) => {
                    info!(bytes = payload.bytes().len(), "invocation succeeded");
                    Outcome::Succeeded(payload)
                }
                Err(err) => {
                    error!(%err, "invocation failed");
                    Outcome::Failed(err.to_string())
                }
            }
        })
    }

    /// Run one guest and deliver the outcome to exactly one callback, after cleanup
    pub async fn execute<S, F>(
        &mut self,
        variant: &Variant,
        wasm: impl Into<Vec<u8>>,
        on_success: S,
        on_failure: F,
    ) where
        S: FnOnce(Payload),
        F: FnOnce(String),
    {
        match self.run(variant, wasm).await {
            Outcome::Succeeded(payload) => on_success(payload),
            Outcome::Failed(message) => on_failure(message),
        }
    }

    fn run_compiled(&mut self, variant: &Variant, module: &Module) -> Result<Payload> {
        self.reset()?;
        self.invoke(variant, module)
    }

    fn invoke(&mut self, variant: &Variant, module: &Module) -> Result<Payload> {
        if variant.capabilities().needs_network() && self.store.data().network().is_none() {
            return Err(SandboxError::NetworkUnavailable);
        }

        let linker = host::capability_table(&self.engine, variant.capabilities()).map_err(|e| {
            SandboxError::InstantiationFailed {
                module: Space::Guest,
                reason: format!("{e:#}"),
            }
        })?;
        let instance = linker
            .instantiate(&mut self.store, module)
            .map_err(|e| classify(e, instantiation_failed))?;
        self.phase = Phase::Instantiated;

        let entry = self.entrypoint(&instance)?;
        self.phase = Phase::Invoking;
        let result = entry
            .call(&mut self.store, ())
            .map_err(|e| classify(e, SandboxError::ExecutionFailed))? as u32;
        debug!(result, "entrypoint returned");

        let memory = instance
            .get_memory(&mut self.store, &self.config.memory_export)
            .ok_or_else(|| SandboxError::MissingExport {
                module: Space::Guest,
                name: self.config.memory_export.clone(),
            })?;

        match variant.result() {
            ResultShape::Fixed(len) => {
                let packet = AddressSpace::guest(memory).read(&self.store, result, *len)?;
                Ok(Payload::Packet { packet })
            }
            ResultShape::Interpreted(interpreter) => {
                interpreter.interpret(result, memory.data(&self.store))
            }
        }
    }

    fn entrypoint(&mut self, instance: &Instance) -> Result<wasmtime::TypedFunc<(), i32>> {
        let name = &self.config.entrypoint;
        let func = instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| SandboxError::MissingEntrypoint(name.clone()))?;
        func.typed::<(), i32>(&self.store).map_err(|e| {
            SandboxError::ExecutionFailed(format!("entrypoint `{name}` has the wrong signature: {e}"))
        })
    }

    /// Drain the ledger. Runs after every invocation, whatever its outcome.
    fn cleanup(&mut self) -> Vec<Handle> {
        let released = network::drain_all(&mut self.store);
        if !self.store.data().ledger.is_empty() {
            warn!("socket ledger not empty after drain");
        }
        self.phase = Phase::CleanedUp;
        released
    }
}

fn new_store(engine: &Engine, config: &SandboxConfig) -> Store<HostState> {
    let limits = StoreLimitsBuilder::new()
        .memory_size(config.max_memory)
        .build();
    let mut store = Store::new(engine, HostState::new(config.memory_export.clone(), limits));
    store.limiter(|state| &mut state.limits);
    store
}

fn instantiation_failed(reason: String) -> SandboxError {
    SandboxError::InstantiationFailed {
        module: Space::Guest,
        reason,
    }
}

/// Recover the typed failure behind an error that unwound through the guest
fn classify(err: anyhow::Error, otherwise: fn(String) -> SandboxError) -> SandboxError {
    match err.downcast::<SandboxError>() {
        Ok(err) => err,
        Err(err) => match err.downcast_ref::<Trap>() {
            Some(trap) => SandboxError::GuestTrap(trap.to_string()),
            None => otherwise(format!("{err:#}")),
        },
    }
}
