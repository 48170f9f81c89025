//! Bridge runtime: Wasmtime engine, module loading, and guest instances.
//!
//! A [`Bridge`] is a validated, compiled module plus its engine. It is
//! `Send + Sync` and cheap to clone, so worker threads can each instantiate
//! their own [`GuestInstance`] from it, over a shared memory if the module
//! imports one. A `GuestInstance` owns its store and with it every host
//! value its guest can name; it never leaves the thread that created it.

use std::path::Path;

use wasmtime::{
    Config, Engine, Instance, Linker, Module, SharedMemory, Store, WasmParams, WasmResults,
};

use tether_hostapi::{
    BridgeError, CallError, Handle, HandleTable, HostValue, ObjectRef, PromiseRef,
};

use crate::config::BridgeConfig;
use crate::error::RuntimeError;
use crate::host_impl::{settle_trap, Boundary, GuestExports, HostState};
use crate::linker::register_host_functions;
use crate::loader::{self, ModuleSource, Phase};
use crate::memory::{self, GuestMemory, MemoryPlan, MemorySource};
use crate::platform::default_globals;
use crate::validation::validate_module;

/// A compiled, validated guest module.
#[derive(Clone)]
pub struct Bridge {
    engine: Engine,
    module: Module,
    config: BridgeConfig,
}

impl Bridge {
    /// Create a bridge from module bytes (binary or text format).
    ///
    /// Validates the module's imports and exports before accepting.
    pub fn new(wasm_bytes: &[u8], config: BridgeConfig) -> Result<Self, RuntimeError> {
        Self::load(ModuleSource::Bytes(wasm_bytes.to_vec()), config)
    }

    /// Load from a `.wasm` file path.
    pub fn from_file(path: &Path, config: BridgeConfig) -> Result<Self, RuntimeError> {
        Self::load(ModuleSource::File(path.to_path_buf()), config)
    }

    /// Load from any module source.
    pub fn load(source: ModuleSource, config: BridgeConfig) -> Result<Self, RuntimeError> {
        Self::load_with(source, config, &mut |_| {})
    }

    pub(crate) fn load_with(
        source: ModuleSource,
        config: BridgeConfig,
        on_phase: &mut dyn FnMut(Phase),
    ) -> Result<Self, RuntimeError> {
        let engine = create_engine()?;
        let module = loader::compile(&engine, source, &mut |phase| {
            log::debug!("loader phase: {phase:?}");
            on_phase(phase);
        })?;
        validate_module(&module, &config)?;
        Ok(Self {
            engine,
            module,
            config,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// What the module declares about its memory.
    pub fn memory_plan(&self) -> MemoryPlan {
        MemoryPlan::of(&self.module, &self.config)
    }

    /// Link a fresh instance with its own store, handle table, exception
    /// register and job queue.
    pub fn instantiate(&self, memory: MemorySource) -> Result<GuestInstance, RuntimeError> {
        let plan = self.memory_plan();
        let state = HostState::new(self.config.max_handles, default_globals());
        let mut store = Store::new(&self.engine, state);

        let mut linker = Linker::new(&self.engine);
        register_host_functions(&mut linker, &self.config.import_module)?;

        let imported = match memory::provide(&self.engine, &mut store, &plan, memory, &self.config)? {
            Some((region, guest_memory)) => {
                linker.define(&store, &self.config.import_module, "memory", region)?;
                Some(guest_memory)
            }
            None => None,
        };

        let instance = linker.instantiate(&mut store, &self.module)?;

        let guest_memory = match imported {
            Some(m) => m,
            None => GuestMemory::exported(&instance, &mut store, &self.config.memory_export)
                .ok_or_else(|| RuntimeError::MemoryError("no memory export".into()))?,
        };
        let exports = GuestExports {
            malloc: instance.get_typed_func(&mut store, "tether_malloc").ok(),
            realloc: instance.get_typed_func(&mut store, "tether_realloc").ok(),
            table: instance.get_table(&mut store, &self.config.table_export),
        };
        let state = store.data_mut();
        state.memory = Some(guest_memory);
        state.exports = exports;
        log::debug!("loader phase: {:?}", Phase::Linked);

        Ok(GuestInstance {
            store,
            instance,
            config: self.config.clone(),
            phase: Phase::Linked,
        })
    }
}

/// Create a Wasmtime engine able to host shared memories.
fn create_engine() -> Result<Engine, RuntimeError> {
    let mut wasm_config = Config::new();
    wasm_config.wasm_threads(true);
    Ok(Engine::new(&wasm_config)?)
}

/// One linked guest and everything it can name.
pub struct GuestInstance {
    store: Store<HostState>,
    instance: Instance,
    config: BridgeConfig,
    phase: Phase,
}

impl GuestInstance {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the guest start export, if it has one. Runs at most once.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if self.phase == Phase::Started {
            return Err(BridgeError::AlreadyStarted.into());
        }
        self.phase = Phase::Started;
        log::debug!("loader phase: {:?}", Phase::Started);
        let start = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, &self.config.start_export)
            .ok();
        if let Some(start) = start {
            let result = start.call(&mut self.store, ());
            self.settle(result)?;
        }
        Ok(())
    }

    /// Call a guest export.
    pub fn call<P, R>(&mut self, name: &str, params: P) -> Result<R, RuntimeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self.instance.get_typed_func::<P, R>(&mut self.store, name)?;
        let result = func.call(&mut self.store, params);
        self.settle(result)
    }

    /// Call a host value as a function, e.g. a closure the guest registered.
    pub fn invoke(&mut self, f: &HostValue, args: &[HostValue]) -> Result<HostValue, RuntimeError> {
        let callable = f.as_callable().cloned().ok_or_else(|| {
            RuntimeError::Thrown(format!("TypeError: {} is not a function", f.debug_string()))
        })?;
        let mut boundary = self.boundary();
        callable.call(&mut boundary, args).map_err(call_error)
    }

    /// Run queued promise reactions until none are left.
    pub fn run_until_idle(&mut self) -> Result<usize, RuntimeError> {
        let mut boundary = self.boundary();
        Ok(tether_hostapi::run_until_idle(&mut boundary)?)
    }

    /// Number of promise reactions waiting to run.
    pub fn pending_jobs(&self) -> usize {
        self.store.data().jobs.len()
    }

    /// A boundary context over this instance's store.
    pub fn boundary(&mut self) -> Boundary<'_> {
        Boundary::from(&mut self.store)
    }

    // ── Handles ──

    /// Clone the value behind handle `h`, if it is live.
    pub fn value(&self, h: u32) -> Option<HostValue> {
        self.store.data().handles.get(Handle(h)).ok().cloned()
    }

    /// Give the guest a handle to `value`.
    pub fn alloc(&mut self, value: HostValue) -> Result<u32, RuntimeError> {
        Ok(self.boundary().alloc(value)?)
    }

    pub fn drop_handle(&mut self, h: u32) -> Result<(), RuntimeError> {
        Ok(self.store.data_mut().handles.drop(Handle(h))?)
    }

    pub fn handles(&self) -> &HandleTable {
        &self.store.data().handles
    }

    /// Take the value in the exception register.
    pub fn take_exception(&mut self) -> Option<HostValue> {
        self.store.data_mut().exception.take()
    }

    /// Create a promise settled by the host, returned with its resolvers.
    pub fn new_promise(&mut self) -> (PromiseRef, HostValue, HostValue) {
        let promise = PromiseRef::new();
        let (resolve, reject) = promise.resolvers();
        (promise, resolve.into(), reject.into())
    }

    // ── Globals ──

    pub fn globals(&self) -> ObjectRef {
        self.store.data().globals.clone()
    }

    /// Make `value` reachable from the guest through `global_get(name)`.
    pub fn install_global(&mut self, name: &str, value: HostValue) {
        self.store.data().globals.set(name, value);
    }

    // ── Memory ──

    /// The shared region backing this instance, if its memory is shared.
    pub fn shared_memory(&self) -> Option<SharedMemory> {
        self.store
            .data()
            .memory
            .as_ref()
            .and_then(|m| m.as_shared().cloned())
    }

    /// Current linear memory size in bytes.
    pub fn memory_size(&self) -> usize {
        match &self.store.data().memory {
            Some(m) => m.data_size(&self.store),
            None => 0,
        }
    }

    /// How many times a memory view has been (re)built.
    pub fn view_rebuilds(&self) -> u64 {
        self.store.data().views.rebuilds()
    }

    fn settle<R>(&mut self, result: anyhow::Result<R>) -> Result<R, RuntimeError> {
        result.map_err(|err| call_error(settle_trap(self.store.data_mut(), err)))
    }
}

fn call_error(err: CallError) -> RuntimeError {
    match err {
        CallError::Thrown(value) => RuntimeError::Thrown(value.debug_string()),
        CallError::Fault(BridgeError::GuestTrap(msg)) => RuntimeError::GuestTrapped(msg),
        CallError::Fault(fault) => RuntimeError::Bridge(fault),
    }
}
