//! Wasmtime-backed runtime for hostlink guests.
//!
//! Responsibilities:
//! - Create a Wasmtime `Engine`/`Store` with the configured feature flags.
//! - Define the primitive imports and any embedder forwarders.
//! - Instantiate a compiled `wasmtime::Module` and attach its exports to the bridge state.
//! - Offer the bridge operations (strings, handles, closures, exceptions) to the embedder.

use super::host_fns::HostFunctions;
use super::imports;
use super::sandbox::WasmtimeSandbox;
use crate::abi::GuestExports;
use crate::closure::{self, ClosureRef};
use crate::codec::{self, StringTransfer};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::loader;
use crate::sandbox::Sandbox;
use crate::state::BridgeState;
use crate::value::{HostResult, HostValue};

use tracing::{debug, info};
use wasmtime::{Instance, Linker, Module, Store, WasmParams, WasmResults};

/// Host-side runtime container. One guest instance per runtime.
pub struct HostlinkRuntime {
    pub engine: wasmtime::Engine,
    pub store: Store<BridgeState>,
    pub linker: Linker<BridgeState>,
    host_fns: HostFunctions,
    instance: Option<Instance>,
}

impl HostlinkRuntime {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let mut cfg = wasmtime::Config::new();
        let features = &config.features;

        cfg.wasm_multi_value(features.multi_value);
        cfg.wasm_bulk_memory(features.bulk_memory);
        cfg.wasm_reference_types(features.reference_types);
        cfg.wasm_simd(features.simd);
        cfg.wasm_exceptions(features.exceptions);

        // Proposals that depend on the ones above have to follow them.
        cfg.wasm_relaxed_simd(features.simd);
        cfg.wasm_function_references(features.reference_types);
        cfg.wasm_gc(features.reference_types);

        cfg.wasm_multi_memory(true);
        cfg.wasm_tail_call(true);

        if config.fuel_limit.is_some() {
            cfg.consume_fuel(true);
        }

        let engine = wasmtime::Engine::new(&cfg).map_err(BridgeError::engine)?;
        let mut store = Store::new(&engine, BridgeState::new(config.clone()));
        if let Some(fuel) = config.fuel_limit {
            store.set_fuel(fuel).map_err(BridgeError::engine)?;
        }

        let mut linker = Linker::new(&engine);
        imports::define_imports(&mut linker, &config.import_module).map_err(BridgeError::engine)?;

        Ok(Self {
            engine,
            store,
            linker,
            host_fns: HostFunctions::new(),
            instance: None,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.store.data().config
    }

    pub fn state(&self) -> &BridgeState {
        self.store.data()
    }

    pub fn state_mut(&mut self) -> &mut BridgeState {
        self.store.data_mut()
    }

    /// Register a forwarder the guest imports as `(i32 * arity) -> i32`.
    ///
    /// Must be called before `instantiate`.
    pub fn register_host_fn(
        &mut self,
        name: impl Into<String>,
        arity: usize,
        f: impl Fn(&mut dyn Sandbox, &[HostValue]) -> HostResult + Send + Sync + 'static,
    ) {
        self.host_fns.register(name, arity, f);
    }

    /// Compile `.wasm` or `.wat` bytes.
    pub fn load(&self, bytes: &[u8]) -> Result<Module> {
        Ok(loader::compile_module(&self.engine, bytes)?)
    }

    /// Instantiate `module`, attach its exports, initialize the handle table and run
    /// `hostlink_start` if exported.
    pub fn instantiate(&mut self, module: &Module) -> Result<()> {
        let import_module = self.config().import_module.clone();
        self.host_fns
            .define_pending(&mut self.linker, &import_module)
            .map_err(BridgeError::engine)?;

        let instance = self
            .linker
            .instantiate(&mut self.store, module)
            .map_err(BridgeError::from_guest)?;

        let exports = GuestExports::resolve(&instance, &mut self.store)?;
        debug!(?exports, "guest exports resolved");
        let start = exports.start.clone();

        let state = self.store.data_mut();
        state.attach(exports);
        state.table.init();
        self.instance = Some(instance);

        if let Some(start) = start {
            let r = start.call(&mut self.store, ());
            self.store.data_mut().views.invalidate_all();
            r.map_err(BridgeError::from_guest)?;
        }
        info!("guest instantiated");
        Ok(())
    }

    pub fn instance(&self) -> Result<Instance> {
        self.instance.ok_or(BridgeError::NotInstantiated)
    }

    fn sandbox(&mut self) -> WasmtimeSandbox<&mut Store<BridgeState>> {
        WasmtimeSandbox::new(&mut self.store)
    }

    /// Copy `s` into a fresh guest allocation.
    pub fn encode_string(&mut self, s: &str) -> Result<StringTransfer> {
        codec::encode(&mut self.sandbox(), s)
    }

    pub fn decode_string(&mut self, ptr: u32, len: u32) -> Result<String> {
        codec::decode_from(&mut self.sandbox(), ptr, len)
    }

    /// Put `value` in the handle table and return its index.
    pub fn insert_value(&mut self, value: HostValue) -> u32 {
        self.state_mut().table.insert(value)
    }

    pub fn value(&self, idx: u32) -> Result<HostValue> {
        self.state().table.get(idx).cloned()
    }

    /// Take a value the guest handed over, freeing its slot.
    pub fn take_value(&mut self, idx: u32) -> Result<HostValue> {
        self.state_mut().table.take(idx)
    }

    /// Call a guest closure from the host.
    pub fn invoke_closure(&mut self, closure: &ClosureRef, args: &[HostValue]) -> Result<()> {
        self.run_finalizers()?;
        closure::invoke(&mut self.sandbox(), closure, args)
    }

    /// Destroy guest closures no longer referenced by the host.
    pub fn run_finalizers(&mut self) -> Result<usize> {
        if self.instance.is_none() {
            return Ok(0);
        }
        closure::run_finalizers(&mut self.sandbox())
    }

    /// The pending exception, if any, removed from the slot and the handle table.
    pub fn take_exception(&mut self) -> Option<HostValue> {
        let state = self.state_mut();
        let idx = state.exn.take()?;
        state.table.take(idx).ok()
    }

    /// Call a guest export by name.
    pub fn call_export<P, R>(&mut self, name: &str, params: P) -> Result<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        self.run_finalizers()?;
        let instance = self.instance()?;
        let func = instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|e| BridgeError::Engine(format!("export `{name}`: {e:#}")))?;
        let r = func.call(&mut self.store, params);
        self.store.data_mut().views.invalidate_all();
        r.map_err(BridgeError::from_guest)
    }

    /// Fuel left in the store, when metering is enabled.
    pub fn fuel_remaining(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }
}
