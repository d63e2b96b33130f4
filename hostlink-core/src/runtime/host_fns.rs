//! Embedder-registered forwarders.
//!
//! A forwarder is a host function the guest imports by name. Its parameters are handle
//! indices (borrowed, the guest keeps ownership) and its result is a fresh handle the guest
//! owns, or 0 for `undefined`/`null`. A forwarder returning `Err(value)` throws: the value goes
//! to the exception slot and the guest sees 0.

use super::sandbox::WasmtimeSandbox;
use crate::error::Result;
use crate::exception;
use crate::sandbox::Sandbox;
use crate::state::BridgeState;
use crate::value::{HostResult, HostValue};

use std::sync::Arc;
use tracing::debug;
use wasmtime::{Caller, FuncType, Linker, Val, ValType};

/// Signature of a forwarder.
pub type HostFn = dyn Fn(&mut dyn Sandbox, &[HostValue]) -> HostResult + Send + Sync;

#[derive(Clone)]
struct Registration {
    name: String,
    arity: usize,
    f: Arc<HostFn>,
}

/// Forwarders waiting to be defined into a linker.
#[derive(Clone, Default)]
pub struct HostFunctions {
    registered: Vec<Registration>,
    defined: usize,
}

impl HostFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        arity: usize,
        f: impl Fn(&mut dyn Sandbox, &[HostValue]) -> HostResult + Send + Sync + 'static,
    ) {
        let name = name.into();
        debug!(%name, arity, "host function registered");
        self.registered.push(Registration {
            name,
            arity,
            f: Arc::new(f),
        });
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Define every forwarder registered since the last call.
    pub fn define_pending(&mut self, linker: &mut Linker<BridgeState>, module: &str) -> anyhow::Result<()> {
        for reg in &self.registered[self.defined..] {
            let ty = FuncType::new(
                linker.engine(),
                std::iter::repeat_n(ValType::I32, reg.arity),
                [ValType::I32],
            );
            let f = Arc::clone(&reg.f);
            linker.func_new(
                module,
                &reg.name,
                ty,
                move |mut caller: Caller<'_, BridgeState>, params: &[Val], results: &mut [Val]| {
                    let handles: Vec<u32> = params
                        .iter()
                        .map(|v| v.unwrap_i32() as u32)
                        .collect();
                    let mut sb = WasmtimeSandbox::new(&mut caller);
                    let ret = dispatch(&mut sb, f.as_ref(), &handles)?;
                    results[0] = Val::I32(ret as i32);
                    Ok(())
                },
            )?;
        }
        self.defined = self.registered.len();
        Ok(())
    }
}

/// Lift handle arguments, run `f` under the exception guard, lower the result.
pub fn dispatch(sb: &mut dyn Sandbox, f: &HostFn, handles: &[u32]) -> Result<u32> {
    let args = {
        let table = &sb.state().table;
        handles
            .iter()
            .map(|&h| table.get(h).cloned())
            .collect::<Result<Vec<_>>>()?
    };

    exception::guard(sb, |sb| {
        Ok(f(sb, &args).map(|ret| sb.state().table.insert_optional(ret)))
    })
}
