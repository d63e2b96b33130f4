//! `Sandbox` over a live Wasmtime instance.
//!
//! Works with anything that can hand out a store context: the runtime's own `Store` for
//! top-level calls, or a host function's `Caller` for calls made while the guest is on the stack.

use crate::abi::GuestExports;
use crate::error::{BridgeError, Result};
use crate::sandbox::Sandbox;
use crate::state::BridgeState;
use tracing::warn;
use wasmtime::{AsContextMut, Caller, Func, Ref, Store, Val, ValType};

/// A store context that can lend out its [`BridgeState`] for as long as it is borrowed.
pub trait BridgeContext: AsContextMut<Data = BridgeState> {
    fn bridge_state(&mut self) -> &mut BridgeState;
}

impl BridgeContext for Store<BridgeState> {
    fn bridge_state(&mut self) -> &mut BridgeState {
        self.data_mut()
    }
}

impl BridgeContext for Caller<'_, BridgeState> {
    fn bridge_state(&mut self) -> &mut BridgeState {
        self.data_mut()
    }
}

impl<T: BridgeContext> BridgeContext for &mut T {
    fn bridge_state(&mut self) -> &mut BridgeState {
        (**self).bridge_state()
    }
}

pub struct WasmtimeSandbox<C> {
    ctx: C,
}

impl<C: BridgeContext> WasmtimeSandbox<C> {
    pub fn new(ctx: C) -> Self {
        Self { ctx }
    }

    pub fn into_inner(self) -> C {
        self.ctx
    }

    pub fn context(&mut self) -> &mut C {
        &mut self.ctx
    }

    fn exports(&mut self) -> Result<GuestExports> {
        self.ctx.bridge_state().exports().cloned()
    }

    /// Look up `index` in the guest's function table and check its parameter count.
    fn table_func(&mut self, index: u32, params: usize) -> Result<Func> {
        let table = self.exports()?.function_table()?;
        let func = match table.get(&mut self.ctx, u64::from(index)) {
            Some(Ref::Func(Some(f))) => f,
            Some(_) => {
                return Err(BridgeError::BadSignature {
                    index,
                    reason: "not a function".into(),
                });
            }
            None => {
                return Err(BridgeError::BadSignature {
                    index,
                    reason: "out of table bounds".into(),
                });
            }
        };

        let ty = func.ty(&self.ctx);
        let all_i32 = ty.params().all(|p| matches!(p, ValType::I32));
        if ty.params().len() != params || !all_i32 || ty.results().len() != 0 {
            return Err(BridgeError::BadSignature {
                index,
                reason: format!("expected {params} i32 params and no results, found {ty:?}"),
            });
        }
        Ok(func)
    }

    fn call_table(&mut self, index: u32, args: &[u32]) -> Result<()> {
        let func = self.table_func(index, args.len())?;
        let vals: Vec<Val> = args.iter().map(|&v| Val::I32(v as i32)).collect();
        func.call(&mut self.ctx, &vals, &mut [])
            .map_err(BridgeError::from_guest)
    }
}

impl<C: BridgeContext> Sandbox for WasmtimeSandbox<C> {
    fn state(&mut self) -> &mut BridgeState {
        self.ctx.bridge_state()
    }

    fn memory_and_state(&mut self) -> Result<(&mut [u8], &mut BridgeState)> {
        let memory = self.exports()?.memory;
        Ok(memory.data_and_store_mut(&mut self.ctx))
    }

    fn has_realloc(&mut self) -> bool {
        self.ctx
            .bridge_state()
            .exports()
            .is_ok_and(|e| e.realloc.is_some())
    }

    fn has_exn_store(&mut self) -> bool {
        self.ctx
            .bridge_state()
            .exports()
            .is_ok_and(|e| e.exn_store.is_some())
    }

    fn guest_malloc(&mut self, size: u32, align: u32) -> Result<u32> {
        let malloc = self.exports()?.malloc;
        let ptr = malloc
            .call(&mut self.ctx, (size as i32, align as i32))
            .map_err(|e| {
                warn!(size, align, "guest allocator trapped: {e:#}");
                BridgeError::Allocation { size, align }
            })?;
        Ok(ptr as u32)
    }

    fn guest_realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32> {
        let realloc = self
            .exports()?
            .realloc
            .ok_or(BridgeError::MissingExport(crate::abi::guest_exports::REALLOC))?;
        let ptr = realloc
            .call(
                &mut self.ctx,
                (ptr as i32, old_size as i32, new_size as i32, align as i32),
            )
            .map_err(|e| {
                warn!(ptr, new_size, align, "guest reallocator trapped: {e:#}");
                BridgeError::Allocation {
                    size: new_size,
                    align,
                }
            })?;
        Ok(ptr as u32)
    }

    fn guest_free(&mut self, ptr: u32, size: u32, align: u32) -> Result<()> {
        match self.exports()?.free {
            Some(free) => free
                .call(&mut self.ctx, (ptr as i32, size as i32, align as i32))
                .map_err(BridgeError::from_guest),
            None => Ok(()),
        }
    }

    fn guest_destroy(&mut self, dtor: u32, a: u32, b: u32) -> Result<()> {
        self.call_table(dtor, &[a, b])
    }

    fn guest_invoke(&mut self, invoke: u32, a: u32, b: u32, args: &[u32]) -> Result<()> {
        let mut all = Vec::with_capacity(2 + args.len());
        all.extend_from_slice(&[a, b]);
        all.extend_from_slice(args);
        self.call_table(invoke, &all)
    }

    fn guest_exn_store(&mut self, idx: u32) -> Result<()> {
        match self.exports()?.exn_store {
            Some(store) => store
                .call(&mut self.ctx, idx as i32)
                .map_err(BridgeError::from_guest),
            None => Ok(()),
        }
    }
}
