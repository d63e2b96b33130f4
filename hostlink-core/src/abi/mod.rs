//! hostlink ABI
//!
//! This module defines the contract between:
//! - **Host**: `hostlink-core`, embedding the guest with Wasmtime
//! - **Guest**: a WebAssembly module built against `hostlink-sdk` (or any toolchain emitting
//!   the same imports/exports)
//!
//! ## Model
//! Host values never enter linear memory. The guest holds them as `i32` indices into the
//! host's handle table and passes those indices through every import. Strings cross as
//! `(ptr, len)` pairs of UTF-8 bytes allocated with the guest's own allocator. Guest callbacks
//! cross as two capture words plus function table indices of a destructor and an invoke shim.
//!
//! ## Imports (guest -> host), module `"env"`
//! ### Handle table
//! - `hostlink_init_externref_table()`
//! - `hostlink_externref_drop(h: i32)`
//! - `hostlink_object_clone_ref(h: i32) -> i32`
//!
//! ### Type tests and primitives
//! - `hostlink_is_function(h) -> i32`, `hostlink_is_null`, `hostlink_is_object`,
//!   `hostlink_is_undefined`
//! - `hostlink_number_get(out: i32, h: i32)`: f64 at `out + 8`, presence flag at `out`
//! - `hostlink_number_new(n: f64) -> i32`
//! - `hostlink_boolean_get(h) -> i32`: 0/1, or 2 when `h` is not a boolean
//! - `hostlink_string_get(out, h)`: ptr at `out`, len at `out + 4`; both 0 when not a string
//! - `hostlink_string_new(ptr, len) -> i32`
//! - `hostlink_debug_string(out, h)`: rendering of `h` as a string transfer at `out`
//!
//! ### Errors and closures
//! - `hostlink_throw(ptr, len)`: fails the current guest call with a host error
//! - `hostlink_exn_take() -> i32`: pending exception handle, or 0
//! - `hostlink_closure_new(a, b, dtor, invoke, shape) -> i32`
//! - `hostlink_cb_drop(h) -> i32`: 1 when the guest must destroy the capture itself
//!
//! Embedder-registered forwarders are imported from the same module as `(i32 * n) -> i32`.
//!
//! ## Exports (host -> guest)
//! Required: `memory`, `hostlink_malloc(size, align) -> ptr`.
//!
//! Optional:
//! - `hostlink_realloc(ptr, old_size, new_size, align) -> ptr`
//! - `hostlink_free(ptr, size, align)`
//! - `hostlink_start()`: called once after instantiation
//! - `hostlink_exn_store(h)`: notified whenever a host call throws
//! - `__indirect_function_table`: required as soon as a closure is invoked or destroyed

use crate::error::{BridgeError, Result};
use std::fmt;
use wasmtime::{AsContextMut, Instance, Memory, Table, TypedFunc};

/// Host import names provided to the guest.
pub mod host_imports {
    pub const DEBUG_STRING: &str = "hostlink_debug_string";
    pub const INIT_EXTERNREF_TABLE: &str = "hostlink_init_externref_table";
    pub const EXTERNREF_DROP: &str = "hostlink_externref_drop";
    pub const OBJECT_CLONE_REF: &str = "hostlink_object_clone_ref";

    pub const IS_FUNCTION: &str = "hostlink_is_function";
    pub const IS_NULL: &str = "hostlink_is_null";
    pub const IS_OBJECT: &str = "hostlink_is_object";
    pub const IS_UNDEFINED: &str = "hostlink_is_undefined";

    pub const NUMBER_GET: &str = "hostlink_number_get";
    pub const NUMBER_NEW: &str = "hostlink_number_new";
    pub const BOOLEAN_GET: &str = "hostlink_boolean_get";
    pub const STRING_GET: &str = "hostlink_string_get";
    pub const STRING_NEW: &str = "hostlink_string_new";

    pub const THROW: &str = "hostlink_throw";
    pub const EXN_TAKE: &str = "hostlink_exn_take";

    pub const CLOSURE_NEW: &str = "hostlink_closure_new";
    pub const CB_DROP: &str = "hostlink_cb_drop";
}

/// Guest export names.
pub mod guest_exports {
    pub const MEMORY: &str = "memory";
    pub const MALLOC: &str = "hostlink_malloc";
    pub const REALLOC: &str = "hostlink_realloc";
    pub const FREE: &str = "hostlink_free";
    pub const START: &str = "hostlink_start";
    pub const EXN_STORE: &str = "hostlink_exn_store";
    pub const FUNCTION_TABLE: &str = "__indirect_function_table";
}

/// `hostlink_boolean_get` result for a non-boolean handle.
pub const BOOLEAN_ABSENT: i32 = 2;

/// Guest exports resolved once after instantiation.
#[derive(Clone)]
pub struct GuestExports {
    pub memory: Memory,
    pub malloc: TypedFunc<(i32, i32), i32>,
    pub realloc: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    pub free: Option<TypedFunc<(i32, i32, i32), ()>>,
    pub start: Option<TypedFunc<(), ()>>,
    pub exn_store: Option<TypedFunc<i32, ()>>,
    pub table: Option<Table>,
}

impl GuestExports {
    pub fn resolve(instance: &Instance, mut store: impl AsContextMut) -> Result<Self> {
        let memory = instance
            .get_memory(&mut store, guest_exports::MEMORY)
            .ok_or(BridgeError::MissingExport(guest_exports::MEMORY))?;
        let malloc = required(instance, &mut store, guest_exports::MALLOC)?;

        Ok(Self {
            memory,
            malloc,
            realloc: optional(instance, &mut store, guest_exports::REALLOC)?,
            free: optional(instance, &mut store, guest_exports::FREE)?,
            start: optional(instance, &mut store, guest_exports::START)?,
            exn_store: optional(instance, &mut store, guest_exports::EXN_STORE)?,
            table: instance.get_table(&mut store, guest_exports::FUNCTION_TABLE),
        })
    }

    pub fn function_table(&self) -> Result<Table> {
        self.table
            .ok_or(BridgeError::MissingExport(guest_exports::FUNCTION_TABLE))
    }
}

impl fmt::Debug for GuestExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestExports")
            .field("realloc", &self.realloc.is_some())
            .field("free", &self.free.is_some())
            .field("start", &self.start.is_some())
            .field("exn_store", &self.exn_store.is_some())
            .field("table", &self.table.is_some())
            .finish()
    }
}

fn required<P, R>(
    instance: &Instance,
    store: &mut impl AsContextMut,
    name: &'static str,
) -> Result<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    optional(instance, store, name)?.ok_or(BridgeError::MissingExport(name))
}

/// `Ok(None)` when absent, an error when present with the wrong type.
fn optional<P, R>(
    instance: &Instance,
    store: &mut impl AsContextMut,
    name: &'static str,
) -> Result<Option<TypedFunc<P, R>>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let Some(func) = instance.get_func(&mut *store, name) else {
        return Ok(None);
    };
    func.typed::<P, R>(&*store)
        .map(Some)
        .map_err(|e| BridgeError::Engine(format!("export `{name}` has the wrong type: {e}")))
}
