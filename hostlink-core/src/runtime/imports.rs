//! Host import definitions for the Wasmtime runtime.
//!
//! These are the fixed primitives every guest relies on: handle table maintenance, type tests,
//! number/boolean/string conversion, closures and exceptions. Embedder forwarders are defined
//! separately in `host_fns`.

use super::sandbox::WasmtimeSandbox;
use crate::abi::{BOOLEAN_ABSENT, host_imports};
use crate::closure::ClosureShape;
use crate::codec::{self, StringTransfer};
use crate::error::{BridgeError, Result};
use crate::sandbox::Sandbox;
use crate::state::BridgeState;
use crate::value::HostValue;

use tracing::trace;
use wasmtime::{Caller, Linker};

type Ctx<'a> = Caller<'a, BridgeState>;

/// Define all primitive imports under `module`.
///
/// Must be called before instantiating the module.
pub fn define_imports(linker: &mut Linker<BridgeState>, module: &str) -> anyhow::Result<()> {
    // --- Handle table ---
    linker.func_wrap(
        module,
        host_imports::INIT_EXTERNREF_TABLE,
        |mut caller: Ctx<'_>| {
            caller.data_mut().table.init();
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::EXTERNREF_DROP,
        |mut caller: Ctx<'_>, h: i32| -> anyhow::Result<()> {
            caller.data_mut().table.free(h as u32)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::OBJECT_CLONE_REF,
        |mut caller: Ctx<'_>, h: i32| -> anyhow::Result<i32> {
            let table = &mut caller.data_mut().table;
            let value = table.get(h as u32)?.clone();
            Ok(table.insert(value) as i32)
        },
    )?;

    // --- Type tests ---
    linker.func_wrap(
        module,
        host_imports::IS_FUNCTION,
        |caller: Ctx<'_>, h: i32| -> anyhow::Result<i32> {
            Ok(caller.data().table.get(h as u32)?.is_function() as i32)
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::IS_NULL,
        |caller: Ctx<'_>, h: i32| -> anyhow::Result<i32> {
            Ok(caller.data().table.get(h as u32)?.is_null() as i32)
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::IS_OBJECT,
        |caller: Ctx<'_>, h: i32| -> anyhow::Result<i32> {
            Ok(caller.data().table.get(h as u32)?.is_object() as i32)
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::IS_UNDEFINED,
        |caller: Ctx<'_>, h: i32| -> anyhow::Result<i32> {
            Ok(caller.data().table.get(h as u32)?.is_undefined() as i32)
        },
    )?;

    // --- Numbers and booleans ---
    linker.func_wrap(
        module,
        host_imports::NUMBER_GET,
        |mut caller: Ctx<'_>, out: i32, h: i32| -> anyhow::Result<()> {
            let n = caller.data().table.get(h as u32)?.as_f64();
            write_number(&mut WasmtimeSandbox::new(&mut caller), out as u32, n)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::NUMBER_NEW,
        |mut caller: Ctx<'_>, n: f64| -> i32 {
            caller.data_mut().table.insert(HostValue::Number(n)) as i32
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::BOOLEAN_GET,
        |caller: Ctx<'_>, h: i32| -> anyhow::Result<i32> {
            Ok(match caller.data().table.get(h as u32)?.as_bool() {
                Some(b) => b as i32,
                None => BOOLEAN_ABSENT,
            })
        },
    )?;

    // --- Strings ---
    linker.func_wrap(
        module,
        host_imports::STRING_GET,
        |mut caller: Ctx<'_>, out: i32, h: i32| -> anyhow::Result<()> {
            let s = caller
                .data()
                .table
                .get(h as u32)?
                .as_str()
                .map(str::to_owned);
            let mut sb = WasmtimeSandbox::new(&mut caller);
            let transfer = match s {
                Some(s) => codec::encode(&mut sb, &s)?,
                None => StringTransfer { ptr: 0, len: 0 },
            };
            codec::write_transfer(&mut sb, out as u32, transfer)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::STRING_NEW,
        |mut caller: Ctx<'_>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let mut sb = WasmtimeSandbox::new(&mut caller);
            let s = codec::decode_from(&mut sb, ptr as u32, len as u32)?;
            Ok(sb.state().table.insert(HostValue::from(s)) as i32)
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::DEBUG_STRING,
        |mut caller: Ctx<'_>, out: i32, h: i32| -> anyhow::Result<()> {
            let rendered = caller.data().table.get(h as u32)?.debug_string();
            let mut sb = WasmtimeSandbox::new(&mut caller);
            let transfer = codec::encode(&mut sb, &rendered)?;
            codec::write_transfer(&mut sb, out as u32, transfer)?;
            Ok(())
        },
    )?;

    // --- Errors ---
    linker.func_wrap(
        module,
        host_imports::THROW,
        |mut caller: Ctx<'_>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let message = codec::decode_from(&mut WasmtimeSandbox::new(&mut caller), ptr as u32, len as u32)?;
            trace!(%message, "guest threw");
            Err(BridgeError::Thrown(HostValue::error("Error", message)).into())
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::EXN_TAKE,
        |mut caller: Ctx<'_>| -> i32 { caller.data_mut().exn.take().unwrap_or(0) as i32 },
    )?;

    // --- Closures ---
    linker.func_wrap(
        module,
        host_imports::CLOSURE_NEW,
        |mut caller: Ctx<'_>, a: i32, b: i32, dtor: i32, invoke: i32, shape: i32| -> anyhow::Result<i32> {
            let shape = ClosureShape::from_code(shape as u32).ok_or_else(|| BridgeError::BadSignature {
                index: invoke as u32,
                reason: format!("unknown closure shape {shape}"),
            })?;
            let state = caller.data_mut();
            let closure = state
                .closures
                .create(a as u32, b as u32, dtor as u32, invoke as u32, shape);
            Ok(state.table.insert(HostValue::from(closure)) as i32)
        },
    )?;

    linker.func_wrap(
        module,
        host_imports::CB_DROP,
        |mut caller: Ctx<'_>, h: i32| -> anyhow::Result<i32> {
            let state = caller.data_mut();
            let id = state
                .table
                .get(h as u32)?
                .as_closure()
                .map(|c| c.id())
                .ok_or(BridgeError::InvalidHandle(h as u32))?;
            Ok(state.closures.drop_ref(id)? as i32)
        },
    )?;

    Ok(())
}

/// `f64` at `out + 8`, presence flag at `out`.
fn write_number<S: Sandbox + ?Sized>(sb: &mut S, out: u32, n: Option<f64>) -> Result<()> {
    let (mem, state) = sb.memory_and_state()?;
    let memory_len = mem.len();
    let dv = state.views.data_view(mem);
    let ok = dv.set_f64(mem, out.wrapping_add(8), n.unwrap_or(0.0))
        && dv.set_i32(mem, out, n.is_some() as i32);
    if ok {
        Ok(())
    } else {
        Err(BridgeError::OutOfBounds {
            ptr: out,
            len: 16,
            memory_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockSandbox;

    #[test]
    fn number_out_param_layout() {
        let mut sb = MockSandbox::new();
        write_number(&mut sb, 16, Some(2.5)).unwrap();
        assert_eq!(sb.bytes(16, 4), &1i32.to_le_bytes());
        assert_eq!(sb.bytes(24, 8), &2.5f64.to_le_bytes());

        write_number(&mut sb, 16, None).unwrap();
        assert_eq!(sb.bytes(16, 4), &0i32.to_le_bytes());
        assert!(write_number(&mut sb, 56, Some(1.0)).is_err());
    }
}
