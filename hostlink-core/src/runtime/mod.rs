//! Wasmtime-backed runtime glue for hostlink-core.
//!
//! - `runtime`: engine/store/linker ownership and the embedder-facing API.
//! - `imports`: the fixed primitive imports under the configured module (default `"env"`).
//! - `host_fns`: embedder forwarders, wrapped by the exception bridge.
//! - `sandbox`: the `Sandbox` implementation over a store or a host function's caller.
//!
//! Export resolution lives in `crate::abi::GuestExports::resolve`.

pub mod host_fns;
pub mod imports;
pub mod runtime;
pub mod sandbox;

pub use host_fns::{HostFn, HostFunctions};
pub use runtime::HostlinkRuntime;
pub use sandbox::{BridgeContext, WasmtimeSandbox};
