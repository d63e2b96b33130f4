//! hostlink-core: the host half of a WebAssembly host/guest bridge.
//!
//! A guest module works on its private linear memory; the host owns a graph of
//! reference-counted values and a large native API. Every forwarding function between the two
//! leans on the same handful of primitives, which this crate implements:
//!
//! - [`memory`]: typed views over guest memory, rebuilt whenever memory may have moved.
//! - [`codec`]: UTF-8 strings in and out of guest memory, with decoder rotation.
//! - [`table`]: the handle table that gives host values small integer names.
//! - [`closure`]: guest callbacks the host can call, with exactly-once destruction.
//! - [`exception`]: host failures parked in a slot for the guest to pick up.
//!
//! [`runtime::HostlinkRuntime`] wires them into a Wasmtime embedding. The ABI surface is
//! documented in [`abi`] and mirrored by `hostlink-sdk`.

pub mod abi;
pub mod closure;
pub mod codec;
pub mod config;
pub mod error;
pub mod exception;
pub mod loader;
pub mod memory;
pub mod runtime;
pub mod sandbox;
pub mod state;
pub mod table;
pub mod value;

pub use closure::{ClosureRef, ClosureShape};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use runtime::HostlinkRuntime;
pub use sandbox::Sandbox;
pub use state::BridgeState;
pub use value::{HostResult, HostValue};
