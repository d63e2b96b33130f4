//! Build script for `hostlink-sdk`.
//!
//! No code generation: the bindings are written by hand against the ABI documented in
//! `hostlink-core::abi`. Only rerun hints are emitted.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
}
