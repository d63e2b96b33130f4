// Minimal hostlink guest.
//
// This crate is meant to be compiled to `wasm32-unknown-unknown` and loaded by `hostlink-core`.
// The embedder registers one forwarder, `host_log(message) -> undefined`, and calls:
// - `make_counter()` to get a closure handle it can invoke with an optional step.
// - `greet(name)` with a string handle it hands over; the result is a new string handle.
// - `count()` to read the running total.

use std::sync::atomic::{AtomicU32, Ordering};

use hostlink_sdk::prelude::*;

#[link(wasm_import_module = "env")]
unsafe extern "C" {
    fn host_log(message: u32) -> u32;
}

static COUNT: AtomicU32 = AtomicU32::new(0);

fn log(message: &str) {
    let message = HostRef::from_str(message);
    if let Err(e) = check(unsafe { host_log(message.idx()) }) {
        throw_str(&e.debug_string());
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn hostlink_start() {
    log("counter guest ready");
}

#[unsafe(no_mangle)]
pub extern "C" fn make_counter() -> u32 {
    let counter = Closure::new1_optional(|step: Option<HostRef>| {
        let step = step.and_then(|s| s.as_f64()).unwrap_or(1.0) as u32;
        let total = COUNT.fetch_add(step, Ordering::Relaxed) + step;
        log(&format!("count = {total}"));
    });
    // The host keeps its own handle; the capture lives until the host lets go of it.
    let handle = counter.handle().cloned().map_or(0, HostRef::into_raw);
    counter.forget();
    handle
}

#[unsafe(no_mangle)]
pub extern "C" fn greet(name: u32) -> u32 {
    let name = unsafe { HostRef::from_raw(name) };
    let Some(name) = name.as_string() else {
        throw_str("greet expects a string");
    };
    HostRef::from_str(&format!("hello, {name}")).into_raw()
}

#[unsafe(no_mangle)]
pub extern "C" fn count() -> u32 {
    COUNT.load(Ordering::Relaxed)
}
