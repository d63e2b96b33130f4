#![cfg_attr(not(feature = "std"), no_std)]

//! hostlink-sdk (handwritten)
//!
//! This crate is used by **guest** WASM modules embedded by `hostlink-core`.
//!
//! ABI model:
//! - Host values live in the host's handle table; the guest holds `i32` indices ([`HostRef`]).
//! - Strings cross as UTF-8 `(ptr, len)` pairs allocated through the exports below.
//! - Callbacks cross as a boxed Rust closure plus function table indices of generic shims.
//! - Host failures are parked in a slot; [`check`] turns them into `Err(HostRef)`.
//!
//! This file intentionally contains **no codegen**.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::fmt;

#[cfg(feature = "wee_alloc")]
#[global_allocator]
static ALLOC: wee_alloc::WeeAlloc = wee_alloc::WeeAlloc::INIT;

/// Low-level raw ABI imports.
#[allow(non_camel_case_types)]
pub mod sys {
    #[cfg_attr(target_arch = "wasm32", link(wasm_import_module = "env"))]
    unsafe extern "C" {
        // Handle table
        #[link_name = "hostlink_init_externref_table"]
        pub fn init_externref_table();
        #[link_name = "hostlink_externref_drop"]
        pub fn externref_drop(h: u32);
        #[link_name = "hostlink_object_clone_ref"]
        pub fn object_clone_ref(h: u32) -> u32;

        // Type tests
        #[link_name = "hostlink_is_function"]
        pub fn is_function(h: u32) -> u32;
        #[link_name = "hostlink_is_null"]
        pub fn is_null(h: u32) -> u32;
        #[link_name = "hostlink_is_object"]
        pub fn is_object(h: u32) -> u32;
        #[link_name = "hostlink_is_undefined"]
        pub fn is_undefined(h: u32) -> u32;

        // Primitives
        #[link_name = "hostlink_number_get"]
        pub fn number_get(out: u32, h: u32);
        #[link_name = "hostlink_number_new"]
        pub fn number_new(n: f64) -> u32;
        #[link_name = "hostlink_boolean_get"]
        pub fn boolean_get(h: u32) -> u32;
        #[link_name = "hostlink_string_get"]
        pub fn string_get(out: u32, h: u32);
        #[link_name = "hostlink_string_new"]
        pub fn string_new(ptr: u32, len: u32) -> u32;
        #[link_name = "hostlink_debug_string"]
        pub fn debug_string(out: u32, h: u32);

        // Errors
        #[link_name = "hostlink_throw"]
        pub fn throw(ptr: u32, len: u32);
        #[link_name = "hostlink_exn_take"]
        pub fn exn_take() -> u32;

        // Closures
        #[link_name = "hostlink_closure_new"]
        pub fn closure_new(a: u32, b: u32, dtor: u32, invoke: u32, shape: u32) -> u32;
        #[link_name = "hostlink_cb_drop"]
        pub fn cb_drop(h: u32) -> u32;
    }
}

/// Allocator exports the host uses to place strings in linear memory.
pub mod exports {
    use super::*;

    fn layout(size: usize, align: usize) -> Option<Layout> {
        Layout::from_size_align(size, align).ok()
    }

    /// # Safety
    /// Called by the host only.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn hostlink_malloc(size: usize, align: usize) -> *mut u8 {
        let Some(layout) = layout(size, align) else {
            return core::ptr::null_mut();
        };
        if size == 0 {
            return align as *mut u8;
        }
        unsafe { alloc::alloc::alloc(layout) }
    }

    /// # Safety
    /// `ptr` must come from `hostlink_malloc`/`hostlink_realloc` with `old_size` and `align`.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn hostlink_realloc(
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> *mut u8 {
        if old_size == 0 {
            return unsafe { hostlink_malloc(new_size, align) };
        }
        let Some(layout) = layout(old_size, align) else {
            return core::ptr::null_mut();
        };
        if new_size == 0 {
            unsafe { alloc::alloc::dealloc(ptr, layout) };
            return align as *mut u8;
        }
        unsafe { alloc::alloc::realloc(ptr, layout, new_size) }
    }

    /// # Safety
    /// `ptr` must come from `hostlink_malloc`/`hostlink_realloc` with `size` and `align`.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn hostlink_free(ptr: *mut u8, size: usize, align: usize) {
        if size == 0 {
            return;
        }
        if let Some(layout) = layout(size, align) {
            unsafe { alloc::alloc::dealloc(ptr, layout) }
        }
    }
}

/// An owned index into the host's handle table.
///
/// Dropping releases the slot; cloning asks the host for a second slot naming the same value.
pub struct HostRef {
    idx: u32,
}

impl HostRef {
    pub const UNDEFINED: u32 = 0;
    pub const NULL: u32 = 1;
    pub const TRUE: u32 = 2;
    pub const FALSE: u32 = 3;

    const RESERVED: u32 = 4;

    /// Wrap an index the guest now owns.
    ///
    /// # Safety
    /// `idx` must be a live handle not owned by anything else.
    pub unsafe fn from_raw(idx: u32) -> Self {
        Self { idx }
    }

    /// Give up ownership without releasing the slot.
    pub fn into_raw(self) -> u32 {
        let idx = self.idx;
        core::mem::forget(self);
        idx
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn undefined() -> Self {
        Self { idx: Self::UNDEFINED }
    }

    pub fn null() -> Self {
        Self { idx: Self::NULL }
    }

    pub fn boolean(b: bool) -> Self {
        Self {
            idx: if b { Self::TRUE } else { Self::FALSE },
        }
    }

    pub fn number(n: f64) -> Self {
        Self {
            idx: unsafe { sys::number_new(n) },
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        Self {
            idx: unsafe { sys::string_new(s.as_ptr() as u32, s.len() as u32) },
        }
    }

    pub fn is_function(&self) -> bool {
        unsafe { sys::is_function(self.idx) != 0 }
    }

    pub fn is_null(&self) -> bool {
        unsafe { sys::is_null(self.idx) != 0 }
    }

    pub fn is_object(&self) -> bool {
        unsafe { sys::is_object(self.idx) != 0 }
    }

    pub fn is_undefined(&self) -> bool {
        unsafe { sys::is_undefined(self.idx) != 0 }
    }

    pub fn as_f64(&self) -> Option<f64> {
        // [present: u32, pad: u32, value: f64]
        let mut out = [0u64; 2];
        unsafe { sys::number_get(out.as_mut_ptr() as u32, self.idx) };
        if out[0] as u32 == 0 {
            None
        } else {
            Some(f64::from_bits(out[1]))
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match unsafe { sys::boolean_get(self.idx) } {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    /// Copy the host string out. The host allocates through `hostlink_malloc`; the guest owns
    /// the returned buffer.
    pub fn as_string(&self) -> Option<String> {
        let mut out = [0u32; 2];
        unsafe { sys::string_get(out.as_mut_ptr() as u32, self.idx) };
        unsafe { take_transfer(out) }
    }

    pub fn debug_string(&self) -> String {
        let mut out = [0u32; 2];
        unsafe { sys::debug_string(out.as_mut_ptr() as u32, self.idx) };
        unsafe { take_transfer(out) }.unwrap_or_default()
    }
}

/// Adopt a `(ptr, len)` pair the host wrote. `(0, 0)` means absent.
unsafe fn take_transfer([ptr, len]: [u32; 2]) -> Option<String> {
    if ptr == 0 {
        return None;
    }
    if len == 0 {
        return Some(String::new());
    }
    let bytes = unsafe { Vec::from_raw_parts(ptr as *mut u8, len as usize, len as usize) };
    // Host strings are always valid UTF-8.
    Some(unsafe { String::from_utf8_unchecked(bytes) })
}

impl Clone for HostRef {
    fn clone(&self) -> Self {
        if self.idx < Self::RESERVED {
            return Self { idx: self.idx };
        }
        Self {
            idx: unsafe { sys::object_clone_ref(self.idx) },
        }
    }
}

impl Drop for HostRef {
    fn drop(&mut self) {
        if self.idx >= Self::RESERVED {
            unsafe { sys::externref_drop(self.idx) }
        }
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostRef").field(&self.idx).finish()
    }
}

/// Convert a forwarder's raw result into `Result`, picking up any pending host exception.
pub fn check(ret: u32) -> Result<Option<HostRef>, HostRef> {
    let exn = unsafe { sys::exn_take() };
    if exn != 0 {
        return Err(unsafe { HostRef::from_raw(exn) });
    }
    if ret == 0 {
        Ok(None)
    } else {
        Ok(Some(unsafe { HostRef::from_raw(ret) }))
    }
}

/// Fail the current call with a host error carrying `message`. Never returns.
pub fn throw_str(message: &str) -> ! {
    unsafe { sys::throw(message.as_ptr() as u32, message.len() as u32) };
    // The host traps out of `hostlink_throw`.
    unreachable!()
}

/// Shape codes understood by `hostlink_closure_new`.
mod shape {
    pub const NULLARY: u32 = 0;
    pub const UNARY: u32 = 1;
    pub const UNARY_OPTIONAL: u32 = 2;
    pub const BINARY: u32 = 3;
}

unsafe extern "C" fn destroy<F>(a: u32, _b: u32) {
    if a != 0 {
        drop(unsafe { Box::from_raw(a as *mut F) });
    }
}

unsafe fn capture<'a, F>(a: u32) -> &'a mut F {
    if a == 0 {
        throw_str("closure invoked recursively or after being dropped");
    }
    unsafe { &mut *(a as *mut F) }
}

unsafe extern "C" fn invoke0<F: FnMut()>(a: u32, _b: u32) {
    (unsafe { capture::<F>(a) })()
}

unsafe extern "C" fn invoke1<F: FnMut(HostRef)>(a: u32, _b: u32, x: u32) {
    let x = unsafe { HostRef::from_raw(x) };
    (unsafe { capture::<F>(a) })(x)
}

unsafe extern "C" fn invoke1_opt<F: FnMut(Option<HostRef>)>(a: u32, _b: u32, x: u32) {
    let x = (x != 0).then(|| unsafe { HostRef::from_raw(x) });
    (unsafe { capture::<F>(a) })(x)
}

unsafe extern "C" fn invoke2<F: FnMut(HostRef, HostRef)>(a: u32, _b: u32, x: u32, y: u32) {
    let (x, y) = unsafe { (HostRef::from_raw(x), HostRef::from_raw(y)) };
    (unsafe { capture::<F>(a) })(x, y)
}

/// A Rust closure the host can call.
///
/// Dropping it tells the host the guest is done. If no call is running the capture is freed
/// immediately; otherwise the host runs the destructor once the call returns.
pub struct Closure {
    handle: Option<HostRef>,
    data: u32,
    dtor: unsafe extern "C" fn(u32, u32),
}

impl Closure {
    fn register<F>(f: F, invoke: u32, shape: u32) -> Self {
        let data = Box::into_raw(Box::new(f)) as u32;
        let dtor = destroy::<F> as unsafe extern "C" fn(u32, u32);
        let idx = unsafe { sys::closure_new(data, 0, dtor as usize as u32, invoke, shape) };
        Self {
            handle: Some(unsafe { HostRef::from_raw(idx) }),
            data,
            dtor,
        }
    }

    pub fn new0<F: FnMut() + 'static>(f: F) -> Self {
        let invoke = invoke0::<F> as unsafe extern "C" fn(u32, u32);
        Self::register(f, invoke as usize as u32, shape::NULLARY)
    }

    pub fn new1<F: FnMut(HostRef) + 'static>(f: F) -> Self {
        let invoke = invoke1::<F> as unsafe extern "C" fn(u32, u32, u32);
        Self::register(f, invoke as usize as u32, shape::UNARY)
    }

    pub fn new1_optional<F: FnMut(Option<HostRef>) + 'static>(f: F) -> Self {
        let invoke = invoke1_opt::<F> as unsafe extern "C" fn(u32, u32, u32);
        Self::register(f, invoke as usize as u32, shape::UNARY_OPTIONAL)
    }

    pub fn new2<F: FnMut(HostRef, HostRef) + 'static>(f: F) -> Self {
        let invoke = invoke2::<F> as unsafe extern "C" fn(u32, u32, u32, u32);
        Self::register(f, invoke as usize as u32, shape::BINARY)
    }

    /// The handle to pass to forwarders.
    pub fn handle(&self) -> Option<&HostRef> {
        self.handle.as_ref()
    }

    /// Release the guest's handle and leave the capture to the host's finalizer.
    pub fn forget(mut self) {
        self.handle = None;
    }
}

impl Drop for Closure {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if unsafe { sys::cb_drop(handle.idx()) } != 0 {
            unsafe { (self.dtor)(self.data, 0) };
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("handle", &self.handle)
            .field("data", &self.data)
            .finish()
    }
}

/// Convenience prelude for guest modules.
pub mod prelude {
    pub use crate::Closure;
    pub use crate::HostRef;
    pub use crate::check;
    pub use crate::throw_str;
}
