//! The seam between the bridge primitives and a concrete guest.
//!
//! Implementors supply the raw guest calls (`guest_*`). Everything else in the crate goes
//! through the provided wrappers, which invalidate the memory view cache after every call into
//! the guest, since any of them may have grown linear memory.

#[cfg(test)]
pub(crate) mod mock;

use crate::error::{BridgeError, Result};
use crate::state::BridgeState;

pub trait Sandbox {
    fn state(&mut self) -> &mut BridgeState;

    /// Current linear memory and the bridge state, borrowed together.
    fn memory_and_state(&mut self) -> Result<(&mut [u8], &mut BridgeState)>;

    fn has_realloc(&mut self) -> bool;

    fn has_exn_store(&mut self) -> bool;

    fn guest_malloc(&mut self, size: u32, align: u32) -> Result<u32>;

    fn guest_realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32>;

    fn guest_free(&mut self, ptr: u32, size: u32, align: u32) -> Result<()>;

    /// Call function table entry `dtor` as `(a, b)`.
    fn guest_destroy(&mut self, dtor: u32, a: u32, b: u32) -> Result<()>;

    /// Call function table entry `invoke` as `(a, b, args...)`.
    fn guest_invoke(&mut self, invoke: u32, a: u32, b: u32, args: &[u32]) -> Result<()>;

    fn guest_exn_store(&mut self, idx: u32) -> Result<()>;

    fn malloc(&mut self, size: u32, align: u32) -> Result<u32> {
        let ptr = self.guest_malloc(size, align);
        self.state().views.invalidate_all();
        match ptr? {
            0 if size != 0 => Err(BridgeError::Allocation { size, align }),
            ptr => Ok(ptr),
        }
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32> {
        let ptr = self.guest_realloc(ptr, old_size, new_size, align);
        self.state().views.invalidate_all();
        match ptr? {
            0 if new_size != 0 => Err(BridgeError::Allocation {
                size: new_size,
                align,
            }),
            ptr => Ok(ptr),
        }
    }

    fn free(&mut self, ptr: u32, size: u32, align: u32) -> Result<()> {
        let r = self.guest_free(ptr, size, align);
        self.state().views.invalidate_all();
        r
    }

    fn call_destructor(&mut self, dtor: u32, a: u32, b: u32) -> Result<()> {
        let r = self.guest_destroy(dtor, a, b);
        self.state().views.invalidate_all();
        r
    }

    fn call_invoke(&mut self, invoke: u32, a: u32, b: u32, args: &[u32]) -> Result<()> {
        let r = self.guest_invoke(invoke, a, b, args);
        self.state().views.invalidate_all();
        r
    }

    fn notify_exception(&mut self, idx: u32) -> Result<()> {
        let r = self.guest_exn_store(idx);
        self.state().views.invalidate_all();
        r
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSandbox;
    use super::*;

    #[test]
    fn every_guest_call_invalidates_views() {
        let mut sb = MockSandbox::new();
        let before = sb.state.views.stats().invalidations;
        let ptr = sb.malloc(8, 1).unwrap();
        sb.free(ptr, 8, 1).unwrap();
        sb.call_destructor(1, 2, 3).unwrap();
        assert_eq!(sb.state.views.stats().invalidations, before + 3);
    }

    #[test]
    fn null_from_allocator_is_an_allocation_error() {
        let mut sb = MockSandbox::new();
        sb.fail_malloc = true;
        assert!(matches!(
            sb.malloc(16, 4),
            Err(BridgeError::Allocation { size: 16, align: 4 })
        ));
        assert_eq!(sb.malloc(0, 1).unwrap(), 0);
    }
}
