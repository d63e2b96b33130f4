//! Host exceptions raised while the guest is calling out.
//!
//! A failing host call cannot unwind through guest frames. Instead the thrown value goes into
//! the handle table, its index is parked in a single per-instance slot, and the import returns a
//! sentinel. The guest trampoline then reads the slot with `hostlink_exn_take`.

use crate::error::Result;
use crate::sandbox::Sandbox;
use crate::table::HandleTable;
use crate::value::HostValue;
use tracing::debug;

/// The most recent exception, as a handle index.
#[derive(Debug, Default)]
pub struct ExceptionSlot {
    pending: Option<u32>,
}

impl ExceptionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `idx`, releasing any exception the guest never picked up.
    pub fn store(&mut self, table: &mut HandleTable, idx: u32) {
        if let Some(stale) = self.pending.replace(idx) {
            debug!(stale, "dropping unclaimed exception");
            let _ = table.free(stale);
        }
    }

    /// Read and clear. Ownership of the handle passes to the caller.
    pub fn take(&mut self) -> Option<u32> {
        self.pending.take()
    }

    pub fn peek(&self) -> Option<u32> {
        self.pending
    }

    /// Release an unclaimed exception so a later call cannot observe it.
    pub fn clear(&mut self, table: &mut HandleTable) {
        if let Some(stale) = self.pending.take() {
            debug!(stale, "clearing unclaimed exception");
            let _ = table.free(stale);
        }
    }
}

/// Run a host operation on behalf of the guest.
///
/// `Err(value)` is recorded in the exception slot and the sentinel `R::default()` is returned.
/// Bridge failures (bad handles, out-of-bounds ranges) are not host exceptions and propagate.
pub fn guard<S, R, F>(sb: &mut S, f: F) -> Result<R>
where
    S: Sandbox + ?Sized,
    R: Default,
    F: FnOnce(&mut S) -> Result<std::result::Result<R, HostValue>>,
{
    {
        let state = sb.state();
        state.exn.clear(&mut state.table);
    }

    match f(sb)? {
        Ok(value) => Ok(value),
        Err(thrown) => {
            let state = sb.state();
            let idx = state.table.insert(thrown);
            state.exn.store(&mut state.table, idx);
            debug!(idx, "host call threw");
            if sb.has_exn_store() {
                // The hook may call forwarders, whose guards start from an empty slot.
                sb.state().exn.take();
                let notified = sb.notify_exception(idx);
                let state = sb.state();
                state.exn.store(&mut state.table, idx);
                notified?;
            }
            Ok(R::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::sandbox::mock::{GuestCall, MockSandbox};

    #[test]
    fn thrown_value_lands_in_the_slot() {
        let mut sb = MockSandbox::new();
        let ret: u32 = guard(&mut sb, |_| Ok(Err(HostValue::error("TypeError", "nope")))).unwrap();
        assert_eq!(ret, 0);

        let idx = sb.state.exn.take().unwrap();
        assert_eq!(
            sb.state.table.get(idx).unwrap().debug_string(),
            "TypeError: nope"
        );
        assert_eq!(sb.state.exn.take(), None);
    }

    #[test]
    fn successful_call_never_sees_a_stale_exception() {
        let mut sb = MockSandbox::new();
        let _: u32 = guard(&mut sb, |_| Ok(Err(HostValue::from("first")))).unwrap();
        let stale = sb.state.exn.peek().unwrap();

        let ret: u32 = guard(&mut sb, |_| Ok(Ok(7))).unwrap();
        assert_eq!(ret, 7);
        assert_eq!(sb.state.exn.take(), None);
        assert!(sb.state.table.get(stale).is_err());
    }

    #[test]
    fn later_exception_overwrites_earlier() {
        let mut slot = ExceptionSlot::new();
        let mut table = HandleTable::new();
        let a = table.insert(HostValue::from("a"));
        let b = table.insert(HostValue::from("b"));
        slot.store(&mut table, a);
        slot.store(&mut table, b);
        assert_eq!(slot.take(), Some(b));
        assert!(table.get(a).is_err());
    }

    #[test]
    fn guest_is_notified_when_it_exports_a_store_hook() {
        let mut sb = MockSandbox::new();
        sb.exn_store_enabled = true;
        let _: () = guard(&mut sb, |_| Ok(Err(HostValue::Null))).unwrap();
        let idx = sb.state.exn.peek().unwrap();
        assert!(sb.calls.contains(&GuestCall::ExnStore(idx)));
    }

    #[test]
    fn store_hook_calling_forwarders_keeps_the_exception() {
        let mut sb = MockSandbox::new();
        sb.exn_store_enabled = true;
        sb.set_exn_store_hook(|sb, _| {
            sb.exn_store_enabled = false;
            let ok: u32 = guard(sb, |_| Ok(Ok(1)))?;
            assert_eq!(ok, 1);
            let _: u32 = guard(sb, |_| Ok(Err(HostValue::from("inner"))))?;
            sb.exn_store_enabled = true;
            Ok(())
        });

        let _: u32 = guard(&mut sb, |_| Ok(Err(HostValue::from("outer")))).unwrap();
        let idx = sb.state.exn.take().unwrap();
        assert_eq!(sb.state.table.get(idx).unwrap().as_str(), Some("outer"));
        assert_eq!(sb.state.table.live_count(), 1);
    }

    #[test]
    fn bridge_errors_are_not_swallowed() {
        let mut sb = MockSandbox::new();
        let err = guard::<_, u32, _>(&mut sb, |_| Err(BridgeError::InvalidHandle(42))).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidHandle(42)));
        assert_eq!(sb.state.exn.peek(), None);
    }
}
