//! In-process guest for unit tests.

use super::Sandbox;
use crate::error::Result;
use crate::state::BridgeState;
use std::rc::Rc;

/// Guest calls observed by the mock, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuestCall {
    Malloc { size: u32, align: u32 },
    Realloc { ptr: u32, old_size: u32, new_size: u32, align: u32 },
    Free { ptr: u32, size: u32, align: u32 },
    Destroy { dtor: u32, a: u32, b: u32 },
    Invoke { invoke: u32, a: u32, b: u32, args: Vec<u32> },
    ExnStore(u32),
}

type InvokeHook = Rc<dyn Fn(&mut MockSandbox, u32, u32, u32, &[u32]) -> Result<()>>;
type ExnStoreHook = Rc<dyn Fn(&mut MockSandbox, u32) -> Result<()>>;

/// Bump allocator over a `Vec<u8>`. Growth moves the buffer to a new allocation, like a
/// detached `ArrayBuffer`.
pub struct MockSandbox {
    pub state: BridgeState,
    pub memory: Vec<u8>,
    pub heap_top: u32,
    pub realloc_enabled: bool,
    pub exn_store_enabled: bool,
    pub fail_malloc: bool,
    /// Pointer every `realloc` returns instead of a real block.
    pub realloc_override: Option<u32>,
    pub calls: Vec<GuestCall>,
    invoke_hook: Option<InvokeHook>,
    exn_store_hook: Option<ExnStoreHook>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::with_state(BridgeState::default())
    }

    pub fn with_state(state: BridgeState) -> Self {
        Self {
            state,
            memory: vec![0; 64],
            heap_top: 8,
            realloc_enabled: true,
            exn_store_enabled: false,
            fail_malloc: false,
            realloc_override: None,
            calls: Vec::new(),
            invoke_hook: None,
            exn_store_hook: None,
        }
    }

    pub fn set_invoke_hook(
        &mut self,
        hook: impl Fn(&mut MockSandbox, u32, u32, u32, &[u32]) -> Result<()> + 'static,
    ) {
        self.invoke_hook = Some(Rc::new(hook));
    }

    pub fn set_exn_store_hook(&mut self, hook: impl Fn(&mut MockSandbox, u32) -> Result<()> + 'static) {
        self.exn_store_hook = Some(Rc::new(hook));
    }

    pub fn bytes(&self, ptr: u32, len: u32) -> &[u8] {
        &self.memory[ptr as usize..(ptr + len) as usize]
    }

    pub fn write(&mut self, ptr: u32, bytes: &[u8]) {
        self.memory[ptr as usize..ptr as usize + bytes.len()].copy_from_slice(bytes);
    }

    fn bump(&mut self, size: u32, align: u32) -> u32 {
        let align = align.max(1);
        let ptr = self.heap_top.div_ceil(align) * align;
        self.heap_top = ptr + size;
        let needed = self.heap_top as usize;
        if needed > self.memory.len() {
            let mut grown = vec![0u8; needed.next_power_of_two().max(self.memory.len() * 2)];
            grown[..self.memory.len()].copy_from_slice(&self.memory);
            self.memory = grown;
        }
        ptr
    }

    pub fn mallocs(&self) -> Vec<(u32, u32)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                GuestCall::Malloc { size, align } => Some((*size, *align)),
                _ => None,
            })
            .collect()
    }

    pub fn reallocs(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, GuestCall::Realloc { .. }))
            .count()
    }
}

impl Sandbox for MockSandbox {
    fn state(&mut self) -> &mut BridgeState {
        &mut self.state
    }

    fn memory_and_state(&mut self) -> Result<(&mut [u8], &mut BridgeState)> {
        Ok((&mut self.memory, &mut self.state))
    }

    fn has_realloc(&mut self) -> bool {
        self.realloc_enabled
    }

    fn has_exn_store(&mut self) -> bool {
        self.exn_store_enabled
    }

    fn guest_malloc(&mut self, size: u32, align: u32) -> Result<u32> {
        self.calls.push(GuestCall::Malloc { size, align });
        if self.fail_malloc {
            return Ok(0);
        }
        Ok(self.bump(size, align))
    }

    fn guest_realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32> {
        self.calls.push(GuestCall::Realloc {
            ptr,
            old_size,
            new_size,
            align,
        });
        if let Some(wild) = self.realloc_override {
            return Ok(wild);
        }
        if ptr + old_size == self.heap_top {
            self.heap_top = ptr;
            let moved = self.bump(new_size, align);
            debug_assert_eq!(moved, ptr);
            return Ok(ptr);
        }
        let fresh = self.bump(new_size, align);
        let keep = old_size.min(new_size) as usize;
        self.memory
            .copy_within(ptr as usize..ptr as usize + keep, fresh as usize);
        Ok(fresh)
    }

    fn guest_free(&mut self, ptr: u32, size: u32, align: u32) -> Result<()> {
        self.calls.push(GuestCall::Free { ptr, size, align });
        Ok(())
    }

    fn guest_destroy(&mut self, dtor: u32, a: u32, b: u32) -> Result<()> {
        self.calls.push(GuestCall::Destroy { dtor, a, b });
        Ok(())
    }

    fn guest_invoke(&mut self, invoke: u32, a: u32, b: u32, args: &[u32]) -> Result<()> {
        self.calls.push(GuestCall::Invoke {
            invoke,
            a,
            b,
            args: args.to_vec(),
        });
        match self.invoke_hook.clone() {
            Some(hook) => hook(self, invoke, a, b, args),
            None => Ok(()),
        }
    }

    fn guest_exn_store(&mut self, idx: u32) -> Result<()> {
        self.calls.push(GuestCall::ExnStore(idx));
        match self.exn_store_hook.clone() {
            Some(hook) => hook(self, idx),
            None => Ok(()),
        }
    }
}
