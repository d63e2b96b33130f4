//! Handle table ("externref table").
//!
//! Host values cannot live in guest memory, so the guest refers to them by index into this
//! table. Slots are never compacted; the guest frees what it allocates. The first four slots are
//! reserved for the well-known constants and survive every `free`.

use crate::error::{BridgeError, Result};
use crate::value::HostValue;
use tracing::{error, trace, warn};

pub const SLOT_UNDEFINED: u32 = 0;
pub const SLOT_NULL: u32 = 1;
pub const SLOT_TRUE: u32 = 2;
pub const SLOT_FALSE: u32 = 3;

/// Number of reserved slots at the front of the table.
pub const RESERVED_SLOTS: u32 = 4;

#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Option<HostValue>>,
    free: Vec<u32>,
    initialized: bool,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Populate the reserved slots. Calling it again does nothing.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        // The constants are grown from the current end; the table starts empty so they land
        // at 0..4, which is where the guest expects them.
        let offset = self.grow(4);
        self.slots[offset] = Some(HostValue::Undefined);
        self.slots[offset + 1] = Some(HostValue::Null);
        self.slots[offset + 2] = Some(HostValue::Bool(true));
        self.slots[offset + 3] = Some(HostValue::Bool(false));
        trace!(offset, "handle table initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Reserve a slot, reusing a freed one when possible. The slot is empty until `set`.
    pub fn alloc(&mut self) -> u32 {
        self.init();
        if let Some(idx) = self.free.pop() {
            return idx;
        }
        self.grow(1) as u32
    }

    /// Allocate a slot holding `value`.
    pub fn insert(&mut self, value: HostValue) -> u32 {
        let idx = self.alloc();
        self.slots[idx as usize] = Some(value);
        trace!(idx, "handle inserted");
        idx
    }

    /// Like `insert`, but `undefined`/`null` map to index 0 without taking a slot.
    pub fn insert_optional(&mut self, value: HostValue) -> u32 {
        if value.is_like_none() {
            SLOT_UNDEFINED
        } else {
            self.insert(value)
        }
    }

    /// Insert and map booleans onto their reserved slots.
    pub fn insert_value(&mut self, value: HostValue) -> u32 {
        match value {
            HostValue::Undefined => SLOT_UNDEFINED,
            HostValue::Null => SLOT_NULL,
            HostValue::Bool(true) => SLOT_TRUE,
            HostValue::Bool(false) => SLOT_FALSE,
            other => self.insert(other),
        }
    }

    pub fn set(&mut self, idx: u32, value: HostValue) -> Result<()> {
        match self.slots.get_mut(idx as usize) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(BridgeError::InvalidHandle(idx)),
        }
    }

    pub fn get(&self, idx: u32) -> Result<&HostValue> {
        self.slots
            .get(idx as usize)
            .and_then(Option::as_ref)
            .ok_or(BridgeError::InvalidHandle(idx))
    }

    /// Remove the value at `idx` and return it to the caller.
    pub fn take(&mut self, idx: u32) -> Result<HostValue> {
        if is_reserved(idx) {
            return self.get(idx).cloned();
        }
        let value = self
            .slots
            .get_mut(idx as usize)
            .and_then(Option::take)
            .ok_or(BridgeError::InvalidHandle(idx))?;
        self.free.push(idx);
        Ok(value)
    }

    /// Release a slot. Reserved slots are left alone.
    pub fn free(&mut self, idx: u32) -> Result<()> {
        if is_reserved(idx) {
            warn!(idx, "ignoring free of reserved handle slot");
            return Ok(());
        }
        self.take(idx).map(|_| {
            trace!(idx, "handle freed");
        })
    }

    /// Table length, occupied or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Occupied slots outside the reserved range.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .skip(RESERVED_SLOTS as usize)
            .filter(|s| s.is_some())
            .count()
    }

    fn grow(&mut self, n: usize) -> usize {
        let offset = self.slots.len();
        if let Err(e) = self.slots.try_reserve(n) {
            error!(len = offset, additional = n, "handle table growth failed: {e}");
            panic!("handle table growth failed: {e}");
        }
        self.slots.resize(offset + n, None);
        offset
    }
}

fn is_reserved(idx: u32) -> bool {
    idx < RESERVED_SLOTS
}
