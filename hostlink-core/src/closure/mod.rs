//! Guest callbacks exposed to the host as callable values.
//!
//! A guest closure is two opaque words (`a`, `b`) plus two function table indices: a
//! destructor and an invoke shim. The host wraps it in a [`ClosureRef`] that host code can store
//! and call any number of times. The guest's capture must be destroyed exactly once, either:
//!
//! - by the guest, when it drops its reference while no invocation is in flight
//!   (`hostlink_cb_drop` returns `true`),
//! - by the host, at the end of the invocation that observes the last reference going away,
//! - by the host, when every host-side `ClosureRef` clone is gone and the finalizer runs.
//!
//! Finalization is deferred: dropping the last `ClosureRef` only queues the closure id, and
//! [`run_finalizers`] calls the destructors later from a top-level entry point.

use crate::error::{BridgeError, Result};
use crate::sandbox::Sandbox;
use crate::value::HostValue;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// How host arguments are lowered into the invoke shim's parameters.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClosureShape {
    /// `(a, b)`
    Nullary = 0,
    /// `(a, b, h)` with `h` a fresh handle to the first argument.
    Unary = 1,
    /// `(a, b, h)` with `h == 0` when the first argument is `undefined`/`null`.
    UnaryOptional = 2,
    /// `(a, b, h0, h1)`
    Binary = 3,
}

impl ClosureShape {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ClosureShape::Nullary),
            1 => Some(ClosureShape::Unary),
            2 => Some(ClosureShape::UnaryOptional),
            3 => Some(ClosureShape::Binary),
            _ => None,
        }
    }

    /// Number of handle parameters after `(a, b)`.
    pub fn arity(self) -> usize {
        match self {
            ClosureShape::Nullary => 0,
            ClosureShape::Unary | ClosureShape::UnaryOptional => 1,
            ClosureShape::Binary => 2,
        }
    }
}

/// Stable arena address of a closure.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClosureId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ClosureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Bookkeeping for one guest closure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosureState {
    /// First capture word; zero while an invocation is in flight or after the drop.
    pub a: u32,
    pub b: u32,
    pub refcount: u32,
    pub dtor: u32,
    pub invoke: u32,
    pub shape: ClosureShape,
    depth: u32,
    dropped: bool,
}

impl ClosureState {
    pub fn is_invoking(&self) -> bool {
        self.depth > 0
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }
}

type FinalizeQueue = Arc<Mutex<Vec<ClosureId>>>;

struct Token {
    id: ClosureId,
    queue: FinalizeQueue,
}

impl Drop for Token {
    fn drop(&mut self) {
        // A poisoned queue still holds valid ids.
        let mut queue = match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.push(self.id);
    }
}

/// Host-side handle to a guest closure. Clones share one finalization token.
#[derive(Clone)]
pub struct ClosureRef(Arc<Token>);

impl ClosureRef {
    pub fn id(&self) -> ClosureId {
        self.0.id
    }

    pub fn same_closure(&self, other: &ClosureRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ClosureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClosureRef").field(&self.0.id).finish()
    }
}

struct Entry {
    generation: u32,
    state: Option<ClosureState>,
}

/// What the caller must do once an invocation finishes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InvokeEnd {
    Restored,
    Destroy { dtor: u32, a: u32, b: u32 },
}

/// Saved words for an invocation in flight.
#[derive(Debug)]
pub(crate) struct InvokeFrame {
    pub a: u32,
    pub b: u32,
    pub invoke: u32,
    pub shape: ClosureShape,
}

/// Arena of closure records.
pub struct ClosureArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
    queue: FinalizeQueue,
}

impl Default for ClosureArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClosureArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureArena")
            .field("live", &self.live_count())
            .field("pending_finalizers", &self.pending_finalizers())
            .finish()
    }
}

impl ClosureArena {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a closure with refcount 1.
    pub fn create(&mut self, a: u32, b: u32, dtor: u32, invoke: u32, shape: ClosureShape) -> ClosureRef {
        let state = ClosureState {
            a,
            b,
            refcount: 1,
            dtor,
            invoke,
            shape,
            depth: 0,
            dropped: false,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.generation = entry.generation.wrapping_add(1);
                entry.state = Some(state);
                ClosureId {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    state: Some(state),
                });
                ClosureId {
                    index,
                    generation: 0,
                }
            }
        };
        debug!(%id, a, b, dtor, invoke, ?shape, "closure created");
        ClosureRef(Arc::new(Token {
            id,
            queue: Arc::clone(&self.queue),
        }))
    }

    pub fn get(&self, id: ClosureId) -> Option<&ClosureState> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.state.as_ref())
    }

    fn live_mut(&mut self, id: ClosureId) -> Result<&mut ClosureState> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.state.as_mut())
            .filter(|s| !s.dropped)
            .ok_or_else(|| BridgeError::ClosureDropped(id.to_string()))
    }

    /// Closures not yet dropped.
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| e.state.as_ref())
            .filter(|s| !s.dropped)
            .count()
    }

    pub fn pending_finalizers(&self) -> usize {
        match self.queue.lock() {
            Ok(q) => q.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub(crate) fn begin_invoke(&mut self, id: ClosureId) -> Result<InvokeFrame> {
        let state = self.live_mut(id)?;
        state.refcount += 1;
        state.depth += 1;
        let frame = InvokeFrame {
            a: state.a,
            b: state.b,
            invoke: state.invoke,
            shape: state.shape,
        };
        state.a = 0;
        Ok(frame)
    }

    pub(crate) fn end_invoke(&mut self, id: ClosureId, saved_a: u32) -> InvokeEnd {
        let Some(state) = self
            .entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.state.as_mut())
        else {
            error!(%id, "closure vanished during invocation");
            panic!("closure {id} vanished during invocation");
        };
        if state.refcount == 0 {
            error!(%id, "closure refcount underflow");
            panic!("closure {id} refcount underflow");
        }
        state.refcount -= 1;
        state.depth -= 1;
        if state.refcount == 0 {
            state.dropped = true;
            state.a = 0;
            debug!(%id, "closure released by its last invocation");
            InvokeEnd::Destroy {
                dtor: state.dtor,
                a: saved_a,
                b: state.b,
            }
        } else {
            state.a = saved_a;
            InvokeEnd::Restored
        }
    }

    /// The guest dropped its reference. `true` means the guest must destroy the capture itself.
    pub fn drop_ref(&mut self, id: ClosureId) -> Result<bool> {
        let state = self.live_mut(id)?;
        state.refcount -= 1;
        if state.refcount == 0 {
            state.a = 0;
            state.dropped = true;
            debug!(%id, "closure dropped by guest");
            Ok(true)
        } else {
            debug!(%id, refcount = state.refcount, "closure drop deferred to in-flight invocation");
            Ok(false)
        }
    }

    /// Take queued ids, removing their entries. Returns the destructors still owed.
    pub(crate) fn drain_finalized(&mut self) -> Vec<(ClosureId, u32, u32, u32)> {
        let ids: Vec<ClosureId> = match self.queue.lock() {
            Ok(mut q) => q.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let mut owed = Vec::new();
        for id in ids {
            let Some(entry) = self
                .entries
                .get_mut(id.index as usize)
                .filter(|e| e.generation == id.generation)
            else {
                continue;
            };
            let Some(state) = entry.state.take() else {
                continue;
            };
            self.free.push(id.index);
            if !state.dropped {
                owed.push((id, state.dtor, state.a, state.b));
            }
        }
        owed
    }
}

/// Call a closure from the host.
///
/// The capture word is hidden from nested calls while this invocation runs; if the guest drops
/// its reference meanwhile, the destructor runs here once the shim returns.
pub fn invoke<S: Sandbox + ?Sized>(sb: &mut S, closure: &ClosureRef, args: &[HostValue]) -> Result<()> {
    let id = closure.id();
    let frame = sb.state().closures.begin_invoke(id)?;

    let state = sb.state();
    let mut lowered = Vec::with_capacity(frame.shape.arity());
    for i in 0..frame.shape.arity() {
        let arg = args.get(i).cloned().unwrap_or_default();
        let idx = match frame.shape {
            ClosureShape::UnaryOptional => state.table.insert_optional(arg),
            _ => state.table.insert(arg),
        };
        lowered.push(idx);
    }

    let result = sb.call_invoke(frame.invoke, frame.a, frame.b, &lowered);

    let end = sb.state().closures.end_invoke(id, frame.a);
    if let InvokeEnd::Destroy { dtor, a, b } = end {
        let destroyed = sb.call_destructor(dtor, a, b);
        result?;
        return destroyed;
    }
    result
}

/// Run destructors for closures whose last host reference is gone.
///
/// Only call this from a top-level entry point; never while a guest call is on the stack.
pub fn run_finalizers<S: Sandbox + ?Sized>(sb: &mut S) -> Result<usize> {
    let owed = sb.state().closures.drain_finalized();
    let mut first_err = None;
    let count = owed.len();
    for (id, dtor, a, b) in owed {
        debug!(%id, "finalizing closure");
        if let Err(e) = sb.call_destructor(dtor, a, b) {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(count),
    }
}
