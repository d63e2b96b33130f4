//! Typed views over guest linear memory.
//!
//! A [`View`] is a descriptor for a typed window over one particular incarnation of the guest's
//! memory buffer: its base address, byte length and the cache generation it was built in.
//! Element access always goes through the live `&[u8]` of the current call, so the borrow
//! checker already prevents holding the bytes themselves across a guest call. What remains is
//! the cache: [`MemoryViews`] hands out a cached view while the buffer is unchanged and rebuilds
//! it once the buffer has grown, moved, or been explicitly invalidated.
//!
//! Callers must re-fetch views after any call into the guest. The `sandbox` wrappers invalidate
//! the cache after every such call, so a stale view is never returned by [`MemoryViews::get`].

use std::marker::PhantomData;
use tracing::trace;

/// The kinds of view the cache keeps one slot for.
#[repr(usize)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ViewKind {
    U8 = 0,
    I32 = 1,
    U32 = 2,
    F32 = 3,
    ClampedU8 = 4,
    Data = 5,
}

impl ViewKind {
    const COUNT: usize = 6;
}

/// A byte that saturates instead of wrapping when written.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Clamped(pub u8);

impl Clamped {
    /// Clamp to `0..=255`, rounding half to even; NaN becomes 0.
    pub fn from_f64(v: f64) -> Self {
        if v.is_nan() || v <= 0.0 {
            return Clamped(0);
        }
        if v >= 255.0 {
            return Clamped(255);
        }
        Clamped(v.round_ties_even() as u8)
    }
}

/// Element types a view can be built over.
pub trait Element: Copy {
    const KIND: ViewKind;
    const SIZE: usize;

    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
}

impl Element for u8 {
    const KIND: ViewKind = ViewKind::U8;
    const SIZE: usize = 1;

    fn read(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn write(self, bytes: &mut [u8]) {
        bytes[0] = self;
    }
}

impl Element for Clamped {
    const KIND: ViewKind = ViewKind::ClampedU8;
    const SIZE: usize = 1;

    fn read(bytes: &[u8]) -> Self {
        Clamped(bytes[0])
    }

    fn write(self, bytes: &mut [u8]) {
        bytes[0] = self.0;
    }
}

macro_rules! le_element {
    ($ty:ty, $kind:expr) => {
        impl Element for $ty {
            const KIND: ViewKind = $kind;
            const SIZE: usize = core::mem::size_of::<$ty>();

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }

            fn write(self, bytes: &mut [u8]) {
                bytes[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

le_element!(i32, ViewKind::I32);
le_element!(u32, ViewKind::U32);
le_element!(f32, ViewKind::F32);

/// Identity of one buffer incarnation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Attachment {
    base: usize,
    byte_len: usize,
    generation: u64,
}

impl Attachment {
    fn of(buf: &[u8], generation: u64) -> Self {
        Self {
            base: buf.as_ptr() as usize,
            byte_len: buf.len(),
            generation,
        }
    }

    fn matches(&self, buf: &[u8], generation: u64) -> bool {
        self.base == buf.as_ptr() as usize
            && self.byte_len == buf.len()
            && self.generation == generation
    }
}

/// A typed window over one buffer incarnation.
#[derive(Debug)]
pub struct View<T> {
    at: Attachment,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for View<T> {}

impl<T: Element> View<T> {
    fn new(at: Attachment) -> Self {
        Self {
            at,
            _marker: PhantomData,
        }
    }

    /// Number of whole elements in the view.
    pub fn len(&self) -> usize {
        self.at.byte_len / T::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.at.byte_len
    }

    pub fn generation(&self) -> u64 {
        self.at.generation
    }

    /// Whether `buf` is still the buffer this view was built over.
    pub fn is_attached_to(&self, buf: &[u8]) -> bool {
        self.at.base == buf.as_ptr() as usize && self.at.byte_len == buf.len()
    }

    /// Element at `index` (in elements, not bytes).
    pub fn get(&self, buf: &[u8], index: usize) -> Option<T> {
        debug_assert!(self.is_attached_to(buf), "stale memory view");
        let start = index.checked_mul(T::SIZE)?;
        let bytes = buf.get(start..start.checked_add(T::SIZE)?)?;
        Some(T::read(bytes))
    }

    /// Write `value` at `index`; `false` when out of range.
    pub fn set(&self, buf: &mut [u8], index: usize, value: T) -> bool {
        debug_assert!(self.is_attached_to(buf), "stale memory view");
        let Some(end) = index
            .checked_mul(T::SIZE)
            .and_then(|start| start.checked_add(T::SIZE))
        else {
            return false;
        };
        match buf.get_mut(end - T::SIZE..end) {
            Some(bytes) => {
                value.write(bytes);
                true
            }
            None => false,
        }
    }

    /// Copy `len` elements starting at byte address `ptr` (floored to element alignment).
    pub fn to_vec(&self, buf: &[u8], ptr: u32, len: usize) -> Option<Vec<T>> {
        let first = ptr as usize / T::SIZE;
        if first.checked_add(len)? > self.len() {
            return None;
        }
        (first..first + len).map(|i| self.get(buf, i)).collect()
    }
}

impl View<u8> {
    /// Borrow `len` bytes starting at `ptr`.
    pub fn subarray<'m>(&self, buf: &'m [u8], ptr: u32, len: u32) -> Option<&'m [u8]> {
        debug_assert!(self.is_attached_to(buf), "stale memory view");
        let start = ptr as usize;
        buf.get(start..start.checked_add(len as usize)?)
    }

    /// Mutably borrow `len` bytes starting at `ptr`.
    pub fn subarray_mut<'m>(&self, buf: &'m mut [u8], ptr: u32, len: u32) -> Option<&'m mut [u8]> {
        debug_assert!(self.is_attached_to(buf), "stale memory view");
        let start = ptr as usize;
        buf.get_mut(start..start.checked_add(len as usize)?)
    }
}

/// Byte-addressed little-endian accessor, used for out-parameter areas.
#[derive(Copy, Clone, Debug)]
pub struct DataView {
    bytes: View<u8>,
}

impl DataView {
    pub fn byte_len(&self) -> usize {
        self.bytes.byte_len()
    }

    pub fn get_i32(&self, buf: &[u8], addr: u32) -> Option<i32> {
        self.bytes.subarray(buf, addr, 4).map(i32::read)
    }

    pub fn get_f64(&self, buf: &[u8], addr: u32) -> Option<f64> {
        self.bytes
            .subarray(buf, addr, 8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn set_i32(&self, buf: &mut [u8], addr: u32, value: i32) -> bool {
        match self.bytes.subarray_mut(buf, addr, 4) {
            Some(dst) => {
                value.write(dst);
                true
            }
            None => false,
        }
    }

    pub fn set_f64(&self, buf: &mut [u8], addr: u32, value: f64) -> bool {
        match self.bytes.subarray_mut(buf, addr, 8) {
            Some(dst) => {
                dst.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

/// Counters kept by the cache.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ViewStats {
    pub hits: u64,
    pub rebuilds: u64,
    pub invalidations: u64,
}

/// Lazily built typed views over the current guest buffer.
#[derive(Debug, Default)]
pub struct MemoryViews {
    slots: [Option<Attachment>; ViewKind::COUNT],
    generation: u64,
    stats: ViewStats,
}

impl MemoryViews {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached view of kind `T` if still attached to `buf`, otherwise a fresh one.
    pub fn get<T: Element>(&mut self, buf: &[u8]) -> View<T> {
        View::new(self.attach(T::KIND, buf))
    }

    pub fn u8(&mut self, buf: &[u8]) -> View<u8> {
        self.get::<u8>(buf)
    }

    pub fn data_view(&mut self, buf: &[u8]) -> DataView {
        DataView {
            bytes: View::new(self.attach(ViewKind::Data, buf)),
        }
    }

    /// Forget every cached view. Call after anything that may have grown the buffer.
    pub fn invalidate_all(&mut self) {
        self.slots = [None; ViewKind::COUNT];
        self.generation += 1;
        self.stats.invalidations += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> ViewStats {
        self.stats
    }

    fn attach(&mut self, kind: ViewKind, buf: &[u8]) -> Attachment {
        let generation = self.generation;
        let slot = &mut self.slots[kind as usize];
        match slot {
            Some(at) if at.matches(buf, generation) => {
                self.stats.hits += 1;
                *at
            }
            _ => {
                let at = Attachment::of(buf, generation);
                trace!(?kind, byte_len = buf.len(), generation, "memory view rebuilt");
                *slot = Some(at);
                self.stats.rebuilds += 1;
                at
            }
        }
    }
}
