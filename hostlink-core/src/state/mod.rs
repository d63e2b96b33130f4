//! Per-instance bridge state.
//!
//! One `BridgeState` exists per guest instance. It lives in the Wasmtime `Store` data, so it is
//! created with the store and dropped with it; host imports reach it through their `Caller`.

use crate::abi::GuestExports;
use crate::closure::ClosureArena;
use crate::codec::Utf8Decoder;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::exception::ExceptionSlot;
use crate::memory::MemoryViews;
use crate::table::HandleTable;

#[derive(Debug)]
pub struct BridgeState {
    pub config: BridgeConfig,
    pub views: MemoryViews,
    pub decoder: Utf8Decoder,
    pub table: HandleTable,
    pub closures: ClosureArena,
    pub exn: ExceptionSlot,
    exports: Option<GuestExports>,
}

impl BridgeState {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            views: MemoryViews::new(),
            decoder: Utf8Decoder::with_rotation(config.decoder_rotation_bytes),
            table: HandleTable::with_capacity(config.initial_table_capacity),
            closures: ClosureArena::new(),
            exn: ExceptionSlot::new(),
            exports: None,
            config,
        }
    }

    /// Guest exports, once an instance is attached.
    pub fn exports(&self) -> Result<&GuestExports> {
        self.exports.as_ref().ok_or(BridgeError::NotInstantiated)
    }

    pub(crate) fn attach(&mut self, exports: GuestExports) {
        self.exports = Some(exports);
        self.views.invalidate_all();
    }

    pub fn is_attached(&self) -> bool {
        self.exports.is_some()
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}
