//! Configuration for the bridge runtime.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Bytes a single decoder instance may decode before it is replaced.
///
/// Some hosts' decoders misbehave after roughly 2 GiB of cumulative input.
pub const DEFAULT_DECODER_ROTATION_BYTES: u64 = 2_146_435_072;

/// Import module name used by guests.
pub const DEFAULT_IMPORT_MODULE: &str = "env";

/// Wasm proposal toggles handed to the Wasmtime engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmFeatures {
    pub reference_types: bool,
    pub multi_value: bool,
    pub bulk_memory: bool,
    pub simd: bool,
    pub exceptions: bool,
}

impl Default for WasmFeatures {
    fn default() -> Self {
        Self {
            reference_types: true,
            multi_value: true,
            bulk_memory: true,
            simd: true,
            exceptions: false,
        }
    }
}

/// Configuration for [`crate::runtime::HostlinkRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Module name the guest imports host functions from.
    pub import_module: String,

    /// Cumulative decoded bytes after which the string decoder is replaced.
    pub decoder_rotation_bytes: u64,

    /// Slots reserved up front in the handle table.
    pub initial_table_capacity: usize,

    /// Engine feature toggles.
    pub features: WasmFeatures,

    /// Fuel budget per store (`None` = unmetered).
    pub fuel_limit: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            import_module: DEFAULT_IMPORT_MODULE.to_string(),
            decoder_rotation_bytes: DEFAULT_DECODER_ROTATION_BYTES,
            initial_table_capacity: 128,
            features: WasmFeatures::default(),
            fuel_limit: None,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builder: import module name
    pub fn import_module(mut self, name: impl Into<String>) -> Self {
        self.import_module = name.into();
        self
    }

    /// Builder: decoder rotation threshold
    pub fn decoder_rotation_bytes(mut self, bytes: u64) -> Self {
        self.decoder_rotation_bytes = bytes;
        self
    }

    /// Builder: initial handle table capacity
    pub fn initial_table_capacity(mut self, slots: usize) -> Self {
        self.initial_table_capacity = slots;
        self
    }

    /// Builder: fuel limit
    pub fn fuel_limit(mut self, fuel: Option<u64>) -> Self {
        self.fuel_limit = fuel;
        self
    }

    /// Builder: engine features
    pub fn features(mut self, features: WasmFeatures) -> Self {
        self.features = features;
        self
    }
}
