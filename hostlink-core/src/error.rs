//! Error types for the bridge.

use crate::loader::LoadError;
use crate::value::HostValue;
use thiserror::Error;

/// Bridge error type.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Guest memory held bytes that are not valid UTF-8.
    #[error("invalid UTF-8 in guest memory at {offset:#x} (len {len}, valid up to {valid_up_to})")]
    Decode {
        offset: u32,
        len: u32,
        valid_up_to: usize,
    },

    /// A pointer/length pair fell outside the current linear memory.
    #[error("guest range {ptr:#x}+{len} is outside linear memory of {memory_len} bytes")]
    OutOfBounds { ptr: u32, len: u32, memory_len: usize },

    /// A handle index did not name a live handle table slot.
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    /// The guest does not export something the operation needs.
    #[error("guest missing export `{0}`")]
    MissingExport(&'static str),

    /// No guest instance is attached yet.
    #[error("no guest instance attached")]
    NotInstantiated,

    /// A closure was invoked after it reached the Dropped state.
    #[error("closure {0} invoked after it was dropped")]
    ClosureDropped(String),

    /// A guest function table entry had an unexpected type.
    #[error("function table entry {index} has the wrong signature: {reason}")]
    BadSignature { index: u32, reason: String },

    /// A host value thrown across the boundary (`hostlink_throw` or a host call failure).
    #[error("thrown: {}", .0.debug_string())]
    Thrown(HostValue),

    /// The guest trapped.
    #[error("guest trapped: {0}")]
    GuestTrap(String),

    /// The guest allocator failed.
    #[error("guest allocation of {size} bytes (align {align}) failed")]
    Allocation { size: u32, align: u32 },

    /// Module loading failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Engine, linker or instantiation failure.
    #[error("engine error: {0}")]
    Engine(String),

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl BridgeError {
    /// Convert an error coming back out of a guest call.
    ///
    /// Errors raised by our own host functions travel through the guest as traps;
    /// they are recovered here instead of being flattened into a message.
    pub fn from_guest(err: anyhow::Error) -> Self {
        match err.downcast::<BridgeError>() {
            Ok(bridge) => bridge,
            Err(other) => BridgeError::GuestTrap(format!("{other:#}")),
        }
    }

    /// Wrap any engine-level failure.
    pub fn engine(err: impl core::fmt::Display) -> Self {
        BridgeError::Engine(err.to_string())
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
