//! Module loading.
//!
//! Embedders hand over raw bytes that are either a `.wasm` binary or `.wat` text; file names
//! are not always available, so the bytes themselves are sniffed. WAT is converted with the
//! `wat` crate before compiling a Wasmtime `Module`.

use thiserror::Error;
use tracing::debug;
use wasmtime::{Engine, Module};

/// Error returned by loader helpers.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The input was empty or otherwise not recognized as WASM/WAT.
    #[error("unrecognized module format (expected wasm or wat)")]
    UnrecognizedFormat,

    #[error("failed to parse WAT: {0}")]
    WatParseFailed(#[from] wat::Error),

    #[error("failed to compile WASM module: {0:#}")]
    CompileFailed(anyhow::Error),
}

/// What kind of module the loader inferred from the bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DetectedFormat {
    Wasm,
    Wat,
}

/// Detect, convert WAT if needed, compile.
pub fn compile_module(engine: &Engine, bytes: &[u8]) -> Result<Module, LoadError> {
    let Detected { format, wasm_bytes } = normalize_to_wasm(bytes)?;
    debug!(?format, len = wasm_bytes.len(), "compiling guest module");
    Module::new(engine, &wasm_bytes).map_err(LoadError::CompileFailed)
}

/// Detect format and normalize to WASM bytes.
pub fn normalize_to_wasm(bytes: &[u8]) -> Result<Detected, LoadError> {
    let format = detect_format(bytes).ok_or(LoadError::UnrecognizedFormat)?;

    let wasm_bytes = match format {
        DetectedFormat::Wasm => bytes.to_vec(),
        DetectedFormat::Wat => wat::parse_bytes(bytes)?.into_owned(),
    };
    Ok(Detected { format, wasm_bytes })
}

#[derive(Clone, Debug)]
pub struct Detected {
    pub format: DetectedFormat,
    /// Always WASM bytes, whatever the input was.
    pub wasm_bytes: Vec<u8>,
}

/// `\0asm` magic means WASM; a `(` after an optional BOM and whitespace means WAT.
pub fn detect_format(bytes: &[u8]) -> Option<DetectedFormat> {
    if bytes.starts_with(b"\0asm") {
        return Some(DetectedFormat::Wasm);
    }

    let text = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match text.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'(') | Some(b';') => Some(DetectedFormat::Wat),
        _ => None,
    }
}
