//! Host object model.
//!
//! The host side of the bridge is a garbage-collected object graph; here that graph is modelled
//! with reference-counted values. A `HostValue` is what a handle table slot holds and what the
//! guest refers to by integer index.

use crate::closure::ClosureRef;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Result of a host operation: `Err` carries the thrown value.
pub type HostResult = Result<HostValue, HostValue>;

/// A host function that needs no access to the guest.
pub type NativeFn = dyn Fn(&[HostValue]) -> HostResult + Send + Sync;

/// Plain-data object fields, rendered as JSON by `debug_string`.
pub type ObjectFields = serde_json::Map<String, serde_json::Value>;

/// Any value the host can hand to the guest.
#[derive(Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Symbol(Option<Arc<str>>),
    Array(Arc<[HostValue]>),
    Object(Arc<ObjectFields>),
    Error(Arc<HostError>),
    Function(HostFunction),
    /// A native object (canvas, audio node, ...) the guest only ever holds by handle.
    Opaque(Arc<OpaqueObject>),
}

/// A thrown host error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

/// Callable host values.
#[derive(Clone)]
pub enum HostFunction {
    Native { name: Arc<str>, f: Arc<NativeFn> },
    /// A guest callback wrapped by the closure bridge.
    Guest(ClosureRef),
}

/// A native object with a class name and an arbitrary payload.
pub struct OpaqueObject {
    pub class: String,
    pub payload: Box<dyn Any + Send + Sync>,
}

impl HostValue {
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        HostValue::String(s.into())
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        HostValue::Error(Arc::new(HostError {
            name: name.into(),
            message: message.into(),
            stack: None,
        }))
    }

    pub fn array(items: impl IntoIterator<Item = HostValue>) -> Self {
        HostValue::Array(items.into_iter().collect())
    }

    pub fn object(fields: ObjectFields) -> Self {
        HostValue::Object(Arc::new(fields))
    }

    pub fn opaque(class: impl Into<String>, payload: impl Any + Send + Sync) -> Self {
        HostValue::Opaque(Arc::new(OpaqueObject {
            class: class.into(),
            payload: Box::new(payload),
        }))
    }

    pub fn native_fn(
        name: impl Into<Arc<str>>,
        f: impl Fn(&[HostValue]) -> HostResult + Send + Sync + 'static,
    ) -> Self {
        HostValue::Function(HostFunction::Native {
            name: name.into(),
            f: Arc::new(f),
        })
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// `undefined` or `null`.
    pub fn is_like_none(&self) -> bool {
        self.is_undefined() || self.is_null()
    }

    pub fn is_function(&self) -> bool {
        matches!(self, HostValue::Function(_))
    }

    /// `typeof v === 'object' && v !== null`.
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            HostValue::Array(_) | HostValue::Object(_) | HostValue::Error(_) | HostValue::Opaque(_)
        )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ClosureRef> {
        match self {
            HostValue::Function(HostFunction::Guest(c)) => Some(c),
            _ => None,
        }
    }

    /// Downcast the payload of an opaque native object.
    pub fn downcast_opaque<T: Any>(&self) -> Option<&T> {
        match self {
            HostValue::Opaque(obj) => obj.payload.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Identity comparison with `===` semantics (objects compare by reference).
    pub fn strict_eq(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Symbol(a), HostValue::Symbol(b)) => match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            },
            (HostValue::Array(a), HostValue::Array(b)) => Arc::ptr_eq(a, b),
            (HostValue::Object(a), HostValue::Object(b)) => Arc::ptr_eq(a, b),
            (HostValue::Error(a), HostValue::Error(b)) => Arc::ptr_eq(a, b),
            (HostValue::Opaque(a), HostValue::Opaque(b)) => Arc::ptr_eq(a, b),
            (HostValue::Function(a), HostValue::Function(b)) => a.same_function(b),
            _ => false,
        }
    }

    /// Human-readable rendering used by `hostlink_debug_string`.
    pub fn debug_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_string(),
            HostValue::Null => "null".to_string(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::String(s) => format!("\"{s}\""),
            HostValue::Symbol(None) => "Symbol".to_string(),
            HostValue::Symbol(Some(desc)) => format!("Symbol({desc})"),
            HostValue::Function(f) => match f.name() {
                Some(name) if !name.is_empty() => format!("Function({name})"),
                _ => "Function".to_string(),
            },
            HostValue::Array(items) => {
                let parts: Vec<String> = items.iter().map(HostValue::debug_string).collect();
                format!("[{}]", parts.join(", "))
            }
            HostValue::Object(fields) => match serde_json::to_string(fields.as_ref()) {
                Ok(json) => format!("Object({json})"),
                Err(_) => "Object".to_string(),
            },
            HostValue::Error(err) => match &err.stack {
                Some(stack) => format!("{}: {}\n{}", err.name, err.message, stack),
                None => format!("{}: {}", err.name, err.message),
            },
            HostValue::Opaque(obj) => obj.class.clone(),
        }
    }
}

impl HostFunction {
    pub fn name(&self) -> Option<&str> {
        match self {
            HostFunction::Native { name, .. } => Some(name),
            HostFunction::Guest(_) => None,
        }
    }

    fn same_function(&self, other: &HostFunction) -> bool {
        match (self, other) {
            (HostFunction::Native { f: a, .. }, HostFunction::Native { f: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (HostFunction::Guest(a), HostFunction::Guest(b)) => a.same_closure(b),
            _ => false,
        }
    }
}

/// Number formatting that matches the host's `String(n)`.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let formatted = format!("{n:e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => formatted,
        };
    }
    n.to_string()
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_string())
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.into())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s.into())
    }
}

impl From<ClosureRef> for HostValue {
    fn from(c: ClosureRef) -> Self {
        HostValue::Function(HostFunction::Guest(c))
    }
}
