//! Value and type model.
//!
//! Every fact argument is a [`Value`]; every schema position is a
//! [`ValueType`]. Values carry a total order (variant first, then the
//! carrier's own order) that the fact store, query results, and
//! seen-binding caches all rely on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single fact argument.
///
/// The derived `Ord` gives the canonical total order: values of different
/// variants order by variant (in declaration order), values of the same
/// variant order by their carrier. That means lexicographic for `String`,
/// `Blob`, and `Json` (JSON text is compared as bytes, not parsed), numeric
/// for `Addr`, element-wise for `List`.
///
/// # Examples
///
/// ```
/// use strata::Value;
///
/// let a = Value::String("a".into());
/// let b = Value::String("b".into());
/// assert!(a < b);
///
/// // Variant ordinal dominates: every String sorts before every Addr.
/// assert!(b < Value::Addr(0));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// UTF-8 text.
    String(String),
    /// Unsigned 64-bit address or counter. Distinct from `String` even where
    /// a storage backend erases the sign.
    Addr(u64),
    /// Opaque byte string.
    Blob(Vec<u8>),
    /// JSON document as UTF-8 text. Compared as bytes.
    Json(String),
    /// Homogeneous list; the element type is fixed by the schema.
    List(Vec<Value>),
}

impl Value {
    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub const fn is_addr(&self) -> bool {
        matches!(self, Self::Addr(_))
    }

    pub const fn is_blob(&self) -> bool {
        matches!(self, Self::Blob(_))
    }

    pub const fn is_json(&self) -> bool {
        matches!(self, Self::Json(_))
    }

    pub const fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_addr(&self) -> Option<u64> {
        match self {
            Self::Addr(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&str> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a human-readable tag name, used in type-mismatch diagnostics.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Addr(_) => "addr",
            Self::Blob(_) => "blob",
            Self::Json(_) => "json",
            Self::List(_) => "list",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v:?}"),
            Self::Addr(v) => write!(f, "{v:#x}"),
            Self::Blob(v) => write!(f, "blob[{}]", v.len()),
            Self::Json(v) => write!(f, "{v}"),
            Self::List(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Addr(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

/// The type of one schema position.
///
/// Structurally equal types are equal; `List` compares its element type
/// recursively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "elem", rename_all = "snake_case")]
pub enum ValueType {
    String,
    Addr,
    Blob,
    Json,
    List(Box<ValueType>),
}

impl ValueType {
    /// Returns true iff `value`'s tag matches this type, recursing into
    /// list elements.
    #[must_use]
    pub fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::String, Value::String(_))
            | (Self::Addr, Value::Addr(_))
            | (Self::Blob, Value::Blob(_))
            | (Self::Json, Value::Json(_)) => true,
            (Self::List(elem), Value::List(vs)) => vs.iter().all(|v| elem.check(v)),
            _ => false,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Addr => write!(f, "addr"),
            Self::Blob => write!(f, "blob"),
            Self::Json => write!(f, "json"),
            Self::List(elem) => write!(f, "list<{elem}>"),
        }
    }
}
