//! Loosely typed property values and their typed accessors.

use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{CimInstance, WmiObjectPath};

/// A single CIM property or method argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CimValue {
    Null,
    Bool(bool),
    SInt(i64),
    UInt(u64),
    Real(f64),
    String(String),
    Bytes(Vec<u8>),
    Reference(WmiObjectPath),
    Instance(Box<CimInstance>),
    Array(Vec<CimValue>),
}

impl CimValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CimValue::Null)
    }

    /// Short tag name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            CimValue::Null => "null",
            CimValue::Bool(_) => "boolean",
            CimValue::SInt(_) => "sint",
            CimValue::UInt(_) => "uint",
            CimValue::Real(_) => "real",
            CimValue::String(_) => "string",
            CimValue::Bytes(_) => "bytes",
            CimValue::Reference(_) => "reference",
            CimValue::Instance(_) => "instance",
            CimValue::Array(_) => "array",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CimValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce to `T`, returning `None` when the tag does not fit.
    pub fn get<T: FromCimValue>(&self) -> Option<T> {
        T::from_cim_value(self)
    }
}

impl fmt::Display for CimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CimValue::Null => f.write_str("null"),
            CimValue::Bool(v) => write!(f, "{v}"),
            CimValue::SInt(v) => write!(f, "{v}"),
            CimValue::UInt(v) => write!(f, "{v}"),
            CimValue::Real(v) => write!(f, "{v}"),
            CimValue::String(v) => write!(f, "\"{v}\""),
            CimValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            CimValue::Reference(p) => write!(f, "{p}"),
            CimValue::Instance(i) => write!(f, "instance of {}", i.class_name()),
            CimValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Conversion from a [`CimValue`] into a Rust type.
pub trait FromCimValue: Sized {
    /// Name reported in `InvalidPropertyValue` errors.
    const TYPE_NAME: &'static str;

    fn from_cim_value(value: &CimValue) -> Option<Self>;
}

impl FromCimValue for CimValue {
    const TYPE_NAME: &'static str = "value";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromCimValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        match value {
            CimValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

macro_rules! impl_cim_int {
    ($variant:ident, $wide:ty; $($ty:ty),*) => {$(
        impl FromCimValue for $ty {
            const TYPE_NAME: &'static str = stringify!($ty);

            fn from_cim_value(value: &CimValue) -> Option<Self> {
                match value {
                    CimValue::SInt(v) => <$ty>::try_from(*v).ok(),
                    CimValue::UInt(v) => <$ty>::try_from(*v).ok(),
                    _ => None,
                }
            }
        }

        impl From<$ty> for CimValue {
            fn from(v: $ty) -> Self {
                CimValue::$variant(<$wide>::from(v))
            }
        }
    )*};
}

impl_cim_int!(SInt, i64; i8, i16, i32, i64);
impl_cim_int!(UInt, u64; u8, u16, u32, u64);

impl FromCimValue for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        match value {
            CimValue::Real(v) => Some(*v),
            CimValue::SInt(v) => Some(*v as f64),
            CimValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl FromCimValue for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        f64::from_cim_value(value).map(|v| v as f32)
    }
}

impl FromCimValue for String {
    const TYPE_NAME: &'static str = "string";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        match value {
            CimValue::String(s) => Some(s.clone()),
            CimValue::Reference(p) => Some(p.to_string()),
            _ => None,
        }
    }
}

impl FromCimValue for WmiObjectPath {
    const TYPE_NAME: &'static str = "object path";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        match value {
            CimValue::Reference(p) => Some(p.clone()),
            CimValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromCimValue for CimInstance {
    const TYPE_NAME: &'static str = "embedded instance";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        match value {
            CimValue::Instance(i) => Some((**i).clone()),
            _ => None,
        }
    }
}

impl FromCimValue for Duration {
    const TYPE_NAME: &'static str = "interval";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        value.as_str().and_then(parse_cim_interval)
    }
}

impl<T: FromCimValue> FromCimValue for Vec<T> {
    const TYPE_NAME: &'static str = "array";

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        match value {
            CimValue::Array(items) => items.iter().map(T::from_cim_value).collect(),
            CimValue::Bytes(bytes) => bytes
                .iter()
                .map(|b| T::from_cim_value(&CimValue::UInt(u64::from(*b))))
                .collect(),
            _ => None,
        }
    }
}

impl<T: FromCimValue> FromCimValue for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_cim_value(value: &CimValue) -> Option<Self> {
        match value {
            CimValue::Null => Some(None),
            other => T::from_cim_value(other).map(Some),
        }
    }
}

impl From<bool> for CimValue {
    fn from(v: bool) -> Self {
        CimValue::Bool(v)
    }
}

impl From<f64> for CimValue {
    fn from(v: f64) -> Self {
        CimValue::Real(v)
    }
}

impl From<&str> for CimValue {
    fn from(v: &str) -> Self {
        CimValue::String(v.to_string())
    }
}

impl From<String> for CimValue {
    fn from(v: String) -> Self {
        CimValue::String(v)
    }
}

impl From<WmiObjectPath> for CimValue {
    fn from(v: WmiObjectPath) -> Self {
        CimValue::Reference(v)
    }
}

impl From<CimInstance> for CimValue {
    fn from(v: CimInstance) -> Self {
        CimValue::Instance(Box::new(v))
    }
}

impl From<Vec<CimValue>> for CimValue {
    fn from(v: Vec<CimValue>) -> Self {
        CimValue::Array(v)
    }
}

impl From<Vec<String>> for CimValue {
    fn from(v: Vec<String>) -> Self {
        CimValue::Array(v.into_iter().map(CimValue::String).collect())
    }
}

impl From<Duration> for CimValue {
    fn from(v: Duration) -> Self {
        CimValue::String(format_cim_interval(v))
    }
}

impl<T: Into<CimValue>> From<Option<T>> for CimValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(CimValue::Null, Into::into)
    }
}

/// Parse a CIM interval (`ddddddddHHMMSS.mmmmmm:000`).
pub fn parse_cim_interval(s: &str) -> Option<Duration> {
    let bytes = s.as_bytes();
    if bytes.len() != 25 || bytes[14] != b'.' || bytes[21] != b':' {
        return None;
    }
    let field = |range: std::ops::Range<usize>| -> Option<u64> {
        let part = s.get(range)?;
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    };
    let days = field(0..8)?;
    let hours = field(8..10)?;
    let minutes = field(10..12)?;
    let seconds = field(12..14)?;
    let micros = field(15..21)?;
    if hours > 23 || minutes > 59 || seconds > 59 {
        return None;
    }
    let secs = ((days * 24 + hours) * 60 + minutes) * 60 + seconds;
    Some(Duration::from_secs(secs) + Duration::from_micros(micros))
}

/// Format a duration as a CIM interval.
pub fn format_cim_interval(d: Duration) -> String {
    let total = d.as_secs();
    let days = total / 86_400;
    let hours = (total / 3600) % 24;
    let minutes = (total / 60) % 60;
    let seconds = total % 60;
    format!(
        "{days:08}{hours:02}{minutes:02}{seconds:02}.{:06}:000",
        d.subsec_micros()
    )
}
