//! Field values attached to decoded transactions.
//!
//! Decoders copy what they need out of the reassembly buffer, so every
//! value here is owned. Strings use `CompactString` (inline up to 24 bytes),
//! which covers most methods, status phrases and table names without
//! touching the heap.

use compact_str::CompactString;
use serde::Serialize;

/// A protocol-specific value in a transaction's payload map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Unsigned integer (row counts, ids, sizes)
    UInt(u64),
    /// Signed integer (thrift i32/i64, redis integers)
    Int(i64),
    /// Boolean value
    Bool(bool),
    /// Owned string
    Str(CompactString),
    /// List of values (table names, row previews)
    List(Vec<FieldValue>),
    /// Null/missing value
    Null,
}

impl FieldValue {
    /// Build a string value.
    pub fn str(s: impl AsRef<str>) -> Self {
        FieldValue::Str(CompactString::new(s.as_ref()))
    }

    /// Check if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Try to get as u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(v) => Some(*v),
            FieldValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Try to get as str reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to get as list reference.
    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<CompactString> for FieldValue {
    fn from(v: CompactString) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::str(v)
    }
}

impl From<Vec<CompactString>> for FieldValue {
    fn from(v: Vec<CompactString>) -> Self {
        FieldValue::List(v.into_iter().map(FieldValue::Str).collect())
    }
}

/// Copy at most `max` bytes of `data` into a string, replacing invalid UTF-8.
///
/// Returns the string and whether it was cut short. A cap of 0 disables
/// truncation.
pub fn truncated_string(data: &[u8], max: usize) -> (CompactString, bool) {
    if max == 0 || data.len() <= max {
        return (CompactString::from_utf8_lossy(data), false);
    }
    (CompactString::from_utf8_lossy(&data[..max]), true)
}
