// src/core/protocol/resp_value.rs

//! Defines the decoded reply value handed to a command's success continuation.

use super::RespFrame;
use bytes::Bytes;
use std::fmt;

/// `RespValue` is what a caller sees of a successful reply.
///
/// Top-level error replies never become a `RespValue`; they are routed to the failure
/// continuation instead. `Error` can still appear nested inside an `Array` (e.g. the
/// per-command results of `EXEC`).
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    BulkString(Bytes),
    Integer(i64),
    Array(Vec<RespValue>),
    Null,
    NullArray,
    Error(String),
}

impl RespValue {
    /// Returns the value as UTF-8 text for simple and bulk strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Null | RespValue::NullArray)
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{s}"),
            RespValue::BulkString(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            RespValue::Integer(i) => write!(f, "(integer) {i}"),
            RespValue::Null | RespValue::NullArray => write!(f, "(nil)"),
            RespValue::Error(e) => write!(f, "(error) {e}"),
            RespValue::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, "\n{:indent$}", "")?;
                    }
                    let label = format!("{}) ", i + 1);
                    write!(f, "{label}")?;
                    item.fmt_indented(f, indent + label.len())?;
                }
                Ok(())
            }
        }
    }
}

/// Formats the value the way `redis-cli` prints replies.
impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl From<RespFrame> for RespValue {
    fn from(frame: RespFrame) -> Self {
        match frame {
            RespFrame::SimpleString(s) => RespValue::SimpleString(s),
            RespFrame::BulkString(b) => RespValue::BulkString(b),
            RespFrame::Integer(i) => RespValue::Integer(i),
            RespFrame::Array(arr) => RespValue::Array(arr.into_iter().map(Into::into).collect()),
            RespFrame::Null => RespValue::Null,
            RespFrame::NullArray => RespValue::NullArray,
            RespFrame::Error(s) => RespValue::Error(s),
        }
    }
}
