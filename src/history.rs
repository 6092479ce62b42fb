//! Value model shared by the write buffer, value cache, syncer and sender.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Wall-clock timestamp with nanosecond part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub ns: i32,
}

impl Timespec {
    pub fn new(sec: i64, ns: i32) -> Self {
        Self { sec, ns }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            sec: now.timestamp(),
            ns: now.timestamp_subsec_nanos() as i32,
        }
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sec.cmp(&other.sec).then(self.ns.cmp(&other.ns))
    }
}

/// Item value type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Float,
    Str,
    Log,
    Uint,
    Text,
}

impl ValueType {
    /// Numeric code used in the database.
    pub fn code(self) -> i64 {
        match self {
            ValueType::Float => 0,
            ValueType::Str => 1,
            ValueType::Log => 2,
            ValueType::Uint => 3,
            ValueType::Text => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ValueType::Float),
            1 => Some(ValueType::Str),
            2 => Some(ValueType::Log),
            3 => Some(ValueType::Uint),
            4 => Some(ValueType::Text),
            _ => None,
        }
    }

    pub const ALL: [ValueType; 5] = [
        ValueType::Float,
        ValueType::Str,
        ValueType::Log,
        ValueType::Uint,
        ValueType::Text,
    ];
}

/// Log value payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogValue {
    pub value: String,
    pub timestamp: i64,
    pub source: Option<String>,
    pub severity: i32,
    pub logeventid: i64,
}

/// A typed item value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Uint(u64),
    Str(String),
    Text(String),
    Log(LogValue),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Float(_) => ValueType::Float,
            Value::Uint(_) => ValueType::Uint,
            Value::Str(_) => ValueType::Str,
            Value::Text(_) => ValueType::Text,
            Value::Log(_) => ValueType::Log,
        }
    }

    /// Textual representation used on the wire and in the database.
    pub fn as_text(&self) -> String {
        match self {
            Value::Float(v) => format_float(*v),
            Value::Uint(v) => v.to_string(),
            Value::Str(s) | Value::Text(s) => s.clone(),
            Value::Log(l) => l.value.clone(),
        }
    }

    /// Parses a stored textual value back into a typed value.
    ///
    /// Log metadata is not part of the text and must be restored by the caller.
    pub fn parse(value_type: ValueType, text: &str) -> Option<Value> {
        match value_type {
            ValueType::Float => text.trim().parse().ok().map(Value::Float),
            ValueType::Uint => text.trim().parse().ok().map(Value::Uint),
            ValueType::Str => Some(Value::Str(text.to_string())),
            ValueType::Text => Some(Value::Text(text.to_string())),
            ValueType::Log => Some(Value::Log(LogValue {
                value: text.to_string(),
                timestamp: 0,
                source: None,
                severity: 0,
                logeventid: 0,
            })),
        }
    }

    /// Approximate heap footprint beyond the fixed record size.
    pub fn heap_size(&self) -> usize {
        match self {
            Value::Float(_) | Value::Uint(_) => 0,
            Value::Str(s) | Value::Text(s) => s.len(),
            Value::Log(l) => l.value.len() + l.source.as_ref().map_or(0, |s| s.len()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

/// One collected value of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryValue {
    pub itemid: u64,
    pub ts: Timespec,
    pub value: Value,
}

/// Fixed per-value bookkeeping cost used for cache size accounting.
pub const HISTORY_VALUE_BASE_SIZE: usize = std::mem::size_of::<HistoryValue>();

impl HistoryValue {
    pub fn new(itemid: u64, ts: Timespec, value: Value) -> Self {
        Self { itemid, ts, value }
    }

    /// Bytes this value occupies in a byte-accounted buffer.
    pub fn size(&self) -> usize {
        HISTORY_VALUE_BASE_SIZE + self.value.heap_size()
    }
}

/// A value as it is kept in the value cache (item id is implied by the entry).
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub ts: Timespec,
    pub value: Value,
}

/// Fixed per-value cost inside the value cache.
pub const CACHED_VALUE_BASE_SIZE: usize = std::mem::size_of::<CachedValue>();

impl CachedValue {
    pub fn size(&self) -> usize {
        CACHED_VALUE_BASE_SIZE + self.value.heap_size()
    }
}

impl From<HistoryValue> for CachedValue {
    fn from(hv: HistoryValue) -> Self {
        Self {
            ts: hv.ts,
            value: hv.value,
        }
    }
}
