// Plain MessagePack value, produced when decoding without a schema graph.

/// A decoded MessagePack value.
///
/// Maps keep their wire order, so two decodes of the same bytes compare equal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    /// Any integer that fits in `i64` (negative fixint, int8..int64, and
    /// unsigned values up to `i64::MAX`).
    Int(i64),
    /// Unsigned 64-bit values above `i64::MAX`.
    UInt(u64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// Extension payload with its application type byte.
    Ext(i8, Vec<u8>),
    /// Milliseconds since the Unix epoch (fixext 8, type 0).
    Timestamp(u64),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Int(v) => u64::try_from(v).ok(),
            Value::UInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::json!(i),
            Value::UInt(u) => serde_json::json!(u),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s),
            Value::Bin(b) | Value::Ext(_, b) => {
                serde_json::Value::Array(b.into_iter().map(|x| serde_json::json!(x)).collect())
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(pairs) => {
                let mut obj = serde_json::Map::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = match k {
                        Value::Str(s) => s,
                        other => serde_json::Value::from(other).to_string(),
                    };
                    obj.insert(key, v.into());
                }
                serde_json::Value::Object(obj)
            }
            Value::Timestamp(ms) => serde_json::json!({ "timestamp": ms }),
        }
    }
}
