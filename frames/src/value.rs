//! In-memory value model carried by frames and notebook state.
//!
//! DESIGN
//! ======
//! `Value` is a JSON-like tree extended with the two families the notebook
//! engine puts on the wire: fixed-width numeric arrays and millisecond
//! timestamps. Maps are keyed by strings and ordered (`BTreeMap`) so that
//! diffs and encodings are deterministic.

use std::collections::BTreeMap;

/// String-keyed map of values.
pub type Map = BTreeMap<String, Value>;

/// A decoded payload value.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    /// Only produced for integers above `i64::MAX`.
    UInt(u64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(Map),
    TypedArray(TypedArray),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Extension payload with a code this codec does not interpret.
    Ext { code: i8, data: Vec<u8> },
}

/// Fixed-width numeric array, mirroring the engine's typed-array extensions.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedArray {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl TypedArray {
    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int8(v) => v.len(),
            Self::UInt8(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::UInt16(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::UInt32(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements widened to `f64`, for display and JSON export.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Self::Int8(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::UInt8(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::Int16(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::UInt16(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::Int32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::UInt32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::Float32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::Float64(v) => v.clone(),
        }
    }
}

impl Value {
    /// An empty map.
    #[must_use]
    pub fn empty_map() -> Self {
        Self::Map(Map::new())
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key when `self` is a map.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.as_map_mut().and_then(|m| m.get_mut(key))
    }

    /// Follow a chain of map keys.
    #[must_use]
    pub fn pointer(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().try_fold(self, |node, key| node.get(key))
    }

    /// Insert into a map, turning `Nil` into an empty map first.
    ///
    /// Returns the previous value. Non-map, non-nil receivers are left
    /// untouched and the new value is handed back.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        if self.is_nil() {
            *self = Self::empty_map();
        }
        match self {
            Self::Map(m) => m.insert(key.into(), value),
            _ => Some(value),
        }
    }

    /// Short type name used in error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::UInt(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::TypedArray(_) => "typed array",
            Self::Timestamp(_) => "timestamp",
            Self::Ext { .. } => "extension",
        }
    }

    /// Lossy JSON view: typed arrays become number arrays, timestamps
    /// become millisecond integers, binary becomes an array of bytes.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Nil => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(v) | Self::Timestamp(v) => Json::from(*v),
            Self::UInt(v) => Json::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v).map_or(Json::Null, Json::Number),
            Self::String(s) => Json::String(s.clone()),
            Self::Binary(bytes) | Self::Ext { data: bytes, .. } => {
                Json::Array(bytes.iter().map(|b| Json::from(*b)).collect())
            }
            Self::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Self::Map(m) => Json::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Self::TypedArray(arr) => Json::Array(
                arr.to_f64_vec()
                    .into_iter()
                    .map(|x| serde_json::Number::from_f64(x).map_or(Json::Null, Json::Number))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::Nil,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Self::Int(v)
                } else if let Some(v) = n.as_u64() {
                    Self::UInt(v)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(m) => Self::Map(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Self::Map(m)
    }
}

impl From<TypedArray> for Value {
    fn from(arr: TypedArray) -> Self {
        Self::TypedArray(arr)
    }
}

#[cfg(test)]
#[path = "value_test.rs"]
mod tests;
