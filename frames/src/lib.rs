//! Wire frame model and MessagePack codec for the notebook socket.
//!
//! This crate owns the binary representation exchanged with the notebook
//! engine. Payloads stay flexible ([`Value`]) while the codec adds the
//! engine's extension types on top of plain MessagePack.
//!
//! EXTENSIONS
//! ==========
//! - `0x11`..`0x18`: int8, uint8, int16, uint16, int32, uint32, float32,
//!   float64 arrays, payload is the little-endian element bytes.
//! - `0x0d`: timestamp, one little-endian `i64` of milliseconds since epoch.

mod value;

pub use value::{Map, TypedArray, Value};

/// Largest integer a double can represent exactly (`2^53 - 1`).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

const EXT_TIMESTAMP: i8 = 0x0d;
const EXT_INT8: i8 = 0x11;
const EXT_UINT8: i8 = 0x12;
const EXT_INT16: i8 = 0x13;
const EXT_UINT16: i8 = 0x14;
const EXT_INT32: i8 = 0x15;
const EXT_UINT32: i8 = 0x16;
const EXT_FLOAT32: i8 = 0x17;
const EXT_FLOAT64: i8 = 0x18;

/// Top-level keys with a dedicated [`Frame`] field.
const KEY_TYPE: &str = "type";
const KEY_CLIENT_ID: &str = "client_id";
const KEY_REQUEST_ID: &str = "request_id";
const KEY_INITIATOR_ID: &str = "initiator_id";
const KEY_BODY: &str = "body";
/// The engine sends server-to-client payloads under this key.
const KEY_MESSAGE: &str = "message";

/// Error returned by the encode/decode functions.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes are not valid MessagePack.
    #[error("failed to decode frame: {0}")]
    Decode(String),
    /// Writing MessagePack failed.
    #[error("failed to encode frame: {0}")]
    Encode(String),
    /// Bytes remained after the first complete value.
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    /// A timestamp falls outside the range a double can hold exactly.
    #[error("value out of range: timestamp {0}")]
    OutOfRange(i64),
    /// An extension payload has the wrong length for its element type.
    #[error("extension 0x{code:02x} payload of {len} bytes is not a multiple of {width}")]
    Misaligned { code: i8, len: usize, width: usize },
    /// A map key on the wire was not a string.
    #[error("map key must be a string, got {0}")]
    NonStringKey(String),
    /// The decoded value is not a well-formed frame envelope.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
}

/// A single message on the notebook socket.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    /// Message type tag, e.g. `"update_notebook"`.
    pub kind: String,
    /// Sending client, present on client-originated frames.
    pub client_id: Option<String>,
    /// Correlation id; echoed by the engine on responses.
    pub request_id: Option<String>,
    /// Client whose action produced this update.
    pub initiator_id: Option<String>,
    /// Arbitrary payload.
    pub body: Value,
    /// Remaining top-level fields, e.g. `notebook_id`.
    pub metadata: Map,
}

impl Frame {
    /// Read a metadata field as a string.
    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Encode a value as MessagePack bytes.
///
/// # Errors
///
/// Returns [`CodecError::OutOfRange`] for timestamps beyond the safe-integer
/// range and [`CodecError::Encode`] if the writer fails.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let wire = to_wire(value)?;
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &wire).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode MessagePack bytes into a value.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes, and the extension
/// errors for out-of-range timestamps and misaligned typed arrays.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut cursor = bytes;
    let wire = rmpv::decode::read_value(&mut cursor).map_err(|e| CodecError::Decode(e.to_string()))?;
    if !cursor.is_empty() {
        return Err(CodecError::TrailingBytes(cursor.len()));
    }
    from_wire(wire)
}

/// Encode a frame into MessagePack bytes.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    encode(&frame_to_value(frame))
}

/// Decode MessagePack bytes into a frame.
///
/// # Errors
///
/// See [`decode`]; additionally [`CodecError::InvalidFrame`] when the value
/// is not a map or lacks a string `type`.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    value_to_frame(decode(bytes)?)
}

fn frame_to_value(frame: &Frame) -> Value {
    let mut map = frame.metadata.clone();
    map.insert(KEY_TYPE.to_owned(), Value::String(frame.kind.clone()));
    for (key, field) in [
        (KEY_CLIENT_ID, &frame.client_id),
        (KEY_REQUEST_ID, &frame.request_id),
        (KEY_INITIATOR_ID, &frame.initiator_id),
    ] {
        if let Some(v) = field {
            map.insert(key.to_owned(), Value::String(v.clone()));
        }
    }
    map.insert(KEY_BODY.to_owned(), frame.body.clone());
    Value::Map(map)
}

fn value_to_frame(value: Value) -> Result<Frame, CodecError> {
    let Value::Map(mut map) = value else {
        return Err(CodecError::InvalidFrame("top-level value is not a map"));
    };
    let kind = match map.remove(KEY_TYPE) {
        Some(Value::String(kind)) => kind,
        _ => return Err(CodecError::InvalidFrame("missing string `type`")),
    };
    let mut take_str = |key: &str| match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    let client_id = take_str(KEY_CLIENT_ID);
    let request_id = take_str(KEY_REQUEST_ID);
    let initiator_id = take_str(KEY_INITIATOR_ID);
    let body = map
        .remove(KEY_BODY)
        .or_else(|| map.remove(KEY_MESSAGE))
        .unwrap_or_else(Value::empty_map);

    Ok(Frame {
        kind,
        client_id,
        request_id,
        initiator_id,
        body,
        metadata: map,
    })
}

fn to_wire(value: &Value) -> Result<rmpv::Value, CodecError> {
    Ok(match value {
        Value::Nil => rmpv::Value::Nil,
        Value::Bool(b) => rmpv::Value::Boolean(*b),
        Value::Int(v) => rmpv::Value::from(*v),
        Value::UInt(v) => rmpv::Value::from(*v),
        Value::Float(v) => rmpv::Value::F64(*v),
        Value::String(s) => rmpv::Value::from(s.as_str()),
        Value::Binary(bytes) => rmpv::Value::Binary(bytes.clone()),
        Value::Array(items) => rmpv::Value::Array(items.iter().map(to_wire).collect::<Result<_, _>>()?),
        Value::Map(map) => rmpv::Value::Map(
            map.iter()
                .map(|(k, v)| Ok((rmpv::Value::from(k.as_str()), to_wire(v)?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        Value::TypedArray(arr) => typed_array_to_ext(arr),
        Value::Timestamp(ms) => {
            check_safe(*ms)?;
            rmpv::Value::Ext(EXT_TIMESTAMP, ms.to_le_bytes().to_vec())
        }
        Value::Ext { code, data } => rmpv::Value::Ext(*code, data.clone()),
    })
}

fn from_wire(wire: rmpv::Value) -> Result<Value, CodecError> {
    Ok(match wire {
        rmpv::Value::Nil => Value::Nil,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(int) => match (int.as_i64(), int.as_u64()) {
            (Some(v), _) => Value::Int(v),
            (None, Some(v)) => Value::UInt(v),
            (None, None) => return Err(CodecError::Decode(format!("unrepresentable integer {int:?}"))),
        },
        rmpv::Value::F32(v) => Value::Float(f64::from(v)),
        rmpv::Value::F64(v) => Value::Float(v),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Value::String(s),
            None => return Err(CodecError::Decode("string is not valid utf-8".to_owned())),
        },
        rmpv::Value::Binary(bytes) => Value::Binary(bytes),
        rmpv::Value::Array(items) => Value::Array(items.into_iter().map(from_wire).collect::<Result<_, _>>()?),
        rmpv::Value::Map(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                let key = match k {
                    rmpv::Value::String(s) => s
                        .into_str()
                        .ok_or_else(|| CodecError::Decode("map key is not valid utf-8".to_owned()))?,
                    other => return Err(CodecError::NonStringKey(other.to_string())),
                };
                map.insert(key, from_wire(v)?);
            }
            Value::Map(map)
        }
        rmpv::Value::Ext(code, data) => ext_to_value(code, data)?,
    })
}

fn check_safe(ms: i64) -> Result<(), CodecError> {
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&ms) {
        Ok(())
    } else {
        Err(CodecError::OutOfRange(ms))
    }
}

fn typed_array_to_ext(arr: &TypedArray) -> rmpv::Value {
    fn pack<T, const N: usize>(items: &[T], to_le: impl Fn(&T) -> [u8; N]) -> Vec<u8> {
        items.iter().flat_map(to_le).collect()
    }

    let (code, data) = match arr {
        TypedArray::Int8(v) => (EXT_INT8, pack(v, |x| x.to_le_bytes())),
        TypedArray::UInt8(v) => (EXT_UINT8, v.clone()),
        TypedArray::Int16(v) => (EXT_INT16, pack(v, |x| x.to_le_bytes())),
        TypedArray::UInt16(v) => (EXT_UINT16, pack(v, |x| x.to_le_bytes())),
        TypedArray::Int32(v) => (EXT_INT32, pack(v, |x| x.to_le_bytes())),
        TypedArray::UInt32(v) => (EXT_UINT32, pack(v, |x| x.to_le_bytes())),
        TypedArray::Float32(v) => (EXT_FLOAT32, pack(v, |x| x.to_le_bytes())),
        TypedArray::Float64(v) => (EXT_FLOAT64, pack(v, |x| x.to_le_bytes())),
    };
    rmpv::Value::Ext(code, data)
}

fn ext_to_value(code: i8, data: Vec<u8>) -> Result<Value, CodecError> {
    fn unpack<T, const N: usize>(code: i8, data: &[u8], from_le: impl Fn([u8; N]) -> T) -> Result<Vec<T>, CodecError> {
        if data.len() % N != 0 {
            return Err(CodecError::Misaligned { code, len: data.len(), width: N });
        }
        Ok(data
            .chunks_exact(N)
            .map(|chunk| {
                let mut buf = [0_u8; N];
                buf.copy_from_slice(chunk);
                from_le(buf)
            })
            .collect())
    }

    let arr = match code {
        EXT_TIMESTAMP => {
            if data.len() != 8 {
                return Err(CodecError::Misaligned { code, len: data.len(), width: 8 });
            }
            let ms = unpack(code, &data, i64::from_le_bytes)?[0];
            check_safe(ms)?;
            return Ok(Value::Timestamp(ms));
        }
        EXT_INT8 => TypedArray::Int8(unpack(code, &data, i8::from_le_bytes)?),
        EXT_UINT8 => TypedArray::UInt8(data),
        EXT_INT16 => TypedArray::Int16(unpack(code, &data, i16::from_le_bytes)?),
        EXT_UINT16 => TypedArray::UInt16(unpack(code, &data, u16::from_le_bytes)?),
        EXT_INT32 => TypedArray::Int32(unpack(code, &data, i32::from_le_bytes)?),
        EXT_UINT32 => TypedArray::UInt32(unpack(code, &data, u32::from_le_bytes)?),
        EXT_FLOAT32 => TypedArray::Float32(unpack(code, &data, f32::from_le_bytes)?),
        EXT_FLOAT64 => TypedArray::Float64(unpack(code, &data, f64::from_le_bytes)?),
        _ => return Ok(Value::Ext { code, data }),
    };
    Ok(Value::TypedArray(arr))
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
