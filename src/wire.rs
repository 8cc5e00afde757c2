//! Wire-level envelope types and the MessagePack codec.
//!
//! Every frame on the link is one self-describing MessagePack map. Requests
//! carry a fixed kind tag, a per-call identifier, a method name, and an
//! argument array; responses carry the identifier plus either a `result` or an
//! `error` value. Encoding by field name (rather than positionally) is what
//! lets either side grow new fields without breaking the other: the decoder
//! ignores keys it does not know.

use std::io::{self, Cursor};

use rmpv::Value;
use serde::{Deserialize, Serialize};

use crate::errors::{DecodeError, EncodeError};

// ============================================================================
// Call identifier
// ============================================================================

/// Identifier matching a request to its eventual response.
///
/// Assigned by the dispatcher from a monotonically increasing counter starting
/// at 1, unique per connection lifetime. The counter wraps only after
/// exhausting the u32 range, which no session reaches in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CallId(pub u32);

impl CallId {
    /// Create a new call ID.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for CallId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call:{}", self.0)
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Message kind tag for requests. The protocol reserves other values for
/// future message kinds; the client only ever sends this one.
pub const KIND_REQUEST: u8 = 0;

/// An outbound call, immutable once constructed.
///
/// Serializes as `{"type": 0, "msgId": n, "method": "...", "params": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Message kind tag, always [`KIND_REQUEST`].
    #[serde(rename = "type")]
    pub kind: u8,
    /// Identifier the response must echo back.
    #[serde(rename = "msgId")]
    pub msg_id: CallId,
    /// Remote method name, treated as opaque by this crate.
    pub method: String,
    /// Ordered, heterogeneous argument list.
    pub params: Vec<Value>,
}

impl RequestEnvelope {
    pub fn new(msg_id: CallId, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            kind: KIND_REQUEST,
            msg_id,
            method: method.into(),
            params,
        }
    }
}

/// An inbound response, produced only by the remote peer.
///
/// Presence of `error` signals failure; `result` is kept as an opaque
/// [`Value`] and decoded lazily into the caller's expected type. Unknown
/// fields in the map are ignored for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "msgId")]
    pub msg_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseEnvelope {
    /// Reinterpret an already-parsed MessagePack value as a response envelope.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        rmpv::ext::from_value(value).map_err(|e| DecodeError::Envelope(e.to_string()))
    }

    /// Human-readable text of the `error` field, if present.
    pub fn error_text(&self) -> Option<String> {
        self.error.as_ref().map(|e| match e {
            Value::String(s) => s.as_str().unwrap_or("<non-utf8 error>").to_owned(),
            other => other.to_string(),
        })
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Encode a request envelope into one wire frame.
pub fn encode_request(request: &RequestEnvelope) -> Result<Vec<u8>, EncodeError> {
    Ok(rmp_serde::to_vec_named(request)?)
}

/// Decode one complete frame into a response envelope.
pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope, DecodeError> {
    rmp_serde::from_slice(bytes).map_err(|e| DecodeError::Envelope(e.to_string()))
}

// ============================================================================
// Parameter marshalling
// ============================================================================

/// Conversion of caller arguments into the wire parameter array.
///
/// Implemented for tuples of up to eight `Serialize` values, so call sites
/// read `client.call("moveToPosition", (lat, lon, alt))`. A bare `Vec<Value>`
/// passes through untouched for callers that build params dynamically.
pub trait IntoParams {
    fn into_params(self) -> Result<Vec<Value>, EncodeError>;
}

impl IntoParams for Vec<Value> {
    fn into_params(self) -> Result<Vec<Value>, EncodeError> {
        Ok(self)
    }
}

macro_rules! impl_into_params_for_tuple {
    ($($name:ident)*) => {
        impl<$($name: Serialize),*> IntoParams for ($($name,)*) {
            #[allow(non_snake_case)]
            fn into_params(self) -> Result<Vec<Value>, EncodeError> {
                let ($($name,)*) = self;
                #[allow(unused_mut)]
                let mut params = Vec::new();
                $(
                    params.push(
                        rmpv::ext::to_value($name)
                            .map_err(|e| EncodeError::Param(e.to_string()))?,
                    );
                )*
                Ok(params)
            }
        }
    };
}

impl_into_params_for_tuple!();
impl_into_params_for_tuple!(A);
impl_into_params_for_tuple!(A B);
impl_into_params_for_tuple!(A B C);
impl_into_params_for_tuple!(A B C D);
impl_into_params_for_tuple!(A B C D E);
impl_into_params_for_tuple!(A B C D E F);
impl_into_params_for_tuple!(A B C D E F G);
impl_into_params_for_tuple!(A B C D E F G H);

// ============================================================================
// Incremental frame extraction
// ============================================================================

const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

/// Accumulates raw transport reads and yields one MessagePack value per
/// complete frame.
///
/// MessagePack is self-delimiting, so frame boundaries come from the encoding
/// itself rather than a length prefix. A single read may carry a partial
/// frame or several coalesced frames; this buffer handles both.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Offset of the first unread byte; consumed prefixes are reclaimed
    /// lazily once they grow past the compaction threshold.
    unread_start: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read transport bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffered bytes form only a partial frame
    /// (read more and try again). Returns [`DecodeError::Corrupt`] when the
    /// buffer can no longer parse as MessagePack at all; the stream cannot be
    /// resynchronized past that point.
    pub fn next_frame(&mut self) -> Result<Option<Value>, DecodeError> {
        let unread = &self.buf[self.unread_start..];
        if unread.is_empty() {
            self.compact();
            return Ok(None);
        }

        let mut cursor = Cursor::new(unread);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                self.unread_start += cursor.position() as usize;
                self.compact();
                Ok(Some(value))
            }
            Err(e) if is_truncation(&e) => Ok(None),
            Err(e) => Err(DecodeError::Corrupt(e.to_string())),
        }
    }

    fn compact(&mut self) {
        if self.unread_start == self.buf.len() {
            self.buf.clear();
            self.unread_start = 0;
            return;
        }
        if self.unread_start >= RECV_BUF_COMPACT_THRESHOLD && self.unread_start >= self.buf.len() / 2
        {
            self.buf.drain(..self.unread_start);
            self.unread_start = 0;
        }
    }
}

/// True for decode errors caused by the frame simply not being complete yet.
fn is_truncation(e: &rmpv::decode::Error) -> bool {
    #[allow(unreachable_patterns)]
    match e {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        // Depth-limit and any future variants mean real data, not truncation.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_bytes(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    fn response_bytes(msg_id: u32, result: Value) -> Vec<u8> {
        value_bytes(&Value::Map(vec![
            (Value::from("msgId"), Value::from(msg_id)),
            (Value::from("result"), result),
        ]))
    }

    #[test]
    fn request_encodes_as_named_map() {
        let request = RequestEnvelope::new(
            CallId::new(7),
            "takeoff",
            vec![Value::from(25.0_f64)],
        );
        let bytes = encode_request(&request).unwrap();

        let value = rmpv::decode::read_value(&mut Cursor::new(&bytes[..])).unwrap();
        let map = value.as_map().expect("request must be a map");
        let get = |key: &str| {
            map.iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("type"), Some(Value::from(0u8)));
        assert_eq!(get("msgId"), Some(Value::from(7u32)));
        assert_eq!(get("method"), Some(Value::from("takeoff")));
        assert_eq!(get("params"), Some(Value::Array(vec![Value::from(25.0_f64)])));
    }

    #[test]
    fn request_round_trips() {
        let request = RequestEnvelope::new(
            CallId::new(42),
            "moveToPosition",
            (47.397742_f64, 8.545594_f64, 10.0_f64)
                .into_params()
                .unwrap(),
        );
        let bytes = encode_request(&request).unwrap();
        let decoded: RequestEnvelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn params_cover_representative_shapes() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct GeoPoint {
            lat: f64,
            lon: f64,
            alt: f32,
        }

        let waypoints = vec![
            GeoPoint { lat: 47.1, lon: 8.5, alt: 10.0 },
            GeoPoint { lat: 47.2, lon: 8.6, alt: 20.0 },
        ];
        let params = (true, 3.5_f64, "survey".to_string(), waypoints.clone())
            .into_params()
            .unwrap();
        assert_eq!(params.len(), 4);

        // Each param must survive the trip back into its typed form.
        assert_eq!(rmpv::ext::from_value::<bool>(params[0].clone()).unwrap(), true);
        assert_eq!(rmpv::ext::from_value::<f64>(params[1].clone()).unwrap(), 3.5);
        assert_eq!(
            rmpv::ext::from_value::<String>(params[2].clone()).unwrap(),
            "survey"
        );
        assert_eq!(
            rmpv::ext::from_value::<Vec<GeoPoint>>(params[3].clone()).unwrap(),
            waypoints
        );
    }

    #[test]
    fn empty_params_encode_as_empty_array() {
        let params = ().into_params().unwrap();
        assert!(params.is_empty());

        let request = RequestEnvelope::new(CallId::new(1), "arm", params);
        let bytes = encode_request(&request).unwrap();
        let decoded: RequestEnvelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.params, Vec::<Value>::new());
    }

    #[test]
    fn response_decodes_success() {
        let bytes = response_bytes(3, Value::from("ok"));
        let response = decode_response(&bytes).unwrap();
        assert_eq!(response.msg_id, CallId::new(3));
        assert_eq!(response.result, Some(Value::from("ok")));
        assert_eq!(response.error, None);
    }

    #[test]
    fn response_tolerates_unknown_fields() {
        let bytes = value_bytes(&Value::Map(vec![
            (Value::from("msgId"), Value::from(9u32)),
            (Value::from("result"), Value::from(1u32)),
            // A future server revision might attach timing data.
            (Value::from("latencyUs"), Value::from(1234u32)),
        ]));
        let response = decode_response(&bytes).unwrap();
        assert_eq!(response.msg_id, CallId::new(9));
        assert_eq!(response.result, Some(Value::from(1u32)));
    }

    #[test]
    fn response_with_only_id_decodes() {
        let bytes = value_bytes(&Value::Map(vec![(
            Value::from("msgId"),
            Value::from(11u32),
        )]));
        let response = decode_response(&bytes).unwrap();
        assert_eq!(response.result, None);
        assert_eq!(response.error, None);
    }

    #[test]
    fn error_text_reads_string_and_non_string_errors() {
        let response = ResponseEnvelope {
            msg_id: CallId::new(1),
            result: None,
            error: Some(Value::from("vehicle not armed")),
        };
        assert_eq!(response.error_text().unwrap(), "vehicle not armed");

        let response = ResponseEnvelope {
            msg_id: CallId::new(2),
            result: None,
            error: Some(Value::from(507u32)),
        };
        assert_eq!(response.error_text().unwrap(), "507");
    }

    #[test]
    fn frame_buffer_reassembles_split_frames() {
        let first = response_bytes(1, Value::from("a"));
        let second = response_bytes(2, Value::from("b"));
        let mut wire = first.clone();
        wire.extend_from_slice(&second);

        let mut frames = Vec::new();
        let mut buffer = FrameBuffer::new();
        // Worst case: one byte per read.
        for byte in wire {
            buffer.extend(&[byte]);
            while let Some(value) = buffer.next_frame().unwrap() {
                frames.push(value);
            }
        }

        assert_eq!(frames.len(), 2);
        let a = ResponseEnvelope::from_value(frames[0].clone()).unwrap();
        let b = ResponseEnvelope::from_value(frames[1].clone()).unwrap();
        assert_eq!(a.msg_id, CallId::new(1));
        assert_eq!(b.msg_id, CallId::new(2));
    }

    #[test]
    fn frame_buffer_yields_coalesced_frames_from_one_read() {
        let mut wire = response_bytes(1, Value::Nil);
        wire.extend_from_slice(&response_bytes(2, Value::Nil));
        wire.extend_from_slice(&response_bytes(3, Value::Nil));

        let mut buffer = FrameBuffer::new();
        buffer.extend(&wire);

        let mut ids = Vec::new();
        while let Some(value) = buffer.next_frame().unwrap() {
            ids.push(ResponseEnvelope::from_value(value).unwrap().msg_id.raw());
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn frame_buffer_rejects_corrupt_stream() {
        let mut buffer = FrameBuffer::new();
        // 0xc1 is the one marker MessagePack never assigns.
        buffer.extend(&[0xc1]);
        assert!(matches!(buffer.next_frame(), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn partial_frame_is_not_an_error() {
        let bytes = response_bytes(5, Value::from("pending"));
        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes[..bytes.len() - 1]);
        assert!(buffer.next_frame().unwrap().is_none());

        buffer.extend(&bytes[bytes.len() - 1..]);
        let value = buffer.next_frame().unwrap().unwrap();
        assert_eq!(
            ResponseEnvelope::from_value(value).unwrap().msg_id,
            CallId::new(5)
        );
    }
}
