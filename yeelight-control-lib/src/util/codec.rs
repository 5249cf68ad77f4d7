//! Framing for the line-delimited JSON control protocol.
//!
//! Every frame is one compact JSON object followed by `\r\n`. Requests carry an
//! `id`, a `method` and a `params` array. Responses echo the `id` and carry
//! either a `result` array or an `error` object. Frames without an `id` are
//! notifications pushed by the device on state changes.
//!
//! Decoding is permissive: a frame that fails to parse is dropped and the
//! remaining frames are still processed, because devices occasionally emit
//! truncated or malformed pushes.

use bytes::{Buf, BytesMut};
use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Terminator appended to every frame.
pub const FRAME_TERMINATOR: &[u8] = b"\r\n";

/// A primitive request parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Str(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Str(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

impl From<u32> for Param {
    fn from(value: u32) -> Self {
        Param::Int(i64::from(value))
    }
}

impl From<u8> for Param {
    fn from(value: u8) -> Self {
        Param::Int(i64::from(value))
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Param::Bool(value)
    }
}

/// A method call as it goes on the wire. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Vec<Param>,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Vec<Param>) -> Self {
        Request {
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Serializes the request into one terminated frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)?;
        frame.extend_from_slice(FRAME_TERMINATOR);
        Ok(frame)
    }
}

/// Error object of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A response correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub outcome: std::result::Result<Vec<Value>, DeviceError>,
}

/// An unsolicited state push, e.g. `{"method":"props","params":{"power":"on"}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: Option<String>,
    pub params: Value,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Response),
    Notification(Notification),
    /// Well-formed JSON that is neither a response nor a notification.
    Unrecognized(Value),
}

impl Message {
    /// Parses one frame. Returns `None` when the frame is not valid JSON.
    pub fn decode(frame: &str) -> Option<Message> {
        match serde_json::from_str::<Value>(frame) {
            Ok(value) => Some(Self::classify(value)),
            Err(e) => {
                trace!("Skipping malformed frame {:?}: {}", frame, e);
                None
            }
        }
    }

    fn classify(value: Value) -> Message {
        let object = match value {
            Value::Object(object) => object,
            other => return Message::Unrecognized(other),
        };
        let id = object.get("id").map(Value::as_u64);
        match id {
            None => Message::Notification(Notification {
                method: object
                    .get("method")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                params: object.get("params").cloned().unwrap_or(Value::Null),
            }),
            Some(Some(id)) => Self::classify_response(id, object),
            Some(None) => Message::Unrecognized(Value::Object(object)),
        }
    }

    fn classify_response(id: u64, mut object: Map<String, Value>) -> Message {
        if let Some(Value::Array(result)) = object.get_mut("result") {
            let result = std::mem::take(result);
            return Message::Response(Response {
                id,
                outcome: Ok(result),
            });
        }
        if let Some(error) = object.get("error") {
            if let Ok(error) = serde_json::from_value::<DeviceError>(error.clone()) {
                return Message::Response(Response {
                    id,
                    outcome: Err(error),
                });
            }
        }
        Message::Unrecognized(Value::Object(object))
    }
}

/// Reassembles frames from a byte stream.
///
/// Bytes are appended with [`FrameDecoder::feed`]; every complete terminated
/// segment is returned and the trailing partial segment stays buffered until
/// the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns all frames completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(end) = find_terminator(&self.buffer) {
            let segment = self.buffer.split_to(end);
            self.buffer.advance(FRAME_TERMINATOR.len());
            if segment.is_empty() {
                continue;
            }
            frames.push(String::from_utf8_lossy(&segment).into_owned());
        }
        frames
    }

    /// Bytes received but not yet terminated.
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(FRAME_TERMINATOR.len())
        .position(|window| window == FRAME_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_is_compact_and_terminated() {
        let request = Request::new(
            1,
            "set_power",
            vec!["on".into(), "smooth".into(), 300i64.into()],
        );
        let frame = request.encode().unwrap();
        assert_eq!(
            frame,
            b"{\"id\":1,\"method\":\"set_power\",\"params\":[\"on\",\"smooth\",300]}\r\n"
        );
    }

    #[test]
    fn test_feed_keeps_partial_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"{\"id\":1,\"result\":[\"ok\"]}\r\n{\"id\":2,");
        assert_eq!(frames, vec!["{\"id\":1,\"result\":[\"ok\"]}"]);
        assert_eq!(decoder.remainder(), b"{\"id\":2,");

        let frames = decoder.feed(b"\"result\":[]}\r\n");
        assert_eq!(frames, vec!["{\"id\":2,\"result\":[]}"]);
        assert!(decoder.remainder().is_empty());
    }

    #[test]
    fn test_feed_terminator_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"{\"id\":1,\"result\":[]}\r").is_empty());
        assert_eq!(decoder.feed(b"\n").len(), 1);
    }

    #[test]
    fn test_reassembly_is_independent_of_chunk_boundaries() {
        let messages: Vec<Vec<u8>> = (1..=5)
            .map(|id| {
                Request::new(id, "get_prop", vec!["power".into(), "bright".into()])
                    .encode()
                    .unwrap()
            })
            .collect();
        let stream: Vec<u8> = messages.concat();

        for chunk_size in 1..=stream.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                frames.extend(decoder.feed(chunk));
            }
            assert_eq!(frames.len(), messages.len(), "chunk size {}", chunk_size);
            assert!(decoder.remainder().is_empty());
            for (id, frame) in (1..).zip(frames.iter()) {
                let decoded: Request = serde_json::from_str(frame).unwrap();
                assert_eq!(decoded.id, id);
            }
        }
    }

    #[test]
    fn test_empty_segments_are_ignored() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"\r\n\r\n{\"method\":\"props\",\"params\":{}}\r\n\r\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_malformed_frame_does_not_abort_decoding() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"{\"id\":1,\"res\r\n{\"id\":1,\"result\":[\"ok\"]}\r\n");
        let messages: Vec<Message> = frames.iter().filter_map(|f| Message::decode(f)).collect();
        assert_eq!(
            messages,
            vec![Message::Response(Response {
                id: 1,
                outcome: Ok(vec![json!("ok")]),
            })]
        );
    }

    #[test]
    fn test_classify_messages() {
        let notification = Message::decode(r#"{"method":"props","params":{"power":"off"}}"#);
        assert_eq!(
            notification,
            Some(Message::Notification(Notification {
                method: Some("props".to_string()),
                params: json!({"power": "off"}),
            }))
        );

        let error = Message::decode(r#"{"id":3,"error":{"code":-1,"message":"unsupported method"}}"#);
        assert_eq!(
            error,
            Some(Message::Response(Response {
                id: 3,
                outcome: Err(DeviceError {
                    code: -1,
                    message: "unsupported method".to_string(),
                }),
            }))
        );

        assert!(matches!(
            Message::decode(r#"{"id":4}"#),
            Some(Message::Unrecognized(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"id":"x","result":[]}"#),
            Some(Message::Unrecognized(_))
        ));
        assert!(matches!(
            Message::decode("[1,2,3]"),
            Some(Message::Unrecognized(_))
        ));
    }
}
