//! JSON-RPC framing.
//!
//! The wire carries bare JSON objects back to back with no length prefix
//! or delimiter, so decoding leans on the incremental parser: feed it the
//! whole buffer, take one complete object, and advance past exactly the
//! bytes it consumed. An object split across reads surfaces as "not yet".

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::Error;

/// One JSON-RPC 1.0 message: request, response, or notification.
///
/// The `id` member is kept as raw JSON because peers may use numbers or
/// strings, and an echoed reply must carry the id back untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub id: serde_json::Value,
}

impl RpcMessage {
    pub fn request(id: u64, method: &str, params: serde_json::Value) -> RpcMessage {
        RpcMessage {
            method: Some(method.to_owned()),
            params: Some(params),
            result: None,
            error: None,
            id: serde_json::Value::from(id),
        }
    }

    pub fn notification(method: &str, params: serde_json::Value) -> RpcMessage {
        RpcMessage {
            method: Some(method.to_owned()),
            params: Some(params),
            result: None,
            error: None,
            id: serde_json::Value::Null,
        }
    }

    /// Reply to a peer request, echoing its id verbatim.
    pub fn response(id: serde_json::Value, result: serde_json::Value) -> RpcMessage {
        RpcMessage {
            method: None,
            params: None,
            result: Some(result),
            error: Some(serde_json::Value::Null),
            id,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_null()
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some() && !self.id.is_null()
    }

    /// Request id as the counter value we issued, when it is one of ours.
    pub fn id_u64(&self) -> Option<u64> {
        match &self.id {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Codec turning the byte stream into [`RpcMessage`] frames and back.
#[derive(Debug, Default)]
pub struct JsonCodec;

impl Decoder for JsonCodec {
    type Item = RpcMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RpcMessage>, Error> {
        let pad = src
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(src.len());
        src.advance(pad);
        if src.is_empty() {
            return Ok(None);
        }

        let decoded = {
            let mut stream =
                serde_json::Deserializer::from_slice(&src[..]).into_iter::<RpcMessage>();
            match stream.next() {
                Some(Ok(frame)) => Some((frame, stream.byte_offset())),
                Some(Err(e)) if e.is_eof() => None,
                Some(Err(e)) => return Err(e.into()),
                None => None,
            }
        };

        match decoded {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RpcMessage> for JsonCodec {
    type Error = Error;

    fn encode(&mut self, frame: RpcMessage, dst: &mut BytesMut) -> Result<(), Error> {
        let body = serde_json::to_vec(&frame)?;
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(text: &str) -> BytesMut {
        BytesMut::from(text.as_bytes())
    }

    #[test]
    fn concatenated_frames_decode_one_at_a_time() {
        let mut codec = JsonCodec;
        let mut src = buf(r#"{"method":"echo","params":[],"id":1}{"result":[],"error":null,"id":1}"#);

        let first = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(first.method.as_deref(), Some("echo"));
        assert!(first.is_request());

        let second = codec.decode(&mut src).unwrap().unwrap();
        assert!(second.method.is_none());
        assert_eq!(second.id_u64(), Some(1));

        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec;
        let whole = r#"{"method":"update3","params":["ctx"],"id":null}"#;
        let mut src = buf(&whole[..20]);

        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(whole[20..].as_bytes());

        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert!(frame.is_notification());
        assert_eq!(frame.method.as_deref(), Some("update3"));
    }

    #[test]
    fn interleaved_whitespace_is_skipped() {
        let mut codec = JsonCodec;
        let mut src = buf("  \n {\"result\":7,\"id\":2} \r\n ");
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.id_u64(), Some(2));
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn garbage_is_an_error() {
        let mut codec = JsonCodec;
        assert!(codec.decode(&mut buf("]bogus[")).is_err());
    }

    #[test]
    fn encode_appends_without_delimiters() {
        let mut codec = JsonCodec;
        let mut dst = BytesMut::new();
        codec
            .encode(RpcMessage::request(1, "echo", serde_json::json!([])), &mut dst)
            .unwrap();
        codec
            .encode(RpcMessage::request(2, "echo", serde_json::json!([])), &mut dst)
            .unwrap();
        let text = String::from_utf8(dst.to_vec()).unwrap();
        assert_eq!(text.matches("}{").count(), 1);
    }

    #[test]
    fn string_ids_round_trip() {
        let mut codec = JsonCodec;
        let mut src = buf(r#"{"result":true,"id":"41"}"#);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.id_u64(), Some(41));
    }
}
