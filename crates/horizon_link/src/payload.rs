//! Correlation prefix carried inside envelope payloads.
//!
//! Payloads produced by the bus start with the request id (`u64`, big-endian)
//! followed by the handler-defined body. An id of [`NO_REPLY`] marks a
//! fire-and-forget message.

use crate::error::LinkError;
use crate::wire::WireReader;
use bytes::{BufMut, Bytes, BytesMut};

/// Request id used by messages that expect no reply.
pub const NO_REPLY: u64 = 0;

/// Terminal response to a request; body is a single boolean byte.
pub const RESPONSE_ACTION: &str = "link:response";

/// Interim stream line for a request; body is UTF-8 text.
pub const STREAM_ACTION: &str = "link:stream";

/// Whether an action is answered by the correlation layer rather than a handler.
pub fn is_reply_action(action: &str) -> bool {
    action == RESPONSE_ACTION || action == STREAM_ACTION
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatedPayload {
    pub request_id: u64,
    pub body: Bytes,
}

impl CorrelatedPayload {
    pub fn new(request_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            body: body.into(),
        }
    }

    pub fn response(request_id: u64, value: bool) -> Self {
        Self::new(request_id, Bytes::from(vec![u8::from(value)]))
    }

    pub fn stream_line(request_id: u64, line: &str) -> Self {
        Self::new(request_id, Bytes::copy_from_slice(line.as_bytes()))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.body.len());
        buf.put_u64(self.request_id);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, LinkError> {
        let mut reader = WireReader::new(data, "payload");
        let request_id = reader.u64("request_id")?;
        Ok(Self {
            request_id,
            body: reader.rest(),
        })
    }

    /// Reads the body of a [`RESPONSE_ACTION`] message.
    pub fn response_value(&self) -> Result<bool, LinkError> {
        match self.body.as_ref() {
            [0] => Ok(false),
            [1] => Ok(true),
            other => Err(LinkError::MalformedEnvelope(format!(
                "response body must be one boolean byte, got {} bytes",
                other.len()
            ))),
        }
    }

    /// Reads the body of a [`STREAM_ACTION`] message.
    pub fn stream_text(&self) -> Result<&str, LinkError> {
        std::str::from_utf8(&self.body)
            .map_err(|_| LinkError::MalformedEnvelope("stream line is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_prefix_is_big_endian() {
        let bytes = CorrelatedPayload::new(0x0102, Bytes::from_static(b"hi")).encode();
        assert_eq!(&bytes[..], &[0, 0, 0, 0, 0, 0, 1, 2, b'h', b'i']);
        let decoded = CorrelatedPayload::decode(&bytes).unwrap();
        assert_eq!(decoded.request_id, 0x0102);
        assert_eq!(&decoded.body[..], b"hi");
    }

    #[test]
    fn response_body_is_strict() {
        assert!(CorrelatedPayload::response(9, true).response_value().unwrap());
        assert!(!CorrelatedPayload::response(9, false).response_value().unwrap());
        assert!(CorrelatedPayload::new(9, Bytes::from_static(b"yes"))
            .response_value()
            .is_err());
    }

    #[test]
    fn short_payload_is_malformed() {
        assert!(CorrelatedPayload::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn reply_actions_are_reserved() {
        assert!(is_reply_action(RESPONSE_ACTION));
        assert!(is_reply_action(STREAM_ACTION));
        assert!(!is_reply_action("ping"));
    }
}
