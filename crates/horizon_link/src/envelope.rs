//! The versioned, transport-independent message record.
//!
//! Wire layout (big-endian, strings and payload length-prefixed with `u32`):
//!
//! ```text
//! u32     version
//! string  target        (wire name, e.g. "ALL_QUEUE")
//! string  origin_node
//! string  origin_plugin
//! string  action
//! u32     payload_length
//! [u8]    payload
//! ```
//!
//! Decoding refuses any version other than [`ENVELOPE_VERSION`] before looking
//! at the remaining fields.

use crate::error::LinkError;
use crate::target::Target;
use crate::wire::{WireReader, WireWrite};
use bytes::{BufMut, Bytes, BytesMut};

/// Envelope format understood by this build.
pub const ENVELOPE_VERSION: u32 = 1;

/// A message exchanged between nodes. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    target: Target,
    origin_node: String,
    origin_plugin: String,
    action: String,
    payload: Bytes,
}

impl Envelope {
    pub fn new(
        target: Target,
        origin_node: impl Into<String>,
        origin_plugin: impl Into<String>,
        action: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            target,
            origin_node: origin_node.into(),
            origin_plugin: origin_plugin.into(),
            action: action.into(),
            payload: payload.into(),
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Name of the node that produced the message.
    pub fn origin_node(&self) -> &str {
        &self.origin_node
    }

    /// Plugin that produced the message; handlers are looked up by it.
    pub fn origin_plugin(&self) -> &str {
        &self.origin_plugin
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Serializes the envelope. Pure function of the fields.
    pub fn encode(&self) -> Bytes {
        let target = self.target.as_str();
        let mut buf = BytesMut::with_capacity(
            4 + 5 * 4
                + target.len()
                + self.origin_node.len()
                + self.origin_plugin.len()
                + self.action.len()
                + self.payload.len(),
        );
        buf.put_u32(ENVELOPE_VERSION);
        buf.put_wire_str(target);
        buf.put_wire_str(&self.origin_node);
        buf.put_wire_str(&self.origin_plugin);
        buf.put_wire_str(&self.action);
        buf.put_wire_bytes(&self.payload);
        buf.freeze()
    }

    /// Parses an envelope, refusing foreign versions and damaged buffers.
    pub fn decode(data: &[u8]) -> Result<Self, LinkError> {
        let mut reader = WireReader::new(data, "envelope");
        let version = reader.u32("version")?;
        if version != ENVELOPE_VERSION {
            return Err(LinkError::ProtocolVersionMismatch {
                received: version,
                supported: ENVELOPE_VERSION,
            });
        }

        let target = reader.string("target")?.parse::<Target>()?;
        let origin_node = reader.string("origin_node")?;
        let origin_plugin = reader.string("origin_plugin")?;
        let action = reader.string("action")?;
        let payload = reader.bytes("payload")?;
        reader.finish()?;

        Ok(Self {
            target,
            origin_node,
            origin_plugin,
            action,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(target: Target) -> Envelope {
        Envelope::new(target, "survival-1", "pluginX", "ping", Bytes::from_static(b"hello"))
    }

    #[test]
    fn decode_restores_every_field() {
        let cases = [
            sample(Target::AllQueue),
            Envelope::new(Target::Current, "", "", "", Bytes::new()),
            Envelope::new(
                Target::OtherProxies,
                "proxy:edge-ü",
                "Chat",
                "broadcast",
                Bytes::from(vec![0u8; 4096]),
            ),
        ];
        for envelope in cases {
            let decoded = Envelope::decode(&envelope.encode()).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn layout_starts_with_version_then_target() {
        let bytes = sample(Target::Server).encode();
        assert_eq!(&bytes[..4], &ENVELOPE_VERSION.to_be_bytes());
        assert_eq!(&bytes[4..8], &6u32.to_be_bytes());
        assert_eq!(&bytes[8..14], b"SERVER");
    }

    #[test]
    fn foreign_versions_are_refused() {
        for version in [0u32, 2, 99, u32::MAX] {
            let mut bytes = sample(Target::AllQueue).encode().to_vec();
            bytes[..4].copy_from_slice(&version.to_be_bytes());
            assert_eq!(
                Envelope::decode(&bytes),
                Err(LinkError::ProtocolVersionMismatch {
                    received: version,
                    supported: ENVELOPE_VERSION,
                })
            );
        }
    }

    #[test]
    fn version_is_checked_before_the_body() {
        // A future version may change everything after the tag.
        let mut bytes = 5u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"garbage");
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(LinkError::ProtocolVersionMismatch { received: 5, .. })
        ));
    }

    #[test]
    fn truncated_buffers_are_malformed() {
        let bytes = sample(Target::AllQueue).encode();
        for cut in [0, 3, 10, bytes.len() - 1] {
            assert!(matches!(
                Envelope::decode(&bytes[..cut]),
                Err(LinkError::MalformedEnvelope(_))
            ));
        }
    }

    #[test]
    fn unknown_target_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(ENVELOPE_VERSION);
        buf.put_wire_str("EVERYWHERE");
        buf.put_wire_str("n");
        buf.put_wire_str("p");
        buf.put_wire_str("a");
        buf.put_wire_bytes(b"");
        assert!(matches!(
            Envelope::decode(&buf),
            Err(LinkError::MalformedEnvelope(msg)) if msg.contains("EVERYWHERE")
        ));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut bytes = sample(Target::AllQueue).encode().to_vec();
        bytes.push(0);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(LinkError::MalformedEnvelope(_))
        ));
    }
}
