//! Outer frame used by the pub/sub transports.
//!
//! Every peer on a broker topic sees every frame, so the frame carries what a
//! receiver needs to filter before touching the envelope: the sender's group
//! and, for addressed targets, the name the message is meant for.

use crate::error::LinkError;
use crate::wire::{WireReader, WireWrite};
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingFrame {
    /// Sender's isolation group, empty to reach every group.
    pub group: String,
    /// Node or session the frame is addressed to, empty for broadcasts.
    pub target_hint: String,
    /// The encoded [`Envelope`](crate::Envelope).
    pub envelope: Bytes,
}

impl RoutingFrame {
    pub fn new(group: impl Into<String>, target_hint: impl Into<String>, envelope: Bytes) -> Self {
        Self {
            group: group.into(),
            target_hint: target_hint.into(),
            envelope,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            12 + self.group.len() + self.target_hint.len() + self.envelope.len(),
        );
        buf.put_wire_str(&self.group);
        buf.put_wire_str(&self.target_hint);
        buf.put_wire_bytes(&self.envelope);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, LinkError> {
        let mut reader = WireReader::new(data, "routing frame");
        let group = reader.string("group")?;
        let target_hint = reader.string("target_hint")?;
        let envelope = reader.bytes("envelope")?;
        reader.finish()?;
        Ok(Self {
            group,
            target_hint,
            envelope,
        })
    }
}
