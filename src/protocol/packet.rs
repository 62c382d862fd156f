//! Application messages and outbound packets
//!
//! `OutboundPacket` is what the core hands to the transport for encoding.
//! The transport never sees the QoS state machine, only its output.

use std::sync::Arc;

use bytes::Bytes;

use super::{AckType, QoS};

/// An application message travelling through the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name (never contains wildcards)
    pub topic: Arc<str>,
    /// Payload
    pub payload: Bytes,
    /// QoS the message is delivered at
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    /// Copy of this message downgraded for a particular recipient
    pub fn for_recipient(&self, qos: QoS, retain: bool) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos,
            retain,
        }
    }
}

/// Packet sent from the broker to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPacket {
    Publish {
        /// Present for QoS 1/2
        packet_id: Option<u16>,
        /// Re-delivery of a previously sent packet identifier
        dup: bool,
        message: Message,
    },
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
}

impl OutboundPacket {
    /// Build the acknowledgement packet of the given type
    pub fn ack(ack: AckType, packet_id: u16) -> Self {
        match ack {
            AckType::PubAck => OutboundPacket::PubAck(packet_id),
            AckType::PubRec => OutboundPacket::PubRec(packet_id),
            AckType::PubRel => OutboundPacket::PubRel(packet_id),
            AckType::PubComp => OutboundPacket::PubComp(packet_id),
        }
    }

    /// Packet identifier, if the packet carries one
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            OutboundPacket::Publish { packet_id, .. } => *packet_id,
            OutboundPacket::PubAck(id)
            | OutboundPacket::PubRec(id)
            | OutboundPacket::PubRel(id)
            | OutboundPacket::PubComp(id) => Some(*id),
        }
    }
}
