//! MQTT protocol types shared by the broker core
//!
//! The wire codec lives outside this crate. These are the decoded forms the
//! codec boundary hands in (acks, publishes) and the packets the core hands
//! back out for encoding.

mod packet;

pub use packet::{Message, OutboundPacket};

use std::fmt;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (for subscription matching)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// Retain handling options (MQTT v5.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    /// Send retained messages at subscription time
    #[default]
    SendAtSubscribe = 0,
    /// Send retained messages only for new subscriptions
    SendAtSubscribeIfNew = 1,
    /// Do not send retained messages
    DoNotSend = 2,
}

impl RetainHandling {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RetainHandling::SendAtSubscribe),
            1 => Some(RetainHandling::SendAtSubscribeIfNew),
            2 => Some(RetainHandling::DoNotSend),
            _ => None,
        }
    }
}

/// Subscription options for MQTT v5.0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::SendAtSubscribe,
        }
    }
}

impl SubscriptionOptions {
    /// Options with the given QoS and everything else at its default
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }

    /// Decide the retain flag of a forwarded message.
    ///
    /// Without retain-as-published the flag is cleared on normal delivery.
    pub fn effective_retain(&self, published_retain: bool) -> bool {
        self.retain_as_published && published_retain
    }
}

/// Acknowledgement packet types that drive the QoS state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckType {
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
}

impl AckType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            4 => Some(AckType::PubAck),
            5 => Some(AckType::PubRec),
            6 => Some(AckType::PubRel),
            7 => Some(AckType::PubComp),
            _ => None,
        }
    }
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckType::PubAck => write!(f, "PUBACK"),
            AckType::PubRec => write!(f, "PUBREC"),
            AckType::PubRel => write!(f, "PUBREL"),
            AckType::PubComp => write!(f, "PUBCOMP"),
        }
    }
}
