//! Per-client QoS delivery state
//!
//! `QosTracker` owns packet identifier allocation, the in-flight window and
//! the QoS 1/2 handshake states for one client. It is never shared: the
//! session task in [`actor`] is its single writer.

pub mod actor;

pub use actor::{DeliveryOutcome, SessionHandle, SessionSettings};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::persistence::PersistenceError;
use crate::protocol::{AckType, Message, OutboundPacket, QoS};

/// Errors raised by the QoS state machine and the session task
#[derive(Debug)]
pub enum SessionError {
    /// In-flight window full; stop dequeuing until an ack frees a slot
    WindowExhausted { max: usize },
    /// Ack for a packet identifier with no matching in-flight state
    UnknownPacketId { ack: AckType, packet_id: u16 },
    /// Too many inbound QoS 2 messages awaiting PUBREL
    AwaitingRelExhausted { max: usize },
    /// Session task has stopped
    Closed,
    /// Redelivery store failure
    Persistence(PersistenceError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WindowExhausted { max } => write!(f, "in-flight window exhausted ({})", max),
            Self::UnknownPacketId { ack, packet_id } => {
                write!(f, "{} for unknown packet id {}", ack, packet_id)
            }
            Self::AwaitingRelExhausted { max } => {
                write!(f, "too many messages awaiting PUBREL ({})", max)
            }
            Self::Closed => write!(f, "session closed"),
            Self::Persistence(e) => write!(f, "persistence error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for SessionError {
    fn from(err: PersistenceError) -> Self {
        Self::Persistence(err)
    }
}

/// Sender-side state of an outgoing QoS 1/2 message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// QoS 1 PUBLISH sent, waiting for PUBACK
    WaitingPubAck,
    /// QoS 2 PUBLISH sent, waiting for PUBREC
    WaitingPubRec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    WaitingPubComp,
}

/// Inflight outgoing message
#[derive(Debug, Clone)]
pub struct InflightMessage {
    /// Packet identifier
    pub packet_id: u16,
    /// Redelivery store serial
    pub serial: u64,
    /// The message as delivered to this client
    pub message: Message,
    pub state: OutgoingState,
    /// Timestamp of the last (re)send
    pub sent_at: Instant,
    /// Number of retransmission attempts
    pub retry_count: u32,
}

impl InflightMessage {
    /// Packet to resend for the current state
    fn resend_packet(&self) -> OutboundPacket {
        match self.state {
            OutgoingState::WaitingPubComp => OutboundPacket::PubRel(self.packet_id),
            _ => OutboundPacket::Publish {
                packet_id: Some(self.packet_id),
                dup: true,
                message: self.message.clone(),
            },
        }
    }
}

/// Result of feeding an ack into the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResult {
    /// PUBACK or PUBCOMP: the outgoing id is free again
    Completed { serial: u64 },
    /// PUBREC: PUBREL must be sent and the record flipped to PUBREL-pending
    PubRelRequired { serial: u64 },
    /// PUBREL from a publisher: the stored message can be routed and PUBCOMP sent
    Released { message: Message },
}

/// Outcome of an inbound QoS 2 PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundQos2 {
    /// First time this id is seen: PUBREC sent, message held until PUBREL
    New,
    /// Id already awaiting PUBREL: PUBREC again, do not route twice
    Duplicate,
}

/// QoS state machine for one client
#[derive(Debug)]
pub struct QosTracker {
    next_packet_id: u16,
    max_inflight: usize,
    max_awaiting_rel: usize,
    outgoing: HashMap<u16, InflightMessage>,
    /// Inbound QoS 2 messages in PUBREC_SENT, keyed by the publisher's id
    incoming: HashMap<u16, Message>,
}

impl QosTracker {
    pub fn new(max_inflight: usize, max_awaiting_rel: usize) -> Self {
        Self {
            next_packet_id: 1,
            max_inflight: max_inflight.clamp(1, u16::MAX as usize),
            max_awaiting_rel,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    pub fn inflight_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn awaiting_rel_len(&self) -> usize {
        self.incoming.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.outgoing.len() < self.max_inflight
    }

    pub fn inflight(&self, packet_id: u16) -> Option<&InflightMessage> {
        self.outgoing.get(&packet_id)
    }

    /// Next unused packet identifier in [1, 65535].
    ///
    /// Fails fast when the window is full rather than waiting for an ack.
    pub fn allocate_packet_id(&mut self) -> Result<u16, SessionError> {
        if !self.has_capacity() {
            return Err(SessionError::WindowExhausted {
                max: self.max_inflight,
            });
        }

        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            // Window < 65535, so a free id always exists
            if !self.outgoing.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Record a PUBLISH just handed to the transport under `packet_id`
    pub fn track_outgoing(&mut self, packet_id: u16, serial: u64, message: Message) {
        let state = match message.qos {
            QoS::ExactlyOnce => OutgoingState::WaitingPubRec,
            _ => OutgoingState::WaitingPubAck,
        };
        self.outgoing.insert(
            packet_id,
            InflightMessage {
                packet_id,
                serial,
                message,
                state,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
    }

    /// Re-occupy an id restored from the redelivery store.
    ///
    /// Replay may briefly exceed the window; the backlog must be re-offered
    /// with the ids the client already knows.
    pub fn restore_outgoing(
        &mut self,
        packet_id: u16,
        serial: u64,
        message: Message,
        state: OutgoingState,
    ) {
        self.outgoing.insert(
            packet_id,
            InflightMessage {
                packet_id,
                serial,
                message,
                state,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
        // Keep allocation monotonic past restored ids
        if packet_id >= self.next_packet_id {
            self.next_packet_id = packet_id.wrapping_add(1).max(1);
        }
    }

    /// Advance the state machine for `packet_id`
    pub fn on_ack(&mut self, ack: AckType, packet_id: u16) -> Result<AckResult, SessionError> {
        let unknown = SessionError::UnknownPacketId { ack, packet_id };
        match ack {
            AckType::PubAck => match self.outgoing.get(&packet_id) {
                Some(m) if m.state == OutgoingState::WaitingPubAck => {
                    let serial = m.serial;
                    self.outgoing.remove(&packet_id);
                    Ok(AckResult::Completed { serial })
                }
                _ => Err(unknown),
            },
            AckType::PubRec => match self.outgoing.get_mut(&packet_id) {
                // A repeated PUBREC just gets PUBREL again
                Some(m)
                    if m.state == OutgoingState::WaitingPubRec
                        || m.state == OutgoingState::WaitingPubComp =>
                {
                    m.state = OutgoingState::WaitingPubComp;
                    m.sent_at = Instant::now();
                    Ok(AckResult::PubRelRequired { serial: m.serial })
                }
                _ => Err(unknown),
            },
            AckType::PubComp => match self.outgoing.get(&packet_id) {
                Some(m) if m.state == OutgoingState::WaitingPubComp => {
                    let serial = m.serial;
                    self.outgoing.remove(&packet_id);
                    Ok(AckResult::Completed { serial })
                }
                _ => Err(unknown),
            },
            // PUBCOMP is written as the entry leaves; the id is free from here on
            AckType::PubRel => match self.incoming.remove(&packet_id) {
                Some(message) => Ok(AckResult::Released { message }),
                None => Err(unknown),
            },
        }
    }

    /// Receiver side of an inbound QoS 2 PUBLISH
    pub fn on_inbound_qos2(
        &mut self,
        packet_id: u16,
        message: Message,
    ) -> Result<InboundQos2, SessionError> {
        if self.incoming.contains_key(&packet_id) {
            return Ok(InboundQos2::Duplicate);
        }
        if self.max_awaiting_rel > 0 && self.incoming.len() >= self.max_awaiting_rel {
            return Err(SessionError::AwaitingRelExhausted {
                max: self.max_awaiting_rel,
            });
        }
        self.incoming.insert(packet_id, message);
        Ok(InboundQos2::New)
    }

    /// Re-enter PUBREC_SENT for a message held in storage across a restart.
    /// Not subject to `max_awaiting_rel`: the publisher already has its PUBREC.
    pub fn restore_incoming(&mut self, packet_id: u16, message: Message) {
        self.incoming.insert(packet_id, message);
    }

    /// Undo `on_inbound_qos2` when the message could not be stored
    pub fn discard_incoming(&mut self, packet_id: u16) {
        self.incoming.remove(&packet_id);
    }

    /// Packets whose last send is older than `interval`; their timers restart
    pub fn due_for_retry(&mut self, interval: Duration) -> Vec<OutboundPacket> {
        let now = Instant::now();
        let mut due: Vec<&mut InflightMessage> = self
            .outgoing
            .values_mut()
            .filter(|m| now.duration_since(m.sent_at) >= interval)
            .collect();
        due.sort_by_key(|m| m.serial);

        due.into_iter()
            .map(|m| {
                m.sent_at = now;
                m.retry_count += 1;
                m.resend_packet()
            })
            .collect()
    }

    /// Drop all outgoing state (connection lost; the store keeps the backlog)
    pub fn clear_outgoing(&mut self) {
        self.outgoing.clear();
    }

    /// Drop everything (clean start)
    pub fn clear(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
        self.next_packet_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(qos: QoS) -> Message {
        Message::new("t", "p", qos, false)
    }

    #[test]
    fn test_allocate_monotonic() {
        let mut tracker = QosTracker::new(10, 10);
        assert_eq!(tracker.allocate_packet_id().unwrap(), 1);
        assert_eq!(tracker.allocate_packet_id().unwrap(), 2);
        assert_eq!(tracker.allocate_packet_id().unwrap(), 3);
    }

    #[test]
    fn test_allocate_wraps_and_skips_zero_and_occupied() {
        let mut tracker = QosTracker::new(10, 10);
        tracker.track_outgoing(1, 1, msg(QoS::AtLeastOnce));
        tracker.next_packet_id = u16::MAX;

        assert_eq!(tracker.allocate_packet_id().unwrap(), u16::MAX);
        // 0 is never handed out and 1 is still in flight
        assert_eq!(tracker.allocate_packet_id().unwrap(), 2);
    }

    #[test]
    fn test_window_exhausted() {
        let mut tracker = QosTracker::new(2, 10);
        for serial in 0..2 {
            let id = tracker.allocate_packet_id().unwrap();
            tracker.track_outgoing(id, serial, msg(QoS::AtLeastOnce));
        }
        assert!(matches!(
            tracker.allocate_packet_id(),
            Err(SessionError::WindowExhausted { max: 2 })
        ));

        tracker.on_ack(AckType::PubAck, 1).unwrap();
        assert_eq!(tracker.allocate_packet_id().unwrap(), 3);
    }

    #[test]
    fn test_qos1_flow() {
        let mut tracker = QosTracker::new(10, 10);
        let id = tracker.allocate_packet_id().unwrap();
        tracker.track_outgoing(id, 42, msg(QoS::AtLeastOnce));

        assert_eq!(
            tracker.on_ack(AckType::PubAck, id).unwrap(),
            AckResult::Completed { serial: 42 }
        );
        assert!(matches!(
            tracker.on_ack(AckType::PubAck, id),
            Err(SessionError::UnknownPacketId { .. })
        ));
    }

    #[test]
    fn test_qos2_sender_flow() {
        let mut tracker = QosTracker::new(10, 10);
        let id = tracker.allocate_packet_id().unwrap();
        tracker.track_outgoing(id, 7, msg(QoS::ExactlyOnce));

        // PUBCOMP before PUBREC is out of order
        assert!(tracker.on_ack(AckType::PubComp, id).is_err());
        assert!(tracker.on_ack(AckType::PubAck, id).is_err());

        assert_eq!(
            tracker.on_ack(AckType::PubRec, id).unwrap(),
            AckResult::PubRelRequired { serial: 7 }
        );
        assert_eq!(tracker.inflight(id).unwrap().state, OutgoingState::WaitingPubComp);
        // Id stays occupied until PUBCOMP
        assert_eq!(tracker.inflight_len(), 1);

        assert_eq!(
            tracker.on_ack(AckType::PubComp, id).unwrap(),
            AckResult::Completed { serial: 7 }
        );
        assert_eq!(tracker.inflight_len(), 0);
    }

    #[test]
    fn test_qos2_receiver_dedup() {
        let mut tracker = QosTracker::new(10, 10);
        assert_eq!(
            tracker.on_inbound_qos2(5, msg(QoS::ExactlyOnce)).unwrap(),
            InboundQos2::New
        );
        assert_eq!(
            tracker.on_inbound_qos2(5, msg(QoS::ExactlyOnce)).unwrap(),
            InboundQos2::Duplicate
        );

        assert!(matches!(
            tracker.on_ack(AckType::PubRel, 5).unwrap(),
            AckResult::Released { .. }
        ));
        // Reusable once PUBCOMP is sent
        assert_eq!(
            tracker.on_inbound_qos2(5, msg(QoS::ExactlyOnce)).unwrap(),
            InboundQos2::New
        );
    }

    #[test]
    fn test_awaiting_rel_bounded() {
        let mut tracker = QosTracker::new(10, 1);
        tracker.on_inbound_qos2(1, msg(QoS::ExactlyOnce)).unwrap();
        assert!(matches!(
            tracker.on_inbound_qos2(2, msg(QoS::ExactlyOnce)),
            Err(SessionError::AwaitingRelExhausted { max: 1 })
        ));
    }

    #[test]
    fn test_restored_incoming_dedups_and_releases() {
        let mut tracker = QosTracker::new(10, 1);
        tracker.restore_incoming(3, msg(QoS::ExactlyOnce));
        tracker.restore_incoming(4, msg(QoS::ExactlyOnce));
        assert_eq!(tracker.awaiting_rel_len(), 2);

        assert_eq!(
            tracker.on_inbound_qos2(3, msg(QoS::ExactlyOnce)).unwrap(),
            InboundQos2::Duplicate
        );
        assert!(matches!(
            tracker.on_ack(AckType::PubRel, 4).unwrap(),
            AckResult::Released { .. }
        ));
    }

    #[test]
    fn test_retry_resends_in_state() {
        let mut tracker = QosTracker::new(10, 10);
        tracker.track_outgoing(1, 1, msg(QoS::AtLeastOnce));
        tracker.track_outgoing(2, 2, msg(QoS::ExactlyOnce));
        tracker.on_ack(AckType::PubRec, 2).unwrap();

        let due = tracker.due_for_retry(Duration::ZERO);
        assert_eq!(due.len(), 2);
        assert!(matches!(
            due[0],
            OutboundPacket::Publish {
                packet_id: Some(1),
                dup: true,
                ..
            }
        ));
        assert_eq!(due[1], OutboundPacket::PubRel(2));
        assert_eq!(tracker.inflight(1).unwrap().retry_count, 1);

        assert!(tracker.due_for_retry(Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_restore_keeps_allocation_ahead() {
        let mut tracker = QosTracker::new(10, 10);
        tracker.restore_outgoing(9, 1, msg(QoS::AtLeastOnce), OutgoingState::WaitingPubAck);
        assert_eq!(tracker.allocate_packet_id().unwrap(), 10);
    }
}
