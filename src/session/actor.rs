//! Session task
//!
//! One task per client owns that client's `QosTracker`, pending queue and
//! redelivery writes. Inbound QoS 2 messages held for PUBREL are stored too
//! and reloaded when the task starts, so a restart never loses a message the
//! publisher already has a PUBREC for. Everything else talks to it through a `SessionHandle`;
//! commands are handled strictly one at a time, which is what keeps packet id
//! allocation and ack processing serialized without a lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use super::{AckResult, InboundQos2, OutgoingState, QosTracker, SessionError};
use crate::persistence::{PersistedPacketType, RedeliveryStore};
use crate::protocol::{AckType, Message, OutboundPacket, QoS};

/// Limits applied to every session task
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// In-flight window (QoS 1/2 messages awaiting ack)
    pub max_inflight: usize,
    /// Messages queued behind a full window before new ones are dropped
    pub max_queued_messages: usize,
    /// Inbound QoS 2 messages awaiting PUBREL
    pub max_awaiting_rel: usize,
    /// Stored QoS 1/2 backlog per client (0 = unlimited). Offline, the oldest
    /// message makes room; attached, new messages are dropped.
    pub max_stored_messages: usize,
    /// Resend interval for unacknowledged packets (zero disables retry)
    pub retry_interval: Duration,
    /// Command mailbox size
    pub command_channel_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            max_queued_messages: 1000,
            max_awaiting_rel: 100,
            max_stored_messages: 10_000,
            retry_interval: Duration::from_secs(30),
            command_channel_capacity: 1024,
        }
    }
}

/// What happened to one message handed to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// QoS 1/2 PUBLISH written to the transport under this id
    Sent { packet_id: u16 },
    /// QoS 0 PUBLISH written to the transport
    Delivered,
    /// Stored and queued behind a full in-flight window
    Queued,
    /// Client offline; stored for replay on resume
    Stored,
    /// Not delivered (offline QoS 0, queue full, or backlog full)
    Dropped,
    /// Session gone or storage failed
    Failed,
}

impl DeliveryOutcome {
    /// Whether the message reached the transport or the durable backlog
    pub fn is_accepted(&self) -> bool {
        !matches!(self, DeliveryOutcome::Dropped | DeliveryOutcome::Failed)
    }
}

enum Command {
    Deliver {
        message: Message,
        reply: oneshot::Sender<DeliveryOutcome>,
    },
    Ack {
        ack: AckType,
        packet_id: u16,
        reply: oneshot::Sender<Result<Option<Message>, SessionError>>,
    },
    InboundQos2 {
        packet_id: u16,
        message: Message,
        reply: oneshot::Sender<Result<InboundQos2, SessionError>>,
    },
    Send {
        packet: OutboundPacket,
    },
    Attach {
        writer: mpsc::Sender<OutboundPacket>,
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    Detach {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        clear: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Cloneable handle to a session task
#[derive(Clone)]
pub struct SessionHandle {
    client_id: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Spawn the task for `client_id`. It starts detached.
    pub fn spawn(
        client_id: Arc<str>,
        settings: SessionSettings,
        store: Arc<RedeliveryStore>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.command_channel_capacity.max(1));
        let actor = SessionActor {
            client_id: client_id.clone(),
            tracker: QosTracker::new(settings.max_inflight, settings.max_awaiting_rel),
            settings,
            store,
            writer: None,
            pending: VecDeque::new(),
            stored: VecDeque::new(),
            rx,
        };
        tokio::spawn(actor.run());
        Self { client_id, tx }
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Hand a message (already downgraded for this client) to the session
    pub async fn deliver(&self, message: Message) -> DeliveryOutcome {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Deliver { message, reply }, rx)
            .await
            .unwrap_or(DeliveryOutcome::Failed)
    }

    /// Feed an ack from the client. For PUBREL the released inbound message
    /// is returned so it can be routed.
    pub async fn on_ack(&self, ack: AckType, packet_id: u16) -> Result<Option<Message>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Ack {
                ack,
                packet_id,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Inbound QoS 2 PUBLISH from this client; PUBREC is written either way
    pub async fn inbound_qos2(
        &self,
        packet_id: u16,
        message: Message,
    ) -> Result<InboundQos2, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::InboundQos2 {
                packet_id,
                message,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Write a packet if the client is attached
    pub async fn send(&self, packet: OutboundPacket) -> Result<(), SessionError> {
        self.tx
            .send(Command::Send { packet })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Connect a transport writer. The stored backlog is replayed before any
    /// command queued after this one is processed. Returns the replay size.
    pub async fn attach(&self, writer: mpsc::Sender<OutboundPacket>) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Attach { writer, reply }, rx).await?
    }

    /// Connection lost; the session keeps storing QoS 1/2 messages
    pub async fn detach(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Detach { reply }, rx).await
    }

    /// Stop the task, optionally dropping the stored backlog
    pub async fn shutdown(&self, clear: bool) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Shutdown { clear, reply }, rx).await?
    }
}

struct SessionActor {
    client_id: Arc<str>,
    settings: SessionSettings,
    tracker: QosTracker,
    store: Arc<RedeliveryStore>,
    writer: Option<mpsc::Sender<OutboundPacket>>,
    /// Stored messages waiting for window space, in serial order
    pending: VecDeque<(u64, Message)>,
    /// Serials of every stored record, ascending
    stored: VecDeque<u64>,
    rx: mpsc::Receiver<Command>,
}

impl SessionActor {
    async fn run(mut self) {
        let retry_enabled = !self.settings.retry_interval.is_zero();
        let mut retry = tokio::time::interval(
            self.settings
                .retry_interval
                .max(Duration::from_millis(1)),
        );
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.restore_awaiting_release().await;

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command).await {
                        break;
                    }
                }
                _ = retry.tick(), if retry_enabled => {
                    self.retry_unacked();
                }
            }
        }

        debug!("Session task for {} stopped", self.client_id);
    }

    /// Returns false when the task should stop
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Deliver { message, reply } => {
                let outcome = self.deliver(message).await;
                let _ = reply.send(outcome);
            }
            Command::Ack {
                ack,
                packet_id,
                reply,
            } => {
                let result = self.on_ack(ack, packet_id).await;
                let _ = reply.send(result);
            }
            Command::InboundQos2 {
                packet_id,
                message,
                reply,
            } => {
                let result = self.inbound_qos2(packet_id, message).await;
                let _ = reply.send(result);
            }
            Command::Send { packet } => {
                self.write(packet);
            }
            Command::Attach { writer, reply } => {
                let result = self.attach(writer).await;
                let _ = reply.send(result);
            }
            Command::Detach { reply } => {
                self.detach();
                let _ = reply.send(());
            }
            Command::Shutdown { clear, reply } => {
                let result = if clear {
                    self.tracker.clear();
                    self.stored.clear();
                    self.store
                        .clear_all(&self.client_id)
                        .await
                        .map(|_| ())
                        .map_err(SessionError::from)
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
                return false;
            }
        }
        true
    }

    async fn deliver(&mut self, message: Message) -> DeliveryOutcome {
        if message.qos == QoS::AtMostOnce {
            if self.writer.is_none() {
                return DeliveryOutcome::Dropped;
            }
            // QoS 0 takes no window slot and may overtake queued QoS 1/2
            let delivered = self.write(OutboundPacket::Publish {
                packet_id: None,
                dup: false,
                message,
            });
            return if delivered {
                DeliveryOutcome::Delivered
            } else {
                DeliveryOutcome::Dropped
            };
        }

        if self.backlog_full() {
            if self.writer.is_some() {
                warn!(
                    "Stored backlog full for {} ({}), dropping message on {}",
                    self.client_id, self.settings.max_stored_messages, message.topic
                );
                return DeliveryOutcome::Dropped;
            }
            self.evict_oldest().await;
        }

        let serial = match self.store.append(&self.client_id, &message).await {
            Ok(serial) => serial,
            Err(e) => {
                error!("Failed to store message on {} for {}: {}", message.topic, self.client_id, e);
                return DeliveryOutcome::Failed;
            }
        };
        self.stored.push_back(serial);

        if self.writer.is_none() {
            return DeliveryOutcome::Stored;
        }

        if !self.pending.is_empty() || !self.tracker.has_capacity() {
            return self.enqueue(serial, message).await;
        }

        match self.send_new(serial, message).await {
            Some(packet_id) => DeliveryOutcome::Sent { packet_id },
            None => DeliveryOutcome::Stored,
        }
    }

    async fn enqueue(&mut self, serial: u64, message: Message) -> DeliveryOutcome {
        if self.pending.len() >= self.settings.max_queued_messages {
            warn!(
                "Queue full for {} ({}), dropping message on {}",
                self.client_id, self.settings.max_queued_messages, message.topic
            );
            match self.store.retire_serial(&self.client_id, serial).await {
                Ok(()) => self.forget_serial(serial),
                Err(e) => error!("Failed to drop stored message for {}: {}", self.client_id, e),
            }
            return DeliveryOutcome::Dropped;
        }
        trace!("Window full for {}, queueing serial {}", self.client_id, serial);
        self.pending.push_back((serial, message));
        DeliveryOutcome::Queued
    }

    fn backlog_full(&self) -> bool {
        self.settings.max_stored_messages > 0
            && self.stored.len() >= self.settings.max_stored_messages
    }

    /// Discard the oldest stored record to make room while offline
    async fn evict_oldest(&mut self) {
        let Some(serial) = self.stored.pop_front() else {
            return;
        };
        match self.store.retire_serial(&self.client_id, serial).await {
            Ok(()) => warn!(
                "Stored backlog full for {} ({}), discarded oldest serial {}",
                self.client_id, self.settings.max_stored_messages, serial
            ),
            Err(e) => {
                error!("Failed to discard serial {} for {}: {}", serial, self.client_id, e);
                self.stored.push_front(serial);
            }
        }
    }

    fn forget_serial(&mut self, serial: u64) {
        if let Some(pos) = self.stored.iter().position(|s| *s == serial) {
            self.stored.remove(pos);
        }
    }

    /// Allocate an id and write a stored message. None if the window was
    /// full or the transport went away; it stays in the store either way.
    async fn send_new(&mut self, serial: u64, message: Message) -> Option<u16> {
        let packet_id = match self.tracker.allocate_packet_id() {
            Ok(id) => id,
            Err(e) => {
                debug!("{} for {}, queueing serial {}", e, self.client_id, serial);
                self.pending.push_front((serial, message));
                return None;
            }
        };

        if let Err(e) = self
            .store
            .assign_packet_id(&self.client_id, serial, packet_id)
            .await
        {
            error!("Failed to record packet id for {}: {}", self.client_id, e);
        }
        self.tracker.track_outgoing(packet_id, serial, message.clone());

        self.write(OutboundPacket::Publish {
            packet_id: Some(packet_id),
            dup: false,
            message,
        });
        // A full outbound channel leaves it in flight for the retry timer
        self.writer.is_some().then_some(packet_id)
    }

    async fn on_ack(&mut self, ack: AckType, packet_id: u16) -> Result<Option<Message>, SessionError> {
        let result = match self.tracker.on_ack(ack, packet_id) {
            Ok(result) => result,
            Err(e) => {
                debug!("{} from {}", e, self.client_id);
                if ack == AckType::PubRel {
                    // PUBREL for an id already released still gets PUBCOMP
                    self.write(OutboundPacket::PubComp(packet_id));
                }
                return Err(e);
            }
        };

        match result {
            AckResult::Completed { serial } => {
                trace!("{} {} from {} retires serial {}", ack, packet_id, self.client_id, serial);
                self.store.retire_serial(&self.client_id, serial).await?;
                self.forget_serial(serial);
                self.drain_pending().await;
                Ok(None)
            }
            AckResult::PubRelRequired { serial } => {
                self.store.mark_pubrel(&self.client_id, serial).await?;
                self.write(OutboundPacket::PubRel(packet_id));
                Ok(None)
            }
            AckResult::Released { message } => {
                if let Err(e) = self.store.release(&self.client_id, packet_id).await {
                    error!(
                        "Failed to release stored QoS 2 message {} for {}: {}",
                        packet_id, self.client_id, e
                    );
                }
                self.write(OutboundPacket::PubComp(packet_id));
                Ok(Some(message))
            }
        }
    }

    /// PUBREC is only written once the message is durable
    async fn inbound_qos2(
        &mut self,
        packet_id: u16,
        message: Message,
    ) -> Result<InboundQos2, SessionError> {
        let outcome = self.tracker.on_inbound_qos2(packet_id, message.clone())?;
        if outcome == InboundQos2::New {
            if let Err(e) = self
                .store
                .hold_for_release(&self.client_id, packet_id, &message)
                .await
            {
                self.tracker.discard_incoming(packet_id);
                return Err(e.into());
            }
        }
        self.write(OutboundPacket::PubRec(packet_id));
        Ok(outcome)
    }

    async fn restore_awaiting_release(&mut self) {
        match self.store.load_awaiting_release(&self.client_id).await {
            Ok(held) => {
                if !held.is_empty() {
                    debug!(
                        "Restored {} messages awaiting PUBREL from {}",
                        held.len(),
                        self.client_id
                    );
                }
                for (packet_id, message) in held {
                    self.tracker.restore_incoming(packet_id, message);
                }
            }
            Err(e) => error!(
                "Failed to load messages awaiting PUBREL from {}: {}",
                self.client_id, e
            ),
        }
    }

    async fn drain_pending(&mut self) {
        while self.writer.is_some() && self.tracker.has_capacity() {
            let Some((serial, message)) = self.pending.pop_front() else {
                break;
            };
            if self.send_new(serial, message).await.is_none() {
                break;
            }
        }
    }

    async fn attach(&mut self, writer: mpsc::Sender<OutboundPacket>) -> Result<usize, SessionError> {
        self.tracker.clear_outgoing();
        self.pending.clear();

        // Writer stays unset if the backlog cannot be read
        let mut records = self.store.load_for_resend(&self.client_id).await?;
        let limit = self.settings.max_stored_messages;
        if limit > 0 && records.len() > limit {
            let excess = records.len() - limit;
            warn!(
                "Stored backlog for {} exceeds {}, discarding {} oldest",
                self.client_id, limit, excess
            );
            for record in records.drain(..excess) {
                self.store.retire_serial(&self.client_id, record.serial).await?;
            }
        }
        self.stored = records.iter().map(|r| r.serial).collect();
        self.writer = Some(writer);

        let replayed = records.len();
        if replayed > 0 {
            debug!("Replaying {} stored messages to {}", replayed, self.client_id);
        }

        for record in records {
            match (record.packet_id, record.packet_type) {
                (Some(packet_id), PersistedPacketType::PubRel) => {
                    self.tracker.restore_outgoing(
                        packet_id,
                        record.serial,
                        record.message,
                        OutgoingState::WaitingPubComp,
                    );
                    self.write(OutboundPacket::PubRel(packet_id));
                }
                (Some(packet_id), PersistedPacketType::Publish) => {
                    let state = match record.message.qos {
                        QoS::ExactlyOnce => OutgoingState::WaitingPubRec,
                        _ => OutgoingState::WaitingPubAck,
                    };
                    self.tracker.restore_outgoing(
                        packet_id,
                        record.serial,
                        record.message.clone(),
                        state,
                    );
                    self.write(OutboundPacket::Publish {
                        packet_id: Some(packet_id),
                        dup: true,
                        message: record.message,
                    });
                }
                (None, _) => {
                    if !self.pending.is_empty() || !self.tracker.has_capacity() {
                        self.pending.push_back((record.serial, record.message));
                    } else {
                        self.send_new(record.serial, record.message).await;
                    }
                }
            }
        }

        Ok(replayed)
    }

    fn detach(&mut self) {
        self.writer = None;
        self.tracker.clear_outgoing();
        self.pending.clear();
    }

    fn retry_unacked(&mut self) {
        if self.writer.is_none() {
            return;
        }
        for packet in self.tracker.due_for_retry(self.settings.retry_interval) {
            trace!("Retrying {:?} to {}", packet.packet_id(), self.client_id);
            self.write(packet);
        }
    }

    /// Returns whether the packet was accepted by the transport
    fn write(&mut self, packet: OutboundPacket) -> bool {
        let Some(writer) = self.writer.as_ref() else {
            return false;
        };
        match writer.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(packet)) => {
                // Still tracked; the retry timer resends it
                warn!(
                    "Outbound channel full for {}, packet {:?} deferred",
                    self.client_id,
                    packet.packet_id()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Transport for {} closed, detaching", self.client_id);
                self.detach();
                false
            }
        }
    }
}
