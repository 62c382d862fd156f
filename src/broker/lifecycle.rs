//! Session start/end and acknowledgement handling.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Broker, BrokerEvent, DispatchError, PublishReport};
use crate::protocol::{AckType, OutboundPacket};
use crate::session::{SessionError, SessionHandle};

/// Result of attaching a client to its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStart {
    /// An existing session was resumed
    pub session_present: bool,
    /// Stored messages written to the client before any new traffic
    pub replayed: usize,
}

impl Broker {
    /// Attach a connected client to its session.
    ///
    /// With `clean_start` any previous session, its subscriptions and its
    /// stored backlog are discarded. Otherwise the existing session task is
    /// reused (or respawned over the stored backlog after a restart) and
    /// every unacknowledged message is written to `writer` before anything
    /// published after this call.
    pub async fn start_session(
        &self,
        client_id: &str,
        clean_start: bool,
        writer: mpsc::Sender<OutboundPacket>,
    ) -> Result<SessionStart, DispatchError> {
        let client_id: Arc<str> = Arc::from(client_id);
        let existing = self.session(&client_id).filter(|h| !h.is_closed());

        let (handle, session_present) = if clean_start {
            if let Some(previous) = existing {
                if let Err(e) = previous.shutdown(true).await {
                    debug!("Previous session of {} already gone: {}", client_id, e);
                }
            }
            self.remove_all_subscriptions(&client_id);
            let cleared = self.redelivery.clear_all(&client_id).await?;
            if cleared > 0 {
                debug!("Discarded {} stored messages for {}", cleared, client_id);
            }
            (self.spawn_session(&client_id), false)
        } else {
            match existing {
                Some(handle) => (handle, true),
                None => (self.spawn_session(&client_id), false),
            }
        };

        let replayed = handle.attach(writer).await?;
        info!(
            "Session started for {} (present: {}, replayed: {})",
            client_id, session_present, replayed
        );

        self.hooks
            .on_session_started(&client_id, session_present)
            .await;
        self.emit(BrokerEvent::SessionStarted {
            client_id,
            session_present,
        });
        Ok(SessionStart {
            session_present,
            replayed,
        })
    }

    fn spawn_session(&self, client_id: &Arc<str>) -> SessionHandle {
        let handle = SessionHandle::spawn(
            client_id.clone(),
            self.config.session.clone(),
            self.redelivery.clone(),
        );
        self.sessions.insert(client_id.clone(), handle.clone());
        handle
    }

    /// Detach a client from its session.
    ///
    /// With `clean` the session task stops and its subscriptions and stored
    /// backlog are discarded. Otherwise the session keeps its subscriptions
    /// and stores QoS 1/2 messages until the client returns.
    pub async fn end_session(&self, client_id: &str, clean: bool) -> Result<(), DispatchError> {
        let session = self
            .session(client_id)
            .ok_or_else(|| DispatchError::NoSession(Arc::from(client_id)))?;
        self.auth_cache.evict(client_id);

        if clean {
            let removed = self.remove_all_subscriptions(client_id);
            self.sessions.remove(client_id);
            session.shutdown(true).await?;
            debug!("Removed {} subscriptions of {}", removed, client_id);
        } else if let Err(e) = session.detach().await {
            warn!("Failed to detach session of {}: {}", client_id, e);
        }

        info!("Session ended for {} (clean: {})", client_id, clean);
        self.hooks.on_session_ended(client_id, clean).await;
        self.emit(BrokerEvent::SessionEnded {
            client_id: session.client_id().clone(),
            clean,
        });
        Ok(())
    }

    /// Feed a PUBACK, PUBREC, PUBREL or PUBCOMP from a client into its
    /// session.
    ///
    /// A PUBREL releases a held inbound QoS 2 message, which is routed here
    /// and its report returned. Acks for unknown packet ids are logged and
    /// returned as `DispatchError::Session`; session state is unchanged.
    pub async fn on_ack(
        &self,
        client_id: &str,
        ack: AckType,
        packet_id: u16,
    ) -> Result<Option<PublishReport>, DispatchError> {
        let session = self
            .session(client_id)
            .ok_or_else(|| DispatchError::NoSession(Arc::from(client_id)))?;

        match session.on_ack(ack, packet_id).await {
            Ok(Some(message)) => Ok(Some(self.route(client_id, message).await?)),
            Ok(None) => Ok(None),
            Err(e @ SessionError::UnknownPacketId { .. }) => {
                debug!("{} from {}: {}", ack, client_id, e);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
