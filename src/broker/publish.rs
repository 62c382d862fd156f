//! Message routing and inbound publish handshakes.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use tracing::{debug, trace, warn};

use super::{Broker, BrokerEvent, DispatchError};
use crate::protocol::{Message, OutboundPacket, QoS};
use crate::session::{DeliveryOutcome, InboundQos2};
use crate::topic::{parse_topic_with_max_levels, MatchedSubscription, SelectError};

/// What happened to one routed message
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Outcome per recipient, direct subscribers first, then one entry per
    /// shared group
    pub deliveries: Vec<(Arc<str>, DeliveryOutcome)>,
}

impl PublishReport {
    /// Recipients whose session accepted the message
    pub fn delivered(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|(_, outcome)| outcome.is_accepted())
            .count()
    }

    /// Recipients the message could not be handed to
    pub fn failed(&self) -> usize {
        self.deliveries.len() - self.delivered()
    }

    /// Outcome for one client, if it was a recipient
    pub fn outcome(&self, client_id: &str) -> Option<DeliveryOutcome> {
        self.deliveries
            .iter()
            .find(|(id, _)| &**id == client_id)
            .map(|(_, outcome)| *outcome)
    }
}

/// Result of a client publish arriving at the broker
#[derive(Debug)]
pub enum InboundPublish {
    /// QoS 0/1: routed immediately (PUBACK already queued for QoS 1)
    Routed(PublishReport),
    /// QoS 2: held until the client's PUBREL, PUBREC queued
    AwaitingRelease,
    /// QoS 2 retransmission of a message already held, PUBREC queued again
    Duplicate,
}

/// One recipient with the subscription that selected it
struct Target {
    client_id: Arc<str>,
    message: Message,
}

impl Broker {
    /// Route a message to every matching subscriber.
    ///
    /// Direct matches are collapsed to one delivery per client at the
    /// highest matching QoS. Each shared group contributes exactly one
    /// recipient. Delivered QoS is the lower of the publish and
    /// subscription QoS. A failed delivery never stops the others.
    ///
    /// Callers are expected to have authorized `sender_id` already;
    /// `handle_inbound_publish` does that for client traffic.
    pub async fn publish(
        &self,
        sender_id: &str,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishReport, DispatchError> {
        parse_topic_with_max_levels(topic, self.config.max_topic_levels)
            .map_err(DispatchError::InvalidTopic)?;

        let qos = qos.min(self.config.max_qos);
        let message = Message::new(topic, payload, qos, retain);
        self.route(sender_id, message).await
    }

    pub(super) async fn route(
        &self,
        sender_id: &str,
        message: Message,
    ) -> Result<PublishReport, DispatchError> {
        let retain = message.retain && self.config.retain_available;
        if retain {
            if let Err(e) = self.retained.update(&message).await {
                warn!("Failed to announce retained message on {}: {}", message.topic, e);
            }
        }

        let targets = self.collect_targets(sender_id, &message, retain);
        trace!(
            "Routing {} ({:?}) to {} recipients",
            message.topic,
            message.qos,
            targets.len()
        );

        let deliveries = join_all(targets.into_iter().map(|target| {
            let session = self.session(&target.client_id);
            async move {
                let outcome = match session {
                    Some(session) => session.deliver(target.message).await,
                    None => {
                        debug!("No session for subscriber {}", target.client_id);
                        DeliveryOutcome::Failed
                    }
                };
                (target.client_id, outcome)
            }
        }))
        .await;

        let report = PublishReport { deliveries };
        let recipients = report.delivered();
        self.hooks
            .on_message_published(&message.topic, &message.payload, message.qos, recipients)
            .await;
        self.emit(BrokerEvent::MessagePublished {
            topic: message.topic.clone(),
            qos: message.qos,
            recipients,
        });
        Ok(report)
    }

    fn collect_targets(&self, sender_id: &str, message: &Message, retain: bool) -> Vec<Target> {
        let matches = self.trie.get(&message.topic);
        let mut targets = Vec::with_capacity(matches.direct.len() + matches.shared.len());

        // Deduplicate by client_id (keep highest QoS)
        let mut direct: HashMap<Arc<str>, MatchedSubscription> =
            HashMap::with_capacity(matches.direct.len());
        for matched in matches.direct {
            let sub = &matched.subscription;
            if sub.options.no_local && &*sub.client_id == sender_id {
                continue;
            }
            match direct.get(&sub.client_id) {
                Some(existing) if existing.subscription.qos >= sub.qos => {}
                _ => {
                    direct.insert(sub.client_id.clone(), matched);
                }
            }
        }
        let mut direct: Vec<MatchedSubscription> = direct.into_values().collect();
        direct.sort_by(|a, b| a.subscription.client_id.cmp(&b.subscription.client_id));
        for matched in direct {
            targets.push(Self::target_for(matched, message, retain));
        }

        for (key, members) in &matches.shared {
            match self.selector.select_target(key, members) {
                Ok(matched) => targets.push(Self::target_for(matched, message, retain)),
                Err(SelectError::NoTargetAvailable { group }) => {
                    debug!("Shared group {} has no member for {}", group, message.topic);
                }
            }
        }

        targets
    }

    fn target_for(matched: MatchedSubscription, message: &Message, retain: bool) -> Target {
        let sub = matched.subscription;
        let qos = message.qos.min(sub.qos);
        Target {
            message: message.for_recipient(qos, sub.options.effective_retain(retain)),
            client_id: sub.client_id,
        }
    }

    /// Handle a PUBLISH received from a connected client.
    ///
    /// QoS 0 is routed. QoS 1 is routed and acknowledged. QoS 2 is held by
    /// the sender's session and routed once the client releases it with
    /// PUBREL (see `on_ack`).
    pub async fn handle_inbound_publish(
        &self,
        client_id: &str,
        packet_id: u16,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<InboundPublish, DispatchError> {
        let session = self
            .session(client_id)
            .ok_or_else(|| DispatchError::NoSession(Arc::from(client_id)))?;
        parse_topic_with_max_levels(topic, self.config.max_topic_levels)
            .map_err(DispatchError::InvalidTopic)?;

        let qos = qos.min(self.config.max_qos);
        if !self.authorize_publish(client_id, topic, qos, retain).await? {
            return Err(DispatchError::NotAuthorized {
                client_id: Arc::from(client_id),
                topic: topic.to_string(),
            });
        }

        let message = Message::new(topic, payload, qos, retain);
        match qos {
            QoS::AtMostOnce => Ok(InboundPublish::Routed(self.route(client_id, message).await?)),
            QoS::AtLeastOnce => {
                let report = self.route(client_id, message).await?;
                session.send(OutboundPacket::PubAck(packet_id)).await?;
                Ok(InboundPublish::Routed(report))
            }
            QoS::ExactlyOnce => match session.inbound_qos2(packet_id, message).await? {
                InboundQos2::New => Ok(InboundPublish::AwaitingRelease),
                InboundQos2::Duplicate => Ok(InboundPublish::Duplicate),
            },
        }
    }

    /// Publish permission, answered from the cache when possible.
    ///
    /// Hook errors are returned and never cached.
    async fn authorize_publish(
        &self,
        client_id: &str,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<bool, DispatchError> {
        if let Some(allowed) = self.auth_cache.get(client_id, topic, qos, retain) {
            return Ok(allowed);
        }
        let allowed = self
            .hooks
            .on_publish_check(client_id, topic, qos, retain)
            .await?;
        self.auth_cache.insert(client_id, topic, qos, retain, allowed);
        if !allowed {
            debug!("Publish to {} denied for {}", topic, client_id);
        }
        Ok(allowed)
    }
}
