//! Subscribe, unsubscribe and retained delivery on subscribe.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Broker, BrokerEvent, DispatchError};
use crate::protocol::{QoS, RetainHandling, SubscriptionOptions};
use crate::session::SessionHandle;
use crate::topic::{
    parse_filter_with_max_levels, ClientSubscription, SharedGroupKey, TopicError, TopicFilter,
};

impl Broker {
    /// Add subscriptions for a client.
    ///
    /// Returns one result per requested filter, in request order: the
    /// granted QoS or the reason that filter was refused. A refused filter
    /// does not affect the others. Subscribing again to the same filter
    /// replaces its options.
    pub async fn subscribe(
        &self,
        client_id: &str,
        filters: Vec<(String, SubscriptionOptions)>,
    ) -> Result<Vec<Result<QoS, DispatchError>>, DispatchError> {
        let session = self
            .session(client_id)
            .ok_or_else(|| DispatchError::NoSession(Arc::from(client_id)))?;

        let mut results = Vec::with_capacity(filters.len());
        for (filter, options) in filters {
            results.push(self.subscribe_one(&session, &filter, options).await);
        }
        Ok(results)
    }

    async fn subscribe_one(
        &self,
        session: &SessionHandle,
        filter_str: &str,
        mut options: SubscriptionOptions,
    ) -> Result<QoS, DispatchError> {
        let client_id = session.client_id();
        let filter = parse_filter_with_max_levels(filter_str, self.config.max_topic_levels)
            .map_err(DispatchError::InvalidFilter)?;

        if filter.is_shared() && !self.config.shared_subscriptions_available {
            return Err(DispatchError::InvalidFilter(TopicError::InvalidFilter(
                "shared subscriptions are not available",
            )));
        }
        if filter.has_wildcards() && !self.config.wildcard_subscription_available {
            return Err(DispatchError::InvalidFilter(TopicError::InvalidFilter(
                "wildcard subscriptions are not available",
            )));
        }

        if !self
            .hooks
            .on_subscribe_check(client_id, filter_str, options.qos)
            .await?
        {
            debug!("Subscribe to {} denied for {}", filter_str, client_id);
            return Err(DispatchError::NotAuthorized {
                client_id: client_id.clone(),
                topic: filter_str.to_string(),
            });
        }

        options.qos = options.qos.min(self.config.max_qos);
        let replaced = self
            .trie
            .put(&filter, ClientSubscription::new(client_id.clone(), options));

        let filter_key: Arc<str> = Arc::from(filter_str);
        self.client_filters
            .entry(client_id.clone())
            .or_default()
            .insert(filter_key.clone(), options);

        debug!(
            "{} subscribed to {} at {:?}{}",
            client_id,
            filter_str,
            options.qos,
            if replaced { " (replaced)" } else { "" }
        );
        self.emit(BrokerEvent::SubscriptionAdded {
            client_id: client_id.clone(),
            filter: filter_key,
        });

        let send_retained = match options.retain_handling {
            RetainHandling::SendAtSubscribe => true,
            RetainHandling::SendAtSubscribeIfNew => !replaced,
            RetainHandling::DoNotSend => false,
        };
        // Shared subscriptions never receive retained messages on subscribe
        if send_retained && self.config.retain_available && !filter.is_shared() {
            self.deliver_retained(session, &filter, options.qos).await;
        }

        Ok(options.qos)
    }

    async fn deliver_retained(&self, session: &SessionHandle, filter: &TopicFilter, granted: QoS) {
        for message in self.retained.matching(filter) {
            let qos = message.qos.min(granted);
            let outcome = session.deliver(message.for_recipient(qos, true)).await;
            if !outcome.is_accepted() {
                warn!(
                    "Retained message on {} not delivered to {}: {:?}",
                    message.topic,
                    session.client_id(),
                    outcome
                );
            }
        }
    }

    /// Remove subscriptions for a client.
    ///
    /// Returns, per filter, whether a subscription existed. Malformed
    /// filters never match anything and report false.
    pub async fn unsubscribe(
        &self,
        client_id: &str,
        filters: Vec<String>,
    ) -> Result<Vec<bool>, DispatchError> {
        if self.session(client_id).is_none() {
            return Err(DispatchError::NoSession(Arc::from(client_id)));
        }
        Ok(filters
            .iter()
            .map(|filter| self.unsubscribe_one(client_id, filter))
            .collect())
    }

    fn unsubscribe_one(&self, client_id: &str, filter_str: &str) -> bool {
        let filter = match parse_filter_with_max_levels(filter_str, self.config.max_topic_levels) {
            Ok(filter) => filter,
            Err(e) => {
                debug!("Unsubscribe from malformed filter {}: {}", filter_str, e);
                return false;
            }
        };

        let removed = self.remove_from_trie(client_id, &filter);
        if let Some(mut filters) = self.client_filters.get_mut(client_id) {
            filters.remove(filter_str);
        }
        if removed {
            debug!("{} unsubscribed from {}", client_id, filter_str);
            self.emit(BrokerEvent::SubscriptionRemoved {
                client_id: Arc::from(client_id),
                filter: Arc::from(filter_str),
            });
        }
        removed
    }

    fn remove_from_trie(&self, client_id: &str, filter: &TopicFilter) -> bool {
        let removed = self
            .trie
            .delete(filter, |sub| &*sub.client_id == client_id);
        if let (true, Some(group)) = (removed, filter.share_group.as_ref()) {
            // Reset the round-robin position once nobody is left
            if self.trie.shared_group_len(filter) == 0 {
                self.selector.forget(&SharedGroupKey {
                    group: group.clone(),
                    filter: filter.filter.clone(),
                });
            }
        }
        removed
    }

    /// Drop every subscription a client holds
    pub(super) fn remove_all_subscriptions(&self, client_id: &str) -> usize {
        let Some((client_id, filters)) = self.client_filters.remove(client_id) else {
            return 0;
        };
        let mut removed = 0;
        for filter_str in filters.keys() {
            match parse_filter_with_max_levels(filter_str, self.config.max_topic_levels) {
                Ok(filter) => {
                    if self.remove_from_trie(&client_id, &filter) {
                        removed += 1;
                        self.emit(BrokerEvent::SubscriptionRemoved {
                            client_id: client_id.clone(),
                            filter: filter_str.clone(),
                        });
                    }
                }
                Err(e) => warn!("Stored filter {} no longer parses: {}", filter_str, e),
            }
        }
        removed
    }
}
