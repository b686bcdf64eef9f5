// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Broker service.
//!
//! Owns the connection cache, the subscription trie, the meters and the
//! cluster handle. All operations are synchronous; nothing here is held
//! across a suspension point. The handle is explicit so tests instantiate
//! their own instance.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use codec::PublishPacket;

use crate::cluster::Cluster;
use crate::error::{Rejection, ReasonCode};
use crate::hash;
use crate::metrics::Metrics;
use crate::security::{unix_now, KeyStore, Permissions};
use crate::session::SessionHandle;
use crate::topic::{Part, SystemTopics, Topic, PRESENCE_TOPIC};
use crate::trie::{SubTrie, Subscriber};
use crate::types::{ConnectionId, ContractId};

#[derive(Serialize)]
struct PresenceEvent<'a> {
    event: &'a str,
    topic: &'a str,
    connection: ConnectionId,
}

struct BrokerInner {
    salt: u32,
    keystore: KeyStore,
    sys_topics: SystemTopics,
    metrics: Metrics,
    trie: SubTrie,
    cluster: Cluster,
    connections: RwLock<HashMap<ConnectionId, SessionHandle>>,
}

/// Shared broker handle. Clones are cheap and refer to the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    #[must_use]
    pub fn new(keystore: KeyStore, salt: u32, cluster: Cluster) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                salt,
                keystore,
                sys_topics: SystemTopics::new(salt),
                metrics: Metrics::default(),
                trie: SubTrie::new(),
                cluster,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn salt(&self) -> u32 {
        self.inner.salt
    }

    #[must_use]
    pub fn keystore(&self) -> &KeyStore {
        &self.inner.keystore
    }

    #[must_use]
    pub fn sys_topics(&self) -> &SystemTopics {
        &self.inner.sys_topics
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    #[must_use]
    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    /// Register a live connection.
    ///
    /// # Panics
    ///
    /// Runs into panic if the connection cache lock is poisoned.
    pub fn add_connection(&self, handle: SessionHandle) {
        let mut cache = self.inner.connections.write().unwrap();
        cache.insert(handle.id(), handle);
        self.inner.metrics.connection_added();
    }

    /// Drop a connection from the cache.
    ///
    /// # Panics
    ///
    /// Runs into panic if the connection cache lock is poisoned.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<SessionHandle> {
        let mut cache = self.inner.connections.write().unwrap();
        let removed = cache.remove(&id);
        if removed.is_some() {
            self.inner.metrics.connection_removed();
        }
        removed
    }

    /// # Panics
    ///
    /// Runs into panic if the connection cache lock is poisoned.
    #[must_use]
    pub fn get_connection(&self, id: ConnectionId) -> Option<SessionHandle> {
        let cache = self.inner.connections.read().unwrap();
        cache.get(&id).cloned()
    }

    /// Contract ids are mixed into the trie path as a leading literal part,
    /// so textually colliding topics of different tenants never meet.
    fn scoped_parts(&self, contract: ContractId, topic: &Topic) -> Vec<Part> {
        let mut parts = Vec::with_capacity(topic.parts().len() + 1);
        parts.push(Part::Literal(hash::salted(
            &contract.to_be_bytes(),
            self.inner.salt,
        )));
        parts.extend_from_slice(topic.parts());
        parts
    }

    /// Authorize `raw_topic` presented by `conn` for `required` permissions.
    fn authorize(
        &self,
        conn: &SessionHandle,
        raw_topic: &str,
        required: Permissions,
    ) -> Result<(Topic, ContractId), Rejection> {
        let topic = Topic::parse(raw_topic, self.inner.salt)?;
        let key_contract =
            self.inner
                .keystore
                .validate(topic.key(), &topic, required, unix_now())?;

        // A key is only usable by connections of the contract it was minted
        // for; a leaked key does not cross tenants.
        let contract = conn.client_id().contract();
        if key_contract != contract {
            return Err(Rejection::new(
                ReasonCode::Unauthorized,
                "Key belongs to another contract",
            ));
        }
        Ok((topic, contract))
    }

    /// Handle a SUBSCRIBE for one topic filter.
    ///
    /// # Errors
    ///
    /// Returns a rejection to be surfaced on `trace/error/` and a failed
    /// SUBACK entry.
    pub fn subscribe(
        &self,
        conn: &SessionHandle,
        raw_topic: &str,
        forwarded: bool,
    ) -> Result<(), Rejection> {
        let (topic, contract) = self.authorize(conn, raw_topic, Permissions::READ)?;

        if !forwarded && self.inner.cluster.is_remote_contract(contract) {
            self.inner
                .cluster
                .forward_subscribe(conn, raw_topic)
                .map_err(|err| {
                    log::error!("broker: Failed to forward subscribe: {err}");
                    Rejection::new(ReasonCode::Internal, "Cluster forward failed")
                })?;
            self.inner.metrics.message_forwarded();
            return Ok(());
        }

        let parts = self.scoped_parts(contract, &topic);
        if conn.subscription_add(topic.counter_key(), &parts) {
            let subscriber: Arc<dyn Subscriber> = Arc::new(conn.clone());
            self.inner.trie.subscribe(&parts, &subscriber);
            self.inner.metrics.subscription_added();
        }
        Ok(())
    }

    /// Handle an UNSUBSCRIBE for one topic filter.
    ///
    /// # Errors
    ///
    /// Returns a rejection to be surfaced on `trace/error/`.
    pub fn unsubscribe(
        &self,
        conn: &SessionHandle,
        raw_topic: &str,
        forwarded: bool,
    ) -> Result<(), Rejection> {
        let (topic, contract) = self.authorize(conn, raw_topic, Permissions::READ)?;

        if !forwarded && self.inner.cluster.is_remote_contract(contract) {
            self.inner
                .cluster
                .forward_unsubscribe(conn, raw_topic)
                .map_err(|err| {
                    log::error!("broker: Failed to forward unsubscribe: {err}");
                    Rejection::new(ReasonCode::Internal, "Cluster forward failed")
                })?;
            return Ok(());
        }

        if let Some(parts) = conn.subscription_remove(&topic.counter_key()) {
            self.inner.trie.unsubscribe(&parts, conn.id());
            self.inner.metrics.subscription_removed();
        }
        Ok(())
    }

    /// Handle a PUBLISH.
    ///
    /// # Errors
    ///
    /// Returns a rejection to be surfaced on `trace/error/`. The offending
    /// packet is dropped but the connection stays open.
    pub fn publish(
        &self,
        conn: &SessionHandle,
        packet: &PublishPacket,
        forwarded: bool,
    ) -> Result<(), Rejection> {
        let (topic, contract) = self.authorize(conn, packet.topic(), Permissions::WRITE)?;
        if !topic.is_concrete() {
            return Err(Rejection::new(
                ReasonCode::TopicInvalid,
                "Publish topic must not contain wildcards",
            ));
        }

        if !forwarded {
            self.inner.metrics.message_received(packet.message().len());
        }

        if !forwarded && self.inner.cluster.is_remote_contract(contract) {
            self.inner
                .cluster
                .forward_publish(conn, packet)
                .map_err(|err| {
                    log::error!("broker: Failed to forward publish: {err}");
                    Rejection::new(ReasonCode::Internal, "Cluster forward failed")
                })?;
            self.inner.metrics.message_forwarded();
            return Ok(());
        }

        // Deliveries carry the dotted topic without the access key.
        let dotted = packet
            .topic()
            .split_once('/')
            .map_or(packet.topic(), |(_key, rest)| rest);
        let mut delivery = packet.clone();
        delivery
            .set_topic(dotted)
            .map_err(|_err| Rejection::new(ReasonCode::Internal, "Topic re-encode failed"))?;

        self.fan_out(&self.scoped_parts(contract, &topic), &delivery);
        Ok(())
    }

    /// Emit a presence event for the topic to its current subscribers.
    ///
    /// # Errors
    ///
    /// Returns a rejection to be surfaced on `trace/error/`.
    pub fn publish_presence(
        &self,
        conn: &SessionHandle,
        raw_topic: &str,
        forwarded: bool,
    ) -> Result<(), Rejection> {
        let (topic, contract) = self.authorize(conn, raw_topic, Permissions::PRESENCE)?;

        if !forwarded && self.inner.cluster.is_remote_contract(contract) {
            self.inner
                .cluster
                .forward_presence(conn, raw_topic)
                .map_err(|err| {
                    log::error!("broker: Failed to forward presence: {err}");
                    Rejection::new(ReasonCode::Internal, "Cluster forward failed")
                })?;
            return Ok(());
        }

        let dotted = raw_topic
            .split_once('/')
            .map_or(raw_topic, |(_key, rest)| rest);
        let event = PresenceEvent {
            event: "presence",
            topic: dotted,
            connection: conn.id(),
        };
        let body = serde_json::to_vec(&event)
            .map_err(|_err| Rejection::new(ReasonCode::Internal, "Presence encode failed"))?;
        let delivery = PublishPacket::new(PRESENCE_TOPIC, codec::QoS::AtMostOnce, &body)
            .map_err(|_err| Rejection::new(ReasonCode::Internal, "Presence encode failed"))?;

        self.fan_out(&self.scoped_parts(contract, &topic), &delivery);
        Ok(())
    }

    fn fan_out(&self, parts: &[Part], delivery: &PublishPacket) {
        let bytes = delivery.message().len();
        for subscriber in self.inner.trie.lookup(parts) {
            if subscriber.send_message(delivery) {
                self.inner.metrics.message_sent(bytes);
            } else {
                log::warn!(
                    "broker: Dropped message for slow subscriber {}",
                    subscriber.id()
                );
                self.inner.metrics.message_dropped();
            }
        }
    }

    /// Remove every subscription `conn` still holds. Called on close for
    /// direct connections and on peer loss for proxies.
    pub fn unsubscribe_all(&self, conn: &SessionHandle) {
        for parts in conn.drain_subscriptions() {
            self.inner.trie.unsubscribe(&parts, conn.id());
            self.inner.metrics.subscription_removed();
        }
    }

    /// Tear down a connection that can no longer run its own teardown, e.g.
    /// after a panic in its task.
    pub fn force_close(&self, id: ConnectionId) {
        if let Some(handle) = self.remove_connection(id) {
            handle.stop();
            self.unsubscribe_all(&handle);
            self.inner.cluster.broadcast_conn_gone(id);
        }
    }
}
