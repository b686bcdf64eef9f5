// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Shared per-connection state.
//!
//! A `SessionHandle` is what the broker, the subscription trie and the
//! cluster overlay hold on to. The socket-facing state machine keeps the
//! receiving end of the outbound channel; everything else enqueues through
//! the handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use codec::PublishPacket;

use crate::client_id::ClientId;
use crate::topic::Part;
use crate::trie::{Subscriber, SubscriberKind};
use crate::types::{ConnectionId, NodeId};

struct SubscriptionEntry {
    count: u32,
    parts: Vec<Part>,
}

struct HandleInner {
    id: ConnectionId,
    client_id: ClientId,
    username: Option<String>,

    /// Set for connections standing in for a peer node's client; such a
    /// connection never runs a local socket loop and never takes the
    /// session-close trie removal path.
    origin_node: Option<NodeId>,

    sender: Sender<PublishPacket>,
    send_timeout: Duration,
    stopped: AtomicBool,

    /// Per-pattern refcounts. A client may subscribe through multiple
    /// overlapping expressions; the trie entry is only dropped when the last
    /// reference goes. Held only across bookkeeping, never across awaits.
    subscriptions: Mutex<HashMap<Vec<u8>, SubscriptionEntry>>,
}

#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(
        id: ConnectionId,
        client_id: ClientId,
        username: Option<String>,
        sender: Sender<PublishPacket>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                client_id,
                username,
                origin_node: None,
                sender,
                send_timeout,
                stopped: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a cluster-proxy handle standing in for `client_id` owned by
    /// `origin_node`.
    #[must_use]
    pub fn new_proxy(
        id: ConnectionId,
        client_id: ClientId,
        origin_node: NodeId,
        sender: Sender<PublishPacket>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                client_id,
                username: None,
                origin_node: Some(origin_node),
                sender,
                send_timeout,
                stopped: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.inner.username.as_deref()
    }

    #[must_use]
    pub fn origin_node(&self) -> Option<NodeId> {
        self.inner.origin_node
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Mark the connection stopped. Idempotent; later sends are refused.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    /// Bump the refcount for `counter_key`, recording `parts` on first use.
    ///
    /// Returns true on the 0 to 1 transition, when the caller must insert
    /// into the trie.
    ///
    /// # Panics
    ///
    /// Runs into panic if the subscriptions mutex is poisoned.
    #[must_use]
    pub fn subscription_add(&self, counter_key: Vec<u8>, parts: &[Part]) -> bool {
        let mut map = self.inner.subscriptions.lock().unwrap();
        let entry = map.entry(counter_key).or_insert_with(|| SubscriptionEntry {
            count: 0,
            parts: parts.to_vec(),
        });
        entry.count += 1;
        entry.count == 1
    }

    /// Drop one reference for `counter_key`.
    ///
    /// Returns the recorded parts on the 1 to 0 transition, when the caller
    /// must remove from the trie. Safe if the key was never added.
    ///
    /// # Panics
    ///
    /// Runs into panic if the subscriptions mutex is poisoned.
    #[must_use]
    pub fn subscription_remove(&self, counter_key: &[u8]) -> Option<Vec<Part>> {
        let mut map = self.inner.subscriptions.lock().unwrap();
        let entry = map.get_mut(counter_key)?;
        entry.count -= 1;
        if entry.count == 0 {
            map.remove(counter_key).map(|e| e.parts)
        } else {
            None
        }
    }

    /// Take every recorded pattern, leaving the map empty. Used on close.
    ///
    /// # Panics
    ///
    /// Runs into panic if the subscriptions mutex is poisoned.
    #[must_use]
    pub fn drain_subscriptions(&self) -> Vec<Vec<Part>> {
        let mut map = self.inner.subscriptions.lock().unwrap();
        map.drain().map(|(_k, e)| e.parts).collect()
    }
}

impl Subscriber for SessionHandle {
    fn id(&self) -> ConnectionId {
        self.inner.id
    }

    fn kind(&self) -> SubscriberKind {
        if self.inner.origin_node.is_some() {
            SubscriberKind::ClusterProxy
        } else {
            SubscriberKind::Direct
        }
    }

    /// Bounded enqueue onto the outbound channel.
    ///
    /// Spins for at most the configured send budget when the channel is
    /// full, then gives up and reports false. A slow subscriber never
    /// back-pressures a publisher.
    fn send_message(&self, msg: &PublishPacket) -> bool {
        if self.is_stopped() {
            return false;
        }

        let mut pending = msg.clone();
        let deadline = Instant::now() + self.inner.send_timeout;
        loop {
            match self.inner.sender.try_send(pending) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => return false,
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    pending = returned;
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("client_id", &self.inner.client_id)
            .field("origin_node", &self.inner.origin_node)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::QoS;
    use tokio::sync::mpsc;

    fn handle(capacity: usize) -> (SessionHandle, mpsc::Receiver<PublishPacket>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = SessionHandle::new(
            1,
            ClientId::new_primary(42),
            None,
            sender,
            Duration::from_micros(50),
        );
        (handle, receiver)
    }

    #[test]
    fn test_send_message_enqueues() {
        let (handle, mut receiver) = handle(1);
        let msg = PublishPacket::new("a.b", QoS::AtMostOnce, b"x").unwrap();
        assert!(handle.send_message(&msg));
        assert_eq!(receiver.try_recv().unwrap().message(), b"x");
    }

    #[test]
    fn test_send_message_drops_when_full() {
        let (handle, _receiver) = handle(1);
        let msg = PublishPacket::new("a.b", QoS::AtMostOnce, b"x").unwrap();
        assert!(handle.send_message(&msg));
        // Channel full and nobody draining; must give up within the budget.
        let started = Instant::now();
        assert!(!handle.send_message(&msg));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_send_message_refused_after_stop() {
        let (handle, _receiver) = handle(4);
        handle.stop();
        let msg = PublishPacket::new("a.b", QoS::AtMostOnce, b"x").unwrap();
        assert!(!handle.send_message(&msg));
    }

    #[test]
    fn test_subscription_refcount() {
        let (handle, _receiver) = handle(1);
        let parts = vec![Part::Literal(7), Part::SingleWildcard];

        assert!(handle.subscription_add(b"k1".to_vec(), &parts));
        assert!(!handle.subscription_add(b"k1".to_vec(), &parts));

        assert!(handle.subscription_remove(b"k1").is_none());
        let removed = handle.subscription_remove(b"k1").unwrap();
        assert_eq!(removed, parts);

        // Absent key is a no-op.
        assert!(handle.subscription_remove(b"k1").is_none());
        assert!(handle.subscription_remove(b"nope").is_none());
    }

    #[test]
    fn test_drain_subscriptions() {
        let (handle, _receiver) = handle(1);
        assert!(handle.subscription_add(b"k1".to_vec(), &[Part::Literal(1)]));
        assert!(handle.subscription_add(b"k2".to_vec(), &[Part::Literal(2)]));
        let drained = handle.drain_subscriptions();
        assert_eq!(drained.len(), 2);
        assert!(handle.drain_subscriptions().is_empty());
    }

    #[test]
    fn test_proxy_kind() {
        let (sender, _receiver) = mpsc::channel(1);
        let proxy = SessionHandle::new_proxy(
            9,
            ClientId::new_secondary(42),
            3,
            sender,
            Duration::from_micros(50),
        );
        assert_eq!(proxy.kind(), SubscriberKind::ClusterProxy);
        assert_eq!(proxy.origin_node(), Some(3));
    }
}
