// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Wildcard subscription trie.
//!
//! The trie maps part sequences to subscriber sets. Lookups walk an immutable
//! snapshot behind an [`ArcSwap`], so they never block on writers; subscribe
//! and unsubscribe rebuild the touched path copy-on-write and swap the root.
//! Interior nodes are shared between snapshots through `Arc`.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use codec::PublishPacket;

use crate::topic::Part;
use crate::types::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    /// A live client connection on this node.
    Direct,

    /// Stand-in for a connection owned by a peer node.
    ClusterProxy,
}

/// Anything that can accept fanned-out messages.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn kind(&self) -> SubscriberKind;

    /// Deliver `msg`, returning false if the subscriber's channel is full or
    /// gone. Must not block beyond the send budget.
    fn send_message(&self, msg: &PublishPacket) -> bool;
}

#[derive(Default, Clone)]
struct TrieNode {
    children: HashMap<Part, Arc<TrieNode>>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty()
    }

    /// Rebuild this node with `subscriber` attached at the end of `parts`.
    fn with_subscription(&self, parts: &[Part], subscriber: &Arc<dyn Subscriber>) -> Self {
        let mut node = self.clone();
        match parts.split_first() {
            None => {
                // Idempotent: a subscriber appears in one node's set at most
                // once per pattern.
                if !node.subscribers.iter().any(|s| s.id() == subscriber.id()) {
                    node.subscribers.push(Arc::clone(subscriber));
                }
            }
            Some((first, rest)) => {
                let child = node
                    .children
                    .get(first)
                    .map_or_else(TrieNode::default, |c| (**c).clone());
                let child = child.with_subscription(rest, subscriber);
                node.children.insert(*first, Arc::new(child));
            }
        }
        node
    }

    /// Rebuild this node with `id` detached from the end of `parts`,
    /// pruning nodes left with no subscribers and no children.
    fn without_subscription(&self, parts: &[Part], id: ConnectionId) -> Self {
        let mut node = self.clone();
        match parts.split_first() {
            None => {
                node.subscribers.retain(|s| s.id() != id);
            }
            Some((first, rest)) => {
                if let Some(child) = node.children.get(first) {
                    let child = child.without_subscription(rest, id);
                    if child.is_empty() {
                        node.children.remove(first);
                    } else {
                        node.children.insert(*first, Arc::new(child));
                    }
                }
            }
        }
        node
    }

    /// Collect subscribers matching the concrete `parts`.
    ///
    /// At every step descend into the literal child and the single-wildcard
    /// child, and emit subscribers attached to a multi-wildcard child along
    /// the way. At exhaustion emit this node's own subscribers plus a
    /// terminal multi-wildcard child's, which matches zero parts.
    fn collect(&self, parts: &[Part], out: &mut Vec<Arc<dyn Subscriber>>) {
        if let Some(multi) = self.children.get(&Part::MultiWildcard) {
            out.extend(multi.subscribers.iter().cloned());
        }

        match parts.split_first() {
            None => {
                out.extend(self.subscribers.iter().cloned());
            }
            Some((first, rest)) => {
                if let Some(child) = self.children.get(first) {
                    child.collect(rest, out);
                }
                if let Some(child) = self.children.get(&Part::SingleWildcard) {
                    child.collect(rest, out);
                }
            }
        }
    }
}

/// Wildcard-aware registry of part sequences to subscriber sets.
///
/// Cloning is cheap; clones share the same underlying trie.
#[derive(Clone, Default)]
pub struct SubTrie {
    root: Arc<ArcSwap<TrieNode>>,
}

impl SubTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `subscriber` at the exact pattern `parts`. Idempotent.
    pub fn subscribe(&self, parts: &[Part], subscriber: &Arc<dyn Subscriber>) {
        self.root
            .rcu(|root| Arc::new(root.with_subscription(parts, subscriber)));
    }

    /// Detach connection `id` from the exact pattern `parts`. Safe if absent.
    pub fn unsubscribe(&self, parts: &[Part], id: ConnectionId) {
        self.root
            .rcu(|root| Arc::new(root.without_subscription(parts, id)));
    }

    /// Yield every subscriber whose stored pattern matches the concrete
    /// `parts`, deduplicated by connection id.
    #[must_use]
    pub fn lookup(&self, parts: &[Part]) -> Vec<Arc<dyn Subscriber>> {
        let snapshot = self.root.load();
        let mut matched = Vec::new();
        snapshot.collect(parts, &mut matched);

        let mut seen = HashSet::with_capacity(matched.len());
        matched.retain(|s| seen.insert(s.id()));
        matched
    }

    /// True if no subscription is stored at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.load().is_empty()
    }
}
