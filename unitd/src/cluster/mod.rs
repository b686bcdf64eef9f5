// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Cluster overlay.
//!
//! Contracts are sharded over the node set by rendezvous hashing; every
//! operation on a contract owned by a peer is forwarded there and executed
//! against a synthesized proxy connection. Forwarded frames carry the
//! forwarded mark so the receiving node never re-forwards, which keeps the
//! overlay loop-free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use codec::{ByteArray, DecodePacket, EncodePacket, PublishPacket};

use crate::broker::Broker;
use crate::client_id::ClientId;
use crate::error::{Error, ErrorKind};
use crate::session::SessionHandle;
use crate::trie::Subscriber;
use crate::types::{ConnectionId, ContractId, NodeId};

mod peer;
mod ring;

pub use peer::{
    read_frame, run_outbound_link, write_frame, PeerHandle, RpcFrame, RpcOp,
    PEER_CHANNEL_CAPACITY,
};
pub use ring::Ring;

/// Outbound queue for each proxy connection. Deliveries cross the peer link
/// anyway, so the queue is deeper than a client connection's.
const PROXY_CHANNEL_CAPACITY: usize = 64;

const PROXY_SEND_TIMEOUT: Duration = Duration::from_micros(50);

struct ClusterInner {
    node_id: NodeId,
    ring: Ring,
    peers: RwLock<HashMap<NodeId, PeerHandle>>,

    /// (origin node, origin connection) to local proxy connection id.
    proxies: Mutex<HashMap<(NodeId, ConnectionId), ConnectionId>>,
}

/// Shared cluster handle. Clones refer to the same overlay.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// A single-node view: every contract is local.
    #[must_use]
    pub fn standalone(salt: u32) -> Self {
        Self::new(0, salt, &[])
    }

    #[must_use]
    pub fn new(node_id: NodeId, salt: u32, peer_ids: &[NodeId]) -> Self {
        let mut nodes = peer_ids.to_vec();
        if node_id != 0 {
            nodes.push(node_id);
        }
        Self {
            inner: Arc::new(ClusterInner {
                node_id,
                ring: Ring::new(nodes, salt),
                peers: RwLock::new(HashMap::new()),
                proxies: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// True if `contract` is owned by a peer node.
    ///
    /// # Panics
    ///
    /// Runs into panic if the peers lock is poisoned.
    #[must_use]
    pub fn is_remote_contract(&self, contract: ContractId) -> bool {
        if self.inner.node_id == 0 || self.inner.ring.is_empty() {
            return false;
        }
        match self.inner.ring.owner(contract) {
            Some(owner) => owner != self.inner.node_id,
            None => false,
        }
    }

    /// Register the sending side of an outbound peer link.
    ///
    /// # Panics
    ///
    /// Runs into panic if the peers lock is poisoned.
    pub fn register_peer(&self, handle: PeerHandle) {
        let mut peers = self.inner.peers.write().unwrap();
        peers.insert(handle.node_id(), handle);
    }

    fn peer_for_contract(&self, contract: ContractId) -> Result<PeerHandle, Error> {
        let owner = self.inner.ring.owner(contract).ok_or_else(|| {
            Error::new(ErrorKind::ClusterError, "Contract ring is empty")
        })?;
        let peers = self.inner.peers.read().unwrap();
        peers.get(&owner).cloned().ok_or_else(|| {
            Error::from_string(
                ErrorKind::ClusterError,
                format!("No link to contract owner node {owner}"),
            )
        })
    }

    fn peer_for_node(&self, node: NodeId) -> Option<PeerHandle> {
        let peers = self.inner.peers.read().unwrap();
        peers.get(&node).cloned()
    }

    fn forward(
        &self,
        op: RpcOp,
        conn: &SessionHandle,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        let contract = conn.client_id().contract();
        let peer = self.peer_for_contract(contract)?;
        peer.send(RpcFrame::Forward {
            op,
            origin_node: self.inner.node_id,
            origin_conn: conn.id(),
            client_id: conn.client_id().to_string(),
            topic: topic.to_string(),
            payload,
        })
    }

    /// Forward a SUBSCRIBE to the contract owner.
    ///
    /// # Errors
    ///
    /// Returns error if the owner link is missing or saturated.
    pub fn forward_subscribe(&self, conn: &SessionHandle, topic: &str) -> Result<(), Error> {
        self.forward(RpcOp::Subscribe, conn, topic, Vec::new())
    }

    /// Forward an UNSUBSCRIBE to the contract owner.
    ///
    /// # Errors
    ///
    /// Returns error if the owner link is missing or saturated.
    pub fn forward_unsubscribe(&self, conn: &SessionHandle, topic: &str) -> Result<(), Error> {
        self.forward(RpcOp::Unsubscribe, conn, topic, Vec::new())
    }

    /// Forward a PUBLISH, payload included, to the contract owner.
    ///
    /// # Errors
    ///
    /// Returns error if the owner link is missing or saturated.
    pub fn forward_publish(&self, conn: &SessionHandle, packet: &PublishPacket) -> Result<(), Error> {
        let mut payload = Vec::new();
        packet.encode(&mut payload)?;
        self.forward(RpcOp::Publish, conn, packet.topic(), payload)
    }

    /// Forward a presence request to the contract owner.
    ///
    /// # Errors
    ///
    /// Returns error if the owner link is missing or saturated.
    pub fn forward_presence(&self, conn: &SessionHandle, topic: &str) -> Result<(), Error> {
        self.forward(RpcOp::Presence, conn, topic, Vec::new())
    }

    /// Tell every peer that local connection `conn` is gone.
    ///
    /// # Panics
    ///
    /// Runs into panic if the peers lock is poisoned.
    pub fn broadcast_conn_gone(&self, conn: ConnectionId) {
        let peers = self.inner.peers.read().unwrap();
        for peer in peers.values() {
            if let Err(err) = peer.send(RpcFrame::ConnGone { conn }) {
                log::warn!(
                    "cluster: Failed to notify peer {} of closed connection {conn}: {err}",
                    peer.node_id()
                );
            }
        }
    }

    /// Accept peer links and serve their frames until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns error if binding `address` fails.
    pub async fn run_listener(&self, address: &str, broker: Broker) -> Result<(), Error> {
        let listener = TcpListener::bind(address).await?;
        log::info!("cluster: Peer listener on {address}");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            log::info!("cluster: Inbound peer link from {peer_addr}");
            let cluster = self.clone();
            let broker = broker.clone();
            tokio::spawn(async move {
                cluster.serve_peer_link(stream, broker).await;
            });
        }
    }

    /// Serve one inbound peer link until it drops, then reap the peer's
    /// proxies: a dropped peer has lost all its connections as far as this
    /// node is concerned. The peer re-subscribes lazily after reconnecting.
    async fn serve_peer_link(&self, mut stream: TcpStream, broker: Broker) {
        let mut peer_node: Option<NodeId> = None;
        loop {
            match read_frame(&mut stream).await {
                Ok(frame) => self.handle_frame(frame, &mut peer_node, &broker),
                Err(err) => {
                    log::info!("cluster: Peer link closed: {err}");
                    break;
                }
            }
        }
        if let Some(node) = peer_node {
            self.drop_peer_proxies(node, &broker);
        }
    }

    fn handle_frame(&self, frame: RpcFrame, peer_node: &mut Option<NodeId>, broker: &Broker) {
        match frame {
            RpcFrame::Hello { node_id } => {
                *peer_node = Some(node_id);
            }
            RpcFrame::Forward {
                op,
                origin_node,
                origin_conn,
                client_id,
                topic,
                payload,
            } => {
                let Ok(client_id) = ClientId::parse(&client_id) else {
                    log::error!("cluster: Forward with invalid client id from {origin_node}");
                    return;
                };
                let Some(proxy) = self.proxy_for(origin_node, origin_conn, client_id, broker)
                else {
                    return;
                };
                let result = match op {
                    RpcOp::Subscribe => broker.subscribe(&proxy, &topic, true),
                    RpcOp::Unsubscribe => broker.unsubscribe(&proxy, &topic, true),
                    RpcOp::Presence => broker.publish_presence(&proxy, &topic, true),
                    RpcOp::Publish => {
                        let mut ba = ByteArray::new(&payload);
                        match PublishPacket::decode(&mut ba) {
                            Ok(packet) => broker.publish(&proxy, &packet, true),
                            Err(err) => {
                                log::error!("cluster: Undecodable forwarded publish: {err:?}");
                                return;
                            }
                        }
                    }
                };
                if let Err(rejection) = result {
                    log::warn!(
                        "cluster: Forwarded {op:?} from node {origin_node} conn {origin_conn} \
                         rejected: {}",
                        rejection.message
                    );
                }
            }
            RpcFrame::Deliver { conn, payload } => {
                let mut ba = ByteArray::new(&payload);
                match PublishPacket::decode(&mut ba) {
                    Ok(packet) => {
                        if let Some(handle) = broker.get_connection(conn) {
                            if !handle.send_message(&packet) {
                                broker.metrics().message_dropped();
                            }
                        }
                    }
                    Err(err) => {
                        log::error!("cluster: Undecodable delivery: {err:?}");
                    }
                }
            }
            RpcFrame::ConnGone { conn } => {
                if let Some(node) = *peer_node {
                    self.drop_proxy(node, conn, broker);
                }
            }
        }
    }

    /// Look up or synthesize the proxy connection standing in for
    /// `origin_conn` on `origin_node`.
    fn proxy_for(
        &self,
        origin_node: NodeId,
        origin_conn: ConnectionId,
        client_id: ClientId,
        broker: &Broker,
    ) -> Option<SessionHandle> {
        {
            let proxies = self.inner.proxies.lock().unwrap();
            if let Some(local_id) = proxies.get(&(origin_node, origin_conn)) {
                if let Some(handle) = broker.get_connection(*local_id) {
                    return Some(handle);
                }
            }
        }

        // Deliveries go back over our outbound link to the origin.
        let Some(peer) = self.peer_for_node(origin_node) else {
            log::error!("cluster: No return link to node {origin_node}, dropping forward");
            return None;
        };

        let (sender, mut receiver) = mpsc::channel::<PublishPacket>(PROXY_CHANNEL_CAPACITY);
        let local_id = crate::types::next_local_id();
        let handle =
            SessionHandle::new_proxy(local_id, client_id, origin_node, sender, PROXY_SEND_TIMEOUT);
        broker.add_connection(handle.clone());
        {
            let mut proxies = self.inner.proxies.lock().unwrap();
            proxies.insert((origin_node, origin_conn), local_id);
        }

        tokio::spawn(async move {
            while let Some(packet) = receiver.recv().await {
                let mut payload = Vec::new();
                if let Err(err) = packet.encode(&mut payload) {
                    log::error!("cluster: Failed to encode delivery: {err:?}");
                    continue;
                }
                if let Err(err) = peer.send(RpcFrame::Deliver {
                    conn: origin_conn,
                    payload,
                }) {
                    log::warn!("cluster: Delivery to node {origin_node} lost: {err}");
                }
            }
        });

        broker.get_connection(local_id)
    }

    /// Remove one origin connection's proxy and its subscriptions.
    fn drop_proxy(&self, origin_node: NodeId, origin_conn: ConnectionId, broker: &Broker) {
        let local_id = {
            let mut proxies = self.inner.proxies.lock().unwrap();
            proxies.remove(&(origin_node, origin_conn))
        };
        if let Some(local_id) = local_id {
            if let Some(handle) = broker.remove_connection(local_id) {
                handle.stop();
                broker.unsubscribe_all(&handle);
            }
        }
    }

    /// Remove every proxy synthesized for `origin_node`.
    fn drop_peer_proxies(&self, origin_node: NodeId, broker: &Broker) {
        let gone: Vec<ConnectionId> = {
            let mut proxies = self.inner.proxies.lock().unwrap();
            let keys: Vec<(NodeId, ConnectionId)> = proxies
                .keys()
                .filter(|(node, _conn)| *node == origin_node)
                .copied()
                .collect();
            keys.iter().filter_map(|key| proxies.remove(key)).collect()
        };
        log::info!(
            "cluster: Peer {origin_node} gone, dropping {} proxies",
            gone.len()
        );
        for local_id in gone {
            if let Some(handle) = broker.remove_connection(local_id) {
                handle.stop();
                broker.unsubscribe_all(&handle);
            }
        }
    }
}
