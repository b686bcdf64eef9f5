// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Server context: builds the broker from config, runs the accept loops.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::cluster::{run_outbound_link, Cluster, PeerHandle, PEER_CHANNEL_CAPACITY};
use crate::config::Config;
use crate::error::Error;
use crate::security::KeyStore;
use crate::session::{Session, SessionConfig};
use crate::types::{next_local_id, NodeId};

pub struct ServerContext {
    config: Config,
}

impl ServerContext {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Build the broker and serve until ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns error on invalid security config or bind failure.
    pub async fn run(&self) -> Result<(), Error> {
        let salt = self.config.security().hash_salt();
        let master_key = self.config.security().decode_master_key()?;
        let keystore = KeyStore::new(&master_key, salt);

        let cluster = if self.config.cluster().is_enabled() {
            let peer_ids: Vec<NodeId> =
                self.config.cluster().peers().iter().map(|p| p.id).collect();
            Cluster::new(self.config.cluster().node_id(), salt, &peer_ids)
        } else {
            Cluster::standalone(salt)
        };
        let broker = Broker::new(keystore, salt, cluster.clone());

        if self.config.cluster().is_enabled() {
            self.start_cluster(&cluster, &broker);
        }

        let listener = TcpListener::bind(self.config.listener().address()).await?;
        log::info!("server: Listening on {}", self.config.listener().address());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, address)) => {
                            log::info!("server: New connection from {address}");
                            self.spawn_session(stream, &broker);
                        }
                        Err(err) => {
                            log::error!("server: Accept failed: {err}");
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("server: Shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn start_cluster(&self, cluster: &Cluster, broker: &Broker) {
        let node_id = self.config.cluster().node_id();

        for peer in self.config.cluster().peers() {
            let (sender, receiver) = mpsc::channel(PEER_CHANNEL_CAPACITY);
            cluster.register_peer(PeerHandle::new(peer.id, sender));
            tokio::spawn(run_outbound_link(
                node_id,
                peer.id,
                peer.address.clone(),
                receiver,
            ));
        }

        let address = self.config.cluster().address().to_string();
        let cluster = cluster.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(err) = cluster.run_listener(&address, broker).await {
                log::error!("cluster: Peer listener failed: {err}");
            }
        });
    }

    fn spawn_session(&self, stream: TcpStream, broker: &Broker) {
        if let Err(err) = stream.set_nodelay(true) {
            log::warn!("server: Failed to set nodelay: {err}");
        }

        let id = next_local_id();
        let listener = self.config.listener();
        let mut session_config = SessionConfig::new();
        session_config
            .set_max_frame_size(listener.max_frame_size())
            .set_send_channel_capacity(listener.send_channel_capacity())
            .set_send_timeout(Duration::from_micros(listener.send_timeout_micros()))
            .set_keep_alive(listener.keep_alive());

        let session = Session::new(id, session_config, stream, broker.clone());
        let broker = broker.clone();
        tokio::spawn(async move {
            // A panic in one connection's task must not take down any other
            // connection; recover at the task boundary and release the
            // connection's resources.
            if AssertUnwindSafe(session.run_loop())
                .catch_unwind()
                .await
                .is_err()
            {
                log::error!("session: Task for connection {id} panicked");
                broker.force_close(id);
            }
        });
    }
}
