// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Configuration file, in toml format.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, ErrorKind};
use crate::types::NodeId;

/// Listener section in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    /// Binding address of the client listener.
    ///
    /// Default is `0.0.0.0:6060`.
    #[serde(default = "Listener::default_address")]
    address: String,

    /// Maximum accepted frame size in bytes.
    ///
    /// Oversize frames close the connection. Default is 64 KiB.
    #[serde(default = "Listener::default_max_frame_size")]
    max_frame_size: usize,

    /// Capacity of each connection's outbound channel.
    ///
    /// Default is 1.
    #[serde(default = "Listener::default_send_channel_capacity")]
    send_channel_capacity: usize,

    /// Budget in microseconds for enqueueing an outbound message before it is
    /// dropped for that subscriber.
    ///
    /// Default is 50.
    #[serde(default = "Listener::default_send_timeout_micros")]
    send_timeout_micros: u64,

    /// Seconds a connection may stay idle before it is disconnected.
    ///
    /// A client-supplied CONNECT keep-alive overrides this at 1.5x its value.
    /// Set to 0 to disable. Default is 60.
    #[serde(default = "Listener::default_keep_alive")]
    keep_alive: u64,

    /// TLS certificate chain path.
    ///
    /// Recognized for deployments that front unitd with a TLS terminator;
    /// the plain listener itself does not read it.
    #[serde(default)]
    tls_cert: Option<PathBuf>,

    /// TLS private key path.
    #[serde(default)]
    tls_key: Option<PathBuf>,
}

impl Listener {
    fn default_address() -> String {
        "0.0.0.0:6060".to_string()
    }

    const fn default_max_frame_size() -> usize {
        64 * 1024
    }

    const fn default_send_channel_capacity() -> usize {
        1
    }

    const fn default_send_timeout_micros() -> u64 {
        50
    }

    const fn default_keep_alive() -> u64 {
        60
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    #[must_use]
    pub const fn send_channel_capacity(&self) -> usize {
        self.send_channel_capacity
    }

    #[must_use]
    pub const fn send_timeout_micros(&self) -> u64 {
        self.send_timeout_micros
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u64 {
        self.keep_alive
    }

    #[must_use]
    pub const fn tls_cert(&self) -> Option<&PathBuf> {
        self.tls_cert.as_ref()
    }

    #[must_use]
    pub const fn tls_key(&self) -> Option<&PathBuf> {
        self.tls_key.as_ref()
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            max_frame_size: Self::default_max_frame_size(),
            send_channel_capacity: Self::default_send_channel_capacity(),
            send_timeout_micros: Self::default_send_timeout_micros(),
            keep_alive: Self::default_keep_alive(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Security section in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    /// Master key for the key codec, 32 bytes in standard base64.
    ///
    /// Every node in a cluster must share the same master key.
    #[serde(default = "Security::default_master_key")]
    master_key: String,

    /// Salt mixed into every topic-part hash.
    ///
    /// Must be identical across all nodes of a cluster and must not change
    /// across restarts while keys are outstanding.
    #[serde(default = "Security::default_hash_salt")]
    hash_salt: u32,
}

impl Security {
    fn default_master_key() -> String {
        // Development key; override in any real deployment.
        STANDARD.encode(b"unitd-dev-master-key-000000000--")
    }

    const fn default_hash_salt() -> u32 {
        0x9e37_79b9
    }

    /// Decode the configured master key.
    ///
    /// # Errors
    ///
    /// Returns error if the key is not base64 of exactly 32 bytes.
    pub fn decode_master_key(&self) -> Result<[u8; 32], Error> {
        let raw = STANDARD.decode(&self.master_key).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("master_key is not valid base64: {err}"),
            )
        })?;
        raw.try_into().map_err(|_err| {
            Error::new(ErrorKind::ConfigError, "master_key must be 32 bytes")
        })
    }

    #[must_use]
    pub const fn hash_salt(&self) -> u32 {
        self.hash_salt
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            master_key: Self::default_master_key(),
            hash_salt: Self::default_hash_salt(),
        }
    }
}

/// One cluster peer entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Peer node id. Must differ from this node's id.
    pub id: NodeId,

    /// Peer cluster listener address, `host:port`.
    pub address: String,
}

/// Cluster section in config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Cluster {
    /// This node's id. 0 disables clustering.
    #[serde(default)]
    node_id: NodeId,

    /// Binding address for the peer listener.
    #[serde(default = "Cluster::default_address")]
    address: String,

    /// Known peers.
    #[serde(default)]
    peers: Vec<Peer>,
}

impl Cluster {
    fn default_address() -> String {
        "0.0.0.0:6061".to_string()
    }

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.node_id != 0 && !self.peers.is_empty()
    }
}

/// Log section in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    /// Log level, one of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default = "Log::default_level")]
    level: String,
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }

    #[must_use]
    pub fn level(&self) -> &str {
        &self.level
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    listener: Listener,

    #[serde(default)]
    security: Security,

    #[serde(default)]
    cluster: Cluster,

    #[serde(default)]
    log: Log,
}

impl Config {
    #[must_use]
    pub const fn listener(&self) -> &Listener {
        &self.listener
    }

    #[must_use]
    pub const fn security(&self) -> &Security {
        &self.security
    }

    #[must_use]
    pub const fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Check config file values.
    ///
    /// # Errors
    ///
    /// Returns error on the first invalid entry.
    pub fn validate(&self) -> Result<(), Error> {
        self.listener.address.parse::<SocketAddr>().map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("invalid listener address {}: {err}", self.listener.address),
            )
        })?;

        self.security.decode_master_key()?;

        if self.listener.send_channel_capacity == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "send_channel_capacity must be at least 1",
            ));
        }

        if self.cluster.is_enabled() {
            self.cluster.address.parse::<SocketAddr>().map_err(|err| {
                Error::from_string(
                    ErrorKind::ConfigError,
                    format!("invalid cluster address {}: {err}", self.cluster.address),
                )
            })?;
            for peer in &self.cluster.peers {
                if peer.id == self.cluster.node_id {
                    return Err(Error::new(
                        ErrorKind::ConfigError,
                        "peer id collides with this node's id",
                    ));
                }
                if peer.id == 0 {
                    return Err(Error::new(ErrorKind::ConfigError, "peer id must not be 0"));
                }
            }
        }

        Ok(())
    }
}
