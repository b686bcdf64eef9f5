// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Peer links and the inter-node RPC frames.
//!
//! Every frame travels length-prefixed on a per-peer TCP stream:
//!
//! ```txt
//! +------------+-----+------------------+
//! | Length u32 | Tag | Frame fields ... |
//! +------------+-----+------------------+
//! ```
//!
//! Forwarding is fire-and-forget; a frame that cannot be queued or written
//! is dropped and the failure is logged at the origin. Liveness is the TCP
//! link itself.

use std::convert::TryFrom;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};

use codec::{
    BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, StringData,
};

use crate::error::{Error, ErrorKind};
use crate::types::{ConnectionId, NodeId};

/// Upper bound for an encoded RPC frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Capacity of the outbound frame queue per peer.
pub const PEER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcOp {
    Subscribe = 1,
    Unsubscribe = 2,
    Publish = 3,
    Presence = 4,
}

impl TryFrom<u8> for RpcOp {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        match v {
            1 => Ok(Self::Subscribe),
            2 => Ok(Self::Unsubscribe),
            3 => Ok(Self::Publish),
            4 => Ok(Self::Presence),
            _ => Err(DecodeError::InvalidPacketType),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcFrame {
    /// First frame on every link; names the sending node.
    Hello { node_id: NodeId },

    /// An operation executed on behalf of a connection living on
    /// `origin_node`. The receiving node performs the local action only.
    Forward {
        op: RpcOp,
        origin_node: NodeId,
        origin_conn: ConnectionId,
        client_id: String,
        topic: String,
        /// Encoded publish packet for `Publish`, empty otherwise.
        payload: Vec<u8>,
    },

    /// Fan-out delivery for a connection on the receiving node.
    Deliver {
        conn: ConnectionId,
        /// Encoded publish packet.
        payload: Vec<u8>,
    },

    /// The named connection on the sending node is gone; drop its proxy.
    ConnGone { conn: ConnectionId },
}

const TAG_HELLO: u8 = 1;
const TAG_FORWARD: u8 = 2;
const TAG_DELIVER: u8 = 3;
const TAG_CONN_GONE: u8 = 4;

impl RpcFrame {
    /// # Errors
    ///
    /// Returns error if a field exceeds its encodable size.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        match self {
            Self::Hello { node_id } => {
                buf.push(TAG_HELLO);
                buf.extend_from_slice(&node_id.to_be_bytes());
            }
            Self::Forward {
                op,
                origin_node,
                origin_conn,
                client_id,
                topic,
                payload,
            } => {
                buf.push(TAG_FORWARD);
                buf.push(*op as u8);
                buf.extend_from_slice(&origin_node.to_be_bytes());
                buf.extend_from_slice(&origin_conn.to_be_bytes());
                StringData::from(client_id)?.encode(buf)?;
                StringData::from(topic)?.encode(buf)?;
                BinaryData::from(payload)?.encode(buf)?;
            }
            Self::Deliver { conn, payload } => {
                buf.push(TAG_DELIVER);
                buf.extend_from_slice(&conn.to_be_bytes());
                BinaryData::from(payload)?.encode(buf)?;
            }
            Self::ConnGone { conn } => {
                buf.push(TAG_CONN_GONE);
                buf.extend_from_slice(&conn.to_be_bytes());
            }
        }
        Ok(buf.len() - old_len)
    }

    /// # Errors
    ///
    /// Returns error if the frame is malformed.
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let tag = ba.read_byte()?;
        match tag {
            TAG_HELLO => Ok(Self::Hello {
                node_id: ba.read_u32()?,
            }),
            TAG_FORWARD => {
                let op = RpcOp::try_from(ba.read_byte()?)?;
                let origin_node = ba.read_u32()?;
                let origin_conn = ba.read_u64()?;
                let client_id = StringData::decode(ba)?.as_ref().to_string();
                let topic = StringData::decode(ba)?.as_ref().to_string();
                let payload = BinaryData::decode(ba)?.as_ref().to_vec();
                Ok(Self::Forward {
                    op,
                    origin_node,
                    origin_conn,
                    client_id,
                    topic,
                    payload,
                })
            }
            TAG_DELIVER => {
                let conn = ba.read_u64()?;
                let payload = BinaryData::decode(ba)?.as_ref().to_vec();
                Ok(Self::Deliver { conn, payload })
            }
            TAG_CONN_GONE => Ok(Self::ConnGone {
                conn: ba.read_u64()?,
            }),
            _ => Err(DecodeError::InvalidPacketType),
        }
    }
}

/// Read one length-prefixed frame.
///
/// # Errors
///
/// Returns error on stream failure, oversize frame or malformed frame.
pub async fn read_frame<S>(stream: &mut S) -> Result<RpcFrame, Error>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Error::from_string(
            ErrorKind::ClusterError,
            format!("Invalid rpc frame length: {len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    let mut ba = ByteArray::new(&buf);
    RpcFrame::decode(&mut ba).map_err(Error::from)
}

/// Write one length-prefixed frame.
///
/// # Errors
///
/// Returns error on stream failure or unencodable frame.
pub async fn write_frame<S>(stream: &mut S, frame: &RpcFrame) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    frame.encode(&mut buf).map_err(Error::from)?;
    #[allow(clippy::cast_possible_truncation)]
    stream.write_u32(buf.len() as u32).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Sending side of one peer link.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    node_id: NodeId,
    sender: Sender<RpcFrame>,
}

impl PeerHandle {
    #[must_use]
    pub const fn new(node_id: NodeId, sender: Sender<RpcFrame>) -> Self {
        Self { node_id, sender }
    }

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Queue `frame` for the peer without waiting.
    ///
    /// # Errors
    ///
    /// Returns error if the link's queue is full or the link task is gone.
    pub fn send(&self, frame: RpcFrame) -> Result<(), Error> {
        self.sender.try_send(frame).map_err(|err| {
            let reason = match err {
                TrySendError::Full(_) => "queue full",
                TrySendError::Closed(_) => "link closed",
            };
            Error::from_string(
                ErrorKind::ClusterError,
                format!("Peer {} unreachable: {reason}", self.node_id),
            )
        })
    }
}

/// Drive one outbound peer link: connect, say hello, pump queued frames.
///
/// Reconnects with capped exponential backoff. Frames that arrive while the
/// link is down wait in the queue; frames that fail mid-write are lost, as
/// forwarding is fire-and-forget.
pub async fn run_outbound_link(
    local_node: NodeId,
    peer_node: NodeId,
    address: String,
    mut receiver: Receiver<RpcFrame>,
) {
    let mut backoff_secs = 1u64;
    loop {
        let mut stream = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("cluster: Failed to connect peer {peer_node} at {address}: {err}");
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(30);
                continue;
            }
        };
        backoff_secs = 1;
        log::info!("cluster: Connected to peer {peer_node} at {address}");

        if let Err(err) = write_frame(&mut stream, &RpcFrame::Hello { node_id: local_node }).await
        {
            log::warn!("cluster: Hello to peer {peer_node} failed: {err}");
            continue;
        }

        loop {
            let Some(frame) = receiver.recv().await else {
                // Cluster handle dropped; link is done.
                return;
            };
            if let Err(err) = write_frame(&mut stream, &frame).await {
                log::warn!("cluster: Write to peer {peer_node} failed, frame lost: {err}");
                break;
            }
        }
    }
}
