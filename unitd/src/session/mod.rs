// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-connection state machine.
//!
//! One task per connection drives a `tokio::select!` over socket reads and
//! the bounded outbound channel; the reader side consumes frames
//! sequentially while the channel side drains fan-out deliveries to the
//! socket.

use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, Receiver, Sender};

use codec::{
    ByteArray, DecodeError, DecodePacket, EncodePacket, FixedHeader, Packet, PublishPacket,
};

use crate::broker::Broker;
use crate::error::Error;
use crate::types::ConnectionId;

mod client;
mod handle;
mod sys_topics;

pub use handle::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Only CONNECT is accepted.
    AwaitingConnect,

    /// Normal request dispatch.
    Live,

    /// Teardown pending.
    Closing,

    /// Terminal.
    Closed,
}

/// Knobs a session inherits from the listener config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    max_frame_size: usize,
    send_channel_capacity: usize,
    send_timeout: Duration,
    keep_alive: u64,
    connect_timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            send_channel_capacity: 1,
            send_timeout: Duration::from_micros(50),
            keep_alive: 60,
            connect_timeout: 10,
        }
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn set_send_channel_capacity(&mut self, capacity: usize) -> &mut Self {
        self.send_channel_capacity = capacity;
        self
    }

    pub fn set_send_timeout(&mut self, send_timeout: Duration) -> &mut Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Idle seconds before disconnect; 0 disables the check.
    pub fn set_keep_alive(&mut self, keep_alive: u64) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn set_connect_timeout(&mut self, connect_timeout: u64) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

/// A client connection being served.
pub struct Session<S> {
    id: ConnectionId,
    config: SessionConfig,
    stream: S,
    broker: Broker,

    status: Status,
    handle: Option<SessionHandle>,
    keep_alive: u64,
    last_activity: Instant,

    sender: Sender<PublishPacket>,
    receiver: Receiver<PublishPacket>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[must_use]
    pub fn new(id: ConnectionId, config: SessionConfig, stream: S, broker: Broker) -> Self {
        let (sender, receiver) = mpsc::channel(config.send_channel_capacity);
        let keep_alive = config.keep_alive;
        Self {
            id,
            config,
            stream,
            broker,
            status: Status::AwaitingConnect,
            handle: None,
            keep_alive,
            last_activity: Instant::now(),
            sender,
            receiver,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Serve the connection until it closes, then tear down.
    pub async fn run_loop(mut self) {
        let connect_instant = Instant::now();
        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            if self.status == Status::Closing || self.status == Status::Closed {
                break;
            }

            tokio::select! {
                read_result = self.stream.read_buf(&mut buf) => {
                    match read_result {
                        Ok(0) => {
                            log::info!("session: Connection {} closed by peer", self.id);
                            self.status = Status::Closing;
                        }
                        Ok(_n) => {
                            self.last_activity = Instant::now();
                            if let Err(err) = self.process_buffer(&mut buf).await {
                                log::error!(
                                    "session: Closing connection {}, stream error: {err}",
                                    self.id
                                );
                                self.status = Status::Closing;
                            }
                        }
                        Err(err) => {
                            log::info!("session: Read failed on connection {}: {err}", self.id);
                            self.status = Status::Closing;
                        }
                    }
                }

                Some(packet) = self.receiver.recv() => {
                    if let Err(err) = self.send(packet).await {
                        log::warn!("session: Write failed on connection {}: {err}", self.id);
                        self.status = Status::Closing;
                    }
                }

                _ = tick.tick() => {
                    if self.status == Status::AwaitingConnect
                        && self.config.connect_timeout > 0
                        && connect_instant.elapsed().as_secs() > self.config.connect_timeout
                    {
                        // If the Server does not receive a CONNECT Packet within a
                        // reasonable amount of time after the Network Connection is
                        // established, the Server SHOULD close the connection.
                        log::info!("session: Connect timeout on connection {}", self.id);
                        self.status = Status::Closing;
                    }

                    // If the Keep Alive value is non-zero and the Server does not
                    // receive a Control Packet from the Client within one and a half
                    // times the Keep Alive time period, it MUST disconnect the
                    // Network Connection [MQTT-3.1.2-24].
                    if self.keep_alive > 0
                        && self.last_activity.elapsed().as_secs() > self.keep_alive * 3 / 2
                    {
                        log::info!("session: Keep alive expired on connection {}", self.id);
                        self.status = Status::Closing;
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// Extract and dispatch every complete frame in `buf`.
    async fn process_buffer(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        while let Some(frame) = Self::take_frame(buf, self.config.max_frame_size)? {
            self.dispatch_frame(&frame).await?;
        }
        Ok(())
    }

    /// Pop one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Oversize and malformed
    /// headers are fatal.
    fn take_frame(buf: &mut Vec<u8>, max_frame_size: usize) -> Result<Option<Vec<u8>>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut ba = ByteArray::new(buf);
        let fixed_header = match FixedHeader::decode(&mut ba) {
            Ok(fixed_header) => fixed_header,
            // Header itself is still incomplete.
            Err(DecodeError::OutOfRange) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let total = ba.offset() + fixed_header.remaining_length();
        if total > max_frame_size {
            return Err(DecodeError::PacketTooLarge.into());
        }
        if buf.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = buf.drain(..total).collect();
        Ok(Some(frame))
    }

    /// Encode `packet` and write it out as one contiguous frame.
    pub(super) async fn send<P: EncodePacket + Packet>(&mut self, packet: P) -> Result<(), Error> {
        let mut out = Vec::new();
        packet.encode(&mut out)?;
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn teardown(mut self) {
        self.status = Status::Closed;

        if let Some(handle) = self.handle.take() {
            handle.stop();
            self.broker.unsubscribe_all(&handle);
            self.broker.remove_connection(handle.id());
            self.broker.cluster().broadcast_conn_gone(handle.id());

            // Give already-queued deliveries a short grace period.
            let deadline = Instant::now() + Duration::from_millis(100);
            while Instant::now() < deadline {
                let Ok(packet) = self.receiver.try_recv() else {
                    break;
                };
                if self.send(packet).await.is_err() {
                    break;
                }
            }
        }

        if let Err(err) = self.stream.shutdown().await {
            log::debug!("session: Shutdown of connection {} failed: {err}", self.id);
        }
        log::info!("session: Connection {} closed", self.id);
    }
}
