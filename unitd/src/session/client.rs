// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handles client packets.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodeError, DecodePacket,
    DisconnectPacket, FixedHeader, PacketId, PacketType, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishPacket, QoS, SubscribeAck, SubscribeAckPacket, SubscribePacket,
    UnsubscribeAckPacket, UnsubscribePacket,
};

use super::{Session, SessionHandle, Status};
use crate::client_id::ClientId;
use crate::error::{Error, ErrorKind, ReasonCode, Rejection};
use crate::hash;
use crate::topic::{SystemTopic, CLIENT_IDENTIFIER_TOPIC, ERROR_TOPIC};

#[derive(Serialize)]
struct ErrorNotification<'a> {
    id: u16,
    code: &'a str,
    message: &'a str,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(super) async fn dispatch_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let fixed_header = FixedHeader::decode(&mut ba)?;

        match self.status {
            Status::AwaitingConnect => {
                if fixed_header.packet_type() == PacketType::Connect {
                    self.on_client_connect(frame).await
                } else {
                    // Anything before CONNECT is a protocol violation; close
                    // without a reply.
                    log::error!(
                        "session: Packet {:?} before CONNECT on connection {}",
                        fixed_header.packet_type(),
                        self.id
                    );
                    self.status = Status::Closing;
                    Ok(())
                }
            }
            Status::Live => match fixed_header.packet_type() {
                PacketType::Connect => {
                    // The Server MUST process a second CONNECT Packet sent from
                    // a Client as a protocol violation and disconnect the
                    // Client [MQTT-3.1.0-2].
                    log::error!("session: Second CONNECT on connection {}", self.id);
                    self.status = Status::Closing;
                    Ok(())
                }
                PacketType::Publish { .. } => self.on_client_publish(frame).await,
                PacketType::Subscribe => self.on_client_subscribe(frame).await,
                PacketType::Unsubscribe => self.on_client_unsubscribe(frame).await,
                PacketType::PingRequest => self.on_client_ping(frame).await,
                PacketType::Disconnect => self.on_client_disconnect(frame),
                t => {
                    log::warn!("session: Unhandled packet type {t:?} on connection {}", self.id);
                    Ok(())
                }
            },
            Status::Closing | Status::Closed => Ok(()),
        }
    }

    async fn on_client_connect(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = match ConnectPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => match err {
                DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel => {
                    // The Server MUST respond to the CONNECT Packet with a CONNACK
                    // return code 0x01 and then disconnect the Client if the
                    // Protocol Level is not supported [MQTT-3.1.2-2].
                    let ack =
                        ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
                    self.send(ack).await?;
                    self.status = Status::Closing;
                    return Ok(());
                }
                DecodeError::InvalidClientId => {
                    let ack =
                        ConnectAckPacket::new(false, ConnectReturnCode::IdentifierRejected);
                    self.send(ack).await?;
                    self.status = Status::Closing;
                    return Ok(());
                }
                _ => {
                    // The Server MUST validate that the CONNECT Packet conforms
                    // and close the Network Connection without sending a CONNACK
                    // if it does not [MQTT-3.1.4-1].
                    self.status = Status::Closing;
                    return Err(err.into());
                }
            },
        };

        // A Server MAY allow a Client to supply a ClientId that has a length
        // of zero bytes; the Server assigns a unique ClientId and processes
        // the CONNECT as if the Client had provided it [MQTT-3.1.3-6]. The
        // minted id travels back on the client-identifier system topic.
        let (client_id, minted) = if packet.client_id().is_empty() {
            let contract = hash::salted(&rand::random::<[u8; 16]>(), self.broker.salt());
            (ClientId::new_primary(contract), true)
        } else {
            match ClientId::parse(packet.client_id()) {
                Ok(client_id) => (client_id, false),
                Err(err) => {
                    log::info!(
                        "session: Rejected client id on connection {}: {err:?}",
                        self.id
                    );
                    let ack =
                        ConnectAckPacket::new(false, ConnectReturnCode::IdentifierRejected);
                    self.send(ack).await?;
                    self.status = Status::Closing;
                    return Ok(());
                }
            }
        };

        if packet.keep_alive() > 0 {
            self.keep_alive = u64::from(packet.keep_alive());
        }

        let handle = SessionHandle::new(
            self.id,
            client_id,
            packet.username().map(str::to_string),
            self.sender.clone(),
            self.config.send_timeout(),
        );
        self.broker.add_connection(handle.clone());
        self.handle = Some(handle);
        self.status = Status::Live;

        self.send(ConnectAckPacket::new(false, ConnectReturnCode::Accepted))
            .await?;

        if minted {
            let notice = PublishPacket::new(
                CLIENT_IDENTIFIER_TOPIC,
                QoS::AtMostOnce,
                client_id.to_string().as_bytes(),
            )?;
            self.send(notice).await?;
        }
        Ok(())
    }

    pub(super) fn live_handle(&self) -> Result<SessionHandle, Error> {
        self.handle.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::ConnectionNotFound,
                "session: No handle for live connection",
            )
        })
    }

    async fn on_client_publish(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = PublishPacket::decode(&mut ba)?;
        let handle = self.live_handle()?;

        if packet.qos() == QoS::ExactOnce {
            let rejection = Rejection::new(
                ReasonCode::BadRequest,
                "Exactly-once delivery is not supported",
            );
            return self
                .send_error_notification(packet.packet_id(), &rejection)
                .await;
        }

        let system_topic = self
            .broker
            .sys_topics()
            .classify(packet.topic(), self.broker.salt());
        match system_topic {
            Some(SystemTopic::ClientId) => self.on_clientid_request(&packet).await?,
            Some(SystemTopic::KeyGen) => self.on_keygen_request(&packet).await?,
            Some(SystemTopic::Presence) => self.on_presence_request(&packet).await?,
            None => {
                let result = self.broker.publish(&handle, &packet, false);
                if let Err(rejection) = result {
                    self.send_error_notification(packet.packet_id(), &rejection)
                        .await?;
                }
            }
        }

        // Keep QoS 1 clients in protocol; delivery stays at most once.
        if packet.qos() == QoS::AtLeastOnce {
            self.send(PublishAckPacket::new(packet.packet_id())).await?;
        }
        Ok(())
    }

    async fn on_client_subscribe(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = SubscribePacket::decode(&mut ba)?;
        let handle = self.live_handle()?;

        // If a Server receives a SUBSCRIBE packet that contains multiple Topic
        // Filters it MUST handle it as if it had received a sequence of
        // multiple SUBSCRIBE packets, combining their responses into a single
        // SUBACK [MQTT-3.8.4-4].
        let mut acks = Vec::with_capacity(packet.topics().len());
        for topic in packet.topics() {
            let result = self.broker.subscribe(&handle, topic.topic(), false);
            match result {
                Ok(()) => acks.push(SubscribeAck::QoS(QoS::AtMostOnce)),
                Err(rejection) => {
                    log::info!(
                        "session: Subscribe rejected on connection {}: {}",
                        self.id,
                        rejection.message
                    );
                    self.send_error_notification(packet.packet_id(), &rejection)
                        .await?;
                    acks.push(SubscribeAck::Failed);
                }
            }
        }

        self.send(SubscribeAckPacket::with_vec(packet.packet_id(), acks))
            .await
    }

    async fn on_client_unsubscribe(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = UnsubscribePacket::decode(&mut ba)?;
        let handle = self.live_handle()?;

        for topic in packet.topics() {
            let result = self.broker.unsubscribe(&handle, topic.as_ref(), false);
            if let Err(rejection) = result {
                log::info!(
                    "session: Unsubscribe rejected on connection {}: {}",
                    self.id,
                    rejection.message
                );
                self.send_error_notification(packet.packet_id(), &rejection)
                    .await?;
            }
        }

        self.send(UnsubscribeAckPacket::new(packet.packet_id()))
            .await
    }

    async fn on_client_ping(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let _packet = PingRequestPacket::decode(&mut ba)?;
        self.send(PingResponsePacket::new()).await
    }

    fn on_client_disconnect(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let _packet = DisconnectPacket::decode(&mut ba)?;
        self.status = Status::Closing;
        Ok(())
    }

    /// Surface a rejection on `trace/error/`, carrying the offending
    /// packet's message id.
    pub(super) async fn send_error_notification(
        &mut self,
        packet_id: PacketId,
        rejection: &Rejection,
    ) -> Result<(), Error> {
        let notification = ErrorNotification {
            id: packet_id.value(),
            code: rejection.code.as_str(),
            message: &rejection.message,
        };
        let body = serde_json::to_vec(&notification)?;
        let packet = PublishPacket::new(ERROR_TOPIC, QoS::AtMostOnce, &body)?;
        self.send(packet).await
    }
}
