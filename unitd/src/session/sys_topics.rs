// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handlers for the fixed system topics.
//!
//! These bypass key authorization; requests are identified by the salted
//! hash of the topic name. Replies go straight out on this connection's
//! stream, not through the fan-out path.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use codec::{PublishPacket, QoS};

use super::Session;
use crate::client_id::ClientId;
use crate::error::{Error, ReasonCode, Rejection};
use crate::hash;
use crate::security::{unix_now, Permissions};
use crate::topic::{Topic, CLIENT_IDENTIFIER_TOPIC, KEYGEN_TOPIC};

#[derive(Debug, Deserialize)]
struct ClientIdRequest {
    /// "1" mints a primary id with a fresh contract, "0" a secondary under
    /// the requesting connection's contract.
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct KeyGenRequest {
    topic: String,

    /// Permission chars, a subset of "rwpe".
    #[serde(rename = "type")]
    kind: String,

    /// Key lifetime in seconds; absent or 0 means the key never expires.
    #[serde(default)]
    ttl: u32,
}

#[derive(Debug, Serialize)]
struct KeyGenResponse<'a> {
    topic: &'a str,
    key: &'a str,
}

#[derive(Debug, Deserialize)]
struct PresenceRequest {
    topic: String,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// PUBLISH to `unitd/clientid`: mint a client id.
    pub(super) async fn on_clientid_request(
        &mut self,
        packet: &PublishPacket,
    ) -> Result<(), Error> {
        let handle = self.live_handle()?;
        let request: ClientIdRequest = match serde_json::from_slice(packet.message()) {
            Ok(request) => request,
            Err(err) => {
                let rejection = Rejection::new(
                    ReasonCode::BadRequest,
                    &format!("Invalid clientid request: {err}"),
                );
                return self
                    .send_error_notification(packet.packet_id(), &rejection)
                    .await;
            }
        };

        let minted = match request.kind.as_str() {
            "0" => {
                // Only a primary id may mint secondaries for its contract.
                if !handle.client_id().is_primary() {
                    let rejection = Rejection::new(
                        ReasonCode::Unauthorized,
                        "Secondary ids are minted by the primary",
                    );
                    return self
                        .send_error_notification(packet.packet_id(), &rejection)
                        .await;
                }
                ClientId::new_secondary(handle.client_id().contract())
            }
            "1" => {
                let contract = hash::salted(&rand::random::<[u8; 16]>(), self.broker.salt());
                ClientId::new_primary(contract)
            }
            _ => {
                let rejection =
                    Rejection::new(ReasonCode::BadRequest, "Unknown client id type");
                return self
                    .send_error_notification(packet.packet_id(), &rejection)
                    .await;
            }
        };

        let reply = PublishPacket::new(
            CLIENT_IDENTIFIER_TOPIC,
            QoS::AtMostOnce,
            minted.to_string().as_bytes(),
        )?;
        self.send(reply).await
    }

    /// PUBLISH to `unitd/keygen`: issue a topic access key bound to the
    /// requesting connection's contract.
    pub(super) async fn on_keygen_request(&mut self, packet: &PublishPacket) -> Result<(), Error> {
        let handle = self.live_handle()?;
        let request: KeyGenRequest = match serde_json::from_slice(packet.message()) {
            Ok(request) => request,
            Err(err) => {
                let rejection = Rejection::new(
                    ReasonCode::BadRequest,
                    &format!("Invalid keygen request: {err}"),
                );
                return self
                    .send_error_notification(packet.packet_id(), &rejection)
                    .await;
            }
        };

        let topic = match Topic::parse(&request.topic, self.broker.salt()) {
            Ok(topic) => topic,
            Err(err) => {
                return self
                    .send_error_notification(packet.packet_id(), &Rejection::from(err))
                    .await;
            }
        };

        let permissions = Permissions::from_type_str(&request.kind);
        if permissions == Permissions::NONE {
            let rejection = Rejection::new(ReasonCode::BadRequest, "Empty permission set");
            return self
                .send_error_notification(packet.packet_id(), &rejection)
                .await;
        }

        let now = unix_now();
        let expires = if request.ttl == 0 {
            None
        } else {
            Some(now.saturating_add(request.ttl))
        };
        let generated = self.broker.keystore().generate(
            handle.client_id().contract(),
            &topic,
            permissions,
            expires,
            now,
        );
        let key = match generated {
            Ok(key) => key,
            Err(err) => {
                log::error!("session: Keygen failed on connection {}: {err:?}", self.id);
                let rejection = Rejection::new(ReasonCode::Internal, "Key generation failed");
                return self
                    .send_error_notification(packet.packet_id(), &rejection)
                    .await;
            }
        };

        let response = KeyGenResponse {
            topic: &request.topic,
            key: &key,
        };
        let body = serde_json::to_vec(&response)?;
        let reply = PublishPacket::new(KEYGEN_TOPIC, QoS::AtMostOnce, &body)?;
        self.send(reply).await
    }

    /// PUBLISH to `unitd/presence`: emit a presence event for the topic.
    pub(super) async fn on_presence_request(
        &mut self,
        packet: &PublishPacket,
    ) -> Result<(), Error> {
        let handle = self.live_handle()?;
        let request: PresenceRequest = match serde_json::from_slice(packet.message()) {
            Ok(request) => request,
            Err(err) => {
                let rejection = Rejection::new(
                    ReasonCode::BadRequest,
                    &format!("Invalid presence request: {err}"),
                );
                return self
                    .send_error_notification(packet.packet_id(), &rejection)
                    .await;
            }
        };

        let result = self.broker.publish_presence(&handle, &request.topic, false);
        if let Err(rejection) = result {
            return self
                .send_error_notification(packet.packet_id(), &rejection)
                .await;
        }
        Ok(())
    }
}
