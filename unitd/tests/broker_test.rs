// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End-to-end scenarios driven through real sessions over in-memory streams.

use std::time::{Duration, Instant};
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, EncodePacket,
    FixedHeader, PacketId, PacketType, PublishPacket, QoS, SubscribeAck, SubscribeAckPacket,
    SubscribePacket, UnsubscribePacket,
};
use unitd::broker::Broker;
use unitd::client_id::ClientId;
use unitd::cluster::{Cluster, PeerHandle, RpcFrame, RpcOp};
use unitd::security::{unix_now, KeyStore, Permissions};
use unitd::session::{Session, SessionConfig};
use unitd::topic::{Topic, CLIENT_IDENTIFIER_TOPIC, ERROR_TOPIC, KEYGEN_TOPIC};
use unitd::types::next_local_id;

const SALT: u32 = 0x5a17;
const MASTER_KEY: &[u8; 32] = b"an example very very secret key.";

fn standalone_broker() -> Broker {
    let keystore = KeyStore::new(MASTER_KEY, SALT);
    Broker::new(keystore, SALT, Cluster::standalone(SALT))
}

fn key_for(broker: &Broker, contract: u32, topic: &str, perms: &str) -> String {
    let topic = Topic::parse(topic, SALT).unwrap();
    broker
        .keystore()
        .generate(
            contract,
            &topic,
            Permissions::from_type_str(perms),
            None,
            unix_now(),
        )
        .unwrap()
}

/// A client talking to an in-process session over a duplex stream.
struct TestClient {
    stream: DuplexStream,
    buf: Vec<u8>,
}

impl TestClient {
    /// Spawn a session against `broker` and return the client end.
    fn spawn(broker: &Broker) -> Self {
        let (client_end, server_end) = duplex(64 * 1024);
        let session = Session::new(
            next_local_id(),
            SessionConfig::new(),
            server_end,
            broker.clone(),
        );
        tokio::spawn(session.run_loop());
        Self {
            stream: client_end,
            buf: Vec::new(),
        }
    }

    async fn send<P: EncodePacket>(&mut self, packet: &P) {
        use tokio::io::AsyncWriteExt;
        let mut out = Vec::new();
        packet.encode(&mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    /// Read one complete frame, waiting up to a second.
    async fn read_frame(&mut self) -> Vec<u8> {
        let deadline = Duration::from_secs(1);
        timeout(deadline, async {
            loop {
                if let Some(frame) = Self::take_frame(&mut self.buf) {
                    return frame;
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "stream closed while waiting for a frame");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    fn take_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
        let mut ba = ByteArray::new(buf);
        let fixed_header = FixedHeader::decode(&mut ba).ok()?;
        let total = ba.offset() + fixed_header.remaining_length();
        if buf.len() < total {
            return None;
        }
        Some(buf.drain(..total).collect())
    }

    /// True if a frame arrives within `wait`.
    async fn frame_arrives(&mut self, wait: Duration) -> bool {
        timeout(wait, async {
            loop {
                if Self::take_frame(&mut self.buf).is_some() {
                    return;
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    std::future::pending::<()>().await;
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .is_ok()
    }

    async fn connect(&mut self, client_id: &str) -> ConnectAckPacket {
        let packet = ConnectPacket::new(client_id).unwrap();
        self.send(&packet).await;
        let frame = self.read_frame().await;
        let mut ba = ByteArray::new(&frame);
        ConnectAckPacket::decode(&mut ba).unwrap()
    }

    async fn read_publish(&mut self) -> PublishPacket {
        let frame = self.read_frame().await;
        let mut ba = ByteArray::new(&frame);
        PublishPacket::decode(&mut ba).unwrap()
    }

    async fn read_suback(&mut self) -> SubscribeAckPacket {
        let frame = self.read_frame().await;
        let mut ba = ByteArray::new(&frame);
        SubscribeAckPacket::decode(&mut ba).unwrap()
    }

    async fn subscribe(&mut self, filter: &str, packet_id: u16) {
        let packet =
            SubscribePacket::new(filter, QoS::AtMostOnce, PacketId::new(packet_id)).unwrap();
        self.send(&packet).await;
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let packet = PublishPacket::new(topic, QoS::AtMostOnce, payload).unwrap();
        self.send(&packet).await;
    }
}

// Scenario 1: an empty client id is assigned by the server, and the assigned
// id is accepted on reconnect.
#[tokio::test]
async fn test_empty_client_id_round_trip() {
    let broker = standalone_broker();

    let mut client = TestClient::spawn(&broker);
    let ack = client.connect("").await;
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);

    let notice = client.read_publish().await;
    assert_eq!(notice.topic(), CLIENT_IDENTIFIER_TOPIC);
    let assigned = String::from_utf8(notice.message().to_vec()).unwrap();
    assert!(!assigned.is_empty());
    ClientId::parse(&assigned).unwrap();

    let mut second = TestClient::spawn(&broker);
    let ack = second.connect(&assigned).await;
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
}

// Scenario 2: a key minted over unitd/keygen authorizes exactly its topic.
#[tokio::test]
async fn test_keygen_scopes_authorization() {
    let broker = standalone_broker();

    let mut client = TestClient::spawn(&broker);
    client.connect("").await;
    let notice = client.read_publish().await;
    let client_id = String::from_utf8(notice.message().to_vec()).unwrap();
    drop(client);

    let mut client = TestClient::spawn(&broker);
    client.connect(&client_id).await;

    client
        .publish(
            "unitd/keygen",
            br#"{"topic":"teams.alpha.ch1.u1","type":"rw"}"#,
        )
        .await;
    let reply = client.read_publish().await;
    assert_eq!(reply.topic(), KEYGEN_TOPIC);
    let body: serde_json::Value = serde_json::from_slice(reply.message()).unwrap();
    let key = body["key"].as_str().unwrap().to_string();

    client
        .subscribe(&format!("{key}/teams.alpha.ch1.u1"), 1)
        .await;
    let suback = client.read_suback().await;
    assert_eq!(
        suback.acknowledgements(),
        &[SubscribeAck::QoS(QoS::AtMostOnce)]
    );

    // Same key, different channel: rejected.
    client
        .subscribe(&format!("{key}/teams.alpha.ch2.u1"), 2)
        .await;
    let error = client.read_publish().await;
    assert_eq!(error.topic(), ERROR_TOPIC);
    let body: serde_json::Value = serde_json::from_slice(error.message()).unwrap();
    assert_eq!(body["code"], "KeyInvalid");
    assert_eq!(body["id"], 2);

    let suback = client.read_suback().await;
    assert_eq!(suback.acknowledgements(), &[SubscribeAck::Failed]);
}

// Scenario 3: a multi-wildcard subscription receives matching topics only,
// byte-exact.
#[tokio::test]
async fn test_multi_wildcard_fan_out() {
    let broker = standalone_broker();
    let contract = 7;
    let primary = ClientId::new_primary(contract).to_string();
    let secondary = ClientId::new_secondary(contract).to_string();

    let mut subscriber = TestClient::spawn(&broker);
    subscriber.connect(&primary).await;
    let sub_key = key_for(&broker, contract, "teams.alpha...", "r");
    subscriber
        .subscribe(&format!("{sub_key}/teams.alpha..."), 1)
        .await;
    subscriber.read_suback().await;

    let mut publisher = TestClient::spawn(&broker);
    publisher.connect(&secondary).await;
    let alpha_key = key_for(&broker, contract, "teams.alpha...", "w");
    let beta_key = key_for(&broker, contract, "teams.beta...", "w");

    let payload: Vec<u8> = (0..=255).collect();
    publisher
        .publish(&format!("{alpha_key}/teams.alpha.ch1.u1"), &payload)
        .await;
    publisher
        .publish(&format!("{beta_key}/teams.beta.ch1.u1"), b"other subtree")
        .await;

    let received = subscriber.read_publish().await;
    assert_eq!(received.topic(), "teams.alpha.ch1.u1");
    assert_eq!(received.message(), payload.as_slice());

    // The beta message never arrives.
    assert!(!subscriber.frame_arrives(Duration::from_millis(200)).await);
}

// Scenario 4: a single wildcard matches exactly one part.
#[tokio::test]
async fn test_single_wildcard_depth() {
    let broker = standalone_broker();
    let contract = 9;
    let primary = ClientId::new_primary(contract).to_string();
    let secondary = ClientId::new_secondary(contract).to_string();

    let mut subscriber = TestClient::spawn(&broker);
    subscriber.connect(&primary).await;
    let sub_key = key_for(&broker, contract, "teams...", "r");
    subscriber
        .subscribe(&format!("{sub_key}/teams.*.ch1.u1"), 1)
        .await;
    subscriber.read_suback().await;

    let mut publisher = TestClient::spawn(&broker);
    publisher.connect(&secondary).await;
    let pub_key = key_for(&broker, contract, "teams...", "w");

    publisher
        .publish(&format!("{pub_key}/teams.alpha.ch1.u1"), b"one level")
        .await;
    publisher
        .publish(&format!("{pub_key}/teams.alpha.ch1.ch1.u1"), b"two levels")
        .await;

    let received = subscriber.read_publish().await;
    assert_eq!(received.topic(), "teams.alpha.ch1.u1");
    assert_eq!(received.message(), b"one level");

    assert!(!subscriber.frame_arrives(Duration::from_millis(200)).await);
}

// Scenario 5: operations on a remote contract are forwarded, not applied to
// the local trie.
#[tokio::test]
async fn test_remote_contract_forwarded() {
    let cluster = Cluster::new(1, SALT, &[2]);
    let keystore = KeyStore::new(MASTER_KEY, SALT);
    let broker = Broker::new(keystore, SALT, cluster.clone());

    let (peer_sender, mut peer_rx) = mpsc::channel(16);
    cluster.register_peer(PeerHandle::new(2, peer_sender));

    // A contract owned by node 2.
    let contract = (0..u32::MAX)
        .find(|c| cluster.is_remote_contract(*c))
        .unwrap();
    let primary = ClientId::new_primary(contract).to_string();
    let secondary = ClientId::new_secondary(contract).to_string();
    let key = key_for(&broker, contract, "a...", "rw");

    let mut subscriber = TestClient::spawn(&broker);
    subscriber.connect(&primary).await;
    subscriber.subscribe(&format!("{key}/a.b"), 1).await;
    subscriber.read_suback().await;

    let mut publisher = TestClient::spawn(&broker);
    publisher.connect(&secondary).await;
    publisher.publish(&format!("{key}/a.b"), b"payload").await;

    // Exactly one subscribe and one publish crossed the wire.
    let first = timeout(Duration::from_secs(1), peer_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match first {
        RpcFrame::Forward { op, payload, .. } => {
            assert_eq!(op, RpcOp::Subscribe);
            assert!(payload.is_empty());
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    let second = timeout(Duration::from_secs(1), peer_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match second {
        RpcFrame::Forward { op, payload, .. } => {
            assert_eq!(op, RpcOp::Publish);
            let mut ba = ByteArray::new(&payload);
            let packet = PublishPacket::decode(&mut ba).unwrap();
            assert_eq!(packet.message(), b"payload");
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    // The local trie was never touched.
    assert_eq!(broker.metrics().snapshot().subscriptions, 0);
}

// Scenario 6: a slow subscriber loses messages but stays connected, and the
// publisher never stalls.
#[tokio::test]
async fn test_slow_subscriber_does_not_stall_publisher() {
    let broker = standalone_broker();
    let contract = 11;
    let primary = ClientId::new_primary(contract).to_string();
    let secondary = ClientId::new_secondary(contract).to_string();
    let key = key_for(&broker, contract, "a...", "rw");

    let mut subscriber = TestClient::spawn(&broker);
    subscriber.connect(&primary).await;
    subscriber.subscribe(&format!("{key}/a.b"), 1).await;
    subscriber.read_suback().await;
    // From here on the subscriber never reads; its duplex buffer and channel
    // eventually fill.

    let mut publisher = TestClient::spawn(&broker);
    publisher.connect(&secondary).await;

    let body = vec![0x55u8; 16 * 1024];
    let started = Instant::now();
    for _ in 0..32 {
        publisher.publish(&format!("{key}/a.b"), &body).await;
    }
    // Publishing half a megabyte at an unread subscriber stays prompt.
    assert!(started.elapsed() < Duration::from_secs(1));

    // Wait for the publisher's session to chew through its stream.
    timeout(Duration::from_secs(2), async {
        loop {
            if broker.metrics().snapshot().messages_received == 32 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("publisher session did not process all publishes");

    let snapshot = broker.metrics().snapshot();
    assert!(snapshot.messages_dropped > 0, "expected drops: {snapshot:?}");
    // The slow subscriber is still registered, not disconnected.
    assert_eq!(snapshot.connections, 2);
}

// Refcounted subscriptions: double subscribe needs double unsubscribe.
#[tokio::test]
async fn test_unsubscribe_refcount_over_wire() {
    let broker = standalone_broker();
    let contract = 13;
    let client_id = ClientId::new_primary(contract).to_string();
    let key = key_for(&broker, contract, "a...", "rw");
    let filter = format!("{key}/a.b");

    let mut client = TestClient::spawn(&broker);
    client.connect(&client_id).await;

    client.subscribe(&filter, 1).await;
    client.read_suback().await;
    client.subscribe(&filter, 2).await;
    client.read_suback().await;

    let unsub = UnsubscribePacket::new(&filter, PacketId::new(3)).unwrap();
    client.send(&unsub).await;
    client.read_frame().await; // UNSUBACK
    assert_eq!(broker.metrics().snapshot().subscriptions, 1);

    let unsub = UnsubscribePacket::new(&filter, PacketId::new(4)).unwrap();
    client.send(&unsub).await;
    client.read_frame().await;
    assert_eq!(broker.metrics().snapshot().subscriptions, 0);
}

// Closing a connection removes it from the cache and the trie.
#[tokio::test]
async fn test_disconnect_cleans_up() {
    let broker = standalone_broker();
    let contract = 17;
    let client_id = ClientId::new_primary(contract).to_string();
    let key = key_for(&broker, contract, "a...", "rw");

    let mut client = TestClient::spawn(&broker);
    client.connect(&client_id).await;
    client.subscribe(&format!("{key}/a.b"), 1).await;
    client.read_suback().await;
    assert_eq!(broker.metrics().snapshot().connections, 1);

    let disconnect = codec::DisconnectPacket::new();
    client.send(&disconnect).await;

    timeout(Duration::from_secs(1), async {
        loop {
            if broker.metrics().snapshot().connections == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection was not cleaned up");
    assert_eq!(broker.metrics().snapshot().subscriptions, 0);
}

// A publisher that is also a subscriber of the topic sees its own messages.
#[tokio::test]
async fn test_publisher_sees_own_publish() {
    let broker = standalone_broker();
    let contract = 19;
    let client_id = ClientId::new_primary(contract).to_string();
    let key = key_for(&broker, contract, "a...", "rw");

    let mut client = TestClient::spawn(&broker);
    client.connect(&client_id).await;
    client.subscribe(&format!("{key}/a.b"), 1).await;
    client.read_suback().await;

    client.publish(&format!("{key}/a.b"), b"echo").await;
    let received = client.read_publish().await;
    assert_eq!(received.topic(), "a.b");
    assert_eq!(received.message(), b"echo");
}

// Ping keeps the connection alive and gets a response.
#[tokio::test]
async fn test_ping_pong() {
    let broker = standalone_broker();
    let mut client = TestClient::spawn(&broker);
    client.connect("").await;
    client.read_publish().await; // assigned id

    let ping = codec::PingRequestPacket::new();
    client.send(&ping).await;
    let frame = client.read_frame().await;
    let mut ba = ByteArray::new(&frame);
    let fixed_header = FixedHeader::decode(&mut ba).unwrap();
    assert_eq!(fixed_header.packet_type(), PacketType::PingResponse);
}

// A non-CONNECT first packet is a protocol violation; the stream closes.
#[tokio::test]
async fn test_packet_before_connect_closes() {
    let broker = standalone_broker();
    let mut client = TestClient::spawn(&broker);
    let ping = codec::PingRequestPacket::new();
    client.send(&ping).await;

    let mut chunk = [0u8; 16];
    let n = timeout(Duration::from_secs(1), client.stream.read(&mut chunk))
        .await
        .expect("expected the server to close the stream")
        .unwrap();
    assert_eq!(n, 0);
}
