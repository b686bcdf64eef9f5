// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

mod base;
mod byte_array;
mod connect_ack_packet;
mod connect_flags;
mod connect_packet;
mod disconnect_packet;
mod error;
mod header;
mod ping_request_packet;
mod ping_response_packet;
mod publish_ack_packet;
mod publish_packet;
mod string_data;
mod subscribe_ack_packet;
mod subscribe_packet;
mod unsubscribe_ack_packet;
mod unsubscribe_packet;
pub mod utils;
mod var_int;

pub use base::{
    DecodePacket, EncodePacket, PacketId, ProtocolLevel, QoS, PROTOCOL_NAME,
};
pub use byte_array::{ByteArray, ByteArrayError};
pub use connect_ack_packet::{ConnectAckPacket, ConnectReturnCode};
pub use connect_flags::ConnectFlags;
pub use connect_packet::ConnectPacket;
pub use disconnect_packet::DisconnectPacket;
pub use error::{DecodeError, EncodeError};
pub use header::{FixedHeader, Packet, PacketType};
pub use ping_request_packet::PingRequestPacket;
pub use ping_response_packet::PingResponsePacket;
pub use publish_ack_packet::PublishAckPacket;
pub use publish_packet::PublishPacket;
pub use string_data::{BinaryData, StringData};
pub use subscribe_ack_packet::{SubscribeAck, SubscribeAckPacket};
pub use subscribe_packet::{SubscribePacket, SubscribeTopic};
pub use unsubscribe_ack_packet::UnsubscribeAckPacket;
pub use unsubscribe_packet::UnsubscribePacket;
pub use var_int::{VarInt, VarIntError, MAX_PACKET_LEN};
