// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::utils::validate_client_id;
use crate::{
    BinaryData, ByteArray, ConnectFlags, DecodeError, DecodePacket, EncodeError, EncodePacket,
    FixedHeader, Packet, PacketType, ProtocolLevel, StringData, VarIntError, PROTOCOL_NAME,
};

/// `ConnectPacket` is the first packet a client sends after the network
/// connection is established.
///
/// Basic structure of packet:
///
/// ```txt
///  7                          0
/// +----------------------------+
/// | Fixed header               |
/// |                            |
/// +----------------------------+
/// | Protocol name length       |
/// |                            |
/// +----------------------------+
/// | Protocol name ...          |
/// +----------------------------+
/// | Protocol level             |
/// +----------------------------+
/// | Connect flags              |
/// +----------------------------+
/// | Keep alive                 |
/// |                            |
/// +----------------------------+
/// | Client id length           |
/// |                            |
/// +----------------------------+
/// | Client id string ...       |
/// +----------------------------+
/// | Will topic/message ...     |
/// +----------------------------+
/// | Username string ...        |
/// +----------------------------+
/// | Password bytes ...         |
/// +----------------------------+
/// ```
///
/// Will topic/message, username and password fields are only present when the
/// matching connect flag bit is set.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectPacket {
    protocol_name: StringData,

    protocol_level: ProtocolLevel,

    connect_flags: ConnectFlags,

    /// Time interval between two packets in seconds.
    ///
    /// Client must send PingRequest Packet before exceeding this interval.
    /// If this value is not zero and time exceeds after last packet, the Server
    /// will disconnect the network. If this value is zero, the Server is not
    /// required to disconnect the network.
    keep_alive: u16,

    /// Identifies the client to the broker.
    ///
    /// An empty client id requests that the broker mint a fresh primary id
    /// and return it on the client-identifier system topic.
    client_id: StringData,

    /// Will topic and message are decoded for wire compatibility; the broker
    /// does not store will messages.
    will_topic: Option<StringData>,
    will_message: Option<BinaryData>,

    username: Option<StringData>,
    password: Option<BinaryData>,
}

impl ConnectPacket {
    /// Create a new connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        let protocol_name = StringData::from(PROTOCOL_NAME)?;
        validate_client_id(client_id).map_err(|_err| EncodeError::InvalidClientId)?;
        let client_id = StringData::from(client_id)?;
        Ok(Self {
            protocol_name,
            keep_alive: 60,
            client_id,
            ..Self::default()
        })
    }

    pub fn set_client_id(&mut self, client_id: &str) -> Result<&mut Self, EncodeError> {
        validate_client_id(client_id).map_err(|_err| EncodeError::InvalidClientId)?;
        self.client_id = StringData::from(client_id)?;
        Ok(self)
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_username(&mut self, username: &str) -> Result<&mut Self, EncodeError> {
        if username.is_empty() {
            self.connect_flags.set_username(false);
            self.username = None;
        } else {
            self.connect_flags.set_username(true);
            self.username = Some(StringData::from(username)?);
        }
        Ok(self)
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_ref().map(AsRef::as_ref)
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_ref().map(AsRef::as_ref)
    }

    pub fn set_connect_flags(&mut self, connect_flags: ConnectFlags) -> &mut Self {
        self.connect_flags = connect_flags;
        self
    }

    #[must_use]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    fn remaining_length(&self) -> usize {
        let mut len = self.protocol_name.bytes()
            + 1 // protocol level
            + ConnectFlags::bytes()
            + 2 // keep alive
            + self.client_id.bytes();
        if let Some(will_topic) = &self.will_topic {
            len += will_topic.bytes();
        }
        if let Some(will_message) = &self.will_message {
            len += will_message.bytes();
        }
        if let Some(username) = &self.username {
            len += username.bytes();
        }
        if let Some(password) = &self.password {
            len += password.bytes();
        }
        len
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        if protocol_name.as_ref() != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ProtocolLevel::try_from(ba.read_byte()?)?;
        let connect_flags = ConnectFlags::decode(ba)?;
        let keep_alive = ba.read_u16()?;

        let client_id = StringData::decode(ba)?;
        validate_client_id(client_id.as_ref()).map_err(|_err| DecodeError::InvalidClientId)?;

        let (will_topic, will_message) = if connect_flags.will() {
            let topic = StringData::decode(ba)?;
            let message = BinaryData::decode(ba)?;
            (Some(topic), Some(message))
        } else {
            (None, None)
        };

        // If the User Name Flag is set to 0, a user name MUST NOT be present
        // in the payload [MQTT-3.1.2-18].
        let username = if connect_flags.username() {
            Some(StringData::decode(ba)?)
        } else {
            None
        };

        let password = if connect_flags.password() {
            Some(BinaryData::decode(ba)?)
        } else {
            None
        };

        Ok(Self {
            protocol_name,
            protocol_level,
            connect_flags,
            keep_alive,
            client_id,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = FixedHeader::new(PacketType::Connect, self.remaining_length())
            .map_err(|_err| EncodeError::InvalidVarInt)?;
        fixed_header.encode(buf)?;

        self.protocol_name.encode(buf)?;
        self.protocol_level.encode(buf)?;
        self.connect_flags.encode(buf)?;
        buf.extend_from_slice(&self.keep_alive.to_be_bytes());
        self.client_id.encode(buf)?;

        if let Some(will_topic) = &self.will_topic {
            will_topic.encode(buf)?;
        }
        if let Some(will_message) = &self.will_message {
            will_message.encode(buf)?;
        }
        if let Some(username) = &self.username {
            username.encode(buf)?;
        }
        if let Some(password) = &self.password {
            password.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = FixedHeader::new(PacketType::Connect, self.remaining_length())?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_round_trip() {
        let mut packet = ConnectPacket::new("AAECAwQFBgcICQoLDA0ODxAREhM").unwrap();
        packet.set_keep_alive(30);
        packet.set_username("alice").unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.client_id(), "AAECAwQFBgcICQoLDA0ODxAREhM");
        assert_eq!(decoded.keep_alive(), 30);
        assert_eq!(decoded.username(), Some("alice"));
        assert_eq!(decoded.protocol_level(), ProtocolLevel::V311);
    }

    #[test]
    fn test_connect_empty_client_id_accepted() {
        let packet = ConnectPacket::new("").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert!(decoded.client_id().is_empty());
    }

    #[test]
    fn test_connect_bad_protocol_name() {
        let mut buf = Vec::new();
        let packet = ConnectPacket::new("client0").unwrap();
        packet.encode(&mut buf).unwrap();
        // Corrupt the protocol name.
        buf[4] = b'X';
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolName)
        );
    }

    #[test]
    fn test_connect_rejects_invalid_client_id_chars() {
        assert!(ConnectPacket::new("white space").is_err());
    }
}
