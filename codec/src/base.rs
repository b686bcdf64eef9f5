// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, EncodeError};

/// Protocol name can only be `MQTT` in specification.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Convert packet fields into a network byte stream.
pub trait EncodePacket {
    /// # Errors
    ///
    /// Returns error if packet contains invalid fields.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Parse packet fields from a network byte stream.
pub trait DecodePacket: Sized {
    /// # Errors
    ///
    /// Returns error if byte stream is malformed.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Each time a Client sends a new SUBSCRIBE, UNSUBSCRIBE, or PUBLISH
/// (where QoS > 0) control packet it MUST assign it a currently unused
/// Packet Identifier [MQTT-2.3.1-2].
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.extend_from_slice(&self.0.to_be_bytes());
        Ok(Self::bytes())
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

/// Protocol versions the broker understands.
///
/// The `5.0` protocol is intentionally not listed; unitd speaks the `3.1`
/// family only.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolLevel {
    V31 = 3,

    #[default]
    V311 = 4,
}

impl TryFrom<u8> for ProtocolLevel {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            3 => Ok(Self::V31),
            4 => Ok(Self::V311),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}

impl EncodePacket for ProtocolLevel {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(*self as u8);
        Ok(1)
    }
}

/// Level of assurance for delivery of a message.
///
/// The broker honors `AtMostOnce` delivery only; higher levels are accepted
/// on the wire and acknowledged, then handled as `AtMostOnce`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}
