// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Client identifiers.
//!
//! A client id is 24 raw bytes: a big-endian contract id in the first four
//! bytes, a kind tag in the fifth, and random disambiguation bytes in the
//! rest. On the wire it travels as URL-safe base64 without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use std::fmt;

use crate::types::ContractId;

/// Raw byte length of a client id.
pub const CLIENT_ID_LEN: usize = 24;

const KIND_SECONDARY: u8 = 0;
const KIND_PRIMARY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// Not decodable as base64.
    BadEncoding,

    /// Decoded byte length is not [`CLIENT_ID_LEN`].
    BadLength,

    /// Kind tag is neither primary nor secondary.
    BadKind,
}

/// An opaque client identifier carrying an embedded contract id.
///
/// A "primary" id is issued once per contract; "secondary" ids share the
/// contract and are minted on demand. Two ids derived from distinct primaries
/// never see each other's traffic even if topics collide textually.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    bytes: [u8; CLIENT_ID_LEN],
}

impl ClientId {
    /// Mint a primary id for `contract`.
    #[must_use]
    pub fn new_primary(contract: ContractId) -> Self {
        Self::mint(contract, KIND_PRIMARY)
    }

    /// Mint a secondary id sharing `contract`.
    #[must_use]
    pub fn new_secondary(contract: ContractId) -> Self {
        Self::mint(contract, KIND_SECONDARY)
    }

    fn mint(contract: ContractId, kind: u8) -> Self {
        let mut bytes = [0u8; CLIENT_ID_LEN];
        bytes[..4].copy_from_slice(&contract.to_be_bytes());
        bytes[4] = kind;
        rand::thread_rng().fill_bytes(&mut bytes[5..]);
        Self { bytes }
    }

    /// Parse the textual form presented in a CONNECT packet.
    ///
    /// # Errors
    ///
    /// Returns error if `text` is not valid base64 of exactly
    /// [`CLIENT_ID_LEN`] bytes with a known kind tag.
    pub fn parse(text: &str) -> Result<Self, ClientIdError> {
        let decoded = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|_err| ClientIdError::BadEncoding)?;
        let bytes: [u8; CLIENT_ID_LEN] = decoded
            .try_into()
            .map_err(|_err| ClientIdError::BadLength)?;
        if bytes[4] != KIND_PRIMARY && bytes[4] != KIND_SECONDARY {
            return Err(ClientIdError::BadKind);
        }
        Ok(Self { bytes })
    }

    /// Contract id this client belongs to.
    #[must_use]
    pub fn contract(&self) -> ContractId {
        let mut be = [0u8; 4];
        be.copy_from_slice(&self.bytes[..4]);
        ContractId::from_be_bytes(be)
    }

    #[must_use]
    pub const fn is_primary(&self) -> bool {
        self.bytes[4] == KIND_PRIMARY
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.bytes
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.bytes))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ClientId(contract={}, primary={})",
            self.contract(),
            self.is_primary()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_parse_round_trip() {
        let id = ClientId::new_primary(0xdead_beef);
        let text = id.to_string();
        let parsed = ClientId::parse(&text).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.contract(), 0xdead_beef);
        assert!(parsed.is_primary());
    }

    #[test]
    fn test_secondary_shares_contract() {
        let primary = ClientId::new_primary(42);
        let secondary = ClientId::new_secondary(primary.contract());
        assert_eq!(secondary.contract(), 42);
        assert!(!secondary.is_primary());
        assert_ne!(secondary, primary);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(ClientId::parse("not base64!"), Err(ClientIdError::BadEncoding));
        assert_eq!(ClientId::parse("AAAA"), Err(ClientIdError::BadLength));
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let mut bytes = *ClientId::new_primary(7).as_bytes();
        bytes[4] = 9;
        let text = URL_SAFE_NO_PAD.encode(bytes);
        assert_eq!(ClientId::parse(&text), Err(ClientIdError::BadKind));
    }

    #[test]
    fn test_textual_form_is_path_safe() {
        let id = ClientId::new_secondary(u32::MAX);
        let text = id.to_string();
        assert!(!text.contains('/'));
        assert_eq!(text.len(), 32);
    }
}
