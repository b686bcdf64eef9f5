// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic access keys.
//!
//! A key is an opaque token binding a contract id, a topic subtree, a
//! permission set and an expiry. The token is a XChaCha20-Poly1305 sealed box
//! under the broker's 32-byte master key; no issued key is stored server
//! side. The 24-byte nonce is expanded deterministically from the clear-text
//! seed `[contract id, issue time]` carried in front of the ciphertext.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::hash;
use crate::topic::{Part, Topic, MAX_DEPTH, MULTI_WILDCARD, SINGLE_WILDCARD};
use crate::types::ContractId;

/// Permission bits grantable on a topic subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const PRESENCE: Self = Self(4);
    pub const EXTEND: Self = Self(8);

    /// Map a permission type string, one char per bit: `r`, `w`, `p`, `e`.
    /// Unknown chars are ignored.
    #[must_use]
    pub fn from_type_str(s: &str) -> Self {
        let mut bits = 0;
        for c in s.chars() {
            bits |= match c {
                'r' => Self::READ.0,
                'w' => Self::WRITE.0,
                'p' => Self::PRESENCE.0,
                'e' => Self::EXTEND.0,
                _ => 0,
            };
        }
        Self(bits)
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if every bit in `required` is granted.
    #[must_use]
    pub const fn contains(self, required: Self) -> bool {
        self.0 & required.0 == required.0
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// Token is not decodable or truncated.
    BadFormat,

    /// Authentication tag does not verify under the master key.
    BadMac,

    /// Key expiry has passed.
    Expired,

    /// Key does not grant the required permissions.
    Forbidden,

    /// Presented topic is outside the granted subtree.
    TopicMismatch,
}

const SEED_LEN: usize = 8;
const NONCE_LEN: usize = 24;

/// Current unix time in seconds, as used for key issue and expiry checks.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32)
}

/// Issues and validates topic access keys.
#[derive(Clone)]
pub struct KeyStore {
    cipher: XChaCha20Poly1305,
    salt: u32,
    single_wildcard: u32,
    multi_wildcard: u32,
}

impl KeyStore {
    #[must_use]
    pub fn new(master_key: &[u8; 32], salt: u32) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(master_key)),
            salt,
            single_wildcard: hash::salted(SINGLE_WILDCARD.as_bytes(), salt),
            multi_wildcard: hash::salted(MULTI_WILDCARD.as_bytes(), salt),
        }
    }

    fn part_hash(&self, part: Part) -> u32 {
        match part {
            Part::Literal(h) => h,
            Part::SingleWildcard => self.single_wildcard,
            Part::MultiWildcard => self.multi_wildcard,
        }
    }

    fn derive_nonce(&self, seed: &[u8]) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        let mut state = hash::salted(seed, self.salt);
        for chunk in nonce.chunks_mut(4) {
            chunk.copy_from_slice(&state.to_be_bytes());
            state = hash::salted(&state.to_be_bytes(), state);
        }
        nonce
    }

    /// Issue a key granting `permissions` on the subtree described by
    /// `topic` to clients of `contract`.
    ///
    /// `expires` is an absolute unix time in seconds, or `None` for a key
    /// that never expires. `now` is the issue time.
    ///
    /// The returned token is URL and path safe.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::BadFormat` if the topic is too deep to encode.
    pub fn generate(
        &self,
        contract: ContractId,
        topic: &Topic,
        permissions: Permissions,
        expires: Option<u32>,
        now: u32,
    ) -> Result<String, KeyError> {
        if topic.parts().len() > MAX_DEPTH {
            return Err(KeyError::BadFormat);
        }

        let mut plain = Vec::with_capacity(6 + topic.parts().len() * 4);
        plain.push(permissions.bits());
        #[allow(clippy::cast_possible_truncation)]
        plain.push(topic.parts().len() as u8);
        plain.extend_from_slice(&expires.unwrap_or(0).to_be_bytes());
        for part in topic.parts() {
            plain.extend_from_slice(&self.part_hash(*part).to_be_bytes());
        }

        let mut seed = [0u8; SEED_LEN];
        seed[..4].copy_from_slice(&contract.to_be_bytes());
        seed[4..].copy_from_slice(&now.to_be_bytes());
        let nonce = self.derive_nonce(&seed);

        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plain.as_slice())
            .map_err(|_err| KeyError::BadFormat)?;

        let mut token = Vec::with_capacity(SEED_LEN + sealed.len());
        token.extend_from_slice(&seed);
        token.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    /// Validate `token` against a presented topic.
    ///
    /// Checks, in order: token format, authentication tag, expiry, granted
    /// permissions, and that the granted part sequence is a prefix of (or
    /// equal to) the presented parts. A key for `a.b...` authorizes `a.b.c`;
    /// a key for `a.b.c` does not authorize `a.b`.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn validate(
        &self,
        token: &[u8],
        topic: &Topic,
        required: Permissions,
        now: u32,
    ) -> Result<ContractId, KeyError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_err| KeyError::BadFormat)?;
        if raw.len() <= SEED_LEN {
            return Err(KeyError::BadFormat);
        }
        let (seed, sealed) = raw.split_at(SEED_LEN);

        let mut be = [0u8; 4];
        be.copy_from_slice(&seed[..4]);
        let contract = ContractId::from_be_bytes(be);

        let nonce = self.derive_nonce(seed);
        let plain = self
            .cipher
            .decrypt(XNonce::from_slice(&nonce), sealed)
            .map_err(|_err| KeyError::BadMac)?;

        if plain.len() < 6 {
            return Err(KeyError::BadFormat);
        }
        let permissions = Permissions(plain[0]);
        let part_count = usize::from(plain[1]);
        be.copy_from_slice(&plain[2..6]);
        let expires = u32::from_be_bytes(be);
        if plain.len() != 6 + part_count * 4 {
            return Err(KeyError::BadFormat);
        }

        if expires != 0 && now > expires {
            return Err(KeyError::Expired);
        }
        if !permissions.contains(required) {
            return Err(KeyError::Forbidden);
        }

        let mut granted = Vec::with_capacity(part_count);
        for i in 0..part_count {
            be.copy_from_slice(&plain[6 + i * 4..10 + i * 4]);
            granted.push(u32::from_be_bytes(be));
        }
        self.check_topic(&granted, topic)?;

        Ok(contract)
    }

    /// Walk granted hashes against presented parts, position by position.
    fn check_topic(&self, granted: &[u32], topic: &Topic) -> Result<(), KeyError> {
        let presented = topic.parts();
        for (i, part) in presented.iter().enumerate() {
            let Some(&grant) = granted.get(i) else {
                // Presented topic extends past the grant and the grant did
                // not end in a multi wildcard.
                return Err(KeyError::TopicMismatch);
            };
            if grant == self.multi_wildcard {
                return Ok(());
            }
            match part {
                Part::Literal(h) => {
                    if grant != *h && grant != self.single_wildcard {
                        return Err(KeyError::TopicMismatch);
                    }
                }
                // A presented wildcard reaches topics beyond any literal
                // grant at this position.
                Part::SingleWildcard => {
                    if grant != self.single_wildcard {
                        return Err(KeyError::TopicMismatch);
                    }
                }
                Part::MultiWildcard => return Err(KeyError::TopicMismatch),
            }
        }

        // Grant deeper than the presented topic authorizes only its subtree,
        // except for a trailing multi wildcard, which matches zero parts.
        if granted.len() > presented.len() {
            let trailing_multi_only = granted.len() == presented.len() + 1
                && granted[presented.len()] == self.multi_wildcard;
            if !trailing_multi_only {
                return Err(KeyError::TopicMismatch);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: u32 = 0xab5a;
    const NOW: u32 = 1_700_000_000;

    fn keystore() -> KeyStore {
        KeyStore::new(b"an example very very secret key.", SALT)
    }

    fn topic(s: &str) -> Topic {
        Topic::parse(s, SALT).unwrap()
    }

    #[test]
    fn test_permissions_from_type_str() {
        let perms = Permissions::from_type_str("rw");
        assert!(perms.contains(Permissions::READ));
        assert!(perms.contains(Permissions::WRITE));
        assert!(!perms.contains(Permissions::PRESENCE));

        // Unknown chars are ignored.
        let perms = Permissions::from_type_str("rxp9");
        assert!(perms.contains(Permissions::READ.union(Permissions::PRESENCE)));
    }

    #[test]
    fn test_generate_validate_exact_topic() {
        let ks = keystore();
        let t = topic("teams.alpha.ch1.u1");
        let key = ks
            .generate(7, &t, Permissions::from_type_str("rw"), None, NOW)
            .unwrap();
        assert!(!key.contains('/'));

        let contract = ks
            .validate(key.as_bytes(), &t, Permissions::READ, NOW + 10)
            .unwrap();
        assert_eq!(contract, 7);
    }

    #[test]
    fn test_validate_other_topic_rejected() {
        let ks = keystore();
        let granted = topic("teams.alpha.ch1.u1");
        let key = ks
            .generate(7, &granted, Permissions::READ, None, NOW)
            .unwrap();

        let other = topic("teams.alpha.ch2.u1");
        assert_eq!(
            ks.validate(key.as_bytes(), &other, Permissions::READ, NOW),
            Err(KeyError::TopicMismatch)
        );
    }

    #[test]
    fn test_multi_wildcard_grant_authorizes_subtree() {
        let ks = keystore();
        let granted = topic("teams.alpha...");
        let key = ks
            .generate(7, &granted, Permissions::READ, None, NOW)
            .unwrap();

        let deeper = topic("teams.alpha.ch1.u1");
        assert!(ks
            .validate(key.as_bytes(), &deeper, Permissions::READ, NOW)
            .is_ok());

        let equal = topic("teams.alpha...");
        assert!(ks
            .validate(key.as_bytes(), &equal, Permissions::READ, NOW)
            .is_ok());

        // `...` matches zero parts too.
        let root = topic("teams.alpha");
        assert!(ks
            .validate(key.as_bytes(), &root, Permissions::READ, NOW)
            .is_ok());

        let outside = topic("teams.beta.ch1");
        assert_eq!(
            ks.validate(key.as_bytes(), &outside, Permissions::READ, NOW),
            Err(KeyError::TopicMismatch)
        );
    }

    #[test]
    fn test_narrow_grant_rejects_wildcard_presentation() {
        let ks = keystore();
        let granted = topic("teams.alpha.ch1");
        let key = ks
            .generate(7, &granted, Permissions::READ, None, NOW)
            .unwrap();

        // Subscribing to the whole subtree with a key for one topic.
        let broad = topic("teams.alpha...");
        assert_eq!(
            ks.validate(key.as_bytes(), &broad, Permissions::READ, NOW),
            Err(KeyError::TopicMismatch)
        );

        let starred = topic("teams.*.ch1");
        assert_eq!(
            ks.validate(key.as_bytes(), &starred, Permissions::READ, NOW),
            Err(KeyError::TopicMismatch)
        );
    }

    #[test]
    fn test_deep_grant_rejects_shallow_presentation() {
        let ks = keystore();
        let granted = topic("teams.alpha.ch1");
        let key = ks
            .generate(7, &granted, Permissions::READ, None, NOW)
            .unwrap();
        assert_eq!(
            ks.validate(key.as_bytes(), &topic("teams.alpha"), Permissions::READ, NOW),
            Err(KeyError::TopicMismatch)
        );
    }

    #[test]
    fn test_missing_permission_rejected() {
        let ks = keystore();
        let t = topic("teams.alpha");
        let key = ks.generate(7, &t, Permissions::READ, None, NOW).unwrap();
        assert_eq!(
            ks.validate(key.as_bytes(), &t, Permissions::WRITE, NOW),
            Err(KeyError::Forbidden)
        );
    }

    #[test]
    fn test_expired_key_rejected() {
        let ks = keystore();
        let t = topic("teams.alpha");
        let key = ks
            .generate(7, &t, Permissions::READ, Some(NOW + 60), NOW)
            .unwrap();
        assert!(ks
            .validate(key.as_bytes(), &t, Permissions::READ, NOW + 59)
            .is_ok());
        assert_eq!(
            ks.validate(key.as_bytes(), &t, Permissions::READ, NOW + 61),
            Err(KeyError::Expired)
        );
    }

    #[test]
    fn test_tampered_token_rejected() {
        let ks = keystore();
        let t = topic("teams.alpha");
        let key = ks.generate(7, &t, Permissions::READ, None, NOW).unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(&key).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(
            ks.validate(tampered.as_bytes(), &t, Permissions::READ, NOW),
            Err(KeyError::BadMac)
        );
    }

    #[test]
    fn test_garbage_token_rejected() {
        let ks = keystore();
        let t = topic("teams.alpha");
        assert_eq!(
            ks.validate(b"not a key", &t, Permissions::READ, NOW),
            Err(KeyError::BadFormat)
        );
        assert_eq!(
            ks.validate(b"", &t, Permissions::READ, NOW),
            Err(KeyError::BadFormat)
        );
    }

    #[test]
    fn test_wrong_master_key_rejected() {
        let ks = keystore();
        let t = topic("teams.alpha");
        let key = ks.generate(7, &t, Permissions::READ, None, NOW).unwrap();

        let other = KeyStore::new(b"another very very secret key pad", SALT);
        assert_eq!(
            other.validate(key.as_bytes(), &t, Permissions::READ, NOW),
            Err(KeyError::BadMac)
        );
    }
}
