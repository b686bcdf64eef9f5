// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic strings and their parsed form.
//!
//! A topic on the wire looks like `<key>/<dotted.topic>`. The key is an
//! access token validated by the security module; the dotted remainder is
//! split on `.` into parts. `*` matches exactly one part, a trailing `...`
//! matches zero or more parts. Parts are indexed by their salted hash.

use crate::hash;

/// Matches exactly one part at its position.
pub const SINGLE_WILDCARD: &str = "*";

/// Matches zero or more trailing parts; only valid as the final segment.
pub const MULTI_WILDCARD: &str = "...";

/// Maximum number of parts in a topic.
pub const MAX_DEPTH: usize = 64;

/// Clients request client ids on this topic.
pub const CLIENTID_TOPIC: &str = "unitd/clientid";

/// Clients request topic access keys on this topic.
pub const KEYGEN_TOPIC: &str = "unitd/keygen";

/// Presence events for a topic.
pub const PRESENCE_TOPIC: &str = "unitd/presence";

/// Server-minted client ids are delivered on this topic.
pub const CLIENT_IDENTIFIER_TOPIC: &str = "$SYS/client_identifier/";

/// Server-originated error notifications.
pub const ERROR_TOPIC: &str = "trace/error/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Topic has no parts at all.
    Empty,

    /// A part between separators is empty.
    EmptyPart,

    /// `...` may only appear as the final segment.
    MultiWildcardPosition,

    /// More than [`MAX_DEPTH`] parts.
    TooDeep,
}

/// One `.`-separated segment in parsed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    /// Salted hash of a literal segment.
    Literal(u32),

    /// `*`
    SingleWildcard,

    /// Trailing `...`
    MultiWildcard,
}

/// A parsed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    key: Vec<u8>,
    parts: Vec<Part>,
    depth: u8,
    has_trailing_multi: bool,
}

impl Topic {
    /// Parse a topic string, optionally prefixed with `key/`.
    ///
    /// The key is captured verbatim; it is not hashed or validated here.
    ///
    /// # Errors
    ///
    /// Returns error if the dotted remainder violates the wildcard rules.
    pub fn parse(s: &str, salt: u32) -> Result<Self, TopicError> {
        let (key, dotted) = match s.split_once('/') {
            Some((key, rest)) => (key.as_bytes().to_vec(), rest),
            None => (Vec::new(), s),
        };

        if dotted.is_empty() {
            return Err(TopicError::Empty);
        }

        if dotted.contains(MULTI_WILDCARD) && !dotted.ends_with(MULTI_WILDCARD) {
            return Err(TopicError::MultiWildcardPosition);
        }

        let (stem, has_trailing_multi) = if dotted == MULTI_WILDCARD {
            ("", true)
        } else if let Some(stem) = dotted.strip_suffix(MULTI_WILDCARD) {
            // "a.b..." strips to "a.b"; four or more dots leave a dangling
            // separator, which is a misplaced wildcard.
            if stem.ends_with('.') {
                return Err(TopicError::MultiWildcardPosition);
            }
            (stem, true)
        } else {
            (dotted, false)
        };

        let mut parts = Vec::new();
        if !stem.is_empty() {
            for raw in stem.split('.') {
                match raw {
                    "" => return Err(TopicError::EmptyPart),
                    SINGLE_WILDCARD => parts.push(Part::SingleWildcard),
                    literal => parts.push(Part::Literal(hash::salted(literal.as_bytes(), salt))),
                }
            }
        }

        if parts.len() + usize::from(has_trailing_multi) > MAX_DEPTH {
            return Err(TopicError::TooDeep);
        }

        #[allow(clippy::cast_possible_truncation)]
        let depth = parts.len() as u8;
        if has_trailing_multi {
            parts.push(Part::MultiWildcard);
        }

        Ok(Self {
            key,
            parts,
            depth,
            has_trailing_multi,
        })
    }

    /// The verbatim access key, empty when no `key/` prefix was present.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Count of literal and single-wildcard parts; a trailing `...` does not
    /// increment depth.
    #[must_use]
    pub const fn depth(&self) -> u8 {
        self.depth
    }

    #[must_use]
    pub const fn has_trailing_multi(&self) -> bool {
        self.has_trailing_multi
    }

    /// True if the topic contains no wildcards, as required for publishing.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Serialize parts into the bytes used as a subscription-counter map key.
    #[must_use]
    pub fn counter_key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.parts.len() * 5);
        for part in &self.parts {
            match part {
                Part::Literal(h) => {
                    out.push(0);
                    out.extend_from_slice(&h.to_be_bytes());
                }
                Part::SingleWildcard => out.push(1),
                Part::MultiWildcard => out.push(2),
            }
        }
        out
    }
}

/// Identities of the fixed system topics under a given salt.
#[derive(Debug, Clone, Copy)]
pub struct SystemTopics {
    clientid: u32,
    keygen: u32,
    presence: u32,
}

/// A request topic that bypasses key authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTopic {
    ClientId,
    KeyGen,
    Presence,
}

impl SystemTopics {
    #[must_use]
    pub fn new(salt: u32) -> Self {
        Self {
            clientid: hash::salted(CLIENTID_TOPIC.as_bytes(), salt),
            keygen: hash::salted(KEYGEN_TOPIC.as_bytes(), salt),
            presence: hash::salted(PRESENCE_TOPIC.as_bytes(), salt),
        }
    }

    /// Classify a raw topic name, comparing by salted hash.
    #[must_use]
    pub fn classify(&self, name: &str, salt: u32) -> Option<SystemTopic> {
        let h = hash::salted(name.as_bytes(), salt);
        if h == self.clientid {
            Some(SystemTopic::ClientId)
        } else if h == self.keygen {
            Some(SystemTopic::KeyGen)
        } else if h == self.presence {
            Some(SystemTopic::Presence)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: u32 = 0x5eed;

    #[test]
    fn test_parse_plain_topic() {
        let topic = Topic::parse("teams.alpha.ch1.u1", SALT).unwrap();
        assert!(topic.key().is_empty());
        assert_eq!(topic.depth(), 4);
        assert!(!topic.has_trailing_multi());
        assert!(topic.is_concrete());
        assert_eq!(
            topic.parts()[0],
            Part::Literal(hash::salted(b"teams", SALT))
        );
    }

    #[test]
    fn test_parse_key_prefix() {
        let topic = Topic::parse("AbC123/teams.alpha", SALT).unwrap();
        assert_eq!(topic.key(), b"AbC123");
        assert_eq!(topic.depth(), 2);
    }

    #[test]
    fn test_parse_single_wildcard() {
        let topic = Topic::parse("teams.*.ch1", SALT).unwrap();
        assert_eq!(topic.parts()[1], Part::SingleWildcard);
        assert_eq!(topic.depth(), 3);
        assert!(!topic.is_concrete());
    }

    #[test]
    fn test_parse_trailing_multi() {
        let topic = Topic::parse("teams.alpha...", SALT).unwrap();
        assert!(topic.has_trailing_multi());
        assert_eq!(topic.depth(), 2);
        assert_eq!(topic.parts().len(), 3);
        assert_eq!(topic.parts()[2], Part::MultiWildcard);
    }

    #[test]
    fn test_parse_multi_only() {
        let topic = Topic::parse("...", SALT).unwrap();
        assert!(topic.has_trailing_multi());
        assert_eq!(topic.depth(), 0);
    }

    #[test]
    fn test_parse_multi_not_last_rejected() {
        assert!(Topic::parse("teams...alpha", SALT).is_err());
        assert!(Topic::parse("teams....", SALT).is_err());
    }

    #[test]
    fn test_parse_empty_part_rejected() {
        assert_eq!(Topic::parse("teams..alpha", SALT), Err(TopicError::EmptyPart));
        assert_eq!(Topic::parse("", SALT), Err(TopicError::Empty));
        assert_eq!(Topic::parse("key/", SALT), Err(TopicError::Empty));
    }

    #[test]
    fn test_parse_too_deep_rejected() {
        let deep = vec!["p"; MAX_DEPTH + 1].join(".");
        assert_eq!(Topic::parse(&deep, SALT), Err(TopicError::TooDeep));
    }

    #[test]
    fn test_counter_key_distinguishes_patterns() {
        let a = Topic::parse("teams.alpha", SALT).unwrap();
        let b = Topic::parse("teams.*", SALT).unwrap();
        let c = Topic::parse("teams...", SALT).unwrap();
        assert_ne!(a.counter_key(), b.counter_key());
        assert_ne!(b.counter_key(), c.counter_key());
    }

    #[test]
    fn test_system_topics_classify() {
        let sys = SystemTopics::new(SALT);
        assert_eq!(
            sys.classify("unitd/keygen", SALT),
            Some(SystemTopic::KeyGen)
        );
        assert_eq!(
            sys.classify("unitd/clientid", SALT),
            Some(SystemTopic::ClientId)
        );
        assert_eq!(
            sys.classify("unitd/presence", SALT),
            Some(SystemTopic::Presence)
        );
        assert_eq!(sys.classify("teams.alpha", SALT), None);
    }
}
