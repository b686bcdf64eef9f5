// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

use crate::security::KeyError;
use crate::topic::TopicError;

/// Represent the types of errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error occurred while performing I/O.
    IoError,

    /// Packet encode error.
    EncodeError,

    /// Packet decode error.
    DecodeError,

    /// Send packet error.
    SendError,

    /// Invalid config file entry.
    ConfigError,

    /// Socket stream error.
    SocketError,

    /// Connection with id not found in cache.
    ConnectionNotFound,

    /// mpsc channel error.
    ChannelError,

    /// Cluster peer is gone or was never reachable.
    ClusterError,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub const fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("IoError {err}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("{err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("{err:?}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("Json error: {err}"))
    }
}

/// Error codes surfaced to clients on the `trace/error/` topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReasonCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    TopicInvalid,
    KeyInvalid,
    KeyExpired,
    RateLimited,
    Internal,
}

impl ReasonCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BadRequest",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::TopicInvalid => "TopicInvalid",
            Self::KeyInvalid => "KeyInvalid",
            Self::KeyExpired => "KeyExpired",
            Self::RateLimited => "RateLimited",
            Self::Internal => "Internal",
        }
    }
}

impl From<TopicError> for ReasonCode {
    fn from(_err: TopicError) -> Self {
        Self::TopicInvalid
    }
}

impl From<KeyError> for ReasonCode {
    fn from(err: KeyError) -> Self {
        match err {
            // A key presented with the wrong topic is as useless as a forged
            // one; both surface as KeyInvalid.
            KeyError::BadFormat | KeyError::BadMac | KeyError::TopicMismatch => Self::KeyInvalid,
            KeyError::Expired => Self::KeyExpired,
            KeyError::Forbidden => Self::Forbidden,
        }
    }
}

/// A request rejection delivered back to the offending client.
#[derive(Clone, Debug)]
pub struct Rejection {
    pub code: ReasonCode,
    pub message: String,
}

impl Rejection {
    #[must_use]
    pub fn new(code: ReasonCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_owned(),
        }
    }
}

impl From<TopicError> for Rejection {
    fn from(err: TopicError) -> Self {
        Self {
            code: ReasonCode::TopicInvalid,
            message: format!("Invalid topic: {err:?}"),
        }
    }
}

impl From<KeyError> for Rejection {
    fn from(err: KeyError) -> Self {
        let code: ReasonCode = err.into();
        Self {
            code,
            message: format!("Key rejected: {err:?}"),
        }
    }
}
