//! Registration response codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a listener registration, as reported by the relay.
///
/// Codes travel as their ordinal. The ordinals are part of the wire contract
/// and must never be renumbered. Ordinals outside the known range are kept as
/// [`ResponseCode::Unknown`] so a newer relay cannot break decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ResponseCode {
    Ok,
    BadRequest,
    NotFound,
    Unauthorized,
    ServerError,
    /// An ordinal this version does not know about.
    Unknown(u32),
}

impl ResponseCode {
    /// Returns the wire ordinal of this code.
    #[must_use]
    pub fn ordinal(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::BadRequest => 1,
            Self::NotFound => 2,
            Self::Unauthorized => 3,
            Self::ServerError => 4,
            Self::Unknown(n) => n,
        }
    }

    /// Returns `true` for [`ResponseCode::Ok`].
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl From<u32> for ResponseCode {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::BadRequest,
            2 => Self::NotFound,
            3 => Self::Unauthorized,
            4 => Self::ServerError,
            n => Self::Unknown(n),
        }
    }
}

impl From<ResponseCode> for u32 {
    fn from(code: ResponseCode) -> Self {
        code.ordinal()
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::BadRequest => f.write_str("BadRequest"),
            Self::NotFound => f.write_str("NotFound"),
            Self::Unauthorized => f.write_str("Unauthorized"),
            Self::ServerError => f.write_str("ServerError"),
            Self::Unknown(n) => write!(f, "ResponseCode({n})"),
        }
    }
}
