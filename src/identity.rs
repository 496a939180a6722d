//! Handshake username parsing.
//!
//! Clients name the instance they want in the SSH username:
//! `<realm>:<target>/<index>`, e.g. `diego:my-proc/0` or `cf:app-guid/3`.

use std::fmt;

use thiserror::Error;

/// Authentication scheme selected by the username prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Realm {
    /// Direct platform trust: the target is a placement process identifier.
    Platform,
    /// Access delegated to the authorization service with a bearer credential.
    Delegated,
}

impl Realm {
    pub const PLATFORM_TOKEN: &'static str = "diego";
    pub const DELEGATED_TOKEN: &'static str = "cf";

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            Self::PLATFORM_TOKEN => Some(Realm::Platform),
            Self::DELEGATED_TOKEN => Some(Realm::Delegated),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Realm::Platform => Self::PLATFORM_TOKEN,
            Realm::Delegated => Self::DELEGATED_TOKEN,
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing realm delimiter ':' in {0:?}")]
    MissingRealm(String),
    #[error("unknown realm {0:?}")]
    UnknownRealm(String),
    #[error("missing index delimiter '/' in {0:?}")]
    MissingIndex(String),
    #[error("empty target in {0:?}")]
    EmptyTarget(String),
    #[error("invalid instance index {0:?}")]
    InvalidIndex(String),
}

/// The instance a client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub realm: Realm,
    pub target: String,
    pub index: u32,
}

impl Identity {
    /// Parse a handshake username.
    pub fn parse(username: &str) -> Result<Self, IdentityError> {
        let (realm, rest) = username
            .split_once(':')
            .ok_or_else(|| IdentityError::MissingRealm(username.to_string()))?;

        let realm =
            Realm::from_token(realm).ok_or_else(|| IdentityError::UnknownRealm(realm.to_string()))?;

        let (target, index) = rest
            .rsplit_once('/')
            .ok_or_else(|| IdentityError::MissingIndex(username.to_string()))?;

        if target.is_empty() {
            return Err(IdentityError::EmptyTarget(username.to_string()));
        }

        // u32::from_str accepts a leading '+', so check the digits ourselves.
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdentityError::InvalidIndex(index.to_string()));
        }
        let index = index
            .parse::<u32>()
            .map_err(|_| IdentityError::InvalidIndex(index.to_string()))?;

        Ok(Self {
            realm,
            target: target.to_string(),
            index,
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.realm, self.target, self.index)
    }
}
