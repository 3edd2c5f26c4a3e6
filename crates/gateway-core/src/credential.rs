//! API-key credential structure.
//!
//! Keys look like `gwo_prd_<hex secret>`: a configurable prefix, a three
//! letter environment tag and a hex secret of at least 32 characters. The
//! whole key is at least [`MIN_KEY_LEN`] characters long. Structural checks
//! here run before any store lookup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Minimum total key length.
pub const MIN_KEY_LEN: usize = 40;

/// Minimum number of hex characters in the secret part.
pub const MIN_SECRET_LEN: usize = 32;

/// Marker used in place of the environment tag for session bearer tokens.
pub const SESSION_MARKER: &str = "session";

/// Deployment environment encoded in a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEnvironment {
    /// Development
    Dev,
    /// Staging
    Stg,
    /// Production
    Prd,
}

impl KeyEnvironment {
    /// Three-letter tag as it appears in the key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Stg => "stg",
            Self::Prd => "prd",
        }
    }
}

impl fmt::Display for KeyEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyEnvironment {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "stg" => Ok(Self::Stg),
            "prd" => Ok(Self::Prd),
            other => Err(CredentialError::UnknownEnvironment(other.to_string())),
        }
    }
}

/// Why a presented credential was rejected structurally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Shorter than [`MIN_KEY_LEN`].
    TooShort,
    /// Not of the form `<prefix>_<env>_<secret>`.
    Malformed,
    /// Prefix differs from the configured one.
    WrongPrefix,
    /// Environment tag is not dev, stg or prd.
    UnknownEnvironment(String),
    /// Secret is too short or not hex.
    BadSecret,
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "key is shorter than {MIN_KEY_LEN} characters"),
            Self::Malformed => f.write_str("key is not of the form <prefix>_<env>_<secret>"),
            Self::WrongPrefix => f.write_str("key prefix is not recognized"),
            Self::UnknownEnvironment(env) => write!(f, "unknown key environment '{env}'"),
            Self::BadSecret => f.write_str("key secret must be hex"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Borrowed view of a structurally valid API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiKeyParts<'a> {
    /// Key prefix, e.g. `gwo`
    pub prefix: &'a str,
    /// Environment tag
    pub environment: KeyEnvironment,
    /// Hex secret
    pub secret: &'a str,
}

impl<'a> ApiKeyParts<'a> {
    /// Parse and validate `key` against the expected `prefix`.
    pub fn parse(key: &'a str, prefix: &str) -> Result<Self, CredentialError> {
        if key.len() < MIN_KEY_LEN {
            return Err(CredentialError::TooShort);
        }
        let mut parts = key.splitn(3, '_');
        let (Some(p), Some(env), Some(secret)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CredentialError::Malformed);
        };
        if p != prefix {
            return Err(CredentialError::WrongPrefix);
        }
        let environment = env.parse()?;
        if secret.len() < MIN_SECRET_LEN || !secret.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CredentialError::BadSecret);
        }
        Ok(Self {
            prefix: p,
            environment,
            secret,
        })
    }
}

/// Extract the session id from a `<prefix>_session_<id>` bearer token.
#[must_use]
pub fn session_id<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = token.strip_prefix(prefix)?.strip_prefix('_')?;
    let id = rest.strip_prefix(SESSION_MARKER)?.strip_prefix('_')?;
    (!id.is_empty()).then_some(id)
}
