//! Content-addressed artifact references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest is missing an algorithm prefix: {0}")]
    MissingAlgorithm(String),
    #[error("digest has an empty payload: {0}")]
    EmptyPayload(String),
    #[error("digest payload is not lowercase hex: {0}")]
    NotHex(String),
}

/// An image content digest such as `sha256:9f86d08…`.
///
/// The digest is the identity of a build: two references with the same
/// digest are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let s = s.trim();
        let (algorithm, payload) = s
            .split_once(':')
            .ok_or_else(|| DigestError::MissingAlgorithm(s.to_string()))?;
        if algorithm.is_empty() || !algorithm.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DigestError::MissingAlgorithm(s.to_string()));
        }
        if payload.is_empty() {
            return Err(DigestError::EmptyPayload(s.to_string()));
        }
        if !payload.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(DigestError::NotHex(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContentDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pushed image, identified by its registry location and digest.
#[derive(Debug, Clone, Serialize, Deserialize, Eq)]
pub struct ArtifactReference {
    /// Repository the image was pushed to, without tag or digest.
    pub registry_location: String,
    pub content_digest: ContentDigest,
}

impl ArtifactReference {
    pub fn new(registry_location: impl Into<String>, content_digest: ContentDigest) -> Self {
        Self {
            registry_location: registry_location.into(),
            content_digest,
        }
    }

    /// Pull-by-digest reference: `repo@sha256:…`.
    pub fn pull_ref(&self) -> String {
        format!("{}@{}", self.registry_location, self.content_digest)
    }
}

// Identity is the digest alone.
impl PartialEq for ArtifactReference {
    fn eq(&self, other: &Self) -> bool {
        self.content_digest == other.content_digest
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pull_ref())
    }
}
