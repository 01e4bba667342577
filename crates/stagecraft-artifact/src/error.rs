//! Error types for artifact resolution.

use thiserror::Error;

use stagecraft_core::DigestError;

/// The image could not be built. Terminal for the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("image build failed: {0}")]
pub struct BuildFailure(pub String);

/// Registry failures, split by whether a retry can help.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("transient registry error: {0}")]
    Transient(String),

    #[error("registry error: {0}")]
    Permanent(String),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Build(#[from] BuildFailure),

    #[error("push failed after {attempts} attempt(s): {source}")]
    Push { attempts: u32, source: RegistryError },

    #[error("digest not available after {attempts} attempt(s)")]
    DigestResolutionTimeout { attempts: u32 },

    #[error("digest lookup failed: {0}")]
    DigestLookup(RegistryError),

    #[error("registry reported an invalid digest: {0}")]
    InvalidDigest(#[from] DigestError),
}
