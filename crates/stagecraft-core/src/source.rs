//! Source revisions: what a source-control trigger hands the orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("invalid source revision (expected `repository#branch@revision`): {0}")]
    InvalidRevision(String),
}

/// A single commit on a branch of a repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceRevision {
    pub repository: String,
    pub branch: String,
    pub revision_id: String,
}

impl SourceRevision {
    pub fn new(
        repository: impl Into<String>,
        branch: impl Into<String>,
        revision_id: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            revision_id: revision_id.into(),
        }
    }

    /// Parse `org/repo#main@3f2c1a`.
    pub fn parse(s: &str) -> Result<Self, SourceError> {
        let invalid = || SourceError::InvalidRevision(s.to_string());
        let (repository, rest) = s.split_once('#').ok_or_else(invalid)?;
        let (branch, revision_id) = rest.rsplit_once('@').ok_or_else(invalid)?;
        if repository.is_empty() || branch.is_empty() || revision_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(repository, branch, revision_id))
    }

    /// Whether this revision belongs to the watched repository and branch.
    pub fn matches(&self, repository: &str, branch: &str) -> bool {
        self.repository == repository && self.branch == branch
    }
}

impl fmt::Display for SourceRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.repository, self.branch, self.revision_id)
    }
}
