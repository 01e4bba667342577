//! stagecraft-artifact — turns a source revision into an immutable
//! `ArtifactReference`.
//!
//! ```text
//! SourceRevision
//!   └── ImageBuilder::build()        never retried
//!         └── Registry::push()        transient errors retried with backoff
//!               └── Registry::resolve_digest()   per-lookup timeout, retried
//!                     └── ArtifactReference { registry_location, content_digest }
//! ```
//!
//! A reference is only produced once the digest is known, so nothing
//! downstream ever points at a mutable tag.

pub mod docker;
pub mod error;
pub mod resolver;
pub mod retry;

pub use docker::DockerCli;
pub use error::{BuildFailure, RegistryError, ResolveError};
pub use resolver::{ArtifactResolver, ImageBuilder, LocalImage, PushReceipt, Registry, ResolveArtifact};
pub use retry::RetryPolicy;
