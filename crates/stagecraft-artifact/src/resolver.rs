//! Build → push → resolve digest.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use stagecraft_core::{ArtifactReference, ContentDigest, SourceRevision};

use crate::error::{BuildFailure, RegistryError, ResolveError};
use crate::retry::RetryPolicy;

/// An image built locally and tagged for the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    /// `location:tag`.
    pub tag: String,
}

/// Proof that an image was pushed. Carries no digest yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub tag: String,
}

pub trait ImageBuilder: Send + Sync {
    fn build(&self, source: &SourceRevision) -> impl Future<Output = Result<LocalImage, BuildFailure>> + Send;
}

pub trait Registry: Send + Sync {
    /// Registry location images are pushed to.
    fn location(&self) -> &str;

    fn push(&self, image: &LocalImage) -> impl Future<Output = Result<PushReceipt, RegistryError>> + Send;

    /// The digest the registry assigned to a pushed image, as reported
    /// (e.g. `sha256:…`). Validated by the caller.
    fn resolve_digest(
        &self,
        receipt: &PushReceipt,
    ) -> impl Future<Output = Result<String, RegistryError>> + Send;
}

/// Anything that can produce the run's artifact.
pub trait ResolveArtifact: Send + Sync {
    fn resolve(
        &self,
        source: &SourceRevision,
    ) -> impl Future<Output = Result<ArtifactReference, ResolveError>> + Send;
}

pub struct ArtifactResolver<B, R> {
    builder: B,
    registry: R,
    retry: RetryPolicy,
    /// Upper bound on a single digest lookup.
    lookup_timeout: Duration,
}

impl<B: ImageBuilder, R: Registry> ArtifactResolver<B, R> {
    pub fn new(builder: B, registry: R) -> Self {
        Self {
            builder,
            registry,
            retry: RetryPolicy::default(),
            lookup_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    async fn push(&self, image: &LocalImage) -> Result<PushReceipt, ResolveError> {
        self.retry
            .run("push", |_| self.registry.push(image))
            .await
            .map_err(|(attempts, source)| ResolveError::Push { attempts, source })
    }

    async fn lookup(&self, receipt: &PushReceipt) -> Result<ContentDigest, ResolveError> {
        let timeout = self.lookup_timeout;
        let raw = self
            .retry
            .run("resolve_digest", |_| async move {
                match tokio::time::timeout(timeout, self.registry.resolve_digest(receipt)).await {
                    Ok(result) => result,
                    Err(_) => Err(RegistryError::Transient(format!(
                        "digest lookup exceeded {}ms",
                        timeout.as_millis()
                    ))),
                }
            })
            .await
            .map_err(|(attempts, e)| {
                if e.is_transient() {
                    ResolveError::DigestResolutionTimeout { attempts }
                } else {
                    ResolveError::DigestLookup(e)
                }
            })?;

        Ok(ContentDigest::parse(&raw)?)
    }
}

impl<B: ImageBuilder, R: Registry> ResolveArtifact for ArtifactResolver<B, R> {
    async fn resolve(&self, source: &SourceRevision) -> Result<ArtifactReference, ResolveError> {
        info!(%source, "building image");
        let image = self.builder.build(source).await.inspect_err(|e| {
            warn!(%source, error = %e, "build failed");
        })?;

        let receipt = self.push(&image).await?;
        info!(tag = %receipt.tag, "image pushed");

        let digest = self.lookup(&receipt).await?;
        info!(tag = %receipt.tag, %digest, "digest resolved");

        Ok(ArtifactReference::new(self.registry.location(), digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeBuilder {
        fail: bool,
        builds: AtomicU32,
    }

    impl ImageBuilder for FakeBuilder {
        async fn build(&self, source: &SourceRevision) -> Result<LocalImage, BuildFailure> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BuildFailure("dockerfile syntax".into()));
            }
            Ok(LocalImage {
                tag: format!("repo/app:{}", source.revision_id),
            })
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        push_results: Mutex<VecDeque<Result<(), RegistryError>>>,
        digest_results: Mutex<VecDeque<Result<String, RegistryError>>>,
        lookup_delay: Option<Duration>,
        pushes: AtomicU32,
        lookups: AtomicU32,
    }

    impl Registry for FakeRegistry {
        fn location(&self) -> &str {
            "repo/app"
        }

        async fn push(&self, image: &LocalImage) -> Result<PushReceipt, RegistryError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            let next = self.push_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
            next.map(|_| PushReceipt {
                tag: image.tag.clone(),
            })
        }

        async fn resolve_digest(&self, _receipt: &PushReceipt) -> Result<String, RegistryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.lookup_delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.digest_results.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok("sha256:abc123".to_string()))
        }
    }

    fn source() -> SourceRevision {
        SourceRevision::new("org/app", "main", "3f2c1a")
    }

    fn resolver(builder: FakeBuilder, registry: FakeRegistry) -> ArtifactResolver<FakeBuilder, FakeRegistry> {
        ArtifactResolver::new(builder, registry).with_retry(RetryPolicy::immediate(5))
    }

    #[tokio::test]
    async fn resolves_reference_by_digest() {
        let r = resolver(FakeBuilder::default(), FakeRegistry::default());
        let reference = r.resolve(&source()).await.unwrap();
        assert_eq!(reference.registry_location, "repo/app");
        assert_eq!(reference.content_digest.as_str(), "sha256:abc123");
    }

    #[tokio::test]
    async fn build_failure_is_not_retried() {
        let builder = FakeBuilder {
            fail: true,
            ..FakeBuilder::default()
        };
        let r = resolver(builder, FakeRegistry::default());
        let err = r.resolve(&source()).await.unwrap_err();

        assert!(matches!(err, ResolveError::Build(_)));
        assert_eq!(r.builder().builds.load(Ordering::SeqCst), 1);
        assert_eq!(r.registry().pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_push_errors_are_retried() {
        let registry = FakeRegistry::default();
        registry.push_results.lock().unwrap().extend([
            Err(RegistryError::Transient("503".into())),
            Err(RegistryError::Transient("503".into())),
        ]);
        let r = resolver(FakeBuilder::default(), registry);

        assert!(r.resolve(&source()).await.is_ok());
        assert_eq!(r.registry().pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_push_error_fails_once() {
        let registry = FakeRegistry::default();
        registry
            .push_results
            .lock()
            .unwrap()
            .push_back(Err(RegistryError::Permanent("denied".into())));
        let r = resolver(FakeBuilder::default(), registry);

        let err = r.resolve(&source()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Push { attempts: 1, .. }));
        assert_eq!(r.registry().lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_digest_times_out() {
        let registry = FakeRegistry::default();
        registry
            .digest_results
            .lock()
            .unwrap()
            .extend((0..5).map(|_| Err(RegistryError::Transient("not yet".into()))));
        let r = resolver(FakeBuilder::default(), registry);

        let err = r.resolve(&source()).await.unwrap_err();
        assert!(matches!(err, ResolveError::DigestResolutionTimeout { attempts: 5 }));
    }

    #[tokio::test]
    async fn slow_lookup_counts_as_timeout() {
        let registry = FakeRegistry {
            lookup_delay: Some(Duration::from_millis(200)),
            ..FakeRegistry::default()
        };
        let r = ArtifactResolver::new(FakeBuilder::default(), registry)
            .with_retry(RetryPolicy::immediate(2))
            .with_lookup_timeout(Duration::from_millis(10));

        let err = r.resolve(&source()).await.unwrap_err();
        assert!(matches!(err, ResolveError::DigestResolutionTimeout { attempts: 2 }));
        assert_eq!(r.registry().lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_digest_is_rejected() {
        let registry = FakeRegistry::default();
        registry
            .digest_results
            .lock()
            .unwrap()
            .push_back(Ok("latest".to_string()));
        let r = resolver(FakeBuilder::default(), registry);

        let err = r.resolve(&source()).await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidDigest(_)));
    }
}
