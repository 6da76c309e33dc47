//! The provider capability contract and adapter factory.

use crate::error::{ConfigError, ProviderError};
use crate::packet::{ArtifactBundle, TaskPacket};
use crate::provider::{CliAdapter, HttpAdapter, ProviderDescriptor, ProviderKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Capability contract every execution backend sits behind.
///
/// The orchestration core only ever sees these three operations plus a
/// name; everything else about a backend is opaque.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Execute the task against the backend. Blocks (suspends) for the
    /// duration of backend execution. Failures come back classified as
    /// [`ProviderError`] variants, never as bare strings.
    async fn generate(
        &self,
        packet: &TaskPacket,
        guidance: &[String],
    ) -> Result<ArtifactBundle, ProviderError>;

    /// Lightweight pre-dispatch probe. Must not count as a task attempt and
    /// must not mutate any routing state.
    async fn is_available(&self) -> bool;

    /// Classify an error raised by `generate`: `true` means provider-level
    /// failure (rate limit or equivalent), `false` means the work itself
    /// failed. Strategy varies per backend kind.
    fn detect_rate_limit(&self, err: &ProviderError) -> bool;

    fn name(&self) -> &str;
}

/// Build the adapter matching a descriptor's backend kind.
pub fn build_adapter(
    descriptor: &ProviderDescriptor,
) -> Result<Arc<dyn ProviderAdapter>, ConfigError> {
    match descriptor.kind {
        ProviderKind::Cli => Ok(Arc::new(CliAdapter::new(descriptor)?)),
        ProviderKind::Api | ProviderKind::Local => Ok(Arc::new(HttpAdapter::new(descriptor)?)),
    }
}
