//! Provider traits

use async_trait::async_trait;
use labhub_util::LabError;
use thiserror::Error;

use crate::ContainerGroupDescriptor;

/// Errors from provider operations
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Deploy failed: {0}")]
    DeployFailed(String),

    #[error("Destroy failed: {0}")]
    DestroyFailed(String),

    #[error("Idle probe failed: {0}")]
    ProbeFailed(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl From<ProviderError> for LabError {
    fn from(e: ProviderError) -> Self {
        LabError::Provider(e.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Cloud provider hosting lab server container groups
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Create the container group, or make sure an existing one is running
    async fn deploy(&self, descriptor: &ContainerGroupDescriptor) -> ProviderResult<()>;

    /// Delete the container group. Succeeds if it is already gone.
    async fn destroy(&self, descriptor: &ContainerGroupDescriptor) -> ProviderResult<()>;

    /// Live probe for user sessions. An absent container group is idle.
    async fn is_idle(&self, descriptor: &ContainerGroupDescriptor) -> ProviderResult<bool>;

    /// Optional: check if the provider connection is healthy
    fn is_healthy(&self) -> bool {
        true
    }
}
