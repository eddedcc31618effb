//! Repository contract over persistence and the cloud provider

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labhub_api::{Server, ServerPolicy};
use labhub_provider::{ContainerGroupDescriptor, ContainerProvider};
use labhub_store::{AuditEvent, AuditEventType, ServerStore};
use labhub_util::{Result, UserPrincipalName};
use std::sync::Arc;
use tracing::warn;

/// Everything the lifecycle service and the monitor need from the outside
/// world. Implementations serialize conflicting writes; callers take no locks.
#[async_trait]
pub trait ServerRepository: Send + Sync {
    /// Point-in-time snapshot of every record
    async fn get_all_servers(&self) -> Result<Vec<Server>>;

    async fn get_server(&self, user_principal_name: &UserPrincipalName) -> Result<Option<Server>>;

    /// Idempotent write keyed by the owner's principal name
    async fn upsert_server(&self, server: &Server) -> Result<()>;

    /// Policy-only write; never touches status or activity.
    /// `None` when the principal has no record.
    async fn update_policy(
        &self,
        user_principal_name: &UserPrincipalName,
        policy: ServerPolicy,
    ) -> Result<Option<Server>>;

    /// Forward-only heartbeat; `false` when the principal has no record
    async fn record_activity(
        &self,
        user_principal_name: &UserPrincipalName,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Live check against the running container group
    async fn ensure_server_idle(&self, server: &Server) -> Result<bool>;

    async fn deploy_container_group(&self, server: &Server) -> Result<()>;

    /// Safe to retry; succeeds when the group is already gone
    async fn destroy_container_group(&self, server: &Server) -> Result<()>;

    /// Best-effort audit trail
    fn append_audit(&self, event: AuditEventType);

    fn is_healthy(&self) -> bool;
}

/// Repository composed from a store and a provider
pub struct StoreRepository {
    store: Arc<dyn ServerStore>,
    provider: Arc<dyn ContainerProvider>,
}

impl StoreRepository {
    pub fn new(store: Arc<dyn ServerStore>, provider: Arc<dyn ContainerProvider>) -> Self {
        Self { store, provider }
    }
}

#[async_trait]
impl ServerRepository for StoreRepository {
    async fn get_all_servers(&self) -> Result<Vec<Server>> {
        Ok(self.store.get_all_servers()?)
    }

    async fn get_server(&self, user_principal_name: &UserPrincipalName) -> Result<Option<Server>> {
        Ok(self.store.get_server(user_principal_name)?)
    }

    async fn upsert_server(&self, server: &Server) -> Result<()> {
        Ok(self.store.upsert_server(server)?)
    }

    async fn update_policy(
        &self,
        user_principal_name: &UserPrincipalName,
        policy: ServerPolicy,
    ) -> Result<Option<Server>> {
        Ok(self.store.update_policy(user_principal_name, policy)?)
    }

    async fn record_activity(
        &self,
        user_principal_name: &UserPrincipalName,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.store.record_activity(user_principal_name, at)?)
    }

    async fn ensure_server_idle(&self, server: &Server) -> Result<bool> {
        let descriptor = ContainerGroupDescriptor::for_server(server);
        Ok(self.provider.is_idle(&descriptor).await?)
    }

    async fn deploy_container_group(&self, server: &Server) -> Result<()> {
        let descriptor = ContainerGroupDescriptor::for_server(server);
        Ok(self.provider.deploy(&descriptor).await?)
    }

    async fn destroy_container_group(&self, server: &Server) -> Result<()> {
        let descriptor = ContainerGroupDescriptor::for_server(server);
        Ok(self.provider.destroy(&descriptor).await?)
    }

    fn append_audit(&self, event: AuditEventType) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }

    fn is_healthy(&self) -> bool {
        self.store.is_healthy() && self.provider.is_healthy()
    }
}
