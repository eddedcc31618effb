//! User-driven lifecycle operations

use labhub_api::{Server, ServerPolicy, ServerStatus};
use labhub_store::AuditEventType;
use labhub_util::{LabError, Result, SubscriptionId, UserPrincipalId, UserPrincipalName};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::ServerRepository;

/// Enacts user intent against the repository.
///
/// Every operation is independent; concurrent calls for the same principal
/// rely on the repository to serialize their writes.
pub struct LifecycleService {
    repo: Arc<dyn ServerRepository>,
    defaults: ServerPolicy,
}

impl LifecycleService {
    pub fn new(repo: Arc<dyn ServerRepository>, defaults: ServerPolicy) -> Self {
        Self { repo, defaults }
    }

    pub fn repository(&self) -> &Arc<dyn ServerRepository> {
        &self.repo
    }

    /// Bind a subscription to a principal, creating the record if needed
    pub async fn register_subscription(
        &self,
        subscription_id: SubscriptionId,
        user_principal_name: UserPrincipalName,
        user_principal_id: UserPrincipalId,
    ) -> Result<Server> {
        if subscription_id.is_empty() {
            return Err(LabError::validation("subscription id must not be empty"));
        }

        let now = labhub_util::now();
        let server = match self.repo.get_server(&user_principal_name).await? {
            Some(mut existing) => {
                existing.subscription_id = subscription_id.clone();
                existing.user_principal_id = user_principal_id;
                existing
            }
            None => Server::register(
                subscription_id.clone(),
                user_principal_name.clone(),
                user_principal_id,
                self.defaults,
                now,
            ),
        };

        self.repo.upsert_server(&server).await?;
        self.repo.append_audit(AuditEventType::SubscriptionRegistered {
            user_principal_name: user_principal_name.clone(),
            subscription_id: subscription_id.clone(),
        });

        info!(
            user_principal_name = %user_principal_name,
            subscription_id = %subscription_id,
            "Subscription registered"
        );
        Ok(server)
    }

    pub async fn get_server(&self, user_principal_name: &UserPrincipalName) -> Result<Server> {
        self.repo
            .get_server(user_principal_name)
            .await?
            .ok_or_else(|| LabError::NotFound(user_principal_name.clone()))
    }

    /// Provision the container group and mark the record Running.
    ///
    /// A provider failure leaves the record Failed and is returned to the caller.
    pub async fn deploy_server(&self, requested: Server) -> Result<Server> {
        let now = labhub_util::now();
        let mut server = match self.repo.get_server(&requested.user_principal_name).await? {
            Some(existing) => existing,
            None => Server::register(
                requested.subscription_id.clone(),
                requested.user_principal_name.clone(),
                requested.user_principal_id.clone(),
                requested.policy(),
                now,
            ),
        };

        if !requested.subscription_id.is_empty() {
            server.subscription_id = requested.subscription_id.clone();
        }
        server.user_principal_id = requested.user_principal_id.clone();
        server.apply_policy(requested.policy());

        server.transition(ServerStatus::Deploying, now)?;
        self.repo.upsert_server(&server).await?;

        info!(
            user_principal_name = %server.user_principal_name,
            subscription_id = %server.subscription_id,
            "Deploying lab server"
        );

        if let Err(e) = self.repo.deploy_container_group(&server).await {
            warn!(
                user_principal_name = %server.user_principal_name,
                error = %e,
                "Container group deployment failed"
            );

            server.transition(ServerStatus::Failed, labhub_util::now())?;
            if let Err(persist_err) = self.repo.upsert_server(&server).await {
                error!(
                    user_principal_name = %server.user_principal_name,
                    error = %persist_err,
                    "Failed to record deployment failure"
                );
            }
            self.repo.append_audit(AuditEventType::DeployFailed {
                user_principal_name: server.user_principal_name.clone(),
                error: e.to_string(),
            });
            return Err(e);
        }

        let now = labhub_util::now();
        server.transition(ServerStatus::Running, now)?;
        server.touch_activity(now);
        self.repo.upsert_server(&server).await?;

        self.repo.append_audit(AuditEventType::ServerDeployed {
            user_principal_name: server.user_principal_name.clone(),
            subscription_id: server.subscription_id.clone(),
        });

        info!(
            user_principal_name = %server.user_principal_name,
            auto_destroy = server.auto_destroy,
            inactivity_duration_in_minutes = server.inactivity_duration_in_minutes,
            "Lab server running"
        );
        Ok(server)
    }

    /// Change the reclamation policy of an existing record.
    ///
    /// Only the policy columns are written, so a heartbeat landing meanwhile
    /// is kept.
    pub async fn update_server(&self, requested: Server) -> Result<Server> {
        let server = self
            .repo
            .update_policy(&requested.user_principal_name, requested.policy())
            .await?
            .ok_or_else(|| LabError::NotFound(requested.user_principal_name.clone()))?;

        self.repo.append_audit(AuditEventType::ServerUpdated {
            user_principal_name: server.user_principal_name.clone(),
            auto_destroy: server.auto_destroy,
            inactivity_duration_in_minutes: server.inactivity_duration_in_minutes,
        });

        info!(
            user_principal_name = %server.user_principal_name,
            auto_destroy = server.auto_destroy,
            inactivity_duration_in_minutes = server.inactivity_duration_in_minutes,
            "Lab server policy updated"
        );
        Ok(server)
    }

    /// Tear down the container group regardless of the auto-destroy policy.
    ///
    /// The record is only marked Destroyed once the provider confirms.
    pub async fn destroy_server(&self, user_principal_name: &UserPrincipalName) -> Result<Server> {
        let mut server = self.get_server(user_principal_name).await?;
        if server.status.is_destroyed() {
            debug!(user_principal_name = %user_principal_name, "Lab server already destroyed");
            return Ok(server);
        }
        server.transition(ServerStatus::Destroying, labhub_util::now())?;

        info!(user_principal_name = %user_principal_name, "Destroying lab server");

        if let Err(e) = self.repo.destroy_container_group(&server).await {
            warn!(
                user_principal_name = %user_principal_name,
                error = %e,
                "Container group teardown failed"
            );
            return Err(e);
        }

        server.transition(ServerStatus::Destroyed, labhub_util::now())?;
        self.repo.upsert_server(&server).await?;
        self.repo.append_audit(AuditEventType::ServerDestroyed {
            user_principal_name: user_principal_name.clone(),
        });

        info!(user_principal_name = %user_principal_name, "Lab server destroyed");
        Ok(server)
    }

    /// Heartbeat: advance the last activity time to now
    pub async fn update_activity_status(
        &self,
        user_principal_name: &UserPrincipalName,
    ) -> Result<()> {
        let now = labhub_util::now();
        if !self.repo.record_activity(user_principal_name, now).await? {
            return Err(LabError::NotFound(user_principal_name.clone()));
        }

        debug!(user_principal_name = %user_principal_name, "Activity recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreRepository;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use labhub_provider::{ContainerGroupDescriptor, SimulatedProvider};
    use labhub_store::{MemoryStore, ServerStore};

    struct Harness {
        service: LifecycleService,
        store: Arc<MemoryStore>,
        provider: Arc<SimulatedProvider>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(SimulatedProvider::new());
        let repo = Arc::new(StoreRepository::new(store.clone(), provider.clone()));
        Harness {
            service: LifecycleService::new(repo, ServerPolicy::default()),
            store,
            provider,
        }
    }

    /// Lands a user heartbeat at `heartbeat` between every read and the
    /// following write
    struct HeartbeatRepository {
        inner: StoreRepository,
        store: Arc<MemoryStore>,
        heartbeat: DateTime<Utc>,
    }

    impl HeartbeatRepository {
        fn beat(&self, user_principal_name: &UserPrincipalName) {
            self.store
                .record_activity(user_principal_name, self.heartbeat)
                .unwrap();
        }
    }

    #[async_trait]
    impl ServerRepository for HeartbeatRepository {
        async fn get_all_servers(&self) -> Result<Vec<Server>> {
            self.inner.get_all_servers().await
        }

        async fn get_server(&self, upn: &UserPrincipalName) -> Result<Option<Server>> {
            let server = self.inner.get_server(upn).await;
            self.beat(upn);
            server
        }

        async fn upsert_server(&self, server: &Server) -> Result<()> {
            self.inner.upsert_server(server).await
        }

        async fn update_policy(
            &self,
            upn: &UserPrincipalName,
            policy: ServerPolicy,
        ) -> Result<Option<Server>> {
            self.beat(upn);
            self.inner.update_policy(upn, policy).await
        }

        async fn record_activity(&self, upn: &UserPrincipalName, at: DateTime<Utc>) -> Result<bool> {
            self.inner.record_activity(upn, at).await
        }

        async fn ensure_server_idle(&self, server: &Server) -> Result<bool> {
            self.inner.ensure_server_idle(server).await
        }

        async fn deploy_container_group(&self, server: &Server) -> Result<()> {
            self.inner.deploy_container_group(server).await
        }

        async fn destroy_container_group(&self, server: &Server) -> Result<()> {
            self.inner.destroy_container_group(server).await
        }

        fn append_audit(&self, event: AuditEventType) {
            self.inner.append_audit(event)
        }

        fn is_healthy(&self) -> bool {
            self.inner.is_healthy()
        }
    }

    fn alice() -> UserPrincipalName {
        UserPrincipalName::new("alice@contoso.com")
    }

    fn requested(auto_destroy: bool, minutes: u32) -> Server {
        Server::register(
            SubscriptionId::new("sub-1"),
            alice(),
            UserPrincipalId::new("oid-alice"),
            ServerPolicy {
                auto_destroy,
                inactivity_duration_in_minutes: minutes,
            },
            labhub_util::now(),
        )
    }

    #[tokio::test]
    async fn register_creates_requested_record() {
        let h = harness();
        let server = h
            .service
            .register_subscription(
                SubscriptionId::new("sub-1"),
                alice(),
                UserPrincipalId::new("oid-alice"),
            )
            .await
            .unwrap();

        assert_eq!(server.status, ServerStatus::Requested);
        assert!(server.auto_destroy);
        assert_eq!(server.inactivity_duration_in_minutes, 60);

        let stored = h.store.get_server(&alice()).unwrap().unwrap();
        assert_eq!(stored, server);
    }

    #[tokio::test]
    async fn register_rejects_empty_subscription() {
        let h = harness();
        let err = h
            .service
            .register_subscription(SubscriptionId::new(""), alice(), UserPrincipalId::new("oid"))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
    }

    #[tokio::test]
    async fn deploy_marks_running() {
        let h = harness();
        let server = h.service.deploy_server(requested(true, 30)).await.unwrap();

        assert_eq!(server.status, ServerStatus::Running);
        assert!(server.destroyed_at_time.is_none());
        assert_eq!(server.inactivity_duration_in_minutes, 30);
        assert!(h.provider.is_running(&ContainerGroupDescriptor::for_server(&server)));

        let stored = h.service.get_server(&alice()).await.unwrap();
        assert_eq!(stored.status, ServerStatus::Running);
    }

    #[tokio::test]
    async fn deploy_failure_marks_failed() {
        let h = harness();
        h.provider.set_fail_deploy(true);

        let err = h.service.deploy_server(requested(true, 30)).await.unwrap_err();
        assert!(err.is_provider());

        let stored = h.service.get_server(&alice()).await.unwrap();
        assert_eq!(stored.status, ServerStatus::Failed);
        assert_eq!(h.provider.running_groups(), 0);
    }

    #[tokio::test]
    async fn redeploy_after_destroy_clears_destroyed_at() {
        let h = harness();
        h.service.deploy_server(requested(true, 30)).await.unwrap();
        let destroyed = h.service.destroy_server(&alice()).await.unwrap();
        assert!(destroyed.destroyed_at_time.is_some());

        let server = h.service.deploy_server(requested(true, 30)).await.unwrap();
        assert_eq!(server.status, ServerStatus::Running);
        assert!(server.destroyed_at_time.is_none());
    }

    #[tokio::test]
    async fn redeploy_from_stale_deploying() {
        let h = harness();
        let mut stale = requested(true, 30);
        stale.transition(ServerStatus::Deploying, labhub_util::now()).unwrap();
        h.store.upsert_server(&stale).unwrap();

        let server = h.service.deploy_server(requested(true, 30)).await.unwrap();
        assert_eq!(server.status, ServerStatus::Running);
        assert!(h.provider.is_running(&ContainerGroupDescriptor::for_server(&server)));
        assert_eq!(
            h.store.get_server(&alice()).unwrap().unwrap().status,
            ServerStatus::Running
        );
    }

    #[tokio::test]
    async fn update_changes_policy_only() {
        let h = harness();
        h.service.deploy_server(requested(true, 30)).await.unwrap();

        let mut change = requested(false, 120);
        change.subscription_id = SubscriptionId::new("sub-other");
        change.status = ServerStatus::Destroyed;

        let updated = h.service.update_server(change).await.unwrap();
        assert!(!updated.auto_destroy);
        assert_eq!(updated.inactivity_duration_in_minutes, 120);
        assert_eq!(updated.status, ServerStatus::Running);
        assert_eq!(updated.subscription_id, SubscriptionId::new("sub-1"));
    }

    #[tokio::test]
    async fn update_keeps_concurrent_heartbeat() {
        let h = harness();
        h.service.deploy_server(requested(true, 30)).await.unwrap();

        let heartbeat = labhub_util::now() + Duration::minutes(5);
        let repo = Arc::new(HeartbeatRepository {
            inner: StoreRepository::new(h.store.clone(), h.provider.clone()),
            store: h.store.clone(),
            heartbeat,
        });
        let service = LifecycleService::new(repo, ServerPolicy::default());

        let updated = service.update_server(requested(false, 90)).await.unwrap();
        assert!(!updated.auto_destroy);
        assert_eq!(updated.inactivity_duration_in_minutes, 90);

        let stored = h.store.get_server(&alice()).unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Running);
        assert_eq!(
            stored.last_user_activity_time,
            labhub_util::format_timestamp(&heartbeat)
        );
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let h = harness();
        let err = h.service.update_server(requested(true, 30)).await.unwrap_err();
        assert!(matches!(err, LabError::NotFound(_)));
        assert!(h.store.get_server(&alice()).unwrap().is_none());
    }

    #[tokio::test]
    async fn manual_destroy_ignores_policy() {
        let h = harness();
        h.service.deploy_server(requested(false, 30)).await.unwrap();

        let server = h.service.destroy_server(&alice()).await.unwrap();
        assert_eq!(server.status, ServerStatus::Destroyed);
        assert!(server.destroyed_at_time.is_some());
        assert_eq!(h.provider.running_groups(), 0);
    }

    #[tokio::test]
    async fn second_destroy_keeps_destroyed_at() {
        let h = harness();
        h.service.deploy_server(requested(true, 30)).await.unwrap();
        let first = h.service.destroy_server(&alice()).await.unwrap();

        let second = h.service.destroy_server(&alice()).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(h.store.get_server(&alice()).unwrap().unwrap(), first);
        assert_eq!(h.provider.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn destroy_failure_leaves_record_untouched() {
        let h = harness();
        h.service.deploy_server(requested(true, 30)).await.unwrap();
        h.provider.set_fail_destroy(true);

        let err = h.service.destroy_server(&alice()).await.unwrap_err();
        assert!(err.is_provider());

        let stored = h.service.get_server(&alice()).await.unwrap();
        assert_eq!(stored.status, ServerStatus::Running);
        assert!(stored.destroyed_at_time.is_none());
    }

    #[tokio::test]
    async fn heartbeat_advances_and_never_regresses() {
        let h = harness();
        let mut server = requested(true, 30);
        server.status = ServerStatus::Running;
        server.last_user_activity_time = "2099-01-01T00:00:00Z".to_string();
        h.store.upsert_server(&server).unwrap();

        h.service.update_activity_status(&alice()).await.unwrap();
        h.service.update_activity_status(&alice()).await.unwrap();

        let stored = h.store.get_server(&alice()).unwrap().unwrap();
        assert_eq!(stored.last_user_activity_time, "2099-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn heartbeat_touches_stale_record() {
        let h = harness();
        let mut server = requested(true, 30);
        server.last_user_activity_time = "2020-01-01T00:00:00Z".to_string();
        h.store.upsert_server(&server).unwrap();

        h.service.update_activity_status(&alice()).await.unwrap();

        let stored = h.store.get_server(&alice()).unwrap().unwrap();
        assert!(stored.last_activity().unwrap() > server.last_activity().unwrap());
    }

    #[tokio::test]
    async fn heartbeat_unknown_is_not_found() {
        let h = harness();
        let err = h
            .service
            .update_activity_status(&alice())
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::NotFound(_)));
    }

    #[tokio::test]
    async fn persistence_failure_surfaces() {
        let h = harness();
        h.store.set_fail_reads(true);
        let err = h.service.get_server(&alice()).await.unwrap_err();
        assert!(err.is_persistence());
    }
}
