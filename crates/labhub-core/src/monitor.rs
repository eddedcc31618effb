//! Auto-destroy monitor: periodically reclaims idle lab servers

use chrono::{DateTime, Utc};
use labhub_api::{Server, ServerStatus};
use labhub_store::AuditEventType;
use labhub_util::{Result, UserPrincipalName, minutes_between};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{RetainReason, ScanOutcome, ScanReport, ServerRepository};

/// Scans all records on a fixed period and tears down servers that are
/// Running, opted in, past their inactivity threshold and idle at the
/// provider.
pub struct AutoDestroyMonitor {
    repo: Arc<dyn ServerRepository>,
    polling_interval: Duration,
    /// Servers whose container group is gone but whose record still says
    /// Running, keyed to the record as it was before teardown.
    pending_reconciliation: Mutex<HashMap<UserPrincipalName, Server>>,
}

impl AutoDestroyMonitor {
    pub fn new(repo: Arc<dyn ServerRepository>, polling_interval: Duration) -> Self {
        Self {
            repo,
            polling_interval,
            pending_reconciliation: Mutex::new(HashMap::new()),
        }
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Number of reconciliation gaps still waiting to be closed
    pub fn pending_reconciliations(&self) -> usize {
        self.pending().len()
    }

    /// The ledger stays usable after a panic while it was held
    fn pending(&self) -> MutexGuard<'_, HashMap<UserPrincipalName, Server>> {
        self.pending_reconciliation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run scan cycles until `cancel` fires.
    ///
    /// The first scan happens one interval after start; ticks missed while a
    /// scan is still in progress are skipped rather than queued.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.polling_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            polling_interval_secs = period.as_secs_f64(),
            "Auto-destroy monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Auto-destroy monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(labhub_util::now(), &cancel).await {
                        error!(error = %e, "Not able to destroy idle servers");
                    }
                }
            }
        }
    }

    /// One full pass over every record.
    ///
    /// Per-server failures are isolated and reported; only a failure to read
    /// the record snapshot aborts the cycle.
    pub async fn scan(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<ScanReport> {
        info!("Polling for servers to destroy");

        let servers = self.repo.get_all_servers().await?;
        let mut report = ScanReport::new(now);

        let servers = self.reconcile_pending(servers, now, &mut report).await;

        for server in servers {
            if cancel.is_cancelled() {
                info!("Scan interrupted by shutdown");
                report.interrupted = true;
                break;
            }

            let outcome = self.evaluate(server.clone(), now).await;
            report.record(server.user_principal_name, outcome);
        }

        info!(
            scanned = report.outcomes.len(),
            destroyed = report.destroyed(),
            failures = report.failures(),
            "Scan complete"
        );
        Ok(report)
    }

    async fn evaluate(&self, server: Server, now: DateTime<Utc>) -> ScanOutcome {
        if !server.auto_destroy {
            return ScanOutcome::Retained(RetainReason::AutoDestroyDisabled);
        }
        if server.status != ServerStatus::Running {
            return ScanOutcome::Retained(RetainReason::NotRunning(server.status));
        }

        match server.exceeds_inactivity(now) {
            Ok(true) => {}
            Ok(false) => return ScanOutcome::Retained(RetainReason::RecentlyActive),
            Err(e) => {
                warn!(
                    user_principal_name = %server.user_principal_name,
                    last_user_activity_time = %server.last_user_activity_time,
                    error = %e,
                    "Not able to parse last activity time"
                );
                return ScanOutcome::UnparseableActivity {
                    error: e.to_string(),
                };
            }
        }

        match self.repo.ensure_server_idle(&server).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    user_principal_name = %server.user_principal_name,
                    "Server has active sessions"
                );
                return ScanOutcome::Retained(RetainReason::ActiveSessions);
            }
            Err(e) => {
                warn!(
                    user_principal_name = %server.user_principal_name,
                    error = %e,
                    "Idle probe failed, keeping server"
                );
                return ScanOutcome::ProbeFailed {
                    error: e.to_string(),
                };
            }
        }

        self.destroy_idle_server(server, now).await
    }

    /// Teardown first, record second. The record is never marked
    /// AutoDestroyed while the container group may still exist.
    async fn destroy_idle_server(&self, server: Server, now: DateTime<Utc>) -> ScanOutcome {
        let idle_minutes = server
            .last_activity()
            .map(|last| minutes_between(last, now))
            .unwrap_or_default();

        info!(
            user_principal_name = %server.user_principal_name,
            idle_minutes,
            inactivity_duration_in_minutes = server.inactivity_duration_in_minutes,
            "Destroying idle server"
        );

        if let Err(e) = self.repo.destroy_container_group(&server).await {
            error!(
                user_principal_name = %server.user_principal_name,
                error = %e,
                "Not able to destroy idle server"
            );
            return ScanOutcome::TeardownFailed {
                error: e.to_string(),
            };
        }

        let mut destroyed = server.clone();
        match self.persist_auto_destroyed(&mut destroyed, now).await {
            Ok(()) => {
                info!(
                    user_principal_name = %server.user_principal_name,
                    idle_minutes,
                    "Idle server destroyed"
                );
                self.repo.append_audit(AuditEventType::ServerAutoDestroyed {
                    user_principal_name: server.user_principal_name.clone(),
                    idle_minutes,
                });
                ScanOutcome::AutoDestroyed { idle_minutes }
            }
            Err(e) => {
                error!(
                    user_principal_name = %server.user_principal_name,
                    reconciliation_gap = true,
                    error = %e,
                    "Container group destroyed but server record not updated"
                );
                self.repo.append_audit(AuditEventType::ReconciliationGap {
                    user_principal_name: server.user_principal_name.clone(),
                    error: e.to_string(),
                });
                self.pending().insert(server.user_principal_name.clone(), server);
                ScanOutcome::ReconciliationGap {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn persist_auto_destroyed(&self, server: &mut Server, now: DateTime<Utc>) -> Result<()> {
        server.transition(ServerStatus::Destroying, now)?;
        server.transition(ServerStatus::AutoDestroyed, now)?;
        self.repo.upsert_server(server).await
    }

    /// Retry outstanding AutoDestroyed writes before the regular pass.
    ///
    /// An entry is only replayed while the stored record is unchanged since
    /// teardown; anything else means a user acted in between and the entry is
    /// dropped. Returns the servers still due for regular evaluation.
    async fn reconcile_pending(
        &self,
        servers: Vec<Server>,
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Vec<Server> {
        let pending = std::mem::take(&mut *self.pending());
        if pending.is_empty() {
            return servers;
        }

        let mut remaining = Vec::with_capacity(servers.len());
        let mut still_pending = HashMap::new();

        for server in servers {
            let Some(snapshot) = pending.get(&server.user_principal_name) else {
                remaining.push(server);
                continue;
            };

            let unchanged = server.status == ServerStatus::Running
                && server.last_user_activity_time == snapshot.last_user_activity_time;
            if !unchanged {
                debug!(
                    user_principal_name = %server.user_principal_name,
                    status = %server.status,
                    "Record changed since teardown, dropping reconciliation"
                );
                remaining.push(server);
                continue;
            }

            let mut destroyed = server.clone();
            match self.persist_auto_destroyed(&mut destroyed, now).await {
                Ok(()) => {
                    info!(
                        user_principal_name = %server.user_principal_name,
                        "Reconciliation gap closed"
                    );
                    self.repo.append_audit(AuditEventType::Reconciled {
                        user_principal_name: server.user_principal_name.clone(),
                    });
                    report.record(server.user_principal_name, ScanOutcome::Reconciled);
                }
                Err(e) => {
                    error!(
                        user_principal_name = %server.user_principal_name,
                        reconciliation_gap = true,
                        error = %e,
                        "Still not able to record auto-destroy"
                    );
                    report.record(
                        server.user_principal_name.clone(),
                        ScanOutcome::ReconciliationGap {
                            error: e.to_string(),
                        },
                    );
                    still_pending.insert(server.user_principal_name.clone(), snapshot.clone());
                }
            }
        }

        self.pending().extend(still_pending);

        remaining
    }

    /// Record that the supervisor gave up on this monitor
    pub fn record_stopped(&self, restarts: u32) {
        self.repo
            .append_audit(AuditEventType::MonitorStopped { restarts });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreRepository;
    use chrono::TimeZone;
    use labhub_api::ServerPolicy;
    use labhub_provider::{ContainerGroupDescriptor, ContainerProvider, SimulatedProvider};
    use labhub_store::{MemoryStore, ServerStore};
    use labhub_util::{SubscriptionId, UserPrincipalId, format_timestamp};

    struct Harness {
        monitor: AutoDestroyMonitor,
        store: Arc<MemoryStore>,
        provider: Arc<SimulatedProvider>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(SimulatedProvider::new());
        let repo = Arc::new(StoreRepository::new(store.clone(), provider.clone()));
        Harness {
            monitor: AutoDestroyMonitor::new(repo, Duration::from_secs(60)),
            store,
            provider,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn upn(name: &str) -> UserPrincipalName {
        UserPrincipalName::new(format!("{name}@contoso.com"))
    }

    /// Running record with a live container group, idle for `idle_minutes`
    async fn seed(h: &Harness, name: &str, idle_minutes: i64, threshold: u32) -> Server {
        let mut server = Server::register(
            SubscriptionId::new("sub-1"),
            upn(name),
            UserPrincipalId::new(format!("oid-{name}")),
            ServerPolicy {
                auto_destroy: true,
                inactivity_duration_in_minutes: threshold,
            },
            now(),
        );
        server.status = ServerStatus::Running;
        server.touch_activity(now() - chrono::Duration::minutes(idle_minutes));
        h.store.upsert_server(&server).unwrap();
        h.provider
            .deploy(&ContainerGroupDescriptor::for_server(&server))
            .await
            .unwrap();
        server
    }

    fn stored(h: &Harness, name: &str) -> Server {
        h.store.get_server(&upn(name)).unwrap().unwrap()
    }

    async fn scan(h: &Harness) -> ScanReport {
        h.monitor
            .scan(now(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn idle_server_is_auto_destroyed() {
        let h = harness();
        seed(&h, "alice", 45, 30).await;

        let report = scan(&h).await;

        assert_eq!(
            report.outcome_for(&upn("alice")),
            Some(&ScanOutcome::AutoDestroyed { idle_minutes: 45 })
        );
        let server = stored(&h, "alice");
        assert_eq!(server.status, ServerStatus::AutoDestroyed);
        assert_eq!(server.destroyed_at_time, Some(now()));
        assert_eq!(h.provider.destroy_calls(), 1);
        assert_eq!(h.provider.running_groups(), 0);
    }

    #[tokio::test]
    async fn active_sessions_keep_server_running() {
        let h = harness();
        let server = seed(&h, "alice", 45, 30).await;
        h.provider
            .set_active_sessions(&ContainerGroupDescriptor::for_server(&server), 2);

        let report = scan(&h).await;

        assert_eq!(
            report.outcome_for(&upn("alice")),
            Some(&ScanOutcome::Retained(RetainReason::ActiveSessions))
        );
        assert_eq!(stored(&h, "alice").status, ServerStatus::Running);
        assert_eq!(h.provider.destroy_calls(), 0);
    }

    #[tokio::test]
    async fn teardown_failure_leaves_record_unchanged() {
        let h = harness();
        let before = seed(&h, "alice", 45, 30).await;
        h.provider.set_fail_destroy(true);
        let upserts = h.store.upsert_count();

        let report = scan(&h).await;

        assert!(matches!(
            report.outcome_for(&upn("alice")),
            Some(ScanOutcome::TeardownFailed { .. })
        ));
        assert_eq!(stored(&h, "alice"), before);
        assert_eq!(h.store.upsert_count(), upserts);
    }

    #[tokio::test]
    async fn each_condition_prevents_destruction() {
        let h = harness();

        let mut opted_out = seed(&h, "optout", 45, 30).await;
        opted_out.auto_destroy = false;
        h.store.upsert_server(&opted_out).unwrap();

        let mut deploying = seed(&h, "deploying", 45, 30).await;
        deploying.status = ServerStatus::Deploying;
        h.store.upsert_server(&deploying).unwrap();

        seed(&h, "recent", 10, 30).await;

        let busy = seed(&h, "busy", 45, 30).await;
        h.provider
            .set_active_sessions(&ContainerGroupDescriptor::for_server(&busy), 1);

        let report = scan(&h).await;

        assert_eq!(
            report.outcome_for(&upn("optout")),
            Some(&ScanOutcome::Retained(RetainReason::AutoDestroyDisabled))
        );
        assert_eq!(
            report.outcome_for(&upn("deploying")),
            Some(&ScanOutcome::Retained(RetainReason::NotRunning(
                ServerStatus::Deploying
            )))
        );
        assert_eq!(
            report.outcome_for(&upn("recent")),
            Some(&ScanOutcome::Retained(RetainReason::RecentlyActive))
        );
        assert_eq!(
            report.outcome_for(&upn("busy")),
            Some(&ScanOutcome::Retained(RetainReason::ActiveSessions))
        );
        assert_eq!(h.provider.destroy_calls(), 0);
        assert_eq!(report.destroyed(), 0);
    }

    #[tokio::test]
    async fn threshold_is_strict() {
        let h = harness();
        seed(&h, "alice", 30, 30).await;

        let report = scan(&h).await;
        assert_eq!(
            report.outcome_for(&upn("alice")),
            Some(&ScanOutcome::Retained(RetainReason::RecentlyActive))
        );
    }

    #[tokio::test]
    async fn opted_out_server_is_never_probed() {
        let h = harness();
        let mut server = seed(&h, "alice", 600, 30).await;
        server.auto_destroy = false;
        h.store.upsert_server(&server).unwrap();

        for _ in 0..3 {
            scan(&h).await;
        }

        assert_eq!(h.provider.probe_calls(), 0);
        assert_eq!(stored(&h, "alice").status, ServerStatus::Running);
    }

    #[tokio::test]
    async fn malformed_timestamp_is_isolated() {
        let h = harness();
        let mut broken = seed(&h, "broken", 45, 30).await;
        broken.last_user_activity_time = "not-a-timestamp".to_string();
        h.store.upsert_server(&broken).unwrap();
        seed(&h, "idle", 45, 30).await;

        let report = scan(&h).await;

        assert!(matches!(
            report.outcome_for(&upn("broken")),
            Some(ScanOutcome::UnparseableActivity { .. })
        ));
        assert_eq!(stored(&h, "broken").status, ServerStatus::Running);
        assert_eq!(stored(&h, "idle").status, ServerStatus::AutoDestroyed);
    }

    #[tokio::test]
    async fn probe_failure_keeps_server() {
        let h = harness();
        seed(&h, "alice", 45, 30).await;
        h.provider.set_fail_probe(true);

        let report = scan(&h).await;

        assert!(matches!(
            report.outcome_for(&upn("alice")),
            Some(ScanOutcome::ProbeFailed { .. })
        ));
        assert_eq!(h.provider.destroy_calls(), 0);
    }

    #[tokio::test]
    async fn snapshot_failure_aborts_cycle() {
        let h = harness();
        seed(&h, "alice", 45, 30).await;
        h.store.set_fail_reads(true);

        let err = h
            .monitor
            .scan(now(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_persistence());
        assert_eq!(h.provider.destroy_calls(), 0);
    }

    #[tokio::test]
    async fn reconciliation_gap_closes_next_cycle() {
        let h = harness();
        let before = seed(&h, "alice", 45, 30).await;
        h.store.set_fail_writes(true);

        let report = scan(&h).await;
        assert!(matches!(
            report.outcome_for(&upn("alice")),
            Some(ScanOutcome::ReconciliationGap { .. })
        ));
        assert_eq!(h.provider.running_groups(), 0);
        assert_eq!(stored(&h, "alice"), before);
        assert_eq!(h.monitor.pending_reconciliations(), 1);

        h.store.set_fail_writes(false);
        let report = scan(&h).await;

        assert_eq!(
            report.outcome_for(&upn("alice")),
            Some(&ScanOutcome::Reconciled)
        );
        assert_eq!(stored(&h, "alice").status, ServerStatus::AutoDestroyed);
        assert_eq!(h.monitor.pending_reconciliations(), 0);
        assert_eq!(h.provider.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn reconciliation_survives_poisoned_ledger() {
        let h = harness();
        seed(&h, "alice", 45, 30).await;

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _held = h.monitor.pending_reconciliation.lock().unwrap();
            panic!("ledger holder panicked");
        }));
        assert!(poisoned.is_err());
        assert!(h.monitor.pending_reconciliation.is_poisoned());

        h.store.set_fail_writes(true);
        scan(&h).await;
        assert_eq!(h.monitor.pending_reconciliations(), 1);

        h.store.set_fail_writes(false);
        let report = scan(&h).await;
        assert_eq!(
            report.outcome_for(&upn("alice")),
            Some(&ScanOutcome::Reconciled)
        );
        assert_eq!(stored(&h, "alice").status, ServerStatus::AutoDestroyed);
        assert_eq!(h.monitor.pending_reconciliations(), 0);
    }

    #[tokio::test]
    async fn reconciliation_dropped_after_user_activity() {
        let h = harness();
        seed(&h, "alice", 45, 30).await;
        h.store.set_fail_writes(true);
        scan(&h).await;
        h.store.set_fail_writes(false);

        h.store.record_activity(&upn("alice"), now()).unwrap();
        let report = scan(&h).await;

        assert_eq!(
            report.outcome_for(&upn("alice")),
            Some(&ScanOutcome::Retained(RetainReason::RecentlyActive))
        );
        assert_eq!(stored(&h, "alice").status, ServerStatus::Running);
        assert_eq!(h.monitor.pending_reconciliations(), 0);
        assert_eq!(
            stored(&h, "alice").last_user_activity_time,
            format_timestamp(&now())
        );
    }

    #[tokio::test]
    async fn cancelled_scan_stops_between_servers() {
        let h = harness();
        seed(&h, "alice", 45, 30).await;
        seed(&h, "bob", 45, 30).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.monitor.scan(now(), &cancel).await.unwrap();

        assert!(report.interrupted);
        assert!(report.outcomes.is_empty());
        assert_eq!(h.provider.destroy_calls(), 0);
    }

    #[tokio::test]
    async fn run_exits_on_cancel() {
        let h = harness();
        let monitor = Arc::new(h.monitor);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            async move { monitor.run(cancel).await }
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn run_scans_on_each_tick() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(SimulatedProvider::new());
        let repo = Arc::new(StoreRepository::new(store.clone(), provider.clone()));
        let monitor = Arc::new(AutoDestroyMonitor::new(repo, Duration::from_millis(20)));

        let mut server = Server::register(
            SubscriptionId::new("sub-1"),
            upn("alice"),
            UserPrincipalId::new("oid-alice"),
            ServerPolicy {
                auto_destroy: true,
                inactivity_duration_in_minutes: 1,
            },
            labhub_util::now(),
        );
        server.status = ServerStatus::Running;
        server.touch_activity(labhub_util::now() - chrono::Duration::minutes(5));
        store.upsert_server(&server).unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            async move { monitor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        task.await.unwrap();

        let stored = store.get_server(&upn("alice")).unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::AutoDestroyed);
    }
}
