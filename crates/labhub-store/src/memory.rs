//! In-memory store with failure injection, for tests and development

use chrono::{DateTime, Utc};
use labhub_api::{Server, ServerPolicy};
use labhub_util::{UserPrincipalName, format_timestamp};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::traits::activity_advances;
use crate::{AuditEvent, ServerStore, StoreError, StoreResult};

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    servers: Mutex<BTreeMap<UserPrincipalName, Server>>,
    audits: Mutex<Vec<AuditEvent>>,
    next_audit_id: AtomicI64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    upserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail with `StoreError::Unavailable`
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every server write fail with `StoreError::Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful server upserts so far
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn servers(&self) -> StoreResult<MutexGuard<'_, BTreeMap<UserPrincipalName, Server>>> {
        self.servers
            .lock()
            .map_err(|_| StoreError::Unavailable("server map lock poisoned".into()))
    }

    fn check_reads(&self) -> StoreResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    fn check_writes(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

impl ServerStore for MemoryStore {
    fn get_all_servers(&self) -> StoreResult<Vec<Server>> {
        self.check_reads()?;
        Ok(self.servers()?.values().cloned().collect())
    }

    fn get_server(&self, user_principal_name: &UserPrincipalName) -> StoreResult<Option<Server>> {
        self.check_reads()?;
        Ok(self.servers()?.get(user_principal_name).cloned())
    }

    fn upsert_server(&self, server: &Server) -> StoreResult<()> {
        self.check_writes()?;
        self.servers()?
            .insert(server.user_principal_name.clone(), server.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_policy(
        &self,
        user_principal_name: &UserPrincipalName,
        policy: ServerPolicy,
    ) -> StoreResult<Option<Server>> {
        self.check_writes()?;
        let mut servers = self.servers()?;
        Ok(servers.get_mut(user_principal_name).map(|server| {
            server.apply_policy(policy);
            server.clone()
        }))
    }

    fn record_activity(
        &self,
        user_principal_name: &UserPrincipalName,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_writes()?;
        let mut servers = self.servers()?;
        let Some(server) = servers.get_mut(user_principal_name) else {
            return Ok(false);
        };

        if activity_advances(&server.last_user_activity_time, at) {
            server.last_user_activity_time = format_timestamp(&at);
        }
        Ok(true)
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        event.id = self.next_audit_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.audits
            .lock()
            .map_err(|_| StoreError::Unavailable("audit lock poisoned".into()))?
            .push(event);
        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let audits = self
            .audits
            .lock()
            .map_err(|_| StoreError::Unavailable("audit lock poisoned".into()))?;
        Ok(audits.iter().rev().take(limit).cloned().collect())
    }

    fn is_healthy(&self) -> bool {
        !self.fail_reads.load(Ordering::SeqCst) && !self.fail_writes.load(Ordering::SeqCst)
    }
}
