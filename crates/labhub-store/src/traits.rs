//! Store trait definitions

use chrono::{DateTime, Utc};
use labhub_api::{Server, ServerPolicy};
use labhub_util::UserPrincipalName;

use crate::{AuditEvent, StoreResult};

/// Main store trait
pub trait ServerStore: Send + Sync {
    // Server records

    /// Full snapshot of every server record
    fn get_all_servers(&self) -> StoreResult<Vec<Server>>;

    /// Look up the record owned by a principal
    fn get_server(&self, user_principal_name: &UserPrincipalName) -> StoreResult<Option<Server>>;

    /// Insert or replace the record keyed by its principal name
    fn upsert_server(&self, server: &Server) -> StoreResult<()>;

    /// Rewrite only the policy columns of an existing record.
    ///
    /// Status and activity are left as stored. Returns the updated record,
    /// or `None` when no record exists for the principal.
    fn update_policy(
        &self,
        user_principal_name: &UserPrincipalName,
        policy: ServerPolicy,
    ) -> StoreResult<Option<Server>>;

    /// Move `last_user_activity_time` forward to `at`.
    ///
    /// Never moves the timestamp backwards. Returns `false` when no record
    /// exists for the principal.
    fn record_activity(
        &self,
        user_principal_name: &UserPrincipalName,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Whether `candidate` should replace the stored activity text.
///
/// An unparseable stored value is always replaced.
pub(crate) fn activity_advances(stored: &str, candidate: DateTime<Utc>) -> bool {
    match labhub_util::parse_timestamp(stored) {
        Ok(existing) => candidate > existing,
        Err(_) => true,
    }
}
