//! Audit event types

use chrono::{DateTime, Utc};
use labhub_util::{SubscriptionId, UserPrincipalName};
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Subscription bound to a principal
    SubscriptionRegistered {
        user_principal_name: UserPrincipalName,
        subscription_id: SubscriptionId,
    },

    /// Container group is up and the record is Running
    ServerDeployed {
        user_principal_name: UserPrincipalName,
        subscription_id: SubscriptionId,
    },

    /// Provisioning failed, record marked Failed
    DeployFailed {
        user_principal_name: UserPrincipalName,
        error: String,
    },

    /// Reclamation policy changed
    ServerUpdated {
        user_principal_name: UserPrincipalName,
        auto_destroy: bool,
        inactivity_duration_in_minutes: u32,
    },

    /// User-initiated teardown
    ServerDestroyed { user_principal_name: UserPrincipalName },

    /// Teardown by the auto-destroy monitor
    ServerAutoDestroyed {
        user_principal_name: UserPrincipalName,
        idle_minutes: i64,
    },

    /// Container group gone but the record could not be updated
    ReconciliationGap {
        user_principal_name: UserPrincipalName,
        error: String,
    },

    /// A previous reconciliation gap was closed
    Reconciled { user_principal_name: UserPrincipalName },

    /// Monitor supervisor exhausted its restart budget
    MonitorStopped { restarts: u32 },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: labhub_util::now(),
            event,
        }
    }
}
