//! Server record and lifecycle status

use chrono::{DateTime, Utc};
use labhub_util::{
    LabError, Result, SubscriptionId, UserPrincipalId, UserPrincipalName, format_timestamp,
    parse_timestamp,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a lab server.
///
/// Within one episode the status only moves forward:
/// `Requested -> Deploying -> Running -> {Updating -> Running | Destroying -> {Destroyed | AutoDestroyed} | Failed}`.
/// A new deploy after a terminal status starts the next episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    Requested,
    Deploying,
    Running,
    Updating,
    Destroying,
    Destroyed,
    AutoDestroyed,
    Failed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Requested => "Requested",
            ServerStatus::Deploying => "Deploying",
            ServerStatus::Running => "Running",
            ServerStatus::Updating => "Updating",
            ServerStatus::Destroying => "Destroying",
            ServerStatus::Destroyed => "Destroyed",
            ServerStatus::AutoDestroyed => "AutoDestroyed",
            ServerStatus::Failed => "Failed",
        }
    }

    /// Parse the persisted tag
    pub fn parse(value: &str) -> Option<Self> {
        let status = match value {
            "Requested" => ServerStatus::Requested,
            "Deploying" => ServerStatus::Deploying,
            "Running" => ServerStatus::Running,
            "Updating" => ServerStatus::Updating,
            "Destroying" => ServerStatus::Destroying,
            "Destroyed" => ServerStatus::Destroyed,
            "AutoDestroyed" => ServerStatus::AutoDestroyed,
            "Failed" => ServerStatus::Failed,
            _ => return None,
        };
        Some(status)
    }

    /// Destroyed by the user or by the monitor
    pub fn is_destroyed(&self) -> bool {
        matches!(self, ServerStatus::Destroyed | ServerStatus::AutoDestroyed)
    }

    /// End of an episode; only a new deploy moves on from here
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerStatus::Destroyed | ServerStatus::AutoDestroyed | ServerStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: ServerStatus) -> bool {
        use ServerStatus::*;

        match (*self, next) {
            (Requested, Deploying) => true,
            // An interrupted deploy is retried in place
            (Deploying, Deploying | Running | Failed) => true,
            (Running, Updating | Deploying | Destroying | Failed) => true,
            (Updating, Running | Failed) => true,
            (Destroying, Destroyed | AutoDestroyed | Failed) => true,
            (Destroyed | AutoDestroyed | Failed, Deploying) => true,
            // Manual teardown is accepted from anywhere it is not already underway
            // or done; a destroyed record keeps its original destroyed_at
            (from, Destroying) => from != Destroying && !from.is_destroyed(),
            _ => false,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's lab server record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub subscription_id: SubscriptionId,
    pub user_principal_name: UserPrincipalName,
    pub user_principal_id: UserPrincipalId,
    pub status: ServerStatus,

    /// RFC 3339; kept as text because it is owned by the persisted store
    #[serde(default)]
    pub last_user_activity_time: String,

    /// Set only while status is Destroyed or AutoDestroyed
    #[serde(default)]
    pub destroyed_at_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub auto_destroy: bool,

    #[serde(default)]
    pub inactivity_duration_in_minutes: u32,
}

impl Server {
    /// New record for a freshly registered subscription
    pub fn register(
        subscription_id: SubscriptionId,
        user_principal_name: UserPrincipalName,
        user_principal_id: UserPrincipalId,
        policy: ServerPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id,
            user_principal_name,
            user_principal_id,
            status: ServerStatus::Requested,
            last_user_activity_time: format_timestamp(&now),
            destroyed_at_time: None,
            auto_destroy: policy.auto_destroy,
            inactivity_duration_in_minutes: policy.inactivity_duration_in_minutes,
        }
    }

    pub fn policy(&self) -> ServerPolicy {
        ServerPolicy {
            auto_destroy: self.auto_destroy,
            inactivity_duration_in_minutes: self.inactivity_duration_in_minutes,
        }
    }

    pub fn apply_policy(&mut self, policy: ServerPolicy) {
        self.auto_destroy = policy.auto_destroy;
        self.inactivity_duration_in_minutes = policy.inactivity_duration_in_minutes;
    }

    /// Parsed last activity time
    pub fn last_activity(&self) -> Result<DateTime<Utc>> {
        parse_timestamp(&self.last_user_activity_time)
    }

    pub fn touch_activity(&mut self, now: DateTime<Utc>) {
        self.last_user_activity_time = format_timestamp(&now);
    }

    pub fn inactivity_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.inactivity_duration_in_minutes))
    }

    /// Whether the idle time strictly exceeds this server's threshold
    pub fn exceeds_inactivity(&self, now: DateTime<Utc>) -> Result<bool> {
        let last = self.last_activity()?;
        Ok(now.signed_duration_since(last) > self.inactivity_threshold())
    }

    /// Move to `next`, keeping `destroyed_at_time` in step with the status.
    pub fn transition(&mut self, next: ServerStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LabError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        self.destroyed_at_time = if next.is_destroyed() { Some(now) } else { None };
        Ok(())
    }
}

/// User-configurable reclamation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPolicy {
    pub auto_destroy: bool,
    pub inactivity_duration_in_minutes: u32,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            auto_destroy: true,
            inactivity_duration_in_minutes: 60,
        }
    }
}

/// Authenticated caller of an inbound operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_principal_name: UserPrincipalName,
    pub user_principal_id: UserPrincipalId,
}

impl Principal {
    pub fn new(
        user_principal_name: impl Into<UserPrincipalName>,
        user_principal_id: impl Into<UserPrincipalId>,
    ) -> Self {
        Self {
            user_principal_name: user_principal_name.into(),
            user_principal_id: user_principal_id.into(),
        }
    }

    /// Claimed owner id must match the caller
    pub fn owns(&self, server: &Server) -> bool {
        self.user_principal_id == server.user_principal_id
    }
}
