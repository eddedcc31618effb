//! Error types for labhubd

use thiserror::Error;

use crate::UserPrincipalName;

/// Core error type for labhubd operations
#[derive(Debug, Error)]
pub enum LabError {
    #[error("No server registered for {0}")]
    NotFound(UserPrincipalName),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid timestamp '{value}': {message}")]
    TimestampParse { value: String, message: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Container group is gone but the record still says otherwise
    #[error("Reconciliation gap for {user_principal_name}: {message}")]
    ReconciliationGap {
        user_principal_name: UserPrincipalName,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LabError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn ipc(msg: impl Into<String>) -> Self {
        Self::Ipc(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failure came from the storage layer
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Whether the failure came from the cloud provider
    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

pub type Result<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_identity() {
        let err = LabError::NotFound(UserPrincipalName::new("alice@contoso.com"));
        assert_eq!(err.to_string(), "No server registered for alice@contoso.com");

        let err = LabError::ReconciliationGap {
            user_principal_name: UserPrincipalName::new("bob@contoso.com"),
            message: "database unreachable".into(),
        };
        assert!(err.to_string().contains("bob@contoso.com"));
    }

    #[test]
    fn classification_helpers() {
        assert!(LabError::persistence("disk full").is_persistence());
        assert!(LabError::provider("throttled").is_provider());
        assert!(!LabError::provider("throttled").is_persistence());
    }
}
