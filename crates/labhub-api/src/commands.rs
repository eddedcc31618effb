//! Command types for the labhubd protocol

use labhub_util::{LabError, SubscriptionId, UserPrincipalName};
use serde::{Deserialize, Serialize};

use crate::{API_VERSION, Principal, Server};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Identity resolved by whatever authenticates the connection
    pub caller: Principal,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, caller: Principal, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            caller,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&LabError> for ErrorInfo {
    fn from(err: &LabError) -> Self {
        let code = match err {
            LabError::NotFound(_) => ErrorCode::NotFound,
            LabError::Auth(_) => ErrorCode::Unauthorized,
            LabError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            LabError::Validation(_) | LabError::TimestampParse { .. } => ErrorCode::InvalidRequest,
            LabError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            LabError::Persistence(_) | LabError::ReconciliationGap { .. } => {
                ErrorCode::PersistenceError
            }
            LabError::Provider(_) => ErrorCode::ProviderError,
            LabError::Config(_) | LabError::Ipc(_) | LabError::Internal(_) => {
                ErrorCode::InternalError
            }
        };
        Self::new(code, err.to_string())
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    UnsupportedVersion,
    Unauthorized,
    PermissionDenied,
    NotFound,
    InvalidTransition,
    PersistenceError,
    ProviderError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Bind the caller to a cloud subscription
    RegisterSubscription { subscription_id: SubscriptionId },

    /// Fetch the caller's server record
    GetServer,

    /// Provision (or re-provision) the caller's server
    DeployServer { server: Server },

    /// Change the reclamation policy fields
    UpdateServer { server: Server },

    /// Tear down the caller's server regardless of idleness
    DestroyServer,

    /// Activity heartbeat
    UpdateActivityStatus {
        user_principal_name: UserPrincipalName,
    },

    /// Daemon health, including the auto-destroy monitor
    GetHealth,

    /// Ping for keepalive
    Ping,
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Registered,
    Server(Server),
    Destroyed,
    ActivityRecorded,
    Health(HealthStatus),
    Pong,
}

/// Daemon health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub store_healthy: bool,
    pub monitor_running: bool,
    pub monitor_restarts: u32,
}
