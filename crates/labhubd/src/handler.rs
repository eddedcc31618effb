//! Request dispatch and authorization for IPC commands

use labhub_api::{
    API_VERSION, Command, ErrorCode, ErrorInfo, HealthStatus, Principal, Request, Response,
    ResponsePayload, Server,
};
use labhub_core::{LifecycleService, MonitorStatus};
use labhub_util::{LabError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a request handler task needs
#[derive(Clone)]
pub struct Handler {
    lifecycle: Arc<LifecycleService>,
    monitor: Option<Arc<MonitorStatus>>,
}

impl Handler {
    pub fn new(lifecycle: Arc<LifecycleService>, monitor: Option<Arc<MonitorStatus>>) -> Self {
        Self { lifecycle, monitor }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let request_id = request.request_id;

        if request.api_version != API_VERSION {
            return Response::error(
                request_id,
                ErrorInfo::new(
                    ErrorCode::UnsupportedVersion,
                    format!(
                        "api version {} not supported (expected {})",
                        request.api_version, API_VERSION
                    ),
                ),
            );
        }

        match self.dispatch(&request.caller, request.command).await {
            Ok(payload) => Response::success(request_id, payload),
            Err(e) => {
                match &e {
                    LabError::NotFound(_) | LabError::Validation(_) => {
                        debug!(request_id, error = %e, "Request rejected");
                    }
                    _ => warn!(request_id, error = %e, "Request failed"),
                }
                Response::error(request_id, ErrorInfo::from(&e))
            }
        }
    }

    async fn dispatch(&self, caller: &Principal, command: Command) -> Result<ResponsePayload> {
        if !matches!(command, Command::Ping | Command::GetHealth) {
            authenticate(caller)?;
        }

        match command {
            Command::RegisterSubscription { subscription_id } => {
                self.lifecycle
                    .register_subscription(
                        subscription_id,
                        caller.user_principal_name.clone(),
                        caller.user_principal_id.clone(),
                    )
                    .await?;
                Ok(ResponsePayload::Registered)
            }

            Command::GetServer => {
                let server = self.lifecycle.get_server(&caller.user_principal_name).await?;
                Ok(ResponsePayload::Server(server))
            }

            Command::DeployServer { server } => {
                authorize_server(caller, &server)?;
                validate_policy(&server)?;
                let server = self.lifecycle.deploy_server(server).await?;
                Ok(ResponsePayload::Server(server))
            }

            Command::UpdateServer { server } => {
                authorize_server(caller, &server)?;
                validate_policy(&server)?;
                let server = self.lifecycle.update_server(server).await?;
                Ok(ResponsePayload::Server(server))
            }

            Command::DestroyServer => {
                self.lifecycle
                    .destroy_server(&caller.user_principal_name)
                    .await?;
                Ok(ResponsePayload::Destroyed)
            }

            Command::UpdateActivityStatus {
                user_principal_name,
            } => {
                if user_principal_name != caller.user_principal_name {
                    return Err(LabError::permission(format!(
                        "{} may not report activity for {}",
                        caller.user_principal_name, user_principal_name
                    )));
                }
                self.lifecycle
                    .update_activity_status(&user_principal_name)
                    .await?;
                Ok(ResponsePayload::ActivityRecorded)
            }

            Command::GetHealth => Ok(ResponsePayload::Health(self.health())),

            Command::Ping => Ok(ResponsePayload::Pong),
        }
    }

    fn health(&self) -> HealthStatus {
        HealthStatus {
            store_healthy: self.lifecycle.repository().is_healthy(),
            monitor_running: self.monitor.as_ref().is_some_and(|m| m.is_running()),
            monitor_restarts: self.monitor.as_ref().map(|m| m.restarts()).unwrap_or(0),
        }
    }
}

fn authenticate(caller: &Principal) -> Result<()> {
    if caller.user_principal_name.is_empty() || caller.user_principal_id.is_empty() {
        return Err(LabError::auth("caller principal is missing"));
    }
    Ok(())
}

/// The claimed owner must be the caller. Records are keyed by principal
/// name, so the name has to match as well as the id.
fn authorize_server(caller: &Principal, server: &Server) -> Result<()> {
    if !caller.owns(server) || server.user_principal_name != caller.user_principal_name {
        return Err(LabError::permission(format!(
            "{} does not own the server for {}",
            caller.user_principal_name, server.user_principal_name
        )));
    }
    Ok(())
}

fn validate_policy(server: &Server) -> Result<()> {
    if server.auto_destroy && server.inactivity_duration_in_minutes == 0 {
        return Err(LabError::validation(
            "inactivity_duration_in_minutes must be positive when auto_destroy is on",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use labhub_api::{ResponseResult, ServerPolicy, ServerStatus};
    use labhub_core::StoreRepository;
    use labhub_provider::SimulatedProvider;
    use labhub_store::MemoryStore;
    use labhub_util::{SubscriptionId, UserPrincipalId, UserPrincipalName};

    fn handler() -> Handler {
        let repo = Arc::new(StoreRepository::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedProvider::new()),
        ));
        let lifecycle = Arc::new(LifecycleService::new(repo, ServerPolicy::default()));
        Handler::new(lifecycle, Some(Arc::new(MonitorStatus::new())))
    }

    fn alice() -> Principal {
        Principal::new("alice@contoso.com", "oid-alice")
    }

    fn mallory() -> Principal {
        Principal::new("mallory@contoso.com", "oid-mallory")
    }

    fn server_for(owner: &Principal) -> Server {
        Server::register(
            SubscriptionId::new("sub-1"),
            owner.user_principal_name.clone(),
            owner.user_principal_id.clone(),
            ServerPolicy::default(),
            labhub_util::now(),
        )
    }

    async fn send(handler: &Handler, caller: Principal, command: Command) -> ResponseResult {
        handler.handle(Request::new(7, caller, command)).await.result
    }

    fn error_code(result: ResponseResult) -> ErrorCode {
        match result {
            ResponseResult::Err(e) => e.code,
            ResponseResult::Ok(payload) => panic!("expected error, got {payload:?}"),
        }
    }

    #[tokio::test]
    async fn full_lifecycle_over_commands() {
        let h = handler();

        let result = send(
            &h,
            alice(),
            Command::RegisterSubscription {
                subscription_id: SubscriptionId::new("sub-1"),
            },
        )
        .await;
        assert!(matches!(result, ResponseResult::Ok(ResponsePayload::Registered)));

        let result = send(
            &h,
            alice(),
            Command::DeployServer {
                server: server_for(&alice()),
            },
        )
        .await;
        match result {
            ResponseResult::Ok(ResponsePayload::Server(server)) => {
                assert_eq!(server.status, ServerStatus::Running);
            }
            other => panic!("unexpected {other:?}"),
        }

        let result = send(
            &h,
            alice(),
            Command::UpdateActivityStatus {
                user_principal_name: alice().user_principal_name,
            },
        )
        .await;
        assert!(matches!(
            result,
            ResponseResult::Ok(ResponsePayload::ActivityRecorded)
        ));

        let result = send(&h, alice(), Command::DestroyServer).await;
        assert!(matches!(result, ResponseResult::Ok(ResponsePayload::Destroyed)));

        match send(&h, alice(), Command::GetServer).await {
            ResponseResult::Ok(ResponsePayload::Server(server)) => {
                assert_eq!(server.status, ServerStatus::Destroyed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn deploy_for_someone_else_is_denied() {
        let h = handler();
        let result = send(
            &h,
            mallory(),
            Command::DeployServer {
                server: server_for(&alice()),
            },
        )
        .await;
        assert_eq!(error_code(result), ErrorCode::PermissionDenied);

        let mut spoofed = server_for(&alice());
        spoofed.user_principal_id = mallory().user_principal_id;
        let result = send(&h, mallory(), Command::UpdateServer { server: spoofed }).await;
        assert_eq!(error_code(result), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn heartbeat_for_someone_else_is_denied() {
        let h = handler();
        let result = send(
            &h,
            mallory(),
            Command::UpdateActivityStatus {
                user_principal_name: UserPrincipalName::new("alice@contoso.com"),
            },
        )
        .await;
        assert_eq!(error_code(result), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn unknown_principal_is_not_found() {
        let h = handler();
        assert_eq!(
            error_code(send(&h, alice(), Command::GetServer).await),
            ErrorCode::NotFound
        );
        assert_eq!(
            error_code(
                send(
                    &h,
                    alice(),
                    Command::UpdateServer {
                        server: server_for(&alice())
                    }
                )
                .await
            ),
            ErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn anonymous_caller_is_unauthorized() {
        let h = handler();
        let anonymous = Principal::new(UserPrincipalName::new(""), UserPrincipalId::new(""));
        assert_eq!(
            error_code(send(&h, anonymous.clone(), Command::GetServer).await),
            ErrorCode::Unauthorized
        );
        assert!(matches!(
            send(&h, anonymous, Command::Ping).await,
            ResponseResult::Ok(ResponsePayload::Pong)
        ));
    }

    #[tokio::test]
    async fn zero_inactivity_rejected() {
        let h = handler();
        let mut server = server_for(&alice());
        server.inactivity_duration_in_minutes = 0;
        let result = send(&h, alice(), Command::DeployServer { server }).await;
        assert_eq!(error_code(result), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn version_mismatch_rejected() {
        let h = handler();
        let mut request = Request::new(1, alice(), Command::Ping);
        request.api_version = API_VERSION + 1;
        let response = h.handle(request).await;
        assert_eq!(error_code(response.result), ErrorCode::UnsupportedVersion);
    }

    #[tokio::test]
    async fn health_reports_monitor() {
        let h = handler();
        match send(&h, alice(), Command::GetHealth).await {
            ResponseResult::Ok(ResponsePayload::Health(health)) => {
                assert!(health.store_healthy);
                assert!(!health.monitor_running);
                assert_eq!(health.monitor_restarts, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
