//! HTTP API панели управления: маршруты агента и действия оператора

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;
use uuid::Uuid;

use crate::{
    agent::{AgentError, AgentService, CheckInRequest, CheckInResponse, ResultReport},
    installer::Installer,
    models::{CommandStatus, InstallStatus, ManagedServer, ServerRole},
    security::tokens_match,
    store::{install_owned_here, StoreError},
};

#[derive(Clone)]
pub struct AppState {
    pub installer: Installer,
    pub agents: AgentService,
    pub operator_token: Option<Arc<str>>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound,
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            // Одинаковый ответ для неизвестного сервера и неверного токена
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "unauthorized".to_string(),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", "not found".to_string()),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Internal(message) => {
                error!("Внутренняя ошибка API: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Unauthorized => ApiError::Unauthorized,
            AgentError::CommandOutstanding(_) => ApiError::Conflict(err.to_string()),
            AgentError::EmptyCommand => ApiError::BadRequest(err.to_string()),
            AgentError::Store(e) => e.into(),
        }
    }
}

/// Состояние сервера для оператора, без секретов
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerView {
    pub id: Uuid,
    pub name: String,
    pub client: Option<String>,
    pub role: ServerRole,
    pub ipv4: String,
    pub ipv6: Option<String>,
    pub status: InstallStatus,
    pub installation_log: String,
    pub pending_command: Option<String>,
    pub command_status: Option<CommandStatus>,
    pub command_output: Option<String>,
    pub last_agent_check: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ManagedServer> for ServerView {
    fn from(server: &ManagedServer) -> Self {
        Self {
            id: server.id,
            name: server.name.clone(),
            client: server.client.clone(),
            role: server.role(),
            ipv4: server.ipv4.to_string(),
            ipv6: server.ipv6.map(|a| a.to_string()),
            status: server.status,
            installation_log: server.installation_log.clone(),
            pending_command: server.agent.pending_command.clone(),
            command_status: server.agent.command_status,
            command_output: server.agent.command_output.clone(),
            last_agent_check: server.agent.last_agent_check,
            updated_at: server.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueueCommandRequest {
    pub command: String,
    #[serde(default)]
    pub force: bool,
}

async fn agent_checkin(
    State(state): State<AppState>,
    Json(request): Json<CheckInRequest>,
) -> Result<Json<CheckInResponse>, ApiError> {
    Ok(Json(state.agents.check_in(&request).await?))
}

async fn agent_result(
    State(state): State<AppState>,
    Json(report): Json<ResultReport>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.agents.report_result(&report).await?;
    Ok(Json(json!({})))
}

async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServerView>, ApiError> {
    let server = state.installer.store().get(id).await?;
    Ok(Json(ServerView::from(&server)))
}

async fn start_install(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    // Задача установки продолжает работу после ответа
    let _handle = state.installer.start_install(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "serverId": id, "status": InstallStatus::Installing })),
    ))
}

async fn queue_command(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<QueueCommandRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let replaced = state
        .agents
        .queue_command(id, &request.command, request.force)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "serverId": id,
            "status": CommandStatus::Pending,
            "replaced": replaced.is_some(),
        })),
    ))
}

async fn reinstall_agent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let server = state.installer.store().get(id).await?;
    if server.status == InstallStatus::Installing {
        return Err(ApiError::Conflict(format!(
            "Сервер {} сейчас устанавливается",
            server.name
        )));
    }

    let installer = state.installer.clone();
    tokio::spawn(async move {
        if let Err(e) = installer.reinstall_agent(id).await {
            error!("Переустановка агента {} не удалась: {:#}", id, e);
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "serverId": id }))))
}

async fn require_operator(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match (provided, state.operator_token.as_deref()) {
        (Some(provided), Some(expected)) if tokens_match(provided, expected) => {
            Ok(next.run(request).await)
        }
        _ => Err(ApiError::Unauthorized),
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::<AppState>::new()
        .route("/api/agent/checkin", post(agent_checkin))
        .route("/api/agent/result", post(agent_result));

    if state.operator_token.is_some() {
        let operator = Router::<AppState>::new()
            .route("/api/servers/{id}", get(get_server))
            .route("/api/servers/{id}/install", post(start_install))
            .route("/api/servers/{id}/command", post(queue_command))
            .route("/api/servers/{id}/reinstall-agent", post(reinstall_agent))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_operator,
            ));
        router = router.merge(operator);
    } else {
        warn!("Токен оператора не задан, операторские маршруты отключены");
    }

    router.with_state(state)
}

/// Ожидает SIGINT или SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Не удалось установить обработчик SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Не удалось установить обработчик SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Получен SIGINT, завершаем работу..."),
        _ = terminate => info!("Получен SIGTERM, завершаем работу..."),
    }
}

/// Запускает HTTP-сервер до SIGINT/SIGTERM.
///
/// Установки, запущенные этим процессом и не завершённые к остановке,
/// переводятся в error, чтобы их можно было запустить повторно.
pub async fn serve(listen: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Не удалось открыть адрес {}", listen))?;
    info!("API панели управления слушает {}", listen);

    let store = Arc::clone(state.installer.store());
    let served = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Ошибка HTTP-сервера");

    store
        .recover_installs("API остановлен до завершения установки", install_owned_here)
        .await
        .context("Не удалось сохранить статус прерванных установок")?;
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        installer::tests::{installer_with, Behavior, FakeExecutor},
        models::tests::dns_definition,
        security::AuditTrail,
    };
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    const OPERATOR: &str = "operator-secret";

    async fn app(operator_token: Option<&str>) -> (Router, Uuid, String) {
        let fake = Arc::new(FakeExecutor::slow(
            Behavior::Exit(0, "ok"),
            Duration::from_millis(200),
        ));
        let (installer, id) = installer_with(dns_definition(), fake).await;
        let token = installer
            .vault()
            .decrypt(&installer.store().get(id).await.unwrap().agent.token)
            .unwrap();
        let agents = AgentService::new(
            Arc::clone(installer.store()),
            Arc::clone(installer.vault()),
            AuditTrail::disabled(),
        );
        let state = AppState {
            installer,
            agents,
            operator_token: operator_token.map(Arc::from),
        };
        (build_router(state), id, token)
    }

    fn post_json(uri: &str, body: serde_json::Value, bearer: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(bearer) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_authorized(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {OPERATOR}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn checkin_with_bad_token_is_indistinguishable() {
        let (router, id, _) = app(Some(OPERATOR)).await;

        let wrong_token = router
            .clone()
            .oneshot(post_json(
                "/api/agent/checkin",
                json!({"serverId": id, "token": "nope"}),
                None,
            ))
            .await
            .unwrap();
        let unknown_id = router
            .oneshot(post_json(
                "/api/agent/checkin",
                json!({"serverId": Uuid::new_v4(), "token": "nope"}),
                None,
            ))
            .await
            .unwrap();

        assert_eq!(wrong_token.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown_id.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(wrong_token).await, body_json(unknown_id).await);
    }

    #[tokio::test]
    async fn queued_command_reaches_agent() {
        let (router, id, token) = app(Some(OPERATOR)).await;

        let queued = router
            .clone()
            .oneshot(post_json(
                &format!("/api/servers/{id}/command"),
                json!({"command": "systemctl is-active unbound"}),
                Some(OPERATOR),
            ))
            .await
            .unwrap();
        assert_eq!(queued.status(), StatusCode::ACCEPTED);

        let conflict = router
            .clone()
            .oneshot(post_json(
                &format!("/api/servers/{id}/command"),
                json!({"command": "uptime"}),
                Some(OPERATOR),
            ))
            .await
            .unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let checkin = router
            .clone()
            .oneshot(post_json(
                "/api/agent/checkin",
                json!({"serverId": id, "token": token, "type": "dns"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(checkin.status(), StatusCode::OK);
        let delivered = body_json(checkin).await;
        assert_eq!(delivered["command"], "systemctl is-active unbound");
        let command_id = delivered["commandId"].as_str().unwrap().to_string();

        let result = router
            .clone()
            .oneshot(post_json(
                "/api/agent/result",
                json!({
                    "serverId": id,
                    "token": token,
                    "commandId": command_id,
                    "output": "active",
                    "exitCode": 0
                }),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(result.status(), StatusCode::OK);

        let view = router
            .oneshot(get_authorized(&format!("/api/servers/{id}")))
            .await
            .unwrap();
        let view = body_json(view).await;
        assert_eq!(view["commandStatus"], "done");
        assert_eq!(view["commandOutput"], "active");
        assert!(view.get("ssh").is_none());
    }

    #[tokio::test]
    async fn install_returns_before_remote_work() {
        let (router, id, _) = app(Some(OPERATOR)).await;

        let response = router
            .clone()
            .oneshot(post_json(&format!("/api/servers/{id}/install"), json!({}), Some(OPERATOR)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["status"], "installing");

        let view = router
            .clone()
            .oneshot(get_authorized(&format!("/api/servers/{id}")))
            .await
            .unwrap();
        assert_eq!(body_json(view).await["status"], "installing");

        let again = router
            .oneshot(post_json(&format!("/api/servers/{id}/install"), json!({}), Some(OPERATOR)))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn operator_routes_need_bearer() {
        let (router, id, _) = app(Some(OPERATOR)).await;
        let response = router
            .clone()
            .oneshot(post_json(&format!("/api/servers/{id}/install"), json!({}), Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let missing = router
            .oneshot(get_authorized(&format!("/api/servers/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn operator_routes_disabled_without_token() {
        let (router, id, _) = app(None).await;
        let response = router
            .oneshot(post_json(&format!("/api/servers/{id}/install"), json!({}), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
