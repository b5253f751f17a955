use crate::gateway::Gateway;
use crate::session;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

pub fn gateway_routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let stats = gateway.stats().await;
    let status = if gateway.is_closed().await {
        "shutting_down"
    } else {
        "ok"
    };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": stats.sessions,
        "connections": stats.connections,
    }))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// Authenticate, then upgrade. The token comes from `?token=` or a bearer header.
async fn ws_upgrade(
    State(gateway): State<Arc<Gateway>>,
    Query(params): Query<WsParams>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if gateway.is_closed().await {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
    }

    let token = params
        .token
        .or_else(|| bearer.map(|TypedHeader(auth)| auth.token().to_string()));
    let user = match gateway.authenticate(token.as_deref()).await {
        Ok(user) => user,
        Err(e) => {
            debug!(error = %e, "Rejected WebSocket client");
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    upgrade
        .on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| session::run(gateway, socket, user))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCredentialStore, EndpointTable, GatewaySettings, StaticTokenValidator, TokenEntry};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    fn app() -> (Arc<Gateway>, Router) {
        let validator = StaticTokenValidator::new(vec![TokenEntry {
            token: "t-alice".to_string(),
            user_id: "alice".to_string(),
            username: Some("Alice".to_string()),
        }]);
        let gateway = Arc::new(
            Gateway::new(
                GatewaySettings::default(),
                EndpointTable::default(),
                Arc::new(validator),
                Arc::new(ConfigCredentialStore::default()),
            )
            .unwrap(),
        );
        (gateway.clone(), crate::build_router(gateway))
    }

    async fn get(app: Router, uri: &str, bearer: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = bearer {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = app();
        let (status, body) = get(app, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_ws_rejects_bad_tokens() {
        let (_, app) = app();
        let (status, body) = get(app.clone(), "/ws", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = get(app.clone(), "/ws?token=t-mallory", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get(app, "/ws", Some("t-mallory")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ws_valid_token_still_needs_upgrade() {
        let (_, app) = app();
        // A plain GET passes auth but is not an upgrade request.
        let (status, _) = get(app.clone(), "/ws?token=t-alice", None).await;
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get(app, "/ws", Some("t-alice")).await;
        assert_ne!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ws_unavailable_after_shutdown() {
        let (gateway, app) = app();
        gateway.shutdown().await;
        let (status, body) = get(app.clone(), "/ws?token=t-alice", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "service unavailable");

        let (_, body) = get(app, "/health", None).await;
        assert_eq!(body["status"], "shutting_down");
    }
}
