use crate::config::{self, Credentials};
use crate::proxy::Proxy;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flint::logging::{error, info, warn};
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::services::ServeDir;

/// The WebSocket subprotocol fixed by the browser-side protocol client.
const SUBPROTOCOL: &str = "guacamole";

/// Assembles the HTTP surface of the proxy.
pub fn routers(proxy: Arc<Proxy>) -> Router {
    let mut router = Router::new()
        .route("/api/v1/login", post(login))
        .route("/api/v1/connect", get(connect))
        .route("/api/v1/ping", get(ping));

    if proxy.config().client {
        router = router.nest_service("/static", ServeDir::new("client/dist"));
    }

    router.with_state(proxy)
}

#[derive(Serialize)]
struct TokenReply {
    token: String,
}

#[derive(Serialize)]
struct ErrorReply {
    message: String,
}

#[derive(Serialize)]
struct PingReply {
    version: &'static str,
    build_time: &'static str,
    git_commit: &'static str,
}

#[derive(Deserialize)]
struct ConnectQuery {
    token: Option<String>,
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorReply {
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorReply {
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// `POST /api/v1/login`: exchanges a credential quadruple for a signed
/// token.
async fn login(State(proxy): State<Arc<Proxy>>, Json(creds): Json<Credentials>) -> Response {
    if creds.protocol.is_empty() || creds.host.is_empty() || creds.password.is_empty() {
        return bad_request("protocol, host and password are required");
    }

    match proxy.auth().issue(&creds) {
        Ok(token) => {
            info!(proxy.log(), "token issued"; "protocol" => %creds.protocol, "host" => %creds.host);
            Json(TokenReply { token }).into_response()
        }
        Err(e) => {
            error!(proxy.log(), "token signing failed"; "error" => %e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorReply {
                    message: "token signing failed".into(),
                }),
            )
                .into_response()
        }
    }
}

/// `GET /api/v1/ping`: build metadata.
async fn ping() -> Json<PingReply> {
    Json(PingReply {
        version: config::VERSION,
        build_time: config::BUILD_TIME,
        git_commit: config::GIT_COMMIT,
    })
}

/// `GET /api/v1/connect?token=…`: upgrades to a WebSocket and routes the
/// viewer into its shared session. Upgrades that do not offer the
/// `guacamole` subprotocol are rejected before the handshake completes.
async fn connect(
    State(proxy): State<Arc<Proxy>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let offered = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').any(|p| p.trim() == SUBPROTOCOL))
        .unwrap_or(false);
    if !offered {
        return bad_request("the guacamole subprotocol is required");
    }

    let token = match query.token.or_else(|| bearer_token(&headers)) {
        Some(token) => token,
        None => return unauthorized("missing token"),
    };
    let creds = match proxy.auth().verify(&token) {
        Ok(creds) => creds,
        Err(e) => {
            warn!(proxy.log(), "token rejected"; "error" => %e);
            return unauthorized("invalid token");
        }
    };

    ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| async move {
        if let Err(e) = proxy.route(socket, creds).await {
            error!(proxy.log(), "route connection failed"; "error" => %e);
        }
    })
}

/// Token lookup fallback: `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi".to_string()));

        headers.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
