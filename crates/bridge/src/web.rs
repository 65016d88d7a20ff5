use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::bridge::Bridge;
use crate::config::MqttConfig;
use crate::error::BridgeError;
use crate::model::{CommandDefinition, CommandForm, SensorDefinition, SensorForm};

const INDEX_HTML: &str = include_str!("ui/index.html");

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// JSON error body with the status code the failure maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        let (status, code) = match &e {
            BridgeError::InvalidConfiguration(_) => (StatusCode::BAD_REQUEST, "INVALID_CONFIGURATION"),
            BridgeError::UnknownNode(_) | BridgeError::UnknownDefinition { .. } => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            BridgeError::TransportUnavailable(_)
            | BridgeError::ConnectionFailure(_)
            | BridgeError::LookupFailure { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
        };
        Self {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ActionBody {
    action: String,
}

#[derive(Deserialize)]
struct TextBody {
    text: String,
}

#[derive(Deserialize)]
struct LevelBody {
    level: String,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(bridge: Bridge) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/settings", get(get_settings))
        .route("/api/settings/mqtt", put(put_mqtt))
        .route("/api/settings/log_level", put(put_log_level))
        .route("/api/nodes/{id}", get(get_node).delete(clear_node))
        .route("/api/nodes/{id}/enable", post(enable_node))
        .route("/api/nodes/{id}/disable", post(disable_node))
        .route("/api/nodes/{id}/sensors", post(add_sensor))
        .route("/api/nodes/{id}/sensors/{name}", delete(remove_sensor))
        .route("/api/nodes/{id}/commands", post(add_command))
        .route(
            "/api/nodes/{id}/commands/{name}",
            post(execute_command).delete(remove_command),
        )
        .route("/api/nodes/{id}/messages", post(send_text))
        .with_state(bridge)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(bridge): State<Bridge>) -> impl IntoResponse {
    Json(bridge.status().await)
}

async fn get_settings(State(bridge): State<Bridge>) -> impl IntoResponse {
    Json(bridge.settings())
}

async fn put_mqtt(
    State(bridge): State<Bridge>,
    Json(mqtt): Json<MqttConfig>,
) -> ApiResult<StatusCode> {
    bridge.reconfigure(mqtt).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_log_level(
    State(bridge): State<Bridge>,
    Json(body): Json<LevelBody>,
) -> ApiResult<StatusCode> {
    bridge.set_log_level(&body.level).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_node(State(bridge): State<Bridge>, Path(id): Path<String>) -> ApiResult<Response> {
    Ok(Json(bridge.node_view(&id).await?).into_response())
}

async fn enable_node(State(bridge): State<Bridge>, Path(id): Path<String>) -> StatusCode {
    bridge.enable_node(&id).await;
    StatusCode::NO_CONTENT
}

async fn disable_node(
    State(bridge): State<Bridge>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    bridge.disable_node(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_node(State(bridge): State<Bridge>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    bridge.clear_node(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_sensor(
    State(bridge): State<Bridge>,
    Path(id): Path<String>,
    Json(form): Json<SensorForm>,
) -> ApiResult<StatusCode> {
    let def = SensorDefinition::try_from(form)?;
    bridge.add_sensor(&id, def).await?;
    Ok(StatusCode::CREATED)
}

async fn remove_sensor(
    State(bridge): State<Bridge>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    bridge.remove_sensor(&id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_command(
    State(bridge): State<Bridge>,
    Path(id): Path<String>,
    Json(form): Json<CommandForm>,
) -> ApiResult<StatusCode> {
    let def = CommandDefinition::try_from(form)?;
    bridge.add_command(&id, def).await?;
    Ok(StatusCode::CREATED)
}

async fn remove_command(
    State(bridge): State<Bridge>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    bridge.remove_command(&id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_command(
    State(bridge): State<Bridge>,
    Path((id, name)): Path<(String, String)>,
    Json(body): Json<ActionBody>,
) -> ApiResult<StatusCode> {
    bridge.execute_command(&id, &name, &body.action).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn send_text(
    State(bridge): State<Bridge>,
    Path(id): Path<String>,
    Json(body): Json<TextBody>,
) -> ApiResult<StatusCode> {
    bridge.send_text(&id, &body.text).await?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(bridge: Bridge, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web ui listening");

    axum::serve(listener, router(bridge))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::bridge;
    use crate::link::LinkStatus;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const N: &str = "!a1b2c3";

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    // -- pages ----------------------------------------------------------------

    #[tokio::test]
    async fn index_is_html() {
        let (b, _ch) = bridge();
        let res = router(b)
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }

    #[tokio::test]
    async fn status_lists_links_and_nodes() {
        let (b, _ch) = bridge();
        b.enable_node(N).await;
        let app = router(b);
        let (status, body) = call(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], json!([N]));
        assert_eq!(body["links"][0]["name"], "mesh");
        assert_eq!(body["links"][1]["status"]["state"], "disconnected");
        assert!(body["revision"].as_u64().unwrap() >= 1);
        assert_eq!(body["log_level"], "INFO");
        assert_eq!(body["nodes"][0]["id"], N);
    }

    #[tokio::test]
    async fn status_revision_tracks_mutations() {
        let (b, _ch) = bridge();
        let app = router(b.clone());
        let (_, before) = call(&app, Method::GET, "/api/status", None).await;
        b.handle_line(r#"{"fromId":"!a1b2c3","decoded":{"text":"hi"}}"#).await;
        let (status, after) = call(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(after["revision"].as_u64() > before["revision"].as_u64());
        assert_eq!(after["activity"]["packets"], 1);
        assert_eq!(after["links"].as_array().unwrap().len(), 2);
    }

    // -- node lifecycle -------------------------------------------------------

    #[tokio::test]
    async fn node_crud_roundtrip() {
        let (b, _ch) = bridge();
        let app = router(b);
        let node = format!("/api/nodes/{N}");

        let (s, _) = call(&app, Method::POST, &format!("{node}/enable"), None).await;
        assert_eq!(s, StatusCode::NO_CONTENT);

        let sensor = json!({"name": "leak", "pattern": "leak", "value_type": "binary", "delay_off": 30});
        let (s, _) = call(&app, Method::POST, &format!("{node}/sensors"), Some(sensor.clone())).await;
        assert_eq!(s, StatusCode::CREATED);
        let (s, body) = call(&app, Method::POST, &format!("{node}/sensors"), Some(sensor)).await;
        assert_eq!(s, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_CONFIGURATION");

        let (s, body) = call(&app, Method::GET, &node, None).await;
        assert_eq!(s, StatusCode::OK);
        assert_eq!(body["sensors"][0]["name"], "leak");
        assert_eq!(body["states"]["leak"]["value"], "OFF");

        let (s, _) = call(&app, Method::DELETE, &format!("{node}/sensors/leak"), None).await;
        assert_eq!(s, StatusCode::NO_CONTENT);
        let (s, _) = call(&app, Method::DELETE, &format!("{node}/sensors/leak"), None).await;
        assert_eq!(s, StatusCode::NOT_FOUND);

        let (s, _) = call(&app, Method::DELETE, &node, None).await;
        assert_eq!(s, StatusCode::NO_CONTENT);
        let (s, _) = call(&app, Method::GET, &node, None).await;
        assert_eq!(s, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_command_shape_is_rejected() {
        let (b, _ch) = bridge();
        b.enable_node(N).await;
        let app = router(b);
        let body = json!({"name": "pump", "single_press": "go", "on_message": "on"});
        let (s, _) = call(&app, Method::POST, &format!("/api/nodes/{N}/commands"), Some(body)).await;
        assert_eq!(s, StatusCode::BAD_REQUEST);
    }

    // -- commands and text ----------------------------------------------------

    #[tokio::test]
    async fn execute_maps_transport_state() {
        let (b, mut ch) = bridge();
        b.enable_node(N).await;
        b.add_command(N, CommandDefinition::single_press("ping", "ping!").unwrap())
            .await
            .unwrap();
        let app = router(b.clone());
        let uri = format!("/api/nodes/{N}/commands/ping");

        let (s, _) = call(&app, Method::POST, &uri, Some(json!({"action": "press"}))).await;
        assert_eq!(s, StatusCode::SERVICE_UNAVAILABLE);

        b.mesh().link().set(LinkStatus::Connected);
        let (s, _) = call(&app, Method::POST, &uri, Some(json!({"action": "on"}))).await;
        assert_eq!(s, StatusCode::BAD_REQUEST);
        let (s, _) = call(&app, Method::POST, &uri, Some(json!({"action": "press"}))).await;
        assert_eq!(s, StatusCode::ACCEPTED);
        assert!(ch.mesh_outgoing.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_text() {
        let (b, mut ch) = bridge();
        b.mesh().link().set(LinkStatus::Connected);
        let app = router(b);
        let (s, _) = call(
            &app,
            Method::POST,
            "/api/nodes/broadcast/messages",
            Some(json!({"text": "hello all"})),
        )
        .await;
        assert_eq!(s, StatusCode::ACCEPTED);
        assert_eq!(ch.mesh_outgoing.try_recv().unwrap(), r#"{"sendText":"hello all"}"#);
    }

    // -- settings -------------------------------------------------------------

    #[tokio::test]
    async fn settings_updates() {
        let (b, mut ch) = bridge();
        let app = router(b);

        let (s, _) = call(&app, Method::PUT, "/api/settings/log_level", Some(json!({"level": "WARNING"}))).await;
        assert_eq!(s, StatusCode::NO_CONTENT);
        let (s, _) = call(&app, Method::PUT, "/api/settings/log_level", Some(json!({"level": "LOUD"}))).await;
        assert_eq!(s, StatusCode::BAD_REQUEST);

        let mqtt = json!({"host": "broker.lan", "port": 1884});
        let (s, _) = call(&app, Method::PUT, "/api/settings/mqtt", Some(mqtt)).await;
        assert_eq!(s, StatusCode::NO_CONTENT);
        assert_eq!(ch.settings.borrow_and_update().host, "broker.lan");

        let (_, body) = call(&app, Method::GET, "/api/settings", None).await;
        assert_eq!(body["mqtt"]["port"], 1884);
        assert_eq!(body["log_level"], "WARNING");
    }
}
