//! Request binding served with axum
//!
//! POST on the RPC path carries one envelope and answers with one response.
//! Notifications get `202 Accepted` and no body. GET on `/health` reports the
//! server identity.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::{error::Error, server::Server};

pub const HEALTH_PATH: &str = "/health";

/// Router exposing `server` on its RPC path and the health path
pub fn router(server: Server) -> Router {
    let rpc_path = server.rpc_path().to_string();
    Router::new()
        .route(&rpc_path, post(handle_rpc))
        .route(HEALTH_PATH, get(health))
        .with_state(server)
}

async fn handle_rpc(State(server): State<Server>, body: String) -> Response {
    match server.dispatcher().handle_text(&body).await {
        Some(reply) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            reply,
        )
            .into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health(State(server): State<Server>) -> Json<Value> {
    let info = server.info();
    Json(json!({
        "status": "ok",
        "name": info.name,
        "version": info.version,
    }))
}

pub(crate) async fn serve(server: Server, listener: TcpListener) -> Result<(), Error> {
    let addr = listener.local_addr()?;
    info!(%addr, path = %server.rpc_path(), "serving http");
    let mut signal = server.shutdown_signal();
    axum::serve(listener, router(server))
        .with_graceful_shutdown(async move { super::shutdown_requested(&mut signal).await })
        .await?;
    info!(%addr, "http listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::tool_fn,
        types::{ParameterType, ToolDefinition, ToolParameter},
    };
    use serde_json::Map;

    async fn spawn_server() -> (Server, String) {
        let server = Server::builder("http-test", "0.3.0").build();
        server.register_tool(
            ToolDefinition::new("echo", "Repeat a message")
                .param(ToolParameter::new("message", ParameterType::String)),
            tool_fn(|args: Map<String, Value>| async move {
                Ok::<_, Error>(json!(format!(
                    "Echo: {}",
                    args["message"].as_str().unwrap_or_default()
                )))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let serving = server.clone();
        tokio::spawn(async move { serving.serve_http(listener).await });
        (server, base)
    }

    #[tokio::test]
    async fn rpc_endpoint_answers_requests_and_accepts_notifications() {
        let (server, base) = spawn_server().await;
        let client = reqwest::Client::new();

        let reply: Value = client
            .post(format!("{base}/rpc"))
            .body(r#"{"jsonrpc":"2.0","id":"a1","method":"tools/call","params":{"tool":"echo","arguments":{"message":"hi"}}}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reply["id"], "a1");
        assert_eq!(reply["result"]["result"], "Echo: hi");

        let accepted = client
            .post(format!("{base}/rpc"))
            .body(r#"{"jsonrpc":"2.0","method":"progress"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);

        let garbage: Value = client
            .post(format!("{base}/rpc"))
            .body("{oops")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(garbage["id"], Value::Null);
        assert_eq!(garbage["error"]["code"], -32700);

        server.shutdown();
    }

    #[tokio::test]
    async fn health_reports_identity() {
        let (server, base) = spawn_server().await;
        let health: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health, json!({"status": "ok", "name": "http-test", "version": "0.3.0"}));
        server.shutdown();
    }
}
