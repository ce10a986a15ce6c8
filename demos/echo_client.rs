use serde_json::json;
use std::time::Duration;
use toolwire::{client, ConnectionConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ws:// picks the stream transport, http:// the request transport
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8780".to_string());
    let config = ConnectionConfig::parse(&url)?.with_timeout(Duration::from_secs(10));
    let session = client::connect_with(config).await?;

    if let Some(info) = session.server_info() {
        tracing::info!("connected to {} {}", info.name, info.version);
    }
    for tool in session.available_tools() {
        tracing::info!("tool {}: {}", tool.name, tool.description);
    }

    let reply = session
        .call_tool("echo", json!({"message": "hello", "times": 2}))
        .await?;
    tracing::info!("echo replied {reply}");

    match session.call_tool("missing", json!({})).await {
        Ok(value) => tracing::warn!("unexpected reply {value}"),
        Err(e) => tracing::info!("missing tool rejected: {e}"),
    }

    for contents in session.read_resource("mem://readme").await? {
        tracing::info!("readme: {}", contents.text.unwrap_or_default());
    }

    session.disconnect().await?;
    Ok(())
}
