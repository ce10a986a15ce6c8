use async_trait::async_trait;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::{net::TcpListener, sync::mpsc, time::timeout};
use toolwire::{
    client::{self, ClientHandler},
    registry::StaticContent,
    session::Session,
    tool_fn,
    transport::TransportKind,
    ConnectionConfig, Error, ErrorCode, Notification, ParameterType, PromptDefinition,
    ResourceDefinition, Server, ToolDefinition, ToolParameter,
};

fn echo_server() -> Server {
    let server = Server::builder("echo-server", "1.0.0")
        .description("repeats what it hears")
        .build();
    server.register_tool(
        ToolDefinition::new("echo", "Repeat a message")
            .param(ToolParameter::new("message", ParameterType::String).description("text to repeat"))
            .category("text"),
        tool_fn(|args: Map<String, Value>| async move {
            let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
            Ok::<_, Error>(json!(format!("Echo: {message}")))
        }),
    );
    server.register_tool(
        ToolDefinition::new("sleep", "Wait, then answer")
            .param(ToolParameter::new("ms", ParameterType::Integer))
            .category("time"),
        tool_fn(|args: Map<String, Value>| async move {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, Error>(json!(ms))
        }),
    );
    server
}

async fn serve_ws(server: &Server) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_websocket(listener).await });
    url
}

async fn serve_http(server: &Server) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_http(listener).await });
    url
}

struct Recorder(mpsc::UnboundedSender<Notification>);

#[async_trait]
impl ClientHandler for Recorder {
    async fn handle_notification(&self, notification: Notification) -> Result<(), Error> {
        let _ = self.0.send(notification);
        Ok(())
    }
}

#[tokio::test]
async fn echo_over_the_stream_transport() {
    let server = echo_server();
    let url = serve_ws(&server).await;

    let session = client::connect(&url).await.unwrap();
    assert_eq!(session.transport_kind(), TransportKind::Stream);
    assert_eq!(session.server_info().unwrap().name, "echo-server");
    assert!(session.available_tools().iter().any(|t| t.name == "echo"));

    let reply = session.call_tool("echo", json!({"message": "hi"})).await.unwrap();
    assert_eq!(reply, json!("Echo: hi"));

    let err = session.call_tool("missing", json!({})).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ToolNotFound));
    assert!(!err.is_transport());

    session.disconnect().await.unwrap();
    assert!(!session.is_connected());
    assert!(matches!(
        session.call_tool("echo", json!({"message": "hi"})).await,
        Err(Error::NotConnected)
    ));

    session.reconnect().await.unwrap();
    let reply = session.call_tool("echo", json!({"message": "hi"})).await.unwrap();
    assert_eq!(reply, json!("Echo: hi"));

    session.disconnect().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn echo_over_the_request_transport() {
    let server = echo_server();
    let url = serve_http(&server).await;

    let session = client::connect(&url).await.unwrap();
    assert_eq!(session.transport_kind(), TransportKind::Request);
    assert_eq!(session.available_tools().len(), 2);

    let reply = session.call_tool("echo", json!({"message": "hi"})).await.unwrap();
    assert_eq!(reply, json!("Echo: hi"));

    let err = session.call_tool("echo", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidParams));

    let err = session.call_tool("echo", json!(["hi"])).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidParams));

    // notifications over http are best-effort and never raise
    session.notify("progress", Some(json!({"pct": 10}))).await;

    session.disconnect().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn concurrent_calls_resolve_their_own_callers() {
    let server = echo_server();
    let url = serve_ws(&server).await;
    let session = client::connect(&url).await.unwrap();

    // slower calls first, so replies come back in reverse order
    let calls = (0..8u64).rev().map(|n| {
        let session = session.clone();
        async move { (n, session.call_tool("sleep", json!({"ms": n * 15})).await) }
    });
    for (n, result) in join_all(calls).await {
        assert_eq!(result.unwrap(), json!(n * 15));
    }

    session.disconnect().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn server_notifications_reach_the_client_handler_in_order() {
    let server = echo_server();
    let url = serve_ws(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = Session::builder(ConnectionConfig::parse(&url).unwrap())
        .handler(Recorder(tx))
        .connect()
        .await
        .unwrap();

    assert_eq!(server.notify("notifications/progress", Some(json!({"pct": 50}))), 1);
    assert_eq!(server.notify("notifications/progress", Some(json!({"pct": 100}))), 1);

    for pct in [50, 100] {
        let notification = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.method, "notifications/progress");
        assert_eq!(notification.params, Some(json!({"pct": pct})));
    }

    session.disconnect().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn catalog_methods_round_trip() {
    let server = echo_server();
    server.register_resource(
        ResourceDefinition::new("mem://logo", "logo").mime_type("image/png"),
        StaticContent::Binary(vec![0x89, 0x50, 0x4e, 0x47]),
    );
    server.register_prompt(
        PromptDefinition::new("greet", "Say hello to {name}")
            .description("greeting")
            .argument("name", true),
    );
    let url = serve_ws(&server).await;
    let session = client::connect(&url).await.unwrap();

    let text_tools = session.list_tools(Some("text")).await.unwrap();
    assert_eq!(text_tools.len(), 1);
    assert_eq!(text_tools[0].name, "echo");

    let found = session.search_tools("wait").await.unwrap();
    assert_eq!(found[0].name, "sleep");

    let echo = session.describe_tool("echo").await.unwrap();
    assert_eq!(echo.required_parameters(), vec!["message"]);
    assert_eq!(session.tool("echo").unwrap(), echo);

    let caps = session.capabilities().await.unwrap();
    assert!(caps.tools);

    let resources = session.list_resources().await.unwrap();
    assert_eq!(resources[0].uri, "mem://logo");
    let contents = session.read_resource("mem://logo").await.unwrap();
    assert_eq!(
        contents[0].blob_bytes().unwrap(),
        Some(vec![0x89, 0x50, 0x4e, 0x47])
    );
    assert_eq!(contents[0].mime_type.as_deref(), Some("image/png"));

    let prompts = session.list_prompts().await.unwrap();
    assert_eq!(prompts[0].name, "greet");
    let mut arguments = Map::new();
    arguments.insert("name".into(), json!("Ada"));
    let prompt = session.get_prompt("greet", arguments).await.unwrap();
    assert_eq!(prompt.description.as_deref(), Some("greeting"));
    assert_eq!(prompt.messages.len(), 1);

    let err = session.get_prompt("greet", Map::new()).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidParams));

    let err = session.request("tools/delete", None).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::MethodNotFound));

    session.shutdown().await.unwrap();
    assert!(!session.is_connected());
    server.shutdown();
}

#[tokio::test]
async fn tools_registered_later_show_up_after_a_refresh() {
    let server = echo_server();
    let url = serve_ws(&server).await;
    let session = client::connect(&url).await.unwrap();
    assert!(session.tool("upper").is_none());

    server.register_tool(
        ToolDefinition::new("upper", "Uppercase a message")
            .param(ToolParameter::new("message", ParameterType::String)),
        tool_fn(|args: Map<String, Value>| async move {
            let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
            Ok::<_, Error>(json!(message.to_uppercase()))
        }),
    );

    // the call goes to the server even before the cache knows the tool
    let reply = session.call_tool("upper", json!({"message": "hi"})).await.unwrap();
    assert_eq!(reply, json!("HI"));

    session.list_tools(None).await.unwrap();
    assert!(session.tool("upper").is_some());

    session.disconnect().await.unwrap();
    server.shutdown();
}
