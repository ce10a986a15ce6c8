//! Server side
//!
//! The [`Dispatcher`] turns one inbound envelope into at most one response. It
//! is binding-agnostic: the HTTP endpoint and the WebSocket accept loop both
//! feed it raw text and write back whatever it returns. A [`Server`] bundles a
//! dispatcher with a notification broadcast channel and a shutdown signal.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::{collections::HashSet, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{broadcast, watch},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    error::{Error, ErrorCode},
    protocol::{self, parse_params, Message, Method, Notification, Request, Response, PROTOCOL_VERSION},
    registry::{ResourceReader, ToolHandler, ToolRegistry},
    types::{
        CallToolParams, CallToolResult, Capabilities, DescribeToolParams, GetPromptParams,
        GetPromptResult, InitializeParams, InitializeResult, ListPromptsResult,
        ListResourcesResult, ListToolsParams, ListToolsResult, MessageContent, PromptDefinition,
        PromptMessage, ReadResourceParams, ReadResourceResult, ResourceDefinition, ServerInfo,
        ToolDefinition,
    },
};

pub mod http;
pub mod websocket;

const EVENT_CAPACITY: usize = 256;

/// Routes requests to the registry
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    info: Arc<ServerInfo>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, info: ServerInfo) -> Self {
        Self {
            registry,
            info: Arc::new(info),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Handles one encoded envelope
    ///
    /// Returns the encoded response, or `None` when the input was a
    /// notification or a stray response and nothing is sent back.
    pub async fn handle_text(&self, text: &str) -> Option<String> {
        let response = match protocol::decode(text) {
            Ok(message) => self.handle_message(message).await?,
            Err(e) => {
                warn!("rejecting undecodable input: {e}");
                e.into_response()
            }
        };
        match protocol::encode(&Message::Response(response)) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                error!("failed to encode response: {e}");
                None
            }
        }
    }

    pub async fn handle_message(&self, message: Message) -> Option<Response> {
        match message {
            Message::Request(request) => Some(self.dispatch(request).await),
            Message::Notification(notification) => {
                debug!(method = %notification.method, "client notification");
                None
            }
            Message::Response(response) => {
                warn!(id = %response.id, "ignoring response sent to server");
                None
            }
        }
    }

    /// Routes one request. Every failure becomes an error response with the
    /// request's id.
    pub async fn dispatch(&self, request: Request) -> Response {
        let id = request.id.clone();
        let method = request.method.clone();
        match self.route(request).await {
            Ok(result) => {
                debug!(%id, %method, "request succeeded");
                Response::success(id, result)
            }
            Err(err) => {
                debug!(%id, %method, "request failed: {err}");
                Response::error(id, err.into())
            }
        }
    }

    async fn route(&self, request: Request) -> Result<Value, Error> {
        let method: Method = request.method.parse()?;
        let params = request.params;
        match method {
            Method::Initialize => {
                if let Some(Ok(init)) =
                    params.map(serde_json::from_value::<InitializeParams>)
                {
                    info!(
                        client = %init.client_info.name,
                        version = %init.client_info.version,
                        protocol = %init.protocol_version,
                        "client initializing"
                    );
                }
                to_result(InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    server_info: (*self.info).clone(),
                })
            }
            Method::Shutdown => {
                info!("shutdown requested by client");
                Ok(Value::Null)
            }
            Method::ServerInfo => to_result(&*self.info),
            Method::ServerCapabilities => to_result(&self.info.capabilities),
            Method::ListTools => {
                let params: ListToolsParams = parse_params(params)?;
                to_result(ListToolsResult {
                    tools: self
                        .list_tools(&params)
                        .iter()
                        .map(ToolDefinition::to_schema)
                        .collect(),
                })
            }
            Method::DescribeTool => {
                let params: DescribeToolParams = parse_params(params)?;
                let definition = self
                    .registry
                    .definition(&params.tool)
                    .ok_or_else(|| tool_not_found(&params.tool))?;
                to_result(definition.to_schema())
            }
            Method::CallTool => self.call_tool(parse_params(params)?).await,
            Method::ListResources => to_result(ListResourcesResult {
                resources: self.registry.list_resources(),
            }),
            Method::ReadResource => {
                let params: ReadResourceParams = parse_params(params)?;
                let contents = self.registry.read_resource(&params.uri).await?;
                to_result(ReadResourceResult {
                    contents: vec![contents],
                })
            }
            Method::ListPrompts => to_result(ListPromptsResult {
                prompts: self.registry.list_prompts(),
            }),
            Method::GetPrompt => {
                let params: GetPromptParams = parse_params(params)?;
                let prompt = self.registry.prompt(&params.name).ok_or_else(|| {
                    Error::protocol_with_data(
                        ErrorCode::InvalidParams,
                        format!("prompt not found: {}", params.name),
                        json!({ "name": params.name }),
                    )
                })?;
                let text = prompt.render(&params.arguments)?;
                to_result(GetPromptResult {
                    description: prompt.description,
                    messages: vec![PromptMessage {
                        role: "user".to_string(),
                        content: MessageContent::Text { text },
                    }],
                })
            }
        }
    }

    fn list_tools(&self, params: &ListToolsParams) -> Vec<ToolDefinition> {
        let tools = self.registry.list_tools(params.category.as_deref());
        match params.query.as_deref() {
            None => tools,
            Some(query) => {
                let matching: HashSet<String> = self
                    .registry
                    .search(query)
                    .into_iter()
                    .map(|t| t.name)
                    .collect();
                tools
                    .into_iter()
                    .filter(|t| matching.contains(&t.name))
                    .collect()
            }
        }
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<Value, Error> {
        let CallToolParams { tool: name, arguments } = params;
        let tool = self
            .registry
            .tool(&name)
            .ok_or_else(|| tool_not_found(&name))?;

        tool.definition().validate_arguments(&arguments)?;
        let arguments = tool.definition().apply_defaults(arguments);

        // a panicking tool fails its own call, not the connection
        let invocation = tokio::spawn(async move { tool.invoke(arguments).await }).await;
        match invocation {
            Ok(Ok(result)) => to_result(CallToolResult { tool: name, result }),
            Ok(Err(err)) => {
                warn!(tool = %name, "tool failed: {err}");
                let message = match err {
                    Error::Protocol { message, .. } => message,
                    other => other.to_string(),
                };
                Err(Error::protocol_with_data(
                    ErrorCode::ToolExecutionError,
                    message,
                    json!({ "tool": name }),
                ))
            }
            Err(join_err) => {
                error!(tool = %name, "tool panicked: {join_err}");
                Err(Error::protocol_with_data(
                    ErrorCode::ToolExecutionError,
                    format!("tool `{name}` panicked"),
                    json!({ "tool": name }),
                ))
            }
        }
    }
}

fn tool_not_found(name: &str) -> Error {
    Error::protocol_with_data(
        ErrorCode::ToolNotFound,
        format!("tool not found: {name}"),
        json!({ "tool": name }),
    )
}

fn to_result<T: Serialize>(value: T) -> Result<Value, Error> {
    Ok(serde_json::to_value(value)?)
}

/// Builds a [`Server`]
pub struct ServerBuilder {
    name: String,
    version: String,
    description: Option<String>,
    capabilities: Capabilities,
    registry: Option<Arc<ToolRegistry>>,
    rpc_path: String,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            capabilities: Capabilities::default(),
            registry: None,
            rpc_path: "/rpc".to_string(),
        }
    }

    /// Takes identity, capabilities and RPC path from a server config
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
            capabilities: config.capabilities.clone(),
            registry: None,
            rpc_path: config.rpc_path.clone(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Serves tools from `registry` instead of a fresh one
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn rpc_path(mut self, rpc_path: impl Into<String>) -> Self {
        self.rpc_path = rpc_path.into();
        self
    }

    pub fn build(self) -> Server {
        let info = ServerInfo {
            name: self.name,
            version: self.version,
            description: self.description,
            capabilities: self.capabilities,
            started_at: Some(Utc::now()),
        };
        let registry = self.registry.unwrap_or_default();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Server {
            dispatcher: Dispatcher::new(registry, info),
            events,
            shutdown: Arc::new(shutdown),
            rpc_path: Arc::from(self.rpc_path),
        }
    }
}

/// A tool server reachable over HTTP, WebSocket, or both
#[derive(Clone)]
pub struct Server {
    dispatcher: Dispatcher,
    events: broadcast::Sender<Notification>,
    shutdown: Arc<watch::Sender<bool>>,
    rpc_path: Arc<str>,
}

impl Server {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(name, version)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.dispatcher.registry()
    }

    pub fn info(&self) -> &ServerInfo {
        self.dispatcher.info()
    }

    pub fn rpc_path(&self) -> &str {
        &self.rpc_path
    }

    pub fn register_tool<H: ToolHandler + 'static>(
        &self,
        definition: ToolDefinition,
        handler: H,
    ) -> Option<ToolDefinition> {
        self.registry().register_tool(definition, handler)
    }

    pub fn register_resource<R: ResourceReader + 'static>(
        &self,
        definition: ResourceDefinition,
        reader: R,
    ) -> bool {
        self.registry().register_resource(definition, reader)
    }

    pub fn register_prompt(&self, definition: PromptDefinition) -> bool {
        self.registry().register_prompt(definition)
    }

    /// Pushes a notification to every open stream connection
    ///
    /// Returns the number of connections it was queued for.
    pub fn notify(&self, method: &str, params: Option<Value>) -> usize {
        self.events
            .send(Notification::new(method, params))
            .unwrap_or(0)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stops the accept loops and closes open stream connections
    pub fn shutdown(&self) {
        info!(server = %self.info().name, "server shutting down");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Serves the request binding on `listener` until shutdown
    pub async fn serve_http(&self, listener: TcpListener) -> Result<(), Error> {
        http::serve(self.clone(), listener).await
    }

    /// Serves the stream binding on `listener` until shutdown
    pub async fn serve_websocket(&self, listener: TcpListener) -> Result<(), Error> {
        websocket::serve(self.clone(), listener).await
    }

    /// Binds the listeners named in `config` and serves them until shutdown
    pub async fn serve(&self, config: &ServerConfig) -> Result<(), Error> {
        config.validate()?;
        let http = match &config.http_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let ws = match &config.ws_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        tokio::try_join!(
            async {
                match http {
                    Some(listener) => self.serve_http(listener).await,
                    None => Ok(()),
                }
            },
            async {
                match ws {
                    Some(listener) => self.serve_websocket(listener).await,
                    None => Ok(()),
                }
            },
        )?;
        Ok(())
    }
}

/// Resolves once `signal` reports shutdown or its sender is gone
pub(crate) async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::RequestId,
        registry::{tool_fn, StaticContent},
        types::{ParameterType, ToolParameter},
    };
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn server() -> Server {
        let server = Server::builder("ops-tools", "1.0.0")
            .description("operations toolbox")
            .build();
        server.register_tool(
            ToolDefinition::new("echo", "Repeat a message")
                .param(ToolParameter::new("message", ParameterType::String))
                .category("text"),
            tool_fn(|args: Map<String, Value>| async move {
                let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
                Ok::<_, Error>(json!(format!("Echo: {message}")))
            }),
        );
        server.register_tool(
            ToolDefinition::new("deploy", "Deploy a service")
                .param(ToolParameter::new("env", ParameterType::String).one_of(["staging", "prod"]))
                .param(
                    ToolParameter::new("replicas", ParameterType::Integer)
                        .with_default(json!(1)),
                )
                .category("ops"),
            tool_fn(|args: Map<String, Value>| async move { Ok::<_, Error>(Value::Object(args)) }),
        );
        server.register_tool(
            ToolDefinition::new("explode", "Always fails"),
            tool_fn(|_| async { Err::<Value, _>(Error::Other("disk on fire".into())) }),
        );
        server
    }

    async fn call(server: &Server, method: &str, params: Value) -> Response {
        server
            .dispatcher()
            .dispatch(Request::new(method, Some(params), RequestId::Number(9)))
            .await
    }

    fn error_code(response: &Response) -> ErrorCode {
        response.error.as_ref().unwrap().code()
    }

    #[tokio::test]
    async fn call_tool_wraps_result() {
        let response = call(
            &server(),
            "tools/call",
            json!({"tool": "echo", "arguments": {"message": "hi"}}),
        )
        .await;
        assert_eq!(response.id, RequestId::Number(9));
        assert_eq!(
            response.result,
            Some(json!({"tool": "echo", "result": "Echo: hi"}))
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_tool_not_found() {
        let response = call(&server(), "tools/call", json!({"tool": "missing"})).await;
        assert_eq!(error_code(&response), ErrorCode::ToolNotFound);
        assert_eq!(response.error.unwrap().data, Some(json!({"tool": "missing"})));
    }

    #[tokio::test]
    async fn validation_runs_before_invocation() {
        let server = server();
        let response = call(
            &server,
            "tools/call",
            json!({"tool": "deploy", "arguments": {"env": "qa"}}),
        )
        .await;
        assert_eq!(error_code(&response), ErrorCode::InvalidParams);

        let response = call(&server, "tools/call", json!({"tool": "deploy", "arguments": {}})).await;
        assert_eq!(error_code(&response), ErrorCode::InvalidParams);

        let response = call(
            &server,
            "tools/call",
            json!({"tool": "deploy", "arguments": {"env": "prod"}}),
        )
        .await;
        assert_eq!(
            response.result.unwrap()["result"],
            json!({"env": "prod", "replicas": 1})
        );
    }

    #[tokio::test]
    async fn failing_tool_is_an_execution_error() {
        let response = call(&server(), "tools/call", json!({"tool": "explode"})).await;
        let error = response.error.unwrap();
        assert_eq!(error.code(), ErrorCode::ToolExecutionError);
        assert_eq!(error.message, "disk on fire");
    }

    #[tokio::test]
    async fn panicking_tool_does_not_take_the_dispatcher_down() {
        let server = server();
        server.register_tool(
            ToolDefinition::new("panic", "Panics"),
            tool_fn(|args: Map<String, Value>| async move {
                if args.is_empty() {
                    panic!("boom");
                }
                Ok::<_, Error>(Value::Null)
            }),
        );
        let response = call(&server, "tools/call", json!({"tool": "panic"})).await;
        assert_eq!(error_code(&response), ErrorCode::ToolExecutionError);
        let response = call(&server, "tools/call", json!({"tool": "echo", "arguments": {"message": "x"}})).await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn unknown_method_keeps_the_request_id() {
        let response = call(&server(), "tools/delete", json!({})).await;
        assert_eq!(response.id, RequestId::Number(9));
        assert_eq!(error_code(&response), ErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn undecodable_text_gets_a_parse_error_with_null_id() {
        let server = server();
        let reply = server.dispatcher().handle_text("{not json").await.unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], json!(-32700));

        let notification = r#"{"jsonrpc": "2.0", "method": "progress"}"#;
        assert!(server.dispatcher().handle_text(notification).await.is_none());
    }

    #[tokio::test]
    async fn list_tools_filters_by_category_and_query() {
        let server = server();
        let all = call(&server, "tools/list", json!({})).await.result.unwrap();
        assert_eq!(all["tools"].as_array().unwrap().len(), 3);

        let ops = call(&server, "tools/list", json!({"category": "ops"})).await.result.unwrap();
        assert_eq!(ops["tools"][0]["name"], "deploy");
        assert_eq!(ops["tools"][0]["inputSchema"]["required"], json!(["env"]));

        let found = call(&server, "tools/list", json!({"query": "repeat"})).await.result.unwrap();
        assert_eq!(found["tools"].as_array().unwrap().len(), 1);
        assert_eq!(found["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn describe_tool_returns_one_schema() {
        let server = server();
        let schema = call(&server, "tools/describe", json!({"tool": "echo"})).await.result.unwrap();
        assert_eq!(schema["name"], "echo");
        let missing = call(&server, "tools/describe", json!({"tool": "nope"})).await;
        assert_eq!(error_code(&missing), ErrorCode::ToolNotFound);
    }

    #[tokio::test]
    async fn handshake_methods_describe_the_server() {
        let server = server();
        let init = call(&server, "initialize", json!({})).await.result.unwrap();
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["serverInfo"]["name"], "ops-tools");

        let info = call(&server, "server/info", json!(null)).await.result.unwrap();
        assert_eq!(info["description"], "operations toolbox");
        assert!(info["startedAt"].is_string());

        let caps = call(&server, "server/capabilities", json!(null)).await.result.unwrap();
        assert_eq!(caps["tools"], true);
        assert_eq!(caps["multiTool"], false);

        let shutdown = call(&server, "shutdown", json!(null)).await;
        assert_eq!(shutdown.result, Some(Value::Null));
    }

    #[tokio::test]
    async fn resources_and_prompts_route_through_the_registry() {
        let server = server();
        server.register_resource(
            ResourceDefinition::new("mem://motd", "motd").mime_type("text/plain"),
            StaticContent::Text("all systems nominal".into()),
        );
        server.register_prompt(
            PromptDefinition::new("summarize", "Summarize {topic} briefly").argument("topic", true),
        );

        let listed = call(&server, "resources/list", json!(null)).await.result.unwrap();
        assert_eq!(listed["resources"][0]["uri"], "mem://motd");

        let read = call(&server, "resources/read", json!({"uri": "mem://motd"})).await.result.unwrap();
        assert_eq!(read["contents"][0]["text"], "all systems nominal");

        let missing = call(&server, "resources/read", json!({"uri": "mem://nope"})).await;
        assert_eq!(error_code(&missing), ErrorCode::InvalidParams);

        let prompt = call(
            &server,
            "prompts/get",
            json!({"name": "summarize", "arguments": {"topic": "the outage"}}),
        )
        .await
        .result
        .unwrap();
        assert_eq!(prompt["messages"][0]["role"], "user");
        assert_eq!(prompt["messages"][0]["content"]["text"], "Summarize the outage briefly");

        let incomplete = call(&server, "prompts/get", json!({"name": "summarize"})).await;
        assert_eq!(error_code(&incomplete), ErrorCode::InvalidParams);
        let unknown = call(&server, "prompts/get", json!({"name": "nope"})).await;
        assert_eq!(unknown.error.unwrap().data, Some(json!({"name": "nope"})));
    }

    #[test]
    fn notify_without_listeners_reaches_nobody() {
        let server = server();
        assert_eq!(server.notify("notifications/message", None), 0);
        let _rx = server.subscribe();
        assert_eq!(server.notify("notifications/message", None), 1);
    }
}
