//! Client session
//!
//! A [`Session`] owns one transport. Connecting runs the handshake
//! (`initialize`, then `server/info`, then `tools/list`) and fills a local tool
//! cache that [`Session::available_tools`] reads without a round trip.
//!
//! On a stream transport the session also owns reconnection. When the
//! connection drops, the transport fails every pending request and then reports
//! the loss; the session retries with a doubling delay until it reconnects or
//! `max_retries` attempts have failed, after which it stays disconnected and
//! every call fails fast with [`Error::NotConnected`].

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    Arc, PoisonError, RwLock,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    client::{ClientHandler, DefaultClientHandler},
    config::ConnectionConfig,
    error::{Error, ErrorCode},
    protocol::{self, Method, Notification, Request, RequestId, PROTOCOL_VERSION},
    registry::ToolRegistry,
    transport::{Transport, TransportKind, TransportRegistry},
    types::{
        CallToolParams, CallToolResult, Capabilities, DescribeToolParams, GetPromptParams,
        GetPromptResult, Implementation, InitializeParams, InitializeResult, ListPromptsResult,
        ListResourcesResult, ListToolsParams, ListToolsResult, PromptDefinition,
        ReadResourceParams, ReadResourceResult, ResourceContents, ResourceDefinition, ServerInfo,
        ToolDefinition, ToolSchema,
    },
};

/// Configures and opens a [`Session`]
pub struct SessionBuilder {
    config: ConnectionConfig,
    transports: TransportRegistry,
    transport: Option<Arc<dyn Transport>>,
    handler: Option<Arc<dyn ClientHandler>>,
    client_info: Implementation,
    tools: Option<Arc<ToolRegistry>>,
}

impl SessionBuilder {
    /// Handler for server notifications; defaults to [`DefaultClientHandler`]
    pub fn handler<H: ClientHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Scheme table used to pick the transport
    pub fn transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = transports;
        self
    }

    /// Uses `transport` instead of asking the scheme table
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn client_info(mut self, client_info: Implementation) -> Self {
        self.client_info = client_info;
        self
    }

    /// Registry that receives the server's tool descriptors
    pub fn tool_cache(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Connects and runs the handshake
    pub async fn connect(self) -> Result<Session, Error> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => self.transports.create(&self.config)?,
        };
        let inner = Arc::new(SessionInner {
            config: self.config,
            transport,
            handler: self
                .handler
                .unwrap_or_else(|| Arc::new(DefaultClientHandler)),
            client_info: self.client_info,
            tools: self.tools.unwrap_or_default(),
            server_info: RwLock::new(None),
            protocol_version: RwLock::new(None),
            next_id: AtomicI64::new(0),
            attempts: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        });
        SessionInner::install_handlers(&inner);
        inner.establish().await?;
        Ok(Session { inner })
    }
}

struct SessionInner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ClientHandler>,
    client_info: Implementation,
    tools: Arc<ToolRegistry>,
    server_info: RwLock<Option<ServerInfo>>,
    protocol_version: RwLock<Option<String>>,
    next_id: AtomicI64,
    attempts: AtomicU32,
    closing: AtomicBool,
    reconnecting: AtomicBool,
}

impl SessionInner {
    fn install_handlers(inner: &Arc<Self>) {
        // notifications are handled one at a time, in arrival order
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        inner
            .transport
            .set_notification_handler(Arc::new(move |notification: Notification| {
                let _ = tx.send(notification);
            }));
        let handler = inner.handler.clone();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let method = notification.method.clone();
                if let Err(e) = handler.handle_notification(notification).await {
                    warn!(%method, "notification handler failed: {e}");
                }
            }
        });

        let weak = Arc::downgrade(inner);
        inner.transport.set_close_handler(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost();
            }
        }));
    }

    /// Connects the transport and runs the handshake
    async fn establish(&self) -> Result<(), Error> {
        self.transport.connect().await?;
        if let Err(e) = self.handshake().await {
            if let Err(close_err) = self.transport.disconnect().await {
                debug!("disconnect after failed handshake: {close_err}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn handshake(&self) -> Result<(), Error> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_info: self.client_info.clone(),
        };
        let init: InitializeResult = self
            .call(Method::Initialize, Some(serde_json::to_value(params)?))
            .await?;
        if !protocol::is_supported_version(&init.protocol_version) {
            warn!(
                server = %init.protocol_version,
                client = PROTOCOL_VERSION,
                "server speaks an unsupported protocol version"
            );
        } else if init.protocol_version != PROTOCOL_VERSION {
            debug!(server = %init.protocol_version, "server speaks an older protocol version");
        }

        let info: ServerInfo = self.call(Method::ServerInfo, None).await?;
        let listed: ListToolsResult = self.call(Method::ListTools, None).await?;
        let count = listed.tools.len();
        self.tools
            .replace_definitions(listed.tools.iter().map(ToolDefinition::from_schema));

        info!(
            server = %info.name,
            version = %info.version,
            tools = count,
            "session established"
        );
        *write(&self.protocol_version) = Some(init.protocol_version);
        *write(&self.server_info) = Some(info);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        debug!(%id, %method, "sending request");
        let response = self
            .transport
            .send_request(Request::new(method, params, id.clone()))
            .await?;
        if response.id != id {
            return Err(Error::Connection(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        response.into_result()
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
    ) -> Result<T, Error> {
        let result = self.request(method.as_str(), params).await?;
        Ok(serde_json::from_value(result)?)
    }

    fn connection_lost(self: Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            self.handler.on_disconnect().await;
            self.reconnect_loop().await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            self.retry_until_connected().await;
            self.reconnecting.store(false, Ordering::SeqCst);

            // the fresh connection may have dropped before the flag was cleared
            let exhausted = self.attempts.load(Ordering::SeqCst) >= self.config.max_retries;
            if self.closing.load(Ordering::SeqCst) || self.transport.is_connected() || exhausted {
                break;
            }
            if self.reconnecting.swap(true, Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn retry_until_connected(&self) {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            let attempt = self.attempts.load(Ordering::SeqCst);
            if attempt >= self.config.max_retries {
                warn!(
                    attempts = attempt,
                    url = %self.config.url,
                    "giving up on reconnecting"
                );
                return;
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.config.backoff(attempt);
            info!(attempt, ?delay, "reconnecting");
            tokio::time::sleep(delay).await;
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            match self.establish().await {
                Ok(()) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    info!(url = %self.config.url, "reconnected");
                    return;
                }
                Err(e) => warn!(attempt, "reconnect attempt failed: {e}"),
            }
        }
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A connected client
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder(config: ConnectionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            transports: TransportRegistry::with_defaults(),
            transport: None,
            handler: None,
            client_info: Implementation::default(),
            tools: None,
        }
    }

    /// Opens a session with default settings
    pub async fn connect(config: ConnectionConfig) -> Result<Session, Error> {
        Self::builder(config).connect().await
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    /// Tools known from the last handshake or listing
    pub fn available_tools(&self) -> Vec<ToolDefinition> {
        self.inner.tools.list_tools(None)
    }

    /// A cached tool descriptor
    pub fn tool(&self, name: &str) -> Option<ToolDefinition> {
        self.inner.tools.definition(name)
    }

    /// Server info captured during the handshake
    pub fn server_info(&self) -> Option<ServerInfo> {
        read(&self.inner.server_info)
    }

    /// Protocol version the server answered with
    pub fn protocol_version(&self) -> Option<String> {
        read(&self.inner.protocol_version)
    }

    /// Invokes a tool and returns its unwrapped result
    ///
    /// The request always goes to the server, even for names missing from the
    /// local cache; an unknown tool comes back as a `tool-not-found` error.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, Error> {
        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::protocol(
                    ErrorCode::InvalidParams,
                    format!("tool arguments must be an object, got {other}"),
                ))
            }
        };
        if !self.inner.tools.contains_tool(name) {
            debug!(tool = %name, "calling a tool missing from the local cache");
        }
        let params = CallToolParams {
            tool: name.to_string(),
            arguments,
        };
        let result: CallToolResult = self
            .inner
            .call(Method::CallTool, Some(serde_json::to_value(params)?))
            .await?;
        Ok(result.result)
    }

    /// Lists tools on the server and refreshes the local cache
    pub async fn list_tools(&self, category: Option<&str>) -> Result<Vec<ToolDefinition>, Error> {
        let params = ListToolsParams {
            category: category.map(str::to_string),
            query: None,
        };
        let listed: ListToolsResult = self
            .inner
            .call(Method::ListTools, Some(serde_json::to_value(params)?))
            .await?;
        let definitions: Vec<ToolDefinition> =
            listed.tools.iter().map(ToolDefinition::from_schema).collect();
        match category {
            None => self.inner.tools.replace_definitions(definitions.clone()),
            Some(_) => {
                for definition in &definitions {
                    self.inner.tools.register_definition(definition.clone());
                }
            }
        }
        Ok(definitions)
    }

    /// Full-text search over the server's tools
    pub async fn search_tools(&self, query: &str) -> Result<Vec<ToolDefinition>, Error> {
        let params = ListToolsParams {
            category: None,
            query: Some(query.to_string()),
        };
        let listed: ListToolsResult = self
            .inner
            .call(Method::ListTools, Some(serde_json::to_value(params)?))
            .await?;
        Ok(listed.tools.iter().map(ToolDefinition::from_schema).collect())
    }

    pub async fn describe_tool(&self, name: &str) -> Result<ToolDefinition, Error> {
        let params = DescribeToolParams {
            tool: name.to_string(),
        };
        let schema: ToolSchema = self
            .inner
            .call(Method::DescribeTool, Some(serde_json::to_value(params)?))
            .await?;
        let definition = ToolDefinition::from_schema(&schema);
        self.inner.tools.register_definition(definition.clone());
        Ok(definition)
    }

    pub async fn capabilities(&self) -> Result<Capabilities, Error> {
        self.inner.call(Method::ServerCapabilities, None).await
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDefinition>, Error> {
        let listed: ListResourcesResult = self.inner.call(Method::ListResources, None).await?;
        Ok(listed.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, Error> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let read: ReadResourceResult = self
            .inner
            .call(Method::ReadResource, Some(serde_json::to_value(params)?))
            .await?;
        Ok(read.contents)
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDefinition>, Error> {
        let listed: ListPromptsResult = self.inner.call(Method::ListPrompts, None).await?;
        Ok(listed.prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<GetPromptResult, Error> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.inner
            .call(Method::GetPrompt, Some(serde_json::to_value(params)?))
            .await
    }

    /// Sends a raw request and returns the unwrapped result
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.inner.request(method, params).await
    }

    /// Sends a notification. Failures are logged, never raised.
    pub async fn notify(&self, method: &str, params: Option<Value>) {
        let notification = Notification::new(method, params);
        if let Err(e) = self.inner.transport.send_notification(notification).await {
            warn!(%method, "notification not sent: {e}");
        }
    }

    /// Closes the connection; no reconnect follows
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.transport.disconnect().await?;
        info!(url = %self.inner.config.url, "session disconnected");
        Ok(())
    }

    /// Asks the server to shut down, then disconnects
    pub async fn shutdown(&self) -> Result<(), Error> {
        let result = self.inner.request(Method::Shutdown.as_str(), None).await;
        self.disconnect().await?;
        result.map(|_| ())
    }

    /// Connects again and repeats the handshake, resetting the retry counter
    pub async fn reconnect(&self) -> Result<(), Error> {
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.establish().await
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closing.load(Ordering::SeqCst) && self.inner.transport.is_connected()
    }

    /// Failed reconnect attempts since the last successful connection
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let port = unused_port().await;
        let config = ConnectionConfig::parse(&format!("ws://127.0.0.1:{port}"))
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        let err = Session::connect(config).await.err().unwrap();
        assert!(err.is_transport(), "{err:?}");
        assert_eq!(err.code(), None);
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_before_connecting() {
        let config = ConnectionConfig::parse("gopher://127.0.0.1:70").unwrap();
        let err = Session::connect(config).await.err().unwrap();
        assert!(matches!(err, Error::Connection(msg) if msg.contains("gopher")));
    }
}
