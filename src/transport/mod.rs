//! Transport layer
//!
//! A transport moves envelopes between a client and a server. Two bindings ship
//! with the crate:
//! - [`http::HttpTransport`]: one POST per request, notifications best-effort
//! - [`websocket::WebSocketTransport`]: one persistent connection, responses
//!   correlated by id and accepted in any order
//!
//! Which one a client uses is decided by the URL scheme through a
//! [`TransportRegistry`].

use async_trait::async_trait;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    config::ConnectionConfig,
    error::Error,
    protocol::{Notification, Request, Response},
};

pub mod http;
pub mod websocket;

pub use http::HttpTransport;
pub use websocket::WebSocketTransport;

/// Binding style of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Each request is a standalone exchange
    Request,
    /// A persistent bidirectional connection
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Request => f.write_str("request"),
            TransportKind::Stream => f.write_str("stream"),
        }
    }
}

/// Called for every notification pushed by the server
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// Called once when an established connection is lost
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Transport trait for sending and receiving envelopes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the connection
    async fn connect(&self) -> Result<(), Error>;

    /// Closes the connection. Pending requests fail with a connection error.
    async fn disconnect(&self) -> Result<(), Error>;

    /// Sends a request and waits for the response carrying the same id
    async fn send_request(&self, request: Request) -> Result<Response, Error>;

    /// Sends a notification. Delivery is best-effort.
    async fn send_notification(&self, notification: Notification) -> Result<(), Error>;

    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;

    /// Installs the notification callback. Request transports never receive
    /// server pushes and ignore it.
    fn set_notification_handler(&self, _handler: NotificationHandler) {}

    /// Installs the connection-lost callback. Request transports have no
    /// connection to lose and ignore it.
    fn set_close_handler(&self, _handler: CloseHandler) {}
}

/// Builds a transport for a connection config
pub type TransportFactory =
    Arc<dyn Fn(&ConnectionConfig) -> Result<Arc<dyn Transport>, Error> + Send + Sync>;

/// Maps URL schemes to transport factories
#[derive(Clone)]
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// `http`/`https` to the request binding, `ws`/`wss` to the stream binding
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for scheme in ["http", "https"] {
            registry.register(scheme, |config| {
                Ok(Arc::new(HttpTransport::new(config.clone())) as Arc<dyn Transport>)
            });
        }
        for scheme in ["ws", "wss"] {
            registry.register(scheme, |config| {
                Ok(Arc::new(WebSocketTransport::new(config.clone())) as Arc<dyn Transport>)
            });
        }
        registry
    }

    /// Registers a factory for `scheme`, replacing any previous one
    pub fn register<F>(&mut self, scheme: impl Into<String>, factory: F)
    where
        F: Fn(&ConnectionConfig) -> Result<Arc<dyn Transport>, Error> + Send + Sync + 'static,
    {
        self.factories
            .insert(scheme.into().to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Creates an unconnected transport for `config`
    pub fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Transport>, Error> {
        let scheme = config.scheme();
        let factory = self.factories.get(scheme).ok_or_else(|| {
            Error::Connection(format!("unsupported transport scheme: {scheme}"))
        })?;
        factory(config)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
