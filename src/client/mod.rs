//! Client entry points
//!
//! [`connect`] and [`connect_with`] open a [`Session`] against a server URL. The
//! session delivers server-pushed notifications to a [`ClientHandler`], one at a
//! time in arrival order.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    config::ConnectionConfig,
    error::Error,
    protocol::Notification,
    session::Session,
    types::{LoggingLevel, LoggingMessage},
};

/// Trait for implementing client-side handlers of server events
#[async_trait]
pub trait ClientHandler: Send + Sync {
    /// Handle a notification pushed by the server
    async fn handle_notification(&self, notification: Notification) -> Result<(), Error>;

    /// Called when an established connection is lost, before any reconnect attempt
    async fn on_disconnect(&self) {}
}

#[derive(Clone, Default)]
pub struct DefaultClientHandler;

#[async_trait]
impl ClientHandler for DefaultClientHandler {
    async fn handle_notification(&self, notification: Notification) -> Result<(), Error> {
        match notification.method.as_str() {
            "notifications/message" => {
                // handle logging messages
                if let Some(params) = notification.params {
                    let message: LoggingMessage = serde_json::from_value(params)?;
                    log_message(&message);
                }
                Ok(())
            }
            "notifications/tools/list_changed" => {
                info!("server tool list changed");
                Ok(())
            }
            method => {
                debug!(%method, params = ?notification.params, "server notification");
                Ok(())
            }
        }
    }

    async fn on_disconnect(&self) {
        warn!("connection to server lost");
    }
}

fn log_message(message: &LoggingMessage) {
    let logger = message.logger.as_deref().unwrap_or("server");
    let data = match &message.data {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    match message.level {
        LoggingLevel::Debug => debug!(%logger, "{data}"),
        LoggingLevel::Info | LoggingLevel::Notice => info!(%logger, "{data}"),
        LoggingLevel::Warning => warn!(%logger, "{data}"),
        LoggingLevel::Error
        | LoggingLevel::Critical
        | LoggingLevel::Alert
        | LoggingLevel::Emergency => error!(%logger, "{data}"),
    }
}

/// Connects to `url` with default settings and runs the handshake
pub async fn connect(url: &str) -> Result<Session, Error> {
    connect_with(ConnectionConfig::parse(url)?).await
}

/// Connects with an explicit configuration and runs the handshake
pub async fn connect_with(config: ConnectionConfig) -> Result<Session, Error> {
    Session::builder(config).connect().await
}
