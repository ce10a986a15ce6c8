//! Request transport over HTTP
//!
//! Every request is an independent POST of one encoded envelope; the response
//! body is the matching response envelope. There is no persistent connection, so
//! the transport never receives server-pushed notifications.

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, StatusCode};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::ConnectionConfig,
    error::Error,
    protocol::{self, Message, Notification, Request, Response},
    transport::{Transport, TransportKind},
};

pub struct HttpTransport {
    config: ConnectionConfig,
    endpoint: Url,
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        let endpoint = rpc_endpoint(&config);
        Self {
            config,
            endpoint,
            client: Mutex::new(None),
        }
    }

    /// URL requests are posted to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn client(&self) -> Option<reqwest::Client> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn post(&self, client: &reqwest::Client, body: String) -> reqwest::RequestBuilder {
        let mut request = client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in self.config.resolved_headers() {
            request = request.header(name, value);
        }
        request
    }

    /// Timeouts keep their own variant whether they hit the send or the body read
    fn request_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.config.timeout)
        } else {
            Error::from(err)
        }
    }

    async fn probe_health(&self, client: &reqwest::Client) {
        let url = match self.endpoint.join(&self.config.health_path) {
            Ok(url) => url,
            Err(e) => {
                debug!("skipping health probe: {e}");
                return;
            }
        };
        match client.get(url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => debug!(%url, "health probe ok"),
            Ok(resp) => debug!(%url, status = %resp.status(), "health probe failed"),
            Err(e) => debug!(%url, "health probe failed: {e}"),
        }
    }
}

/// The configured URL when it names a path, else the URL joined with the rpc path
fn rpc_endpoint(config: &ConnectionConfig) -> Url {
    if config.url.path().trim_matches('/').is_empty() {
        config
            .url
            .join(&config.rpc_path)
            .unwrap_or_else(|_| config.url.clone())
    } else {
        config.url.clone()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<(), Error> {
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .build()?;
        if self.config.health_check {
            self.probe_health(&client).await;
        }
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
        debug!(endpoint = %self.endpoint, "http transport ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn send_request(&self, request: Request) -> Result<Response, Error> {
        let client = self.client().ok_or(Error::NotConnected)?;
        let body = protocol::encode(&Message::Request(request))?;

        let resp = self
            .post(&client, body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = resp.status();
        if status == StatusCode::ACCEPTED || !status.is_success() {
            return Err(Error::Connection(format!("http status {status}")));
        }

        let text = resp.text().await.map_err(|e| self.request_error(e))?;
        match protocol::decode(&text) {
            Ok(Message::Response(response)) => Ok(response),
            Ok(_) => Err(Error::Connection(
                "http body is not a response envelope".to_string(),
            )),
            Err(e) => Err(Error::Connection(format!("undecodable http body: {e}"))),
        }
    }

    async fn send_notification(&self, notification: Notification) -> Result<(), Error> {
        let Some(client) = self.client() else {
            warn!(method = %notification.method, "dropping notification: not connected");
            return Ok(());
        };
        let method = notification.method.clone();
        let body = protocol::encode(&Message::Notification(notification))?;
        match self.post(&client, body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(%method, status = %resp.status(), "notification rejected"),
            Err(e) => warn!(%method, "notification not delivered: {e}"),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Request
    }
}
