//! Stream transport over WebSocket
//!
//! One persistent connection carries every envelope. Outgoing requests are
//! parked in a pending table keyed by id; a background reader resolves them as
//! responses arrive, in whatever order the server produces them. Notifications
//! go to the installed handler. When the connection drops, every pending
//! request fails before the close handler runs.

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};
use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::{
    config::ConnectionConfig,
    error::{Error, ErrorCode},
    protocol::{self, Message, Notification, Request, RequestId, Response},
    transport::{CloseHandler, NotificationHandler, Transport, TransportKind},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Response, Error>>,
}

/// In-flight requests keyed by id
///
/// An entry is removed exactly once: by its response, by timeout or
/// cancellation of the waiting caller, or by connection loss.
#[derive(Clone, Default)]
struct PendingTable {
    inner: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
}

impl PendingTable {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        id: RequestId,
        method: &str,
    ) -> Result<oneshot::Receiver<Result<Response, Error>>, Error> {
        let mut entries = self.entries();
        if entries.contains_key(&id) {
            return Err(Error::protocol(
                ErrorCode::InvalidRequest,
                format!("request id {id} is already in flight"),
            ));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Hands a response to its waiter. False when nobody waits for its id.
    fn resolve(&self, response: Response) -> bool {
        let Some(pending) = self.entries().remove(&response.id) else {
            return false;
        };
        debug!(id = %response.id, method = %pending.method, "resolved pending request");
        // the waiter may have given up in the meantime
        let _ = pending.tx.send(Ok(response));
        true
    }

    fn remove(&self, id: &RequestId) {
        self.entries().remove(id);
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<(RequestId, PendingRequest)> = self.entries().drain().collect();
        for (id, pending) in drained {
            debug!(%id, method = %pending.method, "failing pending request: {reason}");
            let _ = pending.tx.send(Err(Error::Connection(reason.to_string())));
        }
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Drops the pending entry when the waiting future ends for any reason
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[derive(Default)]
struct Shared {
    sink: tokio::sync::Mutex<Option<WsSink>>,
    pending: PendingTable,
    connected: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    on_notification: RwLock<Option<NotificationHandler>>,
    on_close: RwLock<Option<CloseHandler>>,
}

impl Shared {
    fn dispatch(&self, text: &str) {
        match protocol::decode(text) {
            Ok(Message::Response(response)) => {
                let id = response.id.clone();
                if !self.pending.resolve(response) {
                    debug!(%id, "dropping response with no pending request");
                }
            }
            Ok(Message::Notification(notification)) => {
                let handler = self
                    .on_notification
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match handler {
                    Some(handler) => handler(notification),
                    None => debug!(method = %notification.method, "unhandled notification"),
                }
            }
            Ok(Message::Request(request)) => {
                warn!(method = %request.method, "ignoring request pushed by server");
            }
            Err(e) => warn!("ignoring undecodable frame: {e}"),
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.dispatch(&text),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => self.dispatch(&text),
                    Err(_) => warn!("ignoring non-utf8 binary frame"),
                },
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("websocket read failed: {e}");
                    break;
                }
            }
        }
        self.connection_lost().await;
    }

    async fn connection_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.sink.lock().await.take();
        self.pending.fail_all("connection closed");
        let handler = self
            .on_close
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    async fn send_text(&self, text: String) -> Result<(), Error> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(Error::NotConnected)?;
        sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }
}

pub struct WebSocketTransport {
    config: ConnectionConfig,
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Number of requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    fn client_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, Error> {
        let mut request = self.config.url.as_str().into_client_request()?;
        for (name, value) in self.config.resolved_headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Connection(format!("invalid header name `{name}`: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| Error::Connection(format!("invalid value for `{name}`: {e}")))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }
        let request = self.client_request()?;
        let (stream, _) = timeout(self.config.timeout, connect_async(request))
            .await
            .map_err(|_| Error::Timeout(self.config.timeout))??;
        let (sink, stream) = stream.split();

        *self.shared.sink.lock().await = Some(sink);
        self.shared.connected.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(self.shared.clone().read_loop(stream));
        if let Some(old) = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(reader)
        {
            old.abort();
        }
        debug!(url = %self.config.url, "websocket connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        if let Some(reader) = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        let sink = self.shared.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!("error closing websocket: {e}");
            }
        }
        self.shared.pending.fail_all("connection closed");
        debug!(url = %self.config.url, "websocket disconnected");
        Ok(())
    }

    async fn send_request(&self, request: Request) -> Result<Response, Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = request.id.clone();
        let rx = self.shared.pending.insert(id.clone(), &request.method)?;
        let _guard = PendingGuard {
            table: &self.shared.pending,
            id,
        };

        let text = protocol::encode(&Message::Request(request))?;
        self.shared.send_text(text).await?;

        match timeout(self.config.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection("connection closed".to_string())),
            Err(_) => Err(Error::Timeout(self.config.timeout)),
        }
    }

    async fn send_notification(&self, notification: Notification) -> Result<(), Error> {
        let text = protocol::encode(&Message::Notification(notification))?;
        self.shared.send_text(text).await
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self
            .shared
            .on_notification
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self
            .shared
            .on_close
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_ids_are_rejected() {
        let table = PendingTable::default();
        let _rx = table.insert(RequestId::Number(1), "tools/call").unwrap();
        let err = table.insert(RequestId::Number(1), "tools/call").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidRequest));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn responses_resolve_by_id_in_any_order() {
        let table = PendingTable::default();
        let rx_a = table.insert(RequestId::Number(1), "tools/call").unwrap();
        let rx_b = table.insert(RequestId::Number(2), "tools/call").unwrap();

        assert!(table.resolve(Response::success(RequestId::Number(2), json!("b"))));
        assert!(table.resolve(Response::success(RequestId::Number(1), json!("a"))));
        assert!(!table.resolve(Response::success(RequestId::Number(3), json!("?"))));

        assert_eq!(rx_b.await.unwrap().unwrap().result, Some(json!("b")));
        assert_eq!(rx_a.await.unwrap().unwrap().result, Some(json!("a")));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn connection_loss_fails_every_waiter() {
        let table = PendingTable::default();
        let rx = table.insert(RequestId::String("x".into()), "tools/list").unwrap();
        table.fail_all("connection closed");
        assert!(matches!(rx.await.unwrap(), Err(Error::Connection(_))));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn guard_removes_abandoned_entries() {
        let table = PendingTable::default();
        {
            let _rx = table.insert(RequestId::Number(7), "tools/call").unwrap();
            let _guard = PendingGuard {
                table: &table,
                id: RequestId::Number(7),
            };
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn requests_fail_fast_when_not_connected() {
        let transport = WebSocketTransport::new(ConnectionConfig::parse("ws://localhost:1").unwrap());
        let request = Request::new("tools/list", None, RequestId::Number(1));
        assert!(matches!(
            transport.send_request(request).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            transport
                .send_notification(Notification::new("progress", None))
                .await,
            Err(Error::NotConnected)
        ));
        assert_eq!(transport.pending_requests(), 0);
    }
}
