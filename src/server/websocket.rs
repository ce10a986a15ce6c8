//! Stream binding served with tokio-tungstenite
//!
//! Each accepted connection gets its own id for log correlation, a reader loop
//! and a writer task. Requests on one connection are dispatched concurrently,
//! so a slow tool never holds up the replies of faster ones.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast::error::RecvError, mpsc},
};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::Error,
    protocol::{self, Message},
    server::{shutdown_requested, Server},
};

pub(crate) async fn serve(server: Server, listener: TcpListener) -> Result<(), Error> {
    let addr = listener.local_addr()?;
    info!(%addr, "serving websocket");
    let mut signal = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut signal) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(server.clone(), stream, peer));
                }
                Err(e) => warn!(%addr, "accept failed: {e}"),
            },
        }
    }
    info!(%addr, "websocket listener stopped");
    Ok(())
}

async fn handle_connection(server: Server, stream: TcpStream, peer: SocketAddr) {
    let connection_id = Uuid::new_v4();
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%connection_id, %peer, "websocket handshake failed: {e}");
            return;
        }
    };
    info!(%connection_id, %peer, "connection opened");

    let (mut sink, mut frames) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, WsMessage::Close(_));
            if let Err(e) = sink.send(frame).await {
                debug!(%connection_id, "write failed: {e}");
                break;
            }
            if closing {
                break;
            }
        }
        if let Err(e) = sink.close().await {
            debug!(%connection_id, "close failed: {e}");
        }
    });

    let mut events = server.subscribe();
    let mut events_open = true;
    let mut signal = server.shutdown_signal();
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => spawn_dispatch(&server, text, &tx, connection_id),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => spawn_dispatch(&server, text, &tx, connection_id),
                    Err(_) => warn!(%connection_id, "ignoring non-utf8 binary frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%connection_id, "read failed: {e}");
                    break;
                }
            },
            event = events.recv(), if events_open => match event {
                Ok(notification) => match protocol::encode(&Message::Notification(notification)) {
                    Ok(text) => {
                        let _ = tx.send(WsMessage::Text(text));
                    }
                    Err(e) => warn!(%connection_id, "failed to encode notification: {e}"),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!(%connection_id, missed, "connection fell behind on notifications");
                }
                Err(RecvError::Closed) => events_open = false,
            },
            _ = shutdown_requested(&mut signal) => {
                let _ = tx.send(WsMessage::Close(None));
                break;
            }
        }
    }

    // in-flight dispatches hold their own senders; the writer drains them first
    drop(tx);
    let _ = writer.await;
    info!(%connection_id, "connection closed");
}

fn spawn_dispatch(
    server: &Server,
    text: String,
    tx: &mpsc::UnboundedSender<WsMessage>,
    connection_id: Uuid,
) {
    let dispatcher = server.dispatcher().clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        if let Some(reply) = dispatcher.handle_text(&text).await {
            if tx.send(WsMessage::Text(reply)).is_err() {
                debug!(%connection_id, "connection closed before reply was written");
            }
        }
    });
}
