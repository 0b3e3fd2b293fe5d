use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
};
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{info, trace};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::{
    events::{Recipients, ServerEvent},
    rooms::router,
    server::AppState,
};

pub type ConnectionId = u64;

static ID_COUNTER: AtomicCell<ConnectionId> = AtomicCell::new(1);

/// What gets queued onto a connection's outbound channel.
#[derive(Debug)]
pub enum Outbound {
    Event(String),
    Close,
}

#[derive(Debug)]
struct Connection {
    sender: UnboundedSender<Outbound>,
    addr: SocketAddr,
    fingerprint: Mutex<Option<String>>,
    room: Mutex<Option<String>>,
}

/// Owns every open message channel. Rooms refer to connections only by
/// id; the gateway is the single place that can actually reach a socket.
#[derive(Debug, Default)]
pub struct Gateway {
    connections: DashMap<ConnectionId, Connection>,
}

impl Gateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: SocketAddr, sender: UnboundedSender<Outbound>) -> ConnectionId {
        let id = ID_COUNTER.fetch_add(1);

        self.connections.insert(
            id,
            Connection {
                sender,
                addr,
                fingerprint: Mutex::new(None),
                room: Mutex::new(None),
            },
        );

        id
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub fn send(&self, id: ConnectionId, event: &ServerEvent) {
        if let Some(connection) = self.connections.get(&id) {
            let text = serde_json::to_string(event).expect("event serializes");
            let _ = connection.sender.send(Outbound::Event(text));
        }
    }

    pub fn broadcast(&self, recipients: &Recipients, event: &ServerEvent) {
        let text = serde_json::to_string(event).expect("event serializes");

        match recipients {
            Recipients::All => {
                for connection in self.connections.iter() {
                    let _ = connection.sender.send(Outbound::Event(text.clone()));
                }
            }
            Recipients::Some(ids) => {
                for id in ids {
                    if let Some(connection) = self.connections.get(id) {
                        let _ = connection.sender.send(Outbound::Event(text.clone()));
                    }
                }
            }
        }
    }

    /// Closes the socket after an optional grace period.
    pub fn close_after(&self, id: ConnectionId, grace: Duration) {
        if let Some(connection) = self.connections.get(&id) {
            let sender = connection.sender.clone();

            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = sender.send(Outbound::Close);
            });
        }
    }

    pub fn close(&self, id: ConnectionId) {
        if let Some(connection) = self.connections.get(&id) {
            let _ = connection.sender.send(Outbound::Close);
        }
    }

    pub fn addr_of(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).map(|c| c.addr)
    }

    pub fn set_fingerprint(&self, id: ConnectionId, fingerprint: &str) {
        if let Some(connection) = self.connections.get(&id) {
            *connection.fingerprint.lock() = Some(fingerprint.to_string());
        }
    }

    pub fn fingerprint_of(&self, id: ConnectionId) -> Option<String> {
        self.connections
            .get(&id)
            .and_then(|c| c.fingerprint.lock().clone())
    }

    pub fn set_room(&self, id: ConnectionId, code: &str) {
        if let Some(connection) = self.connections.get(&id) {
            *connection.room.lock() = Some(code.to_string());
        }
    }

    pub fn clear_room(&self, id: ConnectionId) {
        if let Some(connection) = self.connections.get(&id) {
            *connection.room.lock() = None;
        }
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).and_then(|c| c.room.lock().clone())
    }

    /// Connections that are not currently in any room.
    pub fn idle_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| c.room.lock().is_none())
            .map(|c| *c.key())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Tells everyone to go away and drops all channels.
    pub fn shutdown(&self) {
        for connection in self.connections.iter() {
            let _ = connection.sender.send(Outbound::Close);
        }

        self.connections.clear();
    }
}

async fn upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, addr, socket))
}

async fn handle_socket(state: AppState, addr: SocketAddr, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let id = state.context.gateway.register(addr, sender);
    trace!("Connection {} opened from {}", id, addr);

    // Outbound drain: everything the rooms fan out goes through here
    let writer = tokio::spawn(async move {
        while let Some(outbound) = receiver.recv().await {
            match outbound {
                Outbound::Event(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                router::dispatch(&state.context, id, addr.ip(), &text).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    info!("Connection {} closed", id);

    state.context.rooms.handle_disconnect(id);
    state.context.gateway.unregister(id);
    writer.abort();
}

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/gateway", get(upgrade))
}
