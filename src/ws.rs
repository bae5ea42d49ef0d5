// src/ws.rs
use crate::models::{Stock, UserView};
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use warp::ws::{Message, WebSocket};

/// Events pushed to every connected observer. No filtering, no replay:
/// clients re-fetch authoritative state on (re)connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    UserUpdate { user: UserView },
    PriceUpdate { stocks: Vec<Stock> },
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Broadcaster {
        let (tx, _) = broadcast::channel(capacity);
        Broadcaster { tx }
    }

    pub fn user_update(&self, user: UserView) {
        let _ = self.tx.send(Event::UserUpdate { user });
    }

    pub fn price_update(&self, stocks: Vec<Stock>) {
        let _ = self.tx.send(Event::PriceUpdate { stocks });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

/// Forwards broadcast events to one WebSocket client as JSON text frames.
/// Incoming frames are drained and ignored until the client closes.
pub async fn client_connected(socket: WebSocket, mut rx: broadcast::Receiver<Event>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    debug!("websocket client connected");
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("websocket client lagged, dropped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(msg)) if msg.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket receive error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    debug!("websocket client disconnected");
}
