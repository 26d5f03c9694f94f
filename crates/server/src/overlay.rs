//! Overlay broadcast hub: the registry of display clients and the last
//! state each newcomer is caught up with.

use std::collections::HashMap;

use shared::{
    domain::{ThemeSettings, TimerState},
    protocol::{OverlayEvent, OverlayFrame, OverlayRequest},
};
use storage::Storage;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames queued per client before it counts as unreachable.
pub const CLIENT_QUEUE: usize = 64;

#[derive(Debug, Error)]
#[error("failed to bind broadcast listener on {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

pub async fn listen(host: &str, port: u16) -> Result<TcpListener, BindError> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| BindError { addr, source })
}

struct Registry {
    clients: HashMap<Uuid, mpsc::Sender<String>>,
    last_timer: Option<TimerState>,
}

pub struct BroadcastHub {
    registry: Mutex<Registry>,
    theme: Mutex<ThemeSettings>,
    storage: Storage,
}

impl BroadcastHub {
    pub fn new(storage: Storage, theme: ThemeSettings, last_timer: Option<TimerState>) -> Self {
        Self {
            registry: Mutex::new(Registry {
                clients: HashMap::new(),
                last_timer,
            }),
            theme: Mutex::new(theme.with_defaults()),
            storage,
        }
    }

    /// Adds a client. The current timer snapshot is queued for it before
    /// the registry is released, so it precedes any later fan-out.
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let mut registry = self.registry.lock().await;
        if let Some(state) = registry.last_timer {
            if let Some(text) = encode(&OverlayFrame::Timer(state)) {
                let _ = tx.try_send(text);
            }
        }
        registry.clients.insert(id, tx);
        info!(client_id = %id, clients = registry.clients.len(), "overlay client connected");
        (id, rx)
    }

    pub async fn remove(&self, id: Uuid) {
        let mut registry = self.registry.lock().await;
        if registry.clients.remove(&id).is_some() {
            info!(client_id = %id, clients = registry.clients.len(), "overlay client disconnected");
        }
    }

    pub async fn client_count(&self) -> usize {
        self.registry.lock().await.clients.len()
    }

    pub async fn last_timer(&self) -> Option<TimerState> {
        self.registry.lock().await.last_timer
    }

    pub async fn broadcast_timer(&self, state: TimerState) {
        let mut registry = self.registry.lock().await;
        registry.last_timer = Some(state);
        if let Some(text) = encode(&OverlayFrame::Timer(state)) {
            fan_out(&mut registry.clients, &text);
        }
    }

    pub async fn theme(&self) -> ThemeSettings {
        self.theme.lock().await.clone()
    }

    /// Replaces and persists the theme, then pushes it to every client.
    pub async fn update_theme(&self, settings: ThemeSettings) -> ThemeSettings {
        let settings = settings.with_defaults();
        *self.theme.lock().await = settings.clone();
        if let Err(error) = self.storage.save_theme(&settings) {
            warn!(%error, "failed to persist theme settings");
        }
        let frame = OverlayFrame::Event(OverlayEvent::Theme {
            settings: settings.clone(),
        });
        if let Some(text) = encode(&frame) {
            let mut registry = self.registry.lock().await;
            fan_out(&mut registry.clients, &text);
        }
        settings
    }

    /// Answers a request frame from client `id`. Unknown requests are ignored.
    pub async fn handle_request(&self, id: Uuid, text: &str) {
        match serde_json::from_str::<OverlayRequest>(text) {
            Ok(OverlayRequest::GetTheme) => {
                let frame = OverlayFrame::Event(OverlayEvent::Theme {
                    settings: self.theme().await,
                });
                let Some(text) = encode(&frame) else {
                    return;
                };
                let mut registry = self.registry.lock().await;
                let delivered = registry
                    .clients
                    .get(&id)
                    .map(|tx| tx.try_send(text).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    registry.clients.remove(&id);
                }
            }
            Err(error) => debug!(client_id = %id, %error, "ignoring overlay request"),
        }
    }
}

fn fan_out(clients: &mut HashMap<Uuid, mpsc::Sender<String>>, text: &str) {
    clients.retain(|id, tx| match tx.try_send(text.to_string()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(client_id = %id, "overlay client is not keeping up; dropping it");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(client_id = %id, "pruning closed overlay client");
            false
        }
    });
}

fn encode(frame: &OverlayFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(error) => {
            warn!(%error, "failed to encode overlay frame");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/overlay_tests.rs"]
mod tests;
