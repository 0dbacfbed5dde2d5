// =============================================================================
// Broadcast Manager — WebSocket endpoint fan-out
// =============================================================================
//
// One subscriber task consumes the event bus and hands each payload to
// `broadcast`, which fans it out to every live client of the matching
// endpoint. Clients whose channel has closed (disconnected sockets) are
// pruned during the send pass.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use uuid::Uuid;

/// WebSocket endpoints served by the broadcast manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    DhtLatest,
    PicoLatest,
    Alerts,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::DhtLatest => "/dht/latest",
            Endpoint::PicoLatest => "/pico/latest",
            Endpoint::Alerts => "/alerts",
        }
    }
}

#[derive(Default)]
pub struct BroadcastManager {
    clients: Mutex<HashMap<Endpoint, HashMap<Uuid, UnboundedSender<String>>>>,
}

impl BroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; returns its id and the message channel the
    /// socket task drains.
    pub fn connect(&self, endpoint: Endpoint) -> (Uuid, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let client_id = Uuid::new_v4();
        self.clients
            .lock()
            .entry(endpoint)
            .or_default()
            .insert(client_id, tx);
        info!(endpoint = endpoint.path(), client = %client_id, "websocket client connected");
        (client_id, rx)
    }

    pub fn disconnect(&self, endpoint: Endpoint, client_id: Uuid) {
        if let Some(clients) = self.clients.lock().get_mut(&endpoint) {
            clients.remove(&client_id);
        }
        info!(endpoint = endpoint.path(), client = %client_id, "websocket client disconnected");
    }

    /// Send `payload` to every client of `endpoint`, pruning the ones
    /// whose socket task has gone away.
    pub fn broadcast(&self, endpoint: Endpoint, payload: &str) {
        let mut clients = self.clients.lock();
        let Some(endpoint_clients) = clients.get_mut(&endpoint) else {
            return;
        };
        endpoint_clients.retain(|client_id, tx| {
            let alive = tx.send(payload.to_string()).is_ok();
            if !alive {
                debug!(endpoint = endpoint.path(), client = %client_id, "pruned dead client");
            }
            alive
        });
    }

    pub fn client_count(&self, endpoint: Endpoint) -> usize {
        self.clients
            .lock()
            .get(&endpoint)
            .map(|clients| clients.len())
            .unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_client_of_the_endpoint() {
        let manager = BroadcastManager::new();
        let (_id1, mut rx1) = manager.connect(Endpoint::DhtLatest);
        let (_id2, mut rx2) = manager.connect(Endpoint::DhtLatest);
        let (_id3, mut rx3) = manager.connect(Endpoint::Alerts);

        manager.broadcast(Endpoint::DhtLatest, "{\"temperature\": 21.0}");

        assert_eq!(rx1.recv().await.unwrap(), "{\"temperature\": 21.0}");
        assert_eq!(rx2.recv().await.unwrap(), "{\"temperature\": 21.0}");
        // Other endpoints see nothing.
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_clients_are_pruned_on_broadcast() {
        let manager = BroadcastManager::new();
        let (_id1, rx1) = manager.connect(Endpoint::Alerts);
        let (_id2, _rx2) = manager.connect(Endpoint::Alerts);
        assert_eq!(manager.client_count(Endpoint::Alerts), 2);

        drop(rx1);
        manager.broadcast(Endpoint::Alerts, "{}");
        assert_eq!(manager.client_count(Endpoint::Alerts), 1);
    }

    #[tokio::test]
    async fn disconnect_removes_client() {
        let manager = BroadcastManager::new();
        let (client_id, _rx) = manager.connect(Endpoint::PicoLatest);
        assert_eq!(manager.client_count(Endpoint::PicoLatest), 1);
        manager.disconnect(Endpoint::PicoLatest, client_id);
        assert_eq!(manager.client_count(Endpoint::PicoLatest), 0);
    }

    #[test]
    fn broadcast_to_empty_endpoint_is_a_noop() {
        let manager = BroadcastManager::new();
        manager.broadcast(Endpoint::DhtLatest, "{}");
        assert_eq!(manager.client_count(Endpoint::DhtLatest), 0);
    }
}
