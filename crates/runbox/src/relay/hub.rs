//! Relay hub: fan-out of run output to stream clients, fan-in of input.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::types::RelayEvent;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

/// Size of the per-run stdin buffer.
const STDIN_BUFFER_SIZE: usize = 64;

type EventSender = mpsc::Sender<RelayEvent>;

/// Hub connecting stream clients to the runs of their sessions.
///
/// Clients register per session id; a run attaches a stdin sink for its
/// lifetime. Input arriving while no run is attached is dropped.
pub struct RelayHub {
    /// Session ID -> connected stream clients.
    clients: DashMap<String, Vec<(u64, EventSender)>>,

    /// Session ID -> stdin sink of the currently live run.
    stdin: DashMap<String, mpsc::Sender<String>>,

    next_conn_id: AtomicU64,
}

impl RelayHub {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            stdin: DashMap::new(),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Register a stream client for a session.
    ///
    /// Returns the receiver for relay events and the connection id used to
    /// unregister. Multiple clients per session are allowed; each receives
    /// every event.
    pub fn register(&self, session_id: &str) -> (mpsc::Receiver<RelayEvent>, u64) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .entry(session_id.to_string())
            .or_default()
            .push((conn_id, tx));
        info!(
            "Registered stream connection {} for session {}",
            conn_id, session_id
        );
        (rx, conn_id)
    }

    /// Unregister a stream client.
    pub fn unregister(&self, session_id: &str, conn_id: u64) {
        if let Some(mut conns) = self.clients.get_mut(session_id) {
            conns.retain(|(id, _)| *id != conn_id);
            info!(
                "Unregistered stream connection {} for session {}",
                conn_id, session_id
            );
        }
        self.clients.retain(|_, conns| !conns.is_empty());
    }

    /// Broadcast an event to every client of a session.
    ///
    /// Senders are cloned out before awaiting so no map guard is held across
    /// a send.
    pub async fn broadcast(&self, session_id: &str, event: RelayEvent) {
        let senders: Vec<EventSender> = match self.clients.get(session_id) {
            Some(conns) => conns.iter().map(|(_, tx)| tx.clone()).collect(),
            None => {
                debug!(
                    "No stream clients for session {}, dropping {:?}",
                    session_id, event
                );
                return;
            }
        };

        for tx in senders {
            if tx.send(event.clone()).await.is_err() {
                warn!("Failed to deliver event to a session {} client", session_id);
            }
        }
    }

    /// Attach the stdin sink of a newly started run.
    pub fn attach_stdin(&self, session_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(STDIN_BUFFER_SIZE);
        self.stdin.insert(session_id.to_string(), tx);
        rx
    }

    /// Detach the stdin sink when a run ends.
    pub fn detach_stdin(&self, session_id: &str) {
        self.stdin.remove(session_id);
    }

    /// Forward client input to the live run, if any.
    ///
    /// Returns false when the input was dropped because no process is live.
    pub async fn forward_input(&self, session_id: &str, data: String) -> bool {
        let tx = match self.stdin.get(session_id) {
            Some(entry) => entry.clone(),
            None => {
                debug!(
                    "Dropping input for session {}: no live process",
                    session_id
                );
                return false;
            }
        };
        tx.send(data).await.is_ok()
    }

    /// Number of connected clients for a session.
    pub fn client_count(&self, session_id: &str) -> usize {
        self.clients
            .get(session_id)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}
