//! Progress Bus
//!
//! Per-session fan-out of pipeline progress events to any number of
//! subscribers. Delivery is FIFO per session (the supervisor is the single
//! writer for a session), publishers never block, and a slow subscriber loses
//! the oldest events first (the broadcast channel lag semantics), with a
//! per-subscription counter recording how many were dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::{ProgressEnvelope, ProgressEvent};

/// Delivery channel capacity per session.
pub const CHANNEL_CAPACITY: usize = 128;

/// Keepalive ping cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct ProgressBus {
    sessions: RwLock<HashMap<String, broadcast::Sender<ProgressEnvelope>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a session's event stream. The channel is created on first
    /// use so subscribers may attach before the workflow starts.
    pub fn subscribe(&self, session_id: &str) -> ProgressSubscription {
        let rx = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        ProgressSubscription {
            session_id: session_id.to_string(),
            rx,
            lagged: 0,
        }
    }

    /// Publish an event to a session. Non-blocking; events published with no
    /// live subscribers are dropped. Publishing the terminal event closes the
    /// session channel server-side.
    pub fn publish(&self, session_id: &str, event: ProgressEvent) {
        let terminal = event.is_terminal();
        let envelope = ProgressEnvelope {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            event,
        };
        if terminal {
            // Remove first so the send is the channel's last message; the
            // sender drops at end of scope and receivers observe Closed after
            // draining it.
            let sender = self.sessions.write().remove(session_id);
            if let Some(sender) = sender {
                let _ = sender.send(envelope);
            }
            return;
        }
        let sessions = self.sessions.read();
        if let Some(sender) = sessions.get(session_id) {
            let _ = sender.send(envelope);
        }
    }

    /// Drop a session channel without a terminal event (cleanup path).
    pub fn close(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Background keepalive: a ping to every active session every 15 s so
    /// idle subscribers can distinguish a quiet pipeline from a dead one.
    pub fn spawn_keepalive(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for session_id in bus.active_sessions() {
                    bus.publish(&session_id, ProgressEvent::Ping {});
                }
            }
        })
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressSubscription {
    session_id: String,
    rx: broadcast::Receiver<ProgressEnvelope>,
    lagged: u64,
}

impl ProgressSubscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Events dropped from this subscription under backpressure.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Next event, or None once the session channel is closed.
    pub async fn recv(&mut self) -> Option<ProgressEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                    warn!(session = %self.session_id, dropped = n, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(session = %self.session_id, "progress channel closed");
                    return None;
                }
            }
        }
    }
}
