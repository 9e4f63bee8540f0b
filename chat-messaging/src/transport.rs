//! Live push transports.
//!
//! The socket transport keeps one outbound queue per open connection and fans
//! events out to every connection a user holds. The feed transport pushes
//! nothing; clients observe state through change-feed subscriptions instead.

use chat_core::UserId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::events::ChatEvent;

/// Outcome of pushing an event to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// At least one open connection accepted the event.
    Live,
    /// Nobody is connected; the event is only visible through the store.
    Deferred,
}

pub trait Transport: Send + Sync {
    fn push(&self, user_id: &UserId, event: &ChatEvent) -> Delivery;

    /// Pushes to every connected user except `except`.
    fn broadcast(&self, event: &ChatEvent, except: &UserId);

    /// Whether a live push counts as delivery to the recipient's device.
    fn acknowledges_delivery(&self) -> bool;
}

pub type ConnectionId = u64;

struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<ChatEvent>,
}

/// Registry of open socket connections keyed by user.
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<UserId, Vec<Connection>>,
    next_id: AtomicU64,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns the queue its writer task drains.
    pub fn register(&self, user_id: &UserId) -> (ConnectionId, mpsc::UnboundedReceiver<ChatEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbound, rx) = mpsc::unbounded_channel();
        self.connections
            .entry(user_id.clone())
            .or_default()
            .push(Connection { id, outbound });
        tracing::debug!("Registered connection {} for user {}", id, user_id);
        (id, rx)
    }

    pub fn unregister(&self, user_id: &UserId, connection_id: ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(user_id) {
            entry.retain(|c| c.id != connection_id);
        }
        self.connections.remove_if(user_id, |_, conns| conns.is_empty());
        tracing::debug!("Unregistered connection {} for user {}", connection_id, user_id);
    }

    /// Pushes to one connection only, for replies to that connection's own requests.
    pub fn push_to(&self, user_id: &UserId, connection_id: ConnectionId, event: &ChatEvent) -> Delivery {
        let sent = self
            .connections
            .get(user_id)
            .and_then(|conns| {
                conns
                    .iter()
                    .find(|c| c.id == connection_id)
                    .map(|c| c.outbound.send(event.clone()).is_ok())
            })
            .unwrap_or(false);
        if sent {
            Delivery::Live
        } else {
            Delivery::Deferred
        }
    }

    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.connections.get(user_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn connected_users(&self) -> usize {
        self.connections.len()
    }
}

impl Transport for ConnectionHub {
    fn push(&self, user_id: &UserId, event: &ChatEvent) -> Delivery {
        let mut delivered = false;
        if let Some(mut entry) = self.connections.get_mut(user_id) {
            entry.retain(|conn| {
                let ok = conn.outbound.send(event.clone()).is_ok();
                delivered |= ok;
                ok
            });
        }
        self.connections.remove_if(user_id, |_, conns| conns.is_empty());

        if delivered {
            Delivery::Live
        } else {
            Delivery::Deferred
        }
    }

    fn broadcast(&self, event: &ChatEvent, except: &UserId) {
        for entry in self.connections.iter() {
            if entry.key() == except {
                continue;
            }
            for conn in entry.value() {
                let _ = conn.outbound.send(event.clone());
            }
        }
    }

    fn acknowledges_delivery(&self) -> bool {
        true
    }
}

/// Transport for the change-feed discipline: every push is deferred.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedTransport;

impl Transport for FeedTransport {
    fn push(&self, _user_id: &UserId, _event: &ChatEvent) -> Delivery {
        Delivery::Deferred
    }

    fn broadcast(&self, _event: &ChatEvent, _except: &UserId) {}

    fn acknowledges_delivery(&self) -> bool {
        false
    }
}
