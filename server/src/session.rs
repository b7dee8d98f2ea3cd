//! Session registry mapping player identities to their outbound channels
//!
//! A session is created when a connection registers and destroyed when it
//! closes. The registry is the single owner of that mapping; the delivery
//! routine reads it, connection handlers add and remove entries.
//!
//! Every session buffers a bounded number of events. Pushing never waits: a
//! session whose buffer is full misses the event and is told to close through
//! its overflow signal, so one stalled reader cannot hold up the others or
//! grow server memory.

use crate::error::SessionError;
use log::{info, warn};
use shared::Event;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};

/// Where events for one connection are pushed. The connection's writer task
/// drains the receiving half onto its socket.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    events: mpsc::Sender<Event>,
    overflow: Arc<Notify>,
}

impl DeliveryTarget {
    /// Creates a target holding at most `capacity` undelivered events
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let target = Self {
            events,
            overflow: Arc::new(Notify::new()),
        };
        (target, rx)
    }

    /// Notified once the buffer has overflowed; the owner should close.
    pub fn overflow(&self) -> Arc<Notify> {
        Arc::clone(&self.overflow)
    }

    fn push(&self, id: &str, event: Event) -> Result<(), SessionError> {
        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                Err(SessionError::Full(id.to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed(id.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, DeliveryTarget>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. A second registration of a live id is rejected and
    /// leaves the existing target in place.
    pub async fn register(&self, id: &str, target: DeliveryTarget) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(id) {
            return Err(SessionError::AlreadyRegistered(id.to_string()));
        }

        sessions.insert(id.to_string(), target);
        info!("Session {} registered ({} active)", id, sessions.len());
        Ok(())
    }

    /// Removes a session; returns false if it was already gone
    pub async fn unregister(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_some() {
            info!("Session {} unregistered ({} active)", id, sessions.len());
            true
        } else {
            false
        }
    }

    /// Pushes an event to one session
    pub async fn send(&self, id: &str, event: Event) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        let target = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        target.push(id, event)
    }

    /// Pushes an event to every session. A dead or full session is logged
    /// and skipped. Returns how many sessions accepted the event.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;

        for (id, target) in sessions.iter() {
            if let Err(e) = target.push(id, event.clone()) {
                warn!("Failed to deliver {}: {}", event.tag(), e);
                continue;
            }
            delivered += 1;
        }

        delivered
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
