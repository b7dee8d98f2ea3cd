//! Event hand-off from the simulation loop to connected sessions
//!
//! Producers push into a bounded channel and wait when it is full, so no
//! event is ever dropped on the way out. A single delivery task drains the
//! channel in emission order and fans each event out through the session
//! registry, either to one addressed session or to all of them.

use crate::error::BroadcastError;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownSignal;
use log::{debug, info, warn};
use shared::Event;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Unicast to a single session, e.g. the snapshot for a new arrival
    Session(String),
    /// Every registered session
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub delivery: Delivery,
    pub event: Event,
}

/// Producer handle; cheap to clone
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Outbound>,
}

impl EventSender {
    async fn push(&self, outbound: Outbound) -> Result<(), BroadcastError> {
        self.tx
            .send(outbound)
            .await
            .map_err(|_| BroadcastError::Closed)
    }

    /// Queues `event` for one session, waiting while the buffer is full
    pub async fn send_to(&self, id: &str, event: Event) -> Result<(), BroadcastError> {
        self.push(Outbound {
            delivery: Delivery::Session(id.to_string()),
            event,
        })
        .await
    }

    /// Queues `event` for every session, waiting while the buffer is full
    pub async fn broadcast(&self, event: Event) -> Result<(), BroadcastError> {
        self.push(Outbound {
            delivery: Delivery::All,
            event,
        })
        .await
    }
}

/// Creates the hand-off buffer with room for `capacity` pending events
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, rx)
}

/// Delivery routine owning the consuming end of the hand-off buffer
pub struct Broadcaster {
    rx: mpsc::Receiver<Outbound>,
    sessions: Arc<SessionRegistry>,
}

impl Broadcaster {
    pub fn new(rx: mpsc::Receiver<Outbound>, sessions: Arc<SessionRegistry>) -> Self {
        Self { rx, sessions }
    }

    /// Delivers events until stop is signalled or every producer is gone
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!("Event broadcaster started");

        loop {
            tokio::select! {
                outbound = self.rx.recv() => match outbound {
                    Some(outbound) => self.deliver(outbound).await,
                    None => {
                        info!("All event producers dropped, broadcaster exiting");
                        break;
                    }
                },
                _ = shutdown.stopped() => {
                    info!("Event broadcaster shutting down");
                    break;
                }
            }
        }
    }

    /// Pushes one event to its addressee(s). Failures are logged per session.
    pub async fn deliver(&self, outbound: Outbound) {
        let tag = outbound.event.tag();

        match outbound.delivery {
            Delivery::Session(id) => {
                if let Err(e) = self.sessions.send(&id, outbound.event).await {
                    warn!("Failed to deliver {} to session {}: {}", tag, id, e);
                }
            }
            Delivery::All => {
                let delivered = self.sessions.broadcast(&outbound.event).await;
                debug!("Broadcast {} to {} sessions", tag, delivered);
            }
        }
    }
}
