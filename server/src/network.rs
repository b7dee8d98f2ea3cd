//! Server network layer: WebSocket connections, registration and game task wiring
//!
//! Every connection gets its own task that decodes inbound messages and turns
//! them into queued commands, plus a writer task that drains the connection's
//! delivery target onto the socket. Connections never touch the world.

use crate::broadcast::{self, Broadcaster};
use crate::config::ServerConfig;
use crate::error::{ProtocolError, ServerError};
use crate::queue::{Command, CommandQueue};
use crate::session::{DeliveryTarget, SessionRegistry};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::simulation::Simulation;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use log::{debug, error, info, warn};
use shared::{CommandKind, Envelope, Event, Map, SUBPROTOCOL};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

type WsSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

/// Listening server owning the map until the game tasks start
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    map: Map,
}

impl Server {
    /// Validates the config, builds the map and binds the listener.
    /// Any failure here is fatal: nothing has started yet.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let map = Map::new(config.map_width, config.map_height)?;
        let listener = TcpListener::bind(config.address()).await?;
        info!(
            "Server listening on {} ({}x{} map)",
            listener.local_addr()?,
            map.width,
            map.height
        );

        Ok(Self {
            listener,
            config,
            map,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts the simulation loop and the broadcaster, then accepts
    /// connections until `shutdown` fires
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ServerError> {
        let queue = Arc::new(CommandQueue::new());
        let sessions = Arc::new(SessionRegistry::new());
        let (events, receiver) = broadcast::channel(self.config.event_buffer);

        let simulation = Simulation::new(
            self.map,
            Arc::clone(&queue),
            events,
            self.config.cooldown(),
        );
        let game_handle = tokio::spawn(
            simulation.run(self.config.tick_duration(), shutdown.subscribe()),
        );

        let broadcaster = Broadcaster::new(receiver, Arc::clone(&sessions));
        let delivery_handle = tokio::spawn(broadcaster.run(shutdown.subscribe()));

        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let connection = Connection::new(
                            addr,
                            Arc::clone(&queue),
                            Arc::clone(&sessions),
                            self.config.session_buffer,
                        );
                        let signal = shutdown.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = connection.serve(stream, signal).await {
                                warn!("Connection {} ended with error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },
                _ = stop.stopped() => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        if let Err(e) = game_handle.await {
            error!("Game loop task panicked: {}", e);
        }
        if let Err(e) = delivery_handle.await {
            error!("Broadcaster task panicked: {}", e);
        }
        Ok(())
    }
}

/// Per-connection protocol state
struct Connection {
    addr: SocketAddr,
    queue: Arc<CommandQueue>,
    sessions: Arc<SessionRegistry>,
    identity: Option<String>,
    target: DeliveryTarget,
    events_rx: Option<mpsc::Receiver<Event>>,
}

impl Connection {
    fn new(
        addr: SocketAddr,
        queue: Arc<CommandQueue>,
        sessions: Arc<SessionRegistry>,
        session_buffer: usize,
    ) -> Self {
        let (target, events_rx) = DeliveryTarget::channel(session_buffer);
        Self {
            addr,
            queue,
            sessions,
            identity: None,
            target,
            events_rx: Some(events_rx),
        }
    }

    /// Runs the handshake, then reads until the peer leaves, the protocol is
    /// violated, its outbound buffer overflows or the server stops. The
    /// session is always torn down on exit.
    async fn serve(
        mut self,
        stream: TcpStream,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), ServerError> {
        let mut negotiated = false;
        let callback = |request: &Request,
                        mut response: Response|
         -> Result<Response, ErrorResponse> {
            if offers_subprotocol(request) {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
                negotiated = true;
            }
            Ok(response)
        };
        let ws_stream = accept_hdr_async(stream, callback).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let ws_sender: WsSink = Arc::new(Mutex::new(ws_sender));

        if !negotiated {
            warn!("Rejecting {}: {}", self.addr, ProtocolError::SubprotocolMismatch);
            close(&ws_sender, CloseCode::Policy, "client must speak the gridworld subprotocol").await;
            return Ok(());
        }
        debug!("Connection {} established", self.addr);

        let mut writer = match self.events_rx.take() {
            Some(events_rx) => spawn_writer(events_rx, Arc::clone(&ws_sender)),
            None => return Ok(()),
        };
        let overflow = self.target.overflow();

        loop {
            tokio::select! {
                message = ws_receiver.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.handle_text(text.as_str()).await {
                            warn!("Protocol error from {}: {}", self.addr, e);
                            close(&ws_sender, CloseCode::Protocol, &e.to_string()).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection {} closed by peer", self.addr);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", self.addr, e);
                        break;
                    }
                },
                _ = &mut writer => {
                    debug!("Writer for {} stopped", self.addr);
                    break;
                }
                // The writer may be stuck on a full socket, so no close frame
                _ = overflow.notified() => {
                    warn!("Dropping {}: outbound buffer full", self.addr);
                    break;
                }
                _ = shutdown.stopped() => {
                    close(&ws_sender, CloseCode::Away, "server shutting down").await;
                    break;
                }
            }
        }

        self.teardown().await;
        writer.abort();
        Ok(())
    }

    /// Decodes one inbound message and enqueues the resulting command
    async fn handle_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        let envelope = Envelope::parse(text)?;
        let kind = CommandKind::from_envelope(&envelope)?;

        match (self.identity.clone(), kind) {
            (None, CommandKind::Register) => {
                let id = envelope
                    .register_id()
                    .ok_or(ProtocolError::MissingIdentity)?;
                self.sessions.register(&id, self.target.clone()).await?;
                info!("Connection {} registered as {}", self.addr, id);
                self.queue.enqueue(Command::new(id.clone(), CommandKind::Register));
                self.identity = Some(id);
                Ok(())
            }
            (None, _) => Err(ProtocolError::NotRegistered),
            (Some(id), CommandKind::Register) => Err(ProtocolError::AlreadyRegistered(id)),
            (Some(id), kind) => {
                self.queue.enqueue(Command::new(id, kind));
                Ok(())
            }
        }
    }

    /// Queues the player's removal before freeing the id, so a reconnect
    /// under the same id is always ordered after the old player's exit
    async fn teardown(&mut self) {
        if let Some(id) = self.identity.take() {
            self.queue.enqueue(Command::new(id.clone(), CommandKind::Disconnect));
            self.sessions.unregister(&id).await;
        }
    }
}

fn offers_subprotocol(request: &Request) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == SUBPROTOCOL)
}

/// Drains a session's delivery target onto its socket
fn spawn_writer(mut events_rx: mpsc::Receiver<Event>, ws_sender: WsSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize {}: {}", event.tag(), e);
                    continue;
                }
            };

            let mut sender = ws_sender.lock().await;
            if let Err(e) = sender.send(Message::Text(text.into())).await {
                debug!("Failed to write {}: {}", event.tag(), e);
                break;
            }
        }
    })
}

async fn close(ws_sender: &WsSink, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let mut sender = ws_sender.lock().await;
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    fn test_connection() -> (Connection, Arc<CommandQueue>, Arc<SessionRegistry>) {
        let queue = Arc::new(CommandQueue::new());
        let sessions = Arc::new(SessionRegistry::new());
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let connection = Connection::new(addr, Arc::clone(&queue), Arc::clone(&sessions), 16);
        (connection, queue, sessions)
    }

    #[tokio::test]
    async fn test_register_then_command() {
        let (mut connection, queue, sessions) = test_connection();

        connection
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await
            .unwrap();
        connection
            .handle_text(r#"{"type":"move_direction","id":"mallory","data":{"direction":"up"}}"#)
            .await
            .unwrap();

        assert!(sessions.contains("alice").await);
        let commands: Vec<Command> = queue.drain().into_iter().collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].kind, CommandKind::Register);
        assert_eq!(commands[1].actor, "alice", "actor is the registered identity");
    }

    #[tokio::test]
    async fn test_command_before_register() {
        let (mut connection, queue, _sessions) = test_connection();
        let result = connection.handle_text(r#"{"type":"spawn_player"}"#).await;
        assert!(matches!(result, Err(ProtocolError::NotRegistered)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_register_twice_on_one_connection() {
        let (mut connection, _queue, _sessions) = test_connection();
        connection
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await
            .unwrap();
        let result = connection
            .handle_text(r#"{"type":"register","id":"bob"}"#)
            .await;
        assert!(matches!(result, Err(ProtocolError::AlreadyRegistered(id)) if id == "alice"));
    }

    #[tokio::test]
    async fn test_duplicate_identity_across_connections() {
        let (mut first, queue, sessions) = test_connection();
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let mut second = Connection::new(addr, Arc::clone(&queue), Arc::clone(&sessions), 16);

        first
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await
            .unwrap();
        let result = second
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await;
        assert!(matches!(result, Err(ProtocolError::Session(_))));
        assert_eq!(sessions.len().await, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_register_without_identity() {
        let (mut connection, _queue, _sessions) = test_connection();
        let result = connection.handle_text(r#"{"type":"register"}"#).await;
        assert!(matches!(result, Err(ProtocolError::MissingIdentity)));
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (mut connection, _queue, _sessions) = test_connection();
        connection
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await
            .unwrap();
        let result = connection
            .handle_text(r#"{"type":"move_direction","data":{"direction":7}}"#)
            .await;
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[tokio::test]
    async fn test_teardown_unregisters_and_enqueues_disconnect() {
        let (mut connection, queue, sessions) = test_connection();
        connection
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await
            .unwrap();
        queue.drain();

        connection.teardown().await;
        assert!(!sessions.contains("alice").await);
        let last = queue.dequeue().unwrap();
        assert_eq!(last.actor, "alice");
        assert_eq!(last.kind, CommandKind::Disconnect);

        connection.teardown().await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_is_ordered_after_disconnect() {
        let (mut first, queue, sessions) = test_connection();
        first
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await
            .unwrap();
        queue.drain();

        first.teardown().await;
        let addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let mut second = Connection::new(addr, Arc::clone(&queue), Arc::clone(&sessions), 16);
        second
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await
            .unwrap();

        let commands: Vec<CommandKind> = queue.drain().into_iter().map(|c| c.kind).collect();
        assert_eq!(commands, vec![CommandKind::Disconnect, CommandKind::Register]);
    }

    #[tokio::test]
    async fn test_overflowing_session_is_signalled() {
        let queue = Arc::new(CommandQueue::new());
        let sessions = Arc::new(SessionRegistry::new());
        let addr: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        let mut connection = Connection::new(addr, queue, Arc::clone(&sessions), 1);
        connection
            .handle_text(r#"{"type":"register","id":"alice"}"#)
            .await
            .unwrap();

        let event = Event::MovePlayer(shared::Player::new("alice", 0, 0));
        assert!(sessions.send("alice", event.clone()).await.is_ok());
        assert!(sessions.send("alice", event).await.is_err());

        let overflow = connection.target.overflow();
        tokio::time::timeout(std::time::Duration::from_millis(100), overflow.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_subprotocol_detection() {
        let mut request = "ws://127.0.0.1:3000".into_client_request().unwrap();
        assert!(!offers_subprotocol(&request));

        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("chat, gridworld"),
        );
        assert!(offers_subprotocol(&request));
    }
}
