//! Scripted headless client: registers, spawns and wanders randomly

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use rand::seq::SliceRandom;
use shared::{CommandKind, Direction, Event, SUBPROTOCOL};
use std::time::Duration;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:3000")]
    server: String,

    /// Player identity to register
    #[arg(short = 'i', long, default_value = "bot")]
    id: String,

    /// Number of random moves to send before leaving
    #[arg(short = 'm', long, default_value = "20")]
    moves: usize,

    /// Milliseconds between moves
    #[arg(long, default_value = "300")]
    interval_ms: u64,
}

fn encode(kind: &CommandKind, id: &str) -> Result<Message, serde_json::Error> {
    let text = serde_json::to_string(&kind.to_envelope(id))?;
    Ok(Message::Text(text.into()))
}

fn describe(event: &Event) -> String {
    match event {
        Event::Snapshot { players, map } => format!(
            "snapshot: {} players on {}x{} map",
            players.len(),
            map.width,
            map.height
        ),
        other => match other.player() {
            Some(player) => format!("{} {} at ({}, {})", other.tag(), player.id, player.x, player.y),
            None => other.tag().to_string(),
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut request = format!("ws://{}", args.server).into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    info!("Connecting to {}", args.server);
    let (ws_stream, _) = connect_async(request).await?;
    let (mut sink, mut stream) = ws_stream.split();

    sink.send(encode(&CommandKind::Register, &args.id)?).await?;
    sink.send(encode(&CommandKind::SpawnPlayer, &args.id)?).await?;

    let directions = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];
    let mut ticker = interval(Duration::from_millis(args.interval_ms));
    let mut sent = 0;

    while sent < args.moves {
        tokio::select! {
            _ = ticker.tick() => {
                let direction = *directions
                    .choose(&mut rand::thread_rng())
                    .unwrap_or(&Direction::Up);
                sink.send(encode(&CommandKind::MoveDirection(direction), &args.id)?).await?;
                sent += 1;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match Event::from_json(text.as_str()) {
                    Ok(event) => info!("Received {}", describe(&event)),
                    Err(e) => warn!("Failed to decode event: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!("Server closed connection: {:?}", frame);
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }

    info!("Sent {} moves, disconnecting", sent);
    sink.send(Message::Close(None)).await?;
    Ok(())
}
