use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const SUBPROTOCOL: &str = "gridworld";
pub const TICK_RATE: u32 = 60;
pub const DEFAULT_MAP_WIDTH: i64 = 500;
pub const DEFAULT_MAP_HEIGHT: i64 = 500;
pub const GRASS_TILE: u32 = 317;
pub const ACTION_COOLDOWN_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("invalid map dimensions {width}x{height}")]
    InvalidDimensions { width: i64, height: i64 },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

/// Tile grid shared read-only by every component. Indexed `data[x][y]`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Map {
    pub width: i64,
    pub height: i64,
    pub data: Vec<Vec<u32>>,
}

impl Map {
    /// Builds a `width` x `height` map filled with grass tiles.
    pub fn new(width: i64, height: i64) -> Result<Self, MapError> {
        if width <= 0 || height <= 0 {
            return Err(MapError::InvalidDimensions { width, height });
        }

        let data = (0..width)
            .map(|_| vec![GRASS_TILE; height as usize])
            .collect();

        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        (0..self.width).contains(&x) && (0..self.height).contains(&y)
    }

    pub fn tile(&self, x: i64, y: i64) -> Option<u32> {
        if !self.contains(x, y) {
            return None;
        }
        Some(self.data[x as usize][y as usize])
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Player {
    pub id: String,
    pub x: i64,
    pub y: i64,
    /// Wall-clock time of the last accepted action; never sent to clients.
    #[serde(skip)]
    pub last_action: Option<Instant>,
}

impl Player {
    pub fn new(id: impl Into<String>, x: i64, y: i64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            last_action: None,
        }
    }

    /// Moves the player and records `now` as its last action.
    pub fn move_to(&mut self, x: i64, y: i64, now: Instant) {
        self.x = x;
        self.y = y;
        self.last_action = Some(now);
    }

    /// A player that has never acted is always ready.
    pub fn is_ready(&self, now: Instant, cooldown: Duration) -> bool {
        match self.last_action {
            Some(at) => now.saturating_duration_since(at) >= cooldown,
            None => true,
        }
    }

    pub fn is_at(&self, x: i64, y: i64) -> bool {
        self.x == x && self.y == y
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn offset(self) -> (i64, i64) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn apply(self, x: i64, y: i64) -> (i64, i64) {
        let (dx, dy) = self.offset();
        (x + dx, y + dy)
    }

    /// Recovers the direction of a single-cell step, if it is one.
    pub fn between(from: (i64, i64), to: (i64, i64)) -> Option<Self> {
        let dx = to.0.checked_sub(from.0)?;
        let dy = to.1.checked_sub(from.1)?;
        match (dx, dy) {
            (0, -1) => Some(Direction::Up),
            (0, 1) => Some(Direction::Down),
            (-1, 0) => Some(Direction::Left),
            (1, 0) => Some(Direction::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct MoveDirectionData {
    pub direction: Direction,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct MovePositionData {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RegisterData {
    #[serde(default)]
    pub id: Option<String>,
}

/// Raw inbound message. The payload stays undecoded until the tag is known.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Identity offered at registration: the envelope id, else `data.id`.
    pub fn register_id(&self) -> Option<String> {
        if !self.id.is_empty() {
            return Some(self.id.clone());
        }
        serde_json::from_value::<RegisterData>(self.data.clone())
            .ok()
            .and_then(|data| data.id)
            .filter(|id| !id.is_empty())
    }

    fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.data.clone()).map_err(|source| DecodeError::InvalidPayload {
            kind: self.kind.clone(),
            source,
        })
    }
}

/// Strongly-typed command payloads, keyed by the envelope tag.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Register,
    SpawnPlayer,
    MoveDirection(Direction),
    MovePosition { x: i64, y: i64 },
    ClearPlayerInput,
    Snapshot,
    /// Server-internal: the actor's connection closed. Never decoded from the wire.
    Disconnect,
    Unrecognized(String),
}

impl CommandKind {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, DecodeError> {
        let kind = match envelope.kind.as_str() {
            "register" => CommandKind::Register,
            "spawn_player" => CommandKind::SpawnPlayer,
            "move_direction" => {
                let data: MoveDirectionData = envelope.payload()?;
                CommandKind::MoveDirection(data.direction)
            }
            "move_position" => {
                let data: MovePositionData = envelope.payload()?;
                CommandKind::MovePosition {
                    x: data.x,
                    y: data.y,
                }
            }
            "clear_player_input" => CommandKind::ClearPlayerInput,
            "snapshot" => CommandKind::Snapshot,
            other => CommandKind::Unrecognized(other.to_string()),
        };
        Ok(kind)
    }

    pub fn tag(&self) -> &str {
        match self {
            CommandKind::Register => "register",
            CommandKind::SpawnPlayer => "spawn_player",
            CommandKind::MoveDirection(_) => "move_direction",
            CommandKind::MovePosition { .. } => "move_position",
            CommandKind::ClearPlayerInput => "clear_player_input",
            CommandKind::Snapshot => "snapshot",
            CommandKind::Disconnect => "disconnect",
            CommandKind::Unrecognized(tag) => tag,
        }
    }

    /// Builds the wire envelope a client sends for this command.
    pub fn to_envelope(&self, id: &str) -> Envelope {
        let data = match self {
            CommandKind::MoveDirection(direction) => {
                serde_json::json!({ "direction": direction })
            }
            CommandKind::MovePosition { x, y } => serde_json::json!({ "x": x, "y": y }),
            _ => Value::Null,
        };

        Envelope {
            kind: self.tag().to_string(),
            id: id.to_string(),
            data,
        }
    }
}

/// Outgoing state-change notification. Snapshots share the map rather than
/// copying it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    AddPlayer(Player),
    RemovePlayer(Player),
    MovePlayer(Player),
    Snapshot { players: Vec<Player>, map: Arc<Map> },
}

impl Event {
    pub fn tag(&self) -> &'static str {
        match self {
            Event::AddPlayer(_) => "add_player",
            Event::RemovePlayer(_) => "remove_player",
            Event::MovePlayer(_) => "move_player",
            Event::Snapshot { .. } => "snapshot",
        }
    }

    pub fn player(&self) -> Option<&Player> {
        match self {
            Event::AddPlayer(player) | Event::RemovePlayer(player) | Event::MovePlayer(player) => {
                Some(player)
            }
            Event::Snapshot { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
