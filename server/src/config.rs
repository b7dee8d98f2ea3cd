//! Runtime configuration for the game server

use crate::error::ServerError;
use shared::{ACTION_COOLDOWN_MS, DEFAULT_MAP_HEIGHT, DEFAULT_MAP_WIDTH, TICK_RATE};
use std::time::Duration;

/// Settings shared by the simulation loop, the broadcaster and the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Simulation updates per second
    pub tick_rate: u32,
    pub map_width: i64,
    pub map_height: i64,
    /// Minimum interval between two accepted actions of one player
    pub cooldown_ms: u64,
    /// Capacity of the hand-off buffer between simulation and delivery
    pub event_buffer: usize,
    /// Undelivered events one session may hold before it is disconnected
    pub session_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            tick_rate: TICK_RATE,
            map_width: DEFAULT_MAP_WIDTH,
            map_height: DEFAULT_MAP_HEIGHT,
            cooldown_ms: ACTION_COOLDOWN_MS,
            event_buffer: 1024,
            session_buffer: 256,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Rejects settings the server cannot run with
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.tick_rate == 0 {
            return Err(ServerError::Config("tick rate must be positive".into()));
        }
        if self.event_buffer == 0 {
            return Err(ServerError::Config("event buffer must be positive".into()));
        }
        if self.session_buffer == 0 {
            return Err(ServerError::Config("session buffer must be positive".into()));
        }
        if self.map_width <= 0 || self.map_height <= 0 {
            return Err(ServerError::Config(format!(
                "map dimensions must be positive, got {}x{}",
                self.map_width, self.map_height
            )));
        }
        Ok(())
    }
}
