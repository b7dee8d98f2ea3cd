//! # Grid World Server Library
//!
//! Authoritative server for a shared grid world. Clients connect over
//! WebSocket, register an identity, issue movement commands and receive a
//! stream of state-change events so every client converges on the same
//! world state.
//!
//! ## Architecture
//!
//! ### Single Writer
//! One task runs the simulation loop and is the only code that mutates the
//! world. Connections never touch player state; they only append commands to
//! the shared queue. This removes the need for locking inside the simulation.
//!
//! ### Command Pipeline
//! Connection → command queue → simulation loop → world → event broadcaster →
//! session registry → every connection. The queue has many producers and one
//! consumer; the broadcaster's hand-off buffer has one producer and one
//! consumer and applies backpressure instead of dropping events.
//!
//! ### Fixed Tick Rate
//! The loop ticks at a fixed rate (60Hz by default). Each tick drains the
//! whole queue. Movement cooldowns are checked against wall-clock time, and a
//! command that arrives too early waits in the queue rather than being lost.
//!
//! ## Module Organization
//!
//! - `world`: map, players and occupancy queries
//! - `queue`: FIFO command queue with superseded-command removal
//! - `simulation`: the tick loop and command dispatch
//! - `broadcast`: bounded event hand-off and the delivery task
//! - `session`: identity to delivery-target mapping
//! - `network`: WebSocket transport and registration handshake
//! - `config`, `error`, `shutdown`: runtime settings, error types, stop signal
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::shutdown::Shutdown;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let shutdown = Shutdown::new();
//!
//!     // Runs the simulation loop, the broadcaster and the accept loop
//!     // until `shutdown.trigger()` is called
//!     server.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod network;
pub mod queue;
pub mod session;
pub mod shutdown;
pub mod simulation;
pub mod world;
