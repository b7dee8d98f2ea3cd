//! Authoritative simulation loop
//!
//! The loop is the only mutator of the world. Every tick it drains the
//! command queue, validates each command against the world and emits the
//! resulting events to the broadcaster.
//!
//! ## Movement cooldown
//! A player may act at most once per cooldown, measured in wall-clock time.
//! A movement command that arrives early is not dropped: it goes back to the
//! front of the queue and is retried on later ticks until it becomes eligible
//! or a `clear_player_input` from the same actor supersedes it. Later commands
//! from that actor wait behind it, which keeps each actor's commands in
//! submission order.

use crate::broadcast::EventSender;
use crate::error::WorldError;
use crate::queue::{discard_superseded, Command, CommandQueue};
use crate::shutdown::ShutdownSignal;
use crate::world::World;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{CommandKind, Direction, Event, Map, Player};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

/// What happened to a single dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State changed and an event went out
    Applied,
    /// Illegal move or duplicate spawn; silently dropped
    Rejected,
    /// Unknown player or unrecognized type; logged and dropped
    Discarded,
    /// Player still cooling down; retry on a later tick
    NotReady,
}

pub struct Simulation {
    world: World,
    queue: Arc<CommandQueue>,
    events: EventSender,
    cooldown: Duration,
    rng: StdRng,
    tick: u64,
    /// Sum of all tick deltas, in seconds
    clock: f64,
    state: LoopState,
}

impl Simulation {
    pub fn new(
        map: Map,
        queue: Arc<CommandQueue>,
        events: EventSender,
        cooldown: Duration,
    ) -> Self {
        Self {
            world: World::new(map),
            queue,
            events,
            cooldown,
            rng: StdRng::from_entropy(),
            tick: 0,
            clock: 0.0,
            state: LoopState::Stopped,
        }
    }

    /// Replaces the spawn-point generator, for reproducible placement
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Full-state event: all players plus the map
    pub fn snapshot(&self) -> Event {
        self.world.snapshot()
    }

    /// Ticks every `tick_duration` until stop is signalled, then hands the
    /// simulation back.
    ///
    /// Each tick measures the real time since the previous one, so a slow
    /// tick shows up as a larger delta instead of being silently absorbed.
    pub async fn run(mut self, tick_duration: Duration, mut shutdown: ShutdownSignal) -> Self {
        let mut interval_timer = interval(tick_duration);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        interval_timer.tick().await;

        let mut last_tick = Instant::now();
        let slow_tick = tick_duration.as_secs_f64() * 4.0;
        self.state = LoopState::Running;
        info!(
            "Simulation running at {:.1}Hz",
            1.0 / tick_duration.as_secs_f64()
        );

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    let now = Instant::now();
                    let delta = now.duration_since(last_tick).as_secs_f64();
                    last_tick = now;

                    if delta > slow_tick {
                        warn!("Large delta time detected ({:.3}s)", delta);
                    }

                    self.update_at(delta, now).await;

                    if self.tick % 60 == 0 && !self.world.is_empty() {
                        debug!(
                            "Tick {}: {} players, {} queued, {:.1}Hz",
                            self.tick,
                            self.world.len(),
                            self.queue.len(),
                            1.0 / delta
                        );
                    }
                }
                _ = shutdown.stopped() => {
                    info!("Simulation stopping at tick {}", self.tick);
                    break;
                }
            }
        }

        self.state = LoopState::Stopped;
        self
    }

    /// Advances the simulation by `delta` seconds using the current time
    pub async fn update(&mut self, delta: f64) {
        self.update_at(delta, Instant::now()).await;
    }

    /// Drains the queue and applies every command, judging cooldowns at `now`
    pub async fn update_at(&mut self, delta: f64, now: Instant) {
        self.tick += 1;
        self.clock += delta;

        let mut batch = self.queue.drain();
        let mut deferred: VecDeque<Command> = VecDeque::new();
        let mut blocked: HashSet<String> = HashSet::new();

        while let Some(cmd) = batch.pop_front() {
            if matches!(cmd.kind, CommandKind::ClearPlayerInput) {
                self.clear_input(&cmd, &mut deferred);
                blocked.remove(&cmd.actor);
            } else if matches!(cmd.kind, CommandKind::Disconnect) {
                self.clear_input(&cmd, &mut deferred);
                blocked.remove(&cmd.actor);
                self.disconnect(&cmd.actor).await;
            } else if blocked.contains(&cmd.actor) {
                deferred.push_back(cmd);
            } else if self.dispatch(&cmd, now).await == Outcome::NotReady {
                blocked.insert(cmd.actor.clone());
                deferred.push_back(cmd);
            }
        }

        self.queue.requeue_front(deferred);
    }

    /// Validates and applies one command
    pub async fn dispatch(&mut self, cmd: &Command, now: Instant) -> Outcome {
        match &cmd.kind {
            CommandKind::Register | CommandKind::Snapshot => {
                let snapshot = self.world.snapshot();
                self.emit_to(&cmd.actor, snapshot).await;
                Outcome::Applied
            }
            CommandKind::SpawnPlayer => match self.spawn_player(&cmd.actor).await {
                Ok(_) => Outcome::Applied,
                Err(e) => {
                    debug!("Rejected spawn for {}: {}", cmd.actor, e);
                    Outcome::Rejected
                }
            },
            CommandKind::MoveDirection(direction) => {
                self.move_player(&cmd.actor, *direction, now).await
            }
            CommandKind::MovePosition { x, y } => {
                let from = match self.world.player(&cmd.actor) {
                    Some(player) => (player.x, player.y),
                    None => {
                        warn!("Move from unknown player {}", cmd.actor);
                        return Outcome::Discarded;
                    }
                };

                match Direction::between(from, (*x, *y)) {
                    Some(direction) => self.move_player(&cmd.actor, direction, now).await,
                    None => {
                        debug!(
                            "Rejected non-adjacent move for {} to ({}, {})",
                            cmd.actor, x, y
                        );
                        Outcome::Rejected
                    }
                }
            }
            CommandKind::ClearPlayerInput => {
                self.queue.discard_before(cmd);
                Outcome::Applied
            }
            CommandKind::Disconnect => {
                if self.disconnect(&cmd.actor).await {
                    Outcome::Applied
                } else {
                    Outcome::Discarded
                }
            }
            CommandKind::Unrecognized(tag) => {
                warn!("Discarding unrecognized command {} from {}", tag, cmd.actor);
                Outcome::Discarded
            }
        }
    }

    /// Places a new player on a free cell and announces it to everyone
    pub async fn spawn_player(&mut self, id: &str) -> Result<Player, WorldError> {
        let player = self.world.spawn_player(id, &mut self.rng)?;
        self.emit_all(Event::AddPlayer(player.clone())).await;
        Ok(player)
    }

    /// Removes a player and announces its departure
    pub async fn remove_player(&mut self, id: &str) -> Result<Player, WorldError> {
        let player = self.world.remove_player(id)?;
        self.emit_all(Event::RemovePlayer(player.clone())).await;
        Ok(player)
    }

    async fn move_player(&mut self, id: &str, direction: Direction, now: Instant) -> Outcome {
        let (x, y) = match self.world.player(id) {
            Some(player) if !player.is_ready(now, self.cooldown) => return Outcome::NotReady,
            Some(player) => direction.apply(player.x, player.y),
            None => {
                warn!("Move from unknown player {}", id);
                return Outcome::Discarded;
            }
        };

        if !self.world.is_free(x, y) {
            debug!("Rejected move for {} to ({}, {})", id, x, y);
            return Outcome::Rejected;
        }

        let moved = self.world.move_player(id, x, y, now).cloned();
        match moved {
            Ok(player) => {
                self.emit_all(Event::MovePlayer(player)).await;
                Outcome::Applied
            }
            Err(e) => {
                warn!("Move for {} failed: {}", id, e);
                Outcome::Rejected
            }
        }
    }

    fn clear_input(&self, cmd: &Command, deferred: &mut VecDeque<Command>) {
        let dropped = discard_superseded(deferred, cmd) + self.queue.discard_before(cmd);
        if dropped > 0 {
            debug!("Cleared {} stale commands for {}", dropped, cmd.actor);
        }
    }

    async fn disconnect(&mut self, id: &str) -> bool {
        match self.remove_player(id).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Disconnect for {}: {}", id, e);
                false
            }
        }
    }

    async fn emit_to(&self, id: &str, event: Event) {
        if let Err(e) = self.events.send_to(id, event).await {
            error!("Failed to queue event for {}: {}", id, e);
        }
    }

    async fn emit_all(&self, event: Event) {
        if let Err(e) = self.events.broadcast(event).await {
            error!("Failed to queue broadcast: {}", e);
        }
    }
}
