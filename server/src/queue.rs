//! Inbound command queue shared by every connection and the simulation loop
//!
//! Connections append from their own tasks; the simulation loop is the only
//! consumer. The queue is FIFO across all actors and never reorders commands.
//! Each command gets a monotonic sequence number at receipt, which is what
//! "older" means when superseded commands are discarded.

use shared::CommandKind;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A queued request from one actor
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub actor: String,
    pub kind: CommandKind,
    pub received_at: Instant,
    /// Assigned by the queue on enqueue; strictly increasing
    pub sequence: u64,
}

impl Command {
    pub fn new(actor: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            actor: actor.into(),
            kind,
            received_at: Instant::now(),
            sequence: 0,
        }
    }

    /// True when `self` belongs to the same actor and was received before `newer`
    pub fn is_superseded_by(&self, newer: &Command) -> bool {
        self.actor == newer.actor && self.sequence < newer.sequence
    }
}

/// Drops every command in `commands` that `newer` supersedes
pub fn discard_superseded(commands: &mut VecDeque<Command>, newer: &Command) -> usize {
    let before = commands.len();
    commands.retain(|cmd| !cmd.is_superseded_by(newer));
    before - commands.len()
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Mutex<VecDeque<Command>>,
    next_sequence: AtomicU64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a command, stamping its sequence number. Returns that number.
    pub fn enqueue(&self, mut cmd: Command) -> u64 {
        let mut pending = self.lock();
        // Assigned under the lock so queue order and sequence order agree
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        cmd.sequence = sequence;
        pending.push_back(cmd);
        sequence
    }

    /// Removes and returns the oldest pending command
    pub fn dequeue(&self) -> Option<Command> {
        self.lock().pop_front()
    }

    /// Removes all strictly older commands of `cmd`'s actor. Other actors are untouched.
    pub fn discard_before(&self, cmd: &Command) -> usize {
        discard_superseded(&mut self.lock(), cmd)
    }

    /// Takes everything currently pending, oldest first
    pub fn drain(&self) -> VecDeque<Command> {
        std::mem::take(&mut *self.lock())
    }

    /// Puts commands back ahead of anything enqueued since they were drained
    pub fn requeue_front(&self, mut commands: VecDeque<Command>) {
        if commands.is_empty() {
            return;
        }
        let mut pending = self.lock();
        commands.append(&mut pending);
        *pending = commands;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Direction;
    use std::sync::Arc;

    fn move_cmd(actor: &str, direction: Direction) -> Command {
        Command::new(actor, CommandKind::MoveDirection(direction))
    }

    #[test]
    fn test_fifo_order() {
        let queue = CommandQueue::new();
        queue.enqueue(move_cmd("alice", Direction::Up));
        queue.enqueue(move_cmd("bob", Direction::Down));
        queue.enqueue(move_cmd("alice", Direction::Left));

        let order: Vec<(String, CommandKind)> = std::iter::from_fn(|| queue.dequeue())
            .map(|cmd| (cmd.actor, cmd.kind))
            .collect();

        assert_eq!(
            order,
            vec![
                ("alice".to_string(), CommandKind::MoveDirection(Direction::Up)),
                ("bob".to_string(), CommandKind::MoveDirection(Direction::Down)),
                ("alice".to_string(), CommandKind::MoveDirection(Direction::Left)),
            ]
        );
    }

    #[test]
    fn test_dequeue_empty() {
        let queue = CommandQueue::new();
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let queue = CommandQueue::new();
        let first = queue.enqueue(move_cmd("alice", Direction::Up));
        let second = queue.enqueue(move_cmd("alice", Direction::Up));
        assert!(second > first);

        assert_eq!(queue.dequeue().unwrap().sequence, first);
        assert_eq!(queue.dequeue().unwrap().sequence, second);
    }

    #[test]
    fn test_discard_before_isolates_actors() {
        let queue = CommandQueue::new();
        queue.enqueue(move_cmd("alice", Direction::Up));
        queue.enqueue(move_cmd("bob", Direction::Up));
        queue.enqueue(move_cmd("alice", Direction::Down));
        queue.enqueue(move_cmd("bob", Direction::Down));

        let mut clear = Command::new("alice", CommandKind::ClearPlayerInput);
        clear.sequence = queue.enqueue(clear.clone());
        queue.enqueue(move_cmd("alice", Direction::Right));

        let removed = queue.discard_before(&clear);
        assert_eq!(removed, 2);

        let remaining: Vec<(String, String)> = queue
            .drain()
            .into_iter()
            .map(|cmd| (cmd.actor, cmd.kind.tag().to_string()))
            .collect();

        assert_eq!(
            remaining,
            vec![
                ("bob".to_string(), "move_direction".to_string()),
                ("bob".to_string(), "move_direction".to_string()),
                ("alice".to_string(), "clear_player_input".to_string()),
                ("alice".to_string(), "move_direction".to_string()),
            ]
        );
    }

    #[test]
    fn test_discard_before_keeps_equal_and_newer() {
        let mut commands = VecDeque::new();
        let mut older = move_cmd("alice", Direction::Up);
        older.sequence = 1;
        let mut marker = move_cmd("alice", Direction::Down);
        marker.sequence = 2;
        let mut newer = move_cmd("alice", Direction::Left);
        newer.sequence = 3;
        commands.extend([older, marker.clone(), newer]);

        assert_eq!(discard_superseded(&mut commands, &marker), 1);
        let sequences: Vec<u64> = commands.iter().map(|cmd| cmd.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let queue = CommandQueue::new();
        queue.enqueue(move_cmd("alice", Direction::Up));
        queue.enqueue(move_cmd("alice", Direction::Down));

        let drained = queue.drain();
        queue.enqueue(move_cmd("bob", Direction::Left));
        queue.requeue_front(drained);

        let actors: Vec<String> = queue.drain().into_iter().map(|cmd| cmd.actor).collect();
        assert_eq!(actors, vec!["alice", "alice", "bob"]);
    }

    #[test]
    fn test_concurrent_enqueue() {
        let queue = Arc::new(CommandQueue::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        queue.enqueue(move_cmd(&format!("p{}", i), Direction::Up));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 800);
        assert!(drained
            .iter()
            .zip(drained.iter().skip(1))
            .all(|(a, b)| a.sequence < b.sequence));
    }
}
