//! Authoritative grid world: the immutable map plus every live player
//!
//! The world enforces single occupancy. Every cell holds at most one player,
//! tracked through an occupancy index kept in step with the player set.

use crate::error::WorldError;
use log::info;
use rand::Rng;
use shared::{Event, Map, Player};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct World {
    map: Arc<Map>,
    players: HashMap<String, Player>,
    occupied: HashMap<(i64, i64), String>,
}

impl World {
    pub fn new(map: Map) -> Self {
        Self {
            map: Arc::new(map),
            players: HashMap::new(),
            occupied: HashMap::new(),
        }
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Returns the player standing on `(x, y)`, if any
    pub fn player_at(&self, x: i64, y: i64) -> Option<&Player> {
        self.occupied
            .get(&(x, y))
            .and_then(|id| self.players.get(id))
    }

    pub fn is_free(&self, x: i64, y: i64) -> bool {
        self.map.contains(x, y) && self.player_at(x, y).is_none()
    }

    /// Samples random cells until an unoccupied one turns up.
    ///
    /// Retries are unbounded, so this degrades as the map fills and never
    /// returns on a fully occupied map.
    pub fn spawn_position<R: Rng + ?Sized>(&self, rng: &mut R) -> (i64, i64) {
        loop {
            let x = rng.gen_range(0..self.map.width);
            let y = rng.gen_range(0..self.map.height);
            if self.player_at(x, y).is_none() {
                return (x, y);
            }
        }
    }

    pub fn add_player(&mut self, player: Player) -> Result<(), WorldError> {
        if self.players.contains_key(&player.id) {
            return Err(WorldError::AlreadyExists(player.id));
        }
        if !self.map.contains(player.x, player.y) {
            return Err(WorldError::OutOfBounds {
                x: player.x,
                y: player.y,
            });
        }
        if self.player_at(player.x, player.y).is_some() {
            return Err(WorldError::Occupied {
                x: player.x,
                y: player.y,
            });
        }

        info!("Added player {} at ({}, {})", player.id, player.x, player.y);
        self.occupied.insert((player.x, player.y), player.id.clone());
        self.players.insert(player.id.clone(), player);
        Ok(())
    }

    /// Places a new player on a random free cell
    pub fn spawn_player<R: Rng + ?Sized>(
        &mut self,
        id: &str,
        rng: &mut R,
    ) -> Result<Player, WorldError> {
        if self.players.contains_key(id) {
            return Err(WorldError::AlreadyExists(id.to_string()));
        }

        let (x, y) = self.spawn_position(rng);
        let player = Player::new(id, x, y);
        self.add_player(player.clone())?;
        Ok(player)
    }

    pub fn remove_player(&mut self, id: &str) -> Result<Player, WorldError> {
        let player = self
            .players
            .remove(id)
            .ok_or_else(|| WorldError::NotFound(id.to_string()))?;

        self.occupied.remove(&(player.x, player.y));
        info!("Removed player {}", player.id);
        Ok(player)
    }

    /// Moves a player and stamps its last action.
    ///
    /// Legality is the caller's concern; the occupancy index is still guarded
    /// so a bad call cannot stack two players on one cell.
    pub fn move_player(
        &mut self,
        id: &str,
        x: i64,
        y: i64,
        now: Instant,
    ) -> Result<&Player, WorldError> {
        if !self.map.contains(x, y) {
            return Err(WorldError::OutOfBounds { x, y });
        }
        if let Some(other) = self.occupied.get(&(x, y)) {
            if other != id {
                return Err(WorldError::Occupied { x, y });
            }
        }

        let player = self
            .players
            .get_mut(id)
            .ok_or_else(|| WorldError::NotFound(id.to_string()))?;

        self.occupied.remove(&(player.x, player.y));
        player.move_to(x, y, now);
        self.occupied.insert((x, y), player.id.clone());
        Ok(player)
    }

    /// Full-state event for a newly joined session, players ordered by id
    pub fn snapshot(&self) -> Event {
        let mut players: Vec<Player> = self.players.values().cloned().collect();
        players.sort_by(|a, b| a.id.cmp(&b.id));

        Event::Snapshot {
            players,
            map: Arc::clone(&self.map),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn test_world(width: i64, height: i64) -> World {
        World::new(Map::new(width, height).unwrap())
    }

    #[test]
    fn test_world_creation() {
        let world = test_world(10, 8);
        assert!(world.is_empty());
        assert_eq!(world.map().width, 10);
        assert_eq!(world.map().height, 8);
    }

    #[test]
    fn test_add_and_lookup_player() {
        let mut world = test_world(10, 10);
        world.add_player(Player::new("alice", 3, 4)).unwrap();

        assert_eq!(world.len(), 1);
        assert_eq!(world.player_at(3, 4).map(|p| p.id.as_str()), Some("alice"));
        assert!(world.player_at(4, 3).is_none());
        assert!(!world.is_free(3, 4));
    }

    #[test]
    fn test_add_player_rejects_conflicts() {
        let mut world = test_world(5, 5);
        world.add_player(Player::new("alice", 1, 1)).unwrap();

        assert_eq!(
            world.add_player(Player::new("alice", 2, 2)),
            Err(WorldError::AlreadyExists("alice".to_string()))
        );
        assert_eq!(
            world.add_player(Player::new("bob", 1, 1)),
            Err(WorldError::Occupied { x: 1, y: 1 })
        );
        assert_eq!(
            world.add_player(Player::new("bob", 5, 0)),
            Err(WorldError::OutOfBounds { x: 5, y: 0 })
        );
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn test_remove_player() {
        let mut world = test_world(5, 5);
        world.add_player(Player::new("alice", 2, 2)).unwrap();

        let removed = world.remove_player("alice").unwrap();
        assert_eq!(removed.id, "alice");
        assert!(world.is_empty());
        assert!(world.player_at(2, 2).is_none());
    }

    #[test]
    fn test_remove_nonexistent_player() {
        let mut world = test_world(5, 5);
        world.add_player(Player::new("alice", 0, 0)).unwrap();

        assert_eq!(
            world.remove_player("ghost"),
            Err(WorldError::NotFound("ghost".to_string()))
        );
        assert_eq!(world.len(), 1);
        assert!(world.player("alice").is_some());
    }

    #[test]
    fn test_move_player_updates_index() {
        let mut world = test_world(5, 5);
        world.add_player(Player::new("alice", 0, 0)).unwrap();
        let now = Instant::now();

        let moved = world.move_player("alice", 1, 0, now).unwrap();
        assert!(moved.is_at(1, 0));
        assert_eq!(moved.last_action, Some(now));

        assert!(world.player_at(0, 0).is_none());
        assert_eq!(world.player_at(1, 0).map(|p| p.id.as_str()), Some("alice"));
    }

    #[test]
    fn test_move_player_guards_occupancy() {
        let mut world = test_world(5, 5);
        world.add_player(Player::new("alice", 0, 0)).unwrap();
        world.add_player(Player::new("bob", 1, 0)).unwrap();

        let result = world.move_player("alice", 1, 0, Instant::now());
        assert_eq!(result.err(), Some(WorldError::Occupied { x: 1, y: 0 }));
        assert!(world.player("alice").unwrap().is_at(0, 0));

        let result = world.move_player("ghost", 3, 3, Instant::now());
        assert_eq!(result.err(), Some(WorldError::NotFound("ghost".to_string())));
    }

    #[test]
    fn test_spawn_position_avoids_players() {
        let mut world = test_world(2, 2);
        world.add_player(Player::new("a", 0, 0)).unwrap();
        world.add_player(Player::new("b", 0, 1)).unwrap();
        world.add_player(Player::new("c", 1, 0)).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(world.spawn_position(&mut rng), (1, 1));
        }
    }

    #[test]
    fn test_spawn_fills_distinct_cells() {
        let mut world = test_world(4, 4);
        let mut rng = StdRng::seed_from_u64(42);

        for i in 0..16 {
            world.spawn_player(&format!("p{}", i), &mut rng).unwrap();
        }

        let cells: HashSet<(i64, i64)> = world.players().map(|p| (p.x, p.y)).collect();
        assert_eq!(cells.len(), 16);
    }

    #[test]
    fn test_spawn_existing_player_fails() {
        let mut world = test_world(4, 4);
        let mut rng = StdRng::seed_from_u64(1);
        world.spawn_player("alice", &mut rng).unwrap();

        assert_eq!(
            world.spawn_player("alice", &mut rng).err(),
            Some(WorldError::AlreadyExists("alice".to_string()))
        );
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut world = test_world(3, 3);
        world.add_player(Player::new("zed", 0, 0)).unwrap();
        world.add_player(Player::new("amy", 1, 1)).unwrap();

        match world.snapshot() {
            Event::Snapshot { players, map } => {
                let ids: Vec<&str> = players.iter().map(|p| p.id.as_str()).collect();
                assert_eq!(ids, vec!["amy", "zed"]);
                assert_eq!(map.width, 3);
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_shares_map() {
        let world = test_world(4, 4);
        let first = world.snapshot();
        let second = world.snapshot();

        match (first, second) {
            (Event::Snapshot { map: a, .. }, Event::Snapshot { map: b, .. }) => {
                assert!(Arc::ptr_eq(&a, &b));
                assert!(Arc::ptr_eq(&a, &world.map));
            }
            other => panic!("Expected snapshots, got {:?}", other),
        }
    }
}
