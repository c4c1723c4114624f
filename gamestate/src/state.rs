//! Authoritative grid+entities model: intent application, collision,
//! bomb fuses, explosions, and deaths.

use crate::grid::{self, default_grid, tile, Grid, GRID_SIZE, SPAWNS};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use wire::codec::Change;

pub const BOMB_FUSE: Duration = Duration::from_secs(3);
pub const EXPLOSION_LIFETIME: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct Bomb {
    pub owner: u8,
    pub x: i32,
    pub y: i32,
    pub range: i32,
    pub planted_at: Instant,
}

#[derive(Debug, Clone)]
struct Explosion {
    /// Cells this explosion turned into a pure blast tile (`tile::EXPLOSION`).
    /// Cells where a crate or a player was hit are not tracked here — they
    /// already carry their own terminal tile and don't revert on clear.
    cells: Vec<(i32, i32)>,
    created_at: Instant,
}

/// The `{id, time, uuid, boxes}` bootstrap document sent to each member
/// during the Starting phase (`spec.md` §4.5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateBootstrap {
    pub id: u8,
    pub time: u64,
    pub uuid: String,
    pub boxes: BTreeMap<String, (i32, i32)>,
}

pub struct GameState {
    pub grid: Grid,
    pub players: HashMap<u8, (i32, i32)>,
    pub alive: HashMap<u8, bool>,
    pub bombs: HashMap<u32, Bomb>,
    pub boxes: HashMap<u32, (i32, i32)>,
    explosions: Vec<Explosion>,
    next_bomb_id: u32,
    next_box_id: u32,
    bomb_limit: usize,
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

impl GameState {
    pub fn new() -> Self {
        Self {
            grid: default_grid(),
            players: HashMap::new(),
            alive: HashMap::new(),
            bombs: HashMap::new(),
            boxes: HashMap::new(),
            explosions: Vec::new(),
            next_bomb_id: 1,
            next_box_id: 1,
            bomb_limit: grid::DEFAULT_BOMB_LIMIT,
        }
    }

    /// Resets to a fresh default map and spawns `player_count` (1..=4)
    /// players at their corner, seeding crates on every remaining floor
    /// tile with probability `crate_density` (placement is an
    /// implementation choice — `spec.md` leaves crate generation
    /// unspecified beyond "compute crate positions").
    pub fn reset(&mut self, player_count: usize, crate_density: f64, rng: &mut impl rand::Rng) {
        *self = Self::new();
        for id in 1..=player_count.min(4) as u8 {
            let (x, y) = SPAWNS[(id - 1) as usize];
            self.players.insert(id, (x, y));
            self.alive.insert(id, true);
            self.grid[y as usize][x as usize] = tile::live_player(id);
        }

        for y in 0..GRID_SIZE {
            for x in 0..GRID_SIZE {
                if self.grid[y][x] != tile::FLOOR {
                    continue;
                }
                let near_spawn = SPAWNS
                    .iter()
                    .any(|&(sx, sy)| (sx - x as i32).abs() <= 1 && (sy - y as i32).abs() <= 1);
                if !near_spawn && rng.gen_bool(crate_density) {
                    let id = self.next_box_id;
                    self.next_box_id += 1;
                    self.boxes.insert(id, (x as i32, y as i32));
                    self.grid[y][x] = tile::CRATE;
                }
            }
        }
    }

    pub fn bootstrap(&self, for_player: u8, uuid: String, time: u64) -> StateBootstrap {
        StateBootstrap {
            id: for_player,
            time,
            uuid,
            boxes: self
                .boxes
                .iter()
                .map(|(id, pos)| (id.to_string(), *pos))
                .collect(),
        }
    }

    fn live_bomb_count(&self, player_id: u8) -> usize {
        self.bombs.values().filter(|b| b.owner == player_id).count()
    }

    fn in_active_explosion(&self, x: i32, y: i32) -> bool {
        self.explosions.iter().any(|e| e.cells.contains(&(x, y)))
    }

    fn corrective(&self, x: i32, y: i32) -> Change {
        let actual = self.grid[y as usize][x as usize];
        Change {
            cur_x: x as u8,
            cur_y: y as u8,
            cur_tile: actual,
            nxt_x: x as u8,
            nxt_y: y as u8,
            nxt_tile: actual,
        }
    }

    /// Applies one client intent, per the four rules in `spec.md` §4.3.
    /// Returns the authoritative delta(s) to broadcast — usually one
    /// `Change`, occasionally empty when the intent is outright invalid
    /// shape and a corrective is the only response.
    pub fn apply_change(&mut self, player_id: u8, change: Change, now: Instant) -> Vec<Change> {
        let (cx, cy, cur) = (change.cur_x as i32, change.cur_y as i32, change.cur_tile);
        let (nx, ny, nxt) = (change.nxt_x as i32, change.nxt_y as i32, change.nxt_tile);

        if !grid::in_bounds(cx, cy) || self.grid[cy as usize][cx as usize] != cur {
            return vec![self.corrective(cx, cy)];
        }

        // Rule 2: plant bomb.
        if cur == tile::FLOOR && nxt == tile::CRATE && (cx, cy) == (nx, ny) {
            if self.live_bomb_count(player_id) >= self.bomb_limit {
                return vec![self.corrective(cx, cy)];
            }
            let id = self.next_bomb_id;
            self.next_bomb_id += 1;
            self.bombs.insert(
                id,
                Bomb {
                    owner: player_id,
                    x: cx,
                    y: cy,
                    range: grid::DEFAULT_BOMB_RANGE,
                    planted_at: now,
                },
            );
            self.grid[cy as usize][cx as usize] = tile::CRATE;
            return vec![Change {
                nxt_tile: tile::CRATE,
                ..change
            }];
        }

        // Rule 3: move.
        if tile::as_live_player(cur) == Some(player_id)
            && self.players.get(&player_id) == Some(&(cx, cy))
            && nxt == tile::FLOOR
            && grid::in_bounds(nx, ny)
            && manhattan_adjacent((cx, cy), (nx, ny))
        {
            self.grid[cy as usize][cx as usize] = tile::FLOOR;
            self.grid[ny as usize][nx as usize] = tile::live_player(player_id);
            self.players.insert(player_id, (nx, ny));
            return vec![Change {
                nxt_tile: tile::live_player(player_id),
                ..change
            }];
        }

        // Rule 4: destroy crate caught in an active explosion.
        if cur == tile::CRATE && nxt == tile::CRATE && self.in_active_explosion(cx, cy) {
            self.grid[cy as usize][cx as usize] = tile::FLOOR;
            self.boxes.retain(|_, pos| *pos != (cx, cy));
            return vec![change];
        }

        vec![self.corrective(cx, cy)]
    }

    /// Advances bomb fuses and explosion lifetimes by one tick. Returns
    /// every delta produced (explosion ignition, crate/player hits,
    /// and explosion-tile clearing).
    pub fn tick(&mut self, now: Instant) -> Vec<Change> {
        let mut deltas = Vec::new();

        let ready: Vec<u32> = self
            .bombs
            .iter()
            .filter(|(_, b)| now.duration_since(b.planted_at) >= BOMB_FUSE)
            .map(|(id, _)| *id)
            .collect();

        let mut queue: Vec<u32> = ready;
        let mut ignited: HashSet<u32> = HashSet::new();

        // Bombs are removed from the map before their chain is expanded,
        // so a cycle of in-range bombs can't re-queue itself.
        while let Some(id) = queue.pop() {
            if !ignited.insert(id) {
                continue;
            }
            let Some(bomb) = self.bombs.remove(&id) else {
                continue;
            };
            deltas.extend(self.explode(&bomb, &mut queue));
        }

        let mut still_active = Vec::with_capacity(self.explosions.len());
        for explosion in self.explosions.drain(..) {
            if now.duration_since(explosion.created_at) >= EXPLOSION_LIFETIME {
                for (x, y) in explosion.cells {
                    self.grid[y as usize][x as usize] = tile::FLOOR;
                    deltas.push(Change {
                        cur_x: x as u8,
                        cur_y: y as u8,
                        cur_tile: tile::EXPLOSION,
                        nxt_x: x as u8,
                        nxt_y: y as u8,
                        nxt_tile: tile::FLOOR,
                    });
                }
            } else {
                still_active.push(explosion);
            }
        }
        self.explosions = still_active;

        deltas
    }

    fn explode(&mut self, bomb: &Bomb, chain_queue: &mut Vec<u32>) -> Vec<Change> {
        let mut cells = vec![(bomb.x, bomb.y)];
        for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            for step in 1..=bomb.range {
                let (x, y) = (bomb.x + dx * step, bomb.y + dy * step);
                if !grid::in_bounds(x, y) {
                    break;
                }
                if self.grid[y as usize][x as usize] == tile::WALL {
                    break;
                }
                cells.push((x, y));
                if self.grid[y as usize][x as usize] == tile::CRATE
                    && !self.boxes.values().any(|&p| p == (x, y))
                {
                    // A bomb occupies this cell (crate tile but not a
                    // registered box) — chain-ignite it immediately.
                    if let Some((&id, _)) = self.bombs.iter().find(|(_, b)| (b.x, b.y) == (x, y)) {
                        chain_queue.push(id);
                    }
                    break;
                }
            }
        }

        let mut deltas = Vec::new();
        let mut pure_blast_cells = Vec::new();

        for (x, y) in cells {
            let current = self.grid[y as usize][x as usize];
            if let Some(player_id) = tile::as_live_player(current) {
                self.grid[y as usize][x as usize] = tile::dead_player(player_id);
                self.alive.insert(player_id, false);
                self.players.insert(player_id, (-1, -1));
                deltas.push(Change {
                    cur_x: x as u8,
                    cur_y: y as u8,
                    cur_tile: current,
                    nxt_x: x as u8,
                    nxt_y: y as u8,
                    nxt_tile: tile::dead_player(player_id),
                });
            } else if current == tile::CRATE {
                self.grid[y as usize][x as usize] = tile::FLOOR;
                self.boxes.retain(|_, pos| *pos != (x, y));
                deltas.push(Change {
                    cur_x: x as u8,
                    cur_y: y as u8,
                    cur_tile: tile::CRATE,
                    nxt_x: x as u8,
                    nxt_y: y as u8,
                    nxt_tile: tile::CRATE,
                });
            } else if current != tile::WALL {
                self.grid[y as usize][x as usize] = tile::EXPLOSION;
                pure_blast_cells.push((x, y));
                deltas.push(Change {
                    cur_x: x as u8,
                    cur_y: y as u8,
                    cur_tile: current,
                    nxt_x: x as u8,
                    nxt_y: y as u8,
                    nxt_tile: tile::EXPLOSION,
                });
            }
        }

        self.explosions.push(Explosion {
            cells: pure_blast_cells,
            created_at: bomb.planted_at + BOMB_FUSE,
        });

        deltas
    }

    /// Client-side counterpart to `apply_change`: trusts a
    /// server-authored delta unconditionally rather than validating it,
    /// since the server already applied its own rules before
    /// broadcasting. Keeps `players`/`alive` bookkeeping in sync with
    /// the grid tile so `winner()` stays meaningful on the client too.
    pub fn apply_delta(&mut self, change: Change) {
        let (x, y) = (change.nxt_x as i32, change.nxt_y as i32);
        if !grid::in_bounds(x, y) {
            return;
        }
        self.grid[y as usize][x as usize] = change.nxt_tile;

        if let Some(id) = tile::as_live_player(change.nxt_tile) {
            self.players.insert(id, (x, y));
            self.alive.insert(id, true);
        } else if let Some(id) = tile::as_dead_player(change.nxt_tile) {
            self.players.insert(id, (-1, -1));
            self.alive.insert(id, false);
        }
    }

    /// Seeds a freshly-constructed client-side `GameState` from the
    /// server's STATE bootstrap: crate tiles from `boxes`, and every
    /// spawn corner populated with a live player. The bootstrap carries
    /// no player positions, so seats that turn out to be unoccupied (a
    /// lobby smaller than 4) are corrected by the first ACTIONS deltas.
    pub fn apply_bootstrap(&mut self, boot: &StateBootstrap) {
        *self = Self::new();
        for (id, &pos) in &boot.boxes {
            if let Ok(id) = id.parse::<u32>() {
                self.boxes.insert(id, pos);
                if grid::in_bounds(pos.0, pos.1) {
                    self.grid[pos.1 as usize][pos.0 as usize] = tile::CRATE;
                }
            }
        }
        for (i, &(x, y)) in SPAWNS.iter().enumerate() {
            let seat = i as u8 + 1;
            self.players.insert(seat, (x, y));
            self.alive.insert(seat, true);
            self.grid[y as usize][x as usize] = tile::live_player(seat);
        }
    }

    /// Removes a player from play outside of an explosion (LEAVE, or a
    /// keep-alive timeout reaped by the lobby). Clears their tile to
    /// floor and returns the corrective delta to broadcast, if they
    /// still occupied a tracked position.
    pub fn remove_player(&mut self, id: u8) -> Option<Change> {
        let (x, y) = self.players.remove(&id)?;
        self.alive.insert(id, false);
        if !grid::in_bounds(x, y) {
            return None;
        }
        let current = self.grid[y as usize][x as usize];
        self.grid[y as usize][x as usize] = tile::FLOOR;
        Some(Change {
            cur_x: x as u8,
            cur_y: y as u8,
            cur_tile: current,
            nxt_x: x as u8,
            nxt_y: y as u8,
            nxt_tile: tile::FLOOR,
        })
    }

    /// `Some(id)` when exactly one player is still alive (match winner);
    /// `None` for zero or more than one survivor.
    pub fn winner(&self) -> Option<u8> {
        let mut survivors = self.alive.iter().filter(|(_, alive)| **alive).map(|(id, _)| *id);
        let first = survivors.next()?;
        if survivors.next().is_none() {
            Some(first)
        } else {
            None
        }
    }
}

fn manhattan_adjacent(a: (i32, i32), b: (i32, i32)) -> bool {
    let dx = (a.0 - b.0).abs();
    let dy = (a.1 - b.1).abs();
    (dx == 1 && dy == 0) || (dx == 0 && dy == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn fresh(player_count: usize) -> GameState {
        let mut state = GameState::new();
        let mut rng = rand_chacha_stub();
        state.reset(player_count, 0.0, &mut rng);
        state
    }

    // A tiny deterministic RNG so tests don't need an extra dependency
    // just to get `rand::Rng` for crate-free resets.
    fn rand_chacha_stub() -> impl rand::Rng {
        rand::rngs::mock::StepRng::new(0, 1)
    }

    #[test]
    fn s3_valid_move_broadcasts_and_updates_position() {
        let mut state = fresh(4);
        let now = Instant::now();
        let intent = Change {
            cur_x: 1,
            cur_y: 1,
            cur_tile: tile::live_player(1),
            nxt_x: 2,
            nxt_y: 1,
            nxt_tile: tile::FLOOR,
        };
        let deltas = state.apply_change(1, intent, now);
        assert_eq!(
            deltas,
            vec![Change {
                nxt_tile: tile::live_player(1),
                ..intent
            }]
        );
        assert_eq!(state.grid[1][2], tile::live_player(1));
        assert_eq!(state.players[&1], (2, 1));
    }

    #[test]
    fn s4_invalid_move_into_wall_is_rejected_with_corrective() {
        let mut state = fresh(4);
        let now = Instant::now();
        // valid: (1,1) -> (1,2) is floor
        let valid = Change {
            cur_x: 1,
            cur_y: 1,
            cur_tile: tile::live_player(1),
            nxt_x: 1,
            nxt_y: 2,
            nxt_tile: tile::FLOOR,
        };
        state.apply_change(1, valid, now);

        // invalid: (1,2) -> (1,0) is a wall row
        let invalid = Change {
            cur_x: 1,
            cur_y: 2,
            cur_tile: tile::live_player(1),
            nxt_x: 1,
            nxt_y: 0,
            nxt_tile: tile::FLOOR,
        };
        let deltas = state.apply_change(1, invalid, now);
        assert_eq!(deltas.len(), 1);
        let corrective = deltas[0];
        assert_eq!(corrective.cur_tile, corrective.nxt_tile);
        assert_eq!((corrective.cur_x, corrective.cur_y), (1, 2));
    }

    #[test]
    fn plant_bomb_respects_limit() {
        let mut state = fresh(4);
        let now = Instant::now();
        let plant = Change {
            cur_x: 1,
            cur_y: 1,
            cur_tile: tile::FLOOR,
            nxt_x: 1,
            nxt_y: 1,
            nxt_tile: tile::CRATE,
        };
        // player stands on (1,1) which is their own live-player tile, not floor —
        // move off it first so (1,1) becomes floor again before planting.
        let step = Change {
            cur_x: 1,
            cur_y: 1,
            cur_tile: tile::live_player(1),
            nxt_x: 2,
            nxt_y: 1,
            nxt_tile: tile::FLOOR,
        };
        state.apply_change(1, step, now);
        let deltas = state.apply_change(1, plant, now);
        assert_eq!(deltas, vec![plant]);
        assert_eq!(state.bombs.len(), 1);
    }

    #[test]
    fn s5_bomb_chain_kills_both_players() {
        let mut state = fresh(2);
        let t0 = Instant::now();

        // P1 moves off spawn then plants at (1,1).
        state.apply_change(
            1,
            Change {
                cur_x: 1,
                cur_y: 1,
                cur_tile: tile::live_player(1),
                nxt_x: 1,
                nxt_y: 2,
                nxt_tile: tile::FLOOR,
            },
            t0,
        );
        state.apply_change(
            1,
            Change {
                cur_x: 1,
                cur_y: 1,
                cur_tile: tile::FLOOR,
                nxt_x: 1,
                nxt_y: 1,
                nxt_tile: tile::CRATE,
            },
            t0,
        );

        // Manually place a second bomb at (1,3), within blast range of the first.
        state.bombs.insert(
            99,
            Bomb {
                owner: 2,
                x: 1,
                y: 3,
                range: 2,
                planted_at: t0,
            },
        );
        state.grid[3][1] = tile::CRATE;

        let after_fuse = t0 + BOMB_FUSE;
        let deltas = state.tick(after_fuse);
        assert!(!deltas.is_empty());
        assert!(state.bombs.is_empty(), "both bombs must be consumed");
        assert_eq!(state.grid[1][1], tile::EXPLOSION);
    }

    #[test]
    fn explosions_clear_after_lifetime() {
        let mut state = fresh(1);
        let t0 = Instant::now();
        state.apply_change(
            1,
            Change {
                cur_x: 1,
                cur_y: 1,
                cur_tile: tile::live_player(1),
                nxt_x: 1,
                nxt_y: 2,
                nxt_tile: tile::FLOOR,
            },
            t0,
        );
        state.apply_change(
            1,
            Change {
                cur_x: 1,
                cur_y: 1,
                cur_tile: tile::FLOOR,
                nxt_x: 1,
                nxt_y: 1,
                nxt_tile: tile::CRATE,
            },
            t0,
        );
        state.tick(t0 + BOMB_FUSE);
        assert_eq!(state.grid[1][1], tile::EXPLOSION);
        state.tick(t0 + BOMB_FUSE + EXPLOSION_LIFETIME);
        assert_eq!(state.grid[1][1], tile::FLOOR);
    }

    #[test]
    fn apply_delta_trusts_server_tile_without_validation() {
        let mut state = GameState::new();
        state.apply_delta(Change {
            cur_x: 1,
            cur_y: 1,
            cur_tile: tile::FLOOR,
            nxt_x: 1,
            nxt_y: 1,
            nxt_tile: tile::live_player(1),
        });
        assert_eq!(state.grid[1][1], tile::live_player(1));
        assert_eq!(state.players[&1], (1, 1));

        state.apply_delta(Change {
            cur_x: 1,
            cur_y: 1,
            cur_tile: tile::live_player(1),
            nxt_x: 1,
            nxt_y: 1,
            nxt_tile: tile::dead_player(1),
        });
        assert_eq!(state.alive[&1], false);
        assert_eq!(state.players[&1], (-1, -1));
    }

    #[test]
    fn apply_bootstrap_seeds_crates_and_all_spawns() {
        let mut state = GameState::new();
        let mut boxes = BTreeMap::new();
        boxes.insert("7".to_string(), (3, 3));
        let boot = StateBootstrap {
            id: 2,
            time: 0,
            uuid: "abcd".into(),
            boxes,
        };
        state.apply_bootstrap(&boot);
        assert_eq!(state.grid[3][3], tile::CRATE);
        assert_eq!(state.boxes[&7], (3, 3));
        for (i, &(x, y)) in SPAWNS.iter().enumerate() {
            assert_eq!(state.grid[y as usize][x as usize], tile::live_player(i as u8 + 1));
        }
    }

    #[test]
    fn remove_player_clears_tile_and_returns_corrective() {
        let mut state = fresh(2);
        let delta = state.remove_player(1).expect("player 1 was on the board");
        assert_eq!((delta.cur_x, delta.cur_y), (1, 1));
        assert_eq!(delta.nxt_tile, tile::FLOOR);
        assert_eq!(state.grid[1][1], tile::FLOOR);
        assert_eq!(state.alive[&1], false);
        assert!(state.remove_player(1).is_none(), "already removed");
    }

    #[test]
    fn winner_requires_exactly_one_survivor() {
        let mut state = fresh(2);
        assert_eq!(state.winner(), None);
        state.alive.insert(2, false);
        assert_eq!(state.winner(), Some(1));
        state.alive.insert(1, false);
        assert_eq!(state.winner(), None);
    }
}
