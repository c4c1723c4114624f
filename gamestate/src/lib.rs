//! Authoritative game model: the grid, its tile codes, and the
//! bomb/explosion/movement rules applied to client intents.

pub mod grid;
pub mod state;

pub use grid::{tile, Grid, GRID_SIZE, SPAWNS};
pub use state::{Bomb, GameState, StateBootstrap, BOMB_FUSE, EXPLOSION_LIFETIME};
