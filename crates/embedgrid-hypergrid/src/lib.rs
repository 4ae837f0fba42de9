//! Embedgrid hypergrid synthesizer.
//!
//! Folds the whole session population into a square grid of tiles for
//! observability. Placement is a pure function of the session id, and each
//! tile keeps a bounded, hash-ranked set of representative sessions, so
//! the same population always yields the same snapshot.
//!
//! # Components
//!
//! - **`grid`**: Grid sizing and tile coordinates
//! - **`snapshot`**: Tile accumulation, representative samples, global stats

pub mod grid;
pub mod snapshot;

pub use grid::{TileKey, compute_tile_key, grid_side};
pub use snapshot::{
    GLOBAL_COUNTRY_BUCKET, GlobalStats, HypergridSnapshot, HypergridSources, HypergridTile,
    MAX_TILE_SAMPLES, TileSample, compute_snapshot,
};
