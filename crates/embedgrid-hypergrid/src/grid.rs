//! Grid sizing and tile placement.

use serde::{Deserialize, Serialize};

use embedgrid_model::seed::{read_u32_be, sha256_digest};

/// Tile coordinate inside a `side × side` grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub x: u32,
    pub y: u32,
}

/// Smallest power of two `≥ ceil(sqrt(max(1, sessions)))`.
///
/// Only changes when the population crosses a power-of-four boundary, so
/// tile coordinates stay put while the population grows.
pub fn grid_side(sessions: usize) -> u32 {
    let n = sessions.max(1) as u64;
    let mut root = (n as f64).sqrt().ceil() as u64;
    // Correct float rounding at large n.
    while root * root < n {
        root += 1;
    }
    while root > 1 && (root - 1) * (root - 1) >= n {
        root -= 1;
    }
    u32::try_from(root.next_power_of_two()).unwrap_or(1 << 31)
}

/// Tile of `session_id`: `SHA-256(id)[0:4] mod side`, `SHA-256(id)[4:8] mod side`.
pub fn compute_tile_key(session_id: &str, side: u32) -> TileKey {
    let side = side.max(1);
    let digest = sha256_digest(session_id);
    TileKey {
        x: read_u32_be(&digest, 0) % side,
        y: read_u32_be(&digest, 4) % side,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_side_is_power_of_two_cover() {
        assert_eq!(grid_side(0), 1);
        assert_eq!(grid_side(1), 1);
        assert_eq!(grid_side(2), 2);
        assert_eq!(grid_side(4), 2);
        assert_eq!(grid_side(5), 4);
        assert_eq!(grid_side(16), 4);
        assert_eq!(grid_side(17), 8);
        assert_eq!(grid_side(1_000_000), 1024);
    }

    #[test]
    fn tile_key_is_deterministic_and_in_bounds() {
        for side in [1, 2, 8, 1024] {
            for id in ["a", "sess-1", "sess-2", "embed-000042"] {
                let a = compute_tile_key(id, side);
                let b = compute_tile_key(id, side);
                assert_eq!(a, b);
                assert!(a.x < side && a.y < side);
            }
        }
    }

    #[test]
    fn tile_key_matches_digest_prefix() {
        // SHA-256("abc") begins ba7816bf 8f01cfea.
        let key = compute_tile_key("abc", 1 << 16);
        assert_eq!(key.x, 0xBA78_16BF % (1 << 16));
        assert_eq!(key.y, 0x8F01_CFEA % (1 << 16));
    }

    #[test]
    fn single_tile_grid_maps_everything_to_origin() {
        assert_eq!(compute_tile_key("anything", 1), TileKey { x: 0, y: 0 });
        assert_eq!(compute_tile_key("anything", 0), TileKey { x: 0, y: 0 });
    }
}
