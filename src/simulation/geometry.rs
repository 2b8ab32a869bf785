//! Node placement and distance helpers.
//!
//! Distances use squared values where only comparisons are needed; the
//! square root is taken once per RSSI stamp.

use rand::Rng;
use rand::rngs::StdRng;

/// Node location in meters. `z` is the antenna height above ground.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Position {
    pub(crate) x: f32,
    pub(crate) y: f32,
    pub(crate) z: f32,
}

/// Squared Euclidean distance in meters², avoiding a sqrt in range checks.
pub(crate) fn distance2(a: &Position, b: &Position) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    dx * dx + dy * dy + dz * dz
}

pub(crate) fn distance(a: &Position, b: &Position) -> f32 {
    distance2(a, b).sqrt()
}

/// Maximum placement draws for a single node before giving up on the
/// current node-set layout.
pub(crate) const PLACEMENT_ATTEMPTS: usize = 1000;

/// Draw a uniformly random position inside the `width` × `height` area that
/// keeps at least `min_distance` to every already-placed node. Returns
/// `None` when no valid position was found within the attempt budget; the
/// caller then rebuilds the whole node set.
pub(crate) fn find_random_position(
    rng: &mut StdRng,
    existing: &[Position],
    width: f32,
    height: f32,
    antenna_height: f32,
    min_distance: f32,
) -> Option<Position> {
    let min_d2 = min_distance * min_distance;
    for _ in 0..PLACEMENT_ATTEMPTS {
        let candidate = Position {
            x: rng.gen_range(0.0..width),
            y: rng.gen_range(0.0..height),
            z: antenna_height,
        };
        let clear = existing.iter().all(|p| distance2(p, &candidate) >= min_d2);
        if clear {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn distance_is_euclidean() {
        let a = Position { x: 0.0, y: 0.0, z: 1.0 };
        let b = Position { x: 3.0, y: 4.0, z: 1.0 };
        assert_eq!(distance(&a, &b), 5.0);
        assert_eq!(distance2(&a, &b), 25.0);
    }

    #[test]
    fn placement_respects_min_distance() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut placed: Vec<Position> = Vec::new();
        for _ in 0..20 {
            let p = find_random_position(&mut rng, &placed, 1000.0, 1000.0, 2.0, 50.0)
                .expect("area has room for 20 nodes at 50 m spacing");
            placed.push(p);
        }
        for (i, a) in placed.iter().enumerate() {
            for b in placed.iter().skip(i + 1) {
                assert!(distance(a, b) >= 50.0);
            }
        }
    }

    #[test]
    fn placement_gives_up_when_area_is_saturated() {
        let mut rng = StdRng::seed_from_u64(7);
        // A 10 m × 10 m area cannot hold a second node 100 m away.
        let existing = vec![Position { x: 5.0, y: 5.0, z: 2.0 }];
        let p = find_random_position(&mut rng, &existing, 10.0, 10.0, 2.0, 100.0);
        assert!(p.is_none());
    }
}
