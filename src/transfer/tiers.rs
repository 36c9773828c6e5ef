//! File size tiers.
//!
//! One table decides how many parallel connections a file of a given size
//! deserves. The budget allocator only sees it through [`weight`], which
//! scales the fair share. Raw counts are printed by `check_limits`.

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// `(minimum size, connections)` from the largest tier down.
const SIZE_TIERS: [(u64, usize); 5] = [
    (10 * MIB, 20),
    (MIB, 15),
    (100 * KIB, 10),
    (10 * KIB, 8),
    (0, 5),
];

/// Connections granted to the largest tier.
pub const MAX_TIER_CONNECTIONS: usize = 20;

/// Weight floor so small files still get a usable share.
const MIN_WEIGHT: f64 = 0.4;

/// Connection count of the tier `file_size` falls into.
#[must_use]
pub fn tier_connections(file_size: u64) -> usize {
    SIZE_TIERS
        .iter()
        .find(|(min_size, _)| file_size >= *min_size)
        .map_or(SIZE_TIERS[SIZE_TIERS.len() - 1].1, |(_, conns)| *conns)
}

/// Share of the fair allocation a file of `file_size` should ask for.
#[must_use]
pub fn weight(file_size: u64) -> f64 {
    (tier_connections(file_size) as f64 / MAX_TIER_CONNECTIONS as f64).max(MIN_WEIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(tier_connections(0), 5);
        assert_eq!(tier_connections(10 * KIB - 1), 5);
        assert_eq!(tier_connections(10 * KIB), 8);
        assert_eq!(tier_connections(100 * KIB), 10);
        assert_eq!(tier_connections(MIB), 15);
        assert_eq!(tier_connections(10 * MIB), 20);
        assert_eq!(tier_connections(2 * 1024 * MIB), 20);
    }

    #[test]
    fn test_weight_floor() {
        assert!((weight(10 * MIB) - 1.0).abs() < f64::EPSILON);
        assert!((weight(MIB) - 0.75).abs() < f64::EPSILON);
        assert!((weight(100 * KIB) - 0.5).abs() < f64::EPSILON);
        assert!((weight(10 * KIB) - 0.4).abs() < f64::EPSILON);
        assert!((weight(1) - 0.4).abs() < f64::EPSILON);
    }
}
