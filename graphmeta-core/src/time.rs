//! Wall clock access
//!
//! Plan ids and heartbeat records are stamped with wall-clock nanoseconds
//! since the Unix epoch. Callers that need determinism pass timestamps in
//! explicitly; this helper is for the live paths.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch.
pub fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_advances() {
        let a = wall_clock_ns();
        let b = wall_clock_ns();
        assert!(b >= a);
        // Sanity: later than 2020-01-01.
        assert!(a > 1_577_836_800_000_000_000);
    }
}
