use rand::Rng;
use std::time::Duration;

use crate::config::NodeConfig;

/// A fresh randomized election timeout from the node's configured range
pub fn random_election_timeout(config: &NodeConfig) -> Duration {
    let max = config.election_timeout_max_ms.max(config.election_timeout_min_ms);
    let ms = rand::thread_rng().gen_range(config.election_timeout_min_ms..=max);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_range() {
        let config = NodeConfig::default();
        for _ in 0..100 {
            let t = random_election_timeout(&config);
            assert!(t >= Duration::from_millis(150) && t <= Duration::from_millis(300));
        }
    }

    #[test]
    fn degenerate_range_is_fixed() {
        let config = NodeConfig {
            election_timeout_min_ms: 80,
            election_timeout_max_ms: 10,
            ..NodeConfig::default()
        };
        assert_eq!(random_election_timeout(&config), Duration::from_millis(80));
    }
}
