//! Configuration shared by the library and the CLI.
//!
//! Durations are written in milliseconds in config files (`*_ms` keys).

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::control_interface::BulbConfig;
use crate::util::discovery::DiscoveryConfig;

/// Everything a client needs: how to discover, and how to talk to what it finds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub discovery: DiscoveryConfig,
    pub bulb: BulbConfig,
}

pub(crate) fn deserialize_duration_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis: u64 = Deserialize::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuePolicy;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"bulb": {"connections": 2, "queue": {"max_len": 5, "policy": "adapt"}, "min_interval_ms": 250}}"#,
        )
        .unwrap();
        assert_eq!(config.bulb.connections, 2);
        assert_eq!(config.bulb.queue.max_len, 5);
        assert_eq!(config.bulb.queue.policy, QueuePolicy::Adapt);
        assert_eq!(config.bulb.min_interval, Duration::from_millis(250));
        assert_eq!(config.bulb.burst_window, Duration::from_secs(5));
        assert_eq!(config.discovery.search_addr.port(), 1982);
    }
}
