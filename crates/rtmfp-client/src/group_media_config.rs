// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Translates the public [`crate::config::GroupConfig`] into the engine's
//! [`rtmfp_core::GroupMediaConfig`] (§4.9), leaving fields the external API
//! doesn't expose at their engine defaults.

use rtmfp_core::GroupMediaConfig;

use crate::config::GroupConfig;

/// Build an engine-level [`GroupMediaConfig`] from the public `GroupConfig`.
#[must_use]
pub fn group_media_config_from(config: &GroupConfig) -> GroupMediaConfig {
    GroupMediaConfig {
        availability_update_period: config.availability_update_period,
        window_duration: config.window_duration,
        fetch_period: config.fetch_period,
        ..GroupMediaConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn carries_over_the_three_exposed_fields() {
        let config = GroupConfig { fetch_period: Duration::from_millis(999), ..GroupConfig::default() };
        let engine = group_media_config_from(&config);
        assert_eq!(engine.fetch_period, Duration::from_millis(999));
    }
}
