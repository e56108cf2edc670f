// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! An RTT tracker distinct from ARQ retry counts (§3 SUPPLEMENTED,
//! generalizing the original `Base/Congestion.h`). Consulted by
//! [`crate::writer::Writer::manage`] when spacing repeated sends; it widens
//! pacing under a slow/variable path without adding real congestion
//! windowing, consistent with spec.md §9's "congestion control omission".

use std::time::Duration;

const EWMA_WEIGHT: f64 = 0.125;
const DEFAULT_RTT_MS: f64 = 200.0;

/// Tracks a smoothed round-trip time estimate from timestamp-echo samples
/// (§4.10 "Timestamp echo").
#[derive(Debug, Clone, Copy)]
pub struct Congestion {
    smoothed_rtt_ms: f64,
    samples: u32,
}

impl Default for Congestion {
    fn default() -> Self {
        Self {
            smoothed_rtt_ms: DEFAULT_RTT_MS,
            samples: 0,
        }
    }
}

impl Congestion {
    /// Fresh tracker with the default RTT estimate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one new RTT sample, in milliseconds.
    pub fn sample(&mut self, rtt_ms: f64) {
        if self.samples == 0 {
            self.smoothed_rtt_ms = rtt_ms;
        } else {
            self.smoothed_rtt_ms =
                (1.0 - EWMA_WEIGHT) * self.smoothed_rtt_ms + EWMA_WEIGHT * rtt_ms;
        }
        self.samples += 1;
    }

    /// Current smoothed RTT estimate.
    #[must_use]
    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed_rtt_ms.max(0.0) / 1000.0)
    }

    /// A pacing multiplier widened by how far the current RTT estimate
    /// exceeds the 200ms baseline: `1.0` on a fast path, growing toward
    /// `3.0` as RTT approaches one second.
    #[must_use]
    pub fn pacing_factor(&self) -> f64 {
        (self.smoothed_rtt_ms / DEFAULT_RTT_MS).clamp(1.0, 3.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_sets_estimate_directly() {
        let mut c = Congestion::new();
        c.sample(50.0);
        assert!((c.smoothed_rtt().as_secs_f64() * 1000.0 - 50.0).abs() < 1e-9);
    }

    #[test]
    fn pacing_widens_with_rtt() {
        let mut fast = Congestion::new();
        fast.sample(50.0);
        let mut slow = Congestion::new();
        slow.sample(900.0);
        assert!(fast.pacing_factor() < slow.pacing_factor());
        assert!(slow.pacing_factor() <= 3.0);
    }
}
