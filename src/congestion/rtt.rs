//! RTT estimation.
//!
//! RFC 6298 smoothing over samples taken from ack arrival times, with
//! the peer-reported ack delay subtracted when it is sane.

use std::time::Duration;

/// Smoothing constants from RFC 6298.
pub mod constants {
    /// Alpha for SRTT smoothing (1/8).
    pub const SRTT_ALPHA: f64 = 0.125;

    /// Beta for RTTVAR smoothing (1/4).
    pub const RTTVAR_BETA: f64 = 0.25;
}

/// RTT estimator.
///
/// Maintains smoothed RTT (SRTT) and RTT variance (RTTVAR) from samples
/// delivered by loss recovery.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// Most recent (delay-adjusted) sample.
    latest: Duration,
    /// Whether we've received the first RTT sample.
    initialized: bool,
}

impl RttEstimator {
    /// Create an estimator with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the estimate with a new sample.
    ///
    /// `ack_delay` is the delay the peer reports having held the ack
    /// back; it is subtracted from the sample unless that would leave
    /// nothing.
    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        let adjusted = if sample > ack_delay {
            sample - ack_delay
        } else {
            sample
        };
        self.latest = adjusted;

        let sample_ms = adjusted.as_secs_f64() * 1000.0;
        if !self.initialized {
            // First measurement: SRTT = sample, RTTVAR = sample / 2.
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.initialized = true;
        } else {
            self.rttvar = (1.0 - constants::RTTVAR_BETA) * self.rttvar
                + constants::RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt =
                (1.0 - constants::SRTT_ALPHA) * self.srtt + constants::SRTT_ALPHA * sample_ms;
        }
    }

    /// The smoothed RTT, once at least one sample has arrived.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.initialized
            .then(|| Duration::from_secs_f64(self.srtt / 1000.0))
    }

    /// The current RTT variance.
    pub fn rttvar(&self) -> Duration {
        Duration::from_secs_f64(self.rttvar / 1000.0)
    }

    /// The most recent sample.
    pub fn latest_rtt(&self) -> Duration {
        self.latest
    }
}
