//! Round-trip estimation and retransmission timeout, RFC 6298 style.
//!
//! `rto = srtt + max(G, 4 * rttvar)`, clamped to `[min_rto, max_rto]` and
//! doubled on every timeout until the next sample arrives.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    granularity: Duration,
}

impl RttEstimator {
    pub fn new(
        initial_rto: Duration,
        min_rto: Duration,
        max_rto: Duration,
        granularity: Duration,
    ) -> Self {
        // Inverted bounds collapse onto min_rto
        let max_rto = max_rto.max(min_rto);
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial_rto.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
            granularity,
        }
    }

    /// Feed one round-trip measurement.
    pub fn update(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                // RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|, then SRTT = 7/8 SRTT + 1/8 R
                self.rttvar = self.rttvar * 3 / 4 + deviation / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }

        let srtt = self.srtt.unwrap_or(sample);
        let variance_term = (self.rttvar * 4).max(self.granularity);
        self.rto = (srtt + variance_term).clamp(self.min_rto, self.max_rto);
    }

    /// Exponential backoff after an unanswered transmission.
    pub fn on_timeout(&mut self) {
        self.rto = (self.rto * 2).min(self.max_rto);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }
}
