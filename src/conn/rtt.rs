//! Smoothed round-trip estimation and retransmission timeout derivation.

/// Default RTO before the first sample arrives.
pub const RTO_DEFAULT_MS: u32 = 200;
/// Default RTO floor.
pub const RTO_MIN_MS: u32 = 100;
/// RTO floor when low-latency mode is on.
pub const RTO_MIN_NODELAY_MS: u32 = 30;
/// Default RTO ceiling.
pub const RTO_MAX_MS: u32 = 60_000;

/// Jacobson/Karels RTT estimator.
///
/// Fed only with samples from acks of segments that were never
/// retransmitted, so retransmit ambiguity cannot corrupt the estimate.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt: u32,
    rttval: u32,
    rto: u32,
    rto_min: u32,
    rto_max: u32,
    interval: u32,
}

impl RttEstimator {
    pub fn new(rto_min: u32, rto_max: u32, interval: u32) -> Self {
        Self {
            srtt: 0,
            rttval: 0,
            rto: RTO_DEFAULT_MS.clamp(rto_min, rto_max),
            rto_min,
            rto_max,
            interval,
        }
    }

    /// Fold one round-trip sample, in milliseconds, into the estimate.
    pub fn sample(&mut self, rtt: u32) {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.srtt);
            self.rttval = (3 * self.rttval + delta) / 4;
            self.srtt = ((7 * self.srtt + rtt) / 8).max(1);
        }
        let rto = self.srtt + self.interval.max(4 * self.rttval);
        self.rto = rto.clamp(self.rto_min, self.rto_max);
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> u32 {
        self.rto
    }

    /// Smoothed round-trip time; 0 before the first sample.
    pub fn srtt(&self) -> u32 {
        self.srtt
    }
}
