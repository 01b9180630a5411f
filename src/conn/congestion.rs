//! Window-based congestion control: slow start, AIMD growth, and
//! multiplicative decrease on loss.
//!
//! When disabled (`nc = 1` in the classic knob set) the controller pins
//! `cwnd` at the configured send-window ceiling and ignores loss, leaving
//! flow control to the configured and peer-advertised windows alone.

/// Lower bound for the slow-start threshold.
const SSTHRESH_MIN: u32 = 2;
/// Initial slow-start threshold.
const SSTHRESH_INIT: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct CongestionCtl {
    enabled: bool,
    cwnd: u32,
    ssthresh: u32,
    /// Byte-granular growth accumulator for congestion avoidance.
    incr: u32,
    mss: u32,
}

impl CongestionCtl {
    /// `ceiling` is the configured send window, used as the pinned window
    /// when the controller is disabled.
    pub fn new(enabled: bool, mss: u32, ceiling: u32) -> Self {
        Self {
            enabled,
            cwnd: if enabled { 1 } else { ceiling },
            ssthresh: SSTHRESH_INIT,
            incr: mss,
            mss,
        }
    }

    /// The congestion window, if the controller constrains sending.
    pub fn window(&self) -> Option<u32> {
        self.enabled.then_some(self.cwnd)
    }

    /// Current congestion window in segments.
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// The cumulative ack advanced: grow the window, bounded by the peer's
    /// advertised receive window.
    pub fn on_ack(&mut self, rmt_wnd: u32) {
        if !self.enabled || self.cwnd >= rmt_wnd {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += self.mss;
        } else {
            if self.incr < self.mss {
                self.incr = self.mss;
            }
            self.incr += (self.mss * self.mss) / self.incr + self.mss / 16;
            if (self.cwnd + 1) * self.mss <= self.incr {
                self.cwnd = (self.incr + self.mss - 1) / self.mss.max(1);
            }
        }
        if self.cwnd > rmt_wnd {
            self.cwnd = rmt_wnd;
            self.incr = rmt_wnd * self.mss;
        }
    }

    /// A fast resend fired: halve around the in-flight amount and keep
    /// transmitting at the reduced rate.
    pub fn on_fast_resend(&mut self, inflight: u32, resend: u32) {
        if !self.enabled {
            return;
        }
        self.ssthresh = (inflight / 2).max(SSTHRESH_MIN);
        self.cwnd = self.ssthresh + resend;
        self.incr = self.cwnd * self.mss;
    }

    /// A retransmission timer fired: restart from one segment.
    pub fn on_timeout(&mut self) {
        if !self.enabled {
            return;
        }
        self.ssthresh = (self.cwnd / 2).max(SSTHRESH_MIN);
        self.cwnd = 1;
        self.incr = self.mss;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1376;

    #[test]
    fn slow_start_grows_one_segment_per_ack() {
        let mut cc = CongestionCtl::new(true, MSS, 32);
        assert_eq!(cc.cwnd(), 1);
        cc.on_ack(128);
        assert_eq!(cc.cwnd(), 2);
    }

    #[test]
    fn avoidance_growth_is_sublinear() {
        let mut cc = CongestionCtl::new(true, MSS, 32);
        cc.on_ack(128); // leaves slow start at ssthresh = 2
        let mut grew = 0;
        for _ in 0..16 {
            let before = cc.cwnd();
            cc.on_ack(128);
            grew += (cc.cwnd() > before) as u32;
        }
        // roughly one segment of growth per cwnd acks, never per ack
        assert!(grew >= 1);
        assert!(cc.cwnd() < 2 + 16);
    }

    #[test]
    fn growth_is_capped_by_the_remote_window() {
        let mut cc = CongestionCtl::new(true, MSS, 32);
        for _ in 0..100 {
            cc.on_ack(4);
        }
        assert_eq!(cc.cwnd(), 4);
    }

    #[test]
    fn timeout_restarts_from_one() {
        let mut cc = CongestionCtl::new(true, MSS, 32);
        for _ in 0..50 {
            cc.on_ack(128);
        }
        let before = cc.cwnd();
        assert!(before > 2);
        cc.on_timeout();
        assert_eq!(cc.cwnd(), 1);
        assert_eq!(cc.ssthresh(), (before / 2).max(2));
    }

    #[test]
    fn fast_resend_halves_around_inflight() {
        let mut cc = CongestionCtl::new(true, MSS, 32);
        cc.on_fast_resend(20, 2);
        assert_eq!(cc.ssthresh(), 10);
        assert_eq!(cc.cwnd(), 12);
    }

    #[test]
    fn disabled_controller_ignores_loss() {
        let mut cc = CongestionCtl::new(false, MSS, 32);
        assert_eq!(cc.cwnd(), 32);
        assert_eq!(cc.window(), None);
        cc.on_timeout();
        cc.on_fast_resend(20, 2);
        cc.on_ack(128);
        assert_eq!(cc.cwnd(), 32);
    }
}
