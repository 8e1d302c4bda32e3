//! Congestion control and pacing: a token-bucket pacer plus quality- and
//! reply-timeout-driven send-rate estimation.

use crate::clock::UsecTime;

/// A token bucket gating outbound packet sends to `rate` bytes/sec with
/// burst capacity `burst` (default 2x MTU).
pub struct Pacer {
    rate_bytes_per_sec: u32,
    burst_bytes: u32,
    tokens: f64,
    last_refill: UsecTime,
}

impl Pacer {
    pub fn new(rate_bytes_per_sec: u32, burst_bytes: u32, now: UsecTime) -> Self {
        Self { rate_bytes_per_sec, burst_bytes, tokens: burst_bytes as f64, last_refill: now }
    }

    pub fn rate(&self) -> u32 {
        self.rate_bytes_per_sec
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.rate_bytes_per_sec = rate;
    }

    fn refill(&mut self, now: UsecTime) {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_bytes_per_sec as f64).min(self.burst_bytes as f64);
        self.last_refill = now;
    }

    /// Returns `true` and deducts tokens if `packet_size` may be sent now;
    /// otherwise returns `false` and the caller should schedule a wakeup
    /// at `next_send_time`.
    pub fn try_send(&mut self, now: UsecTime, packet_size: usize) -> bool {
        self.refill(now);
        if self.tokens >= packet_size as f64 {
            self.tokens -= packet_size as f64;
            true
        } else {
            false
        }
    }

    /// The timestamp at which enough tokens will exist to send
    /// `packet_size` bytes, given the bucket's current fill level.
    pub fn next_send_time(&self, now: UsecTime, packet_size: usize) -> UsecTime {
        if self.tokens >= packet_size as f64 {
            return now;
        }
        let needed = packet_size as f64 - self.tokens;
        let wait_secs = needed / self.rate_bytes_per_sec.max(1) as f64;
        now.saturating_add(std::time::Duration::from_secs_f64(wait_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAdjustment {
    Increase,
    Hold,
    Decrease,
}

/// Applies the §4.4 adjustment rule for one reporting interval (5s):
/// quality ≥ 95 and saturated in-flight ⇒ +25%; quality in [80, 95) ⇒
/// hold; quality < 80 or a reply timeout occurred ⇒ −30%. The result is
/// clamped to `[min_rate, max_rate]` and to the peer-reported receive
/// rate cap, if any.
pub fn adjust_rate(
    current_rate: u32,
    quality: Option<u8>,
    was_saturated: bool,
    had_reply_timeout: bool,
    min_rate: u32,
    max_rate: u32,
    peer_receive_rate_cap: Option<u32>,
) -> (u32, RateAdjustment) {
    let quality = quality.unwrap_or(100);

    let (mut new_rate, kind) = if had_reply_timeout || quality < 80 {
        ((current_rate as f64 * 0.70) as u32, RateAdjustment::Decrease)
    } else if quality >= 95 && was_saturated {
        ((current_rate as f64 * 1.25) as u32, RateAdjustment::Increase)
    } else {
        (current_rate, RateAdjustment::Hold)
    };

    if let Some(cap) = peer_receive_rate_cap {
        new_rate = new_rate.min(cap);
    }
    new_rate = new_rate.clamp(min_rate, max_rate);
    (new_rate, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cong_001_pacer_allows_within_burst() {
        let pacer = Pacer::new(1000, 2400, UsecTime(0));
        let mut pacer = pacer;
        assert!(pacer.try_send(UsecTime(0), 1200));
    }

    #[test]
    fn cong_002_pacer_blocks_when_exhausted() {
        let mut pacer = Pacer::new(1000, 1200, UsecTime(0));
        assert!(pacer.try_send(UsecTime(0), 1200));
        assert!(!pacer.try_send(UsecTime(0), 1200));
    }

    #[test]
    fn cong_003_pacer_refills_over_time() {
        let mut pacer = Pacer::new(1000, 1200, UsecTime(0));
        assert!(pacer.try_send(UsecTime(0), 1200));
        // One second later, 1000 bytes have refilled.
        assert!(!pacer.try_send(UsecTime(500_000), 1200));
        assert!(pacer.try_send(UsecTime(1_200_000), 1200));
    }

    #[test]
    fn cong_004_increase_on_high_quality_saturated() {
        let (rate, kind) = adjust_rate(100_000, Some(99), true, false, 10_000, 1_000_000, None);
        assert_eq!(kind, RateAdjustment::Increase);
        assert!(rate > 100_000);
    }

    #[test]
    fn cong_005_hold_on_medium_quality() {
        let (rate, kind) = adjust_rate(100_000, Some(85), true, false, 10_000, 1_000_000, None);
        assert_eq!(kind, RateAdjustment::Hold);
        assert_eq!(rate, 100_000);
    }

    #[test]
    fn cong_006_decrease_on_low_quality() {
        let (rate, kind) = adjust_rate(100_000, Some(50), true, false, 10_000, 1_000_000, None);
        assert_eq!(kind, RateAdjustment::Decrease);
        assert!(rate < 100_000);
    }

    #[test]
    fn cong_007_decrease_on_reply_timeout_regardless_of_quality() {
        let (_, kind) = adjust_rate(100_000, Some(100), true, true, 10_000, 1_000_000, None);
        assert_eq!(kind, RateAdjustment::Decrease);
    }

    #[test]
    fn cong_008_rate_clamped_to_bounds() {
        let (rate, _) = adjust_rate(900_000, Some(100), true, false, 10_000, 1_000_000, None);
        assert!(rate <= 1_000_000);
        let (rate, _) = adjust_rate(10_500, Some(50), true, false, 10_000, 1_000_000, None);
        assert!(rate >= 10_000);
    }

    #[test]
    fn cong_009_peer_cap_limits_increase() {
        let (rate, _) = adjust_rate(100_000, Some(100), true, false, 10_000, 1_000_000, Some(110_000));
        assert!(rate <= 110_000);
    }
}
