//! Per-connection stats trackers: instantaneous (rolling) metrics and
//! lifetime totals/histograms, composed as plain struct fields rather
//! than via tracker inheritance.

use crate::percentile::PercentileGenerator;

pub const QUALITY_BUCKETS: [u32; 9] = [100, 99, 97, 95, 90, 75, 50, 1, 0];
pub const PING_BUCKETS_MS: [u32; 9] = [25, 50, 75, 100, 125, 150, 200, 300, u32::MAX];
pub const JITTER_BUCKETS_US: [u32; 6] = [1_000, 2_000, 5_000, 10_000, 20_000, u32::MAX];
pub const SPEED_BUCKETS_BPS: [u32; 8] =
    [16_000, 32_000, 64_000, 128_000, 256_000, 512_000, 1_024_000, u32::MAX];

/// A fixed-size histogram with `N` buckets whose upper bounds are given at
/// construction time; the last bucket is the overflow bucket.
#[derive(Debug, Clone)]
pub struct Histogram<const N: usize> {
    bounds: [u32; N],
    counts: [u64; N],
}

impl<const N: usize> Histogram<N> {
    pub fn new(bounds: [u32; N]) -> Self {
        Self { bounds, counts: [0; N] }
    }

    pub fn record(&mut self, value: u32) {
        for (i, &bound) in self.bounds.iter().enumerate() {
            if value <= bound {
                self.counts[i] += 1;
                return;
            }
        }
        *self.counts.last_mut().unwrap() += 1;
    }

    /// Like `record`, but for histograms whose bounds are descending
    /// thresholds ("at least this good") rather than ascending ceilings —
    /// used by the quality histogram, whose buckets name discrete quality
    /// levels from best (100) to worst (dead), not increasing size caps.
    /// A value that clears no threshold falls into the last bucket.
    pub fn record_at_least(&mut self, value: u32) {
        for (i, &bound) in self.bounds.iter().enumerate() {
            if value >= bound {
                self.counts[i] += 1;
                return;
            }
        }
        *self.counts.last_mut().unwrap() += 1;
    }

    pub fn counts(&self) -> &[u64; N] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Rolling, short-window metrics recomputed every reporting interval
/// (default 5s).
#[derive(Debug, Clone, Default)]
pub struct InstantaneousStats {
    pub rolling_rate_bytes_per_sec: f64,
    pub rolling_rate_pkts_per_sec: f64,
    pub smoothed_ping_ms: Option<u32>,
    pub drop_pct: f64,
    pub out_of_order_pct: f64,
    pub peak_jitter_usec: u32,
    pub current_send_rate_bytes_per_sec: u32,
    pub pending_bytes: u64,
    pub quality: Option<u8>,
}

/// A single 5-second reporting interval's raw counters, consumed to
/// produce the instantaneous stats and to feed the lifetime histograms.
#[derive(Debug, Clone, Default)]
pub struct IntervalCounters {
    pub n_recv: u64,
    pub n_dropped: u64,
    pub n_out_of_order: u64,
    pub n_duplicate: u64,
    pub n_lurch: u64,
    pub n_sent: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub peak_jitter_usec: u32,
    pub ping_samples_ms: Vec<u32>,
}

/// Computes the per-interval quality metric.
///
/// `quality = nRecvGood * 100 / (nRecv + dropped)`, clamped to `[1, 99]`
/// unless perfect (100) or dead (0, actively-sending but fully silent).
/// Intervals with `nRecv + nBad < 6` are excluded (return `None`).
pub fn compute_quality(counters: &IntervalCounters, was_actively_sending: bool) -> Option<u8> {
    let n_bad = counters.n_dropped + counters.n_out_of_order + counters.n_duplicate + counters.n_lurch;
    if counters.n_recv + n_bad < 6 {
        return None;
    }
    if counters.n_recv == 0 && was_actively_sending {
        return Some(0);
    }
    if n_bad == 0 {
        return Some(100);
    }
    let n_recv_good = counters.n_recv.saturating_sub(counters.n_out_of_order + counters.n_duplicate + counters.n_lurch);
    let denom = counters.n_recv + counters.n_dropped;
    if denom == 0 {
        return Some(0);
    }
    let q = (n_recv_good * 100 / denom) as i64;
    Some(q.clamp(1, 99) as u8)
}

/// Lifetime totals and histograms accumulated across the connection's
/// entire life, plus reservoir samplers for percentile queries.
pub struct LifetimeStats {
    pub total_bytes_sent: u64,
    pub total_bytes_recv: u64,
    pub total_pkts_sent: u64,
    pub total_pkts_recv: u64,
    pub quality_histogram: Histogram<9>,
    pub ping_histogram: Histogram<9>,
    pub jitter_histogram: Histogram<6>,
    pub tx_speed_histogram: Histogram<8>,
    pub rx_speed_histogram: Histogram<8>,
    pub ping_samples: PercentileGenerator<u32>,
    pub quality_samples: PercentileGenerator<u8>,
    pub tx_speed_samples: PercentileGenerator<u32>,
    pub rx_speed_samples: PercentileGenerator<u32>,
}

impl LifetimeStats {
    pub fn new(reservoir_capacity: usize) -> Self {
        Self {
            total_bytes_sent: 0,
            total_bytes_recv: 0,
            total_pkts_sent: 0,
            total_pkts_recv: 0,
            quality_histogram: Histogram::new(QUALITY_BUCKETS),
            ping_histogram: Histogram::new(PING_BUCKETS_MS),
            jitter_histogram: Histogram::new(JITTER_BUCKETS_US),
            tx_speed_histogram: Histogram::new(SPEED_BUCKETS_BPS),
            rx_speed_histogram: Histogram::new(SPEED_BUCKETS_BPS),
            ping_samples: PercentileGenerator::new(reservoir_capacity),
            quality_samples: PercentileGenerator::new(reservoir_capacity),
            tx_speed_samples: PercentileGenerator::new(reservoir_capacity),
            rx_speed_samples: PercentileGenerator::new(reservoir_capacity),
        }
    }

    pub fn record_interval(&mut self, counters: &IntervalCounters, quality: Option<u8>, tx_rate: u32, rx_rate: u32) {
        self.total_bytes_sent += counters.bytes_sent;
        self.total_bytes_recv += counters.bytes_recv;
        self.total_pkts_sent += counters.n_sent;
        self.total_pkts_recv += counters.n_recv;

        if let Some(q) = quality {
            self.quality_histogram.record_at_least(q as u32);
            self.quality_samples.add_sample(q);
        }
        for &ping in &counters.ping_samples_ms {
            self.ping_histogram.record(ping);
            self.ping_samples.add_sample(ping);
        }
        self.jitter_histogram.record(counters.peak_jitter_usec);
        self.tx_speed_histogram.record(tx_rate);
        self.tx_speed_samples.add_sample(tx_rate);
        self.rx_speed_histogram.record(rx_rate);
        self.rx_speed_samples.add_sample(rx_rate);
    }
}

/// Remote-reported stats mirrored from a stats piggyback frame, plus its
/// observed age.
#[derive(Debug, Clone, Default)]
pub struct RemoteStats {
    pub latest_instantaneous: Option<InstantaneousStats>,
    pub latest_remote_age_usec: u64,
    pub lifetime_received_at_usec: Option<u64>,
}
