//! Per-producer behavior profiling.
//!
//! The scheduler learns two things about every producer:
//!
//! - **think time** — how long after a completion the next request
//!   arrives. Producers that think longer than the idling period are
//!   not worth idling for.
//! - **seek distance** — how far apart consecutive requests land.
//!   Producers whose mean seek exceeds the threshold are "seeky" and
//!   get shortened (or disabled) idling, since waiting buys no
//!   locality.
//!
//! Both estimators run in the same fixed-point sample domain: counts
//! saturate toward 256 through `n ← (7n + 256) / 8`, and a count is
//! statistically valid once it exceeds 80 (about three real samples).

use serde::{Deserialize, Serialize};

use crate::ioprio::IoPrio;

/// Mean seek distance above which a producer is considered seeky
/// (8 KiB expressed in the sector domain).
pub(crate) const SEEKY_THRESHOLD: u64 = 8 * 1024;

/// Lower bound on the idling period granted to seeky producers (µs).
pub(crate) const MIN_THINK_TIME_US: u64 = 2_000;

/// Fixed-point sample count advance.
#[inline]
fn sample_step(samples: u64) -> u64 {
    (7 * samples + 256) / 8
}

/// Whether a fixed-point sample count carries enough history to act
/// on.
#[inline]
#[must_use]
pub(crate) fn sample_valid(samples: u64) -> bool {
    samples > 80
}

/// Think-time estimator: a decaying mean of completion-to-submission
/// gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ThinkTime {
    pub samples: u64,
    pub total: u64,
    pub mean: u64,
}

impl ThinkTime {
    /// Record the gap since the last completion, capped at `cap_us`
    /// so one long pause cannot poison the mean.
    pub(crate) fn observe(&mut self, elapsed_us: u64, cap_us: u64) {
        let ttime = elapsed_us.min(cap_us);
        self.samples = sample_step(self.samples);
        self.total = (7 * self.total + 256 * ttime) / 8;
        self.mean = (self.total + 128) / self.samples;
    }

    #[must_use]
    pub(crate) fn valid(&self) -> bool {
        sample_valid(self.samples)
    }
}

/// Seek-distance estimator with transient damping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SeekProfile {
    pub samples: u64,
    pub total: u64,
    pub mean: u64,
}

impl SeekProfile {
    /// Record the absolute distance between consecutive requests.
    ///
    /// The first request is not a seek at all; the next few are capped
    /// hard against the running mean so an odd early fragment or
    /// page-in does not dominate the estimate.
    pub(crate) fn observe(&mut self, distance: u64) {
        let sdist = if self.samples == 0 {
            0
        } else if self.samples <= 60 {
            distance.min(self.mean * 4 + 2 * 1024 * 1024)
        } else {
            distance.min(self.mean * 4 + 2 * 1024 * 64)
        };

        self.samples = sample_step(self.samples);
        self.total = (7 * self.total + 256 * sdist) / 8;
        self.mean = (self.total + self.samples / 2) / self.samples;
    }

    #[must_use]
    pub(crate) fn valid(&self) -> bool {
        sample_valid(self.samples)
    }

    #[must_use]
    pub(crate) fn is_seeky(&self) -> bool {
        self.mean > SEEKY_THRESHOLD
    }
}

/// Per-producer state: queue associations, liveness, priority, and
/// the behavior estimators.
#[derive(Debug, Clone)]
pub(crate) struct IoContext {
    pub pid: u32,
    pub sync_queue: Option<u32>,
    pub async_queue: Option<u32>,
    /// Live tasks of the producer; idling is pointless at zero.
    pub live_tasks: u32,
    pub refs: u32,
    pub think: ThinkTime,
    pub seek: SeekProfile,
    /// End sector of the producer's last submitted request.
    pub last_request_pos: u64,
    /// Timestamp of the producer's last sync completion.
    pub last_end_request_us: u64,
    /// Current priority.
    pub prio: IoPrio,
    /// Priority was set explicitly (not derived from nice).
    pub explicit_prio: bool,
    /// CPU nice value, the fallback source for the priority.
    pub nice: i32,
}

impl IoContext {
    pub(crate) fn new(pid: u32, now_us: u64) -> Self {
        Self {
            pid,
            sync_queue: None,
            async_queue: None,
            live_tasks: 1,
            refs: 1,
            think: ThinkTime::default(),
            seek: SeekProfile::default(),
            last_request_pos: 0,
            last_end_request_us: now_us,
            prio: IoPrio::normal(),
            explicit_prio: false,
            nice: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_saturates_toward_256() {
        let mut s = 0u64;
        for _ in 0..16 {
            s = sample_step(s);
        }
        assert_eq!(s, 256);
        assert_eq!(sample_step(256), 256);
    }

    #[test]
    fn sample_validity_threshold() {
        // One step from zero yields 32: not yet valid.
        assert!(!sample_valid(sample_step(0)));
        // Three steps cross 80.
        let s = sample_step(sample_step(sample_step(0)));
        assert!(s > 80, "s = {s}");
        assert!(sample_valid(s));
    }

    #[test]
    fn think_time_tracks_constant_gap() {
        let mut t = ThinkTime::default();
        for _ in 0..20 {
            t.observe(1_000, 16_000);
        }
        assert!(t.valid());
        // The mean converges on the constant sample.
        assert!((900..=1100).contains(&t.mean), "mean = {}", t.mean);
    }

    #[test]
    fn think_time_caps_long_pauses() {
        let mut t = ThinkTime::default();
        for _ in 0..20 {
            t.observe(10_000_000, 16_000);
        }
        assert!(t.mean <= 16_000, "mean = {}", t.mean);
    }

    #[test]
    fn first_request_is_not_a_seek() {
        let mut s = SeekProfile::default();
        s.observe(1_000_000);
        assert_eq!(s.mean, 0, "first arrival at any offset counts as 0");
    }

    #[test]
    fn early_samples_are_damped() {
        let mut s = SeekProfile::default();
        s.observe(0);
        // Second sample: cap is mean*4 + 2 MiB = 2 MiB in sectors.
        s.observe(u64::MAX / 2);
        assert!(s.total <= 256 * 2 * 1024 * 1024);
    }

    #[test]
    fn sequential_producer_is_not_seeky() {
        let mut s = SeekProfile::default();
        for _ in 0..30 {
            s.observe(8); // adjacent requests
        }
        assert!(s.valid());
        assert!(!s.is_seeky(), "mean = {}", s.mean);
    }

    #[test]
    fn random_producer_is_seeky() {
        let mut s = SeekProfile::default();
        for i in 0..30 {
            s.observe(100_000 + i * 10_000);
        }
        assert!(s.valid());
        assert!(s.is_seeky(), "mean = {}", s.mean);
    }

    #[test]
    fn seeky_boundary_is_strict() {
        let s = SeekProfile {
            samples: 256,
            total: 0,
            mean: SEEKY_THRESHOLD,
        };
        assert!(!s.is_seeky(), "exactly at threshold is not seeky");
        let s2 = SeekProfile {
            samples: 256,
            total: 0,
            mean: SEEKY_THRESHOLD + 1,
        };
        assert!(s2.is_seeky());
    }
}
