//! Adaptive feedback: budget learning, peak-rate autotuning, and
//! device queue-depth detection.
//!
//! Every expiration of a sync queue teaches the scheduler something:
//!
//! | Reason            | Lesson                    | New per-queue cap        |
//! |-------------------|---------------------------|--------------------------|
//! | `TooIdle`         | latency-sensitive         | one step down            |
//! | `BudgetTimeout`   | seeky, time-domain-bound  | back to the default      |
//! | `BudgetExhausted` | greedy sequential reader  | eight steps up           |
//! | `NoMoreRequests`  | nothing yet               | unchanged                |
//!
//! The peak-rate estimator turns measured service slices into an
//! upper bound on the device's transfer rate and, unless the user
//! pinned `max_budget`, derives the device-wide maximum budget from
//! it: the sectors transferable in 3/4 of a sync timeout.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MAX_BUDGET;
use crate::entity::RATE_SHIFT;

/// Budget increment/decrement step (sectors).
pub(crate) const BUDGET_STEP: u64 = 128;

/// Samples the peak-rate window holds before autotuning kicks in.
pub(crate) const PEAK_RATE_SAMPLES: u32 = 32;

/// Fixed-point budget-grant count above which the learned per-queue
/// cap is trusted against the device maximum.
pub(crate) const BUDGETS_TRUSTED: u32 = 194;

/// Outstanding requests that indicate real device-side queueing.
pub(crate) const HW_QUEUE_THRESHOLD: u32 = 4;

/// Samples needed before flipping the queueing verdict.
pub(crate) const HW_QUEUE_SAMPLES: u32 = 32;

/// Why the in-service queue was expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireReason {
    /// The idle window elapsed without new work.
    TooIdle,
    /// The wall-clock bound on the activation elapsed.
    BudgetTimeout,
    /// The budget cannot cover the next request.
    BudgetExhausted,
    /// The queue has no pending requests.
    NoMoreRequests,
}

impl ExpireReason {
    /// Short label for logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::TooIdle => "too_idle",
            Self::BudgetTimeout => "budget_timeout",
            Self::BudgetExhausted => "budget_exhausted",
            Self::NoMoreRequests => "no_more_requests",
        }
    }
}

/// Default per-queue budget: 3/4 of the device maximum, except that
/// early in a queue's life (and while autotuning has not been fed) a
/// fixed safe value is used so short early measurements cannot shrink
/// the budgets the estimator itself depends on.
#[must_use]
pub(crate) fn default_budget(device_max: u64, budgets_assigned: u32, autotune: bool) -> u64 {
    let base = if budgets_assigned < BUDGETS_TRUSTED && autotune {
        DEFAULT_MAX_BUDGET
    } else {
        device_max
    };
    base - base / 4
}

/// Floor for the learned per-queue budget.
#[must_use]
pub(crate) fn min_budget(device_max: u64) -> u64 {
    device_max / 2
}

/// The feedback table: next per-queue cap after an expiration.
#[must_use]
pub(crate) fn next_max_budget(
    current: u64,
    reason: ExpireReason,
    device_max: u64,
    default: u64,
) -> u64 {
    let min = min_budget(device_max);
    match reason {
        ExpireReason::TooIdle => {
            if current > min + BUDGET_STEP {
                current - BUDGET_STEP
            } else {
                min
            }
        }
        ExpireReason::BudgetTimeout => default,
        ExpireReason::BudgetExhausted => (current + 8 * BUDGET_STEP).min(device_max),
        ExpireReason::NoMoreRequests => current,
    }
}

/// Sectors transferable in 3/4 of `timeout_ms` at `peak_rate`
/// (sectors/µs in fixed point).
#[must_use]
pub(crate) fn calc_max_budget(peak_rate: u64, timeout_ms: u64) -> u64 {
    let budget = (peak_rate * 1000 * timeout_ms) >> RATE_SHIFT;
    budget - budget / 4
}

/// Peak-rate estimator state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PeakRate {
    /// Best observed rate, sectors/µs scaled by `2^RATE_SHIFT`.
    pub rate: u64,
    pub samples: u32,
}

impl PeakRate {
    /// Feed one measured service slice. Returns the slow verdict:
    /// whether the queue's observed rate was too low to have finished
    /// its budget inside the sync timeout.
    ///
    /// When the sample window fills (or a new maximum lands after it
    /// filled) and `autotune` holds, `device_max` is recomputed.
    pub(crate) fn observe(
        &mut self,
        service: u64,
        usecs: u64,
        budget: u64,
        timeout_ms: u64,
        autotune: bool,
        device_max: &mut u64,
    ) -> bool {
        // Too short to mean anything.
        if usecs < 100 {
            return false;
        }

        let bw = (service << RATE_SHIFT) / usecs;

        // Only long slices feed the maximum; short ones are spikes.
        if usecs > 20_000 {
            let mut update = false;
            if bw > self.rate {
                self.rate = bw;
                update = true;
                tracing::debug!(peak_rate = bw, "peak rate raised");
            }
            update |= self.samples == PEAK_RATE_SAMPLES - 1;
            if self.samples < PEAK_RATE_SAMPLES {
                self.samples += 1;
            }
            if self.samples == PEAK_RATE_SAMPLES && update && autotune {
                *device_max = calc_max_budget(self.rate, timeout_ms);
                tracing::debug!(max_budget = *device_max, "device max budget autotuned");
            }
        }

        // Slow means the observed rate could not have consumed the
        // budget before the wall clock ran out.
        let expected = (bw * 1000 * timeout_ms) >> RATE_SHIFT;
        expected < budget
    }

    /// Best current estimate of the device max budget, used when the
    /// user un-pins `max_budget` before the window has filled.
    #[must_use]
    pub(crate) fn estimated_max_budget(&self, timeout_ms: u64) -> u64 {
        if self.samples >= PEAK_RATE_SAMPLES {
            calc_max_budget(self.rate, timeout_ms)
        } else {
            DEFAULT_MAX_BUDGET
        }
    }
}

/// Device queue-depth (NCQ) detection.
///
/// While enough requests are outstanding to exercise device-side
/// queueing, track the high-water mark of requests in the driver.
/// After a window of such samples, the device "has queueing" iff the
/// mark exceeded the threshold. Starts optimistic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HwTagDetector {
    pub hw_tag: bool,
    max_rq_in_driver: u32,
    samples: u32,
}

impl Default for HwTagDetector {
    fn default() -> Self {
        Self {
            hw_tag: true,
            max_rq_in_driver: 0,
            samples: 0,
        }
    }
}

impl HwTagDetector {
    /// Feed one completion-time observation.
    pub(crate) fn observe(&mut self, rq_in_driver: u32, queued: u32) {
        self.max_rq_in_driver = self.max_rq_in_driver.max(rq_in_driver);

        if rq_in_driver + queued < HW_QUEUE_THRESHOLD {
            return;
        }
        self.samples += 1;
        if self.samples <= HW_QUEUE_SAMPLES {
            return;
        }

        self.hw_tag = self.max_rq_in_driver > HW_QUEUE_THRESHOLD;
        tracing::debug!(hw_tag = self.hw_tag, "queue depth verdict");
        self.max_rq_in_driver = 0;
        self.samples = 0;
    }
}
