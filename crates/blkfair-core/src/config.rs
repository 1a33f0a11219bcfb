//! Scheduler tunables.
//!
//! Every knob the embedder can turn lives in [`SchedConfig`]. The
//! struct is the typed surface; [`Attr`] is the string-keyed surface
//! for sysfs-style read/write access, with per-attribute clamping.
//!
//! Two attributes have side effects beyond the stored value and are
//! finalized by the scheduler itself (`Scheduler::set_attr`):
//! writing `max_budget = 0` switches the device max budget to
//! autotuning from the peak-rate estimator, and writing
//! `timeout_sync` while autotuned recomputes the max budget.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Max requests moved to the driver in one sync service round.
pub const DEFAULT_QUANTUM: u32 = 4;

/// Default per-request deadline for sync requests (ms).
pub const DEFAULT_FIFO_EXPIRE_SYNC_MS: u64 = 125;

/// Default per-request deadline for async requests (ms).
pub const DEFAULT_FIFO_EXPIRE_ASYNC_MS: u64 = 250;

/// Maximum backwards seek the chooser will consider, in KiB.
pub const DEFAULT_BACK_SEEK_MAX_KIB: u64 = 16 * 1024;

/// Cost multiplier for backwards seeks.
pub const DEFAULT_BACK_SEEK_PENALTY: u64 = 2;

/// Default idling period after a sync queue drains (ms).
pub const DEFAULT_SLICE_IDLE_MS: u64 = 8;

/// Default device-wide maximum budget (sectors), used until the
/// peak-rate estimator has enough samples.
pub const DEFAULT_MAX_BUDGET: u64 = 16 * 1024;

/// Default cap on requests dispatched per async service round.
pub const DEFAULT_MAX_BUDGET_ASYNC_RQ: u32 = 4;

/// Default wall-clock bound on one sync activation (ms).
pub const DEFAULT_TIMEOUT_SYNC_MS: u64 = 125;

/// Default wall-clock bound on one async activation (ms).
pub const DEFAULT_TIMEOUT_ASYNC_MS: u64 = 40;

/// Runtime-tunable scheduler parameters.
///
/// `max_budget` is the raw user surface: `0` means "autotune from the
/// measured peak rate"; any other value pins the device max budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Requests per sync dispatch round.
    pub quantum: u32,
    /// Sync request deadline (ms).
    pub fifo_expire_sync_ms: u64,
    /// Async request deadline (ms).
    pub fifo_expire_async_ms: u64,
    /// Maximum backwards seek considered by the chooser (KiB).
    pub back_seek_max_kib: u64,
    /// Penalty factor for backwards seeks.
    pub back_seek_penalty: u64,
    /// Post-completion idling period (ms); 0 disables idling.
    pub slice_idle_ms: u64,
    /// User max budget (sectors); 0 selects autotuning.
    pub max_budget: u64,
    /// Requests per async dispatch round.
    pub max_budget_async_rq: u32,
    /// Wall-clock bound on a sync activation (ms).
    pub timeout_sync_ms: u64,
    /// Wall-clock bound on an async activation (ms).
    pub timeout_async_ms: u64,
    /// Favor latency over throughput: keep idling even for seeky
    /// producers on queueing (NCQ) drives.
    pub desktop: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            fifo_expire_sync_ms: DEFAULT_FIFO_EXPIRE_SYNC_MS,
            fifo_expire_async_ms: DEFAULT_FIFO_EXPIRE_ASYNC_MS,
            back_seek_max_kib: DEFAULT_BACK_SEEK_MAX_KIB,
            back_seek_penalty: DEFAULT_BACK_SEEK_PENALTY,
            slice_idle_ms: DEFAULT_SLICE_IDLE_MS,
            max_budget: 0,
            max_budget_async_rq: DEFAULT_MAX_BUDGET_ASYNC_RQ,
            timeout_sync_ms: DEFAULT_TIMEOUT_SYNC_MS,
            timeout_async_ms: DEFAULT_TIMEOUT_ASYNC_MS,
            desktop: true,
        }
    }
}

impl SchedConfig {
    /// Clamp every field into its valid range.
    ///
    /// Mirrors the attribute-store clamping for configs built in code
    /// (e.g. deserialized from a profile).
    pub fn clamp(&mut self) {
        self.quantum = self.quantum.max(1);
        self.fifo_expire_sync_ms = self.fifo_expire_sync_ms.max(1);
        self.fifo_expire_async_ms = self.fifo_expire_async_ms.max(1);
        self.back_seek_penalty = self.back_seek_penalty.max(1);
        self.max_budget_async_rq = self.max_budget_async_rq.max(1);
        self.timeout_sync_ms = self.timeout_sync_ms.max(1);
        self.timeout_async_ms = self.timeout_async_ms.max(1);
    }

    /// FIFO deadline offset for a request direction, in microseconds.
    #[must_use]
    pub(crate) fn fifo_expire_us(&self, sync: bool) -> u64 {
        let ms = if sync {
            self.fifo_expire_sync_ms
        } else {
            self.fifo_expire_async_ms
        };
        ms * 1000
    }

    /// Activation timeout for a queue direction, in microseconds.
    #[must_use]
    pub(crate) fn timeout_us(&self, sync: bool) -> u64 {
        let ms = if sync {
            self.timeout_sync_ms
        } else {
            self.timeout_async_ms
        };
        ms * 1000
    }

    /// Idling period in microseconds.
    #[must_use]
    pub(crate) fn slice_idle_us(&self) -> u64 {
        self.slice_idle_ms * 1000
    }

    /// Maximum backwards seek in sectors (1 KiB = 2 sectors).
    #[must_use]
    pub(crate) fn back_seek_max_sectors(&self) -> u64 {
        self.back_seek_max_kib * 2
    }
}

/// A tunable attribute name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    Quantum,
    FifoExpireSync,
    FifoExpireAsync,
    BackSeekMax,
    BackSeekPenalty,
    SliceIdle,
    MaxBudget,
    MaxBudgetAsyncRq,
    TimeoutSync,
    TimeoutAsync,
    Desktop,
}

impl Attr {
    /// All attributes, in the order they are published.
    pub const ALL: [Attr; 11] = [
        Attr::Quantum,
        Attr::FifoExpireSync,
        Attr::FifoExpireAsync,
        Attr::BackSeekMax,
        Attr::BackSeekPenalty,
        Attr::SliceIdle,
        Attr::MaxBudget,
        Attr::MaxBudgetAsyncRq,
        Attr::TimeoutSync,
        Attr::TimeoutAsync,
        Attr::Desktop,
    ];

    /// Attribute name as published to the embedder.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Attr::Quantum => "quantum",
            Attr::FifoExpireSync => "fifo_expire_sync",
            Attr::FifoExpireAsync => "fifo_expire_async",
            Attr::BackSeekMax => "back_seek_max",
            Attr::BackSeekPenalty => "back_seek_penalty",
            Attr::SliceIdle => "slice_idle",
            Attr::MaxBudget => "max_budget",
            Attr::MaxBudgetAsyncRq => "max_budget_async_rq",
            Attr::TimeoutSync => "timeout_sync",
            Attr::TimeoutAsync => "timeout_async",
            Attr::Desktop => "desktop",
        }
    }

    /// Look up an attribute by its published name.
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| Error::UnknownAttr(name.to_string()))
    }

    /// Parse and clamp a written value.
    pub(crate) fn parse(self, value: &str) -> Result<u64> {
        let raw: u64 = value.trim().parse().map_err(|_| Error::InvalidAttr {
            attr: self.name().to_string(),
            value: value.to_string(),
        })?;
        let min = match self {
            Attr::Quantum
            | Attr::FifoExpireSync
            | Attr::FifoExpireAsync
            | Attr::BackSeekPenalty
            | Attr::MaxBudgetAsyncRq
            | Attr::TimeoutSync
            | Attr::TimeoutAsync => 1,
            Attr::BackSeekMax | Attr::SliceIdle | Attr::MaxBudget | Attr::Desktop => 0,
        };
        let max = match self {
            Attr::Desktop => 1,
            _ => u64::from(u32::MAX),
        };
        Ok(raw.clamp(min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = SchedConfig::default();
        assert_eq!(c.quantum, 4);
        assert_eq!(c.fifo_expire_sync_ms, 125);
        assert_eq!(c.fifo_expire_async_ms, 250);
        assert_eq!(c.back_seek_max_kib, 16 * 1024);
        assert_eq!(c.back_seek_penalty, 2);
        assert_eq!(c.slice_idle_ms, 8);
        assert_eq!(c.max_budget, 0, "autotuned by default");
        assert_eq!(c.max_budget_async_rq, 4);
        assert_eq!(c.timeout_sync_ms, 125);
        assert_eq!(c.timeout_async_ms, 40);
        assert!(c.desktop);
    }

    #[test]
    fn unit_conversions() {
        let c = SchedConfig::default();
        assert_eq!(c.fifo_expire_us(true), 125_000);
        assert_eq!(c.fifo_expire_us(false), 250_000);
        assert_eq!(c.timeout_us(true), 125_000);
        assert_eq!(c.timeout_us(false), 40_000);
        assert_eq!(c.slice_idle_us(), 8_000);
        assert_eq!(c.back_seek_max_sectors(), 32 * 1024);
    }

    #[test]
    fn clamp_raises_zeroes() {
        let mut c = SchedConfig {
            quantum: 0,
            timeout_sync_ms: 0,
            back_seek_penalty: 0,
            ..SchedConfig::default()
        };
        c.clamp();
        assert_eq!(c.quantum, 1);
        assert_eq!(c.timeout_sync_ms, 1);
        assert_eq!(c.back_seek_penalty, 1);
    }

    #[test]
    fn attr_name_roundtrip() {
        for attr in Attr::ALL {
            assert_eq!(Attr::from_name(attr.name()).unwrap(), attr);
        }
        assert!(matches!(
            Attr::from_name("no_such_knob"),
            Err(Error::UnknownAttr(_))
        ));
    }

    #[test]
    fn attr_parse_clamps() {
        assert_eq!(Attr::Quantum.parse("0").unwrap(), 1);
        assert_eq!(Attr::Desktop.parse("7").unwrap(), 1);
        assert_eq!(Attr::MaxBudget.parse("0").unwrap(), 0);
        assert_eq!(Attr::SliceIdle.parse(" 8 ").unwrap(), 8);
        assert!(matches!(
            Attr::TimeoutSync.parse("fast"),
            Err(Error::InvalidAttr { .. })
        ));
    }

    #[test]
    fn config_serde_roundtrip() {
        let c = SchedConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let back: SchedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn config_serde_partial_uses_defaults() {
        let back: SchedConfig = serde_json::from_str(r#"{"quantum": 8}"#).unwrap();
        assert_eq!(back.quantum, 8);
        assert_eq!(back.slice_idle_ms, DEFAULT_SLICE_IDLE_MS);
    }
}
