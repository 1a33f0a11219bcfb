//! I/O priority classes, levels, and weight derivation.
//!
//! Producers carry an I/O priority made of a class and, for the RT and
//! BE classes, a level in `0..8` (lower is more important). The
//! scheduler serves classes strictly in order RT → BE → IDLE; within a
//! class, levels map to fair-queueing weights.
//!
//! | Class | Levels | Service order              |
//! |-------|--------|----------------------------|
//! | RT    | 0–7    | first, ahead of everything |
//! | BE    | 0–7    | default                    |
//! | IDLE  | —      | only when nothing else     |

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Number of levels in the RT and BE classes.
pub const IOPRIO_LEVELS: usize = 8;

/// The default ("normal") priority level.
pub const IOPRIO_NORM: u8 = 4;

/// Bit position of the class in a raw priority word.
const IOPRIO_CLASS_SHIFT: u16 = 13;

/// Scheduling class of a producer's I/O.
///
/// Ordered by service precedence: `Rt` is always served before `Be`,
/// which is always served before `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoPrioClass {
    /// Real-time: served ahead of every other class.
    Rt,
    /// Best-effort: the default class.
    Be,
    /// Idle: served only when no RT or BE work exists.
    Idle,
}

/// Number of scheduling classes.
pub const CLASS_COUNT: usize = 3;

impl IoPrioClass {
    /// All classes, in service order.
    pub const IN_SERVICE_ORDER: [IoPrioClass; CLASS_COUNT] =
        [IoPrioClass::Rt, IoPrioClass::Be, IoPrioClass::Idle];

    /// Index into per-class arrays (service trees).
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Rt => "rt",
            Self::Be => "be",
            Self::Idle => "idle",
        }
    }
}

/// A full I/O priority: class plus level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoPrio {
    pub class: IoPrioClass,
    pub level: u8,
}

impl IoPrio {
    /// Normal best-effort priority.
    #[must_use]
    pub fn normal() -> Self {
        Self {
            class: IoPrioClass::Be,
            level: IOPRIO_NORM,
        }
    }

    /// The idle-class priority (level pinned to the lowest).
    #[must_use]
    pub fn idle() -> Self {
        Self {
            class: IoPrioClass::Idle,
            level: (IOPRIO_LEVELS - 1) as u8,
        }
    }

    /// Derive a best-effort priority from a CPU nice value, for
    /// producers that never set an explicit I/O priority.
    ///
    /// Nice −20..19 maps onto levels 0..7.
    #[must_use]
    pub fn from_nice(nice: i32) -> Self {
        let level = ((nice.clamp(-20, 19) + 20) / 5) as u8;
        Self {
            class: IoPrioClass::Be,
            level: level.min((IOPRIO_LEVELS - 1) as u8),
        }
    }

    /// Decode a raw priority word (`class << 13 | level`).
    ///
    /// Unknown classes are a parse failure; callers fall back to the
    /// nice-derived priority per the error-handling contract.
    pub fn from_raw(raw: u16) -> Result<Self, Error> {
        let level = (raw & ((1 << IOPRIO_CLASS_SHIFT) - 1)).min(IOPRIO_LEVELS as u16 - 1) as u8;
        match raw >> IOPRIO_CLASS_SHIFT {
            1 => Ok(Self {
                class: IoPrioClass::Rt,
                level,
            }),
            2 => Ok(Self {
                class: IoPrioClass::Be,
                level,
            }),
            3 => Ok(Self::idle()),
            _ => Err(Error::BadIoPrio(raw)),
        }
    }

    /// Fair-queueing weight for this priority (higher level → lower
    /// weight). Level 0 weighs 8, level 7 weighs 1.
    #[must_use]
    pub fn weight(self) -> u64 {
        IOPRIO_LEVELS as u64 - u64::from(self.level.min((IOPRIO_LEVELS - 1) as u8))
    }

    /// The priority this producer is boosted to while it holds
    /// filesystem-exclusive resources: idle-class producers rise to
    /// best-effort, and no producer stays below normal level.
    #[must_use]
    pub fn boosted(self) -> Self {
        let class = match self.class {
            IoPrioClass::Idle => IoPrioClass::Be,
            other => other,
        };
        Self {
            class,
            level: self.level.min(IOPRIO_NORM),
        }
    }
}

impl Default for IoPrio {
    fn default() -> Self {
        Self::normal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_service_order() {
        assert!(IoPrioClass::Rt < IoPrioClass::Be);
        assert!(IoPrioClass::Be < IoPrioClass::Idle);
        assert_eq!(IoPrioClass::Rt.index(), 0);
        assert_eq!(IoPrioClass::Idle.index(), 2);
    }

    #[test]
    fn weight_from_level() {
        assert_eq!(
            IoPrio {
                class: IoPrioClass::Be,
                level: 0
            }
            .weight(),
            8
        );
        assert_eq!(IoPrio::normal().weight(), 4);
        assert_eq!(
            IoPrio {
                class: IoPrioClass::Be,
                level: 7
            }
            .weight(),
            1
        );
    }

    #[test]
    fn nice_mapping() {
        assert_eq!(IoPrio::from_nice(-20).level, 0);
        assert_eq!(IoPrio::from_nice(0).level, 4);
        assert_eq!(IoPrio::from_nice(19).level, 7);
        assert_eq!(IoPrio::from_nice(0).class, IoPrioClass::Be);
        // Out-of-range nice values clamp instead of wrapping.
        assert_eq!(IoPrio::from_nice(100).level, 7);
        assert_eq!(IoPrio::from_nice(-100).level, 0);
    }

    #[test]
    fn raw_roundtrip() {
        let p = IoPrio::from_raw((2 << 13) | 3).unwrap();
        assert_eq!(p.class, IoPrioClass::Be);
        assert_eq!(p.level, 3);

        let rt = IoPrio::from_raw(1 << 13).unwrap();
        assert_eq!(rt.class, IoPrioClass::Rt);
        assert_eq!(rt.level, 0);

        let idle = IoPrio::from_raw(3 << 13).unwrap();
        assert_eq!(idle.class, IoPrioClass::Idle);
        assert_eq!(idle.level, 7);

        assert!(IoPrio::from_raw(0).is_err());
        assert!(IoPrio::from_raw(7 << 13).is_err());
    }

    #[test]
    fn boost_rules() {
        // Idle rises to BE at normal level.
        let b = IoPrio::idle().boosted();
        assert_eq!(b.class, IoPrioClass::Be);
        assert_eq!(b.level, IOPRIO_NORM);

        // Low BE is capped at normal.
        let low = IoPrio {
            class: IoPrioClass::Be,
            level: 7,
        };
        assert_eq!(low.boosted().level, IOPRIO_NORM);

        // High priorities are untouched.
        let rt = IoPrio {
            class: IoPrioClass::Rt,
            level: 1,
        };
        assert_eq!(rt.boosted(), rt);
    }

    #[test]
    fn serde_labels() {
        let json = serde_json::to_string(&IoPrioClass::Idle).unwrap();
        assert_eq!(json, "\"idle\"");
    }
}
