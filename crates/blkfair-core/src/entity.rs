//! Scheduling entities and fixed-point virtual-time arithmetic.
//!
//! An entity is the unit the fair-queueing engine schedules: either a
//! leaf producer queue or an inner group. Entities carry the weighted
//! virtual timestamps (`start`, `finish`), the budget/service pair for
//! the current activation, and the red-black links used by the service
//! trees, all in one arena slot.
//!
//! Virtual timestamps are integers scaled by `2^RATE_SHIFT`. Serving
//! `s` sectors at weight `w` advances an entity's clock by
//! `(s << RATE_SHIFT) / w`. Comparisons go through [`vt_after`], which
//! is wrap-safe, so long-lived devices survive timestamp wraparound
//! without re-basing.

use crate::ioprio::IoPrio;

/// Fixed-point shift for virtual time and rate arithmetic.
pub const RATE_SHIFT: u32 = 16;

pub(crate) type EntId = u32;

/// Wrap-safe "strictly after" comparison of virtual timestamps.
#[inline]
#[must_use]
pub(crate) fn vt_after(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

/// Virtual-time increment for serving `service` sectors at `weight`.
#[inline]
#[must_use]
pub(crate) fn vt_delta(service: u64, weight: u64) -> u64 {
    debug_assert!(weight > 0, "entity weight must be positive");
    (service << RATE_SHIFT) / weight
}

/// Which of its parent's trees currently holds an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeMembership {
    /// Not on any tree (fresh, in service, or forgotten).
    None,
    /// On the active tree: has work and an unfinished activation.
    Active,
    /// On the idle tree: finished ahead of the class clock, parked to
    /// preserve virtual-time ordering on return.
    Idle,
}

/// What an entity stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Payload {
    /// A leaf producer queue.
    Queue(u32),
    /// An inner group with service trees of its own.
    Group(u32),
}

/// Red-black tree links, embedded in the entity: an entity is on at
/// most one tree at a time, so one set of links suffices.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RbNode {
    pub parent: Option<EntId>,
    pub left: Option<EntId>,
    pub right: Option<EntId>,
    pub red: bool,
}

impl RbNode {
    pub(crate) fn clear(&mut self) {
        *self = RbNode::default();
    }
}

/// One schedulable entity.
#[derive(Debug, Clone)]
pub(crate) struct Entity {
    /// Applied fair-queueing weight.
    pub weight: u64,
    /// Applied priority (meaningful for queue entities).
    pub prio: IoPrio,
    /// Pending priority, applied at the next (re)activation.
    pub new_prio: IoPrio,
    /// Pending explicit weight (group entities only).
    pub new_weight: u64,
    /// Set when `new_prio`/`new_weight` differ from the applied state.
    pub prio_changed: bool,

    /// Virtual start of the current activation.
    pub start: u64,
    /// Virtual finish of the current activation.
    pub finish: u64,
    /// Subtree augmentation: minimum `start` across this entity and
    /// its descendants in the active tree.
    pub min_start: u64,

    /// Sectors granted for this activation.
    pub budget: u64,
    /// Sectors served so far in this activation.
    pub service: u64,

    /// Counted in some service tree's weight sum (on a tree or in
    /// service).
    pub on_st: bool,
    /// Which tree of the owning group holds this entity.
    pub tree: TreeMembership,

    /// The group whose service trees schedule this entity. The root
    /// group's own entity is never scheduled and points at itself.
    pub group: u32,
    pub payload: Payload,
    pub node: RbNode,
}

impl Entity {
    pub(crate) fn new_queue(queue: u32, group: u32, prio: IoPrio) -> Self {
        Self {
            weight: prio.weight(),
            prio,
            new_prio: prio,
            new_weight: prio.weight(),
            prio_changed: false,
            start: 0,
            finish: 0,
            min_start: 0,
            budget: 0,
            service: 0,
            on_st: false,
            tree: TreeMembership::None,
            group,
            payload: Payload::Queue(queue),
            node: RbNode::default(),
        }
    }

    pub(crate) fn new_group(group_payload: u32, parent_group: u32, weight: u64) -> Self {
        let prio = IoPrio::normal();
        Self {
            weight,
            prio,
            new_prio: prio,
            new_weight: weight,
            prio_changed: false,
            start: 0,
            finish: 0,
            min_start: 0,
            budget: 0,
            service: 0,
            on_st: false,
            tree: TreeMembership::None,
            group: parent_group,
            payload: Payload::Group(group_payload),
            node: RbNode::default(),
        }
    }

    /// Recompute `finish` from `start` for `amount` sectors at the
    /// entity's weight.
    pub(crate) fn calc_finish(&mut self, amount: u64) {
        self.finish = self.start.wrapping_add(vt_delta(amount, self.weight));
    }

    /// Sectors left before the budget is exhausted.
    #[must_use]
    pub(crate) fn budget_left(&self) -> u64 {
        self.budget.saturating_sub(self.service)
    }

    #[must_use]
    pub(crate) fn as_queue(&self) -> Option<u32> {
        match self.payload {
            Payload::Queue(q) => Some(q),
            Payload::Group(_) => None,
        }
    }
}
