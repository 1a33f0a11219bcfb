//! Per-producer request queues.
//!
//! A queue owns the pending requests of one producer (or of all async
//! writers at one priority within a group): a sector-ordered store for
//! head-position-aware dispatch, a FIFO with per-request deadlines for
//! aging, and a cached `next_rq` — the request the head-biased chooser
//! currently considers the best candidate.
//!
//! The chooser ([`choose_better`]) implements a strict one-way
//! elevator with a bounded, penalized backward window: sync beats
//! async, metadata beats data, then the candidate closest ahead of
//! the head wins, where "behind but within `back_seek_max`" counts at
//! `back_seek_penalty` times the distance and anything further behind
//! wraps around.

use std::collections::{BTreeMap, VecDeque};

use crate::entity::EntId;
use crate::ioprio::IoPrio;
use crate::request::RequestId;
use crate::scheduler::Scheduler;

/// Per-producer queue state. The scheduling half of a queue lives in
/// its [`Entity`](crate::entity::Entity).
#[derive(Debug, Clone)]
pub(crate) struct Queue {
    pub entity: EntId,
    pub pid: u32,
    pub group: u32,

    /// Pending requests keyed by starting sector.
    pub sort_list: BTreeMap<u64, RequestId>,
    /// Pending requests in arrival order, with deadlines stamped at
    /// insertion.
    pub fifo: VecDeque<RequestId>,
    /// Cached best next-serve candidate.
    pub next_rq: Option<RequestId>,

    /// Pending request counts, `[async, sync]`.
    pub queued: [u32; 2],
    /// Allocated (set_request'd, not yet put) counts, `[read, write]`.
    pub allocated: [u32; 2],
    /// Requests handed to the dispatch list or the driver.
    pub dispatched: u32,

    /// Learned per-queue budget cap (sectors).
    pub max_budget: u64,
    /// Wall-clock deadline of the current activation.
    pub budget_timeout_us: u64,
    /// Fixed-point count of budgets granted, for the feedback trust
    /// gate.
    pub budgets_assigned: u32,
    pub meta_pending: u32,
    /// References: producer association, per-request allocations,
    /// group pin (async queues), service-tree membership.
    pub refs: u32,
    /// Priority before any boost, restored on unboost.
    pub org_prio: IoPrio,

    pub busy: bool,
    pub sync: bool,
    pub idle_window: bool,
    pub wait_request: bool,
    pub must_alloc: bool,
    pub budget_new: bool,
    /// The single FIFO override of this activation was consumed.
    pub fifo_checked: bool,
    /// Producer priority changed; reapply at next use.
    pub prio_changed: bool,
}

impl Queue {
    pub(crate) fn new(entity: EntId, pid: u32, group: u32, sync: bool, prio: IoPrio) -> Self {
        Self {
            entity,
            pid,
            group,
            sort_list: BTreeMap::new(),
            fifo: VecDeque::new(),
            next_rq: None,
            queued: [0, 0],
            allocated: [0, 0],
            dispatched: 0,
            max_budget: 0,
            budget_timeout_us: 0,
            budgets_assigned: 0,
            meta_pending: 0,
            refs: 0,
            org_prio: prio,
            busy: false,
            sync,
            idle_window: false,
            wait_request: false,
            must_alloc: false,
            budget_new: false,
            fifo_checked: false,
            prio_changed: true,
        }
    }

    #[must_use]
    pub(crate) fn has_requests(&self) -> bool {
        !self.sort_list.is_empty()
    }
}

// =============================================================================
// Head-biased chooser
// =============================================================================

/// Inputs the chooser needs about the device.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChooserCtx {
    /// Sector just past the last request sent to the driver.
    pub last_position: u64,
    /// Maximum backward seek considered, in sectors.
    pub back_max_sectors: u64,
    /// Cost multiplier for backward seeks.
    pub back_penalty: u64,
}

/// What the chooser sees of a candidate request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cand {
    pub sector: u64,
    pub sync: bool,
    pub meta: bool,
}

/// Seek cost of a candidate: forward distance, penalized backward
/// distance within the window, or a wrap.
fn seek_cost(ctx: &ChooserCtx, sector: u64) -> Option<u64> {
    let last = ctx.last_position;
    if sector >= last {
        Some(sector - last)
    } else if sector + ctx.back_max_sectors >= last {
        Some((last - sector) * ctx.back_penalty)
    } else {
        None
    }
}

/// Whether `c1` is the better candidate to serve next.
///
/// Total order: SYNC beats non-SYNC, META beats non-META, then the
/// cheaper seek from the head. Equal costs favor the higher sector;
/// one wrap loses to no wrap; two wraps favor the higher sector (the
/// shorter backward sweep).
#[must_use]
pub(crate) fn choose_better(ctx: &ChooserCtx, c1: &Cand, c2: &Cand) -> bool {
    if c1.sync != c2.sync {
        return c1.sync;
    }
    if c1.meta != c2.meta {
        return c1.meta;
    }

    match (seek_cost(ctx, c1.sector), seek_cost(ctx, c2.sector)) {
        (Some(d1), Some(d2)) => {
            if d1 != d2 {
                d1 < d2
            } else {
                c1.sector >= c2.sector
            }
        }
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => c1.sector >= c2.sector,
    }
}

// =============================================================================
// Request bookkeeping on the scheduler
// =============================================================================

impl Scheduler {
    pub(crate) fn chooser_ctx(&self) -> ChooserCtx {
        ChooserCtx {
            last_position: self.last_position,
            back_max_sectors: self.cfg.back_seek_max_sectors(),
            back_penalty: self.cfg.back_seek_penalty,
        }
    }

    fn cand(&self, rid: RequestId) -> Cand {
        let rq = &self.requests[rid.0];
        Cand {
            sector: rq.sector(),
            sync: rq.is_sync(),
            meta: rq.desc.meta,
        }
    }

    /// Pick the better of two candidate requests relative to the
    /// current head position.
    pub(crate) fn choose_req(
        &self,
        r1: Option<RequestId>,
        r2: Option<RequestId>,
    ) -> Option<RequestId> {
        match (r1, r2) {
            (None, other) => other,
            (Some(a), None) => Some(a),
            (Some(a), Some(b)) if a == b => Some(b),
            (Some(a), Some(b)) => {
                let ctx = self.chooser_ctx();
                if choose_better(&ctx, &self.cand(a), &self.cand(b)) {
                    Some(a)
                } else {
                    Some(b)
                }
            }
        }
    }

    /// Next-serve candidate after `last` leaves the sector store:
    /// chooses between the store neighbours of `last`, wrapping the
    /// forward neighbour to the front of the device when `last` is the
    /// highest-sector request.
    pub(crate) fn find_next_rq(&self, queue: u32, last: RequestId) -> Option<RequestId> {
        let sector = self.requests[last.0].sector();
        let sort_list = &self.queues[queue].sort_list;

        let prev = sort_list.range(..sector).next_back().map(|(_, &r)| r);
        let mut next = sort_list.range(sector + 1..).next().map(|(_, &r)| r);
        if next.is_none() {
            next = sort_list
                .iter()
                .next()
                .map(|(_, &r)| r)
                .filter(|&r| r != last);
        }

        self.choose_req(next, prev)
    }

    /// Add an inserted request to its queue's stores and refresh the
    /// next-serve candidate; activates the queue if this is its first
    /// pending request.
    pub(crate) fn add_rq(&mut self, rid: RequestId) {
        let queue = self.requests[rid.0].queue;
        let sync = self.requests[rid.0].is_sync();
        let sector = self.requests[rid.0].sector();

        self.queues[queue].queued[usize::from(sync)] += 1;
        self.queued += 1;

        // An insertion at an already-occupied sector produces an
        // alias: the incumbent goes straight to the dispatch list.
        if let Some(&alias) = self.queues[queue].sort_list.get(&sector) {
            tracing::debug!(queue = self.queues[queue].pid, sector, "alias dispatch");
            self.dispatch_insert(alias);
        }
        self.queues[queue].sort_list.insert(sector, rid);

        let next = self.choose_req(self.queues[queue].next_rq, Some(rid));
        debug_assert!(next.is_some());
        self.queues[queue].next_rq = next;

        if !self.queues[queue].busy {
            let next_sectors = next.map_or(0, |r| self.requests[r.0].sectors());
            let entity = self.queues[queue].entity;
            self.entities[entity].budget = self.queues[queue].max_budget.max(next_sectors);
            self.add_queue_busy(queue);
        } else {
            self.updated_next_req(queue);
        }
    }

    /// A queue's first request changed while it was not in service:
    /// resize its budget so one service round can cover the request,
    /// and reactivate so its finish time tracks the new budget.
    ///
    /// The in-service queue is never resized; its timestamps are
    /// already committed.
    pub(crate) fn updated_next_req(&mut self, queue: u32) {
        let Some(next) = self.queues[queue].next_rq else {
            return;
        };
        if self.active_queue == Some(queue) {
            return;
        }
        if !self.queues[queue].busy {
            return;
        }

        let sectors = self.requests[next.0].sectors();
        let entity = self.queues[queue].entity;
        let new_budget = self.queues[queue].max_budget.max(sectors);
        self.entities[entity].budget = new_budget;
        tracing::trace!(
            queue = self.queues[queue].pid,
            budget = new_budget,
            "budget resized for new head request"
        );
        self.activate_entity(entity);
    }

    /// Remove a request from its queue (dispatch or merge victim
    /// path), keeping `next_rq` and the busy state coherent.
    pub(crate) fn remove_request(&mut self, rid: RequestId) {
        let queue = self.requests[rid.0].queue;

        if self.queues[queue].next_rq == Some(rid) {
            let next = self.find_next_rq(queue, rid);
            self.queues[queue].next_rq = next;
            self.updated_next_req(queue);
        }

        if let Some(pos) = self.queues[queue].fifo.iter().position(|&r| r == rid) {
            self.queues[queue].fifo.remove(pos);
        }
        self.del_rq_store(rid);

        if self.requests[rid.0].desc.meta {
            debug_assert!(self.queues[queue].meta_pending > 0);
            self.queues[queue].meta_pending = self.queues[queue].meta_pending.saturating_sub(1);
        }
    }

    fn del_rq_store(&mut self, rid: RequestId) {
        let queue = self.requests[rid.0].queue;
        let sync = self.requests[rid.0].is_sync();
        let sector = self.requests[rid.0].sector();

        debug_assert!(self.queues[queue].queued[usize::from(sync)] > 0);
        self.queues[queue].queued[usize::from(sync)] -= 1;
        self.queued -= 1;

        let removed = self.queues[queue].sort_list.remove(&sector);
        debug_assert_eq!(removed, Some(rid));
        if self.queues[queue].next_rq == Some(rid) {
            self.queues[queue].next_rq = None;
        }

        if self.queues[queue].busy
            && self.active_queue != Some(queue)
            && self.queues[queue].sort_list.is_empty()
        {
            self.del_queue_busy(queue, true);
        }
    }

    /// FIFO aging: at most once per activation, serve the head of the
    /// FIFO instead of the chooser's pick if its deadline has passed.
    pub(crate) fn check_fifo(&mut self, queue: u32, now_us: u64) -> Option<RequestId> {
        if self.queues[queue].fifo_checked {
            return None;
        }
        self.queues[queue].fifo_checked = true;

        let &head = self.queues[queue].fifo.front()?;
        if now_us < self.requests[head.0].fifo_deadline_us {
            return None;
        }
        Some(head)
    }
}
