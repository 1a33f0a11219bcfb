//! Device-wide scheduler state and the driver-facing surface.
//!
//! One [`Scheduler`] multiplexes one backing device. The embedder owns
//! the lock, the timers, and the driver; every method here takes
//! `&mut self` plus, where time matters, an explicit monotonic
//! timestamp in microseconds, so behavior is fully deterministic under
//! test.
//!
//! Request lifecycle, embedder's view:
//!
//! ```text
//! set_request ─► insert_request ─► dispatch ─► take_dispatched
//!                                                   │
//!                         put_request ◄─ completed_request ◄─ activate_request
//! ```
//!
//! Deferred work is surfaced as data rather than owned machinery: the
//! idle timer is [`idle_timer_deadline`](Scheduler::idle_timer_deadline)
//! plus [`on_idle_timer`](Scheduler::on_idle_timer), and the "kick the
//! queue" work item is a consumable flag ([`take_kick`](Scheduler::take_kick)).

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::arena::Arena;
use crate::config::{Attr, SchedConfig, DEFAULT_MAX_BUDGET};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::feedback::{default_budget, HwTagDetector, PeakRate};
use crate::hierarchy::{Group, GroupId, SchedData};
use crate::ioprio::{IoPrio, IoPrioClass, IOPRIO_LEVELS};
use crate::profile::{IoContext, MIN_THINK_TIME_US};
use crate::queue::Queue;
use crate::request::{Request, RequestDesc, RequestId, RequestState};
use crate::service_tree::Entities;

/// Backpressure hint returned by [`Scheduler::may_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MayQueue {
    /// The producer may allocate a request, subject to normal limits.
    May,
    /// The producer was promised a slice (the scheduler is idling for
    /// it) and must be allowed to allocate.
    Must,
}

/// A request handed to the embedder for the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedRequest {
    pub id: RequestId,
    pub desc: RequestDesc,
}

/// Observability snapshot of one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pid: u32,
    pub sync: bool,
    pub busy: bool,
    /// Pending request counts, `[async, sync]`.
    pub queued: [u32; 2],
    pub dispatched: u32,
    /// Learned per-queue budget cap (sectors).
    pub max_budget: u64,
    /// Budget and service of the current activation.
    pub budget: u64,
    pub service: u64,
    pub idle_window: bool,
    pub weight: u64,
    pub next_sector: Option<u64>,
}

/// Observability snapshot of the device-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub busy_queues: u32,
    pub queued: u32,
    /// In-driver counts, `[async, sync]`.
    pub rq_in_driver: [u32; 2],
    pub sync_flight: u32,
    pub peak_rate: u64,
    pub peak_rate_samples: u32,
    pub max_budget: u64,
    pub hw_tag: bool,
    pub last_position: u64,
    pub idle_entities: usize,
    pub active_pid: Option<u32>,
}

/// The proportional-share scheduler core for one backing device.
pub struct Scheduler {
    pub(crate) cfg: SchedConfig,

    pub(crate) entities: Entities,
    pub(crate) groups: Arena<Group>,
    pub(crate) queues: Arena<Queue>,
    pub(crate) requests: Arena<Request>,
    pub(crate) contexts: HashMap<u32, IoContext>,

    pub(crate) root: GroupId,
    pub(crate) active_queue: Option<u32>,
    pub(crate) active_producer: Option<u32>,

    pub(crate) busy_queues: u32,
    pub(crate) queued: u32,
    /// Requests handed to the driver, `[async, sync]`.
    pub(crate) rq_in_driver: [u32; 2],
    pub(crate) sync_flight: u32,

    /// Sector just past the last request issued to the driver.
    pub(crate) last_position: u64,
    /// When the current activation started being measured.
    pub(crate) last_budget_start_us: u64,
    /// When the idle timer was last armed, for compensated rate
    /// samples.
    pub(crate) last_idling_start_us: u64,

    pub(crate) peak_rate: PeakRate,
    pub(crate) hw_tag: HwTagDetector,
    /// Effective device-wide max budget (autotuned or user-pinned).
    pub(crate) max_budget: u64,

    pub(crate) idle_deadline_us: Option<u64>,
    pub(crate) kick_pending: bool,
    pub(crate) dispatch_list: VecDeque<RequestId>,

    pub(crate) bad_prio_logged: bool,
    pub(crate) exited: bool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("busy_queues", &self.busy_queues)
            .field("queued", &self.queued)
            .field("active_queue", &self.active_queue)
            .field("max_budget", &self.max_budget)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler for one device.
    #[must_use]
    pub fn new(mut cfg: SchedConfig) -> Self {
        cfg.clamp();
        let max_budget = if cfg.max_budget > 0 {
            cfg.max_budget
        } else {
            DEFAULT_MAX_BUDGET
        };

        let mut entities = Entities::new();
        let mut groups = Arena::new();
        let root = groups.insert(Group {
            entity: 0,
            sched: SchedData::default(),
            async_queues: [[None; IOPRIO_LEVELS]; 2],
            async_idle: None,
        });
        let root_entity = entities.insert(Entity::new_group(root, root, 1));
        groups[root].entity = root_entity;

        Self {
            cfg,
            entities,
            groups,
            queues: Arena::new(),
            requests: Arena::new(),
            contexts: HashMap::new(),
            root: GroupId(root),
            active_queue: None,
            active_producer: None,
            busy_queues: 0,
            queued: 0,
            rq_in_driver: [0, 0],
            sync_flight: 0,
            last_position: 0,
            last_budget_start_us: 0,
            last_idling_start_us: 0,
            peak_rate: PeakRate::default(),
            hw_tag: HwTagDetector::default(),
            max_budget,
            idle_deadline_us: None,
            kick_pending: false,
            dispatch_list: VecDeque::new(),
            bad_prio_logged: false,
            exited: false,
        }
    }

    /// Create a scheduler with default tunables.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(SchedConfig::default())
    }

    /// The root containment group.
    #[must_use]
    pub fn root_group(&self) -> GroupId {
        self.root
    }

    /// Current tunables.
    #[must_use]
    pub fn config(&self) -> &SchedConfig {
        &self.cfg
    }

    /// True when no requests are pending in any queue.
    #[must_use]
    pub fn queue_empty(&self) -> bool {
        self.queued == 0
    }

    /// Snapshot of one producer's queue (sync or async association).
    #[must_use]
    pub fn queue_stats(&self, pid: u32, sync: bool) -> Option<QueueStats> {
        let ctx = self.contexts.get(&pid)?;
        let q = if sync { ctx.sync_queue } else { ctx.async_queue }?;
        let queue = self.queues.get(q)?;
        let entity = &self.entities[queue.entity];
        Some(QueueStats {
            pid: queue.pid,
            sync: queue.sync,
            busy: queue.busy,
            queued: queue.queued,
            dispatched: queue.dispatched,
            max_budget: queue.max_budget,
            budget: entity.budget,
            service: entity.service,
            idle_window: queue.idle_window,
            weight: entity.weight,
            next_sector: queue.next_rq.map(|r| self.requests[r.0].sector()),
        })
    }

    /// Snapshot of the device-wide counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            busy_queues: self.busy_queues,
            queued: self.queued,
            rq_in_driver: self.rq_in_driver,
            sync_flight: self.sync_flight,
            peak_rate: self.peak_rate.rate,
            peak_rate_samples: self.peak_rate.samples,
            max_budget: self.max_budget,
            hw_tag: self.hw_tag.hw_tag,
            last_position: self.last_position,
            idle_entities: self.idle_tree_population(),
            active_pid: self.active_queue.map(|q| self.queues[q].pid),
        }
    }

    // -------------------------------------------------------------------------
    // Tunable attributes
    // -------------------------------------------------------------------------

    /// Write a tunable by name. Values are ms-valued where the
    /// documentation says so; out-of-range writes clamp.
    pub fn set_attr(&mut self, name: &str, value: &str) -> Result<()> {
        let attr = Attr::from_name(name)?;
        let v = attr.parse(value)?;
        match attr {
            Attr::Quantum => self.cfg.quantum = v as u32,
            Attr::FifoExpireSync => self.cfg.fifo_expire_sync_ms = v,
            Attr::FifoExpireAsync => self.cfg.fifo_expire_async_ms = v,
            Attr::BackSeekMax => self.cfg.back_seek_max_kib = v,
            Attr::BackSeekPenalty => self.cfg.back_seek_penalty = v,
            Attr::SliceIdle => self.cfg.slice_idle_ms = v,
            Attr::MaxBudgetAsyncRq => self.cfg.max_budget_async_rq = v as u32,
            Attr::TimeoutAsync => self.cfg.timeout_async_ms = v,
            Attr::Desktop => self.cfg.desktop = v != 0,
            Attr::MaxBudget => {
                // Zero switches to autotuning from the measured rate.
                self.max_budget = if v == 0 {
                    self.peak_rate.estimated_max_budget(self.cfg.timeout_sync_ms)
                } else {
                    v
                };
                self.cfg.max_budget = v;
            }
            Attr::TimeoutSync => {
                self.cfg.timeout_sync_ms = v;
                if self.cfg.max_budget == 0 {
                    self.max_budget = self.peak_rate.estimated_max_budget(v);
                }
            }
        }
        tracing::debug!(attr = attr.name(), value = v, "tunable written");
        Ok(())
    }

    /// Read a tunable by name.
    pub fn get_attr(&self, name: &str) -> Result<String> {
        let attr = Attr::from_name(name)?;
        let v = match attr {
            Attr::Quantum => u64::from(self.cfg.quantum),
            Attr::FifoExpireSync => self.cfg.fifo_expire_sync_ms,
            Attr::FifoExpireAsync => self.cfg.fifo_expire_async_ms,
            Attr::BackSeekMax => self.cfg.back_seek_max_kib,
            Attr::BackSeekPenalty => self.cfg.back_seek_penalty,
            Attr::SliceIdle => self.cfg.slice_idle_ms,
            Attr::MaxBudget => self.cfg.max_budget,
            Attr::MaxBudgetAsyncRq => u64::from(self.cfg.max_budget_async_rq),
            Attr::TimeoutSync => self.cfg.timeout_sync_ms,
            Attr::TimeoutAsync => self.cfg.timeout_async_ms,
            Attr::Desktop => u64::from(self.cfg.desktop),
        };
        Ok(v.to_string())
    }

    // -------------------------------------------------------------------------
    // Producer surface
    // -------------------------------------------------------------------------

    fn ensure_context(&mut self, pid: u32, now_us: u64) -> &mut IoContext {
        self.contexts
            .entry(pid)
            .or_insert_with(|| IoContext::new(pid, now_us))
    }

    /// Set a producer's I/O priority from a raw priority word.
    ///
    /// A malformed word falls back to the nice-derived priority and is
    /// logged once per scheduler.
    pub fn set_producer_ioprio(&mut self, pid: u32, raw: u16, now_us: u64) {
        let prio = match IoPrio::from_raw(raw) {
            Ok(p) => p,
            Err(err) => {
                if !self.bad_prio_logged {
                    tracing::warn!(pid, %err, "bad ioprio, falling back to nice-derived");
                    self.bad_prio_logged = true;
                }
                let nice = self.ensure_context(pid, now_us).nice;
                IoPrio::from_nice(nice)
            }
        };
        let ctx = self.ensure_context(pid, now_us);
        ctx.prio = prio;
        ctx.explicit_prio = true;
        self.apply_producer_prio_change(pid, now_us);
    }

    /// Record a producer's CPU nice value; drives the I/O priority of
    /// producers that never set one explicitly.
    pub fn set_producer_nice(&mut self, pid: u32, nice: i32, now_us: u64) {
        let ctx = self.ensure_context(pid, now_us);
        ctx.nice = nice;
        if !ctx.explicit_prio {
            ctx.prio = IoPrio::from_nice(nice);
            self.apply_producer_prio_change(pid, now_us);
        }
    }

    /// A priority change reassociates the async queue (shared per
    /// priority) and marks the sync queue for lazy reapplication.
    fn apply_producer_prio_change(&mut self, pid: u32, now_us: u64) {
        let Some(ctx) = self.contexts.get(&pid) else {
            return;
        };
        let prio = ctx.prio;

        if let Some(old) = ctx.async_queue {
            let gid = self.queues[old].group;
            let new = self.async_queue_for(gid, prio, pid);
            if new != old {
                self.contexts.get_mut(&pid).expect("checked above").async_queue = Some(new);
                self.queues[new].refs += 1;
                self.put_queue(old);
            }
        }

        if let Some(sync_q) = self.contexts.get(&pid).and_then(|c| c.sync_queue) {
            self.queues[sync_q].prio_changed = true;
        }
    }

    /// Another task of the producer started sharing its I/O context.
    pub fn producer_task_started(&mut self, pid: u32, now_us: u64) {
        self.ensure_context(pid, now_us).live_tasks += 1;
    }

    /// A task of the producer exited; at zero live tasks, idling for
    /// this producer stops paying off.
    pub fn producer_task_exited(&mut self, pid: u32) {
        if let Some(ctx) = self.contexts.get_mut(&pid) {
            ctx.live_tasks = ctx.live_tasks.saturating_sub(1);
        }
    }

    /// Tear down a producer: drop its queue associations, expiring the
    /// active queue if it is involved. Queues with pending requests
    /// survive on their request references until drained.
    pub fn exit_producer(&mut self, pid: u32) {
        let Some(ctx) = self.contexts.get_mut(&pid) else {
            return;
        };
        ctx.live_tasks = 0;
        let sync_q = ctx.sync_queue.take();
        let async_q = ctx.async_queue.take();

        for q in [sync_q, async_q].into_iter().flatten() {
            if self.active_queue == Some(q) {
                self.finish_expire(q);
                self.schedule_kick();
            }
            self.put_queue(q);
        }
        self.put_ioc_ref(pid);
    }

    pub(crate) fn put_ioc_ref(&mut self, pid: u32) {
        let Some(ctx) = self.contexts.get_mut(&pid) else {
            debug_assert!(false, "ioc ref dropped for unknown producer");
            return;
        };
        debug_assert!(ctx.refs > 0);
        ctx.refs = ctx.refs.saturating_sub(1);
        if ctx.refs == 0 {
            self.contexts.remove(&pid);
        }
    }

    // -------------------------------------------------------------------------
    // Queue lookup / creation
    // -------------------------------------------------------------------------

    fn create_queue(&mut self, pid: u32, gid: u32, sync: bool, prio: IoPrio) -> u32 {
        let q = self.queues.insert(Queue::new(0, pid, gid, sync, prio));
        let entity = self.entities.insert(Entity::new_queue(q, gid, prio));
        self.queues[q].entity = entity;
        if sync && prio.class != IoPrioClass::Idle {
            self.queues[q].idle_window = true;
        }
        let autotune = self.cfg.max_budget == 0;
        self.queues[q].max_budget = default_budget(self.max_budget, 0, autotune);
        tracing::debug!(queue = pid, sync, "queue allocated");
        q
    }

    /// The group-shared async queue for a priority, created on first
    /// use and pinned by the group.
    fn async_queue_for(&mut self, gid: u32, prio: IoPrio, pid: u32) -> u32 {
        if let Some(q) = *self.groups[gid].async_slot(prio.class, prio.level) {
            return q;
        }
        let q = self.create_queue(pid, gid, false, prio);
        self.queues[q].refs += 1; // group pin
        *self.groups[gid].async_slot(prio.class, prio.level) = Some(q);
        q
    }

    /// Resolve (or create) the queue the producer's next request of
    /// this direction belongs to, taking the association reference
    /// when it is new.
    fn get_queue(&mut self, pid: u32, gid: u32, sync: bool, now_us: u64) -> u32 {
        let ctx = self.ensure_context(pid, now_us);
        let prio = ctx.prio;
        if sync {
            if let Some(q) = ctx.sync_queue {
                return q;
            }
            let q = self.create_queue(pid, gid, true, prio);
            self.queues[q].refs += 1; // association
            self.contexts.get_mut(&pid).expect("just ensured").sync_queue = Some(q);
            q
        } else {
            if let Some(q) = ctx.async_queue {
                return q;
            }
            let q = self.async_queue_for(gid, prio, pid);
            self.queues[q].refs += 1; // association
            self.contexts.get_mut(&pid).expect("just ensured").async_queue = Some(q);
            q
        }
    }

    /// Apply a producer priority change to a queue lazily, at the next
    /// point the queue is touched on the submission path.
    pub(crate) fn init_prio_data(&mut self, q: u32, pid: u32) {
        if !self.queues[q].prio_changed {
            return;
        }
        let Some(ctx) = self.contexts.get(&pid) else {
            return;
        };
        let prio = ctx.prio;
        let entity = self.queues[q].entity;
        self.entities[entity].new_prio = prio;
        self.entities[entity].prio_changed = true;
        if prio.class == IoPrioClass::Idle {
            self.queues[q].idle_window = false;
        }
        self.queues[q].org_prio = prio;
        self.queues[q].prio_changed = false;
    }

    /// Release one queue reference; at zero the queue is freed. A
    /// freed queue holds no requests, no tree membership, and is not
    /// the active queue.
    pub(crate) fn put_queue(&mut self, q: u32) {
        debug_assert!(self.queues[q].refs > 0);
        self.queues[q].refs -= 1;
        if self.queues[q].refs > 0 {
            return;
        }

        debug_assert!(!self.queues[q].busy);
        debug_assert!(self.queues[q].sort_list.is_empty());
        debug_assert_eq!(self.queues[q].allocated, [0, 0]);
        debug_assert_ne!(self.active_queue, Some(q));

        let entity = self.queues[q].entity;
        debug_assert!(!self.entities[entity].on_st);
        tracing::debug!(queue = self.queues[q].pid, "queue freed");
        self.entities.remove(entity);
        self.queues.remove(q);
    }

    // -------------------------------------------------------------------------
    // Request allocation and insertion
    // -------------------------------------------------------------------------

    /// Allocate scheduler state for a new request of `pid` in `group`.
    ///
    /// Failure (unknown group, scheduler shut down) backpressures the
    /// caller and schedules a dispatch kick so the retry sees state
    /// advanced.
    pub fn set_request(
        &mut self,
        pid: u32,
        group: Option<GroupId>,
        desc: RequestDesc,
        now_us: u64,
    ) -> Result<RequestId> {
        if self.exited {
            return Err(Error::Exited);
        }
        let gid = group.unwrap_or(self.root);
        if self.groups.get(gid.0).is_none() {
            self.schedule_kick();
            return Err(Error::UnknownGroup(gid.0));
        }

        let q = self.get_queue(pid, gid.0, desc.sync, now_us);
        self.queues[q].allocated[desc.dir.index()] += 1;
        self.queues[q].refs += 1;
        self.ensure_context(pid, now_us).refs += 1;

        let rid = self.requests.insert(Request {
            desc,
            queue: q,
            pid,
            fifo_deadline_us: 0,
            state: RequestState::Allocated,
        });
        Ok(RequestId(rid))
    }

    /// Queue a previously allocated request for service.
    pub fn insert_request(&mut self, rid: RequestId, now_us: u64) -> Result<()> {
        let rq = self
            .requests
            .get(rid.0)
            .ok_or(Error::UnknownRequest(rid.0))?;
        debug_assert_eq!(rq.state, RequestState::Allocated);
        let q = rq.queue;
        let pid = rq.pid;
        let sync = rq.is_sync();

        self.init_prio_data(q, pid);

        self.requests[rid.0].state = RequestState::Queued;
        self.requests[rid.0].fifo_deadline_us = now_us + self.cfg.fifo_expire_us(sync);

        self.add_rq(rid);
        self.queues[q].fifo.push_back(rid);
        self.rq_enqueued(q, rid, now_us);
        Ok(())
    }

    /// New-request housekeeping: producer profiling, idle-window
    /// reconsideration, and cutting short an idle wait the request
    /// satisfies.
    fn rq_enqueued(&mut self, q: u32, rid: RequestId, now_us: u64) {
        let sector = self.requests[rid.0].sector();
        let end = self.requests[rid.0].end_sector();
        let pid = self.requests[rid.0].pid;

        if self.requests[rid.0].desc.meta {
            self.queues[q].meta_pending += 1;
        }

        let think_cap = 2 * self.cfg.slice_idle_us();
        if let Some(ctx) = self.contexts.get_mut(&pid) {
            let elapsed = now_us.saturating_sub(ctx.last_end_request_us);
            ctx.think.observe(elapsed, think_cap);
            let dist = sector.abs_diff(ctx.last_request_pos);
            ctx.seek.observe(dist);
        }
        self.update_idle_window(q, pid);
        if let Some(ctx) = self.contexts.get_mut(&pid) {
            ctx.last_request_pos = end;
        }

        if self.active_queue == Some(q) && self.queues[q].wait_request {
            // The wait paid off: stop idling and run the queue now.
            self.queues[q].wait_request = false;
            self.idle_deadline_us = None;
            self.kick_pending = true;
        }
    }

    /// Reconsider whether idling on this queue is worth it, from the
    /// producer's think time and seekiness.
    fn update_idle_window(&mut self, q: u32, pid: u32) {
        if !self.queues[q].sync {
            return;
        }
        let entity = self.queues[q].entity;
        if self.entities[entity].prio.class == IoPrioClass::Idle {
            return;
        }
        let Some(ctx) = self.contexts.get(&pid) else {
            return;
        };

        let mut enable = self.queues[q].idle_window;
        if ctx.live_tasks == 0
            || self.cfg.slice_idle_ms == 0
            || (!self.cfg.desktop && self.hw_tag.hw_tag && ctx.seek.is_seeky())
        {
            enable = false;
        } else if ctx.think.valid() {
            let mut slice = self.cfg.slice_idle_us();
            if ctx.seek.valid() && ctx.seek.is_seeky() {
                slice = MIN_THINK_TIME_US;
            }
            enable = ctx.think.mean <= slice;
        }

        if enable != self.queues[q].idle_window {
            tracing::trace!(
                queue = self.queues[q].pid,
                idle_window = enable,
                seeky = ctx.seek.is_seeky(),
                "idle window reconsidered"
            );
            self.queues[q].idle_window = enable;
        }
    }

    // -------------------------------------------------------------------------
    // Merging
    // -------------------------------------------------------------------------

    /// Front-merge lookup: the pending request of this producer that
    /// starts exactly where the incoming bio ends.
    #[must_use]
    pub fn find_front_merge(&self, pid: u32, sync: bool, bio_end_sector: u64) -> Option<RequestId> {
        let ctx = self.contexts.get(&pid)?;
        let q = if sync { ctx.sync_queue } else { ctx.async_queue }?;
        self.queues[q].sort_list.get(&bio_end_sector).copied()
    }

    /// Merge admission: no sync bio merges into an async request, and
    /// only the queue the submitting producer is associated with may
    /// absorb its bio.
    #[must_use]
    pub fn allow_merge(&self, pid: u32, bio_sync: bool, rid: RequestId) -> bool {
        let Some(rq) = self.requests.get(rid.0) else {
            return false;
        };
        if bio_sync && !rq.is_sync() {
            return false;
        }
        let Some(ctx) = self.contexts.get(&pid) else {
            return false;
        };
        let q = if bio_sync { ctx.sync_queue } else { ctx.async_queue };
        q == Some(rq.queue)
    }

    /// A front merge grew a request toward lower sectors: reposition
    /// it in the sector store under its new start.
    pub fn merged_request(&mut self, rid: RequestId, new_desc: RequestDesc) -> Result<()> {
        let rq = self
            .requests
            .get(rid.0)
            .ok_or(Error::UnknownRequest(rid.0))?;
        debug_assert_eq!(rq.state, RequestState::Queued);
        let q = rq.queue;
        let sync = rq.is_sync();
        let old_sector = rq.sector();

        let removed = self.queues[q].sort_list.remove(&old_sector);
        debug_assert_eq!(removed, Some(rid));
        self.queues[q].queued[usize::from(sync)] -= 1;
        self.queued -= 1;

        self.requests[rid.0].desc = new_desc;
        self.add_rq(rid);
        Ok(())
    }

    /// Two requests merged; `victim` is absorbed into `rid`, whose
    /// descriptor grew to `new_desc`. The survivor inherits the
    /// earlier FIFO deadline (and the victim's aging position), then
    /// the victim leaves the queue. The embedder still owns the
    /// victim's allocation until `put_request`.
    pub fn merged_requests(
        &mut self,
        rid: RequestId,
        new_desc: RequestDesc,
        victim: RequestId,
    ) -> Result<()> {
        if self.requests.get(rid.0).is_none() {
            return Err(Error::UnknownRequest(rid.0));
        }
        if self.requests.get(victim.0).is_none() {
            return Err(Error::UnknownRequest(victim.0));
        }

        debug_assert_eq!(new_desc.sector, self.requests[rid.0].sector());
        self.requests[rid.0].desc = new_desc;

        let survivor_deadline = self.requests[rid.0].fifo_deadline_us;
        let victim_deadline = self.requests[victim.0].fifo_deadline_us;
        let q = self.requests[rid.0].queue;
        let vq = self.requests[victim.0].queue;

        if victim_deadline < survivor_deadline {
            self.requests[rid.0].fifo_deadline_us = victim_deadline;
            if q == vq {
                // Take over the victim's aging position.
                let spos = self.queues[q].fifo.iter().position(|&r| r == rid);
                let vpos = self.queues[q].fifo.iter().position(|&r| r == victim);
                if let (Some(spos), Some(vpos)) = (spos, vpos) {
                    self.queues[q].fifo.remove(spos);
                    let vpos = if spos < vpos { vpos - 1 } else { vpos };
                    self.queues[q].fifo.insert(vpos + 1, rid);
                }
            }
        }

        if self.requests[victim.0].state == RequestState::Queued {
            self.remove_request(victim);
            self.requests[victim.0].state = RequestState::Allocated;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Backpressure and release
    // -------------------------------------------------------------------------

    /// Backpressure hint for a producer about to allocate a request.
    ///
    /// `fs_excl` carries the caller's lock-holding state: while a
    /// producer holds filesystem-exclusive resources its queues are
    /// boosted out of the idle class so they cannot stall other
    /// producers on shared locks.
    pub fn may_queue(&mut self, pid: u32, sync: bool, fs_excl: bool) -> MayQueue {
        let Some(ctx) = self.contexts.get(&pid) else {
            return MayQueue::May;
        };
        let Some(q) = (if sync { ctx.sync_queue } else { ctx.async_queue }) else {
            return MayQueue::May;
        };

        self.init_prio_data(q, pid);
        self.prio_boost(q, fs_excl);

        if self.queues[q].wait_request && self.queues[q].must_alloc {
            self.queues[q].must_alloc = false;
            MayQueue::Must
        } else {
            MayQueue::May
        }
    }

    /// Boost (or restore) a queue's pending priority around
    /// filesystem-exclusive sections. Takes effect at the next
    /// (re)activation.
    fn prio_boost(&mut self, q: u32, fs_excl: bool) {
        let entity = self.queues[q].entity;
        let target = if fs_excl {
            self.entities[entity].new_prio.boosted()
        } else {
            self.queues[q].org_prio
        };
        if self.entities[entity].new_prio != target {
            self.entities[entity].new_prio = target;
            self.entities[entity].prio_changed = true;
        }
    }

    /// Release a request's scheduler state: completed requests, merge
    /// victims, never-inserted allocations, and still-queued requests
    /// whose bio was aborted before dispatch. A request the driver
    /// holds must complete first.
    pub fn put_request(&mut self, rid: RequestId) -> Result<()> {
        let rq = self
            .requests
            .get(rid.0)
            .ok_or(Error::UnknownRequest(rid.0))?;
        debug_assert!(
            !matches!(rq.state, RequestState::Dispatched | RequestState::InDriver),
            "request released while owned by the driver"
        );
        let q = rq.queue;
        let pid = rq.pid;
        let dir = rq.desc.dir;

        // An aborted bio leaves its request queued; take it out of
        // the stores first.
        if self.requests[rid.0].state == RequestState::Queued {
            self.remove_request(rid);
        }

        debug_assert!(self.queues[q].allocated[dir.index()] > 0);
        self.queues[q].allocated[dir.index()] -= 1;
        self.requests.remove(rid.0);

        self.put_ioc_ref(pid);
        self.put_queue(q);
        Ok(())
    }

    /// Defer a dispatch kick to the embedder if work is pending.
    pub(crate) fn schedule_kick(&mut self) {
        if self.queued != 0 {
            tracing::trace!("dispatch kick scheduled");
            self.kick_pending = true;
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Shut the scheduler down: cancel idling, drop every producer
    /// association, force-drain all queues, and release the group
    /// async pins. Only request release (`put_request`) and the
    /// dispatch-list drain remain valid afterwards.
    pub fn exit(&mut self) {
        if self.exited {
            return;
        }
        self.idle_deadline_us = None;

        let pids: Vec<u32> = self.contexts.keys().copied().collect();
        for pid in pids {
            self.exit_producer(pid);
        }

        self.forced_dispatch();
        self.drop_idle_trees();

        for gid in self.groups.indices() {
            for class_slots in 0..2 {
                for level in 0..IOPRIO_LEVELS {
                    if let Some(q) = self.groups[gid].async_queues[class_slots][level].take() {
                        self.put_queue(q);
                    }
                }
            }
            if let Some(q) = self.groups[gid].async_idle.take() {
                self.put_queue(q);
            }
        }

        debug_assert_eq!(self.busy_queues, 0);
        self.exited = true;
        tracing::debug!("scheduler exited");
    }

    /// Forget every parked entity on every idle tree.
    fn drop_idle_trees(&mut self) {
        use crate::entity::TreeMembership;
        use crate::service_tree::{tree_extract, tree_first};

        for gid in self.groups.indices() {
            for ci in 0..crate::ioprio::CLASS_COUNT {
                while let Some(first) =
                    tree_first(&self.entities, &self.groups[gid].sched.trees[ci].idle)
                {
                    tree_extract(
                        &mut self.entities,
                        &mut self.groups[gid].sched.trees[ci].idle,
                        first,
                    );
                    self.entities[first].tree = TreeMembership::None;
                    self.forget_entity(first);
                }
            }
        }
    }
}
