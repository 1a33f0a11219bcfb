//! The dispatch engine: active-queue selection, budgeted service
//! rounds, anticipatory idling, and expiry.
//!
//! One service round: pick the active queue through the hierarchy
//! walk, move up to a quantum of its requests to the dispatch list
//! while the budget lasts, then either keep it (more work, budget
//! left), park it (idling for its producer), or expire it with a
//! reason that feeds the budget-learning loop.
//!
//! Expiry is where the heuristics meet: the peak-rate estimator
//! measures the slice, slow (seeky) queues get reclassified from
//! "too idle" to "timed out" and charged their full budget so their
//! virtual finish reflects the wall time they occupied, and the
//! per-queue budget cap is adjusted by the feedback table.

use crate::feedback::{default_budget, next_max_budget, ExpireReason, BUDGETS_TRUSTED};
use crate::ioprio::IoPrioClass;
use crate::profile::MIN_THINK_TIME_US;
use crate::request::{RequestId, RequestState};
use crate::scheduler::{DispatchedRequest, Scheduler};

impl Scheduler {
    // -------------------------------------------------------------------------
    // Active-queue selection
    // -------------------------------------------------------------------------

    fn queue_class(&self, q: u32) -> IoPrioClass {
        self.entities[self.queues[q].entity].prio.class
    }

    /// Mark a queue as the one under service.
    fn set_active(&mut self, q: Option<u32>) {
        if let Some(q) = q {
            self.queues[q].must_alloc = true;
            self.queues[q].budget_new = true;
            self.queues[q].fifo_checked = false;
            self.queues[q].budgets_assigned = (self.queues[q].budgets_assigned * 7 + 256) / 8;
            tracing::debug!(queue = self.queues[q].pid, "active");
        }
        self.active_queue = q;
    }

    fn set_active_next(&mut self) -> Option<u32> {
        let q = self.get_next_queue();
        self.set_active(q);
        q
    }

    /// Whether the active queue's wall-clock bound has elapsed. A
    /// freshly selected queue has no bound until its first completion.
    fn budget_timed_out(&self, q: u32, now_us: u64) -> bool {
        !self.queues[q].budget_new && now_us >= self.queues[q].budget_timeout_us
    }

    /// Select the queue to serve: keep the active one while it has
    /// budgeted work or an idle wait in flight, expire it otherwise.
    /// `None` defers the round (nothing runnable, or parked idling).
    fn select_queue(&mut self, now_us: u64) -> Option<u32> {
        let Some(q) = self.active_queue else {
            return self.set_active_next();
        };

        if self.budget_timed_out(q, now_us) {
            self.expire_queue(q, false, ExpireReason::BudgetTimeout, now_us);
            return self.set_active_next();
        }

        if let Some(next) = self.queues[q].next_rq {
            let sectors = self.requests[next.0].sectors();
            let entity = self.queues[q].entity;
            if sectors > self.entities[entity].budget_left() {
                self.expire_queue(q, false, ExpireReason::BudgetExhausted, now_us);
                return self.set_active_next();
            }
            return Some(q);
        }

        // No pending requests: hold the queue while the idle timer is
        // armed or while in-flight requests may earn it more work.
        if self.idle_deadline_us.is_some()
            || (self.queues[q].dispatched > 0 && self.queues[q].idle_window)
        {
            return None;
        }

        self.expire_queue(q, false, ExpireReason::NoMoreRequests, now_us);
        self.set_active_next()
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Move a request from its queue to the dispatch list.
    pub(crate) fn dispatch_insert(&mut self, rid: RequestId) {
        let q = self.requests[rid.0].queue;
        self.queues[q].next_rq = self.find_next_rq(q, rid);
        self.remove_request(rid);
        self.queues[q].dispatched += 1;
        self.requests[rid.0].state = RequestState::Dispatched;
        self.dispatch_list.push_back(rid);
        if self.queues[q].sync {
            self.sync_flight += 1;
        }
    }

    /// One budgeted service round on `q`. Returns requests moved.
    fn dispatch_round(&mut self, q: u32, max_dispatch: u32, now_us: u64) -> usize {
        debug_assert!(self.queues[q].has_requests());
        let mut dispatched = 0;

        loop {
            // Aged FIFO head first, else the chooser's pick.
            let rid = match self.check_fifo(q, now_us) {
                Some(r) => r,
                None => match self.queues[q].next_rq {
                    Some(r) => r,
                    None => break,
                },
            };

            let sectors = self.requests[rid.0].sectors();
            let entity = self.queues[q].entity;
            if sectors > self.entities[entity].budget_left() {
                // Make sure the next activation's budget covers this
                // request, even when it came off the FIFO path.
                self.queues[q].next_rq = Some(rid);
                self.expire_queue(q, false, ExpireReason::BudgetExhausted, now_us);
                return dispatched;
            }

            self.entity_served(entity, sectors);
            self.dispatch_insert(rid);
            dispatched += 1;

            if self.active_producer.is_none() {
                let pid = self.requests[rid.0].pid;
                if let Some(ctx) = self.contexts.get_mut(&pid) {
                    ctx.refs += 1;
                    self.active_producer = Some(pid);
                }
            }

            if !self.queues[q].has_requests() || dispatched >= max_dispatch as usize {
                break;
            }
        }

        let sync = self.queues[q].sync;
        if self.busy_queues > 1
            && ((!sync && dispatched >= self.cfg.max_budget_async_rq as usize)
                || self.queue_class(q) == IoPrioClass::Idle)
        {
            self.expire_queue(q, false, ExpireReason::BudgetExhausted, now_us);
        }

        dispatched
    }

    /// Run service rounds until nothing more is runnable. Returns the
    /// number of requests moved to the dispatch list; drain them with
    /// [`take_dispatched`](Scheduler::take_dispatched).
    pub fn dispatch(&mut self, now_us: u64) -> usize {
        if self.busy_queues == 0 {
            return 0;
        }

        let mut dispatched = 0;
        while let Some(q) = self.select_queue(now_us) {
            let mut max_dispatch = self.cfg.quantum;
            if self.queue_class(q) == IoPrioClass::Idle {
                max_dispatch = 1;
            }
            if !self.queues[q].sync {
                max_dispatch = self.cfg.max_budget_async_rq;
            }

            if self.queues[q].dispatched >= max_dispatch {
                // Plenty in flight already; only the lone busy queue
                // may run further ahead, and only up to a point.
                if self.busy_queues > 1 {
                    break;
                }
                if self.queues[q].dispatched >= 4 * max_dispatch {
                    break;
                }
            }

            // A sync queue relying on its idle window defers the whole
            // round while async writes sit in the driver.
            if self.queues[q].idle_window && self.rq_in_driver[0] > 0 {
                break;
            }

            if self.sync_flight > 0 && !self.queues[q].sync {
                break;
            }

            self.queues[q].wait_request = false;
            debug_assert!(self.idle_deadline_us.is_none());

            dispatched += self.dispatch_round(q, max_dispatch, now_us);
        }

        tracing::trace!(dispatched, "dispatch round done");
        dispatched
    }

    /// Drain everything regardless of budgets: barriers and scheduler
    /// swaps. Learned budgets reset to the default and the idle trees
    /// are pruned.
    pub fn forced_dispatch(&mut self) -> usize {
        if self.busy_queues == 0 && self.active_queue.is_none() {
            return 0;
        }

        if let Some(q) = self.active_queue {
            self.finish_expire(q);
        }

        let mut dispatched = 0;
        let busy: Vec<u32> = self
            .queues
            .iter()
            .filter(|(_, q)| q.busy)
            .map(|(id, _)| id)
            .collect();
        for q in busy {
            while let Some(next) = self.queues[q].next_rq {
                self.dispatch_insert(next);
                dispatched += 1;
            }
            debug_assert!(self.queues[q].fifo.is_empty());

            let autotune = self.cfg.max_budget == 0;
            self.queues[q].max_budget =
                default_budget(self.max_budget, self.queues[q].budgets_assigned, autotune);

            let entity = self.queues[q].entity;
            let group = self.entities[entity].group;
            let ci = self.entities[entity].prio.class.index();
            self.forget_idle(group, ci);
        }

        debug_assert_eq!(self.busy_queues, 0);
        tracing::debug!(dispatched, "forced drain");
        dispatched
    }

    /// Hand the dispatched requests to the embedder, in dispatch
    /// order.
    pub fn take_dispatched(&mut self) -> Vec<DispatchedRequest> {
        let ids: Vec<RequestId> = self.dispatch_list.drain(..).collect();
        ids.into_iter()
            .map(|rid| DispatchedRequest {
                id: rid,
                desc: self.requests[rid.0].desc,
            })
            .collect()
    }

    /// Consume the pending dispatch kick, if any. The embedder calls
    /// `dispatch` when this returns true.
    pub fn take_kick(&mut self) -> bool {
        std::mem::take(&mut self.kick_pending)
    }

    // -------------------------------------------------------------------------
    // Expiry
    // -------------------------------------------------------------------------

    /// Clear the under-service markers: unpin the producer context and
    /// disarm the idle timer.
    fn reset_active(&mut self) {
        if let Some(pid) = self.active_producer.take() {
            self.put_ioc_ref(pid);
        }
        self.active_queue = None;
        self.idle_deadline_us = None;
    }

    /// Detach the active queue from service and either unschedule it
    /// (empty) or requeue it with its finish synced to the service
    /// received.
    pub(crate) fn finish_expire(&mut self, q: u32) {
        debug_assert_eq!(self.active_queue, Some(q));
        self.reset_active();
        if self.queues[q].has_requests() {
            let entity = self.queues[q].entity;
            self.activate_entity(entity);
        } else {
            self.del_queue_busy(q, true);
        }
    }

    /// Budget feedback on expiry (sync queues learn; async queues
    /// always run at the device max), then resize the entity budget so
    /// the next activation covers the head request.
    fn recalc_budget(&mut self, q: u32, reason: ExpireReason) {
        debug_assert_eq!(self.active_queue, Some(q));
        let autotune = self.cfg.max_budget == 0;

        let budget = if self.queues[q].sync {
            if reason == ExpireReason::NoMoreRequests {
                return;
            }
            let default =
                default_budget(self.max_budget, self.queues[q].budgets_assigned, autotune);
            next_max_budget(self.queues[q].max_budget, reason, self.max_budget, default)
        } else {
            self.max_budget
        };
        self.queues[q].max_budget = budget;

        if self.queues[q].budgets_assigned >= BUDGETS_TRUSTED
            && autotune
            && self.queues[q].max_budget > self.max_budget
        {
            self.queues[q].max_budget = self.max_budget;
        }

        if let Some(next) = self.queues[q].next_rq {
            let sectors = self.requests[next.0].sectors();
            let entity = self.queues[q].entity;
            self.entities[entity].budget = self.queues[q].max_budget.max(sectors);
        }
        tracing::debug!(
            queue = self.queues[q].pid,
            budget = self.queues[q].max_budget,
            reason = reason.label(),
            "budget feedback"
        );
    }

    /// Expire the active queue.
    ///
    /// Feeds the peak-rate estimator with the measured slice
    /// (`compensate` ends the measurement at the idling start rather
    /// than now), reclassifies slow queues from "too idle" to "timed
    /// out", charges timeouts and async service their full budget so
    /// their finish reflects occupancy, applies budget feedback, and
    /// detaches the queue.
    pub(crate) fn expire_queue(
        &mut self,
        q: u32,
        compensate: bool,
        reason: ExpireReason,
        now_us: u64,
    ) {
        let mut reason = reason;
        let sync = self.queues[q].sync;

        let mut slow = false;
        if sync && !self.queues[q].budget_new {
            let end = if compensate {
                self.last_idling_start_us
            } else {
                now_us
            };
            let usecs = end.saturating_sub(self.last_budget_start_us);
            let entity = self.queues[q].entity;
            let autotune = self.cfg.max_budget == 0;
            slow = self.peak_rate.observe(
                self.entities[entity].service,
                usecs,
                self.entities[entity].budget,
                self.cfg.timeout_sync_ms,
                autotune,
                &mut self.max_budget,
            );
        }

        // A slow queue that looked idle is really seeky: bill it like
        // a timeout so its timestamps keep pace with well-behaved
        // queues.
        if slow && reason == ExpireReason::TooIdle {
            reason = ExpireReason::BudgetTimeout;
        }

        if reason == ExpireReason::BudgetTimeout || !sync {
            self.charge_full_budget(q);
        }

        tracing::debug!(
            queue = self.queues[q].pid,
            reason = reason.label(),
            slow,
            "expire"
        );

        self.recalc_budget(q, reason);
        self.finish_expire(q);
    }

    // -------------------------------------------------------------------------
    // Idling
    // -------------------------------------------------------------------------

    /// Arm the idle timer after the active sync queue's last pending
    /// request completed: wait briefly for its producer to come back
    /// with more nearby work. Seeky producers get only a token wait.
    fn arm_slice_timer(&mut self, now_us: u64) {
        let Some(q) = self.active_queue else {
            return;
        };
        debug_assert!(!self.queues[q].has_requests());

        if self.cfg.slice_idle_ms == 0 || !self.queues[q].idle_window {
            return;
        }
        let Some(pid) = self.active_producer else {
            return;
        };
        let Some(ctx) = self.contexts.get(&pid) else {
            return;
        };
        if ctx.live_tasks == 0 {
            return;
        }

        self.queues[q].wait_request = true;

        let mut sl = self.cfg.slice_idle_us();
        if ctx.seek.valid() && ctx.seek.is_seeky() {
            sl = sl.min(MIN_THINK_TIME_US);
        }

        self.last_idling_start_us = now_us;
        self.idle_deadline_us = Some(now_us + sl);
        tracing::trace!(queue = self.queues[q].pid, idle_us = sl, "idle armed");
    }

    /// Deadline of the armed idle timer, if any. The embedder fires
    /// [`on_idle_timer`](Scheduler::on_idle_timer) at or after it.
    #[must_use]
    pub fn idle_timer_deadline(&self) -> Option<u64> {
        self.idle_deadline_us
    }

    /// The idle timer fired: the producer did not come back in time.
    ///
    /// Tolerates racing with expiry or reactivation — if the queue the
    /// timer was armed for is gone, this degenerates to a dispatch
    /// kick.
    pub fn on_idle_timer(&mut self, now_us: u64) {
        self.idle_deadline_us = None;

        if let Some(q) = self.active_queue {
            let reason = if self.budget_timed_out(q, now_us) {
                ExpireReason::BudgetTimeout
            } else {
                ExpireReason::TooIdle
            };
            tracing::debug!(queue = self.queues[q].pid, "idle timer expired");
            self.expire_queue(q, true, reason, now_us);
        }

        self.schedule_kick();
    }

    // -------------------------------------------------------------------------
    // Driver notifications
    // -------------------------------------------------------------------------

    /// The driver started working on a dispatched request.
    pub fn activate_request(&mut self, rid: RequestId) -> crate::Result<()> {
        let rq = self
            .requests
            .get_mut(rid.0)
            .ok_or(crate::Error::UnknownRequest(rid.0))?;
        debug_assert_eq!(rq.state, RequestState::Dispatched);
        rq.state = RequestState::InDriver;
        let sync = rq.is_sync();
        let end = rq.end_sector();
        self.rq_in_driver[usize::from(sync)] += 1;
        self.last_position = end;
        Ok(())
    }

    /// The driver put a request back without completing it.
    pub fn deactivate_request(&mut self, rid: RequestId) -> crate::Result<()> {
        let rq = self
            .requests
            .get_mut(rid.0)
            .ok_or(crate::Error::UnknownRequest(rid.0))?;
        debug_assert_eq!(rq.state, RequestState::InDriver);
        rq.state = RequestState::Dispatched;
        let sync = rq.is_sync();
        debug_assert!(self.rq_in_driver[usize::from(sync)] > 0);
        self.rq_in_driver[usize::from(sync)] -= 1;
        Ok(())
    }

    /// A request completed in the driver.
    ///
    /// Updates queue-depth detection and the producer's completion
    /// stamp; on the active queue, starts the budget clock on the
    /// first completion, expires on wall-clock overrun, or arms the
    /// idle timer when the queue just drained.
    pub fn completed_request(&mut self, rid: RequestId, now_us: u64) -> crate::Result<()> {
        let rq = self
            .requests
            .get(rid.0)
            .ok_or(crate::Error::UnknownRequest(rid.0))?;
        debug_assert_eq!(rq.state, RequestState::InDriver);
        let sync = rq.is_sync();
        let q = rq.queue;
        let pid = rq.pid;

        self.hw_tag
            .observe(self.rq_in_driver[0] + self.rq_in_driver[1], self.queued);

        debug_assert!(self.rq_in_driver[usize::from(sync)] > 0);
        debug_assert!(self.queues[q].dispatched > 0);
        self.rq_in_driver[usize::from(sync)] -= 1;
        self.queues[q].dispatched -= 1;
        self.requests[rid.0].state = RequestState::Completed;

        if self.queues[q].sync {
            debug_assert!(self.sync_flight > 0);
            self.sync_flight -= 1;
        }

        if sync {
            if let Some(ctx) = self.contexts.get_mut(&pid) {
                ctx.last_end_request_us = now_us;
            }
        }

        if self.active_queue == Some(q) {
            if self.queues[q].budget_new {
                self.set_budget_timeout(q, now_us);
            }

            if self.budget_timed_out(q, now_us) {
                self.expire_queue(q, false, ExpireReason::BudgetTimeout, now_us);
            } else if sync
                && self.rq_in_driver[0] + self.rq_in_driver[1] == 0
                && !self.queues[q].has_requests()
            {
                self.arm_slice_timer(now_us);
            }
        }

        if self.rq_in_driver[0] + self.rq_in_driver[1] == 0 {
            self.schedule_kick();
        }
        Ok(())
    }

    /// Start the wall clock on a fresh activation: the timeout runs
    /// from the first completion, which is also when the rate
    /// measurement starts.
    fn set_budget_timeout(&mut self, q: u32, now_us: u64) {
        self.last_budget_start_us = now_us;
        self.queues[q].budget_new = false;
        let sync = self.queues[q].sync;
        self.queues[q].budget_timeout_us = now_us + self.cfg.timeout_us(sync);
    }
}
