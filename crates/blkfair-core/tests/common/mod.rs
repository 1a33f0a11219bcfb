//! Shared test rig: a scripted clock, a fake driver, and submission
//! helpers around a [`Scheduler`].

use blkfair_core::{
    Direction, DispatchedRequest, GroupId, RequestDesc, RequestId, SchedConfig, Scheduler,
};

/// Scheduler plus a simulated driver with an explicit clock.
pub struct Rig {
    pub sched: Scheduler,
    pub now: u64,
    /// Requests handed to the "driver", oldest first.
    pub inflight: Vec<DispatchedRequest>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(SchedConfig::default())
    }

    pub fn with_config(cfg: SchedConfig) -> Self {
        Self {
            sched: Scheduler::new(cfg),
            now: 1_000_000,
            inflight: Vec::new(),
        }
    }

    pub fn advance(&mut self, us: u64) {
        self.now += us;
    }

    pub fn read(sector: u64, sectors: u64) -> RequestDesc {
        RequestDesc {
            sector,
            sectors,
            dir: Direction::Read,
            sync: true,
            meta: false,
        }
    }

    pub fn write(sector: u64, sectors: u64) -> RequestDesc {
        RequestDesc {
            sector,
            sectors,
            dir: Direction::Write,
            sync: false,
            meta: false,
        }
    }

    pub fn submit(&mut self, pid: u32, desc: RequestDesc) -> RequestId {
        self.submit_in(pid, None, desc)
    }

    pub fn submit_in(&mut self, pid: u32, group: Option<GroupId>, desc: RequestDesc) -> RequestId {
        let rid = self
            .sched
            .set_request(pid, group, desc, self.now)
            .expect("set_request");
        self.sched.insert_request(rid, self.now).expect("insert");
        rid
    }

    /// One dispatch round: schedule, then hand everything to the
    /// driver.
    pub fn pump(&mut self) -> Vec<DispatchedRequest> {
        self.sched.dispatch(self.now);
        let batch = self.sched.take_dispatched();
        for r in &batch {
            self.sched.activate_request(r.id).expect("activate");
        }
        self.inflight.extend(batch.iter().copied());
        batch
    }

    /// Complete the oldest in-flight request `service_us` later.
    pub fn complete_one(&mut self, service_us: u64) -> Option<DispatchedRequest> {
        if self.inflight.is_empty() {
            return None;
        }
        let r = self.inflight.remove(0);
        self.advance(service_us);
        self.sched.completed_request(r.id, self.now).expect("complete");
        self.sched.put_request(r.id).expect("put");
        Some(r)
    }

    /// Fire the idle timer if one is armed, jumping the clock to its
    /// deadline. Returns whether a timer fired.
    pub fn fire_idle_timer(&mut self) -> bool {
        let Some(deadline) = self.sched.idle_timer_deadline() else {
            return false;
        };
        if self.now < deadline {
            self.now = deadline;
        }
        self.sched.on_idle_timer(self.now);
        true
    }

    /// Drive everything to completion with a uniform per-request
    /// service time. Returns the dispatch order.
    pub fn drain(&mut self, service_us: u64) -> Vec<DispatchedRequest> {
        let mut order = Vec::new();
        for _ in 0..100_000 {
            let batch = self.pump();
            order.extend(batch.iter().copied());

            if !self.inflight.is_empty() {
                while self.complete_one(service_us).is_some() {}
                continue;
            }
            if self.sched.queue_empty() {
                if !self.fire_idle_timer() {
                    return order;
                }
                continue;
            }
            // Requests queued but nothing dispatched: the engine is
            // idling for a producer that will not come back.
            assert!(
                self.fire_idle_timer(),
                "stalled with {} requests queued",
                self.sched.stats().queued
            );
        }
        panic!("drain did not converge");
    }
}
