//! The hierarchical fair-queueing engine.
//!
//! Groups form a tree rooted at the device's root group. Each group
//! owns one service tree per priority class; its children — leaf
//! queues and nested groups — are scheduled on those trees through
//! their entities.
//!
//! Every state change at a leaf propagates rootward:
//!
//! - **activation** walks up re-inserting each ancestor with a finish
//!   time computed from its budget and weight;
//! - **deactivation** walks up only while groups run out of
//!   backlogged children, parking finished entities on the idle tree
//!   so a returning entity keeps its virtual-time position;
//! - **service charging** adds the served sectors at every level and
//!   advances each level's class clock by `served / weight-sum`.
//!
//! Selection walks the other way: starting at the root, pick the
//! eligible entity with the smallest finish (classes in RT → BE →
//! IDLE order), extract it, and recurse into it if it is a group.

use serde::{Deserialize, Serialize};

use crate::entity::{vt_after, EntId, Payload, TreeMembership};
use crate::ioprio::{IoPrioClass, CLASS_COUNT, IOPRIO_LEVELS};
use crate::scheduler::Scheduler;
use crate::service_tree::{first_eligible, tree_extract, tree_first, tree_insert, ServiceTree};

/// Handle to a containment group in the scheduling hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub(crate) u32);

impl GroupId {
    /// Raw arena index, for log correlation.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Scheduling state a group owns for its children.
#[derive(Debug, Clone, Default)]
pub(crate) struct SchedData {
    /// The child entity currently extracted for service, if any.
    pub in_service: Option<EntId>,
    /// One service tree per priority class.
    pub trees: [ServiceTree; CLASS_COUNT],
}

impl SchedData {
    /// Whether any child still has an unfinished activation.
    #[must_use]
    pub(crate) fn has_backlog(&self) -> bool {
        self.in_service.is_some() || self.trees.iter().any(|t| !t.active.is_empty())
    }
}

/// An inner node of the hierarchy.
#[derive(Debug, Clone)]
pub(crate) struct Group {
    /// The group's own entity on its parent's trees. The root group's
    /// entity is a sentinel that is never scheduled.
    pub entity: EntId,
    pub sched: SchedData,
    /// Shared async queues, one per (RT/BE, level).
    pub async_queues: [[Option<u32>; IOPRIO_LEVELS]; 2],
    /// The single shared async queue of the idle class.
    pub async_idle: Option<u32>,
}

impl Group {
    pub(crate) fn async_slot(&mut self, class: IoPrioClass, level: u8) -> &mut Option<u32> {
        match class {
            IoPrioClass::Rt => &mut self.async_queues[0][level as usize],
            IoPrioClass::Be => &mut self.async_queues[1][level as usize],
            IoPrioClass::Idle => &mut self.async_idle,
        }
    }
}

impl Scheduler {
    // -------------------------------------------------------------------------
    // Entity activation
    // -------------------------------------------------------------------------

    /// Apply a pending priority/weight change, moving the entity's
    /// weight between class trees if needed. Returns the class index
    /// the entity now belongs to.
    fn apply_pending_prio(&mut self, id: EntId) -> usize {
        let group = self.entities[id].group;
        let old_ci = self.entities[id].prio.class.index();
        if !self.entities[id].prio_changed {
            return old_ci;
        }

        let on_st = self.entities[id].on_st;
        let old_weight = self.entities[id].weight;
        if on_st {
            self.groups[group].sched.trees[old_ci].wsum -= old_weight;
        }

        let new_prio = self.entities[id].new_prio;
        let new_weight = match self.entities[id].payload {
            Payload::Queue(_) => new_prio.weight(),
            Payload::Group(_) => self.entities[id].new_weight,
        };
        self.entities[id].prio = new_prio;
        self.entities[id].weight = new_weight;
        self.entities[id].prio_changed = false;

        let new_ci = new_prio.class.index();
        if on_st {
            self.groups[group].sched.trees[new_ci].wsum += new_weight;
        }
        if new_ci != old_ci {
            // A class switch starts over on the new class's clock.
            self.entities[id].start = self.groups[group].sched.trees[new_ci].vtime;
        }
        tracing::trace!(
            entity = id,
            weight = new_weight,
            class = new_prio.class.label(),
            "priority applied"
        );
        new_ci
    }

    /// One level of activation: (re)insert `id` into its group's
    /// active tree with a fresh finish time.
    fn activate_one(&mut self, id: EntId) {
        let group = self.entities[id].group;
        let ci = self.entities[id].prio.class.index();

        if self.groups[group].sched.in_service == Some(id) {
            // Requeue of the entity under service: pay for the service
            // actually received, then continue from there.
            debug_assert_eq!(self.entities[id].tree, TreeMembership::None);
            let service = self.entities[id].service;
            self.entities[id].calc_finish(service);
            let finish = self.entities[id].finish;
            self.entities[id].start = finish;
            self.groups[group].sched.in_service = None;
        } else {
            match self.entities[id].tree {
                TreeMembership::Active => {
                    // Requeue keeps the old start; only the finish moves.
                    tree_extract(
                        &mut self.entities,
                        &mut self.groups[group].sched.trees[ci].active,
                        id,
                    );
                    self.entities[id].tree = TreeMembership::None;
                }
                TreeMembership::Idle => {
                    tree_extract(
                        &mut self.entities,
                        &mut self.groups[group].sched.trees[ci].idle,
                        id,
                    );
                    self.entities[id].tree = TreeMembership::None;
                    let vtime = self.groups[group].sched.trees[ci].vtime;
                    let finish = self.entities[id].finish;
                    self.entities[id].start = if vt_after(vtime, finish) { vtime } else { finish };
                }
                TreeMembership::None => {
                    // First activation since it was forgotten: any old
                    // finish lies in the past, so start at the clock.
                    debug_assert!(!self.entities[id].on_st);
                    self.entities[id].start = self.groups[group].sched.trees[ci].vtime;
                    let weight = self.entities[id].weight;
                    self.groups[group].sched.trees[ci].wsum += weight;
                    self.entities[id].on_st = true;
                    if let Some(q) = self.entities[id].as_queue() {
                        self.queues[q].refs += 1;
                    }
                }
            }
        }

        let ci = self.apply_pending_prio(id);
        let budget = self.entities[id].budget;
        self.entities[id].calc_finish(budget);
        tree_insert(
            &mut self.entities,
            &mut self.groups[group].sched.trees[ci].active,
            id,
        );
        self.entities[id].tree = TreeMembership::Active;
    }

    /// Activate an entity and every ancestor up to the root.
    pub(crate) fn activate_entity(&mut self, id: EntId) {
        let mut id = id;
        loop {
            self.activate_one(id);
            let group = self.entities[id].group;
            if group == self.root.0 {
                break;
            }
            let parent = self.groups[group].entity;
            // The parent will serve this child next: its activation
            // must cover at least the child's budget.
            let child_budget = self.entities[id].budget;
            let parent_budget = if self.entities[parent].on_st {
                self.entities[parent].budget.max(child_budget)
            } else {
                child_budget
            };
            self.entities[parent].budget = parent_budget;
            id = parent;
        }
    }

    // -------------------------------------------------------------------------
    // Entity deactivation
    // -------------------------------------------------------------------------

    /// Drop an entity from the weight sum and release the tree's
    /// reference on its queue. May free the queue.
    pub(crate) fn forget_entity(&mut self, id: EntId) {
        debug_assert!(self.entities[id].on_st);
        debug_assert_eq!(self.entities[id].tree, TreeMembership::None);
        let group = self.entities[id].group;
        let ci = self.entities[id].prio.class.index();
        let weight = self.entities[id].weight;
        self.groups[group].sched.trees[ci].wsum -= weight;
        self.entities[id].on_st = false;
        if let Some(q) = self.entities[id].as_queue() {
            self.put_queue(q);
        }
    }

    /// Prune the idle tree: entities whose finish the class clock has
    /// reached no longer carry usable ordering information.
    pub(crate) fn forget_idle(&mut self, group: u32, ci: usize) {
        while let Some(first) = tree_first(
            &self.entities,
            &self.groups[group].sched.trees[ci].idle,
        ) {
            let vtime = self.groups[group].sched.trees[ci].vtime;
            if vt_after(self.entities[first].finish, vtime) {
                break;
            }
            tree_extract(
                &mut self.entities,
                &mut self.groups[group].sched.trees[ci].idle,
                first,
            );
            self.entities[first].tree = TreeMembership::None;
            self.forget_entity(first);
        }
    }

    /// One level of deactivation: take `id` out of service or off its
    /// tree, then park or forget it.
    fn deactivate_one(&mut self, id: EntId, requeue: bool) {
        debug_assert!(self.entities[id].on_st);
        let group = self.entities[id].group;
        let ci = self.entities[id].prio.class.index();

        if self.groups[group].sched.in_service == Some(id) {
            debug_assert_eq!(self.entities[id].tree, TreeMembership::None);
            let service = self.entities[id].service;
            self.entities[id].calc_finish(service);
            self.groups[group].sched.in_service = None;
        } else {
            match self.entities[id].tree {
                TreeMembership::Active => {
                    tree_extract(
                        &mut self.entities,
                        &mut self.groups[group].sched.trees[ci].active,
                        id,
                    );
                    self.entities[id].tree = TreeMembership::None;
                }
                TreeMembership::Idle => {
                    tree_extract(
                        &mut self.entities,
                        &mut self.groups[group].sched.trees[ci].idle,
                        id,
                    );
                    self.entities[id].tree = TreeMembership::None;
                }
                TreeMembership::None => {
                    debug_assert!(false, "on_st entity is on no tree and not in service");
                }
            }
        }

        let vtime = self.groups[group].sched.trees[ci].vtime;
        let finish = self.entities[id].finish;
        if !requeue || !vt_after(finish, vtime) {
            self.forget_entity(id);
        } else {
            tree_insert(
                &mut self.entities,
                &mut self.groups[group].sched.trees[ci].idle,
                id,
            );
            self.entities[id].tree = TreeMembership::Idle;
        }
    }

    /// Deactivate an entity, walking rootward while groups empty out.
    ///
    /// A group that still has backlogged children after losing its
    /// in-service child is put back on its parent's active tree, so
    /// the remaining children stay reachable from the root.
    pub(crate) fn deactivate_entity(&mut self, id: EntId, requeue: bool) {
        let mut id = id;
        loop {
            if !self.entities[id].on_st {
                break;
            }
            let group = self.entities[id].group;
            self.deactivate_one(id, requeue);
            if group == self.root.0 {
                break;
            }
            let parent = self.groups[group].entity;
            if self.groups[group].sched.has_backlog() {
                let parent_group = self.entities[parent].group;
                if self.groups[parent_group].sched.in_service == Some(parent) {
                    self.activate_entity(parent);
                }
                break;
            }
            id = parent;
        }
    }

    // -------------------------------------------------------------------------
    // Service charging
    // -------------------------------------------------------------------------

    /// Charge `served` sectors to a leaf entity and every ancestor,
    /// advancing each level's class clock.
    pub(crate) fn entity_served(&mut self, leaf: EntId, served: u64) {
        let mut id = leaf;
        loop {
            let group = self.entities[id].group;
            let ci = self.entities[id].prio.class.index();

            self.entities[id].service += served;
            match self.entities[id].payload {
                Payload::Queue(_) => {
                    debug_assert!(
                        self.entities[id].service <= self.entities[id].budget,
                        "queue charged past its budget"
                    );
                }
                Payload::Group(_) => {
                    // Groups track whatever their children consumed.
                    let service = self.entities[id].service;
                    if service > self.entities[id].budget {
                        self.entities[id].budget = service;
                    }
                }
            }

            let wsum = self.groups[group].sched.trees[ci].wsum;
            debug_assert!(wsum > 0, "service charged on an empty tree");
            if wsum > 0 {
                let delta = crate::entity::vt_delta(served, wsum);
                let st = &mut self.groups[group].sched.trees[ci];
                st.vtime = st.vtime.wrapping_add(delta);
            }
            self.forget_idle(group, ci);

            if group == self.root.0 {
                break;
            }
            id = self.groups[group].entity;
        }
    }

    /// Charge the queue as if it had consumed its whole budget. Used
    /// on timeouts so seeky queues pay in the time domain what they
    /// did not consume in the service domain.
    pub(crate) fn charge_full_budget(&mut self, queue: u32) {
        let entity = self.queues[queue].entity;
        let left = self.entities[entity].budget_left();
        if left > 0 {
            self.entity_served(entity, left);
        }
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// Pick and extract the next entity to serve at one group, walking
    /// the class trees in strict RT → BE → IDLE order.
    fn lookup_next_entity(&mut self, group: u32) -> Option<EntId> {
        for class in IoPrioClass::IN_SERVICE_ORDER {
            let ci = class.index();
            if self.groups[group].sched.trees[ci].active.is_empty() {
                continue;
            }
            {
                let (entities, groups) = (&self.entities, &mut self.groups);
                groups[group].sched.trees[ci].update_vtime(entities);
            }
            self.forget_idle(group, ci);

            let vtime = self.groups[group].sched.trees[ci].vtime;
            let Some(id) = first_eligible(
                &self.entities,
                &self.groups[group].sched.trees[ci].active,
                vtime,
            ) else {
                debug_assert!(false, "active tree exposes no eligible entity");
                continue;
            };

            tree_extract(
                &mut self.entities,
                &mut self.groups[group].sched.trees[ci].active,
                id,
            );
            self.entities[id].tree = TreeMembership::None;
            self.groups[group].sched.in_service = Some(id);
            return Some(id);
        }
        None
    }

    /// Walk the hierarchy from the root and return the next leaf
    /// queue to serve, extracting the whole path for service.
    pub(crate) fn get_next_queue(&mut self) -> Option<u32> {
        if self.busy_queues == 0 {
            return None;
        }
        let mut group = self.root.0;
        loop {
            let id = self.lookup_next_entity(group)?;
            self.entities[id].service = 0;
            match self.entities[id].payload {
                Payload::Queue(q) => return Some(q),
                Payload::Group(g) => group = g,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Busy bookkeeping
    // -------------------------------------------------------------------------

    /// A queue gained its first pending request: schedule it.
    pub(crate) fn add_queue_busy(&mut self, queue: u32) {
        debug_assert!(!self.queues[queue].busy);
        self.queues[queue].busy = true;
        self.busy_queues += 1;
        let entity = self.queues[queue].entity;
        tracing::debug!(queue = self.queues[queue].pid, "busy");
        self.activate_entity(entity);
    }

    /// A queue ran out of pending requests (or is being torn down):
    /// unschedule it.
    pub(crate) fn del_queue_busy(&mut self, queue: u32, requeue: bool) {
        debug_assert!(self.queues[queue].busy);
        self.queues[queue].busy = false;
        self.busy_queues -= 1;
        let entity = self.queues[queue].entity;
        tracing::debug!(queue = self.queues[queue].pid, "no longer busy");
        self.deactivate_entity(entity, requeue);
    }

    // -------------------------------------------------------------------------
    // Group management
    // -------------------------------------------------------------------------

    /// Create a containment group under `parent` (the root group when
    /// `None`) with the given fair-share weight.
    pub fn add_group(&mut self, parent: Option<GroupId>, weight: u64) -> crate::Result<GroupId> {
        let parent = parent.unwrap_or(self.root);
        if self.groups.get(parent.0).is_none() {
            return Err(crate::Error::UnknownGroup(parent.0));
        }
        let weight = weight.max(1);

        let gid = self.groups.insert(Group {
            entity: 0,
            sched: SchedData::default(),
            async_queues: [[None; IOPRIO_LEVELS]; 2],
            async_idle: None,
        });
        let entity = self
            .entities
            .insert(crate::entity::Entity::new_group(gid, parent.0, weight));
        self.groups[gid].entity = entity;
        tracing::debug!(group = gid, parent = parent.0, weight, "group added");
        Ok(GroupId(gid))
    }

    /// Vtime of one class tree at the root group, for observability.
    #[must_use]
    pub fn root_vtime(&self, class: IoPrioClass) -> u64 {
        self.groups[self.root.0].sched.trees[class.index()].vtime
    }

    /// Sum of idle-tree sizes across the hierarchy, for tests and
    /// stats.
    pub(crate) fn idle_tree_population(&self) -> usize {
        let mut count = 0;
        for (_, group) in self.groups.iter() {
            for tree in &group.sched.trees {
                let mut stack = vec![];
                if let Some(r) = tree.idle.root {
                    stack.push(r);
                }
                while let Some(n) = stack.pop() {
                    count += 1;
                    if let Some(l) = self.entities[n].node.left {
                        stack.push(l);
                    }
                    if let Some(r) = self.entities[n].node.right {
                        stack.push(r);
                    }
                }
            }
        }
        count
    }
}
