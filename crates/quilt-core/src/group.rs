// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Patch groups: user-visible, orderable aggregates of patches.
//!
//! A group collects every patch submitted while it is *engaged* and lets
//! callers impose commit ordering between whole groups. The machinery is a
//! small set of no-op anchors spliced into the patch graph:
//!
//! - each group has a `head` (depends transitively on everything submitted
//!   while the group was engaged) and a `tail` (transitively depended on by
//!   the same set), pinned by `head_keep`/`tail_keep` no-ops so they cannot
//!   drain prematurely;
//! - each scope has a `top` (everything submitted while any group is
//!   engaged ends up below it) and a `bottom` (every new patch inherits it
//!   as a prefix), recomputed whenever the engaged set changes.
//!
//! Group-level `add_depend(after, before)` becomes one graph edge from
//! `after`'s tail to `before`'s head. The anchors exist from creation, so
//! groups can be ordered before any patch is written into them.
//!
//! Atomic groups additionally hold the journal's transaction open while
//! engaged, so one transaction commits the whole group or none of it. At
//! most one atomic group exists at a time.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;

use crate::config::Config;
use crate::graph::{GraphError, PatchGraph, ScopeHooks};
use crate::id::{GroupId, PatchId};
use crate::journal::JournalHolds;
use crate::patch::{PatchFlags, PatchSlot};

bitflags! {
    /// Patch group creation flags.
    pub struct GroupFlags: u32 {
        /// All-or-nothing: the group commits in a single journal
        /// transaction.
        const ATOMIC = 0x01;
    }
}

/// Errors surfaced by the group layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GroupError {
    /// The group id is not present in this scope.
    #[error("patch group not found in scope")]
    NotFound,
    /// The group is engaged (or otherwise busy) in a way that forbids the
    /// operation.
    #[error("patch group busy")]
    Busy,
    /// The operation is invalid for the group's current state.
    #[error("invalid patch group state")]
    Invalid,
    /// An atomic group already exists.
    #[error("an atomic patch group already exists")]
    AtomicExists,
    /// The underlying graph rejected an edge.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Process-wide group state shared by every scope: the patch graph, the
/// journal hold counter, and the single-atomic-group rule.
pub struct GroupEnv {
    graph: Rc<PatchGraph>,
    holds: Rc<JournalHolds>,
    allow_atomic: bool,
    atomic_exists: Cell<bool>,
    masquerade: Cell<u32>,
}

impl GroupEnv {
    /// Creates the shared group environment.
    #[must_use]
    pub fn new(graph: Rc<PatchGraph>, holds: Rc<JournalHolds>, config: &Config) -> Rc<Self> {
        Rc::new(Self {
            graph,
            holds,
            allow_atomic: config.atomic_patchgroups_allowed,
            atomic_exists: Cell::new(false),
            masquerade: Cell::new(0),
        })
    }

    /// The shared patch graph.
    #[must_use]
    pub fn graph(&self) -> &Rc<PatchGraph> {
        &self.graph
    }

    /// Whether an atomic group currently exists.
    #[must_use]
    pub fn atomic_exists(&self) -> bool {
        self.atomic_exists.get()
    }

    /// Makes [`Scope::engaged_any`] report true regardless of engagement,
    /// for hosts replaying work on behalf of an external scope.
    pub fn masquerade(&self) {
        self.masquerade.set(self.masquerade.get() + 1);
    }

    /// Undoes one [`GroupEnv::masquerade`].
    pub fn demasquerade(&self) {
        let n = self.masquerade.get();
        assert!(n > 0, "demasquerade without masquerade");
        self.masquerade.set(n - 1);
    }
}

struct PatchGroup {
    id: GroupId,
    head: PatchSlot,
    /// Stays until the group gains an after.
    head_keep: Cell<Option<PatchId>>,
    tail: PatchSlot,
    /// Stays until the group is released.
    tail_keep: Cell<Option<PatchId>>,
    references: Cell<u32>,
    /// Engagements across every scope holding this group.
    engaged_total: Cell<u32>,
    /// Set on first engage: the group may acquire data at any time.
    has_data: Cell<bool>,
    is_released: Cell<bool>,
    has_afters: Cell<bool>,
    has_befores: Cell<bool>,
    flags: GroupFlags,
}

struct GroupState {
    group: Rc<PatchGroup>,
    engaged: Cell<bool>,
}

/// A per-control-flow context mapping group ids to groups and holding the
/// derived top/bottom anchors.
pub struct Scope {
    env: Rc<GroupEnv>,
    next_id: Cell<u64>,
    map: RefCell<FxHashMap<GroupId, GroupState>>,
    top: Cell<Option<PatchId>>,
    /// Stays until the engaged set changes.
    top_keep: Cell<Option<PatchId>>,
    bottom: PatchSlot,
    engaged_count: Cell<u32>,
}

impl Scope {
    /// Creates an empty scope.
    #[must_use]
    pub fn new(env: Rc<GroupEnv>) -> Rc<Self> {
        Rc::new(Self {
            env,
            next_id: Cell::new(1),
            map: RefCell::new(FxHashMap::default()),
            top: Cell::new(None),
            top_keep: Cell::new(None),
            bottom: PatchSlot::new(),
            engaged_count: Cell::new(0),
        })
    }

    /// Installs this scope as the graph's current scope, so data-patch
    /// creation picks up its top/bottom anchors.
    pub fn make_current(self: &Rc<Self>) {
        let weak: Weak<Self> = Rc::downgrade(self);
        let weak: Weak<dyn ScopeHooks> = weak;
        self.env.graph.set_scope(Some(weak));
    }

    /// Clears the graph's current scope.
    pub fn clear_current(&self) {
        self.env.graph.set_scope(None);
    }

    /// Number of groups known to this scope.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    /// Whether this scope holds no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    /// Whether any group is engaged here (or a masquerade is active).
    #[must_use]
    pub fn engaged_any(&self) -> bool {
        self.engaged_count.get() > 0 || self.env.masquerade.get() > 0
    }

    /// Whether `id` names a group in this scope.
    #[must_use]
    pub fn contains(&self, id: GroupId) -> bool {
        self.map.borrow().contains_key(&id)
    }

    /// Whether `id` is engaged in this scope.
    pub fn is_engaged(&self, id: GroupId) -> Result<bool, GroupError> {
        self.map
            .borrow()
            .get(&id)
            .map(|state| state.engaged.get())
            .ok_or(GroupError::NotFound)
    }

    /// Creates a group with a fresh id in this scope.
    ///
    /// Only one atomic group may exist at a time, and only when the
    /// configuration allows atomic groups at all.
    pub fn create(&self, flags: GroupFlags) -> Result<GroupId, GroupError> {
        if flags.contains(GroupFlags::ATOMIC) {
            if !self.env.allow_atomic {
                return Err(GroupError::Invalid);
            }
            if self.env.atomic_exists.get() {
                return Err(GroupError::AtomicExists);
            }
            self.env.atomic_exists.set(true);
        }
        let graph = &self.env.graph;
        let id = GroupId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);

        let head_keep = graph.create_noop(None, None, &[]);
        graph.claim_noop(head_keep);
        let tail_keep = graph.create_noop(None, None, &[]);
        graph.claim_noop(tail_keep);
        let tail = graph.create_noop(None, None, &[tail_keep]);
        let head = graph.create_noop(None, None, &[head_keep]);

        let group = PatchGroup {
            id,
            head: PatchSlot::new(),
            head_keep: Cell::new(Some(head_keep)),
            tail: PatchSlot::new(),
            tail_keep: Cell::new(Some(tail_keep)),
            references: Cell::new(1),
            engaged_total: Cell::new(0),
            has_data: Cell::new(false),
            is_released: Cell::new(false),
            has_afters: Cell::new(false),
            has_befores: Cell::new(false),
            flags,
        };
        graph.weak_retain(Some(head), &group.head);
        graph.weak_retain(Some(tail), &group.tail);

        self.map.borrow_mut().insert(
            id,
            GroupState {
                group: Rc::new(group),
                engaged: Cell::new(false),
            },
        );
        trace!(?id, ?flags, "patch group created");
        Ok(id)
    }

    fn group(&self, id: GroupId) -> Result<Rc<PatchGroup>, GroupError> {
        self.map
            .borrow()
            .get(&id)
            .map(|state| Rc::clone(&state.group))
            .ok_or(GroupError::NotFound)
    }

    /// Orders `after` to commit no earlier than `before`.
    ///
    /// `before` must not be engaged anywhere (unless atomic); `after` must
    /// not be released and must not already have afters of its own
    /// recorded against it. Cycles at the graph level are rejected.
    pub fn add_depend(&self, after: GroupId, before: GroupId) -> Result<(), GroupError> {
        let after = self.group(after)?;
        let before = self.group(before)?;
        if !before.flags.contains(GroupFlags::ATOMIC) && before.engaged_total.get() > 0 {
            return Err(GroupError::Busy);
        }
        debug_assert_eq!(before.tail_keep.get().is_none(), before.is_released.get());
        if after.is_released.get() || after.has_afters.get() {
            return Err(GroupError::Invalid);
        }
        let graph = &self.env.graph;

        // Connect before's head to its tail, but only when they are not
        // already transitively connected: head having only head_keep as a
        // dependency means nothing was ever written under this group.
        if let (Some(head), Some(tail)) = (before.head.get(), before.tail.get()) {
            let head_befores = graph.befores(head);
            if head_befores.len() == 1 && Some(head_befores[0]) == before.head_keep.get() {
                graph.add_depend(head, tail)?;
            }
        }
        // The head may be gone if the group already reached the disk; it
        // will not be engaged again (it has afters now), so nothing needs
        // recreating.
        if let Some(before_head) = before.head.get() {
            let after_tail = after.tail.get().ok_or(GroupError::Invalid)?;
            graph.add_depend(after_tail, before_head)?;
        }

        after.has_befores.set(true);
        before.has_afters.set(true);
        if let Some(head_keep) = before.head_keep.take() {
            graph.satisfy(head_keep);
        }
        trace!(after = ?after.id, before = ?before.id, "group ordering added");
        Ok(())
    }

    /// Engages a group: everything submitted from now on (in this scope)
    /// lands inside it.
    pub fn engage(&self, id: GroupId) -> Result<(), GroupError> {
        let group = self.group(id)?;
        let atomic = group.flags.contains(GroupFlags::ATOMIC);
        if !atomic && group.is_released.get() {
            return Err(GroupError::Invalid);
        }
        if !atomic && group.has_afters.get() {
            return Err(GroupError::Busy);
        }
        if atomic && group.is_released.get() {
            return Err(GroupError::Invalid);
        }
        {
            let map = self.map.borrow();
            let state = map.get(&id).ok_or(GroupError::NotFound)?;
            if state.engaged.get() {
                return Ok(());
            }
            state.engaged.set(true);
        }
        group.engaged_total.set(group.engaged_total.get() + 1);
        self.engaged_count.set(self.engaged_count.get() + 1);

        if let Err(e) = self.update_top_bottom(id, false) {
            let map = self.map.borrow();
            if let Some(state) = map.get(&id) {
                state.engaged.set(false);
            }
            group.engaged_total.set(group.engaged_total.get() - 1);
            self.engaged_count.set(self.engaged_count.get() - 1);
            return Err(e);
        }

        if atomic && !group.has_data.get() {
            // Keep the journal's transaction open while atomic work is
            // outstanding.
            self.env.holds.add();
        }
        group.has_data.set(true);
        trace!(?id, "group engaged");
        Ok(())
    }

    /// Disengages a group. Does not release any journal hold.
    pub fn disengage(&self, id: GroupId) -> Result<(), GroupError> {
        let group = self.group(id)?;
        {
            let map = self.map.borrow();
            let state = map.get(&id).ok_or(GroupError::NotFound)?;
            if !state.engaged.get() {
                return Ok(());
            }
            state.engaged.set(false);
        }
        group.engaged_total.set(group.engaged_total.get() - 1);
        self.engaged_count.set(self.engaged_count.get() - 1);

        if let Err(e) = self.update_top_bottom(id, true) {
            let map = self.map.borrow();
            if let Some(state) = map.get(&id) {
                state.engaged.set(true);
            }
            group.engaged_total.set(group.engaged_total.get() + 1);
            self.engaged_count.set(self.engaged_count.get() + 1);
            return Err(e);
        }
        trace!(?id, "group disengaged");
        Ok(())
    }

    /// Releases a group: freezes its tail so nothing further can join it.
    /// For atomic groups this also removes the journal hold.
    pub fn release(&self, id: GroupId) -> Result<(), GroupError> {
        let group = self.group(id)?;
        if group.flags.contains(GroupFlags::ATOMIC) && group.engaged_total.get() > 0 {
            return Err(GroupError::Invalid);
        }
        self.release_group(&group);
        Ok(())
    }

    fn release_group(&self, group: &PatchGroup) {
        if let Some(tail_keep) = group.tail_keep.take() {
            self.env.graph.satisfy(tail_keep);
            // The hold exists only once the group has engaged.
            if group.flags.contains(GroupFlags::ATOMIC) && group.has_data.get() {
                self.env.holds.remove();
            }
            group.is_released.set(true);
            trace!(id = ?group.id, "group released");
        }
    }

    /// Drops this scope's reference to a group. The last abandon releases
    /// the group (when legal) and lets its head percolate into the write
    /// stream.
    pub fn abandon(&self, id: GroupId) -> Result<(), GroupError> {
        {
            let map = self.map.borrow();
            let state = map.get(&id).ok_or(GroupError::NotFound)?;
            if state.group.flags.contains(GroupFlags::ATOMIC) && !state.group.is_released.get() {
                return Err(GroupError::Invalid);
            }
            if state.engaged.get() {
                return Err(GroupError::Busy);
            }
        }
        let state = self
            .map
            .borrow_mut()
            .remove(&id)
            .ok_or(GroupError::NotFound)?;
        let group = state.group;
        group.references.set(group.references.get() - 1);
        if group.references.get() == 0 {
            if group.flags.contains(GroupFlags::ATOMIC) {
                debug_assert!(self.env.atomic_exists.get());
                self.env.atomic_exists.set(false);
            }
            if group.tail_keep.get().is_some() || !group.is_released.get() {
                // Rolling an abandoned group's data back is unimplemented;
                // abandoning unwritten data is a caller bug.
                assert!(
                    !group.has_data.get(),
                    "cannot roll back an abandoned patch group with data"
                );
                self.release_group(&group);
            }
            let graph = &self.env.graph;
            if let Some(head_keep) = group.head_keep.take() {
                graph.satisfy(head_keep);
            }
            graph.weak_release(&group.head);
            graph.weak_release(&group.tail);
        }
        trace!(?id, "group abandoned");
        Ok(())
    }

    /// Deep-copies this scope: same group ids, bumped reference and
    /// engagement counts, fresh top anchors, shared bottom.
    #[must_use]
    pub fn copy(&self) -> Rc<Self> {
        let copy = Self::new(Rc::clone(&self.env));
        copy.next_id.set(self.next_id.get());
        let graph = &self.env.graph;

        if self.top.get().is_some() {
            let top_keep = graph.create_noop(None, None, &[]);
            graph.claim_noop(top_keep);
            let top = graph.create_noop(None, None, &[top_keep]);
            graph.set_flags(top, PatchFlags::NO_PATCHGROUP);
            copy.top_keep.set(Some(top_keep));
            copy.top.set(Some(top));
        }
        graph.weak_retain(self.bottom.get(), &copy.bottom);

        let mut copied = copy.map.borrow_mut();
        for (&id, state) in self.map.borrow().iter() {
            let group = Rc::clone(&state.group);
            group.references.set(group.references.get() + 1);
            if state.engaged.get() {
                group.engaged_total.set(group.engaged_total.get() + 1);
                copy.engaged_count.set(copy.engaged_count.get() + 1);
            }
            copied.insert(
                id,
                GroupState {
                    group,
                    engaged: Cell::new(state.engaged.get()),
                },
            );
        }
        drop(copied);
        debug_assert_eq!(copy.engaged_count.get(), self.engaged_count.get());
        copy
    }

    /// Disengages and abandons every group, then drops the scope anchors.
    pub fn close(&self) {
        let ids: Vec<GroupId> = self.map.borrow().keys().copied().collect();
        for id in ids {
            let _ = self.disengage(id);
            if let Ok(group) = self.group(id) {
                // An unreleased atomic group cannot be abandoned; release
                // it now that it is disengaged.
                if group.flags.contains(GroupFlags::ATOMIC) && !group.is_released.get() {
                    self.release_group(&group);
                }
            }
            let _ = self.abandon(id);
        }
        let graph = &self.env.graph;
        if let Some(top_keep) = self.top_keep.take() {
            graph.satisfy(top_keep);
        }
        self.top.set(None);
        graph.weak_release(&self.bottom);
    }

    /// Recomputes the scope's top/bottom anchors after the engaged set
    /// changed. `was_engaged` is `changed`'s engagement before the change.
    fn update_top_bottom(&self, changed: GroupId, was_engaged: bool) -> Result<(), GroupError> {
        let graph = &self.env.graph;
        let save_top = self.top.get();

        // Attach engaged groups' heads to the retiring top — but only when
        // the top actually accumulated work (more than its keep).
        if let Some(top) = save_top {
            let top_befores = graph.befores(top);
            let only_keep = top_befores.len() == 1 && Some(top_befores[0]) == self.top_keep.get();
            if !only_keep {
                for (&id, state) in self.map.borrow().iter() {
                    let engaged = if id == changed {
                        was_engaged
                    } else {
                        state.engaged.get()
                    };
                    if !engaged {
                        continue;
                    }
                    let head = state.group.head.get();
                    debug_assert!(head.is_some() && state.group.head_keep.get().is_some());
                    if let Some(head) = head {
                        graph.add_depend(head, top)?;
                    }
                }
            }
        }

        // Fresh anchors for the new engaged set.
        let top_keep = graph.create_noop(None, None, &[]);
        graph.claim_noop(top_keep);
        let bottom = graph.create_noop(None, None, &[]);

        let mut engaged_groups = 0u32;
        for state in self.map.borrow().values() {
            if !state.engaged.get() {
                continue;
            }
            if let Some(tail) = state.group.tail.get() {
                graph.add_depend(bottom, tail)?;
            }
            engaged_groups += 1;
        }

        let top = graph.create_noop(None, None, &[top_keep]);
        graph.set_flags(top, PatchFlags::NO_PATCHGROUP);

        // A bottom with no tails under it is useless; leave it to the free
        // list and clear the anchor.
        let bottom = if graph.befores(bottom).is_empty() {
            None
        } else {
            Some(bottom)
        };
        graph.weak_retain(bottom, &self.bottom);

        let (top, top_keep) = if engaged_groups == 0 {
            graph.satisfy(top_keep);
            (None, None)
        } else {
            (Some(top), Some(top_keep))
        };

        self.top.set(top);
        if let Some(old_keep) = self.top_keep.take() {
            graph.satisfy(old_keep);
        }
        self.top_keep.set(top_keep);
        Ok(())
    }
}

impl ScopeHooks for Scope {
    /// Merges the scope's bottom into the caller's head so every new patch
    /// inherits "everything engaged comes before me".
    fn prepare_head(&self, head: &mut Option<PatchId>) -> Result<(), GraphError> {
        let Some(bottom) = self.bottom.get() else {
            return Ok(());
        };
        let graph = &self.env.graph;
        match *head {
            None => *head = Some(bottom),
            Some(h) if h == bottom => {}
            Some(h) => {
                // Cheap reuse checks before building a join no-op.
                if graph.befores(h).first() == Some(&bottom) {
                    return Ok(());
                }
                if graph.befores(bottom).first() == Some(&h) {
                    *head = Some(bottom);
                    return Ok(());
                }
                *head = Some(graph.create_noop(None, None, &[bottom, h]));
            }
        }
        Ok(())
    }

    /// Hangs the freshly created head below the scope's top.
    fn finish_head(&self, head: PatchId) -> Result<(), GraphError> {
        let Some(top) = self.top.get() else {
            return Ok(());
        };
        if Some(head) == self.bottom.get() {
            return Ok(());
        }
        if self
            .env
            .graph
            .flags(head)
            .contains(PatchFlags::NO_PATCHGROUP)
        {
            return Ok(());
        }
        self.env.graph.add_depend(top, head)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn env() -> Rc<GroupEnv> {
        GroupEnv::new(
            Rc::new(PatchGraph::new()),
            JournalHolds::new(),
            &Config::default(),
        )
    }

    #[test]
    fn atomic_groups_are_singletons() {
        let env = env();
        let scope = Scope::new(Rc::clone(&env));
        let a = scope.create(GroupFlags::ATOMIC).unwrap();
        assert_eq!(
            scope.create(GroupFlags::ATOMIC).unwrap_err(),
            GroupError::AtomicExists
        );
        scope.release(a).unwrap();
        scope.abandon(a).unwrap();
        assert!(!env.atomic_exists());
        // Gone: a new atomic group may exist again.
        let b = scope.create(GroupFlags::ATOMIC).unwrap();
        scope.release(b).unwrap();
        scope.abandon(b).unwrap();
    }

    #[test]
    fn atomic_disallowed_by_config() {
        let config = Config {
            atomic_patchgroups_allowed: false,
            ..Config::default()
        };
        let env = GroupEnv::new(Rc::new(PatchGraph::new()), JournalHolds::new(), &config);
        let scope = Scope::new(env);
        assert_eq!(
            scope.create(GroupFlags::ATOMIC).unwrap_err(),
            GroupError::Invalid
        );
    }

    #[test]
    fn engage_released_group_is_invalid() {
        let env = env();
        let scope = Scope::new(env);
        let g = scope.create(GroupFlags::empty()).unwrap();
        scope.release(g).unwrap();
        assert_eq!(scope.engage(g).unwrap_err(), GroupError::Invalid);
    }

    #[test]
    fn engage_with_afters_is_busy() {
        let env = env();
        let scope = Scope::new(env);
        let before = scope.create(GroupFlags::empty()).unwrap();
        let after = scope.create(GroupFlags::empty()).unwrap();
        scope.add_depend(after, before).unwrap();
        // `before` gained an after; engaging it would lose the ordering.
        assert_eq!(scope.engage(before).unwrap_err(), GroupError::Busy);
        // `after` is fine to engage.
        scope.engage(after).unwrap();
        scope.disengage(after).unwrap();
    }

    #[test]
    fn add_depend_rejects_engaged_before() {
        let env = env();
        let scope = Scope::new(env);
        let a = scope.create(GroupFlags::empty()).unwrap();
        let b = scope.create(GroupFlags::empty()).unwrap();
        scope.engage(b).unwrap();
        assert_eq!(scope.add_depend(a, b).unwrap_err(), GroupError::Busy);
        scope.disengage(b).unwrap();
    }

    #[test]
    fn atomic_engage_places_and_release_removes_hold() {
        let holds = JournalHolds::new();
        let env = GroupEnv::new(
            Rc::new(PatchGraph::new()),
            Rc::clone(&holds),
            &Config::default(),
        );
        let scope = Scope::new(env);
        let g = scope.create(GroupFlags::ATOMIC).unwrap();
        assert!(!holds.active());
        scope.engage(g).unwrap();
        assert!(holds.active());
        // Re-engaging or disengaging does not double-count the hold.
        scope.disengage(g).unwrap();
        scope.engage(g).unwrap();
        assert!(holds.active());
        // Cannot release while engaged.
        assert_eq!(scope.release(g).unwrap_err(), GroupError::Invalid);
        scope.disengage(g).unwrap();
        scope.release(g).unwrap();
        assert!(!holds.active());
        scope.abandon(g).unwrap();
    }

    #[test]
    fn abandon_unreleased_atomic_is_invalid() {
        let env = env();
        let scope = Scope::new(env);
        let g = scope.create(GroupFlags::ATOMIC).unwrap();
        assert_eq!(scope.abandon(g).unwrap_err(), GroupError::Invalid);
        scope.release(g).unwrap();
        scope.abandon(g).unwrap();
    }

    #[test]
    fn scope_copy_shares_groups() {
        let env = env();
        let scope = Scope::new(env);
        let g = scope.create(GroupFlags::empty()).unwrap();
        scope.engage(g).unwrap();
        let copy = scope.copy();
        assert!(copy.contains(g));
        assert!(copy.is_engaged(g).unwrap());
        assert!(copy.engaged_any());
        copy.disengage(g).unwrap();
        copy.abandon(g).unwrap();
        // The original still holds and engages the group.
        assert!(scope.is_engaged(g).unwrap());
        scope.disengage(g).unwrap();
        scope.abandon(g).unwrap();
    }

    #[test]
    fn masquerade_reports_engaged() {
        let env = env();
        let scope = Scope::new(Rc::clone(&env));
        assert!(!scope.engaged_any());
        env.masquerade();
        assert!(scope.engaged_any());
        env.demasquerade();
        assert!(!scope.engaged_any());
    }
}
