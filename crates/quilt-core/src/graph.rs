// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The patch graph engine.
//!
//! Patches are typed modifications to block buffers (bit XORs, byte-range
//! XOR-swaps, and data-less no-ops) kept in a directed acyclic graph whose
//! edges are write-ordering constraints: an edge `after → before` means
//! `after` may not reach the medium until `before` has. The engine
//! materializes patches, maintains the DAG invariants as they are created,
//! linked, applied, rolled back, satisfied, and destroyed, and is the sole
//! mechanism the device stack uses to order writes.
//!
//! Invariants enforced here:
//! - the graph is acyclic; [`PatchGraph::add_depend`] rejects closing edges;
//! - `ROLLBACK` is set exactly when a patch's effect is absent from its
//!   block's bytes;
//! - a block's change-set no-op depends on exactly the live patches
//!   targeting that block;
//! - a `WRITTEN` patch has no edges in either direction.
//!
//! Everything is single-threaded; the engine hands out copyable [`PatchId`]
//! handles backed by a generational arena, so a stale handle is an assertion
//! failure rather than a dangling pointer.

use std::cell::RefCell;
use std::rc::Weak;

use thiserror::Error;
use tracing::{trace, warn};

use crate::bd::BlockDevice;
use crate::block::BlockRef;
use crate::id::{OwnerId, PatchId, Stamp};
use crate::patch::{ByteData, Patch, PatchFlags, PatchKind, PatchSlot};

/// Maximum number of device stamps that may exist at once.
pub const MAX_STAMPS: u32 = 32;

/// Errors produced by graph operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    /// Nonsensical offset, length, or state transition.
    #[error("invalid argument or patch state")]
    Invalid,
    /// A new patch would overlap a patch still holding its pre-image.
    #[error("new patch would overlap a rolled-back patch")]
    Busy,
    /// The requested dependency would close a cycle.
    #[error("dependency would create a cycle")]
    Cycle,
    /// The dependent patch has already been written.
    #[error("patch is already written")]
    AlreadyWritten,
}

/// Hooks the patch-group layer installs so that data-patch creation
/// participates in the current scope's ordering.
///
/// [`ScopeHooks::prepare_head`] runs immediately before a data patch is
/// created and may merge the scope's bottom anchor into the caller's head;
/// [`ScopeHooks::finish_head`] runs immediately after and attaches the new
/// head underneath the scope's top anchor.
pub trait ScopeHooks {
    /// Merges the scope's bottom into `head`.
    fn prepare_head(&self, head: &mut Option<PatchId>) -> Result<(), GraphError>;
    /// Attaches `head` underneath the scope's top.
    fn finish_head(&self, head: PatchId) -> Result<(), GraphError>;
}

struct ArenaSlot {
    generation: u32,
    patch: Option<Patch>,
}

struct GraphInner {
    slots: Vec<ArenaSlot>,
    recycled: Vec<u32>,
    /// Head of the intrusive free list of dependency-less no-ops and
    /// written patches awaiting reclamation.
    free_head: Option<PatchId>,
    /// Allocation bitmap for device stamps.
    stamps_taken: u32,
    next_owner: u32,
}

/// The patch graph engine.
///
/// One engine exists per stack; devices and the group layer share it by
/// reference. All methods take `&self` (interior mutability, single thread).
pub struct PatchGraph {
    inner: RefCell<GraphInner>,
    scope: RefCell<Option<Weak<dyn ScopeHooks>>>,
}

impl Default for PatchGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(GraphInner {
                slots: Vec::new(),
                recycled: Vec::new(),
                free_head: None,
                stamps_taken: 0,
                next_owner: 1,
            }),
            scope: RefCell::new(None),
        }
    }

    /// Installs (or clears) the current patch-group scope.
    pub fn set_scope(&self, scope: Option<Weak<dyn ScopeHooks>>) {
        *self.scope.borrow_mut() = scope;
    }

    /// Allocates a fresh owner identity for a device layer.
    pub fn alloc_owner(&self) -> OwnerId {
        let mut inner = self.inner.borrow_mut();
        let id = OwnerId(inner.next_owner);
        inner.next_owner += 1;
        id
    }

    /// Allocates a stamp bit for a device, or `None` if all 32 are taken.
    pub fn register_stamp(&self) -> Option<Stamp> {
        let mut inner = self.inner.borrow_mut();
        for bit in 0..MAX_STAMPS {
            let mask = 1u32 << bit;
            if inner.stamps_taken & mask == 0 {
                inner.stamps_taken |= mask;
                return Some(Stamp(mask));
            }
        }
        None
    }

    /// Returns a stamp bit to the registry.
    pub fn release_stamp(&self, stamp: Stamp) {
        self.inner.borrow_mut().stamps_taken &= !stamp.mask();
    }

    // ── Creation ────────────────────────────────────────────────────

    /// Creates a no-op patch, optionally attached to `block` and linked to
    /// each patch in `befores`.
    ///
    /// No-ops allocate in the applied state and sit on the free list until
    /// they gain their first dependency.
    pub fn create_noop(
        &self,
        block: Option<&BlockRef>,
        owner: Option<OwnerId>,
        befores: &[PatchId],
    ) -> PatchId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.alloc(Patch::new(
            owner,
            block.cloned(),
            PatchKind::Noop,
            PatchFlags::empty(),
        ));
        if let Some(block) = block {
            let changes = inner.ensure_changes(block);
            inner.add_depend_fast(changes, id);
        }
        inner.free_push(id);
        for &before in befores {
            inner.add_depend_fast(id, before);
        }
        trace!(?id, "create noop");
        id
    }

    /// Creates a bit patch XORing `xor` into the 32-bit word at word index
    /// `offset`, ordered after any overlapping patch already on the block.
    pub fn create_bit(
        &self,
        block: &BlockRef,
        dev: &dyn BlockDevice,
        offset: u16,
        xor: u32,
    ) -> Result<PatchId, GraphError> {
        if usize::from(offset) * 4 + 4 > block.ddesc().length() {
            return Err(GraphError::Invalid);
        }
        let mut head = None;
        self.call_prepare(&mut head)?;

        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.alloc(Patch::new(
                Some(dev.owner()),
                Some(BlockRef::clone(block)),
                PatchKind::Bit { offset, xor },
                PatchFlags::ROLLBACK,
            ));
            if let Some(h) = head {
                if !inner.patch(h).is_written() {
                    inner.add_depend_fast(id, h);
                }
            }
            if let Err(e) = inner.overlap_multiattach(id, block, false) {
                inner.destroy(id);
                return Err(e);
            }
            if let Err(e) = inner.apply(id) {
                inner.destroy(id);
                return Err(e);
            }
            let changes = inner.ensure_changes(block);
            inner.add_depend_fast(changes, id);
            id
        };
        self.call_finish(id)?;
        trace!(?id, offset, xor, "create bit");
        Ok(id)
    }

    /// Creates byte patches replacing `data.len()` bytes at `offset`.
    ///
    /// The request is split at the owning device's atomic-write boundaries
    /// into one patch per touched unit, chained so that unit *k* depends on
    /// unit *k−1*. On entry `*head` (unless already written) becomes a
    /// dependency of the first patch; on success it is replaced with the
    /// last patch of the chain. On failure the partially built chain is torn
    /// down and the block bytes are left untouched.
    pub fn create_byte(
        &self,
        block: &BlockRef,
        dev: &dyn BlockDevice,
        offset: u16,
        data: &[u8],
        head: &mut Option<PatchId>,
    ) -> Result<(), GraphError> {
        self.create_byte_inner(
            block,
            dev,
            offset,
            Some(data),
            data.len(),
            head,
            false,
            true,
            PatchFlags::empty(),
        )
    }

    /// Creates byte patches zero-filling the entire block.
    ///
    /// For freshly allocated blocks whose prior contents are undefined.
    pub fn create_init(
        &self,
        block: &BlockRef,
        dev: &dyn BlockDevice,
        head: &mut Option<PatchId>,
    ) -> Result<(), GraphError> {
        let length = block.ddesc().length();
        self.create_byte_inner(
            block,
            dev,
            0,
            None,
            length,
            head,
            false,
            true,
            PatchFlags::empty(),
        )
    }

    /// Creates byte patches replacing the entire block with `data`.
    pub fn create_full(
        &self,
        block: &BlockRef,
        dev: &dyn BlockDevice,
        data: &[u8],
        head: &mut Option<PatchId>,
    ) -> Result<(), GraphError> {
        self.create_byte_inner(
            block,
            dev,
            0,
            Some(data),
            data.len(),
            head,
            false,
            true,
            PatchFlags::empty(),
        )
    }

    /// Full-block byte patches without scope participation, optionally in
    /// slip-under mode (existing patches come to depend on the new ones).
    ///
    /// Returns the head of the created chain.
    pub(crate) fn create_full_detached(
        &self,
        block: &BlockRef,
        dev: &dyn BlockDevice,
        data: &[u8],
        head: &mut Option<PatchId>,
        slip_under: bool,
    ) -> Result<PatchId, GraphError> {
        self.create_byte_inner(
            block,
            dev,
            0,
            Some(data),
            data.len(),
            head,
            slip_under,
            false,
            PatchFlags::NO_PATCHGROUP,
        )?;
        head.ok_or(GraphError::Invalid)
    }

    /// Byte patches without scope participation. Returns the chain head.
    pub(crate) fn create_byte_detached(
        &self,
        block: &BlockRef,
        dev: &dyn BlockDevice,
        offset: u16,
        data: &[u8],
        head: &mut Option<PatchId>,
    ) -> Result<PatchId, GraphError> {
        self.create_byte_inner(
            block,
            dev,
            offset,
            Some(data),
            data.len(),
            head,
            false,
            false,
            PatchFlags::NO_PATCHGROUP,
        )?;
        head.ok_or(GraphError::Invalid)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_byte_inner(
        &self,
        block: &BlockRef,
        dev: &dyn BlockDevice,
        offset: u16,
        data: Option<&[u8]>,
        length: usize,
        head: &mut Option<PatchId>,
        slip_under: bool,
        hooked: bool,
        extra: PatchFlags,
    ) -> Result<(), GraphError> {
        if length == 0
            || block.ddesc().length() > usize::from(u16::MAX)
            || usize::from(offset) + length > block.ddesc().length()
            || data.is_some_and(|d| d.len() != length)
        {
            return Err(GraphError::Invalid);
        }
        if hooked {
            self.call_prepare(head)?;
        }

        let atomic = usize::from(dev.atomicsize());
        let init_offset = usize::from(offset) % atomic;
        let first_unit = usize::from(offset) / atomic;
        let count = (length + init_offset + atomic - 1) / atomic;

        let last = {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_changes(block);
            let mut created: Vec<PatchId> = Vec::with_capacity(count);
            let mut copied = 0usize;
            for i in 0..count {
                let patch_offset = (first_unit + i) * atomic + if i == 0 { init_offset } else { 0 };
                let patch_length = if count == 1 {
                    length
                } else if i == count - 1 {
                    let tail = (init_offset + length) % atomic;
                    if tail == 0 {
                        atomic
                    } else {
                        tail
                    }
                } else {
                    atomic - if i == 0 { init_offset } else { 0 }
                };
                let buffer: Box<[u8]> = data.map_or_else(
                    || vec![0u8; patch_length].into_boxed_slice(),
                    |d| d[copied..copied + patch_length].into(),
                );
                copied += patch_length;

                #[cfg(debug_assertions)]
                let (old_sum, new_sum) = {
                    let live = block.ddesc().data();
                    (
                        crc32fast::hash(&live[patch_offset..patch_offset + patch_length]),
                        crc32fast::hash(&buffer),
                    )
                };
                let byte = ByteData {
                    offset: u16::try_from(patch_offset).map_err(|_| GraphError::Invalid)?,
                    length: u16::try_from(patch_length).map_err(|_| GraphError::Invalid)?,
                    data: Some(buffer),
                    #[cfg(debug_assertions)]
                    old_sum,
                    #[cfg(debug_assertions)]
                    new_sum,
                };
                let id = inner.alloc(Patch::new(
                    Some(dev.owner()),
                    Some(BlockRef::clone(block)),
                    PatchKind::Byte(byte),
                    PatchFlags::ROLLBACK | extra,
                ));

                if let Err(e) = inner.overlap_multiattach(id, block, slip_under) {
                    inner.destroy(id);
                    for &p in created.iter().rev() {
                        inner.destroy(p);
                    }
                    return Err(e);
                }
                let changes = inner.ensure_changes(block);
                inner.add_depend_fast(changes, id);

                // The chain is all new patches, so no cycle check is needed;
                // the caller's head only needs a written-state check.
                if i > 0 {
                    inner.add_depend_fast(id, created[i - 1]);
                } else if let Some(h) = *head {
                    if !inner.patch(h).is_written() {
                        inner.add_depend_fast(id, h);
                    }
                }
                created.push(id);
            }

            for (applied, &id) in created.iter().enumerate() {
                if let Err(e) = inner.apply(id) {
                    for &prev in created[..applied].iter().rev() {
                        let _ = inner.rollback(prev);
                    }
                    for &p in created.iter().rev() {
                        inner.destroy(p);
                    }
                    return Err(e);
                }
            }
            created[count - 1]
        };

        *head = Some(last);
        if hooked {
            self.call_finish(last)?;
        }
        trace!(block = block.number(), offset, length, count, "create byte");
        Ok(())
    }

    // ── Linking ─────────────────────────────────────────────────────

    /// Adds the edge `after → before`: `after` waits on `before`.
    ///
    /// Written patches are terminal: if both ends are written this is a
    /// no-op; a written dependent is an error; a written dependency succeeds
    /// silently. An edge that would close a cycle is rejected atomically.
    pub fn add_depend(&self, after: PatchId, before: PatchId) -> Result<(), GraphError> {
        self.inner.borrow_mut().add_depend(after, before)
    }

    /// Removes the edge `after → before` in both directions.
    ///
    /// A no-op left with no dependencies is satisfied on the spot.
    pub fn remove_depend(&self, after: PatchId, before: PatchId) {
        self.inner.borrow_mut().remove_depend(after, before);
    }

    // ── State transitions ───────────────────────────────────────────

    /// Applies a rolled-back patch to its block.
    pub fn apply(&self, id: PatchId) -> Result<(), GraphError> {
        self.inner.borrow_mut().apply(id)
    }

    /// Rolls an applied patch back, restoring its pre-image.
    pub fn rollback(&self, id: PatchId) -> Result<(), GraphError> {
        self.inner.borrow_mut().rollback(id)
    }

    /// Satisfies a patch: it has reached the medium (or no longer matters).
    ///
    /// A patch that still has dependencies cannot become written; it is
    /// converted to a no-op so its dependents keep their transitive
    /// ordering. Otherwise every dependent edge is removed — recursively
    /// satisfying drained no-ops — and the patch becomes `WRITTEN`.
    pub fn satisfy(&self, id: PatchId) {
        self.inner.borrow_mut().satisfy(id);
    }

    /// Destroys a patch unconditionally, detaching it from the graph.
    pub fn destroy(&self, id: PatchId) {
        self.inner.borrow_mut().destroy(id);
    }

    // ── Weak references ─────────────────────────────────────────────

    /// Points `slot` at `patch` (or clears it for `None`), registering the
    /// slot to be nulled when the patch satisfies or is destroyed.
    pub fn weak_retain(&self, patch: Option<PatchId>, slot: &PatchSlot) {
        self.inner.borrow_mut().weak_retain(patch, slot);
    }

    /// Unregisters `slot` without clearing its value.
    pub fn weak_forget(&self, slot: &PatchSlot) {
        self.inner.borrow_mut().weak_forget(slot);
    }

    /// Unregisters `slot` and clears it.
    pub fn weak_release(&self, slot: &PatchSlot) {
        let mut inner = self.inner.borrow_mut();
        inner.weak_forget(slot);
        slot.set(None);
    }

    // ── Free list ───────────────────────────────────────────────────

    /// Removes a dependency-less no-op from the free list so it survives
    /// while a device or the group layer holds it.
    pub fn claim_noop(&self, id: PatchId) {
        let mut inner = self.inner.borrow_mut();
        let patch = inner.patch(id);
        assert!(
            patch.kind.is_noop() && patch.befores.is_empty(),
            "claiming a non-noop or dependent patch"
        );
        if inner.on_free_list(id) {
            inner.free_remove(id);
        }
    }

    /// Puts a claimed no-op back on the free list.
    pub fn autorelease_noop(&self, id: PatchId) {
        let mut inner = self.inner.borrow_mut();
        let patch = inner.patch(id);
        assert!(
            patch.kind.is_noop() && !patch.is_written(),
            "autoreleasing a non-noop or written patch"
        );
        if !inner.on_free_list(id) {
            inner.free_push(id);
        }
    }

    /// Drains the free list, destroying written patches and no-ops that
    /// never acquired dependencies. Call at quiescent points.
    pub fn reclaim_written(&self) {
        let mut inner = self.inner.borrow_mut();
        while let Some(id) = inner.free_head {
            inner.free_remove(id);
            inner.destroy(id);
        }
    }

    // ── Stamps and ownership ────────────────────────────────────────

    /// Marks `id` as processed by the device holding `stamp`.
    pub fn stamp(&self, id: PatchId, stamp: Stamp) {
        self.inner.borrow_mut().patch_mut(id).stamps |= stamp.mask();
    }

    /// Whether `id` carries `stamp`.
    #[must_use]
    pub fn has_stamp(&self, id: PatchId, stamp: Stamp) -> bool {
        self.inner.borrow().patch(id).stamps & stamp.mask() != 0
    }

    /// Reassigns every patch on `block` owned by `from` to `to`.
    ///
    /// Pass-through devices use this to hand their patches down the stack
    /// when forwarding a write.
    pub fn push_down(&self, block: &BlockRef, from: OwnerId, to: OwnerId) {
        let mut inner = self.inner.borrow_mut();
        for id in inner.block_patches(block) {
            let patch = inner.patch_mut(id);
            if patch.owner == Some(from) {
                patch.owner = Some(to);
            }
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Whether `id` still names a live patch.
    #[must_use]
    pub fn is_live(&self, id: PatchId) -> bool {
        let inner = self.inner.borrow();
        inner
            .slots
            .get(id.index as usize)
            .is_some_and(|s| s.generation == id.generation && s.patch.is_some())
    }

    /// Current flag word of a patch.
    #[must_use]
    pub fn flags(&self, id: PatchId) -> PatchFlags {
        self.inner.borrow().patch(id).flags
    }

    /// Whether the patch is a no-op.
    #[must_use]
    pub fn is_noop(&self, id: PatchId) -> bool {
        self.inner.borrow().patch(id).kind.is_noop()
    }

    /// The patches `id` waits on.
    #[must_use]
    pub fn befores(&self, id: PatchId) -> Vec<PatchId> {
        self.inner.borrow().patch(id).befores.clone()
    }

    /// The patches waiting on `id`.
    #[must_use]
    pub fn afters(&self, id: PatchId) -> Vec<PatchId> {
        self.inner.borrow().patch(id).afters.clone()
    }

    /// The owner of a patch, if any.
    #[must_use]
    pub fn owner_of(&self, id: PatchId) -> Option<OwnerId> {
        self.inner.borrow().patch(id).owner
    }

    /// The byte range `[start, end)` a patch touches; `None` for no-ops.
    #[must_use]
    pub fn byte_range(&self, id: PatchId) -> Option<(u32, u32)> {
        self.inner.borrow().patch(id).byte_range()
    }

    /// Live patches targeting `block` (the change-set no-op's befores).
    #[must_use]
    pub fn block_patches(&self, block: &BlockRef) -> Vec<PatchId> {
        self.inner.borrow_mut().block_patches(block)
    }

    /// Whether `after` transitively depends on `before`.
    #[must_use]
    pub fn depends_on(&self, after: PatchId, before: PatchId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let found = inner.has_dependency(after, before);
        inner.unmark_all();
        found
    }

    /// Number of entries currently parked on the free list.
    #[must_use]
    pub fn free_list_len(&self) -> usize {
        let inner = self.inner.borrow();
        let mut n = 0;
        let mut cursor = inner.free_head;
        while let Some(id) = cursor {
            n += 1;
            cursor = inner.patch(id).free_next;
        }
        n
    }

    pub(crate) fn set_flags(&self, id: PatchId, flags: PatchFlags) {
        self.inner.borrow_mut().patch_mut(id).flags |= flags;
    }

    pub(crate) fn clear_flags(&self, id: PatchId, flags: PatchFlags) {
        self.inner.borrow_mut().patch_mut(id).flags -= flags;
    }

    pub(crate) fn set_owner(&self, id: PatchId, owner: Option<OwnerId>) {
        self.inner.borrow_mut().patch_mut(id).owner = owner;
    }

    // ── Scope hook plumbing ─────────────────────────────────────────

    fn call_prepare(&self, head: &mut Option<PatchId>) -> Result<(), GraphError> {
        let hooks = self.scope.borrow().as_ref().and_then(Weak::upgrade);
        match hooks {
            Some(h) => h.prepare_head(head),
            None => Ok(()),
        }
    }

    fn call_finish(&self, head: PatchId) -> Result<(), GraphError> {
        let hooks = self.scope.borrow().as_ref().and_then(Weak::upgrade);
        match hooks {
            Some(h) => h.finish_head(head),
            None => Ok(()),
        }
    }
}

impl GraphInner {
    fn alloc(&mut self, patch: Patch) -> PatchId {
        if let Some(index) = self.recycled.pop() {
            let slot = &mut self.slots[index as usize];
            slot.patch = Some(patch);
            PatchId {
                index,
                generation: slot.generation,
            }
        } else {
            #[allow(clippy::cast_possible_truncation)] // arena never nears u32::MAX slots
            let index = self.slots.len() as u32;
            self.slots.push(ArenaSlot {
                generation: 0,
                patch: Some(patch),
            });
            PatchId {
                index,
                generation: 0,
            }
        }
    }

    fn release(&mut self, id: PatchId) {
        let slot = &mut self.slots[id.index as usize];
        assert!(
            slot.generation == id.generation && slot.patch.is_some(),
            "releasing a stale patch id"
        );
        slot.patch = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.recycled.push(id.index);
    }

    fn patch(&self, id: PatchId) -> &Patch {
        let slot = &self.slots[id.index as usize];
        assert!(slot.generation == id.generation, "stale patch id");
        slot.patch.as_ref().map_or_else(
            || {
                unreachable!("patch arena slot is empty for a live generation");
            },
            |p| p,
        )
    }

    fn patch_mut(&mut self, id: PatchId) -> &mut Patch {
        let slot = &mut self.slots[id.index as usize];
        assert!(slot.generation == id.generation, "stale patch id");
        slot.patch.as_mut().map_or_else(
            || {
                unreachable!("patch arena slot is empty for a live generation");
            },
            |p| p,
        )
    }

    // ── Free list (intrusive, doubly linked) ────────────────────────

    fn on_free_list(&self, id: PatchId) -> bool {
        self.free_head == Some(id) || self.patch(id).free_prev.is_some()
    }

    fn free_push(&mut self, id: PatchId) {
        debug_assert!(!self.on_free_list(id));
        let old_head = self.free_head;
        self.patch_mut(id).free_next = old_head;
        if let Some(h) = old_head {
            self.patch_mut(h).free_prev = Some(id);
        }
        self.free_head = Some(id);
    }

    fn free_remove(&mut self, id: PatchId) {
        debug_assert!(self.on_free_list(id));
        let (prev, next) = {
            let p = self.patch(id);
            (p.free_prev, p.free_next)
        };
        match prev {
            Some(prev) => self.patch_mut(prev).free_next = next,
            None => self.free_head = next,
        }
        if let Some(next) = next {
            self.patch_mut(next).free_prev = prev;
        }
        let p = self.patch_mut(id);
        p.free_prev = None;
        p.free_next = None;
    }

    // ── Change-set anchoring ────────────────────────────────────────

    /// Returns the block's change-set no-op, creating it if absent.
    ///
    /// The no-op carries no block reference of its own: it is the root of
    /// the block's dependency subgraph, not a change to the block.
    fn ensure_changes(&mut self, block: &BlockRef) -> PatchId {
        if let Some(id) = block.ddesc().changes().get() {
            return id;
        }
        let id = self.alloc(Patch::new(None, None, PatchKind::Noop, PatchFlags::empty()));
        self.weak_retain(Some(id), block.ddesc().changes());
        self.free_push(id);
        id
    }

    fn block_patches(&mut self, block: &BlockRef) -> Vec<PatchId> {
        block
            .ddesc()
            .changes()
            .get()
            .map(|changes| self.patch(changes).befores.clone())
            .unwrap_or_default()
    }

    // ── Linking ─────────────────────────────────────────────────────

    /// Adds the edge without a cycle check. Only safe when the edge cannot
    /// close a cycle (e.g. one end was just created).
    fn add_depend_fast(&mut self, after: PatchId, before: PatchId) {
        if self.patch(after).befores.contains(&before) {
            return;
        }
        debug_assert!(!self.patch(before).afters.contains(&after));
        self.patch_mut(after).befores.push(before);
        self.patch_mut(before).afters.push(after);

        // A virgin no-op just gained its first dependency.
        if self.on_free_list(after) {
            let p = self.patch(after);
            debug_assert!(p.kind.is_noop() && !p.is_written());
            self.free_remove(after);
        }
    }

    fn add_depend(&mut self, after: PatchId, before: PatchId) -> Result<(), GraphError> {
        let after_written = self.patch(after).is_written();
        let before_written = self.patch(before).is_written();
        if after_written {
            if before_written {
                return Ok(());
            }
            warn!(?after, ?before, "dependency added to already written patch");
            return Err(GraphError::AlreadyWritten);
        }
        if before_written {
            return Ok(());
        }

        if after == before || self.has_dependency(before, after) {
            self.unmark_all();
            warn!(?after, ?before, "rejected dependency cycle");
            return Err(GraphError::Cycle);
        }
        self.unmark_all();

        self.add_depend_fast(after, before);
        Ok(())
    }

    /// Marking DFS: does `from` transitively depend on `target`?
    ///
    /// Leaves `MARKED` set on every visited patch; callers must follow with
    /// [`Self::unmark_all`] so nested checks start clean.
    fn has_dependency(&mut self, from: PatchId, target: PatchId) -> bool {
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if self.patch(id).flags.contains(PatchFlags::MARKED) {
                continue;
            }
            self.patch_mut(id).flags |= PatchFlags::MARKED;
            for &before in &self.patch(id).befores.clone() {
                if before == target {
                    return true;
                }
                if !self.patch(before).flags.contains(PatchFlags::MARKED) {
                    stack.push(before);
                }
            }
        }
        false
    }

    fn unmark_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(p) = slot.patch.as_mut() {
                p.flags -= PatchFlags::MARKED;
            }
        }
    }

    fn remove_edge(&mut self, after: PatchId, before: PatchId) {
        self.patch_mut(after).befores.retain(|&b| b != before);
        self.patch_mut(before).afters.retain(|&a| a != after);
    }

    fn remove_depend(&mut self, after: PatchId, before: PatchId) {
        self.remove_edge(after, before);
        let p = self.patch(after);
        if p.kind.is_noop()
            && p.befores.is_empty()
            && !p.is_written()
            && !p.flags.contains(PatchFlags::MANAGED)
        {
            // Last dependency of an unmanaged no-op gone: it is satisfied.
            self.satisfy(after);
        }
    }

    // ── Overlap policy ──────────────────────────────────────────────

    /// Orders `recent` after `original` when their ranges intersect.
    fn overlap_attach(&mut self, recent: PatchId, original: PatchId) -> Result<(), GraphError> {
        let (r_kind_noop, r_range) = {
            let p = self.patch(recent);
            (p.kind.is_noop(), p.byte_range())
        };
        let (o_kind_noop, o_range, o_rolled_back) = {
            let p = self.patch(original);
            (p.kind.is_noop(), p.byte_range(), p.is_rolled_back())
        };
        if r_kind_noop || o_kind_noop {
            warn!(?recent, ?original, "unexpected no-op in overlap attach");
            return Ok(());
        }

        // Bit patches on the same word conflict only when their masks share
        // bits; the XOR representation commutes otherwise.
        let as_bit = |kind: &PatchKind| match *kind {
            PatchKind::Bit { offset, xor } => Some((offset, xor)),
            _ => None,
        };
        let r_bit = as_bit(&self.patch(recent).kind);
        let o_bit = as_bit(&self.patch(original).kind);
        if let (Some((r_off, r_xor)), Some((o_off, o_xor))) = (r_bit, o_bit) {
            if r_off == o_off && r_xor & o_xor != 0 {
                return self.add_depend(recent, original);
            }
            return Ok(());
        }

        let ((r_start, r_end), (o_start, o_end)) = match (r_range, o_range) {
            (Some(r), Some(o)) => (r, o),
            _ => return Ok(()),
        };
        if r_start >= o_end || o_start >= r_end {
            return Ok(());
        }
        if o_rolled_back {
            // New work cannot sit atop a record still carrying a pre-image.
            warn!(
                ?recent,
                ?original,
                "attempt to overlap a new patch with a rolled-back patch"
            );
            return Err(GraphError::Busy);
        }
        self.add_depend(recent, original)
    }

    /// Orders a new patch against every pre-existing patch on its block.
    ///
    /// `slip_under` reverses the edge direction: existing patches come to
    /// depend on the new one. Internal use only.
    fn overlap_multiattach(
        &mut self,
        id: PatchId,
        block: &BlockRef,
        slip_under: bool,
    ) -> Result<(), GraphError> {
        let existing = self.block_patches(block);
        for other in existing {
            if other == id {
                continue;
            }
            if self.patch(other).flags.contains(PatchFlags::MOVED) {
                continue;
            }
            if slip_under {
                self.overlap_attach(other, id)?;
            } else {
                self.overlap_attach(id, other)?;
            }
        }
        Ok(())
    }

    // ── State transitions ───────────────────────────────────────────

    fn apply(&mut self, id: PatchId) -> Result<(), GraphError> {
        if !self.patch(id).is_rolled_back() {
            return Err(GraphError::Invalid);
        }
        self.xor_patch(id, true)?;
        self.patch_mut(id).flags -= PatchFlags::ROLLBACK;
        Ok(())
    }

    fn rollback(&mut self, id: PatchId) -> Result<(), GraphError> {
        if self.patch(id).is_rolled_back() {
            return Err(GraphError::Invalid);
        }
        self.xor_patch(id, false)?;
        self.patch_mut(id).flags |= PatchFlags::ROLLBACK;
        Ok(())
    }

    /// The shared XOR step of apply and rollback.
    fn xor_patch(&mut self, id: PatchId, applying: bool) -> Result<(), GraphError> {
        let block = match &self.patch(id).block {
            Some(b) => BlockRef::clone(b),
            None => {
                warn!(?id, applying, "apply/rollback of a no-op patch");
                return Ok(());
            }
        };
        match &mut self.patch_mut(id).kind {
            PatchKind::Bit { offset, xor } => {
                let at = usize::from(*offset) * 4;
                let mask = *xor;
                let mut data = block.ddesc().data_mut();
                let word = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
                data[at..at + 4].copy_from_slice(&(word ^ mask).to_le_bytes());
            }
            PatchKind::Byte(byte) => {
                let buffer = byte.data.as_mut().ok_or(GraphError::Invalid)?;
                #[cfg(debug_assertions)]
                {
                    let expect = if applying { byte.new_sum } else { byte.old_sum };
                    if crc32fast::hash(buffer) != expect {
                        tracing::error!(?id, "byte patch buffer is corrupted");
                    }
                }
                let start = usize::from(byte.offset);
                let mut data = block.ddesc().data_mut();
                for (live, stored) in data[start..start + buffer.len()].iter_mut().zip(&mut **buffer)
                {
                    core::mem::swap(live, stored);
                }
            }
            PatchKind::Noop => {
                warn!(?id, applying, "apply/rollback of a no-op patch");
            }
        }
        Ok(())
    }

    fn weak_collect(&mut self, id: PatchId) {
        let slots = core::mem::take(&mut self.patch_mut(id).weak_refs);
        for slot in slots {
            if slot.get() == Some(id) {
                slot.set(None);
            } else {
                warn!(?id, "dangling patch weak reference");
            }
        }
    }

    fn satisfy(&mut self, id: PatchId) {
        if self.patch(id).is_written() {
            warn!(?id, "satisfaction of an already satisfied patch");
            return;
        }
        trace!(?id, "satisfy");

        if self.patch(id).befores.is_empty() {
            loop {
                let Some(after) = self.patch(id).afters.first().copied() else {
                    break;
                };
                self.remove_edge(after, id);
                let p = self.patch(after);
                if p.kind.is_noop()
                    && p.befores.is_empty()
                    && !p.is_written()
                    && !p.flags.contains(PatchFlags::MANAGED)
                {
                    self.satisfy(after);
                }
            }
            let on_list = self.on_free_list(id);
            let patch = self.patch_mut(id);
            patch.flags |= PatchFlags::WRITTEN;
            if let PatchKind::Byte(byte) = &mut patch.kind {
                byte.data = None;
            }
            if !patch.flags.contains(PatchFlags::FREEING) && !on_list {
                self.free_push(id);
            }
        } else {
            // Satisfying a patch that still has dependencies: convert it to
            // a no-op so its dependents keep their transitive ordering.
            if !self.patch(id).kind.is_noop() {
                warn!(?id, "satisfying a patch with dependencies");
            }
            let patch = self.patch_mut(id);
            patch.kind = PatchKind::Noop;
        }

        self.weak_collect(id);
    }

    fn destroy(&mut self, id: PatchId) {
        if self.patch(id).flags.contains(PatchFlags::FREEING) {
            return;
        }
        self.patch_mut(id).flags |= PatchFlags::FREEING;

        if self.patch(id).is_written() {
            debug_assert!(
                self.patch(id).befores.is_empty() && self.patch(id).afters.is_empty(),
                "written patch still has edges"
            );
            if self.on_free_list(id) {
                self.free_remove(id);
            }
        } else if self.patch(id).kind.is_noop() {
            if self.on_free_list(id) {
                debug_assert!(self.patch(id).befores.is_empty());
                self.free_remove(id);
            }
        } else {
            warn!(?id, "destroying an unwritten patch");
        }

        if !self.patch(id).befores.is_empty() && !self.patch(id).afters.is_empty() {
            warn!(?id, "destroying a patch with both dependents and dependencies");
        }
        // Dependencies first, so satisfaction below cannot merely convert
        // the patch into a no-op.
        loop {
            let Some(before) = self.patch(id).befores.first().copied() else {
                break;
            };
            self.remove_depend(id, before);
        }
        if !self.patch(id).afters.is_empty() {
            self.satisfy(id);
        }

        self.weak_collect(id);

        let patch = self.patch_mut(id);
        if let PatchKind::Byte(byte) = &mut patch.kind {
            byte.data = None;
        }
        patch.block = None;
        self.release(id);
    }

    // ── Weak references ─────────────────────────────────────────────

    fn weak_retain(&mut self, patch: Option<PatchId>, slot: &PatchSlot) {
        if slot.get() == patch {
            if let Some(id) = patch {
                if self
                    .patch(id)
                    .weak_refs
                    .iter()
                    .any(|s| s.same_slot(slot))
                {
                    return;
                }
            }
        }
        if let Some(current) = slot.get() {
            if Some(current) != patch {
                self.weak_forget(slot);
            }
        }
        if let Some(id) = patch {
            self.patch_mut(id).weak_refs.push(slot.clone());
        }
        slot.set(patch);
    }

    fn weak_forget(&mut self, slot: &PatchSlot) {
        if let Some(id) = slot.get() {
            let refs = &mut self.patch_mut(id).weak_refs;
            let before = refs.len();
            let mut removed = false;
            refs.retain(|s| {
                if !removed && s.same_slot(slot) {
                    removed = true;
                    false
                } else {
                    true
                }
            });
            if refs.len() == before {
                warn!(?id, "weak forget of a non-weak patch slot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::block::{Bdesc, DataBlock};
    use crate::mem::MemDevice;
    use std::rc::Rc;

    fn setup() -> (Rc<PatchGraph>, Rc<MemDevice>, BlockRef) {
        let graph = Rc::new(PatchGraph::new());
        let dev = MemDevice::new(Rc::clone(&graph), 64, 8);
        let block = Bdesc::new(DataBlock::zeroed(64), 0, 1);
        (graph, dev, block)
    }

    #[test]
    fn noop_lifecycle_through_free_list() {
        let (graph, _dev, _block) = setup();
        let a = graph.create_noop(None, None, &[]);
        assert_eq!(graph.free_list_len(), 1);

        // Gaining a dependency removes it from the free list.
        let b = graph.create_noop(None, None, &[]);
        graph.add_depend(a, b).unwrap();
        assert_eq!(graph.free_list_len(), 1); // only b remains

        graph.satisfy(b);
        // b's satisfaction drains a, which auto-satisfies and returns to
        // the free list along with b.
        assert!(graph.flags(a).contains(PatchFlags::WRITTEN));
        assert_eq!(graph.free_list_len(), 2);

        graph.reclaim_written();
        assert_eq!(graph.free_list_len(), 0);
        assert!(!graph.is_live(a));
        assert!(!graph.is_live(b));
    }

    #[test]
    fn add_depend_rejects_cycles() {
        let (graph, _dev, _block) = setup();
        let a = graph.create_noop(None, None, &[]);
        let b = graph.create_noop(None, None, &[]);
        let c = graph.create_noop(None, None, &[]);
        graph.add_depend(a, b).unwrap();
        graph.add_depend(b, c).unwrap();
        assert_eq!(graph.add_depend(c, a), Err(GraphError::Cycle));
        assert_eq!(graph.add_depend(a, a), Err(GraphError::Cycle));
        // The rejected edges left no marks behind.
        assert!(!graph.flags(a).contains(PatchFlags::MARKED));
        assert!(!graph.flags(b).contains(PatchFlags::MARKED));
        assert!(graph.depends_on(a, c));
    }

    #[test]
    fn bit_patch_applies_and_rolls_back() {
        let (graph, dev, block) = setup();
        let p = graph.create_bit(&block, &*dev, 0, 0xFF00_00FF).unwrap();
        assert_eq!(&block.contents()[0..4], &0xFF00_00FFu32.to_le_bytes());
        graph.rollback(p).unwrap();
        assert_eq!(&block.contents()[0..4], &[0, 0, 0, 0]);
        graph.apply(p).unwrap();
        assert_eq!(&block.contents()[0..4], &0xFF00_00FFu32.to_le_bytes());
    }

    #[test]
    fn byte_patch_swaps_pre_image() {
        let (graph, dev, block) = setup();
        block.ddesc().data_mut()[8..12].copy_from_slice(&[1, 2, 3, 4]);
        let mut head = None;
        graph
            .create_byte(&block, &*dev, 8, &[9, 9, 9, 9], &mut head)
            .unwrap();
        assert_eq!(&block.contents()[8..12], &[9, 9, 9, 9]);
        let p = head.unwrap();
        graph.rollback(p).unwrap();
        assert_eq!(&block.contents()[8..12], &[1, 2, 3, 4]);
        graph.apply(p).unwrap();
        assert_eq!(&block.contents()[8..12], &[9, 9, 9, 9]);
    }

    #[test]
    fn overlapping_byte_patches_are_ordered() {
        let (graph, dev, block) = setup();
        let mut head = None;
        graph
            .create_byte(&block, &*dev, 0, &[1; 8], &mut head)
            .unwrap();
        let first = head.unwrap();
        let mut head2 = None;
        graph
            .create_byte(&block, &*dev, 4, &[2; 8], &mut head2)
            .unwrap();
        let second = head2.unwrap();
        assert!(graph.depends_on(second, first));
    }

    #[test]
    fn overlap_with_rolled_back_patch_is_busy() {
        let (graph, dev, block) = setup();
        let mut head = None;
        graph
            .create_byte(&block, &*dev, 0, &[1; 4], &mut head)
            .unwrap();
        graph.rollback(head.unwrap()).unwrap();
        let mut head2 = None;
        let err = graph
            .create_byte(&block, &*dev, 0, &[2; 4], &mut head2)
            .unwrap_err();
        assert_eq!(err, GraphError::Busy);
        // The failed creation left the block bytes untouched.
        assert_eq!(&block.contents()[0..4], &[0; 4]);
    }

    #[test]
    fn satisfy_with_dependencies_converts_to_noop() {
        let (graph, dev, block) = setup();
        let gate = graph.create_noop(None, None, &[]);
        let mut head = Some(gate);
        graph
            .create_byte(&block, &*dev, 0, &[7; 4], &mut head)
            .unwrap();
        let p = head.unwrap();
        graph.satisfy(p);
        assert!(graph.is_noop(p));
        assert!(!graph.flags(p).contains(PatchFlags::WRITTEN));
        // Draining the dependency now fully satisfies it.
        graph.satisfy(gate);
        assert!(graph.flags(p).contains(PatchFlags::WRITTEN));
    }

    #[test]
    fn weak_slots_null_on_satisfy_and_destroy() {
        let (graph, _dev, _block) = setup();
        let a = graph.create_noop(None, None, &[]);
        let slot = PatchSlot::new();
        graph.weak_retain(Some(a), &slot);
        assert_eq!(slot.get(), Some(a));
        graph.satisfy(a);
        assert_eq!(slot.get(), None);

        let b = graph.create_noop(None, None, &[]);
        graph.weak_retain(Some(b), &slot);
        graph.destroy(b);
        assert_eq!(slot.get(), None);
    }

    #[test]
    fn written_deps_are_terminal() {
        let (graph, _dev, _block) = setup();
        let a = graph.create_noop(None, None, &[]);
        let b = graph.create_noop(None, None, &[]);
        graph.satisfy(a);
        // written dependency: silent success
        graph.add_depend(b, a).unwrap();
        assert!(graph.befores(b).is_empty());
        // written dependent: error
        assert_eq!(graph.add_depend(a, b), Err(GraphError::AlreadyWritten));
    }

    #[test]
    fn stamps_allocate_and_release() {
        let (graph, _dev, _block) = setup();
        let s1 = graph.register_stamp().unwrap();
        let s2 = graph.register_stamp().unwrap();
        assert_ne!(s1.mask(), s2.mask());
        let p = graph.create_noop(None, None, &[]);
        graph.stamp(p, s1);
        assert!(graph.has_stamp(p, s1));
        assert!(!graph.has_stamp(p, s2));
        graph.release_stamp(s1);
        let s3 = graph.register_stamp().unwrap();
        assert_eq!(s3.mask(), s1.mask());
    }

    #[test]
    fn change_set_tracks_block_patches() {
        let (graph, dev, block) = setup();
        let p1 = graph.create_bit(&block, &*dev, 0, 1).unwrap();
        let p2 = graph.create_bit(&block, &*dev, 1, 1).unwrap();
        let patches = graph.block_patches(&block);
        assert!(patches.contains(&p1) && patches.contains(&p2));
        graph.satisfy(p1);
        graph.satisfy(p2);
        assert!(!block.has_changes());
    }
}
