// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Patch records: the typed change descriptors stored in the graph arena.

use std::cell::Cell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::block::BlockRef;
use crate::id::{OwnerId, PatchId};

bitflags! {
    /// Per-patch flag word.
    pub struct PatchFlags: u16 {
        /// The patch currently holds its pre-image: its effect is *not*
        /// reflected in the target block's bytes.
        const ROLLBACK = 0x0001;
        /// The patch has been satisfied — persisted and no longer needed.
        const WRITTEN = 0x0002;
        /// Destroy-in-progress guard against reentrant destruction.
        const FREEING = 0x0004;
        /// User data (as opposed to file system metadata).
        const DATA = 0x0008;
        /// Exempt from patch-group top/bottom linking.
        const NO_PATCHGROUP = 0x0010;
        /// Transient mark used by the cycle-check traversal.
        const MARKED = 0x0020;
        /// Debug breakpoint request.
        const DBWAIT = 0x0040;
        /// Being relocated between blocks by a higher layer; overlap
        /// multi-attach skips these because they already carry proper
        /// overlap dependency information.
        const MOVED = 0x0080;
        /// Held by a device: exempt from no-op auto-satisfaction and from
        /// free-list reclamation until the device lets go.
        const MANAGED = 0x0100;
    }
}

/// A weak-reference slot for a patch.
///
/// Slots registered with the graph via `weak_retain` are set to `None`
/// exactly once, synchronously with the referent's satisfaction or
/// destruction. Cloning a slot yields another handle to the *same* slot.
#[derive(Debug, Clone, Default)]
pub struct PatchSlot(Rc<Cell<Option<PatchId>>>);

impl PatchSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The patch currently referenced, if it is still live.
    #[must_use]
    pub fn get(&self) -> Option<PatchId> {
        self.0.get()
    }

    pub(crate) fn set(&self, id: Option<PatchId>) {
        self.0.set(id);
    }

    pub(crate) fn same_slot(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Payload of a byte patch: the XOR-swap partner buffer for its range.
///
/// At creation the buffer holds the *new* bytes; after the first apply it
/// holds the pre-image, and every apply/rollback swaps the two.
#[derive(Debug)]
pub(crate) struct ByteData {
    pub offset: u16,
    pub length: u16,
    pub data: Option<Box<[u8]>>,
    /// Checksum of the block-resident side of the swap (debug builds).
    #[cfg(debug_assertions)]
    pub old_sum: u32,
    /// Checksum of the buffer-resident side of the swap (debug builds).
    #[cfg(debug_assertions)]
    pub new_sum: u32,
}

/// Typed payload of a patch.
#[derive(Debug)]
pub(crate) enum PatchKind {
    /// No data; a synthetic join/barrier point in the graph.
    Noop,
    /// XOR of one 32-bit word at word index `offset`.
    Bit { offset: u16, xor: u32 },
    /// XOR-swap of a byte range.
    Byte(ByteData),
}

impl PatchKind {
    pub(crate) fn is_noop(&self) -> bool {
        matches!(self, Self::Noop)
    }
}

/// A patch record in the graph arena.
#[derive(Debug)]
pub(crate) struct Patch {
    pub owner: Option<OwnerId>,
    pub block: Option<BlockRef>,
    pub kind: PatchKind,
    /// Patches this one waits on.
    pub befores: Vec<PatchId>,
    /// Patches waiting on this one.
    pub afters: Vec<PatchId>,
    /// Registered weak-reference slots, nulled on satisfy/destroy.
    pub weak_refs: Vec<PatchSlot>,
    pub flags: PatchFlags,
    /// Bit set of device stamps placed on this patch.
    pub stamps: u32,
    pub free_prev: Option<PatchId>,
    pub free_next: Option<PatchId>,
}

impl Patch {
    pub(crate) fn new(
        owner: Option<OwnerId>,
        block: Option<BlockRef>,
        kind: PatchKind,
        flags: PatchFlags,
    ) -> Self {
        Self {
            owner,
            block,
            kind,
            befores: Vec::new(),
            afters: Vec::new(),
            weak_refs: Vec::new(),
            flags,
            stamps: 0,
            free_prev: None,
            free_next: None,
        }
    }

    pub(crate) fn is_written(&self) -> bool {
        self.flags.contains(PatchFlags::WRITTEN)
    }

    pub(crate) fn is_rolled_back(&self) -> bool {
        self.flags.contains(PatchFlags::ROLLBACK)
    }

    /// The byte range `[start, end)` this patch touches, `None` for no-ops.
    ///
    /// Bit patches cover the four bytes of their word; byte patches cover
    /// their declared range. Overlap of two patches on one block is exactly
    /// intersection of these ranges.
    pub(crate) fn byte_range(&self) -> Option<(u32, u32)> {
        match &self.kind {
            PatchKind::Noop => None,
            PatchKind::Bit { offset, .. } => {
                let start = u32::from(*offset) * 4;
                Some((start, start + 4))
            }
            PatchKind::Byte(byte) => {
                let start = u32::from(byte.offset);
                Some((start, start + u32::from(byte.length)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_ranges() {
        let bit = Patch::new(
            None,
            None,
            PatchKind::Bit { offset: 3, xor: 1 },
            PatchFlags::ROLLBACK,
        );
        assert_eq!(bit.byte_range(), Some((12, 16)));

        let noop = Patch::new(None, None, PatchKind::Noop, PatchFlags::empty());
        assert_eq!(noop.byte_range(), None);
    }

    #[test]
    fn slot_clones_alias() {
        let slot = PatchSlot::new();
        let alias = slot.clone();
        slot.set(Some(PatchId {
            index: 1,
            generation: 0,
        }));
        assert_eq!(alias.get(), slot.get());
        assert!(slot.same_slot(&alias));
    }
}
