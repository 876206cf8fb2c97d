// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Revision tails: temporarily peeling patches off a block.
//!
//! Two callers need to see (or persist) a block in a state other than its
//! fully applied in-memory bytes:
//!
//! - a terminal device writing the block may only persist patches whose
//!   ordering constraints are already met; everything else is rolled back
//!   around the write and re-applied afterwards;
//! - the journal device copies a block to the journal *as it would appear
//!   below the journal*, so patches not yet stamped as accepted are rolled
//!   back around the snapshot.
//!
//! Rollback happens dependents-first and re-application in the exact
//! reverse order, so the XOR-swap pre-images always line up.

use crate::block::BlockRef;
use crate::graph::{GraphError, PatchGraph};
use crate::id::{PatchId, Stamp};

/// Patches rolled back around an operation, in rollback order.
///
/// Dropping a tail without [`RevisionTail::revert`] leaves the block
/// rolled back; callers always revert on every path.
#[derive(Debug)]
pub struct RevisionTail {
    rolled_back: Vec<PatchId>,
}

impl RevisionTail {
    /// Re-applies the rolled-back patches, newest constraint last.
    pub fn revert(self, graph: &PatchGraph) -> Result<(), GraphError> {
        for &id in self.rolled_back.iter().rev() {
            graph.apply(id)?;
        }
        Ok(())
    }

    /// Number of patches this tail rolled back.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rolled_back.len()
    }

    /// Whether the tail rolled nothing back.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rolled_back.is_empty()
    }
}

/// Topological order of `ids` with dependencies before dependents,
/// considering only edges internal to `ids`.
fn topo_befores_first(graph: &PatchGraph, ids: &[PatchId]) -> Vec<PatchId> {
    let mut order = Vec::with_capacity(ids.len());
    let mut visited: Vec<PatchId> = Vec::new();
    // Iterative DFS post-order per root.
    for &root in ids {
        if visited.contains(&root) {
            continue;
        }
        let mut stack: Vec<(PatchId, bool)> = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                if !order.contains(&id) {
                    order.push(id);
                }
                continue;
            }
            if visited.contains(&id) {
                continue;
            }
            visited.push(id);
            stack.push((id, true));
            for before in graph.befores(id) {
                if ids.contains(&before) && !visited.contains(&before) {
                    stack.push((before, false));
                }
            }
        }
    }
    order
}

/// Rolls back every applied patch on `block` that does *not* carry
/// `stamp`.
///
/// A device's stamp marks the patches it has accepted — they are now
/// logically below it. Everything unstamped is newer work still above the
/// device; the journal rolls it back so its block snapshot shows exactly
/// the state that belongs to the transaction.
pub fn prepare_stamp(
    graph: &PatchGraph,
    block: &BlockRef,
    stamp: Stamp,
) -> Result<RevisionTail, GraphError> {
    let targets: Vec<PatchId> = graph
        .block_patches(block)
        .into_iter()
        .filter(|&id| {
            !graph.has_stamp(id, stamp)
                && !graph.is_noop(id)
                && !graph
                    .flags(id)
                    .intersects(crate::patch::PatchFlags::WRITTEN | crate::patch::PatchFlags::ROLLBACK)
        })
        .collect();
    let apply_order = topo_befores_first(graph, &targets);
    let mut rolled_back = Vec::with_capacity(apply_order.len());
    for &id in apply_order.iter().rev() {
        graph.rollback(id)?;
        rolled_back.push(id);
    }
    Ok(RevisionTail { rolled_back })
}

/// A block prepared for a terminal-device write.
#[derive(Debug)]
pub struct WriteRevision {
    /// Patches whose constraints are met, dependencies first. These are the
    /// patches the write persists; the device satisfies them afterwards.
    eligible: Vec<PatchId>,
    tail: RevisionTail,
}

impl WriteRevision {
    /// The patches this write persists, in satisfaction order.
    #[must_use]
    pub fn eligible(&self) -> &[PatchId] {
        &self.eligible
    }

    /// Marks the persisted patches written and restores the rest.
    pub fn acknowledge(self, graph: &PatchGraph) -> Result<(), GraphError> {
        for &id in &self.eligible {
            graph.satisfy(id);
        }
        self.tail.revert(graph)
    }
}

/// Prepares `block` for persistence: rolls back every patch that still
/// waits on something outside the block, leaving only write-eligible bytes.
///
/// A patch is eligible when its whole dependency cone lives on this block —
/// in-block chains persist together because the block is written as a unit.
pub fn prepare_write(graph: &PatchGraph, block: &BlockRef) -> Result<WriteRevision, GraphError> {
    let patches = graph.block_patches(block);

    // ready = all befores are themselves ready patches on this block
    let mut ready: Vec<PatchId> = Vec::new();
    let mut changed = true;
    while changed {
        changed = false;
        for &id in &patches {
            if ready.contains(&id) {
                continue;
            }
            let ok = graph
                .befores(id)
                .iter()
                .all(|b| ready.contains(b));
            if ok {
                ready.push(id);
                changed = true;
            }
        }
    }

    let blocked: Vec<PatchId> = patches
        .iter()
        .copied()
        .filter(|id| !ready.contains(id) && !graph.is_noop(*id))
        .collect();
    let blocked_apply_order = topo_befores_first(graph, &blocked);
    let mut rolled_back = Vec::with_capacity(blocked.len());
    for &id in blocked_apply_order.iter().rev() {
        if !graph
            .flags(id)
            .contains(crate::patch::PatchFlags::ROLLBACK)
        {
            graph.rollback(id)?;
            rolled_back.push(id);
        }
    }

    let eligible = topo_befores_first(graph, &ready)
        .into_iter()
        .filter(|&id| !graph.flags(id).contains(crate::patch::PatchFlags::ROLLBACK))
        .collect();
    Ok(WriteRevision {
        eligible,
        tail: RevisionTail { rolled_back },
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::rc::Rc;

    use super::*;
    use crate::block::{Bdesc, DataBlock};
    use crate::mem::MemDevice;
    use crate::patch::PatchFlags;

    #[test]
    fn prepare_write_rolls_back_externally_blocked_patches() {
        let graph = Rc::new(PatchGraph::new());
        let dev = MemDevice::new(Rc::clone(&graph), 16, 4);
        let block = Bdesc::new(DataBlock::zeroed(16), 0, 1);

        let gate = graph.create_noop(None, None, &[]);
        let mut free_head = None;
        graph
            .create_byte(&block, &*dev, 0, &[1; 4], &mut free_head)
            .unwrap();
        let mut gated_head = Some(gate);
        graph
            .create_byte(&block, &*dev, 8, &[2; 4], &mut gated_head)
            .unwrap();

        let revision = prepare_write(&graph, &block).unwrap();
        assert_eq!(revision.eligible(), &[free_head.unwrap()]);
        // The gated patch is rolled back: its bytes are absent.
        assert_eq!(&block.contents()[8..12], &[0; 4]);
        assert_eq!(&block.contents()[0..4], &[1; 4]);

        revision.acknowledge(&graph).unwrap();
        assert_eq!(&block.contents()[8..12], &[2; 4]);
        assert!(graph
            .flags(free_head.unwrap())
            .contains(PatchFlags::WRITTEN));
        assert!(!graph
            .flags(gated_head.unwrap())
            .contains(PatchFlags::WRITTEN));
    }

    #[test]
    fn stamp_tail_peels_only_unstamped_patches() {
        let graph = Rc::new(PatchGraph::new());
        let dev = MemDevice::new(Rc::clone(&graph), 16, 4);
        let stamp = graph.register_stamp().unwrap();
        let block = Bdesc::new(DataBlock::zeroed(16), 0, 1);

        // Accepted by the device (stamped), then newer unstamped work on
        // top of it.
        let mut head = None;
        graph
            .create_byte(&block, &*dev, 0, &[3; 8], &mut head)
            .unwrap();
        graph.stamp(head.unwrap(), stamp);
        let mut head2 = None;
        graph
            .create_byte(&block, &*dev, 4, &[4; 8], &mut head2)
            .unwrap();

        let full = block.contents();
        let tail = prepare_stamp(&graph, &block, stamp).unwrap();
        assert_eq!(tail.len(), 1);
        // The stamped patch's bytes remain; the unstamped ones are gone.
        assert_eq!(&block.contents()[0..4], &[3; 4]);
        assert_eq!(&block.contents()[8..16], &[0; 8]);
        tail.revert(&graph).unwrap();
        assert_eq!(block.contents(), full);
    }
}
