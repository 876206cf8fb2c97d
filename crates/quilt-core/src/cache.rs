// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Write-back block cache.
//!
//! Sits between a patch-producing layer and the device below it. Writes
//! only mark blocks dirty; [`BlockDevice::sync`] pushes them down in
//! dependency order by making repeated passes — a block whose remaining
//! patches still wait on other blocks simply persists less of itself this
//! pass and is retried on the next one, until no pass makes progress.
//!
//! The cache also maintains the stack's *write head*: a sentinel no-op that
//! newly submitted patches may depend on. The sentinel is satisfied when a
//! sync completes, ordering new work after everything already pushed.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::bd::{BlockDevice, DeviceError};
use crate::block::BlockRef;
use crate::graph::PatchGraph;
use crate::id::{OwnerId, PatchId};

/// A write-back cache over another block device.
pub struct WritebackCache {
    graph: Rc<PatchGraph>,
    owner: OwnerId,
    below: Rc<dyn BlockDevice>,
    blocks: RefCell<FxHashMap<u32, BlockRef>>,
    dirty: RefCell<BTreeSet<u32>>,
    head: Cell<Option<PatchId>>,
}

impl WritebackCache {
    /// Creates a cache over `below`.
    #[must_use]
    pub fn new(graph: Rc<PatchGraph>, below: Rc<dyn BlockDevice>) -> Rc<Self> {
        let owner = graph.alloc_owner();
        Rc::new(Self {
            graph,
            owner,
            below,
            blocks: RefCell::new(FxHashMap::default()),
            dirty: RefCell::new(BTreeSet::new()),
            head: Cell::new(None),
        })
    }

    /// Number of blocks currently dirty.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.borrow().len()
    }

    /// One flush pass over `targets`; returns the number of patches that
    /// became satisfied.
    fn flush_pass(&self, targets: &[u32]) -> Result<usize, DeviceError> {
        let mut satisfied = 0usize;
        for &number in targets {
            let block = match self.blocks.borrow().get(&number) {
                Some(b) => BlockRef::clone(b),
                None => {
                    self.dirty.borrow_mut().remove(&number);
                    continue;
                }
            };
            if !block.has_changes() {
                self.dirty.borrow_mut().remove(&number);
                continue;
            }
            let before = self.graph.block_patches(&block).len();
            self.graph
                .push_down(&block, self.owner, self.below.owner());
            self.below.write_block(&block)?;
            let after = if block.has_changes() {
                self.graph.block_patches(&block).len()
            } else {
                self.dirty.borrow_mut().remove(&number);
                0
            };
            satisfied += before.saturating_sub(after);
            trace!(number, before, after, "flush pass wrote block");
        }
        Ok(satisfied)
    }

    fn rotate_write_head(&self) {
        if let Some(head) = self.head.take() {
            if self.graph.is_live(head) {
                self.graph.satisfy(head);
            }
        }
    }
}

impl BlockDevice for WritebackCache {
    fn blocksize(&self) -> u16 {
        self.below.blocksize()
    }

    fn numblocks(&self) -> u32 {
        self.below.numblocks()
    }

    fn atomicsize(&self) -> u16 {
        self.below.atomicsize()
    }

    fn devlevel(&self) -> u16 {
        self.below.devlevel() + 1
    }

    fn owner(&self) -> OwnerId {
        self.owner
    }

    fn read_block(&self, number: u32, count: u16) -> Result<BlockRef, DeviceError> {
        if let Some(block) = self.blocks.borrow().get(&number) {
            if block.count() == count {
                return Ok(BlockRef::clone(block));
            }
            return Err(DeviceError::InvalidBlock);
        }
        let block = self.below.read_block(number, count)?;
        self.blocks
            .borrow_mut()
            .insert(number, BlockRef::clone(&block));
        Ok(block)
    }

    fn synthetic_read_block(
        &self,
        number: u32,
        count: u16,
    ) -> Result<(BlockRef, bool), DeviceError> {
        if let Some(block) = self.blocks.borrow().get(&number) {
            if block.count() == count {
                return Ok((BlockRef::clone(block), false));
            }
            return Err(DeviceError::InvalidBlock);
        }
        let (block, synthetic) = self.below.synthetic_read_block(number, count)?;
        self.blocks
            .borrow_mut()
            .insert(number, BlockRef::clone(&block));
        Ok((block, synthetic))
    }

    fn write_block(&self, block: &BlockRef) -> Result<(), DeviceError> {
        if u64::from(block.number()) + u64::from(block.count()) > u64::from(self.numblocks()) {
            return Err(DeviceError::InvalidBlock);
        }
        self.blocks
            .borrow_mut()
            .insert(block.number(), BlockRef::clone(block));
        self.dirty.borrow_mut().insert(block.number());
        Ok(())
    }

    fn cancel_block(&self, number: u32) -> Result<(), DeviceError> {
        self.blocks.borrow_mut().remove(&number);
        self.dirty.borrow_mut().remove(&number);
        self.below.cancel_block(number)
    }

    fn sync(&self, block: Option<u32>) -> Result<(), DeviceError> {
        loop {
            let targets: Vec<u32> = match block {
                Some(n) => self
                    .dirty
                    .borrow()
                    .contains(&n)
                    .then_some(n)
                    .into_iter()
                    .collect(),
                None => self.dirty.borrow().iter().copied().collect(),
            };
            if targets.is_empty() {
                break;
            }
            let satisfied = self.flush_pass(&targets)?;
            if satisfied == 0 {
                // Whatever remains waits on patches this sync cannot reach
                // (an open transaction, an engaged group); leave it dirty.
                debug!(remaining = self.dirty_count(), "sync left dirty blocks");
                break;
            }
        }
        if block.is_none() {
            if self.dirty.borrow().is_empty() {
                self.rotate_write_head();
            }
            // Quiescent point: reclaim written patches and orphaned no-ops.
            self.graph.reclaim_written();
        }
        self.below.sync(block)
    }

    fn write_head(&self) -> Option<PatchId> {
        if let Some(head) = self.head.get() {
            if self.graph.is_live(head) {
                return Some(head);
            }
        }
        let head = self.graph.create_noop(None, Some(self.owner), &[]);
        self.graph.claim_noop(head);
        self.head.set(Some(head));
        Some(head)
    }
}
