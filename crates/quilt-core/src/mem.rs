// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Terminal RAM-backed block device.
//!
//! The bottom of a device stack: a flat byte medium addressed in fixed-size
//! blocks. A write persists exactly the patches whose ordering constraints
//! are already met — everything else is rolled back around the copy and
//! re-applied, staying in memory until a later write. The medium can be
//! lifted out and a fresh device built over it, which is how tests model a
//! crash and restart.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::bd::{BlockDevice, DeviceError};
use crate::block::{Bdesc, BlockRef, DataBlock};
use crate::graph::PatchGraph;
use crate::id::{OwnerId, PatchId};
use crate::revision;

/// A RAM-backed terminal device (device level 1).
pub struct MemDevice {
    graph: Rc<PatchGraph>,
    owner: OwnerId,
    blocksize: u16,
    atomicsize: u16,
    medium: RefCell<Vec<u8>>,
    blocks: RefCell<FxHashMap<u32, BlockRef>>,
}

impl MemDevice {
    /// Creates a zero-filled device of `numblocks` blocks.
    #[must_use]
    pub fn new(graph: Rc<PatchGraph>, blocksize: u16, numblocks: u32) -> Rc<Self> {
        Self::with_geometry(graph, blocksize, blocksize, numblocks)
    }

    /// Creates a zero-filled device with an atomic write unit smaller than
    /// (and dividing) the block size.
    #[must_use]
    pub fn with_geometry(
        graph: Rc<PatchGraph>,
        blocksize: u16,
        atomicsize: u16,
        numblocks: u32,
    ) -> Rc<Self> {
        assert!(
            blocksize > 0 && atomicsize > 0 && blocksize % atomicsize == 0,
            "atomic size must divide block size"
        );
        let medium = vec![0u8; usize::from(blocksize) * numblocks as usize];
        Self::over_medium(graph, blocksize, atomicsize, medium)
    }

    /// Rebuilds a device over a surviving medium (crash-and-restart path).
    #[must_use]
    pub fn over_medium(
        graph: Rc<PatchGraph>,
        blocksize: u16,
        atomicsize: u16,
        medium: Vec<u8>,
    ) -> Rc<Self> {
        assert!(
            medium.len() % usize::from(blocksize) == 0,
            "medium length must be a whole number of blocks"
        );
        let owner = graph.alloc_owner();
        Rc::new(Self {
            graph,
            owner,
            blocksize,
            atomicsize,
            medium: RefCell::new(medium),
            blocks: RefCell::new(FxHashMap::default()),
        })
    }

    /// Copies out the current medium contents.
    ///
    /// Only bytes actually persisted by eligible patches are present; this
    /// is the state a crash would leave behind.
    #[must_use]
    pub fn medium_snapshot(&self) -> Vec<u8> {
        self.medium.borrow().clone()
    }

    fn span(&self, number: u32, count: u16) -> Result<core::ops::Range<usize>, DeviceError> {
        if count == 0 || u64::from(number) + u64::from(count) > u64::from(self.numblocks()) {
            return Err(DeviceError::InvalidBlock);
        }
        let start = number as usize * usize::from(self.blocksize);
        Ok(start..start + usize::from(count) * usize::from(self.blocksize))
    }
}

impl BlockDevice for MemDevice {
    fn blocksize(&self) -> u16 {
        self.blocksize
    }

    #[allow(clippy::cast_possible_truncation)] // medium length is a block multiple
    fn numblocks(&self) -> u32 {
        (self.medium.borrow().len() / usize::from(self.blocksize)) as u32
    }

    fn atomicsize(&self) -> u16 {
        self.atomicsize
    }

    fn devlevel(&self) -> u16 {
        1
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
        let range = self.span(number, count)?;
        let data = BytesMut::from(&self.medium.borrow()[range]);
        let block = Bdesc::new(DataBlock::new(data), number, count);
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
        let range = self.span(number, count)?;
        let block = Bdesc::new(DataBlock::zeroed(range.len()), number, count);
        self.blocks
            .borrow_mut()
            .insert(number, BlockRef::clone(&block));
        Ok((block, true))
    }

    fn write_block(&self, block: &BlockRef) -> Result<(), DeviceError> {
        let range = self.span(block.number(), block.count())?;
        let revision = revision::prepare_write(&self.graph, block)?;
        let persisted = revision.eligible().len();
        self.medium.borrow_mut()[range].copy_from_slice(&block.ddesc().data());
        revision.acknowledge(&self.graph)?;
        trace!(
            number = block.number(),
            persisted,
            "terminal write"
        );
        // Keep the descriptor so later reads see the same data descriptor
        // while patches remain outstanding.
        self.blocks
            .borrow_mut()
            .entry(block.number())
            .or_insert_with(|| BlockRef::clone(block));
        Ok(())
    }

    fn cancel_block(&self, number: u32) -> Result<(), DeviceError> {
        if number >= self.numblocks() {
            return Err(DeviceError::InvalidBlock);
        }
        self.blocks.borrow_mut().remove(&number);
        Ok(())
    }

    fn sync(&self, _block: Option<u32>) -> Result<(), DeviceError> {
        Ok(())
    }

    fn write_head(&self) -> Option<PatchId> {
        None
    }
}
