// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Block and data descriptors.
//!
//! A [`DataBlock`] (the *data descriptor*) owns the in-memory bytes of one
//! block plus a weak slot for the block's *change-set no-op* — the patch that
//! depends on every live patch targeting the block. A [`Bdesc`] (the *block
//! descriptor*) is a shared view of a data descriptor at a specific block
//! number and span; several descriptors may share one data descriptor.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use bytes::BytesMut;

use crate::patch::PatchSlot;

/// Shared handle to a block descriptor.
pub type BlockRef = Rc<Bdesc>;

/// The data descriptor: live bytes for one block plus its change-set anchor.
#[derive(Debug)]
pub struct DataBlock {
    data: RefCell<BytesMut>,
    /// Weak slot holding the change-set no-op while any patch targets this
    /// block. Nulled by the graph when the no-op satisfies.
    changes: PatchSlot,
}

impl DataBlock {
    /// Creates a data descriptor over the given bytes.
    #[must_use]
    pub fn new(data: BytesMut) -> Rc<Self> {
        Rc::new(Self {
            data: RefCell::new(data),
            changes: PatchSlot::new(),
        })
    }

    /// Creates a zero-filled data descriptor of `length` bytes.
    #[must_use]
    pub fn zeroed(length: usize) -> Rc<Self> {
        Self::new(BytesMut::zeroed(length))
    }

    /// Length of the block buffer in bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        self.data.borrow().len()
    }

    /// The change-set slot for this block.
    pub(crate) fn changes(&self) -> &PatchSlot {
        &self.changes
    }

    pub(crate) fn data(&self) -> Ref<'_, BytesMut> {
        self.data.borrow()
    }

    pub(crate) fn data_mut(&self) -> RefMut<'_, BytesMut> {
        self.data.borrow_mut()
    }
}

/// A reference-counted view of a data descriptor at a block number.
#[derive(Debug)]
pub struct Bdesc {
    ddesc: Rc<DataBlock>,
    number: u32,
    count: u16,
}

impl Bdesc {
    /// Creates a block descriptor for `number` spanning `count` blocks.
    #[must_use]
    pub fn new(ddesc: Rc<DataBlock>, number: u32, count: u16) -> BlockRef {
        Rc::new(Self {
            ddesc,
            number,
            count,
        })
    }

    /// The block number this descriptor addresses.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The number of device blocks this descriptor spans.
    #[must_use]
    pub fn count(&self) -> u16 {
        self.count
    }

    /// The shared data descriptor.
    #[must_use]
    pub fn ddesc(&self) -> &Rc<DataBlock> {
        &self.ddesc
    }

    /// Returns `true` when any undestroyed patch targets this block.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.ddesc.changes.get().is_some()
    }

    /// Copies the current in-memory bytes out of the block.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.ddesc.data().to_vec()
    }
}
