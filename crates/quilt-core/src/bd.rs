// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The block device seam.
//!
//! Every layer of the stack — terminal stores, write-back caches, the
//! journal device — implements [`BlockDevice`]. Layers are stacked by
//! *device level*: level 1 is the layer closest to the physical medium and
//! each interposed layer reports a level at least as high as the one below
//! it. The journal device uses levels to reject stackings where the journal
//! would be further from the disk than the data it protects.

use thiserror::Error;

use crate::block::BlockRef;
use crate::graph::GraphError;
use crate::id::{OwnerId, PatchId};

/// Errors surfaced by block devices.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Block number or count outside the device.
    #[error("block number out of range")]
    InvalidBlock,
    /// No free resource (e.g. every journal slot is still in flight).
    #[error("device busy")]
    Busy,
    /// A stacking or geometry rule was violated.
    #[error("incompatible device stacking: {0}")]
    Incompatible(&'static str),
    /// An underlying graph operation failed.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A numbered fixed-size block store.
///
/// All methods take `&self`: the stack is single-threaded and cooperative,
/// with interior mutability inside each device.
pub trait BlockDevice {
    /// Block size in bytes.
    fn blocksize(&self) -> u16;

    /// Number of addressable blocks.
    fn numblocks(&self) -> u32;

    /// Size of the device's atomic write unit in bytes.
    ///
    /// Byte patches never straddle an atomic-unit boundary; the graph splits
    /// larger writes into per-unit patches.
    fn atomicsize(&self) -> u16;

    /// Layering ordinal: 1 at the medium, nondecreasing up the stack.
    fn devlevel(&self) -> u16;

    /// The owner identity patches created against this device carry.
    fn owner(&self) -> OwnerId;

    /// Reads `count` blocks starting at `number` into a block descriptor.
    fn read_block(&self, number: u32, count: u16) -> Result<BlockRef, DeviceError>;

    /// Returns a descriptor for `number` without touching the medium.
    ///
    /// The second element is `true` when the descriptor was synthesized
    /// (its bytes are unspecified and must be fully overwritten).
    fn synthetic_read_block(&self, number: u32, count: u16)
        -> Result<(BlockRef, bool), DeviceError>;

    /// Submits a block for writing.
    ///
    /// The patches on the block, not the call order, decide what actually
    /// reaches the medium and when.
    fn write_block(&self, block: &BlockRef) -> Result<(), DeviceError>;

    /// Forgets a cached descriptor for `number`.
    fn cancel_block(&self, number: u32) -> Result<(), DeviceError>;

    /// Flushes `block` (or everything, when `None`) as far as the patch
    /// graph allows.
    fn sync(&self, block: Option<u32>) -> Result<(), DeviceError>;

    /// The device's current write head, if it maintains one.
    ///
    /// The write head is a sentinel patch that newly submitted patches may
    /// depend on, globally ordering new work after whatever was last pushed
    /// toward the hardware.
    fn write_head(&self) -> Option<PatchId>;
}
