// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The journaling block device.
//!
//! A pass-through device over a base device `B` with an attachable journal
//! device `J` of the same block size. Blocks written through this layer are
//! copied into a journal transaction slot before the originals may reach
//! the base; a commit record makes the transaction durable and an
//! invalidation (the *cancellation*) retires it once the real locations are
//! safe. After a crash, committed but uncancelled transactions are replayed
//! from the journal onto the base.
//!
//! The journal area is divided into slots of `T` blocks each: one
//! commit-record block, `N` block-number-list blocks, and `T − 1 − N` data
//! blocks. A transaction larger than one slot chains slots through the
//! commit records' `next` fields (`SUBCOMMIT` records), terminated by a
//! record pointing at its own slot.
//!
//! Every open transaction maintains five no-op anchors:
//!
//! ```text
//! "keep" <--+
//!           |
//! jrdata <--+-- "wait" <-- commit <-- "hold" <-- fsdata <-- "safe" <-- cancel <-- "done"
//!           |
//! subcmt <--+
//! ```
//!
//! `keep` holds `wait` open until the transaction closes; `wait` collects
//! everything written to the journal so the commit record can depend on it
//! all at once; `hold` keeps the file system data off the disk until the
//! commit record exists; `safe` collects the file system data so the
//! cancellation can depend on it; `done` stands for the entire transaction
//! and is weak-retained per slot to mark slots in use.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::bd::{BlockDevice, DeviceError};
use crate::block::BlockRef;
use crate::config::Config;
use crate::graph::PatchGraph;
use crate::id::{OwnerId, PatchId, Stamp};
use crate::patch::{PatchFlags, PatchSlot};
use crate::revision;

/// Commit record magic: "SAFEDATA".
pub const JOURNAL_MAGIC: u32 = 0x5AFE_DA7A;

/// Commit record type field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRecordType {
    /// Slot free or cancelled.
    Empty,
    /// Not the last slot of a chain.
    Subcommit,
    /// Last slot of a chain; replay applies the whole chain.
    Commit,
}

impl CommitRecordType {
    fn code(self) -> u16 {
        match self {
            Self::Empty => 0,
            Self::Subcommit => 1,
            Self::Commit => 2,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Empty),
            1 => Some(Self::Subcommit),
            2 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// On-disk commit record. All fields little-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CommitRecord {
    magic_le: u32,
    type_le: u16,
    next_le: u16,
    nblocks_le: u32,
}

const _: () = assert!(core::mem::size_of::<CommitRecord>() == 12);

/// Byte offset of the `type` field inside a commit record.
const CR_TYPE_OFFSET: u16 = 4;

impl CommitRecord {
    /// Builds a record with the journal magic.
    #[must_use]
    pub fn new(ty: CommitRecordType, next: u16, nblocks: u32) -> Self {
        Self {
            magic_le: JOURNAL_MAGIC.to_le(),
            type_le: ty.code().to_le(),
            next_le: next.to_le(),
            nblocks_le: nblocks.to_le(),
        }
    }

    /// Reads a record off the front of a block; `None` without the magic.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < core::mem::size_of::<Self>() {
            return None;
        }
        let record: Self = bytemuck::pod_read_unaligned(&bytes[..core::mem::size_of::<Self>()]);
        (u32::from_le(record.magic_le) == JOURNAL_MAGIC).then_some(record)
    }

    /// The record type, if the field holds a known value.
    #[must_use]
    pub fn record_type(&self) -> Option<CommitRecordType> {
        CommitRecordType::from_code(u16::from_le(self.type_le))
    }

    /// Slot index of the previous slot in this chain (self terminates).
    #[must_use]
    pub fn next(&self) -> u16 {
        u16::from_le(self.next_le)
    }

    /// Count of data blocks recorded in this slot.
    #[must_use]
    pub fn nblocks(&self) -> u32 {
        u32::from_le(self.nblocks_le)
    }
}

/// Process-wide count of holds keeping journal transactions open.
///
/// Atomic patch groups place a hold while engaged so the timer callback
/// cannot close the transaction out from under them.
#[derive(Debug, Default)]
pub struct JournalHolds(Cell<u32>);

impl JournalHolds {
    /// Creates an empty hold set.
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Places a hold.
    pub fn add(&self) {
        self.0.set(self.0.get() + 1);
    }

    /// Removes a hold.
    pub fn remove(&self) {
        let n = self.0.get();
        assert!(n > 0, "removing a journal hold that was never placed");
        self.0.set(n - 1);
    }

    /// Whether any hold is outstanding.
    #[must_use]
    pub fn active(&self) -> bool {
        self.0.get() > 0
    }
}

struct Transaction {
    keep: PatchId,
    wait: PatchId,
    hold: PatchId,
    safe: PatchId,
    done: PatchId,
    /// Base block number → journal data block number for this transaction.
    block_map: FxHashMap<u32, u32>,
}

struct JournalSide {
    dev: Rc<dyn BlockDevice>,
    cr_count: u16,
    /// Weak retains of each slot's "done" no-op; a live entry means the
    /// slot is still in flight and may not be reused.
    cr_retain: Vec<PatchSlot>,
}

struct ReplayAnchors {
    keep: PatchId,
    safe: PatchId,
    done: PatchId,
}

/// The journaling pass-through device.
pub struct JournalDevice {
    graph: Rc<PatchGraph>,
    owner: OwnerId,
    stamp: Stamp,
    base: Rc<dyn BlockDevice>,
    holds: Rc<JournalHolds>,
    blocksize: u16,
    length: u32,
    level: u16,
    period: Duration,
    trans_total_blocks: u32,
    trans_data_blocks: u32,
    journal: RefCell<Option<JournalSide>>,
    tx: RefCell<Option<Transaction>>,
    trans_slot: Cell<u16>,
    prev_slot: Cell<u16>,
    prev_cr: PatchSlot,
    recursion: Cell<bool>,
}

fn numbers_per_block(blocksize: u16) -> u32 {
    u32::from(blocksize) / 4
}

/// Blocks reserved for block-number lists in each transaction slot.
fn trans_number_block_count(blocksize: u16, trans_total_blocks: u32) -> u32 {
    let npb = numbers_per_block(blocksize);
    (trans_total_blocks - 1 + npb) / (npb + 1)
}

impl JournalDevice {
    /// Creates a journal device over `base`. Attach the journal side with
    /// [`JournalDevice::set_journal`] before writing through it.
    pub fn new(
        graph: Rc<PatchGraph>,
        base: Rc<dyn BlockDevice>,
        holds: Rc<JournalHolds>,
        config: &Config,
    ) -> Result<Rc<Self>, DeviceError> {
        let level = base.devlevel();
        if level == 0 {
            return Err(DeviceError::Incompatible("base device has no level"));
        }
        let blocksize = base.blocksize();
        let trans_total_blocks =
            (config.transaction_size + u32::from(blocksize) - 1) / u32::from(blocksize);
        if trans_total_blocks < 2 {
            return Err(DeviceError::Incompatible("transaction size too small"));
        }
        let trans_data_blocks =
            trans_total_blocks - 1 - trans_number_block_count(blocksize, trans_total_blocks);
        if trans_data_blocks == 0 {
            return Err(DeviceError::Incompatible("transaction slot has no data room"));
        }
        let stamp = graph
            .register_stamp()
            .ok_or(DeviceError::Incompatible("stamp registry exhausted"))?;
        let owner = graph.alloc_owner();
        Ok(Rc::new(Self {
            graph,
            owner,
            stamp,
            length: base.numblocks(),
            base,
            holds,
            blocksize,
            level,
            period: config.transaction_period,
            trans_total_blocks,
            trans_data_blocks,
            journal: RefCell::new(None),
            tx: RefCell::new(None),
            trans_slot: Cell::new(0),
            prev_slot: Cell::new(0),
            prev_cr: PatchSlot::new(),
            recursion: Cell::new(false),
        }))
    }

    /// The interval at which the host should call
    /// [`JournalDevice::timer_tick`].
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Data-block capacity of one transaction slot.
    #[must_use]
    pub fn slot_data_blocks(&self) -> u32 {
        self.trans_data_blocks
    }

    /// Total blocks per transaction slot.
    #[must_use]
    pub fn slot_total_blocks(&self) -> u32 {
        self.trans_total_blocks
    }

    /// Whether a transaction is currently open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Attaches or detaches the journal side.
    ///
    /// Attaching validates geometry (equal block size, commit record within
    /// the journal's atomic unit, journal at least as close to the disk as
    /// the base) and immediately replays committed transactions found in
    /// the journal. Detaching closes any open transaction and releases all
    /// slot retains.
    pub fn set_journal(&self, journal: Option<Rc<dyn BlockDevice>>) -> Result<(), DeviceError> {
        let Some(journal) = journal else {
            if self.journal.borrow().is_some() {
                if self.tx.borrow().is_some() {
                    self.stop_transaction()?;
                }
                let side = self.journal.borrow_mut().take();
                if let Some(side) = side {
                    for slot in &side.cr_retain {
                        self.graph.weak_release(slot);
                    }
                }
            }
            return Ok(());
        };

        if self.journal.borrow().is_some() {
            return Err(DeviceError::Incompatible("journal already attached"));
        }
        if journal.blocksize() != self.blocksize {
            return Err(DeviceError::Incompatible("journal block size differs"));
        }
        if usize::from(journal.atomicsize()) < core::mem::size_of::<CommitRecord>() {
            return Err(DeviceError::Incompatible(
                "journal atomic unit smaller than a commit record",
            ));
        }
        let level = journal.devlevel();
        if level == 0 || level > self.level {
            return Err(DeviceError::Incompatible(
                "journal must be at least as close to the disk as the base",
            ));
        }
        let cr_count = journal.numblocks() / self.trans_total_blocks;
        if cr_count == 0 {
            return Err(DeviceError::Incompatible("journal smaller than one slot"));
        }
        let cr_count = u16::try_from(cr_count).unwrap_or(u16::MAX);
        // One independent retain slot per journal slot; PatchSlot clones
        // alias, so build them individually.
        let cr_retain = (0..cr_count).map(|_| PatchSlot::new()).collect();
        *self.journal.borrow_mut() = Some(JournalSide {
            dev: journal,
            cr_count,
            cr_retain,
        });
        self.replay_journal()
    }

    fn journal_dev(&self) -> Result<Rc<dyn BlockDevice>, DeviceError> {
        self.journal
            .borrow()
            .as_ref()
            .map(|side| Rc::clone(&side.dev))
            .ok_or(DeviceError::Incompatible("no journal attached"))
    }

    /// Writes a block through the journal side with the recursion guard
    /// raised, so a self-referential journal routes straight down.
    fn journal_write(&self, dev: &Rc<dyn BlockDevice>, block: &BlockRef) -> Result<(), DeviceError> {
        self.recursion.set(true);
        let result = dev.write_block(block);
        self.recursion.set(false);
        result
    }

    /// Claims a free slot, weak-retaining the transaction's "done" no-op
    /// into it. Round-robin over slots with no live retain.
    fn grab_slot(&self, done: PatchId) -> Result<(), DeviceError> {
        let journal = self.journal.borrow();
        let side = journal
            .as_ref()
            .ok_or(DeviceError::Incompatible("no journal attached"))?;
        let mut scan = self.trans_slot.get();
        loop {
            if side.cr_retain[usize::from(scan)].get().is_none() {
                self.graph
                    .weak_retain(Some(done), &side.cr_retain[usize::from(scan)]);
                self.prev_slot.set(self.trans_slot.get());
                self.trans_slot.set(scan);
                return Ok(());
            }
            scan = (scan + 1) % side.cr_count;
            if scan == self.trans_slot.get() {
                return Err(DeviceError::Busy);
            }
        }
    }

    fn start_transaction(&self) -> Result<(), DeviceError> {
        if self.journal.borrow().is_none() {
            return Err(DeviceError::Incompatible("no journal attached"));
        }
        let graph = &self.graph;
        let keep = graph.create_noop(None, None, &[]);
        graph.claim_noop(keep);
        let wait = graph.create_noop(None, None, &[]);
        graph.claim_noop(wait);
        let hold = graph.create_noop(None, Some(self.owner), &[]);
        graph.claim_noop(hold);
        graph.set_flags(hold, PatchFlags::MANAGED);
        let safe = graph.create_noop(None, None, &[]);
        graph.claim_noop(safe);
        let done = graph.create_noop(None, None, &[]);
        graph.claim_noop(done);

        let unwind = |err: DeviceError| {
            for id in [done, safe, hold, wait, keep] {
                graph.destroy(id);
            }
            err
        };
        graph.add_depend(wait, keep).map_err(|e| unwind(e.into()))?;
        // Serialize this commit record after the previous transaction's.
        if let Some(prev) = self.prev_cr.get() {
            graph.add_depend(wait, prev).map_err(|e| unwind(e.into()))?;
        }

        self.grab_slot(done).map_err(unwind)?;
        // Terminate the chain: a head record points at its own slot.
        self.prev_slot.set(self.trans_slot.get());

        *self.tx.borrow_mut() = Some(Transaction {
            keep,
            wait,
            hold,
            safe,
            done,
            block_map: FxHashMap::default(),
        });
        debug!(slot = self.trans_slot.get(), "transaction opened");
        Ok(())
    }

    /// Maps a base block into the current transaction's journal slot,
    /// spilling a `SUBCOMMIT` record and claiming a fresh slot when the
    /// current one fills.
    fn lookup_block(&self, block: &BlockRef) -> Result<u32, DeviceError> {
        let (wait, done, blocks_so_far) = {
            let tx = self.tx.borrow();
            let tx = tx.as_ref().ok_or(DeviceError::Incompatible("no open transaction"))?;
            if let Some(&number) = tx.block_map.get(&block.number()) {
                return Ok(number);
            }
            #[allow(clippy::cast_possible_truncation)] // bounded by journal capacity
            let mapped = tx.block_map.len() as u32;
            (tx.wait, tx.done, mapped)
        };
        let journal = self.journal_dev()?;
        let npb = numbers_per_block(self.blocksize);
        let nbc = trans_number_block_count(self.blocksize, self.trans_total_blocks);
        let last = blocks_so_far % self.trans_data_blocks;

        if blocks_so_far > 0 && last == 0 {
            // Slot full: close it with a subcommit record and move on.
            let record_block = journal.read_block(
                u32::from(self.trans_slot.get()) * self.trans_total_blocks,
                1,
            )?;
            let record = CommitRecord::new(
                CommitRecordType::Subcommit,
                self.prev_slot.get(),
                self.trans_data_blocks,
            );
            let mut head = None;
            let subcommit = self.graph.create_byte_detached(
                &record_block,
                &*journal,
                0,
                bytemuck::bytes_of(&record),
                &mut head,
            )?;
            self.graph.add_depend(wait, subcommit)?;
            self.journal_write(&journal, &record_block)?;
            self.grab_slot(done)?;
            debug!(slot = self.trans_slot.get(), "transaction spilled into new slot");
        }

        let slot_base = u32::from(self.trans_slot.get()) * self.trans_total_blocks;
        let number_block = journal.read_block(slot_base + 1 + last / npb, 1)?;
        let data_number = slot_base + 1 + nbc + last;

        let mut head = None;
        let offset = u16::try_from((last % npb) * 4).map_err(|_| DeviceError::InvalidBlock)?;
        let entry = self.graph.create_byte_detached(
            &number_block,
            &*journal,
            offset,
            &block.number().to_le_bytes(),
            &mut head,
        )?;
        self.graph.add_depend(wait, entry)?;
        self.journal_write(&journal, &number_block)?;

        if let Some(tx) = self.tx.borrow_mut().as_mut() {
            tx.block_map.insert(block.number(), data_number);
        }
        Ok(data_number)
    }

    /// Closes the open transaction: commit record, cancellation, release.
    pub fn stop_transaction(&self) -> Result<(), DeviceError> {
        let Some(tx) = self.tx.borrow_mut().take() else {
            return Ok(());
        };
        let journal = self.journal_dev()?;
        let record_block = journal.read_block(
            u32::from(self.trans_slot.get()) * self.trans_total_blocks,
            1,
        )?;

        #[allow(clippy::cast_possible_truncation)] // bounded by journal capacity
        let mapped = tx.block_map.len() as u32;
        let remainder = mapped % self.trans_data_blocks;
        let nblocks = if mapped > 0 && remainder == 0 {
            self.trans_data_blocks
        } else {
            remainder
        };

        // Commit record: depends on wait, held below hold, remembered as
        // the previous commit for the next transaction.
        let record = CommitRecord::new(CommitRecordType::Commit, self.prev_slot.get(), nblocks);
        let mut head = Some(tx.wait);
        let commit = self.graph.create_byte_detached(
            &record_block,
            &*journal,
            0,
            bytemuck::bytes_of(&record),
            &mut head,
        )?;
        self.graph.add_depend(tx.hold, commit)?;
        self.graph.weak_retain(Some(commit), &self.prev_cr);

        // Cancellation: the same bytes with type EMPTY, allowed on disk
        // only after the file system data (via safe).
        let cancel_record = CommitRecord::new(CommitRecordType::Empty, self.prev_slot.get(), nblocks);
        let mut head = Some(tx.safe);
        let cancel = self.graph.create_byte_detached(
            &record_block,
            &*journal,
            0,
            bytemuck::bytes_of(&cancel_record),
            &mut head,
        )?;
        self.graph.add_depend(tx.done, cancel)?;

        // Let the chain drain: unmanage hold, satisfy keep.
        self.graph.clear_flags(tx.hold, PatchFlags::MANAGED);
        self.graph.set_owner(tx.hold, None);
        self.graph.satisfy(tx.keep);

        self.journal_write(&journal, &record_block)?;

        let next_slot = (self.trans_slot.get() + 1)
            % self.journal.borrow().as_ref().map_or(1, |s| s.cr_count);
        self.trans_slot.set(next_slot);
        debug!(nblocks, "transaction stopped");
        Ok(())
    }

    /// Host timer callback: closes the transaction unless a hold is
    /// outstanding. Returns whether a transaction was stopped.
    pub fn timer_tick(&self) -> Result<bool, DeviceError> {
        if self.tx.borrow().is_none() {
            return Ok(false);
        }
        if self.holds.active() {
            debug!("timer tick skipped: journal hold outstanding");
            return Ok(false);
        }
        self.stop_transaction()?;
        Ok(true)
    }

    // ── Replay ──────────────────────────────────────────────────────

    fn replay_journal(&self) -> Result<(), DeviceError> {
        let cr_count = self
            .journal
            .borrow()
            .as_ref()
            .map_or(0, |side| side.cr_count);
        for slot in 0..cr_count {
            let mut anchors = None;
            let result = self.replay_single(
                u32::from(slot) * self.trans_total_blocks,
                CommitRecordType::Commit,
                &mut anchors,
            );
            if let Err(e) = result {
                if let Some(anchors) = anchors {
                    self.graph.satisfy(anchors.keep);
                    if self.graph.befores(anchors.done).is_empty() {
                        self.graph.satisfy(anchors.done);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn replay_single(
        &self,
        transaction_start: u32,
        expected: CommitRecordType,
        anchors: &mut Option<ReplayAnchors>,
    ) -> Result<(), DeviceError> {
        let journal = self.journal_dev()?;
        let commit_block = journal.read_block(transaction_start, 1)?;
        let Some(record) = CommitRecord::parse(&commit_block.contents()) else {
            return Ok(());
        };
        if record.record_type() != Some(expected) {
            return Ok(());
        }

        if expected == CommitRecordType::Commit {
            let keep = self.graph.create_noop(None, None, &[]);
            self.graph.claim_noop(keep);
            let safe = self.graph.create_noop(None, None, &[]);
            self.graph.claim_noop(safe);
            let done = self.graph.create_noop(None, None, &[]);
            self.graph.claim_noop(done);
            self.graph.add_depend(safe, keep)?;
            *anchors = Some(ReplayAnchors { keep, safe, done });
        }
        let (keep, safe, done) = match anchors.as_ref() {
            Some(a) => (a.keep, a.safe, a.done),
            None => return Err(DeviceError::Incompatible("subcommit outside a chain")),
        };

        // Chained transaction: replay the previous slot first.
        let next_start = u32::from(record.next()) * self.trans_total_blocks;
        if next_start != transaction_start {
            self.replay_single(next_start, CommitRecordType::Subcommit, anchors)?;
        }

        let slot = transaction_start / self.trans_total_blocks;
        info!(
            slot,
            nblocks = record.nblocks(),
            "recovering journal transaction"
        );

        let npb = numbers_per_block(self.blocksize);
        let nbc = trans_number_block_count(self.blocksize, self.trans_total_blocks);
        let number_base = transaction_start + 1;
        let mut data_number = number_base + nbc;

        let mut index = 0u32;
        while index < record.nblocks() {
            let chunk = (record.nblocks() - index).min(npb);
            let number_block = journal.read_block(number_base + index / npb, 1)?;
            let numbers = number_block.contents();
            for entry in 0..chunk {
                let at = entry as usize * 4;
                let target = u32::from_le_bytes([
                    numbers[at],
                    numbers[at + 1],
                    numbers[at + 2],
                    numbers[at + 3],
                ]);
                let data_block = journal.read_block(data_number, 1)?;
                data_number += 1;

                let output = self.base.read_block(target, 1)?;
                let mut head = None;
                let patch = self.graph.create_full_detached(
                    &output,
                    &*self.base,
                    &data_block.contents(),
                    &mut head,
                    false,
                )?;
                self.graph.add_depend(safe, patch)?;
                self.base.write_block(&output)?;
            }
            index += chunk;
        }

        {
            let side = self.journal.borrow();
            if let Some(side) = side.as_ref() {
                let slot_index = usize::from(u16::try_from(slot).unwrap_or(0));
                self.graph
                    .weak_retain(Some(done), &side.cr_retain[slot_index]);
            }
        }

        // Only the chain's COMMIT record needs cancelling.
        if expected == CommitRecordType::Commit {
            let empty = CommitRecordType::Empty.code().to_le_bytes();
            let mut head = Some(safe);
            let cancel = self.graph.create_byte_detached(
                &commit_block,
                &*journal,
                CR_TYPE_OFFSET,
                &empty,
                &mut head,
            )?;
            self.graph.add_depend(done, cancel)?;
            self.graph.satisfy(keep);
            *anchors = None;
            self.journal_write(&journal, &commit_block)?;
        }
        Ok(())
    }
}

impl BlockDevice for JournalDevice {
    fn blocksize(&self) -> u16 {
        self.blocksize
    }

    fn numblocks(&self) -> u32 {
        self.length
    }

    fn atomicsize(&self) -> u16 {
        self.base.atomicsize()
    }

    fn devlevel(&self) -> u16 {
        self.level
    }

    fn owner(&self) -> OwnerId {
        self.owner
    }

    fn read_block(&self, number: u32, count: u16) -> Result<BlockRef, DeviceError> {
        if count == 0 || u64::from(number) + u64::from(count) > u64::from(self.length) {
            return Err(DeviceError::InvalidBlock);
        }
        self.base.read_block(number, count)
    }

    fn synthetic_read_block(
        &self,
        number: u32,
        count: u16,
    ) -> Result<(BlockRef, bool), DeviceError> {
        if count == 0 || u64::from(number) + u64::from(count) > u64::from(self.length) {
            return Err(DeviceError::InvalidBlock);
        }
        self.base.synthetic_read_block(number, count)
    }

    fn write_block(&self, block: &BlockRef) -> Result<(), DeviceError> {
        if block.count() != 1 {
            return Err(DeviceError::InvalidBlock);
        }
        if u64::from(block.number()) + u64::from(block.count()) > u64::from(self.length) {
            return Err(DeviceError::InvalidBlock);
        }

        if self.recursion.get() {
            self.graph.push_down(block, self.owner, self.base.owner());
            return self.base.write_block(block);
        }

        // A block with no changes has nothing worth journaling.
        if !block.has_changes() {
            return Ok(());
        }

        if self.tx.borrow().is_none() {
            self.start_transaction()?;
        }
        let (hold, safe, wait) = {
            let tx = self.tx.borrow();
            let tx = tx.as_ref().ok_or(DeviceError::Incompatible("no open transaction"))?;
            (tx.hold, tx.safe, tx.wait)
        };

        // Hook every arriving patch into the transaction skeleton and
        // stamp it as ours.
        for patch in self.graph.block_patches(block) {
            if self.graph.owner_of(patch) == Some(self.owner) {
                self.graph.add_depend(patch, hold)?;
                self.graph.add_depend(safe, patch)?;
                self.graph.stamp(patch, self.stamp);
            }
        }

        let journal = self.journal_dev()?;
        let number = self.lookup_block(block)?;
        let journal_block = journal.read_block(number, 1)?;

        // Copy the block as it looks *below* this device: our own stamped
        // patches are rolled back around the snapshot.
        let tail = revision::prepare_stamp(&self.graph, block, self.stamp)?;
        let snapshot = block.contents();
        let mut head = None;
        let copy = self.graph.create_full_detached(
            &journal_block,
            &*journal,
            &snapshot,
            &mut head,
            false,
        )?;
        tail.revert(&self.graph)?;
        self.graph.add_depend(wait, copy)?;
        self.journal_write(&journal, &journal_block)?;

        self.graph.push_down(block, self.owner, self.base.owner());
        self.base.write_block(block)
    }

    fn cancel_block(&self, number: u32) -> Result<(), DeviceError> {
        if number >= self.length {
            return Err(DeviceError::InvalidBlock);
        }
        self.base.cancel_block(number)
    }

    fn sync(&self, block: Option<u32>) -> Result<(), DeviceError> {
        if self.tx.borrow().is_some() && !self.holds.active() {
            self.stop_transaction()?;
        }
        // Journal first so the commit record can drain, base next so the
        // cancellation becomes eligible, journal again to retire the slot.
        let journal = self.journal.borrow().as_ref().map(|s| Rc::clone(&s.dev));
        if let Some(journal) = &journal {
            journal.sync(None)?;
        }
        self.base.sync(block)?;
        if let Some(journal) = &journal {
            journal.sync(None)?;
        }
        Ok(())
    }

    fn write_head(&self) -> Option<PatchId> {
        self.base.write_head()
    }
}

impl Drop for JournalDevice {
    fn drop(&mut self) {
        if self.tx.borrow().is_some() {
            let _ = self.stop_transaction();
        }
        let side = self.journal.borrow_mut().take();
        if let Some(side) = side {
            for slot in &side.cr_retain {
                self.graph.weak_release(slot);
            }
        }
        self.graph.weak_release(&self.prev_cr);
        self.graph.release_stamp(self.stamp);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::cache::WritebackCache;
    use crate::mem::MemDevice;

    #[test]
    fn commit_record_layout_is_twelve_bytes_little_endian() {
        let record = CommitRecord::new(CommitRecordType::Commit, 3, 5);
        let bytes = bytemuck::bytes_of(&record);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &0x5AFE_DA7Au32.to_le_bytes());
        assert_eq!(&bytes[4..6], &2u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &3u16.to_le_bytes());
        assert_eq!(&bytes[8..12], &5u32.to_le_bytes());

        let parsed = CommitRecord::parse(bytes).unwrap();
        assert_eq!(parsed.record_type(), Some(CommitRecordType::Commit));
        assert_eq!(parsed.next(), 3);
        assert_eq!(parsed.nblocks(), 5);
    }

    #[test]
    fn bad_magic_does_not_parse() {
        let mut bytes = [0u8; 12];
        bytes[0] = 0xFF;
        assert!(CommitRecord::parse(&bytes).is_none());
        assert!(CommitRecord::parse(&bytes[..4]).is_none());
    }

    #[test]
    fn slot_geometry_partitions_correctly() {
        // 16 blocks of 512 bytes per slot: 1 commit record, 1 number-list
        // block (128 entries ≥ 15), 14 data blocks.
        let total = 16;
        let nbc = trans_number_block_count(512, total);
        assert_eq!(nbc, 1);
        assert_eq!(total - 1 - nbc, 14);

        // 4 KiB blocks, nominal 256 KiB slot.
        let total = 64;
        let nbc = trans_number_block_count(4096, total);
        assert_eq!(nbc, 1);
        assert_eq!(total - 1 - nbc, 62);
    }

    #[test]
    fn holds_count_up_and_down() {
        let holds = JournalHolds::new();
        assert!(!holds.active());
        holds.add();
        holds.add();
        assert!(holds.active());
        holds.remove();
        assert!(holds.active());
        holds.remove();
        assert!(!holds.active());
    }

    /// The cancellation may reach disk only after every fs-data patch,
    /// every fs-data patch only after the commit record, and the commit
    /// record only after every journal-data patch. Both sides sit behind
    /// write-back caches so nothing satisfies and the whole skeleton stays
    /// observable.
    #[test]
    fn commit_cancel_ordering_is_enforced_by_the_graph() {
        let graph = Rc::new(PatchGraph::new());
        let holds = JournalHolds::new();
        let config = Config {
            transaction_size: 16 * 512,
            ..Config::default()
        };
        let base = WritebackCache::new(
            Rc::clone(&graph),
            MemDevice::new(Rc::clone(&graph), 512, 64),
        );
        let journal_side = WritebackCache::new(
            Rc::clone(&graph),
            MemDevice::new(Rc::clone(&graph), 512, 64),
        );
        let dev = JournalDevice::new(
            Rc::clone(&graph),
            Rc::<WritebackCache>::clone(&base),
            holds,
            &config,
        )
        .unwrap();
        let journal_ref: Rc<dyn BlockDevice> = Rc::<WritebackCache>::clone(&journal_side);
        dev.set_journal(Some(journal_ref)).unwrap();

        let block = dev.read_block(7, 1).unwrap();
        let mut head = None;
        graph
            .create_byte(&block, &*dev, 0, &[0xAB; 16], &mut head)
            .unwrap();
        let fsdata = head.unwrap();
        dev.write_block(&block).unwrap();

        let (wait, hold, safe) = {
            let tx = dev.tx.borrow();
            let tx = tx.as_ref().unwrap();
            (tx.wait, tx.hold, tx.safe)
        };
        // Slot 0 journal data: the number-list entry (block 1) and the
        // block copy (block 2), both collected under wait.
        let entry = graph.block_patches(&journal_side.read_block(1, 1).unwrap())[0];
        let copy = graph.block_patches(&journal_side.read_block(2, 1).unwrap())[0];
        assert!(graph.depends_on(wait, entry));
        assert!(graph.depends_on(wait, copy));
        assert!(graph.depends_on(fsdata, hold));
        assert!(graph.depends_on(safe, fsdata));

        dev.stop_transaction().unwrap();

        let commit = dev.prev_cr.get().unwrap();
        let done = {
            let journal = dev.journal.borrow();
            journal.as_ref().unwrap().cr_retain[0].get().unwrap()
        };
        let cancel = graph
            .block_patches(&journal_side.read_block(0, 1).unwrap())
            .into_iter()
            .find(|&p| p != commit)
            .unwrap();

        // journal data < commit record < fs data < cancellation < done.
        assert!(graph.depends_on(commit, entry));
        assert!(graph.depends_on(commit, copy));
        assert!(graph.depends_on(fsdata, commit));
        assert!(graph.depends_on(cancel, fsdata));
        assert!(graph.depends_on(cancel, commit));
        assert!(graph.depends_on(done, cancel));
        // Strict: no edge runs the other way.
        assert!(!graph.depends_on(entry, commit));
        assert!(!graph.depends_on(copy, commit));
        assert!(!graph.depends_on(commit, fsdata));
        assert!(!graph.depends_on(fsdata, cancel));
        assert!(!graph.depends_on(cancel, done));
    }
}
