// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared helpers for integration tests: a full journaled stack over two
//! RAM media, with crash-and-restart support.
#![allow(dead_code, clippy::unwrap_used, clippy::cast_possible_truncation)]

use std::rc::Rc;

use quilt_core::{
    BlockDevice, Config, GroupEnv, JournalDevice, JournalHolds, MemDevice, PatchGraph,
    WritebackCache,
};

/// A complete journaled stack:
///
/// ```text
/// (tests) → JournalDevice ─ base ──→ WritebackCache → MemDevice
///                         └ journal → WritebackCache → MemDevice
/// ```
pub struct Stack {
    pub graph: Rc<PatchGraph>,
    pub holds: Rc<JournalHolds>,
    pub env: Rc<GroupEnv>,
    pub base_mem: Rc<MemDevice>,
    pub journal_mem: Rc<MemDevice>,
    pub base_cache: Rc<WritebackCache>,
    pub journal_cache: Rc<WritebackCache>,
    pub journal: Rc<JournalDevice>,
}

/// Geometry for a journaled stack.
#[derive(Clone, Copy)]
pub struct Geometry {
    pub blocksize: u16,
    pub base_blocks: u32,
    pub journal_blocks: u32,
    pub transaction_size: u32,
}

impl Geometry {
    /// 64-block base and journal, 512-byte blocks, 16-block slots
    /// (1 commit record + 1 number list + 14 data blocks per slot,
    /// 4 slots total).
    pub fn small() -> Self {
        Self {
            blocksize: 512,
            base_blocks: 64,
            journal_blocks: 64,
            transaction_size: 16 * 512,
        }
    }

    pub fn config(&self) -> Config {
        Config {
            transaction_size: self.transaction_size,
            ..Config::default()
        }
    }
}

pub fn journaled_stack(geometry: Geometry) -> Stack {
    let base_medium = vec![0u8; usize::from(geometry.blocksize) * geometry.base_blocks as usize];
    let journal_medium =
        vec![0u8; usize::from(geometry.blocksize) * geometry.journal_blocks as usize];
    restart(geometry, base_medium, journal_medium)
}

/// Builds a fresh stack over existing media, replaying the journal — the
/// crash-recovery path when the media came from [`crash`].
pub fn restart(geometry: Geometry, base_medium: Vec<u8>, journal_medium: Vec<u8>) -> Stack {
    let graph = Rc::new(PatchGraph::new());
    let holds = JournalHolds::new();
    let config = geometry.config();
    let env = GroupEnv::new(Rc::clone(&graph), Rc::clone(&holds), &config);

    let base_mem = MemDevice::over_medium(
        Rc::clone(&graph),
        geometry.blocksize,
        geometry.blocksize,
        base_medium,
    );
    let journal_mem = MemDevice::over_medium(
        Rc::clone(&graph),
        geometry.blocksize,
        geometry.blocksize,
        journal_medium,
    );
    let base_cache = WritebackCache::new(Rc::clone(&graph), Rc::<MemDevice>::clone(&base_mem));
    let journal_cache = WritebackCache::new(Rc::clone(&graph), Rc::<MemDevice>::clone(&journal_mem));

    let journal = JournalDevice::new(
        Rc::clone(&graph),
        Rc::<WritebackCache>::clone(&base_cache),
        Rc::clone(&holds),
        &config,
    )
    .unwrap();
    let journal_side: Rc<dyn BlockDevice> = Rc::<WritebackCache>::clone(&journal_cache);
    journal.set_journal(Some(journal_side)).unwrap();

    Stack {
        graph,
        holds,
        env,
        base_mem,
        journal_mem,
        base_cache,
        journal_cache,
        journal,
    }
}

/// Tears the stack down, keeping only what reached the media.
pub fn crash(stack: Stack) -> (Vec<u8>, Vec<u8>) {
    let base = stack.base_mem.medium_snapshot();
    let journal = stack.journal_mem.medium_snapshot();
    (base, journal)
}

impl Stack {
    /// Writes `data` at `offset` in base block `number` through the
    /// journal device.
    pub fn write_bytes(&self, number: u32, offset: u16, data: &[u8]) {
        let block = self.journal.read_block(number, 1).unwrap();
        let mut head = None;
        self.graph
            .create_byte(&block, &*self.journal, offset, data, &mut head)
            .unwrap();
        self.journal.write_block(&block).unwrap();
    }

    /// Flushes both sides until quiescent: journal first so commit records
    /// drain, base next, journal again so cancellations can retire.
    pub fn sync_all(&self) {
        self.journal_cache.sync(None).unwrap();
        self.base_cache.sync(None).unwrap();
        self.journal_cache.sync(None).unwrap();
    }

    /// Reads the bytes of base block `number` as the *medium* holds them.
    pub fn base_medium_block(&self, number: u32) -> Vec<u8> {
        let bs = usize::from(self.journal.blocksize());
        let medium = self.base_mem.medium_snapshot();
        medium[number as usize * bs..(number as usize + 1) * bs].to_vec()
    }

    /// Reads the bytes of journal block `number` as the medium holds them.
    pub fn journal_medium_block(&self, number: u32) -> Vec<u8> {
        let bs = usize::from(self.journal.blocksize());
        let medium = self.journal_mem.medium_snapshot();
        medium[number as usize * bs..(number as usize + 1) * bs].to_vec()
    }
}

/// A recognizable per-block fill pattern.
pub fn pattern(tag: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| tag ^ (i as u8)).collect()
}

/// Installs a fmt subscriber honoring `RUST_LOG`, once per process.
/// Call from a test to watch the stack's tracing output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
