// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! quilt-core: journaled, dependency-tracked block device stack.
//!
//! The core of a crash-consistent storage stack built on three pieces: a
//! fine-grained *patch graph* of pending block modifications whose edges
//! dictate write order, *patch groups* that aggregate patches into atomic,
//! orderable units, and a *journaling block device* that snapshots dirty
//! blocks into transaction slots and replays committed transactions after a
//! crash. A terminal RAM device and a write-back cache complete the stack
//! for hosting and testing.
//!
//! The whole crate is single-threaded and cooperative: the host serializes
//! entry into the stack, and the patch graph is the only mechanism that
//! orders what reaches the medium.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::cognitive_complexity,
    clippy::option_if_let_else,
    clippy::significant_drop_tightening,
    clippy::doc_markdown,
    clippy::too_many_lines,
    clippy::struct_excessive_bools,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::similar_names,
    clippy::trivially_copy_pass_by_ref,
    clippy::manual_let_else,
    clippy::needless_pass_by_value
)]

mod bd;
mod block;
mod cache;
mod config;
mod graph;
mod group;
mod id;
mod journal;
mod mem;
mod patch;
/// Revision tails: rolling patches off a block around a write or snapshot.
pub mod revision;

// Re-exports for stable public API
/// Block device seam and device errors.
pub use bd::{BlockDevice, DeviceError};
/// Block and data descriptors.
pub use block::{Bdesc, BlockRef, DataBlock};
/// Write-back cache device.
pub use cache::WritebackCache;
/// Stack configuration.
pub use config::Config;
/// The patch graph engine, its errors, and the scope hook seam.
pub use graph::{GraphError, PatchGraph, ScopeHooks, MAX_STAMPS};
/// Patch groups, scopes, and their shared environment.
pub use group::{GroupEnv, GroupError, GroupFlags, Scope};
/// Identifier types.
pub use id::{GroupId, OwnerId, PatchId, Stamp};
/// Journal device, commit records, and transaction holds.
pub use journal::{CommitRecord, CommitRecordType, JournalDevice, JournalHolds, JOURNAL_MAGIC};
/// Terminal RAM-backed device.
pub use mem::MemDevice;
/// Patch flags and weak-reference slots.
pub use patch::{PatchFlags, PatchSlot};
