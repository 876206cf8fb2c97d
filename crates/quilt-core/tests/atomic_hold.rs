// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Atomic groups holding the journal transaction open.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{journaled_stack, pattern, Geometry};
use quilt_core::{GroupError, GroupFlags, Scope};
use std::rc::Rc;

#[test]
fn engaged_atomic_group_blocks_transaction_close() {
    let stack = journaled_stack(Geometry::small());
    let scope = Scope::new(Rc::clone(&stack.env));
    scope.make_current();

    let group = scope.create(GroupFlags::ATOMIC).unwrap();
    scope.engage(group).unwrap();
    stack.write_bytes(5, 0, &pattern(0x99, 32));
    assert!(stack.journal.in_transaction());

    // The timer fires while the atomic group is engaged: the hold wins.
    assert!(!stack.journal.timer_tick().unwrap());
    assert!(stack.journal.in_transaction());

    // Disengage alone does not lift the hold; release does.
    scope.disengage(group).unwrap();
    assert!(!stack.journal.timer_tick().unwrap());
    scope.release(group).unwrap();

    assert!(stack.journal.timer_tick().unwrap());
    assert!(!stack.journal.in_transaction());

    scope.abandon(group).unwrap();
    scope.clear_current();

    stack.sync_all();
    assert_eq!(&stack.base_medium_block(5)[..32], &pattern(0x99, 32)[..]);
}

#[test]
fn atomic_group_spans_multiple_writes_in_one_transaction() {
    let stack = journaled_stack(Geometry::small());
    let scope = Scope::new(Rc::clone(&stack.env));
    scope.make_current();

    let group = scope.create(GroupFlags::ATOMIC).unwrap();
    scope.engage(group).unwrap();
    stack.write_bytes(6, 0, &pattern(0xA1, 32));
    // A tick between the writes must not split the group.
    assert!(!stack.journal.timer_tick().unwrap());
    stack.write_bytes(7, 0, &pattern(0xA2, 32));
    scope.disengage(group).unwrap();
    scope.release(group).unwrap();
    scope.abandon(group).unwrap();
    scope.clear_current();

    assert!(stack.journal.timer_tick().unwrap());
    stack.sync_all();
    assert_eq!(&stack.base_medium_block(6)[..32], &pattern(0xA1, 32)[..]);
    assert_eq!(&stack.base_medium_block(7)[..32], &pattern(0xA2, 32)[..]);
}

#[test]
fn only_one_atomic_group_at_a_time() {
    let stack = journaled_stack(Geometry::small());
    let scope = Scope::new(Rc::clone(&stack.env));
    let group = scope.create(GroupFlags::ATOMIC).unwrap();
    assert_eq!(
        scope.create(GroupFlags::ATOMIC).unwrap_err(),
        GroupError::AtomicExists
    );
    // Non-atomic groups are unaffected.
    let plain = scope.create(GroupFlags::empty()).unwrap();
    scope.abandon(plain).unwrap();

    scope.release(group).unwrap();
    scope.abandon(group).unwrap();
    let again = scope.create(GroupFlags::ATOMIC).unwrap();
    scope.release(again).unwrap();
    scope.abandon(again).unwrap();
}
