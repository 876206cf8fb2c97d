// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Byte patches split along the device's atomic-write boundaries.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::rc::Rc;

use quilt_core::{BlockDevice, MemDevice, PatchGraph};

#[test]
fn unaligned_write_splits_into_chained_atomic_units() {
    let graph = Rc::new(PatchGraph::new());
    // Atomic size 512, block size 4096.
    let dev = MemDevice::with_geometry(Rc::clone(&graph), 4096, 512, 16);
    let block = dev.read_block(0, 1).unwrap();

    // 1024 bytes starting at offset 256 → three patches:
    // [256, 512), [512, 1024), [1024, 1280).
    let data = vec![0xA5u8; 1024];
    let mut head = None;
    graph
        .create_byte(&block, &*dev, 256, &data, &mut head)
        .unwrap();

    let mut patches = graph.block_patches(&block);
    patches.sort_by_key(|&p| graph.byte_range(p));
    let ranges: Vec<_> = patches.iter().map(|&p| graph.byte_range(p).unwrap()).collect();
    assert_eq!(ranges, vec![(256, 512), (512, 1024), (1024, 1280)]);

    // Chained: the second depends on the first, the third on the second,
    // and the returned head is the third.
    assert_eq!(head, Some(patches[2]));
    assert_eq!(graph.befores(patches[1]), vec![patches[0]]);
    assert_eq!(graph.befores(patches[2]), vec![patches[1]]);
    assert!(graph.befores(patches[0]).is_empty());

    // The whole range is applied in memory.
    let contents = block.contents();
    assert!(contents[256..1280].iter().all(|&b| b == 0xA5));
    assert!(contents[..256].iter().all(|&b| b == 0));
    assert!(contents[1280..].iter().all(|&b| b == 0));
}

#[test]
fn aligned_write_within_one_unit_stays_single() {
    let graph = Rc::new(PatchGraph::new());
    let dev = MemDevice::with_geometry(Rc::clone(&graph), 4096, 512, 16);
    let block = dev.read_block(0, 1).unwrap();

    let mut head = None;
    graph
        .create_byte(&block, &*dev, 512, &[1u8; 100], &mut head)
        .unwrap();
    let patches = graph.block_patches(&block);
    assert_eq!(patches.len(), 1);
    assert_eq!(graph.byte_range(patches[0]), Some((512, 612)));
}

#[test]
fn exact_multiple_ends_on_a_boundary() {
    let graph = Rc::new(PatchGraph::new());
    let dev = MemDevice::with_geometry(Rc::clone(&graph), 4096, 512, 16);
    let block = dev.read_block(0, 1).unwrap();

    // [512, 1536): two full units.
    let mut head = None;
    graph
        .create_byte(&block, &*dev, 512, &[2u8; 1024], &mut head)
        .unwrap();
    let mut patches = graph.block_patches(&block);
    patches.sort_by_key(|&p| graph.byte_range(p));
    let ranges: Vec<_> = patches.iter().map(|&p| graph.byte_range(p).unwrap()).collect();
    assert_eq!(ranges, vec![(512, 1024), (1024, 1536)]);
}

#[test]
fn init_covers_the_whole_block() {
    let graph = Rc::new(PatchGraph::new());
    let dev = MemDevice::with_geometry(Rc::clone(&graph), 4096, 512, 16);
    let block = dev.read_block(2, 1).unwrap();
    let mut head = None;
    graph
        .create_byte(&block, &*dev, 100, &[0xFF; 8], &mut head)
        .unwrap();
    let mut init_head = None;
    graph.create_init(&block, &*dev, &mut init_head).unwrap();
    // Eight zero-fill patches on top of the earlier write.
    assert_eq!(graph.block_patches(&block).len(), 9);
    assert!(block.contents().iter().all(|&b| b == 0));
}
