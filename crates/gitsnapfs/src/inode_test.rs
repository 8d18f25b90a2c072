// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use gix::ObjectId;
use rstest::rstest;

use super::{
    derive_ino,
    gitlink_ino,
    is_gitlink,
    is_root_ino,
    InodeLedger,
    ObjectTag,
    BRANCHES_INO,
    COMMITS_INO,
    HEAD_INO,
    ROOT_INO,
    TAGS_INO,
};
use crate::Error;

fn oid_from(bytes: [u8; 20]) -> ObjectId {
    ObjectId::try_from(&bytes[..]).unwrap()
}

/// Two ids that agree on their low 60 bits but differ above them.
fn colliding_pair() -> (ObjectId, ObjectId) {
    let mut a = [0u8; 20];
    let mut b = [0u8; 20];
    a[..12].fill(0xaa);
    b[..12].fill(0xbb);
    for tail in 12..20 {
        a[tail] = tail as u8;
        b[tail] = tail as u8;
    }
    // the top nibble of the low-64 window is masked off, so make the
    // two ids differ only there as well to prove the mask matters
    a[12] = 0x10 | (a[12] & 0x0f);
    b[12] = 0x20 | (b[12] & 0x0f);
    (oid_from(a), oid_from(b))
}

#[rstest]
fn test_derive_ino_is_deterministic() {
    let oid = oid_from([7u8; 20]);
    let first = derive_ino(&oid, ObjectTag::Blob);
    let second = derive_ino(&oid, ObjectTag::Blob);
    assert_eq!(first, second);

    let ledger_a = InodeLedger::new();
    let ledger_b = InodeLedger::new();
    assert_eq!(
        ledger_a.allocate(&oid, ObjectTag::Blob).unwrap(),
        ledger_b.allocate(&oid, ObjectTag::Blob).unwrap(),
    );
}

#[rstest]
fn test_tags_partition_the_inode_space() {
    let oid = oid_from([9u8; 20]);
    let blob = derive_ino(&oid, ObjectTag::Blob);
    let tree = derive_ino(&oid, ObjectTag::Tree);
    let link = derive_ino(&oid, ObjectTag::Symlink);
    assert_ne!(blob, tree);
    assert_ne!(blob, link);
    assert_ne!(tree, link);
    // low bits agree, only the tag nibble differs
    assert_eq!(blob & ((1 << 60) - 1), tree & ((1 << 60) - 1));

    let gitlink = gitlink_ino(&oid);
    assert!(is_gitlink(gitlink));
    assert!(!is_gitlink(blob));
    assert!(!is_root_ino(gitlink));
    for root in [ROOT_INO, COMMITS_INO, BRANCHES_INO, TAGS_INO, HEAD_INO] {
        assert!(is_root_ino(root));
        assert_ne!(gitlink, root);
    }
}

#[rstest]
fn test_collision_first_wins() {
    let (first, second) = colliding_pair();
    assert_eq!(
        derive_ino(&first, ObjectTag::Blob),
        derive_ino(&second, ObjectTag::Blob)
    );

    let ledger = InodeLedger::new();
    let ino = ledger.allocate(&first, ObjectTag::Blob).unwrap();
    // re-allocating the winner keeps succeeding
    assert_eq!(ledger.allocate(&first, ObjectTag::Blob).unwrap(), ino);
    // the different object at the same inode is refused
    assert!(matches!(
        ledger.allocate(&second, ObjectTag::Blob),
        Err(Error::InodeClash(i)) if i == ino
    ));
    assert!(ledger.is_clash(ino));
    // the winner still resolves after the clash
    assert_eq!(ledger.bound(ino).unwrap().oid, first);
}

#[rstest]
fn test_collision_order_decides_the_winner() {
    let (first, second) = colliding_pair();

    let ledger = InodeLedger::new();
    let ino = ledger.allocate(&second, ObjectTag::Blob).unwrap();
    assert!(ledger.allocate(&first, ObjectTag::Blob).is_err());
    assert_eq!(ledger.bound(ino).unwrap().oid, second);
}

#[rstest]
fn test_same_low_bits_different_tags_do_not_clash() {
    let (first, second) = colliding_pair();
    let ledger = InodeLedger::new();
    let blob = ledger.allocate(&first, ObjectTag::Blob).unwrap();
    let tree = ledger.allocate(&second, ObjectTag::Tree).unwrap();
    assert_ne!(blob, tree);
    assert!(!ledger.is_clash(blob));
    assert!(!ledger.is_clash(tree));
}

#[rstest]
fn test_ledger_survives_reload() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let path = tmpdir.path().join("ledger");
    let (first, second) = colliding_pair();

    let ino = {
        let ledger = InodeLedger::load(&path).unwrap();
        let ino = ledger.allocate(&first, ObjectTag::Blob).unwrap();
        assert!(ledger.allocate(&second, ObjectTag::Blob).is_err());
        ledger.flush().unwrap();
        ino
    };

    let ledger = InodeLedger::load(&path).unwrap();
    let binding = ledger.bound(ino).expect("binding should survive reload");
    assert_eq!(binding.oid, first);
    assert_eq!(binding.tag, ObjectTag::Blob);
    assert!(ledger.is_clash(ino));
    // the reloaded ledger keeps refusing the loser
    assert!(ledger.allocate(&second, ObjectTag::Blob).is_err());
    assert_eq!(ledger.allocate(&first, ObjectTag::Blob).unwrap(), ino);
}

#[rstest]
fn test_reserved_root_inodes_are_refused() {
    // craft a blob whose low 60 bits equal the /commits inode
    let mut bytes = [0u8; 20];
    bytes[19] = COMMITS_INO as u8;
    let oid = oid_from(bytes);
    assert_eq!(derive_ino(&oid, ObjectTag::Blob), COMMITS_INO);

    let ledger = InodeLedger::new();
    assert!(matches!(
        ledger.allocate(&oid, ObjectTag::Blob),
        Err(Error::InodeClash(i)) if i == COMMITS_INO
    ));
    // reserved inodes never enter the ledger
    assert!(ledger.bound(COMMITS_INO).is_none());
    assert!(ledger.is_empty());
}

#[rstest]
fn test_concurrent_allocation_agrees_on_a_winner() {
    let (first, second) = colliding_pair();
    let ledger = std::sync::Arc::new(InodeLedger::new());

    let mut handles = Vec::new();
    for index in 0..8 {
        let ledger = std::sync::Arc::clone(&ledger);
        let candidate = if index % 2 == 0 { first } else { second };
        handles.push(std::thread::spawn(move || {
            ledger.allocate(&candidate, ObjectTag::Blob).ok()
        }));
    }
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    let winners: Vec<u64> = outcomes.into_iter().flatten().collect();
    assert!(!winners.is_empty());
    // whoever won, the ledger has exactly one binding and it matches
    // every successful call
    let ino = winners[0];
    assert!(winners.iter().all(|w| *w == ino));
    let bound = ledger.bound(ino).unwrap();
    assert!(bound.oid == first || bound.oid == second);
}
