// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use gitsnapfs::inode::{BRANCHES_INO, ROOT_INO, TAGS_INO};
use gitsnapfs::repo::Repository;
use gix::objs::tree::EntryKind;
use rstest::rstest;

use super::{Invalidation, RefSnapshot};
use crate::fixtures::*;

#[rstest]
fn test_snapshot_diff_detects_moves_adds_and_removals() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let git = init_repo(tmpdir.path());
    let blob = write_blob(&git, b"hi\n");
    let tree = write_tree(&git, &[(EntryKind::Blob, "hello.txt", blob)]);
    let first = commit(&git, "main", tree);
    lightweight_tag(&git, "v1", first);

    let repo = Repository::open(tmpdir.path()).unwrap();
    let before = RefSnapshot::collect(&repo);
    assert!(before.diff(&before).is_empty());

    // move main forward, drop the tag, add a branch
    let second_tree = write_tree(
        &git,
        &[
            (EntryKind::Blob, "hello.txt", blob),
            (EntryKind::Blob, "second.txt", blob),
        ],
    );
    commit(&git, "main", second_tree);
    commit(&git, "topic", tree);
    std::fs::remove_file(git.git_dir().join("refs/tags/v1")).unwrap();

    let after = RefSnapshot::collect(&repo);
    let mut invalidations = before.diff(&after);
    invalidations.sort_by(|a, b| (a.parent, &a.name).cmp(&(b.parent, &b.name)));
    assert_eq!(
        invalidations,
        vec![
            Invalidation {
                parent: ROOT_INO,
                name: "HEAD".to_owned(),
            },
            Invalidation {
                parent: BRANCHES_INO,
                name: "main".to_owned(),
            },
            Invalidation {
                parent: BRANCHES_INO,
                name: "topic".to_owned(),
            },
            Invalidation {
                parent: TAGS_INO,
                name: "v1".to_owned(),
            },
        ]
    );
}

#[rstest]
fn test_snapshot_ignores_unreachable_tags() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let git = init_repo(tmpdir.path());
    let blob = write_blob(&git, b"hi\n");
    let tree = write_tree(&git, &[(EntryKind::Blob, "hello.txt", blob)]);
    commit(&git, "main", tree);
    // a tag straight at a blob never resolves to a commit
    lightweight_tag(&git, "blobby", blob);

    let repo = Repository::open(tmpdir.path()).unwrap();
    let snapshot = RefSnapshot::collect(&repo);
    assert!(snapshot.diff(&snapshot).is_empty());
    assert_eq!(snapshot.branches.len(), 1);
    assert!(snapshot.tags.is_empty());
}
