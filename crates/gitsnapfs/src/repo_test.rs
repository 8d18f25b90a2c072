// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use gix::objs::tree::EntryKind;
use rstest::rstest;

use super::{EntryMode, ObjectKind, RefNamespace, Repository};
use crate::fixtures::*;
use crate::Error;

#[rstest]
fn test_parse_object_id_rejects_malformed() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let _git = init_repo(tmpdir.path());
    let repo = Repository::open(tmpdir.path()).unwrap();

    for name in [
        "deadbeef",                                   // short
        "DEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF",   // uppercase
        "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz",   // not hex
        "0123456789abcdef0123456789abcdef012345678",  // off by one
        "",
    ] {
        assert!(
            matches!(repo.parse_object_id(name), Err(Error::InvalidCommitId(_))),
            "{name:?} should be rejected"
        );
    }

    let full = "0123456789abcdef0123456789abcdef01234567";
    assert!(repo.parse_object_id(full).is_ok());
}

#[rstest]
fn test_find_commit_and_tree() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let git = init_repo(tmpdir.path());
    let blob = write_blob(&git, b"hi\n");
    let link = write_blob(&git, b"hello.txt");
    let subtree = write_tree(&git, &[(EntryKind::Blob, "nested.txt", blob)]);
    let tree = write_tree(
        &git,
        &[
            (EntryKind::Tree, "dir", subtree),
            (EntryKind::Blob, "hello.txt", blob),
            (EntryKind::Link, "link", link),
            (EntryKind::BlobExecutable, "run.sh", blob),
        ],
    );
    let commit_id = commit(&git, "main", tree);
    drop(git);

    let repo = Repository::open(tmpdir.path()).unwrap();
    let info = repo.find_commit(commit_id).unwrap();
    assert_eq!(info.tree, tree);
    assert!(info.committer_time > 0);

    let entries = repo.find_tree(tree).unwrap();
    let summary: Vec<(&[u8], EntryMode)> = entries
        .iter()
        .map(|e| (e.name.as_slice(), e.mode))
        .collect();
    assert_eq!(
        summary,
        vec![
            (b"dir".as_slice(), EntryMode::Tree),
            (b"hello.txt".as_slice(), EntryMode::Blob),
            (b"link".as_slice(), EntryMode::Link),
            (b"run.sh".as_slice(), EntryMode::BlobExecutable),
        ]
    );

    assert!(matches!(
        repo.find_commit(blob),
        Err(Error::UnknownObject(_))
    ));
}

#[rstest]
fn test_blob_access() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let git = init_repo(tmpdir.path());
    let blob = write_blob(&git, b"some file content\n");
    let tree = write_tree(&git, &[(EntryKind::Blob, "f", blob)]);
    let commit_id = commit(&git, "main", tree);
    drop(git);

    let repo = Repository::open(tmpdir.path()).unwrap();
    assert_eq!(repo.find_blob(blob).unwrap(), b"some file content\n");
    assert_eq!(repo.blob_size(blob).unwrap(), 18);
    assert_eq!(repo.object_kind(blob).unwrap(), ObjectKind::Blob);
    assert_eq!(repo.object_kind(tree).unwrap(), ObjectKind::Tree);
    assert_eq!(repo.object_kind(commit_id).unwrap(), ObjectKind::Commit);
}

#[rstest]
fn test_resolve_refs() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let git = init_repo(tmpdir.path());
    let blob = write_blob(&git, b"hi\n");
    let tree = write_tree(&git, &[(EntryKind::Blob, "hello.txt", blob)]);
    let commit_id = commit(&git, "main", tree);
    lightweight_tag(&git, "v1", commit_id);
    annotated_tag(&git, "v2", commit_id, gix::object::Kind::Commit);
    annotated_tag(&git, "orphan", blob, gix::object::Kind::Blob);
    drop(git);

    let repo = Repository::open(tmpdir.path()).unwrap();
    assert_eq!(repo.resolve_ref("HEAD").unwrap(), commit_id);
    assert_eq!(repo.resolve_ref("refs/heads/main").unwrap(), commit_id);
    assert_eq!(repo.resolve_ref("refs/tags/v1").unwrap(), commit_id);
    // annotated tags peel through the tag object to the commit
    assert_eq!(repo.resolve_ref("refs/tags/v2").unwrap(), commit_id);
    // tags that do not name a commit do not resolve
    assert!(matches!(
        repo.resolve_ref("refs/tags/orphan"),
        Err(Error::UnknownReference(_))
    ));
    assert!(matches!(
        repo.resolve_ref("refs/heads/missing"),
        Err(Error::UnknownReference(_))
    ));
}

#[rstest]
fn test_enumerate_refs_sorted() {
    let tmpdir = tempfile::Builder::new()
        .prefix("gitsnapfs-test")
        .tempdir()
        .unwrap();
    let git = init_repo(tmpdir.path());
    let blob = write_blob(&git, b"hi\n");
    let tree = write_tree(&git, &[(EntryKind::Blob, "hello.txt", blob)]);
    let commit_id = commit(&git, "main", tree);
    commit(&git, "feature/b", tree);
    commit(&git, "feature/a", tree);
    lightweight_tag(&git, "v2", commit_id);
    lightweight_tag(&git, "v10", commit_id);
    drop(git);

    let repo = Repository::open(tmpdir.path()).unwrap();
    assert_eq!(
        repo.enumerate_refs(RefNamespace::Branches).unwrap(),
        vec!["feature/a", "feature/b", "main"]
    );
    // byte order, not version order
    assert_eq!(
        repo.enumerate_refs(RefNamespace::Tags).unwrap(),
        vec!["v10", "v2"]
    );
}
