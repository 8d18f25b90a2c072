// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Helpers for building throwaway git repositories in tests.

use std::path::Path;

use gix::objs::tree::{Entry, EntryKind};
use gix::ObjectId;

#[allow(dead_code)]
pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

/// Initialize a repository with an identity configured so commits can
/// be created without touching the caller's global git config.
pub fn init_repo(dir: &Path) -> gix::Repository {
    let repo = gix::init(dir).expect("repository should initialize");
    let config = repo.git_dir().join("config");
    let mut contents = std::fs::read_to_string(&config).unwrap_or_default();
    contents.push_str("[user]\n\tname = Test Fixture\n\temail = fixture@example.com\n");
    std::fs::write(&config, contents).expect("repo config should be writable");
    std::fs::write(repo.git_dir().join("HEAD"), "ref: refs/heads/main\n")
        .expect("HEAD should be writable");
    let path = repo.git_dir().to_owned();
    drop(repo);
    gix::open(path).expect("repository should reopen")
}

pub fn write_blob(repo: &gix::Repository, data: &[u8]) -> ObjectId {
    repo.write_blob(data).expect("blob should write").detach()
}

/// Write a tree from `(kind, name, oid)` triples. Entries must already
/// be in git's canonical name order.
pub fn write_tree(repo: &gix::Repository, entries: &[(EntryKind, &str, ObjectId)]) -> ObjectId {
    let mut tree = gix::objs::Tree::empty();
    for (kind, name, oid) in entries {
        tree.entries.push(Entry {
            mode: (*kind).into(),
            filename: (*name).into(),
            oid: *oid,
        });
    }
    repo.write_object(&tree).expect("tree should write").detach()
}

pub fn commit(repo: &gix::Repository, branch: &str, tree: ObjectId) -> ObjectId {
    repo.commit(
        format!("refs/heads/{branch}"),
        "fixture commit",
        tree,
        gix::commit::NO_PARENT_IDS,
    )
    .expect("commit should write")
    .detach()
}

pub fn lightweight_tag(repo: &gix::Repository, name: &str, target: ObjectId) {
    repo.tag_reference(
        name,
        target,
        gix::refs::transaction::PreviousValue::Any,
    )
    .expect("tag ref should write");
}

/// Create an annotated tag object pointing at `target` and a ref for it.
pub fn annotated_tag(
    repo: &gix::Repository,
    name: &str,
    target: ObjectId,
    target_kind: gix::object::Kind,
) {
    let tag = gix::objs::Tag {
        target,
        target_kind,
        name: name.into(),
        tagger: None,
        message: "fixture tag".into(),
        pgp_signature: None,
    };
    let tag_id = repo.write_object(&tag).expect("tag should write").detach();
    repo.tag_reference(
        name,
        tag_id,
        gix::refs::transaction::PreviousValue::Any,
    )
    .expect("tag ref should write");
}
