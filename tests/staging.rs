//! Staging and first-commit scenarios

mod common;

use common::bed;
use pretty_assertions::assert_eq;
use synclave::artifacts::index::entry_mode::EntryMode;

#[test]
fn initial_commit_captures_files_dirs_and_sentinels() {
    let bed = bed();
    bed.write_file("a.txt", "hello");
    bed.write_file("dir/b.txt", "world");
    bed.make_dir("empty");

    let commit_id = bed.stage_and_commit("initial commit");

    let commit = bed.load_commit(&commit_id);
    assert!(commit.parent_id.is_none());
    assert!(commit.second_parent_id.is_none());

    let tree = bed
        .manager
        .ctx()
        .store
        .load_tree(&commit.root_id)
        .unwrap();
    let names: Vec<_> = tree.entries().map(|(name, _)| name.clone()).collect();
    assert_eq!(names, vec!["a.txt", "dir", "empty"]);

    let empty_entry = tree.get("empty").unwrap();
    assert!(empty_entry.mode.is_dir());
    let empty_tree = bed.manager.ctx().store.load_tree(&empty_entry.oid).unwrap();
    assert!(empty_tree.is_empty());
}

#[test]
fn ignored_names_never_reach_the_tree() {
    let bed = bed();
    bed.write_file("ok.txt", "fine");
    bed.write_file("Thumbs.db", "cache");
    bed.write_file("foo~", "backup");

    bed.stage_and_commit("only ok.txt");

    assert_eq!(bed.head_root_entries(), vec!["ok.txt"]);
}

#[test]
fn staging_twice_without_changes_is_byte_identical() {
    let bed = bed();
    bed.write_file("a.txt", "stable");
    bed.write_file("dir/b.txt", "also stable");

    bed.repo.index_add(bed.manager.ctx(), "").unwrap();
    let first = bed.index_file_bytes();

    bed.repo.index_add(bed.manager.ctx(), "").unwrap();
    let second = bed.index_file_bytes();

    assert_eq!(first, second);
}

#[test]
fn staging_detects_deleted_files() {
    let bed = bed();
    bed.write_file("keep.txt", "k");
    bed.write_file("gone.txt", "g");
    bed.stage_and_commit("two files");

    bed.remove_file("gone.txt");
    bed.repo.index_add(bed.manager.ctx(), "").unwrap();
    let commit_id = bed
        .repo
        .index_commit(bed.manager.ctx(), "")
        .unwrap()
        .unwrap();

    let commit = bed.load_commit(&commit_id);
    assert!(commit.description.starts_with("Deleted \"gone.txt\""));
    assert_eq!(bed.head_root_entries(), vec!["keep.txt"]);
}

#[test]
fn emptied_directory_leaves_a_sentinel_behind() {
    let bed = bed();
    bed.write_file("dir/only.txt", "x");
    bed.stage_and_commit("dir with file");

    bed.remove_file("dir/only.txt");
    bed.repo.index_add(bed.manager.ctx(), "").unwrap();

    // the directory still exists, now empty: it survives as a sentinel
    let commit = bed
        .repo
        .index_commit(bed.manager.ctx(), "removed the only file")
        .unwrap()
        .unwrap();
    let tree = bed
        .manager
        .ctx()
        .store
        .load_tree(&bed.load_commit(&commit).root_id)
        .unwrap();
    let dir_entry = tree.get("dir").unwrap();
    assert!(dir_entry.mode.is_dir());
    assert!(bed
        .manager
        .ctx()
        .store
        .load_tree(&dir_entry.oid)
        .unwrap()
        .is_empty());
}

#[test]
fn commit_with_no_changes_produces_nothing() {
    let bed = bed();
    bed.write_file("a.txt", "content");
    bed.stage_and_commit("first");

    bed.repo.index_add(bed.manager.ctx(), "").unwrap();
    let outcome = bed.repo.index_commit(bed.manager.ctx(), "").unwrap();

    assert!(outcome.is_none());
}

#[test]
fn generated_description_summarizes_changes() {
    let bed = bed();
    bed.write_file("one.txt", "1");
    bed.write_file("two.txt", "2");
    bed.repo.index_add(bed.manager.ctx(), "").unwrap();

    let commit_id = bed
        .repo
        .index_commit(bed.manager.ctx(), "")
        .unwrap()
        .unwrap();

    let commit = bed.load_commit(&commit_id);
    assert!(commit.description.starts_with("Added \""));
    assert!(commit.description.contains("1 more files"));
}

#[test]
fn mutating_operations_exclude_each_other() {
    let bed = bed();

    let guard = bed.repo.try_lock_op().unwrap();
    assert!(bed.repo.try_lock_op().is_none());
    drop(guard);
    assert!(bed.repo.try_lock_op().is_some());
}

#[test]
fn prefix_staging_leaves_other_paths_alone() {
    let bed = bed();
    bed.write_file("tracked/a.txt", "a");
    bed.write_file("untouched/b.txt", "b");
    bed.stage_and_commit("both dirs");

    bed.write_file("tracked/a.txt", "a-changed");
    bed.write_file("untouched/b.txt", "b-changed");
    bed.repo.index_add(bed.manager.ctx(), "tracked").unwrap();

    let commit_id = bed
        .repo
        .index_commit(bed.manager.ctx(), "")
        .unwrap()
        .unwrap();
    let commit = bed.load_commit(&commit_id);
    assert!(commit.description.starts_with("Modified \"a.txt\""));
    assert!(!commit.description.contains("b.txt"));
}

#[test]
fn index_rm_drops_entries_and_worktree_files() {
    let bed = bed();
    bed.write_file("doomed/a.txt", "a");
    bed.write_file("kept.txt", "k");
    bed.stage_and_commit("baseline");

    bed.repo.index_rm(bed.manager.ctx(), "doomed").unwrap();

    assert!(!bed.worktree.path().join("doomed").exists());
    assert!(bed.worktree.path().join("kept.txt").exists());

    let commit_id = bed
        .repo
        .index_commit(bed.manager.ctx(), "")
        .unwrap()
        .unwrap();
    let commit = bed.load_commit(&commit_id);
    assert!(commit.description.starts_with("Deleted \"a.txt\""));
}

#[test]
fn index_rm_refuses_locally_modified_files() {
    let bed = bed();
    bed.write_file("precious.txt", "original");
    bed.stage_and_commit("baseline");

    bed.write_file("precious.txt", "edited since staging");

    let err = bed
        .repo
        .index_rm(bed.manager.ctx(), "precious.txt")
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<synclave::EngineError>(),
        Some(synclave::EngineError::Conflict(_))
    ));
    assert!(bed.worktree.path().join("precious.txt").exists());
}

#[test]
fn staging_without_a_worktree_is_an_invalid_input() {
    let bed = bed();
    // point the repo at a worktree that no longer exists
    bed.repo.state_mut().worktree = Some(std::path::PathBuf::from("/gone/away"));

    let err = bed.repo.index_add(bed.manager.ctx(), "").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<synclave::EngineError>(),
        Some(synclave::EngineError::InvalidInput(_))
    ));
}

#[test]
fn modes_in_tree_match_entry_kinds() {
    let bed = bed();
    bed.write_file("file.txt", "f");
    bed.make_dir("hollow");
    bed.stage_and_commit("mixed");

    let head = bed.load_commit(&bed.head_commit_id());
    let tree = bed.manager.ctx().store.load_tree(&head.root_id).unwrap();

    assert_eq!(tree.get("file.txt").unwrap().mode, EntryMode::Regular);
    assert_eq!(tree.get("hollow").unwrap().mode, EntryMode::Directory);
}
