//! Merge primitives
//!
//! Two pieces live here:
//!
//! - the **common ancestor finder**: a bidirectional, timestamp-ordered
//!   walk over the commit DAG that marks commits reachable from either
//!   side, flags those seen from both as candidates, prunes candidates
//!   reachable from other candidates, and tie-breaks the survivors by
//!   earliest creation time;
//! - the **content merger**: a line-based three-way merge used when both
//!   sides touched the same file. Unchanged-on-one-side regions take the
//!   other side; a genuinely diverging middle becomes an inline conflict
//!   hunk. Non-UTF-8 content is declared binary and left to the caller,
//!   which keeps both versions under distinct names.

use crate::areas::object_store::CommitCache;
use crate::artifacts::objects::object_id::ObjectId;
use bitflags::bitflags;
use std::collections::{BinaryHeap, HashMap, HashSet};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct VisitState: u8 {
        const FROM_SOURCE = 0b001;
        const FROM_TARGET = 0b010;
        const FROM_BOTH = Self::FROM_SOURCE.bits() | Self::FROM_TARGET.bits();
        const STALE  = 0b0100;
        const RESULT = 0b1000;
    }
}

/// All common ancestors of `source` and `target`
///
/// Commits are processed newest-first (max-heap on ctime) so that a
/// candidate's descendants are settled before the candidate itself, which
/// lets the walk mark anything below a confirmed candidate STALE instead
/// of revisiting it.
fn find_common_ancestors(
    cache: &CommitCache,
    source: &ObjectId,
    target: &ObjectId,
) -> anyhow::Result<HashMap<ObjectId, VisitState>> {
    if source == target {
        return Ok(HashMap::from([(source.clone(), VisitState::RESULT)]));
    }

    let mut states = HashMap::<ObjectId, VisitState>::new();
    let mut queue = BinaryHeap::new();

    let source_commit = cache.get_slim_commit(source)?;
    let target_commit = cache.get_slim_commit(target)?;
    states.insert(source.clone(), VisitState::FROM_SOURCE);
    states.insert(target.clone(), VisitState::FROM_TARGET);
    queue.push((source_commit.ctime, source.clone()));
    queue.push((target_commit.ctime, target.clone()));

    while let Some((_, commit_id)) = queue.pop() {
        let current = states
            .get(&commit_id)
            .copied()
            .unwrap_or(VisitState::empty());

        if current.contains(VisitState::STALE) {
            continue;
        }

        let is_candidate = current.contains(VisitState::FROM_BOTH);
        if is_candidate {
            states
                .entry(commit_id.clone())
                .and_modify(|state| *state |= VisitState::RESULT);
        }

        let commit = cache.get_slim_commit(&commit_id)?;
        for parent_id in commit.parents {
            let parent_state = states
                .get(parent_id)
                .copied()
                .unwrap_or(VisitState::empty());

            let mut inherited = parent_state | (current & VisitState::FROM_BOTH);
            if is_candidate {
                inherited |= VisitState::STALE;
            }

            if !parent_state.contains(current & VisitState::FROM_BOTH) || inherited != parent_state
            {
                states.insert(parent_id.clone(), inherited);
                let parent = cache.get_slim_commit(parent_id)?;
                queue.push((parent.ctime, parent_id.clone()));
            }
        }
    }

    Ok(states
        .into_iter()
        .filter(|(_, state)| {
            state.contains(VisitState::RESULT) && !state.contains(VisitState::STALE)
        })
        .collect())
}

/// Best common ancestor of two commits
///
/// A best common ancestor is a common ancestor that is not an ancestor of
/// any other common ancestor. When several remain (criss-cross histories),
/// the one with the earliest creation time wins, which keeps the choice
/// deterministic across peers.
pub fn find_best_common_ancestor(
    cache: &CommitCache,
    source: &ObjectId,
    target: &ObjectId,
) -> anyhow::Result<Option<ObjectId>> {
    let candidates: HashSet<ObjectId> = find_common_ancestors(cache, source, target)?
        .into_keys()
        .collect();

    if candidates.is_empty() {
        return Ok(None);
    }

    // Filter candidates that are ancestors of other candidates
    let mut redundant = HashSet::<ObjectId>::new();
    for candidate in &candidates {
        if redundant.contains(candidate) {
            continue;
        }
        for other in &candidates {
            if other == candidate || redundant.contains(other) {
                continue;
            }
            if is_ancestor_of(cache, other, candidate)? {
                redundant.insert(candidate.clone());
                break;
            }
        }
    }

    let mut best: Vec<ObjectId> = candidates
        .into_iter()
        .filter(|candidate| !redundant.contains(candidate))
        .collect();

    best.sort_by_key(|oid| {
        let ctime = cache
            .get_slim_commit(oid)
            .map(|slim| slim.ctime)
            .unwrap_or(i64::MAX);
        (ctime, oid.clone())
    });

    Ok(best.into_iter().next())
}

/// True when `ancestor` is reachable from `commit` via parent edges
fn is_ancestor_of(
    cache: &CommitCache,
    commit: &ObjectId,
    ancestor: &ObjectId,
) -> anyhow::Result<bool> {
    if commit == ancestor {
        return Ok(true);
    }

    let mut visited = HashSet::new();
    let mut queue = vec![commit.clone()];

    while let Some(current) = queue.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if &current == ancestor {
            return Ok(true);
        }
        let slim = cache.get_slim_commit(&current)?;
        queue.extend(slim.parents.iter().cloned());
    }

    Ok(false)
}

/// Outcome of merging one file's content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergedContent {
    /// Clean or conflict-marked text result
    Text { content: Vec<u8>, conflicted: bool },
    /// At least one side is not text; caller keeps both versions
    Binary,
}

/// Line-based three-way merge of one file
///
/// The shared prefix and suffix of all three versions pass through
/// untouched. In the remaining middle, a side that still matches the
/// ancestor yields to the other side; two diverging middles produce one
/// conflict hunk with inline markers.
pub fn merge_file_content(
    ancestor: Option<&[u8]>,
    ours: &[u8],
    theirs: &[u8],
) -> MergedContent {
    let (Ok(ours_text), Ok(theirs_text)) =
        (std::str::from_utf8(ours), std::str::from_utf8(theirs))
    else {
        return MergedContent::Binary;
    };
    let ancestor_text = match ancestor {
        Some(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return MergedContent::Binary,
        },
        None => "",
    };

    let base_lines: Vec<&str> = ancestor_text.lines().collect();
    let our_lines: Vec<&str> = ours_text.lines().collect();
    let their_lines: Vec<&str> = theirs_text.lines().collect();

    if our_lines == their_lines {
        return MergedContent::Text {
            content: join_lines(&our_lines),
            conflicted: false,
        };
    }
    if our_lines == base_lines {
        return MergedContent::Text {
            content: join_lines(&their_lines),
            conflicted: false,
        };
    }
    if their_lines == base_lines {
        return MergedContent::Text {
            content: join_lines(&our_lines),
            conflicted: false,
        };
    }

    // Trim the shared prefix and suffix across all three versions
    let prefix = common_prefix_len(&[&base_lines, &our_lines, &their_lines]);
    let suffix = common_suffix_len(&[&base_lines, &our_lines, &their_lines], prefix);

    let base_mid = &base_lines[prefix..base_lines.len() - suffix];
    let our_mid = &our_lines[prefix..our_lines.len() - suffix];
    let their_mid = &their_lines[prefix..their_lines.len() - suffix];

    let mut merged: Vec<&str> = Vec::new();
    merged.extend_from_slice(&our_lines[..prefix]);

    let conflicted = if our_mid == base_mid {
        merged.extend_from_slice(their_mid);
        false
    } else if their_mid == base_mid {
        merged.extend_from_slice(our_mid);
        false
    } else {
        merged.push("<<<<<<< .ours");
        merged.extend_from_slice(our_mid);
        merged.push("=======");
        merged.extend_from_slice(their_mid);
        merged.push(">>>>>>> .theirs");
        true
    };

    merged.extend_from_slice(&our_lines[our_lines.len() - suffix..]);

    MergedContent::Text {
        content: join_lines(&merged),
        conflicted,
    }
}

fn join_lines(lines: &[&str]) -> Vec<u8> {
    let mut content = lines.join("\n").into_bytes();
    if !lines.is_empty() {
        content.push(b'\n');
    }
    content
}

fn common_prefix_len(versions: &[&Vec<&str>; 3]) -> usize {
    let min_len = versions.iter().map(|v| v.len()).min().unwrap_or(0);
    (0..min_len)
        .take_while(|&i| {
            versions[0][i] == versions[1][i] && versions[1][i] == versions[2][i]
        })
        .count()
}

fn common_suffix_len(versions: &[&Vec<&str>; 3], prefix: usize) -> usize {
    let max_suffix = versions
        .iter()
        .map(|v| v.len() - prefix)
        .min()
        .unwrap_or(0);
    fn line<'a>(v: &'a Vec<&'a str>, i: usize) -> &'a str {
        v[v.len() - 1 - i]
    }

    (0..max_suffix)
        .take_while(|&i| {
            line(versions[0], i) == line(versions[1], i) && line(versions[1], i) == line(versions[2], i)
        })
        .count()
}

/// Suffixed path under which the remote version of a binary conflict is kept
pub fn conflict_copy_name(path: &str, remote_id: &ObjectId) -> String {
    format!("{}.conflict-{}", path, remote_id.to_short_oid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_one_sided_change_merges_clean() {
        let base = b"a\nb\nc\n";
        let ours = b"a\nb\nc\n";
        let theirs = b"a\nB\nc\n";

        match merge_file_content(Some(base), ours, theirs) {
            MergedContent::Text {
                content,
                conflicted,
            } => {
                assert!(!conflicted);
                pretty_assertions::assert_eq!(content, b"a\nB\nc\n".to_vec());
            }
            MergedContent::Binary => panic!("expected text"),
        }
    }

    #[rstest]
    fn test_disjoint_changes_merge_clean() {
        let base = b"one\ntwo\nthree\nfour\n";
        let ours = b"ONE\ntwo\nthree\nfour\n";
        let theirs = b"one\ntwo\nthree\nFOUR\n";

        // ours changed only the prefix, theirs only the suffix; after
        // trimming, our middle matches base and yields to theirs
        match merge_file_content(Some(base), ours, theirs) {
            MergedContent::Text {
                content,
                conflicted,
            } => {
                assert!(!conflicted);
                pretty_assertions::assert_eq!(content, b"ONE\ntwo\nthree\nFOUR\n".to_vec());
            }
            MergedContent::Binary => panic!("expected text"),
        }
    }

    #[rstest]
    fn test_same_region_conflict_gets_markers() {
        let base = b"a\nmiddle\nz\n";
        let ours = b"a\nours\nz\n";
        let theirs = b"a\ntheirs\nz\n";

        match merge_file_content(Some(base), ours, theirs) {
            MergedContent::Text {
                content,
                conflicted,
            } => {
                assert!(conflicted);
                let text = String::from_utf8(content).unwrap();
                assert!(text.contains("<<<<<<< .ours"));
                assert!(text.contains("ours"));
                assert!(text.contains("======="));
                assert!(text.contains("theirs"));
                assert!(text.contains(">>>>>>> .theirs"));
                assert!(text.starts_with("a\n"));
                assert!(text.ends_with("z\n"));
            }
            MergedContent::Binary => panic!("expected text"),
        }
    }

    #[rstest]
    fn test_binary_content_is_not_merged() {
        let ours = [0xff, 0xfe, 0x00, 0x01];
        let theirs = b"text";

        assert_eq!(
            merge_file_content(None, &ours, theirs),
            MergedContent::Binary
        );
    }

    #[rstest]
    fn test_identical_sides_merge_trivially() {
        match merge_file_content(None, b"same\n", b"same\n") {
            MergedContent::Text {
                content,
                conflicted,
            } => {
                assert!(!conflicted);
                pretty_assertions::assert_eq!(content, b"same\n".to_vec());
            }
            MergedContent::Binary => panic!("expected text"),
        }
    }

    mod ancestor {
        use super::*;
        use crate::areas::object_store::ObjectStore;
        use crate::artifacts::objects::commit::{Commit, RepoSnapshot};
        use crate::artifacts::objects::object::Object;
        use crate::artifacts::objects::object_id::RepoId;

        struct GraphBuilder {
            _dir: tempfile::TempDir,
            store: ObjectStore,
            repo_id: RepoId,
            ctime: i64,
        }

        impl GraphBuilder {
            fn new() -> Self {
                let dir = tempfile::tempdir().unwrap();
                let store = ObjectStore::new(dir.path().join("objects"));
                GraphBuilder {
                    _dir: dir,
                    store,
                    repo_id: RepoId::generate(),
                    ctime: 1700000000,
                }
            }

            fn commit(&mut self, parents: &[&ObjectId]) -> ObjectId {
                self.ctime += 3600;
                let mut commit = Commit::new(
                    self.repo_id.clone(),
                    ObjectId::hash_bytes(b"root"),
                    "session".into(),
                    "tester".into(),
                    "x".into(),
                    parents.first().map(|p| (*p).clone()),
                    parents.get(1).map(|p| (*p).clone()),
                    RepoSnapshot::default(),
                );
                commit.ctime = self.ctime;
                self.store.store_object(&commit).unwrap()
            }

            fn cache(&self, heads: &[&ObjectId]) -> CommitCache {
                let mut cache = CommitCache::new();
                cache.load_reachable(&self.store, heads).unwrap();
                cache
            }
        }

        #[rstest]
        fn test_linear_history_ancestor() {
            let mut graph = GraphBuilder::new();
            let a = graph.commit(&[]);
            let b = graph.commit(&[&a]);
            let c = graph.commit(&[&b]);
            let d = graph.commit(&[&c]);

            let cache = graph.cache(&[&d]);
            assert_eq!(
                find_best_common_ancestor(&cache, &b, &d).unwrap(),
                Some(b.clone())
            );
            assert_eq!(find_best_common_ancestor(&cache, &d, &b).unwrap(), Some(b));
        }

        #[rstest]
        fn test_forked_history_ancestor() {
            let mut graph = GraphBuilder::new();
            let a = graph.commit(&[]);
            let b = graph.commit(&[&a]);
            let c = graph.commit(&[&a]);

            let cache = graph.cache(&[&b, &c]);
            assert_eq!(find_best_common_ancestor(&cache, &b, &c).unwrap(), Some(a));
        }

        #[rstest]
        fn test_merge_commit_ancestor() {
            let mut graph = GraphBuilder::new();
            let a = graph.commit(&[]);
            let b = graph.commit(&[&a]);
            let c = graph.commit(&[&a]);
            let d = graph.commit(&[&b, &c]);
            let e = graph.commit(&[&c]);

            let cache = graph.cache(&[&d, &e]);
            assert_eq!(find_best_common_ancestor(&cache, &d, &e).unwrap(), Some(c));
        }

        #[rstest]
        fn test_same_commit_is_its_own_ancestor() {
            let mut graph = GraphBuilder::new();
            let a = graph.commit(&[]);

            let cache = graph.cache(&[&a]);
            assert_eq!(
                find_best_common_ancestor(&cache, &a, &a).unwrap(),
                Some(a)
            );
        }

        #[rstest]
        fn test_criss_cross_prefers_earliest_candidate() {
            let mut graph = GraphBuilder::new();
            let a = graph.commit(&[]);
            let b = graph.commit(&[&a]);
            let c = graph.commit(&[&a]);
            let d = graph.commit(&[&b, &c]);
            let e = graph.commit(&[&c, &b]);
            let f = graph.commit(&[&d]);
            let g = graph.commit(&[&e]);

            let cache = graph.cache(&[&f, &g]);
            let bca = find_best_common_ancestor(&cache, &f, &g).unwrap().unwrap();
            // both b and c are best; b was created first
            assert_eq!(bca, b);
        }
    }
}
