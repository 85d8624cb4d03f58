//! History node objects
//!
//! A commit captures a root tree together with the repository metadata in
//! force at commit time (name, description, encryption parameters), so a
//! peer that only has the commit graph can reconstruct repository settings.
//!
//! ## Format
//!
//! On disk:
//! ```text
//! commit <size>\0
//! repo <repo-uuid>
//! root <tree-sha>
//! parent <commit-sha>           (absent for the initial commit)
//! second-parent <commit-sha>    (present only on merge commits)
//! creator <session-id>
//! creator-name <name>
//! ctime <unix-seconds>
//! repo-name <name>
//! repo-desc <description>
//! enc-version <n>               (encrypted repositories only)
//! magic <32-hex>                (encrypted repositories only)
//!
//! <commit description>
//! ```
//!
//! The commit id is the SHA-1 of this canonical form. Once written a commit
//! is never mutated; it is referenced only by id.

use crate::artifacts::objects::object::{with_header, Object, Packable, Unpackable};
use crate::artifacts::objects::object_id::{ObjectId, RepoId};
use crate::artifacts::objects::object_type::ObjectType;
use bytes::Bytes;
use std::io::BufRead;

/// Repository metadata snapshot carried by every commit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepoSnapshot {
    pub repo_name: String,
    pub repo_desc: String,
    pub enc_version: Option<i32>,
    pub magic: Option<String>,
}

impl RepoSnapshot {
    pub fn is_encrypted(&self) -> bool {
        self.enc_version.is_some()
    }
}

/// Immutable history node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub repo_id: RepoId,
    pub root_id: ObjectId,
    pub creator_id: String,
    pub creator_name: String,
    pub description: String,
    /// Creation time, unix seconds
    pub ctime: i64,
    pub parent_id: Option<ObjectId>,
    pub second_parent_id: Option<ObjectId>,
    pub snapshot: RepoSnapshot,
}

impl Commit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_id: RepoId,
        root_id: ObjectId,
        creator_id: String,
        creator_name: String,
        description: String,
        parent_id: Option<ObjectId>,
        second_parent_id: Option<ObjectId>,
        snapshot: RepoSnapshot,
    ) -> Self {
        Commit {
            repo_id,
            root_id,
            creator_id,
            creator_name,
            description,
            ctime: chrono::Utc::now().timestamp(),
            parent_id,
            second_parent_id,
            snapshot,
        }
    }

    /// First line of the description, for log output
    pub fn title_line(&self) -> &str {
        self.description.lines().next().unwrap_or_default()
    }

    pub fn parents(&self) -> Vec<ObjectId> {
        self.parent_id
            .iter()
            .chain(self.second_parent_id.iter())
            .cloned()
            .collect()
    }

    pub fn is_merge(&self) -> bool {
        self.second_parent_id.is_some()
    }

    // Single-line headers must stay single-line in the canonical form.
    fn sanitize(value: &str) -> String {
        value.replace('\n', " ")
    }
}

impl Packable for Commit {
    fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut body = String::new();
        body.push_str(&format!("repo {}\n", self.repo_id));
        body.push_str(&format!("root {}\n", self.root_id));
        if let Some(parent) = &self.parent_id {
            body.push_str(&format!("parent {}\n", parent));
        }
        if let Some(second_parent) = &self.second_parent_id {
            body.push_str(&format!("second-parent {}\n", second_parent));
        }
        body.push_str(&format!("creator {}\n", Self::sanitize(&self.creator_id)));
        body.push_str(&format!(
            "creator-name {}\n",
            Self::sanitize(&self.creator_name)
        ));
        body.push_str(&format!("ctime {}\n", self.ctime));
        body.push_str(&format!(
            "repo-name {}\n",
            Self::sanitize(&self.snapshot.repo_name)
        ));
        body.push_str(&format!(
            "repo-desc {}\n",
            Self::sanitize(&self.snapshot.repo_desc)
        ));
        if let Some(enc_version) = self.snapshot.enc_version {
            body.push_str(&format!("enc-version {}\n", enc_version));
        }
        if let Some(magic) = &self.snapshot.magic {
            body.push_str(&format!("magic {}\n", magic));
        }
        body.push('\n');
        body.push_str(&self.description);

        Ok(with_header(ObjectType::Commit, body.as_bytes()))
    }
}

impl Unpackable for Commit {
    fn deserialize(mut reader: impl BufRead) -> anyhow::Result<Self> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;

        let (headers, description) = content
            .split_once("\n\n")
            .ok_or_else(|| anyhow::anyhow!("Commit is missing its description separator"))?;

        let mut repo_id = None;
        let mut root_id = None;
        let mut parent_id = None;
        let mut second_parent_id = None;
        let mut creator_id = None;
        let mut creator_name = None;
        let mut ctime = None;
        let mut snapshot = RepoSnapshot::default();

        for line in headers.lines() {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("Malformed commit header: {}", line))?;
            match key {
                "repo" => repo_id = Some(RepoId::try_parse(value)?),
                "root" => root_id = Some(ObjectId::try_parse(value.to_string())?),
                "parent" => parent_id = Some(ObjectId::try_parse(value.to_string())?),
                "second-parent" => {
                    second_parent_id = Some(ObjectId::try_parse(value.to_string())?)
                }
                "creator" => creator_id = Some(value.to_string()),
                "creator-name" => creator_name = Some(value.to_string()),
                "ctime" => {
                    ctime = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| anyhow::anyhow!("Invalid ctime: {}", value))?,
                    )
                }
                "repo-name" => snapshot.repo_name = value.to_string(),
                "repo-desc" => snapshot.repo_desc = value.to_string(),
                "enc-version" => {
                    snapshot.enc_version = Some(
                        value
                            .parse::<i32>()
                            .map_err(|_| anyhow::anyhow!("Invalid enc-version: {}", value))?,
                    )
                }
                "magic" => snapshot.magic = Some(value.to_string()),
                _ => return Err(anyhow::anyhow!("Unknown commit header: {}", key)),
            }
        }

        Ok(Commit {
            repo_id: repo_id.ok_or_else(|| anyhow::anyhow!("Commit is missing repo header"))?,
            root_id: root_id.ok_or_else(|| anyhow::anyhow!("Commit is missing root header"))?,
            creator_id: creator_id.unwrap_or_default(),
            creator_name: creator_name.unwrap_or_default(),
            description: description.to_string(),
            ctime: ctime.ok_or_else(|| anyhow::anyhow!("Commit is missing ctime header"))?,
            parent_id,
            second_parent_id,
            snapshot,
        })
    }
}

impl Object for Commit {
    fn object_type(&self) -> ObjectType {
        ObjectType::Commit
    }
}

/// Slim commit view for graph algorithms
///
/// Borrows from a commit cache so that merge-base traversal does not clone
/// parent lists on every visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlimCommit<'c> {
    pub oid: &'c ObjectId,
    pub parents: &'c [ObjectId],
    pub ctime: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::io::Cursor;

    #[fixture]
    fn commit() -> Commit {
        Commit {
            repo_id: RepoId::generate(),
            root_id: ObjectId::hash_bytes(b"root"),
            creator_id: "peer-1".into(),
            creator_name: "alice@example.com".into(),
            description: "Added \"a.txt\".\n".into(),
            ctime: 1700000000,
            parent_id: Some(ObjectId::hash_bytes(b"parent")),
            second_parent_id: None,
            snapshot: RepoSnapshot {
                repo_name: "docs".into(),
                repo_desc: "team documents".into(),
                enc_version: None,
                magic: None,
            },
        }
    }

    #[rstest]
    fn test_commit_serialization_roundtrip(commit: Commit) {
        let bytes = commit.serialize().unwrap();
        let mut reader = Cursor::new(bytes);
        let (object_type, _) = ObjectType::parse_object_header(&mut reader).unwrap();
        let reread = Commit::deserialize(reader).unwrap();

        assert_eq!(object_type, ObjectType::Commit);
        pretty_assertions::assert_eq!(commit, reread);
    }

    #[rstest]
    fn test_commit_id_is_stable(commit: Commit) {
        pretty_assertions::assert_eq!(
            commit.object_id().unwrap(),
            commit.clone().object_id().unwrap()
        );
    }

    #[rstest]
    fn test_encrypted_snapshot_roundtrips(mut commit: Commit) {
        commit.snapshot.enc_version = Some(1);
        commit.snapshot.magic = Some("aa".repeat(16));

        let bytes = commit.serialize().unwrap();
        let mut reader = Cursor::new(bytes);
        ObjectType::parse_object_header(&mut reader).unwrap();
        let reread = Commit::deserialize(reader).unwrap();

        assert!(reread.snapshot.is_encrypted());
        pretty_assertions::assert_eq!(commit.snapshot, reread.snapshot);
    }

    #[rstest]
    fn test_merge_commit_lists_both_parents(mut commit: Commit) {
        commit.second_parent_id = Some(ObjectId::hash_bytes(b"remote"));
        assert!(commit.is_merge());
        assert_eq!(commit.parents().len(), 2);
    }
}
