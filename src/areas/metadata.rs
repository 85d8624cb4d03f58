//! Metadata database
//!
//! One SQLite database (`repo.db`) holds everything about repositories that
//! is not content-addressed: the repo roster, deletion tombstones, the head
//! branch cache, branch pointers, access tokens, cached passwords and
//! derived keys, free-form properties, and merge recovery state.
//!
//! Every statement is parameterized — repo ids, property values and tokens
//! never reach the SQL text — and all access is serialized by a single
//! mutex; statements are short.

use crate::artifacts::objects::object_id::{ObjectId, RepoId};
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Token accepted for repos that never configured a lan token
pub const DEFAULT_REPO_TOKEN: &str = "default";

/// Persistent merge recovery state of one repo
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeInfo {
    pub in_merge: bool,
    pub branch: Option<String>,
}

/// Named mutable pointer into the commit DAG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub repo_id: RepoId,
    pub name: String,
    pub commit_id: ObjectId,
}

pub struct MetadataDb {
    conn: Mutex<Connection>,
}

impl MetadataDb {
    /// Open the database, creating tables if absent
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open metadata db {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::create_tables(&conn)?;
        debug!(path = %path.display(), "metadata db open");

        Ok(MetadataDb {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(MetadataDb {
            conn: Mutex::new(conn),
        })
    }

    fn create_tables(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS Repo (repo_id TEXT PRIMARY KEY);
             CREATE TABLE IF NOT EXISTS DeletedRepo (repo_id TEXT PRIMARY KEY);
             CREATE TABLE IF NOT EXISTS RepoBranch (
                 repo_id TEXT PRIMARY KEY, branch_name TEXT);
             CREATE TABLE IF NOT EXISTS Branch (
                 repo_id TEXT, name TEXT, commit_id TEXT,
                 PRIMARY KEY (repo_id, name));
             CREATE TABLE IF NOT EXISTS RepoLanToken (
                 repo_id TEXT PRIMARY KEY, token TEXT);
             CREATE TABLE IF NOT EXISTS RepoTmpToken (
                 repo_id TEXT, peer_id TEXT, token TEXT, timestamp INTEGER,
                 PRIMARY KEY (repo_id, peer_id));
             CREATE TABLE IF NOT EXISTS RepoPasswd (
                 repo_id TEXT PRIMARY KEY, passwd TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS RepoKeys (
                 repo_id TEXT PRIMARY KEY, key TEXT NOT NULL, iv TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS RepoProperty (
                 repo_id TEXT, key TEXT, value TEXT);
             CREATE INDEX IF NOT EXISTS RepoIndex ON RepoProperty (repo_id);
             CREATE TABLE IF NOT EXISTS MergeInfo (
                 repo_id TEXT PRIMARY KEY, in_merge INTEGER, branch TEXT);",
        )
        .context("Failed to create metadata tables")?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- repo roster -------------------------------------------------

    pub fn insert_repo(&self, repo_id: &RepoId) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO Repo VALUES (?1)",
            params![repo_id.as_str()],
        )?;
        Ok(())
    }

    pub fn list_repo_ids(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT repo_id FROM Repo")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Deleting the Repo row is the commit point of repository removal
    pub fn delete_repo_row(&self, repo_id: &str) -> anyhow::Result<()> {
        self.conn()
            .execute("DELETE FROM Repo WHERE repo_id = ?1", params![repo_id])?;
        Ok(())
    }

    pub fn insert_deleted_repo(&self, repo_id: &RepoId) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO DeletedRepo VALUES (?1)",
            params![repo_id.as_str()],
        )?;
        Ok(())
    }

    pub fn list_deleted_repos(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT repo_id FROM DeletedRepo")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn delete_deleted_repo(&self, repo_id: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "DELETE FROM DeletedRepo WHERE repo_id = ?1",
            params![repo_id],
        )?;
        Ok(())
    }

    // ---- branches ----------------------------------------------------

    /// Atomically create or move a branch pointer
    pub fn upsert_branch(&self, branch: &Branch) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO Branch VALUES (?1, ?2, ?3)",
            params![
                branch.repo_id.as_str(),
                branch.name,
                branch.commit_id.as_ref()
            ],
        )?;
        Ok(())
    }

    pub fn get_branch(&self, repo_id: &RepoId, name: &str) -> anyhow::Result<Option<Branch>> {
        let commit_id: Option<String> = self
            .conn()
            .query_row(
                "SELECT commit_id FROM Branch WHERE repo_id = ?1 AND name = ?2",
                params![repo_id.as_str(), name],
                |row| row.get(0),
            )
            .optional()?;

        commit_id
            .map(|commit_id| {
                Ok(Branch {
                    repo_id: repo_id.clone(),
                    name: name.to_string(),
                    commit_id: ObjectId::try_parse(commit_id)?,
                })
            })
            .transpose()
    }

    pub fn list_branches(&self, repo_id: &RepoId) -> anyhow::Result<Vec<Branch>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name, commit_id FROM Branch WHERE repo_id = ?1 ORDER BY name")?;
        let rows = stmt
            .query_map(params![repo_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, commit_id)| {
                Ok(Branch {
                    repo_id: repo_id.clone(),
                    name,
                    commit_id: ObjectId::try_parse(commit_id)?,
                })
            })
            .collect()
    }

    pub fn delete_branch(&self, repo_id: &str, name: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "DELETE FROM Branch WHERE repo_id = ?1 AND name = ?2",
            params![repo_id, name],
        )?;
        Ok(())
    }

    pub fn list_branch_names(&self, repo_id: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM Branch WHERE repo_id = ?1")?;
        let names = stmt
            .query_map(params![repo_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // ---- head branch cache -------------------------------------------

    pub fn set_head_branch(&self, repo_id: &RepoId, branch_name: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO RepoBranch VALUES (?1, ?2)",
            params![repo_id.as_str(), branch_name],
        )?;
        Ok(())
    }

    pub fn get_head_branch(&self, repo_id: &RepoId) -> anyhow::Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT branch_name FROM RepoBranch WHERE repo_id = ?1",
                params![repo_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn delete_head_branch(&self, repo_id: &str, branch_name: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "DELETE FROM RepoBranch WHERE repo_id = ?1 AND branch_name = ?2",
            params![repo_id, branch_name],
        )?;
        Ok(())
    }

    // ---- properties --------------------------------------------------

    pub fn set_property(&self, repo_id: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE RepoProperty SET value = ?3 WHERE repo_id = ?1 AND key = ?2",
            params![repo_id, key, value],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO RepoProperty VALUES (?1, ?2, ?3)",
                params![repo_id, key, value],
            )?;
        }
        Ok(())
    }

    pub fn get_property(&self, repo_id: &str, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM RepoProperty WHERE repo_id = ?1 AND key = ?2",
                params![repo_id, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn delete_properties(&self, repo_id: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "DELETE FROM RepoProperty WHERE repo_id = ?1",
            params![repo_id],
        )?;
        Ok(())
    }

    // ---- password / keys ---------------------------------------------

    pub fn set_passwd(&self, repo_id: &RepoId, passwd: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO RepoPasswd VALUES (?1, ?2)",
            params![repo_id.as_str(), passwd],
        )?;
        Ok(())
    }

    pub fn get_passwd(&self, repo_id: &RepoId) -> anyhow::Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT passwd FROM RepoPasswd WHERE repo_id = ?1",
                params![repo_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Cache derived key material (32 hex chars each)
    pub fn set_keys(&self, repo_id: &RepoId, key_hex: &str, iv_hex: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO RepoKeys VALUES (?1, ?2, ?3)",
            params![repo_id.as_str(), key_hex, iv_hex],
        )?;
        Ok(())
    }

    pub fn get_keys(&self, repo_id: &RepoId) -> anyhow::Result<Option<(String, String)>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT key, iv FROM RepoKeys WHERE repo_id = ?1",
                params![repo_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    pub fn delete_secrets(&self, repo_id: &str) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM RepoPasswd WHERE repo_id = ?1", params![repo_id])?;
        conn.execute("DELETE FROM RepoKeys WHERE repo_id = ?1", params![repo_id])?;
        Ok(())
    }

    // ---- merge info --------------------------------------------------

    pub fn set_merge(&self, repo_id: &RepoId, branch: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO MergeInfo VALUES (?1, 1, ?2)",
            params![repo_id.as_str(), branch],
        )?;
        Ok(())
    }

    pub fn clear_merge(&self, repo_id: &RepoId) -> anyhow::Result<()> {
        self.conn().execute(
            "UPDATE MergeInfo SET in_merge = 0 WHERE repo_id = ?1",
            params![repo_id.as_str()],
        )?;
        Ok(())
    }

    /// Default is "not in merge" when no row exists
    pub fn get_merge_info(&self, repo_id: &RepoId) -> anyhow::Result<MergeInfo> {
        Ok(self
            .conn()
            .query_row(
                "SELECT in_merge, branch FROM MergeInfo WHERE repo_id = ?1",
                params![repo_id.as_str()],
                |row| {
                    Ok(MergeInfo {
                        in_merge: row.get::<_, i64>(0)? != 0,
                        branch: row.get(1)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default())
    }

    pub fn delete_merge_info(&self, repo_id: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "DELETE FROM MergeInfo WHERE repo_id = ?1",
            params![repo_id],
        )?;
        Ok(())
    }

    // ---- tokens ------------------------------------------------------

    pub fn set_lan_token(&self, repo_id: &RepoId, token: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO RepoLanToken VALUES (?1, ?2)",
            params![repo_id.as_str(), token],
        )?;
        Ok(())
    }

    pub fn get_lan_token(&self, repo_id: &RepoId) -> anyhow::Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT token FROM RepoLanToken WHERE repo_id = ?1",
                params![repo_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// A repo with no stored token accepts the hardcoded default
    pub fn verify_lan_token(&self, repo_id: &RepoId, token: &str) -> anyhow::Result<bool> {
        Ok(match self.get_lan_token(repo_id)? {
            Some(stored) => stored == token,
            None => token == DEFAULT_REPO_TOKEN,
        })
    }

    /// Mint a one-shot token for `(repo, peer)`
    pub fn generate_tmp_token(&self, repo_id: &RepoId, peer_id: &str) -> anyhow::Result<String> {
        let token = uuid::Uuid::new_v4().hyphenated().to_string();
        self.conn().execute(
            "INSERT OR REPLACE INTO RepoTmpToken VALUES (?1, ?2, ?3, ?4)",
            params![
                repo_id.as_str(),
                peer_id,
                token,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(token)
    }

    /// Verify-once: a matching row is consumed whether or not it will be
    /// presented again
    pub fn verify_tmp_token(
        &self,
        repo_id: &RepoId,
        peer_id: &str,
        token: &str,
    ) -> anyhow::Result<bool> {
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row(
                "SELECT timestamp FROM RepoTmpToken
                 WHERE repo_id = ?1 AND peer_id = ?2 AND token = ?3",
                params![repo_id.as_str(), peer_id, token],
                |row| row.get(0),
            )
            .optional()?;

        if found.is_some() {
            conn.execute(
                "DELETE FROM RepoTmpToken WHERE repo_id = ?1 AND peer_id = ?2",
                params![repo_id.as_str(), peer_id],
            )?;
        }

        Ok(found.is_some())
    }

    pub fn delete_tokens(&self, repo_id: &str) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM RepoLanToken WHERE repo_id = ?1",
            params![repo_id],
        )?;
        conn.execute(
            "DELETE FROM RepoTmpToken WHERE repo_id = ?1",
            params![repo_id],
        )?;
        Ok(())
    }

    /// True when any table still references the repo (delete-completeness
    /// checks in tests)
    pub fn has_any_rows(&self, repo_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn();
        for table in [
            "Repo",
            "DeletedRepo",
            "RepoBranch",
            "Branch",
            "RepoLanToken",
            "RepoTmpToken",
            "RepoPasswd",
            "RepoKeys",
            "RepoProperty",
            "MergeInfo",
        ] {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE repo_id = ?1", table),
                params![repo_id],
                |row| row.get(0),
            )?;
            if count > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn db() -> MetadataDb {
        MetadataDb::open_in_memory().unwrap()
    }

    #[fixture]
    fn repo_id() -> RepoId {
        RepoId::generate()
    }

    #[rstest]
    fn test_branch_upsert_swaps_commit_id(db: MetadataDb, repo_id: RepoId) {
        let mut branch = Branch {
            repo_id: repo_id.clone(),
            name: "master".into(),
            commit_id: ObjectId::hash_bytes(b"one"),
        };
        db.upsert_branch(&branch).unwrap();

        branch.commit_id = ObjectId::hash_bytes(b"two");
        db.upsert_branch(&branch).unwrap();

        let reread = db.get_branch(&repo_id, "master").unwrap().unwrap();
        pretty_assertions::assert_eq!(reread.commit_id, ObjectId::hash_bytes(b"two"));
        assert_eq!(db.list_branches(&repo_id).unwrap().len(), 1);
    }

    #[rstest]
    fn test_property_upsert(db: MetadataDb, repo_id: RepoId) {
        db.set_property(repo_id.as_str(), "auto-sync", "true").unwrap();
        db.set_property(repo_id.as_str(), "auto-sync", "false").unwrap();

        assert_eq!(
            db.get_property(repo_id.as_str(), "auto-sync").unwrap(),
            Some("false".into())
        );
    }

    #[rstest]
    fn test_merge_info_defaults_to_clean(db: MetadataDb, repo_id: RepoId) {
        assert!(!db.get_merge_info(&repo_id).unwrap().in_merge);

        db.set_merge(&repo_id, "remote").unwrap();
        let info = db.get_merge_info(&repo_id).unwrap();
        assert!(info.in_merge);
        assert_eq!(info.branch.as_deref(), Some("remote"));

        db.clear_merge(&repo_id).unwrap();
        assert!(!db.get_merge_info(&repo_id).unwrap().in_merge);
    }

    #[rstest]
    fn test_tmp_token_is_one_shot(db: MetadataDb, repo_id: RepoId) {
        let token = db.generate_tmp_token(&repo_id, "peer-a").unwrap();

        assert!(db.verify_tmp_token(&repo_id, "peer-a", &token).unwrap());
        assert!(!db.verify_tmp_token(&repo_id, "peer-a", &token).unwrap());
    }

    #[rstest]
    fn test_missing_lan_token_accepts_default(db: MetadataDb, repo_id: RepoId) {
        assert!(db.verify_lan_token(&repo_id, DEFAULT_REPO_TOKEN).unwrap());
        assert!(!db.verify_lan_token(&repo_id, "other").unwrap());

        db.set_lan_token(&repo_id, "secret").unwrap();
        assert!(db.verify_lan_token(&repo_id, "secret").unwrap());
        assert!(!db.verify_lan_token(&repo_id, DEFAULT_REPO_TOKEN).unwrap());
    }

    #[rstest]
    fn test_has_any_rows_reports_leftovers(db: MetadataDb, repo_id: RepoId) {
        assert!(!db.has_any_rows(repo_id.as_str()).unwrap());

        db.insert_repo(&repo_id).unwrap();
        db.set_property(repo_id.as_str(), "worktree", "/tmp/w").unwrap();
        assert!(db.has_any_rows(repo_id.as_str()).unwrap());

        db.delete_repo_row(repo_id.as_str()).unwrap();
        db.delete_properties(repo_id.as_str()).unwrap();
        assert!(!db.has_any_rows(repo_id.as_str()).unwrap());
    }
}
