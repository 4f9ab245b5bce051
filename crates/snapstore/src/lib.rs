//! Transactional metadata store for the layer snapshot DAG.
//!
//! Every layer managed by the snapshotter has one row here: a stable numeric
//! id assigned on creation, a caller-chosen key (active name) or name
//! (committed name), a kind, an optional parent reference and a labels map.
//! The parent relation forms a forest of chains: a layer has at most one
//! parent, the parent must be committed, and a committed layer cannot be
//! removed while children reference it.
//!
//! Persistence is a single SQLite database. Writer transactions are taken
//! with `BEGIN IMMEDIATE` and are exclusive; read-only transactions see a
//! consistent snapshot. Durability comes from `synchronous=FULL`, which
//! makes SQLite fsync at commit.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No snapshot exists under the given key or name.
    #[error("snapshot {0} does not exist")]
    NotFound(String),

    /// A snapshot already exists under the given key or name.
    #[error("snapshot {0} already exists")]
    AlreadyExists(String),

    /// The caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is valid but the snapshot is in the wrong state.
    #[error("{0}")]
    FailedPrecondition(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// The lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Read-only snapshot without an upper directory.
    View,
    /// Writable snapshot; becomes committed via [`Transaction::commit_active`].
    Active,
    /// Immutable snapshot, referenced by name.
    Committed,
}

impl Kind {
    fn from_raw(raw: i64) -> Option<Kind> {
        match raw {
            1 => Some(Kind::View),
            2 => Some(Kind::Active),
            3 => Some(Kind::Committed),
            _ => None,
        }
    }

    fn as_raw(self) -> i64 {
        match self {
            Kind::View => 1,
            Kind::Active => 2,
            Kind::Committed => 3,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::View => "view",
            Kind::Active => "active",
            Kind::Committed => "committed",
        };
        f.write_str(s)
    }
}

/// Public metadata of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// Lifecycle state.
    pub kind: Kind,
    /// Active key or committed name.
    pub name: String,
    /// Name of the committed parent, if any.
    pub parent: Option<String>,
    /// Free-form labels attached by the caller.
    pub labels: BTreeMap<String, String>,
    /// Creation time.
    pub created: SystemTime,
    /// Last modification time.
    pub updated: SystemTime,
}

/// Disk usage accounting for a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Bytes consumed, in filesystem block terms.
    pub size: u64,
    /// Number of inodes consumed.
    pub inodes: u64,
}

/// Identity of a snapshot row plus its resolved ancestor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Store-assigned stable id.
    pub id: i64,
    /// Lifecycle state at creation.
    pub kind: Kind,
    /// Ids of the parent chain, immediate parent first.
    pub parent_ids: Vec<i64>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    key        TEXT NOT NULL UNIQUE,
    parent_id  INTEGER REFERENCES snapshots(id),
    kind       INTEGER NOT NULL,
    size       INTEGER NOT NULL DEFAULT 0,
    inodes     INTEGER NOT NULL DEFAULT 0,
    created_ns INTEGER NOT NULL,
    updated_ns INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_parent ON snapshots(parent_id);
CREATE TABLE IF NOT EXISTS labels (
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    name  TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, name)
);
";

/// Handle to the metadata database.
///
/// All transactions are serialized through one connection guarded by a
/// mutex; SQLite's own locking protects against other processes.
#[derive(Debug)]
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Open (creating if necessary) the metadata database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        // journal_mode is the one pragma that answers with a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(MetaStore {
            conn: Mutex::new(conn),
        })
    }

    /// Begin a transaction. A writable transaction takes the exclusive
    /// writer slot; read-only transactions never modify the database and
    /// roll back on drop.
    pub fn transaction(&self, writable: bool) -> Result<Transaction<'_>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(if writable { "BEGIN IMMEDIATE" } else { "BEGIN" })?;
        Ok(Transaction {
            conn,
            writable,
            open: true,
        })
    }
}

/// An open transaction against the store.
///
/// Dropping an open transaction rolls it back; call [`Transaction::commit`]
/// to make writes durable.
pub struct Transaction<'a> {
    conn: MutexGuard<'a, Connection>,
    writable: bool,
    open: bool,
}

struct Row {
    id: i64,
    parent_id: Option<i64>,
    kind: Kind,
    size: u64,
    inodes: u64,
    created_ns: i64,
    updated_ns: i64,
}

fn time_from_ns(ns: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ns.max(0) as u64)
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

impl Transaction<'_> {
    /// Commit the transaction.
    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }

    /// Explicitly roll the transaction back. Equivalent to dropping it.
    pub fn rollback(mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.open = false;
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::InvalidArgument(
                "operation requires a writable transaction".into(),
            ))
        }
    }

    fn row(&self, key: &str) -> Result<Option<Row>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, parent_id, kind, size, inodes, created_ns, updated_ns
                 FROM snapshots WHERE key = ?1",
                [key],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, Option<i64>>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, i64>(5)?,
                        r.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, parent_id, kind, size, inodes, created_ns, updated_ns)) => {
                let kind = Kind::from_raw(kind).ok_or_else(|| {
                    StoreError::FailedPrecondition(format!(
                        "snapshot {key} has corrupt kind {kind}"
                    ))
                })?;
                Ok(Some(Row {
                    id,
                    parent_id,
                    kind,
                    size: size.max(0) as u64,
                    inodes: inodes.max(0) as u64,
                    created_ns,
                    updated_ns,
                }))
            }
        }
    }

    fn key_of(&self, id: i64) -> Result<String> {
        Ok(self
            .conn
            .query_row("SELECT key FROM snapshots WHERE id = ?1", [id], |r| {
                r.get(0)
            })?)
    }

    fn labels_of(&self, id: i64) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM labels WHERE snapshot_id = ?1")?;
        let rows = stmt.query_map([id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut labels = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            labels.insert(name, value);
        }
        Ok(labels)
    }

    fn replace_labels(&self, id: i64, labels: &BTreeMap<String, String>) -> Result<()> {
        self.conn
            .execute("DELETE FROM labels WHERE snapshot_id = ?1", [id])?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO labels (snapshot_id, name, value) VALUES (?1, ?2, ?3)")?;
        for (name, value) in labels {
            stmt.execute(params![id, name, value])?;
        }
        Ok(())
    }

    fn parent_chain(&self, mut parent_id: Option<i64>) -> Result<Vec<i64>> {
        let mut chain = Vec::new();
        while let Some(id) = parent_id {
            chain.push(id);
            parent_id = self.conn.query_row(
                "SELECT parent_id FROM snapshots WHERE id = ?1",
                [id],
                |r| r.get(0),
            )?;
        }
        Ok(chain)
    }

    fn info_from_row(&self, key: &str, row: &Row) -> Result<Info> {
        let parent = match row.parent_id {
            Some(pid) => Some(self.key_of(pid)?),
            None => None,
        };
        Ok(Info {
            kind: row.kind,
            name: key.to_string(),
            parent,
            labels: self.labels_of(row.id)?,
            created: time_from_ns(row.created_ns),
            updated: time_from_ns(row.updated_ns),
        })
    }

    /// Look up a snapshot by key or name, returning its id, public info and
    /// recorded usage.
    pub fn get_info(&self, key: &str) -> Result<(i64, Info, Usage)> {
        let row = self
            .row(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let info = self.info_from_row(key, &row)?;
        let usage = Usage {
            size: row.size,
            inodes: row.inodes,
        };
        Ok((row.id, info, usage))
    }

    /// Resolve the identity and ancestor chain of a snapshot.
    pub fn get_snapshot(&self, key: &str) -> Result<Snapshot> {
        let row = self
            .row(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(Snapshot {
            id: row.id,
            kind: row.kind,
            parent_ids: self.parent_chain(row.parent_id)?,
        })
    }

    /// Create a new snapshot row linked under `parent`.
    ///
    /// The key must be unused and the parent, when given, must resolve to a
    /// committed snapshot.
    pub fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Snapshot> {
        self.require_writable()?;
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("snapshot key is empty".into()));
        }
        if kind == Kind::Committed {
            return Err(StoreError::InvalidArgument(
                "committed snapshots are created by commit_active".into(),
            ));
        }
        if self.row(key)?.is_some() {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        let parent_row = match parent {
            Some(p) if !p.is_empty() => {
                let row = self
                    .row(p)?
                    .ok_or_else(|| StoreError::NotFound(p.to_string()))?;
                if row.kind != Kind::Committed {
                    return Err(StoreError::InvalidArgument(format!(
                        "parent {p} is not committed"
                    )));
                }
                Some(row)
            }
            _ => None,
        };

        let now = now_ns();
        self.conn.execute(
            "INSERT INTO snapshots (key, parent_id, kind, created_ns, updated_ns)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![key, parent_row.as_ref().map(|r| r.id), kind.as_raw(), now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.replace_labels(id, labels)?;

        let mut parent_ids = Vec::new();
        if let Some(row) = parent_row {
            parent_ids.push(row.id);
            parent_ids.extend(self.parent_chain(row.parent_id)?);
        }
        Ok(Snapshot {
            id,
            kind,
            parent_ids,
        })
    }

    /// Move an active snapshot to the committed state under `name`,
    /// recording its final usage. A non-empty labels map replaces the
    /// stored labels.
    pub fn commit_active(
        &self,
        key: &str,
        name: &str,
        usage: Usage,
        labels: &BTreeMap<String, String>,
    ) -> Result<i64> {
        self.require_writable()?;
        if name.is_empty() {
            return Err(StoreError::InvalidArgument(
                "committed name is empty".into(),
            ));
        }
        if self.row(name)?.is_some() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let row = self
            .row(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if row.kind != Kind::Active {
            return Err(StoreError::FailedPrecondition(format!(
                "snapshot {key} is {}, not active",
                row.kind
            )));
        }

        self.conn.execute(
            "UPDATE snapshots SET key = ?1, kind = ?2, size = ?3, inodes = ?4, updated_ns = ?5
             WHERE id = ?6",
            params![
                name,
                Kind::Committed.as_raw(),
                usage.size as i64,
                usage.inodes as i64,
                now_ns(),
                row.id
            ],
        )?;
        if !labels.is_empty() {
            self.replace_labels(row.id, labels)?;
        }
        Ok(row.id)
    }

    /// Remove the snapshot under `key`. Fails while any child still
    /// references it.
    pub fn remove(&self, key: &str) -> Result<(i64, Kind)> {
        self.require_writable()?;
        let row = self
            .row(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let children: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE parent_id = ?1",
            [row.id],
            |r| r.get(0),
        )?;
        if children > 0 {
            return Err(StoreError::FailedPrecondition(format!(
                "snapshot {key} has {children} dependent children"
            )));
        }
        self.conn
            .execute("DELETE FROM labels WHERE snapshot_id = ?1", [row.id])?;
        self.conn
            .execute("DELETE FROM snapshots WHERE id = ?1", [row.id])?;
        Ok((row.id, row.kind))
    }

    /// The set of ids currently live in the store.
    pub fn id_map(&self) -> Result<HashSet<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM snapshots")?;
        let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
        let mut ids = HashSet::new();
        for id in rows {
            ids.insert(id?);
        }
        Ok(ids)
    }

    /// Visit every snapshot in id order. The callback receives the row id
    /// and the public info; filtering is the caller's business.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(i64, &Info) -> Result<()>,
    {
        let mut keys: Vec<(i64, String)> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT id, key FROM snapshots ORDER BY id")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?;
            for row in rows {
                keys.push(row?);
            }
        }
        for (id, key) in keys {
            if let Some(row) = self.row(&key)? {
                let info = self.info_from_row(&key, &row)?;
                f(id, &info)?;
            }
        }
        Ok(())
    }

    /// Update mutable fields of a snapshot. Only labels are mutable; with
    /// an empty `fieldpaths` the whole labels map is replaced, otherwise
    /// each path must be `labels` or `labels.<name>`.
    pub fn update_info(&self, info: &Info, fieldpaths: &[&str]) -> Result<Info> {
        self.require_writable()?;
        let row = self
            .row(&info.name)?
            .ok_or_else(|| StoreError::NotFound(info.name.clone()))?;

        if fieldpaths.is_empty() {
            self.replace_labels(row.id, &info.labels)?;
        } else {
            for path in fieldpaths {
                if *path == "labels" {
                    self.replace_labels(row.id, &info.labels)?;
                } else if let Some(name) = path.strip_prefix("labels.") {
                    match info.labels.get(name) {
                        Some(value) => {
                            self.conn.execute(
                                "INSERT INTO labels (snapshot_id, name, value)
                                 VALUES (?1, ?2, ?3)
                                 ON CONFLICT (snapshot_id, name) DO UPDATE SET value = ?3",
                                params![row.id, name, value],
                            )?;
                        }
                        None => {
                            self.conn.execute(
                                "DELETE FROM labels WHERE snapshot_id = ?1 AND name = ?2",
                                params![row.id, name],
                            )?;
                        }
                    }
                } else {
                    return Err(StoreError::InvalidArgument(format!(
                        "cannot update {path:?} field on snapshot {}",
                        info.name
                    )));
                }
            }
        }
        self.conn.execute(
            "UPDATE snapshots SET updated_ns = ?1 WHERE id = ?2",
            params![now_ns(), row.id],
        )?;

        let row = self
            .row(&info.name)?
            .ok_or_else(|| StoreError::NotFound(info.name.clone()))?;
        self.info_from_row(&info.name, &row)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %err, "failed to roll back transaction");
            }
        }
    }
}
