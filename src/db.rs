use std::collections::HashMap;

use anyhow::Context;
use rusqlite::functions::FunctionFlags;
use rusqlite::{
    params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior,
};
use serde::Serialize;
use tracing::warn;

use crate::error::{GlobalDefsError, Result};
use crate::types::{DefKey, DefRow, GlobalRef};

const SQL_UPSERT_DEF: &str = "INSERT INTO global_defs
     (repo, commit_id, unit_type, unit, path, name, kind, file, updated_at, data, bow, doc)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), ?9, ?10, ?11)
     ON CONFLICT (repo, unit_type, unit, path) DO UPDATE SET
        commit_id = excluded.commit_id,
        name = excluded.name,
        kind = excluded.kind,
        file = excluded.file,
        updated_at = excluded.updated_at,
        data = excluded.data,
        bow = excluded.bow,
        doc = excluded.doc";

const SQL_INSERT_REF: &str =
    "INSERT INTO global_refs (def_repo, def_unit_type, def_unit, def_path, count)
     VALUES (?1, ?2, ?3, ?4, ?5)";

// ?1 = FTS query, ?2 = last user token, ?3 = repo, ?4 = unit, ?5 = unit type, ?6 = limit.
// -bm25() is >= 0; s/(1+s) maps it into [0, 1).
const SQL_TOP_K_TEXT: &str = "SELECT d.id, d.repo, d.unit_type, d.unit, d.path, d.commit_id,
        d.name, d.kind, d.file, d.data, d.doc, d.ref_ct,
        0.5 * ref_log10(10 + d.ref_ct)
          + 100.0 * (-bm25(global_defs_bow_fts) / (1.0 - bm25(global_defs_bow_fts)))
          + 100.0 * (LOWER(d.name) = LOWER(?2)) AS score
     FROM global_defs_bow_fts
     JOIN global_defs d ON d.id = global_defs_bow_fts.rowid
     WHERE global_defs_bow_fts MATCH ?1
       AND d.bow != ''
       AND (?3 IS NULL OR d.repo = ?3)
       AND (?4 IS NULL OR d.unit = ?4)
       AND (?5 IS NULL OR LOWER(d.unit_type) = LOWER(?5))
     ORDER BY score DESC, d.ref_ct DESC, d.repo, d.unit_type, d.unit, d.path
     LIMIT ?6";

// ?1 = repo, ?2 = unit, ?3 = unit type, ?4 = limit.
const SQL_TOP_K_POPULAR: &str = "SELECT d.id, d.repo, d.unit_type, d.unit, d.path, d.commit_id,
        d.name, d.kind, d.file, d.data, d.doc, d.ref_ct,
        CAST(d.ref_ct AS REAL) AS score
     FROM global_defs d
     WHERE (?1 IS NULL OR d.repo = ?1)
       AND (?2 IS NULL OR d.unit = ?2)
       AND (?3 IS NULL OR LOWER(d.unit_type) = LOWER(?3))
     ORDER BY score DESC, d.repo, d.unit_type, d.unit, d.path
     LIMIT ?4";

const SQL_REFRESH_REF_COUNTS: &str = "UPDATE global_defs
     SET ref_ct = refs.ref_ct
     FROM (SELECT def_repo, def_unit_type, def_unit, def_path, MAX(SUM(count), 0) AS ref_ct
           FROM global_refs
           WHERE def_repo IN (SELECT value FROM json_each(?1))
           GROUP BY def_repo, def_unit_type, def_unit, def_path) AS refs
     WHERE global_defs.repo = refs.def_repo
       AND global_defs.unit_type = refs.def_unit_type
       AND global_defs.unit = refs.def_unit
       AND global_defs.path = refs.def_path";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS global_defs (
    id INTEGER PRIMARY KEY,
    repo TEXT NOT NULL,
    commit_id TEXT NOT NULL,
    unit_type TEXT NOT NULL,
    unit TEXT NOT NULL,
    path TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL DEFAULT '',
    file TEXT NOT NULL DEFAULT '',
    ref_ct INTEGER NOT NULL DEFAULT 0 CHECK (ref_ct >= 0),
    updated_at TEXT NOT NULL,
    data BLOB NOT NULL DEFAULT x'',
    bow TEXT NOT NULL DEFAULT '',
    doc TEXT NOT NULL DEFAULT '',
    UNIQUE (repo, unit_type, unit, path)
);

CREATE TABLE IF NOT EXISTS global_refs (
    def_repo TEXT NOT NULL,
    def_unit_type TEXT NOT NULL,
    def_unit TEXT NOT NULL,
    def_path TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_global_defs_repo_commit ON global_defs(repo, commit_id);
CREATE INDEX IF NOT EXISTS idx_global_refs_def ON global_refs(def_repo, def_unit_type, def_unit, def_path);

CREATE VIRTUAL TABLE IF NOT EXISTS global_defs_bow_fts
    USING fts5(bow, content='global_defs', content_rowid='id');
CREATE VIRTUAL TABLE IF NOT EXISTS global_defs_doc_fts
    USING fts5(doc, content='global_defs', content_rowid='id');

CREATE TRIGGER IF NOT EXISTS global_defs_ai AFTER INSERT ON global_defs BEGIN
    INSERT INTO global_defs_bow_fts(rowid, bow) VALUES (new.id, new.bow);
    INSERT INTO global_defs_doc_fts(rowid, doc) VALUES (new.id, new.doc);
END;

CREATE TRIGGER IF NOT EXISTS global_defs_ad AFTER DELETE ON global_defs BEGIN
    INSERT INTO global_defs_bow_fts(global_defs_bow_fts, rowid, bow) VALUES ('delete', old.id, old.bow);
    INSERT INTO global_defs_doc_fts(global_defs_doc_fts, rowid, doc) VALUES ('delete', old.id, old.doc);
END;

CREATE TRIGGER IF NOT EXISTS global_defs_au_bow AFTER UPDATE OF bow ON global_defs BEGIN
    INSERT INTO global_defs_bow_fts(global_defs_bow_fts, rowid, bow) VALUES ('delete', old.id, old.bow);
    INSERT INTO global_defs_bow_fts(rowid, bow) VALUES (new.id, new.bow);
END;

CREATE TRIGGER IF NOT EXISTS global_defs_au_doc AFTER UPDATE OF doc ON global_defs BEGIN
    INSERT INTO global_defs_doc_fts(global_defs_doc_fts, rowid, doc) VALUES ('delete', old.id, old.doc);
    INSERT INTO global_defs_doc_fts(rowid, doc) VALUES (new.id, new.doc);
END;
"#;

/// Default database filename, stored in the working directory.
pub const DB_FILE: &str = ".gdefs.db";

/// Filters and limit for [`Database::query_top_k`].
#[derive(Debug, Clone, Default)]
pub struct TopKQuery<'a> {
    /// FTS5 match expression; empty ranks by reference count with no text filter.
    pub fts_query: &'a str,
    /// Last user token, compared case-insensitively against the def name.
    pub last_tok: &'a str,
    pub repo: Option<&'a str>,
    pub unit: Option<&'a str>,
    pub unit_type: Option<&'a str>,
    pub limit: u32,
}

/// A `global_defs` row as returned by a ranked query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRow {
    pub key: DefKey,
    pub commit_id: String,
    pub name: String,
    pub kind: String,
    pub file: String,
    pub data: Vec<u8>,
    pub doc: String,
    pub ref_count: i64,
    pub score: f64,
}

/// Every column of a `global_defs` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub repo: String,
    pub commit_id: String,
    pub unit_type: String,
    pub unit: String,
    pub path: String,
    pub name: String,
    pub kind: String,
    pub file: String,
    pub ref_count: i64,
    pub updated_at: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub bow: String,
    pub doc: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoStats {
    pub repo: String,
    pub commit_id: String,
    pub num_defs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub num_defs: u64,
    pub num_refs: u64,
    pub repos: Vec<RepoStats>,
    pub def_kinds: Vec<(String, u64)>,
}

pub struct Database {
    conn: Connection,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open or create the database at the given path.
    ///
    /// Each `Database` owns one connection. Concurrent searchers should open
    /// their own; WAL mode lets them read the last committed snapshot while a
    /// writer holds its transaction.
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open database")?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-65536;
             PRAGMA temp_store=MEMORY;",
        )
        .context("Failed to set pragmas")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        Self::init(conn)
    }

    /// Open a read-only connection to an existing database created by [`open`](Self::open).
    ///
    /// No schema setup runs, so opening never waits on a writer. Reads see the
    /// last committed snapshot.
    pub fn open_reader(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open database for reading")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        register_functions(&conn).context("Failed to register SQL functions")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for tests and benchmarks).
    #[doc(hidden)]
    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create schema")?;
        register_functions(&conn).context("Failed to register SQL functions")?;
        Ok(Self { conn })
    }

    /// Begin an immediate (write-locking) transaction.
    ///
    /// Statements issued through `self` while the transaction is alive run
    /// inside it. Dropping the transaction without `commit()` rolls it back.
    pub fn write_transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    // ── Definitions ──

    /// Insert a definition row or overwrite the existing row with the same key.
    ///
    /// Every column except `ref_ct` is rewritten and `updated_at` is stamped.
    pub fn upsert_def(&self, row: &DefRow) -> Result<()> {
        self.conn.prepare_cached(SQL_UPSERT_DEF)?.execute(params![
            row.key.repo,
            row.commit_id,
            row.key.unit_type,
            row.key.unit,
            row.key.path,
            row.name,
            row.kind,
            row.file,
            row.data,
            row.bow,
            row.doc,
        ])?;
        Ok(())
    }

    /// Delete every row of `repo` not tagged with `current_commit`. Returns the number removed.
    pub fn delete_stale_for_repo(&self, repo: &str, current_commit: &str) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM global_defs WHERE repo = ?1 AND commit_id != ?2",
            params![repo, current_commit],
        )?;
        Ok(n)
    }

    /// Recompute `ref_ct` for the defs of `repos` from `global_refs`, in one statement.
    ///
    /// Keys with no `global_refs` rows keep their previous count. Negative sums clamp to 0.
    /// Returns the number of rows updated.
    pub fn update_ref_counts(&self, repos: &[String]) -> Result<usize> {
        if repos.is_empty() {
            return Ok(0);
        }
        let repos_json = serde_json::to_string(repos).map_err(|e| {
            GlobalDefsError::StoreUnavailable(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
        })?;
        let n = self
            .conn
            .execute(SQL_REFRESH_REF_COUNTS, params![repos_json])?;
        Ok(n)
    }

    /// Ranked selection over `global_defs`, best first, at most `q.limit` rows.
    ///
    /// Rows that fail to decode are logged and skipped. An FTS5 syntax error in
    /// `q.fts_query` yields no rows.
    pub fn query_top_k(&self, q: &TopKQuery<'_>) -> Result<Vec<ScoredRow>> {
        let result = if q.fts_query.is_empty() {
            self.collect_scored(
                SQL_TOP_K_POPULAR,
                params![q.repo, q.unit, q.unit_type, q.limit],
            )
        } else {
            self.collect_scored(
                SQL_TOP_K_TEXT,
                params![
                    q.fts_query,
                    q.last_tok,
                    q.repo,
                    q.unit,
                    q.unit_type,
                    q.limit
                ],
            )
        };

        match result {
            Err(e) if is_fts5_syntax_error(&e) => {
                warn!(query = %q.fts_query, error = %e, "unparseable full-text query, treating as no match");
                Ok(Vec::new())
            }
            Err(e) => Err(GlobalDefsError::SearchUnavailable(e)),
            Ok(rows) => Ok(rows),
        }
    }

    fn collect_scored(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> rusqlite::Result<Vec<ScoredRow>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            match row_to_scored(row) {
                Ok(scored) => out.push(scored),
                Err(e) => {
                    let id = row.get::<_, i64>(0).unwrap_or_default();
                    let err = GlobalDefsError::CorruptRow {
                        key: format!("id={id}"),
                        reason: e.to_string(),
                    };
                    warn!(error = %err, "skipping global_defs row");
                }
            }
        }
        Ok(out)
    }

    /// All rows of a repository, ordered by key.
    pub fn rows_for_repo(&self, repo: &str) -> Result<Vec<StoredRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT repo, commit_id, unit_type, unit, path, name, kind, file,
                    ref_ct, updated_at, data, bow, doc
             FROM global_defs WHERE repo = ?1
             ORDER BY unit_type, unit, path",
        )?;
        let rows = stmt
            .query_map(params![repo], row_to_stored)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Look up one row by definition key.
    pub fn get_row(&self, key: &DefKey) -> Result<Option<StoredRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT repo, commit_id, unit_type, unit, path, name, kind, file,
                        ref_ct, updated_at, data, bow, doc
                 FROM global_defs
                 WHERE repo = ?1 AND unit_type = ?2 AND unit = ?3 AND path = ?4",
                params![key.repo, key.unit_type, key.unit, key.path],
                row_to_stored,
            )
            .optional()?;
        Ok(row)
    }

    /// The commit each stored repository's rows are tagged with.
    pub fn repo_commits(&self) -> Result<HashMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT DISTINCT repo, commit_id FROM global_defs")?;
        let commits = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(commits)
    }

    // ── References ──

    /// Append rows to `global_refs`. That table is owned by the reference
    /// indexer; this exists for fixtures, tests and benchmarks.
    #[doc(hidden)]
    pub fn insert_global_refs(&self, refs: &[GlobalRef]) -> Result<()> {
        let tx = self.write_transaction()?;
        {
            let mut stmt = self.conn.prepare_cached(SQL_INSERT_REF)?;
            for r in refs {
                stmt.execute(params![
                    r.def_repo,
                    r.def_unit_type,
                    r.def_unit,
                    r.def_path,
                    r.count
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── Stats ──

    /// Whether any definition is indexed.
    pub fn has_defs(&self) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM global_defs)",
            [],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Index statistics.
    pub fn stats(&self) -> Result<IndexStats> {
        let num_defs: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM global_defs", [], |row| row.get(0))?;
        let num_refs: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM global_refs", [], |row| row.get(0))?;

        let mut repo_stmt = self.conn.prepare(
            "SELECT repo, commit_id, COUNT(*) FROM global_defs
             GROUP BY repo, commit_id ORDER BY repo",
        )?;
        let repos = repo_stmt
            .query_map([], |row| {
                Ok(RepoStats {
                    repo: row.get(0)?,
                    commit_id: row.get(1)?,
                    num_defs: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut kind_stmt = self.conn.prepare(
            "SELECT kind, COUNT(*) FROM global_defs GROUP BY kind ORDER BY COUNT(*) DESC, kind",
        )?;
        let def_kinds = kind_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(IndexStats {
            num_defs,
            num_refs,
            repos,
            def_kinds,
        })
    }
}

/// `ref_log10(x)`: base-10 logarithm used by the popularity term of the score.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "ref_log10",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let x: f64 = ctx.get(0)?;
            Ok(x.max(1.0).log10())
        },
    )
}

/// Check if an error is an FTS5 query syntax error (expected, not an outage).
fn is_fts5_syntax_error(err: &rusqlite::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("fts5: syntax error") || msg.contains("unterminated string")
}

// ── Row Mapping Helpers ──

fn row_to_scored(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoredRow> {
    Ok(ScoredRow {
        key: DefKey {
            repo: row.get(1)?,
            unit_type: row.get(2)?,
            unit: row.get(3)?,
            path: row.get(4)?,
        },
        commit_id: row.get(5)?,
        name: row.get(6)?,
        kind: row.get(7)?,
        file: row.get(8)?,
        data: row.get(9)?,
        doc: row.get(10)?,
        ref_count: row.get(11)?,
        score: row.get(12)?,
    })
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        repo: row.get(0)?,
        commit_id: row.get(1)?,
        unit_type: row.get(2)?,
        unit: row.get(3)?,
        path: row.get(4)?,
        name: row.get(5)?,
        kind: row.get(6)?,
        file: row.get(7)?,
        ref_count: row.get(8)?,
        updated_at: row.get(9)?,
        data: row.get(10)?,
        bow: row.get(11)?,
        doc: row.get(12)?,
    })
}
