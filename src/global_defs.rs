//! Indexing, search and reference-count maintenance for the global definition index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bow::{bag_of_words, choose_docstring, plain_text, user_query_to_fts};
use crate::db::{Database, ScoredRow, TopKQuery};
use crate::error::{GlobalDefsError, Result};
use crate::store::{AccessControl, GraphStore, VcsStore};
use crate::types::{Def, DefDoc, DefKey, DefRow, GlobalDefSearchOp, SearchResult, SearchResultsList};

/// Upserts between cancellation checks.
const CANCEL_CHECK_INTERVAL: u32 = 256;

/// Cooperative cancellation flag shared between an operation and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GlobalDefsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Summary of an update run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub repos_updated: u32,
    pub defs_upserted: u32,
    pub defs_skipped: u32,
    pub defs_deleted: u32,
}

/// The global definition index: a database plus the collaborators it reads from.
pub struct GlobalDefs<'a> {
    db: &'a Database,
    vcs: &'a dyn VcsStore,
    graph: &'a dyn GraphStore,
    access: &'a dyn AccessControl,
}

impl<'a> GlobalDefs<'a> {
    pub fn new(
        db: &'a Database,
        vcs: &'a dyn VcsStore,
        graph: &'a dyn GraphStore,
        access: &'a dyn AccessControl,
    ) -> Self {
        Self {
            db,
            vcs,
            graph,
            access,
        }
    }

    /// Re-index each repository at its current HEAD.
    ///
    /// Write access is checked on every repository before any work starts.
    /// Each repository is replaced in its own transaction: rows for defs at HEAD
    /// are upserted, rows from other commits deleted. The first failure stops the
    /// run; repositories committed before it stay updated.
    pub fn update(
        &self,
        actor: &str,
        repos: &[String],
        cancel: &Cancellation,
    ) -> Result<UpdateSummary> {
        for repo in repos {
            self.access.verify_write(actor, repo)?;
        }

        let mut summary = UpdateSummary::default();
        for repo in repos {
            cancel.check()?;
            self.update_repo(repo, cancel, &mut summary)?;
            summary.repos_updated += 1;
        }
        Ok(summary)
    }

    fn update_repo(
        &self,
        repo: &str,
        cancel: &Cancellation,
        summary: &mut UpdateSummary,
    ) -> Result<()> {
        let head = self.resolve_head(repo)?;
        cancel.check()?;

        let defs = self
            .graph
            .defs(repo, &head)
            .map_err(|source| GlobalDefsError::Graph {
                repo: repo.to_string(),
                commit: head.clone(),
                source,
            })?;
        cancel.check()?;

        let tx = self.db.write_transaction()?;
        let (mut upserted, mut skipped) = (0u32, 0u32);
        for def in defs {
            let Some(row) = def_row(def, repo, &head) else {
                skipped += 1;
                continue;
            };
            self.db.upsert_def(&row)?;
            upserted += 1;
            if upserted % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }
        }
        let deleted = self.db.delete_stale_for_repo(repo, &head)?;
        cancel.check()?;
        tx.commit()?;

        info!(
            repo = %repo,
            commit = %head,
            upserted,
            skipped,
            deleted,
            "updated global defs"
        );
        summary.defs_upserted += upserted;
        summary.defs_skipped += skipped;
        summary.defs_deleted += u32::try_from(deleted).unwrap_or(u32::MAX);
        Ok(())
    }

    fn resolve_head(&self, repo: &str) -> Result<String> {
        let vcs_err = |source| GlobalDefsError::Vcs {
            repo: repo.to_string(),
            rev: "HEAD".to_string(),
            source,
        };
        self.vcs
            .open(repo)
            .and_then(|r| r.resolve_revision("HEAD"))
            .map_err(vcs_err)
    }

    /// Repositories whose HEAD differs from the commit their stored rows carry.
    ///
    /// Never-indexed repositories count as stale. Repositories whose HEAD cannot
    /// be resolved are logged and left out.
    pub fn stale_repos(&self, repos: &[String]) -> Result<Vec<String>> {
        let indexed = self.db.repo_commits()?;
        let mut stale = Vec::new();
        for repo in repos {
            match self.resolve_head(repo) {
                Ok(head) if indexed.get(repo) == Some(&head) => {}
                Ok(_) => stale.push(repo.clone()),
                Err(e) => warn!(repo = %repo, error = %e, "cannot resolve HEAD, skipping"),
            }
        }
        Ok(stale)
    }

    /// Ranked definition search.
    ///
    /// At most `per_page` rows are selected, then rows the actor cannot read are
    /// dropped, so a page may come back short.
    pub fn search(
        &self,
        actor: &str,
        op: &GlobalDefSearchOp,
        cancel: &Cancellation,
    ) -> Result<SearchResultsList> {
        let Some(last_tok) = op.tok_query.last() else {
            return Ok(SearchResultsList::default());
        };
        cancel.check()?;

        let fts_query = user_query_to_fts(&op.tok_query);
        let query = TopKQuery {
            fts_query: &fts_query,
            last_tok,
            repo: op.repo_query.as_deref(),
            unit: op.unit_query.as_deref(),
            unit_type: op.unit_type_query.as_deref(),
            limit: op.opt.per_page_or_default(),
        };
        debug!(query = %fts_query, limit = query.limit, "searching global defs");
        let rows = self.db.query_top_k(&query)?;
        cancel.check()?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            match self.access.verify_read(actor, &row.key.repo) {
                Ok(()) => {}
                Err(e) if e.is_permission_denied() => continue,
                Err(e) => return Err(e),
            }
            match hydrate(row) {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "skipping global_defs row"),
            }
        }
        Ok(SearchResultsList { results })
    }

    /// Recompute stored reference counts of the given repositories from `global_refs`.
    ///
    /// Requires admin access. Definitions with no recorded references keep their count.
    pub fn refresh_ref_counts(
        &self,
        actor: &str,
        repos: &[String],
        cancel: &Cancellation,
    ) -> Result<usize> {
        self.access.verify_admin(actor)?;
        cancel.check()?;
        let updated = self.db.update_ref_counts(repos)?;
        info!(repos = repos.len(), updated, "refreshed global def ref counts");
        Ok(updated)
    }
}

/// Normalize a graph def into a storable row, or `None` if it is never indexed
/// (empty path, function-local, or a `$`-path synthetic def).
pub fn def_row(mut def: Def, repo: &str, head: &str) -> Option<DefRow> {
    if def.path.is_empty() || def.local || def.path.contains('$') {
        return None;
    }
    if def.repo.is_empty() {
        def.repo = repo.to_string();
    }

    let doc = choose_docstring(&def.docs)
        .map(plain_text)
        .unwrap_or_default();
    let bow = bag_of_words(&def, &doc);
    let data = match serde_json::to_vec(&def.data) {
        Ok(data) => data,
        Err(e) => {
            warn!(def = %def.key(), error = %e, "cannot serialize def data, storing empty payload");
            Vec::new()
        }
    };

    Some(DefRow {
        key: def.key(),
        commit_id: head.to_string(),
        name: def.name,
        kind: def.kind,
        file: def.file,
        data,
        bow,
        doc,
    })
}

fn hydrate(row: ScoredRow) -> Result<SearchResult> {
    let data = if row.data.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&row.data).map_err(|e| GlobalDefsError::CorruptRow {
            key: row.key.to_string(),
            reason: format!("data payload: {e}"),
        })?
    };
    let DefKey {
        repo,
        unit_type,
        unit,
        path,
    } = row.key;

    Ok(SearchResult {
        def: Def {
            repo,
            commit_id: row.commit_id,
            unit_type,
            unit,
            path,
            name: row.name,
            kind: row.kind,
            file: row.file,
            data,
            docs: vec![DefDoc {
                format: "text/plain".to_string(),
                data: row.doc,
            }],
            local: false,
        },
        ref_count: i32::try_from(row.ref_count).unwrap_or(i32::MAX),
        score: row.score as f32,
    })
}
