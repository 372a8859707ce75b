use anyhow::{Context, Result};
use serde::Serialize;

use gdefs::config::Config;
use gdefs::db::Database;
use gdefs::types::{GlobalDefSearchOp, SearchOptions};
use gdefs::watch::{self, WatchOptions};
use gdefs::{Cancellation, GlobalDefs};

fn open_db(config: &Config) -> Result<Database> {
    Database::open(&config.db.path).context("Failed to open gdefs database")
}

/// Print `data` as pretty JSON if `json` is true, otherwise call `human_fmt`.
fn output<T: Serialize>(data: &T, json: bool, human_fmt: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(data)?);
    } else {
        human_fmt(data);
    }
    Ok(())
}

/// Open the database and collaborators from `config` and run `f` against the index.
fn with_index<T>(config: &Config, f: impl FnOnce(&GlobalDefs<'_>) -> Result<T>) -> Result<T> {
    let db = open_db(config)?;
    let vcs = config.vcs_store();
    let graph = config.graph_store();
    let access = config.access_control()?;
    let gd = GlobalDefs::new(&db, vcs.as_ref(), &graph, access.as_ref());
    f(&gd)
}

/// Re-index repositories at their current HEAD.
pub fn cmd_update(
    config: &Config,
    actor: &str,
    repos: Vec<String>,
    all: bool,
    cancel: &Cancellation,
    json: bool,
) -> Result<()> {
    let repos = if all {
        config
            .graph_store()
            .repos()
            .context("Failed to list repositories")?
    } else {
        repos
    };
    if repos.is_empty() {
        println!("No repositories to update");
        return Ok(());
    }

    let summary = with_index(config, |gd| Ok(gd.update(actor, &repos, cancel)?))?;

    output(&summary, json, |s| {
        println!(
            "Updated {} repos: {} defs upserted, {} skipped, {} removed",
            s.repos_updated, s.defs_upserted, s.defs_skipped, s.defs_deleted
        );
    })
}

/// Ranked search over indexed definitions.
#[allow(clippy::too_many_arguments)]
pub fn cmd_search(
    config: &Config,
    actor: &str,
    tokens: Vec<String>,
    repo: Option<String>,
    unit: Option<String>,
    unit_type: Option<String>,
    limit: Option<u32>,
    json: bool,
) -> Result<()> {
    let op = GlobalDefSearchOp {
        tok_query: tokens,
        repo_query: repo,
        unit_query: unit,
        unit_type_query: unit_type,
        opt: SearchOptions {
            per_page: Some(limit.unwrap_or(config.search.per_page_default)),
        },
    };
    let results = with_index(config, |gd| {
        Ok(gd.search(actor, &op, &Cancellation::new())?)
    })?;

    output(&results, json, |list| {
        if list.results.is_empty() {
            println!("No definitions found for '{}'", op.tok_query.join(" "));
            return;
        }
        for r in &list.results {
            let d = &r.def;
            println!(
                "{score:>8.2}  {kind:<8} {name}  {repo} {unit} {path}  ({refs} refs)",
                score = r.score,
                kind = d.kind,
                name = d.name,
                repo = d.repo,
                unit = d.unit,
                path = d.path,
                refs = r.ref_count,
            );
        }
    })
}

/// Recompute reference counts from `global_refs`.
pub fn cmd_refresh_refs(config: &Config, actor: &str, repos: Vec<String>, json: bool) -> Result<()> {
    let updated = with_index(config, |gd| {
        Ok(gd.refresh_ref_counts(actor, &repos, &Cancellation::new())?)
    })?;

    output(&serde_json::json!({ "updated": updated }), json, |_| {
        println!("Refreshed reference counts of {updated} definitions");
    })
}

/// List the indexed definitions of a repository.
pub fn cmd_defs(config: &Config, repo: &str, json: bool) -> Result<()> {
    let db = open_db(config)?;
    let rows = db.rows_for_repo(repo)?;

    output(&rows, json, |rows| {
        if rows.is_empty() {
            println!("No definitions indexed for '{repo}'");
            return;
        }
        for row in rows {
            println!(
                "{kind:<8} {name}  {unit} {path}  {file}  ({refs} refs)",
                kind = row.kind,
                name = row.name,
                unit = row.unit,
                path = row.path,
                file = row.file,
                refs = row.ref_count,
            );
        }
    })
}

/// Index statistics summary.
pub fn cmd_stats(config: &Config, json: bool) -> Result<()> {
    let db = open_db(config)?;
    let stats = db.stats()?;

    output(&stats, json, |stats| {
        println!("Definitions: {}", stats.num_defs);
        println!("Ref rows:    {}", stats.num_refs);
        if !stats.repos.is_empty() {
            println!("Repositories:");
            for repo in &stats.repos {
                println!("  {} @ {}: {} defs", repo.repo, repo.commit_id, repo.num_defs);
            }
        }
        if !stats.def_kinds.is_empty() {
            println!("Definitions by kind:");
            for (kind, count) in &stats.def_kinds {
                println!("  {kind}: {count}");
            }
        }
    })
}

/// Poll repositories and re-index those whose HEAD moved.
pub fn cmd_watch(
    config: &Config,
    actor: &str,
    repos: Vec<String>,
    interval: Option<u64>,
    cancel: &Cancellation,
) -> Result<()> {
    let repos = if repos.is_empty() {
        config.watch.repos.clone()
    } else {
        repos
    };
    if repos.is_empty() {
        anyhow::bail!("no repositories to watch (pass them as arguments or set watch.repos)");
    }

    let mut opts = WatchOptions::new(repos, actor);
    opts.interval = std::time::Duration::from_secs(interval.unwrap_or(config.watch.interval_secs).max(1));

    with_index(config, |gd| Ok(watch::run_watch(gd, &opts, cancel)?))
}
