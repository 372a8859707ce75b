use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::global_defs::{Cancellation, GlobalDefs, UpdateSummary};

/// Sleep granularity while waiting for the next poll, so cancellation is noticed promptly.
const TICK: Duration = Duration::from_millis(200);

/// Settings for the polling loop.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Repositories to keep in sync.
    pub repos: Vec<String>,
    /// Time between polls.
    pub interval: Duration,
    /// Actor the updates run as.
    pub actor: String,
}

impl WatchOptions {
    pub fn new(repos: Vec<String>, actor: impl Into<String>) -> Self {
        Self {
            repos,
            interval: Duration::from_secs(30),
            actor: actor.into(),
        }
    }
}

/// One poll: re-index the watched repositories whose HEAD moved.
///
/// Returns the summary of the update, or `None` when every repository was current.
pub fn poll_once(
    gd: &GlobalDefs<'_>,
    opts: &WatchOptions,
    cancel: &Cancellation,
) -> Result<Option<UpdateSummary>> {
    let stale = gd.stale_repos(&opts.repos)?;
    if stale.is_empty() {
        debug!("all watched repos are current");
        return Ok(None);
    }
    info!(repos = ?stale, "HEAD moved, re-indexing");
    gd.update(&opts.actor, &stale, cancel).map(Some)
}

/// Run the polling loop in the foreground until `cancel` is set.
///
/// Failed polls are logged and retried on the next interval; a permission
/// failure or cancellation ends the loop.
pub fn run_watch(gd: &GlobalDefs<'_>, opts: &WatchOptions, cancel: &Cancellation) -> Result<()> {
    info!(
        repos = opts.repos.len(),
        interval_s = opts.interval.as_secs(),
        "starting watch"
    );

    loop {
        match poll_once(gd, opts, cancel) {
            Ok(Some(summary)) => info!(
                repos = summary.repos_updated,
                upserted = summary.defs_upserted,
                deleted = summary.defs_deleted,
                "re-indexed"
            ),
            Ok(None) => {}
            Err(e) if e.is_cancelled() => break,
            Err(e) if e.is_permission_denied() => return Err(e),
            Err(e) => warn!(error = %e, "poll failed"),
        }

        let next = Instant::now() + opts.interval;
        while Instant::now() < next {
            if cancel.is_cancelled() {
                break;
            }
            std::thread::sleep(TICK.min(next.saturating_duration_since(Instant::now())));
        }
        if cancel.is_cancelled() {
            break;
        }
    }

    info!("watch stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::{AccessLevel, AllowAll, MemoryGraphStore, StaticAccess, StaticVcsStore};
    use crate::types::Def;

    fn defs(repo: &str, names: &[&str]) -> Vec<Def> {
        names
            .iter()
            .map(|n| Def::new(repo, "GoPackage", "pkg", *n).with_name(*n))
            .collect()
    }

    #[test]
    fn test_poll_once_updates_only_moved_repos() {
        let db = Database::open_memory().unwrap();
        let vcs = StaticVcsStore::new().with_head("a", "c1").with_head("b", "c1");
        let graph = MemoryGraphStore::new()
            .with_defs("a", "c1", defs("a", &["Old"]))
            .with_defs("a", "c2", defs("a", &["New"]))
            .with_defs("b", "c1", defs("b", &["Stay"]));
        let gd = GlobalDefs::new(&db, &vcs, &graph, &AllowAll);
        let opts = WatchOptions::new(vec!["a".into(), "b".into()], "watcher");
        let cancel = Cancellation::new();

        let first = poll_once(&gd, &opts, &cancel).unwrap().unwrap();
        assert_eq!(first.repos_updated, 2);
        assert!(poll_once(&gd, &opts, &cancel).unwrap().is_none());

        vcs.set_head("a", "c2");
        let second = poll_once(&gd, &opts, &cancel).unwrap().unwrap();
        assert_eq!(second.repos_updated, 1);
        assert_eq!(second.defs_deleted, 1);

        let paths: Vec<String> = db.rows_for_repo("a").unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["New"]);
    }

    #[test]
    fn test_run_watch_stops_when_cancelled() {
        let db = Database::open_memory().unwrap();
        let vcs = StaticVcsStore::new().with_head("a", "c1");
        let graph = MemoryGraphStore::new().with_defs("a", "c1", defs("a", &["X"]));
        let gd = GlobalDefs::new(&db, &vcs, &graph, &AllowAll);
        let opts = WatchOptions::new(vec!["a".into()], "watcher");

        let cancel = Cancellation::new();
        cancel.cancel();
        run_watch(&gd, &opts, &cancel).unwrap();
        assert!(db.rows_for_repo("a").unwrap().is_empty());
    }

    #[test]
    fn test_run_watch_fails_on_permission_denied() {
        let db = Database::open_memory().unwrap();
        let vcs = StaticVcsStore::new().with_head("a", "c1");
        let graph = MemoryGraphStore::new().with_defs("a", "c1", defs("a", &["X"]));
        let access = StaticAccess::new(AccessLevel::Read, Vec::new(), &[]).unwrap();
        let gd = GlobalDefs::new(&db, &vcs, &graph, &access);
        let opts = WatchOptions::new(vec!["a".into()], "watcher");

        let err = run_watch(&gd, &opts, &Cancellation::new()).unwrap_err();
        assert!(err.is_permission_denied());
    }
}
