//! Criterion benchmarks for global definition search and maintenance.
//!
//! Builds a synthetic corpus of identifiers across several repositories once,
//! then measures search latency (ranked, exact-name, popularity fallback,
//! filtered), a full repository update, and the reference-count refresh.
//!
//! Run with: `cargo bench --bench queries`

use criterion::{criterion_group, criterion_main, Criterion};

use gdefs::db::Database;
use gdefs::store::{AllowAll, MemoryGraphStore, StaticVcsStore};
use gdefs::types::{Def, GlobalDefSearchOp, GlobalRef, SearchOptions};
use gdefs::{Cancellation, GlobalDefs};

const REPOS: usize = 5;
const DEFS_PER_REPO: usize = 2000;

const VERBS: &[&str] = &["get", "set", "parse", "read", "write", "new", "close", "handle"];
const NOUNS: &[&str] = &[
    "Token", "Request", "Response", "Client", "Server", "Config", "Buffer", "Header", "Stream",
    "Session",
];

fn repo_name(i: usize) -> String {
    format!("github.com/bench/repo{i}")
}

fn corpus(repo: &str) -> Vec<Def> {
    (0..DEFS_PER_REPO)
        .map(|i| {
            let verb = VERBS[i % VERBS.len()];
            let noun = NOUNS[(i / VERBS.len()) % NOUNS.len()];
            let name = format!("{verb}{noun}{}", i / (VERBS.len() * NOUNS.len()));
            let unit = format!("pkg{}", i % 7);
            Def::new(repo, "GoPackage", unit.as_str(), format!("{noun}/{name}"))
                .with_name(name.as_str())
                .with_kind(if i % 3 == 0 { "method" } else { "func" })
                .with_file(format!("{unit}/{}.go", noun.to_lowercase()))
                .with_doc("text/plain", format!("{name} will {verb} the {noun}."))
        })
        .collect()
}

fn fixture() -> (StaticVcsStore, MemoryGraphStore) {
    let vcs = StaticVcsStore::new();
    let graph = MemoryGraphStore::new();
    for i in 0..REPOS {
        let repo = repo_name(i);
        graph.insert(repo.as_str(), "c1", corpus(&repo));
        vcs.set_head(repo, "c1");
    }
    (vcs, graph)
}

/// Build an indexed database from the synthetic corpus, with reference counts.
fn setup_db(vcs: &StaticVcsStore, graph: &MemoryGraphStore) -> Database {
    let db = Database::open_memory().expect("open in-memory DB");
    let repos: Vec<String> = (0..REPOS).map(repo_name).collect();
    let gd = GlobalDefs::new(&db, vcs, graph, &AllowAll);
    gd.update("bench", &repos, &Cancellation::new())
        .expect("index corpus");

    let refs: Vec<GlobalRef> = repos
        .iter()
        .flat_map(|repo| {
            corpus(repo).into_iter().enumerate().map(|(i, d)| GlobalRef {
                def_repo: d.repo,
                def_unit_type: d.unit_type,
                def_unit: d.unit,
                def_path: d.path,
                count: (i % 97) as i64,
            })
        })
        .collect();
    db.insert_global_refs(&refs).expect("insert refs");
    gd.refresh_ref_counts("bench", &repos, &Cancellation::new())
        .expect("refresh refs");
    db
}

fn op(toks: &[&str], repo: Option<&str>) -> GlobalDefSearchOp {
    GlobalDefSearchOp {
        tok_query: toks.iter().map(|t| t.to_string()).collect(),
        repo_query: repo.map(str::to_string),
        opt: SearchOptions { per_page: Some(10) },
        ..Default::default()
    }
}

fn bench_search(c: &mut Criterion) {
    let (vcs, graph) = fixture();
    let db = setup_db(&vcs, &graph);
    let gd = GlobalDefs::new(&db, &vcs, &graph, &AllowAll);
    let cancel = Cancellation::new();

    let cases = [
        ("search_single_token", op(&["token"], None)),
        ("search_prefix", op(&["pars"], None)),
        ("search_exact_name", op(&["parseToken3"], None)),
        ("search_multi_token", op(&["client", "read"], None)),
        ("search_repo_filter", op(&["client"], Some("github.com/bench/repo2"))),
        ("search_no_match", op(&["zzznonexistent"], None)),
        ("search_popularity_fallback", op(&["$"], None)),
    ];
    for (name, op) in &cases {
        c.bench_function(name, |b| {
            b.iter(|| gd.search("bench", op, &cancel).unwrap())
        });
    }
}

fn bench_update(c: &mut Criterion) {
    let (vcs, graph) = fixture();
    let db = setup_db(&vcs, &graph);
    let gd = GlobalDefs::new(&db, &vcs, &graph, &AllowAll);
    let repo = vec![repo_name(0)];
    let cancel = Cancellation::new();

    c.bench_function("update_unchanged_repo", |b| {
        b.iter(|| gd.update("bench", &repo, &cancel).unwrap())
    });
}

fn bench_refresh(c: &mut Criterion) {
    let (vcs, graph) = fixture();
    let db = setup_db(&vcs, &graph);
    let gd = GlobalDefs::new(&db, &vcs, &graph, &AllowAll);
    let repos: Vec<String> = (0..REPOS).map(repo_name).collect();
    let cancel = Cancellation::new();

    c.bench_function("refresh_ref_counts_all", |b| {
        b.iter(|| gd.refresh_ref_counts("bench", &repos, &cancel).unwrap())
    });
}

fn bench_stats(c: &mut Criterion) {
    let (vcs, graph) = fixture();
    let db = setup_db(&vcs, &graph);

    c.bench_function("stats", |b| b.iter(|| db.stats().unwrap()));
}

criterion_group!(benches, bench_search, bench_update, bench_refresh, bench_stats);
criterion_main!(benches);
