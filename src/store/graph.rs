use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::types::Def;

/// Source of the definitions a repository contains at a given commit.
pub trait GraphStore: Send + Sync {
    /// Every def of `repo` at `commit`, local ones included.
    fn defs(&self, repo: &str, commit: &str) -> Result<Vec<Def>>;
}

/// Graph dumps on disk: `<root>/<repo>/<commit>.json`, or `<root>/<repo>/defs.json`
/// when no per-commit dump exists.
///
/// A dump is either a JSON array of defs or a srclib graph object with a `Defs` array.
#[derive(Debug, Clone)]
pub struct JsonGraphStore {
    root: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GraphDump {
    Defs(Vec<Def>),
    Graph {
        #[serde(rename = "Defs", default)]
        defs: Vec<Def>,
    },
}

/// Fallback dump name used when no `<commit>.json` exists.
const LATEST_DUMP: &str = "defs.json";

impl JsonGraphStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dump_path(&self, repo: &str, commit: &str) -> Option<PathBuf> {
        let dir = self.root.join(repo);
        [format!("{commit}.json"), LATEST_DUMP.to_string()]
            .into_iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }

    /// Repository names that have at least one dump, sorted.
    ///
    /// A repository name is the `/`-joined directory path under the root
    /// (`github.com/acme/parser`).
    pub fn repos(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            bail!("graph directory not found: {}", self.root.display());
        }
        let mut repos = BTreeSet::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            let Ok(rel) = dir.strip_prefix(&self.root) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !name.is_empty() {
                repos.insert(name);
            }
        }
        Ok(repos.into_iter().collect())
    }
}

impl GraphStore for JsonGraphStore {
    fn defs(&self, repo: &str, commit: &str) -> Result<Vec<Def>> {
        let path = self
            .dump_path(repo, commit)
            .with_context(|| format!("no graph dump for {repo}@{commit}"))?;
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let dump: GraphDump = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(match dump {
            GraphDump::Defs(defs) => defs,
            GraphDump::Graph { defs } => defs,
        })
    }
}

/// In-memory graph keyed by `(repo, commit)`.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graphs: RwLock<HashMap<(String, String), Vec<Def>>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, repo: impl Into<String>, commit: impl Into<String>, defs: Vec<Def>) {
        let mut graphs = self.graphs.write().unwrap_or_else(|e| e.into_inner());
        graphs.insert((repo.into(), commit.into()), defs);
    }

    pub fn with_defs(self, repo: impl Into<String>, commit: impl Into<String>, defs: Vec<Def>) -> Self {
        self.insert(repo, commit, defs);
        self
    }
}

impl GraphStore for MemoryGraphStore {
    fn defs(&self, repo: &str, commit: &str) -> Result<Vec<Def>> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        match graphs.get(&(repo.to_string(), commit.to_string())) {
            Some(defs) => Ok(defs.clone()),
            None => bail!("no graph for {repo}@{commit}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_dir(name: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        tmp
    }

    #[test]
    fn test_json_store_reads_commit_dump_then_fallback() {
        let tmp = fresh_dir("gdefs_test_graph_dumps");
        let repo_dir = tmp.join("github.com/acme/parser");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(
            repo_dir.join("c1.json"),
            r#"[{"Repo": "github.com/acme/parser", "Path": "Lexer", "Name": "Lexer"}]"#,
        )
        .unwrap();
        std::fs::write(
            repo_dir.join("defs.json"),
            r#"{"Defs": [{"Path": "A"}, {"Path": "B"}], "Refs": []}"#,
        )
        .unwrap();

        let store = JsonGraphStore::new(&tmp);
        let defs = store.defs("github.com/acme/parser", "c1").unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "Lexer");

        let defs = store.defs("github.com/acme/parser", "c2").unwrap();
        assert_eq!(defs.len(), 2);

        assert!(store.defs("github.com/acme/other", "c1").is_err());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_json_store_rejects_malformed_dump() {
        let tmp = fresh_dir("gdefs_test_graph_malformed");
        std::fs::create_dir_all(tmp.join("r")).unwrap();
        std::fs::write(tmp.join("r/defs.json"), "not json").unwrap();

        let err = JsonGraphStore::new(&tmp).defs("r", "c1").unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_json_store_lists_repos() {
        let tmp = fresh_dir("gdefs_test_graph_repos");
        for repo in ["github.com/a/one", "github.com/b/two", "local"] {
            std::fs::create_dir_all(tmp.join(repo)).unwrap();
            std::fs::write(tmp.join(repo).join("defs.json"), "[]").unwrap();
        }
        std::fs::create_dir_all(tmp.join("empty/dir")).unwrap();
        std::fs::write(tmp.join("README.json"), "[]").unwrap();

        let repos = JsonGraphStore::new(&tmp).repos().unwrap();
        assert_eq!(repos, vec!["github.com/a/one", "github.com/b/two", "local"]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryGraphStore::new().with_defs("r", "c1", vec![Def::new("r", "", "", "A")]);
        assert_eq!(store.defs("r", "c1").unwrap().len(), 1);
        assert!(store.defs("r", "c2").is_err());
    }
}
