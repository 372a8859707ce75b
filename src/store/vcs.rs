use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};

/// Opens repositories by name.
pub trait VcsStore: Send + Sync {
    fn open(&self, repo: &str) -> Result<Box<dyn VcsRepo>>;
}

/// A single opened repository.
pub trait VcsRepo {
    /// Resolve a revision name (`HEAD`, a branch, a commit) to a full commit ID.
    fn resolve_revision(&self, name: &str) -> Result<String>;
}

/// Git checkouts laid out as `<root>/<repo>`.
#[derive(Debug, Clone)]
pub struct GitVcsStore {
    root: PathBuf,
}

impl GitVcsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl VcsStore for GitVcsStore {
    fn open(&self, repo: &str) -> Result<Box<dyn VcsRepo>> {
        let dir = self.root.join(repo);
        if !dir.is_dir() {
            bail!("repository not found: {}", dir.display());
        }
        Ok(Box::new(GitRepo { dir }))
    }
}

struct GitRepo {
    dir: PathBuf,
}

impl VcsRepo for GitRepo {
    fn resolve_revision(&self, name: &str) -> Result<String> {
        let spec = format!("{name}^{{commit}}");
        let output = run_git(&self.dir, &["rev-parse", "--verify", "--quiet", &spec])?;
        if !output.status.success() {
            bail!("unknown revision {name:?} in {}", self.dir.display());
        }
        let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if commit.is_empty() {
            bail!("git rev-parse returned no commit for {name:?}");
        }
        Ok(commit)
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .output()
        .with_context(|| format!("Failed to run git in {}", dir.display()))
}

/// Fixed HEAD commits per repository, settable at runtime.
///
/// Only `HEAD` and the head commit itself resolve.
#[derive(Debug, Default)]
pub struct StaticVcsStore {
    heads: RwLock<HashMap<String, String>>,
}

impl StaticVcsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_head(self, repo: impl Into<String>, commit: impl Into<String>) -> Self {
        self.set_head(repo, commit);
        self
    }

    /// Move a repository's HEAD.
    pub fn set_head(&self, repo: impl Into<String>, commit: impl Into<String>) {
        let mut heads = self.heads.write().unwrap_or_else(|e| e.into_inner());
        heads.insert(repo.into(), commit.into());
    }
}

impl FromIterator<(String, String)> for StaticVcsStore {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            heads: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl VcsStore for StaticVcsStore {
    fn open(&self, repo: &str) -> Result<Box<dyn VcsRepo>> {
        let heads = self.heads.read().unwrap_or_else(|e| e.into_inner());
        match heads.get(repo) {
            Some(head) => Ok(Box::new(StaticRepo { head: head.clone() })),
            None => bail!("repository not found: {repo}"),
        }
    }
}

struct StaticRepo {
    head: String,
}

impl VcsRepo for StaticRepo {
    fn resolve_revision(&self, name: &str) -> Result<String> {
        if name == "HEAD" || name == self.head {
            Ok(self.head.clone())
        } else {
            bail!("unknown revision {name:?}")
        }
    }
}
