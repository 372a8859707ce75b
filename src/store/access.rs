use std::collections::HashSet;

use anyhow::{Context, Result};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::GlobalDefsError;

/// Authorization checks for index operations.
///
/// Denials come back as [`GlobalDefsError::PermissionDenied`].
pub trait AccessControl: Send + Sync {
    fn verify_read(&self, actor: &str, repo: &str) -> crate::error::Result<()>;
    fn verify_write(&self, actor: &str, repo: &str) -> crate::error::Result<()>;
    fn verify_admin(&self, actor: &str) -> crate::error::Result<()>;
}

fn denied(op: &'static str, actor: &str, subject: &str) -> GlobalDefsError {
    GlobalDefsError::PermissionDenied {
        op,
        actor: actor.to_string(),
        subject: subject.to_string(),
    }
}

/// Grants everything to everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn verify_read(&self, _actor: &str, _repo: &str) -> crate::error::Result<()> {
        Ok(())
    }

    fn verify_write(&self, _actor: &str, _repo: &str) -> crate::error::Result<()> {
        Ok(())
    }

    fn verify_admin(&self, _actor: &str) -> crate::error::Result<()> {
        Ok(())
    }
}

/// Per-repository access level. `Write` implies `Read`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    None,
    #[default]
    Read,
    Write,
}

/// `actor` (or `*` for anyone) gets `level` on repositories matching any of `repos`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub actor: String,
    pub repos: Vec<String>,
    pub level: AccessLevel,
}

/// Compile a repo pattern. `*` and `?` stop at `/`; `**` crosses path segments.
fn repo_glob(pattern: &str) -> std::result::Result<Glob, globset::Error> {
    GlobBuilder::new(pattern).literal_separator(true).build()
}

#[derive(Debug)]
struct CompiledGrant {
    actor: String,
    repos: GlobSet,
    level: AccessLevel,
}

/// Config-driven access control.
///
/// The effective level for `(actor, repo)` is the highest level among matching
/// grants, or `default_level` when none match. Admins have write access everywhere.
#[derive(Debug)]
pub struct StaticAccess {
    default_level: AccessLevel,
    admins: HashSet<String>,
    grants: Vec<CompiledGrant>,
}

impl StaticAccess {
    pub fn new(
        default_level: AccessLevel,
        admins: impl IntoIterator<Item = String>,
        grants: &[AccessGrant],
    ) -> Result<Self> {
        let grants = grants
            .iter()
            .map(|g| {
                let mut builder = GlobSetBuilder::new();
                for pattern in &g.repos {
                    let glob = repo_glob(pattern)
                        .with_context(|| format!("invalid repo pattern {pattern:?} for {}", g.actor))?;
                    builder.add(glob);
                }
                Ok(CompiledGrant {
                    actor: g.actor.clone(),
                    repos: builder.build()?,
                    level: g.level,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            default_level,
            admins: admins.into_iter().collect(),
            grants,
        })
    }

    fn is_admin(&self, actor: &str) -> bool {
        self.admins.contains(actor)
    }

    /// Effective access level of `actor` on `repo`.
    pub fn level(&self, actor: &str, repo: &str) -> AccessLevel {
        if self.is_admin(actor) {
            return AccessLevel::Write;
        }
        self.grants
            .iter()
            .filter(|g| (g.actor == actor || g.actor == "*") && g.repos.is_match(repo))
            .map(|g| g.level)
            .max()
            .unwrap_or(self.default_level)
    }
}

impl AccessControl for StaticAccess {
    fn verify_read(&self, actor: &str, repo: &str) -> crate::error::Result<()> {
        if self.level(actor, repo) >= AccessLevel::Read {
            Ok(())
        } else {
            Err(denied("read", actor, repo))
        }
    }

    fn verify_write(&self, actor: &str, repo: &str) -> crate::error::Result<()> {
        if self.level(actor, repo) >= AccessLevel::Write {
            Ok(())
        } else {
            Err(denied("write", actor, repo))
        }
    }

    fn verify_admin(&self, actor: &str) -> crate::error::Result<()> {
        if self.is_admin(actor) {
            Ok(())
        } else {
            Err(denied("admin", actor, "site"))
        }
    }
}
