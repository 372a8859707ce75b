use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::db::DB_FILE;
use crate::store::{
    AccessControl, AccessGrant, AccessLevel, AllowAll, GitVcsStore, JsonGraphStore, StaticAccess,
    StaticVcsStore, VcsStore,
};
use crate::types::{DEFAULT_PER_PAGE, MAX_PER_PAGE};

/// Config file looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE: &str = "gdefs.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub vcs: VcsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    /// Absent section: every actor may do everything.
    #[serde(default)]
    pub access: Option<AccessConfig>,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DB_FILE)
}

/// Where graph dumps live: `<dir>/<repo>/<commit>.json`.
#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_graph_dir")]
    pub dir: PathBuf,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            dir: default_graph_dir(),
        }
    }
}

fn default_graph_dir() -> PathBuf {
    PathBuf::from("graphs")
}

/// Either git checkouts under `root`, or fixed `heads` per repository.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VcsConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub heads: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_per_page")]
    pub per_page_default: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            per_page_default: default_per_page(),
        }
    }
}

fn default_per_page() -> u32 {
    DEFAULT_PER_PAGE
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccessConfig {
    #[serde(default)]
    pub default_level: AccessLevel,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub grants: Vec<AccessGrant>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Repositories watched when none are given on the command line.
    #[serde(default)]
    pub repos: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            repos: Vec::new(),
        }
    }
}

fn default_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpConfig {
    /// Actor the MCP server acts as for access checks.
    #[serde(default = "default_mcp_actor")]
    pub actor: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            actor: default_mcp_actor(),
        }
    }
}

fn default_mcp_actor() -> String {
    "mcp".to_string()
}

impl Config {
    /// Load `path` if given (it must exist), else `./gdefs.toml` if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => load_config(p),
            None if Path::new(CONFIG_FILE).is_file() => load_config(Path::new(CONFIG_FILE)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PER_PAGE).contains(&self.search.per_page_default) {
            bail!("search.per_page_default must be in [1, {MAX_PER_PAGE}]");
        }
        if self.watch.interval_secs == 0 {
            bail!("watch.interval_secs must be > 0");
        }
        if self.vcs.root.is_some() && !self.vcs.heads.is_empty() {
            bail!("vcs.root and vcs.heads are mutually exclusive");
        }
        if self.mcp.actor.is_empty() {
            bail!("mcp.actor must not be empty");
        }
        // Compiles every grant pattern.
        self.access_control()?;
        Ok(())
    }

    pub fn vcs_store(&self) -> Box<dyn VcsStore> {
        if self.vcs.heads.is_empty() {
            let root = self.vcs.root.clone().unwrap_or_else(|| PathBuf::from("."));
            Box::new(GitVcsStore::new(root))
        } else {
            Box::new(self.vcs.heads.clone().into_iter().collect::<StaticVcsStore>())
        }
    }

    pub fn graph_store(&self) -> JsonGraphStore {
        JsonGraphStore::new(&self.graph.dir)
    }

    pub fn access_control(&self) -> Result<Box<dyn AccessControl>> {
        match &self.access {
            None => Ok(Box::new(AllowAll)),
            Some(access) => Ok(Box::new(StaticAccess::new(
                access.default_level,
                access.admins.clone(),
                &access.grants,
            )?)),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.db.path, PathBuf::from(DB_FILE));
        assert_eq!(config.graph.dir, PathBuf::from("graphs"));
        assert_eq!(config.search.per_page_default, DEFAULT_PER_PAGE);
        assert_eq!(config.watch.interval_secs, 30);
        assert_eq!(config.mcp.actor, "mcp");
        assert!(config.access.is_none());
        assert!(config.access_control().unwrap().verify_admin("anyone").is_ok());
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
            [db]
            path = "/var/lib/gdefs/index.db"

            [graph]
            dir = "/srv/graphs"

            [vcs.heads]
            "github.com/acme/parser" = "c1"

            [search]
            per_page_default = 25

            [access]
            default_level = "none"
            admins = ["root"]

            [[access.grants]]
            actor = "alice"
            repos = ["github.com/acme/*"]
            level = "write"

            [watch]
            interval_secs = 5
            repos = ["github.com/acme/parser"]

            [mcp]
            actor = "assistant"
            "#,
        )
        .unwrap();

        assert_eq!(config.search.per_page_default, 25);
        assert_eq!(config.watch.repos, vec!["github.com/acme/parser"]);

        let access = config.access_control().unwrap();
        assert!(access.verify_write("alice", "github.com/acme/parser").is_ok());
        assert!(access.verify_read("bob", "github.com/acme/parser").is_err());
        assert!(access.verify_admin("root").is_ok());

        let head = config
            .vcs_store()
            .open("github.com/acme/parser")
            .unwrap()
            .resolve_revision("HEAD")
            .unwrap();
        assert_eq!(head, "c1");
    }

    #[test]
    fn test_per_page_default_out_of_range() {
        assert!(parse_config("[search]\nper_page_default = 0").is_err());
        let err = parse_config("[search]\nper_page_default = 101").unwrap_err();
        assert!(err.to_string().contains("per_page_default"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = parse_config("[watch]\ninterval_secs = 0").unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn test_invalid_grant_glob_rejected() {
        let err = parse_config(
            r#"
            [[access.grants]]
            actor = "alice"
            repos = ["[unclosed"]
            level = "read"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid repo pattern"));
    }

    #[test]
    fn test_vcs_root_and_heads_exclusive() {
        let err = parse_config("[vcs]\nroot = \"/src\"\n[vcs.heads]\nr = \"c1\"").unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_unknown_access_level_rejected() {
        assert!(parse_config("[access]\ndefault_level = \"owner\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/gdefs.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
