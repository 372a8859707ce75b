use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rmcp::schemars;
use rmcp::{
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    service::RequestContext,
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::db::Database;
use crate::error::GlobalDefsError;
use crate::global_defs::{Cancellation, GlobalDefs};
use crate::store::{AccessControl, GraphStore, VcsStore};
use crate::types::{GlobalDefSearchOp, SearchOptions};

// ── Parameter types ──

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Whitespace-separated query tokens; the last one is matched against symbol names
    pub query: String,
    /// Restrict to one repository
    pub repo: Option<String>,
    /// Restrict to one source unit (package, module, artifact)
    pub unit: Option<String>,
    /// Restrict to one unit type, case-insensitive (e.g. GoPackage)
    pub unit_type: Option<String>,
    /// Maximum results to return (default 10, max 100)
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReposParams {
    /// Repository names, e.g. github.com/acme/parser
    pub repos: Vec<String>,
}

fn mcp_err(msg: impl std::fmt::Display) -> McpError {
    McpError::internal_error(msg.to_string(), None)
}

fn store_err(err: GlobalDefsError) -> McpError {
    if err.is_permission_denied() {
        McpError::invalid_request(err.to_string(), None)
    } else {
        mcp_err(err)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value).map_err(|e| mcp_err(format!("serialization failed: {e}")))
}

// ── Shared state ──

/// Idle read-only connections kept for reuse.
const MAX_IDLE_READERS: usize = 4;

/// Where searches get a connection from.
enum Readers {
    /// Read-only connections on the database file, independent of the writer.
    Pool {
        path: PathBuf,
        idle: Mutex<Vec<Database>>,
    },
    /// Searches share the writer connection (in-memory databases).
    Writer,
}

/// Everything a tool call needs, shared across clones of the server.
///
/// Writes go through one connection behind a mutex. Searches use pooled
/// read-only connections when the database lives in a file, so they never
/// wait for an update to finish.
pub struct ServerState {
    writer: Mutex<Database>,
    readers: Readers,
    vcs: Box<dyn VcsStore>,
    graph: Box<dyn GraphStore>,
    access: Box<dyn AccessControl>,
    actor: String,
    per_page_default: u32,
}

impl ServerState {
    pub fn new(
        db: Database,
        vcs: Box<dyn VcsStore>,
        graph: Box<dyn GraphStore>,
        access: Box<dyn AccessControl>,
        actor: impl Into<String>,
        per_page_default: u32,
    ) -> Self {
        Self {
            writer: Mutex::new(db),
            readers: Readers::Writer,
            vcs,
            graph,
            access,
            actor: actor.into(),
            per_page_default,
        }
    }

    /// Serve searches from read-only connections opened on `path`.
    ///
    /// `path` must be the file the writer database was opened on.
    pub fn with_read_pool(mut self, path: impl Into<PathBuf>) -> Self {
        self.readers = Readers::Pool {
            path: path.into(),
            idle: Mutex::new(Vec::new()),
        };
        self
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db = Database::open(&config.db.path)
            .map_err(|e| anyhow::anyhow!("failed to open database: {e}"))?;
        Ok(Self::new(
            db,
            config.vcs_store(),
            Box::new(config.graph_store()),
            config.access_control()?,
            config.mcp.actor.clone(),
            config.search.per_page_default,
        )
        .with_read_pool(&config.db.path))
    }

    fn index<'a>(&'a self, db: &'a Database) -> GlobalDefs<'a> {
        GlobalDefs::new(db, self.vcs.as_ref(), self.graph.as_ref(), self.access.as_ref())
    }

    /// Run `f` against the writer connection, holding the write mutex.
    fn with_writer<T>(
        &self,
        f: impl FnOnce(&GlobalDefs<'_>, &Database) -> Result<T, McpError>,
    ) -> Result<T, McpError> {
        let db = self
            .writer
            .lock()
            .map_err(|_| mcp_err("database lock poisoned"))?;
        f(&self.index(&db), &db)
    }

    /// Run `f` against a read connection; the write mutex is not taken when pooled.
    fn with_reader<T>(
        &self,
        f: impl FnOnce(&GlobalDefs<'_>, &Database) -> Result<T, McpError>,
    ) -> Result<T, McpError> {
        let Readers::Pool { path, idle } = &self.readers else {
            return self.with_writer(f);
        };

        let pooled = idle
            .lock()
            .map_err(|_| mcp_err("reader pool lock poisoned"))?
            .pop();
        let db = match pooled {
            Some(db) => db,
            None => Database::open_reader(path).map_err(mcp_err)?,
        };
        let result = f(&self.index(&db), &db);

        if let Ok(mut idle) = idle.lock() {
            if idle.len() < MAX_IDLE_READERS {
                idle.push(db);
            }
        }
        result
    }

    pub fn search(&self, params: SearchParams, cancel: &Cancellation) -> Result<String, McpError> {
        let op = GlobalDefSearchOp {
            tok_query: params.query.split_whitespace().map(str::to_string).collect(),
            repo_query: params.repo,
            unit_query: params.unit,
            unit_type_query: params.unit_type,
            opt: SearchOptions {
                per_page: Some(params.limit.unwrap_or(self.per_page_default)),
            },
        };
        if op.tok_query.is_empty() {
            return Err(McpError::invalid_params("query must not be empty", None));
        }
        debug!(query = ?op.tok_query, "search");

        self.with_reader(|gd, db| {
            let results = gd.search(&self.actor, &op, cancel).map_err(store_err)?;
            let json = to_json(&results)?;
            if results.results.is_empty() && !db.has_defs().map_err(store_err)? {
                Ok(format!(
                    "{json}\n\n(Index is empty. Run global_defs_update first.)"
                ))
            } else {
                Ok(json)
            }
        })
    }

    pub fn update(&self, params: ReposParams, cancel: &Cancellation) -> Result<String, McpError> {
        if params.repos.is_empty() {
            return Err(McpError::invalid_params("repos must not be empty", None));
        }
        debug!(repos = ?params.repos, "update");
        self.with_writer(|gd, _| {
            let summary = gd
                .update(&self.actor, &params.repos, cancel)
                .map_err(store_err)?;
            to_json(&summary)
        })
    }

    pub fn refresh_refs(
        &self,
        params: ReposParams,
        cancel: &Cancellation,
    ) -> Result<String, McpError> {
        debug!(repos = ?params.repos, "refresh refs");
        self.with_writer(|gd, _| {
            let updated = gd
                .refresh_ref_counts(&self.actor, &params.repos, cancel)
                .map_err(store_err)?;
            to_json(&serde_json::json!({ "updated": updated }))
        })
    }

    pub fn stats(&self) -> Result<String, McpError> {
        self.with_reader(|_, db| to_json(&db.stats().map_err(store_err)?))
    }
}

/// Run `f` on the blocking pool. A client cancellation of the request trips
/// the [`Cancellation`] handed to `f`.
async fn run_blocking<F>(context: RequestContext<RoleServer>, f: F) -> Result<CallToolResult, McpError>
where
    F: FnOnce(&Cancellation) -> Result<String, McpError> + Send + 'static,
{
    let cancel = Cancellation::new();
    let on_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        context.ct.cancelled().await;
        debug!("request cancelled by client");
        on_cancel.cancel();
    });

    let result = tokio::task::spawn_blocking(move || f(&cancel)).await;
    watcher.abort();

    let json = result.map_err(|e| mcp_err(format!("task join failed: {e}")))??;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

// ── MCP Server ──

#[derive(Clone)]
pub struct GlobalDefsServer {
    tool_router: ToolRouter<Self>,
    state: Arc<ServerState>,
}

#[tool_router]
impl GlobalDefsServer {
    pub fn new(state: ServerState) -> Self {
        Self {
            tool_router: Self::tool_router(),
            state: Arc::new(state),
        }
    }

    /// Ranked search over indexed definitions.
    #[tool(
        description = "Search code definitions (functions, types, fields, packages) across every indexed repository. Results are ranked by text relevance, exact name match on the last query token, and how often the definition is referenced. Optionally filter by repo, unit or unit_type."
    )]
    async fn global_defs_search(
        &self,
        Parameters(params): Parameters<SearchParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let state = Arc::clone(&self.state);
        run_blocking(context, move |cancel| state.search(params, cancel)).await
    }

    /// Re-index repositories at their current HEAD.
    #[tool(
        description = "Re-index the given repositories at their current HEAD commit. Definitions from older commits are removed. Requires write access to every listed repository."
    )]
    async fn global_defs_update(
        &self,
        Parameters(params): Parameters<ReposParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let state = Arc::clone(&self.state);
        run_blocking(context, move |cancel| state.update(params, cancel)).await
    }

    /// Recompute reference counts.
    #[tool(
        description = "Recompute the stored reference counts of the given repositories' definitions from the global reference table. Requires admin access."
    )]
    async fn global_defs_refresh_refs(
        &self,
        Parameters(params): Parameters<ReposParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let state = Arc::clone(&self.state);
        run_blocking(context, move |cancel| state.refresh_refs(params, cancel)).await
    }

    /// Index statistics summary.
    #[tool(
        description = "Show index statistics: definition count, reference rows, indexed commit per repository, breakdown by definition kind."
    )]
    async fn global_defs_stats(
        &self,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let state = Arc::clone(&self.state);
        run_blocking(context, move |_| state.stats()).await
    }
}

#[tool_handler]
impl ServerHandler for GlobalDefsServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "gdefs".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
            instructions: Some(
                "gdefs indexes code definitions from many repositories and ranks them for \
                 symbol search.\n\n\
                 Workflow:\n\
                 1. Use global_defs_search with a few tokens, most specific last \
                 (e.g. \"http client Do\").\n\
                 2. Narrow with repo, unit or unit_type when a name is ambiguous.\n\
                 3. Run global_defs_update for a repository whose results look stale.\n\
                 4. Use global_defs_stats to see which repositories and commits are indexed."
                    .into(),
            ),
        }
    }
}

/// Start the MCP server over stdio.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    info!("starting gdefs MCP server v{}", env!("CARGO_PKG_VERSION"));

    let server = GlobalDefsServer::new(ServerState::from_config(config)?);
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    info!("gdefs MCP server stopped");
    Ok(())
}
