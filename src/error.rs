use thiserror::Error;

/// Errors returned by the global definition store.
#[derive(Debug, Error)]
pub enum GlobalDefsError {
    /// The actor lacks the access level `op` requires. Never retried at this layer.
    #[error("{op}: permission denied for {actor} on {subject}")]
    PermissionDenied {
        op: &'static str,
        actor: String,
        subject: String,
    },

    /// The backing store failed on a write or maintenance path.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] rusqlite::Error),

    /// The backing store failed while executing a search.
    #[error("search unavailable: {0}")]
    SearchUnavailable(#[source] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row {key}: {reason}")]
    CorruptRow { key: String, reason: String },

    #[error("resolving {rev} in {repo}: {source}")]
    Vcs {
        repo: String,
        rev: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("listing defs of {repo}@{commit}: {source}")]
    Graph {
        repo: String,
        commit: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for GlobalDefsError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StoreUnavailable(err)
    }
}

pub type Result<T> = std::result::Result<T, GlobalDefsError>;

impl GlobalDefsError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
