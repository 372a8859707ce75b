//! Global definition index: ranked full-text search over code symbols from many
//! repositories, kept in sync with each repository's HEAD commit.

pub mod bow;
pub mod config;
pub mod db;
pub mod error;
pub mod global_defs;
pub mod mcp;
pub mod store;
pub mod types;
pub mod watch;

pub use error::{GlobalDefsError, Result};
pub use global_defs::{Cancellation, GlobalDefs, UpdateSummary};
