//! Collaborators the index depends on but does not own: version control,
//! the code graph, and access control.

pub mod access;
pub mod graph;
pub mod vcs;

pub use access::{AccessControl, AccessGrant, AccessLevel, AllowAll, StaticAccess};
pub use graph::{GraphStore, JsonGraphStore, MemoryGraphStore};
pub use vcs::{GitVcsStore, StaticVcsStore, VcsRepo, VcsStore};
