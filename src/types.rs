use serde::{Deserialize, Serialize};

/// Default number of search results when the caller does not set `per_page`.
pub const DEFAULT_PER_PAGE: u32 = 10;

/// Upper bound on `per_page`. Enforced by [`SearchOptions::per_page_or_default`].
pub const MAX_PER_PAGE: u32 = 100;

/// A code symbol as emitted by the graph store.
///
/// Field names follow the srclib graph JSON format (`Repo`, `UnitType`, `CommitID`, ...),
/// so graph dumps deserialize directly into this type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Def {
    pub repo: String,
    #[serde(rename = "CommitID")]
    pub commit_id: String,
    pub unit_type: String,
    pub unit: String,
    pub path: String,
    pub name: String,
    pub kind: String,
    pub file: String,
    /// Opaque payload; stored as serialized JSON and handed back untouched.
    pub data: serde_json::Value,
    pub docs: Vec<DefDoc>,
    /// Function-local symbols (parameters, locals) are never indexed.
    pub local: bool,
}

impl Def {
    /// Create a definition with its key set and every other field empty.
    ///
    /// Use the builder-style setters to fill in metadata.
    pub fn new(
        repo: impl Into<String>,
        unit_type: impl Into<String>,
        unit: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            unit_type: unit_type.into(),
            unit: unit.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Append a doc entry in the given format (`text/plain`, `text/html`, ...).
    pub fn with_doc(mut self, format: impl Into<String>, data: impl Into<String>) -> Self {
        self.docs.push(DefDoc {
            format: format.into(),
            data: data.into(),
        });
        self
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn key(&self) -> DefKey {
        DefKey {
            repo: self.repo.clone(),
            unit_type: self.unit_type.clone(),
            unit: self.unit.clone(),
            path: self.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DefDoc {
    pub format: String,
    pub data: String,
}

/// Identity of a definition across commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DefKey {
    pub repo: String,
    pub unit_type: String,
    pub unit: String,
    pub path: String,
}

impl std::fmt::Display for DefKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}:{}", self.repo, self.unit_type, self.unit, self.path)
    }
}

/// Normalized form of a [`Def`], ready to be written to `global_defs`.
#[derive(Debug, Clone, PartialEq)]
pub struct DefRow {
    pub key: DefKey,
    pub commit_id: String,
    pub name: String,
    pub kind: String,
    pub file: String,
    pub data: Vec<u8>,
    pub bow: String,
    pub doc: String,
}

/// A row of the `global_refs` table: `count` references from some repo into a def.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRef {
    pub def_repo: String,
    pub def_unit_type: String,
    pub def_unit: String,
    pub def_path: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub per_page: Option<u32>,
}

impl SearchOptions {
    /// `per_page` clamped to `1..=MAX_PER_PAGE`, or [`DEFAULT_PER_PAGE`] when unset or zero.
    pub fn per_page_or_default(&self) -> u32 {
        match self.per_page {
            Some(n) if n > 0 => n.min(MAX_PER_PAGE),
            _ => DEFAULT_PER_PAGE,
        }
    }
}

/// A global definition search request.
///
/// `tok_query` is the user query already split into tokens; the last token is
/// treated as the most likely symbol name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDefSearchOp {
    pub tok_query: Vec<String>,
    pub repo_query: Option<String>,
    pub unit_query: Option<String>,
    /// Matched case-insensitively.
    pub unit_type_query: Option<String>,
    pub opt: SearchOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub def: Def,
    pub ref_count: i32,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResultsList {
    pub results: Vec<SearchResult>,
}
