//! Search resource identities and the dependency declarations between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of resources the provisioner manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    DataSource,
    SearchIndex,
    VectorIndex,
    Skillset,
    Indexer,
}

impl ResourceKind {
    /// REST collection the resource lives in.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::DataSource => "datasources",
            Self::SearchIndex | Self::VectorIndex => "indexes",
            Self::Skillset => "skillsets",
            Self::Indexer => "indexers",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataSource => "data_source",
            Self::SearchIndex => "search_index",
            Self::VectorIndex => "vector_index",
            Self::Skillset => "skillset",
            Self::Indexer => "indexer",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named resource of a given kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Path relative to the service endpoint, e.g. `indexes/web-index`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.kind.collection(), self.name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// A node of the provisioning DAG: a resource and what must exist before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource: ResourceRef,
    pub depends_on: Vec<ResourceRef>,
}

/// Validate a resource name: lowercase letters, digits and dashes, starting
/// with a letter or digit, at most 128 characters.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 128
        && (first.is_ascii_lowercase() || first.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
