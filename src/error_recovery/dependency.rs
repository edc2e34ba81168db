//! Typed identifier for an external dependency

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an external dependency ("model-api", "video-platform", ...)
///
/// Breakers and resource pools are keyed by this type rather than by bare
/// strings so that operation names and dependency ids cannot be mixed up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyId(String);

impl DependencyId {
    /// Create a new dependency id
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DependencyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DependencyId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
