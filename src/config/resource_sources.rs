//! Resource sources for dependency pools
//!
//! Redundant credentials (or ranked candidates) for a dependency are
//! gathered at startup from several named sources, highest priority first:
//!
//! 1. explicit values handed in by the caller
//! 2. a dedicated file holding only this dependency's entries
//! 3. a shared file with entries for many dependencies
//! 4. an environment variable
//!
//! Files list one value per line. Blank lines and lines starting with `#`
//! are ignored. In the shared file a line may be scoped to one dependency as
//! `dependency: value`; unscoped lines apply to every dependency.

use crate::error::{ResilienceError, Result};
use crate::error_recovery::{DependencyId, ExhaustionPolicy, ResourceEntry, ResourcePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory name under the user config dir holding resource files
pub const RESOURCE_DIR: &str = "pipeline-resilience";

/// Shared multi-dependency resource file name
pub const SHARED_FILE: &str = "resources.txt";

/// One named source of candidate values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSource {
    Explicit(Vec<String>),
    Dedicated(PathBuf),
    Shared(PathBuf),
    Environment(String),
}

impl ResourceSource {
    /// Label recorded on entries loaded from this source
    pub fn label(&self) -> String {
        match self {
            Self::Explicit(_) => "explicit".to_string(),
            Self::Dedicated(path) => format!("dedicated:{}", path.display()),
            Self::Shared(path) => format!("shared:{}", path.display()),
            Self::Environment(var) => format!("env:{var}"),
        }
    }

    async fn values(&self, dependency: &DependencyId) -> Result<Vec<String>> {
        match self {
            Self::Explicit(values) => Ok(values
                .iter()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()),
            Self::Dedicated(path) => Ok(read_optional(path)
                .await?
                .map(|content| parse_dedicated(&content))
                .unwrap_or_default()),
            Self::Shared(path) => Ok(read_optional(path)
                .await?
                .map(|content| parse_shared(&content, dependency))
                .unwrap_or_default()),
            Self::Environment(var) => Ok(std::env::var(var)
                .map(|raw| parse_list(&raw))
                .unwrap_or_default()),
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Resource file not present, skipping");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn is_content(line: &str) -> bool {
    !line.is_empty() && !line.starts_with('#')
}

fn parse_dedicated(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| is_content(line))
        .map(str::to_string)
        .collect()
}

fn parse_shared(content: &str, dependency: &DependencyId) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| is_content(line))
        .filter_map(|line| match scoped(line) {
            Some((scope, value)) if scope == dependency.as_str() => Some(value.to_string()),
            Some(_) => None,
            None => Some(line.to_string()),
        })
        .filter(|value| !value.is_empty())
        .collect()
}

/// Split `dependency: value`. The colon must be followed by whitespace so
/// values such as URLs are never mistaken for a scope.
fn scoped(line: &str) -> Option<(&str, &str)> {
    let (scope, rest) = line.split_once(':')?;
    let scope = scope.trim();
    if scope.is_empty() || scope.contains(char::is_whitespace) {
        return None;
    }
    rest.starts_with(char::is_whitespace)
        .then(|| (scope, rest.trim()))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|value| is_content(value))
        .map(str::to_string)
        .collect()
}

/// Builds a [`ResourcePool`] from priority-ordered sources
#[derive(Debug, Clone)]
pub struct ResourceLoader {
    dependency: DependencyId,
    sources: Vec<ResourceSource>,
    policy: ExhaustionPolicy,
}

impl ResourceLoader {
    pub fn new(dependency: DependencyId) -> Self {
        Self {
            dependency,
            sources: Vec::new(),
            policy: ExhaustionPolicy::default(),
        }
    }

    /// Standard chain: explicit values, `<config>/pipeline-resilience/<id>.txt`,
    /// `<config>/pipeline-resilience/resources.txt`, then `<ID>_RESOURCES`
    pub fn standard(dependency: DependencyId, explicit: Vec<String>) -> Self {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(RESOURCE_DIR);
        let env_var = format!(
            "{}_RESOURCES",
            dependency.as_str().to_uppercase().replace(['-', '.'], "_")
        );

        Self::new(dependency.clone())
            .source(ResourceSource::Explicit(explicit))
            .source(ResourceSource::Dedicated(
                dir.join(format!("{}.txt", dependency.as_str())),
            ))
            .source(ResourceSource::Shared(dir.join(SHARED_FILE)))
            .source(ResourceSource::Environment(env_var))
    }

    /// Append a source below those already added
    pub fn source(mut self, source: ResourceSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sources(&self) -> &[ResourceSource] {
        &self.sources
    }

    /// Ranked entries across all sources, duplicates keeping their first rank
    pub async fn load_entries(&self) -> Result<Vec<ResourceEntry>> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for source in &self.sources {
            let label = source.label();
            let values = source.values(&self.dependency).await?;
            debug!(
                dependency = %self.dependency,
                source = %label,
                count = values.len(),
                "Read resource source"
            );
            for value in values {
                if seen.insert(value.clone()) {
                    let rank = entries.len() as u32;
                    entries.push(ResourceEntry::new(rank, label.clone(), value));
                }
            }
        }

        Ok(entries)
    }

    /// Load every source into a pool; an empty result is a configuration error
    pub async fn load(&self) -> Result<ResourcePool> {
        let entries = self.load_entries().await?;
        if entries.is_empty() {
            return Err(ResilienceError::config(format!(
                "no resource available for {}: checked {}",
                self.dependency,
                self.sources
                    .iter()
                    .map(ResourceSource::label)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        info!(
            dependency = %self.dependency,
            entries = entries.len(),
            "Loaded resource pool"
        );
        Ok(ResourcePool::new(self.dependency.clone(), entries).with_policy(self.policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_scoping() {
        let content = "# shared keys\nmodel-api: key-a\n\nvideo-platform: key-b\nkey-c\nhttps://mirror.example/x\n";
        let values = parse_shared(content, &DependencyId::new("model-api"));
        assert_eq!(values, vec!["key-a", "key-c", "https://mirror.example/x"]);
    }

    #[test]
    fn test_list_parsing() {
        assert_eq!(parse_list("a, b\nc,,# skipped\n"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }

    #[tokio::test]
    async fn test_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ResourceLoader::new(DependencyId::new("model-api"))
            .source(ResourceSource::Dedicated(dir.path().join("absent.txt")))
            .source(ResourceSource::Explicit(vec!["key-1".to_string()]));

        let entries = loader.load_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source_label, "explicit");
    }
}
