//! Versioned project document store over a plain key-value medium.
//!
//! [`Database`] owns the schema-version marker and migrates older layouts
//! forward; [`ProjectStorage`] is the per-focus CRUD surface and can only be
//! obtained from [`Database::project_storage`], after migrations have run.

mod backend;
mod database;
mod error;
mod projects;

pub use backend::{AccessStats, BackendError, KeyValueBackend, MemoryBackend};
pub use database::{Database, MigrationReport, SchemaStatus, SkippedEntry};
pub use error::StoreError;
pub use projects::{ProjectStorage, ProjectSummary, StoredProject, StudyAreaGroup};

pub use ltn_project_core::{
    AppFocus, ProjectDocument, ProjectError, ProjectId, LATEST_SCHEMA_VERSION,
};

pub const DEFAULT_ROOT: &str = "ltn";

/// Where the store lives inside the backing medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    root: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { root: DEFAULT_ROOT.to_string() }
    }
}

impl StoreConfig {
    /// # Errors
    /// Returns [`StoreError::Config`] when `root` is blank or contains a
    /// separator that would make keys ambiguous.
    pub fn new(root: &str) -> Result<Self, StoreError> {
        if root.trim().is_empty() || root.contains('/') || root.contains('_') {
            return Err(StoreError::Config(format!(
                "root {root:?} must be non-empty and contain neither '/' nor '_'"
            )));
        }
        Ok(Self { root: root.to_string() })
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    #[must_use]
    pub fn schema_version_key(&self) -> String {
        format!("{}/_meta/schema-version", self.root)
    }

    #[must_use]
    pub fn collection_prefix(&self) -> String {
        format!("{}/projects/", self.root)
    }

    #[must_use]
    pub fn project_key(&self, id: &ProjectId) -> String {
        format!("{}{id}", self.collection_prefix())
    }

    /// Prefix shared by every pre-migration key, e.g. `ltn_`.
    #[must_use]
    pub fn legacy_prefix(&self) -> String {
        format!("{}_", self.root)
    }

    /// Prefix of pre-migration keys for the `cnt` focus, e.g. `ltn_cnt/`.
    #[must_use]
    pub fn legacy_cnt_prefix(&self) -> String {
        format!("{}_{}/", self.root, AppFocus::Cnt.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_documented_keys() -> Result<(), StoreError> {
        let config = StoreConfig::default();
        let id = ProjectId::parse("abc")?;
        assert_eq!(config.schema_version_key(), "ltn/_meta/schema-version");
        assert_eq!(config.project_key(&id), "ltn/projects/abc");
        assert_eq!(config.legacy_prefix(), "ltn_");
        assert_eq!(config.legacy_cnt_prefix(), "ltn_cnt/");
        Ok(())
    }

    #[test]
    fn config_rejects_ambiguous_roots() -> Result<(), StoreError> {
        assert!(StoreConfig::new("").is_err());
        assert!(StoreConfig::new("a/b").is_err());
        assert!(StoreConfig::new("a_b").is_err());

        let config = StoreConfig::new("plans")?;
        assert_eq!(config.project_key(&ProjectId::parse("x")?), "plans/projects/x");
        Ok(())
    }
}
