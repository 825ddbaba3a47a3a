use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ltn_project_core::{
    next_available_name, AppFocus, LegacyBody, ProjectId, StoredDocument, SuffixStyle,
    LATEST_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::KeyValueBackend;
use crate::error::StoreError;
use crate::projects::ProjectStorage;
use crate::StoreConfig;

/// Study-area ids in legacy `cnt` keys carry this catalog prefix.
const LEGACY_STUDY_AREA_PREFIX: &str = "LAD_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: u32,
    pub target_version: u32,
    pub pending_versions: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedEntry {
    pub key: String,
    pub reason: String,
}

/// What one `ensure_migrated` call did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub starting_version: u32,
    pub final_version: u32,
    pub applied_versions: Vec<u32>,
    pub migrated_legacy_projects: usize,
    /// Legacy keys whose document an interrupted earlier run already wrote;
    /// only the key was removed.
    pub resumed_legacy_projects: usize,
    pub stamped_projects: usize,
    pub already_current_projects: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl MigrationReport {
    fn starting_at(version: u32) -> Self {
        Self { starting_version: version, final_version: version, ..Self::default() }
    }

    fn skip(&mut self, key: &str, reason: String) {
        warn!(key, reason = %reason, "skipping entry during migration");
        self.skipped.push(SkippedEntry { key: key.to_string(), reason });
    }

    #[must_use]
    pub fn migration_performed(&self) -> bool {
        !self.applied_versions.is_empty()
    }
}

/// What the id-based collection already holds when the legacy move starts.
#[derive(Debug, Default)]
struct CollectionIndex {
    names: BTreeMap<AppFocus, BTreeSet<String>>,
    moved_legacy_keys: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LegacyKey {
    app_focus: AppFocus,
    study_area_name: Option<String>,
    project_name: String,
}

/// Entry point to the store. Owns the schema-version marker and hands out
/// per-focus [`ProjectStorage`] handles once the medium is migrated.
#[derive(Debug)]
pub struct Database<B> {
    backend: Arc<B>,
    config: StoreConfig,
}

impl<B: KeyValueBackend> Database<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, StoreConfig::default())
    }

    #[must_use]
    pub fn with_config(backend: B, config: StoreConfig) -> Self {
        Self { backend: Arc::new(backend), config }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Latest migration fully applied to the medium. A missing or unparsable
    /// marker reads as version 0.
    ///
    /// # Errors
    /// Returns an error when the marker cannot be read.
    pub fn stored_schema_version(&self) -> Result<u32, StoreError> {
        let raw = self.backend.get(&self.config.schema_version_key())?;
        Ok(raw.and_then(|value| value.trim().parse::<u32>().ok()).unwrap_or(0))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when the marker cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        let current_version = self.stored_schema_version()?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect()
        } else {
            Vec::new()
        };
        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply every pending migration step in order, advancing the marker after
    /// each one. Safe to call repeatedly and to re-run after an interrupted
    /// attempt.
    ///
    /// # Errors
    /// Returns [`StoreError::UnsupportedSchemaVersion`] when the medium was
    /// written by a newer release, or the first backend failure. The marker is
    /// not advanced past a step that failed.
    pub fn ensure_migrated(&self) -> Result<MigrationReport, StoreError> {
        let stored = self.stored_schema_version()?;
        let mut report = MigrationReport::starting_at(stored);

        if stored == LATEST_SCHEMA_VERSION {
            debug!(version = stored, "schema is already up to date");
            return Ok(report);
        }
        if stored > LATEST_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: stored,
                latest: LATEST_SCHEMA_VERSION,
            });
        }

        if self.backend.is_empty()? {
            info!("backing store is empty; nothing to migrate");
            self.record_schema_version(LATEST_SCHEMA_VERSION)?;
            report.final_version = LATEST_SCHEMA_VERSION;
            return Ok(report);
        }

        info!(from = stored, to = LATEST_SCHEMA_VERSION, "migrating project storage");

        if stored < 1 {
            self.apply_migration_1(&mut report)?;
            self.complete_step(1, &mut report)?;
        }

        if stored < 2 {
            self.apply_migration_2(&mut report)?;
            self.complete_step(2, &mut report)?;
        }

        Ok(report)
    }

    /// Migrate, then return the CRUD surface for one focus.
    ///
    /// # Errors
    /// Returns any error from [`Database::ensure_migrated`].
    pub fn project_storage(&self, app_focus: AppFocus) -> Result<ProjectStorage<B>, StoreError> {
        self.ensure_migrated()?;
        Ok(ProjectStorage::new(Arc::clone(&self.backend), self.config.clone(), app_focus))
    }

    fn record_schema_version(&self, version: u32) -> Result<(), StoreError> {
        self.backend.set(&self.config.schema_version_key(), &version.to_string())?;
        Ok(())
    }

    fn complete_step(&self, version: u32, report: &mut MigrationReport) -> Result<(), StoreError> {
        self.record_schema_version(version)?;
        report.applied_versions.push(version);
        report.final_version = version;
        info!(version, "schema migration step complete");
        Ok(())
    }

    /// Move projects out of keys that encoded their identity into
    /// `<root>/projects/<id>` documents that carry the metadata themselves.
    fn apply_migration_1(&self, report: &mut MigrationReport) -> Result<(), StoreError> {
        let legacy_keys = self.backend.keys_with_prefix(&self.config.legacy_prefix())?;
        if legacy_keys.is_empty() {
            debug!("no legacy project keys found");
            return Ok(());
        }

        let CollectionIndex { names: mut taken, moved_legacy_keys } = self.collection_index()?;

        for key in legacy_keys {
            // An interrupted run wrote the document but did not get to
            // remove its source key.
            if moved_legacy_keys.contains(&key) {
                self.backend.remove(&key)?;
                report.resumed_legacy_projects += 1;
                info!(key = %key, "legacy project already migrated; removed source key");
                continue;
            }

            let legacy = match self.parse_legacy_key(&key) {
                Ok(legacy) => legacy,
                Err(reason) => {
                    report.skip(&key, reason);
                    continue;
                }
            };
            let Some(raw) = self.backend.get(&key)? else {
                continue;
            };
            let body = match LegacyBody::decode(&raw) {
                Ok(body) => body,
                Err(err) => {
                    report.skip(&key, err.to_string());
                    continue;
                }
            };

            let study_area_name = match legacy.app_focus {
                AppFocus::Cnt => legacy.study_area_name,
                AppFocus::Global | AppFocus::England => body.study_area_name.clone(),
            };
            let names = taken.entry(legacy.app_focus).or_default();
            let project_name =
                next_available_name(&legacy.project_name, SuffixStyle::Parenthesized, |candidate| {
                    names.contains(candidate)
                });
            if project_name != legacy.project_name {
                warn!(
                    key = %key,
                    original = %legacy.project_name,
                    renamed = %project_name,
                    "legacy project name collides; renaming"
                );
            }

            let document = body.into_v1(&key, project_name.clone(), study_area_name, legacy.app_focus);
            let id = ProjectId::new();
            let new_key = self.config.project_key(&id);

            // Write before delete so an interruption can only leave a copy
            // behind, never lose the project.
            self.backend.set(&new_key, &document.to_json()?)?;
            self.backend.remove(&key)?;

            names.insert(project_name);
            report.migrated_legacy_projects += 1;
            info!(from = %key, to = %new_key, "migrated legacy project");
        }

        Ok(())
    }

    /// Stamp `db_schema_version` into every document that predates it.
    fn apply_migration_2(&self, report: &mut MigrationReport) -> Result<(), StoreError> {
        for key in self.backend.keys_with_prefix(&self.config.collection_prefix())? {
            let Some(raw) = self.backend.get(&key)? else {
                continue;
            };
            let stored = match StoredDocument::decode(&raw) {
                Ok(stored) => stored,
                Err(err) => {
                    report.skip(&key, err.to_string());
                    continue;
                }
            };

            let document = match stored {
                StoredDocument::Current(_) => {
                    report.already_current_projects += 1;
                    continue;
                }
                StoredDocument::V1(document) => document.into_current(),
            };

            self.backend.set(&key, &document.to_json()?)?;
            report.stamped_projects += 1;
            debug!(key = %key, "stamped schema version");
        }

        Ok(())
    }

    fn parse_legacy_key(&self, key: &str) -> Result<LegacyKey, String> {
        if let Some(rest) = key.strip_prefix(&self.config.legacy_cnt_prefix()) {
            let Some((study_area_id, project_name)) = rest.split_once('/') else {
                return Err("legacy cnt key has no study area segment".to_string());
            };
            let study_area_name =
                study_area_id.strip_prefix(LEGACY_STUDY_AREA_PREFIX).unwrap_or(study_area_id);
            if study_area_name.is_empty() || project_name.is_empty() {
                return Err("legacy cnt key has an empty study area or project name".to_string());
            }
            return Ok(LegacyKey {
                app_focus: AppFocus::Cnt,
                study_area_name: Some(study_area_name.to_string()),
                project_name: project_name.to_string(),
            });
        }

        // Imported files sometimes doubled the prefix, e.g. `ltn_ltn_Name`.
        let legacy_prefix = self.config.legacy_prefix();
        let mut project_name = key;
        while let Some(rest) = project_name.strip_prefix(&legacy_prefix) {
            project_name = rest;
        }
        if project_name.is_empty() {
            return Err("legacy key has an empty project name".to_string());
        }
        Ok(LegacyKey {
            app_focus: AppFocus::Global,
            study_area_name: None,
            project_name: project_name.to_string(),
        })
    }

    fn collection_index(&self) -> Result<CollectionIndex, StoreError> {
        let mut index = CollectionIndex::default();
        for key in self.backend.keys_with_prefix(&self.config.collection_prefix())? {
            let Some(raw) = self.backend.get(&key)? else {
                continue;
            };
            match StoredDocument::decode(&raw) {
                Ok(stored) => {
                    if let Some(source) = stored.legacy_key() {
                        index.moved_legacy_keys.insert(source.to_string());
                    }
                    index
                        .names
                        .entry(stored.app_focus())
                        .or_default()
                        .insert(stored.project_name().to_string());
                }
                Err(err) => debug!(key = %key, error = %err, "ignoring undecodable document"),
            }
        }
        Ok(index)
    }
}
