use std::collections::BTreeMap;
use std::sync::Arc;

use ltn_project_core::{
    compare_display_names, neighbourhood_base_name, next_available_name, AppFocus,
    ProjectDocument, ProjectId, SuffixStyle,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::KeyValueBackend;
use crate::error::StoreError;
use crate::StoreConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProject {
    pub id: ProjectId,
    pub document: ProjectDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub project_name: String,
}

/// Projects sharing one study area. `study_area_name` is `None` for the
/// custom-area group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudyAreaGroup {
    pub study_area_name: Option<String>,
    pub projects: Vec<ProjectSummary>,
}

/// CRUD over the projects of one [`AppFocus`].
///
/// Nothing is cached: every query re-reads the backing store, so writes made
/// through another handle on the same medium are visible immediately. Name
/// uniqueness is checked before each write but the check and the write are
/// separate operations, so two writers racing on the same name can both win.
#[derive(Debug)]
pub struct ProjectStorage<B> {
    backend: Arc<B>,
    config: StoreConfig,
    app_focus: AppFocus,
}

impl<B> Clone for ProjectStorage<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
            app_focus: self.app_focus,
        }
    }
}

impl<B: KeyValueBackend> ProjectStorage<B> {
    pub(crate) fn new(backend: Arc<B>, config: StoreConfig, app_focus: AppFocus) -> Self {
        Self { backend, config, app_focus }
    }

    #[must_use]
    pub fn app_focus(&self) -> AppFocus {
        self.app_focus
    }

    #[must_use]
    pub fn project_key(&self, id: &ProjectId) -> String {
        self.config.project_key(id)
    }

    /// Key for a caller-supplied raw id.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidIdentifier`] for a blank or slashed id;
    /// the backing store is not touched.
    pub fn project_key_str(&self, raw_id: &str) -> Result<String, StoreError> {
        let id = ProjectId::parse(raw_id)?;
        Ok(self.project_key(&id))
    }

    /// Documents of other foci are invisible through this handle.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when no document of this focus is
    /// stored under `id`, or [`StoreError::CorruptDocument`] when it does not
    /// decode.
    pub fn project(&self, id: &ProjectId) -> Result<ProjectDocument, StoreError> {
        match self.stored_document(id)? {
            Some(document) if document.app_focus == self.app_focus => {
                if document.app_focus.requires_study_area() && document.study_area_name.is_none() {
                    warn!(id = %id, focus = %document.app_focus, "project has no study area");
                }
                Ok(document)
            }
            Some(document) => {
                debug!(
                    id = %id,
                    stored = %document.app_focus,
                    expected = %self.app_focus,
                    "project belongs to another focus"
                );
                Err(StoreError::NotFound(id.clone()))
            }
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    /// Name of the project, or `None` when it does not exist.
    ///
    /// # Errors
    /// Returns an error when the document exists but cannot be read.
    pub fn project_name(&self, id: &ProjectId) -> Result<Option<String>, StoreError> {
        match self.project(id) {
            Ok(document) => Ok(Some(document.project_name)),
            Err(StoreError::NotFound(_)) => {
                warn!(id = %id, "project name requested for a missing project");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Every project of this focus, in key order.
    ///
    /// # Errors
    /// Returns [`StoreError::CorruptDocument`] when any stored document fails
    /// to decode; a migrated store never holds one.
    pub fn projects(&self) -> Result<Vec<StoredProject>, StoreError> {
        let prefix = self.config.collection_prefix();
        let mut projects = Vec::new();
        for key in self.backend.keys_with_prefix(&prefix)? {
            let Some(raw) = self.backend.get(&key)? else {
                continue;
            };
            let document = decode_document(&key, &raw)?;
            if document.app_focus != self.app_focus {
                continue;
            }
            let id = ProjectId::parse(&key[prefix.len()..]).map_err(|err| {
                StoreError::CorruptDocument { key: key.clone(), reason: err.to_string() }
            })?;
            projects.push(StoredProject { id, document });
        }
        Ok(projects)
    }

    /// Projects grouped by study area. Groups and members are sorted by name;
    /// the custom-area group comes last.
    ///
    /// # Errors
    /// Returns any error from [`ProjectStorage::projects`].
    pub fn study_area_projects(&self) -> Result<Vec<StudyAreaGroup>, StoreError> {
        let mut grouped: BTreeMap<Option<String>, Vec<ProjectSummary>> = BTreeMap::new();
        for project in self.projects()? {
            grouped.entry(project.document.study_area_name).or_default().push(ProjectSummary {
                id: project.id,
                project_name: project.document.project_name,
            });
        }

        let mut groups: Vec<StudyAreaGroup> = grouped
            .into_iter()
            .map(|(study_area_name, mut projects)| {
                projects.sort_by(|left, right| {
                    compare_display_names(&left.project_name, &right.project_name)
                        .then_with(|| left.id.cmp(&right.id))
                });
                StudyAreaGroup { study_area_name, projects }
            })
            .collect();
        groups.sort_by(|left, right| match (&left.study_area_name, &right.study_area_name) {
            (Some(left), Some(right)) => compare_display_names(left, right),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Ok(groups)
    }

    /// # Errors
    /// Returns any error from [`ProjectStorage::projects`].
    pub fn project_name_already_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.projects()?.iter().any(|project| project.document.project_name == name))
    }

    /// `base`, or `base (2)`, `base (3)`… whichever is free first.
    ///
    /// # Errors
    /// Returns any error from [`ProjectStorage::projects`].
    pub fn next_available_project_name(&self, base: &str) -> Result<String, StoreError> {
        let names = self.project_names()?;
        Ok(next_available_name(base, SuffixStyle::Parenthesized, |candidate| {
            names.iter().any(|name| name == candidate)
        }))
    }

    /// # Errors
    /// Returns [`StoreError::NameTaken`] or [`StoreError::MissingStudyArea`]
    /// without writing anything, or a backend failure.
    pub fn create_empty_project(
        &self,
        project_name: &str,
        study_area_name: Option<&str>,
    ) -> Result<ProjectId, StoreError> {
        self.create_project(ProjectDocument::empty(project_name, study_area_name, self.app_focus))
    }

    /// Store `document` under a fresh id, stamped with this focus and the
    /// latest schema version.
    ///
    /// # Errors
    /// Returns [`StoreError::NameTaken`], [`StoreError::MissingStudyArea`] or
    /// [`StoreError::Validation`] without writing anything, or a backend
    /// failure.
    pub fn create_project(&self, mut document: ProjectDocument) -> Result<ProjectId, StoreError> {
        document.stamp(self.app_focus);
        self.validate_new(&document)?;
        self.ensure_name_free(&document.project_name)?;

        let id = ProjectId::new();
        self.write(&id, &document)?;
        info!(id = %id, focus = %self.app_focus, name = %document.project_name, "created project");
        Ok(id)
    }

    /// Overwrite the document stored under `id`.
    ///
    /// # Errors
    /// Returns [`StoreError::FocusMismatch`] when `id` holds a project of
    /// another focus, or a backend failure.
    pub fn save_project(&self, id: &ProjectId, mut document: ProjectDocument) -> Result<(), StoreError> {
        if !self.ensure_owned(id)? {
            warn!(id = %id, "saving a project that has no stored document");
        }
        document.stamp(self.app_focus);
        self.write(id, &document)
    }

    /// Deleting an absent project is not an error.
    ///
    /// # Errors
    /// Returns [`StoreError::FocusMismatch`] when `id` holds a project of
    /// another focus, or a backend failure.
    pub fn remove_project(&self, id: &ProjectId) -> Result<(), StoreError> {
        self.ensure_owned(id)?;
        self.backend.remove(&self.project_key(id))?;
        debug!(id = %id, "removed project");
        Ok(())
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] for an unknown id or
    /// [`StoreError::NameTaken`] when another project already uses the name.
    pub fn rename_project(&self, id: &ProjectId, new_name: &str) -> Result<(), StoreError> {
        let mut document = self.project(id)?;
        if document.project_name == new_name {
            debug!(id = %id, "rename to the current name is a no-op");
            return Ok(());
        }
        validate_name(new_name)?;
        self.ensure_name_free(new_name)?;

        document.project_name = new_name.to_string();
        document.stamp(self.app_focus);
        self.write(id, &document)?;
        info!(id = %id, name = %new_name, "renamed project");
        Ok(())
    }

    /// Duplicate a project under a new id and name.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for an unknown id or
    /// [`StoreError::NameTaken`] when the new name is in use.
    pub fn copy_project(&self, id: &ProjectId, new_name: &str) -> Result<ProjectId, StoreError> {
        let mut document = self.project(id)?;
        validate_name(new_name)?;
        self.ensure_name_free(new_name)?;

        document.project_name = new_name.to_string();
        document.stamp(self.app_focus);
        let copy = ProjectId::new();
        self.write(&copy, &document)?;
        info!(source = %id, copy = %copy, name = %new_name, "copied project");
        Ok(copy)
    }

    /// Suggested name for a new neighbourhood inside one project:
    /// `<project name> LTN`, then `#2`, `#3`… against that project's own
    /// boundaries.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for an unknown id.
    pub fn next_available_neighbourhood_name(&self, id: &ProjectId) -> Result<String, StoreError> {
        let document = self.project(id)?;
        let existing = document.neighbourhood_names();
        Ok(next_available_name(
            &neighbourhood_base_name(&document.project_name),
            SuffixStyle::Numbered,
            |candidate| existing.contains(&candidate),
        ))
    }

    fn project_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.projects()?.into_iter().map(|project| project.document.project_name).collect())
    }

    fn ensure_name_free(&self, name: &str) -> Result<(), StoreError> {
        if self.project_name_already_exists(name)? {
            return Err(StoreError::NameTaken(name.to_string()));
        }
        Ok(())
    }

    fn validate_new(&self, document: &ProjectDocument) -> Result<(), StoreError> {
        validate_name(&document.project_name)?;
        if self.app_focus.requires_study_area() && document.study_area_name.is_none() {
            return Err(StoreError::MissingStudyArea {
                focus: self.app_focus,
                project_name: document.project_name.clone(),
            });
        }
        Ok(())
    }

    /// Whether `id` holds a document. Fails when that document belongs to
    /// another focus.
    fn ensure_owned(&self, id: &ProjectId) -> Result<bool, StoreError> {
        match self.stored_document(id)? {
            Some(stored) if stored.app_focus != self.app_focus => Err(StoreError::FocusMismatch {
                id: id.clone(),
                stored: stored.app_focus,
                expected: self.app_focus,
            }),
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    fn stored_document(&self, id: &ProjectId) -> Result<Option<ProjectDocument>, StoreError> {
        let key = self.project_key(id);
        match self.backend.get(&key)? {
            Some(raw) => decode_document(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    fn write(&self, id: &ProjectId, document: &ProjectDocument) -> Result<(), StoreError> {
        self.backend.set(&self.project_key(id), &document.to_json()?)?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("project name must not be blank".to_string()));
    }
    Ok(())
}

fn decode_document(key: &str, raw: &str) -> Result<ProjectDocument, StoreError> {
    ProjectDocument::from_json(raw)
        .map_err(|err| StoreError::CorruptDocument { key: key.to_string(), reason: err.to_string() })
}
