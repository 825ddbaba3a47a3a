use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

/// Schema version written by this release. Bump it together with a new
/// migration step in the store.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// First schema version whose documents carry a `db_schema_version` stamp.
pub const STAMPED_SCHEMA_VERSION: u32 = 2;

pub const FEATURE_COLLECTION: &str = "FeatureCollection";

const METADATA_FIELDS: [&str; 6] =
    ["type", "project_name", "study_area_name", "app_focus", "db_schema_version", "legacy_key"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProjectError {
    #[error("invalid project identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Opaque project identity. New ids are ULIDs; any non-empty, slash-free
/// string is accepted when parsing so ids written by older releases stay
/// addressable.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Validate a caller-supplied identifier.
    ///
    /// # Errors
    /// Returns [`ProjectError::InvalidIdentifier`] when the id is blank or
    /// would not be safe to embed in a backing-store key.
    pub fn parse(raw: &str) -> Result<Self, ProjectError> {
        if raw.trim().is_empty() || raw.contains('/') {
            return Err(ProjectError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = ProjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = ProjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(value: ProjectId) -> Self {
        value.0
    }
}

/// Partition discriminator selecting which catalog of base-map assets a
/// project targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppFocus {
    Global,
    Cnt,
    England,
}

impl AppFocus {
    pub const ALL: [Self; 3] = [Self::Global, Self::Cnt, Self::England];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Cnt => "cnt",
            Self::England => "england",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(Self::Global),
            "cnt" => Some(Self::Cnt),
            "england" => Some(Self::England),
            _ => None,
        }
    }

    /// Regional foci pick their boundary from a study-area catalog, so their
    /// projects always name one.
    #[must_use]
    pub fn requires_study_area(self) -> bool {
        matches!(self, Self::Cnt | Self::England)
    }
}

impl Display for AppFocus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn feature_collection() -> String {
    FEATURE_COLLECTION.to_string()
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|name| !name.is_empty()))
}

fn normalize_study_area(value: Option<String>) -> Option<String> {
    value.filter(|name| !name.is_empty())
}

fn strip_metadata(extra: &mut Map<String, Value>) {
    for field in METADATA_FIELDS {
        extra.remove(field);
    }
}

fn decode_error(err: &serde_json::Error) -> ProjectError {
    ProjectError::Decode(err.to_string())
}

/// One persisted project in the current layout. Only the metadata fields are
/// interpreted; `features` and any unknown top-level keys pass through as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectDocument {
    #[serde(rename = "type", default = "feature_collection")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<Value>,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub study_area_name: Option<String>,
    pub app_focus: AppFocus,
    pub db_schema_version: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectDocument {
    #[must_use]
    pub fn empty(project_name: &str, study_area_name: Option<&str>, app_focus: AppFocus) -> Self {
        Self {
            kind: feature_collection(),
            features: Vec::new(),
            project_name: project_name.to_string(),
            study_area_name: normalize_study_area(study_area_name.map(str::to_string)),
            app_focus,
            db_schema_version: LATEST_SCHEMA_VERSION,
            extra: Map::new(),
        }
    }

    /// Decode a stored document, requiring every metadata field.
    ///
    /// # Errors
    /// Returns [`ProjectError::Decode`] when the text is not a well-formed
    /// current-layout document.
    pub fn from_json(raw: &str) -> Result<Self, ProjectError> {
        let document: Self = serde_json::from_str(raw).map_err(|err| decode_error(&err))?;
        document.validate()?;
        Ok(document)
    }

    fn from_value(value: Value) -> Result<Self, ProjectError> {
        let document: Self = serde_json::from_value(value).map_err(|err| decode_error(&err))?;
        document.validate()?;
        Ok(document)
    }

    /// Encode for the backing store.
    ///
    /// # Errors
    /// Returns [`ProjectError::Decode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ProjectError> {
        serde_json::to_string(self).map_err(|err| decode_error(&err))
    }

    fn validate(&self) -> Result<(), ProjectError> {
        if self.kind != FEATURE_COLLECTION {
            return Err(ProjectError::Decode(format!(
                "expected type {FEATURE_COLLECTION}, found {}",
                self.kind
            )));
        }
        if self.db_schema_version > LATEST_SCHEMA_VERSION {
            return Err(ProjectError::Decode(format!(
                "db_schema_version {} is newer than supported version {LATEST_SCHEMA_VERSION}",
                self.db_schema_version
            )));
        }
        Ok(())
    }

    /// Collapse null, missing and empty study areas to `None`.
    pub fn normalize(&mut self) {
        self.study_area_name = normalize_study_area(self.study_area_name.take());
        strip_metadata(&mut self.extra);
    }

    /// Repair the fields owned by the store before a write.
    pub fn stamp(&mut self, app_focus: AppFocus) {
        self.normalize();
        self.kind = feature_collection();
        self.app_focus = app_focus;
        self.db_schema_version = LATEST_SCHEMA_VERSION;
    }

    #[must_use]
    pub fn study_area(&self) -> Option<&str> {
        self.study_area_name.as_deref()
    }

    /// Names of the neighbourhood boundaries drawn inside this project.
    #[must_use]
    pub fn neighbourhood_names(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter_map(|feature| {
                let properties = feature.get("properties")?;
                if properties.get("kind")?.as_str()? != "boundary" {
                    return None;
                }
                properties.get("name")?.as_str()
            })
            .collect()
    }
}

/// A version 1 document: metadata lives in the body but the
/// `db_schema_version` stamp may be missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectDocumentV1 {
    #[serde(rename = "type", default = "feature_collection")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<Value>,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub study_area_name: Option<String>,
    pub app_focus: AppFocus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_schema_version: Option<u32>,
    /// Pre-migration key this document was moved from. Present only between
    /// the two migration steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectDocumentV1 {
    #[must_use]
    pub fn into_current(self) -> ProjectDocument {
        let mut document = ProjectDocument {
            kind: self.kind,
            features: self.features,
            project_name: self.project_name,
            study_area_name: self.study_area_name,
            app_focus: self.app_focus,
            db_schema_version: STAMPED_SCHEMA_VERSION,
            extra: self.extra,
        };
        document.normalize();
        document
    }

    /// # Errors
    /// Returns [`ProjectError::Decode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ProjectError> {
        serde_json::to_string(self).map_err(|err| decode_error(&err))
    }
}

/// Value body found under a pre-migration key. Identity, name and focus were
/// encoded in the key itself, so only the geometry and an optional study area
/// are read from the body.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LegacyBody {
    #[serde(rename = "type", default = "feature_collection")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<Value>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub study_area_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LegacyBody {
    /// # Errors
    /// Returns [`ProjectError::Decode`] when the body is not a JSON object
    /// with an array of features.
    pub fn decode(raw: &str) -> Result<Self, ProjectError> {
        serde_json::from_str(raw).map_err(|err| decode_error(&err))
    }

    #[must_use]
    pub fn into_v1(
        mut self,
        legacy_key: &str,
        project_name: String,
        study_area_name: Option<String>,
        app_focus: AppFocus,
    ) -> ProjectDocumentV1 {
        strip_metadata(&mut self.extra);
        ProjectDocumentV1 {
            kind: self.kind,
            features: self.features,
            project_name,
            study_area_name: normalize_study_area(study_area_name),
            app_focus,
            db_schema_version: None,
            legacy_key: Some(legacy_key.to_string()),
            extra: self.extra,
        }
    }
}

/// A document stored under the id-based collection, tagged by the layout it
/// was written with.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredDocument {
    V1(ProjectDocumentV1),
    Current(ProjectDocument),
}

impl StoredDocument {
    /// Decode a collection entry, picking the layout from its version stamp.
    ///
    /// # Errors
    /// Returns [`ProjectError::Decode`] when required fields are missing or
    /// malformed for the detected layout.
    pub fn decode(raw: &str) -> Result<Self, ProjectError> {
        let value: Value = serde_json::from_str(raw).map_err(|err| decode_error(&err))?;
        let version = match value.get("db_schema_version") {
            None | Some(Value::Null) => None,
            Some(stamp) => Some(stamp.as_u64().ok_or_else(|| {
                ProjectError::Decode("db_schema_version must be a non-negative integer".to_string())
            })?),
        };

        match version {
            Some(version) if version >= u64::from(STAMPED_SCHEMA_VERSION) => {
                ProjectDocument::from_value(value).map(Self::Current)
            }
            _ => serde_json::from_value(value).map(Self::V1).map_err(|err| decode_error(&err)),
        }
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        match self {
            Self::V1(document) => document.db_schema_version.unwrap_or(1),
            Self::Current(document) => document.db_schema_version,
        }
    }

    #[must_use]
    pub fn project_name(&self) -> &str {
        match self {
            Self::V1(document) => &document.project_name,
            Self::Current(document) => &document.project_name,
        }
    }

    #[must_use]
    pub fn app_focus(&self) -> AppFocus {
        match self {
            Self::V1(document) => document.app_focus,
            Self::Current(document) => document.app_focus,
        }
    }

    /// Source key of a document written by the legacy move but not yet
    /// stamped.
    #[must_use]
    pub fn legacy_key(&self) -> Option<&str> {
        match self {
            Self::V1(document) => document.legacy_key.as_deref(),
            Self::Current(_) => None,
        }
    }
}

/// How a collision counter is appended to a base name.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SuffixStyle {
    /// `Name (2)`, used for project names.
    Parenthesized,
    /// `Name #2`, used for neighbourhood names.
    Numbered,
}

impl SuffixStyle {
    #[must_use]
    pub fn apply(self, base: &str, counter: u64) -> String {
        match self {
            Self::Parenthesized => format!("{base} ({counter})"),
            Self::Numbered => format!("{base} #{counter}"),
        }
    }
}

/// Return `base` if it is free, otherwise the first suffixed candidate that
/// is. Counting always starts at 2; gaps left by deleted names are not reused
/// ahead of the first free slot.
pub fn next_available_name<F>(base: &str, style: SuffixStyle, mut is_taken: F) -> String
where
    F: FnMut(&str) -> bool,
{
    if !is_taken(base) {
        return base.to_string();
    }
    let mut counter: u64 = 2;
    loop {
        let candidate = style.apply(base, counter);
        if !is_taken(&candidate) {
            return candidate;
        }
        counter = counter.saturating_add(1);
    }
}

#[must_use]
pub fn neighbourhood_base_name(project_name: &str) -> String {
    format!("{project_name} LTN")
}

/// Listing order for display names: case-insensitive first, exact string as
/// the tie-breaker so the order is total.
#[must_use]
pub fn compare_display_names(left: &str, right: &str) -> Ordering {
    left.to_lowercase().cmp(&right.to_lowercase()).then_with(|| left.cmp(right))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn boundary(name: &str) -> Value {
        json!({
            "type": "Feature",
            "geometry": { "type": "Polygon", "coordinates": [] },
            "properties": { "kind": "boundary", "name": name }
        })
    }

    #[test]
    fn project_id_rejects_blank_and_slashed_values() {
        assert!(matches!(ProjectId::parse(""), Err(ProjectError::InvalidIdentifier(_))));
        assert!(matches!(ProjectId::parse("   "), Err(ProjectError::InvalidIdentifier(_))));
        assert!(matches!(ProjectId::parse("a/b"), Err(ProjectError::InvalidIdentifier(_))));
        assert_eq!(
            ProjectId::parse("ce-nest-pas-un-uuid").map(|id| id.to_string()),
            Ok("ce-nest-pas-un-uuid".to_string())
        );
    }

    #[test]
    fn generated_project_ids_are_distinct_and_parseable() {
        let first = ProjectId::new();
        let second = ProjectId::new();
        assert_ne!(first, second);
        assert_eq!(ProjectId::parse(first.as_str()), Ok(first));
    }

    #[test]
    fn app_focus_round_trips_through_text() {
        for focus in AppFocus::ALL {
            assert_eq!(AppFocus::parse(focus.as_str()), Some(focus));
        }
        assert_eq!(AppFocus::parse("mars"), None);
        assert!(AppFocus::Cnt.requires_study_area());
        assert!(!AppFocus::Global.requires_study_area());
    }

    #[test]
    fn document_decode_preserves_unknown_fields_and_normalizes_study_area() {
        let raw = json!({
            "type": "FeatureCollection",
            "features": [boundary("Elm LTN")],
            "project_name": "Elm Street",
            "study_area_name": "",
            "app_focus": "global",
            "db_schema_version": 2,
            "bbox": [1, 2, 3, 4]
        })
        .to_string();

        let document = match ProjectDocument::from_json(&raw) {
            Ok(document) => document,
            Err(err) => panic!("document should decode: {err}"),
        };
        assert_eq!(document.study_area_name, None);
        assert_eq!(document.extra.get("bbox"), Some(&json!([1, 2, 3, 4])));
        assert_eq!(document.neighbourhood_names(), vec!["Elm LTN"]);

        let encoded = match document.to_json() {
            Ok(encoded) => encoded,
            Err(err) => panic!("document should encode: {err}"),
        };
        let reparsed: Value = match serde_json::from_str(&encoded) {
            Ok(value) => value,
            Err(err) => panic!("encoded document should be JSON: {err}"),
        };
        assert_eq!(reparsed["bbox"], json!([1, 2, 3, 4]));
        assert!(reparsed.get("study_area_name").is_none());
    }

    #[test]
    fn document_decode_requires_metadata() {
        let missing_version = json!({
            "type": "FeatureCollection",
            "features": [],
            "project_name": "Elm Street",
            "app_focus": "cnt"
        })
        .to_string();
        assert!(matches!(ProjectDocument::from_json(&missing_version), Err(ProjectError::Decode(_))));

        let wrong_type = json!({
            "type": "Feature",
            "features": [],
            "project_name": "Elm Street",
            "app_focus": "cnt",
            "db_schema_version": 2
        })
        .to_string();
        assert!(matches!(ProjectDocument::from_json(&wrong_type), Err(ProjectError::Decode(_))));
    }

    #[test]
    fn stamp_repairs_focus_version_and_metadata_collisions() {
        let mut document = ProjectDocument::empty("Oak", Some(""), AppFocus::Global);
        document.db_schema_version = 1;
        document.extra.insert("project_name".to_string(), json!("shadow"));
        document.stamp(AppFocus::Cnt);

        assert_eq!(document.app_focus, AppFocus::Cnt);
        assert_eq!(document.db_schema_version, LATEST_SCHEMA_VERSION);
        assert_eq!(document.study_area_name, None);
        assert!(document.extra.is_empty());
    }

    #[test]
    fn neighbourhood_names_ignore_non_boundary_features() {
        let mut document = ProjectDocument::empty("Oak", None, AppFocus::Global);
        document.features.push(boundary("Oak LTN"));
        document.features.push(json!({ "type": "Feature", "properties": { "kind": "waypoint", "name": "x" } }));
        document.features.push(json!({ "type": "Feature" }));
        assert_eq!(document.neighbourhood_names(), vec!["Oak LTN"]);
    }

    #[test]
    fn legacy_body_upgrades_to_v1_then_current() {
        let raw = json!({
            "type": "FeatureCollection",
            "features": [boundary("A")],
            "study_area_name": "London",
            "project_name": "ignored",
            "extra_state": true
        })
        .to_string();
        let legacy = match LegacyBody::decode(&raw) {
            Ok(legacy) => legacy,
            Err(err) => panic!("legacy body should decode: {err}"),
        };
        assert_eq!(legacy.study_area_name.as_deref(), Some("London"));

        let v1 = legacy.into_v1(
            "ltn_TestProject",
            "TestProject".to_string(),
            Some("London".to_string()),
            AppFocus::Global,
        );
        assert_eq!(v1.project_name, "TestProject");
        assert!(!v1.extra.contains_key("project_name"));
        assert_eq!(v1.db_schema_version, None);
        assert_eq!(v1.legacy_key.as_deref(), Some("ltn_TestProject"));

        let encoded = match v1.to_json() {
            Ok(encoded) => encoded,
            Err(err) => panic!("v1 document should encode: {err}"),
        };
        match StoredDocument::decode(&encoded) {
            Ok(stored) => assert_eq!(stored.legacy_key(), Some("ltn_TestProject")),
            Err(err) => panic!("v1 document should decode: {err}"),
        }

        let current = v1.into_current();
        assert_eq!(current.db_schema_version, STAMPED_SCHEMA_VERSION);
        assert_eq!(current.extra.get("extra_state"), Some(&json!(true)));
        assert!(!current.extra.contains_key("legacy_key"));
    }

    #[test]
    fn legacy_body_rejects_non_objects() {
        assert!(LegacyBody::decode("not json").is_err());
        assert!(LegacyBody::decode("[1, 2]").is_err());
        assert!(LegacyBody::decode(r#"{"features": 7}"#).is_err());
    }

    #[test]
    fn stored_document_decode_picks_layout_from_stamp() {
        let unstamped = json!({
            "type": "FeatureCollection",
            "features": [],
            "project_name": "Old",
            "app_focus": "cnt",
            "study_area_name": "Edinburgh"
        })
        .to_string();
        match StoredDocument::decode(&unstamped) {
            Ok(StoredDocument::V1(document)) => assert_eq!(document.project_name, "Old"),
            other => panic!("expected v1 document, got {other:?}"),
        }

        let stamped = json!({
            "type": "FeatureCollection",
            "features": [],
            "project_name": "New",
            "app_focus": "global",
            "db_schema_version": 2
        })
        .to_string();
        match StoredDocument::decode(&stamped) {
            Ok(stored @ StoredDocument::Current(_)) => {
                assert_eq!(stored.schema_version(), 2);
                assert_eq!(stored.project_name(), "New");
                assert_eq!(stored.app_focus(), AppFocus::Global);
            }
            other => panic!("expected current document, got {other:?}"),
        }

        let negative = json!({ "project_name": "x", "app_focus": "global", "db_schema_version": -1 })
            .to_string();
        assert!(StoredDocument::decode(&negative).is_err());
    }

    #[test]
    fn next_available_name_appends_counters() {
        let taken = ["X", "X (2)"];
        assert_eq!(
            next_available_name("X", SuffixStyle::Parenthesized, |name| taken.contains(&name)),
            "X (3)"
        );
        assert_eq!(next_available_name("Y", SuffixStyle::Parenthesized, |_| false), "Y");

        let neighbourhoods = ["Oak LTN"];
        assert_eq!(
            next_available_name(&neighbourhood_base_name("Oak"), SuffixStyle::Numbered, |name| {
                neighbourhoods.contains(&name)
            }),
            "Oak LTN #2"
        );
    }

    #[test]
    fn next_available_name_does_not_fill_gaps_past_the_first_free_slot() {
        let taken = ["X", "X (3)"];
        assert_eq!(
            next_available_name("X", SuffixStyle::Parenthesized, |name| taken.contains(&name)),
            "X (2)"
        );
    }

    #[test]
    fn display_names_sort_case_insensitively() {
        let mut names = vec!["beta", "Alpha", "alpha", "Gamma"];
        names.sort_by(|left, right| compare_display_names(left, right));
        assert_eq!(names, vec!["Alpha", "alpha", "beta", "Gamma"]);
    }

    proptest! {
        #[test]
        fn next_available_name_is_never_taken(
            base in "[A-Za-z ]{1,12}",
            taken_counters in proptest::collection::btree_set(2u64..20, 0..10),
            base_taken in any::<bool>(),
        ) {
            let mut taken: std::collections::BTreeSet<String> = taken_counters
                .iter()
                .map(|counter| SuffixStyle::Parenthesized.apply(&base, *counter))
                .collect();
            if base_taken {
                taken.insert(base.clone());
            }

            let chosen = next_available_name(&base, SuffixStyle::Parenthesized, |name| taken.contains(name));
            prop_assert!(!taken.contains(&chosen));
            if !base_taken {
                prop_assert_eq!(chosen, base);
            }
        }
    }
}
