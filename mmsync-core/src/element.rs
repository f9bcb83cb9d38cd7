//! Element data model
//!
//! An [`Element`] is the unit of cached state. Identity and concurrency
//! fields are typed; everything else the repository stores about an element
//! (name, documentation, values, owner ids, ...) lives in an ordered payload
//! map so that field-level comparisons stay generic across element types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Commit alias for the live head of a ref.
pub const LATEST: &str = "latest";

/// Ref used when a request does not name one.
pub const DEFAULT_REF: &str = "master";

/// Payload keys that only exist for display and are never sent back.
pub const DISPLAY_ONLY_FIELDS: &[&str] = &["_displayedElementIds", "_allowedElementIds"];

/// Payload key present on elements fetched with `extended = true`.
pub const QUALIFIED_ID_FIELD: &str = "_qualifiedId";

// ============================================================================
// ELEMENT TYPE
// ============================================================================

/// Structural variant tag carried in the element's `type` field.
///
/// Only the variants whose editable value lives in a dedicated field are
/// named; everything else is carried through as [`ElementType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ElementType {
    Property,
    Port,
    Slot,
    Constraint,
    Other(String),
}

impl ElementType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Property => "Property",
            Self::Port => "Port",
            Self::Slot => "Slot",
            Self::Constraint => "Constraint",
            Self::Other(name) => name,
        }
    }

    /// Payload fields holding the type-specific editable value.
    ///
    /// Property and Port keep a single `defaultValue`, a Slot keeps a list
    /// under `value`, a Constraint keeps its `specification`.
    pub fn value_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Property | Self::Port => &["defaultValue"],
            Self::Slot => &["value"],
            Self::Constraint => &["specification"],
            Self::Other(_) => &[],
        }
    }
}

impl From<String> for ElementType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Property" => Self::Property,
            "Port" => Self::Port,
            "Slot" => Self::Slot,
            "Constraint" => Self::Constraint,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for ElementType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ElementType> for String {
    fn from(value: ElementType) -> Self {
        match value {
            ElementType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl Default for ElementType {
    fn default() -> Self {
        Self::Other("Element".to_string())
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ELEMENT
// ============================================================================

/// A model element as served by the repository.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Element {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "_projectId", default)]
    pub project_id: String,
    #[serde(rename = "_refId", default)]
    pub ref_id: String,
    /// Concrete commit this version belongs to. Empty when unknown.
    #[serde(rename = "_commitId", default, skip_serializing_if = "String::is_empty")]
    pub commit_id: String,
    #[serde(rename = "type", default)]
    pub element_type: ElementType,
    #[serde(
        rename = "_modified",
        default,
        skip_serializing_if = "Option::is_none",
        with = "mms_timestamp"
    )]
    pub modified: Option<Timestamp>,
    #[serde(rename = "_modifier", default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,
    /// Opaque read token the server uses for optimistic concurrency.
    #[serde(rename = "_read", default, skip_serializing_if = "Option::is_none")]
    pub read: Option<String>,
    #[serde(rename = "_creator", default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(
        rename = "_created",
        default,
        skip_serializing_if = "Option::is_none",
        with = "mms_timestamp"
    )]
    pub created: Option<Timestamp>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Element {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        ref_id: impl Into<String>,
        element_type: impl Into<ElementType>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            ref_id: ref_id.into(),
            element_type: element_type.into(),
            ..Default::default()
        }
    }

    pub fn with_commit(mut self, commit_id: impl Into<String>) -> Self {
        self.commit_id = commit_id.into();
        self
    }

    pub fn with_read(mut self, read: impl Into<String>) -> Self {
        self.read = Some(read.into());
        self
    }

    pub fn with_modified(mut self, modified: Timestamp) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_modifier(mut self, modifier: impl Into<String>) -> Self {
        self.modifier = Some(modifier.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.with_field("name", name.into())
    }

    pub fn with_documentation(self, documentation: impl Into<String>) -> Self {
        self.with_field("documentation", documentation.into())
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    pub fn documentation(&self) -> Option<&str> {
        self.fields.get("documentation").and_then(Value::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.set_field("name", name.into());
    }

    /// True when id, project and ref are all present.
    pub fn has_identity(&self) -> bool {
        !self.id.is_empty() && !self.project_id.is_empty() && !self.ref_id.is_empty()
    }

    /// True when the element carries the extended (qualified) metadata.
    pub fn is_extended(&self) -> bool {
        self.fields.contains_key(QUALIFIED_ID_FIELD)
    }

    /// Request addressing this element's live version on its own ref.
    pub fn identity(&self) -> ElementRequest {
        ElementRequest::new(self.project_id.clone(), self.id.clone()).on_ref(self.ref_id.clone())
    }

    /// Request addressing this exact version.
    pub fn version_request(&self) -> ElementRequest {
        let commit = if self.commit_id.is_empty() {
            LATEST.to_string()
        } else {
            self.commit_id.clone()
        };
        self.identity().at_commit(commit)
    }

    pub fn scope(&self) -> RefScope {
        RefScope::new(self.project_id.clone(), self.ref_id.clone())
    }

    /// Copy of this element carrying the server's concurrency tokens.
    pub fn rebased_onto(&self, server: &Element) -> Element {
        let mut rebased = self.clone();
        rebased.read = server.read.clone();
        rebased.modified = server.modified;
        rebased
    }

    /// Copy with the bookkeeping fields cleared, for content comparison.
    pub fn comparable(&self) -> Element {
        let mut copy = self.clone();
        copy.modified = None;
        copy.read = None;
        copy.creator = None;
        copy
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

/// A (project, ref) partition of the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefScope {
    pub project_id: String,
    pub ref_id: String,
}

impl RefScope {
    pub fn new(project_id: impl Into<String>, ref_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ref_id: ref_id.into(),
        }
    }
}

impl fmt::Display for RefScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.project_id, self.ref_id)
    }
}

/// Descriptor for a single element read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementRequest {
    pub project_id: String,
    pub ref_id: String,
    pub element_id: String,
    pub commit_id: String,
    /// Ask for qualified name/id metadata as well.
    pub extended: bool,
}

impl ElementRequest {
    /// Request for the latest version on the default ref.
    pub fn new(project_id: impl Into<String>, element_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ref_id: DEFAULT_REF.to_string(),
            element_id: element_id.into(),
            commit_id: LATEST.to_string(),
            extended: false,
        }
    }

    pub fn on_ref(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = ref_id.into();
        self
    }

    pub fn at_commit(mut self, commit_id: impl Into<String>) -> Self {
        self.commit_id = commit_id.into();
        self
    }

    pub fn extended(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Fill in the default ref and commit where they were left empty.
    pub fn normalized(mut self) -> Self {
        if self.ref_id.is_empty() {
            self.ref_id = DEFAULT_REF.to_string();
        }
        if self.commit_id.is_empty() {
            self.commit_id = LATEST.to_string();
        }
        self
    }

    pub fn is_latest(&self) -> bool {
        self.commit_id == LATEST
    }

    /// Same context, different element.
    pub fn for_element(&self, element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            ..self.clone()
        }
    }

    pub fn scope(&self) -> RefScope {
        RefScope::new(self.project_id.clone(), self.ref_id.clone())
    }
}

/// Descriptor for a batch read of several elements in one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementsRequest {
    pub project_id: String,
    pub ref_id: String,
    pub commit_id: String,
    pub element_ids: Vec<String>,
    pub extended: bool,
}

impl ElementsRequest {
    pub fn new<I, S>(project_id: impl Into<String>, element_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            project_id: project_id.into(),
            ref_id: DEFAULT_REF.to_string(),
            commit_id: LATEST.to_string(),
            element_ids: element_ids.into_iter().map(Into::into).collect(),
            extended: false,
        }
    }

    pub fn on_ref(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = ref_id.into();
        self
    }

    pub fn at_commit(mut self, commit_id: impl Into<String>) -> Self {
        self.commit_id = commit_id.into();
        self
    }

    pub fn normalized(mut self) -> Self {
        if self.ref_id.is_empty() {
            self.ref_id = DEFAULT_REF.to_string();
        }
        if self.commit_id.is_empty() {
            self.commit_id = LATEST.to_string();
        }
        self
    }

    /// Single-element request for one of the batch ids.
    pub fn request_for(&self, element_id: impl Into<String>) -> ElementRequest {
        ElementRequest {
            project_id: self.project_id.clone(),
            ref_id: self.ref_id.clone(),
            element_id: element_id.into(),
            commit_id: self.commit_id.clone(),
            extended: self.extended,
        }
    }

    pub fn scope(&self) -> RefScope {
        RefScope::new(self.project_id.clone(), self.ref_id.clone())
    }
}

// ============================================================================
// HISTORY
// ============================================================================

/// One entry of an element's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    #[serde(rename = "_creator", default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(
        rename = "_created",
        default,
        skip_serializing_if = "Option::is_none",
        with = "mms_timestamp"
    )]
    pub created: Option<Timestamp>,
    #[serde(rename = "_refId", default)]
    pub ref_id: String,
    #[serde(rename = "_projectId", default)]
    pub project_id: String,
}

impl CommitRecord {
    /// Synthetic history entry for a version this client just saved.
    pub fn from_saved(element: &Element) -> Self {
        let id = if element.commit_id.is_empty() {
            LATEST.to_string()
        } else {
            element.commit_id.clone()
        };
        Self {
            id,
            creator: element.modifier.clone(),
            created: element.modified,
            ref_id: element.ref_id.clone(),
            project_id: element.project_id.clone(),
        }
    }
}

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Timestamp layout used by the repository, e.g. `2024-03-01T12:00:00.000-0800`.
const MMS_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Parse a repository timestamp. Accepts RFC 3339 as well.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, MMS_TIMESTAMP_FORMAT))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(MMS_TIMESTAMP_FORMAT).to_string()
}

mod mms_timestamp {
    use super::{format_timestamp, parse_timestamp, Timestamp};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Timestamp>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_str(&format_timestamp(ts)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Timestamp>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| {
            parse_timestamp(&s).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {s}")))
        })
        .transpose()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_element_type_roundtrips_known_and_unknown_tags() {
        assert_eq!(ElementType::from("Slot"), ElementType::Slot);
        assert_eq!(
            ElementType::from("Diagram"),
            ElementType::Other("Diagram".to_string())
        );
        assert_eq!(String::from(ElementType::Constraint), "Constraint");
        assert_eq!(String::from(ElementType::Other("Class".into())), "Class");
    }

    #[test]
    fn test_value_fields_dispatch() {
        assert_eq!(ElementType::Property.value_fields(), &["defaultValue"]);
        assert_eq!(ElementType::Port.value_fields(), &["defaultValue"]);
        assert_eq!(ElementType::Slot.value_fields(), &["value"]);
        assert_eq!(ElementType::Constraint.value_fields(), &["specification"]);
        assert!(ElementType::Other("Class".into()).value_fields().is_empty());
    }

    #[test]
    fn test_element_deserializes_wire_shape() {
        let raw = json!({
            "id": "e1",
            "_projectId": "p1",
            "_refId": "master",
            "_commitId": "c42",
            "type": "Property",
            "_modified": "2024-03-01T12:00:00.000-0800",
            "_modifier": "alice",
            "_read": "r1",
            "name": "mass",
            "defaultValue": {"type": "LiteralReal", "value": 1.5}
        });
        let element: Element = serde_json::from_value(raw).unwrap();
        assert_eq!(element.id, "e1");
        assert_eq!(element.commit_id, "c42");
        assert_eq!(element.element_type, ElementType::Property);
        assert_eq!(element.name(), Some("mass"));
        assert_eq!(element.read.as_deref(), Some("r1"));
        assert!(element.modified.is_some());
        assert!(element.fields.contains_key("defaultValue"));
        assert!(!element.fields.contains_key("_read"));
    }

    #[test]
    fn test_element_serializes_payload_flat() {
        let element = Element::new("e1", "p1", "master", "Class").with_name("Block");
        let value = serde_json::to_value(&element).unwrap();
        assert_eq!(value["name"], "Block");
        assert_eq!(value["type"], "Class");
        assert_eq!(value["_projectId"], "p1");
        assert!(value.get("_commitId").is_none());
    }

    #[test]
    fn test_request_normalization_fills_defaults() {
        let req = ElementRequest {
            project_id: "p1".into(),
            ref_id: String::new(),
            element_id: "e1".into(),
            commit_id: String::new(),
            extended: false,
        }
        .normalized();
        assert_eq!(req.ref_id, DEFAULT_REF);
        assert_eq!(req.commit_id, LATEST);
        assert!(req.is_latest());
    }

    #[test]
    fn test_identity_and_version_requests() {
        let element = Element::new("e1", "p1", "dev", "Class").with_commit("c7");
        let identity = element.identity();
        assert_eq!(identity.ref_id, "dev");
        assert!(identity.is_latest());
        assert_eq!(element.version_request().commit_id, "c7");
    }

    #[test]
    fn test_rebased_onto_adopts_tokens_only() {
        let now = Utc::now();
        let edit = Element::new("e1", "p1", "master", "Class")
            .with_name("Y")
            .with_read("old");
        let server = Element::new("e1", "p1", "master", "Class")
            .with_name("X")
            .with_read("new")
            .with_modified(now);
        let rebased = edit.rebased_onto(&server);
        assert_eq!(rebased.read.as_deref(), Some("new"));
        assert_eq!(rebased.modified, Some(now));
        assert_eq!(rebased.name(), Some("Y"));
    }

    #[test]
    fn test_timestamp_parse_accepts_both_layouts() {
        assert!(parse_timestamp("2024-03-01T12:00:00.000-0800").is_some());
        assert!(parse_timestamp("2024-03-01T12:00:00Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_commit_record_from_saved() {
        let now = Utc::now();
        let element = Element::new("e1", "p1", "master", "Class")
            .with_modifier("bob")
            .with_modified(now);
        let record = CommitRecord::from_saved(&element);
        assert_eq!(record.id, LATEST);
        assert_eq!(record.creator.as_deref(), Some("bob"));
        assert_eq!(record.created, Some(now));
    }
}
