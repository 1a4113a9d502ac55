//! Entity records stored in the cupboard and the lifecycle rules attached
//! to them.
//!
//! Every record is also its own on-disk form: one record serializes to one
//! JSONL line. All records deserialize with `#[serde(default)]` so a caller
//! may submit a partial record (for example `{"name": "X"}`) and let the
//! table layer fill in the id and timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::schema::TableName;
use crate::{Error, Result};

/// Generates a new time-ordered entity id (UUID v7, lowercase hyphenated).
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Fixed-width RFC 3339 text with nanoseconds and a `Z` suffix. This is the
/// form written to the cache so that text order matches time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("invalid timestamp {s:?}: {e}")))
}

/// Implements `as_str`, `Display`, `FromStr` and `ALL` for a unit enum whose
/// wire names are fixed strings.
macro_rules! str_enum {
    ($name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Validation(format!(
                        concat!("unknown ", $what, ": {:?}"),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use str_enum;

// ===== Crumb =====

/// Lifecycle of a crumb.
///
/// ```text
/// draft -> pending -> ready -> taken -> pebble     (forward, skips allowed)
/// draft | pending | ready | taken -> dust          (abandon)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrumbState {
    #[default]
    Draft,
    Pending,
    Ready,
    Taken,
    Pebble,
    Dust,
}

str_enum!(CrumbState, "crumb state" {
    Draft => "draft",
    Pending => "pending",
    Ready => "ready",
    Taken => "taken",
    Pebble => "pebble",
    Dust => "dust",
});

impl CrumbState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CrumbState::Pebble | CrumbState::Dust)
    }

    /// Position on the success path. Dust is off the path.
    fn rank(&self) -> u8 {
        match self {
            CrumbState::Draft => 0,
            CrumbState::Pending => 1,
            CrumbState::Ready => 2,
            CrumbState::Taken => 3,
            CrumbState::Pebble => 4,
            CrumbState::Dust => u8::MAX,
        }
    }

    /// Staying put is always allowed. Terminal states never move; everything
    /// else may move forward along the success path or drop to dust.
    pub fn can_transition_to(&self, next: CrumbState) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match next {
            CrumbState::Dust => true,
            _ => next.rank() > self.rank(),
        }
    }
}

/// A unit of trackable work.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Crumb {
    pub id: String,
    pub name: String,
    pub state: CrumbState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Property id -> value. Holds an entry for every defined property.
    pub properties: BTreeMap<String, Value>,
}

impl Crumb {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("crumb name is required".to_string()));
        }
        Ok(())
    }

    pub fn set_state(&mut self, next: CrumbState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "crumb {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn pebble(&mut self) -> Result<()> {
        self.set_state(CrumbState::Pebble)
    }

    pub fn dust(&mut self) -> Result<()> {
        self.set_state(CrumbState::Dust)
    }

    pub fn get_property(&self, property_id: &str) -> Result<&Value> {
        self.properties
            .get(property_id)
            .ok_or_else(|| Error::PropertyNotFound(property_id.to_string()))
    }

    /// Replaces the value of a property the crumb already carries.
    pub fn set_property(&mut self, property_id: &str, value: Value) -> Result<()> {
        match self.properties.get_mut(property_id) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::PropertyNotFound(property_id.to_string())),
        }
    }

    /// Resets a property to the default of its value type.
    pub fn clear_property(&mut self, property: &Property) -> Result<()> {
        self.set_property(&property.id, property.value_type.default_value())
    }

    /// Adds a default entry for every property the crumb lacks. Returns how
    /// many entries were added.
    pub fn ensure_properties<'a>(
        &mut self,
        properties: impl IntoIterator<Item = &'a Property>,
    ) -> usize {
        let mut added = 0;
        for property in properties {
            if !self.properties.contains_key(&property.id) {
                self.properties
                    .insert(property.id.clone(), property.value_type.default_value());
                added += 1;
            }
        }
        added
    }
}

// ===== Trail =====

/// Lifecycle of a trail. `completed` and `abandoned` are terminal and only
/// reachable from `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailState {
    #[default]
    Draft,
    Active,
    Pending,
    Completed,
    Abandoned,
}

str_enum!(TrailState, "trail state" {
    Draft => "draft",
    Active => "active",
    Pending => "pending",
    Completed => "completed",
    Abandoned => "abandoned",
});

impl TrailState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrailState::Completed | TrailState::Abandoned)
    }

    pub fn can_transition_to(&self, next: TrailState) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return *self == TrailState::Active;
        }
        true
    }
}

/// A grouping container for crumbs. Membership is expressed only through
/// `belongs_to` links pointing at the trail.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Trail {
    pub id: String,
    pub state: TrailState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn set_state(&mut self, next: TrailState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "trail {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        if next.is_terminal() && self.state != next {
            self.completed_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Marks an active trail completed. Its crumbs are kept once the table
    /// layer persists the change.
    pub fn complete(&mut self) -> Result<()> {
        self.require_active("complete")?;
        self.set_state(TrailState::Completed)
    }

    /// Marks an active trail abandoned. Its crumbs are discarded once the
    /// table layer persists the change.
    pub fn abandon(&mut self) -> Result<()> {
        self.require_active("abandon")?;
        self.set_state(TrailState::Abandoned)
    }

    fn require_active(&self, action: &str) -> Result<()> {
        if self.state != TrailState::Active {
            return Err(Error::InvalidState(format!(
                "cannot {action} trail {} in state {}",
                self.id, self.state
            )));
        }
        Ok(())
    }
}

// ===== Link =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// crumb -> trail membership
    #[default]
    BelongsTo,
    /// crumb -> parent crumb
    ChildOf,
    /// trail -> crumb it was started from
    BranchesFrom,
}

str_enum!(LinkType, "link type" {
    BelongsTo => "belongs_to",
    ChildOf => "child_of",
    BranchesFrom => "branches_from",
});

impl LinkType {
    /// Tables the `from_id` and `to_id` endpoints live in.
    pub fn endpoints(&self) -> (TableName, TableName) {
        match self {
            LinkType::BelongsTo => (TableName::Crumbs, TableName::Trails),
            LinkType::ChildOf => (TableName::Crumbs, TableName::Crumbs),
            LinkType::BranchesFrom => (TableName::Trails, TableName::Crumbs),
        }
    }
}

/// A typed, directed edge between two entities.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Link {
    pub id: String,
    pub link_type: LinkType,
    pub from_id: String,
    pub to_id: String,
    pub created_at: DateTime<Utc>,
}

impl Link {
    pub fn new(link_type: LinkType, from_id: impl Into<String>, to_id: impl Into<String>) -> Self {
        Self {
            link_type,
            from_id: from_id.into(),
            to_id: to_id.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from_id.is_empty() {
            return Err(Error::Validation("link from_id is required".to_string()));
        }
        if self.to_id.is_empty() {
            return Err(Error::Validation("link to_id is required".to_string()));
        }
        if self.from_id == self.to_id {
            return Err(Error::Validation(format!(
                "link cannot point {} at itself",
                self.from_id
            )));
        }
        Ok(())
    }
}

// ===== Property / Category =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Text,
    List,
    Categorical,
    Integer,
    Boolean,
}

str_enum!(ValueType, "value type" {
    Text => "text",
    List => "list",
    Categorical => "categorical",
    Integer => "integer",
    Boolean => "boolean",
});

impl ValueType {
    /// Value a crumb carries for a property it was never given.
    pub fn default_value(&self) -> Value {
        match self {
            ValueType::Text => Value::String(String::new()),
            ValueType::List => Value::Array(Vec::new()),
            ValueType::Categorical => Value::Null,
            ValueType::Integer => Value::from(0),
            ValueType::Boolean => Value::Bool(false),
        }
    }

    /// Shape check only; categorical values are checked against the
    /// category table by the storage layer.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Text => value.is_string(),
            ValueType::List => value.is_array(),
            ValueType::Categorical => value.is_null() || value.is_string(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Boolean => value.is_boolean(),
        }
    }
}

/// A typed column every crumb carries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Property {
    pub id: String,
    pub name: String,
    pub value_type: ValueType,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Property {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("property name is required".to_string()));
        }
        Ok(())
    }
}

/// One legal value of a categorical property. Sorted by ordinal, then name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Category {
    pub id: String,
    pub property_id: String,
    pub name: String,
    pub ordinal: i64,
    pub created_at: DateTime<Utc>,
}

impl Category {
    pub fn validate(&self) -> Result<()> {
        if self.property_id.is_empty() {
            return Err(Error::Validation(
                "category property_id is required".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Validation("category name is required".to_string()));
        }
        Ok(())
    }
}

// ===== Metadata =====

/// Sub-schema of a metadata row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataTable {
    #[default]
    Comments,
    Attachments,
}

str_enum!(MetadataTable, "metadata table" {
    Comments => "comments",
    Attachments => "attachments",
});

/// Additive note attached to a crumb: plain text for comments, JSON text
/// for attachments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub id: String,
    pub crumb_id: String,
    pub table_name: MetadataTable,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Metadata {
    pub fn comment(crumb_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            crumb_id: crumb_id.into(),
            table_name: MetadataTable::Comments,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.crumb_id.is_empty() {
            return Err(Error::Validation("metadata crumb_id is required".to_string()));
        }
        if self.table_name == MetadataTable::Attachments {
            serde_json::from_str::<Value>(&self.content).map_err(|e| {
                Error::Validation(format!("attachment content is not JSON: {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_crumb_forward_transitions() {
        let mut crumb = Crumb::new("X");
        crumb.set_state(CrumbState::Taken).unwrap();
        crumb.pebble().unwrap();
        assert_eq!(crumb.state, CrumbState::Pebble);

        let err = crumb.set_state(CrumbState::Draft).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_crumb_backward_and_terminal_rejected() {
        assert!(!CrumbState::Ready.can_transition_to(CrumbState::Pending));
        assert!(!CrumbState::Dust.can_transition_to(CrumbState::Pebble));
        assert!(!CrumbState::Pebble.can_transition_to(CrumbState::Dust));
        assert!(CrumbState::Pebble.can_transition_to(CrumbState::Pebble));
        for state in [
            CrumbState::Draft,
            CrumbState::Pending,
            CrumbState::Ready,
            CrumbState::Taken,
        ] {
            assert!(state.can_transition_to(CrumbState::Dust), "{state} -> dust");
        }
    }

    #[test]
    fn test_crumb_properties() {
        let estimate = Property {
            id: "p-1".to_string(),
            ..Property::new("estimate", ValueType::Integer)
        };
        let mut crumb = Crumb::new("X");

        assert!(matches!(
            crumb.set_property("p-1", json!(3)),
            Err(Error::PropertyNotFound(_))
        ));

        assert_eq!(crumb.ensure_properties([&estimate]), 1);
        assert_eq!(crumb.ensure_properties([&estimate]), 0);
        assert_eq!(crumb.get_property("p-1").unwrap(), &json!(0));

        crumb.set_property("p-1", json!(5)).unwrap();
        crumb.clear_property(&estimate).unwrap();
        assert_eq!(crumb.get_property("p-1").unwrap(), &json!(0));
    }

    #[test]
    fn test_trail_complete_requires_active() {
        let mut trail = Trail::new();
        assert!(matches!(trail.complete(), Err(Error::InvalidState(_))));
        assert!(trail.completed_at.is_none());

        trail.set_state(TrailState::Active).unwrap();
        trail.complete().unwrap();
        assert_eq!(trail.state, TrailState::Completed);
        assert!(trail.completed_at.is_some());

        assert!(matches!(trail.abandon(), Err(Error::InvalidState(_))));
        assert!(trail.set_state(TrailState::Active).is_err());
    }

    #[test]
    fn test_trail_non_terminal_freely_settable() {
        let mut trail = Trail::new();
        trail.set_state(TrailState::Pending).unwrap();
        trail.set_state(TrailState::Draft).unwrap();
        trail.set_state(TrailState::Active).unwrap();
        assert!(!TrailState::Pending.can_transition_to(TrailState::Abandoned));
    }

    #[test]
    fn test_value_type_defaults() {
        assert_eq!(ValueType::Text.default_value(), json!(""));
        assert_eq!(ValueType::List.default_value(), json!([]));
        assert_eq!(ValueType::Categorical.default_value(), Value::Null);
        assert_eq!(ValueType::Integer.default_value(), json!(0));
        assert_eq!(ValueType::Boolean.default_value(), json!(false));

        assert!(ValueType::Integer.accepts(&json!(-4)));
        assert!(!ValueType::Integer.accepts(&json!(1.5)));
        assert!(!ValueType::Boolean.accepts(&json!("true")));
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!("branches_from".parse::<LinkType>().unwrap(), LinkType::BranchesFrom);
        assert!("blocks".parse::<LinkType>().is_err());
        assert_eq!(serde_json::to_string(&CrumbState::Taken).unwrap(), "\"taken\"");
        assert_eq!(MetadataTable::Attachments.to_string(), "attachments");
    }

    #[test]
    fn test_partial_record_deserializes() {
        let crumb: Crumb = serde_json::from_str(r#"{"name":"X","state":"draft"}"#).unwrap();
        assert!(crumb.id.is_empty());
        assert_eq!(crumb.state, CrumbState::Draft);
        assert!(crumb.properties.is_empty());
    }

    #[test]
    fn test_attachment_content_must_be_json() {
        let mut meta = Metadata::comment("c-1", "not json {");
        meta.validate().unwrap();
        meta.table_name = MetadataTable::Attachments;
        assert!(meta.validate().is_err());
        meta.content = r#"{"path":"a.txt"}"#.to_string();
        meta.validate().unwrap();
    }

    #[test]
    fn test_timestamp_text_round_trip() {
        let now = Utc::now();
        let text = format_timestamp(&now);
        assert!(text.ends_with('Z'));
        assert_eq!(parse_timestamp(&text).unwrap(), now);
    }
}
