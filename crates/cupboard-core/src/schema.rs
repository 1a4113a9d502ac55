//! Table-level definitions: the seven table names, the closed entity variant
//! returned by the table interface, and fetch filters.
//!
//! Each table maps to one JSONL file (`{table}.jsonl`) and one cache table of
//! the same name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::stash::Stash;
use crate::types::{str_enum, Category, Crumb, Link, Metadata, Property, Trail};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Crumbs,
    Trails,
    Links,
    Properties,
    Categories,
    Stashes,
    Metadata,
}

str_enum!(TableName, "table" {
    Crumbs => "crumbs",
    Trails => "trails",
    Links => "links",
    Properties => "properties",
    Categories => "categories",
    Stashes => "stashes",
    Metadata => "metadata",
});

impl TableName {
    /// Parses a table name, reporting unknown names as `UnknownTable`.
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| Error::UnknownTable(name.to_string()))
    }

    /// Canonical JSONL filename: {table}.jsonl
    pub fn filename(&self) -> String {
        format!("{}.jsonl", self.as_str())
    }

    /// Filter keys the table accepts, mapped to the cache column they test.
    pub fn filter_column(&self, key: &str) -> Option<&'static str> {
        let column = match (self, key) {
            (TableName::Crumbs, "state" | "states") => "state",
            (TableName::Crumbs, "name") => "name",
            (TableName::Trails, "state" | "states") => "state",
            (TableName::Links, "link_type") => "link_type",
            (TableName::Links, "from_id") => "from_id",
            (TableName::Links, "to_id") => "to_id",
            (TableName::Properties, "name") => "name",
            (TableName::Properties, "value_type") => "value_type",
            (TableName::Categories, "property_id") => "property_id",
            (TableName::Categories, "name") => "name",
            (TableName::Stashes, "name") => "name",
            (TableName::Stashes, "stash_type") => "stash_type",
            (TableName::Metadata, "crumb_id") => "crumb_id",
            (TableName::Metadata, "table_name" | "schema") => "table_name",
            _ => return None,
        };
        Some(column)
    }
}

/// One row of any table.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Crumb(Crumb),
    Trail(Trail),
    Link(Link),
    Property(Property),
    Category(Category),
    Stash(Stash),
    Metadata(Metadata),
}

impl Entity {
    pub fn table(&self) -> TableName {
        match self {
            Entity::Crumb(_) => TableName::Crumbs,
            Entity::Trail(_) => TableName::Trails,
            Entity::Link(_) => TableName::Links,
            Entity::Property(_) => TableName::Properties,
            Entity::Category(_) => TableName::Categories,
            Entity::Stash(_) => TableName::Stashes,
            Entity::Metadata(_) => TableName::Metadata,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Crumb(e) => &e.id,
            Entity::Trail(e) => &e.id,
            Entity::Link(e) => &e.id,
            Entity::Property(e) => &e.id,
            Entity::Category(e) => &e.id,
            Entity::Stash(e) => &e.id,
            Entity::Metadata(e) => &e.id,
        }
    }

    /// Parses a JSON record as a row of `table`.
    pub fn from_json(table: TableName, value: Value) -> Result<Self> {
        let entity = match table {
            TableName::Crumbs => Entity::Crumb(serde_json::from_value(value)?),
            TableName::Trails => Entity::Trail(serde_json::from_value(value)?),
            TableName::Links => Entity::Link(serde_json::from_value(value)?),
            TableName::Properties => Entity::Property(serde_json::from_value(value)?),
            TableName::Categories => Entity::Category(serde_json::from_value(value)?),
            TableName::Stashes => Entity::Stash(serde_json::from_value(value)?),
            TableName::Metadata => Entity::Metadata(serde_json::from_value(value)?),
        };
        Ok(entity)
    }

    /// Parses one JSONL line as a row of `table`.
    pub fn from_line(table: TableName, line: &str) -> serde_json::Result<Self> {
        let entity = match table {
            TableName::Crumbs => Entity::Crumb(serde_json::from_str(line)?),
            TableName::Trails => Entity::Trail(serde_json::from_str(line)?),
            TableName::Links => Entity::Link(serde_json::from_str(line)?),
            TableName::Properties => Entity::Property(serde_json::from_str(line)?),
            TableName::Categories => Entity::Category(serde_json::from_str(line)?),
            TableName::Stashes => Entity::Stash(serde_json::from_str(line)?),
            TableName::Metadata => Entity::Metadata(serde_json::from_str(line)?),
        };
        Ok(entity)
    }

    /// Serializes the row as a single JSONL line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        match self {
            Entity::Crumb(e) => serde_json::to_string(e),
            Entity::Trail(e) => serde_json::to_string(e),
            Entity::Link(e) => serde_json::to_string(e),
            Entity::Property(e) => serde_json::to_string(e),
            Entity::Category(e) => serde_json::to_string(e),
            Entity::Stash(e) => serde_json::to_string(e),
            Entity::Metadata(e) => serde_json::to_string(e),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Value> {
        match self {
            Entity::Crumb(e) => serde_json::to_value(e),
            Entity::Trail(e) => serde_json::to_value(e),
            Entity::Link(e) => serde_json::to_value(e),
            Entity::Property(e) => serde_json::to_value(e),
            Entity::Category(e) => serde_json::to_value(e),
            Entity::Stash(e) => serde_json::to_value(e),
            Entity::Metadata(e) => serde_json::to_value(e),
        }
    }
}

macro_rules! entity_accessors {
    ($($variant:ident => $into:ident),+ $(,)?) => {
        impl Entity {
            $(
                pub fn $into(self) -> Result<$variant> {
                    match self {
                        Entity::$variant(e) => Ok(e),
                        other => Err(Error::Validation(format!(
                            concat!("expected a ", stringify!($variant), " row, got a {} row"),
                            other.table()
                        ))),
                    }
                }
            )+
        }

        $(
            impl From<$variant> for Entity {
                fn from(e: $variant) -> Self {
                    Entity::$variant(e)
                }
            }
        )+
    };
}

entity_accessors!(
    Crumb => into_crumb,
    Trail => into_trail,
    Link => into_link,
    Property => into_property,
    Category => into_category,
    Stash => into_stash,
    Metadata => into_metadata,
);

/// Fetch filter: field name -> expected value. A JSON string matches by
/// equality, an array of strings by membership. Keys are ANDed; an empty
/// filter matches every row.
pub type Filter = BTreeMap<String, Value>;

/// A filter condition resolved against a table's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: &'static str,
    pub values: Vec<String>,
}

/// Resolves `filter` against `table`, rejecting unknown keys and values
/// that are neither strings nor arrays of strings.
pub fn resolve_filter(table: TableName, filter: &Filter) -> Result<Vec<Condition>> {
    let mut conditions = Vec::with_capacity(filter.len());
    for (key, value) in filter {
        let column = table.filter_column(key).ok_or_else(|| {
            Error::Validation(format!("{table}: unknown filter key {key:?}"))
        })?;
        let values = match value {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        Error::Validation(format!("{table}: filter {key} expects strings"))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            _ => {
                return Err(Error::Validation(format!(
                    "{table}: filter {key} expects a string or an array of strings"
                )))
            }
        };
        conditions.push(Condition { column, values });
    }
    Ok(conditions)
}
