//! Table interface: uniform Get/Set/Fetch/Delete over the seven tables.
//!
//! Reads go straight to the cache. Writes are planned first: the planner
//! validates the request against the cache, fills ids and timestamps, and
//! expands cascades into a list of [`Mutation`]s that the sync manager
//! applies in a single transaction.

use chrono::{DateTime, Utc};
use cupboard_core::{
    new_id, resolve_filter, Category, Condition, Crumb, Entity, Error, Filter, Link, LinkType,
    Metadata, Property, Result, Stash, TableName, Trail, TrailState, ValueType,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::cupboard::Cupboard;
use crate::db::{Database, Mutation};

/// Handle on one table of an attached cupboard.
#[derive(Clone, Copy)]
pub struct Table<'a> {
    cupboard: &'a Cupboard,
    name: TableName,
}

impl<'a> Table<'a> {
    pub(crate) fn new(cupboard: &'a Cupboard, name: TableName) -> Self {
        Self { cupboard, name }
    }

    pub fn name(&self) -> TableName {
        self.name
    }

    pub async fn get(&self, id: &str) -> Result<Entity> {
        let session = self.cupboard.session().await;
        get_existing(session.db(), self.name, id).await
    }

    /// Insert (empty `id`) or update (existing `id`) a row. Returns the id.
    pub async fn set(&self, id: &str, entity: Entity) -> Result<String> {
        if entity.table() != self.name {
            return Err(Error::Validation(format!(
                "cannot store a {} row in {}",
                entity.table(),
                self.name
            )));
        }

        let mut session = self.cupboard.session().await;
        let (id, mutations) = plan_set(session.db(), id, entity, Utc::now()).await?;
        session.commit(mutations).await?;
        Ok(id)
    }

    /// Like [`Table::set`], taking the row as JSON.
    pub async fn set_json(&self, id: &str, value: Value) -> Result<String> {
        let entity = Entity::from_json(self.name, value)
            .map_err(|e| Error::Validation(format!("{}: {}", self.name, e)))?;
        self.set(id, entity).await
    }

    /// Rows matching every filter key. An empty filter returns all rows.
    pub async fn fetch(&self, filter: &Filter) -> Result<Vec<Entity>> {
        let conditions = resolve_filter(self.name, filter)?;
        let session = self.cupboard.session().await;
        session.db().fetch(self.name, &conditions).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut session = self.cupboard.session().await;
        let mutations = plan_delete(session.db(), self.name, id).await?;
        session.commit(mutations).await
    }
}

/// Accumulates the mutations of one logical operation. Deletes are
/// de-duplicated so overlapping cascades remove each row once.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    mutations: Vec<Mutation>,
    deleted: BTreeSet<(TableName, String)>,
}

impl Plan {
    pub(crate) fn upsert(&mut self, entity: impl Into<Entity>) {
        self.mutations.push(Mutation::Upsert(entity.into()));
    }

    pub(crate) fn delete(&mut self, table: TableName, id: &str) {
        if self.deleted.insert((table, id.to_string())) {
            self.mutations.push(Mutation::delete(table, id));
        }
    }

    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

pub(crate) async fn get_existing(db: &Database, table: TableName, id: &str) -> Result<Entity> {
    if id.is_empty() {
        return Err(Error::invalid_id(table.as_str()));
    }
    db.get(table, id)
        .await?
        .ok_or_else(|| Error::not_found(table.as_str(), id))
}

async fn rows_where(
    db: &Database,
    table: TableName,
    column: &'static str,
    value: &str,
) -> Result<Vec<Entity>> {
    db.fetch(
        table,
        &[Condition {
            column,
            values: vec![value.to_string()],
        }],
    )
    .await
}

async fn all_properties(db: &Database) -> Result<Vec<Property>> {
    db.fetch_all(TableName::Properties)
        .await?
        .into_iter()
        .map(Entity::into_property)
        .collect()
}

async fn all_crumbs(db: &Database) -> Result<Vec<Crumb>> {
    db.fetch_all(TableName::Crumbs)
        .await?
        .into_iter()
        .map(Entity::into_crumb)
        .collect()
}

// ===== Set =====

pub(crate) async fn plan_set(
    db: &Database,
    id: &str,
    entity: Entity,
    now: DateTime<Utc>,
) -> Result<(String, Vec<Mutation>)> {
    let table = entity.table();
    let stored = if id.is_empty() {
        None
    } else {
        Some(get_existing(db, table, id).await?)
    };
    let id = if id.is_empty() { new_id() } else { id.to_string() };

    let mut plan = Plan::default();
    match entity {
        Entity::Crumb(mut crumb) => {
            crumb.id = id.clone();
            let stored = stored.map(Entity::into_crumb).transpose()?;
            set_crumb(db, crumb, stored, now, &mut plan).await?;
        }
        Entity::Trail(mut trail) => {
            trail.id = id.clone();
            let stored = stored.map(Entity::into_trail).transpose()?;
            set_trail(db, trail, stored, now, &mut plan).await?;
        }
        Entity::Link(mut link) => {
            link.id = id.clone();
            let stored = stored.map(Entity::into_link).transpose()?;
            set_link(db, link, stored, now, &mut plan).await?;
        }
        Entity::Property(mut property) => {
            property.id = id.clone();
            let stored = stored.map(Entity::into_property).transpose()?;
            set_property(db, property, stored, now, &mut plan).await?;
        }
        Entity::Category(mut category) => {
            category.id = id.clone();
            let stored = stored.map(Entity::into_category).transpose()?;
            set_category(db, category, stored, now, &mut plan).await?;
        }
        Entity::Stash(mut stash) => {
            stash.id = id.clone();
            let stored = stored.map(Entity::into_stash).transpose()?;
            set_stash(stash, stored, now, &mut plan)?;
        }
        Entity::Metadata(mut metadata) => {
            metadata.id = id.clone();
            let stored = stored.map(Entity::into_metadata).transpose()?;
            set_metadata(db, metadata, stored, now, &mut plan).await?;
        }
    }

    Ok((id, plan.into_mutations()))
}

async fn set_crumb(
    db: &Database,
    incoming: Crumb,
    stored: Option<Crumb>,
    now: DateTime<Utc>,
    plan: &mut Plan,
) -> Result<()> {
    let properties = all_properties(db).await?;
    let by_id: BTreeMap<&str, &Property> =
        properties.iter().map(|p| (p.id.as_str(), p)).collect();

    for (key, value) in &incoming.properties {
        check_property_value(db, &by_id, key, value).await?;
    }

    let crumb = match stored {
        None => Crumb {
            created_at: now,
            updated_at: now,
            ..incoming
        },
        Some(mut stored) => {
            stored.set_state(incoming.state)?;
            // An update may leave the name out
            if !incoming.name.trim().is_empty() {
                stored.name = incoming.name;
            }
            stored.properties.extend(incoming.properties);
            stored.updated_at = now;
            stored
        }
    };

    let mut crumb = crumb;
    crumb.validate()?;
    crumb.ensure_properties(&properties);
    plan.upsert(crumb);
    Ok(())
}

async fn check_property_value(
    db: &Database,
    properties: &BTreeMap<&str, &Property>,
    key: &str,
    value: &Value,
) -> Result<()> {
    let property = properties
        .get(key)
        .ok_or_else(|| Error::PropertyNotFound(key.to_string()))?;

    if !property.value_type.accepts(value) {
        return Err(Error::Validation(format!(
            "property {} expects a {} value, got {}",
            property.name, property.value_type, value
        )));
    }

    if let (ValueType::Categorical, Value::String(category_id)) = (property.value_type, value) {
        let category = db.get(TableName::Categories, category_id).await?;
        let belongs = match category {
            Some(Entity::Category(c)) => c.property_id == property.id,
            _ => false,
        };
        if !belongs {
            return Err(Error::Validation(format!(
                "{category_id} is not a category of property {}",
                property.name
            )));
        }
    }
    Ok(())
}

async fn set_trail(
    db: &Database,
    incoming: Trail,
    stored: Option<Trail>,
    now: DateTime<Utc>,
    plan: &mut Plan,
) -> Result<()> {
    match stored {
        None => {
            let mut trail = Trail {
                id: incoming.id,
                created_at: now,
                ..Default::default()
            };
            trail.set_state(incoming.state)?;
            plan.upsert(trail);
        }
        Some(mut trail) => {
            let was_active = trail.state == TrailState::Active;
            trail.set_state(incoming.state)?;
            let cascade = was_active && trail.is_terminal();
            plan.upsert(trail.clone());
            if cascade {
                plan_trail_cascade(db, &trail, plan).await?;
            }
        }
    }
    Ok(())
}

/// Side effects of a trail leaving `active` for a terminal state.
///
/// Both outcomes drop the trail's `belongs_to` links. Abandoning also
/// deletes every crumb those links held, with the crumb's own cascade.
pub(crate) async fn plan_trail_cascade(db: &Database, trail: &Trail, plan: &mut Plan) -> Result<()> {
    let members: Vec<Link> = rows_where(db, TableName::Links, "to_id", &trail.id)
        .await?
        .into_iter()
        .map(Entity::into_link)
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|link| link.link_type == LinkType::BelongsTo)
        .collect();

    for link in &members {
        plan.delete(TableName::Links, &link.id);
    }

    if trail.state == TrailState::Abandoned {
        for link in &members {
            plan_crumb_removal(db, &link.from_id, plan).await?;
        }
        info!(
            "Abandoning trail {} discards {} crumbs",
            trail.id,
            members.len()
        );
    } else {
        info!(
            "Completing trail {} keeps {} crumbs",
            trail.id,
            members.len()
        );
    }
    Ok(())
}

async fn set_link(
    db: &Database,
    incoming: Link,
    stored: Option<Link>,
    now: DateTime<Utc>,
    plan: &mut Plan,
) -> Result<()> {
    incoming.validate()?;

    let (from_table, to_table) = incoming.link_type.endpoints();
    if !db.exists(from_table, &incoming.from_id).await? {
        return Err(Error::not_found(from_table.as_str(), &incoming.from_id));
    }
    if !db.exists(to_table, &incoming.to_id).await? {
        return Err(Error::not_found(to_table.as_str(), &incoming.to_id));
    }

    if incoming.link_type == LinkType::BelongsTo {
        let existing = rows_where(db, TableName::Links, "from_id", &incoming.from_id).await?;
        let conflict = existing
            .into_iter()
            .map(Entity::into_link)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .find(|l| l.link_type == LinkType::BelongsTo && l.id != incoming.id);
        if let Some(other) = conflict {
            return Err(Error::Validation(format!(
                "crumb {} already belongs to trail {}",
                incoming.from_id, other.to_id
            )));
        }
    }

    let created_at = stored.map(|s| s.created_at).unwrap_or(now);
    plan.upsert(Link {
        created_at,
        ..incoming
    });
    Ok(())
}

async fn set_property(
    db: &Database,
    incoming: Property,
    stored: Option<Property>,
    now: DateTime<Utc>,
    plan: &mut Plan,
) -> Result<()> {
    incoming.validate()?;

    let same_name = rows_where(db, TableName::Properties, "name", &incoming.name).await?;
    if same_name.iter().any(|e| e.id() != incoming.id) {
        return Err(Error::duplicate_name("properties", &incoming.name));
    }

    match stored {
        None => {
            let property = Property {
                created_at: now,
                ..incoming
            };
            let mut backfilled = 0;
            for mut crumb in all_crumbs(db).await? {
                if crumb.ensure_properties([&property]) > 0 {
                    plan.upsert(crumb);
                    backfilled += 1;
                }
            }
            debug!(
                "Property {} backfilled onto {} crumbs",
                property.name, backfilled
            );
            plan.upsert(property);
        }
        Some(stored) => {
            if stored.value_type != incoming.value_type {
                return Err(Error::Validation(format!(
                    "property {} value type is {} and cannot change",
                    stored.name, stored.value_type
                )));
            }
            plan.upsert(Property {
                created_at: stored.created_at,
                ..incoming
            });
        }
    }
    Ok(())
}

async fn set_category(
    db: &Database,
    incoming: Category,
    stored: Option<Category>,
    now: DateTime<Utc>,
    plan: &mut Plan,
) -> Result<()> {
    incoming.validate()?;

    let property = match db.get(TableName::Properties, &incoming.property_id).await? {
        Some(entity) => entity.into_property()?,
        None => return Err(Error::PropertyNotFound(incoming.property_id.clone())),
    };
    if property.value_type != ValueType::Categorical {
        return Err(Error::Validation(format!(
            "property {} is {}, not categorical",
            property.name, property.value_type
        )));
    }

    let siblings = rows_where(db, TableName::Categories, "property_id", &incoming.property_id)
        .await?
        .into_iter()
        .map(Entity::into_category)
        .collect::<Result<Vec<_>>>()?;
    if siblings
        .iter()
        .any(|c| c.name == incoming.name && c.id != incoming.id)
    {
        return Err(Error::duplicate_name("categories", &incoming.name));
    }

    if let Some(stored) = &stored {
        if stored.property_id != incoming.property_id {
            return Err(Error::Validation(format!(
                "category {} cannot move to another property",
                stored.id
            )));
        }
    }

    let created_at = stored.map(|s| s.created_at).unwrap_or(now);
    plan.upsert(Category {
        created_at,
        ..incoming
    });
    Ok(())
}

fn set_stash(
    incoming: Stash,
    stored: Option<Stash>,
    now: DateTime<Utc>,
    plan: &mut Plan,
) -> Result<()> {
    let stash = match stored {
        None => {
            let mut stash = Stash {
                version: 1,
                created_at: now,
                updated_at: now,
                ..incoming
            };
            stash.normalize();
            stash
        }
        Some(stored) => {
            if stored.stash_type != incoming.stash_type {
                return Err(Error::Validation(format!(
                    "stash {} is a {} stash and cannot change type",
                    stored.name, stored.stash_type
                )));
            }
            Stash {
                version: stored.version + 1,
                created_at: stored.created_at,
                updated_at: now,
                ..incoming
            }
        }
    };
    stash.validate()?;
    plan.upsert(stash);
    Ok(())
}

async fn set_metadata(
    db: &Database,
    incoming: Metadata,
    stored: Option<Metadata>,
    now: DateTime<Utc>,
    plan: &mut Plan,
) -> Result<()> {
    incoming.validate()?;
    if !db.exists(TableName::Crumbs, &incoming.crumb_id).await? {
        return Err(Error::not_found("crumbs", &incoming.crumb_id));
    }
    if let Some(stored) = &stored {
        if stored.crumb_id != incoming.crumb_id {
            return Err(Error::Validation(format!(
                "metadata {} cannot move to another crumb",
                stored.id
            )));
        }
    }

    let created_at = stored.map(|s| s.created_at).unwrap_or(now);
    plan.upsert(Metadata {
        created_at,
        ..incoming
    });
    Ok(())
}

// ===== Delete =====

pub(crate) async fn plan_delete(db: &Database, table: TableName, id: &str) -> Result<Vec<Mutation>> {
    let entity = get_existing(db, table, id).await?;
    let mut plan = Plan::default();

    match entity {
        Entity::Crumb(crumb) => plan_crumb_removal(db, &crumb.id, &mut plan).await?,
        Entity::Trail(trail) => {
            for link in links_touching(db, &trail.id).await? {
                plan.delete(TableName::Links, &link.id);
            }
            plan.delete(TableName::Trails, &trail.id);
        }
        Entity::Property(property) => {
            for category in rows_where(db, TableName::Categories, "property_id", &property.id).await? {
                plan.delete(TableName::Categories, category.id());
            }
            for mut crumb in all_crumbs(db).await? {
                if crumb.properties.remove(&property.id).is_some() {
                    plan.upsert(crumb);
                }
            }
            plan.delete(TableName::Properties, &property.id);
        }
        Entity::Category(category) => {
            // Crumbs holding the category fall back to unset
            for mut crumb in all_crumbs(db).await? {
                let holds = crumb
                    .properties
                    .get(&category.property_id)
                    .and_then(Value::as_str)
                    == Some(category.id.as_str());
                if holds {
                    crumb
                        .properties
                        .insert(category.property_id.clone(), Value::Null);
                    plan.upsert(crumb);
                }
            }
            plan.delete(TableName::Categories, &category.id);
        }
        other => plan.delete(table, other.id()),
    }

    Ok(plan.into_mutations())
}

async fn links_touching(db: &Database, id: &str) -> Result<Vec<Link>> {
    let mut links = rows_where(db, TableName::Links, "from_id", id).await?;
    links.extend(rows_where(db, TableName::Links, "to_id", id).await?);
    links.into_iter().map(Entity::into_link).collect()
}

/// A crumb goes together with its metadata and every link touching it.
async fn plan_crumb_removal(db: &Database, crumb_id: &str, plan: &mut Plan) -> Result<()> {
    for metadata in rows_where(db, TableName::Metadata, "crumb_id", crumb_id).await? {
        plan.delete(TableName::Metadata, metadata.id());
    }
    for link in links_touching(db, crumb_id).await? {
        plan.delete(TableName::Links, &link.id);
    }
    plan.delete(TableName::Crumbs, crumb_id);
    Ok(())
}
