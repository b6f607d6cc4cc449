//! Registered entity definitions for schema create/drop
//!
//! Upstream collaborators register one [`EntityDefinition`] per table (or other object).
//! Create applies them in registration order, drop in reverse, so later entities may
//! reference earlier ones.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::error::{DbError, DbResult};

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaOperation {
    Create,
    Drop,
}

impl fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Drop => f.write_str("drop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDefinition {
    name: String,
    create: String,
    drop: String,
}

impl EntityDefinition {
    /// New entity with no statements; chain [`on_create`](Self::on_create) and
    /// [`on_drop`](Self::on_drop)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create: String::new(),
            drop: String::new(),
        }
    }

    pub fn on_create(mut self, sql: impl Into<String>) -> Self {
        self.create = sql.into();
        self
    }

    pub fn on_drop(mut self, sql: impl Into<String>) -> Self {
        self.drop = sql.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self, operation: SchemaOperation) -> &str {
        match operation {
            SchemaOperation::Create => &self.create,
            SchemaOperation::Drop => &self.drop,
        }
    }
}

/// A statement to run for one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaStatement {
    pub entity: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    entities: Vec<EntityDefinition>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: EntityDefinition) -> &mut Self {
        self.entities.push(entity);
        self
    }

    pub fn with(mut self, entity: EntityDefinition) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn entities(&self) -> &[EntityDefinition] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Statements for `operation` in execution order. Entities with blank SQL are skipped.
    pub fn statements(&self, operation: SchemaOperation) -> Vec<SchemaStatement> {
        let ordered: Box<dyn Iterator<Item = &EntityDefinition>> = match operation {
            SchemaOperation::Create => Box::new(self.entities.iter()),
            SchemaOperation::Drop => Box::new(self.entities.iter().rev()),
        };

        ordered
            .filter(|entity| !entity.sql(operation).trim().is_empty())
            .map(|entity| SchemaStatement {
                entity: entity.name.clone(),
                sql: entity.sql(operation).to_string(),
            })
            .collect()
    }

    /// Load `<order>_<entity>.up.sql` / `<order>_<entity>.down.sql` pairs from a directory.
    ///
    /// Entities are registered in file-name order. Every `.up.sql` needs a matching
    /// `.down.sql` and vice versa; other files are ignored.
    pub fn from_dir(dir: impl AsRef<Path>) -> DbResult<Self> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| DbError::schema_source(dir, e.to_string()))?;

        // stem ("001_users") -> (up, down)
        let mut pairs: BTreeMap<String, (Option<String>, Option<String>)> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| DbError::schema_source(dir, e.to_string()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let (stem, is_up) = if let Some(stem) = file_name.strip_suffix(UP_SUFFIX) {
                (stem.to_string(), true)
            } else if let Some(stem) = file_name.strip_suffix(DOWN_SUFFIX) {
                (stem.to_string(), false)
            } else {
                continue;
            };

            let sql = fs::read_to_string(&path)
                .map_err(|e| DbError::schema_source(&path, e.to_string()))?;
            let slot = pairs.entry(stem).or_default();
            if is_up {
                slot.0 = Some(sql);
            } else {
                slot.1 = Some(sql);
            }
        }

        let mut registry = Self::new();
        for (stem, pair) in pairs {
            let name = entity_name(&stem)
                .ok_or_else(|| DbError::schema_source(dir.join(&stem), "expected <order>_<entity>"))?;
            let (create, drop) = match pair {
                (Some(create), Some(drop)) => (create, drop),
                (Some(_), None) => {
                    return Err(DbError::schema_source(
                        dir.join(format!("{stem}{DOWN_SUFFIX}")),
                        "missing drop definition",
                    ))
                }
                (None, _) => {
                    return Err(DbError::schema_source(
                        dir.join(format!("{stem}{UP_SUFFIX}")),
                        "missing create definition",
                    ))
                }
            };
            debug!(entity = name, "loaded schema definition");
            registry.register(EntityDefinition::new(name).on_create(create).on_drop(drop));
        }

        Ok(registry)
    }
}

fn entity_name(stem: &str) -> Option<&str> {
    let (order, name) = stem.split_once('_')?;
    let valid = !order.is_empty() && order.bytes().all(|b| b.is_ascii_digit()) && !name.is_empty();
    valid.then_some(name)
}
