//! Schema Model Entities
//!
//! Tables, views and stored procedures that make up a schema model, plus the
//! identity tokens the change tracker keys on.
//!
//! Identity is explicit: every entity carries an [`EntityId`] allocated when
//! the value is built or deserialized. Two entities with identical fields but
//! separate construction are distinct; a clone shares its source's identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of process-unique entity identities
static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity token attached to an entity at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    /// Allocate a fresh identity
    pub fn allocate() -> Self {
        Self(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value (diagnostics only)
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of entity in a schema model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// The model aggregate itself
    Model,
    /// A table
    Table,
    /// A view
    View,
    /// A stored procedure
    Procedure,
}

impl EntityKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Table => "table",
            Self::View => "view",
            Self::Procedure => "procedure",
        }
    }

    /// Name of the model collection holding this kind
    pub fn collection_name(&self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Table => "tables",
            Self::View => "views",
            Self::Procedure => "procedures",
        }
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "model" => Some(Self::Model),
            "table" => Some(Self::Table),
            "view" => Some(Self::View),
            "procedure" => Some(Self::Procedure),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lightweight descriptor of a tracked entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    /// Identity of the entity
    pub id: EntityId,
    /// Kind of the entity
    pub kind: EntityKind,
    /// Display name (`schema.name` for schema objects)
    pub name: String,
}

impl EntityRef {
    /// Create a new descriptor
    pub fn new(id: EntityId, kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.name, self.id)
    }
}

/// Anything the change tracker can record
pub trait Trackable {
    /// Descriptor used as the tracker's key and payload
    fn entity_ref(&self) -> EntityRef;
}

impl Trackable for EntityRef {
    fn entity_ref(&self) -> EntityRef {
        self.clone()
    }
}

/// A schema object stored in a model collection
pub trait Entity:
    Clone + Send + Sync + Serialize + serde::de::DeserializeOwned + 'static
{
    /// Kind of this entity type
    const KIND: EntityKind;

    /// Identity of this instance
    fn id(&self) -> EntityId;

    /// Fully qualified name (`schema.name`)
    fn qualified_name(&self) -> String;
}

impl<T: Entity> Trackable for T {
    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.id(), T::KIND, self.qualified_name())
    }
}

fn qualify(schema: &str, name: &str) -> String {
    if schema.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", schema, name)
    }
}

/// A column of a table or view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Column {
    /// Create a non-nullable column
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: false,
            description: None,
        }
    }

    /// Mark the column nullable
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A database table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    #[serde(skip, default = "EntityId::allocate")]
    id: EntityId,
    pub schema: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl Table {
    /// Create an empty table with a fresh identity
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: EntityId::allocate(),
            schema: schema.into(),
            name: name.into(),
            description: None,
            columns: Vec::new(),
            row_count: None,
        }
    }

    /// Add a column (builder style)
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Set the description (builder style)
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

impl Entity for Table {
    const KIND: EntityKind = EntityKind::Table;

    fn id(&self) -> EntityId {
        self.id
    }

    fn qualified_name(&self) -> String {
        qualify(&self.schema, &self.name)
    }
}

/// A database view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    #[serde(skip, default = "EntityId::allocate")]
    id: EntityId,
    pub schema: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl View {
    /// Create an empty view with a fresh identity
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: EntityId::allocate(),
            schema: schema.into(),
            name: name.into(),
            description: None,
            definition: None,
            columns: Vec::new(),
        }
    }

    /// Set the SQL definition (builder style)
    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    /// Add a column (builder style)
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }
}

impl Entity for View {
    const KIND: EntityKind = EntityKind::View;

    fn id(&self) -> EntityId {
        self.id
    }

    fn qualified_name(&self) -> String {
        qualify(&self.schema, &self.name)
    }
}

/// Direction of a stored procedure parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterDirection {
    #[default]
    In,
    Out,
    InOut,
}

/// A stored procedure parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub direction: ParameterDirection,
}

impl Parameter {
    /// Create an input parameter
    pub fn input(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            direction: ParameterDirection::In,
        }
    }
}

/// A stored procedure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProcedure {
    #[serde(skip, default = "EntityId::allocate")]
    id: EntityId,
    pub schema: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

impl StoredProcedure {
    /// Create a procedure with no parameters and a fresh identity
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: EntityId::allocate(),
            schema: schema.into(),
            name: name.into(),
            description: None,
            parameters: Vec::new(),
            definition: None,
        }
    }

    /// Add a parameter (builder style)
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

impl Entity for StoredProcedure {
    const KIND: EntityKind = EntityKind::Procedure;

    fn id(&self) -> EntityId {
        self.id
    }

    fn qualified_name(&self) -> String {
        qualify(&self.schema, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_are_unique() {
        let a = Table::new("dbo", "orders");
        let b = Table::new("dbo", "orders");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.qualified_name(), b.qualified_name());
    }

    #[test]
    fn test_clone_keeps_identity() {
        let a = View::new("sales", "v_totals");
        let b = a.clone();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_deserialize_allocates_fresh_identity() {
        let table = Table::new("dbo", "customers").with_column(Column::new("id", "int"));
        let json = serde_json::to_string(&table).unwrap();
        assert!(!json.contains("\"id\":{"));

        let decoded: Table = serde_json::from_str(&json).unwrap();
        assert_ne!(decoded.id(), table.id());
        assert_eq!(decoded.name, "customers");
        assert_eq!(decoded.column("id").map(|c| c.data_type.as_str()), Some("int"));
    }

    #[test]
    fn test_entity_ref() {
        let proc = StoredProcedure::new("", "sp_refresh")
            .with_parameter(Parameter::input("since", "datetime"));
        let r = proc.entity_ref();
        assert_eq!(r.kind, EntityKind::Procedure);
        assert_eq!(r.name, "sp_refresh");
        assert_eq!(r.id, proc.id());
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            EntityKind::Model,
            EntityKind::Table,
            EntityKind::View,
            EntityKind::Procedure,
        ] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("index"), None);
        assert_eq!(EntityKind::View.collection_name(), "views");
    }
}
