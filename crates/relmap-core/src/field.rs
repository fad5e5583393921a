//! Field and entity schema definitions.

use crate::relationship::RelationshipInfo;
use crate::types::SqlType;
use crate::value::Value;

/// Metadata about one column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    /// Column name
    pub name: &'static str,
    /// SQL type for this field
    pub sql_type: SqlType,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is a primary key column
    pub primary_key: bool,
    /// Whether the store generates this value on insert
    pub auto_increment: bool,
    /// Whether this field has a unique constraint
    pub unique: bool,
    /// Foreign key reference (`table.column`)
    pub foreign_key: Option<&'static str>,
    /// Value applied when an entity is added without this column
    pub default: Option<Value>,
}

impl FieldInfo {
    /// Create a new non-nullable field.
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            unique: false,
            foreign_key: None,
            default: None,
        }
    }

    /// Shorthand for an auto-incrementing integer primary key.
    pub const fn id(name: &'static str) -> Self {
        Self::new(name, SqlType::Integer)
            .primary_key(true)
            .auto_increment(true)
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    pub const fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    /// Reference another table's column, written as `"table.column"`.
    pub const fn foreign_key(mut self, target: &'static str) -> Self {
        self.foreign_key = Some(target);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Split the foreign key into `(table, column)`.
    pub fn foreign_key_target(&self) -> Option<(&'static str, &'static str)> {
        self.foreign_key.and_then(|fk| fk.split_once('.'))
    }
}

/// Schema of one entity type: its table, ordered columns and relationships.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub table: &'static str,
    pub fields: Vec<FieldInfo>,
    pub relationships: Vec<RelationshipInfo>,
}

impl EntitySchema {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            fields: Vec::new(),
            relationships: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Look up a field by column name.
    pub fn get_field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a relationship by name.
    pub fn get_relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Primary key columns in declaration order.
    pub fn primary_key(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name)
            .collect()
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }
}
