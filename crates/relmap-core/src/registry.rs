//! Schema registry: every entity type's metadata, validated once.
//!
//! A registry is built at startup from explicit [`EntitySchema`]s and then
//! shared immutably (usually behind an `Arc`) by every session created from
//! the same factory. Validation resolves each relationship to the concrete
//! foreign-key column or link table it is backed by, so the session never
//! has to guess at runtime.

use crate::error::{Error, SchemaErrorKind};
use crate::field::{EntitySchema, FieldInfo};
use crate::relationship::{Cascade, LinkTableInfo, RelationshipInfo, RelationshipKind};
use crate::types::SqlType;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn check_identifier(kind: &str, name: &str) -> crate::Result<()> {
    static IDENT: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    let regex = IDENT
        .get_or_init(|| Regex::new(IDENTIFIER_PATTERN))
        .as_ref()
        .map_err(|e| Error::Custom(format!("identifier pattern failed to compile: {e}")))?;
    if regex.is_match(name) {
        Ok(())
    } else {
        Err(invalid(format!("invalid {kind} name '{name}'")))
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::schema(SchemaErrorKind::Invalid, message)
}

/// Where the foreign key backing a relationship lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeySide {
    /// On the declaring table, pointing at the related table's primary key.
    Local(&'static str),
    /// On the related table, pointing at the declaring table's primary key.
    Remote(&'static str),
    /// In a link table (many-to-many).
    Link(LinkTableInfo),
}

/// A relationship after validation.
#[derive(Debug, Clone)]
pub struct Relation {
    pub info: RelationshipInfo,
    pub cascade: Cascade,
    pub side: ForeignKeySide,
    /// Name of the relationship on the related table that mirrors this one.
    pub inverse: Option<&'static str>,
}

impl Relation {
    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn related_table(&self) -> &'static str {
        self.info.related_table
    }

    pub fn is_collection(&self) -> bool {
        self.info.kind.is_collection()
    }

    /// Parent-to-child relationships (the child row holds the key) are the
    /// ones that orphan and cascade-delete their children.
    pub fn owns_children(&self) -> bool {
        matches!(self.side, ForeignKeySide::Remote(_))
    }
}

/// A table registered in the schema, with its resolved relationships.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub schema: EntitySchema,
    pub primary_key: Vec<&'static str>,
    pub relations: Vec<Relation>,
}

impl TableMeta {
    pub fn name(&self) -> &'static str {
        self.schema.table
    }

    pub fn field(&self, column: &str) -> crate::Result<&FieldInfo> {
        self.schema.get_field(column).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::ColumnNotFound,
                format!("table '{}' has no column '{column}'", self.schema.table),
            )
        })
    }

    pub fn relation(&self, name: &str) -> crate::Result<&Relation> {
        self.relations
            .iter()
            .find(|r| r.info.name == name)
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::RelationshipNotFound,
                    format!(
                        "table '{}' has no relationship '{name}'",
                        self.schema.table
                    ),
                )
            })
    }

    /// The primary key column when the key is a single column.
    pub fn single_pk(&self) -> Option<&'static str> {
        match self.primary_key.as_slice() {
            [pk] => Some(pk),
            _ => None,
        }
    }

    /// `(column, referenced table, referenced column)` for each FK field.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&'static str, &'static str, &'static str)> {
        self.schema.fields.iter().filter_map(|f| {
            f.foreign_key_target()
                .map(|(table, column)| (f.name, table, column))
        })
    }
}

/// One column of an association table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationColumn {
    pub name: &'static str,
    pub references_table: &'static str,
    pub references_column: &'static str,
    pub sql_type: SqlType,
}

/// A many-to-many link table. Its primary key is both columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationTable {
    pub name: &'static str,
    pub columns: [AssociationColumn; 2],
}

/// Validated, immutable metadata for all entity types.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: Vec<TableMeta>,
    index: HashMap<&'static str, usize>,
    associations: Vec<AssociationTable>,
}

/// Collects schemas before validation.
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    entities: Vec<EntitySchema>,
}

impl SchemaRegistryBuilder {
    #[must_use]
    pub fn entity(mut self, schema: EntitySchema) -> Self {
        self.entities.push(schema);
        self
    }

    /// Validate every schema and resolve relationships.
    pub fn build(self) -> crate::Result<SchemaRegistry> {
        SchemaRegistry::new(self.entities)
    }
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Validate and index a set of schemas.
    pub fn new(entities: Vec<EntitySchema>) -> crate::Result<Self> {
        let mut index = HashMap::new();
        for (i, schema) in entities.iter().enumerate() {
            check_identifier("table", schema.table)?;
            if index.insert(schema.table, i).is_some() {
                return Err(invalid(format!("table '{}' registered twice", schema.table)));
            }
            validate_fields(schema)?;
        }
        for schema in &entities {
            for field in &schema.fields {
                if let Some(fk) = field.foreign_key {
                    let (table, column) = field.foreign_key_target().ok_or_else(|| {
                        invalid(format!(
                            "foreign key '{fk}' on {}.{} must be written as table.column",
                            schema.table, field.name
                        ))
                    })?;
                    let target = index.get(table).map(|&i| &entities[i]).ok_or_else(|| {
                        invalid(format!(
                            "{}.{} references unknown table '{table}'",
                            schema.table, field.name
                        ))
                    })?;
                    if target.get_field(column).is_none() {
                        return Err(invalid(format!(
                            "{}.{} references unknown column '{fk}'",
                            schema.table, field.name
                        )));
                    }
                }
            }
        }

        let mut tables = Vec::with_capacity(entities.len());
        for schema in &entities {
            let mut relations = Vec::with_capacity(schema.relationships.len());
            for rel in &schema.relationships {
                relations.push(resolve_relation(schema, rel, &entities, &index)?);
            }
            tables.push(TableMeta {
                primary_key: schema.primary_key(),
                schema: schema.clone(),
                relations,
            });
        }

        let registry = Self {
            associations: collect_associations(&tables, &index)?,
            tables,
            index,
        };
        registry.validate_inverses()?;

        tracing::debug!(
            tables = registry.tables.len(),
            associations = registry.associations.len(),
            "Schema registry built"
        );
        Ok(registry)
    }

    pub fn table(&self, name: &str) -> crate::Result<&TableMeta> {
        self.index
            .get(name)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::TableNotFound,
                    format!("table '{name}' is not registered"),
                )
            })
    }

    /// Tables in registration order.
    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.iter()
    }

    pub fn associations(&self) -> &[AssociationTable] {
        &self.associations
    }

    /// The relation named by `back_populates` on the related table.
    pub fn inverse_of(&self, relation: &Relation) -> crate::Result<Option<&Relation>> {
        match relation.inverse {
            Some(name) => Ok(Some(self.table(relation.related_table())?.relation(name)?)),
            None => Ok(None),
        }
    }

    fn validate_inverses(&self) -> crate::Result<()> {
        for table in &self.tables {
            for rel in &table.relations {
                let Some(back) = rel.inverse else { continue };
                let target = self.table(rel.related_table())?;
                let other = target.relation(back).map_err(|_| {
                    invalid(format!(
                        "{}.{} back_populates unknown relationship '{}.{back}'",
                        table.name(),
                        rel.name(),
                        target.name()
                    ))
                })?;
                if other.related_table() != table.name() {
                    return Err(invalid(format!(
                        "{}.{} back_populates '{}.{back}', which points at '{}'",
                        table.name(),
                        rel.name(),
                        target.name(),
                        other.related_table()
                    )));
                }
                if other.info.kind != rel.info.kind.inverse() {
                    return Err(invalid(format!(
                        "{}.{} ({:?}) cannot back-populate {}.{back} ({:?})",
                        table.name(),
                        rel.name(),
                        rel.info.kind,
                        target.name(),
                        other.info.kind
                    )));
                }
                if other.inverse.is_some_and(|n| n != rel.name()) {
                    return Err(invalid(format!(
                        "{}.{back} back-populates a different relationship than {}.{}",
                        target.name(),
                        table.name(),
                        rel.name()
                    )));
                }
                let consistent = match (rel.side, other.side) {
                    (ForeignKeySide::Local(a), ForeignKeySide::Remote(b))
                    | (ForeignKeySide::Remote(a), ForeignKeySide::Local(b)) => a == b,
                    (ForeignKeySide::Link(a), ForeignKeySide::Link(b)) => a == b.flipped(),
                    _ => false,
                };
                if !consistent {
                    return Err(invalid(format!(
                        "{}.{} and {}.{back} disagree on their foreign key",
                        table.name(),
                        rel.name(),
                        target.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_fields(schema: &EntitySchema) -> crate::Result<()> {
    if schema.fields.is_empty() {
        return Err(invalid(format!("table '{}' has no columns", schema.table)));
    }
    let mut seen = std::collections::HashSet::new();
    for field in &schema.fields {
        check_identifier("column", field.name)?;
        if !seen.insert(field.name) {
            return Err(invalid(format!(
                "column '{}.{}' declared twice",
                schema.table, field.name
            )));
        }
        if field.auto_increment && !(field.primary_key && field.sql_type == SqlType::Integer) {
            return Err(invalid(format!(
                "{}.{}: auto_increment requires an INTEGER primary key",
                schema.table, field.name
            )));
        }
        if field.primary_key && field.nullable {
            return Err(invalid(format!(
                "{}.{}: primary key columns cannot be nullable",
                schema.table, field.name
            )));
        }
        if let Some(default) = &field.default {
            if !field.sql_type.accepts(default) {
                return Err(invalid(format!(
                    "{}.{}: default {} does not fit {}",
                    schema.table,
                    field.name,
                    default.type_name(),
                    field.sql_type.sql_name()
                )));
            }
        }
    }
    if schema.primary_key().is_empty() {
        return Err(invalid(format!("table '{}' has no primary key", schema.table)));
    }
    let mut rel_names = std::collections::HashSet::new();
    for rel in &schema.relationships {
        check_identifier("relationship", rel.name)?;
        if !rel_names.insert(rel.name) || schema.get_field(rel.name).is_some() {
            return Err(invalid(format!(
                "relationship name '{}.{}' collides with another attribute",
                schema.table, rel.name
            )));
        }
    }
    Ok(())
}

fn resolve_relation(
    schema: &EntitySchema,
    rel: &RelationshipInfo,
    entities: &[EntitySchema],
    index: &HashMap<&'static str, usize>,
) -> crate::Result<Relation> {
    let here = format!("{}.{}", schema.table, rel.name);
    let target = index
        .get(rel.related_table)
        .map(|&i| &entities[i])
        .ok_or_else(|| {
            invalid(format!(
                "{here} targets unknown table '{}'",
                rel.related_table
            ))
        })?;
    let cascade = rel.cascade_policy()?;

    // FK column on `owner` that references `referenced`, either the declared
    // one or the only one present.
    let fk_column = |owner: &EntitySchema,
                     referenced: &EntitySchema,
                     declared: Option<&'static str>|
     -> crate::Result<&'static str> {
        if let Some(column) = declared {
            let field = owner.get_field(column).ok_or_else(|| {
                invalid(format!("{here}: '{}' has no column '{column}'", owner.table))
            })?;
            if let Some((table, _)) = field.foreign_key_target() {
                if table != referenced.table {
                    return Err(invalid(format!(
                        "{here}: {}.{column} references '{table}', not '{}'",
                        owner.table, referenced.table
                    )));
                }
            }
            return Ok(column);
        }
        let mut candidates = owner
            .fields
            .iter()
            .filter(|f| f.foreign_key_target().is_some_and(|(t, _)| t == referenced.table));
        match (candidates.next(), candidates.next()) {
            (Some(f), None) => Ok(f.name),
            (None, _) => Err(invalid(format!(
                "{here}: no foreign key from '{}' to '{}'",
                owner.table, referenced.table
            ))),
            (Some(_), Some(_)) => Err(invalid(format!(
                "{here}: several foreign keys from '{}' to '{}'; name one explicitly",
                owner.table, referenced.table
            ))),
        }
    };
    let single_pk = |table: &EntitySchema| -> crate::Result<()> {
        if table.primary_key().len() == 1 {
            Ok(())
        } else {
            Err(invalid(format!(
                "{here}: '{}' must have a single-column primary key",
                table.table
            )))
        }
    };

    let side = match rel.kind {
        RelationshipKind::ManyToOne => {
            single_pk(target)?;
            ForeignKeySide::Local(fk_column(schema, target, rel.local_key)?)
        }
        RelationshipKind::OneToMany => {
            single_pk(schema)?;
            ForeignKeySide::Remote(fk_column(target, schema, rel.remote_key)?)
        }
        RelationshipKind::OneToOne => match (rel.local_key, rel.remote_key) {
            (Some(_), Some(_)) => {
                return Err(invalid(format!(
                    "{here}: set either local_key or remote_key, not both"
                )));
            }
            (Some(col), None) => {
                single_pk(target)?;
                ForeignKeySide::Local(fk_column(schema, target, Some(col))?)
            }
            (None, Some(col)) => {
                single_pk(schema)?;
                ForeignKeySide::Remote(fk_column(target, schema, Some(col))?)
            }
            (None, None) => {
                if let Ok(col) = fk_column(schema, target, None) {
                    single_pk(target)?;
                    ForeignKeySide::Local(col)
                } else {
                    single_pk(schema)?;
                    ForeignKeySide::Remote(fk_column(target, schema, None)?)
                }
            }
        },
        RelationshipKind::ManyToMany => {
            let link = rel
                .link_table
                .ok_or_else(|| invalid(format!("{here}: many-to-many needs a link table")))?;
            check_identifier("link table", link.table_name)?;
            check_identifier("link column", link.local_column)?;
            check_identifier("link column", link.remote_column)?;
            if link.local_column == link.remote_column {
                return Err(invalid(format!("{here}: link columns must differ")));
            }
            if index.contains_key(link.table_name) {
                return Err(invalid(format!(
                    "{here}: link table '{}' is also an entity table",
                    link.table_name
                )));
            }
            single_pk(schema)?;
            single_pk(target)?;
            ForeignKeySide::Link(link)
        }
    };

    if cascade.delete_orphan && !matches!(side, ForeignKeySide::Remote(_)) {
        return Err(invalid(format!(
            "{here}: delete-orphan is only supported on one-to-many and parent-side one-to-one relationships"
        )));
    }

    Ok(Relation {
        info: *rel,
        cascade,
        side,
        inverse: rel.back_populates,
    })
}

fn collect_associations(
    tables: &[TableMeta],
    index: &HashMap<&'static str, usize>,
) -> crate::Result<Vec<AssociationTable>> {
    let mut out: Vec<AssociationTable> = Vec::new();
    for table in tables {
        for rel in &table.relations {
            let ForeignKeySide::Link(link) = rel.side else {
                continue;
            };
            let column = |name: &'static str, referenced: &TableMeta| -> crate::Result<AssociationColumn> {
                let pk = referenced
                    .single_pk()
                    .ok_or_else(|| invalid(format!("'{}' needs a single-column key", referenced.name())))?;
                Ok(AssociationColumn {
                    name,
                    references_table: referenced.name(),
                    references_column: pk,
                    sql_type: referenced.field(pk)?.sql_type,
                })
            };
            let related = index
                .get(rel.related_table())
                .map(|&i| &tables[i])
                .ok_or_else(|| invalid(format!("unknown table '{}'", rel.related_table())))?;
            let assoc = AssociationTable {
                name: link.table_name,
                columns: [column(link.local_column, table)?, column(link.remote_column, related)?],
            };
            match out.iter().find(|a| a.name == assoc.name) {
                None => out.push(assoc),
                Some(existing) => {
                    let same = existing.columns == assoc.columns
                        || existing.columns == [assoc.columns[1], assoc.columns[0]];
                    if !same {
                        return Err(invalid(format!(
                            "link table '{}' is declared with conflicting columns",
                            assoc.name
                        )));
                    }
                }
            }
        }
    }
    Ok(out)
}
