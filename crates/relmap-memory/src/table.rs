//! Table definitions and constraint checks for the memory store.

use im::OrdMap;
use relmap_core::error::{
    SQLSTATE_FOREIGN_KEY_VIOLATION, SQLSTATE_NOT_NULL_VIOLATION, SQLSTATE_UNIQUE_VIOLATION,
};
use relmap_core::{
    AssociationTable, ColumnInfo, KeyPart, PkKey, QueryError, QueryErrorKind, Result, Row,
    SqlType, TableMeta, Value,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Committed or working rows of one table, keyed by primary key.
pub(crate) type Rows = OrdMap<PkKey, Vec<Value>>;

/// All tables of one database state. Cloning is O(1).
pub(crate) type Tables = im::HashMap<String, Rows>;

#[derive(Debug, Clone)]
pub(crate) struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub unique: bool,
    /// `(table, column)` this column references.
    pub foreign_key: Option<(String, String)>,
}

#[derive(Debug)]
pub(crate) struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub pk: Vec<usize>,
    pub auto_increment: Option<usize>,
    pub column_info: Arc<ColumnInfo>,
}

impl TableDef {
    pub fn from_meta(meta: &TableMeta) -> Self {
        let fields = &meta.schema.fields;
        let columns = fields
            .iter()
            .map(|f| ColumnDef {
                name: f.name.to_string(),
                sql_type: f.sql_type,
                nullable: f.nullable,
                unique: f.unique,
                foreign_key: f
                    .foreign_key_target()
                    .map(|(t, c)| (t.to_string(), c.to_string())),
            })
            .collect();
        Self::build(
            meta.name().to_string(),
            columns,
            fields
                .iter()
                .enumerate()
                .filter(|(_, f)| f.primary_key)
                .map(|(i, _)| i)
                .collect(),
            fields.iter().position(|f| f.auto_increment),
        )
    }

    pub fn from_association(assoc: &AssociationTable) -> Self {
        let columns = assoc
            .columns
            .iter()
            .map(|c| ColumnDef {
                name: c.name.to_string(),
                sql_type: c.sql_type,
                nullable: false,
                unique: false,
                foreign_key: Some((
                    c.references_table.to_string(),
                    c.references_column.to_string(),
                )),
            })
            .collect();
        Self::build(assoc.name.to_string(), columns, vec![0, 1], None)
    }

    fn build(
        name: String,
        columns: Vec<ColumnDef>,
        pk: Vec<usize>,
        auto_increment: Option<usize>,
    ) -> Self {
        let column_info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        Self {
            name,
            columns,
            pk,
            auto_increment,
            column_info,
        }
    }

    pub fn index_of(&self, column: &str) -> Result<usize> {
        self.column_info.index_of(column).ok_or_else(|| {
            QueryError::new(
                QueryErrorKind::NotFound,
                format!("no such column: {}.{column}", self.name),
            )
            .into()
        })
    }

    pub fn key_of(&self, row: &[Value]) -> Result<PkKey> {
        PkKey::from_values(self.pk.iter().map(|&i| &row[i])).map_err(|_| {
            QueryError::constraint(
                SQLSTATE_NOT_NULL_VIOLATION,
                format!("NOT NULL constraint failed: primary key of {}", self.name),
            )
            .into()
        })
    }

    pub fn to_row(&self, values: &[Value]) -> Row {
        Row::with_columns(Arc::clone(&self.column_info), values.to_vec())
    }

    /// Type and not-null checks for a complete row.
    pub fn check_row(&self, row: &[Value]) -> Result<()> {
        for (col, value) in self.columns.iter().zip(row) {
            if value.is_null() {
                if !col.nullable {
                    return Err(QueryError::constraint(
                        SQLSTATE_NOT_NULL_VIOLATION,
                        format!("NOT NULL constraint failed: {}.{}", self.name, col.name),
                    )
                    .into());
                }
            } else if !col.sql_type.accepts(value) {
                return Err(QueryError::new(
                    QueryErrorKind::Database,
                    format!(
                        "datatype mismatch: {}.{} is {}, got {}",
                        self.name,
                        col.name,
                        col.sql_type.sql_name(),
                        value.type_name()
                    ),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Table definitions plus the reverse foreign-key index.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    pub defs: BTreeMap<String, TableDef>,
}

impl Catalog {
    pub fn def(&self, table: &str) -> Result<&TableDef> {
        self.defs.get(table).ok_or_else(|| {
            QueryError::new(QueryErrorKind::NotFound, format!("no such table: {table}")).into()
        })
    }

    /// Reject a unique-column value already present in another row.
    pub fn check_unique(
        &self,
        def: &TableDef,
        rows: &Rows,
        row: &[Value],
        own_key: &PkKey,
    ) -> Result<()> {
        for (i, col) in def.columns.iter().enumerate() {
            if !col.unique || row[i].is_null() {
                continue;
            }
            let clash = rows
                .iter()
                .any(|(key, other)| key != own_key && other[i].sql_eq(&row[i]));
            if clash {
                return Err(unique_violation(def, col));
            }
        }
        Ok(())
    }

    /// Every non-null foreign key must point at an existing row.
    pub fn check_references(&self, tables: &Tables, def: &TableDef, row: &[Value]) -> Result<()> {
        for (i, col) in def.columns.iter().enumerate() {
            let Some((ref_table, ref_col)) = &col.foreign_key else {
                continue;
            };
            if row[i].is_null() {
                continue;
            }
            let target = self.def(ref_table)?;
            let idx = target.index_of(ref_col)?;
            let found = tables
                .get(ref_table)
                .is_some_and(|rows| rows.values().any(|r| r[idx].sql_eq(&row[i])));
            if !found {
                return Err(QueryError::constraint(
                    SQLSTATE_FOREIGN_KEY_VIOLATION,
                    format!(
                        "FOREIGN KEY constraint failed: {}.{} = {} has no match in {ref_table}.{ref_col}",
                        def.name,
                        col.name,
                        row[i].display()
                    ),
                )
                .into());
            }
        }
        Ok(())
    }

    /// A row may only be deleted when nothing references it.
    pub fn check_unreferenced(&self, tables: &Tables, def: &TableDef, row: &[Value]) -> Result<()> {
        for other in self.defs.values() {
            for (i, col) in other.columns.iter().enumerate() {
                let Some((ref_table, ref_col)) = &col.foreign_key else {
                    continue;
                };
                if ref_table != &def.name {
                    continue;
                }
                let referenced = &row[def.index_of(ref_col)?];
                let in_use = tables
                    .get(&other.name)
                    .is_some_and(|rows| rows.values().any(|r| r[i].sql_eq(referenced)));
                if in_use {
                    return Err(QueryError::constraint(
                        SQLSTATE_FOREIGN_KEY_VIOLATION,
                        format!(
                            "FOREIGN KEY constraint failed: {}.{} still references {}",
                            other.name,
                            col.name,
                            def.name
                        ),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Re-check unique and foreign-key constraints over a whole state.
    /// Used when merging a transaction's writes into newer committed data.
    pub fn validate(&self, tables: &Tables) -> Result<()> {
        let empty = Rows::new();
        for def in self.defs.values() {
            let rows = tables.get(&def.name).unwrap_or(&empty);
            for (i, col) in def.columns.iter().enumerate() {
                if col.unique {
                    let mut seen = HashSet::new();
                    for row in rows.values() {
                        if let Some(part) = KeyPart::from_value(&row[i]) {
                            if !seen.insert(part) {
                                return Err(unique_violation(def, col));
                            }
                        }
                    }
                }
            }
            for row in rows.values() {
                self.check_references(tables, def, row)?;
            }
        }
        Ok(())
    }
}

fn unique_violation(def: &TableDef, col: &ColumnDef) -> relmap_core::Error {
    QueryError::constraint(
        SQLSTATE_UNIQUE_VIOLATION,
        format!("UNIQUE constraint failed: {}.{}", def.name, col.name),
    )
    .into()
}
