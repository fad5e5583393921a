//! `CREATE TABLE` and `DROP TABLE` generation from a schema registry.

use crate::types::sql_literal;
use relmap_core::{AssociationTable, FieldInfo, SchemaRegistry, TableMeta, quote_ident};

/// DDL for every entity table followed by every association table.
pub fn create_all_sql(registry: &SchemaRegistry) -> Vec<String> {
    registry
        .tables()
        .map(create_table_sql)
        .chain(registry.associations().iter().map(create_association_sql))
        .collect()
}

/// `DROP TABLE` for every association table, then every entity table in
/// reverse registration order.
pub fn drop_all_sql(registry: &SchemaRegistry) -> Vec<String> {
    let tables: Vec<&TableMeta> = registry.tables().collect();
    registry
        .associations()
        .iter()
        .map(|assoc| assoc.name)
        .chain(tables.iter().rev().map(|meta| meta.name()))
        .map(|name| format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
        .collect()
}

pub fn create_table_sql(meta: &TableMeta) -> String {
    let fields = &meta.schema.fields;
    let inline_pk = meta.primary_key.len() == 1;
    let mut parts: Vec<String> = fields
        .iter()
        .map(|field| column_sql(field, inline_pk))
        .collect();
    if !inline_pk {
        let cols: Vec<String> = meta.primary_key.iter().map(|c| quote_ident(c)).collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(meta.name()),
        parts.join(", ")
    )
}

fn column_sql(field: &FieldInfo, inline_pk: bool) -> String {
    let mut sql = format!("{} {}", quote_ident(field.name), field.sql_type.sql_name());
    if field.primary_key && inline_pk {
        sql.push_str(" PRIMARY KEY");
        if field.auto_increment {
            sql.push_str(" AUTOINCREMENT");
        }
    }
    if !field.nullable && !field.auto_increment {
        sql.push_str(" NOT NULL");
    }
    if field.unique && !field.primary_key {
        sql.push_str(" UNIQUE");
    }
    if let Some(default) = &field.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&sql_literal(default));
    }
    if let Some((table, column)) = field.foreign_key_target() {
        sql.push_str(&format!(
            " REFERENCES {}({})",
            quote_ident(table),
            quote_ident(column)
        ));
    }
    sql
}

pub fn create_association_sql(assoc: &AssociationTable) -> String {
    let columns: Vec<String> = assoc
        .columns
        .iter()
        .map(|c| {
            format!(
                "{} {} NOT NULL REFERENCES {}({})",
                quote_ident(c.name),
                c.sql_type.sql_name(),
                quote_ident(c.references_table),
                quote_ident(c.references_column)
            )
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}, {}))",
        quote_ident(assoc.name),
        columns.join(", "),
        quote_ident(assoc.columns[0].name),
        quote_ident(assoc.columns[1].name)
    )
}
