//! Reflected table metadata.
//!
//! Column names, types, and the primary key are discovered from the live
//! database at startup, built once into a read-only map, and shared by
//! reference for the life of the process. The `updated_at`-gated merge needs
//! that column on every target table, so its absence is fatal here rather
//! than a runtime surprise mid-import.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sqlx::{PgPool, Row as _};

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    /// information_schema `data_type`, e.g. "bigint", "timestamp without time zone", "ARRAY".
    pub data_type: String,
    /// Underlying type name, e.g. "_text" for text[].
    pub udt_name: String,
}

impl ColumnInfo {
    /// SQL cast applied to this column's bind placeholders. Binding every
    /// parameter through an explicit cast keeps NULLs and cross-type binds
    /// (int8 → int4, float8 → numeric, text → jsonb) unambiguous.
    pub fn cast_suffix(&self) -> String {
        match self.data_type.as_str() {
            "ARRAY" => format!("::{}[]", self.udt_name.trim_start_matches('_')),
            "USER-DEFINED" => format!("::\"{}\"", self.udt_name),
            _ => format!("::{}", self.data_type),
        }
    }

    /// True for json / jsonb columns, whose values bind as serialized text.
    pub fn is_json(&self) -> bool {
        matches!(self.data_type.as_str(), "json" | "jsonb")
    }
}

#[derive(Debug)]
pub struct TableSchema {
    pub pg_schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.pg_schema, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == name)
    }
}

async fn reflect_table(pool: &PgPool, pg_schema: &str, name: &str) -> Result<TableSchema> {
    let rows = sqlx::query(
        "SELECT column_name, data_type, udt_name
         FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2
         ORDER BY ordinal_position",
    )
    .bind(pg_schema)
    .bind(name)
    .fetch_all(pool)
    .await
    .with_context(|| format!("reflecting columns of {pg_schema}.{name}"))?;

    if rows.is_empty() {
        bail!("table {pg_schema}.{name} does not exist (missing migration?)");
    }

    let columns: Vec<ColumnInfo> = rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.get("column_name"),
            data_type: row.get("data_type"),
            udt_name: row.get("udt_name"),
        })
        .collect();

    let pk_rows = sqlx::query(
        "SELECT a.attname
         FROM pg_index i
         JOIN pg_attribute a
           ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
         WHERE i.indrelid = ($1)::regclass AND i.indisprimary
         ORDER BY array_position(i.indkey::int2[], a.attnum)",
    )
    .bind(format!("\"{pg_schema}\".\"{name}\""))
    .fetch_all(pool)
    .await
    .with_context(|| format!("reflecting primary key of {pg_schema}.{name}"))?;

    let primary_key: Vec<String> = pk_rows.iter().map(|row| row.get("attname")).collect();
    if primary_key.is_empty() {
        bail!("table {pg_schema}.{name} has no primary key; the merge rule requires one");
    }
    if !columns.iter().any(|c| c.name == "updated_at") {
        bail!("table {pg_schema}.{name} has no updated_at column; the merge rule requires one");
    }

    Ok(TableSchema {
        pg_schema: pg_schema.to_string(),
        name: name.to_string(),
        columns,
        primary_key,
    })
}

/// Reflect every target table once, at startup.
pub async fn reflect_tables(
    pool: &PgPool,
    pg_schema: &str,
    names: &[String],
) -> Result<HashMap<String, Arc<TableSchema>>> {
    let mut tables = HashMap::with_capacity(names.len());
    for name in names {
        let schema = reflect_table(pool, pg_schema, name).await?;
        tracing::debug!(
            "reflected {} ({} columns, pk [{}])",
            schema.qualified(),
            schema.columns.len(),
            schema.primary_key.join(", ")
        );
        tables.insert(name.clone(), Arc::new(schema));
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn col(name: &str, data_type: &str, udt: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: udt.to_string(),
        }
    }

    #[test]
    fn test_cast_suffix() {
        assert_eq!(col("id", "bigint", "int8").cast_suffix(), "::bigint");
        assert_eq!(
            col("ts", "timestamp without time zone", "timestamp").cast_suffix(),
            "::timestamp without time zone"
        );
        assert_eq!(col("e", "jsonb", "jsonb").cast_suffix(), "::jsonb");
        assert_eq!(col("m", "ARRAY", "_text").cast_suffix(), "::text[]");
        assert_eq!(col("c", "USER-DEFINED", "citext").cast_suffix(), "::\"citext\"");
    }

    #[test]
    fn test_is_json() {
        assert!(col("e", "jsonb", "jsonb").is_json());
        assert!(col("e", "json", "json").is_json());
        assert!(!col("e", "text", "text").is_json());
    }

    #[test]
    fn test_qualified_and_pk_lookup() {
        let schema = TableSchema {
            pg_schema: "public".to_string(),
            name: "casts".to_string(),
            columns: vec![col("hash", "bytea", "bytea"), col("updated_at", "timestamp without time zone", "timestamp")],
            primary_key: vec!["hash".to_string()],
        };
        assert_eq!(schema.qualified(), "\"public\".\"casts\"");
        assert!(schema.is_primary_key("hash"));
        assert!(!schema.is_primary_key("updated_at"));
        assert!(schema.column("hash").is_some());
        assert!(schema.column("missing").is_none());
    }
}
