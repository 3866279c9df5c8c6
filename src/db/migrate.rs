//! Startup schema migrations.
//!
//! Migration files live in one directory and are named
//! `{num}_{sub}_{db}_{schema}_{table}.sql`. They are applied in lexicographic
//! filename order. `db = "all"` migrations always apply; the rest apply only
//! when `(db, schema)` matches the configured feed and the table is one of
//! the configured tables or views. `${POSTGRES_SCHEMA}` is substituted
//! textually before execution, and each file runs in an autocommit session.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use sqlx::PgPool;
use walkdir::WalkDir;

use crate::config::Settings;

#[derive(Debug, thiserror::Error)]
#[error("no applicable migrations found in {0}")]
pub struct NoMigrations(pub PathBuf);

#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub file_name: String,
    pub path: PathBuf,
    pub db: String,
    pub schema: String,
    pub table: String,
}

fn migration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<num>\d+)_(?P<sub>\d+)_(?P<db>[A-Za-z0-9-]+)_(?P<schema>[A-Za-z0-9-]+)_(?P<table>[A-Za-z0-9_]+)\.sql$",
        )
        .unwrap()
    })
}

/// All migration files in `dir`, sorted by filename.
pub fn discover(dir: &Path) -> Result<Vec<MigrationFile>> {
    let mut migrations = Vec::new();

    for entry in WalkDir::new(dir).max_depth(1).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("scanning migrations dir {}", dir.display())))
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(caps) = migration_re().captures(file_name) else {
            continue;
        };

        migrations.push(MigrationFile {
            file_name: file_name.to_string(),
            path: entry.path().to_path_buf(),
            db: caps["db"].to_string(),
            schema: caps["schema"].to_string(),
            table: caps["table"].to_string(),
        });
    }

    migrations.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(migrations)
}

fn applies(migration: &MigrationFile, settings: &Settings, tables: &[String], views: &[String]) -> bool {
    if migration.db == "all" {
        return true;
    }
    migration.db == settings.parquet_s3_database
        && migration.schema == settings.parquet_s3_schema
        && (tables.iter().any(|t| *t == migration.table)
            || views.iter().any(|v| *v == migration.table))
}

fn substitute_schema(sql: &str, postgres_schema: &str) -> String {
    sql.replace("${POSTGRES_SCHEMA}", postgres_schema)
}

/// Apply every applicable migration. Returns how many ran.
pub async fn run_migrations(
    pool: &PgPool,
    settings: &Settings,
    tables: &[String],
    views: &[String],
) -> Result<usize> {
    let all = discover(&settings.migrations_dir)?;
    let applicable: Vec<&MigrationFile> = all
        .iter()
        .filter(|m| applies(m, settings, tables, views))
        .collect();

    if applicable.is_empty() && !tables.is_empty() {
        return Err(NoMigrations(settings.migrations_dir.clone()).into());
    }

    for migration in &applicable {
        let raw = std::fs::read_to_string(&migration.path)
            .with_context(|| format!("reading migration {}", migration.path.display()))?;
        let sql = substitute_schema(&raw, &settings.postgres_schema);

        tracing::info!("applying migration {}", migration.file_name);
        sqlx::raw_sql(&sql)
            .execute(pool)
            .await
            .with_context(|| format!("applying migration {}", migration.file_name))?;
    }

    tracing::info!("migrations complete ({} applied)", applicable.len());
    Ok(applicable.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), "SELECT 1;").unwrap();
    }

    #[test]
    fn test_discover_sorts_and_parses() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0002_0_public-postgres_farcaster_casts.sql");
        write(dir.path(), "0001_0_all_all_parquet_import_tracking.sql");
        write(dir.path(), "0001_1_all_all_parquet_import_tracking.sql");
        write(dir.path(), "README.md"); // ignored
        write(dir.path(), "0003_0_bad name.sql"); // ignored, space

        let found = discover(dir.path()).unwrap();
        let names: Vec<&str> = found.iter().map(|m| m.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "0001_0_all_all_parquet_import_tracking.sql",
                "0001_1_all_all_parquet_import_tracking.sql",
                "0002_0_public-postgres_farcaster_casts.sql",
            ]
        );

        assert_eq!(found[0].db, "all");
        assert_eq!(found[2].db, "public-postgres");
        assert_eq!(found[2].schema, "farcaster");
        assert_eq!(found[2].table, "casts");
    }

    #[test]
    fn test_applies_filtering() {
        let settings = Settings::default();
        let tables = vec!["casts".to_string()];
        let views = vec!["profiles_with_verifications".to_string()];

        let m = |db: &str, schema: &str, table: &str| MigrationFile {
            file_name: String::new(),
            path: PathBuf::new(),
            db: db.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
        };

        // "all" is unconditional
        assert!(applies(&m("all", "all", "anything"), &settings, &tables, &views));
        // matching source + configured table
        assert!(applies(
            &m("public-postgres", "farcaster", "casts"),
            &settings,
            &tables,
            &views
        ));
        // matching source + configured view
        assert!(applies(
            &m("public-postgres", "farcaster", "profiles_with_verifications"),
            &settings,
            &tables,
            &views
        ));
        // unconfigured table
        assert!(!applies(
            &m("public-postgres", "farcaster", "reactions"),
            &settings,
            &tables,
            &views
        ));
        // wrong source
        assert!(!applies(
            &m("public-postgres", "nindexer", "casts"),
            &settings,
            &tables,
            &views
        ));
    }

    #[test]
    fn test_substitute_schema() {
        let sql = "CREATE TABLE ${POSTGRES_SCHEMA}.casts (id BIGINT); \
                   COMMENT ON TABLE ${POSTGRES_SCHEMA}.casts IS 'x';";
        let out = substitute_schema(sql, "neynar");
        assert_eq!(
            out,
            "CREATE TABLE neynar.casts (id BIGINT); COMMENT ON TABLE neynar.casts IS 'x';"
        );
    }
}
