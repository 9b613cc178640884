//! Schema management and relation registry
//!
//! Migrations run once at startup (`run_schema_migrations`), never from the
//! read/write hot path. The hot path may only check with `relation_exists`.

use crate::error::{MatrixError, MatrixResult};
use rusqlite::Connection;
use std::fs;
use std::path::Path;

/// Every relation the core touches. Table names are never taken from
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Matrices,
    MatricesStaging,
}

impl Relation {
    pub const ALL: [Relation; 2] = [Relation::Matrices, Relation::MatricesStaging];

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Matrices => "matrices",
            Relation::MatricesStaging => "matrices_staging",
        }
    }
}

/// Schema files compiled into the binary, used for in-memory stores
const EMBEDDED_SCHEMA: [(&str, &str); 2] = [
    ("01_matrices.sql", include_str!("../sql/01_matrices.sql")),
    ("02_matrices_staging.sql", include_str!("../sql/02_matrices_staging.sql")),
];

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir`, sorted by name (00_, 01_, ...),
/// and executes them. Every file uses IF NOT EXISTS so reruns are no-ops.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> MatrixResult<()> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(MatrixError::SchemaDirMissing(schema_dir.to_string()));
    }

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    let tx = conn.transaction()?;
    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        tx.execute_batch(&sql_content)?;
    }
    tx.commit()?;

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// Apply the embedded copy of `/sql/` (same files, same order)
pub fn apply_embedded_schema(conn: &Connection) -> MatrixResult<()> {
    for (name, sql) in EMBEDDED_SCHEMA {
        log::debug!("Applying embedded schema: {}", name);
        conn.execute_batch(sql)?;
    }
    Ok(())
}

/// Open a database file with WAL journaling
pub fn open_connection(db_path: impl AsRef<Path>) -> MatrixResult<Connection> {
    if let Some(parent) = db_path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    log::info!("📊 SQLite journal mode: {}", mode);

    Ok(conn)
}

/// Whether a relation exists
pub fn relation_exists(conn: &Connection, relation: Relation) -> MatrixResult<bool> {
    let mut stmt =
        conn.prepare_cached("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    Ok(stmt.exists([relation.as_str()])?)
}

/// Fail with `ProviderUnavailable` unless every relation is present
pub fn ensure_relations(conn: &Connection) -> MatrixResult<()> {
    for relation in Relation::ALL {
        if !relation_exists(conn, relation)? {
            return Err(MatrixError::ProviderUnavailable(format!(
                "relation '{}' is missing (run schema migrations)",
                relation.as_str()
            )));
        }
    }
    Ok(())
}
