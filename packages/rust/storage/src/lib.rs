//! libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a local libSQL database. The same schema
//! backs two files:
//! - the task state database (conversion tasks, via [`TaskStore`])
//! - the graph database (nodes and relationships, via [`GraphStore`])
//!
//! [`JsonTaskStore`] is a file-based alternative for the task state.
//!
//! **Access rules:**
//! - pipeline commands: read-write via [`Storage::open`]
//! - `status` / `graph stats`: read-only via [`Storage::open_readonly`]

mod graph;
mod migrations;
mod tasks;

use std::path::Path;

use kbforge_shared::{KbError, Result};
use libsql::{Connection, Database, params};

pub use graph::{GraphBatch, GraphStats, GraphStore};
pub use tasks::{JsonTaskStore, TaskStore};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KbError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KbError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        KbError::Storage(format!("migration v{} failed: {e}", migration.version))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(KbError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn db_err(e: libsql::Error) -> KbError {
    KbError::Storage(e.to_string())
}
