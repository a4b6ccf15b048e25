//! SQL migration definitions for kbforge databases.
//!
//! Migrations are applied in order on database open. The task state database
//! and the graph database share one schema; each simply leaves the other's
//! tables empty.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Conversion task state",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS conversion_tasks (
    id           TEXT PRIMARY KEY,
    file_name    TEXT NOT NULL,
    source_path  TEXT NOT NULL,
    relative_dir TEXT NOT NULL,
    status       TEXT NOT NULL,
    batch_id     TEXT,
    last_error   TEXT,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversion_tasks_status ON conversion_tasks(status);
CREATE INDEX IF NOT EXISTS idx_conversion_tasks_batch ON conversion_tasks(batch_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Graph nodes and relationships",
            sql: r#"
CREATE TABLE IF NOT EXISTS graph_nodes (
    id              TEXT PRIMARY KEY,
    type            TEXT NOT NULL,
    properties_json TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_graph_nodes_type ON graph_nodes(type);

CREATE TABLE IF NOT EXISTS graph_relationships (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    source          TEXT NOT NULL,
    target          TEXT NOT NULL,
    type            TEXT NOT NULL,
    properties_json TEXT NOT NULL,
    structural_key  TEXT NOT NULL UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_graph_rel_source ON graph_relationships(source);
CREATE INDEX IF NOT EXISTS idx_graph_rel_target ON graph_relationships(target);
CREATE INDEX IF NOT EXISTS idx_graph_rel_type ON graph_relationships(type);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
