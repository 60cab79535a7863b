//! SQL migration definitions for the StoryCrew queue database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

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
            description: "Initial schema: queue_items",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per submitted job; `seq` gives FIFO order
CREATE TABLE IF NOT EXISTS queue_items (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    status        TEXT NOT NULL,
    pipeline_type TEXT NOT NULL,
    project_id    TEXT NOT NULL,
    enqueued_at   TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    job_json      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status, seq);
CREATE INDEX IF NOT EXISTS idx_queue_items_project ON queue_items(project_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Record which worker claimed each item",
            sql: r#"
ALTER TABLE queue_items ADD COLUMN claimed_by TEXT;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Keep the reason an unreadable item was failed",
            sql: r#"
ALTER TABLE queue_items ADD COLUMN last_error TEXT;

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_ascending() {
        let versions: Vec<u32> = all_migrations().iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.first(), Some(&1));
    }

    #[test]
    fn each_migration_records_its_version() {
        for migration in all_migrations() {
            let marker = format!("VALUES ({})", migration.version);
            assert!(
                migration.sql.contains(&marker),
                "migration v{} does not record itself",
                migration.version
            );
        }
    }
}
