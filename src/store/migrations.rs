//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` reads the
//! highest applied version from `_migrations` and applies the newer ones in
//! order.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "templates",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                task_type TEXT NOT NULL
                    CHECK (task_type IN ('manual', 'manual_access_request', 'automated_access_request')),
                config TEXT NOT NULL,
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_template_dependencies (
                task_template_id TEXT NOT NULL REFERENCES task_templates(id) ON DELETE CASCADE,
                depends_on_id TEXT NOT NULL REFERENCES task_templates(id),
                position INTEGER NOT NULL,
                PRIMARY KEY (task_template_id, depends_on_id)
            );
            CREATE INDEX IF NOT EXISTS idx_task_deps_depends_on
                ON task_template_dependencies(depends_on_id);

            CREATE TABLE IF NOT EXISTS onboarding_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS onboarding_template_tasks (
                onboarding_template_id TEXT NOT NULL
                    REFERENCES onboarding_templates(id) ON DELETE CASCADE,
                task_template_id TEXT NOT NULL REFERENCES task_templates(id),
                task_order INTEGER NOT NULL,
                PRIMARY KEY (onboarding_template_id, task_template_id)
            );
            CREATE INDEX IF NOT EXISTS idx_template_tasks_task
                ON onboarding_template_tasks(task_template_id);
        "#,
    },
    Migration {
        version: 2,
        name: "users",
        sql: r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('admin', 'user')),
                attributes TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "onboarding_instances",
        sql: r#"
            CREATE TABLE IF NOT EXISTS onboarding_instances (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                assigned_by TEXT NOT NULL,
                onboarding_template_id TEXT NOT NULL REFERENCES onboarding_templates(id),
                status TEXT NOT NULL DEFAULT 'not_started'
                    CHECK (status IN ('not_started', 'in_progress', 'completed')),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instances_user ON onboarding_instances(user_id);

            CREATE TABLE IF NOT EXISTS task_instances (
                id TEXT PRIMARY KEY,
                onboarding_instance_id TEXT NOT NULL
                    REFERENCES onboarding_instances(id) ON DELETE CASCADE,
                task_template_id TEXT NOT NULL REFERENCES task_templates(id),
                status TEXT NOT NULL
                    CHECK (status IN ('not_started', 'blocked', 'in_progress', 'completed')),
                ticket_info TEXT,
                issue_key TEXT,
                task_started_at TEXT,
                task_completed_at TEXT,
                ticket_created_at TEXT,
                ticket_closed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (onboarding_instance_id, task_template_id)
            );
            CREATE INDEX IF NOT EXISTS idx_task_instances_template
                ON task_instances(task_template_id);
        "#,
    },
];

/// Create the tracking table and apply every migration newer than the
/// recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> (libsql::Database, Connection) {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let conn = db.connect().unwrap();
        (db, conn)
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_db, conn) = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[tokio::test]
    async fn migration_future_is_send() {
        fn assert_send<F: std::future::Future + Send>(f: F) -> F {
            f
        }
        let (_db, conn) = memory_conn().await;
        assert_send(run_migrations(&conn)).await.unwrap();
    }

    #[test]
    fn versions_are_strictly_increasing() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }
}
