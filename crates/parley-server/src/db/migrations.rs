//! Database migration system for Parley Server
//!
//! Migrations are embedded SQL, applied in version order and recorded in
//! the `_migrations` table so each one runs exactly once per database.

use super::Database;
use super::DatabaseError;
use tracing::{debug, info, instrument};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (must be unique and incrementing)
    pub version: i64,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to execute for the migration
    pub sql: &'static str,
}

/// Relay schema: accounts and the message log
pub mod schema {
    use super::Migration;

    /// Users and messages
    pub const V0001_INITIAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,            -- Argon2id PHC string
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS messages (
    message_id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id INTEGER NOT NULL,
    receiver_id INTEGER NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

    /// Conversation lookups by participant
    pub const V0002_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id, created_at);
"#;

    /// Get all migrations in order
    pub fn all() -> Vec<Migration> {
        vec![
            Migration {
                version: 1,
                description: "Initial schema: users and messages",
                sql: V0001_INITIAL_SCHEMA,
            },
            Migration {
                version: 2,
                description: "Index messages by participant",
                sql: V0002_MESSAGE_INDEXES,
            },
        ]
    }
}

/// Migration runner for applying migrations to a database
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl MigrationRunner {
    /// Create a new migration runner with the given migrations
    pub fn new(migrations: Vec<Migration>) -> Self {
        let mut sorted = migrations;
        sorted.sort_by_key(|m| m.version);
        Self { migrations: sorted }
    }

    /// Create a runner for the relay schema
    pub fn schema() -> Self {
        Self::new(schema::all())
    }

    /// Run all pending migrations on the database
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn run(&self, db: &Database) -> Result<Vec<i64>, DatabaseError> {
        if let Some(persistent) = db.persistent_connection() {
            let conn = persistent.lock().await;
            self.run_with_connection(&conn).await
        } else {
            let conn = db.connect()?;
            self.run_with_connection(&conn).await
        }
    }

    async fn run_with_connection(
        &self,
        conn: &libsql::Connection,
    ) -> Result<Vec<i64>, DatabaseError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to create migrations table: {}", e))
        })?;

        let mut applied: Vec<i64> = Vec::new();
        let mut rows = conn
            .query("SELECT version FROM _migrations ORDER BY version", ())
            .await
            .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to query migrations: {}", e)))?;

        while let Some(row) = rows.next().await.map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to read migration row: {}", e))
        })? {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to get version from row: {}", e))
            })?;
            applied.push(version);
        }

        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                continue;
            }

            info!(
                "Applying migration v{}: {}",
                migration.version, migration.description
            );

            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Migration v{} failed: {}",
                    migration.version, e
                ))
            })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?, ?)",
                (migration.version, migration.description),
            )
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e
                ))
            })?;

            newly_applied.push(migration.version);
        }

        if newly_applied.is_empty() {
            debug!("Database schema is up to date");
        } else {
            info!(applied = ?newly_applied, "Migrations complete");
        }

        Ok(newly_applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_exists(db: &Database, table: &str) -> bool {
        let conn = db.connection().await.unwrap();
        let mut rows = conn
            .as_ref()
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name = ?",
                [table],
            )
            .await
            .unwrap();
        rows.next().await.unwrap().is_some()
    }

    #[tokio::test]
    async fn test_run_creates_schema() {
        let db = Database::in_memory("test").await.unwrap();
        let applied = MigrationRunner::schema().run(&db).await.unwrap();

        assert_eq!(applied, vec![1, 2]);
        assert!(table_exists(&db, "users").await);
        assert!(table_exists(&db, "messages").await);
        assert!(table_exists(&db, "_migrations").await);
    }

    #[tokio::test]
    async fn test_run_is_idempotent() {
        let db = Database::in_memory("test").await.unwrap();
        let runner = MigrationRunner::schema();

        runner.run(&db).await.unwrap();
        let second = runner.run(&db).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_migrations_are_sorted() {
        let runner = MigrationRunner::new(vec![
            Migration {
                version: 2,
                description: "second",
                sql: "CREATE TABLE b (id INTEGER)",
            },
            Migration {
                version: 1,
                description: "first",
                sql: "CREATE TABLE a (id INTEGER)",
            },
        ]);
        let db = Database::in_memory("test").await.unwrap();
        assert_eq!(runner.run(&db).await.unwrap(), vec![1, 2]);
    }
}
