//! Database module for Parley Server
//!
//! This module provides a libSQL database layer with:
//! - File-backed or in-memory databases
//! - Automatic schema migrations
//! - The [`LibSqlStore`] implementation of the relay's durable store
//!
//! libSQL gives every `:memory:` connection its own isolated database, so
//! in-memory databases keep one persistent connection that every caller
//! shares through [`Database::connection`].

mod migrations;
mod store;

use libsql::{Connection, Database as LibSqlDatabase};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

pub use migrations::MigrationRunner;
pub use store::LibSqlStore;

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    name: String,
    persistent: Option<Arc<Mutex<Connection>>>,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: None,
        })
    }

    /// Open `path` if given, otherwise create an in-memory database
    pub async fn open(name: &str, path: Option<&Path>) -> Result<Self, DatabaseError> {
        match path {
            Some(path) => Self::open_local(name, path).await,
            None => Self::in_memory(name).await,
        }
    }

    /// Get a fresh connection to the database
    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        Ok(self.db.connect()?)
    }

    /// The shared connection of an in-memory database, if this is one
    pub fn persistent_connection(&self) -> Option<&Arc<Mutex<Connection>>> {
        self.persistent.as_ref()
    }

    /// Get a connection that sees this database's data.
    ///
    /// In-memory databases hand out a guard on the persistent connection;
    /// file-based databases open a new connection.
    pub async fn connection(&self) -> Result<ConnectionGuard<'_>, DatabaseError> {
        match &self.persistent {
            Some(persistent) => Ok(ConnectionGuard::Persistent(persistent.lock().await)),
            None => Ok(ConnectionGuard::Owned(self.connect()?)),
        }
    }

    /// Get the database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let conn = self.connection().await?;
        match conn.as_ref().query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// Connection handle returned by [`Database::connection`].
pub enum ConnectionGuard<'a> {
    /// Persistent connection guard for in-memory databases
    Persistent(MutexGuard<'a, Connection>),
    /// Owned connection for file-based databases
    Owned(Connection),
}

impl ConnectionGuard<'_> {
    /// Get a reference to the underlying connection
    pub fn as_ref(&self) -> &Connection {
        match self {
            ConnectionGuard::Persistent(guard) => guard,
            ConnectionGuard::Owned(conn) => conn,
        }
    }
}
