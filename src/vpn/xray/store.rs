//! Local Xray user table
//!
//! A single SQLite table maps each identity (stored as the Xray "email") to
//! the VLESS uuid it was issued. The running Xray instance holds the same
//! users in memory; this table is the durable record used to recreate or
//! remove them.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ProvisionResult;
use crate::vpn::common;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrayUser {
    pub uuid: String,
    pub email: String,
}

/// Handle on the SQLite database at `XRAY_DB_PATH`
///
/// Each call opens its own connection on the blocking pool.
#[derive(Debug, Clone)]
pub struct UserStore {
    path: PathBuf,
}

impl UserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<F, T>(&self, f: F) -> ProvisionResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> ProvisionResult<T> {
            let conn = Connection::open(&path)?;
            Ok(f(&conn)?)
        })
        .await?
    }

    /// Create the table and email index if missing
    pub async fn ensure_table(&self) -> ProvisionResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            common::ensure_directory_exists(parent).await?;
        }
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                     uuid TEXT PRIMARY KEY,
                     email TEXT NOT NULL UNIQUE
                 );
                 CREATE INDEX IF NOT EXISTS idx_email ON users (email);",
            )
        })
        .await?;
        debug!("Xray user table ready at {:?}", self.path);
        Ok(())
    }

    pub async fn find_by_email(&self, email: &str) -> ProvisionResult<Option<XrayUser>> {
        let email = email.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT uuid, email FROM users WHERE email = ?1",
                params![email],
                |row| {
                    Ok(XrayUser {
                        uuid: row.get(0)?,
                        email: row.get(1)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    /// Insert a row; false if the uuid or email is already taken
    pub async fn insert(&self, user: &XrayUser) -> ProvisionResult<bool> {
        let user = user.clone();
        self.with_conn(move |conn| {
            match conn.execute(
                "INSERT INTO users (uuid, email) VALUES (?1, ?2)",
                params![user.uuid, user.email],
            ) {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Number of rows removed
    pub async fn delete_by_email(&self, email: &str) -> ProvisionResult<usize> {
        let email = email.to_string();
        self.with_conn(move |conn| conn.execute("DELETE FROM users WHERE email = ?1", params![email]))
            .await
    }

    pub async fn list(&self) -> ProvisionResult<Vec<XrayUser>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT uuid, email FROM users ORDER BY email")?;
            let rows = stmt.query_map([], |row| {
                Ok(XrayUser {
                    uuid: row.get(0)?,
                    email: row.get(1)?,
                })
            })?;
            let users = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }
}
