//! SQLite-backed credential store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  The connection lives behind a `Mutex`; every
//! mutation commits immediately (single-writer process assumption, no
//! long-lived transactions spanning network calls).
//!
//! The store holds one row per authorized account plus a single-row
//! `current_user` pointer.  A `schema_version` marker guards the layout:
//! if the marker is missing or does not match, the whole store is
//! dropped and recreated — it only holds re-derivable OAuth state.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::errors::{Result, TransferError};

/// Current schema version. Bumped when the table layout changes.
const SCHEMA_VERSION: i64 = 1;

/// One persisted OAuth identity.
///
/// `username` is immutable once created; token refresh rewrites every
/// other field in place via [`TokenUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub username: String,
    pub token_type: String,
    /// Unix timestamp after which `access_token` is no longer valid.
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_server_url: String,
    pub redirect_uri: String,
}

impl AccountRecord {
    /// Whether the access token expires within `margin_secs` from now.
    pub fn expires_within(&self, margin_secs: i64) -> bool {
        self.expires_at < current_timestamp() + margin_secs
    }
}

/// Token and expiry fields rewritten by a refresh.
///
/// Deliberately excludes `username` and the client identity fields, so a
/// refresh cannot rename or re-home an account.
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub token_type: String,
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub access_token: String,
    pub refresh_token: String,
}

/// Current unix timestamp in seconds.
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

impl From<rusqlite::Error> for TransferError {
    fn from(e: rusqlite::Error) -> Self {
        TransferError::Internal(e.into())
    }
}

/// Credential store backed by a single SQLite database file.
pub struct SqliteCredentialStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| TransferError::Internal(e.into()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables if they do not already exist, rebuilding
    /// the store from scratch when the schema marker is missing or stale.
    /// Idempotent — safe to call on every startup.
    fn init_db(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );
            ",
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing != Some(SCHEMA_VERSION) {
            if let Some(version) = existing {
                warn!(
                    "credential store schema version {} does not match {}, rebuilding",
                    version, SCHEMA_VERSION
                );
            }
            // Destructive rebuild: the store only holds re-derivable OAuth
            // state, so dropping it forces re-authorization at worst.
            conn.execute_batch(
                "
                DROP TABLE IF EXISTS current_user;
                DROP TABLE IF EXISTS accounts;
                DELETE FROM schema_version;
                ",
            )?;
        }

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                username        TEXT PRIMARY KEY,
                token_type      TEXT NOT NULL DEFAULT 'Bearer',
                expires_at      INTEGER NOT NULL,
                scope           TEXT NOT NULL DEFAULT '',
                access_token    TEXT NOT NULL,
                refresh_token   TEXT NOT NULL,
                client_id       TEXT NOT NULL,
                client_secret   TEXT NOT NULL,
                auth_server_url TEXT NOT NULL,
                redirect_uri    TEXT NOT NULL
            );

            -- At most one row: the active account selection.
            CREATE TABLE IF NOT EXISTS current_user (
                id       INTEGER PRIMARY KEY CHECK (id = 1),
                username TEXT NOT NULL REFERENCES accounts(username)
            );
            ",
        )?;

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, current_timestamp()],
        )?;

        Ok(())
    }

    /// Insert a new account. The first account added becomes current.
    pub fn add_account(&self, record: &AccountRecord) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM accounts WHERE username = ?1",
            params![record.username],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(TransferError::DuplicateUsername {
                username: record.username.clone(),
            });
        }

        conn.execute(
            "INSERT INTO accounts
                (username, token_type, expires_at, scope, access_token,
                 refresh_token, client_id, client_secret, auth_server_url, redirect_uri)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.username,
                record.token_type,
                record.expires_at,
                record.scopes.join(" "),
                record.access_token,
                record.refresh_token,
                record.client_id,
                record.client_secret,
                record.auth_server_url,
                record.redirect_uri,
            ],
        )?;

        // First account in an empty store becomes the current selection.
        conn.execute(
            "INSERT OR IGNORE INTO current_user (id, username) VALUES (1, ?1)",
            params![record.username],
        )?;

        debug!("added account {}", record.username);
        Ok(())
    }

    /// Fetch one account by username.
    pub fn get_account(&self, username: &str) -> Result<AccountRecord> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Self::query_account(&conn, username)
    }

    /// List all stored usernames, ordered.
    pub fn list_accounts(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare("SELECT username FROM accounts ORDER BY username")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut usernames = Vec::new();
        for row in rows {
            usernames.push(row?);
        }
        Ok(usernames)
    }

    /// Fetch the account the current pointer references.
    pub fn current_account(&self) -> Result<AccountRecord> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let username = Self::query_current_username(&conn)?
            .ok_or(TransferError::AccountNotFound { username: None })?;
        Self::query_account(&conn, &username)
    }

    /// Username the current pointer references, if any.
    pub fn current_username(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        Self::query_current_username(&conn)
    }

    /// Repoint the current pointer to `username`.
    pub fn set_current(&self, username: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        // Verify the target exists before repointing.
        Self::query_account(&conn, username)?;

        conn.execute(
            "INSERT OR REPLACE INTO current_user (id, username) VALUES (1, ?1)",
            params![username],
        )?;

        debug!("current account set to {}", username);
        Ok(())
    }

    /// Rewrite the token and expiry fields of one account in place.
    /// The username (and client identity) cannot be changed here.
    pub fn update_tokens(&self, username: &str, update: &TokenUpdate) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let changed = conn.execute(
            "UPDATE accounts
             SET token_type = ?1, expires_at = ?2, scope = ?3,
                 access_token = ?4, refresh_token = ?5
             WHERE username = ?6",
            params![
                update.token_type,
                update.expires_at,
                update.scopes.join(" "),
                update.access_token,
                update.refresh_token,
                username,
            ],
        )?;

        if changed == 0 {
            return Err(TransferError::AccountNotFound {
                username: Some(username.to_string()),
            });
        }

        debug!("updated tokens for {}", username);
        Ok(())
    }

    /// Delete one account.  If it was current, the pointer moves to the
    /// lowest remaining username, or is cleared when the store empties.
    /// Returns whether an account remains current afterwards.
    pub fn delete_account(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.unchecked_transaction()?;

        // Confirm the account exists before touching anything.
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM accounts WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(TransferError::AccountNotFound {
                username: Some(username.to_string()),
            });
        }

        let was_current = tx
            .query_row("SELECT username FROM current_user WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .as_deref()
            == Some(username);

        if was_current {
            // Clear the pointer first so the FK does not block the delete.
            tx.execute("DELETE FROM current_user", [])?;
        }

        tx.execute(
            "DELETE FROM accounts WHERE username = ?1",
            params![username],
        )?;

        if was_current {
            // Deterministic repoint: lowest remaining username.
            let next: Option<String> = tx
                .query_row(
                    "SELECT username FROM accounts ORDER BY username LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(ref next_username) = next {
                tx.execute(
                    "INSERT INTO current_user (id, username) VALUES (1, ?1)",
                    params![next_username],
                )?;
                debug!("current account repointed to {}", next_username);
            } else {
                debug!("last account removed, current pointer cleared");
            }
        }

        let has_current: i64 =
            tx.query_row("SELECT COUNT(*) FROM current_user", [], |row| row.get(0))?;

        tx.commit()?;

        debug!("deleted account {}", username);
        Ok(has_current > 0)
    }

    fn query_account(conn: &Connection, username: &str) -> Result<AccountRecord> {
        conn.query_row(
            "SELECT username, token_type, expires_at, scope, access_token,
                    refresh_token, client_id, client_secret, auth_server_url, redirect_uri
             FROM accounts WHERE username = ?1",
            params![username],
            |row| {
                let scope: String = row.get(3)?;
                Ok(AccountRecord {
                    username: row.get(0)?,
                    token_type: row.get(1)?,
                    expires_at: row.get(2)?,
                    scopes: scope.split_whitespace().map(str::to_string).collect(),
                    access_token: row.get(4)?,
                    refresh_token: row.get(5)?,
                    client_id: row.get(6)?,
                    client_secret: row.get(7)?,
                    auth_server_url: row.get(8)?,
                    redirect_uri: row.get(9)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| TransferError::AccountNotFound {
            username: Some(username.to_string()),
        })
    }

    fn query_current_username(conn: &Connection) -> Result<Option<String>> {
        Ok(conn
            .query_row("SELECT username FROM current_user WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
