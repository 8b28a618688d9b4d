//! SQLite-backed [`IdentityStore`].
//!
//! Known faces are cached in memory so matching never touches the disk. A
//! registration appends to the cache once its row is committed, so a visitor
//! is recognizable as soon as `register` returns.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDateTime;
use kiosk_core::embedding::Embedding;
use kiosk_core::identity::{ConversationLogEntry, Identity, IdentityId, IdentityStore};
use rusqlite::{Connection, OpenFlags, params};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    face_encoding BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    message TEXT,
    FOREIGN KEY(user_id) REFERENCES users(user_id)
);

CREATE INDEX IF NOT EXISTS idx_conversations_user_id ON conversations(user_id);
"#;

/// Creates both tables if they do not exist yet.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)
}

pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
    known: RwLock<Vec<Identity>>,
    tolerance: f64,
}

impl SqliteIdentityStore {
    /// Opens (creating if needed) the database at `path` and loads known faces.
    ///
    /// A face matches an identity when its distance is at most `tolerance`.
    pub fn open(path: &Path, tolerance: f64) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .with_context(|| format!("Failed to open database {}", path.display()))?;
        init_schema(&conn).context("Failed to initialize database schema")?;

        let store = Self {
            conn: Mutex::new(conn),
            known: RwLock::new(Vec::new()),
            tolerance,
        };
        let count = store.reload()?;
        tracing::info!("Loaded {} known faces from {}", count, path.display());
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    /// Replaces the in-memory face cache with the contents of `users`.
    pub fn reload(&self) -> Result<usize> {
        let identities = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT user_id, name, face_encoding FROM users")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, IdentityId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;

            let mut identities = Vec::new();
            for row in rows {
                let (id, display_name, blob) = row?;
                match Embedding::from_le_bytes(&blob) {
                    Some(embedding) => identities.push(Identity {
                        id,
                        display_name,
                        embedding,
                    }),
                    None => tracing::warn!("Skipping user {} with malformed face encoding", id),
                }
            }
            identities
        };

        let count = identities.len();
        *self
            .known
            .write()
            .map_err(|_| anyhow!("Face cache lock poisoned"))? = identities;
        Ok(count)
    }

    pub fn known_count(&self) -> usize {
        self.known.read().map(|known| known.len()).unwrap_or(0)
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn find_match(&self, embedding: &Embedding) -> Result<Option<Identity>> {
        let known = self
            .known
            .read()
            .map_err(|_| anyhow!("Face cache lock poisoned"))?;

        let best = known
            .iter()
            .map(|identity| (identity, identity.embedding.distance(embedding)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        Ok(match best {
            Some((identity, distance)) if distance <= self.tolerance => {
                tracing::debug!("Matched {} at distance {:.3}", identity.display_name, distance);
                Some(identity.clone())
            }
            _ => None,
        })
    }

    fn register(&self, name: &str, embedding: &Embedding) -> Result<Identity> {
        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO users (name, face_encoding) VALUES (?1, ?2)",
                params![name, embedding.to_le_bytes()],
            )
            .with_context(|| format!("Failed to register {name:?}"))?;
            conn.last_insert_rowid()
        };
        tracing::info!("Registered new user {:?} with id {}", name, id);

        let identity = Identity {
            id,
            display_name: name.to_string(),
            embedding: embedding.clone(),
        };
        // The row is committed; a cache failure must not undo the registration.
        match self.known.write() {
            Ok(mut known) => known.push(identity.clone()),
            Err(_) => tracing::error!("Face cache lock poisoned, {:?} not cached", name),
        }
        Ok(identity)
    }

    fn append_log(&self, identity_id: IdentityId, text: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO conversations (user_id, message) VALUES (?1, ?2)",
                params![identity_id, text],
            )
            .context("Failed to append conversation log")?;
        Ok(())
    }

    fn append_exchange(&self, identity_id: IdentityId, user_text: &str, bot_text: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for text in [user_text, bot_text] {
            tx.execute(
                "INSERT INTO conversations (user_id, message) VALUES (?1, ?2)",
                params![identity_id, text],
            )
            .context("Failed to append conversation log")?;
        }
        tx.commit().context("Failed to commit conversation exchange")?;
        Ok(())
    }

    fn history(&self, identity_id: IdentityId, limit: usize) -> Result<Vec<ConversationLogEntry>> {
        let conn = self.conn()?;
        // Rows written in the same second share a timestamp; the id breaks the tie.
        let mut stmt = conn.prepare(
            "SELECT timestamp, message FROM conversations
             WHERE user_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![identity_id, limit as i64], |row| {
            Ok(ConversationLogEntry {
                identity_id,
                timestamp: row.get::<_, NaiveDateTime>(0)?,
                text: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        })?;

        let mut entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }
}
