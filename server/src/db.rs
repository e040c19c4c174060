use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::{path::Path, time::Duration};
use time::OffsetDateTime;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Initialize a single SQLite connection and run migrations.
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(conn)
}

/// Open a connection pool on the database file, creating the schema if needed.
pub fn open_pool<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|c| {
        c.busy_timeout(Duration::from_secs(5))?;
        c.execute_batch("PRAGMA foreign_keys = ON;")
    });
    let pool = Pool::new(manager)?;
    migrate(&*pool.get()?)?;
    Ok(pool)
}

/// Create missing tables and add columns introduced after the first schema.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    let has_attempts: bool = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('chats') WHERE name = 'attempts'",
        [],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if !has_attempts {
        conn.execute_batch(
            "ALTER TABLE chats ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
             ALTER TABLE chats ADD COLUMN last_attempt_at INTEGER;",
        )?;
    }
    Ok(())
}

/// Current time as Unix milliseconds, the unit of every stored timestamp.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  email TEXT UNIQUE NOT NULL COLLATE NOCASE,
  name TEXT NOT NULL,
  password_hash TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id),
  title TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 1,
  last_message_at INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS conversations_by_user
  ON conversations(user_id, last_message_at DESC);

CREATE TABLE IF NOT EXISTS chats (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL REFERENCES conversations(id),
  message TEXT NOT NULL,
  message_type TEXT NOT NULL DEFAULT 'text',
  file_name TEXT,
  file_original_name TEXT,
  file_size INTEGER,
  file_mime TEXT,
  response TEXT,
  processed INTEGER NOT NULL DEFAULT 0,
  processing_time INTEGER,
  version INTEGER NOT NULL DEFAULT 0,
  attempts INTEGER NOT NULL DEFAULT 0,
  last_attempt_at INTEGER,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS chats_by_conversation
  ON chats(conversation_id, created_at);

CREATE INDEX IF NOT EXISTS chats_pending
  ON chats(processed, created_at);
"#;
