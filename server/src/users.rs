use chat_api::UserProfile;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::{auth, db::now_ms, error::ApiError};

/// A stored account, including its credential hash.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub created_at: i64,
}

impl UserRecord {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            created_at: self.created_at,
        }
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Register a new account. Inputs are validated here so the HTTP layer and
/// any other caller get the same rules.
pub fn create_user(
    conn: &Connection,
    name: &str,
    email: &str,
    password: &str,
) -> Result<UserRecord, ApiError> {
    let name = name.trim();
    let email = email.trim().to_lowercase();
    if name.is_empty() || email.is_empty() || password.is_empty() {
        return Err(ApiError::validation("All fields are required"));
    }
    auth::validate_email(&email)?;
    auth::validate_password(password)?;
    if find_by_email(conn, &email)?.is_some() {
        return Err(ApiError::validation("Email already exists"));
    }
    let password_hash =
        auth::hash_password(password).map_err(|e| ApiError::Store(e.to_string()))?;
    let user = UserRecord {
        id: Uuid::new_v4().to_string(),
        email,
        name: name.into(),
        password_hash,
        created_at: now_ms(),
    };
    let res = conn.execute(
        "INSERT INTO users (id, email, name, password_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            user.id,
            user.email,
            user.name,
            user.password_hash,
            user.created_at
        ],
    );
    match res {
        Ok(_) => Ok(user),
        // lost a race with a concurrent signup for the same address
        Err(e)
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) =>
        {
            Err(ApiError::validation("Email already exists"))
        }
        Err(e) => Err(e.into()),
    }
}

/// Look up an account by email, case-insensitively.
pub fn find_by_email(conn: &Connection, email: &str) -> Result<Option<UserRecord>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT id, email, name, password_hash, created_at FROM users WHERE email = ?1 COLLATE NOCASE",
    )?;
    Ok(stmt.query_row([email.trim()], row_to_user).optional()?)
}

pub fn get_user(conn: &Connection, id: &str) -> Result<Option<UserRecord>, ApiError> {
    let mut stmt = conn
        .prepare("SELECT id, email, name, password_hash, created_at FROM users WHERE id = ?1")?;
    Ok(stmt.query_row([id], row_to_user).optional()?)
}

/// Check a login attempt. Unknown email and wrong password fail identically.
pub fn authenticate(conn: &Connection, email: &str, password: &str) -> Result<UserRecord, ApiError> {
    match find_by_email(conn, email)? {
        Some(user) if auth::verify_password(password, &user.password_hash) => Ok(user),
        _ => Err(ApiError::InvalidCredentials),
    }
}
