use chat_api::{ConversationDetail, ConversationSummary, DEFAULT_CONVERSATION_TITLE};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::{chats, db::now_ms, error::ApiError};

const SUMMARY_SELECT: &str = "SELECT c.id, c.title, c.active, \
     (SELECT COUNT(*) FROM chats WHERE conversation_id = c.id), \
     c.last_message_at, c.created_at FROM conversations c";

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSummary> {
    Ok(ConversationSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        active: row.get::<_, i64>(2)? != 0,
        chat_count: row.get(3)?,
        last_message_at: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Start a new, empty conversation for a user.
pub fn create_conversation(
    conn: &Connection,
    user_id: &str,
    title: Option<&str>,
) -> Result<ConversationSummary, ApiError> {
    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_CONVERSATION_TITLE);
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    conn.execute(
        "INSERT INTO conversations (id, user_id, title, active, last_message_at, created_at) VALUES (?1, ?2, ?3, 1, ?4, ?4)",
        params![id, user_id, title, now],
    )?;
    Ok(ConversationSummary {
        id,
        title: title.into(),
        active: true,
        chat_count: 0,
        last_message_at: now,
        created_at: now,
    })
}

/// Active conversations of a user, most recently used first.
pub fn list_conversations(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "{SUMMARY_SELECT} WHERE c.user_id = ?1 AND c.active = 1 ORDER BY c.last_message_at DESC, c.rowid DESC"
    ))?;
    let list = stmt
        .query_map([user_id], row_to_summary)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(list)
}

/// Direct lookup that also sees soft-deleted conversations. Not routed.
pub fn find_conversation(
    conn: &Connection,
    user_id: &str,
    id: &str,
) -> Result<Option<ConversationSummary>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "{SUMMARY_SELECT} WHERE c.user_id = ?1 AND c.id = ?2"
    ))?;
    Ok(stmt.query_row(params![user_id, id], row_to_summary).optional()?)
}

/// The conversation if it exists, is active and belongs to `user_id`.
pub fn active_conversation(
    conn: &Connection,
    user_id: &str,
    id: &str,
) -> Result<ConversationSummary, ApiError> {
    match find_conversation(conn, user_id, id)? {
        Some(c) if c.active => Ok(c),
        _ => Err(ApiError::NotFound("Conversation")),
    }
}

/// A conversation with all its turns, oldest first.
pub fn get_conversation(
    conn: &Connection,
    user_id: &str,
    id: &str,
) -> Result<ConversationDetail, ApiError> {
    let conversation = active_conversation(conn, user_id, id)?;
    let chats = chats::list_turns(conn, &conversation.id)?;
    Ok(ConversationDetail {
        conversation,
        chats,
    })
}

pub fn rename_conversation(
    conn: &Connection,
    user_id: &str,
    id: &str,
    title: &str,
) -> Result<ConversationSummary, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::validation("Title is required"));
    }
    let changed = conn.execute(
        "UPDATE conversations SET title = ?3 WHERE id = ?1 AND user_id = ?2 AND active = 1",
        params![id, user_id, title],
    )?;
    if changed == 0 {
        return Err(ApiError::NotFound("Conversation"));
    }
    active_conversation(conn, user_id, id)
}

/// Hide a conversation from listings. Its turns are kept.
pub fn soft_delete_conversation(conn: &Connection, user_id: &str, id: &str) -> Result<(), ApiError> {
    let changed = conn.execute(
        "UPDATE conversations SET active = 0 WHERE id = ?1 AND user_id = ?2 AND active = 1",
        params![id, user_id],
    )?;
    if changed == 0 {
        return Err(ApiError::NotFound("Conversation"));
    }
    Ok(())
}

/// Move a conversation's last-activity marker forward.
pub(crate) fn touch(conn: &Connection, id: &str, at: i64) -> Result<(), ApiError> {
    conn.execute(
        "UPDATE conversations SET last_message_at = MAX(last_message_at, ?2) WHERE id = ?1",
        params![id, at],
    )?;
    Ok(())
}
