use chat_api::{
    AttachResponseRequest, ChatTurn, FileInfo, HistoryTurn, MessageKind, NewChatRequest,
};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::{conversations, db::now_ms, error::ApiError};

const TURN_COLUMNS: &str = "ch.id, ch.message, ch.response, ch.message_type, ch.file_name, \
     ch.file_original_name, ch.file_size, ch.file_mime, ch.processed, ch.processing_time, \
     ch.version, ch.created_at";

/// A turn still waiting for its answer, with the ids needed to patch it.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub user_id: String,
    pub conversation_id: String,
    pub turn: ChatTurn,
    /// Background retries made so far.
    pub attempts: u32,
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatTurn> {
    let kind: String = row.get(3)?;
    let file_info = match row.get::<_, Option<String>>(4)? {
        Some(filename) => Some(FileInfo {
            filename,
            original_name: row.get(5)?,
            size: row.get::<_, Option<i64>>(6)?.unwrap_or(0).max(0) as u64,
            mimetype: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(ChatTurn {
        id: row.get(0)?,
        message: row.get(1)?,
        response: row.get(2)?,
        message_type: MessageKind::parse(&kind).unwrap_or_default(),
        file_info,
        is_processed: row.get::<_, i64>(8)? != 0,
        processing_time: row.get::<_, Option<i64>>(9)?.map(|t| t.max(0) as u64),
        version: row.get::<_, i64>(10)?.max(0) as u64,
        created_at: row.get(11)?,
    })
}

/// Record the user's side of a turn. The answer is attached later.
pub fn append_turn(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    req: &NewChatRequest,
) -> Result<ChatTurn, ApiError> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::validation("Message content is required"));
    }
    conversations::active_conversation(conn, user_id, conversation_id)?;

    let turn = ChatTurn {
        id: Uuid::new_v4().to_string(),
        message: message.into(),
        response: None,
        message_type: req.message_type,
        file_info: req.file_info.clone(),
        is_processed: false,
        processing_time: None,
        version: 0,
        created_at: now_ms(),
    };
    let file = turn.file_info.as_ref();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO chats (id, conversation_id, message, message_type, file_name, file_original_name, file_size, file_mime, processed, version, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9)",
        params![
            turn.id,
            conversation_id,
            turn.message,
            turn.message_type.as_str(),
            file.map(|f| f.filename.as_str()),
            file.and_then(|f| f.original_name.as_deref()),
            file.map(|f| f.size as i64),
            file.map(|f| f.mimetype.as_str()),
            turn.created_at,
        ],
    )?;
    conversations::touch(&tx, conversation_id, turn.created_at)?;
    tx.commit()?;
    Ok(turn)
}

/// Attach the AI answer to a turn.
///
/// Without `expected_version` a repeated call overwrites the previous
/// answer. With it, the update only applies if nobody patched the turn in
/// between; otherwise the turn is left untouched and `Conflict` is returned.
pub fn attach_response(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    chat_id: &str,
    req: &AttachResponseRequest,
) -> Result<ChatTurn, ApiError> {
    conversations::active_conversation(conn, user_id, conversation_id)?;
    let changed = conn.execute(
        "UPDATE chats SET response = ?3, processed = 1, processing_time = ?4, version = version + 1 \
         WHERE id = ?1 AND conversation_id = ?2 AND (?5 IS NULL OR version = ?5)",
        params![
            chat_id,
            conversation_id,
            req.response,
            req.processing_time.map(|t| t as i64),
            req.expected_version.map(|v| v as i64),
        ],
    )?;
    let turn = get_turn(conn, user_id, conversation_id, chat_id)?;
    if changed == 0 {
        return Err(ApiError::Conflict(format!(
            "Chat message is at version {}, expected {}",
            turn.version,
            req.expected_version.unwrap_or_default()
        )));
    }
    Ok(turn)
}

/// One turn of an active conversation owned by `user_id`.
pub fn get_turn(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
    chat_id: &str,
) -> Result<ChatTurn, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURN_COLUMNS} FROM chats ch JOIN conversations c ON c.id = ch.conversation_id \
         WHERE ch.id = ?1 AND ch.conversation_id = ?2 AND c.user_id = ?3 AND c.active = 1"
    ))?;
    stmt.query_row(params![chat_id, conversation_id, user_id], row_to_turn)
        .optional()?
        .ok_or(ApiError::NotFound("Chat message"))
}

/// All turns of a conversation in creation order. Equal timestamps keep
/// insertion order.
pub fn list_turns(conn: &Connection, conversation_id: &str) -> Result<Vec<ChatTurn>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURN_COLUMNS} FROM chats ch WHERE ch.conversation_id = ?1 ORDER BY ch.created_at ASC, ch.rowid ASC"
    ))?;
    let turns = stmt
        .query_map([conversation_id], row_to_turn)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(turns)
}

/// The (message, response) pairs preceding `chat_id`, used as relay context.
pub fn history_before(
    conn: &Connection,
    conversation_id: &str,
    chat_id: &str,
) -> Result<Vec<HistoryTurn>, ApiError> {
    Ok(list_turns(conn, conversation_id)?
        .iter()
        .take_while(|t| t.id != chat_id)
        .map(HistoryTurn::from)
        .collect())
}

/// Unanswered turns created at or before `created_before`, across all users.
/// Soft-deleted conversations are skipped; `kind` narrows the result to one
/// message kind.
///
/// Turns never retried come first, then the ones whose last retry is the
/// oldest, so a turn that keeps failing cannot hold the head of the queue.
pub fn list_pending(
    conn: &Connection,
    created_before: i64,
    kind: Option<MessageKind>,
    limit: usize,
) -> Result<Vec<PendingTurn>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURN_COLUMNS}, c.user_id, c.id, ch.attempts FROM chats ch JOIN conversations c ON c.id = ch.conversation_id \
         WHERE c.active = 1 AND ch.processed = 0 AND ch.response IS NULL AND ch.created_at <= ?1 \
         AND (?2 IS NULL OR ch.message_type = ?2) \
         ORDER BY COALESCE(ch.last_attempt_at, 0) ASC, ch.created_at ASC, ch.rowid ASC LIMIT ?3"
    ))?;
    let pending = stmt
        .query_map(
            params![created_before, kind.map(|k| k.as_str()), limit as i64],
            |row| {
                Ok(PendingTurn {
                    turn: row_to_turn(row)?,
                    user_id: row.get(12)?,
                    conversation_id: row.get(13)?,
                    attempts: row.get::<_, i64>(14)?.max(0) as u32,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pending)
}

/// Count a background retry of `chat_id` made at `at` (Unix ms).
pub fn note_attempt(conn: &Connection, chat_id: &str, at: i64) -> Result<(), ApiError> {
    conn.execute(
        "UPDATE chats SET attempts = attempts + 1, last_attempt_at = ?2 WHERE id = ?1",
        params![chat_id, at],
    )?;
    Ok(())
}
