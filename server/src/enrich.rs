use ai_relay::AiRelay;
use chat_api::{AttachResponseRequest, ChatTurn, MessageKind};
use tracing::{info, warn};

use crate::{chats, db::DbPool, error::ApiError};

/// Answer a pending text turn through the relay and attach the result.
///
/// No pooled connection is held while the relay call is in flight. The
/// patch carries the version read before the call, so a client that
/// answered the turn in the meantime wins and this call gets `Conflict`.
pub async fn enrich_turn(
    pool: &DbPool,
    relay: &dyn AiRelay,
    user_id: &str,
    conversation_id: &str,
    chat_id: &str,
) -> Result<ChatTurn, ApiError> {
    let (turn, history) = {
        let conn = pool.get()?;
        let turn = chats::get_turn(&conn, user_id, conversation_id, chat_id)?;
        if !turn.is_pending() {
            return Err(ApiError::Conflict(
                "Chat message already has a response".into(),
            ));
        }
        if turn.message_type == MessageKind::File {
            return Err(ApiError::validation(
                "File messages cannot be retried, upload the file again",
            ));
        }
        let history = chats::history_before(&conn, conversation_id, chat_id)?;
        (turn, history)
    };

    let answer = relay.ask(&turn.message, &history).await.map_err(|e| {
        warn!(chat_id, timed_out = e.timed_out, error = %e, "relay failed, turn left pending");
        e
    })?;

    let conn = pool.get()?;
    let updated = chats::attach_response(
        &conn,
        user_id,
        conversation_id,
        chat_id,
        &AttachResponseRequest {
            response: answer.text,
            processing_time: Some(answer.latency_ms),
            expected_version: Some(turn.version),
        },
    )?;
    info!(chat_id, latency_ms = answer.latency_ms, "turn answered");
    Ok(updated)
}
