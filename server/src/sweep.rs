use crate::{api::AppState, chats, db::now_ms, enrich, error::ApiError};
use chat_api::MessageKind;
use tokio::{
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Outcome of one pass over the pending backlog.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub answered: usize,
    pub failed: usize,
}

/// Periodically retry text turns that never received an answer.
///
/// Returns `None` when the sweep is disabled in the configuration.
pub fn spawn_sweep(state: AppState) -> Option<JoinHandle<()>> {
    let settings = state.config.sweep.clone();
    if !settings.enabled {
        return None;
    }
    info!(
        interval_secs = settings.interval.as_secs(),
        min_age_secs = settings.min_age.as_secs(),
        "pending sweep enabled"
    );
    Some(tokio::spawn(async move {
        let mut tick = interval(settings.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match sweep_once(&state, settings.min_age, settings.batch).await {
                Ok(report) if report.answered + report.failed > 0 => {
                    info!(answered = report.answered, failed = report.failed, "sweep pass")
                }
                Ok(_) => debug!("sweep pass, nothing pending"),
                Err(e) => warn!(error = %e, "sweep pass failed"),
            }
        }
    }))
}

/// Retry up to `batch` pending text turns older than `min_age`.
///
/// Each picked turn is marked as attempted before the relay is asked, so
/// turns that keep failing rotate to the back of the next pass.
pub async fn sweep_once(
    state: &AppState,
    min_age: Duration,
    batch: usize,
) -> Result<SweepReport, ApiError> {
    let now = now_ms();
    let cutoff = now - min_age.as_millis() as i64;
    let pending = {
        let conn = state.pool.get()?;
        let pending = chats::list_pending(&conn, cutoff, Some(MessageKind::Text), batch)?;
        for p in &pending {
            chats::note_attempt(&conn, &p.turn.id, now)?;
        }
        pending
    };
    let mut report = SweepReport::default();
    for p in pending {
        match enrich::enrich_turn(
            &state.pool,
            state.relay.as_ref(),
            &p.user_id,
            &p.conversation_id,
            &p.turn.id,
        )
        .await
        {
            Ok(_) => report.answered += 1,
            Err(e) => {
                warn!(
                    chat_id = %p.turn.id,
                    conversation_id = %p.conversation_id,
                    attempt = p.attempts + 1,
                    error = %e,
                    "sweep retry failed"
                );
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, conversations, users};
    use ai_relay::{AiRelay, FileUpload, InferenceFailure, RelayAnswer};
    use async_trait::async_trait;
    use chat_api::{ChatTurn, HistoryTurn, NewChatRequest};
    use std::sync::Arc;

    /// Fails every message containing "bad", answers the rest.
    struct Picky;

    #[async_trait]
    impl AiRelay for Picky {
        async fn ask(
            &self,
            message: &str,
            _history: &[HistoryTurn],
        ) -> Result<RelayAnswer, InferenceFailure> {
            if message.contains("bad") {
                return Err(InferenceFailure::new("model rejected input"));
            }
            Ok(RelayAnswer {
                text: format!("re: {message}"),
                latency_ms: 3,
            })
        }

        async fn ask_with_file(
            &self,
            _file: FileUpload,
            _history: &[HistoryTurn],
        ) -> Result<RelayAnswer, InferenceFailure> {
            Err(InferenceFailure::new("unused"))
        }
    }

    async fn state_with_turns(messages: &[&str]) -> (tempfile::TempDir, AppState, Vec<ChatTurn>) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::new("127.0.0.1:0", tmp.path());
        config.auth.jwt_secret = Some("sweep-secret".into());
        let state = AppState::new(config, Arc::new(Picky)).await.unwrap();
        let conn = state.pool.get().unwrap();
        let user = users::create_user(&conn, "Jane", "jane@x.com", "secret1").unwrap();
        let conv = conversations::create_conversation(&conn, &user.id, None).unwrap();
        let turns = messages
            .iter()
            .map(|m| {
                let req = NewChatRequest {
                    message: (*m).into(),
                    ..Default::default()
                };
                chats::append_turn(&conn, &user.id, &conv.id, &req).unwrap()
            })
            .collect();
        drop(conn);
        (tmp, state, turns)
    }

    fn is_pending(state: &AppState, turn: &ChatTurn) -> bool {
        let conn = state.pool.get().unwrap();
        chats::list_pending(&conn, now_ms(), None, 100)
            .unwrap()
            .iter()
            .any(|p| p.turn.id == turn.id)
    }

    #[tokio::test]
    async fn failing_turn_does_not_starve_newer_ones() {
        let (_tmp, state, turns) = state_with_turns(&["bad input", "fine"]).await;

        let first = sweep_once(&state, Duration::ZERO, 1).await.unwrap();
        assert_eq!(first, SweepReport { answered: 0, failed: 1 });
        let second = sweep_once(&state, Duration::ZERO, 1).await.unwrap();
        assert_eq!(second, SweepReport { answered: 1, failed: 0 });

        assert!(is_pending(&state, &turns[0]));
        assert!(!is_pending(&state, &turns[1]));
    }

    #[tokio::test]
    async fn failures_rotate_through_the_backlog() {
        let (_tmp, state, turns) = state_with_turns(&["bad one", "bad two", "ok"]).await;
        for _ in 0..3 {
            sweep_once(&state, Duration::ZERO, 1).await.unwrap();
        }
        assert!(!is_pending(&state, &turns[2]));

        let conn = state.pool.get().unwrap();
        let left = chats::list_pending(&conn, now_ms(), None, 10).unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|p| p.attempts == 1));
    }
}
