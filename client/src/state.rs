use ai_relay::{AiRelay, FileUpload};
use chat_api::{
    AttachResponseRequest, ChatTurn, ConversationSummary, HistoryTurn, MessageKind,
    NewChatRequest,
};
use tracing::{debug, warn};

use crate::{api::ConversationApi, error::ClientError};

/// What the user is about to send.
#[derive(Debug, Clone)]
pub enum Draft {
    Text(String),
    File(FileUpload),
}

impl Draft {
    /// An attached file takes precedence over typed text.
    pub fn new(text: impl Into<String>, file: Option<FileUpload>) -> Self {
        match file {
            Some(file) => Draft::File(file),
            None => Draft::Text(text.into()),
        }
    }
}

/// In-memory mirror of a user's conversations and the open thread.
///
/// Mutating actions take `&mut self`, so one state object can never have
/// two sends in flight.
pub struct ChatState<A, R> {
    api: A,
    relay: R,
    conversations: Vec<ConversationSummary>,
    current: Option<ConversationSummary>,
    turns: Vec<ChatTurn>,
    loaded: bool,
    last_error: Option<ClientError>,
}

impl<A: ConversationApi, R: AiRelay> ChatState<A, R> {
    pub fn new(api: A, relay: R) -> Self {
        Self {
            api,
            relay,
            conversations: Vec::new(),
            current: None,
            turns: Vec::new(),
            loaded: false,
            last_error: None,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn current(&self) -> Option<&ConversationSummary> {
        self.current.as_ref()
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Fetch the conversation list unless it is already cached.
    pub async fn load_conversations(&mut self) -> Result<&[ConversationSummary], ClientError> {
        if !self.loaded {
            self.refresh().await?;
        }
        Ok(&self.conversations)
    }

    /// Fetch the conversation list regardless of the cache.
    pub async fn refresh(&mut self) -> Result<(), ClientError> {
        let listed = self.api.list_conversations().await;
        let list = self.record(listed)?;
        self.conversations = list;
        self.loaded = true;
        Ok(())
    }

    pub fn invalidate(&mut self) {
        self.loaded = false;
    }

    /// Drop everything, e.g. on logout.
    pub fn reset(&mut self) {
        self.conversations.clear();
        self.current = None;
        self.turns.clear();
        self.loaded = false;
        self.last_error = None;
    }

    /// Make `id` the open thread, replacing the local turns wholesale.
    pub async fn open(&mut self, id: &str) -> Result<(), ClientError> {
        let fetched = self.api.get_conversation(id).await;
        let detail = self.record(fetched)?;
        self.current = Some(detail.conversation);
        self.turns = detail.chats;
        Ok(())
    }

    pub async fn create_conversation(
        &mut self,
        title: Option<&str>,
    ) -> Result<ConversationSummary, ClientError> {
        let created = self.api.create_conversation(title).await;
        let summary = self.record(created)?;
        self.conversations.insert(0, summary.clone());
        Ok(summary)
    }

    pub async fn rename(&mut self, id: &str, title: &str) -> Result<(), ClientError> {
        let renamed = self.api.rename_conversation(id, title).await;
        let summary = self.record(renamed)?;
        for entry in self
            .conversations
            .iter_mut()
            .chain(self.current.iter_mut())
            .filter(|c| c.id == summary.id)
        {
            entry.title = summary.title.clone();
        }
        Ok(())
    }

    /// Record the draft, ask the relay, then attach the answer.
    ///
    /// The recorded turn is shown as pending right away. If the relay or the
    /// patch fails, the error is kept in `last_error` and the turn stays
    /// pending locally and on the server.
    pub async fn send(&mut self, draft: Draft) -> Result<ChatTurn, ClientError> {
        let sent = self.try_send(draft).await;
        self.record(sent)
    }

    async fn try_send(&mut self, draft: Draft) -> Result<ChatTurn, ClientError> {
        let (req, file) = match draft {
            Draft::Text(text) => {
                let message = text.trim();
                if message.is_empty() {
                    return Err(ClientError::EmptyMessage);
                }
                let req = NewChatRequest {
                    message: message.into(),
                    message_type: MessageKind::Text,
                    file_info: None,
                };
                (req, None)
            }
            Draft::File(file) => {
                let req = NewChatRequest {
                    message: format!("Uploaded file: {}", file.name),
                    message_type: MessageKind::File,
                    file_info: Some(file.info()),
                };
                (req, Some(file))
            }
        };

        let open_id = self.current.as_ref().map(|c| c.id.clone());
        let conversation_id = match open_id {
            Some(id) => id,
            None => {
                let created = self.api.create_conversation(None).await?;
                self.conversations.insert(0, created.clone());
                let detail = self.api.get_conversation(&created.id).await?;
                self.current = Some(detail.conversation);
                self.turns = detail.chats;
                created.id
            }
        };

        let history: Vec<HistoryTurn> = self.turns.iter().map(HistoryTurn::from).collect();
        let turn = self.api.append_turn(&conversation_id, &req).await?;
        self.turns.push(turn.clone());
        self.note_activity(&conversation_id, turn.created_at);
        debug!(conversation_id = %conversation_id, chat_id = %turn.id, "turn pending");

        let answer = match file {
            Some(file) => self.relay.ask_with_file(file, &history).await?,
            None => self.relay.ask(&turn.message, &history).await?,
        };
        let patch = AttachResponseRequest {
            response: answer.text,
            processing_time: Some(answer.latency_ms),
            expected_version: Some(turn.version),
        };
        let updated = self
            .api
            .attach_response(&conversation_id, &turn.id, &patch)
            .await?;
        if let Some(slot) = self.turns.iter_mut().find(|t| t.id == updated.id) {
            *slot = updated.clone();
        }
        Ok(updated)
    }

    /// Delete a conversation after `confirm` approves it.
    ///
    /// Returns `Ok(false)` without any request when the user declines.
    pub async fn delete<F>(&mut self, id: &str, confirm: F) -> Result<bool, ClientError>
    where
        F: FnOnce(&ConversationSummary) -> bool,
    {
        let known = self
            .conversations
            .iter()
            .chain(self.current.iter())
            .find(|c| c.id == id)
            .cloned();
        let summary = match known {
            Some(summary) => summary,
            None => {
                return self.record(Err(ClientError::Api {
                    status: 404,
                    message: "Conversation not found".into(),
                }))
            }
        };
        if !confirm(&summary) {
            return Ok(false);
        }
        let deleted = self.api.delete_conversation(id).await;
        self.record(deleted)?;
        self.conversations.retain(|c| c.id != id);
        if self.current.as_ref().is_some_and(|c| c.id == id) {
            self.current = None;
            self.turns.clear();
        }
        Ok(true)
    }

    /// Move a conversation to the top of the list after a new turn.
    fn note_activity(&mut self, conversation_id: &str, at: i64) {
        if let Some(pos) = self.conversations.iter().position(|c| c.id == conversation_id) {
            let mut entry = self.conversations.remove(pos);
            entry.chat_count += 1;
            entry.last_message_at = entry.last_message_at.max(at);
            self.conversations.insert(0, entry);
        }
        if let Some(current) = self.current.as_mut() {
            current.chat_count += 1;
            current.last_message_at = current.last_message_at.max(at);
        }
    }

    fn record<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        match result {
            Ok(v) => {
                self.last_error = None;
                Ok(v)
            }
            Err(e) => {
                warn!(error = %e, "chat action failed");
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_relay::{InferenceFailure, RelayAnswer};
    use async_trait::async_trait;
    use chat_api::ConversationDetail;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory stand-in for the conversation service.
    #[derive(Default)]
    struct MemApi {
        calls: Mutex<Vec<String>>,
        convs: Mutex<Vec<ConversationSummary>>,
        turns: Mutex<HashMap<String, Vec<ChatTurn>>>,
        fail_attach: bool,
    }

    impl MemApi {
        fn log(&self, call: &str) {
            self.calls.lock().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn missing() -> ClientError {
            ClientError::Api {
                status: 404,
                message: "Conversation not found".into(),
            }
        }
    }

    #[async_trait]
    impl ConversationApi for MemApi {
        async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
            self.log("list");
            Ok(self.convs.lock().clone())
        }

        async fn create_conversation(
            &self,
            title: Option<&str>,
        ) -> Result<ConversationSummary, ClientError> {
            self.log("create");
            let mut convs = self.convs.lock();
            let summary = ConversationSummary {
                id: format!("c{}", convs.len() + 1),
                title: title.unwrap_or("New Conversation").into(),
                active: true,
                chat_count: 0,
                last_message_at: 0,
                created_at: 0,
            };
            convs.insert(0, summary.clone());
            Ok(summary)
        }

        async fn get_conversation(&self, id: &str) -> Result<ConversationDetail, ClientError> {
            self.log("get");
            let conversation = self
                .convs
                .lock()
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(Self::missing)?;
            let chats = self.turns.lock().get(id).cloned().unwrap_or_default();
            Ok(ConversationDetail {
                conversation,
                chats,
            })
        }

        async fn rename_conversation(
            &self,
            id: &str,
            title: &str,
        ) -> Result<ConversationSummary, ClientError> {
            self.log("rename");
            let mut convs = self.convs.lock();
            let conv = convs
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(Self::missing)?;
            conv.title = title.into();
            Ok(conv.clone())
        }

        async fn append_turn(
            &self,
            conversation_id: &str,
            req: &NewChatRequest,
        ) -> Result<ChatTurn, ClientError> {
            self.log("append");
            let mut turns = self.turns.lock();
            let list = turns.entry(conversation_id.to_string()).or_default();
            let turn = ChatTurn {
                id: format!("t{}", list.len() + 1),
                message: req.message.clone(),
                response: None,
                message_type: req.message_type,
                file_info: req.file_info.clone(),
                is_processed: false,
                processing_time: None,
                version: 0,
                created_at: list.len() as i64 + 1,
            };
            list.push(turn.clone());
            Ok(turn)
        }

        async fn attach_response(
            &self,
            conversation_id: &str,
            chat_id: &str,
            req: &AttachResponseRequest,
        ) -> Result<ChatTurn, ClientError> {
            self.log("attach");
            if self.fail_attach {
                return Err(ClientError::Timeout);
            }
            let mut turns = self.turns.lock();
            let turn = turns
                .get_mut(conversation_id)
                .and_then(|l| l.iter_mut().find(|t| t.id == chat_id))
                .ok_or_else(Self::missing)?;
            turn.response = Some(req.response.clone());
            turn.processing_time = req.processing_time;
            turn.is_processed = true;
            turn.version += 1;
            Ok(turn.clone())
        }

        async fn delete_conversation(&self, id: &str) -> Result<(), ClientError> {
            self.log("delete");
            self.convs.lock().retain(|c| c.id != id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct EchoRelay {
        fail: bool,
        asked: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl AiRelay for EchoRelay {
        async fn ask(
            &self,
            message: &str,
            history: &[HistoryTurn],
        ) -> Result<RelayAnswer, InferenceFailure> {
            self.asked.lock().push((message.into(), history.len()));
            if self.fail {
                return Err(InferenceFailure::timeout());
            }
            Ok(RelayAnswer {
                text: format!("echo {message}"),
                latency_ms: 9,
            })
        }

        async fn ask_with_file(
            &self,
            file: FileUpload,
            history: &[HistoryTurn],
        ) -> Result<RelayAnswer, InferenceFailure> {
            self.asked
                .lock()
                .push((format!("file:{}", file.name), history.len()));
            Ok(RelayAnswer {
                text: "looks fine".into(),
                latency_ms: 11,
            })
        }
    }

    fn state() -> ChatState<MemApi, EchoRelay> {
        ChatState::new(MemApi::default(), EchoRelay::default())
    }

    #[tokio::test]
    async fn list_is_cached_until_invalidated() {
        let mut s = state();
        s.load_conversations().await.unwrap();
        s.load_conversations().await.unwrap();
        assert_eq!(s.api().calls(), vec!["list"]);
        assert!(s.is_loaded());
        s.invalidate();
        s.load_conversations().await.unwrap();
        s.refresh().await.unwrap();
        assert_eq!(s.api().calls(), vec!["list", "list", "list"]);
    }

    #[tokio::test]
    async fn empty_text_sends_nothing() {
        let mut s = state();
        let err = s.send(Draft::Text("   ".into())).await.unwrap_err();
        assert_eq!(err, ClientError::EmptyMessage);
        assert_eq!(s.last_error(), Some(&ClientError::EmptyMessage));
        assert!(s.api().calls().is_empty());
        assert!(s.current().is_none());
    }

    #[tokio::test]
    async fn first_send_creates_and_opens_a_conversation() {
        let mut s = state();
        let turn = s.send(Draft::Text(" hello ".into())).await.unwrap();
        assert_eq!(
            s.api().calls(),
            vec!["create", "get", "append", "attach"]
        );
        assert_eq!(s.current().unwrap().id, "c1");
        assert_eq!(s.current().unwrap().chat_count, 1);
        assert_eq!(turn.response.as_deref(), Some("echo hello"));
        assert_eq!(s.turns().len(), 1);
        assert!(s.turns()[0].is_processed);
        assert_eq!(s.conversations()[0].id, "c1");
        assert!(s.last_error().is_none());
    }

    #[tokio::test]
    async fn relay_gets_prior_turns_as_history() {
        let mut s = state();
        s.send(Draft::Text("one".into())).await.unwrap();
        s.send(Draft::Text("two".into())).await.unwrap();
        assert_eq!(
            *s.relay.asked.lock(),
            vec![("one".to_string(), 0), ("two".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn file_wins_over_text() {
        let mut s = state();
        let draft = Draft::new("ignored", Some(FileUpload::new("labs.pdf", vec![1u8, 2, 3])));
        let turn = s.send(draft).await.unwrap();
        assert_eq!(turn.message, "Uploaded file: labs.pdf");
        assert_eq!(turn.message_type, MessageKind::File);
        let info = turn.file_info.unwrap();
        assert_eq!(info.size, 3);
        assert_eq!(info.mimetype, "application/pdf");
        assert_eq!(s.relay.asked.lock()[0].0, "file:labs.pdf");
    }

    #[tokio::test]
    async fn relay_failure_leaves_turn_pending() {
        let mut s = ChatState::new(
            MemApi::default(),
            EchoRelay {
                fail: true,
                ..Default::default()
            },
        );
        let err = s.send(Draft::Text("hello".into())).await.unwrap_err();
        assert!(matches!(err, ClientError::Inference(ref f) if f.timed_out));
        assert_eq!(s.last_error(), Some(&err));
        assert_eq!(s.turns().len(), 1);
        assert!(s.turns()[0].is_pending());
        assert!(!s.api().calls().contains(&"attach".to_string()));
    }

    #[tokio::test]
    async fn attach_failure_leaves_turn_pending() {
        let mut s = ChatState::new(
            MemApi {
                fail_attach: true,
                ..Default::default()
            },
            EchoRelay::default(),
        );
        assert_eq!(
            s.send(Draft::Text("hello".into())).await.unwrap_err(),
            ClientError::Timeout
        );
        assert!(s.turns()[0].is_pending());
        s.clear_error();
        assert!(s.last_error().is_none());
    }

    #[tokio::test]
    async fn declined_delete_does_nothing() {
        let mut s = state();
        let c = s.create_conversation(Some("Sleep")).await.unwrap();
        let mut asked = None;
        let done = s
            .delete(&c.id, |summary| {
                asked = Some(summary.title.clone());
                false
            })
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(asked.as_deref(), Some("Sleep"));
        assert_eq!(s.conversations().len(), 1);
        assert!(!s.api().calls().contains(&"delete".to_string()));
    }

    #[tokio::test]
    async fn deleting_open_conversation_clears_thread() {
        let mut s = state();
        let keep = s.create_conversation(Some("keep")).await.unwrap();
        let drop_me = s.create_conversation(Some("drop")).await.unwrap();
        s.open(&drop_me.id).await.unwrap();
        s.send(Draft::Text("hello".into())).await.unwrap();

        assert!(s.delete(&drop_me.id, |_| true).await.unwrap());
        assert!(s.current().is_none());
        assert!(s.turns().is_empty());
        assert_eq!(
            s.conversations().iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec![keep.id.as_str()]
        );
    }

    #[tokio::test]
    async fn rename_updates_list_and_current() {
        let mut s = state();
        let c = s.create_conversation(None).await.unwrap();
        s.open(&c.id).await.unwrap();
        s.rename(&c.id, "Allergies").await.unwrap();
        assert_eq!(s.conversations()[0].title, "Allergies");
        assert_eq!(s.current().unwrap().title, "Allergies");
    }

    #[tokio::test]
    async fn reset_forgets_everything() {
        let mut s = state();
        s.send(Draft::Text("hi".into())).await.unwrap();
        s.load_conversations().await.unwrap();
        s.reset();
        assert!(s.conversations().is_empty());
        assert!(s.current().is_none());
        assert!(s.turns().is_empty());
        assert!(!s.is_loaded());
    }

    #[tokio::test]
    async fn open_unknown_conversation_records_error() {
        let mut s = state();
        let err = s.open("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(s.last_error(), Some(&err));
    }
}
