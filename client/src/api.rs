use async_trait::async_trait;
use chat_api::{
    AttachResponseRequest, AuthResponse, ChatTurn, ConversationDetail, ConversationList,
    ConversationSummary, CreateConversationRequest, LoginRequest, NewChatRequest,
    RenameConversationRequest, SignupRequest, UserProfile,
};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::ClientError;

/// Ceiling for every call to the conversation service.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The conversation endpoints of the REST surface, as seen by a signed-in user.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError>;

    async fn create_conversation(
        &self,
        title: Option<&str>,
    ) -> Result<ConversationSummary, ClientError>;

    async fn get_conversation(&self, id: &str) -> Result<ConversationDetail, ClientError>;

    async fn rename_conversation(
        &self,
        id: &str,
        title: &str,
    ) -> Result<ConversationSummary, ClientError>;

    async fn append_turn(
        &self,
        conversation_id: &str,
        req: &NewChatRequest,
    ) -> Result<ChatTurn, ClientError>;

    async fn attach_response(
        &self,
        conversation_id: &str,
        chat_id: &str,
        req: &AttachResponseRequest,
    ) -> Result<ChatTurn, ClientError>;

    async fn delete_conversation(&self, id: &str) -> Result<(), ClientError>;
}

/// [`ConversationApi`] over HTTP, plus the account endpoints that produce
/// the bearer token it sends.
#[derive(Clone, Debug)]
pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpApi {
    /// `server` is the root of the service; routes are resolved under `/api/`.
    /// A path on `server` is kept whether or not it ends in a slash.
    pub fn new(server: Url) -> Result<Self, ClientError> {
        Self::with_timeout(server, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(mut server: Url, timeout: Duration) -> Result<Self, ClientError> {
        if !server.path().ends_with('/') {
            let path = format!("{}/", server.path());
            server.set_path(&path);
        }
        let base = server
            .join("api/")
            .map_err(|e| ClientError::Transport(format!("invalid server url: {e}")))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            token: None,
        })
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub async fn signup(
        &mut self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<UserProfile, ClientError> {
        let body = SignupRequest {
            name: Some(name.into()),
            email: Some(email.into()),
            password: Some(password.into()),
        };
        let resp: AuthResponse = self
            .send(self.client.post(self.endpoint("auth/signup")?).json(&body))
            .await?;
        self.token = Some(resp.token);
        Ok(resp.user)
    }

    pub async fn login(&mut self, email: &str, password: &str) -> Result<UserProfile, ClientError> {
        let body = LoginRequest {
            email: Some(email.into()),
            password: Some(password.into()),
        };
        let resp: AuthResponse = self
            .send(self.client.post(self.endpoint("auth/login")?).json(&body))
            .await?;
        self.token = Some(resp.token);
        Ok(resp.user)
    }

    pub async fn me(&self) -> Result<UserProfile, ClientError> {
        self.send(self.client.get(self.endpoint("auth/me")?)).await
    }

    /// Swap the current token for a fresh one.
    pub async fn refresh(&mut self) -> Result<UserProfile, ClientError> {
        let resp: AuthResponse = self
            .send(self.client.post(self.endpoint("auth/refresh")?))
            .await?;
        self.token = Some(resp.token);
        Ok(resp.user)
    }

    pub fn logout(&mut self) {
        self.token = None;
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|e| ClientError::Transport(format!("invalid endpoint {path}: {e}")))
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(%status, "conversation service returned an error");
            return Err(ClientError::from_body(status.as_u16(), &body));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let list: ConversationList = self
            .send(self.client.get(self.endpoint("conversations")?))
            .await?;
        Ok(list.conversations)
    }

    async fn create_conversation(
        &self,
        title: Option<&str>,
    ) -> Result<ConversationSummary, ClientError> {
        let body = CreateConversationRequest {
            title: title.map(Into::into),
        };
        self.send(self.client.post(self.endpoint("conversations")?).json(&body))
            .await
    }

    async fn get_conversation(&self, id: &str) -> Result<ConversationDetail, ClientError> {
        self.send(
            self.client
                .get(self.endpoint(&format!("conversations/{id}"))?),
        )
        .await
    }

    async fn rename_conversation(
        &self,
        id: &str,
        title: &str,
    ) -> Result<ConversationSummary, ClientError> {
        let body = RenameConversationRequest {
            title: title.into(),
        };
        self.send(
            self.client
                .put(self.endpoint(&format!("conversations/{id}"))?)
                .json(&body),
        )
        .await
    }

    async fn append_turn(
        &self,
        conversation_id: &str,
        req: &NewChatRequest,
    ) -> Result<ChatTurn, ClientError> {
        self.send(
            self.client
                .post(self.endpoint(&format!("conversations/{conversation_id}/chats"))?)
                .json(req),
        )
        .await
    }

    async fn attach_response(
        &self,
        conversation_id: &str,
        chat_id: &str,
        req: &AttachResponseRequest,
    ) -> Result<ChatTurn, ClientError> {
        self.send(
            self.client
                .put(self.endpoint(&format!(
                    "conversations/{conversation_id}/chats/{chat_id}"
                ))?)
                .json(req),
        )
        .await
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .send(
                self.client
                    .delete(self.endpoint(&format!("conversations/{id}"))?),
            )
            .await?;
        Ok(())
    }
}
