#![allow(dead_code)]

use ai_relay::{AiRelay, FileUpload, InferenceFailure, RelayAnswer};
use async_trait::async_trait;
use chat_api::HistoryTurn;
use health_assistant::{
    api::{build_router, AppState},
    config::Config,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
};
use tokio::task::JoinHandle;

/// Answers `re: <message>` unless told to fail, and records what it was asked.
#[derive(Default)]
pub struct FakeRelay {
    pub fail: Mutex<Option<InferenceFailure>>,
    pub asked: Mutex<Vec<(String, Vec<HistoryTurn>)>>,
}

#[async_trait]
impl AiRelay for FakeRelay {
    async fn ask(
        &self,
        message: &str,
        history: &[HistoryTurn],
    ) -> Result<RelayAnswer, InferenceFailure> {
        self.asked.lock().push((message.into(), history.to_vec()));
        if let Some(failure) = self.fail.lock().clone() {
            return Err(failure);
        }
        Ok(RelayAnswer {
            text: format!("re: {message}"),
            latency_ms: 42,
        })
    }

    async fn ask_with_file(
        &self,
        file: FileUpload,
        history: &[HistoryTurn],
    ) -> Result<RelayAnswer, InferenceFailure> {
        self.ask(&format!("file {}", file.name), history).await
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub relay: Arc<FakeRelay>,
    pub client: reqwest::Client,
    handle: JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/api{}", self.addr, path)
    }

    /// Sign up a fresh account and return its bearer token.
    pub async fn signup(&self, name: &str, email: &str) -> String {
        let resp = self
            .client
            .post(self.url("/auth/signup"))
            .json(&json!({"name": name, "email": email, "password": "secret1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let v: Value = resp.json().await.unwrap();
        v["token"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_server() -> TestServer {
    spawn_with(|_| {}).await
}

pub async fn spawn_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::new(addr.to_string(), tmp.path());
    config.auth.jwt_secret = Some("test-secret".into());
    tweak(&mut config);
    let relay = Arc::new(FakeRelay::default());
    let state = AppState::new(config, relay.clone()).await.unwrap();
    let app = build_router(state.clone());
    let handle = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    TestServer {
        addr,
        state,
        relay,
        client: reqwest::Client::new(),
        handle,
        _tmp: tmp,
    }
}
