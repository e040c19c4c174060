use ai_relay::{AiRelay, FileUpload, HttpRelay, DEFAULT_TIMEOUT};
use axum::{
    extract::Multipart,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chat_api::HistoryTurn;
use serde_json::{json, Value};
use std::{
    net::{SocketAddr, TcpListener},
    time::Duration,
};
use tokio::task::JoinHandle;
use url::Url;

async fn chat(Json(body): Json<Value>) -> Json<Value> {
    let history = body["history"].as_array().map(|h| h.len()).unwrap_or(0);
    Json(json!({
        "response": format!("echo: {} ({} prior)", body["message"].as_str().unwrap_or(""), history),
        "processing_time": 42
    }))
}

async fn analyze(mut multipart: Multipart) -> Json<Value> {
    let mut name = String::new();
    let mut size = 0;
    let mut history = Value::Null;
    while let Some(field) = multipart.next_field().await.unwrap() {
        match field.name() {
            Some("file") => {
                name = field.file_name().unwrap_or_default().to_string();
                size = field.bytes().await.unwrap().len();
            }
            Some("history") => {
                history = serde_json::from_str(&field.text().await.unwrap()).unwrap();
            }
            _ => {}
        }
    }
    Json(json!({
        "response": format!("{name}:{size}:{}", history.as_array().map(|h| h.len()).unwrap_or(0)),
    }))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_millis(500)).await;
    Json(json!({"response": "too late"}))
}

async fn broken() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

fn spawn(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server)
}

fn relay(addr: SocketAddr, timeout: Duration) -> HttpRelay {
    HttpRelay::new(Url::parse(&format!("http://{}", addr)).unwrap(), timeout).unwrap()
}

fn history() -> Vec<HistoryTurn> {
    vec![
        HistoryTurn {
            message: "first".into(),
            response: Some("answer".into()),
        },
        HistoryTurn {
            message: "second".into(),
            response: None,
        },
    ]
}

#[tokio::test]
async fn text_question_carries_history() {
    let (addr, server) = spawn(Router::new().route("/chat", post(chat)));
    let answer = relay(addr, DEFAULT_TIMEOUT)
        .ask("hello", &history())
        .await
        .unwrap();
    assert_eq!(answer.text, "echo: hello (2 prior)");
    assert_eq!(answer.latency_ms, 42);
    server.abort();
}

#[tokio::test]
async fn file_is_sent_as_multipart() {
    let (addr, server) = spawn(Router::new().route("/analyze-file", post(analyze)));
    let file = FileUpload::new("labs.txt", b"glucose 5.1".to_vec());
    let answer = relay(addr, DEFAULT_TIMEOUT)
        .ask_with_file(file, &history())
        .await
        .unwrap();
    assert_eq!(answer.text, "labs.txt:11:2");
    server.abort();
}

#[tokio::test]
async fn slow_service_times_out() {
    let (addr, server) = spawn(Router::new().route("/chat", post(slow)));
    let err = relay(addr, Duration::from_millis(100))
        .ask("hello", &[])
        .await
        .unwrap_err();
    assert!(err.timed_out);
    server.abort();
}

#[tokio::test]
async fn error_status_is_inference_failure() {
    let (addr, server) = spawn(Router::new().route("/chat", post(broken)));
    let err = relay(addr, DEFAULT_TIMEOUT)
        .ask("hello", &[])
        .await
        .unwrap_err();
    assert!(!err.timed_out);
    assert!(err.message.contains("500"));
    server.abort();
}

#[tokio::test]
async fn unreachable_service_is_inference_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = relay(addr, DEFAULT_TIMEOUT)
        .ask("hello", &[])
        .await
        .unwrap_err();
    assert!(!err.timed_out);
}
