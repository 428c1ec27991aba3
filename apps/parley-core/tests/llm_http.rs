use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::post, Json, Router};
use parley_core::config::LlmConfig;
use parley_core::llm::{HttpLlmClient, LlmClient};
use parley_core::retry::RetryPolicy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn serve(embed_calls: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new()
        .route(
            "/v1/embeddings",
            post(move |Json(body): Json<serde_json::Value>| {
                let calls = embed_calls.clone();
                async move {
                    // first call is overloaded
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response();
                    }
                    if body["model"] == "bogus" {
                        return (StatusCode::BAD_REQUEST, "unknown model").into_response();
                    }
                    Json(serde_json::json!({"data": [{"embedding": [0.5, -1.0, 2.0]}]})).into_response()
                }
            }),
        )
        .route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["response_format"]["type"], "json_schema");
                let content = serde_json::json!({"summary": "likes tea", "topics": ["tea"]}).to_string();
                Json(serde_json::json!({"choices": [{"message": {"role": "assistant", "content": content}}]}))
            }),
        );
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap(); });
    addr
}

fn client(addr: SocketAddr) -> HttpLlmClient {
    HttpLlmClient::new(&LlmConfig { endpoint: format!("http://{addr}/v1/"), api_key_env: None, ..LlmConfig::default() }).unwrap()
}

#[tokio::test]
async fn transient_embedding_failure_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let llm = client(serve(calls.clone()).await);

    let first = llm.embed("small", "hello").await.unwrap_err();
    assert!(first.is_transient(), "{first:?}");

    let retry = RetryPolicy { attempts: 3, initial_delay: Duration::from_millis(5), factor: 2 };
    calls.store(0, Ordering::SeqCst);
    let v = retry.run("embed", || llm.embed("small", "hello")).await.unwrap();
    assert_eq!(v, vec![0.5, -1.0, 2.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_requests_are_not_retried() {
    let calls = Arc::new(AtomicUsize::new(1));
    let llm = client(serve(calls.clone()).await);
    let retry = RetryPolicy { attempts: 3, initial_delay: Duration::from_millis(5), factor: 2 };
    let err = retry.run("embed", || llm.embed("bogus", "hello")).await.unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn summarize_returns_structured_content() {
    let llm = client(serve(Arc::new(AtomicUsize::new(1))).await);
    let raw = llm
        .summarize("mini", "summarize", "[2025-01-01 10:00:00] USER: I like tea", &parley_core::memory::consolidator::summary_schema())
        .await
        .unwrap();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(v["summary"], "likes tea");
}
