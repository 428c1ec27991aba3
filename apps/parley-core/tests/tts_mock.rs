use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use parley_core::config::TtsConfig;
use parley_core::error::UpstreamError;
use parley_core::upstream::tts::WsTtsConnector;
use parley_core::upstream::{TtsChunk, TtsConnector};
use std::net::SocketAddr;
use std::time::Duration;

async fn ws_handler(ws: WebSocketUpgrade, Path(voice): Path<String>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, voice))
}

async fn handle_ws(mut socket: WebSocket, voice: String) {
    if voice == "missing" {
        let _ = socket.send(Message::Text(r#"{"status":"error","code":400002,"message":"voice not found"}"#.into())).await;
        return;
    }
    let mut text = String::new();
    while let Some(Ok(Message::Text(t))) = socket.recv().await {
        if t == "EOS" { break; }
        let v: serde_json::Value = serde_json::from_str(&t).unwrap();
        text.push_str(v["text"].as_str().unwrap());
        text.push('|');
    }
    let _ = socket.send(Message::Text(r#"{"status":"streaming"}"#.into())).await;
    let _ = socket.send(Message::Binary(text.into_bytes())).await;
    let _ = socket.send(Message::Text(r#"{"status":"done"}"#.into())).await;
}

async fn serve() -> SocketAddr {
    let app = Router::new().route("/tts/:voice", get(ws_handler));
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap(); });
    addr
}

#[tokio::test]
async fn tts_streams_audio_for_each_utterance() {
    let addr = serve().await;
    let connector = WsTtsConnector::new(&TtsConfig { endpoint: format!("ws://{addr}/tts/"), connect_timeout_ms: 2000, ..TtsConfig::default() });
    let mut stream = connector.open("mira").await.unwrap();
    stream.send_text("Hello there, friend.").await.unwrap();
    stream.send_text("How was your day?").await.unwrap();
    stream.finish().await.unwrap();

    let mut chunks = vec![];
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(2), stream.recv()).await.unwrap() {
        chunks.push(chunk.unwrap());
    }
    assert_eq!(
        chunks,
        vec![
            TtsChunk::StartOfStream,
            TtsChunk::Audio(b"Hello there, friend.|How was your day?|".to_vec()),
            TtsChunk::EndOfStream,
        ]
    );
    stream.close().await;
}

#[tokio::test]
async fn unknown_voice_is_a_distinct_error() {
    let addr = serve().await;
    let connector = WsTtsConnector::new(&TtsConfig { endpoint: format!("ws://{addr}/tts"), connect_timeout_ms: 2000, ..TtsConfig::default() });
    let mut stream = connector.open("missing").await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), stream.recv()).await.unwrap();
    assert_eq!(first, Some(Err(UpstreamError::NoSuchVoice("missing".into()))));
    stream.close().await;
}
