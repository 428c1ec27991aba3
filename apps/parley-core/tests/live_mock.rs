use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use parley_core::config::LiveConfig;
use parley_core::upstream::live::WsLiveConnector;
use parley_core::upstream::{LiveConnector, LiveInput, LiveSessionParams, UpstreamTurnEvent};
use std::time::Duration;
use tokio::sync::mpsc;

async fn ws_handler(ws: WebSocketUpgrade, axum::extract::State(seen): axum::extract::State<mpsc::UnboundedSender<serde_json::Value>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, seen))
}

async fn handle_ws(mut socket: WebSocket, seen: mpsc::UnboundedSender<serde_json::Value>) {
    // Expect a session.update; answer session.updated
    let Some(Ok(Message::Text(t))) = socket.recv().await else { return };
    let _ = seen.send(serde_json::from_str(&t).unwrap_or_default());
    let _ = socket.send(Message::Text(r#"{"type":"session.updated"}"#.into())).await;
    let _ = socket.send(Message::Text(r#"{"type":"rate_limits.updated"}"#.into())).await;
    let _ = socket.send(Message::Text(r#"{"type":"transcript.delta","text":"hello"}"#.into())).await;
    let call = serde_json::json!({"type": "tool.call", "id": "1", "name": "emotion", "arguments": "{\"emotion\":\"SHY\"}"});
    let _ = socket.send(Message::Text(call.to_string())).await;

    // Expect the audio frame and the tool output
    for _ in 0..2 {
        if let Some(Ok(Message::Text(t))) = socket.recv().await {
            let _ = seen.send(serde_json::from_str(&t).unwrap_or_default());
        }
    }
    let _ = socket.send(Message::Text(r#"{"type":"response.done"}"#.into())).await;
    let _ = socket.send(Message::Close(None)).await;
}

#[tokio::test]
async fn live_connector_speaks_the_event_protocol() {
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let app = Router::new().route("/live", get(ws_handler)).with_state(seen_tx);
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap(); });

    let cfg = LiveConfig { endpoint: format!("{}:{}/live", addr.ip(), addr.port()), ..LiveConfig::default() };
    let connector = WsLiveConnector::new(&cfg);
    let params = LiveSessionParams {
        session_id: "s1".into(),
        instructions: "You are Mira.".into(),
        voice: None,
        tools: parley_core::tools::tool_declarations(),
    };
    let mut conn = connector.open(params).await.unwrap();

    let update = seen.recv().await.unwrap();
    assert_eq!(update["type"], "session.update");
    assert_eq!(update["session"]["instructions"], "You are Mira.");
    assert_eq!(update["session"]["tools"].as_array().map(|t| t.len()), Some(4));

    tokio::time::timeout(Duration::from_secs(2), &mut conn.ready).await.unwrap().unwrap();
    let ev = conn.events.recv().await.unwrap();
    assert_eq!(ev, UpstreamTurnEvent::PartialTranscript("hello".into()));
    let ev = conn.events.recv().await.unwrap();
    assert_eq!(
        ev,
        UpstreamTurnEvent::ToolCall { id: Some("1".into()), name: "emotion".into(), args: serde_json::json!({"emotion": "SHY"}) }
    );

    let sender = conn.sender();
    sender.send(LiveInput::Audio(vec![0, 0, 1, 0])).await.unwrap();
    sender.send(LiveInput::ToolOutput { id: Some("1".into()), name: "emotion".into(), output: serde_json::json!({"ok": true}) }).await.unwrap();
    let audio = seen.recv().await.unwrap();
    assert_eq!(audio["type"], "input_audio_buffer.append");
    assert_eq!(audio["audio"], "AAABAA==");
    let out = seen.recv().await.unwrap();
    assert_eq!(out["type"], "tool.output");
    assert_eq!(out["id"], "1");

    assert_eq!(conn.events.recv().await, Some(UpstreamTurnEvent::TurnComplete));
    // remote close ends the event stream
    assert_eq!(tokio::time::timeout(Duration::from_secs(2), conn.events.recv()).await.unwrap(), None);
    conn.close().await;
}

#[tokio::test]
async fn unreachable_live_service_fails_to_open() {
    let cfg = LiveConfig { endpoint: "ws://127.0.0.1:1/live".into(), ..LiveConfig::default() };
    let connector = WsLiveConnector::new(&cfg);
    let params = LiveSessionParams { session_id: "s2".into(), instructions: String::new(), voice: None, tools: vec![] };
    assert!(connector.open(params).await.is_err());
}
