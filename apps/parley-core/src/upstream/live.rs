use super::{LiveConnection, LiveConnector, LiveInput, LiveSessionParams, UpstreamTurnEvent, LIVE_EVENT_CHANNEL_SIZE, LIVE_INPUT_CHANNEL_SIZE};
use crate::config::LiveConfig;
use crate::error::UpstreamError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type LiveSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Live service client speaking the tagged JSON event protocol over WebSocket.
pub struct WsLiveConnector {
    endpoint: String,
    model: String,
    voice: Option<String>,
    api_key_env: Option<String>,
}

impl WsLiveConnector {
    pub fn new(cfg: &LiveConfig) -> Self {
        let mut endpoint = cfg.endpoint.clone();
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            endpoint = format!("ws://{}", endpoint);
        }
        Self { endpoint, model: cfg.model.clone(), voice: cfg.voice.clone(), api_key_env: cfg.api_key_env.clone() }
    }
}

#[async_trait]
impl LiveConnector for WsLiveConnector {
    async fn open(&self, params: LiveSessionParams) -> Result<LiveConnection, UpstreamError> {
        let mut req = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Protocol(format!("bad endpoint {}: {}", self.endpoint, e)))?;
        if let Some(key) = self.api_key_env.as_deref().and_then(|name| std::env::var(name).ok()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| UpstreamError::Protocol("api key is not a valid header value".into()))?;
            req.headers_mut().insert("Authorization", value);
        }

        debug!(session_id = %params.session_id, endpoint = %self.endpoint, "connecting to live service");
        let (mut ws, _resp) = tokio_tungstenite::connect_async(req).await?;

        let update = json!({
            "type": "session.update",
            "session": {
                "model": self.model,
                "instructions": params.instructions,
                "voice": params.voice.as_ref().or(self.voice.as_ref()),
                "modalities": ["text"],
                "input_audio_format": "pcm16",
                "turn_detection": { "type": "server_vad" },
                "tools": params.tools,
            }
        });
        ws.send(Message::Text(update.to_string())).await?;
        info!(session_id = %params.session_id, "live connection opened");

        let (ready_tx, ready_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(LIVE_EVENT_CHANNEL_SIZE);
        let (input_tx, input_rx) = mpsc::channel(LIVE_INPUT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_socket(ws, ready_tx, events_tx, input_rx, cancel.clone(), params.session_id));
        Ok(LiveConnection::new(ready_rx, events_rx, input_tx, cancel, Some(task)))
    }
}

async fn run_socket(
    mut ws: LiveSocket,
    ready_tx: oneshot::Sender<()>,
    events_tx: mpsc::Sender<UpstreamTurnEvent>,
    mut input_rx: mpsc::Receiver<LiveInput>,
    cancel: CancellationToken,
    session_id: String,
) {
    let mut ready_tx = Some(ready_tx);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => { let _ = ws.close(None).await; break; }
            input = input_rx.recv() => match input {
                Some(input) => {
                    if let Err(e) = ws.send(Message::Text(encode_input(&input))).await {
                        warn!(%session_id, error = %e, "live send failed");
                        forward(&events_tx, &cancel, UpstreamTurnEvent::Error(e.into())).await;
                        break;
                    }
                }
                None => { let _ = ws.close(None).await; break; }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(txt))) => match decode_frame(&txt) {
                    LiveFrame::Ready => {
                        if let Some(tx) = ready_tx.take() { let _ = tx.send(()); }
                    }
                    LiveFrame::Event(ev) => {
                        if !forward(&events_tx, &cancel, ev).await { break; }
                    }
                    LiveFrame::Ignored(typ) => debug!(%session_id, %typ, "live event ignored"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(%session_id, ?frame, "live service closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%session_id, error = %e, "live transport error");
                    forward(&events_tx, &cancel, UpstreamTurnEvent::Error(e.into())).await;
                    break;
                }
                None => break,
            }
        }
    }
}

async fn forward(tx: &mpsc::Sender<UpstreamTurnEvent>, cancel: &CancellationToken, ev: UpstreamTurnEvent) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        r = tx.send(ev) => r.is_ok(),
    }
}

#[derive(Debug, PartialEq)]
pub enum LiveFrame {
    Ready,
    Event(UpstreamTurnEvent),
    Ignored(String),
}

pub fn decode_frame(txt: &str) -> LiveFrame {
    let v: Value = match serde_json::from_str(txt) {
        Ok(v) => v,
        Err(e) => return LiveFrame::Event(UpstreamTurnEvent::Error(UpstreamError::Protocol(format!("malformed live frame: {e}")))),
    };
    let typ = v.get("type").and_then(|s| s.as_str()).unwrap_or("");
    let id = v.get("id").and_then(|s| s.as_str()).map(|s| s.to_string());
    match typ {
        "session.updated" => LiveFrame::Ready,
        "transcript.delta" => {
            let text = v.get("text").or_else(|| v.get("delta")).and_then(|s| s.as_str()).unwrap_or("");
            LiveFrame::Event(UpstreamTurnEvent::PartialTranscript(text.to_string()))
        }
        "tool.call" | "tool_call" => {
            let name = v.get("name").and_then(|s| s.as_str()).unwrap_or("").to_string();
            let args = match v.get("arguments").cloned().unwrap_or_else(|| json!({})) {
                // Some services send arguments as a JSON-encoded string
                Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                other => other,
            };
            LiveFrame::Event(UpstreamTurnEvent::ToolCall { id, name, args })
        }
        "function.result" => {
            let payload = v.get("payload").cloned().unwrap_or(Value::Null);
            LiveFrame::Event(UpstreamTurnEvent::FunctionResult { id, payload })
        }
        "response.interrupted" => LiveFrame::Event(UpstreamTurnEvent::Interrupted),
        "response.done" => LiveFrame::Event(UpstreamTurnEvent::TurnComplete),
        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("live service error");
            let status = v.get("error").and_then(|e| e.get("code")).and_then(|c| c.as_u64()).and_then(|c| u16::try_from(c).ok()).unwrap_or(0);
            LiveFrame::Event(UpstreamTurnEvent::Error(UpstreamError::from_status(status, msg)))
        }
        other => LiveFrame::Ignored(other.to_string()),
    }
}

pub fn encode_input(input: &LiveInput) -> String {
    match input {
        LiveInput::Audio(bytes) => json!({"type": "input_audio_buffer.append", "audio": B64.encode(bytes)}).to_string(),
        LiveInput::Text(text) => json!({"type": "input_text", "text": text}).to_string(),
        LiveInput::ToolOutput { id, name, output } => {
            let mut out = json!({"type": "tool.output", "name": name, "output": output});
            if let (Some(i), Some(obj)) = (id, out.as_object_mut()) { obj.insert("id".into(), json!(i)); }
            out.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tagged_events() {
        assert_eq!(decode_frame(r#"{"type":"session.updated"}"#), LiveFrame::Ready);
        assert_eq!(
            decode_frame(r#"{"type":"transcript.delta","text":"hello"}"#),
            LiveFrame::Event(UpstreamTurnEvent::PartialTranscript("hello".into()))
        );
        assert_eq!(decode_frame(r#"{"type":"response.done"}"#), LiveFrame::Event(UpstreamTurnEvent::TurnComplete));
        assert_eq!(decode_frame(r#"{"type":"rate_limits.updated"}"#), LiveFrame::Ignored("rate_limits.updated".into()));
    }

    #[test]
    fn tool_call_arguments_may_be_a_json_string() {
        let f = decode_frame(r#"{"type":"tool.call","id":"c1","name":"emotion","arguments":"{\"emotion\":\"SAD\"}"}"#);
        assert_eq!(
            f,
            LiveFrame::Event(UpstreamTurnEvent::ToolCall { id: Some("c1".into()), name: "emotion".into(), args: json!({"emotion": "SAD"}) })
        );
    }

    #[test]
    fn malformed_and_error_frames_become_error_events() {
        assert!(matches!(decode_frame("{not json"), LiveFrame::Event(UpstreamTurnEvent::Error(UpstreamError::Protocol(_)))));
        assert!(matches!(
            decode_frame(r#"{"type":"error","error":{"code":503,"message":"overloaded"}}"#),
            LiveFrame::Event(UpstreamTurnEvent::Error(e)) if e.is_transient()
        ));
        // 66036 wraps to 500 when truncated
        assert!(matches!(
            decode_frame(r#"{"type":"error","error":{"code":66036,"message":"odd"}}"#),
            LiveFrame::Event(UpstreamTurnEvent::Error(UpstreamError::Rejected { status: 0, .. }))
        ));
    }

    #[test]
    fn tool_output_carries_call_id() {
        let v: Value = serde_json::from_str(&encode_input(&LiveInput::ToolOutput {
            id: Some("7".into()),
            name: "emotion".into(),
            output: json!({"ok": true}),
        }))
        .unwrap();
        assert_eq!(v["type"], "tool.output");
        assert_eq!(v["id"], "7");
        let v: Value = serde_json::from_str(&encode_input(&LiveInput::Audio(vec![0, 1]))).unwrap();
        assert_eq!(v["audio"], "AAE=");
    }
}
