use super::{TtsChunk, TtsConnector, TtsInput, TtsStream, TTS_CHUNK_CHANNEL_SIZE};
use crate::config::TtsConfig;
use crate::error::UpstreamError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sentinel telling the synthesizer the utterance text is complete.
pub const END_OF_STREAM: &str = "EOS";
const NO_SUCH_VOICE_CODE: u64 = 400_002;

pub struct WsTtsConnector {
    endpoint: String,
    connect_timeout: Duration,
}

impl WsTtsConnector {
    pub fn new(cfg: &TtsConfig) -> Self {
        let mut endpoint = cfg.endpoint.trim_end_matches('/').to_string();
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            endpoint = format!("ws://{}", endpoint);
        }
        Self { endpoint, connect_timeout: Duration::from_millis(cfg.connect_timeout_ms) }
    }
}

#[async_trait]
impl TtsConnector for WsTtsConnector {
    async fn open(&self, voice_id: &str) -> Result<TtsStream, UpstreamError> {
        let url = format!("{}/{}", self.endpoint, voice_id);
        let (ws, _resp) = match tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(r) => r?,
            Err(_) => return Err(UpstreamError::Timeout(self.connect_timeout)),
        };
        debug!(%voice_id, "tts connection opened");

        let (input_tx, mut input_rx) = mpsc::channel::<TtsInput>(TTS_CHUNK_CHANNEL_SIZE);
        let (chunk_tx, chunk_rx) = mpsc::channel(TTS_CHUNK_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let voice = voice_id.to_string();
        let task = tokio::spawn(async move {
            let (mut sink, mut stream) = ws.split();
            let mut sent_eos = false;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    input = input_rx.recv(), if !sent_eos => {
                        let frame = match input {
                            Some(TtsInput::Text(text)) => Message::Text(json!({"text": text}).to_string()),
                            Some(TtsInput::Finish) | None => { sent_eos = true; Message::Text(END_OF_STREAM.to_string()) }
                        };
                        if let Err(e) = sink.send(frame).await {
                            warn!(voice = %voice, error = %e, "tts send failed");
                            let _ = chunk_tx.send(Err(e.into())).await;
                            break;
                        }
                    }
                    msg = stream.next() => {
                        let chunk = match msg {
                            Some(Ok(Message::Binary(bytes))) => Ok(TtsChunk::Audio(bytes)),
                            Some(Ok(Message::Text(txt))) => match decode_status(&txt, &voice) {
                                Some(r) => r,
                                None => continue,
                            },
                            Some(Ok(Message::Close(_))) | None => Ok(TtsChunk::EndOfStream),
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => Err(e.into()),
                        };
                        let terminal = !matches!(chunk, Ok(TtsChunk::Audio(_)) | Ok(TtsChunk::StartOfStream));
                        let delivered = tokio::select! {
                            _ = token.cancelled() => false,
                            r = chunk_tx.send(chunk) => r.is_ok(),
                        };
                        if terminal || !delivered { break; }
                    }
                }
            }
            // Closing is unconditional, even when the sentinel never went out.
            let _ = sink.close().await;
        });
        Ok(TtsStream::new(input_tx, chunk_rx, cancel, Some(task)))
    }
}

/// Maps a synthesizer status frame; `None` for frames that carry nothing for the client.
pub fn decode_status(txt: &str, voice: &str) -> Option<Result<TtsChunk, UpstreamError>> {
    let v: Value = match serde_json::from_str(txt) {
        Ok(v) => v,
        Err(e) => return Some(Err(UpstreamError::Protocol(format!("malformed tts frame: {e}")))),
    };
    match v.get("status").and_then(|s| s.as_str()).unwrap_or("") {
        "streaming" => Some(Ok(TtsChunk::StartOfStream)),
        "done" => Some(Ok(TtsChunk::EndOfStream)),
        "error" => {
            let code = v.get("code").and_then(|c| c.as_u64()).unwrap_or(0);
            let message = v.get("message").and_then(|m| m.as_str()).unwrap_or("tts error").to_string();
            if code == NO_SUCH_VOICE_CODE {
                return Some(Err(UpstreamError::NoSuchVoice(voice.to_string())));
            }
            // codes look like HTTP status * 1000 + detail
            Some(Err(UpstreamError::from_status(u16::try_from(code / 1000).unwrap_or(0), message)))
        }
        _ => None,
    }
}

/// Splits an utterance after sentence punctuation followed by whitespace;
/// pieces of 10 chars or fewer ride along with the previous one.
pub fn split_sentences(text: &str) -> Vec<String> {
    const MIN_PIECE: usize = 10;
    let mut pieces: Vec<String> = vec![];
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = matches!(c, '.' | '?' | '!' | '~' | '\n') && chars.peek().map(|n| n.is_whitespace()).unwrap_or(false);
        if boundary {
            while chars.peek().map(|n| n.is_whitespace()).unwrap_or(false) { chars.next(); }
            push_piece(&mut pieces, std::mem::take(&mut current), MIN_PIECE);
        }
    }
    push_piece(&mut pieces, current, MIN_PIECE);
    pieces
}

fn push_piece(pieces: &mut Vec<String>, piece: String, min: usize) {
    let piece = piece.trim().to_string();
    if piece.is_empty() { return; }
    match pieces.last_mut() {
        Some(last) if piece.chars().count() <= min => { last.push(' '); last.push_str(&piece); }
        _ => pieces.push(piece),
    }
}
