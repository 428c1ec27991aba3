//! Client-facing WebSocket envelopes: `{"messageType": ..., "content": ...}`.

use serde::{Deserialize, Serialize};

pub use parley_memory::Speaker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Surprised,
    Shy,
    Despise,
    Neutral,
}

impl Emotion {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "HAPPY" => Some(Emotion::Happy),
            "SAD" => Some(Emotion::Sad),
            "ANGRY" => Some(Emotion::Angry),
            "SURPRISED" => Some(Emotion::Surprised),
            "SHY" => Some(Emotion::Shy),
            "DESPISE" => Some(Emotion::Despise),
            "NEUTRAL" => Some(Emotion::Neutral),
            _ => None,
        }
    }

    pub const ALL: [&'static str; 7] = ["HAPPY", "SAD", "ANGRY", "SURPRISED", "SHY", "DESPISE", "NEUTRAL"];
}

/// Error codes sent in `ERROR` envelopes, formatted `DOMAIN_STATUS_NNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    LiveUnavailable,
    LiveReadyTimeout,
    LiveFailed,
    TtsFailed,
    NoSuchVoice,
}

impl ErrorCode {
    pub fn code(&self) -> String {
        let (domain, status, number) = match self {
            ErrorCode::LiveUnavailable => ("LIVE", 503, 1),
            ErrorCode::LiveReadyTimeout => ("LIVE", 504, 1),
            ErrorCode::LiveFailed => ("LIVE", 502, 1),
            ErrorCode::TtsFailed => ("TTS", 502, 1),
            ErrorCode::NoSuchVoice => ("TTS", 404, 1),
        };
        format!("{domain}_{status}_{number:03}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "content", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    ServerReady { session_id: String },
    Subtitle { speaker: Speaker, text: String },
    Interrupted,
    TurnComplete { input: String, output: String },
    Emotion { emotion: Emotion },
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error { code: code.code(), message: message.into() }
    }

    pub fn to_json(&self) -> String {
        // Plain enums of strings cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"messageType\":\"ERROR\"}"))
    }
}

/// Text frames accepted from the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "messageType", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    TextMessage { text: String },
}

/// Strips a leading `[HAPPY]`-style tag, returning the emotion and the remaining text.
pub fn split_emotion_tag(text: &str) -> (Option<Emotion>, &str) {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            if let Some(emotion) = Emotion::parse(&rest[..end]) {
                return (Some(emotion), rest[end + 1..].trim_start());
            }
        }
    }
    (None, text)
}
