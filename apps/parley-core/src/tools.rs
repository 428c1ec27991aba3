//! Function-call tools declared to the live service and the fixed table that
//! resolves incoming calls.

use crate::protocol::Emotion;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum ToolAction {
    /// Spoken answer: subtitle + speech synthesis.
    Speak { text: String },
    Emotion(Emotion),
    SearchMemory { query: String },
    EndCall,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ToolError {
    #[error("unknown tool {0}")]
    Unknown(String),
    #[error("bad arguments for {tool}: {reason}")]
    BadArguments { tool: String, reason: String },
}

#[derive(Deserialize)]
struct SpeakArgs { text: String }
#[derive(Deserialize)]
struct EmotionArgs { emotion: String }
#[derive(Deserialize)]
struct SearchArgs { query: String }

pub const RESPONSE_TEXT: &str = "response_text";
pub const EMOTION: &str = "emotion";
pub const SEARCH_MEMORY: &str = "search_memory";
pub const END_CALL: &str = "end_call";

pub fn resolve(name: &str, args: &Value) -> Result<ToolAction, ToolError> {
    let bad = |reason: String| ToolError::BadArguments { tool: name.to_string(), reason };
    match name {
        RESPONSE_TEXT => {
            let a: SpeakArgs = serde_json::from_value(args.clone()).map_err(|e| bad(e.to_string()))?;
            if a.text.trim().is_empty() { return Err(bad("empty text".into())); }
            Ok(ToolAction::Speak { text: a.text })
        }
        EMOTION => {
            let a: EmotionArgs = serde_json::from_value(args.clone()).map_err(|e| bad(e.to_string()))?;
            Emotion::parse(&a.emotion).map(ToolAction::Emotion).ok_or_else(|| bad(format!("unknown emotion {}", a.emotion)))
        }
        SEARCH_MEMORY => {
            let a: SearchArgs = serde_json::from_value(args.clone()).map_err(|e| bad(e.to_string()))?;
            Ok(ToolAction::SearchMemory { query: a.query })
        }
        END_CALL => Ok(ToolAction::EndCall),
        other => Err(ToolError::Unknown(other.to_string())),
    }
}

/// Declarations sent in `session.update`.
pub fn tool_declarations() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "name": RESPONSE_TEXT,
            "description": "Speak your reply to the user. Always answer through this tool.",
            "parameters": {
                "type": "object",
                "properties": {"text": {"type": "string", "description": "What the character says, in full sentences."}},
                "required": ["text"],
                "additionalProperties": false
            }
        }),
        json!({
            "type": "function",
            "name": EMOTION,
            "description": "Show the character's current emotion.",
            "parameters": {
                "type": "object",
                "properties": {"emotion": {"type": "string", "enum": Emotion::ALL}},
                "required": ["emotion"],
                "additionalProperties": false
            }
        }),
        json!({
            "type": "function",
            "name": SEARCH_MEMORY,
            "description": "Search long-term memories of past conversations with this user.",
            "parameters": {
                "type": "object",
                "properties": {"query": {"type": "string", "description": "What to recall."}},
                "required": ["query"],
                "additionalProperties": false
            }
        }),
        json!({
            "type": "function",
            "name": END_CALL,
            "description": "End the voice call when the user says goodbye.",
            "parameters": {"type": "object", "properties": {}, "additionalProperties": false}
        }),
    ]
}
