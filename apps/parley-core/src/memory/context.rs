use chrono::{DateTime, Utc};
use parley_memory::ChatRow;

const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Recent dialogue rendered as a transcript, with its time span.
#[derive(Debug, Clone, PartialEq)]
pub struct ShortTermMemory {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub content: String,
}

impl ShortTermMemory {
    pub fn from_rows(rows: &[ChatRow]) -> Option<Self> {
        let first = rows.first()?;
        let last = rows.last()?;
        let content = rows.iter().map(chat_line).collect::<Vec<_>>().join("\n");
        Some(Self { start: first.chatted_at, end: last.chatted_at, content })
    }

    /// `[start ~ end] ` tag stored in front of a consolidated summary.
    pub fn span_prefix(&self) -> String {
        format!("[{} ~ {}] ", self.start.format(TIME_FMT), self.end.format(TIME_FMT))
    }
}

pub fn chat_line(row: &ChatRow) -> String {
    format!("[{}] {}: {}", row.chatted_at.format(TIME_FMT), row.speaker.as_str(), row.content)
}

/// Persona first, then what the character should remember.
pub fn build_instructions(persona: &str, short_term: Option<&ShortTermMemory>, mid_term: &[String]) -> String {
    let mut out = persona.trim().to_string();
    if !mid_term.is_empty() {
        out.push_str("\n\nEarlier conversations (summaries, newest first):\n");
        out.push_str(&mid_term.join("\n"));
    }
    if let Some(st) = short_term {
        out.push_str("\n\nRecent conversation:\n");
        out.push_str(&st.content);
    }
    out
}
