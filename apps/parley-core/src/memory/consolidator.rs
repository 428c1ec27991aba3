use super::context::ShortTermMemory;
use super::Memory;
use crate::config::{LlmConfig, MemoryConfig};
use crate::error::UpstreamError;
use crate::llm::LlmClient;
use crate::retry::RetryPolicy;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use parley_memory::{LongTermRecord, MemoryHit};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const DEFAULT_SUMMARIZE_PROMPT: &str = "You maintain the long-term memory of an AI character. \
Summarize the conversation transcript below from the character's point of view: what the user shared, \
their preferences and plans, and anything the character promised. Be factual and concise. \
Also list the main topics as short noun phrases.";

/// One finished exchange handed over at turn completion.
#[derive(Debug, Clone)]
pub struct TurnPair {
    pub input: String,
    pub output: String,
    pub at: DateTime<Utc>,
}

impl TurnPair {
    pub fn now(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self { input: input.into(), output: output.into(), at: Utc::now() }
    }
}

#[derive(Debug, Clone)]
pub struct ModelPlan {
    pub primary: String,
    pub secondary: String,
}

#[derive(Debug, Clone)]
pub struct ConsolidationSettings {
    pub threshold: i64,
    pub recent_turns: i64,
    pub mid_term_size: i64,
    pub long_term_k: usize,
    pub retry: RetryPolicy,
    pub summarize: ModelPlan,
    pub embedding: ModelPlan,
    pub prompt: String,
}

impl ConsolidationSettings {
    pub fn from_config(memory: &MemoryConfig, llm: &LlmConfig) -> Self {
        Self {
            threshold: memory.consolidation_threshold,
            recent_turns: memory.recent_turns,
            mid_term_size: memory.mid_term_size,
            long_term_k: memory.long_term_k,
            retry: RetryPolicy::from_config(memory),
            summarize: ModelPlan { primary: llm.summarize_model.clone(), secondary: llm.summarize_fallback_model.clone() },
            embedding: ModelPlan { primary: llm.embedding_model.clone(), secondary: llm.embedding_fallback_model.clone() },
            prompt: llm.summarize_prompt.clone().unwrap_or_else(|| DEFAULT_SUMMARIZE_PROMPT.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved { count: i64 },
    Consolidated { record_id: i64 },
    /// The crossing was handed back to the counter; the next save retries.
    ConsolidationFailed,
}

#[derive(Debug, Deserialize)]
struct Summary {
    summary: String,
    #[serde(default)]
    topics: Vec<String>,
}

pub fn summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
            "topics": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["summary", "topics"],
        "additionalProperties": false
    })
}

/// Short-term chat log, periodic summarization and the vector-searchable long-term store.
pub struct MemoryConsolidator {
    memory: Memory,
    llm: Arc<dyn LlmClient>,
    settings: ConsolidationSettings,
}

impl MemoryConsolidator {
    pub fn new(memory: Memory, llm: Arc<dyn LlmClient>, settings: ConsolidationSettings) -> Self {
        Self { memory, llm, settings }
    }

    pub fn memory(&self) -> &Memory { &self.memory }
    pub fn settings(&self) -> &ConsolidationSettings { &self.settings }

    /// Persists both halves of the turn, then bumps the counter. The increment and
    /// the threshold claim are one statement, so overlapping sessions of the same
    /// user cannot both consolidate one crossing.
    pub async fn save(&self, owner_id: i64, character_id: i64, turn: &TurnPair) -> anyhow::Result<SaveOutcome> {
        let store = &self.memory.store;
        store
            .append_turn_pair(owner_id, character_id, &turn.input, &turn.output, turn.at)
            .await
            .context("appending turn to chat log")?;
        let step = store.increment_and_claim(owner_id, character_id, self.settings.threshold).await?;
        if !step.claimed {
            return Ok(SaveOutcome::Saved { count: step.count });
        }

        info!(owner_id, character_id, threshold = self.settings.threshold, "turn threshold reached; consolidating");
        match self.consolidate(owner_id, character_id).await {
            Ok(record) => {
                parley_telemetry::inc_consolidation("ok");
                Ok(SaveOutcome::Consolidated { record_id: record.id })
            }
            Err(e) => {
                error!(owner_id, character_id, error = %e, "consolidation failed; counter restored for retry");
                parley_telemetry::inc_consolidation("failed");
                store.restore_claim(owner_id, character_id, self.settings.threshold).await?;
                Ok(SaveOutcome::ConsolidationFailed)
            }
        }
    }

    /// Summarizes the most recent turns into one long-term record.
    pub async fn consolidate(&self, owner_id: i64, character_id: i64) -> anyhow::Result<LongTermRecord> {
        let rows = self.memory.store.recent_chats(owner_id, character_id, self.settings.recent_turns).await?;
        let short_term = ShortTermMemory::from_rows(&rows)
            .ok_or_else(|| anyhow!("threshold reached but no recent chat for owner {owner_id} character {character_id}"))?;

        let summary = self.summarize_with_fallback(&short_term.content).await.context("summarizing recent turns")?;
        let embedding = self.embed_with_fallback(&summary.summary).await.context("embedding summary")?;
        let text = format!("{}{}", short_term.span_prefix(), summary.summary);
        let record = self
            .memory
            .store
            .insert_long_term(owner_id, character_id, &text, &summary.topics, &embedding)
            .await?;
        info!(owner_id, character_id, record_id = record.id, topics = ?record.topics, "long-term memory stored");
        Ok(record)
    }

    /// Nearest long-term memories to `query`, closest first.
    pub async fn search(&self, owner_id: i64, character_id: i64, query: &str, k: usize) -> anyhow::Result<Vec<MemoryHit>> {
        let embedding = self.embed_with_fallback(query).await.context("embedding search query")?;
        self.memory.store.nearest_long_term(owner_id, character_id, &embedding, k).await
    }

    /// Recent transcript and newest summaries used to seed a live session.
    pub async fn session_context(&self, owner_id: i64, character_id: i64) -> anyhow::Result<(Option<ShortTermMemory>, Vec<String>)> {
        let rows = self.memory.store.recent_chats(owner_id, character_id, self.settings.recent_turns).await?;
        let mid = self
            .memory
            .store
            .recent_long_term(owner_id, character_id, self.settings.mid_term_size)
            .await?
            .into_iter()
            .map(|r| r.summary)
            .collect();
        Ok((ShortTermMemory::from_rows(&rows), mid))
    }

    async fn summarize_with_fallback(&self, transcript: &str) -> Result<Summary, UpstreamError> {
        let plan = &self.settings.summarize;
        match self.summarize_once(&plan.primary, transcript).await {
            Err(e) if e.is_transient() => {
                warn!(from = %plan.primary, to = %plan.secondary, error = %e, "retries exhausted; switching summarizer");
                self.summarize_once(&plan.secondary, transcript).await
            }
            other => other,
        }
    }

    async fn summarize_once(&self, model: &str, transcript: &str) -> Result<Summary, UpstreamError> {
        let schema = summary_schema();
        let raw = self
            .settings
            .retry
            .run("summarize", || self.llm.summarize(model, &self.settings.prompt, transcript, &schema))
            .await?;
        serde_json::from_str(&raw).map_err(|e| UpstreamError::Protocol(format!("summary is not valid JSON: {e}")))
    }

    async fn embed_with_fallback(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let plan = &self.settings.embedding;
        let retry = &self.settings.retry;
        match retry.run("embed", || self.llm.embed(&plan.primary, text)).await {
            Err(e) if e.is_transient() => {
                warn!(from = %plan.primary, to = %plan.secondary, error = %e, "retries exhausted; switching embedding model");
                retry.run("embed", || self.llm.embed(&plan.secondary, text)).await
            }
            other => other,
        }
    }
}
