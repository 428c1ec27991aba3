use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParleyConfig {
    pub home: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_live_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_live_model")]
    pub model: String,
    #[serde(default)]
    pub voice: Option<String>,
    /// Env var holding the bearer token for the live service.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_tts_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Voice used once a character's configured voice turns out to be unknown.
    #[serde(default = "default_voice_id")]
    pub default_voice_id: String,
    /// Longest silence from the TTS service before an utterance is abandoned.
    #[serde(default = "default_tts_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f64,
    /// Client audio frames held before upstream readiness.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
    #[serde(default = "default_outbound_audio_buffer")]
    pub outbound_audio_buffer: usize,
    /// Largest client frame or message accepted on the voice socket.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: i64,
    #[serde(default = "default_recent_turns")]
    pub recent_turns: i64,
    #[serde(default = "default_mid_term_size")]
    pub mid_term_size: i64,
    #[serde(default = "default_long_term_k")]
    pub long_term_k: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_summarize_model")]
    pub summarize_model: String,
    #[serde(default = "default_summarize_fallback_model")]
    pub summarize_fallback_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_fallback_model")]
    pub embedding_fallback_model: String,
    #[serde(default)]
    pub summarize_prompt: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub require_ticket: bool,
    #[serde(default)]
    pub default_member_id: Option<i64>,
    #[serde(default = "default_ticket_ttl_secs")]
    pub ticket_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterConfig {
    pub id: i64,
    pub name: String,
    pub voice_id: String,
    #[serde(default)]
    pub persona: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub parley: Option<ParleyConfig>,
    pub server: Option<ServerConfig>,
    pub live: Option<LiveConfig>,
    pub tts: Option<TtsConfig>,
    pub session: Option<SessionConfig>,
    pub memory: Option<MemoryConfig>,
    pub llm: Option<LlmConfig>,
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub characters: Vec<CharacterConfig>,
}

fn default_live_endpoint() -> String { "ws://127.0.0.1:7070/live".into() }
fn default_live_model() -> String { "live-voice-preview".into() }
fn default_ready_timeout_ms() -> u64 { 10_000 }
fn default_tts_endpoint() -> String { "ws://127.0.0.1:7071/tts".into() }
fn default_tts_connect_timeout_ms() -> u64 { 5_000 }
fn default_voice_id() -> String { "1".into() }
fn default_tts_chunk_timeout_ms() -> u64 { 10_000 }
fn default_max_message_bytes() -> usize { 512 * 1024 }
fn default_idle_timeout_secs() -> u64 { 120 }
fn default_silence_threshold() -> f64 { crate::audio::DEFAULT_SILENCE_THRESHOLD }
fn default_inbound_buffer() -> usize { 64 }
fn default_outbound_audio_buffer() -> usize { 256 }
fn default_consolidation_threshold() -> i64 { 30 }
fn default_recent_turns() -> i64 { 15 }
fn default_mid_term_size() -> i64 { 3 }
fn default_long_term_k() -> usize { 10 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_initial_ms() -> u64 { 1_000 }
fn default_retry_factor() -> u32 { 2 }
fn default_llm_endpoint() -> String { "https://api.openai.com/v1".into() }
fn default_summarize_model() -> String { "gpt-4o-mini".into() }
fn default_summarize_fallback_model() -> String { "gpt-4o".into() }
fn default_embedding_model() -> String { "text-embedding-3-small".into() }
fn default_embedding_fallback_model() -> String { "text-embedding-3-large".into() }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_true() -> bool { true }
fn default_ticket_ttl_secs() -> u64 { 60 }

impl Default for LiveConfig {
    fn default() -> Self {
        Self { endpoint: default_live_endpoint(), model: default_live_model(), voice: None, api_key_env: None, ready_timeout_ms: default_ready_timeout_ms() }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_tts_endpoint(),
            connect_timeout_ms: default_tts_connect_timeout_ms(),
            default_voice_id: default_voice_id(),
            chunk_timeout_ms: default_tts_chunk_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            silence_threshold: default_silence_threshold(),
            inbound_buffer: default_inbound_buffer(),
            outbound_audio_buffer: default_outbound_audio_buffer(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            consolidation_threshold: default_consolidation_threshold(),
            recent_turns: default_recent_turns(),
            mid_term_size: default_mid_term_size(),
            long_term_k: default_long_term_k(),
            retry_attempts: default_retry_attempts(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_factor: default_retry_factor(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key_env: None,
            summarize_model: default_summarize_model(),
            summarize_fallback_model: default_summarize_fallback_model(),
            embedding_model: default_embedding_model(),
            embedding_fallback_model: default_embedding_fallback_model(),
            summarize_prompt: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self { Self { require_ticket: true, default_member_id: None, ticket_ttl_secs: default_ticket_ttl_secs() } }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration { Duration::from_secs(self.idle_timeout_secs) }
}

impl TtsConfig {
    pub fn chunk_timeout(&self) -> Duration { Duration::from_millis(self.chunk_timeout_ms) }
}

impl LiveConfig {
    pub fn ready_timeout(&self) -> Duration { Duration::from_millis(self.ready_timeout_ms) }
}

impl Config {
    pub fn load() -> anyhow::Result<(Self, PathBuf)> {
        let cfg_path = env::var("PARLEY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/parley.toml"));
        let text = fs::read_to_string(&cfg_path)?;
        let mut cfg: Config = toml::from_str(&text)?;
        cfg.apply_env();
        Ok((cfg, cfg_path))
    }

    // Env overrides: PARLEY_HOME, PARLEY_BIND, PARLEY_LIVE_ENDPOINT, PARLEY_TTS_ENDPOINT, PARLEY_LLM_ENDPOINT
    fn apply_env(&mut self) {
        if let Ok(home) = env::var("PARLEY_HOME") {
            self.parley.get_or_insert(ParleyConfig { home: None }).home = Some(home);
        }
        if let Ok(bind) = env::var("PARLEY_BIND") {
            self.server.get_or_insert(ServerConfig { bind: None }).bind = Some(bind);
        }
        if let Ok(ep) = env::var("PARLEY_LIVE_ENDPOINT") {
            self.live.get_or_insert_with(LiveConfig::default).endpoint = ep;
        }
        if let Ok(ep) = env::var("PARLEY_TTS_ENDPOINT") {
            self.tts.get_or_insert_with(TtsConfig::default).endpoint = ep;
        }
        if let Ok(ep) = env::var("PARLEY_LLM_ENDPOINT") {
            self.llm.get_or_insert_with(LlmConfig::default).endpoint = ep;
        }
    }

    pub fn home_dir(&self) -> PathBuf {
        self.parley
            .as_ref()
            .and_then(|f| f.home.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./storage"))
    }

    pub fn bind_addr(&self) -> String {
        self.server.as_ref().and_then(|s| s.bind.clone()).unwrap_or_else(|| "127.0.0.1:6061".to_string())
    }

    pub fn live(&self) -> LiveConfig { self.live.clone().unwrap_or_default() }
    pub fn tts(&self) -> TtsConfig { self.tts.clone().unwrap_or_default() }
    pub fn session(&self) -> SessionConfig { self.session.clone().unwrap_or_default() }
    pub fn memory(&self) -> MemoryConfig { self.memory.clone().unwrap_or_default() }
    pub fn llm(&self) -> LlmConfig { self.llm.clone().unwrap_or_default() }
    pub fn auth(&self) -> AuthConfig { self.auth.clone().unwrap_or_default() }

    pub fn character(&self, id: i64) -> Option<&CharacterConfig> {
        self.characters.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("[memory]\nconsolidation_threshold = 5\n").unwrap();
        assert_eq!(cfg.memory().consolidation_threshold, 5);
        assert_eq!(cfg.memory().recent_turns, 15);
        assert_eq!(cfg.session().idle_timeout_secs, 120);
        assert_eq!(cfg.session().inbound_buffer, 64);
        assert_eq!(cfg.session().max_message_bytes, 524_288);
        assert_eq!(cfg.tts().default_voice_id, "1");
        assert!(cfg.auth().require_ticket);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:6061");
    }

    #[test]
    fn characters_are_looked_up_by_id() {
        let cfg: Config = toml::from_str(
            "[[characters]]\nid = 7\nname = \"Mira\"\nvoice_id = \"v-7\"\npersona = \"cheerful\"\n",
        )
        .unwrap();
        assert_eq!(cfg.character(7).map(|c| c.voice_id.as_str()), Some("v-7"));
        assert!(cfg.character(8).is_none());
    }
}
