use crate::config::Config;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::memory::{ConsolidationSettings, Memory, MemoryConsolidator};
use crate::session::speech::SpeechSettings;
use crate::session::{RelayServices, SessionRegistry};
use crate::tickets::TicketStore;
use crate::upstream::live::WsLiveConnector;
use crate::upstream::tts::WsTtsConnector;
use crate::upstream::{LiveConnector, TtsConnector};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppHandles {
    pub registry: SessionRegistry,
    pub tickets: TicketStore,
    pub memory: Option<Memory>,
    pub consolidator: Option<Arc<MemoryConsolidator>>,
    pub live: Arc<dyn LiveConnector>,
    pub tts: Arc<dyn TtsConnector>,
}

#[derive(Clone)]
pub struct AppState {
    pub version: &'static str,
    pub config: Arc<RwLock<Config>>,
    pub handles: AppHandles,
}

pub type SharedState = Arc<AppState>;

/// Outbound collaborators; tests swap these for in-process fakes.
pub struct Upstreams {
    pub live: Arc<dyn LiveConnector>,
    pub tts: Arc<dyn TtsConnector>,
    pub llm: Option<Arc<dyn LlmClient>>,
}

impl Upstreams {
    pub fn from_config(config: &Config) -> Self {
        let llm: Option<Arc<dyn LlmClient>> = match HttpLlmClient::new(&config.llm()) {
            Ok(c) => Some(Arc::new(c)),
            Err(e) => {
                tracing::error!(error = %e, "llm client init failed; memory consolidation disabled");
                None
            }
        };
        Self {
            live: Arc::new(WsLiveConnector::new(&config.live())),
            tts: Arc::new(WsTtsConnector::new(&config.tts())),
            llm,
        }
    }
}

impl AppState {
    pub async fn new(config: Config) -> SharedState {
        let upstreams = Upstreams::from_config(&config);
        let home = config.home_dir();
        let db_path = home.join("sqlite.db");
        let migrations_dir = Memory::migrations_dir();
        if let Err(e) = std::fs::create_dir_all(&home) {
            tracing::warn!(error = %e, ?home, "could not create home dir");
        }
        let memory = match Memory::init(db_path.clone(), migrations_dir.clone()).await {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(error = %e, ?db_path, "file-backed sqlite failed; falling back to in-memory");
                Self::in_memory(migrations_dir).await
            }
        };
        Self::assemble(config, upstreams, memory)
    }

    /// State backed by an in-memory store, for tests and ephemeral runs.
    pub async fn ephemeral(config: Config, upstreams: Upstreams) -> SharedState {
        let memory = Self::in_memory(Memory::migrations_dir()).await;
        Self::assemble(config, upstreams, memory)
    }

    async fn in_memory(migrations_dir: PathBuf) -> Option<Memory> {
        match Memory::init_in_memory(migrations_dir).await {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::error!(error = %e, "in-memory sqlite init failed; running without memory");
                None
            }
        }
    }

    fn assemble(config: Config, upstreams: Upstreams, memory: Option<Memory>) -> SharedState {
        let settings = ConsolidationSettings::from_config(&config.memory(), &config.llm());
        let consolidator = match (&memory, upstreams.llm) {
            (Some(m), Some(llm)) => Some(Arc::new(MemoryConsolidator::new(m.clone(), llm, settings))),
            _ => None,
        };
        let tickets = TicketStore::new(Duration::from_secs(config.auth().ticket_ttl_secs));
        Arc::new(AppState {
            version: env!("CARGO_PKG_VERSION"),
            config: Arc::new(RwLock::new(config)),
            handles: AppHandles {
                registry: SessionRegistry::new(),
                tickets,
                memory,
                consolidator,
                live: upstreams.live,
                tts: upstreams.tts,
            },
        })
    }

    /// Per-session view of the shared services, read against the current config.
    pub fn relay_services(&self) -> RelayServices {
        let cfg = self.config.read();
        RelayServices {
            registry: self.handles.registry.clone(),
            live: self.handles.live.clone(),
            tts: self.handles.tts.clone(),
            memory: self.handles.consolidator.clone(),
            session: cfg.session(),
            speech: SpeechSettings::from(&cfg.tts()),
            ready_timeout: cfg.live().ready_timeout(),
        }
    }
}
