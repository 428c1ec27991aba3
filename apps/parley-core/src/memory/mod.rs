pub mod consolidator;
pub mod context;

pub use consolidator::{ConsolidationSettings, MemoryConsolidator, ModelPlan, SaveOutcome, TurnPair};

use parley_memory as pm;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Memory {
    pub store: pm::MemoryStore,
}

impl Memory {
    pub async fn init(db_path: PathBuf, migrations_dir: PathBuf) -> anyhow::Result<Self> {
        let store = pm::MemoryStore::new(&db_path, &migrations_dir).await?;
        let this = Self { store };
        // WAL lets session reads proceed while a consolidation writes
        let _ = sqlx::query("PRAGMA journal_mode=WAL").execute(this.store.pool()).await;
        let _ = sqlx::query("PRAGMA synchronous=NORMAL").execute(this.store.pool()).await;
        Ok(this)
    }

    pub async fn init_in_memory(migrations_dir: PathBuf) -> anyhow::Result<Self> {
        let store = pm::MemoryStore::new_in_memory(&migrations_dir).await?;
        Ok(Self { store })
    }

    pub fn migrations_dir() -> PathBuf {
        PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
    }
}
