use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;

#[derive(Clone)]
pub struct MemoryStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Speaker {
    User,
    Bot,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "USER",
            Speaker::Bot => "BOT",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "USER" => Ok(Speaker::User),
            "BOT" => Ok(Speaker::Bot),
            other => bail!("unknown speaker {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRow {
    pub id: i64,
    pub owner_id: i64,
    pub character_id: i64,
    pub speaker: Speaker,
    pub content: String,
    pub chatted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermRecord {
    pub id: i64,
    pub owner_id: i64,
    pub character_id: i64,
    pub summary: String,
    pub topics: Vec<String>,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub record: LongTermRecord,
    pub distance: f32,
}

/// Outcome of one atomic counter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterStep {
    /// Counter value after the step.
    pub count: i64,
    /// True when this step crossed the threshold and owns the consolidation.
    pub claimed: bool,
}

impl MemoryStore {
    pub async fn new(db_path: &Path, migrations_dir: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() { std::fs::create_dir_all(parent)?; }
        let url = if db_path.is_absolute() {
            format!("sqlite:///{}?mode=rwc", db_path.display())
        } else {
            format!("sqlite://{}?mode=rwc", db_path.display())
        };
        let pool = SqlitePool::connect(&url).await?;
        let migrator = sqlx::migrate::Migrator::new(migrations_dir).await?;
        migrator.run(&pool).await?;
        Ok(Self { pool })
    }

    // Every pooled connection to ":memory:" is its own database, so pin the pool to one.
    pub async fn new_in_memory(migrations_dir: &Path) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        let migrator = sqlx::migrate::Migrator::new(migrations_dir).await?;
        migrator.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }

    pub async fn append_chat(&self, owner_id: i64, character_id: i64, speaker: Speaker, content: &str, at: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query(
            r#"INSERT INTO Chat(owner_id, character_id, speaker, content, chatted_at) VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id"#,
        )
        .bind(owner_id)
        .bind(character_id)
        .bind(speaker.as_str())
        .bind(content)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Writes the user and bot halves of a turn in one transaction.
    pub async fn append_turn_pair(&self, owner_id: i64, character_id: i64, input: &str, output: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (speaker, content) in [(Speaker::User, input), (Speaker::Bot, output)] {
            sqlx::query(r#"INSERT INTO Chat(owner_id, character_id, speaker, content, chatted_at) VALUES (?1, ?2, ?3, ?4, ?5)"#)
                .bind(owner_id)
                .bind(character_id)
                .bind(speaker.as_str())
                .bind(content)
                .bind(at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recent `limit` messages, oldest first.
    pub async fn recent_chats(&self, owner_id: i64, character_id: i64, limit: i64) -> Result<Vec<ChatRow>> {
        let rows = sqlx::query(
            r#"SELECT id, owner_id, character_id, speaker, content, chatted_at FROM Chat
               WHERE owner_id = ?1 AND character_id = ?2 ORDER BY id DESC LIMIT ?3"#,
        )
        .bind(owner_id)
        .bind(character_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows.into_iter().rev() {
            let speaker: String = r.get("speaker");
            out.push(ChatRow {
                id: r.get("id"),
                owner_id: r.get("owner_id"),
                character_id: r.get("character_id"),
                speaker: Speaker::parse(&speaker)?,
                content: r.get("content"),
                chatted_at: r.get("chatted_at"),
            });
        }
        Ok(out)
    }

    pub async fn count_chats(&self, owner_id: i64, character_id: i64) -> Result<i64> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS n FROM Chat WHERE owner_id = ?1 AND character_id = ?2"#)
            .bind(owner_id)
            .bind(character_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Increments the (owner, character) counter and, when the new value reaches
    /// `threshold`, subtracts the threshold in the same statement. SET expressions
    /// read the pre-update row, so `claimed` reflects this increment only and two
    /// concurrent callers can never both claim one crossing.
    pub async fn increment_and_claim(&self, owner_id: i64, character_id: i64, threshold: i64) -> Result<CounterStep> {
        if threshold < 1 { bail!("consolidation threshold must be positive, got {threshold}"); }
        let row = sqlx::query(
            r#"INSERT INTO ConsolidationCounter(owner_id, character_id, count, claimed)
               VALUES (?1, ?2, CASE WHEN 1 >= ?3 THEN 1 - ?3 ELSE 1 END, 1 >= ?3)
               ON CONFLICT(owner_id, character_id) DO UPDATE SET
                   claimed = (ConsolidationCounter.count + 1 >= ?3),
                   count = CASE WHEN ConsolidationCounter.count + 1 >= ?3
                                THEN ConsolidationCounter.count + 1 - ?3
                                ELSE ConsolidationCounter.count + 1 END,
                   updated_at = CURRENT_TIMESTAMP
               RETURNING count, claimed"#,
        )
        .bind(owner_id)
        .bind(character_id)
        .bind(threshold)
        .fetch_one(&self.pool)
        .await?;
        Ok(CounterStep { count: row.get("count"), claimed: row.get::<bool, _>("claimed") })
    }

    /// Gives a claimed crossing back so the next increment claims it again.
    pub async fn restore_claim(&self, owner_id: i64, character_id: i64, threshold: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE ConsolidationCounter SET count = count + ?3, claimed = 0, updated_at = CURRENT_TIMESTAMP
               WHERE owner_id = ?1 AND character_id = ?2"#,
        )
        .bind(owner_id)
        .bind(character_id)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn counter_value(&self, owner_id: i64, character_id: i64) -> Result<i64> {
        let row = sqlx::query(r#"SELECT count FROM ConsolidationCounter WHERE owner_id = ?1 AND character_id = ?2"#)
            .bind(owner_id)
            .bind(character_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("count")).unwrap_or(0))
    }

    pub async fn insert_long_term(&self, owner_id: i64, character_id: i64, summary: &str, topics: &[String], embedding: &[f32]) -> Result<LongTermRecord> {
        let topics_json = serde_json::to_string(topics)?;
        let created_at = Utc::now();
        let row = sqlx::query(
            r#"INSERT INTO LongTermMemory(owner_id, character_id, summary, topics, embedding, dims, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING id"#,
        )
        .bind(owner_id)
        .bind(character_id)
        .bind(summary)
        .bind(&topics_json)
        .bind(encode_vector(embedding))
        .bind(embedding.len() as i64)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(LongTermRecord {
            id: row.get("id"),
            owner_id,
            character_id,
            summary: summary.to_string(),
            topics: topics.to_vec(),
            embedding: embedding.to_vec(),
            created_at,
        })
    }

    /// Newest first.
    pub async fn recent_long_term(&self, owner_id: i64, character_id: i64, limit: i64) -> Result<Vec<LongTermRecord>> {
        let rows = sqlx::query(
            r#"SELECT id, owner_id, character_id, summary, topics, embedding, created_at FROM LongTermMemory
               WHERE owner_id = ?1 AND character_id = ?2 ORDER BY id DESC LIMIT ?3"#,
        )
        .bind(owner_id)
        .bind(character_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Brute-force L2 nearest neighbours, ascending by distance. Records whose
    /// dimensionality differs from the query (other embedding model) are skipped.
    pub async fn nearest_long_term(&self, owner_id: i64, character_id: i64, query: &[f32], k: usize) -> Result<Vec<MemoryHit>> {
        let rows = sqlx::query(
            r#"SELECT id, owner_id, character_id, summary, topics, embedding, created_at FROM LongTermMemory
               WHERE owner_id = ?1 AND character_id = ?2 AND dims = ?3"#,
        )
        .bind(owner_id)
        .bind(character_id)
        .bind(query.len() as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut hits = Vec::with_capacity(rows.len());
        for r in rows.iter() {
            let record = record_from_row(r)?;
            let distance = l2_distance(query, &record.embedding);
            hits.push(MemoryHit { record, distance });
        }
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(b.record.id.cmp(&a.record.id)));
        hits.truncate(k);
        Ok(hits)
    }

    pub async fn count_long_term(&self, owner_id: i64, character_id: i64) -> Result<i64> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS n FROM LongTermMemory WHERE owner_id = ?1 AND character_id = ?2"#)
            .bind(owner_id)
            .bind(character_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

fn record_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<LongTermRecord> {
    let topics: Option<String> = r.get("topics");
    let topics = match topics {
        Some(t) => serde_json::from_str(&t)?,
        None => Vec::new(),
    };
    let blob: Vec<u8> = r.get("embedding");
    Ok(LongTermRecord {
        id: r.get("id"),
        owner_id: r.get("owner_id"),
        character_id: r.get("character_id"),
        summary: r.get("summary"),
        topics,
        embedding: decode_vector(&blob),
        created_at: r.get("created_at"),
    })
}

pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v { out.extend_from_slice(&x.to_le_bytes()); }
    out
}

pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_blob_keeps_values() {
        let v = vec![0.5f32, -1.25, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }

    #[test]
    fn l2_distance_of_identical_vectors_is_zero() {
        let v = [1.0f32, 2.0, 3.0];
        assert_eq!(l2_distance(&v, &v), 0.0);
        assert!((l2_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn speaker_round_trips_through_column_text() {
        assert_eq!(Speaker::parse(Speaker::Bot.as_str()).unwrap(), Speaker::Bot);
        assert!(Speaker::parse("ROBOT").is_err());
    }
}
