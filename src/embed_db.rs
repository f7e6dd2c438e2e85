//! Embeddings database: fixed-width float vectors and cosine-distance queries.
//!
//! Kept separate from the index database so the (much larger) vector data
//! can be rebuilt or migrated without touching session metadata. Vectors
//! are stored as little-endian `f32` BLOBs; the nearest-vector query is the
//! authoritative distance computation, so callers never rank vectors
//! themselves.
//!
//! Row ids are `{source}:{session_id}:{entry_uuid}_{tier}_{chunk_index}`,
//! stable across re-ingests, which makes the upsert idempotent.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

/// One embedding row to upsert.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub id: String,
    pub session_id: String,
    pub entry_uuid: String,
    pub chunk_index: i64,
    pub model: String,
    pub dim: i64,
    pub vector: Vec<f32>,
    pub text_hash: String,
    pub tier: String,
}

/// Compose the stable embedding row id.
pub fn embedding_id(
    source: &str,
    session_id: &str,
    entry_uuid: &str,
    tier: &str,
    chunk_index: usize,
) -> String {
    format!(
        "{}:{}:{}_{}_{}",
        source, session_id, entry_uuid, tier, chunk_index
    )
}

/// One hit from the nearest-vector query, ordered by ascending distance.
#[derive(Debug, Clone)]
pub struct NearestHit {
    pub session_id: String,
    pub entry_uuid: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub distance: f64,
}

#[derive(Clone)]
pub struct EmbedDb {
    pool: SqlitePool,
}

impl EmbedDb {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = connect(path).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                entry_uuid TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                model TEXT NOT NULL,
                dim INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                text_hash TEXT NOT NULL,
                tier TEXT NOT NULL DEFAULT 'conversation'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_embeddings_session ON embeddings(session_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Upsert a batch of rows. Replaces vector and hash in place on id
    /// conflict, so re-embedding an unchanged session is a no-op in effect.
    pub async fn upsert_rows(&self, rows: &[EmbeddingRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO embeddings (id, session_id, entry_uuid, chunk_index, model,
                                        dim, embedding, text_hash, tier)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    model = excluded.model,
                    dim = excluded.dim,
                    embedding = excluded.embedding,
                    text_hash = excluded.text_hash,
                    tier = excluded.tier
                "#,
            )
            .bind(&row.id)
            .bind(&row.session_id)
            .bind(&row.entry_uuid)
            .bind(row.chunk_index)
            .bind(&row.model)
            .bind(row.dim)
            .bind(vec_to_blob(&row.vector))
            .bind(&row.text_hash)
            .bind(&row.tier)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete every row whose model differs from `model`. Run before an
    /// embedding pass so dimensionality never mixes within one model id.
    pub async fn delete_other_models(&self, model: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embeddings WHERE model != ?")
            .bind(model)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Distinct session ids that have at least one row for `model`.
    pub async fn embedded_session_ids(&self, model: &str) -> Result<Vec<String>> {
        let rows =
            sqlx::query_scalar("SELECT DISTINCT session_id FROM embeddings WHERE model = ?")
                .bind(model)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Nearest-vector query: cosine distance of every `model` row against
    /// `query`, optionally restricted to `session_ids` and to distances
    /// strictly below `max_distance` (when > 0). Results come back ordered
    /// ascending and truncated to `fetch_limit`.
    ///
    /// `total_chunks` counts same-model rows sharing the hit's
    /// `(session_id, entry_uuid)` so callers can render "chunk 2 of 5".
    pub async fn nearest(
        &self,
        query: &[f32],
        model: &str,
        session_ids: Option<&[String]>,
        max_distance: f64,
        fetch_limit: usize,
    ) -> Result<Vec<NearestHit>> {
        let mut sql = String::from(
            "SELECT e.session_id, e.entry_uuid, e.chunk_index, e.embedding,
                    (SELECT COUNT(*) FROM embeddings e2
                     WHERE e2.session_id = e.session_id
                       AND e2.entry_uuid = e.entry_uuid
                       AND e2.model = e.model) AS total_chunks
             FROM embeddings e WHERE e.model = ?",
        );
        if let Some(ids) = session_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(",");
            sql.push_str(&format!(" AND e.session_id IN ({})", placeholders));
        }

        let mut q = sqlx::query(&sql).bind(model);
        if let Some(ids) = session_ids {
            for id in ids {
                q = q.bind(id);
            }
        }

        let mut hits: Vec<NearestHit> = q
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                NearestHit {
                    session_id: row.get("session_id"),
                    entry_uuid: row.get("entry_uuid"),
                    chunk_index: row.get("chunk_index"),
                    total_chunks: row.get("total_chunks"),
                    distance: cosine_distance(query, &vector),
                }
            })
            .collect();

        if max_distance > 0.0 {
            hits.retain(|h| h.distance < max_distance);
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(fetch_limit);
        Ok(hits)
    }

    pub async fn row_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_for_model(&self, model: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE model = ?")
            .bind(model)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Fetch `(id, text_hash, vector)` for every row, for tests and audits.
    pub async fn all_rows_brief(&self) -> Result<Vec<(String, String, Vec<f32>)>> {
        let rows = sqlx::query("SELECT id, text_hash, embedding FROM embeddings ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let blob: Vec<u8> = r.get("embedding");
                (r.get("id"), r.get("text_hash"), blob_to_vec(&blob))
            })
            .collect())
    }
}

async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .pragma("trusted_schema", "off");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors; `0.0` for mismatched or empty input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance: `1 − similarity`, in `[0.0, 2.0]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b) as f64
}
