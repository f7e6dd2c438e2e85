//! Ingestion pipeline orchestration.
//!
//! The [`Ingester`] reconciles store contents into the index and, as a
//! second pass, embeds sessions that lack vectors for the current model.
//! Per-session failures during a sweep are logged and the sweep continues;
//! only index write failures abort an individual session. Cancellation is
//! honored between sessions and between embedding sub-batches — partial
//! writes are not rolled back, the next ingest reconciles them.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embed_db::{embedding_id, EmbedDb, EmbeddingRow};
use crate::embedder::Embedder;
use crate::extract::{chunk_text, entry_text, entry_text_tiered, word_count};
use crate::index_db::{EntryRow, IndexDb, SessionRef, FIRST_PROMPT_MAX};
use crate::models::{Project, SessionMeta};
use crate::store::{Store as _, StoreRegistry};

/// Upper bound on texts per embed call.
const EMBED_BATCH: usize = 16;

/// Distinguished cancellation error; callers treat it as an outcome, not a
/// failure, and must not log it as one.
#[derive(Debug, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Per-session progress during the indexing pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexProgress {
    pub project_idx: usize,
    pub project_total: usize,
    pub session_idx: usize,
    pub session_total: usize,
    pub message: String,
}

/// Per-session progress during the embedding pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedProgress {
    pub done: usize,
    pub total: usize,
    pub chunks: u64,
    pub entries: u64,
    pub session_id: String,
    pub path: String,
    pub elapsed_secs: f64,
}

/// Per-sub-batch progress within one session's embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedChunkProgress {
    pub chunks_done: usize,
    pub chunks_total: usize,
    pub tokens_done: u64,
    pub session_id: String,
}

/// Outcome of a full embedding pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedSummary {
    pub sessions: usize,
    pub chunks: u64,
    pub tokens: u64,
}

pub type IndexProgressFn = Arc<dyn Fn(&IndexProgress) + Send + Sync>;
pub type EmbedProgressFn = Arc<dyn Fn(&EmbedProgress) + Send + Sync>;
pub type EmbedChunkProgressFn = Arc<dyn Fn(&EmbedChunkProgress) + Send + Sync>;

/// One chunk queued for embedding, paired with where its row will live.
struct ChunkRequest {
    id: String,
    session_id: String,
    entry_uuid: String,
    chunk_index: usize,
    tier: &'static str,
    text: String,
}

pub struct Ingester {
    index: IndexDb,
    embed_db: Option<EmbedDb>,
    embedder: Option<Arc<dyn Embedder>>,
    registry: Arc<StoreRegistry>,
    chunk_max_chars: usize,
    chunk_overlap: usize,
    on_index_progress: Option<IndexProgressFn>,
    on_embed_progress: Option<EmbedProgressFn>,
    on_embed_chunk_progress: Option<EmbedChunkProgressFn>,
}

impl Ingester {
    pub fn new(
        config: &Config,
        index: IndexDb,
        embed_db: Option<EmbedDb>,
        embedder: Option<Arc<dyn Embedder>>,
        registry: Arc<StoreRegistry>,
    ) -> Self {
        Self {
            index,
            embed_db,
            embedder,
            registry,
            chunk_max_chars: config.embedding.chunk_max_chars,
            chunk_overlap: config.embedding.chunk_overlap,
            on_index_progress: None,
            on_embed_progress: None,
            on_embed_chunk_progress: None,
        }
    }

    pub fn set_index_progress(&mut self, f: IndexProgressFn) {
        self.on_index_progress = Some(f);
    }

    pub fn set_embed_progress(&mut self, f: EmbedProgressFn) {
        self.on_embed_progress = Some(f);
    }

    pub fn set_embed_chunk_progress(&mut self, f: EmbedChunkProgressFn) {
        self.on_embed_chunk_progress = Some(f);
    }

    /// Reconcile one project: upsert its row, then ingest each of its
    /// sessions. Session failures are logged and do not stop the sweep.
    pub async fn ingest_project(
        &self,
        cancel: &CancellationToken,
        project: &Project,
        project_idx: usize,
        project_total: usize,
    ) -> Result<()> {
        self.index.upsert_project(project).await?;

        let store = match self.registry.get(&project.source) {
            Some(store) => store,
            None => bail!("no store registered for source '{}'", project.source),
        };

        let sessions = store.list_sessions(&project.id).await?;
        let total = sessions.len();
        let scoped_id = project.scoped_id();

        for (i, meta) in sessions.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            if let Some(callback) = &self.on_index_progress {
                callback(&IndexProgress {
                    project_idx,
                    project_total,
                    session_idx: i + 1,
                    session_total: total,
                    message: format!("{}: {}", project.display_name, meta.id),
                });
            }

            if let Err(e) = self.ingest_session(&scoped_id, &meta).await {
                warn!(
                    session = %meta.id,
                    project = %project.display_name,
                    error = %e,
                    "session ingest failed, continuing sweep"
                );
            }
        }

        Ok(())
    }

    /// Ingest one session. Returns `false` when the sync watermark shows
    /// the file unchanged and nothing was written.
    pub async fn ingest_session(
        &self,
        scoped_project_id: &str,
        meta: &SessionMeta,
    ) -> Result<bool> {
        if let Some(state) = self.index.sync_state(&meta.full_path).await? {
            let changed = meta.modified_at.timestamp() > state.last_mod_time
                || meta.file_size != state.file_size;
            if !changed {
                debug!(session = %meta.id, "unchanged, skipping");
                return Ok(false);
            }
        }

        let store = match self.registry.get(&meta.source) {
            Some(store) => store,
            None => bail!("no store registered for source '{}'", meta.source),
        };

        let mut reader = store.open_session(&meta.id).await?;
        let mut rows = Vec::new();
        let mut lines_read: i64 = 0;
        let mut first_prompt = meta.first_prompt.clone();
        let mut model = meta.model.clone();
        let mut git_branch = meta.git_branch.clone();

        while let Some(entry) = reader.next_entry()? {
            lines_read += 1;
            if entry.uuid.is_empty() {
                continue;
            }

            let text = entry_text(&entry);
            if first_prompt.is_empty() && entry.role == crate::models::EntryRole::User {
                first_prompt = crate::index_db::truncate_chars(&text, FIRST_PROMPT_MAX);
            }
            if model.is_empty()
                && entry.role == crate::models::EntryRole::Assistant
                && !entry.model.is_empty()
            {
                model = entry.model.clone();
            }
            if git_branch.is_empty() && !entry.git_branch.is_empty() {
                git_branch = entry.git_branch.clone();
            }

            let usage = entry.usage.clone().unwrap_or_default();
            rows.push(EntryRow {
                uuid: entry.uuid.clone(),
                session_id: meta.id.clone(),
                timestamp: entry.timestamp.timestamp(),
                role: entry.role.as_str().to_string(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                tool_name: entry.tool_name().unwrap_or_default().to_string(),
                is_error: entry.has_error(),
                word_count: word_count(&text),
                thinking_len: entry.thinking_len(),
                line_number: lines_read,
            });
        }

        let meta = SessionMeta {
            project_scoped_id: scoped_project_id.to_string(),
            first_prompt,
            model,
            git_branch,
            ..meta.clone()
        };

        self.index.replace_session(&meta, &rows, lines_read).await?;
        debug!(session = %meta.id, entries = rows.len(), "ingested");
        Ok(true)
    }

    /// Embedding pass: embed every session that has entry rows but no
    /// vectors for the current model. Runs the model migration first so
    /// stale-model rows never linger past a pass.
    pub async fn embed_all_sessions(&self, cancel: &CancellationToken) -> Result<EmbedSummary> {
        let (embed_db, embedder) = self.embedding_handles()?;

        self.migrate_embeddings().await?;

        let model = embedder.model_id().to_string();
        let candidates = self.index.sessions_with_entries().await?;
        let already: std::collections::HashSet<String> = embed_db
            .embedded_session_ids(&model)
            .await?
            .into_iter()
            .collect();

        let eligible: Vec<SessionRef> = candidates
            .into_iter()
            .filter(|s| !already.contains(&s.session_id))
            .collect();

        let total = eligible.len();
        let started = Instant::now();
        let mut summary = EmbedSummary::default();
        let mut entries_done: u64 = 0;

        for (i, sref) in eligible.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            match self.embed_session(cancel, sref).await {
                Ok((chunks, tokens, entries)) => {
                    summary.sessions += 1;
                    summary.chunks += chunks;
                    summary.tokens += tokens;
                    entries_done += entries;
                }
                Err(e) if e.is::<Cancelled>() => return Err(e),
                Err(e) => {
                    warn!(session = %sref.session_id, error = %e, "embedding failed, continuing");
                }
            }

            if let Some(callback) = &self.on_embed_progress {
                callback(&EmbedProgress {
                    done: i + 1,
                    total,
                    chunks: summary.chunks,
                    entries: entries_done,
                    session_id: sref.session_id.clone(),
                    path: sref.path.clone(),
                    elapsed_secs: started.elapsed().as_secs_f64(),
                });
            }
        }

        info!(
            sessions = summary.sessions,
            chunks = summary.chunks,
            tokens = summary.tokens,
            "embedding pass complete"
        );
        Ok(summary)
    }

    /// Embed one session's entries: extract tiers, chunk, and upsert in
    /// sub-batches. Returns `(chunks, tokens, entries)` written.
    async fn embed_session(
        &self,
        cancel: &CancellationToken,
        sref: &SessionRef,
    ) -> Result<(u64, u64, u64)> {
        let (embed_db, embedder) = self.embedding_handles()?;

        let store = match self.registry.get(&sref.source) {
            Some(store) => store,
            None => bail!("no store registered for source '{}'", sref.source),
        };

        let mut reader = store.open_session(&sref.session_id).await?;
        let mut requests = Vec::new();
        let mut entries: u64 = 0;

        while let Some(entry) = reader.next_entry()? {
            if entry.uuid.is_empty() {
                continue;
            }
            let tiers = entry_text_tiered(&entry);
            if tiers.is_empty() {
                continue;
            }
            entries += 1;
            for (tier, text) in tiers {
                for (chunk_index, chunk) in chunk_text(&text, self.chunk_max_chars, self.chunk_overlap)
                    .into_iter()
                    .enumerate()
                {
                    requests.push(ChunkRequest {
                        id: embedding_id(
                            &sref.source,
                            &sref.session_id,
                            &entry.uuid,
                            tier.as_str(),
                            chunk_index,
                        ),
                        session_id: sref.session_id.clone(),
                        entry_uuid: entry.uuid.clone(),
                        chunk_index,
                        tier: tier.as_str(),
                        text: chunk,
                    });
                }
            }
        }

        let chunks_total = requests.len();
        let mut chunks_done = 0usize;
        let mut tokens_done: u64 = 0;

        for batch in requests.chunks(EMBED_BATCH) {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
            let worker = Arc::clone(embedder);
            let output =
                tokio::task::spawn_blocking(move || worker.embed(&texts)).await??;

            if output.vectors.len() != batch.len() {
                bail!(
                    "embedder returned {} vectors for {} inputs",
                    output.vectors.len(),
                    batch.len()
                );
            }

            let rows: Vec<EmbeddingRow> = batch
                .iter()
                .zip(output.vectors)
                .map(|(request, vector)| EmbeddingRow {
                    id: request.id.clone(),
                    session_id: request.session_id.clone(),
                    entry_uuid: request.entry_uuid.clone(),
                    chunk_index: request.chunk_index as i64,
                    model: embedder.model_id().to_string(),
                    dim: embedder.dim() as i64,
                    vector,
                    text_hash: text_hash(&request.text),
                    tier: request.tier.to_string(),
                })
                .collect();

            embed_db.upsert_rows(&rows).await?;

            chunks_done += batch.len();
            tokens_done += output.total_tokens as u64;

            if let Some(callback) = &self.on_embed_chunk_progress {
                callback(&EmbedChunkProgress {
                    chunks_done,
                    chunks_total,
                    tokens_done,
                    session_id: sref.session_id.clone(),
                });
            }
        }

        Ok((chunks_done as u64, tokens_done, entries))
    }

    /// Delete every embedding row written by a different model.
    pub async fn migrate_embeddings(&self) -> Result<u64> {
        let (embed_db, embedder) = self.embedding_handles()?;
        let deleted = embed_db.delete_other_models(embedder.model_id()).await?;
        if deleted > 0 {
            info!(deleted, model = embedder.model_id(), "migrated embeddings");
        }
        Ok(deleted)
    }

    /// Watcher entry point: re-ingest a session and embed it right away.
    pub async fn ingest_and_embed_session(
        &self,
        cancel: &CancellationToken,
        scoped_project_id: &str,
        meta: &SessionMeta,
    ) -> Result<()> {
        let changed = self.ingest_session(scoped_project_id, meta).await?;
        if !changed {
            return Ok(());
        }
        if self.embed_db.is_some() && self.embedder.is_some() {
            let sref = SessionRef {
                session_id: meta.id.clone(),
                path: meta.full_path.clone(),
                source: meta.source.clone(),
            };
            self.embed_session(cancel, &sref).await?;
        }
        Ok(())
    }

    fn embedding_handles(&self) -> Result<(&EmbedDb, &Arc<dyn Embedder>)> {
        match (&self.embed_db, &self.embedder) {
            (Some(db), Some(embedder)) => Ok((db, embedder)),
            _ => bail!("embedding is not enabled"),
        }
    }
}

fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_hash_is_hex_sha256() {
        let hash = text_hash("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
