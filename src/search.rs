//! Search engine: literal text search and two-phase semantic search.
//!
//! **Literal** search re-scans the original session files. The index only
//! supplies candidates (sessions joined with projects, filtered by project
//! name and source); a bounded worker pool greps each candidate file and a
//! single aggregator groups matches by session in encounter order, applying
//! the per-session and global caps.
//!
//! **Semantic** search crosses two databases in three phases: resolve
//! metadata filters to permitted session ids in the index DB, run the
//! nearest-vector query in the embeddings DB, then rehydrate entry and
//! session details from the index DB in batched lookups. An optional MMR
//! pass reranks for session diversity.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::embed_db::EmbedDb;
use crate::index_db::{IndexDb, SessionCandidate};

/// Context kept around a literal match in its preview.
const PREVIEW_CONTEXT: usize = 100;

/// MMR trade-off between relevance and diversity.
const MMR_LAMBDA: f64 = 0.6;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("search cancelled")]
    Cancelled,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for SearchError {
    fn from(e: sqlx::Error) -> Self {
        SearchError::Backend(e.into())
    }
}

// ============ Literal search ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiteralQuery {
    pub query: String,
    #[serde(default)]
    pub filter_project: Option<String>,
    #[serde(default)]
    pub filter_source: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub limit_per_session: usize,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub use_regex: bool,
}

fn default_limit() -> usize {
    50
}

/// One matching line of one session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiteralMatch {
    pub line_num: i64,
    pub preview: String,
    pub role: String,
    pub match_start: usize,
    pub match_end: usize,
}

/// All matches of one session, in file order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMatches {
    pub session_id: String,
    pub path: String,
    pub project_name: String,
    pub source: String,
    pub matches: Vec<LiteralMatch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiteralResults {
    pub sessions: Vec<SessionMatches>,
    pub total_matches: usize,
}

struct ScanRecord {
    candidate: SessionCandidate,
    hits: Vec<LiteralMatch>,
}

/// Run a literal search over the files named by the index candidates.
///
/// `max_scans` bounds concurrent file scans. The global cap may be
/// overshot by in-flight workers; results are truncated to `limit` before
/// returning. Cancellation is checked between candidate scans.
pub async fn literal_search(
    index: &IndexDb,
    query: &LiteralQuery,
    max_scans: usize,
    cancel: &CancellationToken,
) -> Result<LiteralResults, SearchError> {
    let pattern = if query.use_regex {
        query.query.clone()
    } else {
        regex::escape(&query.query)
    };
    let matcher = regex::RegexBuilder::new(&pattern)
        .case_insensitive(!query.case_sensitive)
        .build()?;

    let candidates = index
        .session_candidates(query.filter_project.as_deref(), query.filter_source.as_deref())
        .await
        .map_err(SearchError::Backend)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<ScanRecord>();
    let semaphore = Arc::new(Semaphore::new(max_scans.max(1)));
    let scan_cancel = cancel.child_token();
    let per_session_cap = query.limit_per_session;

    for candidate in candidates {
        let tx = tx.clone();
        let semaphore = Arc::clone(&semaphore);
        let matcher = matcher.clone();
        let scan_cancel = scan_cancel.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if scan_cancel.is_cancelled() {
                return;
            }
            let path = candidate.path.clone();
            let records = tokio::task::spawn_blocking(move || {
                scan_file(&path, &matcher, per_session_cap)
            })
            .await;
            match records {
                Ok(Ok(hits)) if !hits.is_empty() => {
                    let _ = tx.send(ScanRecord { candidate, hits });
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(path = %candidate.path, error = %e, "scan failed");
                }
                Err(_) => {}
            }
        });
    }
    drop(tx);

    // Single aggregator: one record per matching session, in encounter
    // order. Workers in flight may overshoot the global cap; the final
    // session's matches are trimmed so the cap holds on return.
    let mut results = LiteralResults::default();

    while let Some(mut record) = rx.recv().await {
        if cancel.is_cancelled() {
            scan_cancel.cancel();
            return Err(SearchError::Cancelled);
        }

        if query.limit_per_session > 0 {
            record.hits.truncate(query.limit_per_session);
        }
        let room = query.limit.saturating_sub(results.total_matches);
        record.hits.truncate(room);
        if record.hits.is_empty() {
            break;
        }

        results.total_matches += record.hits.len();
        results.sessions.push(SessionMatches {
            session_id: record.candidate.session_id,
            path: record.candidate.path,
            project_name: record.candidate.project_name,
            source: record.candidate.source,
            matches: record.hits,
        });

        if results.total_matches >= query.limit {
            break;
        }
    }
    scan_cancel.cancel();

    Ok(results)
}

/// Scan one session file line by line for matches.
fn scan_file(
    path: &str,
    matcher: &regex::Regex,
    limit_per_session: usize,
) -> anyhow::Result<Vec<LiteralMatch>> {
    use std::io::BufRead;

    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut hits = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(_) => continue,
        };
        let m = match matcher.find(&line) {
            Some(m) => m,
            None => continue,
        };

        let (preview, match_start, match_end) = build_preview(&line, m.start(), m.end());
        hits.push(LiteralMatch {
            line_num: (i + 1) as i64,
            preview,
            role: role_hint(&line),
            match_start,
            match_end,
        });

        if limit_per_session > 0 && hits.len() >= limit_per_session {
            break;
        }
    }

    Ok(hits)
}

/// Extract a role hint from a raw transcript line without a full parse.
fn role_hint(line: &str) -> String {
    #[derive(Deserialize)]
    struct RoleHint {
        role: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
    }

    serde_json::from_str::<RoleHint>(line)
        .ok()
        .and_then(|h| h.role.or(h.kind))
        .unwrap_or_default()
}

/// Build the ±100-char preview around the first match at byte range
/// `[start, end)`. A left truncation prefixes `"..."` and shifts the match
/// offsets by 3; a right truncation appends `"..."`.
fn build_preview(line: &str, start: usize, end: usize) -> (String, usize, usize) {
    let from = floor_char_boundary(line, start.saturating_sub(PREVIEW_CONTEXT));
    let to = ceil_char_boundary(line, (end + PREVIEW_CONTEXT).min(line.len()));

    let mut preview = String::new();
    let mut shift = 0;
    if from > 0 {
        preview.push_str("...");
        shift = 3;
    }
    preview.push_str(&line[from..to]);
    if to < line.len() {
        preview.push_str("...");
    }

    (preview, start - from + shift, end - from + shift)
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ============ Semantic search ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticQuery {
    #[serde(default)]
    pub filter_project: Option<String>,
    #[serde(default)]
    pub filter_source: Option<String>,
    #[serde(default = "default_semantic_limit")]
    pub limit: usize,
    #[serde(default)]
    pub max_distance: f64,
    #[serde(default)]
    pub diversity: bool,
}

fn default_semantic_limit() -> usize {
    10
}

/// One semantic search result, fully rehydrated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticHit {
    pub session_id: String,
    pub entry_uuid: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub distance: f64,
    pub role: String,
    pub timestamp: i64,
    pub tool_name: String,
    pub word_count: i64,
    pub line_number: i64,
    pub project_name: String,
    pub source: String,
    pub session_path: String,
    pub first_prompt: String,
}

/// Two-phase semantic search over the split index/embeddings databases.
pub async fn semantic_search(
    index: &IndexDb,
    embed_db: &EmbedDb,
    query_vector: &[f32],
    model: &str,
    query: &SemanticQuery,
) -> Result<Vec<SemanticHit>, SearchError> {
    // Phase 1: resolve metadata filters to permitted session ids.
    let session_filter = if query.filter_project.is_some() || query.filter_source.is_some() {
        let ids = index
            .filtered_session_ids(query.filter_project.as_deref(), query.filter_source.as_deref())
            .await
            .map_err(SearchError::Backend)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Some(ids)
    } else {
        None
    };

    // Phase 2: nearest vectors. Over-fetch when a diversity rerank will
    // discard near-duplicates.
    let fetch_limit = if query.diversity {
        (3 * query.limit).max(30)
    } else {
        query.limit
    };
    let hits = embed_db
        .nearest(
            query_vector,
            model,
            session_filter.as_deref(),
            query.max_distance,
            fetch_limit,
        )
        .await
        .map_err(SearchError::Backend)?;

    if hits.is_empty() {
        return Ok(Vec::new());
    }

    // Phase 3: batched rehydration, keyed by the unique ids only.
    let pairs: Vec<(String, String)> = {
        let mut seen = HashSet::new();
        hits.iter()
            .filter(|h| seen.insert((h.session_id.clone(), h.entry_uuid.clone())))
            .map(|h| (h.session_id.clone(), h.entry_uuid.clone()))
            .collect()
    };
    let session_ids: Vec<String> = {
        let mut seen = HashSet::new();
        hits.iter()
            .filter(|h| seen.insert(h.session_id.clone()))
            .map(|h| h.session_id.clone())
            .collect()
    };

    let entry_details = index
        .entry_details(&pairs)
        .await
        .map_err(SearchError::Backend)?;
    let session_details = index
        .session_details(&session_ids)
        .await
        .map_err(SearchError::Backend)?;

    let mut results: Vec<SemanticHit> = hits
        .into_iter()
        .map(|h| {
            let entry = entry_details.get(&(h.session_id.clone(), h.entry_uuid.clone()));
            let session = session_details.get(&h.session_id);
            SemanticHit {
                session_id: h.session_id,
                entry_uuid: h.entry_uuid,
                chunk_index: h.chunk_index,
                total_chunks: h.total_chunks,
                distance: h.distance,
                role: entry.map(|e| e.role.clone()).unwrap_or_default(),
                timestamp: entry.map(|e| e.timestamp).unwrap_or_default(),
                tool_name: entry.map(|e| e.tool_name.clone()).unwrap_or_default(),
                word_count: entry.map(|e| e.word_count).unwrap_or_default(),
                line_number: entry.map(|e| e.line_number).unwrap_or_default(),
                project_name: session.map(|s| s.project_name.clone()).unwrap_or_default(),
                source: session.map(|s| s.source.clone()).unwrap_or_default(),
                session_path: session.map(|s| s.path.clone()).unwrap_or_default(),
                first_prompt: session.map(|s| s.first_prompt.clone()).unwrap_or_default(),
            }
        })
        .collect();

    if query.diversity && results.len() > query.limit {
        results = mmr_rerank(results, query.limit);
    } else {
        results.truncate(query.limit);
    }

    Ok(results)
}

/// Maximal-marginal-relevance rerank: start from the lowest-distance hit,
/// then greedily pick the hit maximizing
/// `λ·(2−distance) − (1−λ)·max_sim(selected)`.
fn mmr_rerank(candidates: Vec<SemanticHit>, limit: usize) -> Vec<SemanticHit> {
    let mut remaining = candidates;
    let mut selected: Vec<SemanticHit> = Vec::with_capacity(limit);

    // Seed with the most relevant candidate.
    if let Some(best) = remaining
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
    {
        selected.push(remaining.swap_remove(best));
    }

    while selected.len() < limit && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_score = f64::NEG_INFINITY;

        for (i, candidate) in remaining.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|s| session_sim(candidate, s))
                .fold(0.0f64, f64::max);
            let score = MMR_LAMBDA * (2.0 - candidate.distance) - (1.0 - MMR_LAMBDA) * max_sim;
            if score > best_score {
                best_score = score;
                best_idx = i;
            }
        }

        selected.push(remaining.swap_remove(best_idx));
    }

    selected
}

/// Coarse similarity between two hits based on where they live.
fn session_sim(a: &SemanticHit, b: &SemanticHit) -> f64 {
    if a.session_id == b.session_id {
        1.0
    } else if a.project_name == b.project_name && a.source == b.source {
        0.5
    } else if a.source == b.source {
        0.3
    } else {
        0.0
    }
}
