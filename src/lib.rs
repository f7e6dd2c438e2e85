//! # Recall
//!
//! **A local-first indexer daemon and search engine for AI-assistant
//! session transcripts.**
//!
//! Recall crawls the session stores of local assistant tools (line-delimited
//! JSON transcripts), maintains a relational index plus an embeddings
//! database, watches the filesystem for changes, and serves literal and
//! semantic search over a local unix socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │   Stores    │──▶│   Ingester   │──▶│  index.db     │
//! │ jsonl:*     │   │ index+embed  │   │  embeddings.db│
//! └─────────────┘   └──────────────┘   └──────┬────────┘
//!        ▲                 ▲                  │
//!        │                 │                  ▼
//!   ┌────┴────┐      ┌─────┴─────┐     ┌──────────┐
//!   │ Watcher │      │  Daemon   │◀───▶│  Search  │
//!   └─────────┘      │ (socket)  │     └──────────┘
//!                    └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **Stores** ([`store`]) enumerate projects and sessions and stream
//!    [`models::Entry`] values out of transcript files.
//! 2. The **ingester** ([`ingest`]) reconciles them into the index
//!    ([`index_db`]) and, in a second pass, embeds per-entry text chunks
//!    ([`extract`], [`embedder`]) into the embeddings store ([`embed_db`]).
//! 3. The **watcher** ([`watcher`]) debounces file writes and re-ingests
//!    changed sessions without a restart.
//! 4. The **daemon** ([`daemon`]) coordinates the single in-flight sync,
//!    streams progress to subscribers, and serves the socket protocol
//!    ([`protocol`], [`server`]).
//! 5. The **search service** ([`search`]) answers literal queries by
//!    re-scanning the original files and semantic queries with the
//!    two-phase nearest-vector algorithm.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Project`, `SessionMeta`, `Entry`, blocks |
//! | [`store`] | Store trait, registry, and session readers |
//! | [`store_jsonl`] | Built-in generic JSONL store adapter |
//! | [`index_db`] | Index database (projects, sessions, entries, sync state) |
//! | [`embed_db`] | Embeddings database with cosine-distance queries |
//! | [`extract`] | Entry text extraction and the overlap chunker |
//! | [`embedder`] | Embedding model wrapper (fastembed) |
//! | [`ingest`] | Ingestion pipeline and embedding pass |
//! | [`watcher`] | Debounced filesystem watcher |
//! | [`search`] | Literal and semantic search |
//! | [`protocol`] | Socket wire protocol frames |
//! | [`server`] | Unix-socket RPC server |
//! | [`client`] | Socket client for the CLI |
//! | [`daemon`] | Daemon orchestration and lifecycle |

pub mod client;
pub mod config;
pub mod daemon;
pub mod embed_db;
pub mod embedder;
pub mod extract;
pub mod index_db;
pub mod ingest;
pub mod models;
pub mod protocol;
pub mod search;
pub mod server;
pub mod store;
pub mod store_jsonl;
pub mod watcher;
