//! Daemon orchestration: lifecycle, state machine, sync fan-out, reload.
//!
//! The [`Daemon`] owns both databases, the store registry, and the optional
//! embedder, and coordinates every concurrent operation:
//!
//! - exactly one sync runs at a time; a second `sync` request joins the
//!   running one, subscribes to its progress fan-out, and receives the same
//!   final response as the initiator;
//! - the state machine is `idle → syncing → embedding → idle`, with the
//!   embedding leg skipped when no embedder is attached;
//! - config reload is serialized and only ever flips embedding on or off;
//! - shutdown cancels in-flight work through the process-wide token.
//!
//! Locks follow a strict discipline: the status lock only guards short
//! copies, subscriber senders are cloned out of their mutex before any send,
//! and no lock is held across I/O.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::{mpsc::UnboundedSender, watch, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{
    load_config, Config, EmbeddingConfig, EMBEDDINGS_DB_FILE, INDEX_DB_FILE, INSTANCE_FILE,
    MODEL_DIR, SOCKET_FILE,
};
use crate::embed_db::EmbedDb;
use crate::embedder::Embedder;
use crate::index_db::IndexDb;
use crate::ingest::{Cancelled, EmbedProgress, IndexProgress, Ingester};
use crate::models::Project;
use crate::protocol::{
    ConfigReloadData, InstanceInfo, StatsData, StatusData, SyncData,
};
use crate::search::{
    literal_search, semantic_search, LiteralQuery, LiteralResults, SemanticHit, SemanticQuery,
};
use crate::server::RpcServer;
use crate::store::{Store as _, StoreRegistry};
use crate::watcher::{EmbedDbSlot, EmbedderSlot, Watcher};

/// Constructs an embedder for a model config; swapped out by tests.
pub type EmbedderFactory =
    Arc<dyn Fn(&EmbeddingConfig, &Path) -> Result<Arc<dyn Embedder>> + Send + Sync>;

/// The stock factory: a fastembed-backed local model.
#[cfg(feature = "local-embeddings")]
pub fn default_embedder_factory() -> EmbedderFactory {
    Arc::new(|config: &EmbeddingConfig, model_dir: &Path| {
        let embedder = crate::embedder::LocalEmbedder::new(&config.model, model_dir)?;
        Ok(Arc::new(embedder) as Arc<dyn Embedder>)
    })
}

/// The stock factory, without a model runtime compiled in.
#[cfg(not(feature = "local-embeddings"))]
pub fn default_embedder_factory() -> EmbedderFactory {
    Arc::new(|_config: &EmbeddingConfig, _model_dir: &Path| {
        anyhow::bail!("recall was built without local-embeddings support")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaemonState {
    #[default]
    Idle,
    Syncing,
    Embedding,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Idle => "idle",
            DaemonState::Syncing => "syncing",
            DaemonState::Embedding => "embedding",
        }
    }
}

#[derive(Default)]
struct StatusInner {
    state: DaemonState,
    sync_progress: Option<IndexProgress>,
    embed_progress: Option<EmbedProgress>,
}

/// One in-flight sync: its progress subscribers and shared outcome.
struct SyncRun {
    subscribers: StdMutex<Vec<UnboundedSender<Value>>>,
    done: watch::Sender<bool>,
    outcome: OnceLock<Result<SyncData, String>>,
}

impl SyncRun {
    fn new() -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            subscribers: StdMutex::new(Vec::new()),
            done,
            outcome: OnceLock::new(),
        })
    }

    fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    fn subscribe(&self, tx: UnboundedSender<Value>) {
        self.subscribers.lock().unwrap().push(tx);
    }

    /// Fan a frame out to every subscriber. Senders are copied out of the
    /// mutex first so a slow consumer never blocks the sync.
    fn publish(&self, data: Value) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            let _ = subscriber.send(data.clone());
        }
    }

    /// Publish the outcome, then signal completion. Order matters: waiters
    /// read the outcome only after observing `done`.
    fn finish(&self, outcome: Result<SyncData, String>) {
        let _ = self.outcome.set(outcome);
        let _ = self.done.send(true);
    }

    async fn wait(&self) -> Result<SyncData, String> {
        let mut rx = self.done.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.outcome
            .get()
            .cloned()
            .unwrap_or_else(|| Err("sync aborted".to_string()))
    }
}

pub struct Daemon {
    config_dir: PathBuf,
    config: StdRwLock<Config>,
    index: IndexDb,
    embed_db: EmbedDbSlot,
    embedder: EmbedderSlot,
    registry: Arc<StoreRegistry>,
    embedder_factory: EmbedderFactory,
    status: StdRwLock<StatusInner>,
    sync_slot: StdMutex<Option<Arc<SyncRun>>>,
    reload_lock: TokioMutex<()>,
    pub(crate) shutdown: CancellationToken,
    started: Instant,
    watching: AtomicBool,
}

impl Daemon {
    /// Run a sync, or join the one already in flight.
    ///
    /// The optional `progress` sender is registered with the run's fan-out;
    /// every caller receives the same final outcome.
    pub async fn run_or_join_sync(
        self: Arc<Self>,
        force: bool,
        progress: Option<UnboundedSender<Value>>,
    ) -> Result<SyncData> {
        let (run, is_initiator) = {
            let mut slot = self.sync_slot.lock().unwrap();
            match slot.as_ref() {
                Some(run) if !run.is_done() => (Arc::clone(run), false),
                _ => {
                    let run = SyncRun::new();
                    *slot = Some(Arc::clone(&run));
                    (run, true)
                }
            }
        };

        if let Some(tx) = progress {
            run.subscribe(tx);
        }

        if is_initiator {
            let daemon = Arc::clone(&self);
            let run_handle = Arc::clone(&run);
            tokio::spawn(async move {
                // The sync body runs in its own task so a panic surfaces as
                // a failed outcome instead of wedging every waiter.
                let body = {
                    let daemon = Arc::clone(&daemon);
                    let run = Arc::clone(&run_handle);
                    tokio::spawn(async move { do_sync(daemon, force, run).await })
                };
                let outcome = match body.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(format!("sync task failed: {}", e)),
                };
                daemon.set_idle();
                run_handle.finish(outcome);
            });
        }

        match run.wait().await {
            Ok(data) => Ok(data),
            Err(message) => bail!(message),
        }
    }

    fn set_state(&self, state: DaemonState) {
        self.status.write().unwrap().state = state;
    }

    fn set_idle(&self) {
        let mut status = self.status.write().unwrap();
        status.state = DaemonState::Idle;
        status.sync_progress = None;
        status.embed_progress = None;
    }

    pub async fn literal_search(&self, query: &LiteralQuery) -> Result<LiteralResults> {
        let max_scans = self.config.read().unwrap().search.max_concurrent_scans;
        literal_search(&self.index, query, max_scans, &self.shutdown)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    /// Embed the query text with the live embedder, then run the two-phase
    /// vector search.
    pub async fn semantic_search(
        &self,
        query_text: &str,
        options: &SemanticQuery,
    ) -> Result<Vec<SemanticHit>> {
        let embedder = match self.embedder.read().unwrap().clone() {
            Some(embedder) => embedder,
            None => bail!("embedding is not enabled"),
        };
        let embed_db = match self.embed_db.read().unwrap().clone() {
            Some(db) => db,
            None => bail!("embedding is not enabled"),
        };

        let text = query_text.to_string();
        let worker = Arc::clone(&embedder);
        let output = tokio::task::spawn_blocking(move || worker.embed(&[text])).await??;
        let query_vector = match output.vectors.into_iter().next() {
            Some(vector) => vector,
            None => bail!("embedder returned no vector for the query"),
        };

        semantic_search(
            &self.index,
            &embed_db,
            &query_vector,
            embedder.model_id(),
            options,
        )
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    pub async fn stats(&self) -> Result<StatsData> {
        let index = self.index.stats().await?;
        let (embeddings, embedding_model) = {
            let db = self.embed_db.read().unwrap().clone();
            let model = self
                .embedder
                .read()
                .unwrap()
                .as_ref()
                .map(|e| e.model_id().to_string())
                .unwrap_or_default();
            match db {
                Some(db) => (db.row_count().await?, model),
                None => (0, model),
            }
        };
        Ok(StatsData {
            index,
            embeddings,
            embedding_model,
        })
    }

    pub fn status(&self) -> StatusData {
        let (state, sync_progress, embed_progress) = {
            let status = self.status.read().unwrap();
            (
                status.state,
                status.sync_progress.clone(),
                status.embed_progress.clone(),
            )
        };
        let (model, model_dim) = {
            let embedder = self.embedder.read().unwrap();
            match embedder.as_ref() {
                Some(embedder) => (embedder.model_id().to_string(), embedder.dim()),
                None => (String::new(), 0),
            }
        };
        StatusData {
            state: state.as_str().to_string(),
            sync_progress,
            embed_progress,
            model,
            model_dim,
            uptime_seconds: self.started.elapsed().as_secs(),
            watching: self.watching.load(Ordering::Relaxed),
        }
    }

    /// Reload config from disk and reconcile the embedding attachment.
    ///
    /// Enabling constructs the embedder (downloading the model if needed),
    /// opens the embeddings database when not yet open, and kicks off a
    /// background sync so existing sessions get embedded. Disabling drops
    /// the embedder but keeps the embeddings database open; its data is
    /// preserved.
    pub async fn config_reload(self: Arc<Self>) -> Result<ConfigReloadData> {
        let _guard = self.reload_lock.lock().await;

        let new_config = load_config(&self.config_dir)?;
        let want_enabled = new_config.embedding.enabled;
        let was_enabled = self.embedder.read().unwrap().is_some();

        *self.config.write().unwrap() = new_config.clone();

        if want_enabled && !was_enabled {
            let factory = Arc::clone(&self.embedder_factory);
            let embedding_config = new_config.embedding.clone();
            let model_dir = self.config_dir.join(MODEL_DIR);
            let embedder =
                tokio::task::spawn_blocking(move || factory(&embedding_config, &model_dir))
                    .await??;

            if self.embed_db.read().unwrap().is_none() {
                let db = EmbedDb::open(&self.config_dir.join(EMBEDDINGS_DB_FILE)).await?;
                *self.embed_db.write().unwrap() = Some(db);
            }

            // Attaches to the watcher too: it reads the same slot.
            *self.embedder.write().unwrap() = Some(embedder);
            info!(model = %new_config.embedding.model, "embedding enabled");

            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = daemon.run_or_join_sync(false, None).await {
                    warn!(error = %e, "post-reload sync failed");
                }
            });
        } else if !want_enabled && was_enabled {
            *self.embedder.write().unwrap() = None;
            info!("embedding disabled");
        }

        Ok(ConfigReloadData {
            embedding_enabled: want_enabled,
        })
    }
}

async fn do_sync(daemon: Arc<Daemon>, force: bool, run: Arc<SyncRun>) -> Result<SyncData, String> {
    daemon.set_state(DaemonState::Syncing);
    info!(force, "sync started");

    if force {
        daemon
            .index
            .clear_sync_state()
            .await
            .map_err(|e| e.to_string())?;
    }

    let ingester = build_ingester(&daemon, &run);

    // Project indexing happens store by store, in registration order.
    let mut projects: Vec<Project> = Vec::new();
    for store in daemon.registry.stores() {
        match store.list_projects().await {
            Ok(found) => projects.extend(found),
            Err(e) => {
                warn!(source = store.source(), error = %e, "list_projects failed");
            }
        }
    }

    let total = projects.len();
    for (i, project) in projects.iter().enumerate() {
        if daemon.shutdown.is_cancelled() {
            return Err("sync cancelled".to_string());
        }
        match ingester
            .ingest_project(&daemon.shutdown, project, i + 1, total)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is::<Cancelled>() => return Err("sync cancelled".to_string()),
            Err(e) => {
                warn!(project = %project.display_name, error = %e, "project ingest failed");
            }
        }
    }

    // Embedding pass, skipped entirely without an embedder.
    if daemon.embedder.read().unwrap().is_some() {
        daemon.set_state(DaemonState::Embedding);
        match ingester.embed_all_sessions(&daemon.shutdown).await {
            Ok(_) => {}
            Err(e) if e.is::<Cancelled>() => return Err("sync cancelled".to_string()),
            Err(e) => {
                warn!(error = %e, "embedding pass failed");
            }
        }
    }

    info!(projects = total, "sync complete");
    Ok(SyncData { projects: total })
}

/// Assemble an ingester whose progress callbacks update daemon status and
/// feed the run's fan-out.
fn build_ingester(daemon: &Arc<Daemon>, run: &Arc<SyncRun>) -> Ingester {
    let config = daemon.config.read().unwrap().clone();
    let embed_db = daemon.embed_db.read().unwrap().clone();
    let embedder = daemon.embedder.read().unwrap().clone();

    let mut ingester = Ingester::new(
        &config,
        daemon.index.clone(),
        embed_db,
        embedder,
        Arc::clone(&daemon.registry),
    );

    let status_daemon = Arc::clone(daemon);
    let fanout = Arc::clone(run);
    ingester.set_index_progress(Arc::new(move |p: &IndexProgress| {
        status_daemon.status.write().unwrap().sync_progress = Some(p.clone());
        let mut frame = serde_json::to_value(p).unwrap_or(Value::Null);
        frame["phase"] = json!("indexing");
        fanout.publish(frame);
    }));

    let status_daemon = Arc::clone(daemon);
    let fanout = Arc::clone(run);
    ingester.set_embed_progress(Arc::new(move |p: &EmbedProgress| {
        status_daemon.status.write().unwrap().embed_progress = Some(p.clone());
        let mut frame = serde_json::to_value(p).unwrap_or(Value::Null);
        frame["phase"] = json!("embedding");
        fanout.publish(frame);
    }));

    let fanout = Arc::clone(run);
    ingester.set_embed_chunk_progress(Arc::new(move |p| {
        let mut frame = serde_json::to_value(p).unwrap_or(Value::Null);
        frame["phase"] = json!("embedding_chunks");
        fanout.publish(frame);
    }));

    ingester
}

// ============ Lifecycle ============

pub struct DaemonOptions {
    pub config_dir: PathBuf,
    /// CLI override; the config's `watcher.enabled` must also hold.
    pub watch: bool,
    pub embedder_factory: EmbedderFactory,
    /// Custom stores registered alongside the configured ones.
    pub extra_stores: Vec<Arc<dyn crate::store::Store>>,
}

impl DaemonOptions {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            watch: true,
            embedder_factory: default_embedder_factory(),
            extra_stores: Vec::new(),
        }
    }
}

/// A launched daemon and the resources torn down on shutdown.
pub struct DaemonHandle {
    pub daemon: Arc<Daemon>,
    server: RpcServer,
    watcher: Option<Watcher>,
    socket_path: PathBuf,
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl DaemonHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Ordered teardown: cancel in-flight work, stop the watcher, stop the
    /// server, drop the embedder, close both databases, unregister.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.daemon.shutdown.cancel();

        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        self.server.stop().await;

        *self.daemon.embedder.write().unwrap() = None;
        let embed_db = self.daemon.embed_db.write().unwrap().take();
        if let Some(db) = embed_db {
            db.close().await;
        }
        self.daemon.index.close().await;

        let _ = std::fs::remove_file(self.daemon.config_dir.join(INSTANCE_FILE));
        let _ = std::fs::remove_file(&self.socket_path);
        info!("shutdown complete");
    }
}

/// Start the daemon: open stores, bind the socket, register the instance,
/// start the watcher, and launch the initial sync in the background.
pub async fn launch(options: DaemonOptions) -> Result<DaemonHandle> {
    let config_dir = options.config_dir;
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create config dir {}", config_dir.display()))?;

    let config = load_config(&config_dir)?;
    let socket_path = config_dir.join(SOCKET_FILE);
    refuse_if_running(&config_dir, &socket_path).await?;

    let index = IndexDb::open(&config_dir.join(INDEX_DB_FILE)).await?;

    let (embed_db, embedder) = if config.embedding.enabled {
        let factory = Arc::clone(&options.embedder_factory);
        let embedding_config = config.embedding.clone();
        let model_dir = config_dir.join(MODEL_DIR);
        let embedder =
            tokio::task::spawn_blocking(move || factory(&embedding_config, &model_dir)).await??;
        let db = EmbedDb::open(&config_dir.join(EMBEDDINGS_DB_FILE)).await?;
        (Some(db), Some(embedder))
    } else {
        (None, None)
    };

    let mut registry = StoreRegistry::from_config(&config);
    for store in options.extra_stores {
        registry.register(store);
    }
    let registry = Arc::new(registry);
    if registry.is_empty() {
        warn!("no session stores configured; the index will stay empty");
    }

    // Model migration happens before anything can query embeddings.
    if let (Some(db), Some(embedder)) = (&embed_db, &embedder) {
        let deleted = db.delete_other_models(embedder.model_id()).await?;
        if deleted > 0 {
            info!(deleted, "removed embeddings from a previous model");
        }
    }

    let daemon = Arc::new(Daemon {
        config_dir: config_dir.clone(),
        config: StdRwLock::new(config.clone()),
        index: index.clone(),
        embed_db: Arc::new(StdRwLock::new(embed_db)),
        embedder: Arc::new(StdRwLock::new(embedder)),
        registry: Arc::clone(&registry),
        embedder_factory: options.embedder_factory,
        status: StdRwLock::new(StatusInner::default()),
        sync_slot: StdMutex::new(None),
        reload_lock: TokioMutex::new(()),
        shutdown: CancellationToken::new(),
        started: Instant::now(),
        watching: AtomicBool::new(false),
    });

    let server = RpcServer::start(Arc::clone(&daemon), socket_path.clone()).await?;
    write_instance_file(&config_dir, &socket_path)?;

    let watcher = if options.watch && config.watcher.enabled {
        let watcher = Watcher::start(
            Arc::clone(&registry),
            index,
            Arc::clone(&daemon.embed_db),
            Arc::clone(&daemon.embedder),
            config,
            &daemon.shutdown,
        )
        .await?;
        daemon.watching.store(true, Ordering::Relaxed);
        Some(watcher)
    } else {
        None
    };

    // Initial sync runs in the background; the socket is already serving.
    {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            let sync_daemon = Arc::clone(&daemon);
            if let Err(e) = sync_daemon.run_or_join_sync(false, None).await {
                if !daemon.shutdown.is_cancelled() {
                    warn!(error = %e, "initial sync failed");
                }
            }
        });
    }

    info!(socket = %socket_path.display(), "daemon ready");
    Ok(DaemonHandle {
        daemon,
        server,
        watcher,
        socket_path,
    })
}

/// Refuse to start when a live daemon already owns the socket; clean up
/// stale leftovers otherwise.
async fn refuse_if_running(config_dir: &Path, socket_path: &Path) -> Result<()> {
    let instance_path = config_dir.join(INSTANCE_FILE);
    if instance_path.exists() {
        let pid = std::fs::read_to_string(&instance_path)
            .ok()
            .and_then(|s| serde_json::from_str::<InstanceInfo>(&s).ok())
            .map(|i| i.pid);
        if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
            match pid {
                Some(pid) => bail!(
                    "another recall daemon is already running (pid {}, socket {})",
                    pid,
                    socket_path.display()
                ),
                None => bail!(
                    "another recall daemon is already running (socket {})",
                    socket_path.display()
                ),
            }
        }
        let _ = std::fs::remove_file(&instance_path);
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    Ok(())
}

fn write_instance_file(config_dir: &Path, socket_path: &Path) -> Result<()> {
    let info = InstanceInfo {
        kind: "indexer".to_string(),
        pid: std::process::id(),
        socket_path: socket_path.to_string_lossy().to_string(),
        started_at: chrono::Utc::now().to_rfc3339(),
    };
    let path = config_dir.join(INSTANCE_FILE);
    std::fs::write(&path, serde_json::to_vec_pretty(&info)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
