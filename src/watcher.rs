//! Filesystem watcher for incremental re-indexing.
//!
//! Watches every directory that holds session files (discovered through the
//! store registry) and re-ingests a session when its file is written.
//! Writes are debounced per path: events arriving within the debounce
//! window coalesce, and only the trailing one fires the handler.
//!
//! The watcher holds swappable slots for the embedder and embeddings
//! database so a config reload can attach or detach embedding without a
//! restart. Stopping is idempotent and aborts any pending debounce timers.

use anyhow::Result;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embed_db::EmbedDb;
use crate::embedder::Embedder;
use crate::index_db::IndexDb;
use crate::ingest::Ingester;
use crate::models::SESSION_FILE_SUFFIX;
use crate::store::{Store as _, StoreRegistry};

/// Swappable embedding attachment shared with the daemon.
pub type EmbedderSlot = Arc<RwLock<Option<Arc<dyn Embedder>>>>;
pub type EmbedDbSlot = Arc<RwLock<Option<EmbedDb>>>;

pub struct Watcher {
    notifier: Option<RecommendedWatcher>,
    dispatcher: Option<tokio::task::JoinHandle<()>>,
    pending: Arc<Mutex<HashMap<PathBuf, tokio::task::JoinHandle<()>>>>,
    cancel: CancellationToken,
}

struct WatchContext {
    registry: Arc<StoreRegistry>,
    index: IndexDb,
    embed_db: EmbedDbSlot,
    embedder: EmbedderSlot,
    config: Config,
    cancel: CancellationToken,
}

impl Watcher {
    /// Enumerate session directories through the registry, register them
    /// with the notifier, and start the dispatch loop.
    pub async fn start(
        registry: Arc<StoreRegistry>,
        index: IndexDb,
        embed_db: EmbedDbSlot,
        embedder: EmbedderSlot,
        config: Config,
        shutdown: &CancellationToken,
    ) -> Result<Watcher> {
        let debounce = Duration::from_millis(config.watcher.debounce_ms);
        let cancel = shutdown.child_token();

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut notifier =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            return;
                        }
                        for path in event.paths {
                            if !path
                                .to_string_lossy()
                                .ends_with(SESSION_FILE_SUFFIX)
                            {
                                continue;
                            }
                            // Best-effort send; a closed channel means we
                            // are shutting down.
                            let _ = tx.send(path);
                        }
                    }
                    Err(e) => warn!(error = %e, "file watcher error"),
                }
            })?;

        let dirs = session_dirs(&registry).await;
        for dir in &dirs {
            if let Err(e) = notifier.watch(dir, RecursiveMode::NonRecursive) {
                warn!(dir = %dir.display(), error = %e, "failed to watch directory");
            }
        }
        info!(dirs = dirs.len(), "watching session directories");

        let pending: Arc<Mutex<HashMap<PathBuf, tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let context = Arc::new(WatchContext {
            registry,
            index,
            embed_db,
            embedder,
            config,
            cancel: cancel.clone(),
        });

        let dispatcher = tokio::spawn(dispatch_loop(
            rx,
            Arc::clone(&pending),
            context,
            debounce,
            cancel.clone(),
        ));

        Ok(Watcher {
            notifier: Some(notifier),
            dispatcher: Some(dispatcher),
            pending,
            cancel,
        })
    }

    /// Stop watching and drain pending debounce timers. Safe to call twice.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.notifier.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        let timers: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, handle)| handle).collect()
        };
        for timer in timers {
            timer.abort();
        }
    }
}

/// Receive raw events and maintain one trailing-edge timer per path.
async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    pending: Arc<Mutex<HashMap<PathBuf, tokio::task::JoinHandle<()>>>>,
    context: Arc<WatchContext>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => return,
            path = rx.recv() => match path {
                Some(path) => path,
                None => return,
            },
        };

        let mut pending_guard = pending.lock().unwrap();
        if let Some(previous) = pending_guard.remove(&path) {
            previous.abort();
        }

        let timer_path = path.clone();
        let timer_pending = Arc::clone(&pending);
        let timer_context = Arc::clone(&context);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            timer_pending.lock().unwrap().remove(&timer_path);
            if timer_context.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = handle_changed_path(&timer_context, &timer_path).await {
                warn!(path = %timer_path.display(), error = %e, "re-ingest failed");
            }
        });
        pending_guard.insert(path, handle);
    }
}

/// Resolve a changed file back to its `(project, session)` by re-listing
/// the registry, then re-ingest and embed it.
async fn handle_changed_path(context: &WatchContext, path: &Path) -> Result<()> {
    let changed = path.to_string_lossy();

    for store in context.registry.stores() {
        let projects = match store.list_projects().await {
            Ok(projects) => projects,
            Err(e) => {
                warn!(source = store.source(), error = %e, "list_projects failed");
                continue;
            }
        };
        for project in projects {
            let sessions = match store.list_sessions(&project.id).await {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!(project = %project.display_name, error = %e, "list_sessions failed");
                    continue;
                }
            };
            for meta in sessions {
                if meta.full_path != changed {
                    continue;
                }

                debug!(session = %meta.id, "re-ingesting changed session");
                context.index.upsert_project(&project).await?;
                let embed_db = context.embed_db.read().unwrap().clone();
                let embedder = context.embedder.read().unwrap().clone();
                let ingester = Ingester::new(
                    &context.config,
                    context.index.clone(),
                    embed_db,
                    embedder,
                    Arc::clone(&context.registry),
                );
                ingester
                    .ingest_and_embed_session(&context.cancel, &project.scoped_id(), &meta)
                    .await?;
                return Ok(());
            }
        }
    }

    debug!(path = %changed, "changed file matched no known session");
    Ok(())
}

/// Every unique directory that contains at least one session file.
async fn session_dirs(registry: &StoreRegistry) -> Vec<PathBuf> {
    let mut dirs = HashSet::new();
    for store in registry.stores() {
        let projects = match store.list_projects().await {
            Ok(projects) => projects,
            Err(e) => {
                warn!(source = store.source(), error = %e, "list_projects failed");
                continue;
            }
        };
        for project in projects {
            let sessions = match store.list_sessions(&project.id).await {
                Ok(sessions) => sessions,
                Err(_) => continue,
            };
            for meta in sessions {
                if let Some(parent) = Path::new(&meta.full_path).parent() {
                    dirs.insert(parent.to_path_buf());
                }
            }
            // Project directories are watched even when empty so newly
            // created sessions are picked up.
            dirs.insert(PathBuf::from(&project.path));
        }
    }
    dirs.into_iter().collect()
}
