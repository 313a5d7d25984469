use async_trait::async_trait;
use linch_core::{ErrorRecord, EventBus, ExtensionId, LinchError, Result};
use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Performs one reload. Implemented by the extension manager.
#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self, extension: &ExtensionId) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReloadEvent {
    Scheduled {
        extension_id: ExtensionId,
    },
    Started {
        extension_id: ExtensionId,
    },
    Completed {
        extension_id: ExtensionId,
        duration_ms: u64,
    },
    Failed {
        extension_id: ExtensionId,
        error: ErrorRecord,
    },
}

/// FIFO of extension ids waiting for the worker. An id is queued at most
/// once until the worker picks it up.
#[derive(Clone)]
struct ReloadQueue {
    tx: mpsc::UnboundedSender<ExtensionId>,
    pending: Arc<Mutex<HashSet<ExtensionId>>>,
    events: EventBus<ReloadEvent>,
}

impl ReloadQueue {
    fn enqueue(&self, id: ExtensionId) {
        if !self.pending.lock().insert(id.clone()) {
            debug!(extension = %id, "reload already queued");
            return;
        }
        if self.tx.send(id.clone()).is_err() {
            self.pending.lock().remove(&id);
            return;
        }
        self.events.publish(ReloadEvent::Scheduled { extension_id: id });
    }
}

struct DebounceTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// Per-extension debounce timers feeding the queue. Cloned into watcher
/// callbacks, which run on notify's own thread.
#[derive(Clone)]
struct Debouncer {
    delay: Duration,
    queue: ReloadQueue,
    timers: Arc<Mutex<HashMap<ExtensionId, DebounceTimer>>>,
    generation: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: Handle,
}

impl Debouncer {
    /// Arm (or re-arm) the timer for `id`.
    fn schedule(&self, id: ExtensionId) {
        if self.cancel.is_cancelled() {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let queue = self.queue.clone();
        let timers = Arc::clone(&self.timers);
        let cancel = self.cancel.clone();
        let delay = self.delay;
        let timer_id = id.clone();
        let task = self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut timers = timers.lock();
                        if timers.get(&timer_id).is_some_and(|t| t.generation == generation) {
                            timers.remove(&timer_id);
                        }
                    }
                    queue.enqueue(timer_id);
                }
            }
        });

        if let Some(previous) = self
            .timers
            .lock()
            .insert(id.clone(), DebounceTimer { generation, task })
        {
            previous.task.abort();
            debug!(extension = %id, "debounce timer restarted");
        }
    }

    fn cancel_all(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.task.abort();
        }
    }
}

/// Turns file-system changes into serialized reloads.
///
/// Each change restarts a per-extension debounce timer. When the timer
/// fires the id joins a FIFO queue drained by a single worker, so at most
/// one reload runs at any time and requests arriving meanwhile wait their
/// turn.
pub struct HotReloadCoordinator {
    debouncer: Debouncer,
    watchers: Mutex<HashMap<ExtensionId, notify::RecommendedWatcher>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl HotReloadCoordinator {
    /// Create the coordinator and spawn its worker on the current runtime.
    pub fn new(reloader: Arc<dyn Reloader>, debounce: Duration) -> Result<Arc<Self>> {
        let handle = Handle::try_current()
            .map_err(|e| LinchError::Config(format!("hot reload needs a tokio runtime: {}", e)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = ReloadQueue {
            tx,
            pending: Arc::new(Mutex::new(HashSet::new())),
            events: EventBus::new(256),
        };
        let cancel = CancellationToken::new();

        let worker = handle.spawn(run_worker(
            rx,
            reloader,
            Arc::clone(&queue.pending),
            queue.events.clone(),
            cancel.clone(),
        ));

        info!(debounce_ms = debounce.as_millis() as u64, "hot reload coordinator started");
        Ok(Arc::new(Self {
            debouncer: Debouncer {
                delay: debounce,
                queue,
                timers: Arc::new(Mutex::new(HashMap::new())),
                generation: Arc::new(AtomicU64::new(0)),
                cancel: cancel.clone(),
                handle,
            },
            watchers: Mutex::new(HashMap::new()),
            worker: Mutex::new(Some(worker)),
            cancel,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.debouncer.queue.events.subscribe()
    }

    /// Schedule a reload after the debounce delay. A newer request for the
    /// same extension replaces the pending timer.
    pub fn request_reload(&self, id: ExtensionId) {
        self.debouncer.schedule(id);
    }

    /// Watch `dir` and request a reload of `id` on every change inside it.
    pub fn watch(&self, dir: &Path, id: ExtensionId) -> Result<()> {
        let debouncer = self.debouncer.clone();
        let target = id.clone();
        let watched: PathBuf = dir.to_path_buf();

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {
                        debug!(extension = %target, paths = ?event.paths, "extension files changed");
                        debouncer.schedule(target.clone());
                    }
                    _ => {}
                },
                Err(e) => {
                    warn!(error = %e, "extension watcher error");
                }
            },
        )
        .map_err(|e| LinchError::Config(format!("failed to create file watcher: {}", e)))?;

        watcher
            .watch(&watched, RecursiveMode::Recursive)
            .map_err(|e| {
                LinchError::Config(format!("failed to watch {}: {}", watched.display(), e))
            })?;

        info!(extension = %id, path = %watched.display(), "watching extension directory");
        self.watchers.lock().insert(id, watcher);
        Ok(())
    }

    pub fn unwatch(&self, id: &ExtensionId) -> bool {
        self.watchers.lock().remove(id).is_some()
    }

    pub fn watched(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<_> = self.watchers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids waiting for the worker.
    pub fn pending(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<_> = self.debouncer.queue.pending.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop watchers, cancel timers and wait for the worker to exit. A
    /// reload already running is allowed to finish.
    pub async fn shutdown(&self) {
        self.watchers.lock().clear();
        self.cancel.cancel();
        self.debouncer.cancel_all();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "reload worker ended abnormally");
        }
        debug!("hot reload coordinator stopped");
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<ExtensionId>,
    reloader: Arc<dyn Reloader>,
    pending: Arc<Mutex<HashSet<ExtensionId>>>,
    events: EventBus<ReloadEvent>,
    cancel: CancellationToken,
) {
    loop {
        let id = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };
        pending.lock().remove(&id);

        info!(extension = %id, "reloading extension");
        events.publish(ReloadEvent::Started {
            extension_id: id.clone(),
        });
        let started = Instant::now();
        match reloader.reload(&id).await {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(extension = %id, duration_ms, "extension reloaded");
                events.publish(ReloadEvent::Completed {
                    extension_id: id,
                    duration_ms,
                });
            }
            Err(e) => {
                warn!(extension = %id, error = %e, "extension reload failed");
                events.publish(ReloadEvent::Failed {
                    extension_id: id,
                    error: e.to_record(),
                });
            }
        }
    }
}
