use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use modmesh_net::NamespaceSync;
use modmesh_proto::now_unix_ms;
use tracing::warn;

use crate::error::NodeError;
use crate::runtime_util::lock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub name: String,
    pub running: bool,
    pub tick_count: u64,
    pub last_tick_unix_ms: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    tick_count: u64,
    last_tick_unix_ms: Option<i64>,
    last_error: Option<String>,
}

/// A background thread that runs one task every `interval` until stopped.
pub struct PeriodicRuntime {
    name: String,
    interval: Duration,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<RuntimeState>>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PeriodicRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicRuntime")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PeriodicRuntime {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(RuntimeState::default())),
            stop_tx: None,
            worker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the worker. The first tick runs after one full interval.
    pub fn start<F>(&mut self, mut tick: F) -> Result<(), NodeError>
    where
        F: FnMut() -> Result<(), String> + Send + 'static,
    {
        if self.interval.is_zero() {
            return Err(NodeError::InvalidConfig {
                reason: format!("{} interval must be positive", self.name),
            });
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyRunning {
                name: self.name.clone(),
            });
        }
        {
            let mut state = lock(&self.state);
            *state = RuntimeState::default();
        }

        let interval = self.interval;
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name(format!("modmesh-{}", self.name))
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let result = tick();
                            let mut current = lock(&state);
                            current.tick_count = current.tick_count.saturating_add(1);
                            current.last_tick_unix_ms = Some(now_unix_ms());
                            current.last_error = result.err();
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                NodeError::ThreadSpawnFailed {
                    reason: err.to_string(),
                }
            })?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), NodeError> {
        if !self.running.load(Ordering::SeqCst) && self.worker.is_none() {
            return Err(NodeError::NotRunning {
                name: self.name.clone(),
            });
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| NodeError::ThreadJoinFailed {
                name: self.name.clone(),
            })?;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        let state = lock(&self.state);
        RuntimeSnapshot {
            name: self.name.clone(),
            running: self.running.load(Ordering::SeqCst),
            tick_count: state.tick_count,
            last_tick_unix_ms: state.last_tick_unix_ms,
            last_error: state.last_error.clone(),
        }
    }
}

impl Drop for PeriodicRuntime {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Runs one sync round right away, then `sync.sync_once()` every configured
/// interval. A failed first round is logged and left to the next tick.
pub fn spawn_namespace_sync(sync: NamespaceSync) -> Result<PeriodicRuntime, NodeError> {
    if let Err(err) = sync.sync_once() {
        warn!(error = %err, "initial namespace sync round failed");
    }
    let mut runtime = PeriodicRuntime::new("namespace-sync", sync.config().interval);
    runtime.start(move || {
        sync.sync_once().map(|_| ()).map_err(|err| {
            warn!(error = %err, "namespace sync round failed");
            err.to_string()
        })
    })?;
    Ok(runtime)
}
