//! Task supervisor: launches named long-running tasks, restarts them with
//! jittered backoff when they exit, and reports per-task liveness for the
//! health endpoints.

use crate::backoff::Backoff;
use crate::now_ms;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Cooperative shutdown signal handed to every supervised task. Tasks must
/// exit within 5 s of it firing.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves once shutdown has been requested.
    pub async fn recv(&mut self) {
        // Already triggered, or wait for the flip.
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskFactory = Arc<dyn Fn(Shutdown) -> TaskFuture + Send + Sync>;

/// Lifecycle state of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    BackingOff,
    Finished,
}

/// Health snapshot of one task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskHealth {
    pub name: String,
    pub state: TaskState,
    pub restarts: u64,
    /// Milliseconds since the last state transition.
    pub since_ms: i64,
}

#[derive(Debug, Clone)]
struct TaskEntry {
    state: TaskState,
    restarts: u64,
    transition_ms: i64,
}

/// Launches tasks from factory closures and keeps them alive until
/// shutdown. A task that returns (Ok or Err) outside of shutdown is
/// restarted after a jittered backoff delay.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    entries: Arc<Mutex<HashMap<String, TaskEntry>>>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            entries: Arc::new(Mutex::new(HashMap::new())),
            handles: Vec::new(),
        }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            rx: self.shutdown_rx.clone(),
        }
    }

    /// Spawn a supervised task. The factory is called for the initial run
    /// and for every restart.
    pub fn spawn(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(Shutdown) -> TaskFuture + Send + Sync + 'static,
    ) {
        let name = name.into();
        let factory: TaskFactory = Arc::new(factory);
        let entries = self.entries.clone();
        let shutdown = self.shutdown_handle();

        entries.lock().expect("supervisor lock").insert(
            name.clone(),
            TaskEntry {
                state: TaskState::Running,
                restarts: 0,
                transition_ms: now_ms(),
            },
        );

        let handle = tokio::spawn(async move {
            let mut backoff = Backoff::standard();
            loop {
                set_state(&entries, &name, TaskState::Running);
                info!(task = %name, "task starting");

                match factory(shutdown.clone()).await {
                    Ok(()) if shutdown.is_shutdown() => {
                        info!(task = %name, "task finished on shutdown");
                        set_state(&entries, &name, TaskState::Finished);
                        return;
                    }
                    Ok(()) => {
                        warn!(task = %name, "task exited unexpectedly, restarting");
                    }
                    Err(err) => {
                        error!(task = %name, error = %err, "task failed, restarting");
                    }
                }

                if shutdown.is_shutdown() {
                    set_state(&entries, &name, TaskState::Finished);
                    return;
                }

                bump_restarts(&entries, &name);
                set_state(&entries, &name, TaskState::BackingOff);
                let delay = backoff.next_delay();
                metrics::counter!("supervisor_task_restarts_total", "task" => name.clone())
                    .increment(1);
                let mut shutdown_wait = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_wait.recv() => {
                        set_state(&entries, &name, TaskState::Finished);
                        return;
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Per-task liveness for `/health`.
    pub fn health(&self) -> Vec<TaskHealth> {
        snapshot_entries(&self.entries)
    }

    /// Cloneable view of task health, for handing to an HTTP server.
    pub fn health_handle(&self) -> HealthHandle {
        HealthHandle {
            entries: self.entries.clone(),
        }
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn shutdown_and_wait(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable, read-only view of supervised task health.
#[derive(Clone)]
pub struct HealthHandle {
    entries: Arc<Mutex<HashMap<String, TaskEntry>>>,
}

impl HealthHandle {
    pub fn snapshot(&self) -> Vec<TaskHealth> {
        snapshot_entries(&self.entries)
    }
}

fn snapshot_entries(entries: &Arc<Mutex<HashMap<String, TaskEntry>>>) -> Vec<TaskHealth> {
    let now = now_ms();
    let entries = entries.lock().expect("supervisor lock");
    let mut out: Vec<TaskHealth> = entries
        .iter()
        .map(|(name, entry)| TaskHealth {
            name: name.clone(),
            state: entry.state,
            restarts: entry.restarts,
            since_ms: now - entry.transition_ms,
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn set_state(entries: &Arc<Mutex<HashMap<String, TaskEntry>>>, name: &str, state: TaskState) {
    if let Some(entry) = entries.lock().expect("supervisor lock").get_mut(name) {
        entry.state = state;
        entry.transition_ms = now_ms();
    }
}

fn bump_restarts(entries: &Arc<Mutex<HashMap<String, TaskEntry>>>, name: &str) {
    if let Some(entry) = entries.lock().expect("supervisor lock").get_mut(name) {
        entry.restarts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_task_runs_until_shutdown() {
        let mut supervisor = Supervisor::new();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = runs.clone();

        supervisor.spawn("ticker", move |mut shutdown| {
            let runs = runs_clone.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                shutdown.recv().await;
                Ok(())
            })
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let health = supervisor.health();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].state, TaskState::Running);
        assert_eq!(health[0].restarts, 0);

        supervisor.shutdown_and_wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_task_restarts() {
        let mut supervisor = Supervisor::new();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = runs.clone();

        supervisor.spawn("flaky", move |_shutdown| {
            let runs = runs_clone.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("boom")
            })
        });

        // Full-jitter backoff from a 1 s base can restart almost
        // immediately; wait long enough to observe at least one retry.
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(runs.load(Ordering::SeqCst) >= 1);
        let health = supervisor.health();
        assert!(health[0].restarts >= 1);

        supervisor.shutdown_and_wait().await;
    }
}
