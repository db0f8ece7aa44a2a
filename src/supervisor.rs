//! Task supervision: starts listeners and the shipper, restarts crashed
//! tasks with backoff, and drives graceful shutdown/reload (spec §4.8).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

const INITIAL_RESTART_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);
const STABLE_RUN_RESET: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHealth {
    Starting,
    Healthy,
    Degraded,
}

struct TaskState {
    health: TaskHealth,
    last_error: Option<String>,
    started_at: Instant,
    restart_attempts: Vec<Instant>,
    backoff: Duration,
}

pub struct TaskStatus {
    pub healthy: bool,
    pub last_error: Option<String>,
    pub uptime_sec: Option<u64>,
}

/// A unit of supervised work: an async closure returning when the task
/// exits (cleanly or via an error it could not recover from itself).
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type TaskFactory = Arc<dyn Fn(watch::Receiver<bool>) -> TaskFuture + Send + Sync>;

struct Supervised {
    name: String,
    factory: TaskFactory,
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    tasks: Vec<Supervised>,
    states: Arc<Mutex<HashMap<String, TaskState>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        Self {
            cfg,
            tasks: Vec::new(),
            states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: TaskFactory) {
        self.tasks.push(Supervised { name: name.into(), factory });
    }

    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Spawns every registered task under its own restart-supervised loop.
    /// Returns join handles the caller can await during shutdown.
    pub fn spawn_all(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for task in &self.tasks {
            let name = task.name.clone();
            let factory = task.factory.clone();
            let states = self.states.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            let max_attempts = self.cfg.max_restart_attempts;
            let window = Duration::from_secs(self.cfg.restart_window_sec);

            states.lock().unwrap().insert(
                name.clone(),
                TaskState {
                    health: TaskHealth::Starting,
                    last_error: None,
                    started_at: Instant::now(),
                    restart_attempts: Vec::new(),
                    backoff: INITIAL_RESTART_BACKOFF,
                },
            );

            let handle = tokio::spawn(run_supervised_loop(
                name,
                factory,
                states,
                shutdown_rx,
                max_attempts,
                window,
            ));
            handles.push(handle);
        }
        handles
    }

    pub async fn status(&self) -> HashMap<String, TaskStatus> {
        let states = self.states.lock().unwrap();
        states
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    TaskStatus {
                        healthy: state.health == TaskHealth::Healthy,
                        last_error: state.last_error.clone(),
                        uptime_sec: Some(state.started_at.elapsed().as_secs()),
                    },
                )
            })
            .collect()
    }

    pub async fn any_degraded(&self) -> bool {
        self.states.lock().unwrap().values().any(|s| s.health == TaskHealth::Degraded)
    }

    /// Signals shutdown and waits up to `shutdown_grace_sec` for tasks to
    /// exit before the caller force-cancels via dropping the join handles.
    pub async fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.cfg.shutdown_grace_sec)
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_supervised_loop(
    name: String,
    factory: TaskFactory,
    states: Arc<Mutex<HashMap<String, TaskState>>>,
    shutdown_rx: watch::Receiver<bool>,
    max_attempts: u32,
    window: Duration,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        {
            let mut states = states.lock().unwrap();
            if let Some(state) = states.get_mut(&name) {
                state.health = TaskHealth::Healthy;
                state.started_at = Instant::now();
            }
        }

        let fut = (factory)(shutdown_rx.clone());
        let result = fut.await;

        if *shutdown_rx.borrow() {
            return;
        }

        match result {
            Ok(()) => {
                info!(task = %name, "task exited cleanly");
                return;
            }
            Err(err) => {
                warn!(task = %name, error = %err, "task terminated unexpectedly");
                let mut states = states.lock().unwrap();
                let state = states.get_mut(&name).expect("task state registered");
                state.last_error = Some(err);

                let now = Instant::now();
                state.restart_attempts.retain(|t| now.duration_since(*t) < window);
                state.restart_attempts.push(now);

                if state.restart_attempts.len() as u32 > max_attempts {
                    state.health = TaskHealth::Degraded;
                    error!(task = %name, "max restart attempts exceeded within window, marking degraded");
                    return;
                }

                let backoff = if now.duration_since(state_or_default_start(state)) > STABLE_RUN_RESET {
                    INITIAL_RESTART_BACKOFF
                } else {
                    (state.backoff * 2).min(MAX_RESTART_BACKOFF)
                };
                state.backoff = backoff;
                drop(states);

                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn state_or_default_start(state: &TaskState) -> Instant {
    state.started_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn restarts_failed_task_and_eventually_degrades() {
        let cfg = SupervisorConfig {
            shutdown_grace_sec: 1,
            max_restart_attempts: 2,
            restart_window_sec: 300,
        };
        let mut sup = Supervisor::new(cfg);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        sup.register(
            "flaky",
            Arc::new(move |_rx| {
                let attempts = attempts_clone.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                })
            }),
        );

        let handles = sup.spawn_all();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_secs(5), h).await;
        }

        assert!(attempts.load(Ordering::SeqCst) >= 1);
        assert!(sup.any_degraded().await);
    }
}
