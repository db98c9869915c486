use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A periodic background task. Implementations must tolerate being run
/// concurrently with readers of the structures they flush.
pub trait PeriodicTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// Execute one iteration of the task
    fn run(&self);
}

/// A runner for periodic background tasks. The index only ever schedules
/// through this trait, so tests can substitute a runner that executes tasks
/// on demand.
pub trait Scheduler: Send + Sync {
    /// Register a task to run after `initial_delay` and then every `period`
    fn schedule(&self, task: Arc<dyn PeriodicTask>, initial_delay: Duration, period: Duration);

    /// Signal all registered tasks to stop after their current iteration
    fn shutdown(&self);
}

/// Scheduler that runs each task on its own tokio timer loop with graceful
/// shutdown via a broadcast channel.
pub struct TokioScheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    fn spawn_timer_loop(
        &self,
        task: Arc<dyn PeriodicTask>,
        initial_delay: Duration,
        period: Duration,
    ) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = shutdown_rx.recv() => {
                    tracing::info!(task = task.name(), "Task shutting down");
                    return;
                }
            }

            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task.run();
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Wait for all task loops to exit. Call after `shutdown`.
    pub async fn join(&self) -> Result<()> {
        let handles: Vec<_> = self.tasks.lock()?.drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Arc<dyn PeriodicTask>, initial_delay: Duration, period: Duration) {
        let handle = self.spawn_timer_loop(task, initial_delay, period);
        self.tasks.lock().unwrap().push(handle);
    }

    fn shutdown(&self) {
        self.shutdown_tx.send(()).ok();
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}
