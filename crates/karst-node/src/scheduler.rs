//! The cooperative task runner.
//!
//! Tasks run on the shared runtime; each tick awaits the callable to
//! completion, so the repeat delay is measured from completion rather
//! than start. Failures are logged and never cancel the task. A shutdown
//! signal is consulted between ticks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use karst_core::error::KarstError;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), KarstError>> + Send>>;
pub type TaskCallback = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// A named periodic task.
pub struct ScheduledTask {
    pub name: String,
    pub start_delay: Duration,
    pub repeat_delay: Duration,
    pub callback: TaskCallback,
}

impl ScheduledTask {
    pub fn new(
        name: impl Into<String>,
        start_delay: Duration,
        repeat_delay: Duration,
        callback: TaskCallback,
    ) -> Self {
        Self { name: name.into(), start_delay, repeat_delay, callback }
    }
}

/// Collects tasks before boot.
#[derive(Default)]
pub struct TaskScheduler {
    tasks: Vec<ScheduledTask>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: ScheduledTask) {
        self.tasks.push(task);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Spawn every task and return the handle used to stop them.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = self
            .tasks
            .into_iter()
            .map(|task| tokio::spawn(run_task(task, shutdown_rx.clone())))
            .collect();
        SchedulerHandle { shutdown: shutdown_tx, handles }
    }
}

/// Sleep for `delay` unless shutdown arrives first; returns `true` on
/// shutdown.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.wait_for(|stop| *stop) => true,
    }
}

async fn run_task(task: ScheduledTask, mut shutdown: watch::Receiver<bool>) {
    if sleep_or_shutdown(task.start_delay, &mut shutdown).await {
        return;
    }
    loop {
        if *shutdown.borrow() {
            return;
        }
        debug!(task = %task.name, "tick");
        if let Err(error) = (task.callback)().await {
            warn!(task = %task.name, %error, "task failed; will retry next tick");
        }
        if sleep_or_shutdown(task.repeat_delay, &mut shutdown).await {
            return;
        }
    }
}

/// Stops the scheduler and waits for all tasks to finish their current
/// tick.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
