//! Cancellable background tasks on a tokio runtime.
//!
//! A task is started with [`BackgroundTask::spawn`] and receives a [`StopSignal`]. Stopping is
//! two-phase: [`BackgroundTask::stop`] signals the task and waits for it to exit, so once it
//! returns nothing is left running.
use std::{future::Future, sync::Mutex, time::Duration};

use rand::{thread_rng, Rng};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};

use crate::{Result, StatsigError};

/// Receiving side of a stop command.
pub(crate) struct StopSignal {
    receiver: watch::Receiver<bool>,
}

impl StopSignal {
    /// Resolves once a stop command is sent (or the sender is gone).
    pub(crate) async fn stopped(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`. Returns `true` if a stop command arrived first.
    pub(crate) async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.stopped() => true,
        }
    }

    /// Drive `future` to completion unless a stop command arrives first, in which case the
    /// future is dropped and `None` is returned.
    pub(crate) async fn run<F: Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::select! {
            output = future => Some(output),
            _ = self.stopped() => None,
        }
    }
}

/// A running background task.
pub(crate) struct BackgroundTask {
    name: &'static str,
    stop_sender: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F, Fut>(runtime: &Handle, name: &'static str, task: F) -> BackgroundTask
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_sender, receiver) = watch::channel(false);
        let join_handle = runtime.spawn(task(StopSignal { receiver }));
        log::debug!(target: "statsig", name; "started background task");
        BackgroundTask {
            name,
            stop_sender,
            join_handle,
        }
    }

    /// Signal the task and wait for it to exit.
    pub(crate) async fn stop(self) -> Result<()> {
        // Error means that the task has already exited and dropped the receiver.
        let _ = self.stop_sender.send(true);
        let name = self.name;
        match self.join_handle.await {
            Ok(()) => {
                log::debug!(target: "statsig", name; "background task stopped");
                Ok(())
            }
            Err(err) if err.is_panic() => Err(StatsigError::TaskPanicked),
            Err(_cancelled) => Ok(()),
        }
    }

    /// Cancel the task without waiting. Used around process forks, where there is nothing to
    /// wait on.
    pub(crate) fn abort(self) {
        self.join_handle.abort();
    }
}

/// Slot holding at most one running task.
#[derive(Default)]
pub(crate) struct TaskSlot {
    task: Mutex<Option<BackgroundTask>>,
}

impl TaskSlot {
    pub(crate) fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Store `task`, aborting any task previously held.
    pub(crate) fn set(&self, task: BackgroundTask) {
        if let Some(previous) = self.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop the held task, if any. Idempotent.
    pub(crate) async fn stop(&self) -> Result<()> {
        let task = self.lock().take();
        match task {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }

    pub(crate) fn abort(&self) {
        if let Some(task) = self.lock().take() {
            task.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<BackgroundTask>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Apply randomized `jitter` to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
