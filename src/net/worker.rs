//! Background tasks with an explicit lifecycle, a stop signal and a bounded
//! join.

use crate::lock;
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        use WorkerState::*;
        match value {
            0 => Created,
            1 => Running,
            2 => Stopping,
            _ => Stopped,
        }
    }
}

/// Handed to the task body; resolves once the owner asked the task to stop.
pub(crate) struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub(crate) async fn stopped(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

pub(crate) struct Worker {
    name: String,
    state: Arc<AtomicU8>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            name: name.into(),
            state: Arc::new(AtomicU8::new(WorkerState::Created as u8)),
            stop,
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Spawns `body` on the current tokio runtime. A worker runs at most once.
    pub(crate) fn start<F, Fut>(&self, body: F)
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.transition(WorkerState::Created, WorkerState::Running).is_err() {
            warn!(worker = %self.name, state = ?self.state(), "worker already started");
            return;
        }
        let task = body(StopSignal(self.stop.subscribe()));
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            task.await;
            state.store(WorkerState::Stopped as u8, Ordering::Release);
        });
        *lock(&self.handle) = Some(handle);
    }

    /// Asks the task to stop without waiting for it.
    pub(crate) fn stop(&self) {
        if self.transition(WorkerState::Created, WorkerState::Stopped).is_err() {
            let _ = self.transition(WorkerState::Running, WorkerState::Stopping);
        }
        self.stop.send_replace(true);
    }

    /// Stops the task and waits up to `timeout` for it to finish. A task still
    /// alive after that is logged and aborted; returns whether it ended on
    /// its own. Must not be called from the task itself.
    pub(crate) async fn join(&self, timeout: Duration) -> bool {
        self.stop();
        let handle = lock(&self.handle).take();
        let Some(mut handle) = handle else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(worker = %self.name, "worker task failed: {e}");
                self.state.store(WorkerState::Stopped as u8, Ordering::Release);
                true
            }
            Err(_) => {
                error!(worker = %self.name, ?timeout, "cannot shut down worker");
                handle.abort();
                self.state.store(WorkerState::Stopped as u8, Ordering::Release);
                false
            }
        }
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<(), WorkerState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(WorkerState::from_u8)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
