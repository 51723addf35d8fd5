//! Background task queue
//!
//! Deliveries scheduled from request handlers run here so that the
//! handler can answer before any remote server is contacted. Callers
//! that need to observe the effects (the CLI, tests) can join the queue.

use std::future::Future;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a task; finished tasks are reaped on the way
    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                tracing::warn!(error = %e, "Background task panicked");
            }
        }
        tasks.spawn(task);
    }

    /// Wait until every submitted task, including ones spawned meanwhile, has finished
    pub async fn join_all(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.tasks.lock().await);
            if pending.is_empty() {
                return;
            }
            while let Some(finished) = pending.join_next().await {
                if let Err(e) = finished {
                    tracing::warn!(error = %e, "Background task panicked");
                }
            }
        }
    }

    pub async fn pending(&self) -> usize {
        self.tasks.lock().await.len()
    }
}
