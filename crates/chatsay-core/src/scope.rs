//! Scoped ownership of background work.
//!
//! Every observer phase runs inside a [`ResourceScope`]. Tearing the scope
//! down cancels its token and aborts its tasks, which drops whatever
//! mutation observers and timers those tasks own.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub struct ResourceScope {
    name: String,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A scope cancelled together with this one.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: self.token.child_token(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_torn_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `future` until it finishes or the scope is torn down.
    ///
    /// Spawning into a scope that is already torn down does nothing.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            trace!(target: "chatsay::scope", "Scope {} torn down, not spawning", self.name);
            return;
        }
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = future => {}
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    pub fn teardown(&self) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if !tasks.is_empty() {
            trace!(target: "chatsay::scope", "Tearing down {} ({} tasks)", self.name, tasks.len());
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.teardown();
    }
}
