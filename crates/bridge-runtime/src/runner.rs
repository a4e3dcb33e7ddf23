use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_types::{AgentEvent, RunResult};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedMutexGuard};

/// Executes one agent turn.
///
/// Implementations push every progress event into `events` before returning
/// and must stop promptly when the returned future is dropped.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        resume: Option<&str>,
        events: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunResult>;
}

/// One async lock per session id, so two turns never write to the same
/// session at once.
#[derive(Clone, Default)]
pub struct SessionLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        SessionGuard {
            locks: self.locks.clone(),
            session_id: session_id.to_string(),
            _guard: guard,
        }
    }

    pub fn is_locked(&self, session_id: &str) -> bool {
        self.locks
            .lock()
            .get(session_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SessionGuard {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // map entry + our guard; anything above that is a waiter
        let idle = locks
            .get(&self.session_id)
            .map(|lock| Arc::strong_count(lock) <= 2)
            .unwrap_or(false);
        if idle {
            locks.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_session_is_serialized() {
        let locks = SessionLocks::new();
        let first = locks.acquire("s1").await;
        assert!(locks.is_locked("s1"));

        let waiter_locks = locks.clone();
        let waiter = tokio::spawn(async move {
            let _second = waiter_locks.acquire("s1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_sessions_do_not_block() {
        let locks = SessionLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("b")).await;
        assert!(b.is_ok());
    }
}
