use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Serializes turns within a session; different sessions proceed independently.
#[derive(Clone, Default)]
pub struct SessionLocks {
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other turn of `session_id` is running. The guard releases on drop.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops entries nobody holds or waits on. Returns how many remain.
    pub async fn prune(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, lock| Arc::strong_count(lock) > 1);
        sessions.len()
    }

    pub async fn forget(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_session_turns_are_serialized() {
        let locks = SessionLocks::new();
        let guard = locks.acquire("s1").await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _guard = contender.acquire("s1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        let _other = tokio::time::timeout(Duration::from_millis(100), locks.acquire("s2"))
            .await
            .expect("other sessions are not blocked");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("released")
            .expect("join");
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = SessionLocks::new();
        let held = locks.acquire("held").await;
        drop(locks.acquire("idle").await);
        assert_eq!(locks.prune().await, 1);
        drop(held);
        assert_eq!(locks.prune().await, 0);
        assert_ne!(new_session_id(), new_session_id());
    }
}
