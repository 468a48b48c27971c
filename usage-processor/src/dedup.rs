use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local guard against re-ingesting the same `request_id` twice
/// within a rolling window. This is a best-effort narrowing of the
/// `ON CONFLICT (request_id) DO NOTHING` at the database, which remains the
/// authoritative dedup boundary — this map only saves a round trip for
/// duplicates the producer re-emits in quick succession (e.g. after a
/// retry following a timed-out-but-actually-delivered publish).
#[derive(Clone)]
pub struct DedupGuard {
    seen: Arc<RwLock<HashMap<Uuid, Instant>>>,
    window: Duration,
}

impl DedupGuard {
    pub fn new(window: Duration) -> Self {
        Self { seen: Arc::new(RwLock::new(HashMap::new())), window }
    }

    /// Returns `true` if `request_id` was already seen within the window,
    /// recording it as seen either way.
    pub async fn check_and_record(&self, request_id: Uuid) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.write().await;
        if let Some(first_seen) = seen.get(&request_id) {
            if now.duration_since(*first_seen) < self.window {
                return true;
            }
        }
        seen.insert(request_id, now);
        false
    }

    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let window = self.window;
        let mut seen = self.seen.write().await;
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < window);
    }

    pub fn spawn_sweeper(self) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.window / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_sighting_within_window_is_flagged_duplicate() {
        let guard = DedupGuard::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        assert!(!guard.check_and_record(id).await);
        assert!(guard.check_and_record(id).await);
    }

    #[tokio::test]
    async fn sweep_evicts_entries_older_than_the_window() {
        let guard = DedupGuard::new(Duration::from_millis(20));
        let id = Uuid::new_v4();
        guard.check_and_record(id).await;
        assert_eq!(guard.len().await, 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        guard.sweep().await;
        assert_eq!(guard.len().await, 0);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_collide() {
        let guard = DedupGuard::new(Duration::from_secs(60));
        assert!(!guard.check_and_record(Uuid::new_v4()).await);
        assert!(!guard.check_and_record(Uuid::new_v4()).await);
    }
}
