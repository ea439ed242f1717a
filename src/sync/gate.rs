use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of per-key async locks.
///
/// `acquire(key)` gives run-or-wait semantics: callers with the same key
/// queue behind the in-flight holder, callers with different keys proceed in
/// parallel. Used to serialize sync runs per (user, provider, resource) and
/// token refreshes per (user, provider).
pub struct KeyedGate {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedGate {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting if another holder is in flight.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

impl Default for KeyedGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let gate = Arc::new(KeyedGate::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let g1 = gate.clone();
        let o1 = order.clone();
        let first = tokio::spawn(async move {
            let _guard = g1.acquire("usr_1:google:calendar").await;
            o1.lock().await.push("first-start");
            tokio::time::sleep(Duration::from_millis(50)).await;
            o1.lock().await.push("first-end");
        });

        // Give the first task time to take the lock.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let g2 = gate.clone();
        let o2 = order.clone();
        let second = tokio::spawn(async move {
            let _guard = g2.acquire("usr_1:google:calendar").await;
            o2.lock().await.push("second-start");
        });

        first.await.unwrap();
        second.await.unwrap();

        let order = order.lock().await;
        assert_eq!(
            order.as_slice(),
            &["first-start", "first-end", "second-start"],
            "second run must wait for the in-flight run, not interleave"
        );
    }

    #[tokio::test]
    async fn test_different_keys_proceed_in_parallel() {
        let gate = Arc::new(KeyedGate::new());

        let _held = gate.acquire("usr_1:google:calendar").await;

        // A different user's sync must not block behind usr_1.
        let other = tokio::time::timeout(
            Duration::from_millis(100),
            gate.acquire("usr_2:google:calendar"),
        )
        .await;
        assert!(other.is_ok(), "distinct keys must not contend");
    }
}
