//! Request deduplication for cache fill.
//!
//! A [`Group`] collapses concurrent calls for the same key into a single
//! execution: the first caller runs the work, everyone else awaits the
//! winner's result. The slot is vacated once the work finishes, so a
//! failed fill is retried by the next caller rather than cached.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::error::{FacadeError, Result};

type Slot<V> = watch::Receiver<Option<std::result::Result<V, FacadeError>>>;

/// Deduplicates concurrent async work by key.
pub struct Group<K, V> {
    inflight: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` for `key`, or awaits an in-flight run for the same key.
    ///
    /// The winner's future is driven on a separate task so that a caller
    /// disconnecting mid-flight does not strand the waiters; every caller
    /// (winner included) receives the result through the shared channel.
    ///
    /// # Errors
    ///
    /// Returns the winner's error. All waiters observe the same error and
    /// the slot is released, so nothing is negatively cached.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: K, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(&key) {
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.clone(), rx.clone());

                let group = Arc::clone(self);
                let fut = work();
                tokio::spawn(async move {
                    let result = fut.await;
                    group.inflight.lock().await.remove(&key);
                    let _ = tx.send(Some(result));
                });
                rx
            }
        };

        loop {
            if let Some(result) = rx.borrow().as_ref() {
                return result.clone();
            }
            rx.changed()
                .await
                .map_err(|_| FacadeError::Internal("singleflight leader vanished".to_string()))?;
        }
    }
}
