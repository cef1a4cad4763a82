//! Slug suppression.
//!
//! Any lifecycle operation that writes inside a skill's deployed
//! directory brackets those writes with `suppress` / `unsuppress` so the
//! watcher never mistakes the core's own writes for tampering. Release is
//! deferred by twice the debounce window to drain in-flight notifications.
//! Generations make an interleaved suppress-release-suppress safe: a
//! deferred release only removes the entry it was scheduled for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Clone)]
pub struct Suppressor {
    inner: Arc<SuppressorInner>,
}

struct SuppressorInner {
    debounce: Duration,
    slugs: Mutex<HashMap<String, u64>>,
    next_generation: Mutex<u64>,
}

impl Suppressor {
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(SuppressorInner {
                debounce,
                slugs: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Mute the watcher for `slug` until a matching `unsuppress` drains.
    pub fn suppress(&self, slug: &str) {
        let generation = self.bump_generation();
        self.inner
            .slugs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slug.to_string(), generation);
    }

    /// Schedule release after `2 × debounce`. A newer `suppress` for the
    /// same slug wins over the pending release.
    pub fn unsuppress(&self, slug: &str) {
        let generation = {
            let slugs = self
                .inner
                .slugs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slugs.get(slug) {
                Some(generation) => *generation,
                None => return,
            }
        };

        let inner = Arc::clone(&self.inner);
        let slug = slug.to_string();
        let delay = self.inner.debounce * 2;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut slugs = inner.slugs.lock().unwrap_or_else(PoisonError::into_inner);
            if slugs.get(&slug) == Some(&generation) {
                slugs.remove(&slug);
            }
        });
    }

    pub fn is_suppressed(&self, slug: &str) -> bool {
        self.inner
            .slugs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(slug)
    }

    /// Drop all suppressions immediately (watcher stop).
    pub fn clear(&self) {
        self.inner
            .slugs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn bump_generation(&self) -> u64 {
        let mut next = self
            .inner
            .next_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        *next
    }
}
