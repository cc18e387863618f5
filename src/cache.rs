//! First-success memoization for model listings.

use std::future::Future;

use tokio::sync::RwLock;

use crate::client::Error;
use crate::model::Model;

/// Caches a provider's model list after the first successful fetch.
/// Failures are not cached, so the next call retries.
#[derive(Debug, Default)]
pub struct ModelCache {
    models: RwLock<Option<Vec<Model>>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_list<F, Fut>(&self, list: F) -> Result<Vec<Model>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Model>, Error>>,
    {
        if let Some(models) = self.models.read().await.as_ref() {
            return Ok(models.clone());
        }

        // The lock is not held across the fetch; a concurrent caller may
        // also fetch, and whichever finishes first populates the cache.
        let models = list().await?;

        let mut slot = self.models.write().await;
        if slot.is_none() {
            *slot = Some(models.clone());
        }
        Ok(models)
    }
}
