//! Ordered parallel task collection.
//!
//! The agent loop dispatches independent tool calls on a [`Batch`]: tasks
//! run concurrently, but [`Batch::wait`] returns their results in the order
//! the tasks were registered, not the order they completed. Dropping the
//! batch aborts any outstanding tasks.

use std::future::Future;

use tokio::task::JoinSet;

use crate::client::Error;

pub struct Batch<T> {
    set: JoinSet<(usize, Result<T, Error>)>,
    size: usize,
}

impl<T: Send + 'static> Batch<T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            size: 0,
        }
    }

    /// Register a slot and schedule the task.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let index = self.size;
        self.size += 1;
        self.set.spawn(async move { (index, task.await) });
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Block until every scheduled task completes. Returns results in
    /// registration order, or the failure with the lowest registration
    /// index if any task errored.
    pub async fn wait(mut self) -> Result<Vec<T>, Error> {
        let mut slots: Vec<Option<T>> = Vec::with_capacity(self.size);
        slots.resize_with(self.size, || None);
        let mut first_error: Option<(usize, Error)> = None;

        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((index, Ok(value))) => slots[index] = Some(value),
                Ok((index, Err(err))) => {
                    if first_error.as_ref().map_or(true, |(i, _)| index < *i) {
                        first_error = Some((index, err));
                    }
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some((usize::MAX, Error::Provider(format!("batch task failed: {err}"))));
                    }
                }
            }
        }

        if let Some((_, err)) = first_error {
            return Err(err);
        }

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Some(value) => results.push(value),
                None => return Err(Error::Provider("batch task aborted".to_string())),
            }
        }
        Ok(results)
    }
}

impl<T: Send + 'static> Default for Batch<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn results_keep_registration_order() {
        let mut batch = Batch::new();
        for (index, delay_ms) in [50u64, 10, 30, 0].into_iter().enumerate() {
            batch.spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(index)
            });
        }
        assert_eq!(batch.len(), 4);
        let results = batch.wait().await.expect("waits");
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn first_error_wins() {
        let mut batch: Batch<u32> = Batch::new();
        batch.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(Error::Provider("early slot".to_string()))
        });
        batch.spawn(async move { Err(Error::Provider("late slot".to_string())) });

        let err = batch.wait().await.expect_err("fails");
        assert!(err.to_string().contains("early slot"));
    }

    #[tokio::test]
    async fn empty_batch_waits_immediately() {
        let batch: Batch<u32> = Batch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.wait().await.expect("waits"), Vec::<u32>::new());
    }
}
