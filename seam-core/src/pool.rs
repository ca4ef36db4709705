//! Bounded-concurrency executor for independent per-sub-repository work.
//! Results come back in submission order; the first failure wins and
//! abandons everything not yet scheduled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::{Error, Result};

static DEFAULT_LIMIT: Lazy<usize> = Lazy::new(|| {
    std::env::var("SEAM_JOBS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(20)
});

pub struct Pool {
    limit: usize,
}

impl Default for Pool {
    fn default() -> Self {
        Pool {
            limit: *DEFAULT_LIMIT,
        }
    }
}

impl Pool {
    pub fn new(limit: usize) -> Self {
        Pool { limit: limit.max(1) }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `worker` over `items` with at most `limit` tasks in flight.
    /// Workers execute on blocking threads (the storage engine is
    /// synchronous). On the first observed failure no further items are
    /// scheduled, in-flight siblings run to completion with their results
    /// discarded, and that failure is returned.
    pub async fn run<T, R, F>(&self, items: Vec<T>, worker: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> Result<R> + Send + Sync + 'static,
    {
        self.run_labeled(items, None, worker).await
    }

    /// Like [`Pool::run`], but failures are logged with the offending item's
    /// label before surfacing.
    pub async fn run_labeled<T, R, F>(
        &self,
        items: Vec<T>,
        labels: Option<Vec<String>>,
        worker: F,
    ) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> Result<R> + Send + Sync + 'static,
    {
        let total = items.len();
        if let Some(labels) = &labels
            && labels.len() != total
        {
            return Err(Error::internal("pool label list length mismatch"));
        }

        let worker = Arc::new(worker);
        let labels = Arc::new(labels);
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let failed = Arc::new(AtomicBool::new(false));
        // Written only on task completion, keyed by task index.
        let results: Arc<Mutex<Vec<Option<R>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let mut join = JoinSet::new();
        for (idx, item) in items.into_iter().enumerate() {
            if failed.load(Ordering::SeqCst) {
                debug!(idx, "abandoning unscheduled pool work after failure");
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::internal("pool semaphore closed"))?;
            if failed.load(Ordering::SeqCst) {
                debug!(idx, "abandoning unscheduled pool work after failure");
                break;
            }
            let worker = Arc::clone(&worker);
            let labels = Arc::clone(&labels);
            let failed = Arc::clone(&failed);
            let results = Arc::clone(&results);
            let first_error = Arc::clone(&first_error);

            join.spawn(async move {
                let outcome = tokio::task::spawn_blocking(move || worker(idx, item)).await;
                match outcome {
                    Ok(Ok(value)) => {
                        results.lock()[idx] = Some(value);
                    }
                    Ok(Err(err)) => {
                        if let Some(labels) = labels.as_ref() {
                            error!("{}: {err}", labels[idx]);
                        }
                        if !failed.swap(true, Ordering::SeqCst) {
                            *first_error.lock() = Some(err);
                        } else {
                            debug!(idx, "discarding error after first failure: {err}");
                        }
                    }
                    Err(join_err) => {
                        if !failed.swap(true, Ordering::SeqCst) {
                            *first_error.lock() =
                                Some(Error::internal(format!("pool task panicked: {join_err}")));
                        }
                    }
                }
                // released after the failure flag settles so the scheduler
                // never hands a freed slot to doomed work
                drop(permit);
            });
        }
        while join.join_next().await.is_some() {}

        if let Some(err) = first_error.lock().take() {
            return Err(err);
        }
        let collected = std::mem::take(&mut *results.lock());
        let mut out = Vec::with_capacity(total);
        for (idx, slot) in collected.into_iter().enumerate() {
            match slot {
                Some(value) => out.push(value),
                None => {
                    return Err(Error::internal(format!(
                        "pool produced no result for task {idx}"
                    )));
                }
            }
        }
        Ok(out)
    }
}
