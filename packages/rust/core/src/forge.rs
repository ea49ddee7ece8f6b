//! Bounded fan-out over [`Crafter::craft`].
//!
//! The base request is cloned `count` times and each clone runs as its own
//! job in a [`WorkerPool`]. Failures are collected next to the successes;
//! one task failing never stops the others.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use lexiforge_shared::LexiforgeError;

use crate::craft::{CraftRequest, Crafter, Dictionary};
use crate::pool::WorkerPool;

/// Failure of one fan-out task.
#[derive(Debug)]
pub struct TaskError {
    pub index: usize,
    pub error: LexiforgeError,
}

/// Everything a forge run produced.
#[derive(Debug, Default)]
pub struct ForgeOutcome {
    pub dictionaries: Vec<Dictionary>,
    pub errors: Vec<TaskError>,
}

/// Called as each task finishes, from the task itself.
pub type TaskObserver = Arc<dyn Fn(usize, bool) + Send + Sync>;

/// Run `count` generations with at most `concurrency` in flight.
/// `concurrency` is clamped to `[1, count]`.
#[instrument(skip_all, fields(count = count, concurrency = concurrency))]
pub async fn forge(
    crafter: &Crafter,
    cancel: &CancellationToken,
    base: &CraftRequest,
    count: usize,
    concurrency: usize,
    observer: Option<TaskObserver>,
) -> ForgeOutcome {
    if count == 0 {
        return ForgeOutcome::default();
    }
    let pool = WorkerPool::new(concurrency.clamp(1, count));
    info!(count, workers = pool.workers(), "starting forge");

    let jobs: Vec<_> = (0..count)
        .map(|index| {
            let crafter = crafter.clone();
            let request = base.clone();
            let observer = observer.clone();
            move |cancel: CancellationToken| async move {
                let result = crafter.craft(&cancel, &request).await;
                if let Some(observe) = &observer {
                    observe(index, result.is_ok());
                }
                result
            }
        })
        .collect();

    let mut outcome = ForgeOutcome::default();
    for (index, result) in pool.run(cancel, jobs).await.into_iter().enumerate() {
        match result {
            Ok(dictionary) => outcome.dictionaries.push(dictionary),
            Err(error) => {
                warn!(task = index, error = %error, "generation failed");
                outcome.errors.push(TaskError {
                    index,
                    error: error.context(format!("task {index}")),
                });
            }
        }
    }

    info!(
        generated = outcome.dictionaries.len(),
        failed = outcome.errors.len(),
        "forge finished"
    );
    outcome
}
