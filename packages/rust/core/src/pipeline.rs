//! End-to-end pipelines: `forge_and_stage` (generate → blob → staging record)
//! and `drain_changes` (change feed → dispatcher → acknowledge).

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use lexiforge_shared::{
    LexiforgeError, Result, ResultExt, StagingRecord, WORD_LIST_CONTENT_TYPE, encode_word_list,
};
use lexiforge_storage::{BlobStore, ChangeFeed, Condition, KeyValueStore, Record};

use crate::craft::{CraftRequest, Crafter, Dictionary};
use crate::forge::{TaskError, TaskObserver, forge};
use crate::trigger::Dispatcher;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a generation task finishes.
    fn generated(&self, task: usize, ok: bool);
    /// Called when a dictionary has been staged.
    fn staged(&self, record: &StagingRecord);
    /// Called after each change batch.
    fn batch(&self, changes: usize, ok: bool);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn generated(&self, _task: usize, _ok: bool) {}
    fn staged(&self, _record: &StagingRecord) {}
    fn batch(&self, _changes: usize, _ok: bool) {}
}

/// Where generated dictionaries are staged.
#[derive(Clone)]
pub struct StagingTarget {
    pub records: Arc<dyn KeyValueStore<StagingRecord>>,
    pub blobs: Arc<dyn BlobStore>,
    pub namespace: String,
}

/// Result of [`forge_and_stage`].
#[derive(Debug, Default)]
pub struct StageReport {
    pub staged: Vec<StagingRecord>,
    /// Generation failures, by task index.
    pub generation_errors: Vec<TaskError>,
    /// Persistence failures, tagged with the dictionary id.
    pub stage_errors: Vec<LexiforgeError>,
    pub elapsed: std::time::Duration,
}

impl StageReport {
    pub fn failed(&self) -> usize {
        self.generation_errors.len() + self.stage_errors.len()
    }
}

/// Generate `count` dictionaries and stage every success: the word list
/// blob first, then the staging record (insert only).
#[instrument(skip_all, fields(count = count, concurrency = concurrency))]
pub async fn forge_and_stage(
    crafter: &Crafter,
    target: &StagingTarget,
    cancel: &CancellationToken,
    base: &CraftRequest,
    count: usize,
    concurrency: usize,
    progress: Arc<dyn ProgressReporter>,
) -> StageReport {
    let start = Instant::now();

    progress.phase("Generating dictionaries");
    let reporter = progress.clone();
    let observer: TaskObserver = Arc::new(move |task, ok| reporter.generated(task, ok));
    let outcome = forge(crafter, cancel, base, count, concurrency, Some(observer)).await;

    progress.phase("Staging dictionaries");
    let mut report = StageReport {
        generation_errors: outcome.errors,
        ..Default::default()
    };
    for dictionary in &outcome.dictionaries {
        match stage(target, dictionary).await {
            Ok(record) => {
                progress.staged(&record);
                report.staged.push(record);
            }
            Err(e) => {
                warn!(id = %dictionary.id, error = %e, "staging failed");
                report.stage_errors.push(e);
            }
        }
    }

    report.elapsed = start.elapsed();
    info!(
        staged = report.staged.len(),
        failed = report.failed(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "forge and stage finished"
    );
    report
}

async fn stage(target: &StagingTarget, dictionary: &Dictionary) -> Result<StagingRecord> {
    let record = dictionary.staging_record();
    let label = format!("stage {}", record.id);

    // An explicit name can collide with an existing dictionary; keep its blob.
    if target.records.get(&record.key()).await.context(label.as_str())?.is_some() {
        return Err(LexiforgeError::condition_failed(record.key()).context(label));
    }

    let data = encode_word_list(&dictionary.words)?;
    target
        .blobs
        .put(
            &target.namespace,
            &record.blob_key(),
            Bytes::from(data),
            WORD_LIST_CONTENT_TYPE,
        )
        .await
        .context(label.as_str())?;
    target
        .records
        .put(&record, Condition::NotExists)
        .await
        .context(label.as_str())?;
    Ok(record)
}

/// Result of [`drain_changes`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainReport {
    pub batches: usize,
    pub changes: usize,
}

/// Feed change batches to `dispatcher` until the feed is empty or
/// `max_batches` batches were handled. A batch is acknowledged only when
/// every change in it was handled; the first failed batch stops the drain
/// and is delivered again on the next run.
#[instrument(skip_all, fields(batch_size = batch_size))]
pub async fn drain_changes(
    feed: &dyn ChangeFeed,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
    batch_size: usize,
    max_batches: Option<usize>,
    progress: &dyn ProgressReporter,
) -> Result<DrainReport> {
    let mut report = DrainReport::default();
    progress.phase("Draining change feed");

    loop {
        if max_batches.is_some_and(|max| report.batches >= max) {
            break;
        }
        if cancel.is_cancelled() {
            return Err(LexiforgeError::Cancelled);
        }
        let batch = feed.read_batch(batch_size.max(1)).await?;
        let Some(last) = batch.last().map(|c| c.seq) else {
            break;
        };

        let result = dispatcher.dispatch(cancel, &batch).await;
        progress.batch(batch.len(), result.is_ok());
        result.with_context(|| format!("change batch ending at {last}"))?;

        feed.ack(last).await?;
        report.batches += 1;
        report.changes += batch.len();
    }

    info!(batches = report.batches, changes = report.changes, "change feed drained");
    Ok(report)
}
