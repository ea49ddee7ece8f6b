//! Change-event dispatch for the staging table.
//!
//! Raw [`ChangeRecord`]s are decoded once into [`ChangeEvent`]s and routed:
//!
//! - insert: review the dictionary and store `{score, reason}` on the record
//! - modify: promote when the upload flag was just set, or when the score
//!   changed and reached the threshold
//! - remove: delete the staged blob
//!
//! Handlers for one batch run in a [`WorkerPool`]. A failing handler does
//! not stop its siblings; every failure is tagged with the event kind and
//! identifier and joined into the batch error.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use lexiforge_shared::{
    DictionaryId, LexiforgeError, Result, ResultExt, StagingRecord, TriggerConfig,
};
use lexiforge_storage::{
    ChangeRecord, Condition, EVENT_INSERT, EVENT_MODIFY, EVENT_REMOVE, KeyValueStore, Record,
};

use crate::check::{CheckRequest, Checker};
use crate::cleanup::Cleanup;
use crate::pool::WorkerPool;
use crate::promote::{PromotionOutcome, Promoter};

/// A decoded staging-table change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert { record: StagingRecord },
    Modify { old: StagingRecord, new: StagingRecord },
    /// `id` is `None` when the change carried no key.
    Remove { id: Option<DictionaryId> },
}

impl ChangeEvent {
    /// Decode a raw change. Changes of other tables and unknown event kinds
    /// decode to `None`.
    pub fn decode(change: &ChangeRecord) -> Result<Option<Self>> {
        if change.table != StagingRecord::TABLE {
            return Ok(None);
        }
        let event = match change.event_name.as_str() {
            EVENT_INSERT => Self::Insert {
                record: image(change, change.new_image.as_ref(), "new")?,
            },
            EVENT_MODIFY => Self::Modify {
                old: image(change, change.old_image.as_ref(), "old")?,
                new: image(change, change.new_image.as_ref(), "new")?,
            },
            EVENT_REMOVE => Self::Remove {
                id: change
                    .keys
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::parse::<DictionaryId>)
                    .transpose()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Modify { .. } => "modify",
            Self::Remove { .. } => "remove",
        }
    }

    pub fn id(&self) -> Option<&DictionaryId> {
        match self {
            Self::Insert { record } => Some(&record.id),
            Self::Modify { new, .. } => Some(&new.id),
            Self::Remove { id } => id.as_ref(),
        }
    }
}

fn image(change: &ChangeRecord, value: Option<&serde_json::Value>, which: &str) -> Result<StagingRecord> {
    let value = value.ok_or_else(|| {
        LexiforgeError::parse(format!(
            "{} change {} has no {which} image",
            change.event_name, change.seq
        ))
    })?;
    serde_json::from_value(value.clone()).map_err(|e| {
        LexiforgeError::parse(format!(
            "{} change {} has a malformed {which} image: {e}",
            change.event_name, change.seq
        ))
    })
}

/// Whether a modification qualifies the record for promotion.
pub fn needs_promotion(old: &StagingRecord, new: &StagingRecord, threshold: i64) -> bool {
    let upload_set = !old.upload && new.upload;
    let score_reached = old.score != new.score && new.score.is_some_and(|s| s >= threshold);
    upload_set || score_reached
}

#[derive(Clone)]
pub struct Dispatcher {
    checker: Checker,
    promoter: Promoter,
    cleanup: Cleanup,
    staging: Arc<dyn KeyValueStore<StagingRecord>>,
    config: TriggerConfig,
}

impl Dispatcher {
    pub fn new(
        checker: Checker,
        promoter: Promoter,
        cleanup: Cleanup,
        staging: Arc<dyn KeyValueStore<StagingRecord>>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            checker,
            promoter,
            cleanup,
            staging,
            config,
        }
    }

    /// Handle one batch of changes. Returns the joined error of every
    /// change that failed to decode or whose handler failed.
    #[instrument(skip_all, fields(changes = changes.len()))]
    pub async fn dispatch(&self, cancel: &CancellationToken, changes: &[ChangeRecord]) -> Result<()> {
        let mut errors = Vec::new();
        let mut events = Vec::new();
        for change in changes {
            match ChangeEvent::decode(change) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => debug!(
                    seq = change.seq,
                    table = %change.table,
                    event = %change.event_name,
                    "ignoring change"
                ),
                Err(e) => {
                    warn!(seq = change.seq, error = %e, "undecodable change");
                    errors.push(e);
                }
            }
        }

        let handled = events.len();
        let jobs: Vec<_> = events
            .into_iter()
            .map(|event| {
                let this = self.clone();
                move |cancel: CancellationToken| async move {
                    let label = match event.id() {
                        Some(id) => format!("{} {id}", event.kind()),
                        None => event.kind().to_string(),
                    };
                    this.handle(&cancel, event).await.map_err(|e| {
                        warn!(event = %label, error = %e, "handler failed");
                        e.context(label)
                    })
                }
            })
            .collect();

        let pool = WorkerPool::new(self.config.workers);
        for result in pool.run(cancel, jobs).await {
            if let Err(e) = result {
                errors.push(e);
            }
        }

        info!(handled, failed = errors.len(), "batch dispatched");
        LexiforgeError::join(errors)
    }

    async fn handle(&self, cancel: &CancellationToken, event: ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::Insert { record } => self.review(cancel, &record).await,
            ChangeEvent::Modify { old, new } => {
                if !needs_promotion(&old, &new, self.config.promotion_threshold) {
                    debug!(id = %new.id, score = ?new.score, "no promotion needed");
                    return Ok(());
                }
                match self.promoter.promote(cancel, &new).await? {
                    PromotionOutcome::Promoted => {}
                    PromotionOutcome::AlreadyPublished => {
                        debug!(id = %new.id, "promotion skipped, already published")
                    }
                }
                Ok(())
            }
            ChangeEvent::Remove { id: Some(id) } => self.cleanup.remove(&id).await,
            ChangeEvent::Remove { id: None } => {
                debug!("remove change without key");
                Ok(())
            }
        }
    }

    /// Review a new record and write the result back, only while the
    /// record still exists.
    async fn review(&self, cancel: &CancellationToken, record: &StagingRecord) -> Result<()> {
        let review = self
            .checker
            .review(cancel, &CheckRequest::default(), record)
            .await?;
        let key = record.key();
        let (score, reason) = (review.score, review.reason);
        let result = self
            .staging
            .update(
                &key,
                Box::new(move |r: &mut StagingRecord| {
                    r.score = Some(score);
                    r.reason = Some(reason);
                }),
                Condition::Exists,
            )
            .await;
        match result {
            Ok(_) => {
                info!(id = %record.id, score, "review stored");
                Ok(())
            }
            Err(e) if e.is_condition_failed() => Err(LexiforgeError::not_found(key)),
            Err(e) => Err(e).context("store review"),
        }
    }
}
