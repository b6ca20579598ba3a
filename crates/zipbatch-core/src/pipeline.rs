//! Sequential batch pipeline.
//!
//! Items run one at a time in discovery order through a caller-supplied
//! [`ItemAction`]. Each item is filed into exactly one outcome bucket; a failing
//! action lands the item in `O::failed()` instead of aborting the run. The whole
//! run sits under one deadline and nothing is reported if it expires.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::timeout;

use crate::{
    discovery::{Item, Metadata},
    errors::Error,
    outcome::{Outcome, Tally},
    pacing::{NoPacing, PaceSignal, Pacer},
    progress::{ProgressSink, ProgressUpdate},
    Result,
};

/// Max chars kept from a per-item error message.
pub const ITEM_ERROR_MAX_CHARS: usize = 60;

/// Failure of a single item's action. Never escapes the pipeline.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ItemError(pub String);

impl ItemError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<Error> for ItemError {
    fn from(e: Error) -> Self {
        Self(e.to_string())
    }
}

impl From<std::io::Error> for ItemError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// What an action decided about one item.
#[derive(Clone, Debug)]
pub struct ActionOutput<O> {
    pub outcome: O,
    pub message: String,
    /// Replacement sidecar contents written into the bucket, if any.
    pub metadata: Option<Metadata>,
    pub signal: PaceSignal,
}

impl<O> ActionOutput<O> {
    pub fn new(outcome: O) -> Self {
        Self {
            outcome,
            message: String::new(),
            metadata: None,
            signal: PaceSignal::Normal,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_signal(mut self, signal: PaceSignal) -> Self {
        self.signal = signal;
        self
    }
}

/// Per-item capability plugged into the pipeline.
#[async_trait]
pub trait ItemAction<O: Outcome>: Send + Sync {
    async fn process(&self, item: &Item) -> std::result::Result<ActionOutput<O>, ItemError>;
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Emit progress every N items (and always on the last one).
    pub progress_every: usize,
    /// Wall-clock budget for the whole run.
    pub deadline: Duration,
    /// Extension for sidecars written from action metadata.
    pub sidecar_ext: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            progress_every: 5,
            deadline: Duration::from_secs(120),
            sidecar_ext: "json".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemRecord<O> {
    pub name: String,
    pub outcome: O,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct RunReport<O: Outcome> {
    pub tally: Tally<O>,
    pub records: Vec<ItemRecord<O>>,
    pub buckets: Vec<(O, PathBuf)>,
}

impl<O: Outcome> RunReport<O> {
    pub fn bucket_dir(&self, outcome: O) -> Option<&Path> {
        self.buckets
            .iter()
            .find(|(o, _)| *o == outcome)
            .map(|(_, p)| p.as_path())
    }
}

pub struct Pipeline {
    cfg: PipelineConfig,
    pacer: Arc<dyn Pacer>,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig, pacer: Arc<dyn Pacer>) -> Self {
        Self { cfg, pacer }
    }

    /// Pipeline without inter-item delay (local-only actions, tests).
    pub fn unpaced(cfg: PipelineConfig) -> Self {
        Self::new(cfg, Arc::new(NoPacing))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Run every item through `action`, filing results under `bucket_root/<tag>/`.
    ///
    /// Returns `Error::RunTimeout` if the deadline expires; bucket directories
    /// created so far are removed in that case.
    pub async fn run<O, A>(
        &self,
        items: &[Item],
        action: &A,
        bucket_root: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<RunReport<O>>
    where
        O: Outcome,
        A: ItemAction<O> + ?Sized,
    {
        let deadline = self.cfg.deadline;
        match timeout(deadline, self.run_items(items, action, bucket_root, progress)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(
                    deadline_secs = deadline.as_secs(),
                    total = items.len(),
                    "batch run timed out; discarding partial buckets"
                );
                for o in O::all() {
                    let _ = tokio::fs::remove_dir_all(bucket_root.join(o.tag())).await;
                }
                Err(Error::RunTimeout(deadline))
            }
        }
    }

    async fn run_items<O, A>(
        &self,
        items: &[Item],
        action: &A,
        bucket_root: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<RunReport<O>>
    where
        O: Outcome,
        A: ItemAction<O> + ?Sized,
    {
        let mut buckets = Vec::with_capacity(O::all().len());
        for o in O::all() {
            let dir = bucket_root.join(o.tag());
            tokio::fs::create_dir_all(&dir).await?;
            buckets.push((*o, dir));
        }

        let total = items.len();
        let every = self.cfg.progress_every.max(1);
        let mut tally = Tally::new();
        let mut records = Vec::with_capacity(total);

        for (idx, item) in items.iter().enumerate() {
            let name = item.name();
            let (outcome, message, metadata, signal) = match action.process(item).await {
                Ok(out) => (out.outcome, out.message, out.metadata, out.signal),
                Err(e) => {
                    let message = truncate_chars(&e.0, ITEM_ERROR_MAX_CHARS);
                    tracing::debug!(item = %name, error = %e, "item action failed");
                    (O::failed(), message, None, PaceSignal::Normal)
                }
            };
            tracing::debug!(item = %name, outcome = outcome.tag(), "item processed");

            let dir = match buckets.iter().find(|(o, _)| *o == outcome) {
                Some((_, d)) => d.clone(),
                None => {
                    // Outcome missing from `O::all()`; file it anyway so packaging finds it.
                    let d = bucket_root.join(outcome.tag());
                    buckets.push((outcome, d.clone()));
                    d
                }
            };
            if let Err(e) = self.file_item(item, metadata.as_ref(), &dir).await {
                tracing::warn!(item = %name, bucket = outcome.tag(), error = %e, "failed to copy item into bucket");
            }

            tally.record(outcome);
            records.push(ItemRecord {
                name,
                outcome,
                message,
            });

            let processed = idx + 1;
            if processed % every == 0 || processed == total {
                let update = ProgressUpdate {
                    processed,
                    total,
                    summary: tally.summary(),
                };
                if let Err(e) = progress.update(&update).await {
                    tracing::debug!(error = %e, "progress update not delivered");
                }
            }

            self.pacer.after_item(signal).await;
        }

        tracing::info!(total, summary = %tally.summary(), "batch run complete");
        Ok(RunReport {
            tally,
            records,
            buckets,
        })
    }

    /// Copy the primary file (and sidecar) flat into `dir`.
    async fn file_item(&self, item: &Item, metadata: Option<&Metadata>, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;

        let stem = unique_stem(dir, item).await;
        let primary_ext = item
            .path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let primary_dest = dir.join(with_ext(&stem, &primary_ext));
        tokio::fs::copy(&item.path, &primary_dest).await?;

        let sidecar_ext = item
            .sidecar
            .as_ref()
            .and_then(|p| p.extension())
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.cfg.sidecar_ext.clone());
        let sidecar_dest = dir.join(with_ext(&stem, &sidecar_ext));

        match (metadata, &item.sidecar) {
            (Some(meta), _) => {
                let body = serde_json::to_vec_pretty(meta)?;
                tokio::fs::write(&sidecar_dest, body).await?;
            }
            (None, Some(src)) => {
                tokio::fs::copy(src, &sidecar_dest).await?;
            }
            (None, None) => {}
        }
        Ok(())
    }
}

/// Items from different directories can share a name once flattened; suffix
/// later ones so none overwrites another.
async fn unique_stem(dir: &Path, item: &Item) -> String {
    let base = item.name();
    let file_name = |stem: &str| match item.path.extension() {
        Some(ext) => format!("{stem}.{}", ext.to_string_lossy()),
        None => stem.to_string(),
    };

    let mut stem = base.clone();
    let mut n = 2usize;
    while tokio::fs::try_exists(dir.join(file_name(&stem)))
        .await
        .unwrap_or(false)
    {
        stem = format!("{base}_{n}");
        n += 1;
    }
    stem
}

fn with_ext(stem: &str, ext: &str) -> String {
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
