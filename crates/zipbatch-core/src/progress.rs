use async_trait::async_trait;

use crate::Result;

/// Snapshot emitted while a batch run is in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub processed: usize,
    pub total: usize,
    /// Running per-outcome counts, see [`crate::outcome::Tally::summary`].
    pub summary: String,
}

/// Destination for progress updates (a chat message, a terminal, a log).
///
/// Delivery is best-effort: the pipeline logs and ignores errors.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, update: &ProgressUpdate) -> Result<()>;
}

/// Logs every update at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn update(&self, update: &ProgressUpdate) -> Result<()> {
        tracing::info!(
            processed = update.processed,
            total = update.total,
            "progress: {}",
            update.summary
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;

#[async_trait]
impl ProgressSink for NullProgress {
    async fn update(&self, _update: &ProgressUpdate) -> Result<()> {
        Ok(())
    }
}
