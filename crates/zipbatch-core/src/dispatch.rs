//! Conversation-level dispatch: maps each user's flow state to a batch job.
//!
//! The front-end (CLI today) translates its input into [`Dispatcher`] calls and
//! renders the returned [`Reply`]. State transitions go through the per-user
//! [`StateStore`], so a second upload from the same user while a run is in
//! flight gets `Reply::Busy` instead of racing the first.

use std::path::{Path, PathBuf};

use crate::{
    actions::{AuditOutcome, SidecarAudit},
    domain::UserId,
    job::{BatchJob, JobOutput, MergeOutput},
    progress::ProgressSink,
    state::{StateGuard, StateStore},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchAction {
    Audit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Idle,
    AwaitingArchive { action: BatchAction },
    Collecting { uploads: Vec<(PathBuf, String)> },
    Running,
}

#[derive(Debug)]
pub enum Reply {
    Audit(JobOutput<AuditOutcome>),
    Merged(MergeOutput),
    /// Upload stored for a pending merge; `count` uploads so far.
    Queued { count: usize },
    /// The user is not in a state that expects this input.
    NotExpecting,
    /// Another request from this user is still running.
    Busy,
}

pub struct Dispatcher {
    job: BatchJob,
    flows: StateStore<UserId, Flow>,
}

impl Dispatcher {
    pub fn new(job: BatchJob) -> Self {
        Self {
            job,
            flows: StateStore::new(),
        }
    }

    pub async fn flow(&self, user: UserId) -> Flow {
        self.flows.get(&user).await.unwrap_or(Flow::Idle)
    }

    /// User picked a single-archive action; the next upload runs it.
    ///
    /// Returns `false` if the user has a request in flight.
    pub async fn select(&self, user: UserId, action: BatchAction) -> bool {
        self.transition(user, Flow::AwaitingArchive { action }).await
    }

    /// User started a merge; uploads accumulate until [`Self::confirm_merge`].
    pub async fn start_merge(&self, user: UserId) -> bool {
        self.transition(user, Flow::Collecting { uploads: vec![] })
            .await
    }

    /// Back to the main menu. Ignored while a run is in flight.
    pub async fn reset(&self, user: UserId) -> bool {
        self.transition(user, Flow::Idle).await
    }

    pub async fn upload(
        &self,
        user: UserId,
        archive: &Path,
        file_name: &str,
        progress: &dyn ProgressSink,
        out_dir: &Path,
    ) -> Result<Reply> {
        let Some(mut guard) = self.flows.try_lock(&user) else {
            return Ok(Reply::Busy);
        };

        match guard.clone().unwrap_or(Flow::Idle) {
            Flow::AwaitingArchive {
                action: BatchAction::Audit,
            } => {
                let res = {
                    let _running = RunningFlow::enter(guard);
                    self.job
                        .run(archive, file_name, &SidecarAudit::new(), progress, out_dir)
                        .await
                };
                self.flows.prune(&user);
                res.map(Reply::Audit)
            }
            Flow::Collecting { mut uploads } => {
                uploads.push((archive.to_path_buf(), file_name.to_string()));
                let count = uploads.len();
                *guard = Some(Flow::Collecting { uploads });
                Ok(Reply::Queued { count })
            }
            Flow::Idle | Flow::Running => {
                drop(guard);
                self.flows.prune(&user);
                Ok(Reply::NotExpecting)
            }
        }
    }

    pub async fn confirm_merge(&self, user: UserId, out_dir: &Path) -> Result<Reply> {
        let Some(guard) = self.flows.try_lock(&user) else {
            return Ok(Reply::Busy);
        };
        let uploads = match guard.clone() {
            Some(Flow::Collecting { uploads }) if !uploads.is_empty() => uploads,
            _ => {
                drop(guard);
                self.flows.prune(&user);
                return Ok(Reply::NotExpecting);
            }
        };

        let res = {
            let _running = RunningFlow::enter(guard);
            self.job.merge(&uploads, out_dir).await
        };
        self.flows.prune(&user);
        res.map(Reply::Merged)
    }

    async fn transition(&self, user: UserId, next: Flow) -> bool {
        let Some(mut guard) = self.flows.try_lock(&user) else {
            return false;
        };
        tracing::debug!(user = user.0, ?next, "flow transition");
        *guard = idle_as_empty(next);
        drop(guard);
        self.flows.prune(&user);
        true
    }
}

/// Holds the user's key for the whole run and returns them to `Idle` when
/// dropped, including when the request future is cancelled mid-run.
struct RunningFlow(StateGuard<Flow>);

impl RunningFlow {
    fn enter(mut guard: StateGuard<Flow>) -> Self {
        *guard = Some(Flow::Running);
        Self(guard)
    }
}

impl Drop for RunningFlow {
    fn drop(&mut self) {
        *self.0 = idle_as_empty(Flow::Idle);
    }
}

/// `Idle` is stored as no state so the user's slot can be pruned.
fn idle_as_empty(flow: Flow) -> Option<Flow> {
    match flow {
        Flow::Idle => None,
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, progress::NullProgress};
    use std::{fs, io::Write, time::Duration};
    use zip::write::{FileOptions, ZipWriter};

    fn dispatcher(scratch: &Path) -> Dispatcher {
        let cfg = Config {
            temp_dir: scratch.to_path_buf(),
            item_delay: Duration::ZERO,
            ..Config::default()
        };
        Dispatcher::new(BatchJob::from_config(&cfg))
    }

    #[tokio::test]
    async fn cancelled_run_returns_user_to_idle() {
        let base = tempfile::tempdir().unwrap();
        let upload = base.path().join("u.zip");
        let mut zw = ZipWriter::new(fs::File::create(&upload).unwrap());
        zw.start_file("a.session", FileOptions::default()).unwrap();
        zw.write_all(b"a").unwrap();
        zw.finish().unwrap();

        let d = dispatcher(&base.path().join("scratch"));
        let user = UserId(7);
        assert!(d.select(user, BatchAction::Audit).await);

        let out = base.path().join("out");
        let cancelled = tokio::time::timeout(
            Duration::ZERO,
            d.upload(user, &upload, "u.zip", &NullProgress, &out),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(d.flow(user).await, Flow::Idle);
        assert!(d.select(user, BatchAction::Audit).await);
    }

    #[tokio::test]
    async fn idle_users_hold_no_slot() {
        let base = tempfile::tempdir().unwrap();
        let d = dispatcher(&base.path().join("scratch"));
        let user = UserId(10);

        assert!(d.select(user, BatchAction::Audit).await);
        assert_eq!(d.flows.len(), 1);
        assert!(d.reset(user).await);
        assert!(d.flows.is_empty());
        assert_eq!(d.flow(user).await, Flow::Idle);
    }

    #[tokio::test]
    async fn confirm_without_uploads_is_not_expected() {
        let base = tempfile::tempdir().unwrap();
        let d = dispatcher(&base.path().join("scratch"));
        let user = UserId(8);

        let reply = d.confirm_merge(user, base.path()).await.unwrap();
        assert!(matches!(reply, Reply::NotExpecting));
        assert!(d.flows.is_empty());

        assert!(d.start_merge(user).await);
        let reply = d.confirm_merge(user, base.path()).await.unwrap();
        assert!(matches!(reply, Reply::NotExpecting));
        assert_eq!(d.flow(user).await, Flow::Collecting { uploads: vec![] });
    }

    #[tokio::test]
    async fn busy_while_key_is_held() {
        let base = tempfile::tempdir().unwrap();
        let d = dispatcher(&base.path().join("scratch"));
        let user = UserId(9);

        let _held = d.flows.lock(&user).await;
        assert!(!d.select(user, BatchAction::Audit).await);
        let reply = d
            .upload(user, base.path(), "u.zip", &NullProgress, base.path())
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Busy));
    }
}
