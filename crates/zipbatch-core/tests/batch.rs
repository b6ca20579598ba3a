use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use zip::write::{FileOptions, ZipWriter};

use zipbatch_core::{
    config::Config,
    discovery::Item,
    dispatch::{BatchAction, Dispatcher, Flow, Reply},
    domain::UserId,
    job::{BatchJob, SidecarState},
    outcome::Outcome,
    pacing::NoPacing,
    pipeline::{ActionOutput, ItemAction, ItemError},
    progress::NullProgress,
    Error,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Verdict {
    Alpha,
    Beta,
    Unused,
    Failed,
}

impl Outcome for Verdict {
    fn tag(&self) -> &'static str {
        match self {
            Verdict::Alpha => "alpha",
            Verdict::Beta => "beta",
            Verdict::Unused => "unused",
            Verdict::Failed => "failed",
        }
    }

    fn all() -> &'static [Self] {
        &[
            Verdict::Alpha,
            Verdict::Beta,
            Verdict::Unused,
            Verdict::Failed,
        ]
    }

    fn failed() -> Self {
        Verdict::Failed
    }
}

/// Reads the primary file: "alpha" / "beta" classify, anything else errors.
struct ByBody {
    delay: Duration,
}

#[async_trait]
impl ItemAction<Verdict> for ByBody {
    async fn process(&self, item: &Item) -> Result<ActionOutput<Verdict>, ItemError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let body = tokio::fs::read_to_string(&item.path).await?;
        match body.as_str() {
            "alpha" => Ok(ActionOutput::new(Verdict::Alpha)),
            "beta" => Ok(ActionOutput::new(Verdict::Beta)),
            other => Err(ItemError::new(format!("cannot handle {other}"))),
        }
    }
}

fn write_zip(path: &Path, entries: &[(String, String)]) {
    let mut zw = ZipWriter::new(fs::File::create(path).unwrap());
    for (name, data) in entries {
        zw.start_file(name.as_str(), FileOptions::default()).unwrap();
        zw.write_all(data.as_bytes()).unwrap();
    }
    zw.finish().unwrap();
}

fn entry_names(path: &Path) -> Vec<String> {
    let mut zip = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect()
}

fn test_config(scratch: &Path) -> Config {
    Config {
        temp_dir: scratch.to_path_buf(),
        item_delay: Duration::ZERO,
        progress_every: 3,
        ..Config::default()
    }
}

fn job(scratch: &Path) -> BatchJob {
    BatchJob::from_config(&test_config(scratch)).with_pacer(Arc::new(NoPacing))
}

fn scratch_is_empty(root: &Path) -> bool {
    fs::read_dir(root).map(|mut rd| rd.next().is_none()).unwrap_or(true)
}

/// Seven items: three alpha, three beta, one that makes the action fail.
/// `acc1` and `acc4` carry sidecars with a stored secret.
fn seven_item_upload(dir: &Path) -> PathBuf {
    let bodies = ["alpha", "beta", "alpha", "beta", "oops", "alpha", "beta"];
    let mut entries: Vec<(String, String)> = bodies
        .iter()
        .enumerate()
        .map(|(i, b)| (format!("batch/acc{i}.session"), b.to_string()))
        .collect();
    entries.push(("batch/acc1.json".into(), r#"{"2fa": "one"}"#.into()));
    entries.push(("batch/acc4.json".into(), r#"{"password": "four"}"#.into()));
    entries.push(("batch/readme.txt".into(), "not an item".into()));

    let path = dir.join("upload.zip");
    write_zip(&path, &entries);
    path
}

#[tokio::test]
async fn seven_item_scenario_conserves_every_item() {
    let base = tempfile::tempdir().unwrap();
    let upload = seven_item_upload(base.path());
    let scratch = base.path().join("scratch");
    let out = base.path().join("out");

    let action = ByBody {
        delay: Duration::ZERO,
    };
    let output = job(&scratch)
        .run(&upload, "upload.zip", &action, &NullProgress, &out)
        .await
        .unwrap();

    assert_eq!(output.total, 7);
    assert_eq!(output.tally.get(Verdict::Alpha), 3);
    assert_eq!(output.tally.get(Verdict::Beta), 3);
    assert_eq!(output.tally.get(Verdict::Failed), 1);
    assert_eq!(output.tally.get(Verdict::Unused), 0);
    assert_eq!(output.tally.total(), output.total);

    let failed = output
        .records
        .iter()
        .find(|r| r.outcome == Verdict::Failed)
        .unwrap();
    assert_eq!(failed.name, "acc4");
    assert_eq!(failed.message, "cannot handle oops");

    // No archive for the unused tag.
    let tags: Vec<_> = output.archives.iter().map(|a| a.tag).collect();
    assert_eq!(tags, vec!["alpha", "beta", "failed"]);

    let mut sessions = 0;
    for archive in &output.archives {
        let names = entry_names(&archive.path);
        let count = names.iter().filter(|n| n.ends_with(".session")).count();
        assert_eq!(count, archive.count);
        sessions += count;
        assert!(names.iter().all(|n| !n.contains('/')), "flattened: {names:?}");
    }
    assert_eq!(sessions, 7);

    let beta = output.archives.iter().find(|a| a.tag == "beta").unwrap();
    assert!(entry_names(&beta.path).contains(&"acc1.json".to_string()));
    let failed = output.archives.iter().find(|a| a.tag == "failed").unwrap();
    let mut zip = zip::ZipArchive::new(fs::File::open(&failed.path).unwrap()).unwrap();
    let mut sidecar = String::new();
    zip.by_name("acc4.json")
        .unwrap()
        .read_to_string(&mut sidecar)
        .unwrap();
    assert!(sidecar.contains("four"));

    // The scratch workspace is gone once the job returns.
    assert!(scratch_is_empty(&scratch));
}

#[tokio::test]
async fn empty_archive_is_no_items_found_without_output() {
    let base = tempfile::tempdir().unwrap();
    let upload = base.path().join("empty.zip");
    write_zip(&upload, &[("notes.txt".into(), "hello".into())]);
    let scratch = base.path().join("scratch");
    let out = base.path().join("out");

    let action = ByBody {
        delay: Duration::ZERO,
    };
    let err = job(&scratch)
        .run(&upload, "empty.zip", &action, &NullProgress, &out)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoItemsFound));
    assert!(scratch_is_empty(&out));
    assert!(scratch_is_empty(&scratch));
}

#[tokio::test]
async fn oversize_archive_fails_before_any_action() {
    struct MustNotRun;

    #[async_trait]
    impl ItemAction<Verdict> for MustNotRun {
        async fn process(&self, _item: &Item) -> Result<ActionOutput<Verdict>, ItemError> {
            panic!("action ran for an oversize upload");
        }
    }

    let base = tempfile::tempdir().unwrap();
    let upload = base.path().join("big.zip");
    write_zip(
        &upload,
        &[
            ("a.session".into(), "x".repeat(700)),
            ("b.session".into(), "x".repeat(700)),
        ],
    );
    let scratch = base.path().join("scratch");
    let cfg = Config {
        max_extract_bytes: 1024,
        ..test_config(&scratch)
    };

    let err = BatchJob::from_config(&cfg)
        .run(
            &upload,
            "big.zip",
            &MustNotRun,
            &NullProgress,
            &base.path().join("out"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TooLarge { limit: 1024, .. }));
    assert!(err.is_user_facing());
}

#[tokio::test]
async fn timed_out_run_packages_nothing() {
    let base = tempfile::tempdir().unwrap();
    let upload = seven_item_upload(base.path());
    let scratch = base.path().join("scratch");
    let out = base.path().join("out");
    let cfg = Config {
        max_run_time: Duration::from_millis(300),
        ..test_config(&scratch)
    };

    let action = ByBody {
        delay: Duration::from_millis(100),
    };
    let err = BatchJob::from_config(&cfg)
        .with_pacer(Arc::new(NoPacing))
        .run(&upload, "upload.zip", &action, &NullProgress, &out)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RunTimeout(_)));
    assert!(scratch_is_empty(&out));
    assert!(scratch_is_empty(&scratch));
}

#[tokio::test]
async fn wrong_extension_is_invalid_format() {
    let base = tempfile::tempdir().unwrap();
    let upload = base.path().join("upload.7z");
    fs::write(&upload, b"whatever").unwrap();

    let action = ByBody {
        delay: Duration::ZERO,
    };
    let err = job(&base.path().join("scratch"))
        .run(
            &upload,
            "upload.7z",
            &action,
            &NullProgress,
            &base.path().join("out"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidFormat(_)));
}

#[tokio::test]
async fn discover_archive_reports_sidecar_state() {
    let base = tempfile::tempdir().unwrap();
    let upload = base.path().join("u.zip");
    write_zip(
        &upload,
        &[
            ("a.session".into(), "a".into()),
            ("a.json".into(), r#"{"2FA":"s"}"#.into()),
            ("b.session".into(), "b".into()),
            ("b.json".into(), "[1, 2]".into()),
            ("c.session".into(), "c".into()),
        ],
    );

    let items = job(&base.path().join("scratch"))
        .discover_archive(&upload, "u.zip")
        .await
        .unwrap();
    let states: Vec<_> = items.iter().map(|i| (i.name.as_str(), i.sidecar)).collect();
    assert_eq!(
        states,
        vec![
            ("a", SidecarState::Parsed { has_secret: true }),
            ("b", SidecarState::Malformed),
            ("c", SidecarState::Missing),
        ]
    );
    assert_eq!(items[0].path, PathBuf::from("a.session"));
}

#[tokio::test]
async fn dispatcher_audit_flow_returns_to_idle() {
    let base = tempfile::tempdir().unwrap();
    let upload = seven_item_upload(base.path());
    let out = base.path().join("out");
    let dispatcher = Dispatcher::new(job(&base.path().join("scratch")));
    let user = UserId(42);

    let reply = dispatcher
        .upload(user, &upload, "upload.zip", &NullProgress, &out)
        .await
        .unwrap();
    assert!(matches!(reply, Reply::NotExpecting));

    assert!(dispatcher.select(user, BatchAction::Audit).await);
    let reply = dispatcher
        .upload(user, &upload, "upload.zip", &NullProgress, &out)
        .await
        .unwrap();
    let Reply::Audit(report) = reply else {
        panic!("expected audit report, got {reply:?}");
    };
    assert_eq!(report.total, 7);
    assert_eq!(report.tally.total(), 7);
    assert_eq!(dispatcher.flow(user).await, Flow::Idle);
}

#[tokio::test]
async fn dispatcher_merge_collects_then_dedups() {
    let base = tempfile::tempdir().unwrap();
    let first = base.path().join("first.zip");
    write_zip(
        &first,
        &[
            ("a.session".into(), "old".into()),
            ("b.session".into(), "b".into()),
        ],
    );
    let second = base.path().join("second.zip");
    write_zip(
        &second,
        &[
            ("nested/a.session".into(), "new".into()),
            ("nested/a.json".into(), "{}".into()),
        ],
    );
    let out = base.path().join("out");
    let dispatcher = Dispatcher::new(job(&base.path().join("scratch")));
    let user = UserId::LOCAL;

    assert!(dispatcher.start_merge(user).await);
    for (path, name) in [(&first, "first.zip"), (&second, "second.zip")] {
        dispatcher
            .upload(user, path, name, &NullProgress, &out)
            .await
            .unwrap();
    }
    assert!(matches!(
        dispatcher.flow(user).await,
        Flow::Collecting { uploads } if uploads.len() == 2
    ));

    let reply = dispatcher.confirm_merge(user, &out).await.unwrap();
    let Reply::Merged(merged) = reply else {
        panic!("expected merge output, got {reply:?}");
    };
    assert_eq!(merged.items, 2);
    assert_eq!(merged.duplicates, 1);

    let mut names = entry_names(&merged.archive);
    names.sort();
    assert_eq!(names, vec!["a.json", "a.session", "b.session"]);

    let mut zip = zip::ZipArchive::new(fs::File::open(&merged.archive).unwrap()).unwrap();
    let mut body = String::new();
    zip.by_name("a.session")
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "new");
    assert_eq!(dispatcher.flow(user).await, Flow::Idle);
}
