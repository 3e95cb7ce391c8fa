//! The abstract unit of pipeline work, and its common built-in variants.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::log::{LogObserver, LogStream};
use crate::pipeline::Pipeline;
use crate::subprocess::{read_lines, Subprocess, SubprocessFlags, SubprocessLauncher};

/// Shared bookkeeping every `Stage` implementation embeds. Holds the state
/// the pipeline and external query handlers both poke at through interior
/// mutability, since a `Stage` is always accessed through `&dyn Stage`.
pub struct StageBase {
    name: Mutex<String>,
    completed: AtomicBool,
    transient: AtomicBool,
    pause_count: AtomicI64,
    query_queued: AtomicBool,
    notify: tokio::sync::Notify,
    observer: Mutex<Option<LogObserver>>,
}

impl StageBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Mutex::new(name.into()),
            completed: AtomicBool::new(false),
            transient: AtomicBool::new(false),
            pause_count: AtomicI64::new(0),
            query_queued: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
            observer: Mutex::new(None),
        }
    }
}

impl Default for StageBase {
    fn default() -> Self {
        Self::new("stage")
    }
}

/// The abstract unit of work attached to exactly one phase.
///
/// Every capability is a method with a sensible default so that a stage
/// which only needs synchronous work (`StageMkdirs`) can skip everything
/// async, while a stage with a subprocess (`StageProcess`) overrides
/// `execute_async` directly instead of going through the sync hook.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Shared bookkeeping for this stage. Implementors just embed a
    /// `StageBase` and return a reference to it; every other default method
    /// on this trait is expressed in terms of it.
    fn base(&self) -> &StageBase;

    fn name(&self) -> String {
        self.base().name.lock().unwrap().clone()
    }

    fn set_name(&self, name: impl Into<String>)
    where
        Self: Sized,
    {
        *self.base().name.lock().unwrap() = name.into();
    }

    fn completed(&self) -> bool {
        self.base().completed.load(Ordering::Acquire)
    }

    fn set_completed(&self, completed: bool) {
        self.base().completed.store(completed, Ordering::Release);
    }

    fn transient(&self) -> bool {
        self.base().transient.load(Ordering::Acquire)
    }

    fn set_transient(&self, transient: bool) {
        self.base().transient.store(transient, Ordering::Release);
    }

    /// Installed by the pipeline at attachment time.
    fn set_log_observer(&self, observer: LogObserver) {
        *self.base().observer.lock().unwrap() = Some(observer);
    }

    fn log(&self, stream: LogStream, line: &str) {
        if let Some(observer) = self.base().observer.lock().unwrap().as_ref() {
            observer(stream, line);
        }
    }

    /// Begin tailing a subprocess's stdout and stderr, forwarding each
    /// complete line as a log record. The two streams are read
    /// concurrently and have no ordering relationship to one another;
    /// each ends when its pipe closes.
    async fn log_subprocess(&self, subprocess: &mut Subprocess) {
        let stdout = subprocess.stdout();
        let stderr = subprocess.stderr();

        let stdout_fut = async {
            if let Some(out) = stdout {
                read_lines(out, |line| self.log(LogStream::Stdout, line)).await;
            }
        };
        let stderr_fut = async {
            if let Some(err) = stderr {
                read_lines(err, |line| self.log(LogStream::Stderr, line)).await;
            }
        };

        tokio::join!(stdout_fut, stderr_fut);
    }

    /// Synchronous hook for simple stages. Default is a no-op success.
    fn execute(&self, _pipeline: &Pipeline, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Preferred entry point. The default offloads `execute` via
    /// `block_in_place`, which hands the current worker thread's other
    /// tasks to a fresh worker for the duration. Requires a multi-threaded
    /// tokio runtime; stages that need true async I/O (subprocesses,
    /// network checks) should override this directly instead.
    async fn execute_async(&self, pipeline: &Pipeline, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::task::block_in_place(|| self.execute(pipeline, cancel))
    }

    /// Emitted before execution, wrapped in a pause, so a handler may
    /// perform an external freshness check and either mark the stage
    /// completed or pause it pending further async work.
    async fn query(&self, _pipeline: &Pipeline, _cancel: &CancellationToken) {}

    fn pause(&self) {
        self.base().pause_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpause(&self) {
        let base = self.base();
        let prev = base.pause_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpause() called without a matching pause()");
        if prev == 1 {
            base.notify.notify_one();
        }
    }

    /// Runs `query`, then executes the stage unless the query marked it
    /// completed. If a query handler paused the stage for asynchronous
    /// work that outlives the query call itself (by calling `pause()`
    /// again and `unpause()`-ing later from elsewhere), execution is
    /// deferred until the pause count returns to zero.
    async fn execute_with_query_async(
        &self,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let base = self.base();

        if base
            .query_queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Pending);
        }

        let result = async {
            self.pause();
            self.query(pipeline, cancel).await;
            self.unpause();

            loop {
                // Enable the notification before re-checking the count: if an
                // outstanding `unpause()` from another task lands between the
                // load below and the `.await`, the permit `notify_one` leaves
                // behind is still picked up instead of being lost.
                let notified = base.notify.notified();
                if base.pause_count.load(Ordering::Acquire) <= 0 {
                    break;
                }
                notified.await;
            }

            if self.completed() {
                debug!(stage = %self.name(), "query marked stage completed, skipping execute");
                return Ok(());
            }

            self.execute_async(pipeline, cancel).await
        }
        .await;

        base.query_queued.store(false, Ordering::Release);
        result
    }
}

/// Force the flags a build pipeline stage needs, run it, and stream its
/// output into `stage`'s log. Shared by [`StageProcess`] and by stages
/// (such as an autotools-style configure step) that need a subprocess but
/// also want to override `query`.
pub async fn run_launcher(
    stage: &dyn Stage,
    mut launcher: SubprocessLauncher,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut flags = launcher.flags();
    flags = flags.remove(SubprocessFlags::STDERR_SILENCE);
    flags = flags.remove(SubprocessFlags::STDERR_MERGE);
    flags = flags.remove(SubprocessFlags::STDIN_INHERIT);
    flags |= SubprocessFlags::STDOUT_PIPE | SubprocessFlags::STDERR_PIPE;
    launcher.set_flags(flags);

    if !launcher.argv().is_empty() {
        stage.log(LogStream::Stdout, &launcher.render());
    }

    let mut subprocess = launcher.spawn()?;
    stage.log_subprocess(&mut subprocess).await;

    tokio::select! {
        result = subprocess.wait_check() => result,
        _ = cancel.cancelled() => {
            let _ = subprocess.kill().await;
            Err(Error::Cancelled)
        }
    }
}

/// Runs a subprocess, streaming its output into the shared build log.
pub struct StageProcess {
    base: StageBase,
    launcher: Mutex<Option<SubprocessLauncher>>,
}

impl StageProcess {
    pub fn new(name: impl Into<String>, launcher: SubprocessLauncher) -> Self {
        Self {
            base: StageBase::new(name),
            launcher: Mutex::new(Some(launcher)),
        }
    }
}

#[async_trait]
impl Stage for StageProcess {
    fn base(&self) -> &StageBase {
        &self.base
    }

    async fn execute_async(&self, _pipeline: &Pipeline, cancel: &CancellationToken) -> Result<()> {
        let launcher = self
            .launcher
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Internal(format!("{} already executed", self.name())))?;

        run_launcher(self, launcher, cancel).await
    }
}

/// Ensures a set of directories exist.
pub struct StageMkdirs {
    base: StageBase,
    paths: Mutex<Vec<(PathBuf, bool, u32)>>,
}

impl StageMkdirs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: StageBase::new(name),
            paths: Mutex::new(Vec::new()),
        }
    }

    /// Queue a directory to create. `mode` is interpreted as unix
    /// permission bits on unix platforms and ignored elsewhere.
    pub fn add_path(&self, path: impl Into<PathBuf>, with_parents: bool, mode: u32) {
        self.paths.lock().unwrap().push((path.into(), with_parents, mode));
    }
}

impl Stage for StageMkdirs {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn execute(&self, _pipeline: &Pipeline, _cancel: &CancellationToken) -> Result<()> {
        for (path, with_parents, _mode) in self.paths.lock().unwrap().iter() {
            if path.is_dir() {
                continue;
            }

            let result = if *with_parents {
                std::fs::create_dir_all(path)
            } else {
                std::fs::create_dir(path)
            };

            result.map_err(Error::Filesystem)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(*_mode));
            }
        }

        Ok(())
    }
}

/// A transfer that runs in the background and reports completion.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Awaits completion of an external transfer (e.g. a flatpak runtime
/// download). Success or failure of the stage follows the transfer.
pub struct StageTransfer {
    base: StageBase,
    transfer: Box<dyn Transfer>,
}

impl StageTransfer {
    pub fn new(name: impl Into<String>, transfer: Box<dyn Transfer>) -> Self {
        Self {
            base: StageBase::new(name),
            transfer,
        }
    }
}

#[async_trait]
impl Stage for StageTransfer {
    fn base(&self) -> &StageBase {
        &self.base
    }

    async fn execute_async(&self, _pipeline: &Pipeline, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            result = self.transfer.run(cancel) => result,
            _ = cancel.cancelled() => {
                warn!(stage = %self.name(), "transfer cancelled");
                Err(Error::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Configuration;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn test_pipeline() -> Pipeline {
        let dir = tempfile::tempdir().unwrap();
        Pipeline::new(
            "proj",
            dir.path().to_path_buf(),
            Configuration::new("default"),
        )
    }

    #[tokio::test]
    async fn mkdirs_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");

        let stage = StageMkdirs::new("mkdirs");
        stage.add_path(&target, true, 0o750);

        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        stage.execute(&pipeline, &cancel).unwrap();

        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn mkdirs_skips_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let stage = StageMkdirs::new("mkdirs");
        stage.add_path(dir.path(), true, 0o750);

        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        stage.execute(&pipeline, &cancel).unwrap();
    }

    struct AlwaysCompleteQuery;

    #[async_trait]
    impl Stage for AlwaysCompleteQuery {
        fn base(&self) -> &StageBase {
            use std::sync::OnceLock;
            static BASE: OnceLock<StageBase> = OnceLock::new();
            BASE.get_or_init(|| StageBase::new("query-skip"))
        }

        async fn query(&self, _pipeline: &Pipeline, _cancel: &CancellationToken) {
            self.set_completed(true);
        }

        fn execute(&self, _pipeline: &Pipeline, _cancel: &CancellationToken) -> Result<()> {
            panic!("execute should not run when query marks the stage completed");
        }
    }

    #[tokio::test]
    async fn query_marking_completed_skips_execute() {
        let stage = AlwaysCompleteQuery;
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();

        stage
            .execute_with_query_async(&pipeline, &cancel)
            .await
            .unwrap();

        assert!(stage.completed());
    }

    struct CountingStage {
        base: StageBase,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for CountingStage {
        fn base(&self) -> &StageBase {
            &self.base
        }

        fn execute(&self, _pipeline: &Pipeline, _cancel: &CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_query_guarded_execute_is_rejected() {
        let stage = Arc::new(CountingStage {
            base: StageBase::new("counting"),
            runs: Arc::new(AtomicUsize::new(0)),
        });
        stage.pause();

        let pipeline = Arc::new(test_pipeline());
        let cancel = CancellationToken::new();

        let s1 = stage.clone();
        let p1 = pipeline.clone();
        let c1 = cancel.clone();
        let first = tokio::spawn(async move { s1.execute_with_query_async(&p1, &c1).await });

        tokio::task::yield_now().await;

        let second = stage.execute_with_query_async(&pipeline, &cancel).await;
        assert!(matches!(second, Err(Error::Pending)));

        stage.unpause();
        first.await.unwrap().unwrap();
        assert_eq!(stage.runs.load(Ordering::SeqCst), 1);
    }
}
