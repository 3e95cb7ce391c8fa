//! Phase ordering and the single-threaded drive loop that ticks stages
//! forward in phase order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::addin::PipelineAddin;
use crate::configuration::Configuration;
use crate::error::{Error, Result};
use crate::id::StageId;
use crate::log::{BuildLog, LogObserver};
use crate::stage::Stage;
use crate::subprocess::SubprocessLauncher;

/// A phase bitfield: a basic phase (low 24 bits, one bit per phase), an
/// optional whence modifier (`BEFORE`/`AFTER`), and two terminal markers
/// (`FINISHED`/`FAILED`) used only as return values from
/// [`Pipeline::current_phase`], never as attach/request input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Phase(u32);

impl Phase {
    pub const NONE: Phase = Phase(0);
    pub const PREPARE: Phase = Phase(1 << 0);
    pub const DOWNLOADS: Phase = Phase(1 << 1);
    pub const DEPENDENCIES: Phase = Phase(1 << 2);
    pub const AUTOGEN: Phase = Phase(1 << 3);
    pub const CONFIGURE: Phase = Phase(1 << 4);
    pub const BUILD: Phase = Phase(1 << 6);
    pub const INSTALL: Phase = Phase(1 << 7);
    pub const EXPORT: Phase = Phase(1 << 8);
    pub const FINAL: Phase = Phase(1 << 9);

    pub const BEFORE: Phase = Phase(1 << 28);
    pub const AFTER: Phase = Phase(1 << 29);
    pub const FINISHED: Phase = Phase(1 << 30);
    pub const FAILED: Phase = Phase(1 << 31);

    const PHASE_MASK: u32 = 0x00FF_FFFF;
    const WHENCE_MASK: u32 = Phase::BEFORE.0 | Phase::AFTER.0;

    const ALL_BASIC: [Phase; 9] = [
        Phase::PREPARE,
        Phase::DOWNLOADS,
        Phase::DEPENDENCIES,
        Phase::AUTOGEN,
        Phase::CONFIGURE,
        Phase::BUILD,
        Phase::INSTALL,
        Phase::EXPORT,
        Phase::FINAL,
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Phase {
        Phase(bits)
    }

    /// Strip whence and terminal markers, leaving just the basic phase bit.
    pub fn basic(self) -> Phase {
        Phase(self.0 & Self::PHASE_MASK)
    }

    pub fn whence(self) -> Phase {
        Phase(self.0 & Self::WHENCE_MASK)
    }

    pub fn is_known_basic(self) -> bool {
        Self::ALL_BASIC.contains(&self)
    }

    pub fn contains(self, other: Phase) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Phase {
    type Output = Phase;
    fn bitor(self, rhs: Self) -> Self::Output {
        Phase(self.0 | rhs.0)
    }
}

/// One stage's place in the ordering.
pub struct PipelineEntry {
    pub id: StageId,
    pub phase: Phase,
    pub priority: i32,
    pub stage: Box<dyn Stage>,
    seqnum: u32,
}

/// Orders entries by basic phase, then whence (`BEFORE` < unmodified <
/// `AFTER`), then priority, with ties broken by attachment order so the
/// sort is effectively stable even though `Vec::sort_by` alone would
/// already guarantee that.
fn compare_entries(a: &PipelineEntry, b: &PipelineEntry) -> std::cmp::Ordering {
    fn whence_rank(phase: Phase) -> i8 {
        let w = phase.whence();
        if w == Phase::BEFORE {
            -1
        } else if w == Phase::AFTER {
            1
        } else {
            0
        }
    }

    a.phase
        .basic()
        .bits()
        .cmp(&b.phase.basic().bits())
        .then_with(|| whence_rank(a.phase).cmp(&whence_rank(b.phase)))
        .then_with(|| a.priority.cmp(&b.priority))
        .then_with(|| a.seqnum.cmp(&b.seqnum))
}

type StartedObserver = Box<dyn Fn() + Send + Sync>;
type PhaseObserver = Box<dyn Fn(Phase) + Send + Sync>;
type FinishedObserver = Box<dyn Fn(bool) + Send + Sync>;

/// The pipeline: an ordered list of stages driven through phases one at a
/// time by a single in-flight `execute_async` call.
pub struct Pipeline {
    entries: Vec<PipelineEntry>,
    next_seqnum: u32,
    next_id: u32,

    cursor: AtomicI64,
    requested_mask: AtomicU32,
    failed: AtomicBool,
    running: AtomicBool,

    srcdir: PathBuf,
    builddir: PathBuf,
    configuration: Configuration,
    log: Arc<BuildLog>,

    addins: Mutex<Vec<Arc<dyn PipelineAddin>>>,
    started_observers: Mutex<Vec<StartedObserver>>,
    phase_observers: Mutex<Vec<PhaseObserver>>,
    finished_observers: Mutex<Vec<FinishedObserver>>,
}

impl Pipeline {
    pub fn new(project_id: &str, srcdir: PathBuf, configuration: Configuration) -> Self {
        let builddir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("buildpipe")
            .join("builds")
            .join(project_id)
            .join(configuration.id());

        Self {
            entries: Vec::new(),
            next_seqnum: 0,
            next_id: 1,
            cursor: AtomicI64::new(-1),
            requested_mask: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            srcdir,
            builddir,
            configuration,
            log: Arc::new(BuildLog::new()),
            addins: Mutex::new(Vec::new()),
            started_observers: Mutex::new(Vec::new()),
            phase_observers: Mutex::new(Vec::new()),
            finished_observers: Mutex::new(Vec::new()),
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn srcdir(&self) -> &Path {
        &self.srcdir
    }

    pub fn builddir(&self) -> &Path {
        &self.builddir
    }

    pub fn build_srcdir_path(&self, segment: impl AsRef<Path>) -> PathBuf {
        self.srcdir.join(segment)
    }

    pub fn build_builddir_path(&self, segment: impl AsRef<Path>) -> PathBuf {
        self.builddir.join(segment)
    }

    pub fn log(&self) -> &Arc<BuildLog> {
        &self.log
    }

    /// Registers `observer` to run once, right before the first stage of a
    /// run is considered, each time `execute_async` is called.
    pub fn on_started(&self, observer: impl Fn() + Send + Sync + 'static) {
        self.started_observers.lock().unwrap().push(Box::new(observer));
    }

    pub fn on_phase_changed(&self, observer: impl Fn(Phase) + Send + Sync + 'static) {
        self.phase_observers.lock().unwrap().push(Box::new(observer));
    }

    pub fn on_finished(&self, observer: impl Fn(bool) + Send + Sync + 'static) {
        self.finished_observers.lock().unwrap().push(Box::new(observer));
    }

    /// A launcher seeded with the build directory as its working directory
    /// and the configuration's environment overlay. Fails if the
    /// configuration has no usable runtime.
    pub fn create_launcher(&self) -> Result<SubprocessLauncher> {
        if self.configuration.runtime_id().is_none() {
            return Err(Error::Configuration(
                "configuration has no runtime to build against".to_string(),
            ));
        }

        let mut launcher = SubprocessLauncher::new();
        launcher.set_cwd(self.builddir.clone());
        for (key, value) in self.configuration.environment() {
            launcher.setenv(key.clone(), value.clone());
        }

        Ok(launcher)
    }

    /// Attach a stage to a phase. Rejected (returns `StageId::INVALID`) if
    /// `phase` isn't exactly one known basic phase optionally combined with
    /// `BEFORE` or `AFTER`, or if execution has already begun.
    pub fn attach(&mut self, phase: Phase, priority: i32, stage: Box<dyn Stage>) -> StageId {
        if self.cursor.load(Ordering::Acquire) != -1 {
            warn!("attach() called after execution has begun, ignoring");
            return StageId::INVALID;
        }

        if !phase.basic().is_known_basic() {
            warn!(phase = phase.bits(), "attach() called with an unrecognized phase");
            return StageId::INVALID;
        }

        let whence = phase.whence();
        if whence != Phase::NONE && whence != Phase::BEFORE && whence != Phase::AFTER {
            warn!("attach() called with both BEFORE and AFTER set");
            return StageId::INVALID;
        }

        let id = StageId::new(self.next_id);
        self.next_id += 1;

        stage.set_log_observer(self.make_log_observer());

        let seqnum = self.next_seqnum;
        self.next_seqnum += 1;

        self.entries.push(PipelineEntry {
            id,
            phase,
            priority,
            stage,
            seqnum,
        });
        self.entries.sort_by(compare_entries);

        id
    }

    /// Convenience wrapper: attach a `StageProcess` running `launcher`.
    pub fn attach_launcher(
        &mut self,
        phase: Phase,
        priority: i32,
        name: impl Into<String>,
        launcher: SubprocessLauncher,
    ) -> StageId {
        self.attach(phase, priority, Box::new(crate::stage::StageProcess::new(name, launcher)))
    }

    /// Detach a previously attached stage. A no-op if `id` isn't present.
    pub fn detach(&mut self, id: StageId) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn get_stage_by_id(&self, id: StageId) -> Option<&dyn Stage> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.stage.as_ref())
    }

    /// Mark every attached stage whose basic phase is in `mask` as not
    /// completed. Safe to call at any time, including mid-run; the next
    /// tick through that stage's phase re-executes it.
    pub fn invalidate_phase(&self, mask: Phase) {
        let bits = mask.basic().bits();
        for entry in &self.entries {
            if entry.phase.basic().bits() & bits != 0 {
                entry.stage.set_completed(false);
            }
        }
    }

    /// Request that every phase up to and including `phase` run on the next
    /// `execute_async`. Rejected once execution has begun.
    pub fn request_phase(&self, phase: Phase) {
        if self.running.load(Ordering::Acquire) {
            warn!("request_phase() called while the pipeline is running, ignoring");
            return;
        }

        let basic = phase.basic();
        if !basic.is_known_basic() {
            warn!(phase = phase.bits(), "request_phase() called with an unrecognized phase");
            return;
        }

        let bits = basic.bits();
        self.requested_mask.fetch_or(bits | (bits - 1), Ordering::AcqRel);
    }

    /// The phase of the most recently ticked entry, or `FINISHED`/`FAILED`
    /// once the run has ended.
    pub fn current_phase(&self) -> Phase {
        if self.failed.load(Ordering::Acquire) {
            return Phase::FAILED;
        }

        let pos = self.cursor.load(Ordering::Acquire);
        if pos < 0 {
            return Phase::NONE;
        }
        match self.entries.get(pos as usize) {
            Some(entry) => entry.phase.basic(),
            None => Phase::FINISHED,
        }
    }

    fn make_log_observer(&self) -> LogObserver {
        let log = self.log.clone();
        Arc::new(move |stream, line| log.log(stream, line))
    }

    fn emit_started(&self) {
        for observer in self.started_observers.lock().unwrap().iter() {
            observer();
        }
    }

    fn emit_phase_changed(&self, phase: Phase) {
        for observer in self.phase_observers.lock().unwrap().iter() {
            observer(phase);
        }
    }

    fn emit_finished(&self, success: bool) {
        for observer in self.finished_observers.lock().unwrap().iter() {
            observer(success);
        }
    }

    /// Drive every requested, not-yet-completed stage forward in order.
    /// Stops at the first failure. Runs a transient sweep afterwards
    /// regardless of outcome.
    pub async fn execute_async(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.failed.store(false, Ordering::Release);
        self.emit_started();
        self.running.store(true, Ordering::Release);
        self.cursor.store(-1, Ordering::Release);

        std::fs::create_dir_all(&self.builddir).or_else(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(e)
            }
        })?;

        let result = self.tick(cancel).await;

        self.running.store(false, Ordering::Release);
        if result.is_err() {
            self.failed.store(true, Ordering::Release);
        }
        self.release_transients();
        self.emit_finished(result.is_ok());

        result
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<()> {
        let mut pos: i64 = -1;

        loop {
            pos += 1;
            self.cursor.store(pos, Ordering::Release);

            if pos as usize >= self.entries.len() {
                return Ok(());
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Reborrow `self` immutably for the duration of the stage call,
            // so `pipeline: &Pipeline` can be handed to the stage while the
            // entries vector itself stays untouched (structural mutation
            // only happens via `attach`/`detach`, which are rejected once
            // the run has begun).
            let pipeline: &Pipeline = self;
            let entry = &pipeline.entries[pos as usize];

            if entry.stage.completed() {
                debug!(stage = %entry.stage.name(), "already completed, skipping");
                continue;
            }

            let basic_bits = entry.phase.basic().bits();
            if basic_bits & self.requested_mask.load(Ordering::Acquire) == 0 {
                debug!(stage = %entry.stage.name(), "phase not requested, skipping");
                continue;
            }

            self.emit_phase_changed(entry.phase.basic());
            info!(stage = %entry.stage.name(), phase = basic_bits, "executing stage");

            let stage_ref = entry.stage.as_ref();
            let result = stage_ref.execute_with_query_async(pipeline, cancel).await;

            match result {
                Ok(()) => {
                    entry.stage.set_completed(true);
                }
                Err(err) => {
                    warn!(stage = %entry.stage.name(), error = %err, "stage failed");
                    return Err(err);
                }
            }
        }
    }

    /// Drop every attached stage marked transient, from the end of the list
    /// backwards so earlier indices stay valid while later ones are
    /// removed.
    fn release_transients(&mut self) {
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            if self.entries[i].stage.transient() {
                self.entries.remove(i);
            }
        }
    }

    pub async fn register_addin(&mut self, addin: Arc<dyn PipelineAddin>) -> Result<()> {
        addin.load(self).await?;
        self.addins.lock().unwrap().push(addin);
        Ok(())
    }

    pub async fn unregister_addin(&mut self, addin: &Arc<dyn PipelineAddin>) {
        addin.unload(self).await;
        self.addins.lock().unwrap().retain(|a| !Arc::ptr_eq(a, addin));
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // `unload` is async and `Drop` isn't, so teardown can't run it here.
        // Callers are expected to `unregister_addin` everything they
        // registered before letting the pipeline go; this is a best-effort
        // tripwire for the case where they didn't.
        let remaining = self.addins.lock().unwrap().len();
        if remaining > 0 {
            warn!(remaining, "pipeline dropped with addins still registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageMkdirs;

    fn config() -> Configuration {
        Configuration::new("default")
    }

    #[tokio::test]
    async fn attach_orders_by_phase_then_priority_then_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new("proj", dir.path().to_path_buf(), config());

        let a = pipeline.attach(Phase::BUILD, 0, Box::new(StageMkdirs::new("a")));
        let b = pipeline.attach(Phase::PREPARE, 0, Box::new(StageMkdirs::new("b")));
        let c = pipeline.attach(Phase::BUILD, -1, Box::new(StageMkdirs::new("c")));

        let names: Vec<String> = pipeline.entries.iter().map(|e| e.stage.name()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
        assert!(a.is_valid() && b.is_valid() && c.is_valid());
    }

    #[tokio::test]
    async fn whence_orders_before_unmodified_after() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new("proj", dir.path().to_path_buf(), config());

        pipeline.attach(Phase::BUILD, 0, Box::new(StageMkdirs::new("during")));
        pipeline.attach(
            Phase::from_bits(Phase::BUILD.bits() | Phase::AFTER.bits()),
            0,
            Box::new(StageMkdirs::new("after")),
        );
        pipeline.attach(
            Phase::from_bits(Phase::BUILD.bits() | Phase::BEFORE.bits()),
            0,
            Box::new(StageMkdirs::new("before")),
        );

        let names: Vec<String> = pipeline.entries.iter().map(|e| e.stage.name()).collect();
        assert_eq!(names, vec!["before", "during", "after"]);
    }

    #[tokio::test]
    async fn request_phase_is_a_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new("proj", dir.path().to_path_buf(), config());

        pipeline.attach(Phase::PREPARE, 0, Box::new(StageMkdirs::new("prepare")));
        pipeline.attach(Phase::BUILD, 0, Box::new(StageMkdirs::new("build")));
        pipeline.attach(Phase::INSTALL, 0, Box::new(StageMkdirs::new("install")));

        pipeline.request_phase(Phase::BUILD);
        let cancel = CancellationToken::new();
        pipeline.execute_async(&cancel).await.unwrap();

        assert!(pipeline.get_stage_by_id(StageId::new(1)).unwrap().completed());
        assert!(pipeline.get_stage_by_id(StageId::new(2)).unwrap().completed());
        assert!(!pipeline.get_stage_by_id(StageId::new(3)).unwrap().completed());
    }

    #[tokio::test]
    async fn invalidate_phase_forces_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new("proj", dir.path().to_path_buf(), config());
        pipeline.attach(Phase::BUILD, 0, Box::new(StageMkdirs::new("build")));
        pipeline.request_phase(Phase::BUILD);

        let cancel = CancellationToken::new();
        pipeline.execute_async(&cancel).await.unwrap();
        assert!(pipeline.get_stage_by_id(StageId::new(1)).unwrap().completed());

        pipeline.invalidate_phase(Phase::BUILD);
        assert!(!pipeline.get_stage_by_id(StageId::new(1)).unwrap().completed());
    }

    #[tokio::test]
    async fn started_observer_fires_before_any_stage_runs() {
        use std::sync::atomic::AtomicUsize;

        struct Observing(crate::stage::StageBase, Arc<AtomicUsize>, Arc<AtomicBool>);
        #[async_trait::async_trait]
        impl Stage for Observing {
            fn base(&self) -> &crate::stage::StageBase {
                &self.0
            }
            fn execute(&self, _p: &Pipeline, _c: &CancellationToken) -> Result<()> {
                assert_eq!(
                    self.1.load(Ordering::Acquire),
                    1,
                    "started observer must have already fired once before execute"
                );
                self.2.store(true, Ordering::Release);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new("proj", dir.path().to_path_buf(), config());

        let starts = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicBool::new(false));
        pipeline.attach(
            Phase::PREPARE,
            0,
            Box::new(Observing(
                crate::stage::StageBase::new("observing"),
                starts.clone(),
                ran.clone(),
            )),
        );

        let starts_handle = starts.clone();
        pipeline.on_started(move || {
            starts_handle.fetch_add(1, Ordering::AcqRel);
        });
        pipeline.request_phase(Phase::PREPARE);

        let cancel = CancellationToken::new();
        pipeline.execute_async(&cancel).await.unwrap();

        assert_eq!(starts.load(Ordering::Acquire), 1);
        assert!(ran.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn transient_stages_are_released_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new("proj", dir.path().to_path_buf(), config());
        let stage = StageMkdirs::new("scratch");
        stage.set_transient(true);
        let id = pipeline.attach(Phase::PREPARE, 0, Box::new(stage));
        pipeline.request_phase(Phase::PREPARE);

        let cancel = CancellationToken::new();
        pipeline.execute_async(&cancel).await.unwrap();

        assert!(pipeline.get_stage_by_id(id).is_none());
    }

    #[tokio::test]
    async fn failure_halts_remaining_stages() {
        struct Failing(crate::stage::StageBase);
        #[async_trait::async_trait]
        impl Stage for Failing {
            fn base(&self) -> &crate::stage::StageBase {
                &self.0
            }
            fn execute(&self, _p: &Pipeline, _c: &CancellationToken) -> Result<()> {
                Err(Error::Internal("boom".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new("proj", dir.path().to_path_buf(), config());
        pipeline.attach(
            Phase::PREPARE,
            0,
            Box::new(Failing(crate::stage::StageBase::new("failing"))),
        );
        let after = pipeline.attach(Phase::BUILD, 0, Box::new(StageMkdirs::new("after")));
        pipeline.request_phase(Phase::BUILD);

        let cancel = CancellationToken::new();
        let result = pipeline.execute_async(&cancel).await;

        assert!(result.is_err());
        assert!(!pipeline.get_stage_by_id(after).unwrap().completed());
        assert_eq!(pipeline.current_phase(), Phase::FAILED);
    }
}
