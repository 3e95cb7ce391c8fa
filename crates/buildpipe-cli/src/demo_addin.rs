//! An autotools-flavored demo addin: autogen, configure, build, install.

use async_trait::async_trait;
use buildpipe_core::{
    run_launcher, AddinTracker, Error, Phase, Pipeline, PipelineAddin, Result, Stage, StageBase,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Checks for a `configure` script in the source tree; skips the autogen
/// step if one is already present.
struct AutogenStage {
    base: StageBase,
}

#[async_trait]
impl Stage for AutogenStage {
    fn base(&self) -> &StageBase {
        &self.base
    }

    async fn query(&self, pipeline: &Pipeline, _cancel: &CancellationToken) {
        let configure = pipeline.build_srcdir_path("configure");
        self.set_completed(configure.is_file());
    }

    async fn execute_async(&self, pipeline: &Pipeline, cancel: &CancellationToken) -> Result<()> {
        let mut launcher = pipeline.create_launcher()?;
        launcher.set_cwd(pipeline.srcdir());
        launcher.push_argv("autoreconf");
        launcher.push_argv("-i");
        run_launcher(self, launcher, cancel).await
    }
}

/// Runs `configure`, skipping it if a `Makefile` already exists in the
/// build directory. Re-checked on every run via `query`, so
/// `invalidate_phase` forces a real re-configure instead of trusting a
/// flag set once at load time.
struct ConfigureStage {
    base: StageBase,
}

#[async_trait]
impl Stage for ConfigureStage {
    fn base(&self) -> &StageBase {
        &self.base
    }

    async fn query(&self, pipeline: &Pipeline, _cancel: &CancellationToken) {
        let makefile = pipeline.build_builddir_path("Makefile");
        self.set_completed(makefile.is_file());
    }

    async fn execute_async(&self, pipeline: &Pipeline, cancel: &CancellationToken) -> Result<()> {
        let mut launcher = pipeline.create_launcher()?;
        launcher.push_argv(pipeline.build_srcdir_path("configure").display().to_string());

        if let Some(config_opts) = &pipeline.configuration().config_opts {
            match shell_words::split(config_opts) {
                Ok(args) => {
                    launcher.push_args(args);
                }
                Err(err) => {
                    warn!(%err, "could not parse config-opts, running configure without them");
                }
            }
        }

        run_launcher(self, launcher, cancel).await
    }
}

/// Runs `make <target>`, with `-jN` derived from the configuration's
/// parallelism setting.
struct MakeStage {
    base: StageBase,
    target: &'static str,
}

#[async_trait]
impl Stage for MakeStage {
    fn base(&self) -> &StageBase {
        &self.base
    }

    async fn execute_async(&self, pipeline: &Pipeline, cancel: &CancellationToken) -> Result<()> {
        let mut launcher = pipeline.create_launcher()?;
        launcher.push_argv("make");
        launcher.push_argv(self.target);
        launcher.push_argv(format!("-j{}", pipeline.configuration().job_count()));
        run_launcher(self, launcher, cancel).await
    }
}

/// Ensures the build directory exists before anything else runs. Nothing
/// more — later stages in the set are responsible for anything beyond
/// having a directory to build into.
pub struct PrepareStage {
    base: StageBase,
}

impl PrepareStage {
    pub fn new() -> Self {
        Self {
            base: StageBase::new("prepare"),
        }
    }
}

impl Default for PrepareStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for PrepareStage {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn execute(&self, pipeline: &Pipeline, _cancel: &CancellationToken) -> Result<()> {
        if !pipeline.builddir().is_dir() {
            std::fs::create_dir_all(pipeline.builddir()).map_err(Error::Filesystem)?;
        }
        Ok(())
    }
}

/// Attaches the autotools-flavored stage set (prepare, autogen, configure,
/// build, install) when loaded.
#[derive(Default)]
pub struct AutotoolsAddin {
    tracker: AddinTracker,
}

impl AutotoolsAddin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineAddin for AutotoolsAddin {
    async fn load(&self, pipeline: &mut Pipeline) -> Result<()> {
        let id = pipeline.attach(Phase::PREPARE, 0, Box::new(PrepareStage::new()));
        self.tracker.track(id);

        let id = pipeline.attach(
            Phase::AUTOGEN,
            0,
            Box::new(AutogenStage {
                base: StageBase::new("autoreconf"),
            }),
        );
        self.tracker.track(id);

        let id = pipeline.attach(
            Phase::AUTOGEN | Phase::AFTER,
            0,
            Box::new(ConfigureStage {
                base: StageBase::new("configure"),
            }),
        );
        self.tracker.track(id);

        let id = pipeline.attach(
            Phase::BUILD,
            0,
            Box::new(MakeStage {
                base: StageBase::new("make all"),
                target: "all",
            }),
        );
        self.tracker.track(id);

        let id = pipeline.attach(
            Phase::INSTALL,
            0,
            Box::new(MakeStage {
                base: StageBase::new("make install"),
                target: "install",
            }),
        );
        self.tracker.track(id);

        Ok(())
    }

    async fn unload(&self, pipeline: &mut Pipeline) {
        self.tracker.detach_all(pipeline);
    }
}
