//! Command-line driver for the build pipeline engine.

mod demo_addin;

use std::path::PathBuf;
use std::sync::Arc;

use buildpipe_core::{Configuration, Phase, Pipeline};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use demo_addin::AutotoolsAddin;

#[derive(Parser)]
#[command(name = "buildpipe")]
#[command(about = "Phase-ordered build pipeline engine", long_about = None)]
struct Cli {
    /// Project source directory
    #[arg(long, default_value = ".")]
    srcdir: PathBuf,

    /// Path to a project build-configuration file, INI-style
    #[arg(long)]
    config: Option<PathBuf>,

    /// Which configuration id to build, if `--config` defines several
    #[arg(long, default_value = "default")]
    configuration: String,

    #[command(subcommand)]
    command: Commands,
}

const PHASE_NAMES: &[&str] = &[
    "prepare",
    "downloads",
    "dependencies",
    "autogen",
    "configure",
    "build",
    "install",
    "export",
    "final",
];

#[derive(Subcommand)]
enum Commands {
    /// List the basic phases a stage can be attached to, in order
    Phases,
    /// Run the pipeline up to and including a phase
    Build {
        /// Phase to build up to: prepare, downloads, dependencies, autogen,
        /// configure, build, install, export, final
        #[arg(default_value = "build")]
        phase: String,
    },
    /// Invalidate a phase so the next build re-runs it
    Clean {
        #[arg(default_value = "build")]
        phase: String,
    },
    /// Parse and print a project's build-configuration file
    Validate {
        /// Path to the configuration file
        path: PathBuf,
    },
}

fn parse_phase(name: &str) -> anyhow::Result<Phase> {
    let phase = match name {
        "prepare" => Phase::PREPARE,
        "downloads" => Phase::DOWNLOADS,
        "dependencies" => Phase::DEPENDENCIES,
        "autogen" => Phase::AUTOGEN,
        "configure" => Phase::CONFIGURE,
        "build" => Phase::BUILD,
        "install" => Phase::INSTALL,
        "export" => Phase::EXPORT,
        "final" => Phase::FINAL,
        other => anyhow::bail!("unrecognized phase '{other}'"),
    };
    Ok(phase)
}

async fn load_configuration(cli: &Cli) -> anyhow::Result<Configuration> {
    let Some(path) = &cli.config else {
        return Ok(Configuration::new(cli.configuration.clone()));
    };

    let text = tokio::fs::read_to_string(path).await?;
    let mut configs = buildpipe_config::parse_project_config(&text)?;

    let index = configs
        .iter()
        .position(|c| c.id == cli.configuration)
        .ok_or_else(|| anyhow::anyhow!("no configuration named '{}' in {}", cli.configuration, path.display()))?;

    Ok(configs.swap_remove(index))
}

async fn build_pipeline(cli: &Cli) -> anyhow::Result<Pipeline> {
    let configuration = load_configuration(cli).await?;
    let srcdir = std::fs::canonicalize(&cli.srcdir).unwrap_or_else(|_| cli.srcdir.clone());

    let mut pipeline = Pipeline::new("buildpipe-cli", srcdir, configuration);
    pipeline.register_addin(Arc::new(AutotoolsAddin::new())).await?;
    Ok(pipeline)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Phases => {
            for name in PHASE_NAMES {
                println!("{name}");
            }
        }
        Commands::Build { phase } => {
            let target = parse_phase(phase)?;
            let mut pipeline = build_pipeline(&cli).await?;

            pipeline.on_phase_changed(|phase| info!(phase = phase.bits(), "entering phase"));

            pipeline.request_phase(target);

            let cancel = CancellationToken::new();
            pipeline.execute_async(&cancel).await?;

            info!("build finished");
        }
        Commands::Clean { phase } => {
            let target = parse_phase(phase)?;
            let pipeline = build_pipeline(&cli).await?;
            pipeline.invalidate_phase(target);
            info!(phase = %phase, "invalidated");
        }
        Commands::Validate { path } => {
            let text = tokio::fs::read_to_string(path).await?;
            let configs = buildpipe_config::parse_project_config(&text)?;
            for config in &configs {
                println!("{}: runtime={:?} parallelism={}", config.id, config.runtime_id, config.parallelism);
            }
            info!(count = configs.len(), "configurations parsed");
        }
    }

    Ok(())
}
