//! Command line front end: renders the descriptor, provisions the n8n container and runs the
//! initializer in it or against the local project directory.

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use n8n_deploy::descriptor::N8N_SERVICE;
use n8n_deploy::errors::Error;
use n8n_deploy::initializer::LocalTarget;
use n8n_deploy::interpolate::{DotEnv, EnvParameters, Layered};
use n8n_deploy::manifest::Manifest;
use n8n_deploy::scripts;
use n8n_deploy::state::StateStore;
use n8n_deploy::{
    resolve, Docker, InitReport, Initializer, InitializerConfig, Orchestrator, Provisioned,
    ResolvedDescriptor, RetryPolicy, ServiceDescriptor, ToolEnvironment, DEFAULT_TIMEOUT,
};

/// Host side of the shared files directory, relative to the project directory.
const LOCAL_FILES: &str = "local_files";
/// Host side of the scripts directory, relative to the project directory.
const SCRIPTS_DIR: &str = "python_scripts";
/// Host side of the requirements manifest, relative to the project directory.
const REQUIREMENTS: &str = "requirements.txt";

#[derive(Parser, Debug)]
#[command(
    name = "n8n-deploy",
    version,
    about = "Deploy and initialize a self-hosted n8n instance on docker"
)]
struct Cli {
    /// Compose-style descriptor file; the built-in n8n descriptor when omitted
    #[arg(long, short, global = true, env = "N8N_DEPLOY_DESCRIPTOR")]
    descriptor: Option<PathBuf>,

    /// Project directory of the built-in descriptor
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Docker API timeout in seconds
    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT)]
    timeout: u64,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve the descriptor and print it as JSON
    Render,
    /// Provision the service, then initialize it inside its container
    Up(UpArgs),
    /// Run only the initializer
    Init(InitArgs),
    /// Show where the service stands
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct RetryArgs {
    /// Attempts for the install stages, the first included
    #[arg(long, default_value_t = 3)]
    attempts: u32,

    /// Delay before the first retry, in seconds; doubled for every further one
    #[arg(long, default_value_t = 2)]
    retry_delay: u64,
}

impl RetryArgs {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.max(1),
            base_delay: Duration::from_secs(self.retry_delay),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
struct UpArgs {
    /// Provision only
    #[arg(long)]
    skip_init: bool,

    #[command(flatten)]
    retry: RetryArgs,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Run against the local filesystem instead of inside the container
    #[arg(long)]
    local: bool,

    /// Shared files directory; defaults to ./local_files locally, /data/files in the container
    #[arg(long)]
    files_dir: Option<PathBuf>,

    /// Requirements manifest; defaults to ./requirements.txt locally, /data/requirements.txt
    /// in the container
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Service to initialize
    #[arg(long, default_value = N8N_SERVICE)]
    service: String,

    #[command(flatten)]
    retry: RetryArgs,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Service to inspect
    #[arg(long, default_value = N8N_SERVICE)]
    service: String,

    /// Print JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{e}");
        process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let descriptor = match &cli.descriptor {
        Some(path) => ServiceDescriptor::from_path(path)?,
        None => ServiceDescriptor::n8n().with_project_dir(&cli.project_dir),
    };
    let project_dir = descriptor
        .project_dir
        .clone()
        .unwrap_or_else(|| cli.project_dir.clone());

    match &cli.cmd {
        Commands::Render => {
            let resolved = resolve_descriptor(&descriptor, &project_dir)?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        Commands::Up(args) => {
            let resolved = resolve_descriptor(&descriptor, &project_dir)?;
            let orchestrator = orchestrator(&cli, &project_dir)?;
            for provisioned in orchestrator.provision(&resolved).await? {
                info!(
                    "service {} provisioned in container {}",
                    provisioned.service(),
                    provisioned.container()
                );
                if args.skip_init {
                    continue;
                }
                audit_scripts(&project_dir, &project_dir.join(REQUIREMENTS));
                let config = InitializerConfig {
                    retry: args.retry.policy(),
                    ..Default::default()
                };
                let report = orchestrator.initialize(&provisioned, config).await?;
                summarize(&report);
            }
        }
        Commands::Init(args) if args.local => {
            let files_dir = args
                .files_dir
                .clone()
                .unwrap_or_else(|| project_dir.join(LOCAL_FILES));
            let manifest = args
                .manifest
                .clone()
                .unwrap_or_else(|| project_dir.join(REQUIREMENTS));
            audit_scripts(&project_dir, &manifest);

            let config = InitializerConfig {
                retry: args.retry.policy(),
                ..InitializerConfig::for_files_dir(files_dir, manifest)
            };
            let provisioned = Provisioned::assumed(args.service.as_str(), project_dir.as_path());
            let result = Initializer::new(LocalTarget, config)
                .run(&provisioned)
                .await;
            let state = StateStore::new(&project_dir);
            if let Err(e) = state.record(&provisioned, &result) {
                warn!(
                    "could not record the initializer outcome in {}: {e}",
                    state.path().display()
                );
            }
            summarize(&result?);
        }
        Commands::Init(args) => {
            let orchestrator = orchestrator(&cli, &project_dir)?;
            let provisioned = orchestrator
                .attach(&args.service, project_dir.as_path())
                .await?;
            audit_scripts(&project_dir, &project_dir.join(REQUIREMENTS));

            let mut config = InitializerConfig::default();
            if let Some(files_dir) = &args.files_dir {
                config = InitializerConfig::for_files_dir(files_dir, config.manifest);
            }
            if let Some(manifest) = &args.manifest {
                config.manifest = manifest.clone();
            }
            config.retry = args.retry.policy();

            let report = orchestrator.initialize(&provisioned, config).await?;
            summarize(&report);
        }
        Commands::Status(args) => {
            let status = orchestrator(&cli, &project_dir)?
                .status(&args.service)
                .await?;
            if args.json {
                println!("{}", serde_json::to_string(&status)?);
            } else {
                println!("{}: {status}", args.service);
            }
        }
    }
    Ok(())
}

fn resolve_descriptor(
    descriptor: &ServiceDescriptor,
    project_dir: &Path,
) -> Result<ResolvedDescriptor, Error> {
    let dotenv = DotEnv::load(project_dir)?;
    let env = EnvParameters;
    let source = Layered::new().with(&env).with(&dotenv);
    resolve(descriptor, &source)
}

fn orchestrator(cli: &Cli, project_dir: &Path) -> Result<Orchestrator<Docker>, Error> {
    let docker = Docker::connect_with_local_defaults()?
        .with_timeout(Duration::from_secs(cli.timeout));
    Ok(Orchestrator::new(docker)
        .with_tool_environment(ToolEnvironment::default())
        .with_state(StateStore::new(project_dir)))
}

fn audit_scripts(project_dir: &Path, manifest: &Path) {
    let manifest = match fs::read_to_string(manifest).map_err(Error::from) {
        Ok(contents) => Manifest::parse(&contents),
        Err(e) => Err(e),
    };
    let findings = manifest.and_then(|m| scripts::audit(&project_dir.join(SCRIPTS_DIR), &m));
    match findings {
        Ok(findings) => {
            for finding in findings {
                warn!(
                    "{}:{} imports `{}`, but no requirement provides `{}`",
                    finding.script.display(),
                    finding.line,
                    finding.module,
                    finding.distribution
                );
            }
        }
        Err(e) => warn!("skipping script audit: {e}"),
    }
}

fn summarize(report: &InitReport) {
    for stage in &report.stages {
        info!("{}: {:?}, {}", stage.stage, stage.outcome, stage.detail);
    }
    for assignment in report.tool_environment.assignments() {
        info!("{assignment}");
    }
}
