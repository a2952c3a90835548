//! Post-deployment initializer: the one-shot steps that make a freshly provisioned n8n
//! instance usable by its python Code nodes.
//!
//! The stages run in a fixed order and stop at the first failure. Completed stages are not
//! rolled back; each of them only changes what is not already in place, so a run after a
//! failure, or after a success, converges instead of repeating work.
//!
//! 1. [Permissions](InitStage::Permissions): owner `1000:1000` and mode `0755` on the shared
//!    files directory.
//! 2. [System package](InitStage::SystemPackage): install `ffmpeg` unless it is already on
//!    `PATH`.
//! 3. [Tool environment](InitStage::ToolEnvironment): check that the binary is where the
//!    [`ToolEnvironment`] says and that it runs, then write the environment file.
//! 4. [Language dependencies](InitStage::LanguageDependencies): install the python
//!    requirements manifest.

pub mod permissions;
pub mod target;

use serde_derive::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Error, InitStage};
use crate::manifest::{is_transient, Manifest};
use crate::orchestrator::Provisioned;
use crate::resolve::EnvAssignment;
use crate::runtime::{CommandLine, CommandOutput};

pub use self::permissions::{Owner, PermissionReport};
pub use self::target::{ContainerTarget, InitTarget, LocalTarget};

/// Shared files directory inside the container.
pub const FILES_DIR: &str = "/data/files";

/// Python requirements manifest inside the container.
pub const MANIFEST_PATH: &str = "/data/requirements.txt";

/// Environment file written by the tool environment stage.
pub const TOOL_ENV_FILE: &str = ".tool-env";

/// Location of the media tool, and the variables that point python libraries at it.
///
/// The same assignments are given to the container at creation, so the service process sees
/// them for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEnvironment {
    /// Absolute path of the binary.
    pub binary: PathBuf,
    /// Variables set to the binary path.
    pub variables: Vec<String>,
}

impl Default for ToolEnvironment {
    fn default() -> Self {
        ToolEnvironment::ffmpeg("/usr/bin/ffmpeg")
    }
}

impl ToolEnvironment {
    /// `FFMPEG_PATH` and `IMAGEIO_FFMPEG_EXE` pointing at `binary`.
    pub fn ffmpeg<P: Into<PathBuf>>(binary: P) -> Self {
        ToolEnvironment {
            binary: binary.into(),
            variables: vec![
                String::from("FFMPEG_PATH"),
                String::from("IMAGEIO_FFMPEG_EXE"),
            ],
        }
    }

    /// The binary name looked up on `PATH`.
    pub fn name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The environment assignments.
    pub fn assignments(&self) -> Vec<EnvAssignment> {
        self.variables
            .iter()
            .map(|key| EnvAssignment {
                key: key.clone(),
                value: self.binary.display().to_string(),
            })
            .collect()
    }

    /// The assignments as an env file, one `KEY=value` per line.
    pub fn render(&self) -> String {
        self.assignments()
            .iter()
            .map(|a| format!("{a}\n"))
            .collect()
    }
}

/// Bounded exponential backoff for installer commands.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first included.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for every further one.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn never() -> Self {
        RetryPolicy {
            attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Settings for an initializer run. The defaults describe the n8n container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializerConfig {
    /// Directory shared between n8n and its scripts.
    pub files_dir: PathBuf,
    /// Owner given to the files directory.
    pub owner: Owner,
    /// Mode given to the files directory and everything in it.
    pub mode: u32,
    /// System package providing the media tool.
    pub package: String,
    /// Package manager invocation; the package name is appended.
    pub install_command: CommandLine,
    /// The media tool.
    pub tool: ToolEnvironment,
    /// Where the tool environment is written, `None` to skip.
    pub env_file: Option<PathBuf>,
    /// The python requirements manifest.
    pub manifest: PathBuf,
    /// Installer invocation; the manifest path is appended.
    pub pip_command: CommandLine,
    /// Retries for the two install stages.
    pub retry: RetryPolicy,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        InitializerConfig::for_files_dir(FILES_DIR, MANIFEST_PATH)
    }
}

impl InitializerConfig {
    /// Defaults with another files directory and manifest, the env file kept inside the files
    /// directory.
    pub fn for_files_dir<P: Into<PathBuf>, M: Into<PathBuf>>(files_dir: P, manifest: M) -> Self {
        let files_dir = files_dir.into();
        InitializerConfig {
            env_file: Some(files_dir.join(TOOL_ENV_FILE)),
            files_dir,
            owner: Owner::NODE,
            mode: 0o755,
            package: String::from("ffmpeg"),
            install_command: CommandLine::new("apk").args(["add", "--no-cache"]),
            tool: ToolEnvironment::default(),
            manifest: manifest.into(),
            pip_command: CommandLine::new("pip").args(["install", "--no-cache-dir", "-r"]),
            retry: RetryPolicy::default(),
        }
    }
}

/// Whether a stage changed anything.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    /// Something was installed, written or changed.
    Changed,
    /// Everything was already in place.
    Unchanged,
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// The stage.
    pub stage: InitStage,
    /// What it did.
    pub outcome: StageOutcome,
    /// One-line summary.
    pub detail: String,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitReport {
    /// Per-stage outcome, in execution order.
    pub stages: Vec<StageReport>,
    /// The verified tool environment.
    pub tool_environment: ToolEnvironment,
}

impl InitReport {
    /// Whether any stage changed something.
    pub fn changed(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.outcome == StageOutcome::Changed)
    }

    /// The outcome of `stage`.
    pub fn outcome(&self, stage: InitStage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.outcome)
    }
}

/// Runs the four stages against an [`InitTarget`].
#[derive(Debug)]
pub struct Initializer<T> {
    target: T,
    config: InitializerConfig,
}

impl<T: InitTarget> Initializer<T> {
    /// An initializer for `target`.
    pub fn new(target: T, config: InitializerConfig) -> Self {
        Initializer { target, config }
    }

    /// The settings in use.
    pub fn config(&self) -> &InitializerConfig {
        &self.config
    }

    /// Run every stage in order against a provisioned deployment.
    pub async fn run(&self, provisioned: &Provisioned) -> Result<InitReport, Error> {
        info!("initializing service {}", provisioned.service());
        let mut stages = Vec::with_capacity(InitStage::ALL.len());

        for stage in InitStage::ALL {
            info!("stage {stage}: starting");
            let report = match stage {
                InitStage::Permissions => self.permissions().await,
                InitStage::SystemPackage => self.system_package().await,
                InitStage::ToolEnvironment => self.tool_environment().await,
                InitStage::LanguageDependencies => self.language_dependencies().await,
            }
            .inspect_err(|e| error!("stage {stage}: {e}"))?;
            info!("stage {stage}: {}", report.detail);
            stages.push(report);
        }

        Ok(InitReport {
            stages,
            tool_environment: self.config.tool.clone(),
        })
    }

    async fn permissions(&self) -> Result<StageReport, Error> {
        let config = &self.config;
        let report = self
            .target
            .apply_permissions(&config.files_dir, config.owner, config.mode)
            .await
            .map_err(|e| match e {
                e @ Error::PermissionSetup { .. } => e,
                other => Error::PermissionSetup {
                    path: config.files_dir.display().to_string(),
                    message: other.to_string(),
                },
            })?;

        Ok(StageReport {
            stage: InitStage::Permissions,
            outcome: if report.changed > 0 {
                StageOutcome::Changed
            } else {
                StageOutcome::Unchanged
            },
            detail: format!(
                "{} of {} entries under {} changed",
                report.changed,
                report.examined,
                config.files_dir.display()
            ),
        })
    }

    async fn system_package(&self) -> Result<StageReport, Error> {
        let package = &self.config.package;
        let failed = |message: String| Error::DependencyInstall {
            package: package.clone(),
            message,
        };

        let name = self.config.tool.name();
        let present = self
            .target
            .run(&lookup(&name))
            .await
            .map_err(|e| failed(e.to_string()))?;
        if present.success() {
            return Ok(StageReport {
                stage: InitStage::SystemPackage,
                outcome: StageOutcome::Unchanged,
                detail: format!("{name} already at {}", present.stdout.trim()),
            });
        }

        let install = self.config.install_command.clone().arg(package.as_str());
        let output = self
            .run_with_retry(&install)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !output.success() {
            return Err(failed(output.error_text()));
        }

        Ok(StageReport {
            stage: InitStage::SystemPackage,
            outcome: StageOutcome::Changed,
            detail: format!("installed {package}"),
        })
    }

    async fn tool_environment(&self) -> Result<StageReport, Error> {
        let tool = &self.config.tool;
        let name = tool.name();
        let failed = |message: String| Error::ToolExport {
            binary: name.clone(),
            message,
        };

        let located = self
            .target
            .run(&lookup(&name))
            .await
            .map_err(|e| failed(e.to_string()))?;
        let found = located.stdout.trim();
        if !located.success() || found.is_empty() {
            return Err(failed(String::from("not found on PATH")));
        }
        if Path::new(found) != tool.binary {
            return Err(failed(format!(
                "found at {found}, expected {}",
                tool.binary.display()
            )));
        }

        let version = self
            .target
            .run(&CommandLine::new(tool.binary.display().to_string()).arg("-version"))
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !version.success() {
            return Err(failed(version.error_text()));
        }
        if let Some(line) = version.stdout.lines().next() {
            debug!("{line}");
        }

        let Some(env_file) = &self.config.env_file else {
            return Ok(StageReport {
                stage: InitStage::ToolEnvironment,
                outcome: StageOutcome::Unchanged,
                detail: format!("{} verified", tool.binary.display()),
            });
        };

        let contents = tool.render();
        let existing = self
            .target
            .read_file(env_file)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if existing.as_deref() == Some(contents.as_str()) {
            return Ok(StageReport {
                stage: InitStage::ToolEnvironment,
                outcome: StageOutcome::Unchanged,
                detail: format!(
                    "{} verified, {} up to date",
                    tool.binary.display(),
                    env_file.display()
                ),
            });
        }

        self.target
            .write_file(env_file, &contents)
            .await
            .map_err(|e| failed(e.to_string()))?;
        // keep the file conforming, otherwise the next permission pass reports a change
        self.target
            .apply_permissions(env_file, self.config.owner, self.config.mode)
            .await
            .map_err(|e| failed(e.to_string()))?;

        Ok(StageReport {
            stage: InitStage::ToolEnvironment,
            outcome: StageOutcome::Changed,
            detail: format!(
                "{} verified, wrote {}",
                tool.binary.display(),
                env_file.display()
            ),
        })
    }

    async fn language_dependencies(&self) -> Result<StageReport, Error> {
        let path = &self.config.manifest;
        let unresolved = |message: String| Error::DependencyResolution {
            requirement: None,
            message,
        };

        let contents = self
            .target
            .read_file(path)
            .await
            .map_err(|e| unresolved(format!("cannot read {}: {e}", path.display())))?
            .ok_or_else(|| unresolved(format!("manifest {} not found", path.display())))?;
        let manifest = Manifest::parse(&contents)?;
        if manifest.is_empty() {
            return Ok(StageReport {
                stage: InitStage::LanguageDependencies,
                outcome: StageOutcome::Unchanged,
                detail: format!("{} lists no requirements", path.display()),
            });
        }

        let install = self
            .config
            .pip_command
            .clone()
            .arg(path.display().to_string());
        let output = self
            .run_with_retry(&install)
            .await
            .map_err(|e| unresolved(e.to_string()))?;
        if !output.success() {
            return Err(Error::DependencyResolution {
                requirement: manifest.failing_requirement(&output.combined()),
                message: output.error_text(),
            });
        }

        let installed = output
            .stdout
            .lines()
            .find_map(|l| l.strip_prefix("Successfully installed "));
        Ok(StageReport {
            stage: InitStage::LanguageDependencies,
            outcome: if installed.is_some() {
                StageOutcome::Changed
            } else {
                StageOutcome::Unchanged
            },
            detail: match installed {
                Some(packages) => format!("installed {packages}"),
                None => format!(
                    "{} requirement(s) already satisfied",
                    manifest.requirements.len()
                ),
            },
        })
    }

    async fn run_with_retry(&self, command: &CommandLine) -> Result<CommandOutput, Error> {
        let retry = self.config.retry;
        let mut attempt = 1;
        loop {
            let output = self.target.run(command).await?;
            if output.success()
                || attempt >= retry.attempts
                || !is_transient(&output.combined())
            {
                return Ok(output);
            }
            let delay = retry.delay(attempt);
            warn!(
                "`{command}` failed on attempt {attempt}/{}, retrying in {delay:?}: {}",
                retry.attempts,
                output.error_text()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn lookup(name: &str) -> CommandLine {
    CommandLine::shell(r#"command -v "$1""#).args(["sh", name])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_environment_points_both_variables_at_the_binary() {
        let tool = ToolEnvironment::default();
        assert_eq!(tool.name(), "ffmpeg");
        assert_eq!(
            tool.render(),
            "FFMPEG_PATH=/usr/bin/ffmpeg\nIMAGEIO_FFMPEG_EXE=/usr/bin/ffmpeg\n"
        );
    }

    #[test]
    fn retry_delays_double_up_to_the_cap() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay(1), Duration::from_secs(2));
        assert_eq!(retry.delay(2), Duration::from_secs(4));
        assert_eq!(retry.delay(3), Duration::from_secs(8));
        assert_eq!(retry.delay(10), Duration::from_secs(30));
        assert_eq!(retry.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn default_config_matches_the_container_layout() {
        let config = InitializerConfig::default();
        assert_eq!(config.files_dir, PathBuf::from("/data/files"));
        assert_eq!(config.env_file, Some(PathBuf::from("/data/files/.tool-env")));
        assert_eq!(config.owner, Owner { uid: 1000, gid: 1000 });
        assert_eq!(config.mode, 0o755);
        assert_eq!(
            config.install_command.clone().arg("ffmpeg").to_string(),
            "apk add --no-cache ffmpeg"
        );
        assert_eq!(
            config
                .pip_command
                .clone()
                .arg(config.manifest.display().to_string())
                .to_string(),
            "pip install --no-cache-dir -r /data/requirements.txt"
        );
    }
}
