//! The slice of a container engine the orchestrator and the initializer depend on.
//!
//! [Docker] implements it against a live daemon; tests substitute an in-memory engine.

use serde_derive::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fmt;

use crate::container::{CreateContainerOptions, RemoveContainerOptions};
use crate::errors::Error;
use crate::image::CreateImageOptions;
use crate::models::{ContainerCreateBody, ExecConfig, VolumeCreateOptions};
use crate::read::LogOutput;
use crate::Docker;

/// A command to run, either on the local host or inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// User to run as, when it differs from the default.
    pub user: Option<String>,
}

impl CommandLine {
    /// A command without arguments.
    pub fn new<S: Into<String>>(program: S) -> Self {
        CommandLine {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Builds `sh -c <script>`.
    pub fn shell<S: Into<String>>(script: S) -> Self {
        CommandLine::new("sh").arg("-c").arg(script)
    }

    /// Append an argument.
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program followed by the arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Exit code and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// The exit code; `-1` when the process was killed by a signal.
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Text to show when the command failed: standard error, or standard output when the tool
    /// writes its errors there.
    pub fn error_text(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.is_empty() {
            format!("exited with code {}", self.exit_code)
        } else {
            text.to_owned()
        }
    }

    /// Standard output and standard error together.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// What the orchestrator needs to know about an existing container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Whether the container is running.
    pub running: bool,
    /// Labels the container was created with.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// The container engine operations used during deployment.
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime {
    /// Whether a named volume exists.
    async fn volume_exists(&self, name: &str) -> Result<bool, Error>;

    /// Create a named volume.
    async fn create_volume(&self, name: &str, labels: HashMap<String, String>)
        -> Result<(), Error>;

    /// Pull an image reference.
    async fn pull_image(&self, reference: &str) -> Result<(), Error>;

    /// Look up a container by name; `None` when it does not exist.
    async fn container(&self, name: &str) -> Result<Option<ContainerSummary>, Error>;

    /// Create a container and return its id.
    async fn create_container(&self, name: &str, body: ContainerCreateBody)
        -> Result<String, Error>;

    /// Start a container. Starting a running container succeeds.
    async fn start_container(&self, id: &str) -> Result<(), Error>;

    /// Remove a container, stopping it first when it runs. Its volumes are kept.
    async fn remove_container(&self, id: &str) -> Result<(), Error>;

    /// Run a command inside a running container and wait for it to finish.
    async fn exec(&self, container: &str, command: &CommandLine) -> Result<CommandOutput, Error>;
}

impl<R: ContainerRuntime> ContainerRuntime for &R {
    async fn volume_exists(&self, name: &str) -> Result<bool, Error> {
        (**self).volume_exists(name).await
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), Error> {
        (**self).create_volume(name, labels).await
    }

    async fn pull_image(&self, reference: &str) -> Result<(), Error> {
        (**self).pull_image(reference).await
    }

    async fn container(&self, name: &str) -> Result<Option<ContainerSummary>, Error> {
        (**self).container(name).await
    }

    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<String, Error> {
        (**self).create_container(name, body).await
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        (**self).start_container(id).await
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        (**self).remove_container(id).await
    }

    async fn exec(&self, container: &str, command: &CommandLine) -> Result<CommandOutput, Error> {
        (**self).exec(container, command).await
    }
}

fn is_not_found(err: &Error) -> bool {
    matches!(
        err,
        Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl ContainerRuntime for Docker {
    async fn volume_exists(&self, name: &str) -> Result<bool, Error> {
        match self.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), Error> {
        Docker::create_volume(
            self,
            VolumeCreateOptions {
                name: name.to_owned(),
                labels,
            },
        )
        .await
        .map(|_| ())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), Error> {
        let messages = self
            .create_image(CreateImageOptions::from_reference(reference))
            .await?;
        if let Some(status) = messages.last().and_then(|m| m.status.as_deref()) {
            info!("{reference}: {status}");
        }
        Ok(())
    }

    async fn container(&self, name: &str) -> Result<Option<ContainerSummary>, Error> {
        match self.inspect_container(name).await {
            Ok(inspect) => Ok(Some(ContainerSummary {
                id: inspect.id.unwrap_or_else(|| name.to_owned()),
                running: inspect.state.and_then(|s| s.running).unwrap_or(false),
                labels: inspect.config.and_then(|c| c.labels).unwrap_or_default(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<String, Error> {
        let response = Docker::create_container(
            self,
            Some(CreateContainerOptions {
                name: name.to_owned(),
            }),
            body,
        )
        .await?;
        for warning in &response.warnings {
            warn!("creating container {name}: {warning}");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        Docker::start_container(self, id).await
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        Docker::remove_container(
            self,
            id,
            Some(RemoveContainerOptions {
                force: true,
                v: false,
            }),
        )
        .await
    }

    async fn exec(&self, container: &str, command: &CommandLine) -> Result<CommandOutput, Error> {
        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command.argv()),
            env: if command.env.is_empty() {
                None
            } else {
                Some(command.env.iter().map(|(k, v)| format!("{k}={v}")).collect())
            },
            user: command.user.clone(),
            working_dir: None,
        };

        let exec = self.create_exec(container, config).await?;
        let logs = self.start_exec(&exec.id).await?;

        let mut output = CommandOutput::default();
        for log in logs {
            match log {
                LogOutput::StdErr { message } => output.stderr.push_str(&message),
                other => output.stdout.push_str(&other.to_string()),
            }
        }

        let inspect = self.inspect_exec(&exec.id).await?;
        output.exit_code = inspect
            .exit_code
            .ok_or(Error::ExecExitCodeMissing { id: exec.id })?;
        Ok(output)
    }
}
