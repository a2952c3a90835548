//! Where initializer stages execute: the local filesystem, or a running container reached
//! through exec.

use tokio::process::Command;

use std::io;
use std::path::Path;

use super::permissions::{self, Owner, PermissionReport};
use crate::errors::Error;
use crate::runtime::{CommandLine, CommandOutput, ContainerRuntime};

/// The operations the initializer stages are built from.
#[allow(async_fn_in_trait)]
pub trait InitTarget {
    /// Recursively give `path` the owner and mode given, touching only entries that differ.
    async fn apply_permissions(
        &self,
        path: &Path,
        owner: Owner,
        mode: u32,
    ) -> Result<PermissionReport, Error>;

    /// Run a command to completion.
    async fn run(&self, command: &CommandLine) -> Result<CommandOutput, Error>;

    /// Read a text file; `None` when it does not exist.
    async fn read_file(&self, path: &Path) -> Result<Option<String>, Error>;

    /// Create or replace a text file.
    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), Error>;
}

impl<T: InitTarget> InitTarget for &T {
    async fn apply_permissions(
        &self,
        path: &Path,
        owner: Owner,
        mode: u32,
    ) -> Result<PermissionReport, Error> {
        (**self).apply_permissions(path, owner, mode).await
    }

    async fn run(&self, command: &CommandLine) -> Result<CommandOutput, Error> {
        (**self).run(command).await
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>, Error> {
        (**self).read_file(path).await
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), Error> {
        (**self).write_file(path, contents).await
    }
}

/// Runs stages on this host, against the mounted filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalTarget;

impl InitTarget for LocalTarget {
    async fn apply_permissions(
        &self,
        path: &Path,
        owner: Owner,
        mode: u32,
    ) -> Result<PermissionReport, Error> {
        let root = path.to_path_buf();
        tokio::task::spawn_blocking(move || permissions::apply(&root, owner, mode))
            .await
            .map_err(|e| Error::PermissionSetup {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
    }

    async fn run(&self, command: &CommandLine) -> Result<CommandOutput, Error> {
        if let Some(user) = &command.user {
            debug!("ignoring user {user} for local command {command}");
        }
        debug!("running {command}");
        let output = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .output()
            .await?;
        Ok(CommandOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>, Error> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), Error> {
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}

/// User commands run as inside the container, unless the command names another.
pub const CONTAINER_USER: &str = "root";

const PERMISSIONS_SCRIPT: &str = r#"test -e "$1" || { echo "no such file or directory" >&2; exit 2; }
examined=$(find "$1" ! -type l | wc -l)
pending=$(find "$1" ! -type l \( ! -user "$2" -o ! -group "$3" -o ! -perm "$4" \) | wc -l)
if [ "$pending" -gt 0 ]; then
  find "$1" ! -type l \( ! -user "$2" -o ! -group "$3" \) -exec chown "$2:$3" {} +
  find "$1" ! -type l ! -perm "$4" -exec chmod "$4" {} +
  left=$(find "$1" ! -type l \( ! -user "$2" -o ! -group "$3" -o ! -perm "$4" \) | wc -l)
  if [ "$left" -gt 0 ]; then
    echo "$left entries are still not owned by $2:$3 with mode $4" >&2
    exit 1
  fi
fi
echo "$examined $pending""#;

/// Runs stages inside a running container through the engine's exec API.
#[derive(Debug)]
pub struct ContainerTarget<R> {
    runtime: R,
    container: String,
}

impl<R: ContainerRuntime> ContainerTarget<R> {
    /// A target for container `container`, which must be running.
    pub fn new<S: Into<String>>(runtime: R, container: S) -> Self {
        ContainerTarget {
            runtime,
            container: container.into(),
        }
    }

    /// The container commands are executed in.
    pub fn container(&self) -> &str {
        &self.container
    }

    fn script(script: &str, args: &[&str]) -> CommandLine {
        CommandLine::shell(script)
            .arg("sh")
            .args(args.iter().copied())
    }
}

fn io_failure(path: &Path, output: &CommandOutput) -> Error {
    Error::IOError {
        err: io::Error::other(format!("{}: {}", path.display(), output.error_text())),
    }
}

impl<R: ContainerRuntime> InitTarget for ContainerTarget<R> {
    async fn apply_permissions(
        &self,
        path: &Path,
        owner: Owner,
        mode: u32,
    ) -> Result<PermissionReport, Error> {
        let display = path.display().to_string();
        let failed = |message: String| Error::PermissionSetup {
            path: display.clone(),
            message,
        };

        let uid = owner.uid.to_string();
        let gid = owner.gid.to_string();
        let mode = format!("{mode:o}");
        let command = Self::script(PERMISSIONS_SCRIPT, &[&display, &uid, &gid, &mode]);

        let output = self.run(&command).await?;
        if !output.success() {
            return Err(failed(output.error_text()));
        }

        let counts: Vec<usize> = output
            .stdout
            .lines()
            .last()
            .unwrap_or_default()
            .split_whitespace()
            .filter_map(|n| n.parse().ok())
            .collect();
        match counts.as_slice() {
            [examined, changed] => Ok(PermissionReport {
                examined: *examined,
                changed: *changed,
            }),
            _ => Err(failed(format!(
                "unexpected output from permission script: {}",
                output.stdout.trim()
            ))),
        }
    }

    async fn run(&self, command: &CommandLine) -> Result<CommandOutput, Error> {
        let mut command = command.clone();
        if command.user.is_none() {
            command.user = Some(CONTAINER_USER.to_owned());
        }
        debug!("running {command} in container {}", self.container);
        self.runtime.exec(&self.container, &command).await
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>, Error> {
        let display = path.display().to_string();
        let command = Self::script(
            r#"test -e "$1" || exit 3; cat "$1""#,
            &[&display],
        );
        let output = self.run(&command).await?;
        match output.exit_code {
            0 => Ok(Some(output.stdout)),
            3 => Ok(None),
            _ => Err(io_failure(path, &output)),
        }
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), Error> {
        let display = path.display().to_string();
        let command = Self::script(r#"printf '%s' "$CONTENTS" > "$1""#, &[&display])
            .env("CONTENTS", contents);
        let output = self.run(&command).await?;
        if output.success() {
            Ok(())
        } else {
            Err(io_failure(path, &output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_target_runs_commands() {
        let output = LocalTarget
            .run(&CommandLine::shell("echo out; echo err >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn local_target_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool.env");
        assert_eq!(LocalTarget.read_file(&path).await.unwrap(), None);
        LocalTarget.write_file(&path, "A=1\n").await.unwrap();
        assert_eq!(
            LocalTarget.read_file(&path).await.unwrap().as_deref(),
            Some("A=1\n")
        );
    }
}
