#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tempfile::TempDir;
use tokio::runtime::Runtime;

use n8n_deploy::errors::Error;
use n8n_deploy::initializer::{
    InitTarget, LocalTarget, Owner, PermissionReport, FILES_DIR, MANIFEST_PATH,
};
use n8n_deploy::models::ContainerCreateBody;
use n8n_deploy::runtime::{CommandLine, CommandOutput, ContainerRuntime, ContainerSummary};
use n8n_deploy::{resolve, ResolvedDescriptor, ServiceDescriptor};

#[allow(unused_macros)]
macro_rules! connect_to_docker_and_run {
    ($exec:expr) => {{
        let rt = Runtime::new().unwrap();
        let fut = $exec(Docker::connect_with_local_defaults().unwrap());
        run_runtime(rt, fut);
    }};
}

#[allow(unused_macros)]
macro_rules! run_with {
    ($exec:expr, $arg:expr) => {{
        let rt = Runtime::new().unwrap();
        let fut = $exec($arg);
        run_runtime(rt, fut);
    }};
}

pub(crate) fn run_runtime<T>(rt: Runtime, future: T)
where
    T: Future<Output = Result<(), Error>>,
{
    rt.block_on(future)
        .map_err(|e| {
            println!("{:?}", e);
            e
        })
        .unwrap();
}

pub const REQUIREMENTS: &str = "ffmpy==0.3.2\npython-pptx>=0.6.21\n";

pub fn deploy_params() -> HashMap<String, String> {
    [
        ("SUBDOMAIN", "n8n"),
        ("DOMAIN_NAME", "example.com"),
        ("GENERIC_TIMEZONE", "Europe/Berlin"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// A project directory laid out the way the built-in descriptor expects.
pub fn project_fixture() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("local_files")).unwrap();
    fs::create_dir(dir.path().join("python_scripts")).unwrap();
    fs::write(dir.path().join("requirements.txt"), REQUIREMENTS).unwrap();
    dir
}

pub fn resolved_n8n(project_dir: &Path) -> ResolvedDescriptor {
    let descriptor = ServiceDescriptor::n8n().with_project_dir(project_dir);
    resolve(&descriptor, &deploy_params()).unwrap()
}

fn output(exit_code: i64, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

pub fn failure(stderr: &str) -> CommandOutput {
    output(1, "", stderr)
}

#[derive(Debug)]
struct SimState {
    files_dir: PathBuf,
    files_dir_present: bool,
    chown_error: Option<String>,
    files: BTreeMap<PathBuf, String>,
    dirty: BTreeSet<PathBuf>,
    ffmpeg_installed: bool,
    ffmpeg_path: String,
    apk_failures: VecDeque<CommandOutput>,
    pip_failures: VecDeque<CommandOutput>,
    pip_satisfied: bool,
    commands: Vec<String>,
}

/// An in-memory stand-in for the n8n container: its shared files directory, its package
/// manager, the media tool and the python installer.
#[derive(Debug)]
pub struct Simulation {
    state: Mutex<SimState>,
}

impl Default for Simulation {
    fn default() -> Self {
        Simulation::new()
    }
}

impl Simulation {
    pub fn new() -> Self {
        let files_dir = PathBuf::from(FILES_DIR);
        let clip = files_dir.join("input.mp4");
        let mut files = BTreeMap::new();
        files.insert(clip.clone(), String::from("frames"));
        files.insert(PathBuf::from(MANIFEST_PATH), REQUIREMENTS.to_string());

        Simulation {
            state: Mutex::new(SimState {
                dirty: BTreeSet::from([files_dir.clone(), clip]),
                files_dir,
                files_dir_present: true,
                chown_error: None,
                files,
                ffmpeg_installed: false,
                ffmpeg_path: String::from("/usr/bin/ffmpeg"),
                apk_failures: VecDeque::new(),
                pip_failures: VecDeque::new(),
                pip_satisfied: false,
                commands: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn without_manifest(self) -> Self {
        self.state().files.remove(Path::new(MANIFEST_PATH));
        self
    }

    pub fn with_manifest(self, contents: &str) -> Self {
        self.state()
            .files
            .insert(PathBuf::from(MANIFEST_PATH), contents.to_string());
        self
    }

    pub fn without_files_dir(self) -> Self {
        self.state().files_dir_present = false;
        self
    }

    pub fn failing_chown(self, message: &str) -> Self {
        self.state().chown_error = Some(message.to_string());
        self
    }

    pub fn with_ffmpeg_at(self, path: &str) -> Self {
        {
            let mut state = self.state();
            state.ffmpeg_installed = true;
            state.ffmpeg_path = path.to_string();
        }
        self
    }

    pub fn failing_apk(self, failure: CommandOutput) -> Self {
        self.state().apk_failures.push_back(failure);
        self
    }

    pub fn failing_pip(self, failure: CommandOutput) -> Self {
        self.state().pip_failures.push_back(failure);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn count(&self, program: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(program))
            .count()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(Path::new(path)).cloned()
    }

    pub fn ffmpeg_installed(&self) -> bool {
        self.state().ffmpeg_installed
    }

    pub fn pending_permissions(&self) -> usize {
        self.state().dirty.len()
    }

    fn permissions(&self, path: &Path) -> Result<PermissionReport, String> {
        let mut state = self.state();
        let present = if path == state.files_dir {
            state.files_dir_present
        } else {
            state.files.contains_key(path)
        };
        if !present {
            return Err(String::from("no such file or directory"));
        }

        let pending: Vec<PathBuf> = state
            .dirty
            .iter()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        if !pending.is_empty() {
            if let Some(message) = &state.chown_error {
                return Err(message.clone());
            }
        }
        for p in &pending {
            state.dirty.remove(p);
        }

        let examined = if path == state.files_dir {
            1 + state.files.keys().filter(|p| p.starts_with(path)).count()
        } else {
            1
        };
        Ok(PermissionReport {
            examined,
            changed: pending.len(),
        })
    }

    fn read(&self, path: &Path) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    fn write(&self, path: &Path, contents: &str) {
        let mut state = self.state();
        state.files.insert(path.to_path_buf(), contents.to_string());
        if path.starts_with(&state.files_dir) {
            state.dirty.insert(path.to_path_buf());
        }
    }

    /// Run a command the way the container would.
    pub fn execute(&self, command: &CommandLine) -> CommandOutput {
        self.state().commands.push(command.to_string());
        let argv = command.argv();
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();

        match argv.as_slice() {
            ["sh", "-c", script, "sh", args @ ..] => self.shell(script, args, &command.env),
            ["apk", "add", ..] => {
                let mut state = self.state();
                match state.apk_failures.pop_front() {
                    Some(failure) => failure,
                    None => {
                        state.ffmpeg_installed = true;
                        output(0, "OK: 214 MiB in 98 packages\n", "")
                    }
                }
            }
            [binary, "-version"] => {
                let state = self.state();
                if state.ffmpeg_installed && *binary == state.ffmpeg_path {
                    output(0, "ffmpeg version 6.1.1 Copyright (c) 2000-2023\n", "")
                } else {
                    output(127, "", &format!("sh: {binary}: not found\n"))
                }
            }
            ["pip", "install", ..] => {
                let mut state = self.state();
                if let Some(failure) = state.pip_failures.pop_front() {
                    return failure;
                }
                if state.pip_satisfied {
                    output(0, "Requirement already satisfied: ffmpy==0.3.2\n", "")
                } else {
                    state.pip_satisfied = true;
                    output(
                        0,
                        "Collecting ffmpy==0.3.2\nSuccessfully installed ffmpy-0.3.2 python-pptx-0.6.23\n",
                        "",
                    )
                }
            }
            [program, ..] => output(127, "", &format!("sh: {program}: not found\n")),
            [] => output(127, "", ""),
        }
    }

    fn shell(&self, script: &str, args: &[&str], env: &[(String, String)]) -> CommandOutput {
        let first = args.first().copied().unwrap_or_default();
        if script == r#"command -v "$1""# {
            let state = self.state();
            return if first == "ffmpeg" && state.ffmpeg_installed {
                output(0, &format!("{}\n", state.ffmpeg_path), "")
            } else {
                output(1, "", "")
            };
        }
        if script.contains("examined=$(find") {
            return match self.permissions(Path::new(first)) {
                Ok(report) => output(0, &format!("{} {}\n", report.examined, report.changed), ""),
                Err(message) => output(1, "", &format!("{message}\n")),
            };
        }
        if script.contains("cat \"$1\"") {
            return match self.read(Path::new(first)) {
                Some(contents) => output(0, &contents, ""),
                None => output(3, "", ""),
            };
        }
        if script.contains("$CONTENTS") {
            let contents = env
                .iter()
                .find(|(k, _)| k == "CONTENTS")
                .map(|(_, v)| v.as_str())
                .unwrap_or_default();
            self.write(Path::new(first), contents);
            return output(0, "", "");
        }
        output(2, "", &format!("sh: unsupported script: {script}\n"))
    }
}

impl InitTarget for Simulation {
    async fn apply_permissions(
        &self,
        path: &Path,
        _owner: Owner,
        _mode: u32,
    ) -> Result<PermissionReport, Error> {
        self.permissions(path).map_err(|message| Error::PermissionSetup {
            path: path.display().to_string(),
            message,
        })
    }

    async fn run(&self, command: &CommandLine) -> Result<CommandOutput, Error> {
        Ok(self.execute(command))
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>, Error> {
        Ok(self.read(path))
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), Error> {
        self.write(path, contents);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub running: bool,
    pub body: Option<ContainerCreateBody>,
}

#[derive(Debug, Default)]
pub struct RuntimeState {
    pub volumes: BTreeSet<String>,
    pub created_volumes: Vec<String>,
    pub pulled: Vec<String>,
    pub containers: BTreeMap<String, FakeContainer>,
    pub created: Vec<String>,
    pub started: Vec<String>,
    pub removed: Vec<String>,
    pub start_error: Option<String>,
}

/// An in-memory engine. Exec calls are answered by a [`Simulation`].
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    pub container: Simulation,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime::default()
    }

    pub fn with_simulation(mut self, simulation: Simulation) -> Self {
        self.container = simulation;
        self
    }

    pub fn with_volume(self, name: &str) -> Self {
        self.state().volumes.insert(name.to_string());
        self
    }

    pub fn with_container(self, name: &str, running: bool) -> Self {
        self.state().containers.insert(
            name.to_string(),
            FakeContainer {
                id: format!("{name}-existing"),
                running,
                body: None,
            },
        );
        self
    }

    pub fn failing_start(self, message: &str) -> Self {
        self.state().start_error = Some(message.to_string());
        self
    }

    pub fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    fn find(state: &RuntimeState, key: &str) -> Option<String> {
        state
            .containers
            .iter()
            .find(|(name, c)| name.as_str() == key || c.id == key)
            .map(|(name, _)| name.clone())
    }
}

fn not_found(what: &str) -> Error {
    Error::DockerResponseServerError {
        status_code: 404,
        message: format!("No such {what}"),
    }
}

impl ContainerRuntime for FakeRuntime {
    async fn volume_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.state().volumes.contains(name))
    }

    async fn create_volume(
        &self,
        name: &str,
        _labels: HashMap<String, String>,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.volumes.insert(name.to_string());
        state.created_volumes.push(name.to_string());
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), Error> {
        self.state().pulled.push(reference.to_string());
        Ok(())
    }

    async fn container(&self, name: &str) -> Result<Option<ContainerSummary>, Error> {
        let state = self.state();
        Ok(state.containers.get(name).map(|c| ContainerSummary {
            id: c.id.clone(),
            running: c.running,
            labels: c
                .body
                .as_ref()
                .and_then(|b| b.labels.clone())
                .unwrap_or_default(),
        }))
    }

    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<String, Error> {
        let mut state = self.state();
        if state.containers.contains_key(name) {
            return Err(Error::DockerResponseServerError {
                status_code: 409,
                message: format!("Conflict. The container name \"/{name}\" is already in use"),
            });
        }
        let id = format!("{name}-{}", state.created.len() + 1);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                running: false,
                body: Some(body),
            },
        );
        state.created.push(name.to_string());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state();
        if let Some(message) = state.start_error.clone() {
            return Err(Error::DockerResponseServerError {
                status_code: 500,
                message,
            });
        }
        let name = FakeRuntime::find(&state, id).ok_or_else(|| not_found("container"))?;
        if let Some(container) = state.containers.get_mut(&name) {
            container.running = true;
        }
        state.started.push(name);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state();
        let name = FakeRuntime::find(&state, id).ok_or_else(|| not_found("container"))?;
        let removed = state.containers.remove(&name).map(|c| c.id);
        state.removed.extend(removed);
        Ok(())
    }

    async fn exec(&self, container: &str, command: &CommandLine) -> Result<CommandOutput, Error> {
        {
            let mut state = self.state();
            let name =
                FakeRuntime::find(&state, container).ok_or_else(|| not_found("container"))?;
            if !state.containers[&name].running {
                return Err(Error::DockerResponseServerError {
                    status_code: 409,
                    message: format!("Container {container} is not running"),
                });
            }
        }
        Ok(self.container.execute(command))
    }
}

/// An engine whose exec runs commands on this host, with `bin` searched before `PATH`.
/// Nothing else is supported.
#[derive(Debug)]
pub struct ShellRuntime {
    pub bin: PathBuf,
}

impl ShellRuntime {
    pub fn new(bin: &Path) -> Self {
        ShellRuntime {
            bin: bin.to_path_buf(),
        }
    }

    /// Put an executable shell script called `name` in `bin`.
    pub fn install(&self, name: &str, script: &str) {
        let path = self.bin.join(name);
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn unsupported(operation: &str) -> Error {
    Error::DockerResponseServerError {
        status_code: 501,
        message: format!("{operation} is not supported by the local shell"),
    }
}

impl ContainerRuntime for ShellRuntime {
    async fn volume_exists(&self, _name: &str) -> Result<bool, Error> {
        Err(unsupported("volume inspect"))
    }

    async fn create_volume(
        &self,
        _name: &str,
        _labels: HashMap<String, String>,
    ) -> Result<(), Error> {
        Err(unsupported("volume create"))
    }

    async fn pull_image(&self, _reference: &str) -> Result<(), Error> {
        Err(unsupported("image pull"))
    }

    async fn container(&self, _name: &str) -> Result<Option<ContainerSummary>, Error> {
        Err(unsupported("container inspect"))
    }

    async fn create_container(
        &self,
        _name: &str,
        _body: ContainerCreateBody,
    ) -> Result<String, Error> {
        Err(unsupported("container create"))
    }

    async fn start_container(&self, _id: &str) -> Result<(), Error> {
        Err(unsupported("container start"))
    }

    async fn remove_container(&self, _id: &str) -> Result<(), Error> {
        Err(unsupported("container remove"))
    }

    async fn exec(&self, _container: &str, command: &CommandLine) -> Result<CommandOutput, Error> {
        let path = std::env::var("PATH").unwrap_or_default();
        let command = command
            .clone()
            .env("PATH", format!("{}:{path}", self.bin.display()));
        LocalTarget.run(&command).await
    }
}
