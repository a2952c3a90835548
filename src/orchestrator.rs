//! Materializes a resolved descriptor on a container engine.
//!
//! [`Orchestrator::provision`] checks volumes and bind sources, pulls the image and creates and
//! starts the container. It hands back a [`Provisioned`] token for every service; the
//! initializer only accepts such a token, which is how the "deployed before initialized" order
//! is kept without polling.

use fnv::FnvHasher;
use serde_derive::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use crate::errors::{Error, InitStage};
use crate::initializer::{
    ContainerTarget, InitReport, Initializer, InitializerConfig, ToolEnvironment, MANIFEST_PATH,
};
use crate::models::{
    ContainerCreateBody, HostConfig, PortBinding, RestartPolicy as EngineRestartPolicy,
    RestartPolicyNameEnum,
};
use crate::resolve::{
    absolute_source, MountKind, ProvisioningPolicy, ResolvedDescriptor, RestartPolicy,
    ServiceInstance,
};
use crate::runtime::ContainerRuntime;
use crate::state::{InitOutcome, StateStore};

/// Label carrying the service name on every created container and volume.
pub const SERVICE_LABEL: &str = "io.n8n-deploy.service";

/// Label carrying the project directory on every created container and volume.
pub const PROJECT_LABEL: &str = "io.n8n-deploy.project";

/// Label carrying the digest of the create body a container was built from.
pub const CONFIG_LABEL: &str = "io.n8n-deploy.config";

/// Proof that a service's container was provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioned {
    container_id: Option<String>,
    service: String,
    project_dir: PathBuf,
}

impl Provisioned {
    /// A deployment provisioned by other means, for instance by `docker compose up`, which the
    /// caller vouches for. The container is addressed by the service name.
    pub fn assumed<S: Into<String>, P: Into<PathBuf>>(service: S, project_dir: P) -> Self {
        Provisioned {
            container_id: None,
            service: service.into(),
            project_dir: project_dir.into(),
        }
    }

    /// The container id, when this token came from [`Orchestrator::provision`].
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// The id when known, the service name otherwise. Both address the container on the engine.
    pub fn container(&self) -> &str {
        self.container_id.as_deref().unwrap_or(&self.service)
    }

    /// The service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The descriptor's project directory.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}

/// Where a service stands, combining the container with the last initializer outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum DeploymentStatus {
    /// No container exists.
    NotDeployed,
    /// The container exists but is not running.
    Stopped,
    /// The container runs but was never initialized, or was recreated since.
    RunningUninitialized,
    /// The container runs and the last initializer run succeeded.
    RunningReady,
    /// The container runs and the last initializer run failed.
    InitializationFailed {
        /// The stage that failed.
        stage: InitStage,
    },
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::NotDeployed => f.write_str("not deployed"),
            DeploymentStatus::Stopped => f.write_str("stopped"),
            DeploymentStatus::RunningUninitialized => f.write_str("running, not initialized"),
            DeploymentStatus::RunningReady => f.write_str("running, ready"),
            DeploymentStatus::InitializationFailed { stage } => {
                write!(f, "running, initialization failed at {stage}")
            }
        }
    }
}

/// A container to create: its name and engine body.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerPlan {
    /// Container name, equal to the service name.
    pub name: String,
    /// The create body.
    pub body: ContainerCreateBody,
}

impl ContainerPlan {
    /// The configuration digest recorded in the body's labels.
    pub fn digest(&self) -> Option<&str> {
        self.body
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CONFIG_LABEL))
            .map(String::as_str)
    }
}

/// Drives a [`ContainerRuntime`] through provisioning.
#[derive(Debug)]
pub struct Orchestrator<R> {
    runtime: R,
    tool: Option<ToolEnvironment>,
    state: Option<StateStore>,
}

impl<R: ContainerRuntime> Orchestrator<R> {
    /// An orchestrator without tool environment and without state store.
    pub fn new(runtime: R) -> Self {
        Orchestrator {
            runtime,
            tool: None,
            state: None,
        }
    }

    /// Inject `tool` into every container's environment at creation.
    pub fn with_tool_environment(mut self, tool: ToolEnvironment) -> Self {
        self.tool = Some(tool);
        self
    }

    /// Record initializer outcomes in `state`, and consult it for [`status`](Self::status).
    pub fn with_state(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    /// The underlying runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Translate every service into a container create body. Performs no engine calls.
    pub fn plan(&self, resolved: &ResolvedDescriptor) -> Result<Vec<ContainerPlan>, Error> {
        resolved
            .services
            .iter()
            .map(|instance| self.plan_service(resolved, instance))
            .collect()
    }

    fn plan_service(
        &self,
        resolved: &ResolvedDescriptor,
        instance: &ServiceInstance,
    ) -> Result<ContainerPlan, Error> {
        let mut env: Vec<String> = instance
            .environment
            .iter()
            .map(|a| a.to_string())
            .collect();
        if let Some(tool) = &self.tool {
            for assignment in tool.assignments() {
                if instance.env(&assignment.key).is_none() {
                    env.push(assignment.to_string());
                }
            }
        }

        let mut binds = Vec::with_capacity(instance.mounts.len());
        for mount in &instance.mounts {
            let bind = match mount.kind {
                MountKind::Bind => mount.to_bind(&resolved.project_dir),
                MountKind::Volume => {
                    let declaration = resolved.volume(&mount.source).ok_or_else(|| {
                        Error::UndeclaredVolume {
                            service: instance.name.clone(),
                            volume: mount.source.clone(),
                        }
                    })?;
                    let suffix = if mount.read_only { ":ro" } else { "" };
                    format!("{}:{}{}", declaration.name, mount.target, suffix)
                }
            };
            binds.push(bind);
        }

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &instance.ports {
            let key = port.container_key();
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: port.host_ip.clone(),
                    host_port: Some(port.host_port.to_string()),
                });
        }

        let restart = match instance.restart {
            RestartPolicy::No => RestartPolicyNameEnum::NO,
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        };

        let mut body = ContainerCreateBody {
            image: Some(instance.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels(&instance.name, &resolved.project_dir)),
            host_config: Some(HostConfig {
                binds: Some(binds),
                port_bindings: Some(port_bindings),
                restart_policy: Some(EngineRestartPolicy {
                    name: Some(restart),
                    maximum_retry_count: None,
                }),
            }),
        };
        let digest = config_digest(&body)?;
        body.labels
            .get_or_insert_with(HashMap::new)
            .insert(CONFIG_LABEL.to_owned(), digest);

        Ok(ContainerPlan {
            name: instance.name.clone(),
            body,
        })
    }

    /// Materialize every service of `resolved`.
    ///
    /// External volumes and bind sources are checked for every service before anything is
    /// created. Existing containers built from the same plan are reused and started when
    /// stopped; any other container of the same name is replaced.
    pub async fn provision(&self, resolved: &ResolvedDescriptor) -> Result<Vec<Provisioned>, Error> {
        let plans = self.plan(resolved)?;

        for declaration in &resolved.volumes {
            if declaration.policy == ProvisioningPolicy::External
                && !self.runtime.volume_exists(&declaration.name).await?
            {
                return Err(Error::MissingExternalVolume {
                    name: declaration.name.clone(),
                });
            }
        }
        for instance in &resolved.services {
            check_bind_sources(instance, &resolved.project_dir)?;
        }

        for declaration in &resolved.volumes {
            if declaration.policy == ProvisioningPolicy::Managed
                && !self.runtime.volume_exists(&declaration.name).await?
            {
                info!("creating volume {}", declaration.name);
                self.runtime
                    .create_volume(
                        &declaration.name,
                        labels(&declaration.key, &resolved.project_dir),
                    )
                    .await?;
            }
        }

        let mut provisioned = Vec::with_capacity(plans.len());
        for (instance, plan) in resolved.services.iter().zip(plans) {
            let container_id = self.provision_service(instance, plan).await?;
            provisioned.push(Provisioned {
                container_id: Some(container_id),
                service: instance.name.clone(),
                project_dir: resolved.project_dir.clone(),
            });
        }
        Ok(provisioned)
    }

    async fn provision_service(
        &self,
        instance: &ServiceInstance,
        plan: ContainerPlan,
    ) -> Result<String, Error> {
        let wanted = plan.digest().map(str::to_owned);
        let existing = match self.runtime.container(&plan.name).await? {
            Some(existing) if existing.labels.get(CONFIG_LABEL) != wanted.as_ref() => {
                info!(
                    "container {} was created from another configuration, recreating it",
                    plan.name
                );
                self.runtime.remove_container(&existing.id).await?;
                None
            }
            other => other,
        };

        let id = match existing {
            Some(existing) if existing.running => {
                info!("container {} is already running", plan.name);
                return Ok(existing.id);
            }
            Some(existing) => {
                info!("reusing stopped container {}", plan.name);
                existing.id
            }
            None => {
                info!("pulling {}", instance.image);
                self.runtime.pull_image(&instance.image).await?;
                let id = self.runtime.create_container(&plan.name, plan.body).await?;
                info!("created container {} ({id})", plan.name);
                id
            }
        };

        self.runtime
            .start_container(&id)
            .await
            .map_err(|e| port_conflict(instance, e))?;
        info!("started container {}", plan.name);
        Ok(id)
    }

    /// A token for the already running container of service `name`, for initializing a
    /// deployment provisioned earlier.
    pub async fn attach<P: Into<PathBuf>>(
        &self,
        name: &str,
        project_dir: P,
    ) -> Result<Provisioned, Error> {
        match self.runtime.container(name).await? {
            Some(container) if container.running => Ok(Provisioned {
                container_id: Some(container.id),
                service: name.to_owned(),
                project_dir: project_dir.into(),
            }),
            _ => Err(Error::ServiceNotRunning {
                service: name.to_owned(),
            }),
        }
    }

    /// Where the service `name` stands.
    pub async fn status(&self, name: &str) -> Result<DeploymentStatus, Error> {
        let container = match self.runtime.container(name).await? {
            None => return Ok(DeploymentStatus::NotDeployed),
            Some(c) if !c.running => return Ok(DeploymentStatus::Stopped),
            Some(c) => c,
        };

        let record = match &self.state {
            Some(state) => state.load(name)?,
            None => None,
        };
        Ok(match record {
            // a record from a container that has since been recreated does not count
            Some(r) if r.container_id.as_deref().is_some_and(|id| id != container.id) => {
                DeploymentStatus::RunningUninitialized
            }
            None => DeploymentStatus::RunningUninitialized,
            Some(r) => match r.outcome {
                InitOutcome::Ready => DeploymentStatus::RunningReady,
                InitOutcome::Failed { stage, .. } => {
                    DeploymentStatus::InitializationFailed { stage }
                }
            },
        })
    }

    /// Run the initializer inside the provisioned container and record the outcome.
    pub async fn initialize(
        &self,
        provisioned: &Provisioned,
        config: InitializerConfig,
    ) -> Result<InitReport, Error> {
        let target = ContainerTarget::new(&self.runtime, provisioned.container());
        let result = Initializer::new(target, config).run(provisioned).await;
        if let Some(state) = &self.state {
            if let Err(e) = state.record(provisioned, &result) {
                warn!(
                    "could not record the initializer outcome in {}: {e}",
                    state.path().display()
                );
            }
        }
        result
    }
}

/// FNV-1a digest of the body's JSON form. Maps serialize with sorted keys, so equal bodies give
/// equal digests.
fn config_digest(body: &ContainerCreateBody) -> Result<String, Error> {
    let canonical = serde_json::to_value(body)?.to_string();
    let mut hasher = FnvHasher::default();
    hasher.write(canonical.as_bytes());
    Ok(format!("{:016x}", hasher.finish()))
}

fn labels(service: &str, project_dir: &Path) -> HashMap<String, String> {
    HashMap::from([
        (SERVICE_LABEL.to_owned(), service.to_owned()),
        (PROJECT_LABEL.to_owned(), project_dir.display().to_string()),
    ])
}

fn check_bind_sources(instance: &ServiceInstance, project_dir: &Path) -> Result<(), Error> {
    for mount in &instance.mounts {
        if mount.kind != MountKind::Bind {
            continue;
        }
        let source = absolute_source(&mount.source, project_dir);
        let missing = if mount.target == MANIFEST_PATH {
            !source.is_file()
        } else {
            !source.exists()
        };
        if missing {
            return Err(Error::MissingBindSource {
                path: source.display().to_string(),
            });
        }
    }
    Ok(())
}

fn port_conflict(instance: &ServiceInstance, err: Error) -> Error {
    match err {
        Error::DockerResponseServerError { message, .. }
            if message.contains("port is already allocated")
                || message.contains("address already in use") =>
        {
            let port = allocated_port(&message)
                .or_else(|| instance.ports.first().map(|p| p.host_port))
                .unwrap_or_default();
            Error::PortConflict { port, message }
        }
        other => other,
    }
}

// "Bind for 0.0.0.0:5678 failed: port is already allocated"
fn allocated_port(message: &str) -> Option<u16> {
    let (_, rest) = message.split_once("Bind for ")?;
    let (address, _) = rest.split_once(" failed")?;
    address.rsplit(':').next()?.parse().ok()
}
