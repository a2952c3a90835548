//! Request and response bodies of the docker engine API endpoints used by the orchestrator.

use serde_derive::{Deserialize, Serialize};

use std::collections::HashMap;

/// Error body returned by the engine alongside 4xx/5xx status codes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// The error message.
    pub message: String,
}

/// A named volume as reported by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    /// Name of the volume.
    pub name: String,
    /// Name of the volume driver used by the volume.
    #[serde(default)]
    pub driver: String,
    /// Mount path of the volume on the host.
    #[serde(default)]
    pub mountpoint: String,
    /// User-defined key/value metadata.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Volume configuration used in the [Create Volume API](crate::Docker::create_volume())
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeCreateOptions {
    /// The new volume's name.
    pub name: String,
    /// User-defined key/value metadata.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Restart policy names understood by the engine.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicyNameEnum {
    /// Never restart.
    #[default]
    #[serde(rename = "no")]
    NO,
    /// Always restart.
    #[serde(rename = "always")]
    ALWAYS,
    /// Restart only when the container is not stopped by the user.
    #[serde(rename = "unless-stopped")]
    UNLESS_STOPPED,
    /// Restart on a non-zero exit code.
    #[serde(rename = "on-failure")]
    ON_FAILURE,
}

/// The behavior to apply when the container exits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    /// Restart policy name.
    pub name: Option<RestartPolicyNameEnum>,
    /// Retry count for `on-failure`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_retry_count: Option<i64>,
}

/// A host side port binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    /// Host IP address that the container's port is mapped to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Host port number that the container's port is mapped to.
    pub host_port: Option<String>,
}

/// Container configuration that depends on the host we are running on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    /// A list of volume bindings for this container, `source:target[:ro]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
    /// Port mapping between the exposed port (`port/proto`) and the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_bindings: Option<HashMap<String, Option<Vec<PortBinding>>>>,
    /// The behavior to apply when the container exits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

/// Configuration used in the [Create Container API](crate::Docker::create_container())
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateBody {
    /// The name of the image to use when creating the container.
    pub image: Option<String>,
    /// A list of environment variables in the form `["VAR=value", ...]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// An object mapping ports to an empty object in the form `{"<port>/<tcp|udp>": {}}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<HashMap<String, HashMap<(), ()>>>,
    /// User-defined key/value metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    /// Container configuration that depends on the host we are running on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
}

/// Result type for the [Create Container API](crate::Docker::create_container())
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateResponse {
    /// The ID of the created container.
    pub id: String,
    /// Warnings encountered when creating the container.
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Runtime state of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// String representation of the container state.
    #[serde(default)]
    pub status: Option<String>,
    /// Whether this container is running.
    #[serde(default)]
    pub running: Option<bool>,
    /// The last exit code of this container.
    #[serde(default)]
    pub exit_code: Option<i64>,
}

/// Result type for the [Inspect Container API](crate::Docker::inspect_container())
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspectResponse {
    /// The ID of the container.
    #[serde(default)]
    pub id: Option<String>,
    /// The name of the container.
    #[serde(default)]
    pub name: Option<String>,
    /// Runtime state.
    #[serde(default)]
    pub state: Option<ContainerState>,
    /// Configuration the container was created with.
    #[serde(default)]
    pub config: Option<ContainerConfig>,
}

/// The part of a container's configuration read back on inspect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// User-defined key/value metadata.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Streamed progress message of the [Create Image API](crate::Docker::create_image())
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageInfo {
    /// Layer or image id.
    #[serde(default)]
    pub id: Option<String>,
    /// Progress status.
    #[serde(default)]
    pub status: Option<String>,
    /// Error text, set when the pull failed mid-stream.
    #[serde(default)]
    pub error: Option<String>,
}

/// Exec configuration used in the [Create Exec API](crate::Docker::create_exec())
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    /// Attach to stdout of the exec command.
    pub attach_stdout: Option<bool>,
    /// Attach to stderr of the exec command.
    pub attach_stderr: Option<bool>,
    /// A list of environment variables in the form `["VAR=value", ...]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Command to run, as an array of strings.
    pub cmd: Option<Vec<String>>,
    /// The user, and optionally, group to run the exec process inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// The working directory for the exec process inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Response to an API call that returns just an Id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdResponse {
    /// The id of the newly created object.
    pub id: String,
}

/// Exec start configuration used in the [Start Exec API](crate::Docker::start_exec())
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartExecOptions {
    /// Detach from the command.
    pub detach: bool,
    /// Allocate a pseudo-TTY.
    pub tty: bool,
}

/// Result type for the [Inspect Exec API](crate::Docker::inspect_exec())
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspectResponse {
    /// The exec instance id.
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    /// Whether the process is still running.
    #[serde(default)]
    pub running: Option<bool>,
    /// The exit code, once the process finished.
    #[serde(default)]
    pub exit_code: Option<i64>,
}
