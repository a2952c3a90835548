//! Errors for this module.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

/// Broad classification of an [`Error`], used to pick the process exit code and to decide
/// whether the service may already be running when the error surfaced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The descriptor or its parameters could not be resolved. Nothing was started.
    Configuration,
    /// The orchestrator could not materialize the descriptor. Nothing was started.
    Provisioning,
    /// An initializer stage failed. The service instance may already be running.
    Initialization,
    /// The docker daemon could not be reached or answered with garbage.
    Transport,
}

/// The four sequential stages of the post-deployment initializer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitStage {
    /// Ownership and mode of the shared files directory.
    Permissions,
    /// Installation of the media-processing system package.
    SystemPackage,
    /// Location of the installed binary and the environment pointing at it.
    ToolEnvironment,
    /// Installation of the language-level dependency manifest.
    LanguageDependencies,
}

impl InitStage {
    /// All stages, in execution order.
    pub const ALL: [InitStage; 4] = [
        InitStage::Permissions,
        InitStage::SystemPackage,
        InitStage::ToolEnvironment,
        InitStage::LanguageDependencies,
    ];
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitStage::Permissions => "permission-setup",
            InitStage::SystemPackage => "system-package",
            InitStage::ToolEnvironment => "tool-environment",
            InitStage::LanguageDependencies => "language-dependencies",
        })
    }
}

/// The type of error embedded in an Error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A substitution variable was referenced but never set.
    #[error("missing configuration: variable `{variable}` is not set (used in {field})")]
    MissingConfiguration {
        /// The name of the substitution variable.
        variable: String,
        /// The descriptor field that referenced it.
        field: String,
    },
    /// A `${VAR}` expression could not be parsed.
    #[error("invalid substitution in {field}: {message}")]
    InvalidSubstitution {
        /// The descriptor field that holds the expression.
        field: String,
        /// What went wrong.
        message: String,
    },
    /// A deploy parameter was set, but to a value that can not be used.
    #[error("invalid value for parameter `{parameter}`: {message}")]
    InvalidParameter {
        /// The parameter name.
        parameter: String,
        /// Why it was rejected.
        message: String,
    },
    /// The descriptor does not describe a deployable service.
    #[error("invalid descriptor: {message}")]
    DescriptorParse {
        /// What went wrong.
        message: String,
    },
    /// A port binding could not be parsed.
    #[error("invalid port binding `{binding}` for service {service}")]
    InvalidPortBinding {
        /// The service that declared it.
        service: String,
        /// The raw binding text.
        binding: String,
    },
    /// A mount specification could not be parsed.
    #[error("invalid mount `{mount}` for service {service}: {message}")]
    InvalidMount {
        /// The service that declared it.
        service: String,
        /// The raw mount text.
        mount: String,
        /// Why it was rejected.
        message: String,
    },
    /// An environment key was assigned twice in one service.
    #[error("environment variable `{key}` is assigned more than once in service {service}")]
    DuplicateEnvironmentKey {
        /// The service that declared it.
        service: String,
        /// The duplicated key.
        key: String,
    },
    /// A service mounts a named volume without a top-level declaration.
    #[error("service {service} mounts volume `{volume}` which is not declared")]
    UndeclaredVolume {
        /// The service that mounts it.
        service: String,
        /// The volume name.
        volume: String,
    },
    /// A volume declared as external does not exist on the daemon.
    #[error("missing external volume `{name}`: create it before deploying")]
    MissingExternalVolume {
        /// The volume name.
        name: String,
    },
    /// The host side of a bind mount does not exist.
    #[error("bind mount source `{path}` does not exist")]
    MissingBindSource {
        /// The absolute host path.
        path: String,
    },
    /// The daemon refused to publish a host port.
    #[error("host port {port} is already allocated: {message}")]
    PortConflict {
        /// The conflicting host port.
        port: u16,
        /// The daemon's message.
        message: String,
    },
    /// The service's container does not exist or is not running.
    #[error("service {service} is not running: run `up` first")]
    ServiceNotRunning {
        /// The service name.
        service: String,
    },
    /// Stage 1 of the initializer failed.
    #[error("permission-setup error on {path}: {message}")]
    PermissionSetup {
        /// The path being changed.
        path: String,
        /// The underlying error text.
        message: String,
    },
    /// Stage 2 of the initializer failed.
    #[error("dependency-install error for package `{package}`: {message}")]
    DependencyInstall {
        /// The system package.
        package: String,
        /// The package manager's error text.
        message: String,
    },
    /// Stage 3 of the initializer failed.
    #[error("tool-export error for `{binary}`: {message}")]
    ToolExport {
        /// The binary that was looked up.
        binary: String,
        /// What went wrong.
        message: String,
    },
    /// Stage 4 of the initializer failed.
    #[error("dependency-resolution error{}: {message}", .requirement.as_ref().map(|r| format!(" for requirement `{r}`")).unwrap_or_default())]
    DependencyResolution {
        /// The requirement that failed, when it could be identified.
        requirement: Option<String>,
        /// The package manager's error text.
        message: String,
    },
    /// Error emitted by the docker server, when it responds with a 4xx/5xx status code
    #[error("Docker responded with status code {status_code}: {message}")]
    DockerResponseServerError {
        /// Status code returned by the docker server.
        status_code: u16,
        /// Message returned by the docker server.
        message: String,
    },
    /// Error facilitating debugging failed JSON parsing.
    #[error("Failed to deserialize JSON: {message}")]
    JsonDataError {
        /// Short section of the json close to the error.
        message: String,
        /// Entire JSON payload. This field is toggled with the **json_data_content** feature cargo flag.
        contents: String,
        /// Character sequence at error location.
        column: usize,
    },
    /// Error emitted when an exec instance finishes without reporting an exit code.
    #[error("exec {id} finished without an exit code")]
    ExecExitCodeMissing {
        /// The exec instance id.
        id: String,
    },
    /// Error emitted when a request times out.
    #[error("Timeout error")]
    RequestTimeoutError,
    /// Error emitted when the DOCKER_HOST scheme is not understood.
    #[error("unsupported docker host scheme in `{host}`")]
    UnsupportedURISchemeError {
        /// The raw host.
        host: String,
    },
    /// Generic error emitted by the JSON serialization library.
    #[error(transparent)]
    JSONError {
        /// The original error emitted by serde.
        #[from]
        err: serde_json::Error,
    },
    /// Generic error emitted by the YAML parsing library.
    #[error(transparent)]
    YamlError {
        /// The original error emitted by serde_yaml.
        #[from]
        err: serde_yaml::Error,
    },
    /// Error emitted by the query string serializer.
    #[error(transparent)]
    URLEncodedError {
        /// The original error emitted by serde_urlencoded.
        #[from]
        err: serde_urlencoded::ser::Error,
    },
    /// Generic error emitted by the std::io library.
    #[error(transparent)]
    IOError {
        /// The original error emitted.
        #[from]
        err: std::io::Error,
    },
    /// Error emitted by the http library when building a request.
    #[error(transparent)]
    HttpClientError {
        /// The original error emitted.
        #[from]
        err: http::Error,
    },
    /// Error emitted when the URI is deemed invalid by the http library.
    #[error(transparent)]
    InvalidURIError {
        /// The original error emitted.
        #[from]
        err: http::uri::InvalidUri,
    },
    /// Error emitted by the hyper library while reading a response body.
    #[error(transparent)]
    HyperResponseError {
        /// The original error emitted.
        #[from]
        err: hyper::Error,
    },
    /// Error that is emitted by the hyper-util legacy bridge client
    #[error("Error in the hyper legacy client: {}", err)]
    HyperLegacyError {
        /// The original error emitted.
        #[from]
        err: hyper_util::client::legacy::Error,
    },
}

impl Error {
    /// The broad category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::MissingConfiguration { .. }
            | Error::InvalidSubstitution { .. }
            | Error::InvalidParameter { .. }
            | Error::DescriptorParse { .. }
            | Error::InvalidPortBinding { .. }
            | Error::InvalidMount { .. }
            | Error::DuplicateEnvironmentKey { .. }
            | Error::UndeclaredVolume { .. }
            | Error::YamlError { .. } => ErrorCategory::Configuration,
            Error::MissingExternalVolume { .. }
            | Error::MissingBindSource { .. }
            | Error::PortConflict { .. }
            | Error::ServiceNotRunning { .. } => ErrorCategory::Provisioning,
            Error::PermissionSetup { .. }
            | Error::DependencyInstall { .. }
            | Error::ToolExport { .. }
            | Error::DependencyResolution { .. } => ErrorCategory::Initialization,
            _ => ErrorCategory::Transport,
        }
    }

    /// The initializer stage this error belongs to, if any.
    pub fn stage(&self) -> Option<InitStage> {
        match self {
            Error::PermissionSetup { .. } => Some(InitStage::Permissions),
            Error::DependencyInstall { .. } => Some(InitStage::SystemPackage),
            Error::ToolExport { .. } => Some(InitStage::ToolEnvironment),
            Error::DependencyResolution { .. } => Some(InitStage::LanguageDependencies),
            _ => None,
        }
    }

    /// Process exit code for this error. Every initializer stage gets its own code.
    pub fn exit_code(&self) -> i32 {
        match (self.category(), self.stage()) {
            (_, Some(InitStage::Permissions)) => 10,
            (_, Some(InitStage::SystemPackage)) => 11,
            (_, Some(InitStage::ToolEnvironment)) => 12,
            (_, Some(InitStage::LanguageDependencies)) => 13,
            (ErrorCategory::Configuration, None) => 2,
            (ErrorCategory::Provisioning, None) => 3,
            (ErrorCategory::Transport, None) => 4,
            (ErrorCategory::Initialization, None) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_stage() {
        let errors = [
            Error::PermissionSetup {
                path: "/data/files".into(),
                message: "denied".into(),
            },
            Error::DependencyInstall {
                package: "ffmpeg".into(),
                message: "no such package".into(),
            },
            Error::ToolExport {
                binary: "ffmpeg".into(),
                message: "not found".into(),
            },
            Error::DependencyResolution {
                requirement: None,
                message: "missing manifest".into(),
            },
        ];
        let codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        assert_eq!(codes, vec![10, 11, 12, 13]);
        for (err, stage) in errors.iter().zip(InitStage::ALL) {
            assert_eq!(err.stage(), Some(stage));
            assert_eq!(err.category(), ErrorCategory::Initialization);
        }
    }

    #[test]
    fn configuration_errors_abort_before_provisioning() {
        let err = Error::MissingConfiguration {
            variable: "SUBDOMAIN".into(),
            field: "services.n8n.environment.N8N_HOST".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("SUBDOMAIN"));

        let err = Error::MissingExternalVolume {
            name: "n8n_data".into(),
        };
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("missing external volume"));
    }

    #[test]
    fn dependency_resolution_names_the_requirement() {
        let err = Error::DependencyResolution {
            requirement: Some("ffmpy==99".into()),
            message: "No matching distribution found for ffmpy==99".into(),
        };
        assert_eq!(
            err.to_string(),
            "dependency-resolution error for requirement `ffmpy==99`: No matching distribution found for ffmpy==99"
        );
    }
}
