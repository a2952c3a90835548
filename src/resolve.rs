//! Resolution of a [ServiceDescriptor] into concrete, validated service instances.
//!
//! Resolution is pure: it never talks to the daemon. Any unset substitution variable fails the
//! whole descriptor, so a half-resolved instance never reaches the orchestrator.

use serde_derive::{Deserialize, Serialize};
use url::Url;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::descriptor::{ServiceDescriptor, VolumeSpec};
use crate::errors::Error;
use crate::interpolate::{interpolate, ParameterSource};

/// Parameter holding the subdomain n8n is reachable under.
pub const SUBDOMAIN: &str = "SUBDOMAIN";
/// Parameter holding the domain name n8n is reachable under.
pub const DOMAIN_NAME: &str = "DOMAIN_NAME";
/// Parameter holding the timezone used by schedule nodes.
pub const GENERIC_TIMEZONE: &str = "GENERIC_TIMEZONE";

/// The deploy-time parameters the built-in descriptor needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParameters {
    /// Subdomain, e.g. `flows`.
    pub subdomain: String,
    /// Domain name, e.g. `example.com`.
    pub domain_name: String,
    /// IANA timezone, e.g. `Europe/Berlin`.
    pub timezone: String,
}

impl DeployParameters {
    /// Build and validate the parameters.
    pub fn new<S: Into<String>>(
        subdomain: S,
        domain_name: S,
        timezone: S,
    ) -> Result<DeployParameters, Error> {
        let params = DeployParameters {
            subdomain: subdomain.into(),
            domain_name: domain_name.into(),
            timezone: timezone.into(),
        };
        params.validate()?;
        Ok(params)
    }

    /// Read `SUBDOMAIN`, `DOMAIN_NAME` and `GENERIC_TIMEZONE` from `source`. Any of them unset
    /// or empty is a missing configuration error.
    pub fn from_source(source: &dyn ParameterSource) -> Result<DeployParameters, Error> {
        let get = |name: &str| match source.get(name) {
            Some(value) if !value.trim().is_empty() => Ok(value.trim().to_owned()),
            _ => Err(Error::MissingConfiguration {
                variable: name.to_owned(),
                field: String::from("deploy parameters"),
            }),
        };
        DeployParameters::new(get(SUBDOMAIN)?, get(DOMAIN_NAME)?, get(GENERIC_TIMEZONE)?)
    }

    /// The public host name, `{subdomain}.{domain_name}`, without a protocol prefix.
    pub fn host(&self) -> String {
        format!("{}.{}", self.subdomain, self.domain_name)
    }

    /// The public webhook url, `https://{subdomain}.{domain_name}/`, with a trailing slash.
    pub fn webhook_url(&self) -> String {
        format!("https://{}/", self.host())
    }

    fn validate(&self) -> Result<(), Error> {
        validate_parameter(SUBDOMAIN, &self.subdomain)?;
        validate_parameter(DOMAIN_NAME, &self.domain_name)?;
        validate_parameter(GENERIC_TIMEZONE, &self.timezone)
    }
}

/// Check the value of one of the deploy parameters. Other names are accepted as they are.
pub fn validate_parameter(name: &str, value: &str) -> Result<(), Error> {
    match name {
        SUBDOMAIN | DOMAIN_NAME => validate_dns_name(name, value),
        GENERIC_TIMEZONE if value.is_empty() || value.contains(char::is_whitespace) => {
            Err(Error::InvalidParameter {
                parameter: name.to_owned(),
                message: format!("`{value}` is not a timezone name"),
            })
        }
        _ => Ok(()),
    }
}

impl ParameterSource for DeployParameters {
    fn get(&self, name: &str) -> Option<String> {
        match name {
            SUBDOMAIN => Some(self.subdomain.clone()),
            DOMAIN_NAME => Some(self.domain_name.clone()),
            GENERIC_TIMEZONE => Some(self.timezone.clone()),
            _ => None,
        }
    }
}

fn validate_dns_name(parameter: &str, value: &str) -> Result<(), Error> {
    let invalid = |message: &str| {
        Err(Error::InvalidParameter {
            parameter: parameter.to_owned(),
            message: format!("`{value}` {message}"),
        })
    };
    if value.contains("://") {
        return invalid("must not carry a protocol prefix");
    }
    if value.is_empty() || value.len() > 253 {
        return invalid("is not a valid host name");
    }
    for label in value.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return invalid("is not a valid host name");
        }
    }
    Ok(())
}

/// What happens to the container when it exits.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    No,
    /// Always restart.
    Always,
    /// Restart on a non-zero exit code.
    OnFailure,
    /// Restart unless stopped by the operator.
    UnlessStopped,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" | "never" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            other => Err(format!("unknown restart policy `{other}`")),
        }
    }
}

/// Transport protocol of a published port.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// A published port, host → container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host interface to bind, all interfaces when unset.
    pub host_ip: Option<String>,
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl PortMapping {
    /// Parse short syntax: `[ip:]host:container[/proto]` or a bare `port`.
    pub fn parse(service: &str, binding: &str) -> Result<PortMapping, Error> {
        let invalid = || Error::InvalidPortBinding {
            service: service.to_owned(),
            binding: binding.to_owned(),
        };

        let (ports, protocol) = match binding.rsplit_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (binding, Protocol::Tcp),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let port = |s: &str| s.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(invalid);
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [single] => (None, port(*single)?, port(*single)?),
            [host, container] => (None, port(*host)?, port(*container)?),
            [ip, host, container] if !ip.is_empty() => {
                (Some(ip.to_string()), port(*host)?, port(*container)?)
            }
            _ => return Err(invalid()),
        };

        Ok(PortMapping {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }

    /// The engine's port key, `container_port/protocol`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Whether a mount refers to a named volume or a host path.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// Orchestrator-managed named volume.
    Volume,
    /// Host path mapped into the container.
    Bind,
}

/// A mount of a volume or host path into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Volume name, or host path for bind mounts.
    pub source: String,
    /// Absolute path inside the container.
    pub target: String,
    /// Named volume or bind mount.
    pub kind: MountKind,
    /// Mounted read-only.
    pub read_only: bool,
}

impl MountSpec {
    /// Parse short syntax: `source:target[:ro|:rw]`.
    pub fn parse(service: &str, mount: &str) -> Result<MountSpec, Error> {
        let invalid = |message: &str| Error::InvalidMount {
            service: service.to_owned(),
            mount: mount.to_owned(),
            message: message.to_owned(),
        };

        let parts: Vec<&str> = mount.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            [_] => return Err(invalid("anonymous volumes are not supported")),
            _ => return Err(invalid("expected source:target[:ro]")),
        };

        if !target.starts_with('/') {
            return Err(invalid("target must be an absolute path"));
        }

        let kind = if source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
        {
            MountKind::Bind
        } else {
            let valid = source
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric())
                && source
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));
            if !valid {
                return Err(invalid("invalid volume name"));
            }
            MountKind::Volume
        };

        Ok(MountSpec {
            source: source.to_owned(),
            target: target.to_owned(),
            kind,
            read_only,
        })
    }

    /// The engine bind string, `source:target[:ro]`, with bind sources made absolute against
    /// `project_dir`.
    pub fn to_bind(&self, project_dir: &Path) -> String {
        let source = match self.kind {
            MountKind::Volume => self.source.clone(),
            MountKind::Bind => absolute_source(&self.source, project_dir)
                .display()
                .to_string(),
        };
        if self.read_only {
            format!("{}:{}:ro", source, self.target)
        } else {
            format!("{}:{}", source, self.target)
        }
    }
}

/// Resolve a bind mount source against the project directory. `~` expands to `$HOME`.
pub fn absolute_source(source: &str, project_dir: &Path) -> PathBuf {
    if let Some(rest) = source.strip_prefix('~') {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest.trim_start_matches('/'));
        }
    }
    let path = Path::new(source);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let mut out = project_dir.to_path_buf();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// One `KEY=value` environment assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvAssignment {
    /// Variable name, unique within the instance.
    pub key: String,
    /// Resolved value.
    pub value: String,
}

impl fmt::Display for EnvAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// How the orchestrator treats a declared volume.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningPolicy {
    /// Must already exist; never created.
    External,
    /// Created when absent.
    Managed,
}

/// A resolved top-level volume declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDeclaration {
    /// Declaration key, as referenced by mounts.
    pub key: String,
    /// Name of the volume on the daemon.
    pub name: String,
    /// Provisioning policy.
    pub policy: ProvisioningPolicy,
}

/// A fully resolved service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Service name, also used as container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Restart policy.
    pub restart: RestartPolicy,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Environment, in declaration order.
    pub environment: Vec<EnvAssignment>,
    /// Mounts, in declaration order.
    pub mounts: Vec<MountSpec>,
}

impl ServiceInstance {
    /// The value assigned to `key`, if any.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    /// The mount whose container path is `target`.
    pub fn mount_at(&self, target: &str) -> Option<&MountSpec> {
        self.mounts.iter().find(|m| m.target == target)
    }
}

/// A descriptor with every substitution resolved and every field parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDescriptor {
    /// Service instances, in declaration order.
    pub services: Vec<ServiceInstance>,
    /// Volume declarations, in declaration order.
    pub volumes: Vec<VolumeDeclaration>,
    /// Directory bind mount sources are relative to.
    pub project_dir: PathBuf,
}

impl ResolvedDescriptor {
    /// The service called `name`.
    pub fn service(&self, name: &str) -> Option<&ServiceInstance> {
        self.services.iter().find(|s| s.name == name)
    }

    /// The declaration for volume key `key`.
    pub fn volume(&self, key: &str) -> Option<&VolumeDeclaration> {
        self.volumes.iter().find(|v| v.key == key)
    }
}

/// Resolve every substitution in `descriptor` from `source` and validate the result.
///
/// Deploy parameters set in `source` are validated before anything is substituted, whether or
/// not the descriptor refers to them. Unset ones only fail where they are used.
pub fn resolve(
    descriptor: &ServiceDescriptor,
    source: &dyn ParameterSource,
) -> Result<ResolvedDescriptor, Error> {
    for name in [SUBDOMAIN, DOMAIN_NAME, GENERIC_TIMEZONE] {
        match source.get(name) {
            Some(value) if !value.is_empty() => validate_parameter(name, &value)?,
            _ => {}
        }
    }

    let mut volumes = Vec::with_capacity(descriptor.volumes.len());
    for (key, spec) in &descriptor.volumes {
        let VolumeSpec { external, name } = spec.clone().unwrap_or_default();
        let name = match name {
            Some(name) => interpolate(&name, &format!("volumes.{key}.name"), source)?,
            None => key.clone(),
        };
        volumes.push(VolumeDeclaration {
            key: key.clone(),
            name,
            policy: if external {
                ProvisioningPolicy::External
            } else {
                ProvisioningPolicy::Managed
            },
        });
    }

    let mut services = Vec::with_capacity(descriptor.services.len());
    for (name, spec) in &descriptor.services {
        let field = |suffix: &str| format!("services.{name}.{suffix}");

        let image = interpolate(&spec.image, &field("image"), source)?;
        let restart = match &spec.restart {
            Some(restart) => interpolate(restart, &field("restart"), source)?
                .parse::<RestartPolicy>()
                .map_err(|message| Error::DescriptorParse { message })?,
            None => RestartPolicy::No,
        };

        let mut ports = Vec::with_capacity(spec.ports.len());
        for port in &spec.ports {
            let port = interpolate(port, &field("ports"), source)?;
            ports.push(PortMapping::parse(name, &port)?);
        }

        let mut environment = Vec::new();
        for (key, template) in spec.environment.assignments(name)? {
            let value = interpolate(&template, &field(&format!("environment.{key}")), source)?;
            environment.push(EnvAssignment { key, value });
        }

        let mut mounts = Vec::with_capacity(spec.volumes.len());
        for mount in &spec.volumes {
            let mount = interpolate(mount, &field("volumes"), source)?;
            let mount = MountSpec::parse(name, &mount)?;
            if mount.kind == MountKind::Volume && !volumes.iter().any(|v| v.key == mount.source) {
                return Err(Error::UndeclaredVolume {
                    service: name.clone(),
                    volume: mount.source,
                });
            }
            mounts.push(mount);
        }

        let instance = ServiceInstance {
            name: name.clone(),
            image,
            restart,
            ports,
            environment,
            mounts,
        };
        validate_instance(&instance)?;
        services.push(instance);
    }

    let project_dir = descriptor
        .project_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    debug!("resolved {} service(s), {} volume(s)", services.len(), volumes.len());
    Ok(ResolvedDescriptor {
        services,
        volumes,
        project_dir,
    })
}

// host names carry no scheme, urls parse and use https
fn validate_instance(instance: &ServiceInstance) -> Result<(), Error> {
    for EnvAssignment { key, value } in &instance.environment {
        let invalid = |message: String| Error::InvalidParameter {
            parameter: format!("services.{}.environment.{}", instance.name, key),
            message,
        };
        if key.ends_with("_HOST") && value.contains("://") {
            return Err(invalid(format!("host `{value}` must not carry a protocol prefix")));
        }
        if key.ends_with("_URL") {
            let url = Url::parse(value).map_err(|e| invalid(format!("`{value}`: {e}")))?;
            if url.host_str().map_or(true, str::is_empty) {
                return Err(invalid(format!("`{value}` has no host")));
            }
        }
    }
    Ok(())
}
