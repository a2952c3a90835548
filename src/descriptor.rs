//! Descriptor API: the declarative, Compose-style definition of the deployed service.
//!
//! A descriptor is read as written: values may still contain `${VAR}` substitutions. The
//! [resolve](crate::resolve) module turns it into concrete service instances.

use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::Error;

/// Name of the service in the built-in descriptor.
pub const N8N_SERVICE: &str = "n8n";

/// Image of the built-in descriptor.
pub const N8N_IMAGE: &str = "docker.n8n.io/n8nio/n8n";

/// Port n8n listens on, both inside the container and on the host.
pub const N8N_PORT: u16 = 5678;

/// Named volume holding the n8n application state.
pub const N8N_DATA_VOLUME: &str = "n8n_data";

/// A declarative service descriptor: services plus the named volumes they use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Services by name, in declaration order.
    pub services: IndexMap<String, ServiceSpec>,
    /// Top-level volume declarations. A `null` value declares a managed volume.
    #[serde(default)]
    pub volumes: IndexMap<String, Option<VolumeSpec>>,
    /// Directory relative bind mount sources are resolved against.
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

/// One service as written in the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Image reference.
    pub image: String,
    /// Restart policy name: `no`, `always`, `on-failure` or `unless-stopped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Port bindings in short syntax, `[ip:]host:container[/proto]`.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment assignments.
    #[serde(default)]
    pub environment: Environment,
    /// Mounts in short syntax, `source:target[:ro]`.
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Environment assignments, either as a `KEY=value` list or as a mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    /// `- KEY=value` entries. A bare `- KEY` takes its value from the parameters.
    List(Vec<String>),
    /// `KEY: value` entries.
    Map(IndexMap<String, Option<serde_yaml::Value>>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::List(Vec::new())
    }
}

impl Environment {
    /// The assignments in declaration order, as unresolved `(key, template)` pairs.
    ///
    /// Keys without a value are turned into a `${KEY}` template, so that they are looked up in
    /// the deploy parameters and fail when missing.
    pub fn assignments(&self, service: &str) -> Result<Vec<(String, String)>, Error> {
        let mut out: Vec<(String, String)> = Vec::new();
        let mut push = |key: String, value: String| {
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(Error::DescriptorParse {
                    message: format!("invalid environment key `{key}` in service {service}"),
                });
            }
            if out.iter().any(|(k, _)| *k == key) {
                return Err(Error::DuplicateEnvironmentKey {
                    service: service.to_owned(),
                    key,
                });
            }
            out.push((key, value));
            Ok(())
        };

        match self {
            Environment::List(entries) => {
                for entry in entries {
                    match entry.split_once('=') {
                        Some((key, value)) => push(key.trim().to_owned(), value.to_owned())?,
                        None => {
                            let key = entry.trim().to_owned();
                            let template = format!("${{{key}}}");
                            push(key, template)?
                        }
                    }
                }
            }
            Environment::Map(entries) => {
                for (key, value) in entries {
                    let template = match value {
                        None | Some(serde_yaml::Value::Null) => format!("${{{key}}}"),
                        Some(serde_yaml::Value::String(s)) => s.clone(),
                        Some(serde_yaml::Value::Bool(b)) => b.to_string(),
                        Some(serde_yaml::Value::Number(n)) => n.to_string(),
                        Some(_) => {
                            return Err(Error::DescriptorParse {
                                message: format!(
                                    "environment value of `{key}` in service {service} must be a scalar"
                                ),
                            })
                        }
                    };
                    push(key.clone(), template)?;
                }
            }
        }

        Ok(out)
    }
}

/// A top-level volume declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// The volume is created and owned outside of this descriptor.
    #[serde(default)]
    pub external: bool,
    /// Name of the volume on the daemon, when it differs from the declaration key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ServiceDescriptor {
    /// Parse a descriptor from YAML.
    pub fn from_yaml(contents: &str) -> Result<ServiceDescriptor, Error> {
        let descriptor: ServiceDescriptor = serde_yaml::from_str(contents)?;
        if descriptor.services.is_empty() {
            return Err(Error::DescriptorParse {
                message: String::from("no services declared"),
            });
        }
        Ok(descriptor)
    }

    /// Read a descriptor file. Its directory becomes the project directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<ServiceDescriptor, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut descriptor = ServiceDescriptor::from_yaml(&contents)?;
        descriptor.project_dir = Some(
            path.parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf(),
        );
        debug!("loaded descriptor {} with {} service(s)", path.display(), descriptor.services.len());
        Ok(descriptor)
    }

    /// Set the directory relative bind mount sources are resolved against.
    pub fn with_project_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// The built-in n8n descriptor.
    ///
    /// It publishes port 5678, runs behind an https host derived from `SUBDOMAIN` and
    /// `DOMAIN_NAME`, keeps its state in the external `n8n_data` volume and exposes the shared
    /// files directory, the scripts directory and the python dependency manifest as bind
    /// mounts.
    pub fn n8n() -> ServiceDescriptor {
        let environment = [
            "N8N_HOST=${SUBDOMAIN}.${DOMAIN_NAME}",
            "N8N_PORT=5678",
            "N8N_PROTOCOL=https",
            "N8N_ENFORCE_SETTINGS_FILE_PERMISSIONS=false",
            "NODE_ENV=production",
            "WEBHOOK_URL=https://${SUBDOMAIN}.${DOMAIN_NAME}/",
            "GENERIC_TIMEZONE=${GENERIC_TIMEZONE}",
        ];
        let mounts = [
            "n8n_data:/home/node/.n8n",
            "./local_files:/data/files",
            "./python_scripts:/data/scripts",
            "./requirements.txt:/data/requirements.txt",
        ];

        let service = ServiceSpec {
            image: N8N_IMAGE.to_owned(),
            restart: Some(String::from("always")),
            ports: vec![format!("{N8N_PORT}:{N8N_PORT}")],
            environment: Environment::List(environment.iter().map(|s| s.to_string()).collect()),
            volumes: mounts.iter().map(|s| s.to_string()).collect(),
        };

        let mut services = IndexMap::new();
        services.insert(N8N_SERVICE.to_owned(), service);

        let mut volumes = IndexMap::new();
        volumes.insert(
            N8N_DATA_VOLUME.to_owned(),
            Some(VolumeSpec {
                external: true,
                name: None,
            }),
        );

        ServiceDescriptor {
            services,
            volumes,
            project_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPOSE: &str = r#"
services:
  n8n:
    image: docker.n8n.io/n8nio/n8n
    restart: always
    ports:
      - "5678:5678"
    environment:
      - N8N_HOST=${SUBDOMAIN}.${DOMAIN_NAME}
      - N8N_PORT=5678
      - GENERIC_TIMEZONE=${GENERIC_TIMEZONE}
    volumes:
      - n8n_data:/home/node/.n8n
      - ./local_files:/data/files

volumes:
  n8n_data:
    external: true
  files_volume:
"#;

    #[test]
    fn parses_compose_layout() {
        let descriptor = ServiceDescriptor::from_yaml(COMPOSE).unwrap();
        let n8n = &descriptor.services["n8n"];
        assert_eq!(n8n.image, "docker.n8n.io/n8nio/n8n");
        assert_eq!(n8n.restart.as_deref(), Some("always"));
        assert_eq!(n8n.ports, vec!["5678:5678"]);
        assert_eq!(n8n.volumes.len(), 2);

        assert_eq!(
            descriptor.volumes["n8n_data"],
            Some(VolumeSpec {
                external: true,
                name: None
            })
        );
        assert_eq!(descriptor.volumes["files_volume"], None);

        let env = n8n.environment.assignments("n8n").unwrap();
        assert_eq!(env[0], ("N8N_HOST".into(), "${SUBDOMAIN}.${DOMAIN_NAME}".into()));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn map_environment_keeps_order_and_scalars() {
        let yaml = r#"
services:
  n8n:
    image: n8n
    environment:
      N8N_PORT: 5678
      N8N_ENFORCE_SETTINGS_FILE_PERMISSIONS: false
      GENERIC_TIMEZONE:
"#;
        let descriptor = ServiceDescriptor::from_yaml(yaml).unwrap();
        let env = descriptor.services["n8n"]
            .environment
            .assignments("n8n")
            .unwrap();
        assert_eq!(
            env,
            vec![
                ("N8N_PORT".into(), "5678".into()),
                ("N8N_ENFORCE_SETTINGS_FILE_PERMISSIONS".into(), "false".into()),
                ("GENERIC_TIMEZONE".into(), "${GENERIC_TIMEZONE}".into()),
            ]
        );
    }

    #[test]
    fn duplicate_environment_keys_are_rejected() {
        let env = Environment::List(vec!["A=1".into(), "B=2".into(), "A=3".into()]);
        match env.assignments("n8n") {
            Err(Error::DuplicateEnvironmentKey { key, .. }) => assert_eq!(key, "A"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_keys_are_invalid_before_duplicates() {
        let env = Environment::List(vec!["=a".into(), "=b".into()]);
        match env.assignments("n8n") {
            Err(Error::DescriptorParse { message }) => {
                assert_eq!(message, "invalid environment key `` in service n8n")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_descriptor_is_rejected() {
        assert!(matches!(
            ServiceDescriptor::from_yaml("services: {}\n"),
            Err(Error::DescriptorParse { .. })
        ));
    }

    #[test]
    fn built_in_descriptor_omits_files_volume() {
        let descriptor = ServiceDescriptor::n8n();
        assert_eq!(descriptor.volumes.len(), 1);
        assert!(descriptor.volumes.contains_key(N8N_DATA_VOLUME));
        let n8n = &descriptor.services[N8N_SERVICE];
        assert_eq!(n8n.ports, vec!["5678:5678"]);
        assert_eq!(n8n.volumes.len(), 4);
    }
}
