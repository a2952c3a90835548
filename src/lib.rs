//! # n8n-deploy: deploy and initialize a self-hosted n8n instance on docker
//!
//! The crate has two halves.
//!
//! The **service descriptor** declares the n8n service: image, published port, environment,
//! the external state volume and the bind mounts shared with python Code nodes. It is read
//! from a Compose-style YAML file or taken from [`ServiceDescriptor::n8n`], then resolved
//! against deploy parameters (`SUBDOMAIN`, `DOMAIN_NAME`, `GENERIC_TIMEZONE`).
//!
//! The **post-deployment initializer** runs once the container is up. It fixes ownership of
//! the shared files directory, installs `ffmpeg`, verifies the tool environment and installs the
//! python requirements manifest.
//!
//! In between, the [`Orchestrator`] materializes the descriptor through a small asynchronous
//! docker client, [`Docker`].
//!
//! # Usage
//!
//! ## Connecting with the docker daemon
//!
//! The client connects to the location in `DOCKER_HOST`, or to the standard unix socket
//! `/var/run/docker.sock` when unset.
//!
//! ```rust,no_run
//! use n8n_deploy::Docker;
//! Docker::connect_with_local_defaults();
//! ```
//!
//! ## Resolving the descriptor
//!
//! ```rust
//! use std::collections::HashMap;
//! use n8n_deploy::{resolve, ServiceDescriptor};
//!
//! let params: HashMap<String, String> = [
//!     ("SUBDOMAIN", "n8n"),
//!     ("DOMAIN_NAME", "example.com"),
//!     ("GENERIC_TIMEZONE", "Europe/Berlin"),
//! ]
//! .into_iter()
//! .map(|(k, v)| (k.to_string(), v.to_string()))
//! .collect();
//!
//! let resolved = resolve(&ServiceDescriptor::n8n(), &params).unwrap();
//! let n8n = resolved.service("n8n").unwrap();
//! assert_eq!(n8n.env("WEBHOOK_URL"), Some("https://n8n.example.com/"));
//! ```
//!
//! ## Deploying
//!
//! ```rust,no_run
//! # use std::collections::HashMap;
//! use n8n_deploy::{resolve, Docker, InitializerConfig, Orchestrator, ServiceDescriptor, ToolEnvironment};
//!
//! # async fn run(params: HashMap<String, String>) -> Result<(), n8n_deploy::errors::Error> {
//! let resolved = resolve(&ServiceDescriptor::n8n(), &params)?;
//! let orchestrator = Orchestrator::new(Docker::connect_with_local_defaults()?)
//!     .with_tool_environment(ToolEnvironment::default());
//!
//! for provisioned in orchestrator.provision(&resolved).await? {
//!     let report = orchestrator
//!         .initialize(&provisioned, InitializerConfig::default())
//!         .await?;
//!     println!("changed anything: {}", report.changed());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Integration tests
//!
//! Tests against a live daemon are behind the `test_docker` feature. They expect the
//! `docker.n8n.io/n8nio/n8n` image to be pullable.
//!
//! ```bash
//! cargo test --features test_docker -- --test-threads 1
//! ```
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces
)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_qualifications,
    rust_2018_idioms
)]

#[macro_use]
extern crate log;

// declare modules
pub mod container;
pub mod descriptor;
mod docker;
pub mod errors;
pub mod exec;
pub mod image;
pub mod initializer;
pub mod interpolate;
pub mod manifest;
pub mod models;
pub mod orchestrator;
pub mod read;
pub mod resolve;
pub mod runtime;
pub mod scripts;
pub mod state;
pub mod volume;

// publicly re-export
pub use crate::descriptor::ServiceDescriptor;
pub use crate::docker::{ClientVersion, Docker, API_DEFAULT_VERSION, DEFAULT_SOCKET, DEFAULT_TIMEOUT};
pub use crate::initializer::{
    InitReport, Initializer, InitializerConfig, RetryPolicy, ToolEnvironment,
};
pub use crate::orchestrator::{DeploymentStatus, Orchestrator, Provisioned};
pub use crate::resolve::{resolve, DeployParameters, ResolvedDescriptor};
