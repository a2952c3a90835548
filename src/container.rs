//! Container API: create, start, inspect and remove the service container.

use bytes::Bytes;
use http::request::Builder;
use http_body_util::Full;
use hyper::Method;
use serde_derive::Serialize;

use super::Docker;
use crate::errors::Error;
use crate::models::*;

/// Parameters used in the [Create Container API](Docker::create_container())
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateContainerOptions {
    /// Assign the specified name to the container.
    pub name: String,
}

/// Parameters used in the [Remove Container API](Docker::remove_container())
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RemoveContainerOptions {
    /// Remove the anonymous volumes associated with the container.
    pub v: bool,
    /// If the container is running, kill it before removing it.
    pub force: bool,
}

impl Docker {
    /// ---
    ///
    /// # Create Container
    ///
    /// Prepares a container for a subsequent start operation.
    ///
    /// # Arguments
    ///
    ///  - Optional [Create Container Options](CreateContainerOptions) struct.
    ///  - [Container Create Body](ContainerCreateBody) struct.
    ///
    /// # Returns
    ///
    ///  - [Container Create Response](ContainerCreateResponse), wrapped in a Future.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use n8n_deploy::Docker;
    /// # let docker = Docker::connect_with_local_defaults().unwrap();
    /// use n8n_deploy::container::CreateContainerOptions;
    /// use n8n_deploy::models::ContainerCreateBody;
    ///
    /// let options = Some(CreateContainerOptions {
    ///     name: String::from("n8n"),
    /// });
    ///
    /// let config = ContainerCreateBody {
    ///     image: Some(String::from("docker.n8n.io/n8nio/n8n")),
    ///     ..Default::default()
    /// };
    ///
    /// docker.create_container(options, config);
    /// ```
    pub async fn create_container(
        &self,
        options: Option<CreateContainerOptions>,
        config: ContainerCreateBody,
    ) -> Result<ContainerCreateResponse, Error> {
        let url = "/containers/create";

        let req = self.build_request(
            url,
            Builder::new().method(Method::POST),
            options,
            Docker::serialize_payload(Some(config)),
        );

        self.process_into_value(req).await
    }

    /// ---
    ///
    /// # Start Container
    ///
    /// Starts a container, after preparing it with the [Create Container
    /// API](Docker::create_container()). Starting a container that is already running is not an
    /// error.
    ///
    /// # Arguments
    ///
    ///  - Container name as a string slice.
    ///
    /// # Returns
    ///
    ///  - unit type `()`, wrapped in a Future.
    pub async fn start_container(&self, container_name: &str) -> Result<(), Error> {
        let url = format!("/containers/{container_name}/start");

        let req = self.build_request(
            &url,
            Builder::new().method(Method::POST),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );

        self.process_into_unit(req).await
    }

    /// ---
    ///
    /// # Inspect Container
    ///
    /// Inspect a container.
    ///
    /// # Arguments
    ///
    ///  - Container name as a string slice.
    ///
    /// # Returns
    ///
    ///  - [Container Inspect Response](ContainerInspectResponse), wrapped in a Future.
    pub async fn inspect_container(
        &self,
        container_name: &str,
    ) -> Result<ContainerInspectResponse, Error> {
        let url = format!("/containers/{container_name}/json");

        let req = self.build_request(
            &url,
            Builder::new().method(Method::GET),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );

        self.process_into_value(req).await
    }

    /// ---
    ///
    /// # Remove Container
    ///
    /// Remove a container.
    ///
    /// # Arguments
    ///
    /// - Container name as a string slice.
    /// - Optional [Remove Container Options](RemoveContainerOptions) struct.
    ///
    /// # Returns
    ///
    ///  - unit type `()`, wrapped in a Future.
    pub async fn remove_container(
        &self,
        container_name: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), Error> {
        let url = format!("/containers/{container_name}");

        let req = self.build_request(
            &url,
            Builder::new().method(Method::DELETE),
            options,
            Ok(Full::new(Bytes::new())),
        );

        self.process_into_unit(req).await
    }
}
