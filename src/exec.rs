//! Exec API: Run new commands inside running containers

use bytes::Bytes;
use http::request::Builder;
use http_body_util::Full;
use hyper::Method;

use super::Docker;

use crate::errors::Error;
use crate::models::{ExecConfig, ExecInspectResponse, IdResponse, StartExecOptions};
use crate::read::{decode_all, LogOutput, LogOutputDecoder};

impl Docker {
    /// ---
    ///
    /// # Create Exec
    ///
    /// Run a command inside a running container.
    ///
    /// # Arguments
    ///
    ///  - Container name as string slice.
    ///  - [Exec Config](ExecConfig) struct.
    ///
    /// # Returns
    ///
    ///  - An [Id Response](IdResponse) struct, wrapped in a Future.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use n8n_deploy::Docker;
    /// # let docker = Docker::connect_with_local_defaults().unwrap();
    /// use n8n_deploy::models::ExecConfig;
    ///
    /// let config = ExecConfig {
    ///     cmd: Some(vec![String::from("ffmpeg"), String::from("-version")]),
    ///     attach_stdout: Some(true),
    ///     ..Default::default()
    /// };
    ///
    /// docker.create_exec("n8n", config);
    /// ```
    pub async fn create_exec(
        &self,
        container_name: &str,
        config: ExecConfig,
    ) -> Result<IdResponse, Error> {
        let url = format!("/containers/{container_name}/exec");

        let req = self.build_request(
            &url,
            Builder::new().method(Method::POST),
            None::<String>,
            Docker::serialize_payload(Some(config)),
        );

        self.process_into_value(req).await
    }

    /// ---
    ///
    /// # Start Exec
    ///
    /// Starts a previously set up exec instance and waits for the command to finish. The call is
    /// not subject to the client timeout: package installs may legitimately run for a long time.
    ///
    /// # Arguments
    ///
    ///  - The ID of the previously created exec configuration.
    ///
    /// # Returns
    ///
    ///  - The demultiplexed [Log Output](LogOutput) of the command, wrapped in a Future.
    pub async fn start_exec(&self, exec_id: &str) -> Result<Vec<LogOutput>, Error> {
        let url = format!("/exec/{exec_id}/start");

        let req = self.build_request(
            &url,
            Builder::new().method(Method::POST),
            None::<String>,
            Docker::serialize_payload(Some(StartExecOptions::default())),
        );

        let body = self.process_into_bytes(req, None).await?;
        decode_all(LogOutputDecoder::new(), &body)
    }

    /// ---
    ///
    /// # Inspect Exec
    ///
    /// Return low-level information about an exec instance.
    ///
    /// # Arguments
    ///
    ///  - The ID of the previously created exec configuration.
    ///
    /// # Returns
    ///
    ///  - An [ExecInspectResponse](ExecInspectResponse) struct, wrapped in a Future.
    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse, Error> {
        let url = format!("/exec/{exec_id}/json");

        let req = self.build_request(
            &url,
            Builder::new().method(Method::GET),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );

        self.process_into_value(req).await
    }
}
