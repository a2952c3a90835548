use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::request::Builder;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use serde::de::DeserializeOwned;
use serde::ser::Serialize;

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Error;
use crate::models::ErrorResponse;

/// The default `DOCKER_SOCKET` address that we will try to connect to.
pub const DEFAULT_SOCKET: &str = "unix:///var/run/docker.sock";

/// Default timeout for all requests is 2 minutes.
pub const DEFAULT_TIMEOUT: u64 = 120;

/// Default Client Version to communicate with the server.
pub const API_DEFAULT_VERSION: &ClientVersion = &ClientVersion {
    major_version: 1,
    minor_version: 41,
};

pub(crate) type BodyType = Full<Bytes>;

/// Advertised version of the docker engine API used in request paths.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClientVersion {
    /// The major version number.
    pub major_version: usize,
    /// The minor version number.
    pub minor_version: usize,
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major_version, self.minor_version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientType {
    Unix,
    Http,
}

pub(crate) enum Transport {
    Http {
        client: Client<HttpConnector, BodyType>,
    },
    Unix {
        client: Client<UnixConnector, BodyType>,
    },
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Http { .. } => write!(f, "HTTP"),
            Transport::Unix { .. } => write!(f, "Unix"),
        }
    }
}

/// ---
///
/// # Docker
///
/// The main interface for calling the Docker engine API. Construct a new Docker instance using
/// one of the connect methods:
///  - [`Docker::connect_with_http`](Docker::connect_with_http())
///  - [`Docker::connect_with_unix`](Docker::connect_with_unix())
///  - [`Docker::connect_with_local_defaults`](Docker::connect_with_local_defaults())
#[derive(Debug, Clone)]
pub struct Docker {
    pub(crate) transport: Arc<Transport>,
    pub(crate) client_type: ClientType,
    pub(crate) client_addr: String,
    pub(crate) client_timeout: u64,
    pub(crate) version: ClientVersion,
}

impl Docker {
    /// Connect using unsecured HTTP.
    ///
    /// # Arguments
    ///
    ///  - `addr`: connection url including scheme and port, e.g. `tcp://localhost:2375`.
    ///  - `timeout`: the read/write timeout (seconds) to use for every hyper connection
    ///  - `client_version`: the client version to communicate with the server.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use n8n_deploy::{API_DEFAULT_VERSION, Docker};
    ///
    /// let connection = Docker::connect_with_http(
    ///                    "tcp://localhost:2375/", 4, API_DEFAULT_VERSION).unwrap();
    /// ```
    pub fn connect_with_http(
        addr: &str,
        timeout: u64,
        client_version: &ClientVersion,
    ) -> Result<Docker, Error> {
        let client_addr = addr
            .trim_start_matches("tcp://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_owned();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let client = Client::builder(TokioExecutor::new()).build(http_connector);

        Ok(Docker {
            transport: Arc::new(Transport::Http { client }),
            client_type: ClientType::Http,
            client_addr,
            client_timeout: timeout,
            version: *client_version,
        })
    }

    /// Connect using a Unix socket.
    ///
    /// # Arguments
    ///
    ///  - `path`: connection unix socket path, with or without the `unix://` prefix.
    ///  - `timeout`: the read/write timeout (seconds) to use for every hyper connection
    ///  - `client_version`: the client version to communicate with the server.
    pub fn connect_with_unix(
        path: &str,
        timeout: u64,
        client_version: &ClientVersion,
    ) -> Result<Docker, Error> {
        let client_addr = path.trim_start_matches("unix://").to_owned();

        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);

        Ok(Docker {
            transport: Arc::new(Transport::Unix { client }),
            client_type: ClientType::Unix,
            client_addr,
            client_timeout: timeout,
            version: *client_version,
        })
    }

    /// Connect using a Unix socket at the default location, `/var/run/docker.sock`.
    pub fn connect_with_unix_defaults() -> Result<Docker, Error> {
        Docker::connect_with_unix(DEFAULT_SOCKET, DEFAULT_TIMEOUT, API_DEFAULT_VERSION)
    }

    /// Connect to the daemon pointed to by the `DOCKER_HOST` environment variable, falling back
    /// to the default unix socket when it is unset.
    pub fn connect_with_local_defaults() -> Result<Docker, Error> {
        match env::var("DOCKER_HOST") {
            Ok(host) => Docker::connect_with_host(&host, DEFAULT_TIMEOUT),
            Err(_) => Docker::connect_with_unix_defaults(),
        }
    }

    /// Connect to the daemon at `host`, choosing the transport from the url scheme.
    pub fn connect_with_host(host: &str, timeout: u64) -> Result<Docker, Error> {
        if host.starts_with("unix://") {
            Docker::connect_with_unix(host, timeout, API_DEFAULT_VERSION)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION)
        } else {
            Err(Error::UnsupportedURISchemeError {
                host: host.to_owned(),
            })
        }
    }

    /// Set the request timeout.
    ///
    /// This timeout is shared by all requests to the Docker Engine API, except for the streams
    /// of exec instances, which run until the command finishes.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout.as_secs();
        self
    }

    /// Get the current timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    /// ---
    ///
    /// # Ping
    ///
    /// This is a dummy endpoint you can use to test if the server is accessible.
    pub async fn ping(&self) -> Result<String, Error> {
        let req = self.build_request(
            "/_ping",
            Builder::new().method(http::Method::GET),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );

        let response = self.process_request(req, Some(self.timeout())).await?;
        let bytes = Docker::decode_into_bytes(response).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Docker {
    pub(crate) fn serialize_payload<S>(body: Option<S>) -> Result<BodyType, Error>
    where
        S: Serialize,
    {
        match body.map(|inst| serde_json::to_string(&inst)) {
            Some(Ok(res)) => Ok(Full::new(Bytes::from(res))),
            Some(Err(e)) => Err(e.into()),
            None => Ok(Full::new(Bytes::new())),
        }
    }

    pub(crate) fn request_uri<O>(&self, path: &str, query: Option<O>) -> Result<hyper::Uri, Error>
    where
        O: Serialize,
    {
        let mut path_and_query = format!("/v{}{}", self.version, path);
        if let Some(query) = query {
            let encoded = serde_urlencoded::to_string(query)?;
            if !encoded.is_empty() {
                path_and_query.push('?');
                path_and_query.push_str(&encoded);
            }
        }

        match self.client_type {
            ClientType::Http => {
                Ok(format!("http://{}{}", self.client_addr, path_and_query).parse()?)
            }
            ClientType::Unix => Ok(hyperlocal::Uri::new(
                PathBuf::from(&self.client_addr),
                &path_and_query,
            )
            .into()),
        }
    }

    pub(crate) fn build_request<O>(
        &self,
        path: &str,
        builder: Builder,
        query: Option<O>,
        payload: Result<BodyType, Error>,
    ) -> Result<Request<BodyType>, Error>
    where
        O: Serialize,
    {
        let uri = self.request_uri(path, query)?;
        debug!("{} {}", builder.method_ref().map(|m| m.as_str()).unwrap_or("?"), uri);
        Ok(builder
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(payload?)?)
    }

    pub(crate) async fn process_into_value<T>(
        &self,
        req: Result<Request<BodyType>, Error>,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let response = self.process_request(req, Some(self.timeout())).await?;
        let bytes = Docker::decode_into_bytes(response).await?;
        Docker::decode_json(&bytes)
    }

    pub(crate) async fn process_into_unit(
        &self,
        req: Result<Request<BodyType>, Error>,
    ) -> Result<(), Error> {
        let response = self.process_request(req, Some(self.timeout())).await?;
        Docker::decode_into_bytes(response).await?;
        Ok(())
    }

    /// Reads a whole response body. A `None` timeout lets the body stream for as long as the
    /// daemon keeps it open.
    pub(crate) async fn process_into_bytes(
        &self,
        req: Result<Request<BodyType>, Error>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, Error> {
        let response = self.process_request(req, timeout).await?;
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, Docker::decode_into_bytes(response))
                .await
                .map_err(|_| Error::RequestTimeoutError)?,
            None => Docker::decode_into_bytes(response).await,
        }
    }

    pub(crate) async fn process_request(
        &self,
        request: Result<Request<BodyType>, Error>,
        timeout: Option<Duration>,
    ) -> Result<Response<Incoming>, Error> {
        let request = request?;
        let response = self.execute_request(request, timeout).await?;

        let status = response.status();
        match status {
            // Status code 200 - 299 or 304
            s if s.is_success() || s == StatusCode::NOT_MODIFIED => Ok(response),

            // All other status codes
            _ => {
                let contents = Docker::decode_into_string(response).await?;

                let message = serde_json::from_str::<ErrorResponse>(&contents)
                    .map(|ErrorResponse { message }| message)
                    .unwrap_or(contents);

                Err(Error::DockerResponseServerError {
                    status_code: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn execute_request(
        &self,
        req: Request<BodyType>,
        timeout: Option<Duration>,
    ) -> Result<Response<Incoming>, Error> {
        let request = match self.transport.as_ref() {
            Transport::Http { ref client } => client.request(req),
            Transport::Unix { ref client } => client.request(req),
        };

        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, request).await {
                Ok(v) => Ok(v?),
                Err(_) => Err(Error::RequestTimeoutError),
            },
            None => Ok(request.await?),
        }
    }

    async fn decode_into_bytes(response: Response<Incoming>) -> Result<Bytes, Error> {
        Ok(response.into_body().collect().await?.to_bytes())
    }

    async fn decode_into_string(response: Response<Incoming>) -> Result<String, Error> {
        let body = Docker::decode_into_bytes(response).await?;
        Ok(String::from_utf8_lossy(&body).to_string())
    }

    pub(crate) fn decode_json<T>(bytes: &[u8]) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(|e| {
            if e.is_data() || e.is_syntax() {
                let contents = String::from_utf8_lossy(bytes);
                Error::JsonDataError {
                    message: e.to_string(),
                    column: e.column(),
                    #[cfg(feature = "json_data_content")]
                    contents: contents.into_owned(),
                    #[cfg(not(feature = "json_data_content"))]
                    contents: contents.chars().take(80).collect(),
                }
            } else {
                e.into()
            }
        })
    }
}
