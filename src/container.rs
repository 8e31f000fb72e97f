//! Resolve containers to their pid on the host via the docker engine api

use hyper::{Client, StatusCode};
use hyperlocal::{UnixClientExt, Uri};
use log::debug;
use nix::unistd::Pid;
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::proc::HostProcess;

/// How long we wait for the container runtime before giving up
pub const DEFAULT_RUNTIME_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors when resolving a container to a host process
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The runtime does not know a container with this name
    #[error("container '{0}' not found")]
    ContainerNotFound(String),
    /// The container exists but has no running main process
    #[error("container '{0}' is not running")]
    ContainerNotRunning(String),
    /// The runtime could not be contacted or did not answer in time
    #[error("container runtime at {endpoint} is unreachable: {reason}")]
    RuntimeUnreachable {
        /// Endpoint we tried
        endpoint: String,
        /// What went wrong
        reason: String,
    },
    /// The runtime answered with something we do not understand
    #[error("unexpected response from container runtime: {0}")]
    RuntimeProtocolError(String),
}

/// Resolves a container name to its main process on the host
pub trait ContainerResolver {
    /// Returns the top-level process of `target` with its pid outside any pid namespace
    fn resolve(
        &self,
        target: &ContainerTarget,
    ) -> impl Future<Output = Result<HostProcess, ResolveError>> + Send;
}

/// Where the container runtime listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    /// A local unix socket, i.e. `/var/run/docker.sock`
    Unix(PathBuf),
    /// Plain http over tcp
    Http(Url),
}

impl RuntimeEndpoint {
    /// Parses a bare socket path, `unix://<path>`, `tcp://host:port` or `http://host:port`
    pub fn parse(endpoint: &str) -> Result<Self, ResolveError> {
        if endpoint.starts_with('/') {
            return Ok(RuntimeEndpoint::Unix(PathBuf::from(endpoint)));
        }
        let url = Url::parse(endpoint).map_err(|e| ResolveError::RuntimeUnreachable {
            endpoint: endpoint.to_string(),
            reason: format!("invalid endpoint: {e}"),
        })?;
        match url.scheme() {
            "unix" => match url.host_str() {
                // `unix://var/run/docker.sock` would silently turn into `/run/docker.sock`
                Some(host) if !host.is_empty() => Err(ResolveError::RuntimeUnreachable {
                    endpoint: endpoint.to_string(),
                    reason: format!("unix endpoint must be an absolute path, got host '{host}'"),
                }),
                _ => Ok(RuntimeEndpoint::Unix(PathBuf::from(url.path()))),
            },
            "http" => Ok(RuntimeEndpoint::Http(url)),
            "tcp" => {
                let http = endpoint.replacen("tcp://", "http://", 1);
                let url = Url::parse(&http).map_err(|e| ResolveError::RuntimeUnreachable {
                    endpoint: endpoint.to_string(),
                    reason: format!("invalid endpoint: {e}"),
                })?;
                Ok(RuntimeEndpoint::Http(url))
            }
            scheme => Err(ResolveError::RuntimeUnreachable {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme '{scheme}'"),
            }),
        }
    }
}

impl std::fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            RuntimeEndpoint::Http(url) => write!(f, "{url}"),
        }
    }
}

/// A container to protect, together with the runtime that manages it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    /// Container name as known to the runtime
    pub name: String,
    /// Runtime endpoint to query
    pub endpoint: RuntimeEndpoint,
}

impl ContainerTarget {
    /// Returns the container `name` managed by the runtime at `endpoint`
    pub fn new(name: &str, endpoint: &str) -> Result<Self, ResolveError> {
        Ok(ContainerTarget {
            name: name.to_string(),
            endpoint: RuntimeEndpoint::parse(endpoint)?,
        })
    }
}

/// The subset of `GET /containers/{id}/json` we care about
#[derive(Deserialize, Debug)]
struct ContainerInspect {
    #[serde(rename = "State")]
    state: ContainerState,
}

#[derive(Deserialize, Debug)]
struct ContainerState {
    #[serde(rename = "Pid")]
    pid: i64,
}

/// A minimal docker engine api client.
///
/// The endpoint is taken from each [`ContainerTarget`], the client only carries the transport.
#[derive(Debug)]
pub struct DockerClient {
    timeout: Duration,
    http: reqwest::Client,
}

impl Default for DockerClient {
    fn default() -> Self {
        DockerClient::new()
    }
}

fn unreachable<E: std::fmt::Display>(endpoint: &RuntimeEndpoint, err: E) -> ResolveError {
    ResolveError::RuntimeUnreachable {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    }
}

impl DockerClient {
    /// Returns a new docker client
    pub fn new() -> DockerClient {
        DockerClient {
            timeout: DEFAULT_RUNTIME_TIMEOUT,
            http: reqwest::Client::new(),
        }
    }

    /// Change how long a single request may take
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get_unix(&self, socket: &Path, path: &str) -> Result<(StatusCode, Vec<u8>), ResolveError> {
        let url = Uri::new(socket, path).into();
        let res = Client::unix()
            .get(url)
            .await
            .map_err(|e| unreachable(&RuntimeEndpoint::Unix(socket.to_owned()), e))?;
        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body())
            .await
            .map_err(|e| ResolveError::RuntimeProtocolError(format!("cannot read body: {e}")))?;
        Ok((status, body.to_vec()))
    }

    async fn get_http(&self, base: &Url, path: &str) -> Result<(StatusCode, Vec<u8>), ResolveError> {
        let url = base
            .join(path)
            .map_err(|e| ResolveError::RuntimeProtocolError(format!("cannot build url: {e}")))?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| unreachable(&RuntimeEndpoint::Http(base.clone()), e))?;
        let status = StatusCode::from_u16(res.status().as_u16())
            .map_err(|e| ResolveError::RuntimeProtocolError(e.to_string()))?;
        let body = res
            .bytes()
            .await
            .map_err(|e| ResolveError::RuntimeProtocolError(format!("cannot read body: {e}")))?;
        Ok((status, body.to_vec()))
    }

    async fn inspect(&self, target: &ContainerTarget) -> Result<HostProcess, ResolveError> {
        let container = target.name.as_str();
        let path = format!("/containers/{container}/json");
        let (status, body) = match &target.endpoint {
            RuntimeEndpoint::Unix(socket) => self.get_unix(socket, &path).await?,
            RuntimeEndpoint::Http(base) => self.get_http(base, &path).await?,
        };
        debug!("inspect {} on {} returned {}", container, target.endpoint, status);
        match status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(ResolveError::ContainerNotFound(container.to_string()))
            }
            code => {
                return Err(ResolveError::RuntimeProtocolError(format!(
                    "inspect of '{}' returned {}: {}",
                    container,
                    code,
                    String::from_utf8_lossy(&body)
                )))
            }
        }
        let inspect: ContainerInspect = serde_json::from_slice(&body)
            .map_err(|e| ResolveError::RuntimeProtocolError(format!("cannot decode inspect response: {e}")))?;
        // docker reports pid 0 for stopped containers
        let pid = match i32::try_from(inspect.state.pid) {
            Ok(pid) if pid > 0 => Pid::from_raw(pid),
            Ok(_) => return Err(ResolveError::ContainerNotRunning(container.to_string())),
            Err(_) => {
                return Err(ResolveError::RuntimeProtocolError(format!(
                    "pid {} out of range",
                    inspect.state.pid
                )))
            }
        };
        Ok(HostProcess {
            pid,
            name: container.to_string(),
        })
    }
}

impl ContainerResolver for DockerClient {
    async fn resolve(&self, target: &ContainerTarget) -> Result<HostProcess, ResolveError> {
        match tokio::time::timeout(self.timeout, self.inspect(target)).await {
            Ok(res) => res,
            Err(_) => Err(unreachable(
                &target.endpoint,
                format!("no answer within {}s", self.timeout.as_secs_f32()),
            )),
        }
    }
}
