use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hyper::{Body, Client, Method, Request, Response};
use hyperlocal::{UnixClientExt, Uri};
use serde::de::DeserializeOwned;

use super::{ApiResponse, IpAddrResponse, PurgeRequest, VpnControlRequest};

async fn parse_response<T: DeserializeOwned>(req: Response<Body>) -> Result<T> {
    let body_bytes = hyper::body::to_bytes(req.into_body()).await?;
    let body =
        String::from_utf8(body_bytes.to_vec()).context("Cannot decode api response as string")?;
    serde_json::from_str(&body)
        .with_context(|| format!("Cannot decode api response as json: {body}"))
}

/// A client to interact with the hostguard control socket
#[derive(Debug)]
pub struct CommandClient {
    socket_path: PathBuf,
}

impl CommandClient {
    /// Returns a new client for the given control socket
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_owned(),
        }
    }

    async fn request(&self, method: Method, path: &str, body: Option<String>) -> Result<Response<Body>> {
        let url = Uri::new(&self.socket_path, path);
        let req = Request::builder()
            .method(method)
            .uri(url)
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .context("failed to build request")?;

        Client::unix().request(req).await.with_context(|| {
            format!(
                "failed to connect to hostguard via {}",
                self.socket_path.display()
            )
        })
    }

    /// Sends a request and returns the message of the api response
    async fn call(&self, method: Method, path: &str, body: Option<String>, what: &str) -> Result<String> {
        let res = self.request(method, path, body).await?;
        let code = res.status();
        let resp: ApiResponse = parse_response(res)
            .await
            .context("failed to parse response")?;
        if !code.is_success() {
            bail!(
                "Request to {} failed: {} (status: {})",
                what,
                resp.message,
                resp.status
            )
        };
        Ok(resp.message)
    }

    /// Check that hostguard is alive
    pub async fn ping(&self) -> Result<String> {
        self.call(Method::GET, "/ping", None, "ping").await
    }

    /// Get the ip addresses of the device
    pub async fn ip_addresses(&self) -> Result<Vec<String>> {
        let res = self.request(Method::GET, "/v1/ipaddr", None).await?;
        let code = res.status();
        if !code.is_success() {
            let resp: ApiResponse = parse_response(res)
                .await
                .context("failed to parse response")?;
            bail!(
                "Request to get ip addresses failed: {} (status: {})",
                resp.message,
                resp.status
            )
        };
        let resp: IpAddrResponse = parse_response(res)
            .await
            .context("cannot parse ip addresses")?;
        Ok(resp.ip_addresses)
    }

    /// Delete the persistent data of an application
    pub async fn purge(&self, app_id: &str) -> Result<String> {
        let body = serde_json::to_string(&PurgeRequest {
            app_id: app_id.to_string(),
        })?;
        self.call(Method::POST, "/v1/purge", Some(body), "purge").await
    }

    /// Reboot the device
    pub async fn reboot(&self) -> Result<String> {
        self.call(Method::POST, "/v1/reboot", None, "reboot").await
    }

    /// Power off the device
    pub async fn shutdown(&self) -> Result<String> {
        self.call(Method::POST, "/v1/shutdown", None, "shutdown").await
    }

    /// Start or stop the vpn
    pub async fn vpn_control(&self, enable: bool) -> Result<String> {
        let body = serde_json::to_string(&VpnControlRequest { enable })?;
        self.call(Method::POST, "/v1/vpncontrol", Some(body), "control vpn")
            .await
    }
}
