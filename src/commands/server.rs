use std::{fmt::Display, fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use hyperlocal::UnixServerExt;
use log::{info, warn};
use serde::{de::DeserializeOwned, Serialize};

use crate::settings::Settings;

use super::{
    host_actions::{ActionError, HostActions, PowerAction},
    ApiResponse, IpAddrResponse, PurgeRequest, VpnControlRequest,
};

fn error_response<T: Display>(status: StatusCode, msg: T) -> Response<Body> {
    warn!("request failed with {}: '{}'", status, msg);
    json_response(
        status,
        &ApiResponse {
            status: status.as_u16(),
            message: msg.to_string(),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, obj: &T) -> Response<Body> {
    let mut resp: Response<Body> = Response::default();
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    match serde_json::to_vec(obj) {
        Err(e) => {
            warn!("Failed to serialize json: {e}");
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *resp.body_mut() = Body::from(r#"{"status": 500, "message": "Cannot serialize json"}"#);
        }
        Ok(body) => {
            *resp.status_mut() = status;
            *resp.body_mut() = Body::from(body);
        }
    }
    resp
}

fn message(status: StatusCode, msg: &str) -> Response<Body> {
    json_response(
        status,
        &ApiResponse {
            status: status.as_u16(),
            message: msg.to_string(),
        },
    )
}

fn action_error(err: ActionError) -> Response<Body> {
    match err {
        ActionError::BadRequest(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        ActionError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, msg),
        ActionError::Failed(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

macro_rules! ok_or_error {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                return Ok(action_error(err.into()));
            }
        }
    };
}

async fn json_request<T: DeserializeOwned>(mut req: Request<Body>) -> Result<T, ActionError> {
    let body = hyper::body::to_bytes(req.body_mut())
        .await
        .map_err(|e| ActionError::BadRequest(format!("error receiving body: {e}")))?;
    serde_json::from_slice(&body)
        .map_err(|e| ActionError::BadRequest(format!("error converting from json: {e}")))
}

/// A unix-socket based http server to provide remote control
struct CommandServer {
    control_socket: PathBuf,
    actions: HostActions,
}

impl CommandServer {
    /// Creates a new instance
    pub fn new(settings: &Settings) -> Self {
        CommandServer {
            control_socket: settings.control_socket.to_owned(),
            actions: HostActions::new(&settings.data_path),
        }
    }

    async fn handle_requests(&self, req: Request<Body>) -> hyper::Result<Response<Body>> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/ping") => Ok(message(StatusCode::OK, "OK")),
            (&Method::GET, "/v1/ipaddr") => self.handle_ipaddr(),
            (&Method::POST, "/v1/purge") => self.handle_purge(req).await,
            (&Method::POST, "/v1/reboot") => Ok(self.handle_power(PowerAction::Reboot)),
            (&Method::POST, "/v1/shutdown") => Ok(self.handle_power(PowerAction::Shutdown)),
            (&Method::POST, "/v1/vpncontrol") => self.handle_vpn_control(req).await,
            _ => Ok(message(StatusCode::NOT_FOUND, "Not Found")),
        }
    }

    fn handle_ipaddr(&self) -> hyper::Result<Response<Body>> {
        let ips = ok_or_error!(self.actions.ip_addresses());
        Ok(json_response(
            StatusCode::OK,
            &IpAddrResponse {
                status: 200,
                message: "OK".to_string(),
                ip_addresses: ips.iter().map(|ip| ip.to_string()).collect(),
            },
        ))
    }

    async fn handle_purge(&self, req: Request<Body>) -> hyper::Result<Response<Body>> {
        let args: PurgeRequest = ok_or_error!(json_request(req).await);
        let removed = ok_or_error!(self.actions.purge(&args.app_id));
        Ok(message(
            StatusCode::OK,
            &format!("purged {removed} entries of app {}", args.app_id),
        ))
    }

    fn handle_power(&self, action: PowerAction) -> Response<Body> {
        self.actions.schedule_power_action(action);
        let msg = match action {
            PowerAction::Reboot => "rebooting",
            PowerAction::Shutdown => "shutting down",
        };
        message(StatusCode::ACCEPTED, msg)
    }

    async fn handle_vpn_control(&self, req: Request<Body>) -> hyper::Result<Response<Body>> {
        let args: VpnControlRequest = ok_or_error!(json_request(req).await);
        ok_or_error!(self.actions.vpn_control(args.enable).await);
        let msg = if args.enable {
            "vpn enabled"
        } else {
            "vpn disabled"
        };
        Ok(message(StatusCode::OK, msg))
    }
}

/// Starts an control socket server
pub async fn spawn_control_server(settings: &Settings) -> Result<()> {
    let server = Arc::new(CommandServer::new(settings));
    let server = &server;

    if server.control_socket.exists() {
        fs::remove_file(&server.control_socket).with_context(|| {
            format!(
                "failed to remove stale socket '{}'",
                server.control_socket.display()
            )
        })?;
    }

    let make_service = make_service_fn(move |_client| {
        let server = server.clone();

        async move {
            // This is the request handler.
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let s = Arc::clone(&server);
                async move { s.handle_requests(req).await }
            }))
        }
    });
    let s = Server::bind_unix(&server.control_socket)
        .with_context(|| {
            format!(
                "failed to bind unix socket '{}'",
                server.control_socket.display()
            )
        })?
        .serve(make_service);

    info!("Listening on unix://{}", server.control_socket.display());

    s.await.context("Failed to start server")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(data_path: &std::path::Path) -> CommandServer {
        CommandServer {
            control_socket: PathBuf::from("/nonexistent.sock"),
            actions: HostActions::new(data_path),
        }
    }

    async fn body(resp: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_routes() {
        let data = tempfile::tempdir().unwrap();
        let s = server(data.path());

        let req = Request::get("/ping").body(Body::empty()).unwrap();
        let resp = s.handle_requests(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(resp).await["message"], "OK");

        // routes are method specific
        let req = Request::get("/v1/purge").body(Body::empty()).unwrap();
        let resp = s.handle_requests(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::get("/v2/ipaddr").body(Body::empty()).unwrap();
        let resp = s.handle_requests(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_purge_request() {
        let data = tempfile::tempdir().unwrap();
        fs::create_dir(data.path().join("1")).unwrap();
        fs::write(data.path().join("1/state"), "x").unwrap();
        let s = server(data.path());

        let req = Request::post("/v1/purge")
            .body(Body::from(r#"{"appId": "1"}"#))
            .unwrap();
        let resp = s.handle_requests(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!data.path().join("1/state").exists());

        let req = Request::post("/v1/purge")
            .body(Body::from("not json"))
            .unwrap();
        let resp = s.handle_requests(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(resp).await["status"], 400);

        let req = Request::post("/v1/purge")
            .body(Body::from(r#"{"app_id": "2"}"#))
            .unwrap();
        let resp = s.handle_requests(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
