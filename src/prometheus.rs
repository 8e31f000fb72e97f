//! Prometheus http exporter

use std::time::Instant;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use lazy_static::lazy_static;
use log::{info, warn};
use prometheus::{self, register_gauge, Encoder, Gauge, TextEncoder};

lazy_static! {
    static ref START: Instant = Instant::now();
    static ref UPTIME: Gauge = register_gauge!(
        "hostguard_uptime",
        "Time in milliseconds how long daemon is running"
    )
    .unwrap();
}

async fn handle_request(req: Request<Body>) -> hyper::Result<Response<Body>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Ok(Response::new(Body::from("OK"))),
        (&Method::GET, "/metrics") => {
            UPTIME.set(START.elapsed().as_millis() as f64);

            let metric_families = prometheus::gather();
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                warn!("Failed to encode metrics: {}", e);
                return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR));
            }
            Ok(Response::new(Body::from(buffer)))
        }
        _ => Ok(status_response(StatusCode::NOT_FOUND, NOTFOUND)),
    }
}

static SERVER_ERROR: &[u8] = b"Server error";
static NOTFOUND: &[u8] = b"Not Found";

fn status_response(status: StatusCode, body: &'static [u8]) -> Response<Body> {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp
}

/// Starts an prometheus exporter backend
pub async fn spawn_prometheus_exporter(exporter_address: &str) -> Result<()> {
    lazy_static::initialize(&START);
    let addr = exporter_address
        .parse()
        .context("Failed to parse exporter address")?;
    let make_service =
        make_service_fn(|_| async { Ok::<_, hyper::Error>(service_fn(handle_request)) });
    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind exporter to {addr}"))?
        .serve(make_service);

    info!("Metrics exporter listening on http://{}", addr);

    server.await.context("Failed to start server")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_and_health() {
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let resp = handle_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::get("/metrics").body(Body::empty()).unwrap();
        let resp = handle_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("hostguard_uptime"));

        let req = Request::get("/nope").body(Body::empty()).unwrap();
        let resp = handle_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
