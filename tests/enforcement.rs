use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use hostguard::container::{ContainerResolver, ContainerTarget, DockerClient, ResolveError};
use hostguard::enforcer::{EnforcementSession, Enforcer, SUPERVISOR_CONTAINER};
use hostguard::oom_score::OomScoreAdjuster;
use hostguard::settings::Settings;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use hyperlocal::UnixServerExt;
use nix::unistd::Pid;

async fn fake_docker(req: Request<Body>) -> hyper::Result<Response<Body>> {
    let body = match req.uri().path() {
        "/containers/resin_supervisor/json" => {
            r#"{"Id": "4c1b", "Name": "/resin_supervisor", "State": {"Status": "running", "Running": true, "Pid": 4242}}"#
        }
        "/containers/stopped/json" => {
            r#"{"Id": "9a0f", "State": {"Status": "exited", "Running": false, "Pid": 0}}"#
        }
        "/containers/garbage/json" => "<html>not docker</html>",
        "/containers/hanging/json" => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "{}"
        }
        _ => {
            let mut resp = Response::new(Body::from(r#"{"message": "No such container"}"#));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            return Ok(resp);
        }
    };
    Ok(Response::new(Body::from(body)))
}

fn spawn_fake_docker(dir: &Path) -> PathBuf {
    let socket = dir.join("docker.sock");
    let make_service =
        make_service_fn(|_| async { Ok::<_, hyper::Error>(service_fn(fake_docker)) });
    let server = Server::bind_unix(&socket)
        .expect("cannot bind fake docker socket")
        .serve(make_service);
    tokio::spawn(server);
    socket
}

fn fake_process(root: &Path, pid: i32, name: &str) {
    let dir = root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("comm"), format!("{name}\n")).unwrap();
    fs::write(dir.join("oom_score_adj"), "0\n").unwrap();
}

fn target(name: &str, socket: &Path) -> ContainerTarget {
    ContainerTarget::new(name, &format!("unix://{}", socket.display())).unwrap()
}

fn score(root: &Path, pid: i32) -> i32 {
    OomScoreAdjuster::new(root).read(Pid::from_raw(pid)).unwrap()
}

#[tokio::test]
async fn test_resolve_containers() {
    let dir = tempfile::tempdir().unwrap();
    let socket = spawn_fake_docker(dir.path());
    let client = DockerClient::new();

    let process = client.resolve(&target("resin_supervisor", &socket)).await.unwrap();
    assert_eq!(process.pid, Pid::from_raw(4242));
    assert_eq!(process.name, "resin_supervisor");

    assert!(matches!(
        client.resolve(&target("does_not_exist", &socket)).await,
        Err(ResolveError::ContainerNotFound(name)) if name == "does_not_exist"
    ));
    assert!(matches!(
        client.resolve(&target("stopped", &socket)).await,
        Err(ResolveError::ContainerNotRunning(_))
    ));
    assert!(matches!(
        client.resolve(&target("garbage", &socket)).await,
        Err(ResolveError::RuntimeProtocolError(_))
    ));
}

#[tokio::test]
async fn test_hanging_runtime_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let socket = spawn_fake_docker(dir.path());
    let client = DockerClient::new().with_timeout(Duration::from_millis(200));

    assert!(matches!(
        client.resolve(&target("hanging", &socket)).await,
        Err(ResolveError::RuntimeUnreachable { .. })
    ));
}

#[tokio::test]
async fn test_bootstrap_without_optional_services() {
    let dir = tempfile::tempdir().unwrap();
    let socket = spawn_fake_docker(dir.path());
    let host_proc = dir.path().join("proc");
    fake_process(&host_proc, 1, "systemd");
    fake_process(&host_proc, 4242, "node");

    // the runtime endpoint comes from the session only
    let session = EnforcementSession::new(&host_proc, target(SUPERVISOR_CONTAINER, &socket));
    Enforcer::new(session, DockerClient::new())
        .bootstrap()
        .await
        .unwrap();

    assert_eq!(score(&host_proc, 4242), -800);
    assert_eq!(score(&host_proc, 1), 0);
}

#[tokio::test]
async fn test_bootstrap_with_optional_services() {
    let dir = tempfile::tempdir().unwrap();
    let socket = spawn_fake_docker(dir.path());
    let host_proc = dir.path().join("proc");
    fake_process(&host_proc, 4242, "node");
    fake_process(&host_proc, 500, "openvpn");
    fake_process(&host_proc, 501, "connmand");

    // the runtime endpoint comes from the session only
    let session = EnforcementSession::new(&host_proc, target(SUPERVISOR_CONTAINER, &socket));
    Enforcer::new(session, DockerClient::new())
        .bootstrap()
        .await
        .unwrap();

    assert_eq!(score(&host_proc, 4242), -800);
    assert_eq!(score(&host_proc, 500), -1000);
    assert_eq!(score(&host_proc, 501), -1000);
}

#[tokio::test]
async fn test_daemon_does_not_serve_without_protection() {
    let dir = tempfile::tempdir().unwrap();
    let host_proc = dir.path().join("proc");
    fake_process(&host_proc, 4242, "node");
    let control_socket = dir.path().join("hostguard.sock");

    let settings = Settings::try_parse_from([
        "hostguard",
        "--host-proc",
        host_proc.to_str().unwrap(),
        "--docker-socket",
        dir.path().join("missing-docker.sock").to_str().unwrap(),
        "--control-socket",
        control_socket.to_str().unwrap(),
        "--exporter-address",
        "127.0.0.1:0",
    ])
    .unwrap();

    let err = hostguard::daemon::run(&settings).await.unwrap_err();
    assert!(matches!(
        err.root_cause().downcast_ref::<ResolveError>(),
        Some(ResolveError::RuntimeUnreachable { .. })
    ));
    assert!(!control_socket.exists());
    assert_eq!(score(&host_proc, 4242), 0);
}
