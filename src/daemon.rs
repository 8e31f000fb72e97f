//! Startup order of the daemon: protect first, serve afterwards.

use crate::commands::spawn_control_server;
use crate::container::{ContainerTarget, DockerClient};
use crate::enforcer::{EnforcementSession, Enforcer, SUPERVISOR_CONTAINER};
use crate::exit_signal_handler::ExitSignalHandler;
use crate::prometheus::spawn_prometheus_exporter;
use crate::settings::Settings;
use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;

/// How long shutdown waits for the periodic task
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs hostguard until an exit signal is received.
///
/// The control socket is only bound after the supervisor container is
/// protected; if that fails no request is ever served.
pub async fn run(settings: &Settings) -> Result<()> {
    let supervisor = ContainerTarget::new(SUPERVISOR_CONTAINER, &settings.docker_socket)
        .context("Invalid container runtime endpoint")?;
    let session = EnforcementSession::new(&settings.host_proc, supervisor);
    let resolver = DockerClient::new().with_timeout(settings.runtime_timeout());

    let periodic = Enforcer::new(session, resolver)
        .bootstrap()
        .await
        .context("Failed to protect the supervisor from the oom killer")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = periodic.spawn(stop_rx);
    let mut exit_signal_handler = ExitSignalHandler::new().context("Failed to setup signal handler")?;

    let res = tokio::select!(
        res = spawn_control_server(settings) => {
            if let Err(ref e) = res {
                warn!("control socket server failed: {:#}", e);
            }
            res
        }
        res = spawn_prometheus_exporter(&settings.exporter_address) => {
            if let Err(ref e) = res {
                warn!("prometheus exporter failed: {:#}", e);
            }
            res
        }
        _ = exit_signal_handler.recv() => Ok(())
    );

    // fails only if the task already stopped
    let _ = stop_tx.send(true);
    match time::timeout(STOP_TIMEOUT, task.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Periodic oom protection did not stop cleanly: {}", e),
        Err(_) => warn!(
            "Periodic oom protection did not stop within {}s",
            STOP_TIMEOUT.as_secs()
        ),
    }
    if let Err(e) = fs::remove_file(&settings.control_socket) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Cannot remove {}: {}", settings.control_socket.display(), e);
        }
    }
    info!("hostguard stopped");
    res
}
