//! Read settings for hostguard

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Setting options for hostguard
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Settings {
    /// Host process table, usually the host's /proc bind-mounted into the supervisor container
    #[clap(long, default_value = "/proc", env = "HOST_PROC")]
    pub host_proc: PathBuf,

    /// Container runtime endpoint used to find the pid of the supervisor container.
    /// Either a socket path, `unix://<path>` or `tcp://<host>:<port>`
    #[clap(long, default_value = "/var/run/docker.sock", env = "DOCKER_SOCKET")]
    pub docker_socket: String,

    /// How long to wait for the container runtime, in seconds
    #[clap(long, default_value_t = 10, env = "HOSTGUARD_RUNTIME_TIMEOUT")]
    pub runtime_timeout_secs: u64,

    /// Unix socket path where hostguard will listen for remote control commands
    #[clap(
        long,
        default_value = "/var/run/hostguard.sock",
        env = "HOSTGUARD_SOCKET"
    )]
    pub control_socket: PathBuf,

    /// Directory that holds the persistent data of each application
    #[clap(long, default_value = "/mnt/root/resin-data", env = "RESIN_DATA_PATH")]
    pub data_path: PathBuf,

    /// The exporter address, that hostguard will listen to: format: ip:port
    #[clap(
        long,
        default_value = "127.0.0.1:48480",
        env = "HOSTGUARD_EXPORTER_ADDRESS"
    )]
    pub exporter_address: String,
}

impl Settings {
    /// Timeout for requests to the container runtime
    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if !self.host_proc.is_dir() {
            bail!(
                "host process table {} is not a directory, is HOST_PROC set?",
                self.host_proc.display()
            );
        }
        if self.runtime_timeout_secs == 0 {
            bail!("--runtime-timeout-secs must be at least 1");
        }
        Ok(())
    }
}

/// Read and returns settings from command line and environment variables
pub fn parse_settings() -> Result<Settings> {
    let settings = Settings::parse();
    settings.validate()?;
    Ok(settings)
}

#[test]
fn test_parse_settings_defaults() {
    let settings = Settings::try_parse_from(["hostguard"]).unwrap();
    assert_eq!(settings.docker_socket, "/var/run/docker.sock");
    assert_eq!(settings.runtime_timeout(), Duration::from_secs(10));
    assert!(settings.validate().is_ok());
}

#[test]
fn test_validate_rejects_missing_proc() {
    let settings = Settings::try_parse_from([
        "hostguard",
        "--host-proc",
        "/definitely/does/not/exist",
        "--docker-socket",
        "unix:///run/balena-engine.sock",
    ])
    .unwrap();
    assert_eq!(settings.docker_socket, "unix:///run/balena-engine.sock");
    assert!(settings.validate().is_err());
}
