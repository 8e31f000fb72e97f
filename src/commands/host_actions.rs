//! Host side effects behind the control socket

use anyhow::{bail, Context};
use log::{info, warn};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::fs;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Command;

/// Systemd unit of the vpn client
pub const VPN_UNIT: &str = "openvpn-resin.service";
/// Grace period before rebooting or powering off, so the request can still be answered
pub const POWER_ACTION_DELAY: Duration = Duration::from_secs(1);

/// Interfaces that belong to containers, bridges or the vpn, not to the device itself
const IGNORED_INTERFACE_PREFIXES: &[&str] =
    &["docker", "veth", "br-", "tun", "tap", "resin-vpn", "balena", "supervisor0"];

/// Errors returned by host actions, mapped to http status codes by the server
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The request itself is invalid
    #[error("{0}")]
    BadRequest(String),
    /// The requested resource does not exist
    #[error("{0}")]
    NotFound(String),
    /// The action failed on the host
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Power state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// `systemctl reboot`
    Reboot,
    /// `systemctl poweroff`
    Shutdown,
}

impl PowerAction {
    fn verb(&self) -> &'static str {
        match self {
            PowerAction::Reboot => "reboot",
            PowerAction::Shutdown => "poweroff",
        }
    }
}

/// Human-friendly error messages for failed programs
fn status_to_pretty_err(
    res: std::io::Result<ExitStatus>,
    command: &str,
    args: &[&str],
) -> anyhow::Result<()> {
    let status = res.with_context(|| format!("failed to start this command: {}", command))?;
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => bail!(
            "command {} {} failed with exit code: {}",
            command,
            args.join(" "),
            code
        ),
        None => bail!(
            "command {} {} was terminated by a signal",
            command,
            args.join(" ")
        ),
    }
}

async fn systemctl(args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new("systemctl").args(args).status().await;
    status_to_pretty_err(status, "systemctl", args)
}

fn is_device_interface(name: &str) -> bool {
    !IGNORED_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn validate_app_id(app_id: &str) -> Result<(), ActionError> {
    if app_id.is_empty() || app_id == "." || app_id.contains('/') || app_id.contains("..") {
        return Err(ActionError::BadRequest(format!("invalid app id '{app_id}'")));
    }
    Ok(())
}

/// Removes everything inside `dir` but keeps `dir` itself
fn clear_dir(dir: &Path) -> anyhow::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("cannot read {}", dir.display()))?;
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .with_context(|| format!("cannot stat {}", path.display()))?
            .is_dir();
        let res = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        res.with_context(|| format!("cannot remove {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

/// Actions the control socket can trigger on the host
#[derive(Debug, Clone)]
pub struct HostActions {
    data_path: PathBuf,
}

impl HostActions {
    /// Returns host actions operating on application data below `data_path`
    pub fn new(data_path: &Path) -> Self {
        Self {
            data_path: data_path.to_owned(),
        }
    }

    /// IPv4 addresses of the device's own interfaces
    pub fn ip_addresses(&self) -> Result<Vec<Ipv4Addr>, ActionError> {
        let addrs = getifaddrs().context("failed to list network interfaces")?;
        let mut ips = vec![];
        for ifaddr in addrs {
            if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
                || !is_device_interface(&ifaddr.interface_name)
            {
                continue;
            }
            if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                let ip = *SocketAddrV4::from(*sin).ip();
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
        Ok(ips)
    }

    /// Deletes the persistent data of an application. Returns the number of removed entries.
    pub fn purge(&self, app_id: &str) -> Result<usize, ActionError> {
        validate_app_id(app_id)?;
        let dir = self.data_path.join(app_id);
        match fs::metadata(&dir) {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                return Err(ActionError::BadRequest(format!(
                    "{} is not a directory",
                    dir.display()
                )))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ActionError::NotFound(format!(
                    "no data for app {app_id}"
                )))
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("cannot access {}", dir.display()))
                    .into())
            }
        }
        let removed = clear_dir(&dir)?;
        info!("Purged {} entries of app {}", removed, app_id);
        Ok(removed)
    }

    /// Reboots or powers off the host after [`POWER_ACTION_DELAY`]
    pub fn schedule_power_action(&self, action: PowerAction) {
        info!("{:?} requested", action);
        tokio::spawn(async move {
            tokio::time::sleep(POWER_ACTION_DELAY).await;
            if let Err(e) = systemctl(&[action.verb()]).await {
                warn!("{:?} failed: {:#}", action, e);
            }
        });
    }

    /// Starts or stops the vpn client
    pub async fn vpn_control(&self, enable: bool) -> Result<(), ActionError> {
        let verb = if enable { "start" } else { "stop" };
        systemctl(&[verb, VPN_UNIT])
            .await
            .with_context(|| format!("failed to {verb} vpn"))?;
        info!("VPN {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_app_id() {
        assert!(validate_app_id("1234").is_ok());
        assert!(validate_app_id("my-app").is_ok());
        for id in ["", ".", "..", "../etc", "a/b", "/abs"] {
            assert!(matches!(
                validate_app_id(id),
                Err(ActionError::BadRequest(_))
            ));
        }
    }

    #[test]
    fn test_purge_keeps_the_app_dir() {
        let data = tempfile::tempdir().unwrap();
        let app = data.path().join("42");
        fs::create_dir_all(app.join("nested/deeper")).unwrap();
        fs::write(app.join("db.sqlite"), "data").unwrap();
        fs::write(app.join("nested/deeper/file"), "data").unwrap();
        fs::write(data.path().join("other"), "untouched").unwrap();

        let actions = HostActions::new(data.path());
        assert_eq!(actions.purge("42").unwrap(), 2);
        assert!(app.is_dir());
        assert_eq!(fs::read_dir(&app).unwrap().count(), 0);
        assert!(data.path().join("other").exists());
    }

    #[test]
    fn test_purge_unknown_app() {
        let data = tempfile::tempdir().unwrap();
        let actions = HostActions::new(data.path());
        assert!(matches!(actions.purge("7"), Err(ActionError::NotFound(_))));
        assert!(matches!(
            actions.purge("../7"),
            Err(ActionError::BadRequest(_))
        ));
    }

    #[test]
    fn test_interface_filter() {
        assert!(is_device_interface("eth0"));
        assert!(is_device_interface("wlan0"));
        assert!(!is_device_interface("docker0"));
        assert!(!is_device_interface("resin-vpn"));
        assert!(!is_device_interface("veth1a2b3c"));
    }

    #[test]
    fn test_ip_addresses_skip_loopback() {
        let actions = HostActions::new(Path::new("/tmp"));
        let ips = actions.ip_addresses().unwrap();
        assert!(ips.iter().all(|ip| !ip.is_loopback()));
    }
}
