//! Command to hostguard

/// Command to hostguard
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(clap::Subcommand, PartialEq, Debug, Clone)]
pub enum Command {
    /// Check that hostguard is up
    Ping,

    /// Show the ip addresses of the device
    Ipaddr,

    /// Delete the persistent data of an application
    Purge(PurgeArgs),

    /// Reboot the device
    Reboot,

    /// Power off the device
    Shutdown,

    /// Enable or disable the vpn
    Vpn(VpnArgs),
}

/// Arguments for purge command
#[derive(clap::Args, PartialEq, Debug, Clone)]
pub struct PurgeArgs {
    /// Id of the application whose data is deleted
    pub app_id: String,
}

/// Arguments for vpn command
#[derive(clap::Args, PartialEq, Debug, Clone)]
pub struct VpnArgs {
    /// Stop the vpn instead of starting it
    #[arg(long)]
    pub disable: bool,
}
