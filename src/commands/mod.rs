//! Control socket server

mod client;
pub mod control_commands;
pub mod host_actions;
mod server;

use serde::{Deserialize, Serialize};

pub use client::CommandClient;
pub use server::spawn_control_server;

#[derive(PartialEq, Serialize, Deserialize, Debug, Clone)]
struct ApiResponse {
    status: u16,
    message: String,
}

#[derive(PartialEq, Serialize, Deserialize, Debug, Clone)]
struct IpAddrResponse {
    status: u16,
    message: String,
    ip_addresses: Vec<String>,
}

#[derive(PartialEq, Serialize, Deserialize, Debug, Clone)]
struct PurgeRequest {
    #[serde(alias = "appId")]
    app_id: String,
}

#[derive(PartialEq, Serialize, Deserialize, Debug, Clone)]
struct VpnControlRequest {
    #[serde(alias = "Enable")]
    enable: bool,
}
