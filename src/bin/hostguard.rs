#![deny(missing_docs)]
//! hostguard executable

use anyhow::bail;
use anyhow::{Context, Result};
use hostguard::daemon::STOP_TIMEOUT;
use hostguard::settings::parse_settings;
use log::info;

/// The hostguard program entry point
pub fn main() -> Result<()> {
    let settings = parse_settings()?;

    if let Err(e) = hostguard::log_fmt::init() {
        bail!("Failed to setup logger: {:?}", e);
    };
    info!("hostguard {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the tokio runtime")?;
    let res = runtime.block_on(hostguard::daemon::run(&settings));
    // an abandoned oom score write may block forever, do not wait for it on exit
    runtime.shutdown_timeout(STOP_TIMEOUT);
    res
}
