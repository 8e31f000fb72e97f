//! Log setup for hostguard

use env_logger::{Builder, Env};
use log::SetLoggerError;
use std::io::Write;

/// Installs the global logger.
///
/// Logs at info level unless overridden by `RUST_LOG`. Each line carries the
/// call site so warnings about single targets can be traced back.
pub fn init() -> Result<(), SetLoggerError> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}:{} {}",
                buf.timestamp(),
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init()
}
