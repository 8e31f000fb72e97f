//! Allow to listen to common OS exit signals.
use anyhow::{Context, Result};
use log::info;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// An exit signal handler
#[derive(Debug)]
pub struct ExitSignalHandler {
    sigterm: Signal,
    sigint: Signal,
    sigquit: Signal,
}

impl ExitSignalHandler {
    /// Returns a new exit handler
    pub fn new() -> Result<ExitSignalHandler> {
        Ok(ExitSignalHandler {
            sigterm: signal(SignalKind::terminate()).context("Cannot register SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("Cannot register SIGINT handler")?,
            sigquit: signal(SignalKind::quit()).context("Cannot register SIGQUIT handler")?,
        })
    }

    /// Waits for one of the registered exit signals and returns its name
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigquit.recv() => "SIGQUIT",
        };
        info!("{} received, shutting down", name);
        name
    }
}
