//! Process signal handling.
//!
//! SIGINT and SIGTERM request a graceful shutdown; SIGHUP reloads the
//! configuration file. On Windows only Ctrl+C is handled.

use anyhow::Result;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Reload,
}

#[cfg(unix)]
pub struct Signals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    pub fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Waits for the next signal of interest.
    pub async fn recv(&mut self) -> Result<Signal> {
        tokio::select! {
            _ = self.sigint.recv() => {
                info!("📡 Received SIGINT");
                Ok(Signal::Shutdown)
            }
            _ = self.sigterm.recv() => {
                info!("📡 Received SIGTERM");
                Ok(Signal::Shutdown)
            }
            _ = self.sighup.recv() => {
                info!("📡 Received SIGHUP");
                Ok(Signal::Reload)
            }
        }
    }
}

#[cfg(windows)]
pub struct Signals;

#[cfg(windows)]
impl Signals {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> Result<Signal> {
        tokio::signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
        Ok(Signal::Shutdown)
    }
}
