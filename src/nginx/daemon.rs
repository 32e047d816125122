use crate::cmd_runner::{CommandRunner, CommandSpec};
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Controls the running nginx. Reloads are serialized so a test always precedes the reload it
/// guards, with no other reload in between.
pub struct Daemon {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
    timeout: Duration,
    reload_lock: Mutex<()>,
}

impl Daemon {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: PathBuf, timeout: Duration) -> Self {
        Self {
            runner,
            binary,
            timeout,
            reload_lock: Mutex::new(()),
        }
    }

    /// Validates the whole configuration tree. Fails with the tool's output verbatim.
    pub async fn test(&self) -> Result<()> {
        debug!("Testing nginx configuration");
        let command = CommandSpec::new(&self.binary).args(["-t", "-g", "error_log off;"]);
        self.runner.run_checked(&command, self.timeout).await?;
        Ok(())
    }

    /// Tests, and only if that succeeds, asks nginx to reload.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        self.test().await?;
        info!("Reloading nginx");
        let command = CommandSpec::new(&self.binary).args(["-s", "reload"]);
        self.runner.run_checked(&command, self.timeout).await?;
        Ok(())
    }
}
