use crate::CRATE_NAME;
use fs4::tokio::AsyncFileExt;
use std::path::Path;
use tokio::fs::File;
use tracing::{error, info};

async fn sweep_lock(state_directory: &Path) -> std::io::Result<File> {
    tokio::fs::create_dir_all(state_directory).await?;
    let lock_file = state_directory.join("renew.lock");
    let lock_file = File::create(lock_file).await?;
    if lock_file.try_lock_exclusive()? {
        Ok(lock_file)
    } else {
        info!(
            "Another {CRATE_NAME} process is currently renewing certificates. Waiting for the other process to finish..."
        );
        tokio::task::spawn_blocking(move || {
            lock_file.lock_exclusive()?;
            Ok(lock_file)
        })
        .await?
    }
}

/// Advisory lock serializing renewal sweeps across processes sharing one state directory.
#[must_use]
#[clippy::has_significant_drop]
pub struct SweepLock {
    lock_file: File,
}

impl SweepLock {
    pub async fn exclusive_lock(state_directory: &Path) -> std::io::Result<Self> {
        let lock_file = sweep_lock(state_directory).await?;
        Ok(Self { lock_file })
    }
}

impl Drop for SweepLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            error!("Failed to release renewal lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_second_lock_waits_for_first() {
        let dir = tempdir().unwrap();
        let first = SweepLock::exclusive_lock(dir.path()).await.unwrap();

        let path = dir.path().to_path_buf();
        let second = tokio::spawn(async move { SweepLock::exclusive_lock(&path).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok());
    }
}
