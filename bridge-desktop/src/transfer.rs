//! Bulk copy via rsync

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    transfer::{FileTransfer, TransferOptions},
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// [`FileTransfer`] that runs `rsync -a --inplace`
///
/// The child process is killed when the transfer future is dropped, so an
/// outer timeout aborts the copy.
#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    binary: PathBuf,
}

impl RsyncTransfer {
    pub fn new() -> Self {
        Self::with_binary("rsync")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn build_args(source: &Path, destination: &Path, options: TransferOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-a".into(), "--inplace".into()];
        if !options.is_unlimited() {
            args.push(format!("--bwlimit={}", options.bandwidth_limit_kbps).into());
        }
        args.push(source.as_os_str().to_owned());
        args.push(destination.as_os_str().to_owned());
        args
    }
}

impl Default for RsyncTransfer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileTransfer for RsyncTransfer {
    async fn transfer(
        &self,
        source: &Path,
        destination: &Path,
        options: TransferOptions,
    ) -> Result<u64> {
        let args = Self::build_args(source, destination, options);
        debug!(
            source = ?source,
            destination = ?destination,
            bwlimit = options.bandwidth_limit_kbps,
            "Starting rsync"
        );

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                BridgeError::NotAvailable(format!("failed to spawn {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "rsync failed");
            return Err(BridgeError::OperationFailed(format!(
                "rsync exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let copied = tokio::fs::metadata(destination)
            .await
            .map_err(BridgeError::Io)?
            .len();
        debug!(destination = ?destination, bytes = copied, "rsync finished");
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_without_bandwidth_limit() {
        let args = RsyncTransfer::build_args(
            Path::new("/mnt/slow/a.mkv"),
            Path::new("/mnt/fast/a.mkv.partial"),
            TransferOptions::default(),
        );
        assert_eq!(
            args,
            vec![
                OsString::from("-a"),
                OsString::from("--inplace"),
                OsString::from("/mnt/slow/a.mkv"),
                OsString::from("/mnt/fast/a.mkv.partial"),
            ]
        );
    }

    #[test]
    fn test_args_with_bandwidth_limit() {
        let args = RsyncTransfer::build_args(
            Path::new("/a"),
            Path::new("/b"),
            TransferOptions::with_bandwidth_limit(20_000),
        );
        assert!(args.contains(&OsString::from("--bwlimit=20000")));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_available() {
        let transfer = RsyncTransfer::with_binary("/nonexistent/rsync");
        let err = transfer
            .transfer(Path::new("/a"), Path::new("/b"), TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotAvailable(_)));
    }
}
