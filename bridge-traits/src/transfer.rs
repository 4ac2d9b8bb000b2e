//! Bulk File Transfer Abstraction
//!
//! Copies between the slow and fast pool are delegated to an external copier
//! (rsync on desktop). The engine owns retries, timeouts and the partial file
//! lifecycle; an implementation only has to move bytes once.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

/// Per-call options for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOptions {
    /// Bandwidth cap in KiB/s, 0 for unlimited
    pub bandwidth_limit_kbps: u64,
}

impl TransferOptions {
    pub fn with_bandwidth_limit(bandwidth_limit_kbps: u64) -> Self {
        Self {
            bandwidth_limit_kbps,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bandwidth_limit_kbps == 0
    }
}

/// External bulk copier
///
/// `transfer` copies `source` to `destination` and returns the number of bytes
/// written. A failed call may leave a partial `destination` behind; callers are
/// expected to remove it. Dropping the returned future must abort the copy.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn transfer(
        &self,
        source: &Path,
        destination: &Path,
        options: TransferOptions,
    ) -> Result<u64>;
}
