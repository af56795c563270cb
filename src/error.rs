/// Error taxonomy for the block processing pipeline.
///
/// Only `Daemon` errors are recoverable (the prefetcher and mempool retry on
/// the next poll). Everything else unwinds to the top of the fetch/process
/// loop and initiates shutdown.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    /// Structural failure while applying a block: missing UTXO, malformed
    /// script, inconsistent index rows. Fatal for the current advance.
    #[error("chain error: {0}")]
    Chain(String),

    /// Transient daemon RPC failure. Logged and retried after the polling
    /// delay.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// Undo record missing or unreadable during rollback.
    #[error("database corrupt: {0}")]
    Corrupt(String),

    /// Op-stack conflict or staging mismatch. Programmer error, fatal.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    #[error("rocksdb error: {0}")]
    Db(#[from] rocksdb::Error),
}

impl IndexerError {
    pub fn chain(msg: impl Into<String>) -> Self {
        IndexerError::Chain(msg.into())
    }

    pub fn daemon(msg: impl Into<String>) -> Self {
        IndexerError::Daemon(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::Daemon(_))
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
