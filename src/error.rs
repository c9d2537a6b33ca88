use std::io;

use thiserror::Error;

/// Errors returned by shim setup and teardown.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying OS operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
    /// A dispatcher thread could not be spawned.
    #[error("dispatcher spawn: {0}")]
    DispatcherSpawn(io::Error),
    /// Shutdown drain did not finish before the configured timeout.
    /// The outstanding contexts are leaked, never reclaimed.
    #[error("drain timed out with {outstanding} contexts still in progress")]
    DrainTimeout { outstanding: usize },
}

/// Errors from sizing a data-buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationPlanError {
    /// A transfer must cover at least one block.
    #[error("transfer of zero blocks")]
    ZeroBlocks,
    /// The chunk count does not fit the allocator's count field.
    #[error("transfer of {blocks} blocks exceeds the chunk count budget")]
    TooManyChunks { blocks: u64 },
}

/// Errors returned by a [`Transport`](crate::transport::Transport) backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No packet could be allocated for the operation.
    #[error("packet allocation failed")]
    NoPacket,
    /// The chunk allocator could not satisfy the plan.
    #[error("chunk allocation failed")]
    NoChunks,
    /// The downstream submission queue is full.
    #[error("submission queue full")]
    QueueFull,
    /// A buffer failed its data integrity check.
    #[error("data integrity check failed")]
    IntegrityCheck,
}
