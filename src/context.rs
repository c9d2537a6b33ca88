//! Per-request I/O context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::request::IoRequest;
use crate::transport::BufferHandle;

/// Bookkeeping attached to a request for the duration of one admission
/// cycle. Slots live in the [`ContextPool`](crate::pool::ContextPool) and
/// are recycled; every field is re-stamped on acquire.
#[derive(Debug, Clone)]
pub struct IoContext {
    /// When the context was granted to a request.
    pub admitted_at: Instant,
    /// Time the request spent parked on the wait queue before the grant.
    /// Zero for requests granted without waiting.
    pub waited: Duration,
    /// CPU whose shard owns this slot.
    pub cpu: usize,
    /// Chunk allocation attached while a transfer is outstanding. Must be
    /// detached (released to the backend) before the context goes back to
    /// the pool.
    pub buffer: Option<BufferHandle>,
    /// The request this context is serving. Cleared on release.
    pub request: Option<Arc<IoRequest>>,
}

impl IoContext {
    pub(crate) fn unused(cpu: usize) -> Self {
        Self {
            admitted_at: Instant::now(),
            waited: Duration::ZERO,
            cpu,
            buffer: None,
            request: None,
        }
    }
}

/// Handle to an acquired context slot.
///
/// Deliberately not `Clone`: one handle per admitted request, surrendered
/// back to the pool on every exit path.
#[derive(Debug, PartialEq, Eq)]
pub struct IoContextHandle {
    pub(crate) cpu: usize,
    pub(crate) slot: u16,
}

impl IoContextHandle {
    /// CPU whose shard owns the slot.
    pub fn cpu(&self) -> usize {
        self.cpu
    }
}
