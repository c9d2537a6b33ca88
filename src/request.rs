//! Inbound request capability object.
//!
//! An [`IoRequest`] stands in for the foreign request handed to the shim:
//! it carries the operation parameters, a one-shot completion callback, a
//! cancellation flag with an installable cancel hook, and the bookkeeping
//! the wait queues need (pending flag, owning-CPU tag).
//!
//! Completion is exactly-once by construction: the callback lives in a
//! `Mutex<Option<_>>` and the second caller finds it gone.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::metrics::DOUBLE_COMPLETIONS;
use crate::transport::{BufferHandle, Priority, SgDescriptor};

/// Operation kind carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Buffered read: the shim allocates chunks and unpacks data on success.
    Read,
    /// Buffered write: the shim allocates chunks and packs data before submit.
    Write,
    /// Read with a caller-supplied scatter-gather list.
    SglRead,
    /// Write with a caller-supplied scatter-gather list.
    SglWrite,
    /// Zero a block range. No data buffer.
    ZeroFill,
    /// Direct-copy read: data is pushed to the caller's transfer callback
    /// after a successful read.
    DcaRead,
    /// Direct-copy write: data is pulled from the caller's transfer callback
    /// before submission.
    DcaWrite,
}

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Completed successfully.
    Success,
    /// Completed successfully but slower than the configured alert threshold.
    Alerted,
    /// Transient downstream condition; the caller may retry with a fresh
    /// submission.
    DeviceNotReady,
    /// Unrecoverable media error.
    MediaError,
    /// Data integrity check failed.
    CrcError,
    /// The request was cancelled before or during transit.
    Cancelled,
    /// The storage object is over its queue-depth quota.
    Congested,
    /// The path taken is not the preferred one for this object.
    NotPreferred,
    /// The request parameters were rejected.
    InvalidRequest,
    /// Resource allocation failed.
    NoMemory,
    /// Failed for a reason with no better mapping (including shutdown).
    Unsuccessful,
}

impl RequestStatus {
    /// Whether the caller may retry with a fresh submission.
    pub fn is_retryable(self) -> bool {
        matches!(self, RequestStatus::DeviceNotReady | RequestStatus::Congested)
    }
}

/// Terminal completion delivered to the request's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub status: RequestStatus,
    pub bytes_transferred: u64,
}

/// Direction of a direct-copy transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Pull write data from the caller into the buffer.
    In,
    /// Push read data from the buffer to the caller.
    Out,
}

pub(crate) type CompletionFn = Box<dyn FnOnce(Completion) + Send>;
pub(crate) type CancelHook = Box<dyn FnOnce(&Arc<IoRequest>) + Send>;
/// Caller-supplied data-copy callback for DCA operations.
pub type TransferFn = Box<dyn Fn(TransferDirection, &BufferHandle, u64) + Send + Sync>;

/// An inbound block I/O request.
pub struct IoRequest {
    kind: RequestKind,
    lba: u64,
    blocks: u64,
    /// Caller-supplied priority key; mapped to a packet [`Priority`] class
    /// when the packet is built.
    priority_key: u64,
    /// Report media errors on SGL reads instead of masking them.
    report_validation_error: bool,
    /// Caller-supplied list for SGL operations.
    sgl: Option<SgDescriptor>,
    transfer: Mutex<Option<TransferFn>>,
    completion: Mutex<Option<CompletionFn>>,
    cancel_hook: Mutex<Option<CancelHook>>,
    cancel_requested: AtomicBool,
    pending: AtomicBool,
    /// CPU the request was last parked on. Read by the cancel path when the
    /// queue it expects comes up empty.
    cpu_tag: AtomicUsize,
    completions: AtomicU32,
}

impl IoRequest {
    /// Create a request for `blocks` blocks starting at `lba`.
    pub fn new(kind: RequestKind, lba: u64, blocks: u64) -> Self {
        Self {
            kind,
            lba,
            blocks,
            priority_key: 0,
            report_validation_error: false,
            sgl: None,
            transfer: Mutex::new(None),
            completion: Mutex::new(None),
            cancel_hook: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            cpu_tag: AtomicUsize::new(0),
            completions: AtomicU32::new(0),
        }
    }

    /// Set the caller's priority key. See [`Priority::from_key`] for the
    /// key-to-class mapping.
    pub fn with_priority_key(mut self, key: u64) -> Self {
        self.priority_key = key;
        self
    }

    /// Set the caller-supplied scatter-gather list (SGL operations).
    pub fn with_sgl(mut self, sgl: SgDescriptor) -> Self {
        self.sgl = Some(sgl);
        self
    }

    /// Report media errors on SGL reads instead of masking them as success.
    pub fn with_report_validation_error(mut self, enable: bool) -> Self {
        self.report_validation_error = enable;
        self
    }

    /// Set the one-shot completion callback.
    pub fn with_completion(self, f: impl FnOnce(Completion) + Send + 'static) -> Self {
        *self.completion.lock().unwrap() = Some(Box::new(f));
        self
    }

    /// Set the data-copy callback for DCA operations.
    pub fn with_transfer(self, f: impl Fn(TransferDirection, &BufferHandle, u64) + Send + Sync + 'static) -> Self {
        *self.transfer.lock().unwrap() = Some(Box::new(f));
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn priority_key(&self) -> u64 {
        self.priority_key
    }

    /// Priority class the request's packets travel at.
    pub fn priority(&self) -> Priority {
        Priority::from_key(self.priority_key)
    }

    pub fn report_validation_error(&self) -> bool {
        self.report_validation_error
    }

    pub fn sgl(&self) -> Option<SgDescriptor> {
        self.sgl
    }

    /// Run the DCA transfer callback, if one is set.
    pub(crate) fn run_transfer(&self, direction: TransferDirection, buffer: &BufferHandle, bytes: u64) {
        if let Some(f) = self.transfer.lock().unwrap().as_ref() {
            f(direction, buffer, bytes);
        }
    }

    /// Deliver the terminal completion. Exactly one call wins; later calls
    /// are counted and dropped (and panic in debug builds).
    pub fn complete(&self, status: RequestStatus, bytes_transferred: u64) {
        let prev = self.completions.fetch_add(1, Ordering::AcqRel);
        if prev != 0 {
            DOUBLE_COMPLETIONS.increment();
            error!(?status, prev, "request completed more than once");
            debug_assert!(false, "request completed more than once");
            return;
        }
        self.pending.store(false, Ordering::Release);
        let callback = self.completion.lock().unwrap().take();
        if let Some(f) = callback {
            f(Completion {
                status,
                bytes_transferred,
            });
        }
    }

    /// Whether the terminal completion has been delivered.
    pub fn is_completed(&self) -> bool {
        self.completions.load(Ordering::Acquire) > 0
    }

    /// Request cancellation. Sets the cancel flag, then fires the installed
    /// cancel hook if one is present. A request already picked up by a
    /// dispatcher has no hook and completes through the normal path.
    pub fn cancel(self: &Arc<Self>) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let hook = self.cancel_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancel_in_progress(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn install_cancel_hook(&self, hook: CancelHook) {
        *self.cancel_hook.lock().unwrap() = Some(hook);
    }

    /// Remove the cancel hook. Returns true if a hook was installed (i.e.
    /// the cancel path has not already claimed it).
    pub(crate) fn clear_cancel_hook(&self) -> bool {
        self.cancel_hook.lock().unwrap().take().is_some()
    }

    pub(crate) fn mark_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Whether the request is parked on a wait queue.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu_tag.store(cpu, Ordering::SeqCst);
    }

    pub(crate) fn current_cpu(&self) -> usize {
        self.cpu_tag.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("kind", &self.kind)
            .field("lba", &self.lba)
            .field("blocks", &self.blocks)
            .field("priority_key", &self.priority_key)
            .field("pending", &self.is_pending())
            .field("cancel_requested", &self.is_cancel_in_progress())
            .finish_non_exhaustive()
    }
}
