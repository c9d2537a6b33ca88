//! Admission control: context grants, parking, dispatch, and drain.
//!
//! Every request passes through [`AdmissionController::admit`] before it may
//! touch the transport. Admission is strictly fair per CPU: while any
//! request is parked on a CPU's wait queue, new arrivals park behind it
//! rather than racing it for a freed context.
//!
//! One dispatcher thread per CPU resumes parked requests as contexts free
//! up. Shutdown stops the dispatchers, fails the remaining waiters, and
//! polls the pool until the in-progress contexts drain or a timeout fires.

use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::IoContextHandle;
use crate::error::Error;
use crate::metrics::{
    ADMISSIONS_GRANTED, ADMISSIONS_PARKED, ADMISSIONS_REJECTED_SHUTDOWN, DRAIN_TIMEOUTS,
    WAITERS_CANCELLED, WAITERS_FAILED_AT_SHUTDOWN, WAITERS_RESUMED,
};
use crate::pool::{Acquire, ContextPool};
use crate::request::{CancelHook, IoRequest, RequestStatus};
use crate::wait_queue::{WaitEntry, WaitQueue};

/// Why a request was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Shutdown is in progress; nothing is granted and nothing may park.
    ShuttingDown,
    /// The request was cancelled before it could park. Its completion has
    /// not been delivered; the caller owns it.
    Cancelled,
}

/// Outcome of an admission attempt.
#[derive(Debug)]
pub enum AdmitResult {
    /// A context was granted; the request may proceed immediately.
    Granted(IoContextHandle),
    /// The request is parked; a dispatcher will resume it when a context
    /// frees up.
    Pending,
    /// The request was refused; see [`RejectReason`].
    Rejected(RejectReason),
}

/// Callback a dispatcher invokes to resume a parked request once it holds a
/// context.
pub(crate) type ResumeFn = Arc<dyn Fn(IoContextHandle, Arc<IoRequest>) + Send + Sync>;

pub(crate) struct Inner {
    pool: ContextPool,
    queues: WaitQueue,
    resume: RwLock<Option<ResumeFn>>,
    /// Test-only fence a dispatcher crosses between dequeuing an entry and
    /// clearing its cancel hook, so a test can drive a cancel into exactly
    /// that window.
    #[cfg(test)]
    dequeue_fence: Mutex<Option<Box<dyn Fn() + Send>>>,
}

/// Per-CPU admission control over a sharded context pool.
pub struct AdmissionController {
    inner: Arc<Inner>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl AdmissionController {
    /// Build the pool and wait queues and spawn one dispatcher per CPU.
    pub fn new(config: &Config) -> Result<Self, Error> {
        config.validate()?;
        let cpus = config.resolved_cpus();
        let inner = Arc::new(Inner {
            pool: ContextPool::new(cpus, config.contexts_per_cpu),
            queues: WaitQueue::new(cpus),
            resume: RwLock::new(None),
            #[cfg(test)]
            dequeue_fence: Mutex::new(None),
        });

        let mut dispatchers = Vec::with_capacity(cpus);
        for cpu in 0..cpus {
            let inner = inner.clone();
            let pin = config.pin_dispatchers.then_some(config.core_offset + cpu);
            let handle = thread::Builder::new()
                .name(format!("blockshim-dispatch-{cpu}"))
                .spawn(move || {
                    if let Some(core) = pin {
                        pin_to_core(core);
                    }
                    dispatcher_loop(&inner, cpu);
                })
                .map_err(Error::DispatcherSpawn)?;
            dispatchers.push(handle);
        }
        info!(cpus, contexts_per_cpu = config.contexts_per_cpu, "admission control started");

        Ok(Self {
            inner,
            dispatchers: Mutex::new(dispatchers),
        })
    }

    /// Set the callback dispatchers use to resume parked requests. Must be
    /// called before the first admission.
    pub(crate) fn set_resume(&self, resume: ResumeFn) {
        *self.inner.resume.write().unwrap() = Some(resume);
    }

    /// Admit a request on `cpu`. Fairness: if any request is already parked
    /// on this CPU, the new one parks behind it.
    pub fn admit(&self, request: &Arc<IoRequest>, cpu: usize) -> AdmitResult {
        self.inner.admit(request, cpu)
    }

    /// Return a context to the pool and wake the owning CPU's dispatcher if
    /// anyone may be waiting for it.
    pub fn release(&self, handle: IoContextHandle) {
        let cpu = handle.cpu();
        if self.inner.pool.release(handle) {
            self.inner.queues.wake(cpu);
        }
    }

    /// The underlying context pool.
    pub fn pool(&self) -> &ContextPool {
        &self.inner.pool
    }

    /// Requests currently parked on `cpu`'s wait queue.
    pub fn queue_depth(&self, cpu: usize) -> usize {
        self.inner.queues.depth(cpu)
    }

    /// Stop admitting, fail the parked requests, and wait for in-progress
    /// contexts to drain.
    ///
    /// On timeout the outstanding contexts are leaked: their requests are
    /// still in flight downstream and reclaiming the memory under them
    /// would corrupt whatever completes later.
    pub fn drain_and_shutdown(&self, timeout: Duration, poll: Duration) -> Result<(), Error> {
        self.inner.pool.begin_shutdown();
        for cpu in 0..self.inner.pool.cpus() {
            self.inner.queues.stop(cpu);
        }
        for handle in self.dispatchers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.pool.is_drained_all() {
                info!("drain complete");
                return Ok(());
            }
            if Instant::now() >= deadline {
                let outstanding = self.inner.pool.in_progress_total();
                DRAIN_TIMEOUTS.increment();
                error!(outstanding, "drain timed out; leaking in-progress contexts");
                return Err(Error::DrainTimeout { outstanding });
            }
            thread::sleep(poll);
        }
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        for cpu in 0..self.inner.pool.cpus() {
            self.inner.queues.stop(cpu);
        }
        for handle in self.dispatchers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Inner {
    fn make_hook(self: &Arc<Self>) -> CancelHook {
        let inner = self.clone();
        Box::new(move |request| inner.queues.cancel_waiter(request))
    }

    fn admit(self: &Arc<Self>, request: &Arc<IoRequest>, cpu: usize) -> AdmitResult {
        let cpu = cpu % self.pool.cpus();
        request.set_cpu(cpu);

        if self.pool.is_shutting_down() || self.queues.is_stopped(cpu) {
            ADMISSIONS_REJECTED_SHUTDOWN.increment();
            return AdmitResult::Rejected(RejectReason::ShuttingDown);
        }

        let mut entries = self.queues.entries(cpu);
        if entries.is_empty() {
            match self.pool.try_acquire(cpu) {
                Acquire::Granted(handle) => {
                    ADMISSIONS_GRANTED.increment();
                    return AdmitResult::Granted(handle);
                }
                Acquire::ShuttingDown => {
                    ADMISSIONS_REJECTED_SHUTDOWN.increment();
                    return AdmitResult::Rejected(RejectReason::ShuttingDown);
                }
                Acquire::Empty => {}
            }
        }

        // Park. The hook goes in before the entry so cancellation can never
        // observe a parked request without a hook.
        request.install_cancel_hook(self.make_hook());
        if request.is_cancel_in_progress() {
            if request.clear_cancel_hook() {
                // Cancel fired before the hook existed; nothing is parked
                // and the caller still owns the completion.
                WAITERS_CANCELLED.increment();
                return AdmitResult::Rejected(RejectReason::Cancelled);
            }
            // The cancel path claimed the hook and is blocked on this
            // queue's lock. Park so it finds the entry.
        }
        WaitQueue::park_locked(&mut entries, request.clone());
        ADMISSIONS_PARKED.increment();
        AdmitResult::Pending
    }

    /// Drain `cpu`'s wait queue, resuming waiters until it empties, the
    /// shard runs dry, or shutdown intervenes.
    fn dispatch_ready(self: &Arc<Self>, cpu: usize) {
        loop {
            let mut entries = self.queues.entries(cpu);
            let Some(entry) = entries.pop_front() else {
                break;
            };
            WaitQueue::note_removed();
            let request = entry.request;
            #[cfg(test)]
            if let Some(fence) = self.dequeue_fence.lock().unwrap().as_ref() {
                fence();
            }
            let _ = request.clear_cancel_hook();

            if request.is_cancel_in_progress() {
                drop(entries);
                WAITERS_CANCELLED.increment();
                request.complete(RequestStatus::Cancelled, 0);
                continue;
            }

            match self.pool.try_acquire(cpu) {
                Acquire::Empty => {
                    // Still no context. Put the entry back at the front so
                    // FIFO order holds, with its hook re-armed.
                    request.install_cancel_hook(self.make_hook());
                    if request.is_cancel_in_progress() && request.clear_cancel_hook() {
                        drop(entries);
                        WAITERS_CANCELLED.increment();
                        request.complete(RequestStatus::Cancelled, 0);
                        continue;
                    }
                    entries.push_front(WaitEntry {
                        request,
                        enqueued_at: entry.enqueued_at,
                    });
                    crate::metrics::WAIT_QUEUE_DEPTH.increment();
                    break;
                }
                Acquire::ShuttingDown => {
                    drop(entries);
                    WAITERS_FAILED_AT_SHUTDOWN.increment();
                    request.complete(RequestStatus::Unsuccessful, 0);
                    continue;
                }
                Acquire::Granted(handle) => {
                    drop(entries);
                    let waited = entry.enqueued_at.elapsed();
                    self.pool.with_context(&handle, |ctx| ctx.waited = waited);
                    WAITERS_RESUMED.increment();
                    let resume = self.resume.read().unwrap().clone();
                    match resume {
                        Some(resume) => resume(handle, request),
                        None => {
                            // No resume target wired up. Surrender the
                            // context and fail the request.
                            error!("dispatcher has no resume callback");
                            if self.pool.release(handle) {
                                self.queues.wake(cpu);
                            }
                            request.complete(RequestStatus::Unsuccessful, 0);
                        }
                    }
                }
            }
        }
    }
}

fn dispatcher_loop(inner: &Arc<Inner>, cpu: usize) {
    let wake = inner.queues.receiver(cpu);
    debug!(cpu, "dispatcher running");
    while wake.recv().is_ok() {
        if inner.queues.is_stopped(cpu) {
            break;
        }
        inner.dispatch_ready(cpu);
    }
    let failed = inner.queues.fail_remaining(cpu);
    if failed > 0 {
        warn!(cpu, failed, "failed parked requests at dispatcher exit");
    }
    debug!(cpu, "dispatcher exiting");
}

/// Pin the calling thread to a CPU core.
fn pin_to_core(core: usize) {
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(core, &mut cpuset);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset);
        if rc != 0 {
            warn!(core, "failed to pin dispatcher to core");
        }
    }
}
