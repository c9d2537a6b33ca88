//! Per-CPU wait queues for requests that found their context shard empty.
//!
//! Each CPU has a FIFO of parked requests and a wake channel its dispatcher
//! blocks on. A freed context sends one token; the dispatcher then drains
//! the queue front-to-back until it empties or the shard runs dry again.
//!
//! Lock ordering: a queue lock may be taken before its CPU's pool shard
//! lock, never after. The cancel path takes only queue locks.
//!
//! The cancel hook on a parked request is claimed by exactly one side:
//! either the cancel path takes it (and removes the entry itself) or the
//! dispatcher clears it when it pops the entry. A parked request is always
//! visible in the queue by the time its hook can run, because both the park
//! and the hook's removal take the same queue lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::metrics::{WAITERS_CANCELLED, WAITERS_FAILED_AT_SHUTDOWN, WAIT_QUEUE_DEPTH};
use crate::request::{IoRequest, RequestStatus};

/// A parked request.
pub(crate) struct WaitEntry {
    pub request: Arc<IoRequest>,
    pub enqueued_at: Instant,
}

struct CpuQueue {
    entries: Mutex<VecDeque<WaitEntry>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    stopped: AtomicBool,
}

/// Per-CPU FIFO wait queues with dispatcher wake channels.
pub(crate) struct WaitQueue {
    cpus: Vec<CpuQueue>,
}

impl WaitQueue {
    pub(crate) fn new(cpus: usize) -> Self {
        let cpus = (0..cpus)
            .map(|_| {
                // The token channel is a binary semaphore: the dispatcher
                // drains the whole queue per token, so one pending token is
                // enough.
                let (wake_tx, wake_rx) = bounded(1);
                CpuQueue {
                    entries: Mutex::new(VecDeque::new()),
                    wake_tx,
                    wake_rx,
                    stopped: AtomicBool::new(false),
                }
            })
            .collect();
        Self { cpus }
    }

    pub(crate) fn entries(&self, cpu: usize) -> MutexGuard<'_, VecDeque<WaitEntry>> {
        self.cpus[cpu].entries.lock().unwrap()
    }

    pub(crate) fn depth(&self, cpu: usize) -> usize {
        self.entries(cpu).len()
    }

    /// Park a request at the back of the queue. Caller holds the queue lock
    /// and has already installed the cancel hook.
    pub(crate) fn park_locked(entries: &mut VecDeque<WaitEntry>, request: Arc<IoRequest>) {
        request.mark_pending();
        entries.push_back(WaitEntry {
            request,
            enqueued_at: Instant::now(),
        });
        WAIT_QUEUE_DEPTH.increment();
    }

    /// Account for an entry leaving a queue by any path.
    pub(crate) fn note_removed() {
        WAIT_QUEUE_DEPTH.decrement();
    }

    /// Remove a parked request by identity. Returns true if it was found
    /// and removed; the caller then owns its completion.
    pub(crate) fn remove(&self, cpu: usize, request: &Arc<IoRequest>) -> bool {
        if cpu >= self.cpus.len() {
            return false;
        }
        let mut entries = self.entries(cpu);
        let Some(pos) = entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.request, request))
        else {
            return false;
        };
        entries.remove(pos);
        Self::note_removed();
        true
    }

    /// Cancel a parked request: remove it from the queue it was parked on
    /// and complete it as cancelled.
    ///
    /// If the entry is not where its CPU tag says, the request may have
    /// been re-admitted on another CPU between the cancel trigger and this
    /// removal; the tag is re-read and the removal retried once. A second
    /// miss means a dispatcher already owns the request and will observe
    /// the cancel flag itself.
    pub(crate) fn cancel_waiter(&self, request: &Arc<IoRequest>) {
        let cpu = request.current_cpu();
        let mut removed = self.remove(cpu, request);
        if !removed {
            let moved_to = request.current_cpu();
            if moved_to != cpu {
                removed = self.remove(moved_to, request);
            }
        }
        if removed {
            WAITERS_CANCELLED.increment();
            request.complete(RequestStatus::Cancelled, 0);
            // A context may have been parked behind the cancelled entry.
            self.wake(request.current_cpu());
        } else {
            debug!("cancel lost the race to dispatch; normal path will observe the flag");
        }
    }

    /// Fail every parked request on `cpu` with `Unsuccessful`. Used when
    /// the queues are being torn down.
    pub(crate) fn fail_remaining(&self, cpu: usize) -> usize {
        let drained: Vec<WaitEntry> = {
            let mut entries = self.entries(cpu);
            entries.drain(..).collect()
        };
        let count = drained.len();
        for entry in drained {
            Self::note_removed();
            WAITERS_FAILED_AT_SHUTDOWN.increment();
            let _ = entry.request.clear_cancel_hook();
            entry.request.complete(RequestStatus::Unsuccessful, 0);
        }
        count
    }

    /// Send a wake token to `cpu`'s dispatcher. A token already pending is
    /// as good as a new one.
    pub(crate) fn wake(&self, cpu: usize) {
        if cpu < self.cpus.len() {
            let _ = self.cpus[cpu].wake_tx.try_send(());
        }
    }

    pub(crate) fn receiver(&self, cpu: usize) -> Receiver<()> {
        self.cpus[cpu].wake_rx.clone()
    }

    /// Flag `cpu`'s queue as stopped and wake its dispatcher so it can
    /// fail the remaining entries and exit.
    pub(crate) fn stop(&self, cpu: usize) {
        self.cpus[cpu].stopped.store(true, Ordering::SeqCst);
        self.wake(cpu);
    }

    pub(crate) fn is_stopped(&self, cpu: usize) -> bool {
        self.cpus[cpu].stopped.load(Ordering::SeqCst)
    }
}
