//! Per-CPU I/O context pool.
//!
//! One shard per CPU, each with its own lock, so requests running on
//! different CPUs never contend. Free slots are kept in a LIFO stack: the
//! most recently released slot is handed out next, while its lines are
//! still warm.
//!
//! The shutdown flag is only ever set while every shard lock is held (in
//! increasing CPU order), so an acquirer that holds its shard lock and saw
//! the flag clear cannot race with shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::context::{IoContext, IoContextHandle};
use crate::metrics::{CONTEXTS_ACQUIRED, POOL_EXHAUSTED};

/// Outcome of a pool acquire attempt.
#[derive(Debug)]
pub enum Acquire {
    /// A context was granted.
    Granted(IoContextHandle),
    /// The shard has no free contexts; the caller should park.
    Empty,
    /// The pool is shutting down; nothing is granted and nothing may park.
    ShuttingDown,
}

struct ShardState {
    contexts: Vec<IoContext>,
    /// Free slot indices, used as a stack. The top of the stack is the most
    /// recently released slot.
    free: Vec<u16>,
    in_progress: Vec<bool>,
    in_use: usize,
    peak_in_use: usize,
    total_acquired: u64,
}

impl ShardState {
    fn new(cpu: usize, capacity: u16) -> Self {
        let mut contexts = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            contexts.push(IoContext::unused(cpu));
        }
        // Reversed so slot 0 is on top of the stack initially.
        let free: Vec<u16> = (0..capacity).rev().collect();
        Self {
            in_progress: vec![false; contexts.len()],
            free,
            contexts,
            in_use: 0,
            peak_in_use: 0,
            total_acquired: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.contexts.len()
    }
}

/// Sharded pool of pre-allocated I/O contexts, one shard per CPU.
pub struct ContextPool {
    shards: Vec<Mutex<ShardState>>,
    shutting_down: AtomicBool,
}

impl ContextPool {
    /// Pre-allocate `capacity_per_cpu` contexts for each of `cpus` shards.
    pub fn new(cpus: usize, capacity_per_cpu: u16) -> Self {
        let shards = (0..cpus)
            .map(|cpu| Mutex::new(ShardState::new(cpu, capacity_per_cpu)))
            .collect();
        Self {
            shards,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Number of shards.
    pub fn cpus(&self) -> usize {
        self.shards.len()
    }

    /// Try to acquire a context from `cpu`'s shard.
    pub fn try_acquire(&self, cpu: usize) -> Acquire {
        let mut shard = self.shards[cpu].lock().unwrap();
        if self.shutting_down.load(Ordering::SeqCst) {
            return Acquire::ShuttingDown;
        }
        let Some(slot) = shard.free.pop() else {
            POOL_EXHAUSTED.increment();
            return Acquire::Empty;
        };
        debug_assert!(!shard.in_progress[slot as usize], "slot granted twice");
        shard.in_progress[slot as usize] = true;
        shard.contexts[slot as usize] = IoContext {
            admitted_at: Instant::now(),
            waited: Duration::ZERO,
            cpu,
            buffer: None,
            request: None,
        };
        shard.in_use += 1;
        shard.peak_in_use = shard.peak_in_use.max(shard.in_use);
        shard.total_acquired += 1;
        CONTEXTS_ACQUIRED.increment();
        Acquire::Granted(IoContextHandle {
            cpu,
            slot,
        })
    }

    /// Return a context to its shard. The slot goes to the top of the free
    /// stack so the next acquire reuses it.
    ///
    /// The buffer handle must already be detached; the request
    /// back-reference is dropped here.
    ///
    /// Returns true when a dispatcher wake is warranted (never during
    /// shutdown: the queues are failing their waiters, not resuming them).
    pub fn release(&self, handle: IoContextHandle) -> bool {
        let IoContextHandle { cpu, slot } = handle;
        let mut shard = self.shards[cpu].lock().unwrap();
        debug_assert!(shard.in_progress[slot as usize], "slot released twice");
        let ctx = &mut shard.contexts[slot as usize];
        if ctx.buffer.is_some() {
            warn!(cpu, slot, "context released with a buffer still attached");
            debug_assert!(false, "context released with a buffer still attached");
            ctx.buffer = None;
        }
        ctx.request = None;
        shard.in_progress[slot as usize] = false;
        shard.free.push(slot);
        shard.in_use -= 1;
        !self.shutting_down.load(Ordering::SeqCst)
    }

    /// Read or update the context behind `handle` under the shard lock.
    pub fn with_context<R>(&self, handle: &IoContextHandle, f: impl FnOnce(&mut IoContext) -> R) -> R {
        let mut shard = self.shards[handle.cpu].lock().unwrap();
        f(&mut shard.contexts[handle.slot as usize])
    }

    /// Set the shutdown flag. Takes every shard lock in increasing CPU
    /// order, flips the flag, and releases in decreasing order, so no
    /// acquire can observe a half-set flag.
    pub fn begin_shutdown(&self) {
        let mut guards = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            guards.push(shard.lock().unwrap());
        }
        self.shutting_down.store(true, Ordering::SeqCst);
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        for cpu in 0..self.shards.len() {
            let outstanding = self.in_progress_snapshot(cpu);
            if outstanding.is_empty() {
                continue;
            }
            warn!(cpu, in_progress = outstanding.len(), "contexts still in progress at shutdown");
            for (slot, ctx) in outstanding {
                warn!(
                    cpu,
                    slot,
                    age_ms = ctx.admitted_at.elapsed().as_millis() as u64,
                    waited_ms = ctx.waited.as_millis() as u64,
                    request = ?ctx.request,
                    "in-progress context"
                );
            }
        }
    }

    /// Snapshot of the in-progress contexts on `cpu`'s shard, slot index
    /// first. Diagnostic: the pool keeps moving underneath it.
    pub fn in_progress_snapshot(&self, cpu: usize) -> Vec<(u16, IoContext)> {
        let shard = self.shards[cpu].lock().unwrap();
        shard
            .in_progress
            .iter()
            .enumerate()
            .filter(|(_, busy)| **busy)
            .map(|(slot, _)| (slot as u16, shard.contexts[slot].clone()))
            .collect()
    }

    /// Whether the shutdown flag is set.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether `cpu`'s shard has no contexts in progress.
    pub fn is_drained(&self, cpu: usize) -> bool {
        self.in_progress_count(cpu) == 0
    }

    /// Whether every shard has drained.
    pub fn is_drained_all(&self) -> bool {
        (0..self.shards.len()).all(|cpu| self.is_drained(cpu))
    }

    /// Contexts currently in progress on `cpu`'s shard.
    pub fn in_progress_count(&self, cpu: usize) -> usize {
        self.shards[cpu].lock().unwrap().in_use
    }

    /// Contexts in progress across all shards.
    pub fn in_progress_total(&self) -> usize {
        (0..self.shards.len()).map(|cpu| self.in_progress_count(cpu)).sum()
    }

    /// Free contexts on `cpu`'s shard.
    pub fn free_count(&self, cpu: usize) -> usize {
        self.shards[cpu].lock().unwrap().free.len()
    }

    /// Capacity of `cpu`'s shard.
    pub fn capacity(&self, cpu: usize) -> usize {
        self.shards[cpu].lock().unwrap().capacity()
    }

    /// Peak simultaneous in-progress count on `cpu`'s shard.
    pub fn peak_in_use(&self, cpu: usize) -> usize {
        self.shards[cpu].lock().unwrap().peak_in_use
    }

    /// Total contexts ever acquired from `cpu`'s shard.
    pub fn total_acquired(&self, cpu: usize) -> u64 {
        self.shards[cpu].lock().unwrap().total_acquired
    }
}
