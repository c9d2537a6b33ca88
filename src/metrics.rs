//! Shim runtime metrics.
//!
//! Counters for admission outcomes, pool pressure, wait-queue activity, and
//! completion families. Registered with metriken for Prometheus exposition.

use metriken::{metric, Counter, Gauge};

// ── Admission ────────────────────────────────────────────────────

#[metric(
    name = "blockshim/admission/granted",
    description = "Requests granted a context without waiting"
)]
pub static ADMISSIONS_GRANTED: Counter = Counter::new();

#[metric(
    name = "blockshim/admission/parked",
    description = "Requests parked on a wait queue"
)]
pub static ADMISSIONS_PARKED: Counter = Counter::new();

#[metric(
    name = "blockshim/admission/rejected_shutdown",
    description = "Requests rejected because shutdown was in progress"
)]
pub static ADMISSIONS_REJECTED_SHUTDOWN: Counter = Counter::new();

// ── Pool ─────────────────────────────────────────────────────────

#[metric(
    name = "blockshim/pool/contexts_acquired",
    description = "Total context acquisitions across all shards"
)]
pub static CONTEXTS_ACQUIRED: Counter = Counter::new();

#[metric(
    name = "blockshim/pool/exhausted",
    description = "Acquire attempts that found an empty shard"
)]
pub static POOL_EXHAUSTED: Counter = Counter::new();

// ── Wait queue ───────────────────────────────────────────────────

#[metric(
    name = "blockshim/wait_queue/depth",
    description = "Requests currently parked across all wait queues"
)]
pub static WAIT_QUEUE_DEPTH: Gauge = Gauge::new();

#[metric(
    name = "blockshim/wait_queue/resumed",
    description = "Parked requests resumed by a dispatcher"
)]
pub static WAITERS_RESUMED: Counter = Counter::new();

#[metric(
    name = "blockshim/wait_queue/cancelled",
    description = "Requests cancelled while parked"
)]
pub static WAITERS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "blockshim/wait_queue/failed_at_shutdown",
    description = "Parked requests failed because the queues were stopped"
)]
pub static WAITERS_FAILED_AT_SHUTDOWN: Counter = Counter::new();

// ── Completions ──────────────────────────────────────────────────

#[metric(
    name = "blockshim/completions/success",
    description = "Requests completed successfully"
)]
pub static COMPLETIONS_SUCCESS: Counter = Counter::new();

#[metric(
    name = "blockshim/completions/retryable",
    description = "Requests completed with a retryable status"
)]
pub static COMPLETIONS_RETRYABLE: Counter = Counter::new();

#[metric(
    name = "blockshim/completions/error",
    description = "Requests completed with a non-retryable error"
)]
pub static COMPLETIONS_ERROR: Counter = Counter::new();

#[metric(
    name = "blockshim/completions/cancelled",
    description = "Requests completed as cancelled"
)]
pub static COMPLETIONS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "blockshim/completions/alerted",
    description = "Successful completions slower than the alert threshold"
)]
pub static COMPLETIONS_ALERTED: Counter = Counter::new();

#[metric(
    name = "blockshim/completions/double",
    description = "Completion attempts after the terminal completion"
)]
pub static DOUBLE_COMPLETIONS: Counter = Counter::new();

// ── Shutdown ─────────────────────────────────────────────────────

#[metric(
    name = "blockshim/shutdown/drain_timeouts",
    description = "Shutdown drains that timed out and leaked contexts"
)]
pub static DRAIN_TIMEOUTS: Counter = Counter::new();
