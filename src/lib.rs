//! blockshim — block I/O front end over a packet transport.
//!
//! blockshim sits between a block-request producer and a packet-based
//! storage transport. It owns the resources a request needs for its
//! lifetime (per-CPU pools of I/O contexts), decides when a request may
//! proceed (FIFO admission with per-CPU wait queues and dispatcher
//! threads), sizes the chunked data buffers backing each transfer, and
//! folds the transport's two-level completion status back into a single
//! terminal status for the caller.
//!
//! Everything is sharded by CPU: a request admitted on CPU 3 takes its
//! context from CPU 3's pool, parks on CPU 3's queue, and is resumed by
//! CPU 3's dispatcher. Requests on different CPUs never contend.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blockshim::{
//!     Config, IoRequest, PassthroughMover, RequestKind, Shim, SubmitOutcome,
//! };
//! # use blockshim::{BufferHandle, ChunkPlan, PacketRequest, Transport, TransportError};
//! # struct Backend;
//! # impl Transport for Backend {
//! #     fn allocate_chunks(&self, _: &ChunkPlan) -> Result<BufferHandle, TransportError> {
//! #         Ok(BufferHandle { id: 0, bytes: 0 })
//! #     }
//! #     fn release_chunks(&self, _: BufferHandle) {}
//! #     fn submit(&self, packet: PacketRequest) {
//! #         (packet.completion)(blockshim::EngineStatus::ok());
//! #     }
//! # }
//!
//! fn main() -> Result<(), blockshim::Error> {
//!     let shim = Shim::new(
//!         Config::default(),
//!         Arc::new(Backend),
//!         Arc::new(PassthroughMover),
//!     )?;
//!
//!     let request = Arc::new(
//!         IoRequest::new(RequestKind::Read, 0x1000, 8).with_completion(|completion| {
//!             println!("read finished: {:?}", completion.status);
//!         }),
//!     );
//!     assert_eq!(shim.submit(request), SubmitOutcome::Submitted);
//!
//!     shim.shutdown()?;
//!     Ok(())
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod context;
pub(crate) mod metrics;
pub(crate) mod pool;
pub(crate) mod wait_queue;

// ── Public modules ──────────────────────────────────────────────────────
pub mod admission;
pub mod chunk;
pub mod config;
pub mod error;
pub mod request;
pub mod translator;
pub mod transport;

// ── Re-exports: Front end ───────────────────────────────────────────────

/// Block I/O front end over a packet transport.
pub use translator::Shim;
/// Outcome of a [`Shim::submit`] call.
pub use translator::SubmitOutcome;

// ── Re-exports: Requests ────────────────────────────────────────────────

/// Terminal completion delivered to a request's callback.
pub use request::Completion;
/// An inbound block I/O request.
pub use request::IoRequest;
/// Operation kind carried by a request.
pub use request::RequestKind;
/// Terminal status of a request.
pub use request::RequestStatus;
/// Direction of a direct-copy transfer.
pub use request::TransferDirection;

// ── Re-exports: Admission ───────────────────────────────────────────────

/// Per-CPU admission control over the sharded context pool.
pub use admission::AdmissionController;
/// Outcome of an admission attempt.
pub use admission::AdmitResult;
/// Why a request was refused admission.
pub use admission::RejectReason;
/// Per-request bookkeeping held for one admission cycle.
pub use context::IoContext;
/// Handle to an acquired I/O context slot.
pub use context::IoContextHandle;
/// Outcome of a pool acquire attempt.
pub use pool::Acquire;
/// Sharded pool of pre-allocated I/O contexts.
pub use pool::ContextPool;

// ── Re-exports: Buffer sizing ───────────────────────────────────────────

/// Chunk-size class for a buffered transfer.
pub use chunk::ChunkSize;
/// A sized chunk allocation with its tail layout.
pub use chunk::ChunkPlan;
/// Size the chunk allocation for a transfer.
pub use chunk::plan_allocation;
/// Client-visible block size in bytes.
pub use chunk::EXPORTED_BLOCK_SIZE;
/// On-media block size in bytes.
pub use chunk::PHYSICAL_BLOCK_SIZE;

// ── Re-exports: Transport contract ──────────────────────────────────────

/// Block operation carried by a packet.
pub use transport::BlockOpcode;
/// Qualifier refining a block-level status.
pub use transport::BlockQualifier;
/// Block-level completion status.
pub use transport::BlockStatus;
/// Handle to a chunk allocation owned by the backend.
pub use transport::BufferHandle;
/// Buffer transform between exported and physical block formats.
pub use transport::DataMover;
/// Completion status reported by the transport engine.
pub use transport::EngineStatus;
/// A fully-formed packet request, ready for submission.
pub use transport::PacketRequest;
/// Packet-level completion status.
pub use transport::PacketStatus;
/// A no-op [`DataMover`].
pub use transport::PassthroughMover;
/// Priority class a packet travels at.
pub use transport::Priority;
/// Opaque scatter-gather list descriptor.
pub use transport::SgDescriptor;
/// Packet transport backend.
pub use transport::Transport;

// ── Re-exports: Configuration and errors ────────────────────────────────

/// Shim configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Errors from sizing a data-buffer allocation.
pub use error::AllocationPlanError;
/// Setup and teardown errors.
pub use error::Error;
/// Errors returned by a transport backend.
pub use error::TransportError;
