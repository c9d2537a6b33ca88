//! Request translation: block I/O requests in, packets out.
//!
//! [`Shim`] is the front door. It admits each request on the submitting
//! CPU, sizes and allocates the data buffer, builds a packet for the
//! transport backend, and folds the two-level engine status back into a
//! single terminal [`RequestStatus`]. Exactly one completion is delivered
//! per admitted request, and the I/O context is surrendered on every exit
//! path before the completion fires.
//!
//! Transient downstream failures are reported as retryable statuses; a
//! retry is a fresh [`Shim::submit`] call and a fresh admission cycle, not
//! an internal loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::admission::{AdmissionController, AdmitResult, RejectReason};
use crate::chunk::{plan_allocation, EXPORTED_BLOCK_SIZE, PHYSICAL_BLOCK_SIZE};
use crate::config::Config;
use crate::context::IoContextHandle;
use crate::error::Error;
use crate::metrics::{
    COMPLETIONS_ALERTED, COMPLETIONS_CANCELLED, COMPLETIONS_ERROR, COMPLETIONS_RETRYABLE,
    COMPLETIONS_SUCCESS,
};
use crate::request::{IoRequest, RequestKind, RequestStatus, TransferDirection};
use crate::transport::{
    BlockOpcode, BlockQualifier, BlockStatus, BufferHandle, DataMover, EngineStatus, PacketRequest,
    PacketStatus, SgDescriptor, Transport,
};

/// Outcome of a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The request was admitted and handed to the transport. Its completion
    /// callback will fire when the engine answers.
    Submitted,
    /// The request is parked behind earlier arrivals; it proceeds
    /// automatically when a context frees up.
    Parked,
    /// The request was refused and its completion has already fired with
    /// the given status.
    Rejected(RequestStatus),
}

/// Block I/O front end over a packet transport.
pub struct Shim {
    inner: Arc<ShimInner>,
}

struct ShimInner {
    config: Config,
    admission: AdmissionController,
    transport: Arc<dyn Transport>,
    mover: Arc<dyn DataMover>,
    alerts: AtomicU64,
}

impl Shim {
    /// Build the shim: context pools, wait queues, and dispatcher threads
    /// come up here.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        mover: Arc<dyn DataMover>,
    ) -> Result<Self, Error> {
        let admission = AdmissionController::new(&config)?;
        let inner = Arc::new(ShimInner {
            config,
            admission,
            transport,
            mover,
            alerts: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&inner);
        inner
            .admission
            .set_resume(Arc::new(move |handle, request| match weak.upgrade() {
                Some(inner) => inner.start_request(handle, request),
                None => request.complete(RequestStatus::Unsuccessful, 0),
            }));
        Ok(Self { inner })
    }

    /// Submit a request on the calling thread's current CPU.
    pub fn submit(&self, request: Arc<IoRequest>) -> SubmitOutcome {
        self.submit_on(request, current_cpu())
    }

    /// Submit a request with an explicit CPU affinity.
    pub fn submit_on(&self, request: Arc<IoRequest>, cpu: usize) -> SubmitOutcome {
        match self.inner.admission.admit(&request, cpu) {
            AdmitResult::Granted(handle) => {
                self.inner.start_request(handle, request);
                SubmitOutcome::Submitted
            }
            AdmitResult::Pending => SubmitOutcome::Parked,
            AdmitResult::Rejected(RejectReason::ShuttingDown) => {
                ShimInner::finish(&request, RequestStatus::Unsuccessful, 0);
                SubmitOutcome::Rejected(RequestStatus::Unsuccessful)
            }
            AdmitResult::Rejected(RejectReason::Cancelled) => {
                ShimInner::finish(&request, RequestStatus::Cancelled, 0);
                SubmitOutcome::Rejected(RequestStatus::Cancelled)
            }
        }
    }

    /// Stop admitting, fail parked requests, and wait for in-flight
    /// requests to drain within the configured bounds.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.inner.admission.drain_and_shutdown(
            self.inner.config.drain_timeout,
            self.inner.config.drain_poll_interval,
        )
    }

    /// The admission controller (pool and queue statistics live here).
    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }
}

impl ShimInner {
    /// Entry point for a request holding a context, from either the direct
    /// admission path or a dispatcher resume.
    fn start_request(self: &Arc<Self>, handle: IoContextHandle, request: Arc<IoRequest>) {
        self.admission
            .pool()
            .with_context(&handle, |ctx| ctx.request = Some(request.clone()));
        match request.kind() {
            RequestKind::SglRead | RequestKind::SglWrite => self.start_sgl(handle, request),
            RequestKind::Read | RequestKind::Write => self.start_buffered(handle, request),
            RequestKind::ZeroFill => self.start_zero(handle, request),
            RequestKind::DcaRead | RequestKind::DcaWrite => self.start_dca(handle, request),
        }
    }

    fn start_sgl(self: &Arc<Self>, handle: IoContextHandle, request: Arc<IoRequest>) {
        let Some(sg) = request.sgl() else {
            warn!(?request, "SGL operation without a scatter-gather list");
            self.fail(handle, &request, RequestStatus::InvalidRequest);
            return;
        };
        let opcode = if request.kind() == RequestKind::SglRead {
            BlockOpcode::Read
        } else {
            BlockOpcode::WriteNonCached
        };
        let inner = self.clone();
        let req = request.clone();
        self.transport.submit(PacketRequest {
            opcode,
            lba: request.lba(),
            blocks: request.blocks(),
            block_size: EXPORTED_BLOCK_SIZE,
            priority: request.priority(),
            sg,
            buffer: None,
            completion: Box::new(move |engine| {
                let (status, bytes) = translate_status(&req, engine);
                inner.complete(handle, &req, status, bytes);
            }),
        });
    }

    fn start_buffered(self: &Arc<Self>, handle: IoContextHandle, request: Arc<IoRequest>) {
        let plan = match plan_allocation(request.blocks(), false) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, blocks = request.blocks(), "allocation plan rejected");
                self.fail(handle, &request, RequestStatus::InvalidRequest);
                return;
            }
        };
        let buffer = match self.transport.allocate_chunks(&plan) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(%err, chunks = plan.chunk_count(), "chunk allocation failed");
                self.fail(handle, &request, RequestStatus::NoMemory);
                return;
            }
        };
        self.attach_buffer(&handle, buffer);

        let writing = request.kind() == RequestKind::Write;
        if writing && self.mover.pack(&buffer, request.blocks()).is_err() {
            self.release_buffer(&handle, buffer);
            self.fail(handle, &request, RequestStatus::Unsuccessful);
            return;
        }

        let sg = SgDescriptor {
            addr: plan.sg_offset(),
            entry_count: plan.sg_entry_count(),
        };
        let inner = self.clone();
        let req = request.clone();
        self.transport.submit(PacketRequest {
            opcode: if writing {
                BlockOpcode::WriteNonCached
            } else {
                BlockOpcode::Read
            },
            lba: request.lba(),
            blocks: request.blocks(),
            block_size: PHYSICAL_BLOCK_SIZE,
            priority: request.priority(),
            sg,
            buffer: Some(buffer),
            completion: Box::new(move |engine| {
                let (mut status, mut bytes) = translate_status(&req, engine);
                if !writing
                    && matches!(status, RequestStatus::Success)
                    && inner.mover.unpack(&buffer, req.blocks()).is_err()
                {
                    status = RequestStatus::CrcError;
                    bytes = 0;
                }
                inner.release_buffer(&handle, buffer);
                inner.complete(handle, &req, status, bytes);
            }),
        });
    }

    fn start_zero(self: &Arc<Self>, handle: IoContextHandle, request: Arc<IoRequest>) {
        let inner = self.clone();
        let req = request.clone();
        self.transport.submit(PacketRequest {
            opcode: BlockOpcode::Zero,
            lba: request.lba(),
            blocks: request.blocks(),
            block_size: EXPORTED_BLOCK_SIZE,
            priority: request.priority(),
            sg: SgDescriptor::empty(),
            buffer: None,
            completion: Box::new(move |engine| {
                let (status, bytes) = translate_status(&req, engine);
                inner.complete(handle, &req, status, bytes);
            }),
        });
    }

    fn start_dca(self: &Arc<Self>, handle: IoContextHandle, request: Arc<IoRequest>) {
        let plan = match plan_allocation(request.blocks(), true) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, blocks = request.blocks(), "allocation plan rejected");
                self.fail(handle, &request, RequestStatus::InvalidRequest);
                return;
            }
        };
        let buffer = match self.transport.allocate_chunks(&plan) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(%err, chunks = plan.chunk_count(), "chunk allocation failed");
                self.fail(handle, &request, RequestStatus::NoMemory);
                return;
            }
        };
        self.attach_buffer(&handle, buffer);

        let writing = request.kind() == RequestKind::DcaWrite;
        if writing {
            // Pull the caller's data into the buffer, then pack it into
            // physical block format.
            request.run_transfer(TransferDirection::In, &buffer, plan.payload_bytes());
            if self.mover.pack(&buffer, request.blocks()).is_err() {
                self.release_buffer(&handle, buffer);
                self.fail(handle, &request, RequestStatus::Unsuccessful);
                return;
            }
        }

        let payload_bytes = plan.payload_bytes();
        let sg = SgDescriptor {
            addr: plan.sg_offset(),
            entry_count: plan.sg_entry_count(),
        };
        let inner = self.clone();
        let req = request.clone();
        self.transport.submit(PacketRequest {
            opcode: if writing {
                BlockOpcode::WriteNonCached
            } else {
                BlockOpcode::Read
            },
            lba: request.lba(),
            blocks: request.blocks(),
            block_size: PHYSICAL_BLOCK_SIZE,
            priority: request.priority(),
            sg,
            buffer: Some(buffer),
            completion: Box::new(move |engine| {
                let (mut status, mut bytes) = translate_status(&req, engine);
                if !writing && matches!(status, RequestStatus::Success) {
                    if inner.mover.unpack(&buffer, req.blocks()).is_err() {
                        status = RequestStatus::CrcError;
                        bytes = 0;
                    } else {
                        req.run_transfer(TransferDirection::Out, &buffer, payload_bytes);
                    }
                }
                inner.release_buffer(&handle, buffer);
                inner.complete(handle, &req, status, bytes);
            }),
        });
    }

    /// Pin the chunk allocation to the context for the life of the transfer.
    fn attach_buffer(&self, handle: &IoContextHandle, buffer: BufferHandle) {
        self.admission
            .pool()
            .with_context(handle, |ctx| ctx.buffer = Some(buffer));
    }

    /// Detach the chunk allocation from the context and return it to the
    /// backend. Must precede the context release.
    fn release_buffer(&self, handle: &IoContextHandle, buffer: BufferHandle) {
        self.admission
            .pool()
            .with_context(handle, |ctx| ctx.buffer = None);
        self.transport.release_chunks(buffer);
    }

    /// Surrender the context and deliver the terminal completion, applying
    /// the alert threshold to successes.
    fn complete(
        self: &Arc<Self>,
        handle: IoContextHandle,
        request: &Arc<IoRequest>,
        status: RequestStatus,
        bytes: u64,
    ) {
        let status = self.apply_alert(&handle, status);
        self.admission.release(handle);
        Self::finish(request, status, bytes);
    }

    /// Early-failure path: no packet travelled.
    fn fail(self: &Arc<Self>, handle: IoContextHandle, request: &Arc<IoRequest>, status: RequestStatus) {
        self.admission.release(handle);
        Self::finish(request, status, 0);
    }

    fn apply_alert(&self, handle: &IoContextHandle, status: RequestStatus) -> RequestStatus {
        let Some(threshold) = self.config.alert_threshold else {
            return status;
        };
        if status != RequestStatus::Success {
            return status;
        }
        let elapsed: Duration = self
            .admission
            .pool()
            .with_context(handle, |ctx| ctx.admitted_at.elapsed());
        if elapsed <= threshold {
            return status;
        }
        COMPLETIONS_ALERTED.increment();
        let n = self.alerts.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 100 == 1 {
            warn!(elapsed_ms = elapsed.as_millis() as u64, total = n, "slow I/O completion");
        }
        RequestStatus::Alerted
    }

    fn finish(request: &Arc<IoRequest>, status: RequestStatus, bytes: u64) {
        match status {
            RequestStatus::Success | RequestStatus::Alerted => COMPLETIONS_SUCCESS.increment(),
            RequestStatus::Cancelled => COMPLETIONS_CANCELLED.increment(),
            s if s.is_retryable() => COMPLETIONS_RETRYABLE.increment(),
            _ => COMPLETIONS_ERROR.increment(),
        };
        request.complete(status, bytes);
    }
}

/// Bytes moved by a fully successful operation.
fn success_bytes(request: &IoRequest) -> u64 {
    match request.kind() {
        // Buffered transfers move physical-format blocks.
        RequestKind::Read | RequestKind::Write => request.blocks() * PHYSICAL_BLOCK_SIZE,
        _ => request.blocks() * EXPORTED_BLOCK_SIZE,
    }
}

/// Fold a two-level engine status into a terminal request status.
///
/// Packet-level failures mean the request never reached the storage object
/// and map to transit statuses; only `PacketStatus::Ok` consults the
/// block-level status.
fn translate_status(request: &Arc<IoRequest>, engine: EngineStatus) -> (RequestStatus, u64) {
    match engine.packet {
        PacketStatus::Cancelled => return (RequestStatus::Cancelled, 0),
        PacketStatus::Busy | PacketStatus::EdgeNotEnabled | PacketStatus::Timeout => {
            return (RequestStatus::DeviceNotReady, 0);
        }
        PacketStatus::Failed | PacketStatus::Other(_) => {
            debug!(?engine, "packet failed in transit");
            return (RequestStatus::Unsuccessful, 0);
        }
        PacketStatus::Ok => {}
    }

    match (engine.block, engine.qualifier) {
        (BlockStatus::Success, BlockQualifier::StillCongested) => {
            (RequestStatus::Alerted, success_bytes(request))
        }
        (BlockStatus::Success, _) => (RequestStatus::Success, success_bytes(request)),
        (BlockStatus::MediaError, _) => {
            // Uncorrectable sectors on an SGL read are surfaced to the
            // caller as data (already invalidated in the buffer) unless it
            // asked to be told.
            if request.kind() == RequestKind::SglRead && !request.report_validation_error() {
                (RequestStatus::Success, success_bytes(request))
            } else {
                // Media errors still move as much data as possible; the
                // uncorrectable locations hold invalidated blocks.
                (RequestStatus::MediaError, success_bytes(request))
            }
        }
        (BlockStatus::IoFailed, BlockQualifier::CrcError) => (RequestStatus::CrcError, 0),
        (BlockStatus::IoFailed, BlockQualifier::RetryPossible)
        | (BlockStatus::IoFailed, BlockQualifier::RetryNotPossible) => {
            (RequestStatus::DeviceNotReady, 0)
        }
        (BlockStatus::IoFailed, BlockQualifier::Congested) => (RequestStatus::Congested, 0),
        (BlockStatus::IoFailed, BlockQualifier::NotPreferred) => (RequestStatus::NotPreferred, 0),
        (BlockStatus::Aborted, _) => (RequestStatus::Cancelled, 0),
        (BlockStatus::InvalidRequest, _) => (RequestStatus::InvalidRequest, 0),
        (block, qualifier) => {
            debug!(?block, ?qualifier, "unmapped block status; treating as not ready");
            (RequestStatus::DeviceNotReady, 0)
        }
    }
}

/// CPU the calling thread is currently running on.
fn current_cpu() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BlockQualifier as Q;
    use crate::transport::BlockStatus as B;
    use crate::transport::PacketStatus as P;

    fn engine(packet: P, block: B, qualifier: Q) -> EngineStatus {
        EngineStatus {
            packet,
            block,
            qualifier,
        }
    }

    fn read_request(blocks: u64) -> Arc<IoRequest> {
        Arc::new(IoRequest::new(RequestKind::Read, 0, blocks))
    }

    #[test]
    fn packet_failures_mask_block_status() {
        let req = read_request(4);
        let (status, bytes) =
            translate_status(&req, engine(P::Cancelled, B::Success, Q::None));
        assert_eq!(status, RequestStatus::Cancelled);
        assert_eq!(bytes, 0);

        for packet in [P::Busy, P::EdgeNotEnabled, P::Timeout] {
            let (status, _) = translate_status(&req, engine(packet, B::Success, Q::None));
            assert_eq!(status, RequestStatus::DeviceNotReady);
            assert!(status.is_retryable());
        }

        let (status, _) = translate_status(&req, engine(P::Failed, B::Success, Q::None));
        assert_eq!(status, RequestStatus::Unsuccessful);
    }

    #[test]
    fn success_reports_physical_bytes_for_buffered() {
        let req = read_request(4);
        let (status, bytes) = translate_status(&req, engine(P::Ok, B::Success, Q::None));
        assert_eq!(status, RequestStatus::Success);
        assert_eq!(bytes, 4 * PHYSICAL_BLOCK_SIZE);
    }

    #[test]
    fn success_reports_exported_bytes_for_sgl_and_zero() {
        let sgl = Arc::new(
            IoRequest::new(RequestKind::SglRead, 0, 4).with_sgl(SgDescriptor::empty()),
        );
        let (_, bytes) = translate_status(&sgl, engine(P::Ok, B::Success, Q::None));
        assert_eq!(bytes, 4 * EXPORTED_BLOCK_SIZE);

        let zero = Arc::new(IoRequest::new(RequestKind::ZeroFill, 0, 16));
        let (_, bytes) = translate_status(&zero, engine(P::Ok, B::Success, Q::None));
        assert_eq!(bytes, 16 * EXPORTED_BLOCK_SIZE);
    }

    #[test]
    fn still_congested_success_is_alerted() {
        let req = read_request(1);
        let (status, bytes) =
            translate_status(&req, engine(P::Ok, B::Success, Q::StillCongested));
        assert_eq!(status, RequestStatus::Alerted);
        assert_eq!(bytes, PHYSICAL_BLOCK_SIZE);
    }

    #[test]
    fn media_error_masked_on_sgl_read_unless_requested() {
        let masked = Arc::new(
            IoRequest::new(RequestKind::SglRead, 0, 2).with_sgl(SgDescriptor::empty()),
        );
        let (status, bytes) = translate_status(&masked, engine(P::Ok, B::MediaError, Q::None));
        assert_eq!(status, RequestStatus::Success);
        assert_eq!(bytes, 2 * EXPORTED_BLOCK_SIZE);

        let reporting = Arc::new(
            IoRequest::new(RequestKind::SglRead, 0, 2)
                .with_sgl(SgDescriptor::empty())
                .with_report_validation_error(true),
        );
        let (status, bytes) = translate_status(&reporting, engine(P::Ok, B::MediaError, Q::None));
        assert_eq!(status, RequestStatus::MediaError);
        // The transfer still moved data; uncorrectable locations hold
        // invalidated blocks.
        assert_eq!(bytes, 2 * EXPORTED_BLOCK_SIZE);

        // Buffered reads always report media errors.
        let buffered = read_request(2);
        let (status, bytes) = translate_status(&buffered, engine(P::Ok, B::MediaError, Q::None));
        assert_eq!(status, RequestStatus::MediaError);
        assert_eq!(bytes, 2 * PHYSICAL_BLOCK_SIZE);
    }

    #[test]
    fn io_failed_qualifiers_map_individually() {
        let req = read_request(1);
        let cases = [
            (Q::CrcError, RequestStatus::CrcError),
            (Q::RetryPossible, RequestStatus::DeviceNotReady),
            (Q::RetryNotPossible, RequestStatus::DeviceNotReady),
            (Q::Congested, RequestStatus::Congested),
            (Q::NotPreferred, RequestStatus::NotPreferred),
        ];
        for (qualifier, expected) in cases {
            let (status, bytes) = translate_status(&req, engine(P::Ok, B::IoFailed, qualifier));
            assert_eq!(status, expected);
            assert_eq!(bytes, 0);
        }
    }

    #[test]
    fn aborted_and_invalid_map_directly() {
        let req = read_request(1);
        let (status, _) = translate_status(&req, engine(P::Ok, B::Aborted, Q::None));
        assert_eq!(status, RequestStatus::Cancelled);
        let (status, _) = translate_status(&req, engine(P::Ok, B::InvalidRequest, Q::None));
        assert_eq!(status, RequestStatus::InvalidRequest);
    }

    #[test]
    fn unmapped_block_status_is_retryable() {
        let req = read_request(1);
        let (status, _) = translate_status(&req, engine(P::Ok, B::Invalid, Q::None));
        assert_eq!(status, RequestStatus::DeviceNotReady);
        assert!(status.is_retryable());
    }
}
