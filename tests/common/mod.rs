//! Shared test doubles: a scriptable transport backend and data movers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blockshim::{
    BlockOpcode, BufferHandle, ChunkPlan, DataMover, EngineStatus, PacketRequest, Priority,
    Transport, TransportError,
};

/// What a submitted packet looked like, minus its completion.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub opcode: BlockOpcode,
    pub lba: u64,
    pub blocks: u64,
    pub block_size: u64,
    pub priority: Priority,
    pub sg_entries: u32,
    pub buffer_bytes: Option<u64>,
}

/// A transport backend that records submissions and completes packets on
/// demand (or inline when scripted to).
pub struct MockTransport {
    pending: Mutex<VecDeque<PacketRequest>>,
    log: Mutex<Vec<PacketInfo>>,
    inline: Mutex<Option<EngineStatus>>,
    fail_allocations: AtomicBool,
    next_buffer_id: AtomicU64,
    outstanding_buffers: AtomicI64,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            inline: Mutex::new(None),
            fail_allocations: AtomicBool::new(false),
            next_buffer_id: AtomicU64::new(1),
            outstanding_buffers: AtomicI64::new(0),
        })
    }

    /// Complete every subsequent submission inline with `status`.
    pub fn complete_inline(&self, status: EngineStatus) {
        *self.inline.lock().unwrap() = Some(status);
    }

    /// Make chunk allocation fail until turned off again.
    pub fn fail_allocations(&self, enable: bool) {
        self.fail_allocations.store(enable, Ordering::SeqCst);
    }

    /// Packets submitted and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Complete the oldest pending packet with `status`. Returns false if
    /// nothing is pending.
    pub fn complete_next(&self, status: EngineStatus) -> bool {
        let Some(packet) = self.pending.lock().unwrap().pop_front() else {
            return false;
        };
        (packet.completion)(status);
        true
    }

    /// Block until `n` packets are pending, panicking after 5 seconds.
    pub fn wait_for_pending(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.pending_count() < n {
            assert!(Instant::now() < deadline, "timed out waiting for {n} pending packets");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Everything submitted so far, in order.
    pub fn submissions(&self) -> Vec<PacketInfo> {
        self.log.lock().unwrap().clone()
    }

    /// Chunk allocations not yet released.
    pub fn outstanding_buffers(&self) -> i64 {
        self.outstanding_buffers.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn allocate_chunks(&self, plan: &ChunkPlan) -> Result<BufferHandle, TransportError> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(TransportError::NoChunks);
        }
        self.outstanding_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(BufferHandle {
            id: self.next_buffer_id.fetch_add(1, Ordering::SeqCst),
            bytes: plan.total_bytes(),
        })
    }

    fn release_chunks(&self, _buffer: BufferHandle) {
        self.outstanding_buffers.fetch_sub(1, Ordering::SeqCst);
    }

    fn submit(&self, packet: PacketRequest) {
        self.log.lock().unwrap().push(PacketInfo {
            opcode: packet.opcode,
            lba: packet.lba,
            blocks: packet.blocks,
            block_size: packet.block_size,
            priority: packet.priority,
            sg_entries: packet.sg.entry_count,
            buffer_bytes: packet.buffer.map(|b| b.bytes),
        });
        let inline = *self.inline.lock().unwrap();
        match inline {
            Some(status) => (packet.completion)(status),
            None => self.pending.lock().unwrap().push_back(packet),
        }
    }
}

/// A data mover whose unpack step always reports a corrupt buffer.
pub struct CorruptReadMover;

impl DataMover for CorruptReadMover {
    fn pack(&self, _buffer: &BufferHandle, _blocks: u64) -> Result<(), TransportError> {
        Ok(())
    }

    fn unpack(&self, _buffer: &BufferHandle, _blocks: u64) -> Result<(), TransportError> {
        Err(TransportError::IntegrityCheck)
    }
}
