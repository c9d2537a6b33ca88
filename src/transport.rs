//! Downstream transport contract.
//!
//! The shim never talks to devices directly. It hands fully-formed packet
//! requests to a [`Transport`] backend and learns the outcome through a
//! two-level [`EngineStatus`]: a packet-level status describing whether the
//! request travelled at all, and a block-level status (plus qualifier)
//! describing what the storage object did with it.

use crate::chunk::ChunkPlan;
use crate::error::TransportError;

/// Block operation carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOpcode {
    /// Read blocks into the attached buffer.
    Read,
    /// Write blocks from the attached buffer, bypassing the write cache.
    WriteNonCached,
    /// Zero a block range. No data buffer attached.
    Zero,
}

/// Priority class a packet travels at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    Urgent,
}

impl Priority {
    /// Class for a caller-supplied priority key. Only the low three bits of
    /// the key participate: keys 1 through 3 (optional and low tiers) travel
    /// low, key 7 urgent, everything else (including the default key 0 and
    /// the high tier) normal.
    pub fn from_key(key: u64) -> Self {
        match key & 0x7 {
            1..=3 => Priority::Low,
            7 => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

/// Packet-level status: did the request travel through the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    Ok,
    Cancelled,
    Busy,
    EdgeNotEnabled,
    Timeout,
    Failed,
    Other(i32),
}

/// Block-level status: what the storage object did with the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Success,
    MediaError,
    IoFailed,
    Aborted,
    InvalidRequest,
    Invalid,
}

/// Qualifier refining a [`BlockStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockQualifier {
    None,
    StillCongested,
    CrcError,
    RetryPossible,
    RetryNotPossible,
    Congested,
    NotPreferred,
}

/// Completion status reported by the transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub packet: PacketStatus,
    pub block: BlockStatus,
    pub qualifier: BlockQualifier,
}

impl EngineStatus {
    /// A fully successful completion.
    pub fn ok() -> Self {
        Self {
            packet: PacketStatus::Ok,
            block: BlockStatus::Success,
            qualifier: BlockQualifier::None,
        }
    }
}

/// Handle to a chunk allocation owned by the transport backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    /// Backend-assigned identifier.
    pub id: u64,
    /// Total bytes in the allocation.
    pub bytes: u64,
}

/// Opaque descriptor of a scatter-gather list.
///
/// For buffered operations the list lives in the tail of the chunk
/// allocation; for SGL operations the caller supplies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgDescriptor {
    /// Address (or buffer-relative offset) of the first element.
    pub addr: u64,
    /// Number of elements, including the terminator.
    pub entry_count: u32,
}

impl SgDescriptor {
    /// A descriptor for operations that carry no data buffer.
    pub fn empty() -> Self {
        Self {
            addr: 0,
            entry_count: 0,
        }
    }
}

/// A fully-formed packet request, ready for submission.
pub struct PacketRequest {
    pub opcode: BlockOpcode,
    pub lba: u64,
    pub blocks: u64,
    /// Block size the operation is expressed in.
    pub block_size: u64,
    pub priority: Priority,
    pub sg: SgDescriptor,
    /// Buffer backing the operation, if any. Released by the shim after
    /// completion.
    pub buffer: Option<BufferHandle>,
    /// Invoked exactly once by the backend when the operation completes.
    pub completion: Box<dyn FnOnce(EngineStatus) + Send>,
}

impl std::fmt::Debug for PacketRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRequest")
            .field("opcode", &self.opcode)
            .field("lba", &self.lba)
            .field("blocks", &self.blocks)
            .field("block_size", &self.block_size)
            .field("priority", &self.priority)
            .field("sg", &self.sg)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// Packet transport backend.
///
/// Implementations own chunk memory and the submission path. Every
/// submitted packet must have its completion invoked exactly once, on any
/// thread; a backend that cannot take the packet completes it inline with
/// a failure status (e.g. `PacketStatus::Busy`).
pub trait Transport: Send + Sync {
    /// Allocate the chunk run described by `plan`.
    fn allocate_chunks(&self, plan: &ChunkPlan) -> Result<BufferHandle, TransportError>;

    /// Return a chunk run to the backend.
    fn release_chunks(&self, buffer: BufferHandle);

    /// Submit a packet. The completion callback fires exactly once, later
    /// or inline.
    fn submit(&self, packet: PacketRequest);
}

/// Buffer data transform between the exported (512-byte) and physical
/// (520-byte) block formats.
///
/// The transform itself (checksums, integrity metadata) is owned by the
/// implementation; the shim only sequences it: writes are packed before
/// submission, reads are unpacked after a successful completion.
pub trait DataMover: Send + Sync {
    /// Convert `blocks` blocks in `buffer` from exported to physical format.
    fn pack(&self, buffer: &BufferHandle, blocks: u64) -> Result<(), TransportError>;

    /// Convert `blocks` blocks in `buffer` from physical to exported format.
    fn unpack(&self, buffer: &BufferHandle, blocks: u64) -> Result<(), TransportError>;
}

/// A [`DataMover`] that moves nothing. Useful when the backend operates on
/// pre-formatted buffers, and in tests.
pub struct PassthroughMover;

impl DataMover for PassthroughMover {
    fn pack(&self, _buffer: &BufferHandle, _blocks: u64) -> Result<(), TransportError> {
        Ok(())
    }

    fn unpack(&self, _buffer: &BufferHandle, _blocks: u64) -> Result<(), TransportError> {
        Ok(())
    }
}
