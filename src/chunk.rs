//! Data-buffer sizing for block transfers.
//!
//! Every buffered transfer is backed by a run of fixed-size memory chunks.
//! [`plan_allocation`] picks a chunk-size class from the block count and
//! computes how many chunks cover the data payload plus the auxiliary
//! structures (scatter-gather list, and either the packet envelope or the
//! transfer-control block) carved from the tail of the allocation.

use crate::error::AllocationPlanError;

/// Client-visible block size in bytes.
pub const EXPORTED_BLOCK_SIZE: u64 = 512;
/// On-media block size in bytes (data plus integrity metadata). All buffer
/// sizing uses this.
pub const PHYSICAL_BLOCK_SIZE: u64 = 520;

/// Bytes per scatter-gather element (address + length pair).
const SG_ELEMENT_BYTES: u64 = 16;
/// Bytes reserved for the transport packet when it shares the data
/// allocation (non-DCA path).
pub const PACKET_ENVELOPE_BYTES: u64 = 2_048;
/// Bytes reserved for the transfer-control block on the DCA path.
pub const TRANSFER_CONTROL_BYTES: u64 = 128;

/// Chunk-size class for a buffered transfer.
///
/// Selected from the block count alone: tiny transfers get small chunks,
/// everything else gets 64-block chunks. The `Packet` class is sized so a
/// full 64-block payload, its scatter-gather list, and the packet envelope
/// all fit in a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    /// 2 KiB chunks holding one data block each.
    OneBlock,
    /// 36 KiB chunks holding up to 64 data blocks plus the packet envelope.
    Packet,
    /// 33.3 KB chunks holding exactly 64 data blocks (64 x 520).
    SixtyFourBlocks,
}

impl ChunkSize {
    /// Chunk size in bytes.
    pub const fn bytes(self) -> u64 {
        match self {
            ChunkSize::OneBlock => 2_048,
            ChunkSize::Packet => 36_864,
            ChunkSize::SixtyFourBlocks => 33_280,
        }
    }

    /// Data blocks that fit in one chunk of this class.
    pub const fn blocks_per_chunk(self) -> u64 {
        match self {
            ChunkSize::OneBlock => 1,
            ChunkSize::Packet => 64,
            ChunkSize::SixtyFourBlocks => 64,
        }
    }

    /// Pick the class for a transfer of `blocks` blocks.
    pub fn for_blocks(blocks: u64) -> Self {
        if blocks <= 1 {
            ChunkSize::OneBlock
        } else if blocks > 64 {
            ChunkSize::SixtyFourBlocks
        } else {
            ChunkSize::Packet
        }
    }
}

/// A sized allocation: chunk class, chunk count, and the tail layout of the
/// auxiliary structures.
///
/// The allocation is laid out with data from the front, the scatter-gather
/// list just below the tail, and the envelope / transfer-control block at
/// the very end of the last chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    chunk_size: ChunkSize,
    chunk_count: u32,
    blocks: u64,
    sg_bytes: u64,
    control_bytes: u64,
}

impl ChunkPlan {
    /// Chunk-size class of the allocation.
    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    /// Number of chunks to allocate.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Blocks covered by the plan.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Total bytes across all chunks.
    pub fn total_bytes(&self) -> u64 {
        self.chunk_count as u64 * self.chunk_size.bytes()
    }

    /// Bytes occupied by the data payload (blocks at physical block size).
    pub fn payload_bytes(&self) -> u64 {
        self.blocks * PHYSICAL_BLOCK_SIZE
    }

    /// Number of scatter-gather entries, including the terminator and the
    /// spare entry.
    pub fn sg_entry_count(&self) -> u32 {
        (self.blocks.div_ceil(self.chunk_size.blocks_per_chunk()) + 2) as u32
    }

    /// Byte offset of the scatter-gather list within the allocation.
    pub fn sg_offset(&self) -> u64 {
        self.total_bytes() - self.control_bytes - self.sg_bytes
    }

    /// Byte offset of the envelope or transfer-control block within the
    /// allocation.
    pub fn control_offset(&self) -> u64 {
        self.total_bytes() - self.control_bytes
    }
}

/// Size the chunk allocation for a transfer of `blocks` blocks.
///
/// `include_transfer_control` selects the DCA-style tail (transfer-control
/// block) instead of the packet envelope. The returned plan never
/// under-allocates: `total_bytes() >= payload + sg list + tail`.
pub fn plan_allocation(
    blocks: u64,
    include_transfer_control: bool,
) -> Result<ChunkPlan, AllocationPlanError> {
    if blocks == 0 {
        return Err(AllocationPlanError::ZeroBlocks);
    }

    let chunk_size = ChunkSize::for_blocks(blocks);
    let data_chunks = blocks.div_ceil(chunk_size.blocks_per_chunk());
    if data_chunks > u32::MAX as u64 {
        return Err(AllocationPlanError::TooManyChunks { blocks });
    }

    // Terminator plus one spare entry, rounded up to 8-byte alignment.
    let sg_bytes = ((data_chunks + 2) * SG_ELEMENT_BYTES).next_multiple_of(8);
    let control_bytes = if include_transfer_control {
        TRANSFER_CONTROL_BYTES
    } else {
        PACKET_ENVELOPE_BYTES
    };

    let payload = blocks
        .checked_mul(PHYSICAL_BLOCK_SIZE)
        .ok_or(AllocationPlanError::TooManyChunks { blocks })?;
    let needed = payload
        .checked_add(sg_bytes + control_bytes)
        .ok_or(AllocationPlanError::TooManyChunks { blocks })?;

    let chunk_count = needed.div_ceil(chunk_size.bytes());
    if chunk_count > u32::MAX as u64 {
        return Err(AllocationPlanError::TooManyChunks { blocks });
    }

    Ok(ChunkPlan {
        chunk_size,
        chunk_count: chunk_count as u32,
        blocks,
        sg_bytes,
        control_bytes,
    })
}
