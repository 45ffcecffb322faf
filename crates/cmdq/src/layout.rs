//! # Command Layout
//!
//! Byte layout of a command record inside a queue's arena.
//!
//! ```text
//! offset 0                 HEADER_SIZE
//! ┌────────────────────────┬───────────────┬───────────────┬──────────────┐
//! │ CommandHeader          │ dst entries   │ src entries   │ payload      │
//! │ (10 x u32, LE)         │ n x 8 bytes   │ m x 8 bytes   │ data_size,   │
//! │                        │               │               │ 4-aligned    │
//! └────────────────────────┴───────────────┴───────────────┴──────────────┘
//! ```
//!
//! A sync entry stores the write and read snapshots. The shared counters it
//! refers to live in the queue's side table at the entry's word index.

use helix_cmdq_core::{CommandType, DeviceIndex, Error, ProcessId, Result};
use static_assertions::const_assert_eq;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Alignment of every command and every size handed to the queue
pub const COMMAND_ALIGN: u32 = 4;

/// Header size in bytes
pub const HEADER_SIZE: usize = 40;

/// Size of one sync entry in bytes
pub const SYNC_ENTRY_SIZE: usize = 8;

const FIELD_SIZE: usize = 0;
const FIELD_DEVICE: usize = 4;
const FIELD_TYPE: usize = 8;
const FIELD_DST_COUNT: usize = 12;
const FIELD_SRC_COUNT: usize = 16;
const FIELD_DATA_SIZE: usize = 20;
const FIELD_SUBMITTER: usize = 24;
const FIELD_DST_OFFSET: usize = 28;
const FIELD_SRC_OFFSET: usize = 32;
const FIELD_DATA_OFFSET: usize = 36;

const_assert_eq!(FIELD_DATA_OFFSET + 4, HEADER_SIZE);
const_assert_eq!(HEADER_SIZE % COMMAND_ALIGN as usize, 0);
const_assert_eq!(SYNC_ENTRY_SIZE % COMMAND_ALIGN as usize, 0);

/// Round up to command alignment
#[inline]
pub const fn align_up(size: u32) -> u32 {
    (size + (COMMAND_ALIGN - 1)) & !(COMMAND_ALIGN - 1)
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

#[inline]
pub(crate) fn write_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// COMMAND HEADER
// =============================================================================

/// Decoded command header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Total record size in bytes, aligned
    pub size: u32,
    /// Target device
    pub device: DeviceIndex,
    /// Command type on that device
    pub command_type: CommandType,
    /// Number of destination sync entries
    pub dst_count: u32,
    /// Number of source sync entries
    pub src_count: u32,
    /// Payload length in bytes (unaligned)
    pub data_size: u32,
    /// Process that inserted the command
    pub submitter: ProcessId,
    /// Offset of the destination entries from the record start
    pub dst_offset: u32,
    /// Offset of the source entries from the record start
    pub src_offset: u32,
    /// Offset of the payload from the record start
    pub data_offset: u32,
}

impl CommandHeader {
    /// Build a header with its offsets laid out
    pub fn new(
        device: DeviceIndex,
        command_type: CommandType,
        dst_count: u32,
        src_count: u32,
        data_size: u32,
        submitter: ProcessId,
    ) -> Result<Self> {
        let size = Self::record_size(dst_count, src_count, data_size)?;
        let mut header = Self {
            size,
            device,
            command_type,
            dst_count,
            src_count,
            data_size,
            submitter,
            dst_offset: 0,
            src_offset: 0,
            data_offset: 0,
        };
        header.fix_up();
        Ok(header)
    }

    /// Record size for the given counts, or `CmdTooBig` on overflow
    pub fn record_size(dst_count: u32, src_count: u32, data_size: u32) -> Result<u32> {
        let syncs = (dst_count as u64 + src_count as u64) * SYNC_ENTRY_SIZE as u64;
        let data = (data_size as u64 + (COMMAND_ALIGN as u64 - 1)) & !(COMMAND_ALIGN as u64 - 1);
        let total = HEADER_SIZE as u64 + syncs + data;
        u32::try_from(total).map_err(|_| Error::CmdTooBig)
    }

    /// Recompute the section offsets from the counts
    pub fn fix_up(&mut self) {
        let entry = SYNC_ENTRY_SIZE as u32;
        self.dst_offset = HEADER_SIZE as u32;
        self.src_offset = self
            .dst_offset
            .wrapping_add(self.dst_count.wrapping_mul(entry));
        self.data_offset = self
            .src_offset
            .wrapping_add(self.src_count.wrapping_mul(entry));
    }

    /// Offsets are consistent with the counts and the record size
    pub fn is_consistent(&self) -> bool {
        let mut expected = *self;
        expected.fix_up();
        expected.dst_offset == self.dst_offset
            && expected.src_offset == self.src_offset
            && expected.data_offset == self.data_offset
            && Self::record_size(self.dst_count, self.src_count, self.data_size).ok()
                == Some(self.size)
    }

    /// Offset of destination entry `index` from the record start
    #[inline]
    pub fn dst_entry(&self, index: u32) -> usize {
        (self.dst_offset + index * SYNC_ENTRY_SIZE as u32) as usize
    }

    /// Offset of source entry `index` from the record start
    #[inline]
    pub fn src_entry(&self, index: u32) -> usize {
        (self.src_offset + index * SYNC_ENTRY_SIZE as u32) as usize
    }

    /// Encode into the first `HEADER_SIZE` bytes of `bytes`
    pub fn encode(&self, bytes: &mut [u8]) {
        write_u32(bytes, FIELD_SIZE, self.size);
        write_u32(bytes, FIELD_DEVICE, self.device.raw());
        write_u32(bytes, FIELD_TYPE, self.command_type.raw());
        write_u32(bytes, FIELD_DST_COUNT, self.dst_count);
        write_u32(bytes, FIELD_SRC_COUNT, self.src_count);
        write_u32(bytes, FIELD_DATA_SIZE, self.data_size);
        write_u32(bytes, FIELD_SUBMITTER, self.submitter.0);
        write_u32(bytes, FIELD_DST_OFFSET, self.dst_offset);
        write_u32(bytes, FIELD_SRC_OFFSET, self.src_offset);
        write_u32(bytes, FIELD_DATA_OFFSET, self.data_offset);
    }

    /// Decode from the first `HEADER_SIZE` bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            size: read_u32(bytes, FIELD_SIZE),
            device: DeviceIndex::new(read_u32(bytes, FIELD_DEVICE)),
            command_type: CommandType::new(read_u32(bytes, FIELD_TYPE)),
            dst_count: read_u32(bytes, FIELD_DST_COUNT),
            src_count: read_u32(bytes, FIELD_SRC_COUNT),
            data_size: read_u32(bytes, FIELD_DATA_SIZE),
            submitter: ProcessId(read_u32(bytes, FIELD_SUBMITTER)),
            dst_offset: read_u32(bytes, FIELD_DST_OFFSET),
            src_offset: read_u32(bytes, FIELD_SRC_OFFSET),
            data_offset: read_u32(bytes, FIELD_DATA_OFFSET),
        }
    }
}

/// Write a sync entry's snapshots at `at`
pub(crate) fn encode_sync_entry(bytes: &mut [u8], at: usize, write_pending: u32, read_pending: u32) {
    write_u32(bytes, at, write_pending);
    write_u32(bytes, at + 4, read_pending);
}

/// Read a sync entry's `(write, read)` snapshots at `at`
pub(crate) fn decode_sync_entry(bytes: &[u8], at: usize) -> (u32, u32) {
    (read_u32(bytes, at), read_u32(bytes, at + 4))
}
