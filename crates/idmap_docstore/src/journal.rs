//! Journal frame format and replay.
//!
//! Every committed write transaction becomes exactly one frame:
//!
//! ```text
//! magic (4) | version (2) | length (4) | payload (length) | crc32 (4)
//! ```
//!
//! The payload is the CBOR encoding of a [`Batch`]. The CRC covers magic,
//! version, length and payload. A batch is applied in full or not at all,
//! which is what makes multi-document writes atomic across crashes.

use crate::collection::{CollectionSpec, Document};
use crate::error::{DocStoreError, DocStoreResult};
use crate::id::EntityId;
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a journal frame.
pub const FRAME_MAGIC: [u8; 4] = *b"IDMJ";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
const HEADER_SIZE: usize = 10;

const CRC_SIZE: usize = 4;

/// A single mutation inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Declare a collection.
    CreateCollection(CollectionSpec),
    /// Insert or replace a document.
    Put {
        /// Target collection.
        collection: String,
        /// Full document, key included.
        document: Document,
    },
    /// Remove a document.
    Delete {
        /// Target collection.
        collection: String,
        /// Key of the removed document.
        key: EntityId,
    },
}

/// The unit of atomicity: all ops of one committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Commit sequence number.
    pub sequence: u64,
    /// Mutations in application order.
    pub ops: Vec<JournalOp>,
}

impl Batch {
    /// Encodes the batch as a complete frame.
    pub fn encode_frame(&self) -> DocStoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(self, &mut payload)
            .map_err(|e| DocStoreError::codec(e.to_string()))?;

        let len = u32::try_from(payload.len()).map_err(|_| {
            DocStoreError::codec(format!("batch too large: {} bytes", payload.len()))
        })?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// Outcome of scanning a journal.
#[derive(Debug, Default)]
pub struct Replay {
    /// Intact batches in journal order.
    pub batches: Vec<Batch>,
    /// Length of the intact prefix. Anything past it is a torn write.
    pub valid_len: u64,
}

impl Replay {
    /// Returns true if bytes past the intact prefix were found.
    #[must_use]
    pub fn has_torn_tail(&self, journal_len: u64) -> bool {
        self.valid_len < journal_len
    }
}

/// Decodes every intact frame in `data`.
///
/// An incomplete frame at the end, or a final frame whose checksum does
/// not match, is treated as a torn write and excluded from `valid_len`.
/// A damaged frame followed by more data is corruption.
pub fn replay(data: &[u8]) -> DocStoreResult<Replay> {
    let mut replay = Replay::default();
    let mut offset = 0usize;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            break;
        }

        if rest[..4] != FRAME_MAGIC {
            return Err(DocStoreError::journal_corruption(
                offset as u64,
                "bad frame magic",
            ));
        }

        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != FRAME_VERSION {
            return Err(DocStoreError::journal_corruption(
                offset as u64,
                format!("unsupported frame version {version}"),
            ));
        }

        let len = u32::from_le_bytes([rest[6], rest[7], rest[8], rest[9]]) as usize;
        let frame_len = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < frame_len {
            break;
        }

        let body = &rest[..HEADER_SIZE + len];
        let stored = u32::from_le_bytes([
            rest[HEADER_SIZE + len],
            rest[HEADER_SIZE + len + 1],
            rest[HEADER_SIZE + len + 2],
            rest[HEADER_SIZE + len + 3],
        ]);
        let actual = compute_crc32(body);
        if stored != actual {
            if offset + frame_len == data.len() {
                break;
            }
            return Err(DocStoreError::ChecksumMismatch {
                offset: offset as u64,
                expected: stored,
                actual,
            });
        }

        let batch: Batch = ciborium::de::from_reader(&body[HEADER_SIZE..]).map_err(|e| {
            DocStoreError::journal_corruption(offset as u64, format!("undecodable batch: {e}"))
        })?;

        replay.batches.push(batch);
        offset += frame_len;
        replay.valid_len = offset as u64;
    }

    Ok(replay)
}

/// Computes CRC32 checksum for data (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
