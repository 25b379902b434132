//! Split-packet reassembly.
//!
//! A response too large for one datagram arrives as fragments sharing a
//! split id. Fragment layout after the `-2` outer header:
//!
//! ```text
//! ┌───────────┬───────┬────────┬─────────┬──────────────────────┬─────────┐
//! │ split-id  │ total │ number │ size    │ decompressed + crc32 │ payload │
//! │ int32 LE  │ uint8 │ uint8  │ u16 LE  │ int32 LE ×2 (note)   │         │
//! └───────────┴───────┴────────┴─────────┴──────────────────────┴─────────┘
//! ```
//!
//! The top bit of `split-id` marks the group as bzip2-compressed; the
//! decompressed size and CRC32 ride only on fragment zero of a compressed
//! group. The [`ReassemblyBuffer`] accumulates fragments in any arrival
//! order and emits a virtual single packet (`-1` outer header prepended)
//! once every slot is filled and the payload is verified.

use std::io::Read;

use bytes::Bytes;

use crate::error::CodecError;

use super::query::{ByteReader, SINGLE_PACKET};

/// Top bit of the split id: group payload is bzip2-compressed.
const COMPRESSED_FLAG: u32 = 0x8000_0000;

/// One decoded fragment of a split packet.
#[derive(Debug, Clone)]
pub struct SplitFragment {
    /// Raw split id, compressed flag still set.
    pub id: i32,
    /// Fragment count for the group.
    pub total: u8,
    /// Zero-based index of this fragment.
    pub number: u8,
    /// Fragment body size as declared by the sender.
    pub size: u16,
    /// Decompressed payload size; fragment zero of a compressed group only.
    pub decompressed_size: Option<i32>,
    /// CRC32 of the decompressed payload; fragment zero of a compressed group only.
    pub crc32: Option<u32>,
    /// Fragment payload bytes.
    pub payload: Bytes,
}

impl SplitFragment {
    /// Decode a fragment from the bytes following the `-2` outer header.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(buf);
        let id = reader.i32_le()?;
        let total = reader.u8()?;
        let number = reader.u8()?;
        let size = reader.u16_le()?;

        let compressed = (id as u32) & COMPRESSED_FLAG != 0;
        let (decompressed_size, crc32) = if compressed && number == 0 {
            (Some(reader.i32_le()?), Some(reader.i32_le()? as u32))
        } else {
            (None, None)
        };

        if number >= total {
            return Err(CodecError::Reassembly(format!(
                "fragment index {number} out of range (total {total})"
            )));
        }

        let consumed = buf.len() - reader.remaining();
        Ok(Self {
            id,
            total,
            number,
            size,
            decompressed_size,
            crc32,
            payload: Bytes::copy_from_slice(&buf[consumed..]),
        })
    }

    /// Whether the group payload is bzip2-compressed.
    #[inline]
    pub fn compressed(&self) -> bool {
        (self.id as u32) & COMPRESSED_FLAG != 0
    }

    /// Split id with the compressed flag stripped.
    #[inline]
    pub fn group_id(&self) -> i32 {
        ((self.id as u32) & !COMPRESSED_FLAG) as i32
    }
}

/// Accumulates the fragments of one split group.
///
/// Owned by the session manager, keyed by (destination, group id). Fragments
/// may arrive in any order; group headers must agree across fragments or the
/// whole buffer is discarded.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    group_id: i32,
    total: u8,
    size: u16,
    compressed: bool,
    decompressed_size: Option<i32>,
    crc32: Option<u32>,
    slots: Vec<Option<Bytes>>,
    filled: usize,
}

impl ReassemblyBuffer {
    /// Allocate an empty buffer sized for the fragment's group. The fragment
    /// itself still has to be [`insert`](Self::insert)ed; the first fragment
    /// seen is not necessarily fragment zero.
    pub fn for_fragment(fragment: &SplitFragment) -> Self {
        Self {
            group_id: fragment.group_id(),
            total: fragment.total,
            size: fragment.size,
            compressed: fragment.compressed(),
            decompressed_size: None,
            crc32: None,
            slots: vec![None; fragment.total as usize],
            filled: 0,
        }
    }

    /// Insert a fragment; returns the virtual single packet when the group
    /// completes.
    pub fn insert(&mut self, fragment: SplitFragment) -> Result<Option<Bytes>, CodecError> {
        if fragment.group_id() != self.group_id {
            return Err(CodecError::Reassembly(format!(
                "fragment group {} does not match buffer group {}",
                fragment.group_id(),
                self.group_id
            )));
        }
        if fragment.total != self.total {
            return Err(CodecError::Reassembly(format!(
                "fragment declares total {}, buffer has {}",
                fragment.total, self.total
            )));
        }
        if fragment.size != self.size {
            return Err(CodecError::Reassembly(format!(
                "fragment declares size {}, buffer has {}",
                fragment.size, self.size
            )));
        }

        let slot = &mut self.slots[fragment.number as usize];
        if slot.is_some() {
            return Err(CodecError::Reassembly(format!(
                "duplicate fragment {}",
                fragment.number
            )));
        }

        if fragment.number == 0 && self.compressed {
            self.decompressed_size = fragment.decompressed_size;
            self.crc32 = fragment.crc32;
        }

        *slot = Some(fragment.payload);
        self.filled += 1;

        if self.filled < self.total as usize {
            return Ok(None);
        }
        self.assemble().map(Some)
    }

    /// Concatenate in index order, decompress and verify if flagged, and
    /// prepend the `-1` outer header.
    fn assemble(&mut self) -> Result<Bytes, CodecError> {
        let mut payload = Vec::new();
        for slot in &self.slots {
            let chunk = slot
                .as_ref()
                .ok_or_else(|| CodecError::Reassembly("missing fragment slot".into()))?;
            payload.extend_from_slice(chunk);
        }

        if self.compressed {
            payload = self.decompress(&payload)?;
        }

        let mut datagram = Vec::with_capacity(4 + payload.len());
        datagram.extend_from_slice(&SINGLE_PACKET.to_le_bytes());
        datagram.extend_from_slice(&payload);
        Ok(Bytes::from(datagram))
    }

    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>, CodecError> {
        let expected_size = self
            .decompressed_size
            .ok_or_else(|| CodecError::Reassembly("compressed group without size header".into()))?;
        let expected_crc = self
            .crc32
            .ok_or_else(|| CodecError::Reassembly("compressed group without crc header".into()))?;

        let mut decompressed = Vec::with_capacity(expected_size.max(0) as usize);
        bzip2::read::BzDecoder::new(compressed)
            .read_to_end(&mut decompressed)
            .map_err(|e| CodecError::Decompress(e.to_string()))?;

        if decompressed.len() != expected_size as usize {
            return Err(CodecError::Decompress(format!(
                "decompressed to {} bytes, header declared {}",
                decompressed.len(),
                expected_size
            )));
        }

        let actual_crc = crc32fast::hash(&decompressed);
        if actual_crc != expected_crc {
            return Err(CodecError::Checksum {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        Ok(decompressed)
    }

    /// Group id this buffer collects.
    #[inline]
    pub fn group_id(&self) -> i32 {
        self.group_id
    }

    /// Fragments received so far.
    #[inline]
    pub fn filled(&self) -> usize {
        self.filled
    }
}
