//! Fixed-layout placement records.
//!
//! The placement log is a 16-byte header followed by 72-byte little-endian
//! records:
//!
//! ```text
//! header: magic "GRPL" | version u32 | record_len u32 | reserved u32
//! record: heap_key u32 | resource_key u32 | capture_offset u64 |
//!         current_offset u64 | size u64 | alignment u64 | description [u8; 32]
//! ```

use bytes::{Buf, BufMut};
use gpureplay_core::{CoreError, CoreResult, DescriptionSnapshot, ObjectKey};
use serde::{Deserialize, Serialize};

/// Default placement log file name
pub const PLACEMENT_FILE_NAME: &str = "resourcePlacementData.dat";

/// Log file magic
pub const MAGIC: [u8; 4] = *b"GRPL";

/// Current record layout version
pub const FORMAT_VERSION: u32 = 1;

/// Header length in bytes
pub const HEADER_LEN: usize = 16;

/// Record length in bytes
pub const RECORD_LEN: usize = 4 + 4 + 8 * 4 + DescriptionSnapshot::LEN;

/// Canonical placement of one resource inside one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    /// Owning heap
    pub heap_key: ObjectKey,
    /// Placed resource
    pub resource_key: ObjectKey,
    /// Offset recorded in the capture
    pub capture_offset: u64,
    /// Offset to use at replay
    pub current_offset: u64,
    /// Replay footprint
    pub size: u64,
    /// Replay alignment
    pub alignment: u64,
    /// Fingerprint of the resource descriptor
    pub description: DescriptionSnapshot,
}

impl PlacementRecord {
    /// One past the last byte at the replay offset
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.current_offset.saturating_add(self.size)
    }

    /// Append the fixed-layout encoding to `buf`
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.heap_key.as_u32());
        buf.put_u32_le(self.resource_key.as_u32());
        buf.put_u64_le(self.capture_offset);
        buf.put_u64_le(self.current_offset);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.alignment);
        buf.put_slice(self.description.as_bytes());
    }

    /// Decode one record from the front of `buf`
    ///
    /// # Errors
    ///
    /// Returns error if fewer than [`RECORD_LEN`] bytes remain
    pub fn decode(buf: &mut impl Buf) -> CoreResult<Self> {
        if buf.remaining() < RECORD_LEN {
            return Err(CoreError::PersistenceCorruption {
                reason: format!(
                    "truncated record: {} of {} bytes",
                    buf.remaining(),
                    RECORD_LEN
                ),
            });
        }
        let heap_key = ObjectKey::new(buf.get_u32_le());
        let resource_key = ObjectKey::new(buf.get_u32_le());
        let capture_offset = buf.get_u64_le();
        let current_offset = buf.get_u64_le();
        let size = buf.get_u64_le();
        let alignment = buf.get_u64_le();
        let mut description = [0u8; DescriptionSnapshot::LEN];
        buf.copy_to_slice(&mut description);
        Ok(Self {
            heap_key,
            resource_key,
            capture_offset,
            current_offset,
            size,
            alignment,
            description: DescriptionSnapshot::from_bytes(description),
        })
    }
}

/// Write the log header
pub fn encode_header(buf: &mut impl BufMut) {
    buf.put_slice(&MAGIC);
    buf.put_u32_le(FORMAT_VERSION);
    buf.put_u32_le(RECORD_LEN as u32);
    buf.put_u32_le(0);
}

/// Check the log header
///
/// # Errors
///
/// Returns error if the header is short, has the wrong magic, or describes
/// another layout
pub fn decode_header(buf: &mut impl Buf) -> CoreResult<()> {
    let corrupt = |reason: String| CoreError::PersistenceCorruption { reason };
    if buf.remaining() < HEADER_LEN {
        return Err(corrupt(format!("header is {} bytes", buf.remaining())));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(corrupt(format!("bad magic {magic:02x?}")));
    }
    let version = buf.get_u32_le();
    let record_len = buf.get_u32_le();
    let _reserved = buf.get_u32_le();
    if version != FORMAT_VERSION || record_len as usize != RECORD_LEN {
        return Err(corrupt(format!(
            "layout v{version}/{record_len} bytes, expected v{FORMAT_VERSION}/{RECORD_LEN} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpureplay_core::ResourceDesc;

    fn sample() -> PlacementRecord {
        PlacementRecord {
            heap_key: ObjectKey::new(3),
            resource_key: ObjectKey::new(0x0102_0304),
            capture_offset: 256,
            current_offset: 320,
            size: 256,
            alignment: 64,
            description: ResourceDesc::buffer(256).snapshot(),
        }
    }

    #[test]
    fn test_record_len() {
        assert_eq!(RECORD_LEN, 72);
        let mut buf = Vec::new();
        sample().encode(&mut buf);
        assert_eq!(buf.len(), RECORD_LEN);
    }

    #[test]
    fn test_record_layout_little_endian() {
        let mut buf = Vec::new();
        sample().encode(&mut buf);
        assert_eq!(&buf[0..4], &[3, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[4, 3, 2, 1]);
        assert_eq!(&buf[8..16], &256u64.to_le_bytes());
        assert_eq!(&buf[16..24], &320u64.to_le_bytes());
    }

    #[test]
    fn test_record_decode() {
        let mut buf = Vec::new();
        sample().encode(&mut buf);
        let decoded = PlacementRecord::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(decoded.end(), 576);
    }

    #[test]
    fn test_truncated_record() {
        let mut buf = Vec::new();
        sample().encode(&mut buf);
        let result = PlacementRecord::decode(&mut &buf[..RECORD_LEN - 1]);
        assert!(matches!(result, Err(CoreError::PersistenceCorruption { .. })));
    }

    #[test]
    fn test_header() {
        let mut buf = Vec::new();
        encode_header(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert!(decode_header(&mut buf.as_slice()).is_ok());
    }

    #[test]
    fn test_header_rejects_other_layouts() {
        let mut buf = Vec::new();
        encode_header(&mut buf);
        buf[4] = 9;
        assert!(decode_header(&mut buf.as_slice()).is_err());

        let mut buf = Vec::new();
        encode_header(&mut buf);
        buf[0] = b'X';
        assert!(decode_header(&mut buf.as_slice()).is_err());

        assert!(decode_header(&mut &b"GRPL"[..]).is_err());
    }
}
