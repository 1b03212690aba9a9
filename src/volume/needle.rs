//! Needle record format
//!
//! ```text
//! [COOKIE:4][KEY:8][SIZE:4][FLAGS:1][DATA:size][APPEND_AT_NS:8][CRC32:4]
//! ```
//!
//! All integers little endian. The CRC covers every byte before it, so a
//! flip anywhere in the record is detected.

use crate::common::{crc32, timestamp_now_nanos, Cookie, Error, NeedleKey, Result};

pub const HEADER_SIZE: usize = 4 + 8 + 4 + 1;
pub const TRAILER_SIZE: usize = 8 + 4;

pub const FLAG_TOMBSTONE: u8 = 0x01;

/// On-disk length of a record carrying `size` data bytes
pub fn record_len(size: u32) -> u64 {
    (HEADER_SIZE + TRAILER_SIZE) as u64 + size as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleHeader {
    pub cookie: Cookie,
    pub key: NeedleKey,
    pub size: u32,
    pub flags: u8,
}

impl NeedleHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "needle header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            cookie: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            key: u64::from_le_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            size: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            flags: buf[16],
        })
    }

    pub fn record_len(&self) -> u64 {
        record_len(self.size)
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }
}

/// A stored blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Needle {
    pub cookie: Cookie,
    pub key: NeedleKey,
    pub flags: u8,
    pub data: Vec<u8>,
    pub append_at_ns: u64,
}

/// The size field is 32 bits wide.
fn data_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::InvalidArgument(format!(
            "needle body of {} bytes exceeds the {} byte record limit",
            len,
            u32::MAX
        ))
    })
}

impl Needle {
    pub fn new(key: NeedleKey, cookie: Cookie, data: Vec<u8>) -> Self {
        Self {
            cookie,
            key,
            flags: 0,
            data,
            append_at_ns: timestamp_now_nanos(),
        }
    }

    pub fn tombstone(key: NeedleKey, cookie: Cookie) -> Self {
        Self {
            cookie,
            key,
            flags: FLAG_TOMBSTONE,
            data: Vec::new(),
            append_at_ns: timestamp_now_nanos(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    /// Body length, saturated; `to_bytes` refuses bodies that do not fit.
    pub fn size(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    pub fn record_len(&self) -> u64 {
        record_len(self.size())
    }

    /// Serialize to the on-disk record
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let size = data_len(self.data.len())?;
        let mut buf = Vec::with_capacity(record_len(size) as usize);
        buf.extend_from_slice(&self.cookie.to_le_bytes());
        buf.extend_from_slice(&self.key.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.push(self.flags);
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.append_at_ns.to_le_bytes());
        let checksum = crc32(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Parse and checksum a complete record.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = NeedleHeader::parse(buf)?;
        let expected_len = header.record_len();
        if buf.len() as u64 != expected_len {
            return Err(Error::Corrupt(format!(
                "needle {:x} record is {} bytes, header says {}",
                header.key,
                buf.len(),
                expected_len
            )));
        }

        let crc_at = buf.len() - 4;
        let stored = u32::from_le_bytes([buf[crc_at], buf[crc_at + 1], buf[crc_at + 2], buf[crc_at + 3]]);
        let computed = crc32(&buf[..crc_at]);
        if stored != computed {
            return Err(Error::Corrupt(format!(
                "needle {:x} checksum mismatch: stored {:08x}, computed {:08x}",
                header.key, stored, computed
            )));
        }

        let data_end = HEADER_SIZE + header.size as usize;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[data_end..data_end + 8]);

        Ok(Self {
            cookie: header.cookie,
            key: header.key,
            flags: header.flags,
            data: buf[HEADER_SIZE..data_end].to_vec(),
            append_at_ns: u64::from_le_bytes(ts),
        })
    }

    /// Parse a record fetched through the index and check it is the one the
    /// index points at.
    pub fn parse_expected(buf: &[u8], key: NeedleKey, size: u32) -> Result<Self> {
        let needle = Self::parse(buf)?;
        if needle.key != key || needle.size() != size || needle.is_tombstone() {
            return Err(Error::Corrupt(format!(
                "index expects needle {:x} of {} bytes, found {:x} of {} bytes",
                key,
                size,
                needle.key,
                needle.size()
            )));
        }
        Ok(needle)
    }

    pub fn etag(&self) -> String {
        format!("{:08x}", crc32(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let needle = Needle::new(0x1234, 0xdeadbeef, b"hello".to_vec());
        let bytes = needle.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, record_len(5));
        assert_eq!(&bytes[0..4], &0xdeadbeefu32.to_le_bytes());
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 5], b"hello");

        let parsed = Needle::parse(&bytes).unwrap();
        assert_eq!(parsed, needle);
    }

    #[test]
    fn test_every_flipped_byte_is_corrupt() {
        let needle = Needle::new(42, 7, b"some needle payload".to_vec());
        let bytes = needle.to_bytes().unwrap();
        for i in 0..bytes.len() {
            let mut damaged = bytes.clone();
            damaged[i] ^= 0x01;
            assert!(
                matches!(Needle::parse_expected(&damaged, 42, 19), Err(Error::Corrupt(_))),
                "flip at byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn test_tombstone() {
        let t = Needle::tombstone(9, 1);
        assert!(t.is_tombstone());
        let parsed = Needle::parse(&t.to_bytes().unwrap()).unwrap();
        assert!(parsed.is_tombstone());
        assert_eq!(parsed.size(), 0);
    }

    #[test]
    fn test_parse_expected_mismatch() {
        let bytes = Needle::new(1, 1, b"abc".to_vec()).to_bytes().unwrap();
        assert!(Needle::parse_expected(&bytes, 2, 3).is_err());
        assert!(Needle::parse_expected(&bytes, 1, 4).is_err());
        assert!(Needle::parse(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_body_length_must_fit_size_field() {
        assert_eq!(data_len(5).unwrap(), 5);
        assert_eq!(data_len(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            data_len(u32::MAX as usize + 1),
            Err(Error::InvalidArgument(_))
        ));
    }
}
