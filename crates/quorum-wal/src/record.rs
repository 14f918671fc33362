//! WAL record format with varint encoding and CRC32C checksumming.
//!
//! Record format:
//! - kind: u8 (1 = entry, 2 = truncate, 3 = compact, 4 = batch header)
//! - entry:    index varint, term varint, clen varint, command bytes[clen]
//! - truncate: from varint
//! - compact:  upto varint, term varint
//! - batch:    count varint, len varint
//! - crc32c: u32 (little-endian) over every preceding byte of the record
//!
//! A batch header precedes every multi-record append and covers the `len`
//! bytes of the `count` records after it. Recovery keeps a batch only when all
//! of them are intact.
//!
//! Kind 0 is never written, so zero-filled tails never decode as a record.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind};
use thiserror::Error;

const KIND_ENTRY: u8 = 1;
const KIND_TRUNCATE: u8 = 2;
const KIND_COMPACT: u8 = 3;
const KIND_BATCH: u8 = 4;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("Invalid record kind: {0}")]
    InvalidKind(u8),
    #[error("Incomplete record")]
    Incomplete,
}

/// A single durable log record.
///
/// Entries carry Raft log payloads; `Truncate` and `Compact` are markers that
/// replay applies in order to reconstruct the retained log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A log entry at `index` created in `term`.
    Entry {
        index: u64,
        term: u64,
        command: Bytes,
    },
    /// Drops every entry with index >= `from` written before this marker.
    Truncate { from: u64 },
    /// Drops every entry with index <= `upto`; `(upto, term)` becomes the log base.
    Compact { upto: u64, term: u64 },
}

impl Record {
    /// Creates an entry record.
    pub fn entry(index: u64, term: u64, command: impl Into<Bytes>) -> Self {
        Record::Entry {
            index,
            term,
            command: command.into(),
        }
    }

    /// Returns the entry index if this record is an entry.
    pub fn entry_index(&self) -> Option<u64> {
        match self {
            Record::Entry { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Encodes the record into bytes with CRC32C checksum.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the encoded record (including checksum) to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();

        match self {
            Record::Entry {
                index,
                term,
                command,
            } => {
                buf.put_u8(KIND_ENTRY);
                encode_varint(buf, *index);
                encode_varint(buf, *term);
                encode_varint(buf, command.len() as u64);
                buf.put_slice(command);
            }
            Record::Truncate { from } => {
                buf.put_u8(KIND_TRUNCATE);
                encode_varint(buf, *from);
            }
            Record::Compact { upto, term } => {
                buf.put_u8(KIND_COMPACT);
                encode_varint(buf, *upto);
                encode_varint(buf, *term);
            }
        }

        let crc = crc32c::crc32c(&buf[start..]);
        buf.put_u32_le(crc);
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Record::Entry { command, .. } => 1 + 10 + 10 + 10 + command.len() + 4,
            Record::Truncate { .. } => 1 + 10 + 4,
            Record::Compact { .. } => 1 + 10 + 10 + 4,
        }
    }

    /// Decodes a record from bytes, validating the CRC32C checksum.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), RecordError> {
        let (record, body_len) = Self::parse_body(data)?;
        let mut cursor = &data[body_len..];
        verify_crc(data, body_len + 4, &mut cursor)?;
        Ok((record, body_len + 4))
    }

    /// Length of the record at the start of `data` as declared by its own
    /// framing, without validating the checksum.
    pub fn framed_len(data: &[u8]) -> Result<usize, RecordError> {
        let (_, body_len) = Self::parse_body(data)?;
        if data.len() < body_len + 4 {
            return Err(RecordError::Incomplete);
        }
        Ok(body_len + 4)
    }

    fn parse_body(data: &[u8]) -> Result<(Self, usize), RecordError> {
        if data.is_empty() {
            return Err(RecordError::Incomplete);
        }

        let mut cursor = data;
        let kind = cursor[0];
        cursor.advance(1);

        let record = match kind {
            KIND_ENTRY => {
                let index = decode_varint(&mut cursor)?;
                let term = decode_varint(&mut cursor)?;
                let clen = decode_varint(&mut cursor)?;
                let command = extract_bytes(&mut cursor, clen)?;
                Record::Entry {
                    index,
                    term,
                    command,
                }
            }
            KIND_TRUNCATE => Record::Truncate {
                from: decode_varint(&mut cursor)?,
            },
            KIND_COMPACT => {
                let upto = decode_varint(&mut cursor)?;
                let term = decode_varint(&mut cursor)?;
                Record::Compact { upto, term }
            }
            other => return Err(RecordError::InvalidKind(other)),
        };

        Ok((record, data.len() - cursor.len()))
    }
}

/// Header framing a multi-record append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// Number of records in the batch.
    pub count: u64,
    /// Encoded length of those records, header excluded.
    pub len: u64,
}

impl BatchHeader {
    /// Whether `data` starts with a batch header rather than a record.
    pub fn starts(data: &[u8]) -> bool {
        data.first() == Some(&KIND_BATCH)
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(KIND_BATCH);
        encode_varint(buf, self.count);
        encode_varint(buf, self.len);
        let crc = crc32c::crc32c(&buf[start..]);
        buf.put_u32_le(crc);
    }

    /// Decodes a header, returning it and the bytes it occupies.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), RecordError> {
        let (header, body_len) = Self::parse_body(data)?;
        let mut cursor = &data[body_len..];
        verify_crc(data, body_len + 4, &mut cursor)?;
        Ok((header, body_len + 4))
    }

    /// Length of the header itself, without validating the checksum.
    pub fn framed_len(data: &[u8]) -> Result<usize, RecordError> {
        let (_, body_len) = Self::parse_body(data)?;
        if data.len() < body_len + 4 {
            return Err(RecordError::Incomplete);
        }
        Ok(body_len + 4)
    }

    fn parse_body(data: &[u8]) -> Result<(Self, usize), RecordError> {
        match data.first() {
            None => return Err(RecordError::Incomplete),
            Some(&KIND_BATCH) => {}
            Some(&other) => return Err(RecordError::InvalidKind(other)),
        }
        let mut cursor = &data[1..];
        let count = decode_varint(&mut cursor)?;
        let len = decode_varint(&mut cursor)?;
        Ok((Self { count, len }, data.len() - cursor.len()))
    }
}

fn extract_bytes(cursor: &mut &[u8], len: u64) -> Result<Bytes, RecordError> {
    let len = usize::try_from(len).map_err(|_| RecordError::Incomplete)?;
    if cursor.len() < len {
        return Err(RecordError::Incomplete);
    }

    let bytes = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(bytes)
}

fn verify_crc(data: &[u8], bytes_consumed: usize, cursor: &mut &[u8]) -> Result<(), RecordError> {
    if cursor.len() < 4 {
        return Err(RecordError::Incomplete);
    }

    let stored_crc = cursor.get_u32_le();
    let calculated_crc = crc32c::crc32c(&data[..bytes_consumed - 4]);

    if stored_crc != calculated_crc {
        return Err(RecordError::CrcMismatch {
            expected: stored_crc,
            actual: calculated_crc,
        });
    }

    Ok(())
}

/// Encodes a u64 as a varint (LEB128).
pub(crate) fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128) from bytes.
pub(crate) fn decode_varint(data: &mut &[u8]) -> Result<u64, RecordError> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(RecordError::Incomplete);
        }

        let byte = data[0];
        data.advance(1);

        if shift >= 64 {
            return Err(io::Error::new(ErrorKind::InvalidData, "varint overflow").into());
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        for value in [0u64, 127, 128, 255, 16383, 16384, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, value);
            let mut slice = &buf[..];
            let decoded = decode_varint(&mut slice).unwrap();
            assert_eq!(value, decoded, "varint roundtrip failed for {}", value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_varint_overflow() {
        let data = [0xFFu8; 11];
        let mut slice = &data[..];
        assert!(matches!(
            decode_varint(&mut slice),
            Err(RecordError::Io(_))
        ));
    }

    #[test]
    fn test_entry_roundtrip() {
        let record = Record::entry(42, 7, b"SET k v".as_slice());
        let encoded = record.encode();
        let (decoded, size) = Record::decode(&encoded).unwrap();

        assert_eq!(record, decoded);
        assert_eq!(size, encoded.len());
        assert_eq!(decoded.entry_index(), Some(42));
    }

    #[test]
    fn test_markers_roundtrip() {
        for record in [
            Record::Truncate { from: 9 },
            Record::Compact { upto: 100, term: 3 },
        ] {
            let encoded = record.encode();
            let (decoded, size) = Record::decode(&encoded).unwrap();
            assert_eq!(record, decoded);
            assert_eq!(size, encoded.len());
            assert_eq!(decoded.entry_index(), None);
        }
    }

    #[test]
    fn test_crc_mismatch() {
        let record = Record::entry(1, 1, b"value".as_slice());
        let mut corrupted = record.encode().to_vec();
        corrupted[5] ^= 0xFF;

        assert!(matches!(
            Record::decode(&corrupted),
            Err(RecordError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_incomplete_record() {
        let record = Record::entry(1, 1, b"value".as_slice());
        let encoded = record.encode();

        for cut in 0..encoded.len() {
            assert!(
                matches!(Record::decode(&encoded[..cut]), Err(RecordError::Incomplete)),
                "prefix of {} bytes should be incomplete",
                cut
            );
        }
    }

    #[test]
    fn test_framed_len_ignores_checksum() {
        let record = Record::entry(3, 1, b"value".as_slice());
        let mut encoded = record.encode().to_vec();
        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        assert!(Record::decode(&encoded).is_err());
        assert_eq!(Record::framed_len(&encoded).unwrap(), len);
        assert!(matches!(
            Record::framed_len(&encoded[..len - 1]),
            Err(RecordError::Incomplete)
        ));
    }

    #[test]
    fn test_zero_fill_is_not_a_record() {
        let zeros = [0u8; 32];
        assert!(matches!(
            Record::decode(&zeros),
            Err(RecordError::InvalidKind(0))
        ));
    }

    #[test]
    fn test_consecutive_records_decode_in_order() {
        let mut buf = BytesMut::new();
        Record::entry(1, 1, b"a".as_slice()).encode_into(&mut buf);
        Record::Truncate { from: 1 }.encode_into(&mut buf);
        Record::entry(1, 2, b"b".as_slice()).encode_into(&mut buf);

        let mut offset = 0;
        let mut out = Vec::new();
        while offset < buf.len() {
            let (r, n) = Record::decode(&buf[offset..]).unwrap();
            out.push(r);
            offset += n;
        }

        assert_eq!(out.len(), 3);
        assert_eq!(out[1], Record::Truncate { from: 1 });
        assert_eq!(out[2], Record::entry(1, 2, b"b".as_slice()));
    }

    #[test]
    fn test_batch_header_is_distinct_from_records() {
        let mut buf = BytesMut::new();
        BatchHeader { count: 2, len: 40 }.encode_into(&mut buf);

        assert!(BatchHeader::starts(&buf));
        assert!(matches!(Record::decode(&buf), Err(RecordError::InvalidKind(4))));
        let (header, size) = BatchHeader::decode(&buf).unwrap();
        assert_eq!(header, BatchHeader { count: 2, len: 40 });
        assert_eq!(size, buf.len());
        assert_eq!(BatchHeader::framed_len(&buf).unwrap(), buf.len());

        let entry = Record::entry(1, 1, b"x".as_slice()).encode();
        assert!(!BatchHeader::starts(&entry));
        assert!(matches!(
            BatchHeader::decode(&entry),
            Err(RecordError::InvalidKind(1))
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_entry_roundtrip(
                index in any::<u64>(),
                term in any::<u64>(),
                command in prop::collection::vec(any::<u8>(), 0..1024),
            ) {
                let record = Record::entry(index, term, command);
                let encoded = record.encode();
                let (decoded, size) = Record::decode(&encoded).unwrap();
                prop_assert_eq!(record, decoded);
                prop_assert_eq!(size, encoded.len());
            }

            #[test]
            fn prop_single_bit_flip_is_detected(
                command in prop::collection::vec(any::<u8>(), 1..256),
                bit in any::<prop::sample::Index>(),
            ) {
                let record = Record::entry(5, 2, command);
                let mut encoded = record.encode().to_vec();
                let bit = bit.index(encoded.len() * 8);
                encoded[bit / 8] ^= 1 << (bit % 8);
                prop_assert!(Record::decode(&encoded).map(|(r, _)| r != record).unwrap_or(true));
            }
        }
    }
}
