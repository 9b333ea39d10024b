//! Fixed-layout encode/decode of journal records.
//!
//! Every record begins with a common header: type tag, total length
//! including the header, a timestamp, and a CRC32C of the body (mirroring
//! `commitlog::commit`'s `Crc32cWriter`/`Crc32cReader` framing). Integer
//! fields are little-endian throughout; the choice is internal but must
//! stay stable across segments written by the same build.
//!
//! Segments are written into windows that are mapped (and hence file-backed)
//! ahead of what has actually been appended, so the bytes following the
//! logical tail are zero rather than simply absent. Tag `0` is therefore
//! reserved to mean "nothing written here yet" and is not an error; any
//! other unrecognized tag, or a checksum mismatch, means real corruption.

use crc32c::crc32c;

use crate::error::{CorruptReason, JournalError};

/// Size in bytes of the common record header.
pub const HEADER_LEN: usize = 1 /* type */ + 4 /* length */ + 8 /* timestamp */ + 4 /* crc32c */;

/// Fixed body size of a [`Record::PageImage`] before the variable payload.
const PA_FIXED_LEN: usize = 4 /* volume_handle */ + 4 /* buffer_size */ + 4 /* left_size */ + 8 /* page_address */;
const CP_LEN: usize = 8;

/// Timestamp sentinel marking a page image as transient: recovery must
/// discard it rather than install it in the page index.
pub const TRANSIENT_TIMESTAMP: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    IdentifyVolume = 1,
    IdentifyTree = 2,
    PageImage = 3,
    Checkpoint = 4,
    // Reserved, accepted by the codec but not otherwise implemented.
    TransactionStart = 5,
    TransactionCommit = 6,
    TransactionJournal = 7,
    ReadRecord = 8,
    WriteRecord = 9,
}

impl RecordType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::IdentifyVolume,
            2 => Self::IdentifyTree,
            3 => Self::PageImage,
            4 => Self::Checkpoint,
            5 => Self::TransactionStart,
            6 => Self::TransactionCommit,
            7 => Self::TransactionJournal,
            8 => Self::ReadRecord,
            9 => Self::WriteRecord,
            _ => return None,
        })
    }

    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::TransactionStart | Self::TransactionCommit | Self::TransactionJournal | Self::ReadRecord | Self::WriteRecord
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub record_type: RecordType,
    /// Total record length, including [`HEADER_LEN`].
    pub length: u32,
    pub timestamp: i64,
    pub checksum: u32,
}

/// Result of inspecting the byte(s) at a scan position, before committing to
/// a full header parse.
pub enum HeaderScan {
    /// A record header was found (not yet checksum-validated against its
    /// body; call [`decode_body`] for that).
    Record(RecordHeader),
    /// The tag byte was `0`: this is unwritten, zero-filled window space,
    /// i.e. the true end of this segment's data. Not an error.
    EndOfData,
    /// A nonzero tag that isn't a recognized [`RecordType`], or not enough
    /// bytes remained to hold a full header. Genuine corruption.
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    IdentifyVolume {
        handle: u32,
        volume_id: u64,
        path: String,
    },
    IdentifyTree {
        handle: u32,
        volume_handle: u32,
        tree_name: String,
    },
    PageImage {
        volume_handle: u32,
        buffer_size: u32,
        left_size: u32,
        page_address: u64,
        /// `buffer[0..left_size] ++ buffer[buffer_size-right_size..]`; the
        /// zeroed middle gap is not stored.
        payload: Vec<u8>,
    },
    Checkpoint {
        millis: i64,
    },
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn get_i64(buf: &[u8], at: usize) -> i64 {
    i64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn encode_body(record: &Record) -> (RecordType, Vec<u8>) {
    match record {
        Record::IdentifyVolume { handle, volume_id, path } => {
            let mut body = Vec::with_capacity(4 + 8 + 2 + path.len());
            put_u32(&mut body, *handle);
            put_u64(&mut body, *volume_id);
            put_str(&mut body, path);
            (RecordType::IdentifyVolume, body)
        }
        Record::IdentifyTree {
            handle,
            volume_handle,
            tree_name,
        } => {
            let mut body = Vec::with_capacity(4 + 4 + 2 + tree_name.len());
            put_u32(&mut body, *handle);
            put_u32(&mut body, *volume_handle);
            put_str(&mut body, tree_name);
            (RecordType::IdentifyTree, body)
        }
        Record::PageImage {
            volume_handle,
            buffer_size,
            left_size,
            page_address,
            payload,
        } => {
            let mut body = Vec::with_capacity(PA_FIXED_LEN + payload.len());
            put_u32(&mut body, *volume_handle);
            put_u32(&mut body, *buffer_size);
            put_u32(&mut body, *left_size);
            put_u64(&mut body, *page_address);
            body.extend_from_slice(payload);
            (RecordType::PageImage, body)
        }
        Record::Checkpoint { millis } => {
            let mut body = Vec::with_capacity(CP_LEN);
            put_i64(&mut body, *millis);
            (RecordType::Checkpoint, body)
        }
    }
}

/// Encode a complete record (header + body) for appending to a segment.
pub fn encode(record: &Record, timestamp: i64) -> Vec<u8> {
    let (record_type, body) = encode_body(record);
    let total_len = (HEADER_LEN + body.len()) as u32;
    let checksum = crc32c(&body);

    let mut buf = Vec::with_capacity(total_len as usize);
    buf.push(record_type as u8);
    put_u32(&mut buf, total_len);
    put_i64(&mut buf, timestamp);
    put_u32(&mut buf, checksum);
    buf.extend_from_slice(&body);
    buf
}

/// Inspects the bytes at the start of a scan position. Does not require the
/// full header to be present unless the tag byte is nonzero and recognized.
pub fn scan_header(buf: &[u8]) -> HeaderScan {
    let Some(&tag) = buf.first() else {
        return HeaderScan::EndOfData;
    };
    if tag == 0 {
        return HeaderScan::EndOfData;
    }
    let Some(record_type) = RecordType::from_tag(tag) else {
        return HeaderScan::Unrecognized;
    };
    if buf.len() < HEADER_LEN {
        return HeaderScan::Unrecognized;
    }
    let length = get_u32(buf, 1);
    let timestamp = get_i64(buf, 5);
    let checksum = get_u32(buf, 13);
    HeaderScan::Record(RecordHeader {
        record_type,
        length,
        timestamp,
        checksum,
    })
}

/// Decode a full record body given its header and the bytes starting at the
/// header (i.e. `buf[0..header.length]` must be available). Validates the
/// checksum before parsing any fields.
///
/// `segment`/`offset` are used only to annotate corruption errors.
pub fn decode_body(header: &RecordHeader, buf: &[u8], segment: u64, offset: u64, max_record_len: u32) -> crate::error::Result<Record> {
    if header.length > max_record_len {
        return Err(JournalError::Corrupt(CorruptReason::RecordTooLarge {
            segment,
            offset,
            declared: header.length,
            max: max_record_len,
        }));
    }
    if (header.length as usize) < HEADER_LEN {
        return Err(JournalError::Corrupt(CorruptReason::HeaderLengthTooSmall {
            segment,
            offset,
            length: header.length,
        }));
    }
    let body = &buf[HEADER_LEN..header.length as usize];
    if crc32c(body) != header.checksum {
        return Err(JournalError::Corrupt(CorruptReason::ChecksumMismatch { segment, offset }));
    }
    match header.record_type {
        RecordType::IdentifyVolume => {
            let handle = get_u32(body, 0);
            let volume_id = get_u64(body, 4);
            let path_len = u16::from_le_bytes(body[12..14].try_into().unwrap()) as usize;
            let path = String::from_utf8_lossy(&body[14..14 + path_len]).into_owned();
            Ok(Record::IdentifyVolume { handle, volume_id, path })
        }
        RecordType::IdentifyTree => {
            let handle = get_u32(body, 0);
            let volume_handle = get_u32(body, 4);
            let name_len = u16::from_le_bytes(body[8..10].try_into().unwrap()) as usize;
            let tree_name = String::from_utf8_lossy(&body[10..10 + name_len]).into_owned();
            Ok(Record::IdentifyTree {
                handle,
                volume_handle,
                tree_name,
            })
        }
        RecordType::PageImage => {
            let volume_handle = get_u32(body, 0);
            let buffer_size = get_u32(body, 4);
            let left_size = get_u32(body, 8);
            let page_address = get_u64(body, 12);
            let payload = body[PA_FIXED_LEN..].to_vec();
            if left_size > buffer_size || (left_size as usize) > payload.len() {
                return Err(JournalError::Corrupt(CorruptReason::LeftSizeOutOfRange {
                    segment,
                    offset,
                    left_size,
                    buffer_size,
                }));
            }
            Ok(Record::PageImage {
                volume_handle,
                buffer_size,
                left_size,
                page_address,
                payload,
            })
        }
        RecordType::Checkpoint => {
            if header.length as usize != HEADER_LEN + CP_LEN {
                return Err(JournalError::Corrupt(CorruptReason::CheckpointLength {
                    segment,
                    offset,
                    len: header.length,
                }));
            }
            let millis = get_i64(body, 0);
            Ok(Record::Checkpoint { millis })
        }
        t if t.is_reserved() => Err(JournalError::Corrupt(CorruptReason::UnknownRecordType {
            segment,
            offset,
            tag: body.first().copied().unwrap_or(0),
        })),
        _ => unreachable!(),
    }
}

/// Reconstruct the full page buffer from a [`Record::PageImage`]'s packed
/// payload, zero-filling the gap that was omitted on write.
pub fn reconstruct_buffer(buffer_size: u32, left_size: u32, payload: &[u8]) -> Vec<u8> {
    let buffer_size = buffer_size as usize;
    let left_size = left_size as usize;
    let right_size = payload.len() - left_size;
    let mut buf = vec![0u8; buffer_size];
    buf[..left_size].copy_from_slice(&payload[..left_size]);
    buf[buffer_size - right_size..].copy_from_slice(&payload[left_size..]);
    buf
}

/// Pack a live page buffer for storage, dropping the longest contiguous
/// all-zero middle run (database pages typically keep free space there,
/// between a forward-growing slot directory and a backward-growing heap).
///
/// Returns `(left_size, payload)`. When the buffer has no exploitable zero
/// run, `left_size == 0` and the payload is the buffer verbatim.
pub fn compact_buffer(buffer: &[u8]) -> (u32, Vec<u8>) {
    let (mut best_start, mut best_end) = (0usize, 0usize);
    let (mut run_start, mut in_run) = (0usize, false);
    for (i, &b) in buffer.iter().enumerate() {
        if b == 0 {
            if !in_run {
                run_start = i;
                in_run = true;
            }
        } else if in_run {
            in_run = false;
            if i - run_start > best_end - best_start {
                best_start = run_start;
                best_end = i;
            }
        }
    }
    if in_run && buffer.len() - run_start > best_end - best_start {
        best_start = run_start;
        best_end = buffer.len();
    }

    if best_end == best_start {
        return (0, buffer.to_vec());
    }

    let mut payload = Vec::with_capacity(buffer.len() - (best_end - best_start));
    payload.extend_from_slice(&buffer[..best_start]);
    payload.extend_from_slice(&buffer[best_end..]);
    (best_start as u32, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_record(bytes: &[u8]) -> Record {
        let HeaderScan::Record(header) = scan_header(bytes) else {
            panic!("expected a record header")
        };
        decode_body(&header, bytes, 0, 0, u32::MAX).unwrap()
    }

    #[test]
    fn page_image_round_trip() {
        let rec = Record::PageImage {
            volume_handle: 7,
            buffer_size: 4096,
            left_size: 10,
            page_address: 42,
            payload: vec![1; 10 + 20],
        };
        let bytes = encode(&rec, 99);
        assert_eq!(decode_record(&bytes), rec);
    }

    #[test]
    fn checkpoint_round_trip() {
        let rec = Record::Checkpoint { millis: 1234 };
        let bytes = encode(&rec, 5);
        assert_eq!(decode_record(&bytes), rec);
    }

    #[test]
    fn zero_byte_tag_is_end_of_data_not_an_error() {
        let buf = vec![0u8; 64];
        assert!(matches!(scan_header(&buf), HeaderScan::EndOfData));
    }

    #[test]
    fn unrecognized_nonzero_tag_is_corruption() {
        let buf = vec![200u8; 64];
        assert!(matches!(scan_header(&buf), HeaderScan::Unrecognized));
    }

    #[test]
    fn bitflip_in_body_is_detected_via_checksum() {
        let rec = Record::Checkpoint { millis: 1234 };
        let mut bytes = encode(&rec, 5);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let HeaderScan::Record(header) = scan_header(&bytes) else {
            panic!("expected a record header")
        };
        let err = decode_body(&header, &bytes, 0, 0, u32::MAX).unwrap_err();
        assert!(matches!(
            err,
            JournalError::Corrupt(CorruptReason::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn declared_length_below_header_len_is_rejected_not_panicking() {
        let rec = Record::Checkpoint { millis: 1234 };
        let mut bytes = encode(&rec, 5);
        // Corrupt the length field alone to something smaller than the
        // header itself; decode_body must not attempt to slice with it.
        bytes[1..5].copy_from_slice(&3u32.to_le_bytes());
        let HeaderScan::Record(header) = scan_header(&bytes) else {
            panic!("expected a record header")
        };
        let err = decode_body(&header, &bytes, 0, 0, u32::MAX).unwrap_err();
        assert!(matches!(
            err,
            JournalError::Corrupt(CorruptReason::HeaderLengthTooSmall { length: 3, .. })
        ));
    }

    #[test]
    fn compact_then_reconstruct_is_identity() {
        let mut buffer = vec![0xAAu8; 100];
        for b in buffer.iter_mut().take(40).skip(20) {
            *b = 0;
        }
        let (left_size, payload) = compact_buffer(&buffer);
        assert_eq!(left_size, 20);
        assert_eq!(payload.len(), 80);
        let rebuilt = reconstruct_buffer(100, left_size, &payload);
        assert_eq!(rebuilt, buffer);
    }

    #[test]
    fn compact_verbatim_when_no_zero_run() {
        let buffer = vec![1u8; 16];
        let (left_size, payload) = compact_buffer(&buffer);
        assert_eq!(left_size, 0);
        assert_eq!(payload, buffer);
    }

    proptest::proptest! {
        #[test]
        fn page_image_round_trips_for_arbitrary_left_right_split(
            left_size in 0u32..64,
            right_size in 0u32..64,
            page_address in any::<u64>(),
            volume_handle in any::<u32>(),
            timestamp in any::<i64>(),
        ) {
            let buffer_size = left_size + right_size + 17; // always leave a real gap
            let mut payload = vec![0u8; (left_size + right_size) as usize];
            for (i, b) in payload.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            let rec = Record::PageImage {
                volume_handle,
                buffer_size,
                left_size,
                page_address,
                payload,
            };
            let bytes = encode(&rec, timestamp);
            let HeaderScan::Record(header) = scan_header(&bytes) else {
                panic!("expected a record header");
            };
            prop_assert_eq!(header.timestamp, timestamp);
            let decoded = decode_body(&header, &bytes, 0, 0, u32::MAX).unwrap();
            prop_assert_eq!(decoded, rec);
        }

        #[test]
        fn compact_buffer_round_trips_for_arbitrary_byte_strings(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let (left_size, payload) = compact_buffer(&bytes);
            let rebuilt = reconstruct_buffer(bytes.len() as u32, left_size, &payload);
            prop_assert_eq!(rebuilt, bytes);
        }

        #[test]
        fn bitflip_anywhere_in_body_is_either_rejected_or_harmless(
            millis in any::<i64>(),
            timestamp in any::<i64>(),
            flip_bit in 0usize..64,
        ) {
            let rec = Record::Checkpoint { millis };
            let mut bytes = encode(&rec, timestamp);
            let byte = HEADER_LEN + flip_bit / 8;
            bytes[byte] ^= 1 << (flip_bit % 8);

            let HeaderScan::Record(header) = scan_header(&bytes) else {
                panic!("expected a record header");
            };
            match decode_body(&header, &bytes, 0, 0, u32::MAX) {
                Ok(Record::Checkpoint { millis: decoded_millis }) => prop_assert_eq!(decoded_millis, millis),
                Ok(_) => prop_assert!(false, "checkpoint decoded as a different record kind"),
                Err(JournalError::Corrupt(CorruptReason::ChecksumMismatch { .. })) => {}
                Err(e) => prop_assert!(false, "unexpected error: {e}"),
            }
        }
    }
}
