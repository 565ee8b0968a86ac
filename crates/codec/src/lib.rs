//! Serialize and deserialize one object slot's binary record.
//!
//! The record is a tagged variant — [`ObjectRecord::Empty`],
//! [`ObjectRecord::Head`], [`ObjectRecord::Body`] — rather than an
//! inheritance hierarchy, so a match on the decoded record is exhaustive
//! and the compiler catches a missed case. Every variant carries a
//! [`CommonHeader`], duplicated in every object so a standalone dump of
//! any single slot reveals the store-wide parameters.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use piv_core::{MAX_BLOB_NAME_LEN, STORE_MAGIC};

/// Size in bytes of the header present in every object, empty or not:
/// `magic | object_count | object_size | store_encryption_key_slot |
/// store_age | object_age`.
pub const COMMON_HEADER_LEN: usize = 4 + 1 + 2 + 1 + 4 + 4;

/// Size in bytes of the chunk header present whenever `object_age != 0`:
/// `chunk_pos_in_blob | next_chunk_index_in_store`.
pub const CHUNK_HEADER_LEN: usize = 2 + 1;

/// Size in bytes of the fixed-width part of head-only metadata, excluding
/// the variable-length `blob_name`: `blob_mtime | blob_size |
/// blob_enc_key_slot | blob_unenc_size | blob_name_len`.
pub const HEAD_META_FIXED_LEN: usize = 8 + 4 + 1 + 4 + 1;

/// Per-object overhead for a body chunk (common header + chunk header).
pub const H_BODY: usize = COMMON_HEADER_LEN + CHUNK_HEADER_LEN;

/// Per-object overhead for a head chunk carrying `name`.
pub fn h_head(name_len: usize) -> usize {
    H_BODY + HEAD_META_FIXED_LEN + name_len
}

/// Errors produced while decoding or encoding a single object record.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum Error {
    /// Input shorter than the header it claims to carry.
    #[error("object data too short: need at least {needed} bytes, got {got}")]
    ObjectTooShort {
        /// Minimum length required to proceed at the point of failure.
        needed: usize,
        /// Length actually supplied.
        got: usize,
    },
    /// Magic value did not match [`piv_core::STORE_MAGIC`].
    #[error("unrecognized magic value {0:#010x}")]
    BadMagic(u32),
    /// `blob_name_len` was zero.
    #[error("blob name is empty")]
    EmptyBlobName,
    /// `blob_name` bytes were not valid UTF-8.
    #[error("blob name is not valid utf-8")]
    InvalidBlobNameEncoding,
    /// A field's value does not fit the byte width its wire layout reserves.
    #[error("field {field} value {value} exceeds its encoded width")]
    FieldOutOfRange {
        /// Name of the offending field, for diagnostics.
        field: &'static str,
        /// The out-of-range value.
        value: u64,
    },
    /// Chunk payload plus header overhead does not fit in `object_size`.
    #[error("chunk payload does not fit in the configured object size")]
    PayloadTooLarge,
}

/// The store-wide parameters duplicated in every object header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommonHeader {
    /// Must equal [`piv_core::STORE_MAGIC`] for any slot the codec accepts.
    pub magic: u32,
    /// `object_count_in_store`, fixed at format time.
    pub object_count: u8,
    /// `object_size_in_store`, fixed at format time.
    pub object_size: u16,
    /// Device slot holding the store's static EC key, or 0.
    pub store_encryption_key_slot: u8,
    /// Highest age observed across all objects at the time this object was
    /// last written.
    pub store_age: u32,
    /// 0 means empty; otherwise this object's position in the monotonic
    /// age sequence.
    pub object_age: u32,
}

impl CommonHeader {
    /// True if the four store-wide fields agree with `other`'s (ignoring
    /// `object_age`, which is per-object).
    pub fn agrees_on_store_params(&self, other: &CommonHeader) -> bool {
        self.magic == other.magic
            && self.object_count == other.object_count
            && self.object_size == other.object_size
            && self.store_encryption_key_slot == other.store_encryption_key_slot
    }
}

/// Position and linkage fields present whenever `object_age != 0`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkHeader {
    /// Position within the blob; 0 for the head chunk.
    pub chunk_pos_in_blob: u16,
    /// Index of the next chunk in the chain; self-referential at the end.
    pub next_chunk_index_in_store: u8,
}

/// Blob-level metadata carried only by the head chunk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeadMeta {
    /// Seconds since the UNIX epoch.
    pub blob_modification_time: u64,
    /// Total on-wire payload size across all chunks.
    pub blob_size: u32,
    /// Device slot whose private key decrypts the payload, or 0.
    pub blob_encryption_key_slot: u8,
    /// Size to return to the caller after decryption.
    pub blob_unencrypted_size: u32,
    /// 1-255 UTF-8 bytes.
    pub blob_name: String,
}

/// A fully decoded object slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ObjectRecord {
    /// `object_age == 0`: payload is zero-padded, no chunk metadata.
    Empty {
        /// Store-wide parameters.
        common: CommonHeader,
    },
    /// `chunk_pos_in_blob == 0`: carries blob metadata.
    Head {
        /// Store-wide parameters.
        common: CommonHeader,
        /// Position/linkage fields.
        chunk: ChunkHeader,
        /// Blob-level metadata.
        meta: HeadMeta,
        /// This chunk's contribution to the blob payload.
        payload: Vec<u8>,
    },
    /// `chunk_pos_in_blob > 0`: payload only.
    Body {
        /// Store-wide parameters.
        common: CommonHeader,
        /// Position/linkage fields.
        chunk: ChunkHeader,
        /// This chunk's contribution to the blob payload.
        payload: Vec<u8>,
    },
}

impl ObjectRecord {
    /// Store-wide parameters, present on every variant.
    pub fn common(&self) -> &CommonHeader {
        match self {
            ObjectRecord::Empty { common }
            | ObjectRecord::Head { common, .. }
            | ObjectRecord::Body { common, .. } => common,
        }
    }

    /// Chunk position/linkage, if this is not an empty slot.
    pub fn chunk(&self) -> Option<&ChunkHeader> {
        match self {
            ObjectRecord::Empty { .. } => None,
            ObjectRecord::Head { chunk, .. } | ObjectRecord::Body { chunk, .. } => Some(chunk),
        }
    }

    /// True if this is a head chunk (`chunk_pos_in_blob == 0`).
    pub fn is_head(&self) -> bool {
        matches!(self, ObjectRecord::Head { .. })
    }

    /// This chunk's payload bytes, empty for [`ObjectRecord::Empty`].
    pub fn payload(&self) -> &[u8] {
        match self {
            ObjectRecord::Empty { .. } => &[],
            ObjectRecord::Head { payload, .. } | ObjectRecord::Body { payload, .. } => payload,
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), Error> {
        if self.data.len() - self.pos < n {
            Err(Error::ObjectTooShort { needed: self.pos + n, got: self.data.len() })
        } else {
            Ok(())
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.need(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
}

/// Decode one object slot's full `object_size_in_store` bytes.
///
/// A valid magic with `object_age == 0` is an empty slot; any other magic
/// is [`Error::BadMagic`] (the caller decides whether that means
/// `NotFormatted`, on slot 0, or "corrupt, let the sanitizer reset it",
/// elsewhere); truncated input is [`Error::ObjectTooShort`]; an empty or
/// non-UTF-8 `blob_name` marks the object corrupt via the corresponding
/// error.
pub fn decode(data: &[u8]) -> Result<ObjectRecord, Error> {
    let mut r = Reader::new(data);
    let magic = r.u32()?;
    if magic != STORE_MAGIC {
        return Err(Error::BadMagic(magic));
    }
    let object_count = r.u8()?;
    let object_size = r.u16()?;
    let store_encryption_key_slot = r.u8()?;
    let store_age = r.u32()?;
    let object_age = r.u32()?;
    let common = CommonHeader { magic, object_count, object_size, store_encryption_key_slot, store_age, object_age };

    if object_age == 0 {
        return Ok(ObjectRecord::Empty { common });
    }

    let chunk_pos_in_blob = r.u16()?;
    let next_chunk_index_in_store = r.u8()?;
    let chunk = ChunkHeader { chunk_pos_in_blob, next_chunk_index_in_store };

    if chunk_pos_in_blob != 0 {
        let payload = r.data[r.pos..].to_vec();
        return Ok(ObjectRecord::Body { common, chunk, payload });
    }

    let blob_modification_time = r.u64()?;
    let blob_size = r.u32()?;
    let blob_encryption_key_slot = r.u8()?;
    let blob_unencrypted_size = r.u32()?;
    let blob_name_len = r.u8()? as usize;
    if blob_name_len == 0 {
        return Err(Error::EmptyBlobName);
    }
    let name_bytes = r.take(blob_name_len)?;
    let blob_name = std::str::from_utf8(name_bytes)
        .map_err(|_| Error::InvalidBlobNameEncoding)?
        .to_owned();
    let meta = HeadMeta { blob_modification_time, blob_size, blob_encryption_key_slot, blob_unencrypted_size, blob_name };
    let payload = r.data[r.pos..].to_vec();
    Ok(ObjectRecord::Head { common, chunk, meta, payload })
}

fn push_u16(out: &mut Vec<u8>, field: &'static str, value: usize) -> Result<(), Error> {
    let v: u16 = value.try_into().map_err(|_| Error::FieldOutOfRange { field, value: value as u64 })?;
    out.extend_from_slice(&v.to_le_bytes());
    Ok(())
}

fn push_u32(out: &mut Vec<u8>, field: &'static str, value: u64) -> Result<(), Error> {
    let v: u32 = value.try_into().map_err(|_| Error::FieldOutOfRange { field, value })?;
    out.extend_from_slice(&v.to_le_bytes());
    Ok(())
}

/// Encode `record` to exactly `record.common().object_size` bytes,
/// zero-padding the tail.
///
/// Every integer is range-checked against its declared byte width before
/// being written.
pub fn encode(record: &ObjectRecord) -> Result<Vec<u8>, Error> {
    let common = record.common();
    let object_size = common.object_size as usize;
    let mut out = Vec::with_capacity(object_size);

    out.extend_from_slice(&common.magic.to_le_bytes());
    out.push(common.object_count);
    out.extend_from_slice(&common.object_size.to_le_bytes());
    out.push(common.store_encryption_key_slot);
    out.extend_from_slice(&common.store_age.to_le_bytes());
    out.extend_from_slice(&common.object_age.to_le_bytes());

    if let ObjectRecord::Empty { .. } = record {
        if out.len() > object_size {
            return Err(Error::PayloadTooLarge);
        }
        out.resize(object_size, 0);
        return Ok(out);
    }

    let chunk = record.chunk().expect("non-empty record carries a chunk header");
    push_u16(&mut out, "chunk_pos_in_blob", chunk.chunk_pos_in_blob as usize)?;
    out.push(chunk.next_chunk_index_in_store);

    if let ObjectRecord::Head { meta, .. } = record {
        if meta.blob_name.is_empty() {
            return Err(Error::EmptyBlobName);
        }
        if meta.blob_name.len() > MAX_BLOB_NAME_LEN {
            return Err(Error::FieldOutOfRange { field: "blob_name_len", value: meta.blob_name.len() as u64 });
        }
        out.extend_from_slice(&meta.blob_modification_time.to_le_bytes());
        push_u32(&mut out, "blob_size", meta.blob_size as u64)?;
        out.push(meta.blob_encryption_key_slot);
        push_u32(&mut out, "blob_unencrypted_size", meta.blob_unencrypted_size as u64)?;
        out.push(meta.blob_name.len() as u8);
        out.extend_from_slice(meta.blob_name.as_bytes());
    }

    let payload = record.payload();
    if out.len() + payload.len() > object_size {
        return Err(Error::PayloadTooLarge);
    }
    out.extend_from_slice(payload);
    out.resize(object_size, 0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(object_size: u16, object_age: u32) -> CommonHeader {
        CommonHeader {
            magic: STORE_MAGIC,
            object_count: 12,
            object_size,
            store_encryption_key_slot: 0,
            store_age: object_age,
            object_age,
        }
    }

    #[test]
    fn empty_round_trips() {
        let record = ObjectRecord::Empty { common: common(512, 0) };
        let bytes = encode(&record).unwrap();
        assert_eq!(bytes.len(), 512);
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn body_round_trips() {
        let record = ObjectRecord::Body {
            common: common(512, 3),
            chunk: ChunkHeader { chunk_pos_in_blob: 1, next_chunk_index_in_store: 5 },
            payload: vec![0xAB; 10],
        };
        let bytes = encode(&record).unwrap();
        let decoded = decode(&bytes).unwrap();
        match decoded {
            ObjectRecord::Body { payload, .. } => {
                assert_eq!(&payload[..10], &[0xAB; 10][..]);
                assert_eq!(payload.len(), 512 - H_BODY);
            }
            _ => panic!("expected a body chunk"),
        }
    }

    #[test]
    fn head_round_trips_with_name_and_meta() {
        let meta = HeadMeta {
            blob_modification_time: 1_700_000_000,
            blob_size: 14,
            blob_encryption_key_slot: 0,
            blob_unencrypted_size: 14,
            blob_name: "hello".to_owned(),
        };
        let record = ObjectRecord::Head {
            common: common(512, 1),
            chunk: ChunkHeader { chunk_pos_in_blob: 0, next_chunk_index_in_store: 0 },
            meta,
            payload: b"Hello, world!\n".to_vec(),
        };
        let bytes = encode(&record).unwrap();
        let decoded = decode(&bytes).unwrap();
        match decoded {
            ObjectRecord::Head { meta, payload, .. } => {
                assert_eq!(meta.blob_name, "hello");
                assert_eq!(&payload[..14], b"Hello, world!\n");
            }
            _ => panic!("expected a head chunk"),
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode(&ObjectRecord::Empty { common: common(512, 0) }).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(Error::BadMagic(_))));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode(&ObjectRecord::Empty { common: common(512, 0) }).unwrap();
        assert!(matches!(
            decode(&bytes[..COMMON_HEADER_LEN - 1]),
            Err(Error::ObjectTooShort { .. })
        ));
    }

    #[test]
    fn empty_name_is_rejected() {
        let meta = HeadMeta {
            blob_modification_time: 0,
            blob_size: 0,
            blob_encryption_key_slot: 0,
            blob_unencrypted_size: 0,
            blob_name: String::new(),
        };
        let record = ObjectRecord::Head {
            common: common(512, 1),
            chunk: ChunkHeader { chunk_pos_in_blob: 0, next_chunk_index_in_store: 0 },
            meta,
            payload: vec![],
        };
        assert!(matches!(encode(&record), Err(Error::EmptyBlobName)));
    }

    #[test]
    fn payload_capacity_matches_h_body_and_h_head() {
        let object_size = 3052usize;
        assert_eq!(object_size - H_BODY, 3052 - 19);
        assert_eq!(object_size - h_head(5), 3052 - (19 + 18 + 5));
    }

    proptest::proptest! {
        #[test]
        fn body_chunk_round_trips_arbitrary_payload(
            object_age in 1u32..=1000,
            pos in 1u16..=1000,
            next in 0u8..=15,
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..400),
        ) {
            let object_size = (H_BODY + payload.len()).max(512) as u16;
            let record = ObjectRecord::Body {
                common: common(object_size, object_age),
                chunk: ChunkHeader { chunk_pos_in_blob: pos, next_chunk_index_in_store: next },
                payload: payload.clone(),
            };
            let bytes = encode(&record).unwrap();
            let decoded = decode(&bytes).unwrap();
            let got_payload = decoded.payload();
            prop_assert_eq!(&got_payload[..payload.len()], &payload[..]);
        }
    }
}
