//! Assembling and disassembling a blob across the chunk chain a
//! [`Store`] maintains, including the optional crypto envelope wrap.

use piv_codec::{ChunkHeader, CommonHeader, HeadMeta, ObjectRecord};
use piv_device::{Device, Pin, SlotId};

use crate::observer::observer;
use crate::sanitize::{chain_capacity, walk_chain};
use crate::{Error, Store};

/// Resolve a one-byte key slot field to the device slot id it references,
/// or `None` for the "no key" sentinel `0`.
fn key_slot_device_id(key_slot: u8) -> Option<SlotId> {
    if key_slot == 0 {
        None
    } else {
        Some(SlotId(piv_core::REFERENCE_SLOT_ID_BASE + key_slot as u32))
    }
}

/// Summary of a live blob, as returned by [`Store::list`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobInfo {
    /// The blob's name.
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u32,
    /// Seconds since the UNIX epoch, as of the last `store`.
    pub modified: u64,
    /// Whether the blob is wrapped in the crypto envelope at rest.
    pub encrypted: bool,
    /// Number of chunks (objects) the blob's chain currently occupies.
    pub chunk_count: usize,
}

/// One slot as read directly off the device by [`Store::fsck`], before any
/// interpretation.
#[derive(Clone, Debug)]
pub enum SlotDump {
    /// The slot decoded as a well-formed [`ObjectRecord`] (empty, head, or
    /// body) — this says nothing about whether it belongs to a valid chain.
    Record(ObjectRecord),
    /// The slot's bytes did not decode at all (bad magic, truncation, or an
    /// invalid head). The raw codec error is preserved rather than folded
    /// into an `Empty` record, so the diagnostic shows exactly what is
    /// wrong instead of hiding it.
    Undecodable(piv_codec::Error),
}

/// The full decoded image, read directly from the device with no sanitize
/// pass applied, for diagnostics.
#[derive(Clone, Debug)]
pub struct FsckReport {
    /// One entry per configured slot, in slot-index order.
    pub slots: Vec<SlotDump>,
}

fn find_head(records: &[ObjectRecord], name: &str) -> Option<usize> {
    records.iter().position(|r| matches!(r, ObjectRecord::Head { meta, .. } if meta.blob_name == name))
}

fn chunk_payload_cap(object_size: u16, position: usize, name_len: usize) -> usize {
    let overhead = if position == 0 { piv_codec::h_head(name_len) } else { piv_codec::H_BODY };
    (object_size as usize).saturating_sub(overhead)
}

impl<D: Device> Store<D> {
    /// Store `bytes` under `name`, replacing any existing blob of that
    /// name in place across however many of its chunks the new content
    /// still needs.
    ///
    /// When `encrypt` is true the bytes are wrapped in the crypto
    /// envelope using the store's configured `store_encryption_key_slot`
    /// before being split into chunks; [`Error::NoEncryptionKeyConfigured`]
    /// is returned if the store was formatted without one.
    pub fn store(&mut self, name: &str, bytes: &[u8], encrypt: bool) -> Result<(), Error> {
        let _span = observer().span("store.store");
        if name.is_empty() || name.len() > piv_core::MAX_BLOB_NAME_LEN {
            return Err(Error::InvalidName);
        }

        let unencrypted_size: u32 = bytes.len().try_into().map_err(|_| Error::InvalidName)?;
        let key_slot = self.store_encryption_key_slot();
        let (wire, blob_encryption_key_slot): (Vec<u8>, u8) = if encrypt {
            let slot_id = key_slot_device_id(key_slot).ok_or(Error::NoEncryptionKeyConfigured)?;
            let peer_public = self.device.public_key(slot_id)?;
            (piv_crypto::encrypt(bytes, &peer_public)?, key_slot)
        } else {
            (bytes.to_vec(), 0)
        };
        let blob_size: u32 = wire.len().try_into().map_err(|_| Error::InvalidName)?;

        let object_size = self.object_size();
        let name_len = name.len();
        let chunk_count = {
            let mut k = 1usize;
            while chain_capacity(object_size, k, name_len) < blob_size as u64 {
                k += 1;
            }
            k
        };

        let existing = find_head(&self.records, name).and_then(|h| walk_chain(&self.records, h));
        let existing = existing.unwrap_or_default();
        let reuse_count = chunk_count.min(existing.len());
        let reuse_indices = existing[..reuse_count].to_vec();
        let extra_needed = chunk_count - reuse_count;

        let mut free = Vec::with_capacity(extra_needed);
        for (i, r) in self.records.iter().enumerate() {
            if free.len() == extra_needed {
                break;
            }
            if matches!(r, ObjectRecord::Empty { .. }) && !existing.contains(&i) {
                free.push(i);
            }
        }
        if free.len() < extra_needed {
            return Err(Error::StoreFull);
        }

        let mut new_indices = reuse_indices;
        new_indices.extend(free);
        let freed_old: Vec<usize> = existing[reuse_count..].to_vec();

        let base_age = self.store_age();
        let common_template = *self.records[0].common();
        let mut offset = 0usize;
        let mut head_write = None;
        for position in 0..chunk_count {
            let cap = chunk_payload_cap(object_size, position, name_len);
            let take = cap.min(wire.len() - offset);
            let payload = wire[offset..offset + take].to_vec();
            offset += take;

            let index = new_indices[position];
            let next = if position + 1 == chunk_count { new_indices[position] } else { new_indices[position + 1] };
            let common = CommonHeader {
                object_age: base_age + 1 + position as u32,
                store_age: base_age + chunk_count as u32,
                ..common_template
            };
            let chunk = ChunkHeader { chunk_pos_in_blob: position as u16, next_chunk_index_in_store: next as u8 };

            let record = if position == 0 {
                ObjectRecord::Head {
                    common,
                    chunk,
                    meta: HeadMeta {
                        blob_modification_time: piv_core::now_unix_seconds(),
                        blob_size,
                        blob_encryption_key_slot,
                        blob_unencrypted_size: unencrypted_size,
                        blob_name: name.to_owned(),
                    },
                    payload,
                }
            } else {
                ObjectRecord::Body { common, chunk, payload }
            };

            if position == 0 {
                // Staged but not yet committed: until the head write lands,
                // nothing can discover this chain, so a crash mid-commit
                // never leaves a half-written chain that looks complete.
                head_write = Some((index, record));
            } else {
                self.commit_object(index, record);
            }
        }
        self.sync()?;

        let (head_index, head_record) = head_write.expect("chunk_count >= 1, so position 0 always runs");
        self.commit_object(head_index, head_record);
        self.sync()?;

        for &index in &freed_old {
            let common = CommonHeader { object_age: 0, ..*self.records[index].common() };
            self.commit_object(index, ObjectRecord::Empty { common });
        }
        self.sync()?;

        observer().blob_stored(unencrypted_size as u64);
        Ok(())
    }

    /// Fetch the plaintext bytes of `name`, decrypting through the crypto
    /// envelope (and performing the on-device ECDH with `pin`) if the blob
    /// was stored encrypted.
    pub fn fetch(&mut self, name: &str, pin: &Pin) -> Result<Vec<u8>, Error> {
        let _span = observer().span("store.fetch");
        let head = find_head(&self.records, name).ok_or_else(|| Error::NotFound(name.to_owned()))?;
        let chain = walk_chain(&self.records, head).ok_or_else(|| Error::NotFound(name.to_owned()))?;

        let meta = match &self.records[head] {
            ObjectRecord::Head { meta, .. } => meta.clone(),
            _ => unreachable!("find_head only returns indices of Head records"),
        };

        let mut wire = Vec::with_capacity(meta.blob_size as usize);
        for &index in &chain {
            wire.extend_from_slice(self.records[index].payload());
        }
        wire.truncate(meta.blob_size as usize);

        let plaintext = if let Some(slot_id) = key_slot_device_id(meta.blob_encryption_key_slot) {
            piv_crypto::decrypt(&wire, &self.device, slot_id, pin)?
        } else {
            wire
        };

        observer().blob_fetched(plaintext.len() as u64);
        Ok(plaintext)
    }

    /// Remove `name`, freeing every chunk in its chain.
    pub fn remove(&mut self, name: &str) -> Result<(), Error> {
        let _span = observer().span("store.remove");
        let head = find_head(&self.records, name).ok_or_else(|| Error::NotFound(name.to_owned()))?;
        let chain = walk_chain(&self.records, head).ok_or_else(|| Error::NotFound(name.to_owned()))?;
        for index in chain {
            let common = CommonHeader { object_age: 0, ..*self.records[index].common() };
            self.commit_object(index, ObjectRecord::Empty { common });
        }
        self.sync()
    }

    /// Every live blob name currently in the store.
    pub fn list(&self) -> Vec<BlobInfo> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match r {
                ObjectRecord::Head { meta, .. } => {
                    // A live head always walks to a valid chain: sanitize
                    // runs at `open`/`format` and every mutator preserves
                    // the invariant, so `unwrap_or(1)` never actually fires.
                    let chunk_count = walk_chain(&self.records, i).map(|c| c.len()).unwrap_or(1);
                    Some(BlobInfo {
                        name: meta.blob_name.clone(),
                        size: meta.blob_unencrypted_size,
                        modified: meta.blob_modification_time,
                        encrypted: meta.blob_encryption_key_slot != 0,
                        chunk_count,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Read every configured slot straight off the device and decode it,
    /// with no sanitize pass applied: a raw dump for diagnostics, not a
    /// repair. Unlike [`Store::open`], this never writes anything back and
    /// never touches `self.records` — it reports exactly what is on the
    /// device right now, including whatever an interrupted write or an
    /// external tool may have left behind.
    pub fn fsck(&self) -> Result<FsckReport, Error> {
        let _span = observer().span("store.fsck");
        let mut slots = Vec::with_capacity(self.slot_ids.len());
        for &slot in &self.slot_ids {
            let bytes = crate::model::read_with_retry(&self.device, slot)?;
            slots.push(match piv_codec::decode(bytes.as_slice()) {
                Ok(record) => SlotDump::Record(record),
                Err(e) => SlotDump::Undecodable(e),
            });
        }
        Ok(FsckReport { slots })
    }
}
