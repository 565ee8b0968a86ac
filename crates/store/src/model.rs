//! The in-memory image of a store: one [`piv_codec::ObjectRecord`] per
//! device slot, loaded once at open time and flushed back lazily.

use piv_codec::{CommonHeader, ObjectRecord};
use piv_device::{AdminCredential, Device, SlotId};

use crate::observer::observer;
use crate::Error;

/// The store core: a fixed-size array of decoded object records sitting on
/// top of a [`Device`], plus the bookkeeping needed to flush only the
/// slots that actually changed.
pub struct Store<D: Device> {
    pub(crate) device: D,
    pub(crate) slot_ids: Vec<SlotId>,
    pub(crate) admin: AdminCredential,
    pub(crate) records: Vec<ObjectRecord>,
    pub(crate) dirty: Vec<bool>,
    pub(crate) store_age: u32,
}

impl<D: Device> Store<D> {
    /// Read every configured slot, recover the store-wide parameters from
    /// slot 0, and run the sanitizer before returning.
    ///
    /// `object_age == 0` at a slot 0 that does not decode at all is
    /// reported as [`Error::NotFormatted`] — the caller is expected to
    /// [`Store::format`] before opening.
    pub fn open(device: D, slot_ids: Vec<SlotId>, admin: AdminCredential) -> Result<Self, Error> {
        let _span = observer().span("store.open");
        if slot_ids.is_empty() {
            return Err(Error::NotFormatted);
        }

        let bytes0 = read_with_retry(&device, slot_ids[0])?;
        let common0 = decode_common(bytes0.as_slice()).ok_or(Error::NotFormatted)?;

        if common0.object_count as usize != slot_ids.len() {
            return Err(Error::SlotCountMismatch {
                configured: slot_ids.len(),
                declared: common0.object_count,
            });
        }

        let mut records = Vec::with_capacity(slot_ids.len());
        let mut max_age = 0u32;
        for &slot in &slot_ids {
            let bytes = read_with_retry(&device, slot)?;
            let record = match piv_codec::decode(bytes.as_slice()) {
                Ok(record) if record.common().agrees_on_store_params(&common0) => record,
                _ => ObjectRecord::Empty { common: reset_common(&common0) },
            };
            max_age = max_age.max(record.common().object_age);
            records.push(record);
        }

        let mut dirty = vec![false; records.len()];
        crate::sanitize::sanitize(&mut records, &mut dirty);

        let mut store = Self { device, slot_ids, admin, records, dirty, store_age: max_age };
        store.sync()?;
        Ok(store)
    }

    /// Format every configured slot to empty, stamping the given store-wide
    /// parameters, and return an opened store.
    pub fn format(
        device: D,
        slot_ids: Vec<SlotId>,
        admin: AdminCredential,
        object_size: u16,
        max_object_size: u16,
        store_encryption_key_slot: u8,
    ) -> Result<Self, Error> {
        let _span = observer().span("store.format");
        let object_count: u8 = slot_ids.len().try_into().map_err(|_| Error::InvalidObjectCount {
            min: piv_core::MIN_OBJECT_COUNT,
            max: piv_core::MAX_OBJECT_COUNT,
            value: u8::MAX,
        })?;
        if object_count < piv_core::MIN_OBJECT_COUNT || object_count > piv_core::MAX_OBJECT_COUNT {
            return Err(Error::InvalidObjectCount {
                min: piv_core::MIN_OBJECT_COUNT,
                max: piv_core::MAX_OBJECT_COUNT,
                value: object_count,
            });
        }
        if object_size < piv_core::MIN_OBJECT_SIZE || object_size > max_object_size {
            return Err(Error::InvalidObjectSize {
                min: piv_core::MIN_OBJECT_SIZE,
                max: max_object_size,
                value: object_size,
            });
        }

        let common = CommonHeader {
            magic: piv_core::STORE_MAGIC,
            object_count,
            object_size,
            store_encryption_key_slot,
            store_age: 0,
            object_age: 0,
        };
        let records = vec![ObjectRecord::Empty { common }; slot_ids.len()];
        let dirty = vec![true; slot_ids.len()];

        let mut store = Self { device, slot_ids, admin, records, dirty, store_age: 0 };
        store.sync()?;
        Ok(store)
    }

    /// `object_count_in_store`, fixed at format time.
    pub fn object_count(&self) -> u8 {
        self.records.len() as u8
    }

    /// `object_size_in_store`, fixed at format time.
    pub fn object_size(&self) -> u16 {
        self.records[0].common().object_size
    }

    /// Device slot holding the store's static EC key, or 0.
    pub fn store_encryption_key_slot(&self) -> u8 {
        self.records[0].common().store_encryption_key_slot
    }

    /// Highest age assigned to any object so far.
    pub fn store_age(&self) -> u32 {
        self.store_age
    }

    /// Decoded records, indexed exactly as the device slot list.
    pub fn records(&self) -> &[ObjectRecord] {
        &self.records
    }

    /// The first index still holding an empty record, if any.
    pub fn allocate_free_index(&self) -> Option<usize> {
        self.records.iter().position(|r| matches!(r, ObjectRecord::Empty { .. }))
    }

    /// Stage `record` at `index` for the next [`Store::sync`].
    pub fn commit_object(&mut self, index: usize, record: ObjectRecord) {
        self.store_age = self.store_age.max(record.common().object_age);
        self.records[index] = record;
        self.dirty[index] = true;
    }

    /// The uncompressed P-256 public key held in `slot`, read directly from
    /// the device. Independent of any blob chain; callers use this to
    /// obtain the peer public key an encrypted `store` wraps a payload
    /// against.
    pub fn public_key(&self, slot: SlotId) -> Result<[u8; 65], Error> {
        Ok(self.device.public_key(slot)?)
    }

    /// Write every dirty slot to the device and clear the dirty flags.
    ///
    /// Slots are written in ascending index order. Callers that need a
    /// specific write order for crash-consistency reasons (body chunks
    /// before the head chunk that makes them reachable) arrange that by
    /// staging [`Store::commit_object`] calls and invoking `sync` once per
    /// ordering step rather than relying on index order alone.
    pub fn sync(&mut self) -> Result<(), Error> {
        for i in 0..self.records.len() {
            if !self.dirty[i] {
                continue;
            }
            let bytes = piv_codec::encode(&self.records[i])?;
            self.device.write_object(self.slot_ids[i], &bytes, &self.admin)?;
            self.dirty[i] = false;
        }
        Ok(())
    }
}

/// Read `slot`, retrying exactly once if the first attempt reports a
/// transient device I/O error.
///
/// `Store::open` is the one place this crate reads a device it does not yet
/// own a `Store` wrapper for — a failed read here cannot be retried by a
/// caller higher up, since the device was moved in by value. The retry has
/// to live at the point of the read itself.
pub(crate) fn read_with_retry<D: Device>(device: &D, slot: SlotId) -> Result<piv_device::ObjectBytes, piv_device::Error> {
    match device.read_object(slot) {
        Err(piv_device::Error::IoTransient(msg)) => {
            tracing::warn!(%slot, error = %msg, "retrying once after a transient device io error");
            device.read_object(slot)
        }
        other => other,
    }
}

fn decode_common(bytes: &[u8]) -> Option<CommonHeader> {
    piv_codec::decode(bytes).ok().map(|r| *r.common())
}

fn reset_common(common: &CommonHeader) -> CommonHeader {
    CommonHeader { object_age: 0, ..*common }
}
