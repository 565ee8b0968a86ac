//! Shared constants, identifiers and time helpers for the PIV object store
//! workspace.
//!
//! Every other crate in this workspace depends on `piv-core` for the values
//! that must agree across the Device Abstraction, the Object Codec and the
//! Store Model — duplicating a constant in three crates is how those three
//! crates drift apart.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Magic value stamped into every object header, empty or not.
pub const STORE_MAGIC: u32 = 0xF2ED_5F0B;

/// Minimum number of object slots a store may be formatted with.
pub const MIN_OBJECT_COUNT: u8 = 1;
/// Maximum number of object slots a store may be formatted with.
pub const MAX_OBJECT_COUNT: u8 = 16;

/// Minimum size in bytes of a single object slot.
pub const MIN_OBJECT_SIZE: u16 = 512;
/// Maximum size in bytes of a single object slot.
///
/// This reflects a specific device's limit; treat it as a default rather
/// than a hard ceiling when targeting other hardware.
/// `piv-orchestrator::Config` validates against it but does not bake it
/// into the wire format.
pub const DEFAULT_MAX_OBJECT_SIZE: u16 = 3052;

/// Inclusive lower bound of the reference deployment's 16 device-local slot
/// ids (`0x5F0000..=0x5F000F`).
pub const REFERENCE_SLOT_ID_BASE: u32 = 0x005F_0000;

/// Maximum length in bytes of a UTF-8 `blob_name`.
pub const MAX_BLOB_NAME_LEN: usize = 255;

/// A validated index into the fixed-size array of object slots, `0..N`.
///
/// Distinct from the device-local 3-byte slot id used at the Device
/// Abstraction boundary: the store never exposes this type outside the
/// process, and the device never sees it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SlotIndex(u8);

impl SlotIndex {
    /// Wrap a raw index. Callers are expected to have already checked it
    /// against the store's `object_count_in_store`.
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// The raw index, as used for `next_chunk_index_in_store`.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl From<u8> for SlotIndex {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl From<SlotIndex> for u8 {
    fn from(idx: SlotIndex) -> Self {
        idx.0
    }
}

impl std::fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds since the UNIX epoch, used for `blob_modification_time`.
///
/// Kept in its own function (rather than inlined at call sites) so every
/// crate that stamps a modification time agrees on the epoch.
pub fn now_unix_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the UNIX epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_roundtrips() {
        let idx = SlotIndex::new(7);
        assert_eq!(idx.get(), 7);
        assert_eq!(u8::from(idx), 7);
    }

    #[test]
    fn now_unix_seconds_is_monotonic_enough() {
        let a = now_unix_seconds();
        let b = now_unix_seconds();
        assert!(b >= a);
    }
}
