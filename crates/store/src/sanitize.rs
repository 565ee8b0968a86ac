//! The three-phase sanitizer that makes a freshly loaded image
//! self-consistent before any blob operation runs against it.
//!
//! Phase A discards chains that are structurally broken. Phase B keeps
//! only the newest of any blob name that still has more than one live
//! head. Phase C resets anything left over that claims to be part of a
//! blob but is not reachable from a surviving head. Running all three
//! again on an already-sanitized image is a no-op — nothing it inspects
//! changes shape as a result of resetting already-resolved objects.

use std::collections::HashMap;

use piv_codec::ObjectRecord;

use crate::observer::observer;

/// Run chain validation, duplicate resolution and orphan collection over
/// `records` in place. `dirty[i]` is set whenever `records[i]` is reset,
/// so the caller knows which slots need to be flushed back to the device.
pub fn sanitize(records: &mut [ObjectRecord], dirty: &mut [bool]) {
    let mut reset_count = 0u64;
    reset_count += chain_validation(records, dirty);
    reset_count += duplicate_resolution(records, dirty);
    reset_count += orphan_collection(records, dirty);
    if reset_count > 0 {
        observer().objects_reset(reset_count);
    }
}

fn reset_at(records: &mut [ObjectRecord], dirty: &mut [bool], index: usize) {
    if matches!(records[index], ObjectRecord::Empty { .. }) {
        return;
    }
    let common = *records[index].common();
    records[index] = ObjectRecord::Empty { common: piv_codec::CommonHeader { object_age: 0, ..common } };
    dirty[index] = true;
}

/// Total encoded payload capacity of a chain of `chunk_count` chunks, the
/// first of which carries `head_name_len` bytes of blob name.
pub(crate) fn chain_capacity(object_size: u16, chunk_count: usize, head_name_len: usize) -> u64 {
    if chunk_count == 0 {
        return 0;
    }
    let object_size = object_size as u64;
    let head_cap = object_size.saturating_sub(piv_codec::h_head(head_name_len) as u64);
    let body_cap = object_size.saturating_sub(piv_codec::H_BODY as u64);
    head_cap + (chunk_count as u64 - 1) * body_cap
}

/// Walk the chain starting at `head`, validating every invariant the chain
/// must hold. Returns the ordered list of visited indices on success, or
/// `None` if the chain must be reset.
pub(crate) fn walk_chain(records: &[ObjectRecord], head: usize) -> Option<Vec<usize>> {
    let head_record = &records[head];
    let (head_chunk, head_meta) = match head_record {
        ObjectRecord::Head { chunk, meta, .. } => (chunk, meta),
        _ => return None,
    };
    let object_count = records.len();
    let object_size = head_record.common().object_size;
    let start_age = head_record.common().object_age;

    let mut visited = vec![head];
    let mut expected_age = start_age;
    let mut expected_pos = 0u16;
    let mut current = head;
    let mut next = head_chunk.next_chunk_index_in_store;

    loop {
        if (next as usize) >= object_count {
            return None;
        }
        if current == next as usize {
            // Terminal: the chain ends here. Verify it actually covers the
            // declared blob size before accepting it.
            let capacity = chain_capacity(object_size, visited.len(), head_meta.blob_name.len());
            if capacity < head_meta.blob_size as u64 {
                return None;
            }
            return Some(visited);
        }

        let next_index = next as usize;
        if visited.contains(&next_index) {
            return None; // cycle that never self-terminates
        }

        let next_record = &records[next_index];
        let next_chunk = next_record.chunk()?;
        if next_record.is_head() || next_chunk.chunk_pos_in_blob == 0 {
            return None; // a non-head mid-chain claiming position 0
        }
        expected_age = expected_age.checked_add(1)?;
        expected_pos = expected_pos.checked_add(1)?;
        if next_record.common().object_age != expected_age {
            return None;
        }
        if next_chunk.chunk_pos_in_blob != expected_pos {
            return None;
        }

        visited.push(next_index);
        current = next_index;
        next = next_chunk.next_chunk_index_in_store;

        if visited.len() > object_count {
            return None; // safety valve; cannot happen given the checks above
        }
    }
}

fn chain_validation(records: &mut [ObjectRecord], dirty: &mut [bool]) -> u64 {
    let heads: Vec<usize> = records.iter().enumerate().filter(|(_, r)| r.is_head()).map(|(i, _)| i).collect();
    let mut reset = 0u64;
    for head in heads {
        if !records[head].is_head() {
            continue; // already reset as part of an earlier, overlapping chain
        }
        match walk_chain(records, head) {
            Some(_) => {}
            None => {
                // Reset every object reachable from `head` by following
                // `next` up to `object_count` steps; a genuinely broken
                // link means some of those objects may not actually belong
                // to this chain, but resetting them is always safe and
                // orphan collection (phase C) would have reset them anyway
                // had they truly belonged to no one.
                let mut seen = vec![head];
                let mut idx = head;
                for _ in 0..records.len() {
                    let next = match records[idx].chunk() {
                        Some(c) => c.next_chunk_index_in_store as usize,
                        None => break,
                    };
                    if next >= records.len() || next == idx || seen.contains(&next) {
                        break;
                    }
                    seen.push(next);
                    idx = next;
                }
                for i in seen {
                    if !matches!(records[i], ObjectRecord::Empty { .. }) {
                        reset_at(records, dirty, i);
                        reset += 1;
                    }
                }
            }
        }
    }
    reset
}

fn duplicate_resolution(records: &mut [ObjectRecord], dirty: &mut [bool]) -> u64 {
    let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, r) in records.iter().enumerate() {
        if let ObjectRecord::Head { meta, .. } = r {
            by_name.entry(meta.blob_name.clone()).or_default().push(i);
        }
    }

    let mut reset = 0u64;
    for (_name, mut indices) in by_name {
        if indices.len() <= 1 {
            continue;
        }
        indices.sort_by_key(|&i| std::cmp::Reverse(records[i].common().object_age));
        for &loser in &indices[1..] {
            if let Some(chain) = walk_chain(records, loser) {
                for i in chain {
                    reset_at(records, dirty, i);
                    reset += 1;
                }
            } else {
                reset_at(records, dirty, loser);
                reset += 1;
            }
        }
    }
    reset
}

fn orphan_collection(records: &mut [ObjectRecord], dirty: &mut [bool]) -> u64 {
    let mut reachable = vec![false; records.len()];
    for (i, r) in records.iter().enumerate() {
        if r.is_head() {
            if let Some(chain) = walk_chain(records, i) {
                for idx in chain {
                    reachable[idx] = true;
                }
            }
        }
    }

    let mut reset = 0u64;
    for i in 0..records.len() {
        let is_live = records[i].common().object_age != 0;
        if is_live && !reachable[i] {
            reset_at(records, dirty, i);
            reset += 1;
        }
    }
    reset
}

#[cfg(test)]
mod tests {
    use super::*;
    use piv_codec::{ChunkHeader, CommonHeader, HeadMeta};

    fn common(object_size: u16, age: u32) -> CommonHeader {
        CommonHeader { magic: piv_core::STORE_MAGIC, object_count: 4, object_size, store_encryption_key_slot: 0, store_age: age, object_age: age }
    }

    fn head(age: u32, next: u8, name: &str, blob_size: u32, payload: Vec<u8>) -> ObjectRecord {
        ObjectRecord::Head {
            common: common(512, age),
            chunk: ChunkHeader { chunk_pos_in_blob: 0, next_chunk_index_in_store: next },
            meta: HeadMeta {
                blob_modification_time: 0,
                blob_size,
                blob_encryption_key_slot: 0,
                blob_unencrypted_size: blob_size,
                blob_name: name.to_owned(),
            },
            payload,
        }
    }

    fn body(age: u32, pos: u16, next: u8, payload: Vec<u8>) -> ObjectRecord {
        ObjectRecord::Body { common: common(512, age), chunk: ChunkHeader { chunk_pos_in_blob: pos, next_chunk_index_in_store: next }, payload }
    }

    fn empty() -> ObjectRecord {
        ObjectRecord::Empty { common: common(512, 0) }
    }

    #[test]
    fn valid_single_chunk_chain_survives() {
        let mut records = vec![head(1, 0, "a", 4, b"abcd".to_vec()), empty(), empty(), empty()];
        let mut dirty = vec![false; 4];
        sanitize(&mut records, &mut dirty);
        assert!(records[0].is_head());
        assert!(!dirty[0]);
    }

    #[test]
    fn broken_link_is_reset() {
        // next points out of range.
        let mut records = vec![head(1, 9, "a", 4, b"abcd".to_vec()), empty(), empty(), empty()];
        let mut dirty = vec![false; 4];
        sanitize(&mut records, &mut dirty);
        assert!(matches!(records[0], ObjectRecord::Empty { .. }));
        assert!(dirty[0]);
    }

    #[test]
    fn non_consecutive_age_is_reset() {
        let mut records = vec![head(1, 1, "a", 4, b"abcd".to_vec()), body(3, 1, 1, b"x".to_vec()), empty(), empty()];
        let mut dirty = vec![false; 4];
        sanitize(&mut records, &mut dirty);
        assert!(matches!(records[0], ObjectRecord::Empty { .. }));
        assert!(matches!(records[1], ObjectRecord::Empty { .. }));
    }

    #[test]
    fn duplicate_heads_keep_the_newer_age() {
        let mut records = vec![head(5, 0, "dup", 1, b"a".to_vec()), head(9, 1, "dup", 1, b"b".to_vec()), empty(), empty()];
        let mut dirty = vec![false; 4];
        sanitize(&mut records, &mut dirty);
        assert!(matches!(records[0], ObjectRecord::Empty { .. }));
        assert!(records[1].is_head());
    }

    #[test]
    fn orphan_body_chunk_is_reset() {
        let mut records = vec![empty(), body(7, 1, 1, b"lonely".to_vec()), empty(), empty()];
        let mut dirty = vec![false; 4];
        sanitize(&mut records, &mut dirty);
        assert!(matches!(records[1], ObjectRecord::Empty { .. }));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let mut records = vec![head(5, 0, "dup", 1, b"a".to_vec()), head(9, 1, "dup", 1, b"b".to_vec()), body(7, 1, 2, b"x".to_vec()), empty()];
        let mut dirty = vec![false; 4];
        sanitize(&mut records, &mut dirty);
        let after_first = records.clone();
        let mut dirty2 = vec![false; 4];
        sanitize(&mut records, &mut dirty2);
        assert_eq!(records, after_first);
        assert!(dirty2.iter().all(|&d| !d));
    }

    #[derive(Clone, Debug)]
    enum SlotSpec {
        Empty,
        Head { age: u32, next: u8, name: &'static str, payload: Vec<u8> },
        Body { age: u32, pos: u16, next: u8, payload: Vec<u8> },
    }

    fn slot_spec() -> impl proptest::strategy::Strategy<Value = SlotSpec> {
        use proptest::prelude::*;
        prop_oneof![
            Just(SlotSpec::Empty),
            (1u32..=8, 0u8..=3, prop::sample::select(vec!["a", "b"]), proptest::collection::vec(any::<u8>(), 0..4))
                .prop_map(|(age, next, name, payload)| SlotSpec::Head { age, next, name, payload }),
            (1u32..=8, 0u16..=3, 0u8..=3, proptest::collection::vec(any::<u8>(), 0..4))
                .prop_map(|(age, pos, next, payload)| SlotSpec::Body { age, pos, next, payload }),
        ]
    }

    fn build(spec: &SlotSpec) -> ObjectRecord {
        match spec {
            SlotSpec::Empty => empty(),
            // blob_size 0 keeps the self-loop capacity check (open question
            // #3) out of the way of this property, which is only about
            // idempotence of resetting, not capacity enforcement.
            SlotSpec::Head { age, next, name, payload } => head(*age, *next, name, 0, payload.clone()),
            SlotSpec::Body { age, pos, next, payload } => body(*age, *pos, *next, payload.clone()),
        }
    }

    proptest::proptest! {
        /// `sanitize` over an arbitrary, possibly-broken 4-slot image is
        /// idempotent (P8): re-running it changes nothing and marks
        /// nothing dirty a second time.
        #[test]
        fn sanitize_is_idempotent_over_arbitrary_images(specs in proptest::collection::vec(slot_spec(), 4..=4)) {
            let mut records: Vec<ObjectRecord> = specs.iter().map(build).collect();
            let mut dirty = vec![false; records.len()];
            sanitize(&mut records, &mut dirty);
            let after_first = records.clone();

            let mut dirty2 = vec![false; records.len()];
            sanitize(&mut records, &mut dirty2);
            proptest::prop_assert_eq!(&records, &after_first);
            proptest::prop_assert!(dirty2.iter().all(|&d| !d));
        }
    }
}
