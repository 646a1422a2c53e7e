//! Chunk blob codec (spec.md §3 "Chunk blob", §4.A).
//!
//! ```text
//! [2 bytes reserved=0]
//! repeated: [u64 part_id LE][u32 part_len LE][part_len bytes payload]
//! ```

use std::collections::{HashMap, HashSet};

use crate::error::PipelineError;

const HEADER_LEN: usize = 2;
const PART_PREFIX_LEN: usize = 8 + 4;

/// Decodes a chunk blob, keeping every part whose id is **not** in
/// `ignore_ids`. Each kept part is copied into a fresh, exactly-sized
/// buffer.
pub fn decode_chunk(
    blob: &[u8],
    ignore_ids: &HashSet<u64>,
) -> Result<HashMap<u64, Vec<u8>>, PipelineError> {
    if blob.len() < HEADER_LEN {
        return Err(PipelineError::MalformedBlob(
            "chunk blob shorter than header".into(),
        ));
    }

    let mut parts = HashMap::new();
    let mut offset = HEADER_LEN;

    while offset < blob.len() {
        if offset + PART_PREFIX_LEN > blob.len() {
            return Err(PipelineError::MalformedBlob(
                "chunk blob truncated in part prefix".into(),
            ));
        }

        let id = u64::from_le_bytes(blob[offset..offset + 8].try_into().unwrap());
        let len = u32::from_le_bytes(blob[offset + 8..offset + 12].try_into().unwrap()) as usize;
        offset += PART_PREFIX_LEN;

        if offset + len > blob.len() {
            return Err(PipelineError::MalformedBlob(
                "chunk blob part length extends beyond blob".into(),
            ));
        }

        if !ignore_ids.contains(&id) {
            parts.insert(id, blob[offset..offset + len].to_vec());
        }
        offset += len;
    }

    Ok(parts)
}

/// Encodes a chunk blob from `parts`. Part order is iteration order of the
/// map (unspecified, but stable for a given map).
pub fn encode_chunk(parts: &HashMap<u64, Vec<u8>>) -> Vec<u8> {
    let total_len: usize = HEADER_LEN
        + parts
            .values()
            .map(|p| PART_PREFIX_LEN + p.len())
            .sum::<usize>();

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&[0u8, 0u8]);

    for (id, part) in parts {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(part.len() as u32).to_le_bytes());
        out.extend_from_slice(part);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip_empty() {
        let parts = HashMap::new();
        let blob = encode_chunk(&parts);
        let decoded = decode_chunk(&blob, &HashSet::new()).unwrap();
        assert_eq!(decoded, parts);
    }

    #[test]
    fn malformed_length_prefix_errors() {
        let mut blob = vec![0u8, 0u8];
        blob.extend_from_slice(&1u64.to_le_bytes());
        blob.extend_from_slice(&100u32.to_le_bytes());
        blob.extend_from_slice(&[1, 2, 3]); // much shorter than declared len
        assert!(decode_chunk(&blob, &HashSet::new()).is_err());
    }

    fn arb_parts() -> impl Strategy<Value = HashMap<u64, Vec<u8>>> {
        prop::collection::hash_map(
            any::<u64>(),
            prop::collection::vec(any::<u8>(), 0..64),
            0..8,
        )
    }

    proptest! {
        #[test]
        fn round_trip(parts in arb_parts()) {
            let blob = encode_chunk(&parts);
            let decoded = decode_chunk(&blob, &HashSet::new()).unwrap();
            prop_assert_eq!(decoded, parts);
        }

        #[test]
        fn retention_with_ignore(parts in arb_parts(), drop_first in any::<bool>()) {
            let ignore: HashSet<u64> = if drop_first {
                parts.keys().take(1).copied().collect()
            } else {
                HashSet::new()
            };
            let blob = encode_chunk(&parts);
            let decoded = decode_chunk(&blob, &ignore).unwrap();

            let mut expected = parts.clone();
            for id in &ignore {
                expected.remove(id);
            }
            prop_assert_eq!(decoded, expected);
        }
    }
}
