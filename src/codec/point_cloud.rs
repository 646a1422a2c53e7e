//! Point-cloud blob codec (spec.md §3 "Point-cloud blob", §4.A).
//!
//! ```text
//! [2 bytes reserved=0]
//! [u32 total_entries][u32 total_points]
//! total_entries × [u64 child_id][u32 n_points]  -- header table
//! total_points × [3 × f32 LE]                   -- point coordinates
//! total_points × [u16 LE]                       -- color indices
//! ```

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;

use crate::error::PipelineError;

const HEADER_LEN: usize = 2;
const ENTRY_LEN: usize = 8 + 4;
const POINT_LEN: usize = 3 * 4;
const COLOR_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    pub points: Vec<[f32; 3]>,
    pub colors: Vec<u16>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn read_header(blob: &[u8]) -> Result<(u32, u32, usize), PipelineError> {
    if blob.len() < HEADER_LEN + 8 {
        return Err(PipelineError::MalformedBlob(
            "point cloud blob shorter than header".into(),
        ));
    }
    let total_entries = u32::from_le_bytes(blob[2..6].try_into().unwrap());
    let total_points = u32::from_le_bytes(blob[6..10].try_into().unwrap());
    Ok((total_entries, total_points, HEADER_LEN + 8))
}

/// Parses the header table and emits one [`PointCloud`] per child whose id
/// is **not** in `ignore_ids`.
pub fn decode_point_cloud(
    blob: &[u8],
    ignore_ids: &HashSet<u64>,
) -> Result<HashMap<u64, PointCloud>, PipelineError> {
    let (total_entries, total_points, mut offset) = read_header(blob)?;

    let entries_end = offset + total_entries as usize * ENTRY_LEN;
    let points_start = entries_end;
    let points_end = points_start + total_points as usize * POINT_LEN;
    let colors_start = points_end;
    let colors_end = colors_start + total_points as usize * COLOR_LEN;

    if colors_end > blob.len() {
        return Err(PipelineError::MalformedBlob(
            "point cloud blob truncated".into(),
        ));
    }

    let mut out = HashMap::new();
    let mut point_cursor = points_start;
    let mut color_cursor = colors_start;

    while offset < entries_end {
        let id = u64::from_le_bytes(blob[offset..offset + 8].try_into().unwrap());
        let n = u32::from_le_bytes(blob[offset + 8..offset + 12].try_into().unwrap()) as usize;
        offset += ENTRY_LEN;

        if !ignore_ids.contains(&id) {
            let mut points = Vec::with_capacity(n);
            for i in 0..n {
                let base = point_cursor + i * POINT_LEN;
                let x = f32::from_le_bytes(blob[base..base + 4].try_into().unwrap());
                let y = f32::from_le_bytes(blob[base + 4..base + 8].try_into().unwrap());
                let z = f32::from_le_bytes(blob[base + 8..base + 12].try_into().unwrap());
                points.push([x, y, z]);
            }

            let mut colors = Vec::with_capacity(n);
            for i in 0..n {
                let base = color_cursor + i * COLOR_LEN;
                colors.push(u16::from_le_bytes(blob[base..base + 2].try_into().unwrap()));
            }

            out.insert(id, PointCloud { points, colors });
        }

        point_cursor += n * POINT_LEN;
        color_cursor += n * COLOR_LEN;
    }

    Ok(out)
}

/// Encodes a non-empty map of point clouds. Never call with an empty map:
/// a point-cloud blob with zero entries is never written.
pub fn encode_point_cloud(point_clouds: &HashMap<u64, PointCloud>) -> Vec<u8> {
    debug_assert!(!point_clouds.is_empty());

    let total_entries = point_clouds.len() as u32;
    let total_points: u32 = point_clouds.values().map(|pc| pc.len() as u32).sum();

    let size = HEADER_LEN
        + 8
        + total_entries as usize * ENTRY_LEN
        + total_points as usize * (POINT_LEN + COLOR_LEN);
    let mut out = vec![0u8; size];

    out[2..6].copy_from_slice(&total_entries.to_le_bytes());
    out[6..10].copy_from_slice(&total_points.to_le_bytes());

    let entries_start = HEADER_LEN + 8;
    let points_start = entries_start + total_entries as usize * ENTRY_LEN;
    let colors_start = points_start + total_points as usize * POINT_LEN;

    let mut header_cursor = entries_start;
    let mut point_cursor = points_start;
    let mut color_cursor = colors_start;

    for (id, pc) in point_clouds {
        let n = pc.len() as u32;
        out[header_cursor..header_cursor + 8].copy_from_slice(&id.to_le_bytes());
        out[header_cursor + 8..header_cursor + 12].copy_from_slice(&n.to_le_bytes());
        header_cursor += ENTRY_LEN;

        for p in &pc.points {
            out[point_cursor..point_cursor + 4].copy_from_slice(&p[0].to_le_bytes());
            out[point_cursor + 4..point_cursor + 8].copy_from_slice(&p[1].to_le_bytes());
            out[point_cursor + 8..point_cursor + 12].copy_from_slice(&p[2].to_le_bytes());
            point_cursor += POINT_LEN;
        }
        for c in &pc.colors {
            out[color_cursor..color_cursor + 2].copy_from_slice(&c.to_le_bytes());
            color_cursor += COLOR_LEN;
        }
    }

    out
}

/// Reads the whole blob's point+color arrays as one sequence (ignoring the
/// per-child header boundaries) and returns a uniformly-random subset of
/// size `max(2, floor(total_points * sample_fraction))`, sampled by
/// index-shuffle without replacement.
pub fn decode_single_point_cloud(
    blob: &[u8],
    sample_fraction: f32,
) -> Result<PointCloud, PipelineError> {
    let (total_entries, total_points, header_end) = read_header(blob)?;
    let points_start = header_end + total_entries as usize * ENTRY_LEN;
    let colors_start = points_start + total_points as usize * POINT_LEN;
    let colors_end = colors_start + total_points as usize * COLOR_LEN;

    if colors_end > blob.len() {
        return Err(PipelineError::MalformedBlob(
            "point cloud blob truncated".into(),
        ));
    }

    let k = 2.max(((total_points as f32) * sample_fraction).floor() as usize);
    let mut indices: Vec<usize> = (0..total_points as usize).collect();
    indices.shuffle(&mut rand::thread_rng());
    indices.truncate(k.min(indices.len()));

    let mut points = Vec::with_capacity(indices.len());
    let mut colors = Vec::with_capacity(indices.len());
    for &idx in &indices {
        let base = points_start + idx * POINT_LEN;
        let x = f32::from_le_bytes(blob[base..base + 4].try_into().unwrap());
        let y = f32::from_le_bytes(blob[base + 4..base + 8].try_into().unwrap());
        let z = f32::from_le_bytes(blob[base + 8..base + 12].try_into().unwrap());
        points.push([x, y, z]);

        let cbase = colors_start + idx * COLOR_LEN;
        colors.push(u16::from_le_bytes(blob[cbase..cbase + 2].try_into().unwrap()));
    }

    Ok(PointCloud { points, colors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_clouds() -> HashMap<u64, PointCloud> {
        let mut m = HashMap::new();
        m.insert(
            1,
            PointCloud {
                points: vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
                colors: vec![10, 11],
            },
        );
        m.insert(
            2,
            PointCloud {
                points: vec![[7.0, 8.0, 9.0]],
                colors: vec![12],
            },
        );
        m
    }

    #[test]
    fn round_trip() {
        let clouds = sample_clouds();
        let blob = encode_point_cloud(&clouds);
        let decoded = decode_point_cloud(&blob, &HashSet::new()).unwrap();
        assert_eq!(decoded, clouds);
    }

    #[test]
    fn skips_ignored_ids() {
        let clouds = sample_clouds();
        let blob = encode_point_cloud(&clouds);
        let ignore: HashSet<u64> = [1].into_iter().collect();
        let decoded = decode_point_cloud(&blob, &ignore).unwrap();
        assert!(!decoded.contains_key(&1));
        assert_eq!(decoded.get(&2), clouds.get(&2));
    }

    #[test]
    fn single_cloud_sampling_min_two() {
        let mut m = HashMap::new();
        m.insert(
            1,
            PointCloud {
                points: (0..20).map(|i| [i as f32, 0.0, 0.0]).collect(),
                colors: (0..20).collect(),
            },
        );
        let blob = encode_point_cloud(&m);
        let sampled = decode_single_point_cloud(&blob, 0.0).unwrap();
        assert_eq!(sampled.len(), 2);
    }

    proptest! {
        #[test]
        fn round_trip_prop(
            n1 in 0usize..16,
            n2 in 0usize..16,
        ) {
            let mut clouds = HashMap::new();
            clouds.insert(100u64, PointCloud {
                points: (0..n1).map(|i| [i as f32, i as f32 * 2.0, i as f32 * 3.0]).collect(),
                colors: (0..n1 as u16).collect(),
            });
            clouds.insert(200u64, PointCloud {
                points: (0..n2).map(|i| [i as f32, -(i as f32), 0.0]).collect(),
                colors: (0..n2 as u16).collect(),
            });
            let blob = encode_point_cloud(&clouds);
            let decoded = decode_point_cloud(&blob, &HashSet::new()).unwrap();
            prop_assert_eq!(decoded, clouds);
        }
    }
}
