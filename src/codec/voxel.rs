//! Voxel build-data RLE decoding (spec.md §3 "Build data").
//!
//! Build data is a little-endian `u16` stream. Index 0 is reserved, index
//! 1 is `build_size`. From index 2 on it is an RLE of a linearized voxel
//! grid: the low bit of each entry distinguishes a color marker (emits one
//! voxel) from a run (emits `length` voxels of the current color).

use glam::Vec3;

/// Maps a linear voxel index to grid coordinates for a cubic grid of edge
/// length `bs`, per `Utils::idxToVec3`.
pub fn idx_to_vec3(idx: u32, bs: u32) -> Vec3 {
    let bs2 = bs * bs;
    let x = (idx % bs) as f32;
    let y = (idx / bs2) as f32;
    let z = ((idx % bs2) / bs) as f32;
    Vec3::new(x, y, z)
}

/// Lazily expands the RLE voxel stream (the portion of build data from
/// index 2 onward) into `(linear_position, color_index)` pairs. Only
/// positions that resolve to a color are yielded; a run encountered before
/// any color marker advances position without emitting (defends against
/// malformed leading runs, matching the original implementation's
/// optional-color guard).
pub struct VoxelIter<'a> {
    stream: std::slice::Iter<'a, u16>,
    cur_color: Option<u16>,
    run_remaining: u32,
    pos_idx: u32,
}

impl<'a> VoxelIter<'a> {
    pub fn new(rle_stream: &'a [u16]) -> Self {
        Self {
            stream: rle_stream.iter(),
            cur_color: None,
            run_remaining: 0,
            pos_idx: 0,
        }
    }
}

impl Iterator for VoxelIter<'_> {
    type Item = (u32, u16);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.run_remaining > 0 {
                self.run_remaining -= 1;
                let idx = self.pos_idx;
                self.pos_idx += 1;
                if let Some(color) = self.cur_color {
                    return Some((idx, color));
                }
                continue;
            }

            let &token = self.stream.next()?;
            if token & 1 == 1 {
                let color = token >> 1;
                self.cur_color = Some(color);
                let idx = self.pos_idx;
                self.pos_idx += 1;
                return Some((idx, color));
            }

            let len = u32::from(token >> 1);
            if len > 0 {
                self.run_remaining = len;
            }
        }
    }
}

/// Convenience: the build's edge length, stored at stream index 1.
pub fn build_size(build: &[u16]) -> u16 {
    build[1]
}

/// The RLE portion of the stream, from index 2 onward.
pub fn rle_stream(build: &[u16]) -> &[u16] {
    &build[2..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idx_to_vec3_matches_linearization() {
        let bs = 4;
        // idx 0 -> (0,0,0); idx 1 -> (1,0,0); idx bs -> (0,0,1); idx bs*bs -> (0,1,0)
        assert_eq!(idx_to_vec3(0, bs), Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(idx_to_vec3(1, bs), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(idx_to_vec3(bs, bs), Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(idx_to_vec3(bs * bs, bs), Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn decodes_color_marker_then_run() {
        // color 5 at idx 0, then a run of 3 more of color 5.
        let color_token = (5u16 << 1) | 1;
        let run_token = 3u16 << 1;
        let stream = [color_token, run_token];
        let voxels: Vec<_> = VoxelIter::new(&stream).collect();
        assert_eq!(voxels, vec![(0, 5), (1, 5), (2, 5), (3, 5)]);
    }

    #[test]
    fn leading_run_without_color_advances_without_emitting() {
        let run_token = 2u16 << 1;
        let color_token = (9u16 << 1) | 1;
        let stream = [run_token, color_token];
        let voxels: Vec<_> = VoxelIter::new(&stream).collect();
        assert_eq!(voxels, vec![(2, 9)]);
    }

    #[test]
    fn zero_length_run_is_noop() {
        let zero_run = 0u16 << 1;
        let color_token = (1u16 << 1) | 1;
        let stream = [zero_run, color_token];
        let voxels: Vec<_> = VoxelIter::new(&stream).collect();
        assert_eq!(voxels, vec![(0, 1)]);
    }
}
