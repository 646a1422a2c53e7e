//! Chunk identifier parsing/formatting and the static parent/child layer
//! maps (spec.md §3 "Chunk identifier" / "Layer map", §4.B).

use std::{
    fs,
    io::{self, Read},
};

use once_cell::sync::OnceCell;

use crate::{config, error::PipelineError};

/// A parsed chunk identifier: `[l]<idl>_<idr>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub layer: u32,
    pub index: u32,
    pub is_lod: bool,
}

impl ChunkId {
    pub fn new(layer: u32, index: u32, is_lod: bool) -> Self {
        Self {
            layer,
            index,
            is_lod,
        }
    }

    /// Parses a textual chunk id of the form `[l]<idl>_<idr>`, both halves
    /// lowercase hex.
    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        let (rest, is_lod) = match s.strip_prefix('l') {
            Some(rest) => (rest, true),
            None => (s, false),
        };

        let mut parts = rest.splitn(2, '_');
        let idl_hex = parts.next().filter(|p| !p.is_empty());
        let idr_hex = parts.next().filter(|p| !p.is_empty());

        let (idl_hex, idr_hex) = match (idl_hex, idr_hex) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(PipelineError::InvalidId(s.to_owned())),
        };

        let layer = u32::from_str_radix(idl_hex, 16)
            .map_err(|_| PipelineError::InvalidId(s.to_owned()))?;
        let index = u32::from_str_radix(idr_hex, 16)
            .map_err(|_| PipelineError::InvalidId(s.to_owned()))?;

        Ok(Self {
            layer,
            index,
            is_lod,
        })
    }

    /// Formats back to `[l]<idl>_<idr>` in lowercase hex, no padding.
    pub fn to_id_string(self) -> String {
        if self.is_lod {
            format!("l{:x}_{:x}", self.layer, self.index)
        } else {
            format!("{:x}_{:x}", self.layer, self.index)
        }
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_id_string())
    }
}

struct LayerMaps {
    /// L0 -> children (identity), L1 -> children, L2 has no children.
    l0_fwd: Vec<Vec<u32>>,
    /// L1 parent -> L2 children.
    l1_fwd: Vec<Vec<u32>>,
    /// L2 child -> L1 parent.
    l1_bwd: Vec<u32>,
    /// L1 child -> L0 parent.
    l0_bwd_from_l1: Vec<u32>,
}

fn read_pairs(path: &str) -> io::Result<Vec<(u32, u32)>> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut out = Vec::with_capacity(buf.len() / 8);
    let mut chunks = buf.chunks_exact(8);
    for pair in &mut chunks {
        let a = u32::from_le_bytes(pair[0..4].try_into().unwrap());
        let b = u32::from_le_bytes(pair[4..8].try_into().unwrap());
        out.push((a, b));
    }
    Ok(out)
}

/// Builds the four lookup tables from the raw `(parent, child)` pairs of
/// the two map files. Pure and allocation-only, so it's exercised directly
/// by tests without touching the filesystem.
fn build_layer_maps(
    l1_pairs: &[(u32, u32)],
    l2_pairs: &[(u32, u32)],
    l0_size: usize,
    l1_size: usize,
    l2_size: usize,
) -> LayerMaps {
    let mut l1_children_of_l0 = vec![Vec::new(); l0_size];
    let mut l0_bwd_from_l1 = vec![0u32; l1_size];
    for (parent, child) in l1_pairs {
        l1_children_of_l0[*parent as usize].push(*child);
        l0_bwd_from_l1[*child as usize] = *parent;
    }

    // The level-2 file's child id is derived from 1-based sequence
    // position rather than from the record itself.
    let mut l1_fwd = vec![Vec::new(); l1_size];
    let mut l1_bwd = vec![0u32; l2_size];
    for (seq, (parent, _child_unused)) in l2_pairs.iter().enumerate() {
        let child_id = (seq + 1) as u32;
        l1_fwd[*parent as usize].push(child_id);
        l1_bwd[(child_id - 1) as usize] = *parent;
    }

    LayerMaps {
        l0_fwd: l1_children_of_l0,
        l1_fwd,
        l1_bwd,
        l0_bwd_from_l1,
    }
}

static MAPS: OnceCell<LayerMaps> = OnceCell::new();

fn maps() -> &'static LayerMaps {
    MAPS.get_or_init(|| {
        let l1_pairs =
            read_pairs("static/cmap_l1.dat").expect("failed to read static/cmap_l1.dat");
        let l2_pairs =
            read_pairs("static/cmap_l2.dat").expect("failed to read static/cmap_l2.dat");

        build_layer_maps(
            &l1_pairs,
            &l2_pairs,
            config::L0_SIZE as usize,
            config::L1_SIZE as usize,
            config::L2_SIZE as usize,
        )
    })
}

/// Forward map: parent index at `layer` -> list of child indices at
/// `layer + 1`. `layer` must be 0 or 1.
pub fn map_fwd(layer: u32, parent_index: u32) -> &'static [u32] {
    let m = maps();
    match layer {
        0 => &m.l0_fwd[parent_index as usize],
        1 => &m.l1_fwd[parent_index as usize],
        _ => panic!("invalid layer {layer} for map_fwd"),
    }
}

/// Backward map: child index at `layer` -> parent index at `layer - 1`.
/// `layer` must be 1 or 2.
pub fn map_bwd(layer: u32, child_index: u32) -> u32 {
    let m = maps();
    match layer {
        1 => m.l0_bwd_from_l1[child_index as usize],
        2 => m.l1_bwd[child_index as usize],
        _ => panic!("invalid layer {layer} for map_bwd"),
    }
}

/// Maps a plot id (1-based, `1..=L2_SIZE`) to its world position index via
/// the level-2 backward lookup (the record value rather than sequence
/// position).
pub fn plot_id_to_world_pos_idx(plot_id: u32) -> u32 {
    assert!(
        (1..=config::L2_SIZE).contains(&plot_id),
        "plot_id out of range"
    );
    let l2_pairs = read_pairs("static/cmap_l2.dat").expect("failed to read static/cmap_l2.dat");
    l2_pairs[(plot_id - 1) as usize].1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_non_lod_id() {
        let id = ChunkId::parse("0_5").unwrap();
        assert_eq!(id.layer, 0);
        assert_eq!(id.index, 5);
        assert!(!id.is_lod);
    }

    #[test]
    fn parses_lod_id() {
        let id = ChunkId::parse("l1_2a").unwrap();
        assert_eq!(id.layer, 1);
        assert_eq!(id.index, 0x2a);
        assert!(id.is_lod);
    }

    #[test]
    fn round_trips() {
        for s in ["0_5", "l1_2a", "l2_ffff", "a_b"] {
            let id = ChunkId::parse(s).unwrap();
            assert_eq!(id.to_id_string(), s);
        }
    }

    #[test]
    fn rejects_malformed() {
        assert!(ChunkId::parse("").is_err());
        assert!(ChunkId::parse("_5").is_err());
        assert!(ChunkId::parse("5_").is_err());
        assert!(ChunkId::parse("zz_5").is_err());
    }

    #[test]
    fn layer_map_symmetry() {
        // 3 L0 parents, 6 L1 children, 10 L2 children.
        let l1_pairs = [(0, 0), (0, 1), (1, 2), (1, 3), (2, 4), (2, 5)];
        let l2_pairs = [
            (0, 0),
            (0, 0),
            (1, 0),
            (2, 0),
            (2, 0),
            (3, 0),
            (4, 0),
            (4, 0),
            (5, 0),
            (5, 0),
        ];
        let maps = build_layer_maps(&l1_pairs, &l2_pairs, 3, 6, 10);

        for parent in 0..3u32 {
            for &child in &maps.l0_fwd[parent as usize] {
                assert_eq!(maps.l0_bwd_from_l1[child as usize], parent);
            }
        }
        for parent in 0..6u32 {
            for &child in &maps.l1_fwd[parent as usize] {
                assert_eq!(maps.l1_bwd[(child - 1) as usize], parent);
            }
        }
    }
}
