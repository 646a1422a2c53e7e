//! `BaseChunk`: the layer-2 LOD boundary, composing `DChunk`'s prep/
//! process with its own point-cloud-projecting `update` (spec.md §4.F
//! "BaseChunk", §9 "diamond base chunk variant").

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use glam::Vec3;
use rand::seq::SliceRandom;

use crate::codec::{self, PointCloud};
use crate::config::{Settings, MAIN_BUILD_SIZE, PLOT_COUNT};
use crate::error::PipelineError;
use crate::id::{self, ChunkId};
use crate::store::ObjectStore;

use super::{ChunkProcessor, DChunk, UpdateFlags};

pub struct BaseChunk {
    pub detail: DChunk,
    point_clouds: HashMap<u64, PointCloud>,
}

impl BaseChunk {
    pub fn new(id: ChunkId) -> Self {
        Self {
            detail: DChunk::new(id),
            point_clouds: HashMap::new(),
        }
    }

    fn sample_count(voxel_count: usize) -> usize {
        2.max((voxel_count as f32).sqrt().floor() as usize)
    }
}

impl ChunkProcessor for BaseChunk {
    async fn prep(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
        needs_update: &HashSet<u64>,
        flags: &HashMap<u64, UpdateFlags>,
    ) -> Result<(), PipelineError> {
        self.detail.prep(store, settings, needs_update, flags).await
    }

    fn process(&mut self) {
        self.detail.process();
    }

    async fn update(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
    ) -> Result<Option<String>, PipelineError> {
        self.detail.update(store, settings).await?;

        let chunk_id = self.detail.id;
        let own_key = chunk_id.to_id_string();
        self.point_clouds = match store.get(&settings.point_clouds_bucket, &own_key, true).await {
            Ok(outcome) => codec::decode_point_cloud(&outcome.body, &HashSet::new())?,
            Err(PipelineError::StoreNotFound { .. }) => HashMap::new(),
            Err(e) => return Err(e),
        };

        let mut rng = rand::thread_rng();
        let ids = self.detail.updated_ids.clone();

        for plot_id in ids {
            let Some(blob) = self.detail.parts.get(&plot_id) else {
                continue;
            };
            let build = codec::get_build_part(blob)?;
            let build_size = build[1];

            let mut voxels: Vec<(u32, u16)> = codec::VoxelIter::new(&build[2..])
                .filter(|&(_, color)| color > PLOT_COUNT as u16)
                .collect();

            if voxels.len() < 2 {
                continue;
            }
            voxels.shuffle(&mut rng);

            let k = Self::sample_count(voxels.len()).min(voxels.len());
            let world_pos = codec::idx_to_vec3(
                id::plot_id_to_world_pos_idx(plot_id as u32),
                MAIN_BUILD_SIZE as u32,
            ) + Vec3::new(0.0, 1.0, 0.0);

            let mut points = Vec::with_capacity(k);
            let mut colors = Vec::with_capacity(k);
            for &(voxel_idx, color) in &voxels[..k] {
                let local = (codec::idx_to_vec3(voxel_idx, build_size as u32)
                    + Vec3::splat(0.5))
                    / build_size as f32;
                let p = world_pos + local;
                points.push([p.x, p.y, p.z]);
                colors.push(color);
            }

            self.point_clouds
                .insert(plot_id, PointCloud { points, colors });
        }

        if !self.point_clouds.is_empty() {
            let merged = codec::encode_point_cloud(&self.point_clouds);
            store
                .put(
                    &settings.point_clouds_bucket,
                    &own_key,
                    "application/octet-stream",
                    Bytes::from(merged),
                    true,
                )
                .await?;
        }

        let parent_index = id::map_bwd(chunk_id.layer, chunk_id.index);
        let parent = ChunkId::new(chunk_id.layer - 1, parent_index, true);
        Ok(Some(parent.to_id_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_matches_sqrt_rule_clamped_to_two() {
        assert_eq!(BaseChunk::sample_count(100), 10);
        assert_eq!(BaseChunk::sample_count(1), 2);
        assert_eq!(BaseChunk::sample_count(3), 2);
    }
}
