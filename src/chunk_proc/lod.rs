//! `LChunk`: LOD chunk processing at layers below 2 (spec.md §4.F).

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::codec::{self, PointCloud};
use crate::config::{Settings, PC_SAMPLE_PERC};
use crate::error::PipelineError;
use crate::id::{self, ChunkId};
use crate::kmeans;
use crate::store::ObjectStore;

use super::{ChunkProcessor, UpdateFlags};

pub struct LChunk {
    pub id: ChunkId,
    pub parts: HashMap<u64, Vec<u8>>,
    pub point_clouds: HashMap<u64, PointCloud>,
    needs_update: HashSet<u64>,
}

impl LChunk {
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            parts: HashMap::new(),
            point_clouds: HashMap::new(),
            needs_update: HashSet::new(),
        }
    }

    fn child_id(&self, child_index: u64) -> ChunkId {
        ChunkId::new(self.id.layer + 1, child_index as u32, true)
    }
}

impl ChunkProcessor for LChunk {
    async fn prep(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
        needs_update: &HashSet<u64>,
        _flags: &HashMap<u64, UpdateFlags>,
    ) -> Result<(), PipelineError> {
        self.parts =
            super::download_parts(store, &settings.chunks_bucket, self.id, needs_update).await?;
        self.needs_update = needs_update.clone();

        let own_key = self.id.to_id_string();
        let existing = match store.get(&settings.point_clouds_bucket, &own_key, true).await {
            Ok(outcome) => codec::decode_point_cloud(&outcome.body, needs_update)?,
            Err(PipelineError::StoreNotFound { .. }) => HashMap::new(),
            Err(e) => return Err(e),
        };
        self.point_clouds = existing;

        if needs_update.is_empty() {
            return Ok(());
        }

        let mut child_ids: Vec<u64> = needs_update.iter().copied().collect();
        child_ids.sort_unstable();

        let requests: Vec<_> = child_ids
            .iter()
            .map(|&child| crate::store::GetParams {
                bucket: settings.point_clouds_bucket.clone(),
                key: self.child_id(child).to_id_string(),
                head_only: false,
                use_cache: false,
            })
            .collect();

        let results = store.get_many(requests).await;

        for (child, result) in child_ids.into_iter().zip(results) {
            match result {
                Ok(outcome) => {
                    let sampled = codec::decode_single_point_cloud(&outcome.body, PC_SAMPLE_PERC)?;
                    self.point_clouds.insert(child, sampled);
                }
                Err(PipelineError::StoreNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
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

        Ok(())
    }

    fn process(&mut self) {
        let mut rng = rand::thread_rng();
        for &child in &self.needs_update {
            let Some(pc) = self.point_clouds.get(&child) else {
                continue;
            };
            if pc.len() < 2 {
                continue;
            }

            let colors: Vec<[f32; 3]> = pc
                .colors
                .iter()
                .map(|&idx| {
                    crate::color::get_color(idx).unwrap_or([0.0, 0.0, 0.0])
                })
                .collect();
            let records = kmeans::summarize(&pc.points, &colors, &mut rng);
            if records.is_empty() {
                continue;
            }

            let mut bytes = Vec::with_capacity(records.len() * 9 * 4);
            for record in &records {
                for v in record {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
            }
            self.parts.insert(child, bytes);
        }
    }

    async fn update(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
    ) -> Result<Option<String>, PipelineError> {
        let blob = codec::encode_chunk(&self.parts);
        store
            .put(
                &settings.chunks_bucket,
                &self.id.to_id_string(),
                "application/octet-stream",
                Bytes::from(blob),
                false,
            )
            .await?;

        if self.id.layer == 0 {
            return Ok(None);
        }

        let parent_index = id::map_bwd(self.id.layer, self.id.index);
        let parent = ChunkId::new(self.id.layer - 1, parent_index, true);
        Ok(Some(parent.to_id_string()))
    }
}
