//! `DChunk`: non-LOD chunk processing at any layer (spec.md §4.F).

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::codec;
use crate::config::Settings;
use crate::error::PipelineError;
use crate::id::ChunkId;
use crate::store::{GetParams, ObjectStore, PutParams};

use super::{ChunkProcessor, UpdateFlags};

/// An image slot for a single updated plot: either freshly rendered PNG
/// bytes, or a "no image" marker when `noImageUpdate` was set.
enum ImageUpdate {
    Png(Vec<u8>),
    Skipped,
}

pub struct DChunk {
    pub id: ChunkId,
    pub parts: HashMap<u64, Vec<u8>>,
    update_flags: HashMap<u64, UpdateFlags>,
    /// Parallel to the order `needs_update` ids were processed in `prep`.
    pub(crate) updated_ids: Vec<u64>,
    updated_images: Vec<ImageUpdate>,
}

impl DChunk {
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            parts: HashMap::new(),
            update_flags: HashMap::new(),
            updated_ids: Vec::new(),
            updated_images: Vec::new(),
        }
    }

    fn plot_key(plot_id: u64) -> String {
        format!("{plot_id:x}.dat")
    }

    fn image_key(plot_id: u64) -> String {
        format!("{plot_id:x}.png")
    }
}

impl ChunkProcessor for DChunk {
    async fn prep(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
        needs_update: &HashSet<u64>,
        flags: &HashMap<u64, UpdateFlags>,
    ) -> Result<(), PipelineError> {
        self.parts =
            super::download_parts(store, &settings.chunks_bucket, self.id, needs_update).await?;
        self.update_flags = flags.clone();

        if needs_update.is_empty() {
            return Ok(());
        }

        let mut ids: Vec<u64> = needs_update.iter().copied().collect();
        ids.sort_unstable();

        let requests: Vec<GetParams> = ids
            .iter()
            .map(|&id| GetParams {
                bucket: settings.plots_bucket.clone(),
                key: Self::plot_key(id),
                head_only: self.update_flags.get(&id).is_some_and(|f| f.metadata_only),
                use_cache: false,
            })
            .collect();

        let results = store.get_many(requests).await;

        for (plot_id, result) in ids.into_iter().zip(results) {
            let remote = result?;
            let flags = self.update_flags.get(&plot_id).copied().unwrap_or_default();

            let verified = remote
                .metadata
                .get("verified")
                .cloned()
                .ok_or_else(|| PipelineError::MissingUserMetadata {
                    bucket: settings.plots_bucket.clone(),
                    object_key: Self::plot_key(plot_id),
                    field: "verified",
                })?;
            let owner = remote.metadata.get("owner").cloned().ok_or_else(|| {
                PipelineError::MissingUserMetadata {
                    bucket: settings.plots_bucket.clone(),
                    object_key: Self::plot_key(plot_id),
                    field: "owner",
                }
            })?;
            let is_verified = verified == "true";

            // `setDefaultJson > setDefaultBuild > metadataOnly > default
            // path` precedence (resolution of spec.md's Open Question).
            // `metadataOnly` fetches the plot via HEAD, so `remote.body` is
            // empty; the original leaves the corresponding half unset
            // rather than reading it.
            let mut json = if flags.set_default_json {
                codec::default_json()
            } else if flags.metadata_only {
                serde_json::json!({})
            } else {
                codec::get_json(&remote.body)?
            };

            let remote_build_size = if flags.metadata_only {
                0
            } else {
                codec::get_build_size(&remote.body).unwrap_or(0)
            };
            let build: Vec<u8> = if flags.set_default_build {
                codec::default_build_view().to_vec()
            } else if flags.metadata_only {
                Vec::new()
            } else if !is_verified && remote_build_size > crate::config::BUILD_SIZE_STD {
                codec::default_build_view().to_vec()
            } else {
                codec::get_build_view(&remote.body)?.to_vec()
            };

            json["verified"] = serde_json::Value::String(verified);
            json["owner"] = serde_json::Value::String(owner);
            if !is_verified {
                json["link"] = serde_json::Value::String(String::new());
                json["linkTitle"] = serde_json::Value::String(String::new());
            }

            let repacked = codec::encode_plot(&json, &build);
            self.parts.insert(plot_id, repacked);
            self.updated_ids.push(plot_id);
        }

        Ok(())
    }

    fn process(&mut self) {
        for &plot_id in &self.updated_ids {
            let flags = self
                .update_flags
                .get(&plot_id)
                .copied()
                .unwrap_or_default();

            if flags.no_image_update {
                self.updated_images.push(ImageUpdate::Skipped);
                continue;
            }

            let Some(blob) = self.parts.get(&plot_id) else {
                self.updated_images.push(ImageUpdate::Skipped);
                continue;
            };
            let Ok(build) = codec::get_build_part(blob) else {
                self.updated_images.push(ImageUpdate::Skipped);
                continue;
            };
            let png_bytes = crate::raster::render(&build);
            self.updated_images.push(ImageUpdate::Png(png_bytes));
        }
    }

    async fn update(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
    ) -> Result<Option<String>, PipelineError> {
        if !self.updated_ids.is_empty() {
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

            let put_requests: Vec<PutParams> = self
                .updated_ids
                .iter()
                .zip(&self.updated_images)
                .filter_map(|(&plot_id, image)| match image {
                    ImageUpdate::Png(bytes) => Some(PutParams {
                        bucket: settings.images_bucket.clone(),
                        key: Self::image_key(plot_id),
                        content_type: "image/png".to_owned(),
                        body: Bytes::from(bytes.clone()),
                        use_cache: false,
                    }),
                    ImageUpdate::Skipped => None,
                })
                .collect();

            if !put_requests.is_empty() {
                for result in store.put_many(put_requests).await {
                    result?;
                }
            }
        }

        Ok(None)
    }
}
