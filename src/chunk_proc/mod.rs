//! Chunk processors (spec.md §4.F).
//!
//! Three variants share a `prep(store) -> process() -> update(store) ->
//! Option<next_chunk_id>` contract. Rather than deep inheritance, each
//! variant owns its own state struct and the diamond "base chunk" case
//! (layer-2 LOD boundary, needing both detail and LOD behavior) composes
//! `DChunk`'s prep/process with its own `update` (spec.md §9).

pub mod base;
pub mod detail;
pub mod lod;

use std::collections::{HashMap, HashSet};

use crate::config::Settings;
use crate::error::PipelineError;
use crate::id::ChunkId;
use crate::store::ObjectStore;

pub use base::BaseChunk;
pub use detail::DChunk;
pub use lod::LChunk;

/// Per-child update-flag tokens, parsed from the work store's flag sets
/// (spec.md §3 "Update flags", §6 flag tokens). Unknown tokens are
/// ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlags {
    pub metadata_only: bool,
    pub set_default_json: bool,
    pub set_default_build: bool,
    pub no_image_update: bool,
}

impl UpdateFlags {
    pub fn from_tokens(tokens: &[String]) -> Self {
        let mut flags = Self::default();
        for token in tokens {
            match token.as_str() {
                crate::config::FLAG_METADATA_ONLY => flags.metadata_only = true,
                crate::config::FLAG_SET_DEFAULT_JSON => flags.set_default_json = true,
                crate::config::FLAG_SET_DEFAULT_BUILD => flags.set_default_build = true,
                crate::config::FLAG_NO_IMAGE_UPDATE => flags.no_image_update = true,
                _ => {}
            }
        }
        flags
    }
}

/// Shared three-phase contract. Implemented by each variant's own state
/// struct; dispatch happens through the concrete type (via [`ChunkVariant`]),
/// not through a trait object.
#[allow(async_fn_in_trait)]
pub trait ChunkProcessor {
    async fn prep(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
        needs_update: &HashSet<u64>,
        flags: &HashMap<u64, UpdateFlags>,
    ) -> Result<(), PipelineError>;

    /// CPU-bound phase. Must not touch `store` or any shared state; the
    /// scheduler runs this on a worker-pool thread.
    fn process(&mut self);

    async fn update(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
    ) -> Result<Option<String>, PipelineError>;
}

/// Classifies a chunk id into the variant that should process it:
/// LOD + layer 2 -> base, LOD + layer < 2 -> lod, non-LOD -> detail.
pub enum ChunkVariant {
    Detail(DChunk),
    Lod(LChunk),
    Base(BaseChunk),
}

impl ChunkVariant {
    pub fn classify(id: ChunkId) -> Self {
        match (id.is_lod, id.layer) {
            (true, 2) => ChunkVariant::Base(BaseChunk::new(id)),
            (true, _) => ChunkVariant::Lod(LChunk::new(id)),
            (false, _) => ChunkVariant::Detail(DChunk::new(id)),
        }
    }

    pub async fn prep(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
        needs_update: &HashSet<u64>,
        flags: &HashMap<u64, UpdateFlags>,
    ) -> Result<(), PipelineError> {
        match self {
            ChunkVariant::Detail(c) => c.prep(store, settings, needs_update, flags).await,
            ChunkVariant::Lod(c) => c.prep(store, settings, needs_update, flags).await,
            ChunkVariant::Base(c) => c.prep(store, settings, needs_update, flags).await,
        }
    }

    pub fn process(&mut self) {
        match self {
            ChunkVariant::Detail(c) => c.process(),
            ChunkVariant::Lod(c) => c.process(),
            ChunkVariant::Base(c) => c.process(),
        }
    }

    pub async fn update(
        &mut self,
        store: &ObjectStore,
        settings: &Settings,
    ) -> Result<Option<String>, PipelineError> {
        match self {
            ChunkVariant::Detail(c) => c.update(store, settings).await,
            ChunkVariant::Lod(c) => c.update(store, settings).await,
            ChunkVariant::Base(c) => c.update(store, settings).await,
        }
    }

    /// The chunk id this variant was classified from.
    pub fn chunk_id(&self) -> ChunkId {
        match self {
            ChunkVariant::Detail(c) => c.id,
            ChunkVariant::Lod(c) => c.id,
            ChunkVariant::Base(c) => c.detail.id,
        }
    }
}

/// Common `prep` step 1: fetch the chunk blob and decode it, treating the
/// "needs update" ids as the ignore set (the parts we will rewrite, not
/// keep). A missing object is treated as an empty parts set; any other
/// error is fatal.
pub async fn download_parts(
    store: &ObjectStore,
    chunks_bucket: &str,
    chunk_id: ChunkId,
    ignore_ids: &HashSet<u64>,
) -> Result<HashMap<u64, Vec<u8>>, PipelineError> {
    let key = chunk_id.to_id_string();
    match store.get(chunks_bucket, &key, false).await {
        Ok(outcome) => crate::codec::decode_chunk(&outcome.body, ignore_ids),
        Err(PipelineError::StoreNotFound { .. }) => Ok(HashMap::new()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_picks_base_for_lod_layer_two() {
        let id = ChunkId::new(2, 7, true);
        assert!(matches!(ChunkVariant::classify(id), ChunkVariant::Base(_)));
    }

    #[test]
    fn classify_picks_lod_for_lod_layer_below_two() {
        let id = ChunkId::new(1, 3, true);
        assert!(matches!(ChunkVariant::classify(id), ChunkVariant::Lod(_)));
    }

    #[test]
    fn classify_picks_detail_for_non_lod() {
        let id = ChunkId::new(0, 5, false);
        assert!(matches!(ChunkVariant::classify(id), ChunkVariant::Detail(_)));
    }

    #[test]
    fn unknown_flag_tokens_are_ignored() {
        let flags = UpdateFlags::from_tokens(&["sdj".to_owned(), "bogus".to_owned()]);
        assert!(flags.set_default_json);
        assert!(!flags.metadata_only);
    }
}
