use thiserror::Error;

/// Error kinds surfaced by the codec, store, and chunk-processing layers.
///
/// Most variants are fatal to the `process_chunk` task that produced them;
/// see each call site for how it is handled.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed blob: {0}")]
    MalformedBlob(String),

    #[error("object not found: {bucket}/{key}")]
    StoreNotFound { bucket: String, key: String },

    #[error("store error: {0}")]
    StoreError(String),

    #[error("missing required user metadata {field:?} on {bucket}/{object_key}")]
    MissingUserMetadata {
        bucket: String,
        object_key: String,
        field: &'static str,
    },

    #[error("invalid chunk id {0:?}")]
    InvalidId(String),

    #[error("cdn purge failed: {0}")]
    CdnPurgeFailed(String),
}
