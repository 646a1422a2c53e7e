//! Plot part payload codec (spec.md §3 "Plot part payload", §4.A).
//!
//! ```text
//! [u32 json_len LE][json_len bytes of JSON]
//! [u32 build_len LE][build_len bytes of voxel build data]
//! ```

use std::fs;

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::error::PipelineError;

/// Parses the JSON part of a plot blob.
pub fn get_json(plot_data: &[u8]) -> Result<Value, PipelineError> {
    if plot_data.len() < 4 {
        return Err(PipelineError::MalformedBlob("plot blob too short".into()));
    }
    let json_len = u32::from_le_bytes(plot_data[0..4].try_into().unwrap()) as usize;
    let json_bytes = plot_data
        .get(4..4 + json_len)
        .ok_or_else(|| PipelineError::MalformedBlob("plot json part truncated".into()))?;
    serde_json::from_slice(json_bytes)
        .map_err(|e| PipelineError::MalformedBlob(format!("invalid plot json: {e}")))
}

/// Returns a byte view of the build part of a plot blob.
pub fn get_build_view(plot_data: &[u8]) -> Result<&[u8], PipelineError> {
    if plot_data.len() < 4 {
        return Err(PipelineError::MalformedBlob("plot blob too short".into()));
    }
    let json_len = u32::from_le_bytes(plot_data[0..4].try_into().unwrap()) as usize;
    let build_len_offset = json_len + 4;
    let build_len_bytes = plot_data
        .get(build_len_offset..build_len_offset + 4)
        .ok_or_else(|| PipelineError::MalformedBlob("plot build length truncated".into()))?;
    let build_len = u32::from_le_bytes(build_len_bytes.try_into().unwrap()) as usize;
    let build_start = build_len_offset + 4;
    plot_data
        .get(build_start..build_start + build_len)
        .ok_or_else(|| PipelineError::MalformedBlob("plot build part truncated".into()))
}

/// Returns the build's edge length, read in-place at offset `json_len+10`
/// without decoding the full build payload.
pub fn get_build_size(plot_data: &[u8]) -> Result<u16, PipelineError> {
    if plot_data.len() < 4 {
        return Err(PipelineError::MalformedBlob("plot blob too short".into()));
    }
    let json_len = u32::from_le_bytes(plot_data[0..4].try_into().unwrap()) as usize;
    let offset = json_len + 10;
    let bytes = plot_data
        .get(offset..offset + 2)
        .ok_or_else(|| PipelineError::MalformedBlob("plot build size truncated".into()))?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

/// Decodes the build part into a `u16` stream.
pub fn get_build_part(plot_data: &[u8]) -> Result<Vec<u16>, PipelineError> {
    let view = get_build_view(plot_data)?;
    if view.len() % 2 != 0 {
        return Err(PipelineError::MalformedBlob(
            "build part length is not a multiple of 2".into(),
        ));
    }
    Ok(view
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Encodes a plot blob from its JSON metadata and raw build bytes.
pub fn encode_plot(json: &Value, build: &[u8]) -> Vec<u8> {
    let json_bytes = serde_json::to_vec(json).expect("plot json must serialize");
    let json_len = json_bytes.len() as u32;
    let build_len = build.len() as u32;

    let mut out = Vec::with_capacity(8 + json_bytes.len() + build.len());
    out.extend_from_slice(&json_len.to_le_bytes());
    out.extend_from_slice(&json_bytes);
    out.extend_from_slice(&build_len.to_le_bytes());
    out.extend_from_slice(build);
    out
}

/// The default plot JSON metadata used when `setDefaultJson` is set.
pub fn default_json() -> Value {
    serde_json::json!({
        "ver": 0,
        "name": "",
        "desc": "",
        "link": "",
        "linkTitle": "",
        "owner": "",
        "verified": false,
        "status": "",
    })
}

static DEFAULT_BUILD: OnceCell<Vec<u8>> = OnceCell::new();

/// The default build payload, loaded once from `static/default_build.dat`.
pub fn default_build_view() -> &'static [u8] {
    DEFAULT_BUILD
        .get_or_init(|| {
            fs::read("static/default_build.dat").expect("failed to read static/default_build.dat")
        })
        .as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip_empty() {
        let json = serde_json::json!({"a": 1});
        let build: Vec<u8> = vec![1, 2, 3, 4];
        let blob = encode_plot(&json, &build);
        assert_eq!(get_json(&blob).unwrap(), json);
        assert_eq!(get_build_view(&blob).unwrap(), build.as_slice());
    }

    #[test]
    fn build_size_read_in_place() {
        let json = serde_json::json!({"x": "y"});
        let build: Vec<u8> = vec![0, 0, 48, 0, 1, 0]; // reserved=0, build_size=48, one run token
        let blob = encode_plot(&json, &build);
        assert_eq!(get_build_size(&blob).unwrap(), 48);
    }

    proptest! {
        #[test]
        fn round_trip_prop(name in ".{0,20}", build in prop::collection::vec(any::<u8>(), 0..40)) {
            let json = serde_json::json!({"name": name});
            let blob = encode_plot(&json, &build);
            prop_assert_eq!(get_json(&blob).unwrap(), json);
            prop_assert_eq!(get_build_view(&blob).unwrap(), build.as_slice());
        }
    }
}
