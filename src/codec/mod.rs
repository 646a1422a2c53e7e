//! Binary codecs for the blob formats the pipeline moves between object
//! storage and in-memory chunk state (spec.md §3, §4.A).

pub mod chunk;
pub mod plot;
pub mod point_cloud;
pub mod voxel;

pub use chunk::{decode_chunk, encode_chunk};
pub use plot::{
    default_build_view, default_json, encode_plot, get_build_part, get_build_size, get_build_view,
    get_json,
};
pub use point_cloud::{decode_point_cloud, decode_single_point_cloud, encode_point_cloud, PointCloud};
pub use voxel::{build_size, idx_to_vec3, rle_stream, VoxelIter};
