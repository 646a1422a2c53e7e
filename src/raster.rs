//! Software voxel rasterizer (spec.md §4.G).
//!
//! Renders a build's RLE voxel stream to a PNG preview: an isometric-ish
//! camera looking at the model from `(CAMERA_THETA, CAMERA_PHI)`, flat
//! per-face shading from a fixed light direction, and a CPU scanline
//! rasterizer with a depth buffer. Pure and side-effect free; callers run
//! it on a CPU thread pool, not the async I/O executor.

use glam::Vec3;

use crate::codec::voxel::{idx_to_vec3, VoxelIter};
use crate::color::get_color_as_vec;
use crate::config::PLOT_COUNT;

pub const IMG_WIDTH: usize = 1024;
pub const IMG_HEIGHT: usize = 1024;

const CAMERA_THETA: f32 = std::f32::consts::PI * 0.25;
const CAMERA_PHI: f32 = std::f32::consts::PI * 0.5;
const FOV_DEG: f32 = 70.0;
const NEAR: f32 = 1.0;
const FAR: f32 = 100.0;
const LIGHT_INTENSITY: f32 = 1.8;
const BACKGROUND: [u8; 3] = [27, 24, 24];

const VERT_OFFSET: [[f32; 3]; 8] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
    [1.0, 0.0, 1.0],
    [1.0, 1.0, 1.0],
    [0.0, 1.0, 1.0],
];

const FACE_IDX: [[usize; 4]; 6] = [
    [3, 2, 6, 7],
    [0, 4, 5, 1],
    [0, 3, 7, 4],
    [1, 5, 6, 2],
    [4, 7, 6, 5],
    [0, 1, 2, 3],
];

struct ViewProj {
    m00: f32,
    m01: f32,
    m02: f32,
    m03: f32,
    m10: f32,
    m11: f32,
    m12: f32,
    m13: f32,
    m20: f32,
    m21: f32,
    m22: f32,
    m23: f32,
    m30: f32,
    m31: f32,
    m32: f32,
    m33: f32,
}

impl ViewProj {
    fn build(scale: f32) -> Self {
        let campos = Vec3::new(
            scale * CAMERA_PHI.sin() * CAMERA_THETA.cos(),
            scale * CAMERA_PHI.cos(),
            scale * CAMERA_PHI.sin() * CAMERA_THETA.sin(),
        );

        let f = (-campos).normalize();
        let s = f.cross(Vec3::Y).normalize();
        let u = s.cross(f);

        let aspect = IMG_WIDTH as f32 / IMG_HEIGHT as f32;
        let g = 1.0 / (FOV_DEG * std::f32::consts::PI / 90.0).tan();
        let c = (FAR + NEAR) / (NEAR - FAR);
        let d = (2.0 * FAR * NEAR) / (NEAR - FAR);

        let s_dot = s.dot(campos);
        let u_dot = u.dot(campos);
        let f_dot = f.dot(campos);

        Self {
            m00: g / aspect * s.x,
            m01: g / aspect * s.y,
            m02: g / aspect * s.z,
            m03: g / aspect * -s_dot,
            m10: g * u.x,
            m11: g * u.y,
            m12: g * u.z,
            m13: g * -u_dot,
            m20: -c * f.x,
            m21: -c * f.y,
            m22: -c * f.z,
            m23: c * f_dot + d,
            m30: f.x,
            m31: f.y,
            m32: f.z,
            m33: -f_dot,
        }
    }

    fn project(&self, v: Vec3) -> (f32, f32, f32, f32) {
        let ux = self.m00 * v.x + self.m01 * v.y + self.m02 * v.z + self.m03;
        let uy = self.m10 * v.x + self.m11 * v.y + self.m12 * v.z + self.m13;
        let uz = self.m20 * v.x + self.m21 * v.y + self.m22 * v.z + self.m23;
        let uw = self.m30 * v.x + self.m31 * v.y + self.m32 * v.z + self.m33;
        (ux, uy, uz, uw)
    }
}

struct Framebuffer {
    rgb: Vec<[u8; 3]>,
    zbuf: Vec<f32>,
}

impl Framebuffer {
    fn new() -> Self {
        Self {
            rgb: vec![BACKGROUND; IMG_WIDTH * IMG_HEIGHT],
            zbuf: vec![1.0; IMG_WIDTH * IMG_HEIGHT],
        }
    }

    fn rasterize_tri(&mut self, a: [f32; 3], b: [f32; 3], c: [f32; 3], color: [u8; 3]) {
        let min_x = 0.max(a[0].min(b[0]).min(c[0]).floor() as i32);
        let max_x = (IMG_WIDTH as i32 - 1).min(a[0].max(b[0]).max(c[0]).ceil() as i32);
        let min_y = 0.max(a[1].min(b[1]).min(c[1]).floor() as i32);
        let max_y = (IMG_HEIGHT as i32 - 1).min(a[1].max(b[1]).max(c[1]).ceil() as i32);

        if min_x > max_x || min_y > max_y {
            return;
        }

        let denom = (b[1] - c[1]) * (a[0] - c[0]) + (c[0] - b[0]) * (a[1] - c[1]);
        if denom <= 0.0 {
            return;
        }
        let inv_denom = 1.0 / denom;

        let dy0 = b[1] - c[1];
        let dx0 = c[0] - b[0];
        let c0_const = dy0 * -c[0] + dx0 * -c[1];

        let dy1 = c[1] - a[1];
        let dx1 = a[0] - c[0];
        let c1_const = dy1 * -c[0] + dx1 * -c[1];

        for y in min_y..=max_y {
            let mut w0_row = dy0 * min_x as f32 + dx0 * y as f32 + c0_const;
            let mut w1_row = dy1 * min_x as f32 + dx1 * y as f32 + c1_const;
            let row = y as usize * IMG_WIDTH;

            for x in min_x..=max_x {
                let w0 = w0_row * inv_denom;
                let w1 = w1_row * inv_denom;
                let w2 = 1.0 - w0 - w1;

                if w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0 {
                    let z = w0 * a[2] + w1 * b[2] + w2 * c[2];
                    let px = row + x as usize;
                    if z >= 0.0 && z < self.zbuf[px] {
                        self.zbuf[px] = z;
                        self.rgb[px] = color;
                    }
                }
                w0_row += dy0;
                w1_row += dy1;
            }
        }
    }

    fn encode_png(&self) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, IMG_WIDTH as u32, IMG_HEIGHT as u32);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            encoder.set_compression(png::Compression::Fast);
            let mut writer = encoder.write_header().expect("png header");
            let mut data = Vec::with_capacity(IMG_WIDTH * IMG_HEIGHT * 3);
            for px in &self.rgb {
                data.extend_from_slice(px);
            }
            writer.write_image_data(&data).expect("png data");
        }
        out
    }
}

fn light_vector() -> Vec3 {
    Vec3::new(
        (43.0f32.to_radians()).cos(),
        (45.0f32.to_radians()).cos(),
        (47.0f32.to_radians()).cos(),
    )
    .normalize()
        * LIGHT_INTENSITY
        * 255.0
}

/// Renders a build's RLE voxel stream to PNG bytes. An empty stream
/// (no resolvable voxels) renders a background-only image.
pub fn render(build: &[u16]) -> Vec<u8> {
    let bs = build[1] as u32;
    let mut fb = Framebuffer::new();

    let mut points = Vec::new();
    let mut colors = Vec::new();
    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);

    for (idx, color_idx) in VoxelIter::new(&build[2..]) {
        if color_idx <= PLOT_COUNT as u16 {
            continue;
        }
        let Some(color) = get_color_as_vec(color_idx) else {
            continue;
        };
        let p = idx_to_vec3(idx, bs);
        min = min.min(p);
        max = max.max(p);
        points.push(p);
        colors.push(color);
    }

    if points.is_empty() {
        return fb.encode_png();
    }

    max += Vec3::ONE;
    let scale = (max - min).length();
    let vp = ViewProj::build(scale);
    let target = (min + max) * 0.5;
    let light = light_vector();

    let mut proj_min_x = f32::MAX;
    let mut proj_max_x = f32::MIN;
    let mut proj_min_y = f32::MAX;
    let mut proj_max_y = f32::MIN;

    for p in &points {
        let shifted = *p - target;
        for offset in &VERT_OFFSET {
            let v = shifted + Vec3::from(*offset);
            let (ux, uy, _uz, uw) = vp.project(v);
            let inv_w = 1.0 / uw;
            let x = ux * inv_w * 0.5;
            let y = uy * inv_w * 0.5;
            proj_min_x = proj_min_x.min(x);
            proj_max_x = proj_max_x.max(x);
            proj_min_y = proj_min_y.min(y);
            proj_max_y = proj_max_y.max(y);
        }
    }

    let dx = (proj_min_x + proj_max_x) * 0.5;
    let dy = (proj_min_y + proj_max_y) * 0.5;

    for (p, cf) in points.iter().zip(&colors) {
        let shifted = *p - target;
        let mut verts = [[0.0f32; 3]; 8];
        for (j, offset) in VERT_OFFSET.iter().enumerate() {
            let v = shifted + Vec3::from(*offset);
            let (ux, uy, uz, uw) = vp.project(v);
            let inv_w = 1.0 / uw;
            verts[j] = [
                (ux * inv_w * 0.5 + 0.5 - dx) * IMG_WIDTH as f32,
                (uy * inv_w * 0.5 + 0.5 - dy) * IMG_HEIGHT as f32,
                0.5 * uz * inv_w + 0.5,
            ];
        }

        for (face, idxs) in FACE_IDX.iter().enumerate() {
            let l = light[face / 2];
            let color = [
                (cf.x * l).abs().clamp(0.0, 255.0) as u8,
                (cf.y * l).abs().clamp(0.0, 255.0) as u8,
                (cf.z * l).abs().clamp(0.0, 255.0) as u8,
            ];
            let [i0, i1, i2, i3] = *idxs;
            fb.rasterize_tri(verts[i0], verts[i1], verts[i2], color);
            fb.rasterize_tri(verts[i0], verts[i2], verts[i3], color);
        }
    }

    fb.encode_png()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_build_renders_background_only() {
        let build: Vec<u16> = vec![0, 4, 0]; // reserved, build_size=4, zero-length run, no color
        let png_bytes = render(&build);
        assert!(png_bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn single_voxel_renders_nonempty_png() {
        let color_token = ((PLOT_COUNT as u16 + 10) << 1) | 1;
        let build: Vec<u16> = vec![0, 4, color_token];
        let png_bytes = render(&build);
        assert!(png_bytes.starts_with(&[0x89, b'P', b'N', b'G']));
        assert!(png_bytes.len() > 100);
    }
}
