//! Voxel color palette (spec.md §4.A "Color helpers").
//!
//! The palette is a fixed, lazily-built table: a 25×25 greyscale ramp
//! followed by six hue bands, each ramped from a primary color through
//! `HPB` intermediate hues and tinted toward white/black on a 25×25 grid.
//! `get_color(idx)` looks up `idx - (PLOT_COUNT + 1)` in that table.

use once_cell::sync::OnceCell;

use crate::config::PLOT_COUNT;

const HPB: usize = 8;
const GS: usize = 25;

fn lerp(a: [f32; 3], b: [f32; 3], alpha: f32) -> [f32; 3] {
    [
        a[0] * alpha + b[0] * (1.0 - alpha),
        a[1] * alpha + b[1] * (1.0 - alpha),
        a[2] * alpha + b[2] * (1.0 - alpha),
    ]
}

fn build_palette() -> Vec<[f32; 3]> {
    let white = [1.0, 1.0, 1.0];
    let black = [0.0, 0.0, 0.0];
    let gs2 = GS * GS;

    let mut palette = Vec::with_capacity(gs2 + 6 * HPB * gs2);

    for i in 0..gs2 {
        palette.push(lerp(white, black, i as f32 / gs2 as f32));
    }

    let mut c1i = 0usize;
    let mut c2i = 0usize;
    for i in 0..6 {
        let mut c1 = [0.0f32; 3];
        let mut c2 = [0.0f32; 3];
        c1[c1i % 3] = 1.0;
        c2[c2i % 3] = 1.0;

        if i & 1 == 1 {
            c1i += 1;
            c1[c1i % 3] = 1.0;
        } else {
            c2i += 1;
            c2[c2i % 3] = 1.0;
        }

        for h in 0..HPB {
            let base = lerp(c1, c2, h as f32 / HPB as f32);
            for s in 0..GS {
                for r in 0..GS {
                    let x = (r + 1) as f32 / (GS + 2) as f32;
                    let y = s as f32 / GS as f32;
                    palette.push(lerp(lerp(base, white, x), black, y));
                }
            }
        }
    }

    palette
}

static PALETTE: OnceCell<Vec<[f32; 3]>> = OnceCell::new();

/// Looks up the RGB color (each channel in `[0, 1]`) for a color index, or
/// `None` if `idx` falls within the reserved plot-owner color range
/// (`0..=PLOT_COUNT`).
pub fn get_color(idx: u16) -> Option<[f32; 3]> {
    let offset = PLOT_COUNT + 1;
    if u32::from(idx) < offset {
        return None;
    }
    let palette = PALETTE.get_or_init(build_palette);
    palette.get((u32::from(idx) - offset) as usize).copied()
}

/// Alias of [`get_color`] returning a `glam::Vec3`.
pub fn get_color_as_vec(idx: u16) -> Option<glam::Vec3> {
    get_color(idx).map(|c| glam::Vec3::new(c[0], c[1], c[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_range_returns_none() {
        for idx in 0..=PLOT_COUNT as u16 {
            assert_eq!(get_color(idx), None);
        }
    }

    #[test]
    fn first_palette_entry_is_white() {
        let c = get_color((PLOT_COUNT + 1) as u16).unwrap();
        assert_eq!(c, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn palette_entries_are_deterministic() {
        let idx = (PLOT_COUNT + 100) as u16;
        assert_eq!(get_color(idx), get_color(idx));
    }
}
