// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `#INCGFX`: converts a raster image into Game Boy 2bpp planar tile
//! data.
//!
//! The source image is quantized down to (at most) four colors, each
//! 8x`tileheight` block becomes one tile, and each tile is encoded as
//! two bitplanes (low bit of each pixel's color index, then high
//! bit), row by row -- the standard Game Boy tile format.

use std::path::Path;

use image::GenericImageView;

use crate::error::{AssemblerError, Result};

#[derive(Default, Clone)]
pub struct GfxOptions {
    pub tileheight: Option<u32>,
    pub colormap: Option<[u32; 4]>,
    pub unique: bool,
    pub tilemap: bool,
    pub range: Option<(usize, usize)>,
    pub debug: bool,
}

pub fn read(path: &Path, opts: &GfxOptions) -> Result<Vec<u8>> {
    let img = image::open(path)
        .map_err(|e| AssemblerError::bare(format!("Failed to open image {}: {e}", path.display())))?;
    let (width, height) = img.dimensions();
    if width % 8 != 0 {
        return Err(AssemblerError::bare(format!("Image width {width} is not a multiple of 8")));
    }
    let tileheight = opts.tileheight.unwrap_or(if height == 8 { 8 } else { 16 });
    if height % tileheight != 0 {
        return Err(AssemblerError::bare(format!(
            "Image height {height} is not a multiple of tile height {tileheight}"
        )));
    }

    let palette = build_palette(&img, opts.colormap);
    let cols = (width / 8) as usize;
    let rows = (height / tileheight) as usize;
    let total_tiles = rows * cols;
    let (range_start, range_end) = opts.range.unwrap_or((0, total_tiles));

    if opts.debug {
        log::debug!(
            "#INCGFX {}: {cols}x{rows} tiles, height {tileheight}, {} in range",
            path.display(),
            range_end.saturating_sub(range_start)
        );
    }

    let mut unique_tiles: Vec<[u8; 2 * 16]> = Vec::new();
    let mut tilemap = Vec::with_capacity(total_tiles);
    let mut pixel_data = Vec::new();

    for tile_idx in 0..total_tiles {
        let ty = tile_idx / cols;
        let tx = tile_idx % cols;
        let mut encoded = [0u8; 2 * 16];
        for y in 0..tileheight.min(16) as usize {
            let mut a = 0u8;
            let mut b = 0u8;
            for x in 0..8u32 {
                let px = img.get_pixel(tx as u32 * 8 + x, ty as u32 * tileheight + y as u32);
                let idx = palette.nearest([px.0[0], px.0[1], px.0[2]]);
                if idx & 1 != 0 {
                    a |= 0x80 >> x;
                }
                if idx & 2 != 0 {
                    b |= 0x80 >> x;
                }
            }
            encoded[y * 2] = a;
            encoded[y * 2 + 1] = b;
        }
        let encoded_len = tileheight as usize * 2;

        if tile_idx < range_start || tile_idx >= range_end {
            continue;
        }

        if opts.unique || opts.tilemap {
            let slot = unique_tiles.iter().position(|t| t[..encoded_len] == encoded[..encoded_len]);
            let slot = slot.unwrap_or_else(|| {
                unique_tiles.push(encoded);
                unique_tiles.len() - 1
            });
            tilemap.push(slot as u8);
        } else {
            pixel_data.extend_from_slice(&encoded[..encoded_len]);
        }
    }

    if opts.tilemap {
        return Ok(tilemap);
    }
    if opts.unique {
        let encoded_len = tileheight as usize * 2;
        for tile in &unique_tiles {
            pixel_data.extend_from_slice(&tile[..encoded_len]);
        }
    }
    Ok(pixel_data)
}

struct Palette {
    colors: Vec<[u8; 3]>,
}

impl Palette {
    fn nearest(&self, rgb: [u8; 3]) -> u8 {
        self.colors
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| color_distance(**c, rgb))
            .map(|(i, _)| i as u8)
            .unwrap_or(0)
    }
}

fn color_distance(a: [u8; 3], b: [u8; 3]) -> u32 {
    let dr = a[0] as i32 - b[0] as i32;
    let dg = a[1] as i32 - b[1] as i32;
    let db = a[2] as i32 - b[2] as i32;
    (dr * dr + dg * dg + db * db) as u32
}

/// Picks up to four distinct colors from the image, ordered by first
/// appearance, then applies `colormap` (a list of packed `0xRRGGBB`
/// values naming the desired output order) if one was given.
fn build_palette(img: &image::DynamicImage, colormap: Option<[u32; 4]>) -> Palette {
    let mut colors: Vec<[u8; 3]> = Vec::new();
    'scan: for (_, _, px) in img.pixels() {
        let rgb = [px.0[0], px.0[1], px.0[2]];
        if colors.contains(&rgb) {
            continue;
        }
        colors.push(rgb);
        if colors.len() == 4 {
            break 'scan;
        }
    }
    while colors.len() < 4 {
        colors.push([0, 0, 0]);
    }

    if let Some(map) = colormap {
        let mut remap = [0usize; 4];
        for (n, packed) in map.iter().enumerate() {
            let target = [((packed >> 16) & 0xFF) as u8, ((packed >> 8) & 0xFF) as u8, (packed & 0xFF) as u8];
            if let Some(pos) = colors.iter().position(|c| *c == target) {
                remap[pos] = n;
            }
        }
        let mut reordered = vec![[0u8; 3]; 4];
        for (pos, dest) in remap.iter().enumerate() {
            reordered[*dest] = colors[pos];
        }
        return Palette { colors: reordered };
    }
    Palette { colors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn solid_image(w: u32, h: u32, colors: &[[u8; 3]]) -> DynamicImage {
        let mut img = RgbImage::new(w, h);
        for (i, px) in img.pixels_mut().enumerate() {
            let c = colors[i % colors.len()];
            *px = image::Rgb(c);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn palette_picks_up_to_four_colors_in_first_seen_order() {
        let img = solid_image(2, 2, &[[1, 1, 1], [2, 2, 2], [3, 3, 3], [4, 4, 4]]);
        let palette = build_palette(&img, None);
        assert_eq!(palette.colors, vec![[1, 1, 1], [2, 2, 2], [3, 3, 3], [4, 4, 4]]);
    }

    #[test]
    fn palette_pads_with_black_when_fewer_than_four_colors_present() {
        let img = solid_image(2, 2, &[[9, 9, 9]]);
        let palette = build_palette(&img, None);
        assert_eq!(palette.colors, vec![[9, 9, 9], [0, 0, 0], [0, 0, 0], [0, 0, 0]]);
    }

    #[test]
    fn palette_reorders_by_requested_colormap() {
        let img = solid_image(2, 2, &[[1, 1, 1], [2, 2, 2], [3, 3, 3], [4, 4, 4]]);
        let colormap = [0x040404, 0x030303, 0x020202, 0x010101];
        let palette = build_palette(&img, Some(colormap));
        assert_eq!(palette.nearest([4, 4, 4]), 0);
        assert_eq!(palette.nearest([1, 1, 1]), 3);
    }

    #[test]
    fn nearest_finds_the_closest_color_by_squared_distance() {
        let palette = Palette { colors: vec![[0, 0, 0], [255, 255, 255]] };
        assert_eq!(palette.nearest([10, 10, 10]), 0);
        assert_eq!(palette.nearest([250, 250, 250]), 1);
    }

    #[test]
    fn reads_a_single_8x8_tile_into_two_bitplanes() {
        let img = solid_image(8, 8, &[[255, 255, 255]]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.png");
        img.save(&path).unwrap();
        let bytes = read(&path, &GfxOptions::default()).unwrap();
        assert_eq!(bytes.len(), 16);
    }
}
