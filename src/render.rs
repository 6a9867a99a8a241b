// SPDX-License-Identifier: GPL-3.0-or-later

//! CPU rasterization for the rendering context.
//!
//! Targets are XRGB8888 pixel storages shared between the context and the
//! [`ScanoutBuffer`][crate::backend::ScanoutBuffer]s they were created for.
//! Geometry is a list of triangles in normalized device coordinates.

use std::{
    cell::{Ref, RefCell, RefMut},
    fmt,
    rc::Rc,
};

/// The alpha bits every written pixel carries.
const OPAQUE: u32 = 0xff00_0000;

/// Shared XRGB8888 pixel storage, row-major with a stride of `width`.
#[derive(Clone)]
pub struct Pixels {
    data: Rc<RefCell<Vec<u32>>>,
    width: u32,
    height: u32,
}

impl Pixels {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![
                OPAQUE;
                width as usize * height as usize
            ])),
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Get the pixel at (`x`, `y`), origin at the top left.
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .borrow()
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    pub fn data(&self) -> Ref<'_, Vec<u32>> {
        self.data.borrow()
    }

    pub(crate) fn data_mut(&self) -> RefMut<'_, Vec<u32>> {
        self.data.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &Pixels) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for Pixels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pixels")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Texture contents, stored as ARGB8888.
#[derive(Debug, Default, Clone)]
pub(crate) struct TextureData {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<u32>,
}

impl TextureData {
    /// Convert tightly packed BGRA bytes.
    pub fn from_bgra(width: u32, height: u32, bytes: &[u8]) -> Self {
        let texels = bytes
            .chunks_exact(4)
            .map(|px| u32::from_le_bytes([px[0], px[1], px[2], px[3]]))
            .collect();
        Self {
            width,
            height,
            texels,
        }
    }

    /// Nearest-neighbour lookup with clamping. `t = 0` is the first row.
    fn sample(&self, s: f32, t: f32) -> [f32; 4] {
        if self.width == 0 || self.height == 0 {
            return [0.0; 4];
        }
        let x = ((s * self.width as f32).floor() as i64).clamp(0, self.width as i64 - 1);
        let y = ((t * self.height as f32).floor() as i64).clamp(0, self.height as i64 - 1);
        let Some(texel) = (y as usize)
            .checked_mul(self.width as usize)
            .and_then(|row| self.texels.get(row + x as usize))
        else {
            return [0.0; 4];
        };
        let [b, g, r, a] = texel.to_le_bytes();
        [
            r as f32 / 255.0,
            g as f32 / 255.0,
            b as f32 / 255.0,
            a as f32 / 255.0,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 4],
    pub uv: [f32; 2],
}

pub(crate) enum Shading<'a> {
    Color,
    Texture(&'a TextureData),
}

/// Pack an RGBA color into an XRGB8888 pixel.
pub fn pack_color(rgba: [f32; 4]) -> u32 {
    let [r, g, b, _] = rgba.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u32);
    OPAQUE | (r << 16) | (g << 8) | b
}

fn unpack(pixel: u32) -> [f32; 3] {
    [
        ((pixel >> 16) & 0xff) as f32 / 255.0,
        ((pixel >> 8) & 0xff) as f32 / 255.0,
        (pixel & 0xff) as f32 / 255.0,
    ]
}

/// Source-over blend with straight alpha.
fn blend(dst: u32, src: [f32; 4]) -> u32 {
    let alpha = src[3].clamp(0.0, 1.0);
    if alpha >= 1.0 {
        return pack_color(src);
    }
    let [dr, dg, db] = unpack(dst);
    pack_color([
        src[0] * alpha + dr * (1.0 - alpha),
        src[1] * alpha + dg * (1.0 - alpha),
        src[2] * alpha + db * (1.0 - alpha),
        1.0,
    ])
}

fn edge(a: [f32; 2], b: [f32; 2], p: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

fn lerp<const N: usize>(w: [f32; 3], a: [f32; N], b: [f32; N], c: [f32; N]) -> [f32; N] {
    std::array::from_fn(|i| a[i] * w[0] + b[i] * w[1] + c[i] * w[2])
}

/// Fill the whole target with `color`.
pub(crate) fn clear(target: &Pixels, color: [f32; 4]) {
    let pixel = pack_color(color);
    target.data_mut().fill(pixel);
}

/// Rasterize a triangle list into `target`, restricted to a viewport anchored at the
/// top left of the target.
pub(crate) fn draw_triangles(
    target: &Pixels,
    viewport: (u32, u32),
    vertices: &[Vertex],
    shading: Shading<'_>,
) {
    let (vw, vh) = (viewport.0 as f32, viewport.1 as f32);
    let clip_w = viewport.0.min(target.width()) as i64;
    let clip_h = viewport.1.min(target.height()) as i64;
    let stride = target.width() as usize;
    let mut data = target.data_mut();

    for tri in vertices.chunks_exact(3) {
        let win = tri
            .iter()
            .map(|v| [(v.pos[0] + 1.0) * 0.5 * vw, (1.0 - v.pos[1]) * 0.5 * vh])
            .collect::<Vec<_>>();
        let (a, b, c) = (win[0], win[1], win[2]);

        let area = edge(a, b, c);
        if area.abs() <= f32::EPSILON || !area.is_finite() {
            continue;
        }

        let min_x = (a[0].min(b[0]).min(c[0]).floor() as i64).max(0);
        let max_x = (a[0].max(b[0]).max(c[0]).ceil() as i64).min(clip_w);
        let min_y = (a[1].min(b[1]).min(c[1]).floor() as i64).max(0);
        let max_y = (a[1].max(b[1]).max(c[1]).ceil() as i64).min(clip_h);

        for y in min_y..max_y {
            for x in min_x..max_x {
                let p = [x as f32 + 0.5, y as f32 + 0.5];
                let w = [edge(b, c, p) / area, edge(c, a, p) / area, edge(a, b, p) / area];
                if w.iter().any(|&w| w < 0.0) {
                    continue;
                }

                let src = match shading {
                    Shading::Color => lerp(w, tri[0].color, tri[1].color, tri[2].color),
                    Shading::Texture(tex) => {
                        let [s, t] = lerp(w, tri[0].uv, tri[1].uv, tri[2].uv);
                        tex.sample(s, t)
                    }
                };

                let idx = y as usize * stride + x as usize;
                data[idx] = blend(data[idx], src);
            }
        }
    }
}
