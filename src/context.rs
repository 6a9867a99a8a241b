// SPDX-License-Identifier: GPL-3.0-or-later

//! The rendering context.
//!
//! There is exactly one [`Context`] per [`Compositor`][crate::compositor::Compositor].
//! It owns all drawing state: textures, the render attachments created for each
//! framebuffer, the bound target and the viewport. Framebuffers only hold a weak
//! reference to it.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use tracing::{debug, trace};

use crate::{
    backend::ScanoutBuffer,
    error::OutputError,
    render::{self, Pixels, Shading, TextureData, Vertex},
};

/// A 4x4 transform as 16 contiguous floats in row-major order.
///
/// Vertices are transformed as `M * (x, y, 0, 1)`. The context keeps no matrix
/// stack; callers compose and pass their own transforms.
pub type Mat4 = [f32; 16];

pub fn mat4_identity() -> Mat4 {
    let mut m = [0.0; 16];
    m[0] = 1.0;
    m[5] = 1.0;
    m[10] = 1.0;
    m[15] = 1.0;
    m
}

/// An opaque handle to a texture created with [`Context::new_tex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AttachmentId(u64);

#[derive(Debug)]
pub(crate) struct ContextState {
    /// Cleared while the compositor is asleep.
    available: bool,
    active: bool,
    target: Option<AttachmentId>,
    viewport: Option<(u32, u32)>,
    clear_color: [f32; 4],
    textures: HashMap<TextureId, TextureData>,
    attachments: HashMap<AttachmentId, Pixels>,
    next_texture: u32,
    next_attachment: u64,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            available: true,
            active: false,
            target: None,
            viewport: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            textures: HashMap::new(),
            attachments: HashMap::new(),
            next_texture: 1,
            next_attachment: 1,
        }
    }
}

#[derive(Debug)]
pub struct Context {
    inner: Rc<RefCell<ContextState>>,
}

/// A non-owning reference to a [`Context`].
#[derive(Debug, Clone)]
pub(crate) struct WeakContext(Weak<RefCell<ContextState>>);

impl WeakContext {
    pub fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(|inner| Context { inner })
    }
}

fn check_geometry(count: usize, arrays: &[(&str, &[f32], usize)]) -> Result<(), OutputError> {
    if count % 3 != 0 {
        return Err(OutputError::InvalidArgument(format!(
            "vertex count {count} is not a multiple of 3"
        )));
    }
    for &(name, array, components) in arrays {
        let needed = count.checked_mul(components).ok_or_else(|| {
            OutputError::InvalidArgument(format!("vertex count {count} is too large"))
        })?;
        if array.len() < needed {
            return Err(OutputError::InvalidArgument(format!(
                "{name} holds {} floats, need {needed}",
                array.len(),
            )));
        }
    }
    Ok(())
}

fn transform(m: &Mat4, x: f32, y: f32) -> [f32; 2] {
    let tx = m[0] * x + m[1] * y + m[3];
    let ty = m[4] * x + m[5] * y + m[7];
    let tw = m[12] * x + m[13] * y + m[15];
    if tw != 0.0 && tw != 1.0 {
        [tx / tw, ty / tw]
    } else {
        [tx, ty]
    }
}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ContextState::default())),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Rc::downgrade(&self.inner))
    }

    /// Bind this context for drawing.
    ///
    /// Fails with [`OutputError::DeviceUnavailable`] while the compositor is asleep.
    pub fn make_current(&self) -> Result<(), OutputError> {
        let mut state = self.inner.borrow_mut();
        if !state.available {
            return Err(OutputError::DeviceUnavailable);
        }
        state.active = true;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.inner.borrow().active
    }

    pub(crate) fn suspend(&self) {
        let mut state = self.inner.borrow_mut();
        state.available = false;
        state.active = false;
    }

    pub(crate) fn resume(&self) {
        self.inner.borrow_mut().available = true;
    }

    fn ensure_active(&self) -> Result<(), OutputError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(OutputError::NotActive)
        }
    }

    /// Set the size of the area drawn to.
    ///
    /// Needs to be called after every framebuffer switch.
    pub fn viewport(&self, width: u32, height: u32) -> Result<(), OutputError> {
        self.ensure_active()?;
        if width == 0 || height == 0 {
            return Err(OutputError::InvalidArgument(format!(
                "empty viewport {width}x{height}"
            )));
        }
        self.inner.borrow_mut().viewport = Some((width, height));
        Ok(())
    }

    pub fn set_clear_color(&self, rgba: [f32; 4]) {
        self.inner.borrow_mut().clear_color = rgba;
    }

    fn with_target<T>(
        &self,
        draw: impl FnOnce(&Pixels, (u32, u32), &ContextState) -> T,
    ) -> Result<T, OutputError> {
        let state = self.inner.borrow();
        if !state.active {
            return Err(OutputError::NotActive);
        }
        let target = state
            .target
            .and_then(|id| state.attachments.get(&id))
            .ok_or(OutputError::NotActive)?;
        let viewport = state.viewport.ok_or_else(|| {
            OutputError::InvalidArgument("no viewport set for the bound framebuffer".into())
        })?;
        Ok(draw(target, viewport, &state))
    }

    /// Fill the bound framebuffer with the clear color.
    pub fn clear(&self) -> Result<(), OutputError> {
        self.with_target(|target, _, state| render::clear(target, state.clear_color))
    }

    /// Draw `count` vertices as a triangle list with per-vertex colors.
    ///
    /// `vertices` holds 2 floats per vertex, `colors` 4.
    pub fn draw_def(
        &self,
        vertices: &[f32],
        colors: &[f32],
        count: usize,
    ) -> Result<(), OutputError> {
        self.ensure_active()?;
        check_geometry(count, &[("vertices", vertices, 2), ("colors", colors, 4)])?;

        let batch = (0..count)
            .map(|i| Vertex {
                pos: [vertices[i * 2], vertices[i * 2 + 1]],
                color: [
                    colors[i * 4],
                    colors[i * 4 + 1],
                    colors[i * 4 + 2],
                    colors[i * 4 + 3],
                ],
                ..Default::default()
            })
            .collect::<Vec<_>>();

        self.with_target(|target, viewport, _| {
            render::draw_triangles(target, viewport, &batch, Shading::Color)
        })
    }

    /// Draw `count` vertices as a textured triangle list, transformed by `m`.
    ///
    /// `vertices` and `texcoords` hold 2 floats per vertex.
    pub fn draw_tex(
        &self,
        vertices: &[f32],
        texcoords: &[f32],
        count: usize,
        tex: TextureId,
        m: &Mat4,
    ) -> Result<(), OutputError> {
        self.ensure_active()?;
        check_geometry(
            count,
            &[("vertices", vertices, 2), ("texcoords", texcoords, 2)],
        )?;

        let batch = (0..count)
            .map(|i| Vertex {
                pos: transform(m, vertices[i * 2], vertices[i * 2 + 1]),
                uv: [texcoords[i * 2], texcoords[i * 2 + 1]],
                ..Default::default()
            })
            .collect::<Vec<_>>();

        self.with_target(|target, viewport, state| {
            let texture = state.textures.get(&tex).ok_or_else(|| {
                OutputError::InvalidArgument(format!("unknown texture {tex:?}"))
            })?;
            render::draw_triangles(target, viewport, &batch, Shading::Texture(texture));
            Ok(())
        })?
    }

    pub fn new_tex(&self) -> Result<TextureId, OutputError> {
        self.ensure_active()?;
        let mut state = self.inner.borrow_mut();
        let id = TextureId(state.next_texture);
        state.next_texture += 1;
        state.textures.insert(id, TextureData::default());
        trace!(?id, "Created texture");
        Ok(id)
    }

    pub fn free_tex(&self, tex: TextureId) -> Result<(), OutputError> {
        self.ensure_active()?;
        match self.inner.borrow_mut().textures.remove(&tex) {
            Some(_) => Ok(()),
            None => Err(OutputError::InvalidArgument(format!(
                "unknown texture {tex:?}"
            ))),
        }
    }

    /// Upload `width * height` pixels of tightly packed BGRA data into `tex`.
    pub fn set_tex(
        &self,
        tex: TextureId,
        width: u32,
        height: u32,
        buf: &[u8],
    ) -> Result<(), OutputError> {
        self.ensure_active()?;
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|texels| texels.checked_mul(4))
            .ok_or_else(|| {
                OutputError::InvalidArgument(format!("texture size {width}x{height} is too large"))
            })?;
        if buf.len() != expected {
            return Err(OutputError::InvalidArgument(format!(
                "texture data is {} bytes, expected {expected}",
                buf.len()
            )));
        }

        let mut state = self.inner.borrow_mut();
        let Some(texture) = state.textures.get_mut(&tex) else {
            return Err(OutputError::InvalidArgument(format!(
                "unknown texture {tex:?}"
            )));
        };
        *texture = TextureData::from_bgra(width, height, buf);
        Ok(())
    }

    /// Submit pending drawing.
    ///
    /// Drawing is rasterized immediately, so this only checks that the context is usable.
    pub fn flush(&self) -> Result<(), OutputError> {
        self.ensure_active()
    }

    pub fn texture_count(&self) -> usize {
        self.inner.borrow().textures.len()
    }

    pub(crate) fn create_attachment(
        &self,
        buffer: &ScanoutBuffer,
    ) -> Result<AttachmentId, OutputError> {
        let (width, height) = buffer.size();
        let pixels = buffer.pixels();
        if width == 0
            || height == 0
            || pixels.width() != width
            || pixels.height() != height
            || pixels.data().len() != width as usize * height as usize
        {
            return Err(OutputError::Allocation(format!(
                "cannot attach {width}x{height} buffer {:?}",
                buffer.id()
            )));
        }

        let mut state = self.inner.borrow_mut();
        let id = AttachmentId(state.next_attachment);
        state.next_attachment += 1;
        state.attachments.insert(id, pixels.clone());
        debug!(?id, buffer = ?buffer.id(), "Created render attachment");
        Ok(id)
    }

    pub(crate) fn destroy_attachment(&self, id: AttachmentId) {
        let mut state = self.inner.borrow_mut();
        state.attachments.remove(&id);
        if state.target == Some(id) {
            state.target = None;
            state.viewport = None;
        }
    }

    /// Redirect drawing to the given attachment. Resets the viewport.
    pub(crate) fn bind_attachment(&self, id: AttachmentId) -> Result<(), OutputError> {
        self.make_current()?;
        let mut state = self.inner.borrow_mut();
        if !state.attachments.contains_key(&id) {
            return Err(OutputError::InvalidArgument(format!(
                "unknown attachment {id:?}"
            )));
        }
        state.target = Some(id);
        state.viewport = None;
        Ok(())
    }

    /// Retarget drawing from `from` to `to` if `from` is bound, keeping the viewport.
    pub(crate) fn rebind_attachment(&self, from: AttachmentId, to: AttachmentId) {
        let mut state = self.inner.borrow_mut();
        if state.target == Some(from) && state.attachments.contains_key(&to) {
            state.target = Some(to);
        }
    }

    pub(crate) fn is_bound(&self, id: AttachmentId) -> bool {
        self.inner.borrow().target == Some(id)
    }

    pub(crate) fn attachment_count(&self) -> usize {
        self.inner.borrow().attachments.len()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::backend::{BufferId, ScanoutBuffer};

    fn bound_context(width: u32, height: u32) -> (Context, ScanoutBuffer) {
        let ctx = Context::new();
        let buffer = ScanoutBuffer::new(BufferId(1), width, height);
        let id = ctx.create_attachment(&buffer).unwrap();
        ctx.bind_attachment(id).unwrap();
        (ctx, buffer)
    }

    #[test]
    fn operations_require_an_active_context() {
        let ctx = Context::new();
        assert!(!ctx.is_active());
        assert_matches!(ctx.new_tex(), Err(OutputError::NotActive));
        assert_matches!(ctx.viewport(10, 10), Err(OutputError::NotActive));
        assert_matches!(ctx.flush(), Err(OutputError::NotActive));

        ctx.make_current().unwrap();
        assert!(ctx.is_active());
        assert!(ctx.flush().is_ok());
    }

    #[test]
    fn suspended_context_cannot_be_made_current() {
        let ctx = Context::new();
        ctx.make_current().unwrap();
        ctx.suspend();

        assert!(!ctx.is_active());
        assert_matches!(ctx.make_current(), Err(OutputError::DeviceUnavailable));

        ctx.resume();
        assert!(ctx.make_current().is_ok());
    }

    #[test]
    fn drawing_needs_a_viewport_after_binding() {
        let (ctx, buffer) = bound_context(4, 4);
        assert_matches!(ctx.clear(), Err(OutputError::InvalidArgument(_)));

        ctx.set_clear_color([0.0, 0.0, 1.0, 1.0]);
        ctx.viewport(4, 4).unwrap();
        ctx.clear().unwrap();
        assert_eq!(buffer.pixels().get(2, 2), Some(0xff00_00ff));
    }

    #[test]
    fn draw_def_rejects_short_arrays() {
        let (ctx, _buffer) = bound_context(4, 4);
        ctx.viewport(4, 4).unwrap();

        let vertices = [-1.0, -1.0, 1.0, -1.0, 0.0, 1.0];
        assert_matches!(
            ctx.draw_def(&vertices, &[1.0; 8], 3),
            Err(OutputError::InvalidArgument(_))
        );
        assert_matches!(
            ctx.draw_def(&vertices, &[1.0; 12], 2),
            Err(OutputError::InvalidArgument(_))
        );
        assert!(ctx.draw_def(&vertices, &[1.0; 12], 3).is_ok());
    }

    #[test]
    fn huge_vertex_counts_are_invalid() {
        let (ctx, _buffer) = bound_context(4, 4);
        ctx.viewport(4, 4).unwrap();

        let count = usize::MAX - usize::MAX % 3;
        assert_matches!(
            ctx.draw_def(&[], &[], count),
            Err(OutputError::InvalidArgument(_))
        );
        let tex = ctx.new_tex().unwrap();
        assert_matches!(
            ctx.draw_tex(&[], &[], count, tex, &mat4_identity()),
            Err(OutputError::InvalidArgument(_))
        );
    }

    #[test]
    fn huge_textures_are_invalid() {
        let (ctx, buffer) = bound_context(2, 2);
        ctx.viewport(2, 2).unwrap();
        let tex = ctx.new_tex().unwrap();

        assert_matches!(
            ctx.set_tex(tex, u32::MAX, u32::MAX, &[]),
            Err(OutputError::InvalidArgument(_))
        );
        assert_matches!(
            ctx.set_tex(tex, 1 << 31, 1 << 31, &[]),
            Err(OutputError::InvalidArgument(_))
        );

        // The texture is left empty and draws nothing.
        ctx.clear().unwrap();
        let vertices = [-1.0, -1.0, 1.0, -1.0, 1.0, 1.0];
        ctx.draw_tex(&vertices, &[0.0; 6], 3, tex, &mat4_identity())
            .unwrap();
        assert!(buffer.pixels().data().iter().all(|&px| px == 0xff00_0000));
    }

    #[test]
    fn texture_lifecycle() {
        let (ctx, buffer) = bound_context(2, 2);
        ctx.viewport(2, 2).unwrap();

        let tex = ctx.new_tex().unwrap();
        assert_matches!(
            ctx.set_tex(tex, 1, 1, &[0, 0, 0]),
            Err(OutputError::InvalidArgument(_))
        );
        ctx.set_tex(tex, 1, 1, &[0, 255, 0, 255]).unwrap();

        let vertices = [-1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, 1.0];
        let texcoords = [0.0; 12];
        ctx.draw_tex(&vertices, &texcoords, 6, tex, &mat4_identity())
            .unwrap();
        assert!(buffer.pixels().data().iter().all(|&px| px == 0xff00_ff00));

        ctx.free_tex(tex).unwrap();
        assert_eq!(ctx.texture_count(), 0);
        assert_matches!(
            ctx.draw_tex(&vertices, &texcoords, 6, tex, &mat4_identity()),
            Err(OutputError::InvalidArgument(_))
        );
        assert_matches!(ctx.free_tex(tex), Err(OutputError::InvalidArgument(_)));
    }

    #[test]
    fn transform_moves_geometry() {
        let (ctx, buffer) = bound_context(4, 4);
        ctx.viewport(4, 4).unwrap();
        let tex = ctx.new_tex().unwrap();
        ctx.set_tex(tex, 1, 1, &[255, 255, 255, 255]).unwrap();

        // Scale the full-screen quad down to the left half.
        let mut m = mat4_identity();
        m[0] = 0.5;
        m[3] = -0.5;

        let vertices = [-1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, 1.0];
        ctx.draw_tex(&vertices, &[0.0; 12], 6, tex, &m).unwrap();

        assert_eq!(buffer.pixels().get(0, 1), Some(0xffff_ffff));
        assert_eq!(buffer.pixels().get(3, 1), Some(0xff00_0000));
    }

    #[test]
    fn destroying_the_bound_attachment_unbinds_it() {
        let ctx = Context::new();
        let buffer = ScanoutBuffer::new(BufferId(7), 2, 2);
        let id = ctx.create_attachment(&buffer).unwrap();
        ctx.bind_attachment(id).unwrap();
        ctx.viewport(2, 2).unwrap();

        ctx.destroy_attachment(id);
        assert!(!ctx.is_bound(id));
        assert_matches!(ctx.clear(), Err(OutputError::NotActive));
    }

    #[test]
    fn empty_buffers_cannot_be_attached() {
        let ctx = Context::new();
        let buffer = ScanoutBuffer::new(BufferId(1), 0, 10);
        assert_matches!(
            ctx.create_attachment(&buffer),
            Err(OutputError::Allocation(_))
        );
    }
}
