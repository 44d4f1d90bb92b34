use flint::rect::Rect;
use hashbrown::HashMap;
use image::{Pixel, Rgba, RgbaImage};

/// Composition modes understood by the display engine. The wire carries a
/// channel-mask byte; only the two masks below are meaningful for opaque
/// desktop streams.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Composite {
    /// Replace destination pixels.
    Src,
    /// Alpha blend over destination pixels.
    Over,
}

impl Composite {
    /// Maps a wire mask to a composition mode. Masks other than 0xC and 0xE
    /// are not supported; callers treat them as `Over`, the safe fallback
    /// for partially transparent content.
    #[inline]
    pub fn from_mask(mask: u8) -> Option<Composite> {
        match mask {
            0xC => Some(Composite::Src),
            0xE => Some(Composite::Over),
            _ => None,
        }
    }
}

/// A single 2D surface within the display. The default layer (id 0) is the
/// composited output; positive ids are visible overlays and negative ids are
/// invisible, automatically growing scratch buffers.
pub struct Layer {
    width: i32,
    height: i32,
    image: RgbaImage,
    visible: bool,
    autosize: bool,

    modified: bool,
    modified_rect: Rect,

    path_open: bool,
    path_rect: Rect,
    path: Vec<Rect>,
}

impl Layer {
    /// An invisible 0x0 buffer that grows to fit whatever is drawn into it.
    pub fn new_buffer() -> Layer {
        Layer {
            width: 0,
            height: 0,
            image: RgbaImage::new(0, 0),
            visible: false,
            autosize: true,
            modified: false,
            modified_rect: Rect::default(),
            path_open: false,
            path_rect: Rect::default(),
            path: Vec::new(),
        }
    }

    /// A visible layer with fixed initial dimensions.
    pub fn new_visible(width: i32, height: i32) -> Layer {
        let mut layer = Layer::new_buffer();
        layer.width = width.max(0);
        layer.height = height.max(0);
        layer.image = RgbaImage::new(layer.width as u32, layer.height as u32);
        layer.visible = true;
        layer.autosize = false;
        layer
    }

    #[inline]
    pub fn width(&self) -> i32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> i32 {
        self.height
    }

    #[inline]
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    #[inline]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Whether the layer takes part in presentation. Buffers never do.
    #[inline]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    #[inline]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    #[inline]
    pub fn modified_rect(&self) -> Rect {
        self.modified_rect
    }

    /// Clears the modified-region marker, typically after the region has
    /// been flushed to the presentation canvas.
    pub fn reset_modified(&mut self) {
        self.modified = false;
        self.modified_rect = Rect::default();
    }

    fn update_modified(&mut self, mut area: Rect) {
        area.constrain(&self.bounds());
        if area.is_empty() {
            return;
        }
        if self.modified {
            self.modified_rect.extend(&area);
        } else {
            self.modified_rect = area;
            self.modified = true;
        }
    }

    /// Extracts a copy of the given source rectangle, clipped against the
    /// layer bounds. Returns the clipped area alongside its pixels so the
    /// caller can shift the destination by the same amount; `None` when the
    /// rectangle lies entirely outside the layer.
    pub fn extract(&self, x: i32, y: i32, width: i32, height: i32) -> Option<(Rect, RgbaImage)> {
        let mut rect = Rect::new(x, y, width, height);
        rect.constrain(&self.bounds());
        if rect.is_empty() {
            return None;
        }

        let view = image::imageops::crop_imm(
            &self.image,
            rect.x as u32,
            rect.y as u32,
            rect.width as u32,
            rect.height as u32,
        );
        Some((rect, view.to_image()))
    }

    /// Draws a pixel patch at the given position with the requested
    /// composition mode, growing the layer first if it auto-sizes.
    pub fn blit(&mut self, x: i32, y: i32, patch: &RgbaImage, op: Composite) {
        let (pw, ph) = (patch.width() as i32, patch.height() as i32);
        if pw == 0 || ph == 0 {
            return;
        }
        if self.autosize {
            self.fit_rect(x, y, pw, ph);
        }

        let mut target = Rect::new(x, y, pw, ph);
        target.constrain(&self.bounds());
        if target.is_empty() {
            return;
        }

        for ty in target.y..target.bottom() {
            for tx in target.x..target.right() {
                let src = *patch.get_pixel((tx - x) as u32, (ty - y) as u32);
                composite_pixel(self.image.get_pixel_mut(tx as u32, ty as u32), src, op);
            }
        }
        self.update_modified(Rect::new(x, y, pw, ph));
    }

    /// Appends a rectangle to the current path, opening a fresh path first
    /// when none is in progress.
    pub fn rect(&mut self, x: i32, y: i32, width: i32, height: i32) {
        let rect = Rect::new(x, y, width, height);
        if !self.path_open {
            self.path_open = true;
            self.path_rect = rect;
            self.path.clear();
        } else {
            self.path_rect.extend(&rect);
        }
        self.path.push(rect);
    }

    /// Fills the rectangles of the open path with a solid colour, then
    /// closes the path and commits its bounds to the modified region.
    pub fn fill(&mut self, color: Rgba<u8>, op: Composite) {
        let path = std::mem::take(&mut self.path);
        for rect in &path {
            let mut target = *rect;
            target.constrain(&self.bounds());
            if target.is_empty() {
                continue;
            }
            for ty in target.y..target.bottom() {
                for tx in target.x..target.right() {
                    composite_pixel(self.image.get_pixel_mut(tx as u32, ty as u32), color, op);
                }
            }
        }
        self.end_path();
    }

    fn end_path(&mut self) {
        let committed = self.path_rect;
        self.update_modified(committed);
        self.path_open = false;
        self.path_rect = Rect::default();
        self.path.clear();
    }

    /// Resizes the layer, preserving overlapping content.
    pub fn resize(&mut self, width: i32, height: i32) {
        let width = width.max(0);
        let height = height.max(0);
        if width == self.width && height == self.height {
            return;
        }

        let original = self.bounds();
        let mut resized = RgbaImage::new(width as u32, height as u32);
        let keep_w = self.width.min(width) as u32;
        let keep_h = self.height.min(height) as u32;
        for y in 0..keep_h {
            for x in 0..keep_w {
                resized.put_pixel(x, y, *self.image.get_pixel(x, y));
            }
        }

        self.image = resized;
        self.width = width;
        self.height = height;

        let mut area = original;
        area.extend(&self.bounds());
        if self.modified {
            self.modified_rect.extend(&area);
        } else {
            self.modified_rect = area;
            self.modified = true;
        }
    }

    /// Grows the layer to cover the given rectangle.
    fn fit_rect(&mut self, x: i32, y: i32, width: i32, height: i32) {
        let mut fitted = self.bounds();
        fitted.extend(&Rect::new(x, y, width, height));
        self.resize(fitted.right(), fitted.bottom());
    }
}

#[inline]
fn composite_pixel(dst: &mut Rgba<u8>, src: Rgba<u8>, op: Composite) {
    match op {
        Composite::Src => *dst = src,
        Composite::Over => dst.blend(&src),
    }
}

/// The per-connection layer registry. Layers come into existence on first
/// reference: positive ids as visible layers sized to match the default,
/// negative ids as invisible buffers.
pub struct Layers {
    map: HashMap<i32, Layer>,
}

impl Layers {
    pub fn new() -> Layers {
        let mut map = HashMap::new();
        let mut default = Layer::new_buffer();
        default.visible = true;
        map.insert(0, default);
        Layers { map }
    }

    #[inline]
    pub fn default_layer(&self) -> &Layer {
        &self.map[&0]
    }

    #[inline]
    pub fn default_layer_mut(&mut self) -> &mut Layer {
        self.map.get_mut(&0).expect("default layer always exists")
    }

    pub fn get(&mut self, id: i32) -> &mut Layer {
        if !self.map.contains_key(&id) {
            let layer = if id > 0 {
                let d = self.default_layer();
                Layer::new_visible(d.width(), d.height())
            } else {
                Layer::new_buffer()
            };
            self.map.insert(id, layer);
        }
        self.map.get_mut(&id).expect("layer inserted above")
    }

    /// Copies a rectangle between two layers, which may be the same layer.
    /// Clipping against the source bounds is automatic; the destination
    /// shifts along with the clip.
    pub fn copy(
        &mut self,
        src_id: i32,
        src_x: i32,
        src_y: i32,
        src_w: i32,
        src_h: i32,
        dst_id: i32,
        dst_x: i32,
        dst_y: i32,
        op: Composite,
    ) {
        let patch = self.get(src_id).extract(src_x, src_y, src_w, src_h);
        if let Some((area, patch)) = patch {
            self.get(dst_id)
                .blit(dst_x + (area.x - src_x), dst_y + (area.y - src_y), &patch, op);
        }
    }

    /// Invalidates a layer. The vacated area is recorded against the default
    /// layer so dependent composites repaint correctly. The default layer
    /// itself cannot be disposed.
    pub fn dispose(&mut self, id: i32) {
        if id == 0 {
            return;
        }
        if let Some(layer) = self.map.remove(&id) {
            let area = layer.bounds();
            self.default_layer_mut().update_modified(area);
        }
    }

    #[inline]
    pub fn contains(&self, id: i32) -> bool {
        self.map.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(px))
    }

    #[test]
    fn test_composite_from_mask() {
        assert_eq!(Composite::from_mask(0xC), Some(Composite::Src));
        assert_eq!(Composite::from_mask(0xE), Some(Composite::Over));
        assert_eq!(Composite::from_mask(0x3), None);
    }

    #[test]
    fn test_blit_updates_modified_rect() {
        let mut layer = Layer::new_visible(100, 100);
        layer.blit(10, 20, &solid(5, 5, [255, 0, 0, 255]), Composite::Src);
        assert!(layer.is_modified());
        assert_eq!(layer.modified_rect(), Rect::new(10, 20, 5, 5));
        assert_eq!(*layer.image().get_pixel(12, 22), Rgba([255, 0, 0, 255]));

        layer.reset_modified();
        assert!(!layer.is_modified());
    }

    #[test]
    fn test_autosize_buffer_grows() {
        let mut layer = Layer::new_buffer();
        layer.blit(10, 10, &solid(4, 4, [0, 255, 0, 255]), Composite::Src);
        assert_eq!(layer.width(), 14);
        assert_eq!(layer.height(), 14);
        assert_eq!(*layer.image().get_pixel(13, 13), Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn test_fixed_layer_clips() {
        let mut layer = Layer::new_visible(8, 8);
        layer.blit(6, 6, &solid(4, 4, [1, 2, 3, 255]), Composite::Src);
        assert_eq!(layer.width(), 8);
        assert_eq!(*layer.image().get_pixel(7, 7), Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn test_resize_preserves_content() {
        let mut layer = Layer::new_visible(4, 4);
        layer.blit(0, 0, &solid(4, 4, [9, 9, 9, 255]), Composite::Src);
        layer.resize(8, 8);
        assert_eq!(*layer.image().get_pixel(3, 3), Rgba([9, 9, 9, 255]));
        assert_eq!(*layer.image().get_pixel(7, 7), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_path_lifecycle() {
        let mut layer = Layer::new_visible(20, 20);
        layer.rect(2, 2, 4, 4);
        layer.rect(10, 10, 4, 4);
        assert!(layer.path_open);
        assert_eq!(layer.path_rect, Rect::new(2, 2, 12, 12));

        layer.fill(Rgba([0, 0, 255, 255]), Composite::Src);
        assert!(!layer.path_open);
        assert_eq!(*layer.image().get_pixel(3, 3), Rgba([0, 0, 255, 255]));
        assert_eq!(*layer.image().get_pixel(11, 11), Rgba([0, 0, 255, 255]));
        // The gap between the two path rectangles stays untouched.
        assert_eq!(*layer.image().get_pixel(8, 8), Rgba([0, 0, 0, 0]));
        assert_eq!(layer.modified_rect(), Rect::new(2, 2, 12, 12));
    }

    #[test]
    fn test_over_blend() {
        let mut layer = Layer::new_visible(1, 1);
        layer.blit(0, 0, &solid(1, 1, [100, 100, 100, 255]), Composite::Src);
        layer.blit(0, 0, &solid(1, 1, [200, 0, 0, 0]), Composite::Over);
        // A fully transparent source leaves the destination untouched.
        assert_eq!(*layer.image().get_pixel(0, 0), Rgba([100, 100, 100, 255]));
    }

    #[test]
    fn test_registry_classes() {
        let mut layers = Layers::new();
        layers.default_layer_mut().resize(32, 16);

        let visible = layers.get(3);
        assert_eq!(visible.width(), 32);
        assert_eq!(visible.height(), 16);
        assert!(!visible.autosize);

        let buffer = layers.get(-7);
        assert_eq!(buffer.width(), 0);
        assert!(buffer.autosize);
    }

    #[test]
    fn test_dispose_marks_default() {
        let mut layers = Layers::new();
        layers.default_layer_mut().resize(64, 64);
        layers.default_layer_mut().reset_modified();

        layers.get(2).blit(0, 0, &solid(10, 10, [5, 5, 5, 255]), Composite::Src);
        layers.dispose(2);
        assert!(!layers.contains(2));
        assert!(layers.default_layer().is_modified());

        // Disposing the default layer is refused.
        layers.dispose(0);
        assert!(layers.contains(0));
    }

    #[test]
    fn test_copy_between_layers() {
        let mut layers = Layers::new();
        layers.default_layer_mut().resize(16, 16);
        layers
            .get(-1)
            .blit(0, 0, &solid(4, 4, [7, 7, 7, 255]), Composite::Src);

        layers.copy(-1, 0, 0, 4, 4, 0, 6, 6, Composite::Src);
        assert_eq!(*layers.default_layer().image().get_pixel(7, 7), Rgba([7, 7, 7, 255]));

        // Source rectangles reaching outside the source are clipped, not
        // rejected.
        layers.copy(-1, 2, 2, 10, 10, 0, 0, 0, Composite::Src);
        assert_eq!(*layers.default_layer().image().get_pixel(1, 1), Rgba([7, 7, 7, 255]));
    }
}
