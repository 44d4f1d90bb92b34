use crate::layer::{Composite, Layer, Layers};
use crate::stream::ImageError;
use arc_swap::ArcSwap;
use flint::ident;
use flint::logging::{self, debug, warn, Logger};
use flint::rect::Rect;
use flint::time::timestamp_nanos;
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A deferred layer mutation. The server batches drawing instructions
/// between sync fences; presenting in between would tear frames, so
/// everything except cursor movement is queued and applied on `flush`.
struct Task {
    name: &'static str,
    uuid: String,
    action: Box<dyn FnOnce(&mut State) -> Result<(), ImageError> + Send>,
}

struct State {
    layers: Layers,
    cursor: Layer,
    cursor_hotspot: (i32, i32),
    cursor_pos: (i32, i32),
    canvas: RgbaImage,
    tasks: Vec<Task>,
}

/// The task-queued compositor consuming streamed draw instructions and
/// presenting a consistent snapshot image.
///
/// All mutations are driven from the client's dispatch loop plus the
/// synchronous cursor path; snapshot readers never take the state lock.
pub struct Display {
    state: Mutex<State>,
    snapshot: ArcSwap<RgbaImage>,
    last_update: AtomicI64,
    log: Logger,
}

impl Display {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Display {
        Display {
            state: Mutex::new(State {
                layers: Layers::new(),
                cursor: Layer::new_buffer(),
                cursor_hotspot: (0, 0),
                cursor_pos: (0, 0),
                canvas: RgbaImage::new(0, 0),
                tasks: Vec::new(),
            }),
            snapshot: ArcSwap::from_pointee(RgbaImage::new(0, 0)),
            last_update: AtomicI64::new(0),
            log: logging::child(log),
        }
    }

    /// Returns the latest published snapshot together with its last-update
    /// timestamp (unix nanoseconds).
    pub fn screen(&self) -> (Arc<RgbaImage>, i64) {
        (
            self.snapshot.load_full(),
            self.last_update.load(Ordering::Acquire),
        )
    }

    fn schedule<F>(&self, name: &'static str, action: F)
    where
        F: FnOnce(&mut State) -> Result<(), ImageError> + Send + 'static,
    {
        let mut state = self.state.lock();
        let task = Task {
            name,
            uuid: ident::new_id(""),
            action: Box::new(action),
        };
        debug!(self.log, "task scheduled";
            "name" => task.name, "uuid" => %task.uuid, "pending" => state.tasks.len() + 1);
        state.tasks.push(task);
    }

    /// Schedules a copy between two layers.
    pub fn copy(
        &self,
        src_id: i32,
        src_x: i32,
        src_y: i32,
        src_w: i32,
        src_h: i32,
        mask: u8,
        dst_id: i32,
        dst_x: i32,
        dst_y: i32,
    ) {
        let op = self.composite(mask);
        self.schedule("copy", move |state| {
            state
                .layers
                .copy(src_id, src_x, src_y, src_w, src_h, dst_id, dst_x, dst_y, op);
            Ok(())
        });
    }

    /// Schedules a solid fill of the named layer's open path.
    pub fn fill(&self, layer_id: i32, r: u8, g: u8, b: u8, a: u8, mask: u8) {
        let op = self.composite(mask);
        self.schedule("fill", move |state| {
            state.layers.get(layer_id).fill(Rgba([r, g, b, a]), op);
            Ok(())
        });
    }

    /// Schedules a path append on the named layer.
    pub fn rect(&self, layer_id: i32, x: i32, y: i32, width: i32, height: i32) {
        self.schedule("rect", move |state| {
            state.layers.get(layer_id).rect(x, y, width, height);
            Ok(())
        });
    }

    /// Schedules drawing a decoded image. Decode failures surface when the
    /// task runs: the task is skipped and logged, the rest of the frame
    /// stays usable.
    pub fn draw(&self, layer_id: i32, x: i32, y: i32, mask: u8, img: Result<RgbaImage, ImageError>) {
        let op = self.composite(mask);
        self.schedule("draw", move |state| {
            let img = img?;
            state.layers.get(layer_id).blit(x, y, &img, op);
            Ok(())
        });
    }

    /// Schedules a resize of the named layer. Resizing the default layer
    /// also re-allocates the presentation canvas.
    pub fn resize(&self, layer_id: i32, width: i32, height: i32) {
        self.schedule("resize", move |state| {
            state.layers.get(layer_id).resize(width, height);
            if layer_id == 0 {
                let layer = state.layers.default_layer();
                let mut canvas = RgbaImage::new(layer.width() as u32, layer.height() as u32);
                blit_canvas(&mut canvas, 0, 0, layer.image(), Composite::Src);
                state.canvas = canvas;
            }
            Ok(())
        });
    }

    /// Schedules the removal of a layer.
    pub fn dispose(&self, layer_id: i32) {
        self.schedule("dispose", move |state| {
            state.layers.dispose(layer_id);
            Ok(())
        });
    }

    /// Schedules replacing the pointer cursor from a source layer rectangle.
    pub fn set_cursor(
        &self,
        hotspot_x: i32,
        hotspot_y: i32,
        src_id: i32,
        src_x: i32,
        src_y: i32,
        src_w: i32,
        src_h: i32,
    ) {
        self.schedule("cursor", move |state| {
            state.hide_cursor();

            let patch = state.layers.get(src_id).extract(src_x, src_y, src_w, src_h);
            state.cursor.resize(src_w, src_h);
            if let Some((area, patch)) = patch {
                state.cursor
                    .blit(area.x - src_x, area.y - src_y, &patch, Composite::Src);
            }
            state.cursor_hotspot = (hotspot_x, hotspot_y);

            let (x, y) = state.cursor_origin();
            blit_canvas(&mut state.canvas, x, y, state.cursor.image(), Composite::Over);
            Ok(())
        });
    }

    /// Applies all pending tasks in order and publishes the resulting
    /// snapshot. Invoked on receipt of a sync fence.
    pub fn flush(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.tasks.is_empty() {
            return;
        }

        let tasks = std::mem::take(&mut state.tasks);
        debug!(self.log, "processing pending tasks"; "count" => tasks.len());

        let mut updated = false;
        for task in tasks {
            if let Err(e) = (task.action)(state) {
                // An incorrect pixel region beats losing the whole frame.
                warn!(self.log, "task skipped, screen state may be stale";
                    "name" => task.name, "uuid" => %task.uuid, "error" => %e);
                continue;
            }
            updated = true;

            let layer = state.layers.default_layer();
            if !layer.is_modified() {
                continue;
            }
            let area = layer.modified_rect();
            if let Some((area, patch)) = layer.extract(area.x, area.y, area.width, area.height) {
                blit_canvas(&mut state.canvas, area.x, area.y, &patch, Composite::Src);
            }
            state.layers.default_layer_mut().reset_modified();
        }

        if updated {
            self.publish(state);
        }
    }

    /// Moves the pointer cursor. This path is synchronous rather than
    /// queued: it tracks a high-frequency pointer and must not wait for the
    /// next sync fence.
    pub fn move_cursor(&self, x: i32, y: i32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.hide_cursor();
        state.cursor_pos = (x, y);
        let (ox, oy) = state.cursor_origin();
        blit_canvas(&mut state.canvas, ox, oy, state.cursor.image(), Composite::Over);
        self.publish(state);
    }

    /// Number of queued, not yet flushed tasks.
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    fn publish(&self, state: &State) {
        self.snapshot.store(Arc::new(state.canvas.clone()));
        self.last_update.store(timestamp_nanos(), Ordering::Release);
    }

    fn composite(&self, mask: u8) -> Composite {
        match Composite::from_mask(mask) {
            Some(op) => op,
            None => {
                debug!(self.log, "unsupported channel mask, falling back to over"; "mask" => mask);
                Composite::Over
            }
        }
    }
}

impl State {
    /// Top-left corner of the cursor image: the pointer position offset by
    /// the cursor hotspot.
    fn cursor_origin(&self) -> (i32, i32) {
        (
            self.cursor_pos.0 - self.cursor_hotspot.0,
            self.cursor_pos.1 - self.cursor_hotspot.1,
        )
    }

    /// Undoes the cursor overdraw by restoring the underlying default-layer
    /// region.
    fn hide_cursor(&mut self) {
        let (x, y) = self.cursor_origin();
        let (w, h) = (self.cursor.width(), self.cursor.height());
        if w == 0 || h == 0 {
            return;
        }
        if let Some((area, patch)) = self.layers.default_layer().extract(x, y, w, h) {
            blit_canvas(&mut self.canvas, area.x, area.y, &patch, Composite::Src);
        }
    }
}

/// Draws a patch onto the canvas, clipping against the canvas bounds.
fn blit_canvas(canvas: &mut RgbaImage, x: i32, y: i32, patch: &RgbaImage, op: Composite) {
    use image::Pixel;

    let (cw, ch) = (canvas.width() as i32, canvas.height() as i32);
    let mut target = Rect::new(x, y, patch.width() as i32, patch.height() as i32);
    target.constrain(&Rect::new(0, 0, cw, ch));
    if target.is_empty() {
        return;
    }

    for ty in target.y..target.bottom() {
        for tx in target.x..target.right() {
            let src = *patch.get_pixel((tx - x) as u32, (ty - y) as u32);
            let dst = canvas.get_pixel_mut(tx as u32, ty as u32);
            match op {
                Composite::Src => *dst = src,
                Composite::Over => dst.blend(&src),
            }
        }
    }
}
