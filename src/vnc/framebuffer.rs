//! Shared framebuffer store.
//!
//! One RGB32 pixel buffer per connection, guarded by a read-write lock.
//! The buffer itself lives in an `Arc` so snapshots handed to consumers
//! stay valid across re-initialization: mutation goes through
//! copy-on-write, re-allocation just swaps the `Arc` while outstanding
//! snapshots keep the old allocation alive.

use std::sync::{Arc, Mutex, RwLock};

use crate::vnc::encoding::DecodedRect;

const BYTES_PER_PIXEL: usize = 4;

/// A cheap snapshot of the framebuffer (or of the scaled mirror).
///
/// Cloning shares the underlying allocation.
#[derive(Debug, Clone)]
pub struct FramebufferImage {
    width: u16,
    height: u16,
    data: Arc<Vec<u8>>,
}

impl FramebufferImage {
    pub fn empty() -> Self {
        Self { width: 0, height: 0, data: Arc::new(Vec::new()) }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Raw pixel bytes, `width * height * 4` of them.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct Buffer {
    width: u16,
    height: u16,
    data: Arc<Vec<u8>>,
}

#[derive(Default)]
struct ScaledState {
    target: Option<(u16, u16)>,
    image: Option<FramebufferImage>,
    dirty: bool,
}

/// Thread-safe framebuffer with an optional smooth-scaled mirror.
pub struct FramebufferStore {
    buffer: RwLock<Buffer>,
    scaled: Mutex<ScaledState>,
}

impl FramebufferStore {
    pub fn new() -> Self {
        Self {
            buffer: RwLock::new(Buffer {
                width: 0,
                height: 0,
                data: Arc::new(Vec::new()),
            }),
            scaled: Mutex::new(ScaledState::default()),
        }
    }

    /// Allocate a zero-filled buffer for the given dimensions and publish
    /// them. Outstanding snapshots keep referencing the old allocation.
    pub fn initialize(&self, width: u16, height: u16) {
        let size = width as usize * height as usize * BYTES_PER_PIXEL;
        let mut buffer = self.buffer.write().unwrap();
        buffer.width = width;
        buffer.height = height;
        buffer.data = Arc::new(vec![0u8; size]);
    }

    /// Current dimensions (0,0 before the first initialization).
    pub fn dimensions(&self) -> (u16, u16) {
        let buffer = self.buffer.read().unwrap();
        (buffer.width, buffer.height)
    }

    pub fn is_allocated(&self) -> bool {
        !self.buffer.read().unwrap().data.is_empty()
    }

    /// Snapshot of the current buffer; shares the allocation.
    pub fn image(&self) -> FramebufferImage {
        let buffer = self.buffer.read().unwrap();
        FramebufferImage {
            width: buffer.width,
            height: buffer.height,
            data: buffer.data.clone(),
        }
    }

    /// Blit a decoded rectangle into the buffer, clamped to its bounds.
    pub(crate) fn blit(&self, rect: &DecodedRect) {
        let mut buffer = self.buffer.write().unwrap();
        let fb_w = buffer.width as usize;
        let fb_h = buffer.height as usize;
        let rect_w = rect.width as usize;
        let data = Arc::make_mut(&mut buffer.data);

        for row in 0..rect.height as usize {
            let dst_y = rect.y as usize + row;
            if dst_y >= fb_h {
                break;
            }
            let copy_w = rect_w.min(fb_w.saturating_sub(rect.x as usize));
            if copy_w == 0 {
                break;
            }
            let src = row * rect_w * BYTES_PER_PIXEL;
            let dst = (dst_y * fb_w + rect.x as usize) * BYTES_PER_PIXEL;
            let len = copy_w * BYTES_PER_PIXEL;
            if src + len <= rect.pixels.len() && dst + len <= data.len() {
                data[dst..dst + len].copy_from_slice(&rect.pixels[src..src + len]);
            }
        }
    }

    /// Move a region already present in the buffer (CopyRect).
    pub(crate) fn copy_rect(&self, src_x: u16, src_y: u16, x: u16, y: u16, width: u16, height: u16) {
        let mut buffer = self.buffer.write().unwrap();
        let fb_w = buffer.width as usize;
        let data = Arc::make_mut(&mut buffer.data);

        // Row order depends on the copy direction to avoid clobbering
        // overlapping regions.
        let rows: Vec<usize> = if src_y >= y {
            (0..height as usize).collect()
        } else {
            (0..height as usize).rev().collect()
        };
        for row in rows {
            let src = ((src_y as usize + row) * fb_w + src_x as usize) * BYTES_PER_PIXEL;
            let dst = ((y as usize + row) * fb_w + x as usize) * BYTES_PER_PIXEL;
            let len = width as usize * BYTES_PER_PIXEL;
            if src + len <= data.len() && dst + len <= data.len() {
                data.copy_within(src..src + len, dst);
            }
        }
    }

    // ── Scaled mirror ───────────────────────────────────────────────

    /// Set or clear the scaling target. Changing it invalidates the
    /// cached mirror.
    pub fn set_scaled_size(&self, target: Option<(u16, u16)>) {
        let mut scaled = self.scaled.lock().unwrap();
        if scaled.target != target {
            scaled.target = target;
            scaled.image = None;
            scaled.dirty = true;
        }
    }

    /// Last computed scaled mirror, if any.
    pub fn scaled_image(&self) -> Option<FramebufferImage> {
        self.scaled.lock().unwrap().image.clone()
    }

    /// Flag the mirror stale; the next [`rescale`](Self::rescale)
    /// recomputes it.
    pub(crate) fn mark_dirty(&self) {
        self.scaled.lock().unwrap().dirty = true;
    }

    /// Drop the mirror and its target.
    pub(crate) fn clear_scaled(&self) {
        let mut scaled = self.scaled.lock().unwrap();
        scaled.image = None;
        scaled.target = None;
        scaled.dirty = false;
    }

    /// Recompute the scaled mirror if a target is set, the buffer is
    /// valid and an update arrived since the last rescale.
    pub fn rescale(&self) {
        let mut scaled = self.scaled.lock().unwrap();
        let (target_w, target_h) = match scaled.target {
            Some(t) if scaled.dirty => t,
            _ => return,
        };

        let source = self.image();
        if source.is_empty() || target_w == 0 || target_h == 0 {
            return;
        }

        let data = scale_bilinear(
            source.data(),
            source.width() as usize,
            source.height() as usize,
            target_w as usize,
            target_h as usize,
        );
        scaled.image = Some(FramebufferImage {
            width: target_w,
            height: target_h,
            data: Arc::new(data),
        });
        scaled.dirty = false;
    }
}

impl Default for FramebufferStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Bilinear up/down scaling of a 4-byte-per-pixel buffer.
fn scale_bilinear(src: &[u8], sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<u8> {
    let mut out = vec![0u8; dw * dh * BYTES_PER_PIXEL];
    if sw == 0 || sh == 0 {
        return out;
    }

    let x_ratio = (sw.max(1) - 1) as f32 / dw.max(1) as f32;
    let y_ratio = (sh.max(1) - 1) as f32 / dh.max(1) as f32;

    for dy in 0..dh {
        let fy = dy as f32 * y_ratio;
        let y0 = fy as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let wy = fy - y0 as f32;

        for dx in 0..dw {
            let fx = dx as f32 * x_ratio;
            let x0 = fx as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let wx = fx - x0 as f32;

            let dst = (dy * dw + dx) * BYTES_PER_PIXEL;
            for channel in 0..BYTES_PER_PIXEL {
                let p00 = src[(y0 * sw + x0) * BYTES_PER_PIXEL + channel] as f32;
                let p01 = src[(y0 * sw + x1) * BYTES_PER_PIXEL + channel] as f32;
                let p10 = src[(y1 * sw + x0) * BYTES_PER_PIXEL + channel] as f32;
                let p11 = src[(y1 * sw + x1) * BYTES_PER_PIXEL + channel] as f32;
                let top = p00 + (p01 - p00) * wx;
                let bottom = p10 + (p11 - p10) * wx;
                out[dst + channel] = (top + (bottom - top) * wy).round() as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: u16, y: u16, w: u16, h: u16, pixel: [u8; 4]) -> DecodedRect {
        let mut pixels = Vec::new();
        for _ in 0..w as usize * h as usize {
            pixels.extend_from_slice(&pixel);
        }
        DecodedRect { x, y, width: w, height: h, pixels }
    }

    #[test]
    fn starts_unallocated() {
        let store = FramebufferStore::new();
        assert!(!store.is_allocated());
        assert_eq!(store.dimensions(), (0, 0));
        assert!(store.image().is_empty());
    }

    #[test]
    fn initialize_allocates_zeroed() {
        let store = FramebufferStore::new();
        store.initialize(4, 3);
        assert!(store.is_allocated());
        assert_eq!(store.dimensions(), (4, 3));
        let img = store.image();
        assert_eq!(img.data().len(), 4 * 3 * 4);
        assert!(img.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn snapshot_survives_reinitialization() {
        let store = FramebufferStore::new();
        store.initialize(2, 2);
        store.blit(&rect(0, 0, 2, 2, [9, 9, 9, 9]));
        let before = store.image();

        store.initialize(8, 8);

        // The old snapshot still shows the old contents and size.
        assert_eq!((before.width(), before.height()), (2, 2));
        assert!(before.data().iter().all(|b| *b == 9));
        // And the store shows the new ones.
        assert_eq!(store.dimensions(), (8, 8));
        assert!(store.image().data().iter().all(|b| *b == 0));
    }

    #[test]
    fn snapshot_is_isolated_from_later_blits() {
        let store = FramebufferStore::new();
        store.initialize(2, 1);
        let snapshot = store.image();
        store.blit(&rect(0, 0, 2, 1, [5, 5, 5, 5]));
        assert!(snapshot.data().iter().all(|b| *b == 0));
        assert!(store.image().data().iter().all(|b| *b == 5));
    }

    #[test]
    fn blit_respects_offset() {
        let store = FramebufferStore::new();
        store.initialize(4, 4);
        store.blit(&rect(1, 2, 2, 1, [7, 7, 7, 7]));
        let img = store.image();
        let idx = (2 * 4 + 1) * 4;
        assert_eq!(&img.data()[idx..idx + 8], &[7; 8]);
        assert_eq!(&img.data()[0..4], &[0; 4]);
    }

    #[test]
    fn blit_clamps_out_of_bounds() {
        let store = FramebufferStore::new();
        store.initialize(2, 2);
        // Rect hangs off the right/bottom edge; must not panic.
        store.blit(&rect(1, 1, 4, 4, [3, 3, 3, 3]));
        let img = store.image();
        let idx = (1 * 2 + 1) * 4;
        assert_eq!(&img.data()[idx..idx + 4], &[3; 4]);
    }

    #[test]
    fn copy_rect_moves_pixels() {
        let store = FramebufferStore::new();
        store.initialize(4, 1);
        store.blit(&rect(0, 0, 1, 1, [1, 2, 3, 4]));
        store.copy_rect(0, 0, 2, 0, 1, 1);
        let img = store.image();
        assert_eq!(&img.data()[2 * 4..3 * 4], &[1, 2, 3, 4]);
    }

    #[test]
    fn copy_rect_overlapping_downward() {
        let store = FramebufferStore::new();
        store.initialize(1, 3);
        store.blit(&rect(0, 0, 1, 2, [8, 8, 8, 8]));
        // shift the two rows down by one
        store.copy_rect(0, 0, 0, 1, 1, 2);
        let img = store.image();
        assert_eq!(&img.data()[4..8], &[8; 4]);
        assert_eq!(&img.data()[8..12], &[8; 4]);
    }

    // ── Scaled mirror ───────────────────────────────────────────────

    #[test]
    fn rescale_requires_target_and_dirty() {
        let store = FramebufferStore::new();
        store.initialize(4, 4);
        store.mark_dirty();
        store.rescale();
        assert!(store.scaled_image().is_none()); // no target

        store.set_scaled_size(Some((2, 2)));
        store.rescale();
        let scaled = store.scaled_image().unwrap();
        assert_eq!((scaled.width(), scaled.height()), (2, 2));
        assert_eq!(scaled.data().len(), 2 * 2 * 4);
    }

    #[test]
    fn rescale_is_gated_by_dirty_flag() {
        let store = FramebufferStore::new();
        store.initialize(4, 4);
        store.set_scaled_size(Some((2, 2)));
        store.rescale();
        let first = store.scaled_image().unwrap();

        store.blit(&rect(0, 0, 4, 4, [200, 200, 200, 0]));
        store.rescale(); // not dirty, keeps the stale mirror
        assert!(store.scaled_image().unwrap().data().iter().all(|b| *b == 0));

        store.mark_dirty();
        store.rescale();
        let second = store.scaled_image().unwrap();
        assert_ne!(first.data(), second.data());
    }

    #[test]
    fn clear_scaled_drops_mirror() {
        let store = FramebufferStore::new();
        store.initialize(4, 4);
        store.set_scaled_size(Some((2, 2)));
        store.mark_dirty();
        store.rescale();
        assert!(store.scaled_image().is_some());
        store.clear_scaled();
        assert!(store.scaled_image().is_none());
    }

    #[test]
    fn bilinear_uniform_source_stays_uniform() {
        let src = vec![100u8; 4 * 4 * 4];
        let out = scale_bilinear(&src, 4, 4, 2, 2);
        assert!(out.iter().all(|b| *b == 100));
        let up = scale_bilinear(&src, 4, 4, 8, 8);
        assert!(up.iter().all(|b| *b == 100));
    }

    #[test]
    fn bilinear_interpolates_between_extremes() {
        // 2x1 black/white; a 3-wide scale has a mid pixel in between.
        let mut src = vec![0u8; 8];
        src[4..8].copy_from_slice(&[255; 4]);
        let out = scale_bilinear(&src, 2, 1, 3, 1);
        assert_eq!(out[0], 0);
        assert!(out[4] > 0 && out[4] < 255);
    }
}
