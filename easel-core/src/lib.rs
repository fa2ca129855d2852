//! # easel-core - editor-side data model for the Easel whiteboard
//!
//! Everything the drawing editor exposes to the collaboration layer:
//!
//! - [`record`] - drawable records (shapes, bindings, assets) and their ids
//! - [`diff`] - immutable change batches (`added` / `updated` / `removed`)
//! - [`store`] - the [`EditorStore`] seam plus an in-memory [`RecordStore`]
//!
//! The store tags every change batch with a [`ChangeSource`] so that
//! listeners can tell user edits apart from merged remote edits.

use serde::{Deserialize, Serialize};

pub mod diff;
pub mod record;
pub mod store;

pub use diff::RecordsDiff;
pub use record::{Record, RecordId, RecordKind};
pub use store::{
    ChangeSource, EditorStore, ListenerId, RecordStore, RemoteTransaction, StoreChange,
    StoreError, StoreListener,
};

/// 2D point. Used for both screen and page coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Viewport camera. `x`/`y` is the page offset, `z` the zoom factor.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Camera {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for Camera {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, z: 1.0 }
    }
}

impl Camera {
    /// Convert a screen-space point to page space.
    pub fn screen_to_page(&self, point: Vec2) -> Vec2 {
        let z = if self.z > 0.0 { self.z } else { 1.0 };
        Vec2 {
            x: point.x / z - self.x,
            y: point.y / z - self.y,
        }
    }

    /// Convert a page-space point back to screen space.
    pub fn page_to_screen(&self, point: Vec2) -> Vec2 {
        Vec2 {
            x: (point.x + self.x) * self.z,
            y: (point.y + self.y) * self.z,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_camera_is_identity() {
        let camera = Camera::default();
        let p = camera.screen_to_page(Vec2::new(120.0, 45.5));
        assert_eq!(p, Vec2::new(120.0, 45.5));
    }

    #[test]
    fn test_screen_to_page_applies_zoom_and_offset() {
        let camera = Camera { x: 10.0, y: -20.0, z: 2.0 };
        let p = camera.screen_to_page(Vec2::new(100.0, 100.0));
        assert_eq!(p, Vec2::new(40.0, 70.0));

        let back = camera.page_to_screen(p);
        assert_eq!(back, Vec2::new(100.0, 100.0));
    }

    #[test]
    fn test_zero_zoom_does_not_divide_by_zero() {
        let camera = Camera { x: 0.0, y: 0.0, z: 0.0 };
        let p = camera.screen_to_page(Vec2::new(5.0, 5.0));
        assert!(p.x.is_finite() && p.y.is_finite());
    }
}
