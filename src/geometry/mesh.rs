//! Deformation mesh for non-rigid scanner warp.
//!
//! A regular grid of displacement vectors covering the image, interpolated
//! bilinearly and composed on top of the affine + radial map. Meshes carry a
//! 64-bit id so analyzer caches can key on them without hashing the grid.

use std::sync::atomic::{AtomicU64, Ordering};

use plate_math::{modf_floor, Vector};

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct Mesh {
    cols: usize,
    rows: usize,
    /// Grid spacing in image pixels.
    step_x: f64,
    step_y: f64,
    /// Row-major `cols * rows` displacements.
    displacements: Vec<Vector>,
    id: u64,
}

impl Mesh {
    /// A zero mesh covering `width × height` image pixels with the given
    /// grid spacing. At least a 2×2 grid is always allocated so bilinear
    /// interpolation never needs a special case.
    pub fn new(width: u32, height: u32, step_x: f64, step_y: f64) -> Self {
        let cols = ((width as f64 / step_x).ceil() as usize + 1).max(2);
        let rows = ((height as f64 / step_y).ceil() as usize + 1).max(2);
        Self {
            cols,
            rows,
            step_x,
            step_y,
            displacements: vec![Vector::default(); cols * rows],
            id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn step(&self) -> (f64, f64) {
        (self.step_x, self.step_y)
    }

    pub fn set(&mut self, col: usize, row: usize, d: Vector) {
        self.displacements[row * self.cols + col] = d;
    }

    pub fn get(&self, col: usize, row: usize) -> Vector {
        self.displacements[row.min(self.rows - 1) * self.cols + col.min(self.cols - 1)]
    }

    /// Bilinear displacement at an image position. Positions outside the
    /// grid clamp to the border cells.
    pub fn displacement(&self, x: f64, y: f64) -> Vector {
        let (cx, fx) = modf_floor(x / self.step_x);
        let (cy, fy) = modf_floor(y / self.step_y);
        let cx = cx.clamp(0, self.cols as i64 - 2) as usize;
        let cy = cy.clamp(0, self.rows as i64 - 2) as usize;
        let fx = fx.clamp(0.0, 1.0);
        let fy = fy.clamp(0.0, 1.0);
        let d00 = self.get(cx, cy);
        let d10 = self.get(cx + 1, cy);
        let d01 = self.get(cx, cy + 1);
        let d11 = self.get(cx + 1, cy + 1);
        let top = d00 * (1.0 - fx) + d10 * fx;
        let bottom = d01 * (1.0 - fx) + d11 * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Largest displacement magnitude, used to bound inverse searches.
    pub fn max_displacement(&self) -> f64 {
        self.displacements
            .iter()
            .map(|d| d.length())
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_mesh_displaces_nothing() {
        let m = Mesh::new(100, 100, 25.0, 25.0);
        let d = m.displacement(40.0, 60.0);
        assert_eq!(d, Vector::default());
    }

    #[test]
    fn bilinear_interpolates_between_nodes() {
        let mut m = Mesh::new(100, 100, 50.0, 50.0);
        m.set(1, 0, Vector::new(2.0, 0.0));
        // Halfway between node (0,0) and node (1,0).
        let d = m.displacement(25.0, 0.0);
        assert!((d.x - 1.0).abs() < 1e-9);
        assert_eq!(d.y, 0.0);
    }

    #[test]
    fn ids_differ() {
        let a = Mesh::new(10, 10, 5.0, 5.0);
        let b = Mesh::new(10, 10, 5.0, 5.0);
        assert_ne!(a.id(), b.id());
    }
}
