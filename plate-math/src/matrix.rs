// SPDX-License-Identifier: MIT
// 4x4 affine color matrix. The fourth column is a translation used for the
// black offset of the dye basis; the fourth row stays (0 0 0 1) for every
// matrix we build, but the inversion is a full Gauss-Jordan so the code does
// not depend on that.

use crate::color::Rgb;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorMatrix {
    /// Row-major: `m[row][col]`.
    pub m: [[f64; 4]; 4],
}

impl Default for ColorMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl ColorMatrix {
    pub const fn identity() -> Self {
        Self {
            m: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// Build from a 3x3 linear part and a translation column.
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        m00: f64, m01: f64, m02: f64, t0: f64,
        m10: f64, m11: f64, m12: f64, t1: f64,
        m20: f64, m21: f64, m22: f64, t2: f64,
    ) -> Self {
        Self {
            m: [
                [m00, m01, m02, t0],
                [m10, m11, m12, t1],
                [m20, m21, m22, t2],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// Uniform channel scaling.
    pub const fn scaling(r: f64, g: f64, b: f64) -> Self {
        Self::new(r, 0.0, 0.0, 0.0, 0.0, g, 0.0, 0.0, 0.0, 0.0, b, 0.0)
    }

    /// Saturation adjustment around the NTSC luma axis. `s = 1` is identity,
    /// `s = 0` collapses to grayscale.
    pub fn saturation(s: f64) -> Self {
        const RW: f64 = 0.3086;
        const GW: f64 = 0.6094;
        const BW: f64 = 0.0820;
        Self::new(
            (1.0 - s) * RW + s, (1.0 - s) * GW, (1.0 - s) * BW, 0.0,
            (1.0 - s) * RW, (1.0 - s) * GW + s, (1.0 - s) * BW, 0.0,
            (1.0 - s) * RW, (1.0 - s) * GW, (1.0 - s) * BW + s, 0.0,
        )
    }

    /// `self * other`: applying the result is applying `other` first.
    pub fn compose(&self, other: &ColorMatrix) -> ColorMatrix {
        let mut out = [[0.0f64; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for k in 0..4 {
                    acc += self.m[i][k] * other.m[k][j];
                }
                *cell = acc;
            }
        }
        ColorMatrix { m: out }
    }

    pub fn apply(&self, c: Rgb) -> Rgb {
        let r = c.red as f64;
        let g = c.green as f64;
        let b = c.blue as f64;
        Rgb {
            red: (self.m[0][0] * r + self.m[0][1] * g + self.m[0][2] * b + self.m[0][3]) as f32,
            green: (self.m[1][0] * r + self.m[1][1] * g + self.m[1][2] * b + self.m[1][3]) as f32,
            blue: (self.m[2][0] * r + self.m[2][1] * g + self.m[2][2] * b + self.m[2][3]) as f32,
        }
    }

    /// Gauss-Jordan inverse. Returns `None` for singular input; the matrices
    /// built by the pipeline are well-conditioned so callers treat that as a
    /// parameter error.
    pub fn invert(&self) -> Option<ColorMatrix> {
        let mut a = self.m;
        let mut inv = ColorMatrix::identity().m;
        for col in 0..4 {
            let mut pivot = col;
            for row in col + 1..4 {
                if a[row][col].abs() > a[pivot][col].abs() {
                    pivot = row;
                }
            }
            if a[pivot][col].abs() < 1e-12 {
                return None;
            }
            a.swap(col, pivot);
            inv.swap(col, pivot);
            let d = a[col][col];
            for j in 0..4 {
                a[col][j] /= d;
                inv[col][j] /= d;
            }
            for row in 0..4 {
                if row == col {
                    continue;
                }
                let f = a[row][col];
                if f == 0.0 {
                    continue;
                }
                for j in 0..4 {
                    a[row][j] -= f * a[col][j];
                    inv[row][j] -= f * inv[col][j];
                }
            }
        }
        Some(ColorMatrix { m: inv })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn invert_roundtrips() {
        let m = ColorMatrix::new(
            0.8, 0.1, 0.05, 0.02,
            0.15, 0.7, 0.1, 0.01,
            0.05, 0.2, 0.85, 0.03,
        );
        let inv = m.invert().unwrap();
        let id = m.compose(&inv);
        for i in 0..4 {
            for j in 0..4 {
                let want = if i == j { 1.0 } else { 0.0 };
                assert!(close(id.m[i][j], want), "at {i},{j}: {}", id.m[i][j]);
            }
        }
    }

    #[test]
    fn singular_is_rejected() {
        let m = ColorMatrix::new(
            1.0, 2.0, 3.0, 0.0,
            2.0, 4.0, 6.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
        );
        assert!(m.invert().is_none());
    }

    #[test]
    fn saturation_identity_and_gray() {
        let id = ColorMatrix::saturation(1.0);
        let c = Rgb::new(0.3, 0.5, 0.7);
        let r = id.apply(c);
        assert!((r.red - 0.3).abs() < 1e-6 && (r.blue - 0.7).abs() < 1e-6);
        let gray = ColorMatrix::saturation(0.0).apply(c);
        assert!((gray.red - gray.green).abs() < 1e-6);
        assert!((gray.green - gray.blue).abs() < 1e-6);
    }

    #[test]
    fn translation_column_offsets() {
        let m = ColorMatrix::new(
            1.0, 0.0, 0.0, 0.1,
            0.0, 1.0, 0.0, 0.2,
            0.0, 0.0, 1.0, 0.3,
        );
        let r = m.apply(Rgb::new(0.0, 0.0, 0.0));
        assert!((r.red - 0.1).abs() < 1e-6);
        assert!((r.green - 0.2).abs() < 1e-6);
        assert!((r.blue - 0.3).abs() < 1e-6);
    }
}
