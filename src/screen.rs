//! One-period screen tiles.
//!
//! A [`Screen`] holds one period of the color screen as a 128×128 grid of
//! `(mult, add)` RGB pairs: given an unadjusted luminosity `l` at in-tile
//! position `(ix, iy)`, the rendered color is `l * mult + add`. An empty
//! tile renders the source image unchanged, which is what the original and
//! preview render types rely on.
//!
//! Tiles are immutable once built and shared by reference through the
//! process-wide screen cache; callers never construct them ad hoc in hot
//! paths.

use std::sync::atomic::{AtomicU64, Ordering};

use plate_math::Rgb;

use crate::{CoreError, CoreResult};

/// Supported screen geometries. `Random` marks "no regular screen" and is
/// what parameters carry before detection succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ScreenType {
    Paget,
    Thames,
    Finlay,
    #[default]
    Dufay,
    WarnerPowrie,
    Autochrome,
    Random,
}

impl ScreenType {
    /// Canonical names, also the CSP on-disk spelling.
    pub fn name(self) -> &'static str {
        match self {
            ScreenType::Paget => "Paget",
            ScreenType::Thames => "Thames",
            ScreenType::Finlay => "Finlay",
            ScreenType::Dufay => "Dufay",
            ScreenType::WarnerPowrie => "WarnerPowrie",
            ScreenType::Autochrome => "Autochrome",
            ScreenType::Random => "Random",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Paget" => Some(ScreenType::Paget),
            "Thames" => Some(ScreenType::Thames),
            "Finlay" => Some(ScreenType::Finlay),
            // Legacy project files used a combined name.
            "PagetFinlay" => Some(ScreenType::Finlay),
            "Dufay" => Some(ScreenType::Dufay),
            "WarnerPowrie" => Some(ScreenType::WarnerPowrie),
            "Autochrome" => Some(ScreenType::Autochrome),
            "Random" => Some(ScreenType::Random),
            _ => None,
        }
    }

    /// Diagonal mosaics where only shifts with even coordinate sum land on
    /// the same-color lattice again.
    pub fn is_diagonal(self) -> bool {
        matches!(self, ScreenType::Paget | ScreenType::Thames | ScreenType::Finlay)
    }
}

/// Sub-pixel widths of the Dufay-style strips, as fractions of one period.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StripWidths {
    /// Height of the red row.
    pub red: f64,
    /// Width of the green column within the non-red band.
    pub green: f64,
}

impl Default for StripWidths {
    fn default() -> Self {
        Self { red: 0.5, green: 0.5 }
    }
}

static NEXT_SCREEN_ID: AtomicU64 = AtomicU64::new(1);

/// One period of the screen. `mult`/`add` are indexed `[iy][ix]`.
#[derive(Debug)]
pub struct Screen {
    pub mult: Box<[[Rgb; Screen::SIZE]; Screen::SIZE]>,
    pub add: Box<[[Rgb; Screen::SIZE]; Screen::SIZE]>,
    id: u64,
}

fn blank_plane() -> Box<[[Rgb; Screen::SIZE]; Screen::SIZE]> {
    // One heap allocation, no 196 KiB stack temporaries.
    let v = vec![[Rgb::default(); Screen::SIZE]; Screen::SIZE];
    v.into_boxed_slice().try_into().ok().unwrap()
}

impl Screen {
    /// Tiles are a power of two so positions can be wrapped with a mask.
    pub const SIZE: usize = 128;

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity tile: rendering through it returns the source unchanged.
    pub fn empty() -> Self {
        let mut s = Self {
            mult: blank_plane(),
            add: blank_plane(),
            id: NEXT_SCREEN_ID.fetch_add(1, Ordering::Relaxed),
        };
        for row in s.mult.iter_mut() {
            for c in row.iter_mut() {
                *c = Rgb::splat(1.0);
            }
        }
        s
    }

    /// Analytic tile for a regular screen type.
    pub fn analytic(ty: ScreenType, strips: StripWidths) -> CoreResult<Self> {
        let mut s = Self::empty();
        match ty {
            ScreenType::Paget | ScreenType::Thames | ScreenType::Finlay => s.fill_paget(),
            ScreenType::Dufay => s.fill_dufay(strips),
            ScreenType::WarnerPowrie => s.fill_strips(),
            ScreenType::Autochrome | ScreenType::Random => {
                return Err(CoreError::UnsupportedScreenType)
            }
        }
        Ok(s)
    }

    /// Schematic tile for GUI alignment overlays: half of the source shines
    /// through, the element color is stamped on top, and element borders go
    /// dark so the lattice reads clearly at high zoom.
    pub fn preview(ty: ScreenType, strips: StripWidths) -> CoreResult<Self> {
        let mut s = Self::analytic(ty, strips)?;
        for iy in 0..Self::SIZE {
            for ix in 0..Self::SIZE {
                let m = s.mult[iy][ix];
                let border = {
                    let up = s.mult[(iy + Self::SIZE - 1) & (Self::SIZE - 1)][ix];
                    let left = s.mult[iy][(ix + Self::SIZE - 1) & (Self::SIZE - 1)];
                    up != m || left != m
                };
                if border {
                    s.add[iy][ix] = Rgb::default();
                    s.mult[iy][ix] = Rgb::splat(0.25);
                } else {
                    s.add[iy][ix] = m * 0.5;
                    s.mult[iy][ix] = Rgb::splat(0.5);
                }
            }
        }
        s.id = NEXT_SCREEN_ID.fetch_add(1, Ordering::Relaxed);
        Ok(s)
    }

    /// Convolve `base` with an isotropic Gaussian of the given radius,
    /// expressed in screen periods. The kernel is periodic and normalized,
    /// so per-channel means are preserved.
    pub fn with_blur(base: &Screen, radius_periods: f64) -> Self {
        let sigma = radius_periods * Self::SIZE as f64;
        if sigma <= 1e-3 {
            return Self {
                mult: base.mult.clone(),
                add: base.add.clone(),
                id: NEXT_SCREEN_ID.fetch_add(1, Ordering::Relaxed),
            };
        }
        let half = ((3.0 * sigma).ceil() as usize).min(Self::SIZE / 2);
        let mut kernel = Vec::with_capacity(2 * half + 1);
        let mut sum = 0.0f64;
        for i in 0..=2 * half {
            let d = i as f64 - half as f64;
            let w = (-d * d / (2.0 * sigma * sigma)).exp();
            kernel.push(w);
            sum += w;
        }
        for w in kernel.iter_mut() {
            *w /= sum;
        }

        let mask = Self::SIZE - 1;
        let mut tmp_mult = blank_plane();
        let mut tmp_add = blank_plane();
        // Horizontal pass.
        for iy in 0..Self::SIZE {
            for ix in 0..Self::SIZE {
                let mut am = Rgb::default();
                let mut aa = Rgb::default();
                for (k, w) in kernel.iter().enumerate() {
                    let sx = (ix + Self::SIZE + k - half) & mask;
                    am += base.mult[iy][sx] * *w as f32;
                    aa += base.add[iy][sx] * *w as f32;
                }
                tmp_mult[iy][ix] = am;
                tmp_add[iy][ix] = aa;
            }
        }
        // Vertical pass.
        let mut out = Self {
            mult: blank_plane(),
            add: blank_plane(),
            id: NEXT_SCREEN_ID.fetch_add(1, Ordering::Relaxed),
        };
        for iy in 0..Self::SIZE {
            for ix in 0..Self::SIZE {
                let mut am = Rgb::default();
                let mut aa = Rgb::default();
                for (k, w) in kernel.iter().enumerate() {
                    let sy = (iy + Self::SIZE + k - half) & mask;
                    am += tmp_mult[sy][ix] * *w as f32;
                    aa += tmp_add[sy][ix] * *w as f32;
                }
                out.mult[iy][ix] = am;
                out.add[iy][ix] = aa;
            }
        }
        out
    }

    /// `(mult, add)` at a screen-space position; coordinates wrap.
    #[inline]
    pub fn at(&self, scr_x: f64, scr_y: f64) -> (Rgb, Rgb) {
        let mask = (Self::SIZE - 1) as i64;
        let ix = ((scr_x * Self::SIZE as f64).round() as i64 & mask) as usize;
        let iy = ((scr_y * Self::SIZE as f64).round() as i64 & mask) as usize;
        (self.mult[iy][ix], self.add[iy][ix])
    }

    /// Paget/Finlay/Thames: a 45°-rotated mosaic. One period:
    ///
    /// ```text
    /// G   R   G
    ///   B   B
    /// R   G   R
    ///   B   B
    /// G   R   G
    /// ```
    fn fill_paget(&mut self) {
        const GREENS: [(f64, f64); 2] = [(0.0, 0.0), (0.5, 0.5)];
        const REDS: [(f64, f64); 2] = [(0.5, 0.0), (0.0, 0.5)];
        const BLUES: [(f64, f64); 4] =
            [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)];
        for iy in 0..Self::SIZE {
            for ix in 0..Self::SIZE {
                let u = ix as f64 / Self::SIZE as f64;
                let v = iy as f64 / Self::SIZE as f64;
                let dg = nearest_wrapped(u, v, &GREENS);
                let dr = nearest_wrapped(u, v, &REDS);
                let db = nearest_wrapped(u, v, &BLUES);
                self.mult[iy][ix] = if dg <= dr && dg <= db {
                    Rgb::new(0.0, 1.0, 0.0)
                } else if dr <= db {
                    Rgb::new(1.0, 0.0, 0.0)
                } else {
                    Rgb::new(0.0, 0.0, 1.0)
                };
                self.add[iy][ix] = Rgb::default();
            }
        }
    }

    /// Dufay: a red row through the middle, the rest split into green and
    /// blue columns:
    ///
    /// ```text
    /// G   B   G
    /// R   R   R
    /// G   B   G
    /// ```
    fn fill_dufay(&mut self, strips: StripWidths) {
        for iy in 0..Self::SIZE {
            for ix in 0..Self::SIZE {
                let u = ix as f64 / Self::SIZE as f64;
                let v = iy as f64 / Self::SIZE as f64;
                let in_red = wrapped_dist_1d(v, 0.5) < strips.red / 2.0;
                self.mult[iy][ix] = if in_red {
                    Rgb::new(1.0, 0.0, 0.0)
                } else if wrapped_dist_1d(u, 0.0) < strips.green / 2.0 {
                    Rgb::new(0.0, 1.0, 0.0)
                } else {
                    Rgb::new(0.0, 0.0, 1.0)
                };
                self.add[iy][ix] = Rgb::default();
            }
        }
    }

    /// Warner-Powrie: three equal line strips per period, green centered at
    /// x = 0, blue at 1/3, red at 2/3.
    fn fill_strips(&mut self) {
        for ix in 0..Self::SIZE {
            let u = ix as f64 / Self::SIZE as f64;
            let dg = wrapped_dist_1d(u, 0.0);
            let db = wrapped_dist_1d(u, 1.0 / 3.0);
            let dr = wrapped_dist_1d(u, 2.0 / 3.0);
            let color = if dg <= db && dg <= dr {
                Rgb::new(0.0, 1.0, 0.0)
            } else if db <= dr {
                Rgb::new(0.0, 0.0, 1.0)
            } else {
                Rgb::new(1.0, 0.0, 0.0)
            };
            for iy in 0..Self::SIZE {
                self.mult[iy][ix] = color;
                self.add[iy][ix] = Rgb::default();
            }
        }
    }
}

fn wrapped_dist_1d(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 1.0;
    d.min(1.0 - d)
}

fn nearest_wrapped(u: f64, v: f64, centers: &[(f64, f64)]) -> f64 {
    let mut best = f64::MAX;
    for &(cx, cy) in centers {
        let dx = wrapped_dist_1d(u, cx);
        let dy = wrapped_dist_1d(v, cy);
        let d = dx * dx + dy * dy;
        if d < best {
            best = d;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_screen_is_identity() {
        let s = Screen::empty();
        let (mult, add) = s.at(0.37, 0.81);
        assert_eq!(mult, Rgb::splat(1.0));
        assert_eq!(add, Rgb::default());
    }

    #[test]
    fn tiles_are_periodic() {
        let s = Screen::analytic(ScreenType::Dufay, StripWidths::default()).unwrap();
        for &(x, y) in &[(0.1, 0.2), (0.9, 0.4), (0.5, 0.5)] {
            let a = s.at(x, y);
            let b = s.at(x + 1.0, y + 1.0);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn each_channel_appears_in_analytic_tiles() {
        for ty in [ScreenType::Paget, ScreenType::Dufay, ScreenType::WarnerPowrie] {
            let s = Screen::analytic(ty, StripWidths::default()).unwrap();
            let mut seen = [false; 3];
            for row in s.mult.iter() {
                for c in row {
                    if c.red > 0.5 {
                        seen[0] = true;
                    }
                    if c.green > 0.5 {
                        seen[1] = true;
                    }
                    if c.blue > 0.5 {
                        seen[2] = true;
                    }
                }
            }
            assert_eq!(seen, [true; 3], "{:?}", ty);
        }
    }

    #[test]
    fn autochrome_has_no_analytic_tile() {
        let err = Screen::analytic(ScreenType::Autochrome, StripWidths::default()).unwrap_err();
        assert!(matches!(err, crate::CoreError::UnsupportedScreenType));
    }

    #[test]
    fn blur_preserves_channel_means() {
        let s = Screen::analytic(ScreenType::Paget, StripWidths::default()).unwrap();
        let b = Screen::with_blur(&s, 0.1);
        let mean = |scr: &Screen| {
            let mut acc = Rgb::default();
            for row in scr.mult.iter() {
                for c in row {
                    acc += *c;
                }
            }
            acc * (1.0 / (Screen::SIZE * Screen::SIZE) as f32)
        };
        let m0 = mean(&s);
        let m1 = mean(&b);
        assert!((m0.red - m1.red).abs() < 1e-4);
        assert!((m0.green - m1.green).abs() < 1e-4);
        assert!((m0.blue - m1.blue).abs() < 1e-4);
    }

    #[test]
    fn legacy_screen_name_maps_to_finlay() {
        assert_eq!(ScreenType::from_name("PagetFinlay"), Some(ScreenType::Finlay));
    }
}
