//! Screen-geometry descriptors for the analyzers.
//!
//! Each descriptor maps between screen coordinates and the per-channel
//! entry lattices the analyzer stores its data on. All functions are
//! associated functions on zero-sized types so the analyzer monomorphizes
//! per geometry and the mappings inline into the hot loops.
//!
//! The lattice ("L") space of a channel is chosen so its entries sit on
//! integer positions and neighbor offsets are plain additions. For the
//! diagonal Paget mosaic the L space is the 45°-rotated coordinate frame
//! `(u, v) = (x − y, x + y)`, where the green/red elements form an ordinary
//! square lattice again.

use plate_math::{IntPoint, Point};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chan {
    Red,
    Green,
    Blue,
}

pub const CHANNELS: [Chan; 3] = [Chan::Red, Chan::Green, Chan::Blue];

pub trait ScreenGeometry: Send + Sync + 'static {
    const NAME: &'static str;
    /// Whether entry indices must be bounds-checked against the plane.
    const CHECK_RANGE: bool;

    /// Plane dimensions for a screen range of `w × h` periods.
    fn dims(c: Chan, w: i32, h: i32) -> (usize, usize);
    /// Screen coordinate → channel lattice coordinate (entries at integers).
    fn to_lattice(c: Chan, scr: Point) -> Point;
    /// Lattice entry → screen coordinate of the element center.
    fn to_scr(c: Chan, e: IntPoint) -> Point;
    /// Offset added to entry coordinates to obtain non-negative plane
    /// indices (diagonal lattices have negative entry coordinates).
    fn index_offset(c: Chan, w: i32, h: i32) -> (i32, i32);
}

/// Entry → linear plane index, `None` outside the plane.
#[inline]
pub fn plane_index<G: ScreenGeometry>(c: Chan, e: IntPoint, w: i32, h: i32) -> Option<usize> {
    let (ox, oy) = G::index_offset(c, w, h);
    let (pw, ph) = G::dims(c, w, h);
    let x = e.x + ox;
    let y = e.y + oy;
    if x < 0 || y < 0 || x as usize >= pw || y as usize >= ph {
        return None;
    }
    Some(y as usize * pw + x as usize)
}

/// Like [`plane_index`] but clamps into the plane instead of failing; used
/// by interpolation, which reads a 4×4 neighborhood that may poke past the
/// border.
#[inline]
pub fn clamped_plane_index<G: ScreenGeometry>(c: Chan, e: IntPoint, w: i32, h: i32) -> usize {
    let (ox, oy) = G::index_offset(c, w, h);
    let (pw, ph) = G::dims(c, w, h);
    let x = (e.x + ox).clamp(0, pw as i32 - 1);
    let y = (e.y + oy).clamp(0, ph as i32 - 1);
    y as usize * pw + x as usize
}

/// Entry at plane index coordinates; inverse of the offset applied by
/// [`plane_index`].
#[inline]
pub fn entry_at<G: ScreenGeometry>(c: Chan, ix: usize, iy: usize, w: i32, h: i32) -> IntPoint {
    let (ox, oy) = G::index_offset(c, w, h);
    IntPoint::new(ix as i32 - ox, iy as i32 - oy)
}

/// Nearest entry to a screen position.
#[inline]
pub fn nearest_entry<G: ScreenGeometry>(c: Chan, scr: Point) -> IntPoint {
    let l = G::to_lattice(c, scr);
    IntPoint::new(l.x.round() as i32, l.y.round() as i32)
}

/// Dufaycolor: squares of green and blue alternating along a row, a red
/// réseau line between rows. Red is stored at twice the horizontal
/// resolution to match the physical aspect ratio.
#[derive(Debug)]
pub struct DufayGeometry;

impl ScreenGeometry for DufayGeometry {
    const NAME: &'static str = "Dufay";
    const CHECK_RANGE: bool = true;

    fn dims(c: Chan, w: i32, h: i32) -> (usize, usize) {
        match c {
            Chan::Red => (2 * w as usize, h as usize),
            Chan::Green | Chan::Blue => (w as usize, h as usize),
        }
    }

    fn to_lattice(c: Chan, scr: Point) -> Point {
        match c {
            Chan::Red => Point::new(scr.x * 2.0, scr.y - 0.5),
            Chan::Green => Point::new(scr.x, scr.y),
            Chan::Blue => Point::new(scr.x - 0.5, scr.y),
        }
    }

    fn to_scr(c: Chan, e: IntPoint) -> Point {
        match c {
            Chan::Red => Point::new(e.x as f64 / 2.0, e.y as f64 + 0.5),
            Chan::Green => Point::new(e.x as f64, e.y as f64),
            Chan::Blue => Point::new(e.x as f64 + 0.5, e.y as f64),
        }
    }

    fn index_offset(_c: Chan, _w: i32, _h: i32) -> (i32, i32) {
        (0, 0)
    }
}

/// Paget / Finlay / Thames: 45°-rotated mosaic. Green and red live on the
/// diagonal lattice, blue on a 2×2 orthogonal lattice.
#[derive(Debug)]
pub struct PagetGeometry;

impl PagetGeometry {
    #[inline]
    fn diag(p: Point) -> Point {
        Point::new(p.x - p.y, p.x + p.y)
    }

    #[inline]
    fn undiag(p: Point) -> Point {
        Point::new((p.x + p.y) / 2.0, (p.y - p.x) / 2.0)
    }
}

impl ScreenGeometry for PagetGeometry {
    const NAME: &'static str = "Paget";
    const CHECK_RANGE: bool = true;

    fn dims(c: Chan, w: i32, h: i32) -> (usize, usize) {
        match c {
            // Diagonal u spans [-h, w], v spans [0, w + h].
            Chan::Red | Chan::Green => ((w + h + 1) as usize, (w + h + 1) as usize),
            Chan::Blue => (2 * w as usize, 2 * h as usize),
        }
    }

    fn to_lattice(c: Chan, scr: Point) -> Point {
        match c {
            Chan::Green => Self::diag(scr),
            // Reds are greens of the half-step-shifted lattice.
            Chan::Red => Self::diag(Point::new(scr.x + 0.5, scr.y)),
            Chan::Blue => Point::new(scr.x * 2.0 - 0.5, scr.y * 2.0 - 0.5),
        }
    }

    fn to_scr(c: Chan, e: IntPoint) -> Point {
        let p = Point::new(e.x as f64, e.y as f64);
        match c {
            Chan::Green => Self::undiag(p),
            Chan::Red => {
                let q = Self::undiag(p);
                Point::new(q.x - 0.5, q.y)
            }
            Chan::Blue => Point::new((e.x as f64 + 0.5) / 2.0, (e.y as f64 + 0.5) / 2.0),
        }
    }

    fn index_offset(c: Chan, _w: i32, h: i32) -> (i32, i32) {
        match c {
            Chan::Red | Chan::Green => (h, 0),
            Chan::Blue => (0, 0),
        }
    }
}

/// Warner-Powrie style line screens: vertical green/blue/red lines at
/// x = 0, 1/3, 2/3 of the period.
#[derive(Debug)]
pub struct StripsGeometry;

impl ScreenGeometry for StripsGeometry {
    const NAME: &'static str = "Strips";
    const CHECK_RANGE: bool = true;

    fn dims(_c: Chan, w: i32, h: i32) -> (usize, usize) {
        (w as usize, h as usize)
    }

    fn to_lattice(c: Chan, scr: Point) -> Point {
        match c {
            Chan::Green => Point::new(scr.x, scr.y),
            Chan::Blue => Point::new(scr.x - 1.0 / 3.0, scr.y),
            Chan::Red => Point::new(scr.x - 2.0 / 3.0, scr.y),
        }
    }

    fn to_scr(c: Chan, e: IntPoint) -> Point {
        match c {
            Chan::Green => Point::new(e.x as f64, e.y as f64),
            Chan::Blue => Point::new(e.x as f64 + 1.0 / 3.0, e.y as f64),
            Chan::Red => Point::new(e.x as f64 + 2.0 / 3.0, e.y as f64),
        }
    }

    fn index_offset(_c: Chan, _w: i32, _h: i32) -> (i32, i32) {
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<G: ScreenGeometry>(c: Chan, e: IntPoint) {
        let scr = G::to_scr(c, e);
        let l = G::to_lattice(c, scr);
        assert!((l.x - e.x as f64).abs() < 1e-9, "{:?} {:?} -> {:?}", c, e, l);
        assert!((l.y - e.y as f64).abs() < 1e-9);
    }

    #[test]
    fn entry_positions_round_trip() {
        for e in [IntPoint::new(0, 0), IntPoint::new(3, 5), IntPoint::new(-2, 7)] {
            for c in CHANNELS {
                roundtrip::<DufayGeometry>(c, e);
                roundtrip::<PagetGeometry>(c, e);
                roundtrip::<StripsGeometry>(c, e);
            }
        }
    }

    #[test]
    fn paget_green_lattice_is_dense_in_diagonal_space() {
        // Both (0,0) and (0.5,0.5) are green element centers; they map to
        // adjacent integer lattice points.
        let a = PagetGeometry::to_lattice(Chan::Green, Point::new(0.0, 0.0));
        let b = PagetGeometry::to_lattice(Chan::Green, Point::new(0.5, 0.5));
        assert_eq!((a.x, a.y), (0.0, 0.0));
        assert_eq!((b.x, b.y), (0.0, 1.0));
    }

    #[test]
    fn indices_reject_out_of_range() {
        assert!(plane_index::<DufayGeometry>(Chan::Green, IntPoint::new(-1, 0), 4, 4).is_none());
        assert!(plane_index::<DufayGeometry>(Chan::Red, IntPoint::new(7, 3), 4, 4).is_some());
        assert!(plane_index::<DufayGeometry>(Chan::Red, IntPoint::new(8, 3), 4, 4).is_none());
        assert!(plane_index::<PagetGeometry>(Chan::Green, IntPoint::new(-5, 0), 4, 4).is_none());
        assert!(plane_index::<PagetGeometry>(Chan::Green, IntPoint::new(-4, 0), 4, 4).is_some());
    }

    #[test]
    fn entry_at_inverts_plane_index() {
        let e = IntPoint::new(-2, 5);
        let idx = plane_index::<PagetGeometry>(Chan::Green, e, 4, 4).unwrap();
        let (pw, _) = PagetGeometry::dims(Chan::Green, 4, 4);
        let back = entry_at::<PagetGeometry>(Chan::Green, idx % pw, idx / pw, 4, 4);
        assert_eq!(back, e);
    }
}
