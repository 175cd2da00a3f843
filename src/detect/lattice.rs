//! Lattice derivation: from patch centroids to transform parameters.
//!
//! Green patches carry the reference lattice (every screen family has one
//! green element per lattice cell). Their nearest-neighbor displacement
//! vectors cluster around the two lattice directions; the medians of the
//! two dominant clusters seed the basis, a patch near the middle of the
//! cloud anchors the translation, and a few assign-snap-fit rounds with
//! the solver tighten everything to sub-pixel precision.

use plate_math::{Point, Vector};

use crate::analyze::geometry::{
    nearest_entry, Chan, DufayGeometry, PagetGeometry, ScreenGeometry, StripsGeometry,
};
use crate::bitmap::Bitmap2D;
use crate::image::Image;
use crate::progress::{check_cancel, Progress};
use crate::screen::ScreenType;
use crate::solver::{PointColor, Solver, SolverFlags};
use crate::{CoreError, CoreResult};

use super::patches::Patches;
use super::{ColorClass, DetectedScreen};

const MIN_GREEN_PATCHES: usize = 8;
const NEIGHBORS: usize = 6;
const REFINE_ROUNDS: usize = 3;

pub fn derive(
    img: &Image,
    patches: &Patches,
    ty: ScreenType,
    progress: Option<&Progress>,
) -> CoreResult<DetectedScreen> {
    check_cancel(progress)?;
    let greens: Vec<Point> = patches
        .patches()
        .iter()
        .filter(|p| p.color == ColorClass::Green)
        .map(|p| p.centroid)
        .collect();
    if greens.len() < MIN_GREEN_PATCHES {
        return Err(CoreError::DetectionFailed(format!(
            "only {} green patches, need {}",
            greens.len(),
            MIN_GREEN_PATCHES
        )));
    }

    let (d1, d2) = dominant_directions(&greens)?;
    let (mut c1, mut c2) = match ty {
        // Green neighbors sit at (c1±c2)/2 on the diagonal mosaics.
        ScreenType::Paget | ScreenType::Thames | ScreenType::Finlay => (d1 + d2, d1 - d2),
        _ => (d1, d2),
    };
    // Canonical orientation: c1 closer to the x axis, right-handed pair.
    if c1.x.abs() < c2.x.abs() {
        std::mem::swap(&mut c1, &mut c2);
    }
    if c1.x < 0.0 {
        c1 = -c1;
    }
    if c1.cross(c2) < 0.0 {
        c2 = -c2;
    }

    // Anchor at the green patch nearest the cloud center.
    let mean = greens.iter().fold(Point::new(0.0, 0.0), |acc, p| {
        Point::new(acc.x + p.x / greens.len() as f64, acc.y + p.y / greens.len() as f64)
    });
    let anchor = *greens
        .iter()
        .min_by(|a, b| a.dist(mean).total_cmp(&b.dist(mean)))
        .ok_or(CoreError::NoPatchesFound)?;

    let mut params = crate::geometry::ScrToImgParameters {
        screen_type: ty,
        center: anchor,
        coordinate1: c1,
        coordinate2: c2,
        ..Default::default()
    };

    // Assign → fit → reassign.
    for round in 0..REFINE_ROUNDS {
        check_cancel(progress)?;
        let map = crate::geometry::ScrToImg::new(params.clone())?;
        let mut solver = Solver::new();
        for patch in patches.patches() {
            let Some((chan, tag)) = channel_of(patch.color) else {
                continue;
            };
            let scr = map.to_scr(patch.centroid);
            let snapped = snap(ty, chan, scr);
            // Off-lattice assignments poison the fit; skip far snaps in
            // later rounds once the basis is trustworthy.
            if round > 0 && (snapped.x - scr.x).abs() + (snapped.y - scr.y).abs() > 0.8 {
                continue;
            }
            let weight = 1.0 + patch.overall_pixels as f64;
            solver.add_weighted_point(patch.centroid, snapped, tag, false, weight);
        }
        let (fitted, residuals, _) = solver.run(&params, SolverFlags::affine(), progress)?;
        tracing::debug!(round, avg = residuals.avg, max = residuals.max, "lattice fit round");
        params = fitted;
    }

    let map = crate::geometry::ScrToImg::new(params.clone())?;
    let range = map.get_range(img.width(), img.height());
    let mut patch_bitmap = Bitmap2D::new(range.width as usize, range.height as usize);
    for patch in patches.patches() {
        let scr = map.to_scr(patch.centroid);
        let x = (scr.x + range.xshift as f64).floor() as i64;
        let y = (scr.y + range.yshift as f64).floor() as i64;
        if x >= 0 && y >= 0 && (x as usize) < patch_bitmap.width() && (y as usize) < patch_bitmap.height() {
            patch_bitmap.set(x as usize, y as usize);
        }
    }
    let center = Point::new(img.width() as f64 / 2.0, img.height() as f64 / 2.0);
    Ok(DetectedScreen {
        range,
        pixel_size: map.pixel_size(center),
        patch_bitmap,
        params,
        mesh: None,
    })
}

fn channel_of(color: ColorClass) -> Option<(Chan, PointColor)> {
    match color {
        ColorClass::Red => Some((Chan::Red, PointColor::Red)),
        ColorClass::Green => Some((Chan::Green, PointColor::Green)),
        ColorClass::Blue => Some((Chan::Blue, PointColor::Blue)),
        _ => None,
    }
}

/// Snap a screen coordinate to the element sublattice of its color.
fn snap(ty: ScreenType, chan: Chan, scr: Point) -> Point {
    match ty {
        ScreenType::Dufay => {
            let e = nearest_entry::<DufayGeometry>(chan, scr);
            DufayGeometry::to_scr(chan, e)
        }
        ScreenType::Paget | ScreenType::Thames | ScreenType::Finlay => {
            let e = nearest_entry::<PagetGeometry>(chan, scr);
            PagetGeometry::to_scr(chan, e)
        }
        _ => {
            let e = nearest_entry::<StripsGeometry>(chan, scr);
            StripsGeometry::to_scr(chan, e)
        }
    }
}

/// Two dominant nearest-neighbor directions of a point cloud.
fn dominant_directions(points: &[Point]) -> CoreResult<(Vector, Vector)> {
    let mut vectors: Vec<Vector> = Vec::new();
    for (i, p) in points.iter().enumerate() {
        let mut dists: Vec<(f64, Vector)> = points
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, q)| (p.dist(*q), *q - *p))
            .collect();
        dists.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, v) in dists.into_iter().take(NEIGHBORS) {
            // Canonical half-plane so opposite directions merge.
            if v.y < 0.0 || (v.y == 0.0 && v.x < 0.0) {
                vectors.push(-v);
            } else {
                vectors.push(v);
            }
        }
    }
    if vectors.is_empty() {
        return Err(CoreError::DetectionFailed("no neighbor vectors".into()));
    }

    // Histogram over direction buckets; shortest-distance cluster wins.
    let first = cluster_median(&vectors, None)?;
    let second = cluster_median(&vectors, Some(first))?;
    Ok((first, second))
}

/// Median vector of the most common direction bucket, optionally excluding
/// directions collinear with `avoid`.
fn cluster_median(vectors: &[Vector], avoid: Option<Vector>) -> CoreResult<Vector> {
    const BUCKETS: usize = 36;
    let mut buckets: Vec<Vec<Vector>> = vec![Vec::new(); BUCKETS];
    for &v in vectors {
        if let Some(a) = avoid {
            let denom = a.length() * v.length();
            if denom < 1e-12 || (a.cross(v) / denom).abs() < 0.5 {
                continue;
            }
        }
        let angle = v.y.atan2(v.x); // [0, pi) in the canonical half-plane
        let bucket = ((angle / std::f64::consts::PI) * BUCKETS as f64) as usize % BUCKETS;
        buckets[bucket].push(v);
    }
    // Merge each bucket with its neighbor to be robust at bucket edges.
    let best = (0..BUCKETS)
        .max_by_key(|&b| buckets[b].len() + buckets[(b + 1) % BUCKETS].len())
        .ok_or_else(|| CoreError::DetectionFailed("direction clustering failed".into()))?;
    let mut members: Vec<Vector> = buckets[best]
        .iter()
        .chain(buckets[(best + 1) % BUCKETS].iter())
        .copied()
        .collect();
    if members.is_empty() {
        return Err(CoreError::DetectionFailed(
            "screen directions are ambiguous".into(),
        ));
    }
    members.sort_by(|a, b| a.length().total_cmp(&b.length()));
    // Median by length, then component-wise median around it for noise
    // rejection.
    let median_len = members[members.len() / 2].length();
    let near: Vec<Vector> = members
        .iter()
        .copied()
        .filter(|v| (v.length() - median_len).abs() < 0.25 * median_len)
        .collect();
    let n = near.len().max(1) as f64;
    let sum = near
        .iter()
        .fold(Vector::default(), |acc, v| acc + *v);
    Ok(sum * (1.0 / n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_directions_of_a_square_lattice() {
        let mut pts = Vec::new();
        for y in 0..10 {
            for x in 0..10 {
                pts.push(Point::new(x as f64 * 12.0, y as f64 * 15.0));
            }
        }
        let (d1, d2) = dominant_directions(&pts).unwrap();
        let lengths = [d1.length(), d2.length()];
        assert!(lengths.iter().any(|l| (l - 12.0).abs() < 0.5), "{lengths:?}");
        assert!(lengths.iter().any(|l| (l - 15.0).abs() < 0.5), "{lengths:?}");
    }

    #[test]
    fn snapping_respects_the_dufay_sublattices() {
        let p = snap(ScreenType::Dufay, Chan::Blue, Point::new(0.45, 0.1));
        assert!((p.x - 0.5).abs() < 1e-9);
        assert!((p.y - 0.0).abs() < 1e-9);
        let r = snap(ScreenType::Dufay, Chan::Red, Point::new(0.52, 0.56));
        assert!((r.x - 0.5).abs() < 1e-9);
        assert!((r.y - 0.5).abs() < 1e-9);
    }
}
