//! Tile-to-tile registration.
//!
//! `find_best_match` aligns the analyzed screens of two neighboring scans.
//! When enabled, `cpfind` is tried first: both screens are dumped as
//! TIFFs, a two-image pto is emitted, and the returned points are
//! validated hard — only integer offsets, only offsets pointing in the
//! neighbor's direction, and for Paget-family screens only shifts with an
//! even coordinate sum (odd sums land between the diagonal lattices).
//! When cpfind is absent or its points do not agree, integer shifts in a
//! bounded range are brute-forced, scored by per-channel weighted SSE with
//! per-channel gain compensation.

use std::path::Path;

use crate::analyze::AnyAnalyzer;
use crate::progress::{check_cancel, Progress};
use crate::pto::{self, PtoControlPoint, PtoImage};
use crate::screen::ScreenType;
use crate::{cpfind, CoreError, CoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Right,
    Down,
    DownRight,
}

#[derive(Clone, Debug)]
pub struct MatchingParams {
    pub overlap_percentage: i32,
    pub min_overlap_percentage: i32,
    pub max_overlap_percentage: i32,
    pub use_cpfind: bool,
    /// Alternative overlap metric (normalized cross-correlation). The
    /// historical builds compiled the SSE branch; this stays off by
    /// default.
    pub alternative_overlap_metric: bool,
    pub hfov: f64,
}

impl Default for MatchingParams {
    fn default() -> Self {
        Self {
            overlap_percentage: 30,
            min_overlap_percentage: 10,
            max_overlap_percentage: 65,
            use_cpfind: true,
            alternative_overlap_metric: false,
            hfov: 28.534,
        }
    }
}

/// Paget-family lattices repeat only on even coordinate sums.
pub fn shift_allowed(ty: ScreenType, dx: i32, dy: i32) -> bool {
    !ty.is_diagonal() || (dx + dy) % 2 == 0
}

/// Validate cpfind's points and vote for an integer shift. `None` when the
/// points do not produce a trustworthy majority.
pub fn validate_cpfind_points(
    points: &[PtoControlPoint],
    ty: ScreenType,
    direction: Direction,
) -> Option<(i32, i32)> {
    let mut votes: Vec<((i32, i32), usize)> = Vec::new();
    let total = points.len();
    for p in points {
        let fx = p.x1 - p.x2;
        let fy = p.y1 - p.y2;
        let dx = fx.round();
        let dy = fy.round();
        // Non-integer offsets mean the match is off-lattice.
        if (fx - dx).abs() > 0.1 || (fy - dy).abs() > 0.1 {
            tracing::debug!(fx, fy, "cpfind point discarded: offset is not integer");
            continue;
        }
        let (dx, dy) = (dx as i32, dy as i32);
        let direction_ok = match direction {
            Direction::Right => dx > 0,
            Direction::Down => dy > 0,
            Direction::DownRight => dx > 0 && dy > 0,
        };
        if !direction_ok {
            tracing::debug!(dx, dy, "cpfind point discarded: wrong direction");
            continue;
        }
        if !shift_allowed(ty, dx, dy) {
            tracing::debug!(dx, dy, "cpfind point discarded: sum is not even");
            continue;
        }
        match votes.iter_mut().find(|(s, _)| *s == (dx, dy)) {
            Some((_, n)) => *n += 1,
            None => votes.push(((dx, dy), 1)),
        }
    }
    let (best, n) = votes.into_iter().max_by_key(|&(_, n)| n)?;
    if n >= 3.max(total / 3) {
        Some(best)
    } else {
        tracing::debug!(n, total, "cpfind result does not seem reliable");
        None
    }
}

/// Register `b` against `a`. The returned `(dx, dy)` places b's cell
/// `(x, y)` at a's cell `(x + dx, y + dy)`.
pub fn find_best_match(
    a: &AnyAnalyzer,
    b: &AnyAnalyzer,
    ty: ScreenType,
    params: &MatchingParams,
    direction: Direction,
    workdir: Option<&Path>,
    progress: Option<&Progress>,
) -> CoreResult<(i32, i32)> {
    if params.use_cpfind {
        if let Some(dir) = workdir {
            match try_cpfind(a, b, ty, params, direction, dir, progress) {
                Ok(Some(shift)) => return Ok(shift),
                Ok(None) => {
                    tracing::info!("cpfind found no usable points; brute-forcing the match")
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "cpfind path failed; brute-forcing"),
            }
        }
    }
    brute_force(a, b, ty, params, direction, progress)
}

fn try_cpfind(
    a: &AnyAnalyzer,
    b: &AnyAnalyzer,
    ty: ScreenType,
    params: &MatchingParams,
    direction: Direction,
    workdir: &Path,
    progress: Option<&Progress>,
) -> CoreResult<Option<(i32, i32)>> {
    // Common normalization so the two dumps are comparable for feature
    // matching.
    let ra = a.analyze_range();
    let rb = b.analyze_range();
    let mut ranges = ra;
    for ci in 0..3 {
        ranges[ci].min = ra[ci].min.min(rb[ci].min);
        ranges[ci].max = ra[ci].max.max(rb[ci].max);
    }
    let tag = match direction {
        Direction::Right => "hor",
        Direction::Down => "vert",
        Direction::DownRight => "diag",
    };
    let screen1 = workdir.join(format!("screen1-{tag}.tif"));
    let screen2 = workdir.join(format!("screen2-{tag}.tif"));
    a.write_screen(&screen1, None, ranges, progress)?;
    b.write_screen(&screen2, None, ranges, progress)?;

    let (wa, ha) = (a.range().width as u32, a.range().height as u32);
    let (wb, hb) = (b.range().width as u32, b.range().height as u32);
    let mw = wa.max(wb);
    let mh = ha.max(hb);
    let images = [
        PtoImage {
            width: mw,
            height: mh,
            filename: screen1.display().to_string(),
        },
        PtoImage {
            width: mw,
            height: mh,
            filename: screen2.display().to_string(),
        },
    ];
    let pto_in = workdir.join(format!("project-cpfind-{tag}.pto"));
    let pto_out = workdir.join(format!("project-cpfind-{tag}-out.pto"));
    pto::save_file(&pto_in, &images, params.hfov, &[])?;

    let Some(points) = cpfind::run(&pto_in, &pto_out, progress)? else {
        return Ok(None);
    };
    Ok(validate_cpfind_points(&points, ty, direction))
}

fn search_window(
    extent_a: i32,
    params: &MatchingParams,
    overlapping_axis: bool,
) -> (i32, i32) {
    if overlapping_axis {
        let min_shift = extent_a * (100 - params.max_overlap_percentage) / 100;
        let max_shift = extent_a * (100 - params.min_overlap_percentage) / 100;
        (min_shift.max(1), max_shift.min(extent_a - 1))
    } else {
        // Cross-axis drift between scans stays small.
        let slack = (extent_a / 8).max(4);
        (-slack, slack)
    }
}

fn brute_force(
    a: &AnyAnalyzer,
    b: &AnyAnalyzer,
    ty: ScreenType,
    params: &MatchingParams,
    direction: Direction,
    progress: Option<&Progress>,
) -> CoreResult<(i32, i32)> {
    let (wa, ha) = (a.range().width, a.range().height);
    let (wx, wy) = match direction {
        Direction::Right => (
            search_window(wa, params, true),
            search_window(ha, params, false),
        ),
        Direction::Down => (
            search_window(wa, params, false),
            search_window(ha, params, true),
        ),
        Direction::DownRight => (
            search_window(wa, params, true),
            search_window(ha, params, true),
        ),
    };

    let mut best: Option<((i32, i32), f64)> = None;
    for dy in wy.0..=wy.1 {
        check_cancel(progress)?;
        for dx in wx.0..=wx.1 {
            if !shift_allowed(ty, dx, dy) {
                continue;
            }
            if let Some(score) = overlap_score(a, b, dx, dy, params) {
                if best.map(|(_, s)| score < s).unwrap_or(true) {
                    best = Some(((dx, dy), score));
                }
            }
        }
    }
    match best {
        Some((shift, score)) => {
            tracing::debug!(?shift, score, "brute-force match");
            Ok(shift)
        }
        None => Err(CoreError::StitchMismatch {
            tile_a: (0, 0),
            tile_b: (0, 0),
            got: (0, 0),
            expected: (0, 0),
        }),
    }
}

/// Score one candidate shift over the overlap; lower is better. `None`
/// when the overlap is too small to be meaningful.
fn overlap_score(
    a: &AnyAnalyzer,
    b: &AnyAnalyzer,
    dx: i32,
    dy: i32,
    params: &MatchingParams,
) -> Option<f64> {
    let (wa, ha) = (a.range().width, a.range().height);
    let (wb, hb) = (b.range().width, b.range().height);
    // Overlap in a's frame.
    let x0 = dx.max(0);
    let y0 = dy.max(0);
    let x1 = wa.min(wb + dx);
    let y1 = ha.min(hb + dy);
    if x1 - x0 < 4 || y1 - y0 < 4 {
        return None;
    }
    let cells = ((x1 - x0) as i64 * (y1 - y0) as i64) as usize;
    let step = ((cells / 4096).max(1) as f64).sqrt().floor() as i32;
    let step = step.max(1);

    let known_a = a.known_pixels();
    let known_b = b.known_pixels();
    let mut sum_ab = [0.0f64; 3];
    let mut sum_bb = [0.0f64; 3];
    let mut samples: Vec<([f32; 3], [f32; 3])> = Vec::new();
    let mut y = y0;
    while y < y1 {
        let mut x = x0;
        while x < x1 {
            if known_a.test(x as usize, y as usize)
                && known_b.test((x - dx) as usize, (y - dy) as usize)
            {
                let va = a.cell_rgb(x, y);
                let vb = b.cell_rgb(x - dx, y - dy);
                let va = [va.red, va.green, va.blue];
                let vb = [vb.red, vb.green, vb.blue];
                for ci in 0..3 {
                    sum_ab[ci] += (va[ci] * vb[ci]) as f64;
                    sum_bb[ci] += (vb[ci] * vb[ci]) as f64;
                }
                samples.push((va, vb));
            }
            x += step;
        }
        y += step;
    }
    if samples.len() < 16 {
        return None;
    }
    // Per-channel gain compensation: least-squares gain of b against a.
    let mut gain = [1.0f64; 3];
    for ci in 0..3 {
        if sum_bb[ci] > 1e-9 {
            gain[ci] = sum_ab[ci] / sum_bb[ci];
        }
    }
    if params.alternative_overlap_metric {
        // Negated normalized cross-correlation, so lower is still better.
        let mut num = 0.0;
        let mut da = 0.0;
        let mut db = 0.0;
        for (va, vb) in &samples {
            for ci in 0..3 {
                let x = va[ci] as f64;
                let y = vb[ci] as f64 * gain[ci];
                num += x * y;
                da += x * x;
                db += y * y;
            }
        }
        let denom = (da * db).sqrt().max(1e-12);
        return Some(1.0 - num / denom);
    }
    let mut sse = 0.0;
    for (va, vb) in &samples {
        for ci in 0..3 {
            let d = va[ci] as f64 - vb[ci] as f64 * gain[ci];
            sse += d * d;
        }
    }
    Some(sse / samples.len() as f64)
}
