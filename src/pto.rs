//! Minimal Hugin `.pto` project support.
//!
//! The stitcher emits a two-image project for `cpfind` and reads back the
//! `c` control-point lines the tool adds. Only the subset the panorama
//! tools actually require is written: one `p` line (projection and
//! canvas), an `m` line, per-image `i` lines with optimization-parameter
//! defaults, `v` lines naming the freedoms, and `c` lines.

use std::fmt::Write as _;
use std::io::BufRead;

use crate::{CoreError, CoreResult};

/// One image of a pto project.
#[derive(Clone, Debug)]
pub struct PtoImage {
    pub width: u32,
    pub height: u32,
    pub filename: String,
}

/// A matched point pair: `(x, y)` in image 0, `(X, Y)` in image 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PtoControlPoint {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// Render a project with the translation freedoms the plate matcher
/// optimizes.
pub fn to_string(images: &[PtoImage], hfov: f64, points: &[PtoControlPoint]) -> String {
    let mut s = String::new();
    let _ = writeln!(
        s,
        "p f2 w3000 h1500 v360  k0 E0 R0 n\"TIFF_m c:LZW r:CROP\""
    );
    let _ = writeln!(s, "m i0");
    for (i, img) in images.iter().enumerate() {
        if i == 0 {
            let _ = writeln!(
                s,
                "i w{} h{} f0 v{:.2} Ra0 Rb0 Rc0 Rd0 Re0 Eev0 Er1 Eb1 r0 p0 y0 TrX0 TrY0 TrZ0 Tpy0 Tpp0 j0 a0 b0 c0 d0 e0 g0 t0 Va1 Vb0 Vc0 Vd0 Vx0 Vy0  Vm5 n\"{}\"",
                img.width, img.height, hfov, img.filename
            );
        } else {
            let _ = writeln!(
                s,
                "i w{} h{} f0 v=0 Ra=0 Rb=0 Rc=0 Rd=0 Re=0 Eev0 Er1 Eb1 r0 p0 y0 TrX0 TrY0 TrZ0 Tpy-0 Tpp0 j0 a=0 b=0 c=0 d=0 e=0 g=0 t=0 Va=0 Vb=0 Vc=0 Vd=0 Vx=0 Vy=0  Vm5  n\"{}\"",
                img.width, img.height, img.filename
            );
        }
    }
    let _ = writeln!(s, "v TrX1");
    let _ = writeln!(s, "v TrY1");
    for p in points {
        let _ = writeln!(
            s,
            "c n0 N1 x{:.6} y{:.6} X{:.6} Y{:.6} t0",
            p.x1, p.y1, p.x2, p.y2
        );
    }
    s
}

pub fn save_file(
    path: impl AsRef<std::path::Path>,
    images: &[PtoImage],
    hfov: f64,
    points: &[PtoControlPoint],
) -> CoreResult<()> {
    std::fs::write(path.as_ref(), to_string(images, hfov, points)).map_err(|e| {
        CoreError::WriteFailed {
            path: path.as_ref().display().to_string(),
            source: e,
        }
    })
}

/// Harvest `c n0 N1 ...` lines from a (possibly cpfind-augmented) project.
/// Lines that are not control points are skipped; malformed control-point
/// lines are parse errors.
pub fn parse_control_points<R: BufRead>(r: R) -> CoreResult<Vec<PtoControlPoint>> {
    let mut out = Vec::new();
    for line in r.lines() {
        let line = line.map_err(|e| CoreError::parse(e.to_string()))?;
        let Some(rest) = line.strip_prefix("c n0 N1 ") else {
            continue;
        };
        let mut x1 = None;
        let mut y1 = None;
        let mut x2 = None;
        let mut y2 = None;
        for field in rest.split_whitespace() {
            let (tag, value) = field.split_at(1);
            match tag {
                "x" => x1 = Some(parse_coord(value)?),
                "y" => y1 = Some(parse_coord(value)?),
                "X" => x2 = Some(parse_coord(value)?),
                "Y" => y2 = Some(parse_coord(value)?),
                _ => {}
            }
        }
        match (x1, y1, x2, y2) {
            (Some(x1), Some(y1), Some(x2), Some(y2)) => {
                out.push(PtoControlPoint { x1, y1, x2, y2 })
            }
            _ => return Err(CoreError::parse("incomplete control point line")),
        }
    }
    Ok(out)
}

fn parse_coord(s: &str) -> CoreResult<f64> {
    s.parse()
        .map_err(|_| CoreError::parse(format!("bad control point coordinate '{}'", s)))
}

pub fn load_control_points(path: impl AsRef<std::path::Path>) -> CoreResult<Vec<PtoControlPoint>> {
    let f = std::fs::File::open(path.as_ref()).map_err(|e| {
        CoreError::load(path.as_ref().display().to_string(), e.to_string())
    })?;
    parse_control_points(std::io::BufReader::new(f))
}
