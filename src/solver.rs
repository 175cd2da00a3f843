//! Transform fitting.
//!
//! Takes detected patches or user-placed control points and fits the
//! screen→image parameters by minimizing the weighted sum of squared
//! residuals between `F(screen_point)` and `image_point`. The optimizer is
//! a downhill simplex (Nelder-Mead) seeded with the current parameters;
//! freedoms are enabled in stages — affine, then `k1`, then tilt, then the
//! mesh — so the nonlinear freedoms refine an already-good linear solution
//! instead of wandering.
//!
//! The solver is pure on its inputs: it never touches the image, and the
//! caller decides what to do with the returned residuals (the GUI flags
//! outliers with them).

use plate_math::{Point, Vector};

use crate::geometry::{mesh::Mesh, ScrToImg, ScrToImgParameters};
use crate::progress::{check_cancel, Progress};
use crate::{CoreError, CoreResult};

/// Color tag of a control point, matching the patch that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointColor {
    Red,
    Green,
    Blue,
    Neutral,
}

#[derive(Clone, Debug)]
pub struct ControlPoint {
    pub img: Point,
    pub scr: Point,
    pub color: PointColor,
    pub locked: bool,
    /// Solver weight; detected patches weight by their projected pixel
    /// counts.
    pub weight: f64,
}

/// Which freedoms the fit may move.
#[derive(Clone, Copy, Debug, Default)]
pub struct SolverFlags {
    pub translation: bool,
    pub basis: bool,
    pub tilt: bool,
    pub k1: bool,
    pub mesh: bool,
}

impl SolverFlags {
    pub fn affine() -> Self {
        Self {
            translation: true,
            basis: true,
            ..Default::default()
        }
    }

    pub fn full() -> Self {
        Self {
            translation: true,
            basis: true,
            tilt: true,
            k1: true,
            mesh: false,
        }
    }
}

/// Per-point residuals of the final fit, in image pixels.
#[derive(Clone, Debug, Default)]
pub struct Residuals {
    pub per_point: Vec<f64>,
    pub avg: f64,
    pub max: f64,
}

#[derive(Clone, Default)]
pub struct Solver {
    points: Vec<ControlPoint>,
}

const MESH_GRID: f64 = 8.0;

impl Solver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, img: Point, scr: Point, color: PointColor, locked: bool) {
        self.add_weighted_point(img, scr, color, locked, 1.0);
    }

    pub fn add_weighted_point(
        &mut self,
        img: Point,
        scr: Point,
        color: PointColor,
        locked: bool,
        weight: f64,
    ) {
        self.points.push(ControlPoint {
            img,
            scr,
            color,
            locked,
            weight,
        });
    }

    pub fn remove_point(&mut self, index: usize) {
        if index < self.points.len() {
            self.points.remove(index);
        }
    }

    pub fn points(&self) -> &[ControlPoint] {
        &self.points
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Run the staged fit. Returns the refined parameters, residual
    /// statistics and the fitted mesh when the mesh freedom was enabled.
    pub fn run(
        &self,
        params_in: &ScrToImgParameters,
        flags: SolverFlags,
        progress: Option<&Progress>,
    ) -> CoreResult<(ScrToImgParameters, Residuals, Option<Mesh>)> {
        let needed = if flags.mesh {
            10
        } else if flags.k1 {
            5
        } else {
            3
        };
        if self.points.len() < needed {
            return Err(CoreError::InsufficientPoints {
                needed,
                got: self.points.len(),
            });
        }

        let mut params = params_in.clone();

        // Stage 1: affine freedoms.
        if flags.translation || flags.basis {
            params = self.simplex_stage(&params, flags.translation, flags.basis, false, false, progress)?;
        }
        // Stage 2: radial distortion on top of the affine solution.
        if flags.k1 {
            params = self.simplex_stage(&params, flags.translation, flags.basis, true, false, progress)?;
        }
        // Stage 3: tilt.
        if flags.tilt {
            params = self.simplex_stage(&params, flags.translation, flags.basis, flags.k1, true, progress)?;
        }
        // Stage 4: mesh from the remaining residuals.
        let mesh = if flags.mesh {
            Some(self.fit_mesh(&params)?)
        } else {
            None
        };

        let residuals = self.residuals(&params, mesh.as_ref())?;
        Ok((params, residuals, mesh))
    }

    fn residuals(
        &self,
        params: &ScrToImgParameters,
        mesh: Option<&Mesh>,
    ) -> CoreResult<Residuals> {
        let map = match mesh {
            Some(m) => ScrToImg::with_mesh(params.clone(), Some(std::sync::Arc::new(m.clone())))?,
            None => ScrToImg::new(params.clone())?,
        };
        let per_point: Vec<f64> = self
            .points
            .iter()
            .map(|p| map.to_img(p.scr).dist(p.img))
            .collect();
        let max = per_point.iter().copied().fold(0.0, f64::max);
        let avg = if per_point.is_empty() {
            0.0
        } else {
            per_point.iter().sum::<f64>() / per_point.len() as f64
        };
        Ok(Residuals {
            per_point,
            avg,
            max,
        })
    }

    fn pack(
        params: &ScrToImgParameters,
        translation: bool,
        basis: bool,
        k1: bool,
        tilt: bool,
    ) -> Vec<f64> {
        let mut v = Vec::new();
        if translation {
            v.extend([params.center.x, params.center.y]);
        }
        if basis {
            v.extend([
                params.coordinate1.x,
                params.coordinate1.y,
                params.coordinate2.x,
                params.coordinate2.y,
            ]);
        }
        if k1 {
            v.push(params.k1);
        }
        if tilt {
            v.extend([params.tilt_x.x, params.tilt_x.y, params.tilt_y.x, params.tilt_y.y]);
        }
        v
    }

    fn unpack(
        base: &ScrToImgParameters,
        v: &[f64],
        translation: bool,
        basis: bool,
        k1: bool,
        tilt: bool,
    ) -> ScrToImgParameters {
        let mut params = base.clone();
        let mut i = 0;
        if translation {
            params.center = Point::new(v[i], v[i + 1]);
            i += 2;
        }
        if basis {
            params.coordinate1 = Vector::new(v[i], v[i + 1]);
            params.coordinate2 = Vector::new(v[i + 2], v[i + 3]);
            i += 4;
        }
        if k1 {
            params.k1 = v[i];
            i += 1;
        }
        if tilt {
            params.tilt_x = Vector::new(v[i], v[i + 1]);
            params.tilt_y = Vector::new(v[i + 2], v[i + 3]);
        }
        params
    }

    fn objective(&self, params: &ScrToImgParameters) -> f64 {
        let map = match ScrToImg::new(params.clone()) {
            Ok(m) => m,
            // Degenerate candidates are repelled, not errors.
            Err(_) => return f64::INFINITY,
        };
        self.points
            .iter()
            .map(|p| {
                let d = map.to_img(p.scr) - p.img;
                let w = p.weight * if p.locked { 10.0 } else { 1.0 };
                w * (d.x * d.x + d.y * d.y)
            })
            .sum()
    }

    fn simplex_stage(
        &self,
        seed: &ScrToImgParameters,
        translation: bool,
        basis: bool,
        k1: bool,
        tilt: bool,
        progress: Option<&Progress>,
    ) -> CoreResult<ScrToImgParameters> {
        let x0 = Self::pack(seed, translation, basis, k1, tilt);
        let n = x0.len();
        if n == 0 {
            return Ok(seed.clone());
        }
        let f = |v: &[f64]| {
            self.objective(&Self::unpack(seed, v, translation, basis, k1, tilt))
        };

        // Initial simplex: seed plus one vertex per dimension.
        let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
        simplex.push((x0.clone(), f(&x0)));
        for d in 0..n {
            let mut v = x0.clone();
            let step = 0.05 * v[d].abs() + 0.05;
            v[d] += step;
            let fv = f(&v);
            simplex.push((v, fv));
        }

        let max_iter = 400 * n;
        let tol = 1e-12;
        let mut converged = false;
        for _ in 0..max_iter {
            check_cancel(progress)?;
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
            let best = simplex[0].1;
            let worst = simplex[n].1;
            if (worst - best).abs() <= tol * (1.0 + best.abs()) {
                converged = true;
                break;
            }
            // Centroid of all but the worst.
            let mut centroid = vec![0.0; n];
            for (v, _) in simplex.iter().take(n) {
                for (c, x) in centroid.iter_mut().zip(v) {
                    *c += x / n as f64;
                }
            }
            let worst_v = simplex[n].0.clone();
            let mix = |a: f64| -> Vec<f64> {
                centroid
                    .iter()
                    .zip(&worst_v)
                    .map(|(c, w)| c + a * (c - w))
                    .collect()
            };
            let reflected = mix(1.0);
            let fr = f(&reflected);
            if fr < simplex[0].1 {
                let expanded = mix(2.0);
                let fe = f(&expanded);
                simplex[n] = if fe < fr { (expanded, fe) } else { (reflected, fr) };
            } else if fr < simplex[n - 1].1 {
                simplex[n] = (reflected, fr);
            } else {
                let contracted = mix(-0.5);
                let fc = f(&contracted);
                if fc < simplex[n].1 {
                    simplex[n] = (contracted, fc);
                } else {
                    // Shrink toward the best vertex.
                    let best_v = simplex[0].0.clone();
                    for entry in simplex.iter_mut().skip(1) {
                        let v: Vec<f64> = entry
                            .0
                            .iter()
                            .zip(&best_v)
                            .map(|(x, b)| b + 0.5 * (x - b))
                            .collect();
                        let fv = f(&v);
                        *entry = (v, fv);
                    }
                }
            }
        }
        if !converged {
            return Err(CoreError::SolverDidNotConverge);
        }
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(Self::unpack(seed, &simplex[0].0, translation, basis, k1, tilt))
    }

    /// Scatter the parametric-fit residuals onto a mesh grid with a
    /// Gaussian falloff; corrects smooth non-rigid scanner warp.
    fn fit_mesh(&self, params: &ScrToImgParameters) -> CoreResult<Mesh> {
        let map = ScrToImg::new(params.clone())?;
        let residuals: Vec<(Point, Vector)> = self
            .points
            .iter()
            .map(|p| (p.img, p.img - map.to_img(p.scr)))
            .collect();
        let max_x = residuals.iter().map(|(p, _)| p.x).fold(1.0, f64::max);
        let max_y = residuals.iter().map(|(p, _)| p.y).fold(1.0, f64::max);
        let step_x = (max_x / MESH_GRID).max(1.0);
        let step_y = (max_y / MESH_GRID).max(1.0);
        let mut mesh = Mesh::new(max_x.ceil() as u32 + 1, max_y.ceil() as u32 + 1, step_x, step_y);
        let sigma2 = step_x * step_y;
        for row in 0..mesh.rows() {
            for col in 0..mesh.cols() {
                let node = Point::new(col as f64 * step_x, row as f64 * step_y);
                let mut acc = Vector::default();
                let mut wsum = 0.0;
                for (p, r) in &residuals {
                    let d2 = (p.x - node.x).powi(2) + (p.y - node.y).powi(2);
                    let w = (-d2 / (2.0 * sigma2)).exp();
                    acc += *r * w;
                    wsum += w;
                }
                if wsum > 1e-9 {
                    mesh.set(col, row, acc * (1.0 / wsum));
                }
            }
        }
        Ok(mesh)
    }
}
