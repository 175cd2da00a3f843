//! Shared downscaling kernel.
//!
//! Maps each destination pixel to a `pixelsize × pixelsize` source
//! rectangle with fractional edges, accumulates with bilinear edge weights
//! and normalizes by the covered area, so summing a pixmap and summing its
//! downscaled version (times `pixelsize²`) agree. The kernel is generic
//! over the pixel type and the accumulate functor, exactly one
//! implementation for grayscale, RGB and analyzer-result pixels.
//!
//! Rows of the destination are processed in parallel bands; each band only
//! writes its own slice, so no synchronization is needed on the output.

use rayon::prelude::*;

use plate_math::Rgb;

use crate::progress::{check_cancel, Progress};
use crate::CoreResult;

/// `acc(dst, src, weight)`: add `src · weight` into `dst`.
pub fn account_pixel(dst: &mut f32, src: f32, weight: f32) {
    *dst += src * weight;
}

pub fn account_rgb_pixel(dst: &mut Rgb, src: Rgb, weight: f32) {
    *dst += src * weight;
}

/// Downscale into `dst` (`dst_w × dst_h`). Destination pixel `(dx, dy)`
/// covers source rectangle `[x + dx·pixelsize, x + (dx+1)·pixelsize) ×
/// [y + dy·pixelsize, ...)`.
pub fn downscale<T, G, A>(
    dst: &mut [T],
    x: f64,
    y: f64,
    dst_w: usize,
    dst_h: usize,
    pixelsize: f64,
    get_pixel: G,
    account: A,
    progress: Option<&Progress>,
) -> CoreResult<()>
where
    T: Default + Copy + Send + std::ops::Mul<f32, Output = T>,
    G: Fn(i64, i64) -> T + Sync,
    A: Fn(&mut T, T, f32) + Sync,
{
    assert!(dst.len() >= dst_w * dst_h);
    assert!(pixelsize > 0.0);
    let inv_area = 1.0 / (pixelsize * pixelsize) as f32;

    dst.par_chunks_mut(dst_w)
        .take(dst_h)
        .enumerate()
        .try_for_each(|(dy, row)| -> CoreResult<()> {
            check_cancel(progress)?;
            let y0 = y + dy as f64 * pixelsize;
            let y1 = y0 + pixelsize;
            for (dx, out) in row.iter_mut().enumerate() {
                let x0 = x + dx as f64 * pixelsize;
                let x1 = x0 + pixelsize;
                let mut acc = T::default();
                let fy0 = y0.floor() as i64;
                let fy1 = (y1.ceil() as i64).max(fy0 + 1);
                for py in fy0..fy1 {
                    // Bilinear edge weight: overlap of the pixel row with
                    // the source band.
                    let wy = (overlap(py as f64, py as f64 + 1.0, y0, y1)) as f32;
                    if wy <= 0.0 {
                        continue;
                    }
                    let fx0 = x0.floor() as i64;
                    let fx1 = (x1.ceil() as i64).max(fx0 + 1);
                    for px in fx0..fx1 {
                        let wx = (overlap(px as f64, px as f64 + 1.0, x0, x1)) as f32;
                        if wx <= 0.0 {
                            continue;
                        }
                        account(&mut acc, get_pixel(px, py), wx * wy);
                    }
                }
                *out = acc * inv_area;
            }
            if let Some(p) = progress {
                p.inc_progress();
            }
            Ok(())
        })
}

#[inline]
fn overlap(a0: f64, a1: f64, b0: f64, b1: f64) -> f64 {
    (a1.min(b1) - a0.max(b0)).max(0.0)
}
