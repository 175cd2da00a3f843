//! Tile rendering into caller-provided buffers.
//!
//! `render_tile` paints one rectangular tile of the output at 8-bit RGB.
//! The caller owns the buffer and its stride; the renderer never
//! allocates output memory. Output pixel `(x, y)` samples image position
//! `(xoffset + x·step, yoffset + y·step)`, so `step` is the zoom factor
//! (0.25 renders 4× magnified).
//!
//! Rows are painted in parallel bands; each band writes only its own
//! slice of the buffer.

use rayon::prelude::*;
use std::sync::Arc;

use crate::cache::Caches;
use crate::geometry::{mesh::Mesh, ScrToImg, ScrToImgParameters};
use crate::image::Image;
use crate::progress::{check_cancel, Progress};
use crate::render::renderer::{RenderVariant, Renderer};
use crate::render::RenderParameters;
use crate::{CoreError, CoreResult};

/// Paint a tile with an arbitrary per-pixel sampler producing 8-bit RGB.
/// Shared by the single-scan path below and the stitcher's pixel router.
pub fn paint_tile<F>(
    pixels_out: &mut [u8],
    stride: usize,
    width: usize,
    height: usize,
    sample: F,
    progress: Option<&Progress>,
) -> CoreResult<()>
where
    F: Fn(usize, usize) -> [u8; 3] + Sync,
{
    if stride < width * 3 || pixels_out.len() < stride * height {
        return Err(CoreError::invalid("output buffer too small for tile"));
    }
    pixels_out
        .par_chunks_mut(stride)
        .take(height)
        .enumerate()
        .try_for_each(|(y, row)| -> CoreResult<()> {
            check_cancel(progress)?;
            for x in 0..width {
                let [r, g, b] = sample(x, y);
                row[x * 3] = r;
                row[x * 3 + 1] = g;
                row[x * 3 + 2] = b;
            }
            Ok(())
        })
}

/// Render one tile of a single scan. Returns `Cancelled` when the progress
/// handle fires; the buffer beyond rows already painted is untouched.
#[allow(clippy::too_many_arguments)]
pub fn render_tile(
    variant: RenderVariant,
    caches: &Caches,
    img: &Image,
    scr_params: &ScrToImgParameters,
    mesh: Option<Arc<Mesh>>,
    render_params: &RenderParameters,
    pixels_out: &mut [u8],
    stride: usize,
    width: usize,
    height: usize,
    xoffset: f64,
    yoffset: f64,
    step: f64,
    progress: Option<&Progress>,
) -> CoreResult<()> {
    if step <= 0.0 {
        return Err(CoreError::invalid("tile step must be positive"));
    }
    let map = ScrToImg::with_mesh(scr_params.clone(), mesh)?;
    let mut renderer = Renderer::new(
        caches,
        img,
        map,
        render_params.clone(),
        variant,
        255,
    )?;
    renderer.precompute_all(progress)?;
    paint_tile(
        pixels_out,
        stride,
        width,
        height,
        |x, y| {
            let [r, g, b] = renderer
                .render_pixel_img(xoffset + x as f64 * step, yoffset + y as f64 * step);
            [r as u8, g as u8, b as u8]
        },
        progress,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageMetadata, Linearization};
    use crate::screen::ScreenType;
    use plate_math::{Point, Vector};

    fn setup() -> (Caches, Image, ScrToImgParameters) {
        let caches = Caches::new();
        let mut img = Image::load(
            128,
            128,
            65535,
            Some(vec![30000u16; 128 * 128]),
            None,
            ImageMetadata::default(),
        )
        .unwrap();
        img.linearize(Linearization::Gamma(1.0)).unwrap();
        let params = ScrToImgParameters {
            screen_type: ScreenType::Dufay,
            center: Point::new(8.0, 8.0),
            coordinate1: Vector::new(8.0, 0.0),
            coordinate2: Vector::new(0.0, 8.0),
            ..Default::default()
        };
        (caches, img, params)
    }

    #[test]
    fn tile_respects_stride() {
        let (caches, img, params) = setup();
        let stride = 64 * 3 + 13; // deliberately padded
        let mut out = vec![0xAAu8; stride * 16];
        render_tile(
            RenderVariant::Fast,
            &caches,
            &img,
            &params,
            None,
            &RenderParameters::default(),
            &mut out,
            stride,
            64,
            16,
            10.0,
            10.0,
            1.0,
            None,
        )
        .unwrap();
        // Padding bytes untouched.
        assert_eq!(out[stride - 1], 0xAA);
        // Painted pixels are not the fill pattern.
        assert_ne!(out[0], 0xAA);
    }

    #[test]
    fn cancelled_render_reports_cancelled() {
        let (caches, img, params) = setup();
        let progress = Progress::new();
        progress.cancel();
        let mut out = vec![0u8; 32 * 32 * 3];
        let err = render_tile(
            RenderVariant::Fast,
            &caches,
            &img,
            &params,
            None,
            &RenderParameters::default(),
            &mut out,
            32 * 3,
            32,
            32,
            0.0,
            0.0,
            1.0,
            Some(&progress),
        )
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn too_small_buffer_is_rejected() {
        let (caches, img, params) = setup();
        let mut out = vec![0u8; 10];
        let err = render_tile(
            RenderVariant::Fast,
            &caches,
            &img,
            &params,
            None,
            &RenderParameters::default(),
            &mut out,
            32 * 3,
            32,
            32,
            0.0,
            0.0,
            1.0,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidParameters(_)));
    }
}
