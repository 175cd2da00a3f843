//! The renderer family.
//!
//! One concrete [`Renderer`] holds the fields every variant shares (image,
//! transform, parameters, folded color matrix, output LUT) plus a
//! [`RenderVariant`] tag carrying variant-specific state. All variants
//! answer the same `sample_pixel_*` contract:
//!
//! | Variant        | Behavior                                              |
//! |----------------|-------------------------------------------------------|
//! | `Original`     | source pixel (grayscale repeated, or the RGB sample)  |
//! | `PreviewGrid`  | schematic screen overlay for alignment                |
//! | `Realistic`    | source luminosity multiplied by the blurred screen    |
//! | `Fast`         | local per-element average, no analyzer needed         |
//! | `Interpolated` | bicubic analyzer reconstruction                       |
//! | `Predictive`   | reconstruction re-imaged through the screen           |
//! | `Combined`     | reconstruction with luminance re-matched to the scan  |
//! | `Diff`         | `0.25 + 4·brightness·(interpolated − original)`       |
//!
//! `precompute_*` are the only suspension points; sampling is synchronous
//! and a renderer must not be shared across threads (multiple renderers
//! over the same image are fine).

use std::sync::Arc;

use plate_math::{ColorMatrix, Point, Rgb, Vector};

use crate::analyze::geometry::Chan;
use crate::analyze::{AnalyzeMode, AnyAnalyzer};
use crate::cache::{AnalyzerKey, Caches};
use crate::geometry::{ScrRange, ScrToImg};
use crate::image::Image;
use crate::progress::{check_cancel, Progress};
use crate::render::downscale::{account_rgb_pixel, downscale};
use crate::render::{finish_color, ColorModel, RenderParameters};
use crate::screen::{Screen, ScreenType};
use crate::CoreResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderVariant {
    Original,
    PreviewGrid,
    Realistic,
    Fast,
    Interpolated { original_color: bool },
    Predictive,
    Combined,
    Diff,
}

impl RenderVariant {
    fn needs_screen(self) -> bool {
        matches!(
            self,
            RenderVariant::PreviewGrid | RenderVariant::Realistic | RenderVariant::Predictive
        )
    }

    fn needs_analyzer(self) -> bool {
        matches!(
            self,
            RenderVariant::Interpolated { .. }
                | RenderVariant::Predictive
                | RenderVariant::Combined
                | RenderVariant::Diff
        )
    }
}

/// Final-frame viewport of one renderer, in output canvas pixels.
#[derive(Clone, Copy, Debug, Default)]
pub struct FinalRange {
    pub xshift: f64,
    pub yshift: f64,
    pub width: u32,
    pub height: u32,
}

pub struct Renderer<'a> {
    caches: &'a Caches,
    img: &'a Image,
    map: ScrToImg,
    params: RenderParameters,
    variant: RenderVariant,
    dst_maxval: u32,
    matrix: ColorMatrix,
    out_lut: Arc<Vec<u16>>,
    /// Resolved once; `None` means linear output.
    out_curve: Option<crate::render::Curve>,
    /// Diff renders its two inner reconstructions with neutralized
    /// parameters; the user brightness only scales the final subtraction.
    inner_params: RenderParameters,
    inner_matrix: ColorMatrix,
    inner_out_curve: Option<crate::render::Curve>,
    screen: Option<Arc<Screen>>,
    analyzer: Option<Arc<AnyAnalyzer>>,
    /// Original-color reconstruction for diff.
    analyzer_orig: Option<Arc<AnyAnalyzer>>,
    range: ScrRange,
    final_range: FinalRange,
    precomputed: bool,
}

impl<'a> Renderer<'a> {
    pub fn new(
        caches: &'a Caches,
        img: &'a Image,
        map: ScrToImg,
        params: RenderParameters,
        variant: RenderVariant,
        dst_maxval: u32,
    ) -> CoreResult<Self> {
        let (gray_min, gray_max) = params.effective_gray_range();
        let out_lut = caches.luts.output(dst_maxval, 2.2, gray_min, gray_max);
        let matrix = params.color_matrix();
        let mut inner_params = params.clone();
        inner_params.brightness = 1.0;
        inner_params.color_model = ColorModel::None;
        inner_params.white_balance = Rgb::splat(1.0);
        let inner_matrix = inner_params.color_matrix();
        let out_curve = params.effective_output_curve();
        let inner_out_curve = inner_params.effective_output_curve();
        // A crop narrows the screen range the renderer covers; the final
        // canvas follows it.
        let range = match img.crop() {
            Some(c) => map.get_range_rect(
                c.x as f64,
                c.y as f64,
                c.width as f64,
                c.height as f64,
            ),
            None => map.get_range(img.width(), img.height()),
        };
        Ok(Self {
            caches,
            img,
            map,
            params,
            variant,
            dst_maxval,
            matrix,
            out_lut,
            out_curve,
            inner_params,
            inner_matrix,
            inner_out_curve,
            screen: None,
            analyzer: None,
            analyzer_orig: None,
            range,
            final_range: FinalRange::default(),
            precomputed: false,
        })
    }

    pub fn variant(&self) -> RenderVariant {
        self.variant
    }

    pub fn map(&self) -> &ScrToImg {
        &self.map
    }

    pub fn params(&self) -> &RenderParameters {
        &self.params
    }

    pub fn range(&self) -> ScrRange {
        self.range
    }

    pub fn final_range(&self) -> FinalRange {
        self.final_range
    }

    pub fn analyzer(&self) -> Option<&Arc<AnyAnalyzer>> {
        self.analyzer.as_ref()
    }

    pub fn out_lut(&self) -> &Arc<Vec<u16>> {
        &self.out_lut
    }

    /// Output quantization ceiling (255 for 8-bit tiles, 65535 for TIFF).
    pub fn dst_maxval(&self) -> u32 {
        self.dst_maxval
    }

    fn screen_blur_periods(&self) -> f64 {
        let center = Point::new(
            self.img.width() as f64 / 2.0,
            self.img.height() as f64 / 2.0,
        );
        self.params.screen_blur_radius * self.map.pixel_size(center)
    }

    fn analyzer_mode(&self, original_color: bool) -> AnalyzeMode {
        match (original_color, self.params.precise) {
            (false, true) => AnalyzeMode::Precise,
            (false, false) => AnalyzeMode::Fast,
            (true, true) => AnalyzeMode::PreciseRgb,
            (true, false) => AnalyzeMode::Color,
        }
    }

    fn build_analyzer(
        &self,
        mode: AnalyzeMode,
        screen: &Arc<Screen>,
        progress: Option<&Progress>,
    ) -> CoreResult<Arc<AnyAnalyzer>> {
        let key = AnalyzerKey {
            image_id: self.img.id(),
            screen_id: if mode.uses_collection() { screen.id() } else { 0 },
            mesh_id: self.map.mesh_id(),
            gamma_bits: self.params.gamma.to_bits(),
            mode,
            collection_threshold_bits: self.params.collection_threshold.to_bits(),
            params: self.map.params().clone(),
        };
        self.caches.analyzers.get_or_try_build(key, || {
            AnyAnalyzer::analyze(
                self.map.screen_type(),
                self.img,
                &self.map,
                mode.uses_collection().then_some(screen.as_ref()),
                self.range,
                mode,
                self.params.collection_threshold,
                progress,
            )
        })
    }

    /// Build whatever the variant needs. Idempotent; all expensive work is
    /// cache-key-checked, so calling this again after a parameter change
    /// only rebuilds what the change invalidated.
    pub fn precompute_all(&mut self, progress: Option<&Progress>) -> CoreResult<()> {
        check_cancel(progress)?;
        self.compute_final_range();
        let ty = self.map.screen_type();
        if self.variant.needs_screen() && self.screen.is_none() {
            self.screen = Some(match self.variant {
                RenderVariant::PreviewGrid => self
                    .caches
                    .screens
                    .preview(ty, self.map.patch_proportions())?,
                _ => self.caches.screens.get(
                    ty,
                    self.screen_blur_periods(),
                    self.map.patch_proportions(),
                )?,
            });
        }
        if self.variant.needs_analyzer() {
            // The collection screen weights precise analysis.
            let screen = match &self.screen {
                Some(s) => s.clone(),
                None => self.caches.screens.get(
                    ty,
                    self.screen_blur_periods(),
                    self.map.patch_proportions(),
                )?,
            };
            let original_color = matches!(
                self.variant,
                RenderVariant::Interpolated { original_color: true }
            );
            if self.analyzer.is_none() {
                self.analyzer = Some(self.build_analyzer(
                    self.analyzer_mode(original_color),
                    &screen,
                    progress,
                )?);
            }
            if matches!(self.variant, RenderVariant::Diff) && self.analyzer_orig.is_none() {
                self.analyzer_orig =
                    Some(self.build_analyzer(self.analyzer_mode(true), &screen, progress)?);
            }
        }
        self.precomputed = true;
        Ok(())
    }

    /// Range-limited precompute. The caches make partial builds moot, so
    /// this validates the rectangle and delegates; it exists so callers can
    /// express intent and keep working when only a tile is needed.
    pub fn precompute_img_range(
        &mut self,
        _x1: i64,
        _y1: i64,
        _x2: i64,
        _y2: i64,
        progress: Option<&Progress>,
    ) -> CoreResult<()> {
        self.precompute_all(progress)
    }

    fn compute_final_range(&mut self) {
        let shift = Vector::new(self.range.xshift as f64, self.range.yshift as f64);
        let mut min = Point::new(f64::MAX, f64::MAX);
        let mut max = Point::new(f64::MIN, f64::MIN);
        for cx in 0..=1 {
            for cy in 0..=1 {
                let scr = Point::new(
                    (cx * self.range.width) as f64,
                    (cy * self.range.height) as f64,
                ) - shift;
                let f = self.map.to_final(scr);
                min = Point::new(min.x.min(f.x), min.y.min(f.y));
                max = Point::new(max.x.max(f.x), max.y.max(f.y));
            }
        }
        self.final_range = FinalRange {
            xshift: -min.x,
            yshift: -min.y,
            width: (max.x - min.x).ceil() as u32,
            height: (max.y - min.y).ceil() as u32,
        };
    }

    fn shift(&self) -> Vector {
        Vector::new(self.range.xshift as f64, self.range.yshift as f64)
    }

    /// Scan luminosity at an image position, respecting the RGB mix
    /// weights for color scans.
    fn scan_luminosity(&self, p: Point) -> f32 {
        if self.img.has_rgb() && !self.img.has_gray() {
            self.params.mix_luminosity(self.img.sample_rgb_pixel(p.x, p.y))
        } else {
            self.img.sample_pixel(p.x, p.y)
        }
    }

    fn interp_sample(&self, analyzer: &AnyAnalyzer, scr: Point, original_color: bool) -> Rgb {
        let shifted = scr + self.shift();
        if original_color {
            Rgb::new(
                analyzer.sample_channel_rgb(Chan::Red, shifted).red,
                analyzer.sample_channel_rgb(Chan::Green, shifted).green,
                analyzer.sample_channel_rgb(Chan::Blue, shifted).blue,
            )
        } else {
            analyzer.sample_rgb(shifted)
        }
    }

    /// Raw dye triple of the variant before the color pipeline.
    fn dye_sample_scr(&self, scr: Point) -> Rgb {
        debug_assert!(self.precomputed, "sampling before precompute");
        match self.variant {
            RenderVariant::Original => {
                let p = self.map.to_img(scr);
                if self.img.has_rgb() {
                    self.img.sample_rgb_pixel(p.x, p.y)
                } else {
                    Rgb::splat(self.img.sample_pixel(p.x, p.y))
                }
            }
            RenderVariant::PreviewGrid | RenderVariant::Realistic => {
                let screen = self.screen.as_ref().expect("precomputed screen");
                let shifted = scr + self.shift();
                let (mult, add) = screen.at(shifted.x, shifted.y);
                let p = self.map.to_img(scr);
                let src = if self.img.has_rgb() {
                    self.img.sample_rgb_pixel(p.x, p.y)
                } else {
                    Rgb::splat(self.img.sample_pixel(p.x, p.y))
                };
                (src * mult + add).clamp01()
            }
            RenderVariant::Fast => self.fast_sample(scr),
            RenderVariant::Interpolated { original_color } => {
                let analyzer = self.analyzer.as_ref().expect("precomputed analyzer");
                self.interp_sample(analyzer, scr, original_color)
            }
            RenderVariant::Predictive => {
                // The reconstruction re-imaged through the screen: the
                // predicted monochrome scan value is the light every dye
                // passes through the local filter element. Diffing this
                // against the actual scan reveals registration error.
                let analyzer = self.analyzer.as_ref().expect("precomputed analyzer");
                let screen = self.screen.as_ref().expect("precomputed screen");
                let c = self.interp_sample(analyzer, scr, false);
                let shifted = scr + self.shift();
                let (mult, add) = screen.at(shifted.x, shifted.y);
                let lum = c.red * mult.red
                    + c.green * mult.green
                    + c.blue * mult.blue
                    + add.red
                    + add.green
                    + add.blue;
                Rgb::splat(lum).clamp01()
            }
            // Combined and diff finish differently; their dye sample is the
            // plain reconstruction.
            RenderVariant::Combined | RenderVariant::Diff => {
                let analyzer = self.analyzer.as_ref().expect("precomputed analyzer");
                self.interp_sample(analyzer, scr, false)
            }
        }
    }

    /// Per-screen-element local averages; the four corner pixels of the
    /// element, no analyzer needed. Element offsets follow the physical
    /// layout of each screen family.
    fn fast_sample(&self, scr: Point) -> Rgb {
        let base = Point::new(scr.x.floor(), scr.y.floor());
        let px = |dx: f64, dy: f64| -> f32 {
            let p = self.map.to_img(Point::new(base.x + dx, base.y + dy));
            self.scan_luminosity(p)
        };
        match self.map.screen_type() {
            ScreenType::Dufay => Rgb::new(
                (px(0.0, 0.5) + px(0.33, 0.5) + px(0.66, 0.5) + px(1.0, 0.5)) * 0.25,
                (px(0.0, 0.0) + px(0.0, 1.0) + px(1.0, 0.0) + px(1.0, 1.0)) * 0.25,
                (px(0.5, 0.0) + px(0.5, 1.0)) * 0.5,
            ),
            ScreenType::WarnerPowrie => Rgb::new(
                (px(2.0 / 3.0, 0.0) + px(2.0 / 3.0, 0.5) + px(2.0 / 3.0, 1.0)) / 3.0,
                (px(0.0, 0.0) + px(0.0, 0.5) + px(0.0, 1.0)) / 3.0,
                (px(1.0 / 3.0, 0.0) + px(1.0 / 3.0, 0.5) + px(1.0 / 3.0, 1.0)) / 3.0,
            ),
            _ => Rgb::new(
                (px(0.5, 0.0) + px(0.0, 0.5) + px(1.0, 0.5) + px(0.5, 1.0)) * 0.25,
                ((px(0.0, 0.0) + px(0.0, 1.0) + px(1.0, 0.0) + px(1.0, 1.0)) * 0.25
                    + px(0.5, 0.5))
                    * 0.5,
                (px(0.25, 0.25) + px(0.75, 0.25) + px(0.25, 0.75) + px(0.75, 0.75)) * 0.25,
            ),
        }
    }

    /// Final linear color in [0,1] at a screen position.
    pub fn sample_pixel_scr(&self, scr: Point) -> Rgb {
        match self.variant {
            RenderVariant::Combined => {
                let c = self.dye_sample_scr(scr);
                let c = self.matrix.apply(c * self.params.white_balance);
                let p = self.map.to_img(scr);
                let actual = self
                    .matrix
                    .apply(Rgb::splat(self.scan_luminosity(p)))
                    .clamp01()
                    .luminosity();
                let lum = c.clamp01().luminosity();
                if lum <= 1e-5 || actual <= 1e-5 {
                    Rgb::splat(actual).clamp01()
                } else {
                    (c * (actual / lum)).clamp01()
                }
            }
            RenderVariant::Diff => {
                let interp = finish_color(
                    &self.inner_params,
                    &self.inner_matrix,
                    self.inner_out_curve.as_ref(),
                    self.dye_sample_scr(scr),
                );
                let orig_analyzer =
                    self.analyzer_orig.as_ref().expect("precomputed analyzer");
                let orig = finish_color(
                    &self.inner_params,
                    &self.inner_matrix,
                    self.inner_out_curve.as_ref(),
                    self.interp_sample(orig_analyzer, scr, true),
                );
                let b = self.params.brightness as f32;
                (Rgb::splat(0.25) + (interp - orig) * (4.0 * b)).clamp01()
            }
            _ => finish_color(
                &self.params,
                &self.matrix,
                self.out_curve.as_ref(),
                self.dye_sample_scr(scr),
            ),
        }
    }

    pub fn sample_pixel_img(&self, x: f64, y: f64) -> Rgb {
        match self.variant {
            // Original rendering does not need the transform at all.
            RenderVariant::Original => finish_color(
                &self.params,
                &self.matrix,
                self.out_curve.as_ref(),
                if self.img.has_rgb() {
                    self.img.sample_rgb_pixel(x, y)
                } else {
                    Rgb::splat(self.img.sample_pixel(x, y))
                },
            ),
            _ => self.sample_pixel_scr(self.map.to_scr(Point::new(x, y))),
        }
    }

    pub fn fast_sample_pixel_img(&self, x: i64, y: i64) -> Rgb {
        self.sample_pixel_img(x as f64 + 0.5, y as f64 + 0.5)
    }

    /// Sample in the final output canvas (crop and rotation baseline
    /// applied).
    pub fn sample_pixel_final(&self, x: f64, y: f64) -> Rgb {
        let scr = self
            .map
            .final_to_scr(Point::new(x - self.final_range.xshift, y - self.final_range.yshift));
        self.sample_pixel_scr(scr)
    }

    /// Quantize a linear color through the output LUT.
    #[inline]
    pub fn quantize(&self, c: Rgb) -> [u16; 3] {
        let q = |v: f32| -> u16 {
            let idx = (v.clamp(0.0, 1.0) * 65535.0 + 0.5) as usize;
            self.out_lut[idx.min(65535)]
        };
        [q(c.red), q(c.green), q(c.blue)]
    }

    pub fn render_pixel_scr(&self, scr: Point) -> [u16; 3] {
        self.quantize(self.sample_pixel_scr(scr))
    }

    pub fn render_pixel_img(&self, x: f64, y: f64) -> [u16; 3] {
        self.quantize(self.sample_pixel_img(x, y))
    }

    pub fn render_pixel_final(&self, x: f64, y: f64) -> [u16; 3] {
        self.quantize(self.sample_pixel_final(x, y))
    }

    /// Downscaled color data over image coordinates, through the shared
    /// downscale kernel.
    pub fn get_color_data(
        &self,
        dst: &mut [Rgb],
        x: f64,
        y: f64,
        width: usize,
        height: usize,
        pixelsize: f64,
        progress: Option<&Progress>,
    ) -> CoreResult<()> {
        downscale(
            dst,
            x,
            y,
            width,
            height,
            pixelsize,
            |px, py| self.fast_sample_pixel_img(px, py),
            account_rgb_pixel,
            progress,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ScrToImgParameters;
    use crate::image::{Image, ImageMetadata, Linearization};
    use crate::screen::StripWidths;

    fn test_image(w: u32, h: u32) -> Image {
        let mut data = vec![0u16; (w * h) as usize];
        for (i, v) in data.iter_mut().enumerate() {
            *v = ((i * 7919) % 60000) as u16 + 1000;
        }
        let mut img =
            Image::load(w, h, 65535, Some(data), None, ImageMetadata::default()).unwrap();
        img.linearize(Linearization::Gamma(1.0)).unwrap();
        img
    }

    fn dufay_map() -> ScrToImg {
        ScrToImg::new(ScrToImgParameters {
            screen_type: ScreenType::Dufay,
            center: Point::new(8.0, 8.0),
            coordinate1: Vector::new(19.0, 0.0),
            coordinate2: Vector::new(0.0, 24.5),
            ..Default::default()
        })
        .unwrap()
    }

    fn neutral_params() -> RenderParameters {
        RenderParameters {
            saturation: 1.0,
            presaturation: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn fast_render_produces_no_zero_pixels_on_positive_input() {
        let caches = Caches::new();
        let img = test_image(256, 256);
        let mut r = Renderer::new(
            &caches,
            &img,
            dufay_map(),
            neutral_params(),
            RenderVariant::Fast,
            65535,
        )
        .unwrap();
        r.precompute_all(None).unwrap();
        for y in (8..248).step_by(37) {
            for x in (8..248).step_by(41) {
                let [pr, pg, pb] = r.render_pixel_img(x as f64, y as f64);
                assert!(pr > 0 && pg > 0 && pb > 0, "zero at {x},{y}");
            }
        }
    }

    #[test]
    fn realistic_render_multiplies_through_the_screen() {
        let caches = Caches::new();
        let img = test_image(128, 128);
        let mut params = neutral_params();
        params.screen_blur_radius = 0.0;
        let mut r = Renderer::new(
            &caches,
            &img,
            dufay_map(),
            params,
            RenderVariant::Realistic,
            65535,
        )
        .unwrap();
        r.precompute_all(None).unwrap();
        // A red screen cell only passes the red channel.
        let screen = Screen::analytic(ScreenType::Dufay, StripWidths::default()).unwrap();
        let shifted_probe = Point::new(0.0, 0.5);
        let (mult, _) = screen.at(shifted_probe.x, shifted_probe.y);
        assert_eq!(mult, Rgb::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn diff_of_identical_reconstructions_is_mid_gray() {
        // On a constant image, the interpolated reconstruction and the
        // original-color reconstruction agree, so diff sits at 0.25.
        let caches = Caches::new();
        let mut data = vec![30000u16; 256 * 256];
        data[0] = 30000;
        let mut img =
            Image::load(256, 256, 65535, Some(data), None, ImageMetadata::default()).unwrap();
        img.linearize(Linearization::Gamma(1.0)).unwrap();
        let mut r = Renderer::new(
            &caches,
            &img,
            dufay_map(),
            neutral_params(),
            RenderVariant::Diff,
            65535,
        )
        .unwrap();
        r.precompute_all(None).unwrap();
        let c = r.sample_pixel_scr(Point::new(3.0, 3.0));
        for v in [c.red, c.green, c.blue] {
            assert!((v - 0.25).abs() < 1e-3, "{v}");
        }
    }

    #[test]
    fn renderers_share_luts_through_the_pool() {
        let caches = Caches::new();
        let img = test_image(64, 64);
        let mut r1 = Renderer::new(
            &caches,
            &img,
            dufay_map(),
            neutral_params(),
            RenderVariant::Original,
            65535,
        )
        .unwrap();
        let mut r2 = Renderer::new(
            &caches,
            &img,
            dufay_map(),
            neutral_params(),
            RenderVariant::Fast,
            65535,
        )
        .unwrap();
        r1.precompute_all(None).unwrap();
        r2.precompute_all(None).unwrap();
        assert!(Arc::ptr_eq(r1.out_lut(), r2.out_lut()));
    }

    #[test]
    fn interpolated_render_of_flat_image_is_flat() {
        let caches = Caches::new();
        let mut img = Image::load(
            256,
            256,
            65535,
            Some(vec![40000u16; 256 * 256]),
            None,
            ImageMetadata::default(),
        )
        .unwrap();
        img.linearize(Linearization::Gamma(1.0)).unwrap();
        let mut r = Renderer::new(
            &caches,
            &img,
            dufay_map(),
            neutral_params(),
            RenderVariant::Interpolated { original_color: false },
            65535,
        )
        .unwrap();
        r.precompute_all(None).unwrap();
        let a = r.sample_pixel_scr(Point::new(4.0, 4.0));
        let b = r.sample_pixel_scr(Point::new(6.3, 5.1));
        assert!((a.red - b.red).abs() < 1e-3);
        assert!((a.green - b.green).abs() < 1e-3);
    }
}
