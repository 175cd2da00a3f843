//! Screen detection: classify pixels, grow patches, derive the lattice.
//!
//! The detector takes a color scan of the plate, the known signature
//! colors of its black/red/green/blue patches and a bounding box, and
//! produces a fitted screen→image transform plus a bitmap of which screen
//! cells were actually seen. The classifier projects each pixel onto the
//! dye basis (the inverse of the matrix whose columns are the linearized,
//! black-subtracted signature colors) and accepts a class only when the
//! 3×3 neighborhood agrees.

pub mod lattice;
pub mod patches;

use rayon::prelude::*;

use plate_math::{ColorMatrix, Rgb};

use crate::bitmap::Bitmap2D;
use crate::geometry::{mesh::Mesh, ScrRange, ScrToImgParameters};
use crate::image::{CropRect, Image};
use crate::progress::{check_cancel, Progress};
use crate::screen::ScreenType;
use crate::{CoreError, CoreResult};

/// Pixel classes the detector works with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ColorClass {
    Red = 0,
    Green = 1,
    Blue = 2,
    Black = 3,
    Unknown = 4,
}

/// Signature colors of the screen patches in the scan, plus the scan gamma
/// they are encoded with.
#[derive(Clone, Debug, PartialEq)]
pub struct ScrDetectParameters {
    pub black: Rgb,
    pub red: Rgb,
    pub green: Rgb,
    pub blue: Rgb,
    pub gamma: f64,
    /// Patches below this pixel count are dropped.
    pub min_patch_size: usize,
    /// Flood-fill bound; larger connected regions are truncated.
    pub max_patch_size: usize,
    /// Pixels within this distance of the scan border are excluded.
    pub border: i32,
    /// A dye amount must exceed the runner-up by this factor to classify.
    pub dominance: f32,
    /// Amounts below this are black.
    pub black_ceiling: f32,
}

impl Default for ScrDetectParameters {
    fn default() -> Self {
        Self {
            black: Rgb::splat(0.05),
            red: Rgb::new(0.8, 0.15, 0.1),
            green: Rgb::new(0.2, 0.7, 0.15),
            blue: Rgb::new(0.1, 0.15, 0.7),
            gamma: 2.2,
            min_patch_size: 5,
            max_patch_size: 1000,
            border: 8,
            dominance: 1.5,
            black_ceiling: 0.2,
        }
    }
}

impl ScrDetectParameters {
    /// The dye-basis projection: inverse of (black offset ∘ dye columns).
    pub fn color_adjust(&self) -> CoreResult<ColorMatrix> {
        let inv_gamma = (1.0 / self.gamma) as f32;
        let black = self.black.pow(inv_gamma);
        let red = (self.red.pow(inv_gamma) - black).normalize();
        let green = (self.green.pow(inv_gamma) - black).normalize();
        let blue = (self.blue.pow(inv_gamma) - black).normalize();
        let t = ColorMatrix::new(
            1.0, 0.0, 0.0, black.red as f64,
            0.0, 1.0, 0.0, black.green as f64,
            0.0, 0.0, 1.0, black.blue as f64,
        );
        let m = ColorMatrix::new(
            red.red as f64, green.red as f64, blue.red as f64, 0.0,
            red.green as f64, green.green as f64, blue.green as f64, 0.0,
            red.blue as f64, green.blue as f64, blue.blue as f64, 0.0,
        );
        t.compose(&m)
            .invert()
            .ok_or_else(|| CoreError::invalid("signature colors are not independent"))
    }
}

/// Per-pixel classification of one scan region.
pub struct ColorClassMap {
    pub x0: i64,
    pub y0: i64,
    pub width: usize,
    pub height: usize,
    classes: Vec<ColorClass>,
}

impl ColorClassMap {
    #[inline]
    pub fn class(&self, x: usize, y: usize) -> ColorClass {
        if x >= self.width || y >= self.height {
            return ColorClass::Unknown;
        }
        self.classes[y * self.width + x]
    }

    /// Classify all pixels of `rect`. The raw classification is followed by
    /// the 3×3 agreement pass, so speckle noise comes out `Unknown`.
    pub fn build(
        img: &Image,
        params: &ScrDetectParameters,
        rect: CropRect,
        progress: Option<&Progress>,
    ) -> CoreResult<Self> {
        if !img.has_rgb() {
            return Err(CoreError::DetectionFailed(
                "screen detection needs a color scan".into(),
            ));
        }
        let adjust = params.color_adjust()?;
        let width = rect.width as usize;
        let height = rect.height as usize;
        let inv_gamma = (1.0 / params.gamma) as f32;
        let maxval = img.maxval() as f32;

        if let Some(p) = progress {
            p.set_task("classifying pixels", height);
        }
        let mut raw = vec![ColorClass::Unknown; width * height];
        raw.par_chunks_mut(width)
            .enumerate()
            .try_for_each(|(y, row)| -> CoreResult<()> {
                check_cancel(progress)?;
                for (x, out) in row.iter_mut().enumerate() {
                    let [r, g, b] =
                        img.raw_rgb_pixel(rect.x as i64 + x as i64, rect.y as i64 + y as i64);
                    let linear = Rgb::new(
                        (r as f32 / maxval).powf(inv_gamma),
                        (g as f32 / maxval).powf(inv_gamma),
                        (b as f32 / maxval).powf(inv_gamma),
                    );
                    let dye = adjust.apply(linear);
                    *out = classify(dye, params);
                }
                if let Some(p) = progress {
                    p.inc_progress();
                }
                Ok(())
            })?;

        // Agreement pass: a pixel keeps its class only when all 3×3
        // neighbors voted the same way.
        let mut classes = vec![ColorClass::Unknown; width * height];
        classes
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    let c = raw[y * width + x];
                    if c == ColorClass::Unknown || c == ColorClass::Black {
                        *out = c;
                        continue;
                    }
                    let mut agree = true;
                    'outer: for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            let nx = x as i64 + dx;
                            let ny = y as i64 + dy;
                            if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                                agree = false;
                                break 'outer;
                            }
                            if raw[ny as usize * width + nx as usize] != c {
                                agree = false;
                                break 'outer;
                            }
                        }
                    }
                    *out = if agree { c } else { ColorClass::Unknown };
                }
            });

        Ok(Self {
            x0: rect.x as i64,
            y0: rect.y as i64,
            width,
            height,
            classes,
        })
    }
}

fn classify(dye: Rgb, params: &ScrDetectParameters) -> ColorClass {
    let amounts = [dye.red, dye.green, dye.blue];
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| amounts[b].total_cmp(&amounts[a]));
    let top = amounts[order[0]];
    let second = amounts[order[1]].max(0.0);
    if top < params.black_ceiling {
        return ColorClass::Black;
    }
    if top > second * params.dominance {
        match order[0] {
            0 => ColorClass::Red,
            1 => ColorClass::Green,
            _ => ColorClass::Blue,
        }
    } else {
        ColorClass::Unknown
    }
}

/// Result of a successful detection.
#[derive(Debug)]
pub struct DetectedScreen {
    pub range: ScrRange,
    pub pixel_size: f64,
    /// Screen cells where a patch was actually detected.
    pub patch_bitmap: Bitmap2D,
    pub params: ScrToImgParameters,
    pub mesh: Option<Mesh>,
}

/// Run the whole detection pipeline on `rect` (defaults to the full image
/// minus the border).
pub fn detect_screen(
    img: &Image,
    dparams: &ScrDetectParameters,
    rect: Option<CropRect>,
    ty: ScreenType,
    progress: Option<&Progress>,
) -> CoreResult<DetectedScreen> {
    let rect = rect.unwrap_or(CropRect {
        x: dparams.border.max(0) as u32,
        y: dparams.border.max(0) as u32,
        width: img.width().saturating_sub(2 * dparams.border.max(0) as u32),
        height: img.height().saturating_sub(2 * dparams.border.max(0) as u32),
    });
    if rect.width == 0 || rect.height == 0 {
        return Err(CoreError::DetectionFailed("empty detection window".into()));
    }
    let class_map = ColorClassMap::build(img, dparams, rect, progress)?;
    let patch_set = patches::Patches::build(&class_map, img, dparams, progress)?;
    lattice::derive(img, &patch_set, ty, progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_signature_colors_classify_cleanly() {
        let params = ScrDetectParameters::default();
        let adjust = params.color_adjust().unwrap();
        let inv_gamma = (1.0 / params.gamma) as f32;
        for (sig, want) in [
            (params.red, ColorClass::Red),
            (params.green, ColorClass::Green),
            (params.blue, ColorClass::Blue),
            (params.black, ColorClass::Black),
        ] {
            let dye = adjust.apply(sig.pow(inv_gamma));
            assert_eq!(classify(dye, &params), want, "{:?}", sig);
        }
    }

    #[test]
    fn ambiguous_pixels_stay_unknown() {
        let params = ScrDetectParameters::default();
        // Equal red and green amounts cannot dominate.
        let dye = Rgb::new(0.5, 0.5, 0.0);
        assert_eq!(classify(dye, &params), ColorClass::Unknown);
    }

    #[test]
    fn grayscale_scans_are_rejected() {
        let img = Image::load(
            8,
            8,
            65535,
            Some(vec![0u16; 64]),
            None,
            crate::image::ImageMetadata::default(),
        )
        .unwrap();
        let err = detect_screen(
            &img,
            &ScrDetectParameters::default(),
            None,
            ScreenType::Dufay,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::DetectionFailed(_)));
    }
}
