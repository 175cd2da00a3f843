//! Owned scan pixmaps and their metadata.
//!
//! An [`Image`] owns the decoded grayscale and/or RGB planes of one scan at
//! up to 16 bits per channel, together with the scanner metadata the rest of
//! the pipeline needs (DPI, pixel pitch, ICC bytes, gamma tag). The raster
//! decoder lives outside the core; it hands decoded planes to
//! [`Image::load`] and the image is read-only from then on, except for
//! cropping and rebinding the linearization table.
//!
//! The `id` is assigned once at construction and is the basis of every cache
//! key downstream, so two images never share one and an image never changes
//! its own.

use std::sync::atomic::{AtomicU64, Ordering};

use plate_math::color::srgb_to_linear;
use plate_math::{cubic_interpolate, modf_floor, Rgb};

use crate::{CoreError, CoreResult};

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> u64 {
    NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Crop rectangle in image pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// EXIF-style metadata attached by the loader. Everything is optional except
/// what a given operation actually consumes; operations report
/// [`CoreError::MetadataMissing`] when they need an absent field.
#[derive(Clone, Debug, Default)]
pub struct ImageMetadata {
    pub camera_model: Option<String>,
    pub lens: Option<String>,
    pub f_stop: Option<f64>,
    pub focal_length_mm: Option<f64>,
    pub dpi: Option<f64>,
    /// Physical sensor/scanner pixel pitch in micrometers.
    pub pixel_pitch_um: Option<f64>,
    /// Fraction of the pixel pitch that actually collects light.
    pub fill_factor: Option<f64>,
    /// Gamma the raw values are encoded with, if the file says.
    pub gamma: Option<f64>,
    /// Raw ICC profile bytes, if the file carries one.
    pub icc: Option<Vec<u8>>,
    /// Stable content id supplied by the caller; assigned fresh when absent.
    pub id: Option<u64>,
}

/// How to build the raw→linear lookup table.
#[derive(Clone, Debug, PartialEq)]
pub enum Linearization {
    /// Plain power law. `Gamma(1.0)` means the data is already linear.
    Gamma(f64),
    /// The sRGB transfer curve.
    Srgb,
    /// Use the embedded ICC profile. Only matrix/TRC gray and RGB profiles
    /// are supported; anything else reports `LinearizeUnsupported`.
    Icc,
}

/// One decoded scan.
pub struct Image {
    width: u32,
    height: u32,
    /// Largest raw value the planes can carry (65535 for 16-bit scans).
    maxval: u16,
    gray: Option<Vec<u16>>,
    /// Interleaved RGB, `3 * width * height` entries.
    rgb: Option<Vec<u16>>,
    metadata: ImageMetadata,
    crop: Option<CropRect>,
    /// raw→linear, `maxval + 1` entries; populated by [`Image::linearize`].
    lut: Option<Vec<f32>>,
    /// Separate table for the RGB plane; sRGB-tagged color scans linearize
    /// differently from the gray plane of the same file.
    rgb_lut: Option<Vec<f32>>,
    id: u64,
}

impl Image {
    /// Take ownership of decoded planes. At least one plane must be present
    /// and sized `width * height` (times 3 for RGB).
    pub fn load(
        width: u32,
        height: u32,
        maxval: u16,
        gray: Option<Vec<u16>>,
        rgb: Option<Vec<u16>>,
        metadata: ImageMetadata,
    ) -> CoreResult<Self> {
        let n = width as usize * height as usize;
        if n == 0 {
            return Err(CoreError::load("<memory>", "empty image"));
        }
        match (&gray, &rgb) {
            (None, None) => return Err(CoreError::load("<memory>", "no pixel planes")),
            (Some(g), _) if g.len() != n => {
                return Err(CoreError::load("<memory>", "gray plane size mismatch"))
            }
            (_, Some(c)) if c.len() != n * 3 => {
                return Err(CoreError::load("<memory>", "rgb plane size mismatch"))
            }
            _ => {}
        }
        let id = metadata.id.unwrap_or_else(fresh_id);
        Ok(Self {
            width,
            height,
            maxval,
            gray,
            rgb,
            metadata,
            crop: None,
            lut: None,
            rgb_lut: None,
            id,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn maxval(&self) -> u16 {
        self.maxval
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn has_rgb(&self) -> bool {
        self.rgb.is_some()
    }

    pub fn has_gray(&self) -> bool {
        self.gray.is_some()
    }

    pub fn crop(&self) -> Option<CropRect> {
        self.crop
    }

    /// Restrict all rendering to `rect`. The planes are kept whole; only the
    /// logical viewport changes, so the operation is cheap and reversible.
    pub fn set_crop(&mut self, rect: CropRect) -> CoreResult<()> {
        if rect.width == 0
            || rect.height == 0
            || rect.x + rect.width > self.width
            || rect.y + rect.height > self.height
        {
            return Err(CoreError::invalid("crop rectangle out of bounds"));
        }
        self.crop = Some(rect);
        Ok(())
    }

    pub fn clear_crop(&mut self) {
        self.crop = None;
    }

    /// Build the raw→linear tables. Must be called before any sampling
    /// request; sampling without a table is a programming error and panics
    /// in debug builds only via `debug_assert`.
    pub fn linearize(&mut self, how: Linearization) -> CoreResult<()> {
        let gamma = match &how {
            Linearization::Gamma(g) => {
                if !g.is_finite() || *g <= 0.0 {
                    return Err(CoreError::invalid("gamma must be positive"));
                }
                Some(*g)
            }
            Linearization::Srgb => None,
            Linearization::Icc => {
                // Profile parsing is out of scope for the core; a gray/RGB
                // matrix profile reduces to its TRC gamma which the loader
                // stores in metadata. Anything without that tag is refused.
                match self.metadata.gamma {
                    Some(g) => Some(g),
                    None => {
                        let name = match &self.metadata.icc {
                            Some(_) => "embedded profile without TRC gamma".to_string(),
                            None => "no embedded profile".to_string(),
                        };
                        return Err(CoreError::LinearizeUnsupported(name));
                    }
                }
            }
        };
        let table = build_lut(self.maxval, gamma);
        // The same transfer curve serves both planes unless the file tags
        // the RGB plane differently; current loaders do not.
        self.rgb_lut = Some(table.clone());
        self.lut = Some(table);
        Ok(())
    }

    pub fn is_linearized(&self) -> bool {
        self.lut.is_some()
    }

    /// Linear luminosity of the gray plane at integer coordinates; zero
    /// outside the image. When only an RGB plane exists, its green channel
    /// stands in (callers wanting a weighted mix sample RGB themselves).
    #[inline]
    pub fn fast_pixel(&self, x: i64, y: i64) -> f32 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return 0.0;
        }
        let idx = y as usize * self.width as usize + x as usize;
        if let Some(gray) = &self.gray {
            let lut = self.lut.as_deref().unwrap_or(&[]);
            debug_assert!(!lut.is_empty(), "sampling before linearize()");
            return lut.get(gray[idx] as usize).copied().unwrap_or(0.0);
        }
        if let Some(rgb) = &self.rgb {
            let lut = self.rgb_lut.as_deref().unwrap_or(&[]);
            debug_assert!(!lut.is_empty(), "sampling before linearize()");
            return lut.get(rgb[idx * 3 + 1] as usize).copied().unwrap_or(0.0);
        }
        0.0
    }

    /// Raw RGB triple, linearized, at integer coordinates.
    #[inline]
    pub fn fast_rgb_pixel(&self, x: i64, y: i64) -> Rgb {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return Rgb::default();
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        match (&self.rgb, &self.rgb_lut) {
            (Some(rgb), Some(lut)) => Rgb::new(
                lut[rgb[idx] as usize],
                lut[rgb[idx + 1] as usize],
                lut[rgb[idx + 2] as usize],
            ),
            _ => Rgb::splat(self.fast_pixel(x, y)),
        }
    }

    /// Bicubic sample of the gray plane at a sub-pixel position.
    pub fn sample_pixel(&self, x: f64, y: f64) -> f32 {
        let (ix, fx) = modf_floor(x - 0.5);
        let (iy, fy) = modf_floor(y - 0.5);
        let mut rows = [0.0f32; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            let yy = iy + r as i64 - 1;
            *row = cubic_interpolate(
                self.fast_pixel(ix - 1, yy),
                self.fast_pixel(ix, yy),
                self.fast_pixel(ix + 1, yy),
                self.fast_pixel(ix + 2, yy),
                fx as f32,
            );
        }
        cubic_interpolate(rows[0], rows[1], rows[2], rows[3], fy as f32)
    }

    /// Bicubic sample of the RGB plane (falls back to gray when absent).
    pub fn sample_rgb_pixel(&self, x: f64, y: f64) -> Rgb {
        if self.rgb.is_none() {
            return Rgb::splat(self.sample_pixel(x, y));
        }
        let (ix, fx) = modf_floor(x - 0.5);
        let (iy, fy) = modf_floor(y - 0.5);
        let mut rows = [Rgb::default(); 4];
        for (r, row) in rows.iter_mut().enumerate() {
            let yy = iy + r as i64 - 1;
            *row = plate_math::cubic_interpolate_rgb(
                self.fast_rgb_pixel(ix - 1, yy),
                self.fast_rgb_pixel(ix, yy),
                self.fast_rgb_pixel(ix + 1, yy),
                self.fast_rgb_pixel(ix + 2, yy),
                fx as f32,
            );
        }
        plate_math::cubic_interpolate_rgb(rows[0], rows[1], rows[2], rows[3], fy as f32)
    }

    /// Raw (un-linearized) gray value, for code that wants the scanner
    /// counts themselves (detector classification works in raw space).
    #[inline]
    pub fn raw_pixel(&self, x: i64, y: i64) -> u16 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return 0;
        }
        let idx = y as usize * self.width as usize + x as usize;
        match &self.gray {
            Some(gray) => gray[idx],
            None => self.rgb.as_ref().map(|p| p[idx * 3 + 1]).unwrap_or(0),
        }
    }

    #[inline]
    pub fn raw_rgb_pixel(&self, x: i64, y: i64) -> [u16; 3] {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return [0; 3];
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        match &self.rgb {
            Some(rgb) => [rgb[idx], rgb[idx + 1], rgb[idx + 2]],
            None => {
                let g = self.raw_pixel(x, y);
                [g, g, g]
            }
        }
    }
}

fn build_lut(maxval: u16, gamma: Option<f64>) -> Vec<f32> {
    let n = maxval as usize + 1;
    let mut t = Vec::with_capacity(n);
    match gamma {
        Some(g) => {
            let inv_max = 1.0 / maxval as f64;
            for v in 0..n {
                t.push((v as f64 * inv_max).powf(g) as f32);
            }
        }
        None => {
            for v in 0..n {
                t.push(srgb_to_linear(v as f32 / maxval as f32));
            }
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_image(width: u32, height: u32, fill: u16) -> Image {
        let n = (width * height) as usize;
        Image::load(
            width,
            height,
            65535,
            Some(vec![fill; n]),
            None,
            ImageMetadata::default(),
        )
        .unwrap()
    }

    #[test]
    fn ids_are_unique_and_stable() {
        let a = gray_image(4, 4, 0);
        let b = gray_image(4, 4, 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn linearize_is_monotone_and_lossless_at_16bit() {
        let mut img = gray_image(2, 2, 0);
        img.linearize(Linearization::Gamma(2.2)).unwrap();
        // Monotonicity over the full 16-bit range.
        let lut = super::build_lut(65535, Some(2.2));
        for w in lut.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert_eq!(lut[0], 0.0);
        assert!((lut[65535] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bicubic_is_exact_on_flat_data() {
        let mut img = gray_image(8, 8, 32768);
        img.linearize(Linearization::Gamma(1.0)).unwrap();
        let inner = img.sample_pixel(4.3, 4.7);
        let expect = 32768.0 / 65535.0;
        assert!((inner - expect).abs() < 1e-5);
    }

    #[test]
    fn crop_must_stay_inside() {
        let mut img = gray_image(10, 10, 0);
        assert!(img
            .set_crop(CropRect {
                x: 8,
                y: 8,
                width: 4,
                height: 4
            })
            .is_err());
        assert!(img
            .set_crop(CropRect {
                x: 2,
                y: 2,
                width: 4,
                height: 4
            })
            .is_ok());
    }

    #[test]
    fn icc_without_gamma_is_unsupported() {
        let mut img = gray_image(2, 2, 0);
        let err = img.linearize(Linearization::Icc).unwrap_err();
        assert!(matches!(err, CoreError::LinearizeUnsupported(_)));
    }
}
