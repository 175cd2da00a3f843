//! TIFF output.
//!
//! Everything the core emits goes through [`TiffWriter`]: 16-bit RGB (or
//! RGBA where an "unknown region" alpha is wanted), planar-contiguous,
//! top-left origin, LZW-compressed, with optional XPosition/YPosition and
//! Pixar full-size tags so stitch tiles align when overlaid in an external
//! viewer. Decoding inputs is the caller's business; the core only writes.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tiff::encoder::compression::Lzw;
use tiff::encoder::{colortype, Rational, SRational, TiffEncoder};
use tiff::tags::Tag;

use crate::{CoreError, CoreResult};

const TAG_XPOSITION: u16 = 286;
const TAG_YPOSITION: u16 = 287;
const TAG_PIXAR_IMAGEFULLWIDTH: u16 = 33300;
const TAG_PIXAR_IMAGEFULLLENGTH: u16 = 33301;
const TAG_ICC_PROFILE: u16 = 34675;
const TAG_BLACK_LEVEL: u16 = 50714;
const TAG_COLOR_MATRIX_1: u16 = 50721;

/// Builder-style writer for one output file.
pub struct TiffWriter {
    path: PathBuf,
    dpi: f64,
    /// Tile origin in pixels of the full-size image.
    position: Option<(f64, f64)>,
    /// Full-size hint for tile outputs.
    full_size: Option<(u32, u32)>,
    icc: Option<Vec<u8>>,
    /// DNG-style output: dyes→XYZ matrix plus an explicit black point.
    dng: Option<([[f64; 3]; 3], u16)>,
}

impl TiffWriter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            dpi: 300.0,
            position: None,
            full_size: None,
            icc: None,
            dng: None,
        }
    }

    pub fn dpi(mut self, dpi: f64) -> Self {
        if dpi > 0.0 {
            self.dpi = dpi;
        }
        self
    }

    /// Position of this tile inside the full image, in pixels.
    pub fn position(mut self, x: f64, y: f64) -> Self {
        self.position = Some((x, y));
        self
    }

    pub fn full_size(mut self, width: u32, height: u32) -> Self {
        self.full_size = Some((width, height));
        self
    }

    pub fn icc(mut self, profile: Vec<u8>) -> Self {
        self.icc = Some(profile);
        self
    }

    pub fn dng(mut self, dyes_to_xyz: [[f64; 3]; 3], black_level: u16) -> Self {
        self.dng = Some((dyes_to_xyz, black_level));
        self
    }

    fn wrap<T>(&self, r: Result<T, tiff::TiffError>) -> CoreResult<T> {
        r.map_err(|e| CoreError::WriteFailed {
            path: self.path.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        })
    }

    fn io_err(&self, e: std::io::Error) -> CoreError {
        CoreError::WriteFailed {
            path: self.path.display().to_string(),
            source: e,
        }
    }

    pub fn write_rgb16(&self, width: u32, height: u32, pixels: &[u16]) -> CoreResult<()> {
        self.write_impl::<colortype::RGB16>(width, height, pixels, 3)
    }

    /// RGBA with alpha 0 marking pixels no tile covers, 65535 elsewhere.
    pub fn write_rgba16(&self, width: u32, height: u32, pixels: &[u16]) -> CoreResult<()> {
        self.write_impl::<colortype::RGBA16>(width, height, pixels, 4)
    }

    pub fn write_gray16(&self, width: u32, height: u32, pixels: &[u16]) -> CoreResult<()> {
        self.write_impl::<colortype::Gray16>(width, height, pixels, 1)
    }

    fn write_impl<C>(&self, width: u32, height: u32, pixels: &[u16], samples: usize) -> CoreResult<()>
    where
        C: colortype::ColorType<Inner = u16>,
    {
        if pixels.len() != width as usize * height as usize * samples {
            return Err(CoreError::invalid("pixel buffer does not match dimensions"));
        }
        let file = File::create(&self.path).map_err(|e| self.io_err(e))?;
        let mut enc = self.wrap(TiffEncoder::new(BufWriter::new(file)))?;
        let mut image =
            self.wrap(enc.new_image_with_compression::<C, _>(width, height, Lzw))?;

        let dpi = Rational {
            n: (self.dpi * 100.0).round() as u32,
            d: 100,
        };
        self.wrap(image.encoder().write_tag(Tag::Unknown(282), dpi.clone()))?; // XResolution
        self.wrap(image.encoder().write_tag(Tag::Unknown(283), dpi))?; // YResolution
        self.wrap(image.encoder().write_tag(Tag::Unknown(296), 2u16))?; // inches

        if let Some((x, y)) = self.position {
            // Positions are stored in resolution units (inches).
            let to_rational = |v: f64| Rational {
                n: ((v / self.dpi) * 10_000.0).round().max(0.0) as u32,
                d: 10_000,
            };
            self.wrap(
                image
                    .encoder()
                    .write_tag(Tag::Unknown(TAG_XPOSITION), to_rational(x)),
            )?;
            self.wrap(
                image
                    .encoder()
                    .write_tag(Tag::Unknown(TAG_YPOSITION), to_rational(y)),
            )?;
        }
        if let Some((fw, fh)) = self.full_size {
            self.wrap(
                image
                    .encoder()
                    .write_tag(Tag::Unknown(TAG_PIXAR_IMAGEFULLWIDTH), fw),
            )?;
            self.wrap(
                image
                    .encoder()
                    .write_tag(Tag::Unknown(TAG_PIXAR_IMAGEFULLLENGTH), fh),
            )?;
        }
        if let Some(icc) = &self.icc {
            self.wrap(
                image
                    .encoder()
                    .write_tag(Tag::Unknown(TAG_ICC_PROFILE), icc.as_slice()),
            )?;
        }
        if let Some((matrix, black)) = &self.dng {
            let vals: Vec<SRational> = matrix
                .iter()
                .flatten()
                .map(|v| SRational {
                    n: (v * 10_000.0).round() as i32,
                    d: 10_000,
                })
                .collect();
            self.wrap(
                image
                    .encoder()
                    .write_tag(Tag::Unknown(TAG_COLOR_MATRIX_1), vals.as_slice()),
            )?;
            self.wrap(
                image
                    .encoder()
                    .write_tag(Tag::Unknown(TAG_BLACK_LEVEL), *black),
            )?;
        }
        self.wrap(image.write_data(pixels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_decodable_rgb_tiff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tif");
        let pixels: Vec<u16> = (0..4 * 3 * 3).map(|v| (v * 1000) as u16).collect();
        TiffWriter::new(&path).write_rgb16(4, 3, &pixels).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb16();
        assert_eq!(decoded.width(), 4);
        assert_eq!(decoded.height(), 3);
        assert_eq!(decoded.get_pixel(0, 0).0[1], 1000);
    }

    #[test]
    fn tile_tags_do_not_break_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.tif");
        let pixels = vec![0u16; 2 * 2 * 3];
        TiffWriter::new(&path)
            .dpi(300.0)
            .position(600.0, 300.0)
            .full_size(4000, 2000)
            .write_rgb16(2, 2, &pixels)
            .unwrap();
        assert!(image::open(&path).is_ok());
    }

    #[test]
    fn dng_tags_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dng.tif");
        let matrix = [[0.9, 0.05, 0.05], [0.1, 0.8, 0.1], [0.0, 0.1, 0.9]];
        TiffWriter::new(&path)
            .dng(matrix, 256)
            .write_rgb16(2, 2, &[0u16; 12])
            .unwrap();
        assert!(image::open(&path).is_ok());
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tif");
        let err = TiffWriter::new(&path).write_rgb16(4, 4, &[0u16; 3]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParameters(_)));
    }
}
