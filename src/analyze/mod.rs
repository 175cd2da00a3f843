//! Per-element intensity and RGB collection.
//!
//! An [`Analyzer`] records one value per colored screen element, computed
//! from the scan. Four modes exist:
//!
//! * `Fast` — one bicubic lookup at the nominal center of each element.
//! * `Precise` — every covered image pixel is projected into screen space;
//!   where the screen multiplier of a channel exceeds the collection
//!   threshold, `weight · luminosity` is accumulated into the element and
//!   `weight` into a parallel array, then normalized.
//! * `Color` / `PreciseRgb` — the same weighted collection, accumulating
//!   the full RGB triple; used for color calibration and original-color
//!   rendering. `Fast` is the only mode that samples nominal centers.
//!
//! The precise loops run in parallel across image rows; element cells can
//! be hit from several rows at once, so accumulation uses atomic f32
//! adds (compare-exchange on the bit pattern). The result is independent of
//! the thread schedule: commutative sums followed by a barrier and one
//! division.

pub mod geometry;

use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

use plate_math::{cubic_interpolate, modf_floor, IntPoint, Point, Rgb};

use crate::bitmap::Bitmap2D;
use crate::geometry::{ScrRange, ScrToImg};
use crate::image::Image;
use crate::progress::{check_cancel, Progress};
use crate::screen::{Screen, ScreenType};
use crate::{CoreError, CoreResult};
use self::geometry::{
    clamped_plane_index, entry_at, nearest_entry, plane_index, Chan, DufayGeometry,
    PagetGeometry, ScreenGeometry, StripsGeometry, CHANNELS,
};

/// f32 accumulator shared across rayon rows.
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn zero() -> Self {
        Self(AtomicU32::new(0f32.to_bits()))
    }

    fn fetch_add(&self, v: f32) {
        let mut old = self.0.load(Ordering::Relaxed);
        loop {
            let new = (f32::from_bits(old) + v).to_bits();
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }

    fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalyzeMode {
    Fast,
    Precise,
    Color,
    PreciseRgb,
}

impl AnalyzeMode {
    pub fn is_rgb(self) -> bool {
        matches!(self, AnalyzeMode::Color | AnalyzeMode::PreciseRgb)
    }

    /// Weighted accumulation against the screen tile; every mode except
    /// `Fast`, which samples nominal element centers instead.
    pub fn uses_collection(self) -> bool {
        !matches!(self, AnalyzeMode::Fast)
    }
}

/// Per-channel contrast window from `analyze_range`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelRange {
    pub min: f32,
    pub max: f32,
}

#[derive(Debug)]
pub struct Analyzer<G: ScreenGeometry> {
    mode: AnalyzeMode,
    range: ScrRange,
    /// Scalar planes, one entry per element; always populated (in RGB modes
    /// they carry the matching component so matching and dumps work in
    /// every mode).
    luma: [Vec<f32>; 3],
    /// Full triples, only in RGB modes.
    rgb: Option<[Vec<Rgb>; 3]>,
    /// Period cells with trustworthy data.
    known: Bitmap2D,
    n_known: usize,
    _geometry: std::marker::PhantomData<G>,
}

impl<G: ScreenGeometry> Analyzer<G> {
    /// Run the analysis. `screen` supplies the per-channel collection
    /// weights and is required by every mode except `Fast`.
    pub fn analyze(
        img: &Image,
        map: &ScrToImg,
        screen: Option<&Screen>,
        range: ScrRange,
        mode: AnalyzeMode,
        collection_threshold: f32,
        progress: Option<&Progress>,
    ) -> CoreResult<Self> {
        if range.width <= 0 || range.height <= 0 {
            return Err(CoreError::invalid("empty screen range"));
        }
        let mut result = Self {
            mode,
            range,
            luma: [Vec::new(), Vec::new(), Vec::new()],
            rgb: mode.is_rgb().then(|| [Vec::new(), Vec::new(), Vec::new()]),
            known: Bitmap2D::new(range.width as usize, range.height as usize),
            n_known: 0,
            _geometry: std::marker::PhantomData,
        };
        if mode.uses_collection() {
            let screen = screen.ok_or_else(|| {
                CoreError::invalid("weighted collection needs a screen tile")
            })?;
            result.analyze_precise(img, map, screen, collection_threshold, progress)?;
        } else {
            result.analyze_fast(img, map, progress)?;
        }
        result.compute_known(img, map, 0);
        Ok(result)
    }

    pub fn mode(&self) -> AnalyzeMode {
        self.mode
    }

    pub fn range(&self) -> ScrRange {
        self.range
    }

    pub fn known_pixels(&self) -> &Bitmap2D {
        &self.known
    }

    pub fn n_known(&self) -> usize {
        self.n_known
    }

    /// Replace the known-pixel mask (the stitcher installs border-trimmed
    /// masks of its own).
    pub fn set_known_pixels(&mut self, known: Bitmap2D) {
        self.n_known = known.count();
        self.known = known;
    }

    fn shift(&self) -> plate_math::Vector {
        plate_math::Vector::new(self.range.xshift as f64, self.range.yshift as f64)
    }

    fn analyze_fast(
        &mut self,
        img: &Image,
        map: &ScrToImg,
        progress: Option<&Progress>,
    ) -> CoreResult<()> {
        let (w, h) = (self.range.width, self.range.height);
        let shift = self.shift();
        if let Some(p) = progress {
            p.set_task("sampling screen elements", 3);
        }
        for (ci, c) in CHANNELS.iter().copied().enumerate() {
            check_cancel(progress)?;
            let (pw, ph) = G::dims(c, w, h);
            let mut plane = crate::error::try_alloc::<f32>(pw * ph, "analyzer plane")?;
            plane
                .par_chunks_mut(pw)
                .enumerate()
                .for_each(|(iy, row)| {
                    for (ix, cell) in row.iter_mut().enumerate() {
                        let e = entry_at::<G>(c, ix, iy, w, h);
                        let scr = G::to_scr(c, e) - shift;
                        let p = map.to_img(scr);
                        *cell = img.sample_pixel(p.x, p.y);
                    }
                });
            if self.rgb.is_some() {
                let mut rgb_plane =
                    crate::error::try_alloc::<Rgb>(pw * ph, "analyzer rgb plane")?;
                rgb_plane
                    .par_chunks_mut(pw)
                    .enumerate()
                    .for_each(|(iy, row)| {
                        for (ix, cell) in row.iter_mut().enumerate() {
                            let e = entry_at::<G>(c, ix, iy, w, h);
                            let scr = G::to_scr(c, e) - shift;
                            let p = map.to_img(scr);
                            *cell = img.sample_rgb_pixel(p.x, p.y);
                        }
                    });
                if let Some(planes) = self.rgb.as_mut() {
                    planes[ci] = rgb_plane;
                }
            }
            self.luma[ci] = plane;
            if let Some(p) = progress {
                p.inc_progress();
            }
        }
        Ok(())
    }

    fn analyze_precise(
        &mut self,
        img: &Image,
        map: &ScrToImg,
        screen: &Screen,
        collection_threshold: f32,
        progress: Option<&Progress>,
    ) -> CoreResult<()> {
        let (w, h) = (self.range.width, self.range.height);
        let shift = self.shift();
        let rgb_mode = self.mode.is_rgb();

        struct ChanAcc {
            sum: Vec<AtomicF32>,
            sum_rgb: Option<[Vec<AtomicF32>; 3]>,
            weight: Vec<AtomicF32>,
        }
        fn alloc_acc(n: usize) -> CoreResult<Vec<AtomicF32>> {
            let mut v = Vec::new();
            v.try_reserve_exact(n).map_err(|_| CoreError::OutOfMemory {
                what: "analyzer accumulator".into(),
                bytes: n * std::mem::size_of::<AtomicF32>(),
            })?;
            v.extend((0..n).map(|_| AtomicF32::zero()));
            Ok(v)
        }
        let mut acc: Vec<ChanAcc> = Vec::with_capacity(3);
        for &c in CHANNELS.iter() {
            let (pw, ph) = G::dims(c, w, h);
            let n = pw * ph;
            acc.push(ChanAcc {
                sum: alloc_acc(n)?,
                sum_rgb: if rgb_mode {
                    Some([alloc_acc(n)?, alloc_acc(n)?, alloc_acc(n)?])
                } else {
                    None
                },
                weight: alloc_acc(n)?,
            });
        }

        if let Some(p) = progress {
            p.set_task("collecting color information", img.height() as usize);
        }
        (0..img.height() as i64)
            .into_par_iter()
            .try_for_each(|y| -> CoreResult<()> {
                check_cancel(progress)?;
                for x in 0..img.width() as i64 {
                    let scr =
                        map.to_scr(Point::new(x as f64 + 0.5, y as f64 + 0.5)) + shift;
                    if scr.x < 0.0
                        || scr.y < 0.0
                        || scr.x >= w as f64
                        || scr.y >= h as f64
                    {
                        continue;
                    }
                    let (mult, _) = screen.at(scr.x, scr.y);
                    let weights = [mult.red, mult.green, mult.blue];
                    let lum = img.fast_pixel(x, y);
                    let rgb = rgb_mode.then(|| img.fast_rgb_pixel(x, y));
                    for (ci, c) in CHANNELS.iter().copied().enumerate() {
                        let wgt = weights[ci];
                        if wgt <= collection_threshold {
                            continue;
                        }
                        let e = nearest_entry::<G>(c, scr);
                        let Some(idx) = plane_index::<G>(c, e, w, h) else {
                            continue;
                        };
                        let a = &acc[ci];
                        a.weight[idx].fetch_add(wgt);
                        a.sum[idx].fetch_add(wgt * lum);
                        if let (Some(sum_rgb), Some(rgb)) = (&a.sum_rgb, rgb) {
                            sum_rgb[0][idx].fetch_add(wgt * rgb.red);
                            sum_rgb[1][idx].fetch_add(wgt * rgb.green);
                            sum_rgb[2][idx].fetch_add(wgt * rgb.blue);
                        }
                    }
                }
                if let Some(p) = progress {
                    p.inc_progress();
                }
                Ok(())
            })?;

        // Normalize; zero-weight cells fall back to the unadjusted image
        // value at the element position.
        for (ci, c) in CHANNELS.iter().copied().enumerate() {
            check_cancel(progress)?;
            let (pw, ph) = G::dims(c, w, h);
            let a = &acc[ci];
            let mut plane = crate::error::try_alloc::<f32>(pw * ph, "analyzer plane")?;
            plane
                .par_chunks_mut(pw)
                .enumerate()
                .for_each(|(iy, row)| {
                    for (ix, cell) in row.iter_mut().enumerate() {
                        let idx = iy * pw + ix;
                        let wgt = a.weight[idx].get();
                        *cell = if wgt > 0.0 {
                            a.sum[idx].get() / wgt
                        } else {
                            let e = entry_at::<G>(c, ix, iy, w, h);
                            let p = map.to_img(G::to_scr(c, e) - shift);
                            img.sample_pixel(p.x, p.y)
                        };
                    }
                });
            if let Some(sum_rgb) = &a.sum_rgb {
                let mut rgb_plane =
                    crate::error::try_alloc::<Rgb>(pw * ph, "analyzer rgb plane")?;
                rgb_plane
                    .par_chunks_mut(pw)
                    .enumerate()
                    .for_each(|(iy, row)| {
                        for (ix, cell) in row.iter_mut().enumerate() {
                            let idx = iy * pw + ix;
                            let wgt = a.weight[idx].get();
                            *cell = if wgt > 0.0 {
                                Rgb::new(
                                    sum_rgb[0][idx].get() / wgt,
                                    sum_rgb[1][idx].get() / wgt,
                                    sum_rgb[2][idx].get() / wgt,
                                )
                            } else {
                                let e = entry_at::<G>(c, ix, iy, w, h);
                                let p = map.to_img(G::to_scr(c, e) - shift);
                                img.sample_rgb_pixel(p.x, p.y)
                            };
                        }
                    });
                if let Some(planes) = self.rgb.as_mut() {
                    planes[ci] = rgb_plane;
                }
            }
            self.luma[ci] = plane;
        }
        Ok(())
    }

    /// Mark period cells whose whole footprint lands inside the image,
    /// `border` pixels away from the scan edge.
    fn compute_known(&mut self, img: &Image, map: &ScrToImg, border: i32) {
        let shift = self.shift();
        let (iw, ih) = (img.width() as f64, img.height() as f64);
        let b = border as f64;
        let mut n = 0usize;
        for y in 0..self.range.height {
            for x in 0..self.range.width {
                let inside = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)]
                    .iter()
                    .all(|&(dx, dy)| {
                        let scr = Point::new(x as f64 + dx, y as f64 + dy) - shift;
                        let p = map.to_img(scr);
                        p.x >= b && p.y >= b && p.x < iw - b && p.y < ih - b
                    });
                if inside {
                    self.known.set(x as usize, y as usize);
                    n += 1;
                }
            }
        }
        self.n_known = n;
    }

    fn plane_value(&self, c: Chan, e: IntPoint) -> f32 {
        let ci = c as usize;
        self.luma[ci][clamped_plane_index::<G>(c, e, self.range.width, self.range.height)]
    }

    fn plane_rgb(&self, c: Chan, e: IntPoint) -> Rgb {
        let ci = c as usize;
        match &self.rgb {
            Some(planes) => {
                planes[ci]
                    [clamped_plane_index::<G>(c, e, self.range.width, self.range.height)]
            }
            None => Rgb::splat(self.plane_value(c, e)),
        }
    }

    /// Bicubic sample of one channel at a shifted screen position.
    pub fn sample_channel(&self, c: Chan, scr: Point) -> f32 {
        let l = G::to_lattice(c, scr);
        let (ix, fx) = modf_floor(l.x);
        let (iy, fy) = modf_floor(l.y);
        let mut rows = [0.0f32; 4];
        for (r, out) in rows.iter_mut().enumerate() {
            let ey = iy as i32 + r as i32 - 1;
            let v = |dx: i32| self.plane_value(c, IntPoint::new(ix as i32 + dx, ey));
            *out = cubic_interpolate(v(-1), v(0), v(1), v(2), fx as f32);
        }
        cubic_interpolate(rows[0], rows[1], rows[2], rows[3], fy as f32)
    }

    /// Bicubic RGB sample of one channel plane (RGB modes).
    pub fn sample_channel_rgb(&self, c: Chan, scr: Point) -> Rgb {
        let l = G::to_lattice(c, scr);
        let (ix, fx) = modf_floor(l.x);
        let (iy, fy) = modf_floor(l.y);
        let mut rows = [Rgb::default(); 4];
        for (r, out) in rows.iter_mut().enumerate() {
            let ey = iy as i32 + r as i32 - 1;
            let v = |dx: i32| self.plane_rgb(c, IntPoint::new(ix as i32 + dx, ey));
            *out = plate_math::cubic_interpolate_rgb(v(-1), v(0), v(1), v(2), fx as f32);
        }
        plate_math::cubic_interpolate_rgb(rows[0], rows[1], rows[2], rows[3], fy as f32)
    }

    /// Dye triple at a shifted screen position: each channel interpolated
    /// on its own lattice.
    pub fn sample_rgb(&self, scr: Point) -> Rgb {
        Rgb::new(
            self.sample_channel(Chan::Red, scr),
            self.sample_channel(Chan::Green, scr),
            self.sample_channel(Chan::Blue, scr),
        )
    }

    /// Cell-center dye triple for one period cell; the matcher and the
    /// screen dumps work on these.
    pub fn cell_rgb(&self, x: i32, y: i32) -> Rgb {
        let p = Point::new(x as f64 + 0.5, y as f64 + 0.5);
        self.sample_rgb(p)
    }

    /// 3rd/97th percentile window per channel, for display normalization.
    pub fn analyze_range(&self) -> [ChannelRange; 3] {
        let mut out = [ChannelRange::default(); 3];
        for (ci, plane) in self.luma.iter().enumerate() {
            if plane.is_empty() {
                continue;
            }
            let mut sorted: Vec<f32> =
                plane.iter().copied().filter(|v| v.is_finite()).collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let lo = sorted[(sorted.len() - 1) * 3 / 100];
            let hi = sorted[(sorted.len() - 1) * 97 / 100];
            out[ci] = ChannelRange { min: lo, max: hi };
        }
        out
    }

    /// Contrast drift against another analyzer: per-channel ratio of the
    /// percentile windows. 1.0 means the tiles agree.
    pub fn compare_contrast<H: ScreenGeometry>(&self, other: &Analyzer<H>) -> [f32; 3] {
        let a = self.analyze_range();
        let b = other.analyze_range();
        let mut out = [1.0f32; 3];
        for ci in 0..3 {
            let wa = a[ci].max - a[ci].min;
            let wb = b[ci].max - b[ci].min;
            if wa > 1e-6 && wb > 1e-6 {
                out[ci] = wa / wb;
            }
        }
        out
    }

    /// Dump the analyzed screen as a 16-bit TIFF, normalized to the given
    /// per-channel ranges and optionally masked by a known-pixel bitmap.
    pub fn write_screen(
        &self,
        path: &std::path::Path,
        known_mask: Option<&Bitmap2D>,
        ranges: [ChannelRange; 3],
        progress: Option<&Progress>,
    ) -> CoreResult<()> {
        let w = self.range.width as usize;
        let h = self.range.height as usize;
        let mut pixels = vec![0u16; w * h * 3];
        for y in 0..h {
            check_cancel(progress)?;
            for x in 0..w {
                if let Some(mask) = known_mask {
                    if !mask.test(x, y) {
                        continue;
                    }
                }
                let rgb = self.cell_rgb(x as i32, y as i32);
                let vals = [rgb.red, rgb.green, rgb.blue];
                for ci in 0..3 {
                    let span = (ranges[ci].max - ranges[ci].min).max(1e-6);
                    let v = ((vals[ci] - ranges[ci].min) / span).clamp(0.0, 1.0);
                    pixels[(y * w + x) * 3 + ci] = (v * 65535.0 + 0.5) as u16;
                }
            }
        }
        crate::tiff::TiffWriter::new(path)
            .write_rgb16(w as u32, h as u32, &pixels)
    }
}

/// Runtime-dispatched analyzer, one variant per geometry template.
#[derive(Debug)]
pub enum AnyAnalyzer {
    Dufay(Analyzer<DufayGeometry>),
    Paget(Analyzer<PagetGeometry>),
    Strips(Analyzer<StripsGeometry>),
}

macro_rules! delegate {
    ($self:ident, $a:ident => $body:expr) => {
        match $self {
            AnyAnalyzer::Dufay($a) => $body,
            AnyAnalyzer::Paget($a) => $body,
            AnyAnalyzer::Strips($a) => $body,
        }
    };
}

impl AnyAnalyzer {
    /// Pick the geometry template for a screen type and run the analysis.
    pub fn analyze(
        ty: ScreenType,
        img: &Image,
        map: &ScrToImg,
        screen: Option<&Screen>,
        range: ScrRange,
        mode: AnalyzeMode,
        collection_threshold: f32,
        progress: Option<&Progress>,
    ) -> CoreResult<Self> {
        match ty {
            ScreenType::Dufay => Ok(AnyAnalyzer::Dufay(Analyzer::analyze(
                img,
                map,
                screen,
                range,
                mode,
                collection_threshold,
                progress,
            )?)),
            ScreenType::Paget | ScreenType::Thames | ScreenType::Finlay => {
                Ok(AnyAnalyzer::Paget(Analyzer::analyze(
                    img,
                    map,
                    screen,
                    range,
                    mode,
                    collection_threshold,
                    progress,
                )?))
            }
            ScreenType::WarnerPowrie => Ok(AnyAnalyzer::Strips(Analyzer::analyze(
                img,
                map,
                screen,
                range,
                mode,
                collection_threshold,
                progress,
            )?)),
            ScreenType::Autochrome | ScreenType::Random => {
                Err(CoreError::UnsupportedScreenType)
            }
        }
    }

    pub fn mode(&self) -> AnalyzeMode {
        delegate!(self, a => a.mode())
    }

    pub fn range(&self) -> ScrRange {
        delegate!(self, a => a.range())
    }

    pub fn known_pixels(&self) -> &Bitmap2D {
        delegate!(self, a => a.known_pixels())
    }

    pub fn set_known_pixels(&mut self, known: Bitmap2D) {
        delegate!(self, a => a.set_known_pixels(known))
    }

    pub fn sample_rgb(&self, scr: Point) -> Rgb {
        delegate!(self, a => a.sample_rgb(scr))
    }

    pub fn sample_channel(&self, c: Chan, scr: Point) -> f32 {
        delegate!(self, a => a.sample_channel(c, scr))
    }

    pub fn sample_channel_rgb(&self, c: Chan, scr: Point) -> Rgb {
        delegate!(self, a => a.sample_channel_rgb(c, scr))
    }

    pub fn cell_rgb(&self, x: i32, y: i32) -> Rgb {
        delegate!(self, a => a.cell_rgb(x, y))
    }

    pub fn analyze_range(&self) -> [ChannelRange; 3] {
        delegate!(self, a => a.analyze_range())
    }

    pub fn write_screen(
        &self,
        path: &std::path::Path,
        known_mask: Option<&Bitmap2D>,
        ranges: [ChannelRange; 3],
        progress: Option<&Progress>,
    ) -> CoreResult<()> {
        delegate!(self, a => a.write_screen(path, known_mask, ranges, progress))
    }

    /// Contrast drift between two analyzers of any geometry.
    pub fn compare_contrast(&self, other: &AnyAnalyzer) -> [f32; 3] {
        let a = self.analyze_range();
        let b = other.analyze_range();
        let mut out = [1.0f32; 3];
        for ci in 0..3 {
            let wa = a[ci].max - a[ci].min;
            let wb = b[ci].max - b[ci].min;
            if wa > 1e-6 && wb > 1e-6 {
                out[ci] = wa / wb;
            }
        }
        out
    }
}
