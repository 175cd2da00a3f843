//! Stitching partially overlapping scans of one plate.
//!
//! A [`StitchProject`] coordinates an N×M grid of scans (at most 10×10).
//! Each tile is analyzed independently; the first successful tile fixes
//! the process-wide pixel size and rotation baseline and later tiles must
//! agree. Neighboring tiles are registered in screen-cell space (see
//! [`matching`]), diagonal neighbors serve as a consistency check, and
//! painting routes every output pixel to the first tile in row-major
//! order whose known-pixel bitmap covers it.
//!
//! Raster decoding stays outside the core: the project is constructed
//! with an [`ImageLoader`] callback and only ever sees decoded [`Image`]s.
//! At most `2 × grid width` images stay resident; least-recently-used
//! tiles are dropped and reloaded on demand.

pub mod matching;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use plate_math::Point;

use crate::analyze::{AnalyzeMode, AnyAnalyzer};
use crate::bitmap::Bitmap2D;
use crate::cache::Caches;
use crate::csp::{self, CspData, StitchTileRecord};
use crate::detect::{detect_screen, ScrDetectParameters};
use crate::geometry::{ScrRange, ScrToImg, ScrToImgParameters};
use crate::image::Image;
use crate::progress::{check_cancel, Progress};
use crate::pto::{self, PtoControlPoint, PtoImage};
use crate::render::renderer::{RenderVariant, Renderer};
use crate::render::RenderParameters;
use crate::screen::ScreenType;
use crate::tiff::TiffWriter;
use crate::{CoreError, CoreResult};
use matching::{find_best_match, Direction, MatchingParams};

pub const MAX_DIM: usize = 10;

pub type ImageLoader = Box<dyn Fn(&Path) -> CoreResult<Image> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct StitchingParams {
    pub screen_type: ScreenType,
    /// Grid dimensions, `filenames[row][col]`.
    pub filenames: Vec<Vec<PathBuf>>,
    pub outer_tile_border: i32,
    pub inner_tile_border: i32,
    pub matching: MatchingParams,
    pub num_control_points: usize,
    /// Registration quality gates, in image pixels.
    pub max_avg_distance: f64,
    pub max_max_distance: f64,
    /// Diff-pass gates, in linear intensity.
    pub max_avg_diff: f64,
    pub max_max_diff: f64,
    pub min_screen_percentage: i32,
    pub demosaiced_tiles: bool,
    pub predictive_tiles: bool,
    pub orig_tiles: bool,
    pub screen_tiles: bool,
    pub diffs: bool,
    pub stitched_filename: Option<PathBuf>,
    pub csp_filename: Option<PathBuf>,
    pub hugin_pto_filename: Option<PathBuf>,
    /// Scratch directory for cpfind exchanges.
    pub workdir: Option<PathBuf>,
}

impl Default for StitchingParams {
    fn default() -> Self {
        Self {
            screen_type: ScreenType::Dufay,
            filenames: Vec::new(),
            outer_tile_border: 30,
            inner_tile_border: 2,
            matching: MatchingParams::default(),
            num_control_points: 100,
            max_avg_distance: 2.0,
            max_max_distance: 10.0,
            max_avg_diff: 0.05,
            max_max_diff: 0.25,
            min_screen_percentage: 75,
            demosaiced_tiles: false,
            predictive_tiles: false,
            orig_tiles: false,
            screen_tiles: false,
            diffs: false,
            stitched_filename: None,
            csp_filename: None,
            hugin_pto_filename: None,
            workdir: None,
        }
    }
}

/// One scan of the grid.
pub struct StitchImage {
    pub filename: PathBuf,
    img: Option<Arc<Image>>,
    /// Transform in the tile's own frame; preset by the caller or filled
    /// by detection.
    pub params: Option<ScrToImgParameters>,
    pub range: ScrRange,
    pub analyzer: Option<Arc<AnyAnalyzer>>,
    /// Border-trimmed cells this tile is authoritative for.
    pub known_pixels: Option<Bitmap2D>,
    /// Offset inside the shared screen frame.
    pub xpos: i32,
    pub ypos: i32,
    pub angle: f64,
    pub ratio: f64,
    pub analyzed: bool,
    /// Whether this tile contributed to the stitched output.
    pub output: bool,
    lastused: u64,
}

impl StitchImage {
    fn new(filename: PathBuf) -> Self {
        Self {
            filename,
            img: None,
            params: None,
            range: ScrRange::default(),
            analyzer: None,
            known_pixels: None,
            xpos: 0,
            ypos: 0,
            angle: 0.0,
            ratio: 1.0,
            analyzed: false,
            output: false,
            lastused: 0,
        }
    }

    /// Is a common-frame cell covered by this tile's trustworthy data?
    pub fn cell_known(&self, x: i32, y: i32) -> bool {
        let lx = x - self.xpos;
        let ly = y - self.ypos;
        if lx < 0 || ly < 0 {
            return false;
        }
        self.known_pixels
            .as_ref()
            .map(|k| k.test(lx as usize, ly as usize))
            .unwrap_or(false)
    }
}

pub struct StitchProject<'a> {
    pub params: StitchingParams,
    pub render_params: RenderParameters,
    pub detect_params: ScrDetectParameters,
    pub images: Vec<Vec<StitchImage>>,
    caches: &'a Caches,
    loader: ImageLoader,
    /// Agreed by the first analyzed tile.
    pixel_size: f64,
    rotation_adjustment: f64,
    tick: u64,
    n_resident: usize,
}

impl<'a> Drop for StitchProject<'a> {
    fn drop(&mut self) {
        self.caches.leave_stitch_mode();
    }
}

impl<'a> StitchProject<'a> {
    pub fn new(
        params: StitchingParams,
        render_params: RenderParameters,
        detect_params: ScrDetectParameters,
        caches: &'a Caches,
        loader: ImageLoader,
    ) -> CoreResult<Self> {
        let rows = params.filenames.len();
        if rows == 0 || rows > MAX_DIM {
            return Err(CoreError::invalid("stitch grid height out of range"));
        }
        let cols = params.filenames[0].len();
        if cols == 0 || cols > MAX_DIM || params.filenames.iter().any(|r| r.len() != cols) {
            return Err(CoreError::invalid("stitch grid must be rectangular"));
        }
        let images = params
            .filenames
            .iter()
            .map(|row| row.iter().map(|f| StitchImage::new(f.clone())).collect())
            .collect();
        caches.enter_stitch_mode();
        Ok(Self {
            params,
            render_params,
            detect_params,
            images,
            caches,
            loader,
            pixel_size: 0.0,
            rotation_adjustment: f64::NAN,
            tick: 0,
            n_resident: 0,
        })
    }

    pub fn grid(&self) -> (usize, usize) {
        (self.images[0].len(), self.images.len())
    }

    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    pub fn rotation_adjustment(&self) -> f64 {
        self.rotation_adjustment
    }

    /// Provide a known transform for a tile, skipping detection.
    pub fn set_tile_params(&mut self, col: usize, row: usize, params: ScrToImgParameters) {
        self.images[row][col].params = Some(params);
    }

    pub fn positions(&self) -> Vec<Vec<(i32, i32)>> {
        self.images
            .iter()
            .map(|row| row.iter().map(|t| (t.xpos, t.ypos)).collect())
            .collect()
    }

    fn resident_limit(&self) -> usize {
        (2 * self.images[0].len()).max(1)
    }

    fn load_image(&mut self, col: usize, row: usize) -> CoreResult<Arc<Image>> {
        self.tick += 1;
        let tick = self.tick;
        if let Some(img) = self.images[row][col].img.clone() {
            self.images[row][col].lastused = tick;
            return Ok(img);
        }
        // Evict least-recently-used residents first.
        while self.n_resident >= self.resident_limit() {
            let mut victim: Option<(usize, usize, u64)> = None;
            for (r, irow) in self.images.iter().enumerate() {
                for (c, tile) in irow.iter().enumerate() {
                    if tile.img.is_some()
                        && victim.map(|(_, _, t)| tile.lastused < t).unwrap_or(true)
                    {
                        victim = Some((r, c, tile.lastused));
                    }
                }
            }
            match victim {
                Some((r, c, _)) => self.release_image(c, r),
                None => break,
            }
        }
        let img = Arc::new((self.loader)(&self.images[row][col].filename)?);
        self.images[row][col].img = Some(img.clone());
        self.images[row][col].lastused = tick;
        self.n_resident += 1;
        Ok(img)
    }

    pub fn release_image(&mut self, col: usize, row: usize) {
        if self.images[row][col].img.take().is_some() {
            self.n_resident -= 1;
        }
    }

    fn map_for(&self, col: usize, row: usize) -> CoreResult<ScrToImg> {
        let params = self.images[row][col]
            .params
            .as_ref()
            .ok_or_else(|| CoreError::invalid("tile has no transform parameters"))?;
        ScrToImg::new(params.clone())
    }

    /// Analyze one tile: detect (unless preset), fit, run the precise
    /// analyzer, trim the known mask.
    pub fn analyze_tile(
        &mut self,
        col: usize,
        row: usize,
        progress: Option<&Progress>,
    ) -> CoreResult<()> {
        if self.images[row][col].analyzed {
            return Ok(());
        }
        check_cancel(progress)?;
        let img = self.load_image(col, row)?;
        if self.images[row][col].params.is_none() {
            let detected = detect_screen(
                &img,
                &self.detect_params,
                None,
                self.params.screen_type,
                progress,
            )?;
            self.images[row][col].params = Some(detected.params);
        }
        let map = self.map_for(col, row)?;
        let range = map.get_range(img.width(), img.height());

        // The whole project must share one scale and rotation baseline.
        let center = Point::new(img.width() as f64 / 2.0, img.height() as f64 / 2.0);
        let ps = map.pixel_size(center);
        let c1 = map.params().coordinate1;
        let angle = c1.y.atan2(c1.x);
        if self.pixel_size == 0.0 {
            self.pixel_size = ps;
            self.rotation_adjustment = angle;
        } else {
            if (ps - self.pixel_size).abs() > 0.02 * self.pixel_size {
                return Err(CoreError::DetectionFailed(format!(
                    "tile ({col},{row}) pixel size {ps:.5} disagrees with {:.5}",
                    self.pixel_size
                )));
            }
            if (angle - self.rotation_adjustment).abs() > 0.02 {
                return Err(CoreError::DetectionFailed(format!(
                    "tile ({col},{row}) rotation {angle:.4} disagrees with {:.4}",
                    self.rotation_adjustment
                )));
            }
        }

        let screen = self.caches.screens.get(
            self.params.screen_type,
            self.render_params.screen_blur_radius * ps,
            map.patch_proportions(),
        )?;
        let key = crate::cache::AnalyzerKey {
            image_id: img.id(),
            screen_id: screen.id(),
            mesh_id: map.mesh_id(),
            gamma_bits: self.render_params.gamma.to_bits(),
            mode: AnalyzeMode::Precise,
            collection_threshold_bits: self.render_params.collection_threshold.to_bits(),
            params: map.params().clone(),
        };
        let analyzer = self.caches.analyzers.get_or_try_build(key, || {
            AnyAnalyzer::analyze(
                self.params.screen_type,
                &img,
                &map,
                Some(&screen),
                range,
                AnalyzeMode::Precise,
                self.render_params.collection_threshold,
                progress,
            )
        })?;

        let known = self.trimmed_known(&img, &map, range);
        let tile = &mut self.images[row][col];
        tile.range = range;
        tile.known_pixels = Some(known);
        tile.analyzer = Some(analyzer);
        tile.analyzed = true;
        Ok(())
    }

    /// Known cells: fully inside the image, `outer_tile_border` image
    /// pixels away from the scan edge, and `inner_tile_border` cells away
    /// from the screen-range boundary.
    fn trimmed_known(&self, img: &Image, map: &ScrToImg, range: ScrRange) -> Bitmap2D {
        let mut known = Bitmap2D::new(range.width as usize, range.height as usize);
        let ob = self.params.outer_tile_border as f64;
        let ib = self.params.inner_tile_border;
        let (iw, ih) = (img.width() as f64, img.height() as f64);
        for y in 0..range.height {
            for x in 0..range.width {
                if x < ib || y < ib || x >= range.width - ib || y >= range.height - ib {
                    continue;
                }
                let inside = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)]
                    .iter()
                    .all(|&(dx, dy)| {
                        // Shifted cell corner → true screen coordinate.
                        let scr = Point::new(
                            (x - range.xshift) as f64 + dx,
                            (y - range.yshift) as f64 + dy,
                        );
                        let p = map.to_img(scr);
                        p.x >= ob && p.y >= ob && p.x < iw - ob && p.y < ih - ob
                    });
                if inside {
                    known.set(x as usize, y as usize);
                }
            }
        }
        known
    }

    fn analyzer_of(&self, col: usize, row: usize) -> CoreResult<&Arc<AnyAnalyzer>> {
        self.images[row][col]
            .analyzer
            .as_ref()
            .ok_or_else(|| CoreError::invalid("tile not analyzed"))
    }

    fn match_pair(
        &self,
        a: (usize, usize),
        b: (usize, usize),
        direction: Direction,
        progress: Option<&Progress>,
    ) -> CoreResult<(i32, i32)> {
        let analyzer_a = self.analyzer_of(a.0, a.1)?;
        let analyzer_b = self.analyzer_of(b.0, b.1)?;
        find_best_match(
            analyzer_a,
            analyzer_b,
            self.params.screen_type,
            &self.params.matching,
            direction,
            self.params.workdir.as_deref(),
            progress,
        )
    }

    /// Analyze all tiles, register neighbors, verify diagonal consistency
    /// and place every tile in the shared screen frame.
    pub fn determine_positions(&mut self, progress: Option<&Progress>) -> CoreResult<()> {
        let (cols, rows) = self.grid();
        for row in 0..rows {
            for col in 0..cols {
                self.analyze_tile(col, row, progress)?;
            }
        }

        // Pairwise registration.
        let mut right = vec![vec![(0i32, 0i32); cols]; rows];
        let mut down = vec![vec![(0i32, 0i32); cols]; rows];
        for row in 0..rows {
            for col in 0..cols.saturating_sub(1) {
                right[row][col] =
                    self.match_pair((col, row), (col + 1, row), Direction::Right, progress)?;
            }
        }
        for row in 0..rows.saturating_sub(1) {
            for col in 0..cols {
                down[row][col] =
                    self.match_pair((col, row), (col, row + 1), Direction::Down, progress)?;
            }
        }

        // Diagonal consistency: right-then-down must equal the direct
        // diagonal registration exactly.
        for row in 0..rows.saturating_sub(1) {
            for col in 0..cols.saturating_sub(1) {
                let chained = (
                    right[row][col].0 + down[row][col + 1].0,
                    right[row][col].1 + down[row][col + 1].1,
                );
                let direct = self.match_pair(
                    (col, row),
                    (col + 1, row + 1),
                    Direction::DownRight,
                    progress,
                )?;
                if direct != chained {
                    return Err(CoreError::StitchMismatch {
                        tile_a: (col, row),
                        tile_b: (col + 1, row + 1),
                        got: direct,
                        expected: chained,
                    });
                }
            }
        }

        // Chained placement from the origin tile.
        for row in 0..rows {
            for col in 0..cols {
                if row == 0 && col == 0 {
                    continue;
                }
                let (x, y) = if col > 0 {
                    let base = &self.images[row][col - 1];
                    (
                        base.xpos + right[row][col - 1].0,
                        base.ypos + right[row][col - 1].1,
                    )
                } else {
                    let base = &self.images[row - 1][col];
                    (base.xpos + down[row - 1][col].0, base.ypos + down[row - 1][col].1)
                };
                self.images[row][col].xpos = x;
                self.images[row][col].ypos = y;
            }
        }
        Ok(())
    }

    /// Union of all tile ranges in the shared screen frame:
    /// `(min_x, min_y, width, height)` in cells.
    pub fn viewport(&self) -> (i32, i32, i32, i32) {
        let mut min_x = i32::MAX;
        let mut min_y = i32::MAX;
        let mut max_x = i32::MIN;
        let mut max_y = i32::MIN;
        for row in &self.images {
            for tile in row {
                if !tile.analyzed {
                    continue;
                }
                min_x = min_x.min(tile.xpos);
                min_y = min_y.min(tile.ypos);
                max_x = max_x.max(tile.xpos + tile.range.width);
                max_y = max_y.max(tile.ypos + tile.range.height);
            }
        }
        if min_x > max_x {
            return (0, 0, 0, 0);
        }
        (min_x, min_y, max_x - min_x, max_y - min_y)
    }

    /// Output supersampling: image pixels per screen period.
    fn supersample(&self) -> i32 {
        if self.pixel_size <= 0.0 {
            return 1;
        }
        (1.0 / self.pixel_size).round().max(1.0) as i32
    }

    /// Row-major first-owner map of the viewport cells.
    fn owner_map(&self, vx: i32, vy: i32, vw: i32, vh: i32) -> Vec<u8> {
        let (cols, rows) = self.grid();
        let mut owners = vec![u8::MAX; (vw as usize) * (vh as usize)];
        for (i, owner) in owners.iter_mut().enumerate() {
            let x = vx + (i % vw as usize) as i32;
            let y = vy + (i / vw as usize) as i32;
            'tiles: for row in 0..rows {
                for col in 0..cols {
                    if self.images[row][col].cell_known(x, y) {
                        *owner = (row * cols + col) as u8;
                        break 'tiles;
                    }
                }
            }
        }
        owners
    }

    fn tile_renderer<'b>(
        &'b self,
        col: usize,
        row: usize,
        img: &'b Arc<Image>,
        variant: RenderVariant,
        progress: Option<&Progress>,
    ) -> CoreResult<Renderer<'b>> {
        let map = self.map_for(col, row)?;
        let mut renderer = Renderer::new(
            self.caches,
            img,
            map,
            self.render_params.clone(),
            variant,
            65535,
        )?;
        renderer.precompute_all(progress)?;
        Ok(renderer)
    }

    /// Paint the stitched output and write it as 16-bit RGBA (alpha zero
    /// where no tile is known).
    pub fn write_stitched(
        &mut self,
        path: &Path,
        progress: Option<&Progress>,
    ) -> CoreResult<()> {
        let (vx, vy, vw, vh) = self.viewport();
        if vw <= 0 || vh <= 0 {
            return Err(CoreError::invalid("stitch viewport is empty"));
        }
        let s = self.supersample();
        let out_w = (vw * s) as usize;
        let out_h = (vh * s) as usize;
        let mut pixels =
            crate::error::try_alloc::<u16>(out_w * out_h * 4, "stitched output")?;
        let owners = self.owner_map(vx, vy, vw, vh);
        let (cols, rows) = self.grid();

        if let Some(p) = progress {
            p.set_task("stitching", rows * cols);
        }
        for row in 0..rows {
            for col in 0..cols {
                check_cancel(progress)?;
                let id = (row * cols + col) as u8;
                if !owners.iter().any(|&o| o == id) {
                    if let Some(p) = progress {
                        p.inc_progress();
                    }
                    continue;
                }
                let img = self.load_image(col, row)?;
                let renderer = self.tile_renderer(
                    col,
                    row,
                    &img,
                    RenderVariant::Interpolated { original_color: false },
                    progress,
                )?;
                let tile = &self.images[row][col];
                let (xpos, ypos) = (tile.xpos, tile.ypos);
                let (xshift, yshift) = (tile.range.xshift, tile.range.yshift);
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let cell_x = vx + (ox as i32) / s;
                        let cell_y = vy + (oy as i32) / s;
                        if owners[((cell_y - vy) * vw + (cell_x - vx)) as usize] != id {
                            continue;
                        }
                        // Common frame → this tile's unshifted screen
                        // coordinates.
                        let scr = Point::new(
                            (vx * s + ox as i32) as f64 / s as f64
                                - (xpos + xshift) as f64,
                            (vy * s + oy as i32) as f64 / s as f64
                                - (ypos + yshift) as f64,
                        );
                        let [r, g, b] = renderer.render_pixel_scr(scr);
                        let o = (oy * out_w + ox) * 4;
                        pixels[o] = r;
                        pixels[o + 1] = g;
                        pixels[o + 2] = b;
                        pixels[o + 3] = 65535;
                    }
                }
                self.images[row][col].output = true;
                if let Some(p) = progress {
                    p.inc_progress();
                }
            }
        }
        TiffWriter::new(path).write_rgba16(out_w as u32, out_h as u32, &pixels)
    }

    /// Per-tile TIFFs for tiles that never produced stitched output, with
    /// position tags so they align when overlaid.
    pub fn write_tiles(&mut self, base: &Path, progress: Option<&Progress>) -> CoreResult<()> {
        let (vx, vy, vw, vh) = self.viewport();
        let s = self.supersample();
        let full = ((vw * s) as u32, (vh * s) as u32);
        let (cols, rows) = self.grid();
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "stitch".into());
        let dir = base.parent().unwrap_or_else(|| Path::new("."));
        let kinds: [(bool, RenderVariant, &str); 3] = [
            (self.params.orig_tiles, RenderVariant::Original, "tile"),
            (
                self.params.demosaiced_tiles,
                RenderVariant::Interpolated { original_color: false },
                "demosaicedtile",
            ),
            (
                self.params.predictive_tiles,
                RenderVariant::Predictive,
                "predictivetile",
            ),
        ];
        for row in 0..rows {
            for col in 0..cols {
                check_cancel(progress)?;
                if self.images[row][col].output {
                    continue;
                }
                let img = self.load_image(col, row)?;
                for (enabled, variant, suffix) in kinds.iter() {
                    if !*enabled {
                        continue;
                    }
                    let renderer = self.tile_renderer(col, row, &img, *variant, progress)?;
                    let tile = &self.images[row][col];
                    let w = (tile.range.width * s) as usize;
                    let h = (tile.range.height * s) as usize;
                    let mut pixels = vec![0u16; w * h * 3];
                    let (xshift, yshift) = (tile.range.xshift, tile.range.yshift);
                    for oy in 0..h {
                        for ox in 0..w {
                            let scr = Point::new(
                                ox as f64 / s as f64 - xshift as f64,
                                oy as f64 / s as f64 - yshift as f64,
                            );
                            let [r, g, b] = renderer.render_pixel_scr(scr);
                            let o = (oy * w + ox) * 3;
                            pixels[o] = r;
                            pixels[o + 1] = g;
                            pixels[o + 2] = b;
                        }
                    }
                    let pos_x = ((tile.xpos - vx) * s) as f64;
                    let pos_y = ((tile.ypos - vy) * s) as f64;
                    let path = dir.join(format!("{stem}-{col}-{row}-{suffix}.tif"));
                    TiffWriter::new(&path)
                        .position(pos_x, pos_y)
                        .full_size(full.0, full.1)
                        .write_rgb16(w as u32, h as u32, &pixels)?;
                }
                if self.params.screen_tiles {
                    let tile = &self.images[row][col];
                    if let (Some(analyzer), Some(known)) =
                        (&tile.analyzer, &tile.known_pixels)
                    {
                        let ranges = analyzer.analyze_range();
                        let path = dir.join(format!("{stem}-{col}-{row}-screen.tif"));
                        analyzer.write_screen(&path, Some(known), ranges, progress)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Diff every registered overlap; write the per-pixel difference
    /// (centered at mid-gray) and fail when the configured thresholds are
    /// exceeded.
    pub fn write_diffs(&mut self, base: &Path, progress: Option<&Progress>) -> CoreResult<()> {
        let (cols, rows) = self.grid();
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "stitch".into());
        let dir = base.parent().unwrap_or_else(|| Path::new("."));
        for row in 0..rows {
            for col in 0..cols {
                for (nc, nr) in [(col + 1, row), (col, row + 1)] {
                    if nc >= cols || nr >= rows {
                        continue;
                    }
                    check_cancel(progress)?;
                    self.diff_pair((col, row), (nc, nr), dir, &stem)?;
                }
            }
        }
        Ok(())
    }

    fn diff_pair(
        &self,
        a: (usize, usize),
        b: (usize, usize),
        dir: &Path,
        stem: &str,
    ) -> CoreResult<()> {
        let ta = &self.images[a.1][a.0];
        let tb = &self.images[b.1][b.0];
        let x0 = (ta.xpos).max(tb.xpos);
        let y0 = (ta.ypos).max(tb.ypos);
        let x1 = (ta.xpos + ta.range.width).min(tb.xpos + tb.range.width);
        let y1 = (ta.ypos + ta.range.height).min(tb.ypos + tb.range.height);
        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }
        let analyzer_a = self.analyzer_of(a.0, a.1)?;
        let analyzer_b = self.analyzer_of(b.0, b.1)?;
        let w = (x1 - x0) as usize;
        let h = (y1 - y0) as usize;
        let mut pixels = vec![0u16; w * h * 3];
        let mut sum = [0.0f64; 3];
        let mut max = [0.0f64; 3];
        let mut n = 0usize;
        for y in y0..y1 {
            for x in x0..x1 {
                if !ta.cell_known(x, y) || !tb.cell_known(x, y) {
                    continue;
                }
                let va = analyzer_a.cell_rgb(x - ta.xpos, y - ta.ypos);
                let vb = analyzer_b.cell_rgb(x - tb.xpos, y - tb.ypos);
                let d = va - vb;
                let comps = [d.red, d.green, d.blue];
                let o = (((y - y0) as usize) * w + (x - x0) as usize) * 3;
                for ci in 0..3 {
                    let v = comps[ci] as f64;
                    sum[ci] += v.abs();
                    max[ci] = max[ci].max(v.abs());
                    pixels[o + ci] =
                        (((v + 0.5).clamp(0.0, 1.0)) * 65535.0 + 0.5) as u16;
                }
                n += 1;
            }
        }
        if n == 0 {
            return Ok(());
        }
        let path = dir.join(format!(
            "{stem}-diff-{}-{}-vs-{}-{}.tif",
            a.0, a.1, b.0, b.1
        ));
        TiffWriter::new(&path).write_rgb16(w as u32, h as u32, &pixels)?;
        let avg: Vec<f64> = sum.iter().map(|s| s / n as f64).collect();
        tracing::info!(?avg, ?max, tile_a = ?a, tile_b = ?b, "overlap diff");
        let worst_avg = avg.iter().copied().fold(0.0, f64::max);
        let worst_max = max.iter().copied().fold(0.0, f64::max);
        if worst_avg > self.params.max_avg_diff || worst_max > self.params.max_max_diff {
            return Err(CoreError::StitchMismatch {
                tile_a: a,
                tile_b: b,
                got: ((worst_avg * 1000.0) as i32, (worst_max * 1000.0) as i32),
                expected: (
                    (self.params.max_avg_diff * 1000.0) as i32,
                    (self.params.max_max_diff * 1000.0) as i32,
                ),
            });
        }
        Ok(())
    }

    /// Emit a Hugin project with the registered shifts expressed as
    /// control points along each overlap.
    pub fn write_pto(&self, path: &Path) -> CoreResult<()> {
        let (cols, rows) = self.grid();
        let s = self.supersample();
        let mut images = Vec::new();
        let mut index = vec![vec![usize::MAX; cols]; rows];
        for row in 0..rows {
            for col in 0..cols {
                let tile = &self.images[row][col];
                if !tile.analyzed {
                    continue;
                }
                index[row][col] = images.len();
                images.push(PtoImage {
                    width: (tile.range.width * s) as u32,
                    height: (tile.range.height * s) as u32,
                    filename: tile.filename.display().to_string(),
                });
            }
        }
        let mut points = Vec::new();
        for row in 0..rows {
            for col in 0..cols {
                let Some((nc, nr)) = (col + 1 < cols).then_some((col + 1, row)) else {
                    continue;
                };
                let ta = &self.images[row][col];
                let tb = &self.images[nr][nc];
                if !ta.analyzed || !tb.analyzed {
                    continue;
                }
                let x0 = ta.xpos.max(tb.xpos);
                let x1 = (ta.xpos + ta.range.width).min(tb.xpos + tb.range.width);
                let y0 = ta.ypos.max(tb.ypos);
                let y1 = (ta.ypos + ta.range.height).min(tb.ypos + tb.range.height);
                let n = self.params.num_control_points.min(64).max(1);
                for i in 0..n {
                    let fx = x0 as f64 + (x1 - x0) as f64 * (i as f64 + 0.5) / n as f64;
                    let fy = y0 as f64 + (y1 - y0) as f64 * ((i * 7 % n) as f64 + 0.5) / n as f64;
                    points.push(PtoControlPoint {
                        x1: (fx - ta.xpos as f64) * s as f64,
                        y1: (fy - ta.ypos as f64) * s as f64,
                        x2: (fx - tb.xpos as f64) * s as f64,
                        y2: (fy - tb.ypos as f64) * s as f64,
                    });
                }
            }
        }
        pto::save_file(path, &images, self.params.matching.hfov, &points)
    }

    /// Persist the project as CSP with per-tile stitch records.
    pub fn save_project(&self, path: &Path) -> CoreResult<()> {
        let mut data = CspData {
            render: self.render_params.clone(),
            detect: Some(self.detect_params.clone()),
            ..Default::default()
        };
        if let Some(p) = self.images[0][0].params.clone() {
            data.scr = p;
        }
        for (r, row) in self.images.iter().enumerate() {
            for (c, tile) in row.iter().enumerate() {
                data.stitch_tiles.push(StitchTileRecord {
                    col: c as u32,
                    row: r as u32,
                    filename: tile.filename.display().to_string(),
                    angle: tile.angle,
                    ratio: tile.ratio,
                    position: (tile.xpos as f64, tile.ypos as f64),
                    size: (0, 0),
                    scr_size: (tile.range.width, tile.range.height),
                    scr_shift: (tile.range.xshift, tile.range.yshift),
                });
            }
        }
        csp::save_file(path, &data)
    }
}
