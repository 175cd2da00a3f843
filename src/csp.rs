//! CSP ("color-screen parameters") project files.
//!
//! Human-readable text: a single-line header `screen_alignment_version: 1`
//! followed by `keyword: value` lines. Floats print with six fixed
//! decimals, booleans as `yes`/`no`, enums by their canonical name (with
//! the legacy alias `PagetFinlay` → `Finlay` accepted on load). Parsing is
//! strict: an unknown keyword, a truncated value or trailing bytes on a
//! line are hard errors and no partial state is installed.
//!
//! The keyword `scren_blur_radius` is misspelled in the on-disk format;
//! the misspelling is preserved on save for compatibility and the correct
//! spelling is accepted as a read alias.
//!
//! Stitch projects extend the grammar with `stitch_image_*` records.

use std::fmt::Write as _;
use std::io::{BufRead, Write};
use std::path::Path;

use plate_math::{Point, Rgb, Vector};

use crate::detect::ScrDetectParameters;
use crate::geometry::ScrToImgParameters;
use crate::render::{ColorModel, DyeBalance, RenderParameters};
use crate::screen::ScreenType;
use crate::solver::{ControlPoint, PointColor};
use crate::{CoreError, CoreResult};

pub const HEADER: &str = "screen_alignment_version: 1";

/// Everything a project file can carry.
#[derive(Clone, Debug, Default)]
pub struct CspData {
    pub scr: ScrToImgParameters,
    pub render: RenderParameters,
    pub detect: Option<ScrDetectParameters>,
    pub solver_points: Vec<ControlPoint>,
    pub stitch_tiles: Vec<StitchTileRecord>,
}

/// One per-tile record of a stitch project.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StitchTileRecord {
    pub col: u32,
    pub row: u32,
    pub filename: String,
    pub angle: f64,
    pub ratio: f64,
    pub position: (f64, f64),
    pub size: (i32, i32),
    pub scr_size: (i32, i32),
    pub scr_shift: (i32, i32),
}

fn bool_name(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

fn color_name(c: PointColor) -> &'static str {
    match c {
        PointColor::Red => "red",
        PointColor::Green => "green",
        PointColor::Blue => "blue",
        PointColor::Neutral => "neutral",
    }
}

fn color_from_name(s: &str) -> Option<PointColor> {
    match s {
        "red" => Some(PointColor::Red),
        "green" => Some(PointColor::Green),
        "blue" => Some(PointColor::Blue),
        "neutral" => Some(PointColor::Neutral),
        _ => None,
    }
}

/// Serialize to a string; the writer variants stream this out.
pub fn to_string(data: &CspData) -> String {
    let mut s = String::new();
    let scr = &data.scr;
    let r = &data.render;
    // Formatting mirrors the C printf("%f") six-decimal convention so a
    // save→load→save round trip is byte-identical.
    let _ = writeln!(s, "{}", HEADER);
    let _ = writeln!(s, "screen_type: {}", scr.screen_type.name());
    let _ = writeln!(s, "screen_shift: {:.6} {:.6}", scr.center.x, scr.center.y);
    let _ = writeln!(s, "coordinate_x: {:.6} {:.6}", scr.coordinate1.x, scr.coordinate1.y);
    let _ = writeln!(s, "coordinate_y: {:.6} {:.6}", scr.coordinate2.x, scr.coordinate2.y);
    let _ = writeln!(s, "tilt_x: {:.6} {:.6}", scr.tilt_x.x, scr.tilt_x.y);
    let _ = writeln!(s, "tilt_y: {:.6} {:.6}", scr.tilt_y.x, scr.tilt_y.y);
    let _ = writeln!(s, "k1: {:.6}", scr.k1);
    let _ = writeln!(s, "strip_widths: {:.6} {:.6}", scr.strips.red, scr.strips.green);
    let _ = writeln!(s, "gamma: {:.6}", r.gamma);
    let _ = writeln!(s, "presaturation: {:.6}", r.presaturation);
    let _ = writeln!(s, "saturation: {:.6}", r.saturation);
    let _ = writeln!(s, "brightness: {:.6}", r.brightness);
    let _ = writeln!(s, "collection_threshold: {:.6}", r.collection_threshold);
    let _ = writeln!(
        s,
        "white_balance: {:.6} {:.6} {:.6}",
        r.white_balance.red, r.white_balance.green, r.white_balance.blue
    );
    let _ = writeln!(s, "backlight_temperature: {:.6}", r.backlight_temperature);
    let _ = writeln!(s, "age: {:.6}", r.age);
    let _ = writeln!(s, "dye_balance: {}", r.dye_balance.name());
    let _ = writeln!(s, "color_model: {}", r.color_model.name());
    let _ = writeln!(s, "scren_blur_radius: {:.6}", r.screen_blur_radius);
    let _ = writeln!(s, "gray_range: {} {}", r.gray_min, r.gray_max);
    let _ = writeln!(s, "precise: {}", bool_name(r.precise));
    let _ = writeln!(s, "screen_compensation: {}", bool_name(r.screen_compensation));
    let _ = writeln!(s, "adjust_luminosity: {}", bool_name(r.adjust_luminosity));
    let _ = writeln!(
        s,
        "restore_original_luminosity: {}",
        bool_name(r.restore_original_luminosity)
    );
    let _ = writeln!(s, "mix_gamma: {:.6}", r.mix_gamma);
    let _ = writeln!(
        s,
        "mix_weights: {:.6} {:.6} {:.6}",
        r.mix_red, r.mix_green, r.mix_blue
    );
    if let Some(d) = &data.detect {
        let rgb = |c: Rgb| format!("{:.6} {:.6} {:.6}", c.red, c.green, c.blue);
        let _ = writeln!(s, "detect_black: {}", rgb(d.black));
        let _ = writeln!(s, "detect_red: {}", rgb(d.red));
        let _ = writeln!(s, "detect_green: {}", rgb(d.green));
        let _ = writeln!(s, "detect_blue: {}", rgb(d.blue));
        let _ = writeln!(s, "detect_gamma: {:.6}", d.gamma);
        let _ = writeln!(s, "detect_border: {}", d.border);
    }
    for p in &data.solver_points {
        let _ = writeln!(
            s,
            "solver_point: {:.6} {:.6} {:.6} {:.6} {} {}",
            p.img.x,
            p.img.y,
            p.scr.x,
            p.scr.y,
            color_name(p.color),
            bool_name(p.locked)
        );
    }
    for t in &data.stitch_tiles {
        let _ = writeln!(s, "stitch_image_filename: {} {} {}", t.col, t.row, t.filename);
        let _ = writeln!(s, "stitch_image_angle: {} {} {:.6}", t.col, t.row, t.angle);
        let _ = writeln!(s, "stitch_image_ratio: {} {} {:.6}", t.col, t.row, t.ratio);
        let _ = writeln!(
            s,
            "stitch_image_position: {} {} {:.6} {:.6}",
            t.col, t.row, t.position.0, t.position.1
        );
        let _ = writeln!(s, "stitch_image_size: {} {} {} {}", t.col, t.row, t.size.0, t.size.1);
        let _ = writeln!(
            s,
            "stitch_image_scr_size: {} {} {} {}",
            t.col, t.row, t.scr_size.0, t.scr_size.1
        );
        let _ = writeln!(
            s,
            "stitch_image_scr_shift: {} {} {} {}",
            t.col, t.row, t.scr_shift.0, t.scr_shift.1
        );
    }
    s
}

pub fn save<W: Write>(mut w: W, data: &CspData) -> CoreResult<()> {
    w.write_all(to_string(data).as_bytes())
        .map_err(|e| CoreError::WriteFailed {
            path: String::new(),
            source: e,
        })
}

pub fn save_file(path: impl AsRef<Path>, data: &CspData) -> CoreResult<()> {
    let f = std::fs::File::create(path.as_ref()).map_err(|e| CoreError::WriteFailed {
        path: path.as_ref().display().to_string(),
        source: e,
    })?;
    save(std::io::BufWriter::new(f), data)
}

struct LineParser<'a> {
    keyword: &'a str,
    args: Vec<&'a str>,
}

impl<'a> LineParser<'a> {
    fn parse(line: &'a str) -> CoreResult<Option<Self>> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            return Ok(None);
        }
        let Some((keyword, rest)) = trimmed.split_once(':') else {
            return Err(CoreError::parse(format!("missing ':' in line '{}'", trimmed)));
        };
        Ok(Some(Self {
            keyword: keyword.trim(),
            args: rest.split_whitespace().collect(),
        }))
    }

    fn err(&self) -> CoreError {
        CoreError::parse(format!("error parsing {}", self.keyword))
    }

    fn floats<const N: usize>(&self) -> CoreResult<[f64; N]> {
        if self.args.len() != N {
            return Err(self.err());
        }
        let mut out = [0.0; N];
        for (o, a) in out.iter_mut().zip(&self.args) {
            *o = a.parse().map_err(|_| self.err())?;
        }
        Ok(out)
    }

    fn ints<const N: usize>(&self) -> CoreResult<[i64; N]> {
        if self.args.len() != N {
            return Err(self.err());
        }
        let mut out = [0i64; N];
        for (o, a) in out.iter_mut().zip(&self.args) {
            *o = a.parse().map_err(|_| self.err())?;
        }
        Ok(out)
    }

    fn boolean(&self) -> CoreResult<bool> {
        match self.args.as_slice() {
            ["yes"] => Ok(true),
            ["no"] => Ok(false),
            _ => Err(self.err()),
        }
    }

    fn word(&self) -> CoreResult<&'a str> {
        match self.args.as_slice() {
            [w] => Ok(w),
            _ => Err(self.err()),
        }
    }
}

/// Parse a project file. All-or-nothing: errors leave the caller's state
/// untouched because the result is only handed over on success.
pub fn load<R: BufRead>(r: R) -> CoreResult<CspData> {
    let mut lines = r.lines();
    let first = lines
        .next()
        .ok_or_else(|| CoreError::parse(format!("first line should be {}", HEADER)))?
        .map_err(|e| CoreError::parse(e.to_string()))?;
    if first.trim_end() != HEADER {
        return Err(CoreError::parse(format!("first line should be {}", HEADER)));
    }

    let mut data = CspData::default();
    let mut detect = ScrDetectParameters::default();
    let mut saw_detect = false;

    for line in lines {
        let line = line.map_err(|e| CoreError::parse(e.to_string()))?;
        let Some(p) = LineParser::parse(&line)? else {
            continue;
        };
        match p.keyword {
            "screen_type" => {
                let name = p.word()?;
                data.scr.screen_type = ScreenType::from_name(name)
                    .ok_or_else(|| CoreError::parse("unknown screen type"))?;
            }
            "screen_shift" => {
                let [x, y] = p.floats()?;
                data.scr.center = Point::new(x, y);
            }
            "coordinate_x" => {
                let [x, y] = p.floats()?;
                data.scr.coordinate1 = Vector::new(x, y);
            }
            "coordinate_y" => {
                let [x, y] = p.floats()?;
                data.scr.coordinate2 = Vector::new(x, y);
            }
            "tilt_x" => {
                let [x, y] = p.floats()?;
                data.scr.tilt_x = Vector::new(x, y);
            }
            "tilt_y" => {
                let [x, y] = p.floats()?;
                data.scr.tilt_y = Vector::new(x, y);
            }
            "k1" => data.scr.k1 = p.floats::<1>()?[0],
            "strip_widths" => {
                let [r, g] = p.floats()?;
                data.scr.strips = crate::screen::StripWidths { red: r, green: g };
            }
            "gamma" => data.render.gamma = p.floats::<1>()?[0],
            "presaturation" => data.render.presaturation = p.floats::<1>()?[0],
            "saturation" => data.render.saturation = p.floats::<1>()?[0],
            "brightness" => data.render.brightness = p.floats::<1>()?[0],
            "collection_threshold" => {
                data.render.collection_threshold = p.floats::<1>()?[0] as f32
            }
            "white_balance" => {
                let [r, g, b] = p.floats()?;
                data.render.white_balance = Rgb::new(r as f32, g as f32, b as f32);
            }
            "backlight_temperature" => data.render.backlight_temperature = p.floats::<1>()?[0],
            "age" => data.render.age = p.floats::<1>()?[0],
            "dye_balance" => {
                data.render.dye_balance = DyeBalance::from_name(p.word()?)
                    .ok_or_else(|| CoreError::parse("unknown dye balance"))?;
            }
            "color_model" => {
                data.render.color_model = ColorModel::from_name(p.word()?)
                    .ok_or_else(|| CoreError::parse("unknown color model"))?;
            }
            // On-disk spelling plus the corrected alias.
            "scren_blur_radius" | "screen_blur_radius" => {
                data.render.screen_blur_radius = p.floats::<1>()?[0]
            }
            "gray_range" => {
                let [lo, hi] = p.ints()?;
                data.render.gray_min = lo as i32;
                data.render.gray_max = hi as i32;
            }
            "precise" => data.render.precise = p.boolean()?,
            "screen_compensation" => data.render.screen_compensation = p.boolean()?,
            "adjust_luminosity" => data.render.adjust_luminosity = p.boolean()?,
            "restore_original_luminosity" => {
                data.render.restore_original_luminosity = p.boolean()?
            }
            "mix_gamma" => data.render.mix_gamma = p.floats::<1>()?[0],
            "mix_weights" => {
                let [r, g, b] = p.floats()?;
                data.render.mix_red = r;
                data.render.mix_green = g;
                data.render.mix_blue = b;
            }
            "detect_black" => {
                let [r, g, b] = p.floats()?;
                detect.black = Rgb::new(r as f32, g as f32, b as f32);
                saw_detect = true;
            }
            "detect_red" => {
                let [r, g, b] = p.floats()?;
                detect.red = Rgb::new(r as f32, g as f32, b as f32);
                saw_detect = true;
            }
            "detect_green" => {
                let [r, g, b] = p.floats()?;
                detect.green = Rgb::new(r as f32, g as f32, b as f32);
                saw_detect = true;
            }
            "detect_blue" => {
                let [r, g, b] = p.floats()?;
                detect.blue = Rgb::new(r as f32, g as f32, b as f32);
                saw_detect = true;
            }
            "detect_gamma" => {
                detect.gamma = p.floats::<1>()?[0];
                saw_detect = true;
            }
            "detect_border" => {
                detect.border = p.ints::<1>()?[0] as i32;
                saw_detect = true;
            }
            "solver_point" => {
                if p.args.len() != 6 {
                    return Err(p.err());
                }
                let fx: f64 = p.args[0].parse().map_err(|_| p.err())?;
                let fy: f64 = p.args[1].parse().map_err(|_| p.err())?;
                let sx: f64 = p.args[2].parse().map_err(|_| p.err())?;
                let sy: f64 = p.args[3].parse().map_err(|_| p.err())?;
                let color = color_from_name(p.args[4]).ok_or_else(|| p.err())?;
                let locked = match p.args[5] {
                    "yes" => true,
                    "no" => false,
                    _ => return Err(p.err()),
                };
                data.solver_points.push(ControlPoint {
                    img: Point::new(fx, fy),
                    scr: Point::new(sx, sy),
                    color,
                    locked,
                    weight: 1.0,
                });
            }
            kw if kw.starts_with("stitch_image_") => {
                parse_stitch_record(&p, &mut data.stitch_tiles)?;
            }
            _ => {
                return Err(CoreError::parse(format!(
                    "unexpected keyword {}",
                    p.keyword
                )))
            }
        }
    }
    if saw_detect {
        data.detect = Some(detect);
    }
    Ok(data)
}

pub fn load_file(path: impl AsRef<Path>) -> CoreResult<CspData> {
    let f = std::fs::File::open(path.as_ref()).map_err(|e| {
        CoreError::load(path.as_ref().display().to_string(), e.to_string())
    })?;
    load(std::io::BufReader::new(f))
}

fn tile_at(tiles: &mut Vec<StitchTileRecord>, col: u32, row: u32) -> &mut StitchTileRecord {
    if let Some(i) = tiles.iter().position(|t| t.col == col && t.row == row) {
        &mut tiles[i]
    } else {
        tiles.push(StitchTileRecord {
            col,
            row,
            ratio: 1.0,
            ..Default::default()
        });
        tiles.last_mut().unwrap()
    }
}

fn parse_stitch_record(p: &LineParser<'_>, tiles: &mut Vec<StitchTileRecord>) -> CoreResult<()> {
    if p.args.len() < 2 {
        return Err(p.err());
    }
    let col: u32 = p.args[0].parse().map_err(|_| p.err())?;
    let row: u32 = p.args[1].parse().map_err(|_| p.err())?;
    let rest = &p.args[2..];
    let parse_f = |s: &str| s.parse::<f64>().map_err(|_| p.err());
    let parse_i = |s: &str| s.parse::<i32>().map_err(|_| p.err());
    let tile = tile_at(tiles, col, row);
    match p.keyword {
        "stitch_image_filename" => {
            if rest.len() != 1 {
                return Err(p.err());
            }
            tile.filename = rest[0].to_string();
        }
        "stitch_image_angle" => {
            if rest.len() != 1 {
                return Err(p.err());
            }
            tile.angle = parse_f(rest[0])?;
        }
        "stitch_image_ratio" => {
            if rest.len() != 1 {
                return Err(p.err());
            }
            tile.ratio = parse_f(rest[0])?;
        }
        "stitch_image_position" => {
            if rest.len() != 2 {
                return Err(p.err());
            }
            tile.position = (parse_f(rest[0])?, parse_f(rest[1])?);
        }
        "stitch_image_size" => {
            if rest.len() != 2 {
                return Err(p.err());
            }
            tile.size = (parse_i(rest[0])?, parse_i(rest[1])?);
        }
        "stitch_image_scr_size" => {
            if rest.len() != 2 {
                return Err(p.err());
            }
            tile.scr_size = (parse_i(rest[0])?, parse_i(rest[1])?);
        }
        "stitch_image_scr_shift" => {
            if rest.len() != 2 {
                return Err(p.err());
            }
            tile.scr_shift = (parse_i(rest[0])?, parse_i(rest[1])?);
        }
        _ => return Err(CoreError::parse(format!("unexpected keyword {}", p.keyword))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CspData {
        let mut data = CspData {
            scr: ScrToImgParameters {
                screen_type: ScreenType::Dufay,
                center: Point::new(8.0, 8.0),
                coordinate1: Vector::new(19.0, 0.0),
                coordinate2: Vector::new(0.0, 24.5),
                ..Default::default()
            },
            ..Default::default()
        };
        data.render.gamma = 2.2;
        data.solver_points.push(ControlPoint {
            img: Point::new(10.0, 20.0),
            scr: Point::new(1.0, 2.0),
            color: PointColor::Green,
            locked: false,
            weight: 1.0,
        });
        data
    }

    #[test]
    fn save_load_save_is_byte_identical() {
        let first = to_string(&sample());
        let loaded = load(first.as_bytes()).unwrap();
        let second = to_string(&loaded);
        assert_eq!(first, second);
    }

    #[test]
    fn header_is_required() {
        let err = load("not a csp\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("screen_alignment_version"));
    }

    #[test]
    fn wrong_arity_names_the_keyword() {
        let text = format!("{}\ncoordinate_x: 1.0 2.0 3.0\n", HEADER);
        let err = load(text.as_bytes()).unwrap_err();
        assert!(matches!(&err, CoreError::ParseError(m) if m == "error parsing coordinate_x"));
    }

    #[test]
    fn unknown_keyword_is_fatal() {
        let text = format!("{}\nnonsense: 1\n", HEADER);
        let err = load(text.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unexpected keyword"));
    }

    #[test]
    fn legacy_pagetfinlay_maps_to_finlay() {
        let text = format!("{}\nscreen_type: PagetFinlay\n", HEADER);
        let data = load(text.as_bytes()).unwrap();
        assert_eq!(data.scr.screen_type, ScreenType::Finlay);
    }

    #[test]
    fn blur_radius_alias_is_accepted() {
        let canonical = format!("{}\nscren_blur_radius: 2.500000\n", HEADER);
        let corrected = format!("{}\nscreen_blur_radius: 2.500000\n", HEADER);
        assert_eq!(
            load(canonical.as_bytes()).unwrap().render.screen_blur_radius,
            2.5
        );
        assert_eq!(
            load(corrected.as_bytes()).unwrap().render.screen_blur_radius,
            2.5
        );
        // Saving always uses the historical spelling.
        assert!(to_string(&sample()).contains("scren_blur_radius:"));
    }

    #[test]
    fn stitch_records_round_trip() {
        let mut data = sample();
        data.stitch_tiles.push(StitchTileRecord {
            col: 1,
            row: 0,
            filename: "tile-1-0.tif".into(),
            angle: 0.0,
            ratio: 1.0,
            position: (60.0, 3.0),
            size: (2000, 2000),
            scr_size: (120, 90),
            scr_shift: (4, 2),
        });
        let text = to_string(&data);
        let loaded = load(text.as_bytes()).unwrap();
        assert_eq!(loaded.stitch_tiles.len(), 1);
        assert_eq!(loaded.stitch_tiles[0], data.stitch_tiles[0]);
        assert_eq!(to_string(&loaded), text);
    }

    #[test]
    fn booleans_must_be_yes_or_no() {
        let text = format!("{}\nprecise: maybe\n", HEADER);
        let err = load(text.as_bytes()).unwrap_err();
        assert!(matches!(&err, CoreError::ParseError(m) if m == "error parsing precise"));
    }
}
