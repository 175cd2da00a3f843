//! Two-tile stitching of synthetic scans of one plate.

mod common;

use std::path::PathBuf;

use common::{dufay_params, synthetic_dufay_scan};
use plate_math::Point;
use screenplate::detect::ScrDetectParameters;
use screenplate::render::{ColorModel, RenderParameters};
use screenplate::stitch::matching::MatchingParams;
use screenplate::stitch::{ImageLoader, StitchProject, StitchingParams};
use screenplate::{Caches, CoreError, Image};

const PERIOD: f64 = 8.0;
/// Tile B sits 60 periods right and 3 periods down of tile A.
const SHIFT: (f64, f64) = (60.0, 3.0);
const TILE_W: u32 = 800;
const TILE_H: u32 = 420;

fn tile_image(offset: (f64, f64)) -> Image {
    let params = dufay_params(Point::new(8.0, 8.0), PERIOD);
    synthetic_dufay_scan(TILE_W, TILE_H, &params, offset)
}

fn loader() -> ImageLoader {
    // The loader fabricates the two synthetic scans by name.
    Box::new(move |path| {
        match path.file_name().and_then(|n| n.to_str()) {
            Some("a.tif") => Ok(tile_image((0.0, 0.0))),
            Some("b.tif") => Ok(tile_image(SHIFT)),
            other => Err(CoreError::load(
                format!("{other:?}"),
                "unknown synthetic tile",
            )),
        }
    })
}

fn neutral_render_params() -> RenderParameters {
    RenderParameters {
        saturation: 1.0,
        presaturation: 1.0,
        color_model: ColorModel::None,
        gamma: 1.0,
        ..Default::default()
    }
}

fn project(caches: &Caches) -> StitchProject<'_> {
    let params = StitchingParams {
        filenames: vec![vec![PathBuf::from("a.tif"), PathBuf::from("b.tif")]],
        matching: MatchingParams {
            use_cpfind: false,
            overlap_percentage: 30,
            min_overlap_percentage: 10,
            max_overlap_percentage: 65,
            ..Default::default()
        },
        outer_tile_border: 8,
        inner_tile_border: 2,
        ..Default::default()
    };
    let mut prj = StitchProject::new(
        params,
        neutral_render_params(),
        ScrDetectParameters::default(),
        caches,
        loader(),
    )
    .unwrap();
    // Both scans share one geometry; detection is exercised elsewhere.
    prj.set_tile_params(0, 0, dufay_params(Point::new(8.0, 8.0), PERIOD));
    prj.set_tile_params(1, 0, dufay_params(Point::new(8.0, 8.0), PERIOD));
    prj
}

#[test]
fn determine_positions_recovers_the_exact_shift() {
    let caches = Caches::new();
    let mut prj = project(&caches);
    prj.determine_positions(None).unwrap();
    let positions = prj.positions();
    assert_eq!(positions[0][0], (0, 0));
    assert_eq!(positions[0][1], (SHIFT.0 as i32, SHIFT.1 as i32));
}

#[test]
fn overlap_renders_identically_from_either_tile() {
    let caches = Caches::new();
    let mut prj = project(&caches);
    prj.determine_positions(None).unwrap();

    // Both tiles reconstruct the same underlying plate, so their analyzed
    // cells must agree across the overlap.
    let a = &prj.images[0][0];
    let b = &prj.images[0][1];
    let analyzer_a = a.analyzer.as_ref().unwrap();
    let analyzer_b = b.analyzer.as_ref().unwrap();
    let (dx, dy) = (b.xpos, b.ypos);
    let mut worst = 0.0f32;
    for y in 10..40 {
        for x in (dx + 5)..(a.range.width - 5) {
            if !a.cell_known(x, y) || !b.cell_known(x, y) {
                continue;
            }
            let va = analyzer_a.cell_rgb(x, y);
            let vb = analyzer_b.cell_rgb(x - dx, y - dy);
            worst = worst
                .max((va.red - vb.red).abs())
                .max((va.green - vb.green).abs())
                .max((va.blue - vb.blue).abs());
        }
    }
    // One 16-bit LSB of slack plus interpolation noise at cell edges.
    assert!(worst < 2.0 / 255.0, "worst overlap disagreement {worst}");
}

#[test]
fn stitched_output_is_written_with_alpha() {
    let caches = Caches::new();
    let mut prj = project(&caches);
    prj.determine_positions(None).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("stitched.tif");
    prj.write_stitched(&out, None).unwrap();
    let (_, _, vw, vh) = prj.viewport();
    let decoded = image::open(&out).unwrap().to_rgba16();
    // One output pixel per scan pixel: 8 per screen period.
    assert_eq!(decoded.width(), (vw * 8) as u32);
    assert_eq!(decoded.height(), (vh * 8) as u32);
    // A pixel well inside the region only tile B covers.
    let px = decoded.get_pixel(decoded.width() - 80, decoded.height() / 2);
    assert_eq!(px.0[3], 65535, "covered pixel must be opaque");
    // Corners outside every tile's known area stay transparent.
    let corner = decoded.get_pixel(decoded.width() - 1, decoded.height() - 1);
    assert_eq!(corner.0[3], 0, "uncovered pixel must be transparent");
}

#[test]
fn project_file_round_trips_tile_records() {
    let caches = Caches::new();
    let mut prj = project(&caches);
    prj.determine_positions(None).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("project.csp");
    prj.save_project(&path).unwrap();
    let data = screenplate::csp::load_file(&path).unwrap();
    assert_eq!(data.stitch_tiles.len(), 2);
    let b = data
        .stitch_tiles
        .iter()
        .find(|t| t.col == 1 && t.row == 0)
        .unwrap();
    assert_eq!(b.position, (SHIFT.0, SHIFT.1));
}
