//! Project-file round trips across the parameter surface.

use plate_math::{Point, Rgb, Vector};
use screenplate::csp::{self, CspData};
use screenplate::detect::ScrDetectParameters;
use screenplate::geometry::ScrToImgParameters;
use screenplate::render::{ColorModel, DyeBalance};
use screenplate::screen::ScreenType;
use screenplate::solver::{ControlPoint, PointColor};
use screenplate::CoreError;

fn base_data() -> CspData {
    CspData {
        scr: ScrToImgParameters {
            screen_type: ScreenType::Finlay,
            center: Point::new(123.456789, -0.5),
            coordinate1: Vector::new(18.75, 0.25),
            coordinate2: Vector::new(-0.25, 24.125),
            tilt_x: Vector::new(1.0, 0.001),
            tilt_y: Vector::new(-0.001, 1.0),
            k1: 0.015,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn save_load_save_is_byte_identical_across_enums() {
    for ty in [
        ScreenType::Paget,
        ScreenType::Thames,
        ScreenType::Finlay,
        ScreenType::Dufay,
        ScreenType::WarnerPowrie,
        ScreenType::Autochrome,
        ScreenType::Random,
    ] {
        for model in ColorModel::ALL {
            for balance in [DyeBalance::None, DyeBalance::Neutral, DyeBalance::Whitepoint] {
                let mut data = base_data();
                data.scr.screen_type = ty;
                data.render.color_model = model;
                data.render.dye_balance = balance;
                data.render.precise = model as usize % 2 == 0;
                let first = csp::to_string(&data);
                let loaded = csp::load(first.as_bytes()).unwrap();
                let second = csp::to_string(&loaded);
                assert_eq!(first, second, "{ty:?} {model:?} {balance:?}");
            }
        }
    }
}

#[test]
fn detector_and_solver_blocks_round_trip() {
    let mut data = base_data();
    data.detect = Some(ScrDetectParameters {
        black: Rgb::new(0.01, 0.02, 0.03),
        red: Rgb::new(0.9, 0.1, 0.05),
        gamma: 1.8,
        border: 12,
        ..Default::default()
    });
    data.solver_points.push(ControlPoint {
        img: Point::new(100.5, 200.25),
        scr: Point::new(5.0, 7.0),
        color: PointColor::Blue,
        locked: true,
        weight: 1.0,
    });
    let first = csp::to_string(&data);
    let loaded = csp::load(first.as_bytes()).unwrap();
    assert_eq!(csp::to_string(&loaded), first);
    let d = loaded.detect.unwrap();
    assert_eq!(d.border, 12);
    assert!(loaded.solver_points[0].locked);
    assert_eq!(loaded.solver_points[0].color, PointColor::Blue);
}

#[test]
fn malformed_vector_line_installs_no_state() {
    let text = format!(
        "{}\nscreen_type: Dufay\ncoordinate_x: 1.0 2.0 3.0\n",
        csp::HEADER
    );
    let err = csp::load(text.as_bytes()).unwrap_err();
    assert!(
        matches!(&err, CoreError::ParseError(m) if m == "error parsing coordinate_x"),
        "{err}"
    );
}

#[test]
fn truncated_scalar_is_rejected() {
    let text = format!("{}\nk1:\n", csp::HEADER);
    let err = csp::load(text.as_bytes()).unwrap_err();
    assert!(matches!(&err, CoreError::ParseError(m) if m == "error parsing k1"));
}

#[test]
fn files_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plate.csp");
    let data = base_data();
    csp::save_file(&path, &data).unwrap();
    let loaded = csp::load_file(&path).unwrap();
    assert_eq!(csp::to_string(&loaded), csp::to_string(&data));
}
