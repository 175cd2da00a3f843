//! Transform round-trip properties over whole image domains.

use std::sync::Arc;

use plate_math::{Point, Vector};
use screenplate::geometry::{mesh::Mesh, ScrToImg, ScrToImgParameters};
use screenplate::screen::ScreenType;

fn params(k1: f64) -> ScrToImgParameters {
    ScrToImgParameters {
        screen_type: ScreenType::Dufay,
        center: Point::new(1000.0, 950.0),
        coordinate1: Vector::new(19.0, 0.4),
        coordinate2: Vector::new(-0.3, 24.5),
        tilt_x: Vector::new(1.0, 0.0005),
        tilt_y: Vector::new(-0.0005, 1.0),
        k1,
        ..Default::default()
    }
}

#[test]
fn affine_round_trip_under_1e4_pixels_everywhere() {
    let map = ScrToImg::new(params(0.0)).unwrap();
    for y in (0..2000).step_by(97) {
        for x in (0..2000).step_by(89) {
            let p = Point::new(x as f64, y as f64);
            let err = map.to_img(map.to_scr(p)).dist(p);
            assert!(err < 1e-4, "{err} at {p:?}");
        }
    }
}

#[test]
fn radial_round_trip_converges_across_the_frame() {
    let map = ScrToImg::new(params(0.03)).unwrap();
    for y in (0..2000).step_by(131) {
        for x in (0..2000).step_by(127) {
            let p = Point::new(x as f64, y as f64);
            let err = map.to_img(map.to_scr(p)).dist(p);
            assert!(err < 1e-4, "{err} at {p:?}");
        }
    }
}

#[test]
fn mesh_round_trip_with_smooth_warp() {
    let mut mesh = Mesh::new(2000, 2000, 250.0, 250.0);
    for row in 0..mesh.rows() {
        for col in 0..mesh.cols() {
            let x = col as f64 * 250.0;
            let y = row as f64 * 250.0;
            mesh.set(
                col,
                row,
                Vector::new((x / 700.0).sin() * 1.2, (y / 900.0).cos() * 0.8),
            );
        }
    }
    let map = ScrToImg::with_mesh(params(0.01), Some(Arc::new(mesh))).unwrap();
    for y in (100..1900).step_by(251) {
        for x in (100..1900).step_by(241) {
            let p = Point::new(x as f64, y as f64);
            let err = map.to_img(map.to_scr(p)).dist(p);
            assert!(err < 1e-3, "{err} at {p:?}");
        }
    }
}

#[test]
fn random_points_round_trip_with_all_freedoms() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let map = ScrToImg::new(params(0.015)).unwrap();
    for _ in 0..500 {
        let p = Point::new(rng.gen_range(0.0..2000.0), rng.gen_range(0.0..2000.0));
        let err = map.to_img(map.to_scr(p)).dist(p);
        assert!(err < 1e-4, "{err} at {p:?}");
    }
}

#[test]
fn pixel_size_is_positive_and_continuous() {
    let map = ScrToImg::new(params(0.02)).unwrap();
    let mut last = None;
    for x in (0..2000).step_by(50) {
        let ps = map.pixel_size(Point::new(x as f64, 1000.0));
        assert!(ps > 0.0);
        if let Some(prev) = last {
            let rel: f64 = (ps - prev) / prev;
            assert!(rel.abs() < 0.05, "jump at x={x}: {prev} -> {ps}");
        }
        last = Some(ps);
    }
}
