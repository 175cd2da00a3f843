//! End-to-end rendering checks on synthetic Dufay scans.

mod common;

use common::{dufay_params, synthetic_dufay_scan};
use plate_math::Point;
use screenplate::render::renderer::{RenderVariant, Renderer};
use screenplate::render::{ColorModel, RenderParameters};
use screenplate::render::tile::render_tile;
use screenplate::{Caches, ScrToImg};

fn neutral_params() -> RenderParameters {
    RenderParameters {
        saturation: 1.0,
        presaturation: 1.0,
        brightness: 1.0,
        color_model: ColorModel::None,
        ..Default::default()
    }
}

#[test]
fn fast_render_tile_upscales_by_step() {
    let params = dufay_params(Point::new(8.0, 8.0), 8.0);
    let img = synthetic_dufay_scan(256, 256, &params, (0.0, 0.0));
    let caches = Caches::new();
    // step 0.25: each input pixel becomes a 4x4 output block.
    let (w, h) = (256, 128);
    let mut out = vec![0u8; w * h * 3];
    render_tile(
        RenderVariant::Fast,
        &caches,
        &img,
        &params,
        None,
        &neutral_params(),
        &mut out,
        w * 3,
        w,
        h,
        32.0,
        32.0,
        0.25,
        None,
    )
    .unwrap();
    // The truth image is mid-toned everywhere, so a fast render has no
    // zero pixels away from borders.
    let zeros = out.iter().filter(|&&v| v == 0).count();
    assert_eq!(zeros, 0, "{zeros} zero bytes in fast render");
}

#[test]
fn predictive_diff_of_well_registered_scan_has_zero_mean() {
    let params = dufay_params(Point::new(8.0, 8.0), 8.0);
    let img = synthetic_dufay_scan(512, 512, &params, (0.0, 0.0));
    let caches = Caches::new();
    let map = ScrToImg::new(params.clone()).unwrap();

    let mut predictive = Renderer::new(
        &caches,
        &img,
        map.clone(),
        neutral_params(),
        RenderVariant::Predictive,
        65535,
    )
    .unwrap();
    predictive.precompute_all(None).unwrap();
    let mut original = Renderer::new(
        &caches,
        &img,
        map,
        neutral_params(),
        RenderVariant::Original,
        65535,
    )
    .unwrap();
    original.precompute_all(None).unwrap();

    // Central 50% of the image, sampled on a grid.
    let mut mean = [0.0f64; 3];
    let mut n = 0usize;
    for y in (128..384).step_by(2) {
        for x in (128..384).step_by(2) {
            let p = predictive.sample_pixel_img(x as f64, y as f64);
            let o = original.sample_pixel_img(x as f64, y as f64);
            mean[0] += (p.red - o.red) as f64;
            mean[1] += (p.green - o.green) as f64;
            mean[2] += (p.blue - o.blue) as f64;
            n += 1;
        }
    }
    for (ci, m) in mean.iter().enumerate() {
        let avg = (m / n as f64).abs();
        assert!(avg < 1.0 / 255.0, "channel {ci} mean diff {avg}");
    }
}

#[test]
fn interpolated_render_recovers_the_truth_image() {
    let params = dufay_params(Point::new(8.0, 8.0), 8.0);
    let img = synthetic_dufay_scan(512, 512, &params, (0.0, 0.0));
    let caches = Caches::new();
    let map = ScrToImg::new(params.clone()).unwrap();
    let mut renderer = Renderer::new(
        &caches,
        &img,
        map.clone(),
        neutral_params(),
        RenderVariant::Interpolated { original_color: false },
        65535,
    )
    .unwrap();
    renderer.precompute_all(None).unwrap();

    // Compare the reconstruction with the truth at interior positions.
    let mut worst = 0.0f32;
    for y in (128..384).step_by(16) {
        for x in (128..384).step_by(16) {
            let scr = map.to_scr(Point::new(x as f64, y as f64));
            let got = renderer.sample_pixel_scr(scr);
            let want = common::truth_color(scr);
            worst = worst
                .max((got.red - want.red).abs())
                .max((got.green - want.green).abs())
                .max((got.blue - want.blue).abs());
        }
    }
    assert!(worst < 0.08, "worst reconstruction error {worst}");
}
