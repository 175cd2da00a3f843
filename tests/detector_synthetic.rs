//! Screen detection on a synthetic plate with a known lattice.

use plate_math::{Point, Rgb};
use screenplate::detect::{detect_screen, ScrDetectParameters};
use screenplate::image::{Image, ImageMetadata};
use screenplate::screen::ScreenType;

const PERIOD: f64 = 16.0;
const SIZE: u32 = 512;

/// Perfect red/green/blue 5×5 dots on a Dufay lattice over black.
fn synthetic_plate(params: &ScrDetectParameters) -> Image {
    let mut data = vec![0u16; (SIZE * SIZE * 3) as usize];
    let paint = |data: &mut Vec<u16>, cx: f64, cy: f64, c: Rgb| {
        for dy in -2i64..=2 {
            for dx in -2i64..=2 {
                let x = cx as i64 + dx;
                let y = cy as i64 + dy;
                if x < 0 || y < 0 || x >= SIZE as i64 || y >= SIZE as i64 {
                    continue;
                }
                let o = ((y * SIZE as i64 + x) * 3) as usize;
                data[o] = (c.red * 65535.0) as u16;
                data[o + 1] = (c.green * 65535.0) as u16;
                data[o + 2] = (c.blue * 65535.0) as u16;
            }
        }
    };
    // Background at the black signature level.
    for o in 0..data.len() / 3 {
        data[o * 3] = (params.black.red * 65535.0) as u16;
        data[o * 3 + 1] = (params.black.green * 65535.0) as u16;
        data[o * 3 + 2] = (params.black.blue * 65535.0) as u16;
    }
    let n = (SIZE as f64 / PERIOD) as i64;
    for m in 0..n {
        for k in 0..n {
            let x = 8.0 + k as f64 * PERIOD;
            let y = 8.0 + m as f64 * PERIOD;
            paint(&mut data, x, y, params.green);
            paint(&mut data, x + PERIOD / 2.0, y, params.blue);
            paint(&mut data, x, y + PERIOD / 2.0, params.red);
        }
    }
    Image::load(SIZE, SIZE, 65535, None, Some(data), ImageMetadata::default()).unwrap()
}

#[test]
fn detects_the_lattice_to_sub_pixel_precision() {
    let dparams = ScrDetectParameters::default();
    let img = synthetic_plate(&dparams);
    let detected =
        detect_screen(&img, &dparams, None, ScreenType::Dufay, None).unwrap();

    // Ground truth basis is (16,0) / (0,16) image pixels.
    let c1 = detected.params.coordinate1;
    let c2 = detected.params.coordinate2;
    assert!(
        (c1.x - PERIOD).abs() < 1e-2 && c1.y.abs() < 1e-2,
        "coordinate1 = {c1:?}"
    );
    assert!(
        c2.x.abs() < 1e-2 && (c2.y - PERIOD).abs() < 1e-2,
        "coordinate2 = {c2:?}"
    );

    // The anchor must land on a green dot: its image position modulo the
    // period is the dot offset (8, 8).
    let center = detected.params.center;
    let fx = (center.x - 8.0) / PERIOD;
    let fy = (center.y - 8.0) / PERIOD;
    assert!((fx - fx.round()).abs() < 1e-2, "center {center:?}");
    assert!((fy - fy.round()).abs() < 1e-2, "center {center:?}");

    // Pixel size: screen periods per image pixel.
    assert!((detected.pixel_size - 1.0 / PERIOD).abs() < 1e-3);
}

#[test]
fn patch_bitmap_covers_the_synthetic_patches() {
    let dparams = ScrDetectParameters::default();
    let img = synthetic_plate(&dparams);
    let detected =
        detect_screen(&img, &dparams, None, ScreenType::Dufay, None).unwrap();

    let map = screenplate::ScrToImg::new(detected.params.clone()).unwrap();
    let n = (SIZE as f64 / PERIOD) as i64;
    let mut total = 0usize;
    let mut covered = 0usize;
    for m in 1..n - 1 {
        for k in 1..n - 1 {
            // Each interior period cell carries three dots; its cell in
            // the detected frame must be marked.
            let img_pos = Point::new(8.0 + k as f64 * PERIOD, 8.0 + m as f64 * PERIOD);
            let scr = map.to_scr(img_pos);
            let x = (scr.x + detected.range.xshift as f64).floor() as i64;
            let y = (scr.y + detected.range.yshift as f64).floor() as i64;
            total += 1;
            if x >= 0
                && y >= 0
                && detected.patch_bitmap.test(x as usize, y as usize)
            {
                covered += 1;
            }
        }
    }
    assert!(
        covered as f64 >= 0.99 * total as f64,
        "covered {covered} of {total} cells"
    );
}
