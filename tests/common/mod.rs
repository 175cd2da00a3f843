//! Shared builders for synthetic plate scans.
//!
//! The synthetic scans are constructed exactly the way the pipeline models
//! a real plate: a smooth "truth" dye image is viewed through the analytic
//! screen tile, and the scan records the transmitted luminosity. Because
//! the same screen tile is used by the renderers, reconstruction errors in
//! the tests come from the algorithms, not from model mismatch.

use plate_math::{Point, Rgb, Vector};

use screenplate::geometry::{ScrToImg, ScrToImgParameters};
use screenplate::image::{Image, ImageMetadata, Linearization};
use screenplate::screen::{Screen, ScreenType, StripWidths};

/// Smooth truth color at a common screen coordinate.
pub fn truth_color(scr: Point) -> Rgb {
    Rgb::new(
        0.5 + 0.3 * (scr.x / 7.0).sin() as f32,
        0.5 + 0.3 * (scr.y / 9.0).cos() as f32,
        0.5 + 0.2 * ((scr.x + scr.y) / 11.0).sin() as f32,
    )
}

pub fn dufay_params(center: Point, period: f64) -> ScrToImgParameters {
    ScrToImgParameters {
        screen_type: ScreenType::Dufay,
        center,
        coordinate1: Vector::new(period, 0.0),
        coordinate2: Vector::new(0.0, period),
        ..Default::default()
    }
}

/// A grayscale scan of the truth image seen through a Dufay screen.
/// `offset_periods` shifts this scan inside the common screen frame
/// (integer offsets keep the screen phase identical between tiles).
pub fn synthetic_dufay_scan(
    width: u32,
    height: u32,
    params: &ScrToImgParameters,
    offset_periods: (f64, f64),
) -> Image {
    let map = ScrToImg::new(params.clone()).unwrap();
    let screen = Screen::analytic(ScreenType::Dufay, StripWidths::default()).unwrap();
    let mut data = vec![0u16; (width * height) as usize];
    for y in 0..height {
        for x in 0..width {
            let scr = map.to_scr(Point::new(x as f64 + 0.5, y as f64 + 0.5));
            let common = Point::new(scr.x + offset_periods.0, scr.y + offset_periods.1);
            let (mult, _) = screen.at(scr.x, scr.y);
            let t = truth_color(common);
            let lum = (t.red * mult.red + t.green * mult.green + t.blue * mult.blue)
                .clamp(0.0, 1.0);
            data[(y * width + x) as usize] = (lum * 65535.0 + 0.5) as u16;
        }
    }
    let mut img = Image::load(width, height, 65535, Some(data), None, ImageMetadata::default())
        .unwrap();
    img.linearize(Linearization::Gamma(1.0)).unwrap();
    img
}
