//! Rendering: parameters, the color pipeline, and the renderer family.
//!
//! All render variants share one [`Renderer`] struct (common fields plus a
//! variant tag with per-variant state) and answer the same
//! `sample_pixel_*` contract; see [`renderer`].
//!
//! The color pipeline inside every renderer runs, in order: white-balance
//! multiply, presaturation matrix, dye→XYZ via the color model, XYZ→sRGB,
//! optional luminance re-mapping through a characteristics curve, clamp to
//! [0,1], and the final output LUT. Brightness and saturation fold into the
//! single [`ColorMatrix`] the renderer holds.

pub mod downscale;
pub mod renderer;
pub mod tile;

use plate_math::color::{rgb_to_xyz, temperature_whitepoint};
use plate_math::{ColorMatrix, Rgb, Xyz};

/// How dye primaries are balanced against the backlight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DyeBalance {
    None,
    #[default]
    Neutral,
    Whitepoint,
}

impl DyeBalance {
    pub fn name(self) -> &'static str {
        match self {
            DyeBalance::None => "none",
            DyeBalance::Neutral => "neutral",
            DyeBalance::Whitepoint => "whitepoint",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "none" => Some(DyeBalance::None),
            "neutral" => Some(DyeBalance::Neutral),
            "whitepoint" => Some(DyeBalance::Whitepoint),
            _ => None,
        }
    }
}

/// Historical dye sets. Each model carries the xy chromaticities of its
/// three filter dyes; the exact spectra vary between production runs, so
/// these are representative reconstructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ColorModel {
    #[default]
    None,
    Red,
    Green,
    Blue,
    MaxSeparation,
    Paget,
    MietheGoerzReconstructedWager,
    MietheGoerzOriginalWager,
    Duffay1,
    Duffay2,
    Duffay3,
    Duffay4,
    Duffay5,
    Autochrome,
    Autochrome2,
}

impl ColorModel {
    pub const ALL: [ColorModel; 15] = [
        ColorModel::None,
        ColorModel::Red,
        ColorModel::Green,
        ColorModel::Blue,
        ColorModel::MaxSeparation,
        ColorModel::Paget,
        ColorModel::MietheGoerzReconstructedWager,
        ColorModel::MietheGoerzOriginalWager,
        ColorModel::Duffay1,
        ColorModel::Duffay2,
        ColorModel::Duffay3,
        ColorModel::Duffay4,
        ColorModel::Duffay5,
        ColorModel::Autochrome,
        ColorModel::Autochrome2,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ColorModel::None => "none",
            ColorModel::Red => "red",
            ColorModel::Green => "green",
            ColorModel::Blue => "blue",
            ColorModel::MaxSeparation => "max_separation",
            ColorModel::Paget => "paget",
            ColorModel::MietheGoerzReconstructedWager => "miethe_goerz_reconstructed_wager",
            ColorModel::MietheGoerzOriginalWager => "miethe_goerz_original_wager",
            ColorModel::Duffay1 => "duffay1",
            ColorModel::Duffay2 => "duffay2",
            ColorModel::Duffay3 => "duffay3",
            ColorModel::Duffay4 => "duffay4",
            ColorModel::Duffay5 => "duffay5",
            ColorModel::Autochrome => "autochrome",
            ColorModel::Autochrome2 => "autochrome2",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == s)
    }

    /// xy chromaticities of the dye primaries, red/green/blue order.
    fn primaries(self) -> Option<[(f64, f64); 3]> {
        match self {
            ColorModel::None
            | ColorModel::Red
            | ColorModel::Green
            | ColorModel::Blue
            | ColorModel::MaxSeparation => None,
            ColorModel::Paget => Some([(0.674, 0.325), (0.243, 0.628), (0.145, 0.065)]),
            ColorModel::MietheGoerzReconstructedWager => {
                Some([(0.655, 0.344), (0.255, 0.600), (0.152, 0.078)])
            }
            ColorModel::MietheGoerzOriginalWager => {
                Some([(0.639, 0.360), (0.270, 0.580), (0.160, 0.090)])
            }
            ColorModel::Duffay1 => Some([(0.668, 0.331), (0.232, 0.645), (0.141, 0.060)]),
            ColorModel::Duffay2 => Some([(0.662, 0.337), (0.240, 0.632), (0.146, 0.066)]),
            ColorModel::Duffay3 => Some([(0.656, 0.343), (0.249, 0.619), (0.151, 0.073)]),
            ColorModel::Duffay4 => Some([(0.650, 0.348), (0.258, 0.606), (0.156, 0.080)]),
            ColorModel::Duffay5 => Some([(0.644, 0.354), (0.267, 0.593), (0.161, 0.087)]),
            ColorModel::Autochrome => Some([(0.620, 0.350), (0.280, 0.550), (0.170, 0.110)]),
            ColorModel::Autochrome2 => Some([(0.605, 0.360), (0.295, 0.530), (0.180, 0.125)]),
        }
    }

    /// dyes→linear-sRGB matrix for this model under the given backlight,
    /// with aging mixed in (aged dyes drift toward neutral density).
    pub fn matrix(self, balance: DyeBalance, backlight_kelvin: f64, age: f64) -> ColorMatrix {
        let base = match self {
            ColorModel::None => ColorMatrix::identity(),
            ColorModel::Red => channel_only(0),
            ColorModel::Green => channel_only(1),
            ColorModel::Blue => channel_only(2),
            ColorModel::MaxSeparation => {
                // Push each dye to its saturated extreme; the complement
                // channels go slightly negative and clamp later.
                ColorMatrix::new(
                    1.4, -0.2, -0.2, 0.0,
                    -0.2, 1.4, -0.2, 0.0,
                    -0.2, -0.2, 1.4, 0.0,
                )
            }
            _ => {
                let primaries = self.primaries().expect("model carries primaries");
                let white = match balance {
                    DyeBalance::None => Xyz { x: 1.0, y: 1.0, z: 1.0 },
                    DyeBalance::Neutral => rgb_to_xyz(Rgb::splat(1.0)),
                    DyeBalance::Whitepoint => temperature_whitepoint(backlight_kelvin),
                };
                primaries_to_srgb(primaries, white)
            }
        };
        if age <= 0.0 {
            return base;
        }
        // Aged dyes lose separation; blend toward the identity weighted by
        // the age parameter.
        let id = ColorMatrix::identity();
        let mut m = base;
        for i in 0..4 {
            for j in 0..4 {
                m.m[i][j] = base.m[i][j] * (1.0 - age) + id.m[i][j] * age;
            }
        }
        m
    }
}

fn channel_only(c: usize) -> ColorMatrix {
    let mut m = ColorMatrix { m: [[0.0; 4]; 4] };
    m.m[3][3] = 1.0;
    for row in 0..3 {
        m.m[row][c] = 1.0;
    }
    m
}

/// Solve the dye amounts so `(1,1,1)` reproduces the white point, then
/// compose with XYZ→sRGB. Standard primaries-to-matrix construction.
fn primaries_to_srgb(primaries: [(f64, f64); 3], white: Xyz) -> ColorMatrix {
    // XYZ of each primary with Y unknown; columns scaled so the sum hits
    // the white point.
    let cols: Vec<[f64; 3]> = primaries
        .iter()
        .map(|&(x, y)| [x / y, 1.0, (1.0 - x - y) / y])
        .collect();
    // Solve cols * s = white for s.
    let a = ColorMatrix::new(
        cols[0][0], cols[1][0], cols[2][0], 0.0,
        cols[0][1], cols[1][1], cols[2][1], 0.0,
        cols[0][2], cols[1][2], cols[2][2], 0.0,
    );
    let s = match a.invert() {
        Some(inv) => inv.apply(Rgb::new(white.x, white.y, white.z)),
        None => Rgb::splat(1.0),
    };
    let dyes_to_xyz = ColorMatrix::new(
        cols[0][0] * s.red as f64, cols[1][0] * s.green as f64, cols[2][0] * s.blue as f64, 0.0,
        cols[0][1] * s.red as f64, cols[1][1] * s.green as f64, cols[2][1] * s.blue as f64, 0.0,
        cols[0][2] * s.red as f64, cols[1][2] * s.green as f64, cols[2][2] * s.blue as f64, 0.0,
    );
    // Fold in XYZ→sRGB.
    let xyz_to_srgb = ColorMatrix::new(
        3.240_454_2, -1.537_138_5, -0.498_531_4, 0.0,
        -0.969_266_0, 1.876_010_8, 0.041_556_0, 0.0,
        0.055_643_4, -0.204_025_9, 1.057_225_2, 0.0,
    );
    xyz_to_srgb.compose(&dyes_to_xyz)
}

/// Tone curves: film characteristics and output shaping.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Curve {
    #[default]
    Linear,
    /// Fixed fallback curve installed when `gray_min > gray_max`.
    Safe,
    /// Monotone control points, piecewise-linear between them.
    Points(Vec<(f32, f32)>),
}

impl Curve {
    pub fn apply(&self, v: f32) -> f32 {
        match self {
            Curve::Linear => v,
            Curve::Safe => {
                // Gentle shoulder/toe so broken gray ranges still produce a
                // viewable image.
                let v = v.clamp(0.0, 1.0);
                v * v * (3.0 - 2.0 * v)
            }
            Curve::Points(pts) => {
                if pts.is_empty() {
                    return v;
                }
                if v <= pts[0].0 {
                    return pts[0].1;
                }
                for w in pts.windows(2) {
                    if v <= w[1].0 {
                        let t = (v - w[0].0) / (w[1].0 - w[0].0).max(1e-9);
                        return w[0].1 + t * (w[1].1 - w[0].1);
                    }
                }
                pts[pts.len() - 1].1
            }
        }
    }
}

/// User-tunable rendering knobs; defaults match the established behavior of
/// the project files in circulation.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderParameters {
    /// Gamma of the scan (1.0 for linear, 2.2 for sGray).
    pub gamma: f64,
    /// Saturation boost applied to collected data before the color model;
    /// compensates for loss of sharpness.
    pub presaturation: f64,
    pub saturation: f64,
    pub brightness: f64,
    /// Screen multiplier threshold for precise collection.
    pub collection_threshold: f32,
    pub white_balance: Rgb,
    /// Weights turning an RGB scan into grayscale.
    pub mix_red: f64,
    pub mix_green: f64,
    pub mix_blue: f64,
    pub mix_gamma: f64,
    pub backlight_temperature: f64,
    /// Dye aging simulation, 0 = new, 1 = fully aged.
    pub age: f64,
    pub dye_balance: DyeBalance,
    /// Radius (in image pixels) the screen is blurred with for realistic
    /// superposition.
    pub screen_blur_radius: f64,
    pub color_model: ColorModel,
    /// Gray range boosted to full contrast, 0..255 UI scale.
    pub gray_min: i32,
    pub gray_max: i32,
    pub film_characteristics_curve: Curve,
    pub output_curve: Option<Curve>,
    pub restore_original_luminosity: bool,
    /// Use precise data collection in the interpolated renderers.
    pub precise: bool,
    /// Predictive rendering: multiply the reconstruction back through the
    /// screen.
    pub screen_compensation: bool,
    /// Combined rendering: re-match luminance to the scan.
    pub adjust_luminosity: bool,
}

impl Default for RenderParameters {
    fn default() -> Self {
        Self {
            gamma: 2.2,
            presaturation: 1.0,
            saturation: 1.5,
            brightness: 1.0,
            collection_threshold: 0.8,
            white_balance: Rgb::splat(1.0),
            mix_red: 0.3,
            mix_green: 0.1,
            mix_blue: 1.0,
            mix_gamma: 1.0,
            backlight_temperature: 6500.0,
            age: 0.0,
            dye_balance: DyeBalance::Neutral,
            screen_blur_radius: 1.3,
            color_model: ColorModel::None,
            gray_min: 0,
            gray_max: 255,
            film_characteristics_curve: Curve::Linear,
            output_curve: None,
            restore_original_luminosity: true,
            precise: true,
            screen_compensation: false,
            adjust_luminosity: false,
        }
    }
}

impl RenderParameters {
    pub const TEMPERATURE_MIN: f64 = 2500.0;
    pub const TEMPERATURE_MAX: f64 = 25000.0;

    /// Effective output curve: the configured one, or the safe fallback
    /// whenever the gray range is inverted.
    pub fn effective_output_curve(&self) -> Option<Curve> {
        if self.gray_min > self.gray_max {
            return Some(Curve::Safe);
        }
        self.output_curve.clone()
    }

    /// Gray range actually used for the output LUT; an inverted range falls
    /// back to full scale (the safe curve handles the shaping).
    pub fn effective_gray_range(&self) -> (i32, i32) {
        if self.gray_min > self.gray_max {
            (0, 255)
        } else {
            (self.gray_min, self.gray_max)
        }
    }

    /// The folded color matrix: presaturation, color model, saturation and
    /// brightness in pipeline order.
    pub fn color_matrix(&self) -> ColorMatrix {
        let presat = ColorMatrix::saturation(self.presaturation);
        let model = self
            .color_model
            .matrix(self.dye_balance, self.backlight_temperature, self.age);
        let sat = ColorMatrix::saturation(self.saturation);
        let bright =
            ColorMatrix::scaling(self.brightness, self.brightness, self.brightness);
        sat.compose(&bright).compose(&model).compose(&presat)
    }

    /// Grayscale mix of an RGB scan sample.
    pub fn mix_luminosity(&self, rgb: Rgb) -> f32 {
        let total = (self.mix_red + self.mix_green + self.mix_blue).max(1e-9);
        let v = (rgb.red as f64 * self.mix_red
            + rgb.green as f64 * self.mix_green
            + rgb.blue as f64 * self.mix_blue)
            / total;
        if self.mix_gamma != 1.0 {
            v.max(0.0).powf(self.mix_gamma) as f32
        } else {
            v as f32
        }
    }
}

/// Apply the per-pixel part of the color pipeline shared by every render
/// variant: white balance, folded matrix, luminance remap, clamp. The
/// output curve is resolved once per renderer (see
/// [`RenderParameters::effective_output_curve`]) and passed in so the hot
/// path never clones it.
#[inline]
pub fn finish_color(
    params: &RenderParameters,
    matrix: &ColorMatrix,
    output_curve: Option<&Curve>,
    c: Rgb,
) -> Rgb {
    let c = c * params.white_balance;
    let mut c = matrix.apply(c);
    if let Some(curve) = output_curve {
        let lum = c.luminosity();
        if lum > 1e-6 {
            let remapped = curve.apply(lum.clamp(0.0, 1.0));
            if remapped != lum {
                c = c * (remapped / lum);
            }
        }
    }
    if params.restore_original_luminosity
        && params.film_characteristics_curve != Curve::Linear
    {
        let lum = c.luminosity();
        if lum > 1e-6 {
            let restored = params.film_characteristics_curve.apply(lum.clamp(0.0, 1.0));
            c = c * (restored / lum);
        }
    }
    c.clamp01()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_model_passes_colors_through() {
        let m = ColorModel::None.matrix(DyeBalance::Neutral, 6500.0, 0.0);
        let c = m.apply(Rgb::new(0.2, 0.5, 0.8));
        assert!((c.red - 0.2).abs() < 1e-6);
        assert!((c.blue - 0.8).abs() < 1e-6);
    }

    #[test]
    fn dye_models_map_white_to_neutral() {
        for model in [ColorModel::Paget, ColorModel::Duffay3, ColorModel::Autochrome] {
            let m = model.matrix(DyeBalance::Neutral, 6500.0, 0.0);
            let w = m.apply(Rgb::splat(1.0));
            // Equal dye amounts must come out near-neutral.
            assert!((w.red - w.green).abs() < 0.02, "{:?}: {:?}", model, w);
            assert!((w.green - w.blue).abs() < 0.02, "{:?}: {:?}", model, w);
        }
    }

    #[test]
    fn inverted_gray_range_installs_safe_curve() {
        let params = RenderParameters {
            gray_min: 200,
            gray_max: 10,
            ..Default::default()
        };
        assert_eq!(params.effective_output_curve(), Some(Curve::Safe));
        assert_eq!(params.effective_gray_range(), (0, 255));
    }

    #[test]
    fn full_age_collapses_to_identity() {
        let m = ColorModel::Paget.matrix(DyeBalance::Neutral, 6500.0, 1.0);
        for i in 0..3 {
            for j in 0..3 {
                let want = if i == j { 1.0 } else { 0.0 };
                assert!((m.m[i][j] - want).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn curve_points_interpolate_monotonically() {
        let c = Curve::Points(vec![(0.0, 0.0), (0.5, 0.8), (1.0, 1.0)]);
        assert_eq!(c.apply(0.0), 0.0);
        assert!((c.apply(0.25) - 0.4).abs() < 1e-6);
        assert_eq!(c.apply(1.0), 1.0);
    }

    #[test]
    fn all_color_model_names_round_trip() {
        for m in ColorModel::ALL {
            assert_eq!(ColorModel::from_name(m.name()), Some(m));
        }
    }
}
